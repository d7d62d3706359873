mod handoff;
mod source;


pub use source::{FrameSource, PlaneSet, ReplaySource};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use common::slot::Slot;

use crate::common::{Error, PlaneFormat, Result};
use crate::filters::FilterChain;
use crate::frame::{Frame, FramePool};
use crate::gpu::Gpu;
use crate::image::{Image, ImageDesc};
use crate::pipeline::handoff::FrameGate;
use crate::processing_context::{ImageBuffer, ProcessingContext};
use crate::skin::SkinClassifier;

pub const MIN_WORKER_THREADS: usize = 1;
pub const MAX_WORKER_THREADS: usize = 4;

/// Pipeline-wide configuration, clamped at open time.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub width: u32,
    pub height: u32,
    /// Number of processing threads, clamped to
    /// `[MIN_WORKER_THREADS, MAX_WORKER_THREADS]`.
    pub worker_threads: usize,
    /// How long a worker waits for the next frame before polling again.
    pub frame_timeout: Duration,
    /// Capacity of the published-frame pool.
    pub pool_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            worker_threads: 2,
            frame_timeout: Duration::from_millis(500),
            pool_capacity: 8,
        }
    }
}

/// Invoked once per completed pipeline iteration with the published frame.
pub type FrameListener = Box<dyn Fn(Frame) + Send + Sync>;
/// Invoked with human-readable failure text when the pipeline closes on
/// an error.
pub type ErrorListener = Box<dyn Fn(&str) + Send + Sync>;

/// The running capture-process-publish pipeline.
///
/// One producer thread pulls frames from the source; a small bounded pool
/// of worker threads runs the filter chain and the classifier, each with
/// its private per-thread GPU state over the shared configuration objects.
/// Teardown is cooperative: in-flight iterations complete, nothing is
/// preempted.
pub struct Pipeline {
    running: Arc<AtomicBool>,
    gate: Arc<FrameGate>,
    producer: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    latest: Arc<Slot<Frame>>,
    pool: FramePool,
}

impl Pipeline {
    /// Starts the source and spawns the producer and worker threads.
    ///
    /// On a pipeline-level failure the error listener fires and the
    /// pipeline closes itself; there is no automatic restart.
    pub fn open(
        config: PipelineConfig,
        gpu: Gpu,
        mut source: Box<dyn FrameSource>,
        chain: Arc<FilterChain>,
        classifier: Arc<SkinClassifier>,
        on_frame: FrameListener,
        on_error: ErrorListener,
    ) -> Result<Pipeline> {
        let worker_count = config
            .worker_threads
            .clamp(MIN_WORKER_THREADS, MAX_WORKER_THREADS);

        let pool = FramePool::new(config.pool_capacity, config.width, config.height)?;
        let gate = Arc::new(FrameGate::new());
        let running = Arc::new(AtomicBool::new(true));
        let latest = Arc::new(Slot::new());
        let sequence = Arc::new(AtomicU64::new(0));
        let on_frame = Arc::new(on_frame);
        let on_error = Arc::new(on_error);

        source.start()?;
        tracing::info!(
            width = config.width,
            height = config.height,
            workers = worker_count,
            "pipeline opened"
        );

        let producer = {
            let gate = gate.clone();
            let running = running.clone();
            let (width, height) = (config.width, config.height);
            std::thread::Builder::new()
                .name("cutis-producer".to_string())
                .spawn(move || {
                    produce_frames(&mut *source, &gate, &running, width, height);
                })
                .map_err(|e| Error::Gpu(format!("failed to spawn producer: {}", e)))?
        };

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let gate = gate.clone();
            let running = running.clone();
            let gpu = gpu.clone();
            let chain = chain.clone();
            let classifier = classifier.clone();
            let pool = pool.clone();
            let latest = latest.clone();
            let sequence = sequence.clone();
            let on_frame = on_frame.clone();
            let on_error = on_error.clone();
            let config = config.clone();

            let handle = std::thread::Builder::new()
                .name(format!("cutis-worker-{}", index))
                .spawn(move || {
                    let outcome = worker_loop(
                        &gpu, &gate, &running, &config, &chain, &classifier, &pool, &latest,
                        &sequence, &on_frame,
                    );
                    if let Err(error) = outcome {
                        tracing::error!(%error, "pipeline worker failed, closing");
                        if running.swap(false, Ordering::SeqCst) {
                            on_error(&error.to_string());
                        }
                        gate.close();
                    }
                })
                .map_err(|e| Error::Gpu(format!("failed to spawn worker: {}", e)))?;
            workers.push(handle);
        }

        Ok(Pipeline {
            running,
            gate,
            producer: Some(producer),
            workers,
            latest,
            pool,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The most recently published frame, if any.
    pub fn latest_frame(&self) -> Option<Frame> {
        self.latest.peek().map(|frame| (*frame).clone())
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    /// Cooperative shutdown: clears the running flag, wakes everything and
    /// joins the threads. In-flight runs complete first.
    pub fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.gate.close();

        if let Some(producer) = self.producer.take() {
            if producer.join().is_err() {
                tracing::error!("producer thread panicked during shutdown");
            }
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("worker thread panicked during shutdown");
            }
        }
        tracing::info!("pipeline closed");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.close();
    }
}

fn produce_frames(
    source: &mut dyn FrameSource,
    gate: &FrameGate,
    running: &AtomicBool,
    width: u32,
    height: u32,
) {
    while running.load(Ordering::Acquire) {
        let mut planes = match gate.take_spare() {
            Some(planes) => planes,
            None => match PlaneSet::allocate(width, height) {
                Ok(planes) => planes,
                Err(error) => {
                    gate.fail(error);
                    break;
                }
            },
        };

        let captured = source.next_frame(
            &mut planes.dark,
            &mut planes.channel0,
            &mut planes.channel1,
            &mut planes.channel2,
        );

        match captured {
            Ok(()) => gate.publish(planes),
            Err(error) => {
                // Capture the failure for the next consumer poll instead of
                // unwinding on this thread.
                tracing::warn!(%error, "frame source failed");
                gate.fail(error);
                break;
            }
        }
    }

    if let Err(error) = source.stop() {
        tracing::warn!(%error, "frame source stop failed");
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    gpu: &Gpu,
    gate: &FrameGate,
    running: &AtomicBool,
    config: &PipelineConfig,
    chain: &FilterChain,
    classifier: &SkinClassifier,
    pool: &FramePool,
    latest: &Slot<Frame>,
    sequence: &AtomicU64,
    on_frame: &FrameListener,
) -> Result<()> {
    let mut ctx = ProcessingContext::with_gpu(gpu.clone());
    let mut chain_worker = chain.create_worker(&mut ctx)?;
    let mut classifier_worker = classifier.create_worker(&mut ctx)?;

    let composite_desc = ImageDesc::new(config.width, config.height, PlaneFormat::RGB_F32);
    let likelihood_desc = ImageDesc::new(config.width, config.height, PlaneFormat::GRAY_F32);

    let mut composite = Image::new_empty(composite_desc)?;
    let mut input = ImageBuffer::new_empty(composite_desc);
    let mut filtered = ImageBuffer::new_empty(composite_desc);
    let mut likelihood = ImageBuffer::new_empty(likelihood_desc);

    while running.load(Ordering::Acquire) {
        let planes = match gate.take(config.frame_timeout) {
            Ok(planes) => planes,
            Err(Error::FrameTimeout) => continue,
            Err(Error::PipelineClosed) => break,
            Err(error) => return Err(error),
        };

        // Dark-subtract and normalize the raw planes on the host; the only
        // real parallelism lives here, all device work is serialized by
        // the gateway.
        compose_planes(&planes, &mut composite)?;

        if input.is_gpu() {
            let mut input_gpu = input.make_gpu_mut(&ctx)?;
            input_gpu.write_from(gpu, &composite)?;
        } else {
            let mut input_cpu = input.make_cpu_mut(&ctx)?;
            input_cpu.bytes_mut().copy_from_slice(composite.bytes());
        }

        chain_worker.run(&ctx, &input, &mut filtered)?;
        let classification = classifier_worker.run(&ctx, &filtered, &mut likelihood)?;

        let Some(mut writer) = pool.acquire() else {
            tracing::warn!("frame pool exhausted, dropping iteration");
            gate.recycle(planes);
            continue;
        };

        {
            let mut data = writer.data_mut();
            data.sequence = sequence.fetch_add(1, Ordering::Relaxed);
            data.skin_ratio = classification.skin_ratio;
            data.dark.bytes_mut().copy_from_slice(planes.dark.bytes());
            data.channel0
                .bytes_mut()
                .copy_from_slice(planes.channel0.bytes());
            data.channel1
                .bytes_mut()
                .copy_from_slice(planes.channel1.bytes());
            data.channel2
                .bytes_mut()
                .copy_from_slice(planes.channel2.bytes());

            let filtered_gpu = filtered.make_gpu(&ctx)?;
            filtered_gpu.read_into(gpu, &mut data.composite)?;
            let likelihood_gpu = likelihood.make_gpu(&ctx)?;
            likelihood_gpu.read_into(gpu, &mut data.likelihood)?;
        }
        gate.recycle(planes);

        let frame = writer.publish();
        latest.send(frame.clone());
        on_frame(frame);
    }

    Ok(())
}

/// Builds the calibrated RGB composite from the four raw planes:
/// per channel, dark-subtract and normalize to `[0, 1]`.
pub(crate) fn compose_planes(planes: &PlaneSet, composite: &mut Image) -> Result<()> {
    let desc = *composite.desc();
    if desc.format != PlaneFormat::RGB_F32 {
        return Err(Error::InvalidPlaneFormat(format!(
            "composite must be RGB_F32, got {}",
            desc.format
        )));
    }
    if planes.desc().width != desc.width || planes.desc().height != desc.height {
        return Err(Error::InvalidPlaneFormat(format!(
            "planes are {}x{}, composite is {}x{}",
            planes.desc().width,
            planes.desc().height,
            desc.width,
            desc.height
        )));
    }

    let width = desc.width as usize;
    let dark = planes.dark.pixels::<u16>();
    let channels = [
        planes.channel0.pixels::<u16>(),
        planes.channel1.pixels::<u16>(),
        planes.channel2.pixels::<u16>(),
    ];

    composite.for_each_row(|y, row| {
        let out: &mut [f32] = bytemuck::cast_slice_mut(row);
        let base = y * width;
        for x in 0..width {
            let d = dark[base + x];
            for (c, channel) in channels.iter().enumerate() {
                let value = channel[base + x].saturating_sub(d);
                out[x * 3 + c] = value as f32 / u16::MAX as f32;
            }
        }
        Ok(())
    })
}
