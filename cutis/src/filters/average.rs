use std::sync::Arc;

use parking_lot::Mutex;
use wgpu::util::DeviceExt;

use crate::common::{Error, Result};
use crate::filters::{
    storage_entry, uniform_entry, workgroups_for, Filter, FilterCore, FilterWorker, ParamSink,
    WorkerBinding,
};
use crate::gpu::{Gpu, KernelCache};
use crate::image::ImageDesc;
use crate::processing_context::{GpuPipeline, ImageBuffer, ProcessingContext};

pub const MIN_SAMPLE_COUNT: u32 = 2;
pub const MAX_SAMPLE_COUNT: u32 = 4;

const AVERAGE_KERNEL: &str = include_str!("average.wgsl");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AverageParams {
    sample_count: u32,
}

/// Temporal averaging over the most recent input samples.
///
/// Keeps a ring of the last N submitted frames on the device; the output
/// is their per-pixel mean. Changing the sample count refills every slot
/// with the next incoming frame so stale data is never mixed in, and
/// switches execution to the kernel variant for the new count.
pub struct AverageFilter {
    core: Arc<FilterCore<AverageParams>>,
}

impl AverageFilter {
    pub fn new() -> Self {
        Self {
            core: FilterCore::new(
                "average",
                AverageParams {
                    sample_count: MIN_SAMPLE_COUNT,
                },
            ),
        }
    }

    pub fn sample_count(&self) -> u32 {
        self.core.params().sample_count
    }

    /// Sets the number of averaged samples, clamped to `[2, 4]`.
    pub fn set_sample_count(&self, sample_count: u32) {
        let sample_count = sample_count.clamp(MIN_SAMPLE_COUNT, MAX_SAMPLE_COUNT);
        self.core.mutate(|p| p.sample_count = sample_count);
    }
}

impl Default for AverageFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for AverageFilter {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn is_enabled(&self) -> bool {
        self.core.is_enabled()
    }

    fn set_enabled(&self, enabled: bool) {
        self.core.set_enabled(enabled);
    }

    fn create_worker(&self, ctx: &mut ProcessingContext) -> Result<Box<dyn FilterWorker>> {
        let gpu_ctx = ctx.gpu_context().ok_or(Error::NoGpuContext)?;
        let pipeline = gpu_ctx.get_or_create(GpuAveragePipeline::new)?;
        let gpu = gpu_ctx.gpu().clone();

        let sink = Arc::new(AverageSink {
            gpu,
            pipeline,
            state: Mutex::new(AverageState::default()),
        });
        let binding = WorkerBinding::bind(self.core.clone(), sink.clone());

        Ok(Box::new(AverageWorker {
            _binding: binding,
            sink,
        }))
    }
}

/// Cached GPU pipeline for the averaging kernels.
/// Variants are compiled per sample count.
#[derive(Debug)]
pub struct GpuAveragePipeline {
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    kernels: KernelCache,
}

impl GpuAveragePipeline {
    pub fn new(gpu: &Gpu) -> Result<Self> {
        let device = gpu.device();

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("average_bind_group_layout"),
            entries: &[
                // Params uniform
                uniform_entry(0),
                // Sample ring (N planes back to back)
                storage_entry(1, true),
                // Output image
                storage_entry(2, false),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("average_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            ..Default::default()
        });

        Ok(Self {
            bind_group_layout,
            pipeline_layout,
            kernels: KernelCache::new("average", AVERAGE_KERNEL),
        })
    }

    fn pipeline_for(&self, gpu: &Gpu, sample_count: u32) -> Result<Arc<wgpu::ComputePipeline>> {
        self.kernels.get_or_compile(
            gpu,
            &self.pipeline_layout,
            &[("SAMPLE_COUNT", sample_count)],
        )
    }
}

impl GpuPipeline for GpuAveragePipeline {}

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Params {
    elem_count: u32,
    plane_stride: u32,
    _padding: [u32; 2],
}

struct Ring {
    buffer: wgpu::Buffer,
    desc: ImageDesc,
    sample_count: u32,
    plane_size: u64,
}

#[derive(Default)]
struct AverageState {
    sample_count: u32,
    ring: Option<Ring>,
    /// All slots take the next incoming frame instead of rotating.
    refill: bool,
    next_slot: u32,
}

struct AverageSink {
    gpu: Gpu,
    pipeline: Arc<GpuAveragePipeline>,
    state: Mutex<AverageState>,
}

impl ParamSink<AverageParams> for AverageSink {
    fn apply(&self, params: &AverageParams) {
        let mut state = self.state.lock();
        if state.sample_count != params.sample_count {
            state.sample_count = params.sample_count;
            state.ring = None;
            state.refill = true;
        }
    }
}

impl AverageSink {
    fn run(
        &self,
        ctx: &ProcessingContext,
        input: &ImageBuffer,
        output: &mut ImageBuffer,
    ) -> Result<()> {
        let mut state = self.state.lock();

        let input_gpu = input.make_gpu(ctx)?;
        let mut output_gpu = output.make_gpu_mut(ctx)?;

        let desc = *input_gpu.desc();
        if !desc.format.is_float() {
            return Err(Error::InvalidPlaneFormat(format!(
                "averaging requires a float format, got {}",
                desc.format
            )));
        }
        assert_eq!(&desc, output_gpu.desc(), "input/output desc mismatch");

        let sample_count = state.sample_count;
        let plane_size = crate::gpu::padded_size(desc.size_in_bytes());

        let stale = match &state.ring {
            Some(ring) => ring.desc != desc || ring.sample_count != sample_count,
            None => true,
        };
        if stale {
            state.ring = Some(Ring {
                buffer: self.gpu.device().create_buffer(&wgpu::BufferDescriptor {
                    label: Some("average_ring"),
                    size: plane_size * sample_count as u64,
                    usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                }),
                desc,
                sample_count,
                plane_size,
            });
            state.refill = true;
        }

        let refill = std::mem::take(&mut state.refill);

        if refill {
            for slot in 0..sample_count {
                self.gpu.copy_buffer_region(
                    input_gpu.read_buffer().buffer(),
                    0,
                    &state.ring.as_ref().expect("allocated above").buffer,
                    slot as u64 * plane_size,
                    plane_size,
                )?;
            }
            state.next_slot = 0;
        } else {
            let slot = state.next_slot;
            self.gpu.copy_buffer_region(
                input_gpu.read_buffer().buffer(),
                0,
                &state.ring.as_ref().expect("allocated above").buffer,
                slot as u64 * plane_size,
                plane_size,
            )?;
            state.next_slot = (slot + 1) % sample_count;
        }

        let ring = state.ring.as_ref().expect("allocated above");
        let pipeline = self.pipeline.pipeline_for(&self.gpu, sample_count)?;

        let elem_count = (desc.size_in_bytes() / 4) as u32;
        let params = Params {
            elem_count,
            plane_stride: (plane_size / 4) as u32,
            _padding: [0; 2],
        };
        let params_buffer =
            self.gpu
                .device()
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("average_params_buffer"),
                    contents: bytemuck::bytes_of(&params),
                    usage: wgpu::BufferUsages::UNIFORM,
                });

        let bind_group = self
            .gpu
            .device()
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("average_bind_group"),
                layout: &self.pipeline.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: params_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: ring.buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: output_gpu.write_buffer().as_entire_binding(),
                    },
                ],
            });

        self.gpu.dispatch(
            "average_pass",
            &pipeline,
            &bind_group,
            workgroups_for(elem_count),
        )
    }
}

struct AverageWorker {
    _binding: WorkerBinding<AverageParams>,
    sink: Arc<AverageSink>,
}

impl FilterWorker for AverageWorker {
    fn run(
        &mut self,
        ctx: &ProcessingContext,
        input: &ImageBuffer,
        output: &mut ImageBuffer,
    ) -> Result<()> {
        self.sink.run(ctx, input, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_count_is_clamped() {
        let filter = AverageFilter::new();
        filter.set_sample_count(1);
        assert_eq!(filter.sample_count(), 2);
        filter.set_sample_count(9);
        assert_eq!(filter.sample_count(), 4);
        filter.set_sample_count(3);
        assert_eq!(filter.sample_count(), 3);
    }
}
