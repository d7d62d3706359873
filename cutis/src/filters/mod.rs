mod average;
mod barrel;
mod chain;
mod color_adjust;
mod crop;
mod remap;
mod sharpening;
mod smoothing;
mod transformation;
mod white_calibration;

pub use average::{AverageFilter, GpuAveragePipeline, MAX_SAMPLE_COUNT, MIN_SAMPLE_COUNT};
pub use barrel::BarrelFilter;
pub use chain::{ChainWorker, FilterChain};
pub use color_adjust::{ColorAdjustFilter, GpuColorAdjustPipeline};
pub use crop::CropFilter;
pub use remap::GpuRemapPipeline;
pub use sharpening::{GpuSharpeningPipeline, SharpeningFilter};
pub use smoothing::{
    GpuSmoothingPipeline, SmoothingFilter, MAX_SMOOTHING_RADIUS, MIN_SMOOTHING_RADIUS,
};
pub use transformation::TransformationFilter;
pub use white_calibration::{GpuWhiteCalibrationPipeline, WhiteCalibrationFilter};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::common::Result;
use crate::processing_context::{ImageBuffer, ProcessingContext};

/// Capability interface over a shared filter configuration.
///
/// One filter object exists per pipeline instance and is shared across all
/// execution threads; each thread derives its own [`FilterWorker`] from it.
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;
    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    fn create_worker(&self, ctx: &mut ProcessingContext) -> Result<Box<dyn FilterWorker>>;
}

/// Per-execution-context filter state: derived GPU buffers kept consistent
/// with the shared configuration via the broadcast mechanism below.
pub trait FilterWorker: Send {
    fn run(
        &mut self,
        ctx: &ProcessingContext,
        input: &ImageBuffer,
        output: &mut ImageBuffer,
    ) -> Result<()>;
}

/// A worker-side receiver for configuration broadcasts.
///
/// `apply` re-derives the worker's GPU state from the new parameters,
/// serialized by the worker's own lock (never a global one).
pub(crate) trait ParamSink<P>: Send + Sync {
    fn apply(&self, params: &P);
}

/// Shared core of every filter: the enabled flag, the parameter block and
/// the registry of interested workers.
///
/// `set_params` stores the new configuration and then synchronously invokes
/// `apply` on every registered live worker; two workers of the same filter
/// may still execute update/run concurrently on independent GPU state.
pub(crate) struct FilterCore<P> {
    name: &'static str,
    enabled: AtomicBool,
    params: RwLock<P>,
    sinks: Mutex<Vec<Weak<dyn ParamSink<P>>>>,
}

impl<P: Clone> FilterCore<P> {
    pub fn new(name: &'static str, params: P) -> Arc<Self> {
        Arc::new(Self {
            name,
            enabled: AtomicBool::new(true),
            params: RwLock::new(params),
            sinks: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Returns a snapshot of the current parameters.
    pub fn params(&self) -> P {
        self.params.read().clone()
    }

    /// Stores new parameters and broadcasts them to all registered workers.
    pub fn set_params(&self, params: P) {
        *self.params.write() = params;
        self.update();
    }

    /// In-place parameter mutation followed by a broadcast.
    pub fn mutate(&self, f: impl FnOnce(&mut P)) {
        {
            let mut params = self.params.write();
            f(&mut params);
        }
        self.update();
    }

    /// Fans the current configuration out to every registered worker.
    fn update(&self) {
        let params = self.params.read().clone();

        let mut sinks = self.sinks.lock();
        sinks.retain(|sink| sink.strong_count() > 0);
        for sink in sinks.iter().filter_map(Weak::upgrade) {
            sink.apply(&params);
        }
    }

    fn register(&self, sink: Weak<dyn ParamSink<P>>) {
        self.sinks.lock().push(sink);
    }

    fn unregister(&self, sink: &Arc<dyn ParamSink<P>>) {
        let target = Arc::downgrade(sink);
        self.sinks.lock().retain(|entry| !entry.ptr_eq(&target));
    }

    #[cfg(test)]
    fn live_sink_count(&self) -> usize {
        self.sinks
            .lock()
            .iter()
            .filter(|sink| sink.strong_count() > 0)
            .count()
    }
}

impl<P> Drop for FilterCore<P> {
    fn drop(&mut self) {
        // Workers must unregister before their filter is destroyed.
        debug_assert!(
            self.sinks
                .get_mut()
                .iter()
                .all(|sink| sink.strong_count() == 0),
            "filter '{}' destroyed with live workers registered",
            self.name
        );
    }
}

/// Ties a worker's sink to its filter core: registers at construction,
/// applies the current configuration so the worker starts consistent, and
/// unregisters when the worker is dropped.
pub(crate) struct WorkerBinding<P: 'static> {
    core: Arc<FilterCore<P>>,
    sink: Arc<dyn ParamSink<P>>,
}

impl<P: Clone> WorkerBinding<P> {
    pub fn bind(core: Arc<FilterCore<P>>, sink: Arc<dyn ParamSink<P>>) -> Self {
        core.register(Arc::downgrade(&sink));
        sink.apply(&core.params());
        Self { core, sink }
    }
}

impl<P: 'static> Drop for WorkerBinding<P> {
    fn drop(&mut self) {
        self.core.unregister(&self.sink);
    }
}

// Bind-group layout helpers shared by the filter kernels.

pub(crate) fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub(crate) fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Workgroup size used by all filter kernels.
pub(crate) const WORKGROUP_SIZE: u32 = 256;

pub(crate) fn workgroups_for(items: u32) -> (u32, u32, u32) {
    (items.div_ceil(WORKGROUP_SIZE), 1, 1)
}

#[cfg(test)]
mod tests;
