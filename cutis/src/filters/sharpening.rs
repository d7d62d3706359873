use std::sync::Arc;

use parking_lot::Mutex;
use wgpu::util::DeviceExt;

use crate::common::{Error, Result};
use crate::filters::smoothing::{upload_weights, GpuSmoothingPipeline, SmoothingSink};
use crate::filters::{
    storage_entry, uniform_entry, workgroups_for, Filter, FilterCore, FilterWorker, ParamSink,
    WorkerBinding,
};
use crate::gpu::{BufferAccess, Gpu, GpuImage, KernelCache};
use crate::processing_context::{GpuPipeline, ImageBuffer, ProcessingContext};

const MIN_AMOUNT: f32 = 0.0;
const MAX_AMOUNT: f32 = 10.0;
const MIN_THRESHOLD: f32 = 0.0;
const MAX_THRESHOLD: f32 = 1.0;

/// Blur radius used for the unsharp mask.
const UNSHARP_RADIUS: u32 = 2;

const SHARPENING_KERNEL: &str = include_str!("sharpening.wgsl");

#[derive(Debug, Clone, Copy, PartialEq)]
struct SharpeningParams {
    amount: f32,
    threshold: f32,
}

/// Unsharp-mask sharpening.
///
/// Blurs the input with the smoothing weight scheme, then combines
/// `output = input + amount * (input - blurred)` wherever the per-pixel
/// difference magnitude exceeds the threshold; low-contrast pixels pass
/// through untouched.
pub struct SharpeningFilter {
    core: Arc<FilterCore<SharpeningParams>>,
}

impl SharpeningFilter {
    pub fn new() -> Self {
        Self {
            core: FilterCore::new(
                "sharpening",
                SharpeningParams {
                    amount: 1.0,
                    threshold: 0.0,
                },
            ),
        }
    }

    pub fn amount(&self) -> f32 {
        self.core.params().amount
    }

    /// Sets the sharpening strength, clamped to `[0, 10]`.
    pub fn set_amount(&self, amount: f32) {
        let amount = amount.clamp(MIN_AMOUNT, MAX_AMOUNT);
        self.core.mutate(|p| p.amount = amount);
    }

    pub fn threshold(&self) -> f32 {
        self.core.params().threshold
    }

    /// Sets the low-contrast suppression threshold, clamped to `[0, 1]`.
    pub fn set_threshold(&self, threshold: f32) {
        let threshold = threshold.clamp(MIN_THRESHOLD, MAX_THRESHOLD);
        self.core.mutate(|p| p.threshold = threshold);
    }
}

impl Default for SharpeningFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for SharpeningFilter {
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
        let smoothing = SmoothingSink::create(ctx)?;

        let gpu_ctx = ctx.gpu_context().ok_or(Error::NoGpuContext)?;
        let smooth_pipeline = gpu_ctx.get_or_create(GpuSmoothingPipeline::new)?;
        let combine_pipeline = gpu_ctx.get_or_create(GpuSharpeningPipeline::new)?;
        let gpu = gpu_ctx.gpu().clone();

        let weights = upload_weights(&gpu, UNSHARP_RADIUS);

        let sink = Arc::new(SharpeningSink {
            gpu,
            smoothing,
            smooth_pipeline,
            combine_pipeline,
            weights,
            state: Mutex::new(SharpeningState::default()),
        });
        let binding = WorkerBinding::bind(self.core.clone(), sink.clone());

        Ok(Box::new(SharpeningWorker {
            _binding: binding,
            sink,
        }))
    }
}

/// Cached GPU pipeline for the unsharp combine kernel.
#[derive(Debug)]
pub struct GpuSharpeningPipeline {
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    kernels: KernelCache,
}

impl GpuSharpeningPipeline {
    pub fn new(gpu: &Gpu) -> Result<Self> {
        let device = gpu.device();

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("sharpening_bind_group_layout"),
            entries: &[
                // Params uniform
                uniform_entry(0),
                // Input image
                storage_entry(1, true),
                // Blurred image
                storage_entry(2, true),
                // Output image
                storage_entry(3, false),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("sharpening_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            ..Default::default()
        });

        Ok(Self {
            bind_group_layout,
            pipeline_layout,
            kernels: KernelCache::new("sharpening", SHARPENING_KERNEL),
        })
    }

    fn pipeline_for(&self, gpu: &Gpu, channels: u32) -> Result<Arc<wgpu::ComputePipeline>> {
        self.kernels
            .get_or_compile(gpu, &self.pipeline_layout, &[("CHANNELS", channels)])
    }
}

impl GpuPipeline for GpuSharpeningPipeline {}

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Params {
    pixel_count: u32,
    _pad: u32,
    amount: f32,
    threshold: f32,
}

#[derive(Default)]
struct SharpeningState {
    amount: f32,
    threshold: f32,
    scratch: Option<GpuImage>,
    blurred: Option<GpuImage>,
}

struct SharpeningSink {
    gpu: Gpu,
    smoothing: Arc<SmoothingSink>,
    smooth_pipeline: Arc<GpuSmoothingPipeline>,
    combine_pipeline: Arc<GpuSharpeningPipeline>,
    weights: wgpu::Buffer,
    state: Mutex<SharpeningState>,
}

impl ParamSink<SharpeningParams> for SharpeningSink {
    fn apply(&self, params: &SharpeningParams) {
        let mut state = self.state.lock();
        state.amount = params.amount;
        state.threshold = params.threshold;
    }
}

impl SharpeningSink {
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
                "sharpening requires a float format, got {}",
                desc.format
            )));
        }
        assert_eq!(&desc, output_gpu.desc(), "input/output desc mismatch");

        let scratch_stale = match &state.scratch {
            Some(scratch) => scratch.desc() != &desc,
            None => true,
        };
        if scratch_stale {
            state.scratch = Some(GpuImage::new_empty(&self.gpu, desc, BufferAccess::ReadWrite));
            state.blurred = Some(GpuImage::new_empty(&self.gpu, desc, BufferAccess::ReadWrite));
        }

        let channels = desc.format.channel_count.channel_count() as u32;
        let smooth_pipeline = self.smooth_pipeline.pipeline_for(&self.gpu, channels)?;
        let scratch = state.scratch.as_ref().expect("allocated above");
        let blurred = state.blurred.as_ref().expect("allocated above");

        // Two blur passes with the smoothing weight scheme.
        self.smoothing.blur_pass(
            &smooth_pipeline,
            &desc,
            UNSHARP_RADIUS,
            0,
            &self.weights,
            input_gpu.read_buffer().buffer(),
            scratch.read_buffer().buffer(),
        )?;
        self.smoothing.blur_pass(
            &smooth_pipeline,
            &desc,
            UNSHARP_RADIUS,
            1,
            &self.weights,
            scratch.read_buffer().buffer(),
            blurred.read_buffer().buffer(),
        )?;

        // Combine pass.
        let pipeline = self.combine_pipeline.pipeline_for(&self.gpu, channels)?;

        let params = Params {
            pixel_count: desc.pixel_count() as u32,
            _pad: 0,
            amount: state.amount,
            threshold: state.threshold,
        };
        let params_buffer =
            self.gpu
                .device()
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("sharpening_params_buffer"),
                    contents: bytemuck::bytes_of(&params),
                    usage: wgpu::BufferUsages::UNIFORM,
                });

        let bind_group = self
            .gpu
            .device()
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("sharpening_bind_group"),
                layout: &self.combine_pipeline.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: params_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: input_gpu.read_buffer().as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: blurred.read_buffer().as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: output_gpu.write_buffer().as_entire_binding(),
                    },
                ],
            });

        self.gpu.dispatch(
            "sharpening_pass",
            &pipeline,
            &bind_group,
            workgroups_for(desc.pixel_count() as u32),
        )
    }
}

struct SharpeningWorker {
    _binding: WorkerBinding<SharpeningParams>,
    sink: Arc<SharpeningSink>,
}

impl FilterWorker for SharpeningWorker {
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
    fn amount_and_threshold_are_clamped() {
        let filter = SharpeningFilter::new();
        filter.set_amount(-1.0);
        assert_eq!(filter.amount(), 0.0);
        filter.set_amount(100.0);
        assert_eq!(filter.amount(), 10.0);

        filter.set_threshold(-0.5);
        assert_eq!(filter.threshold(), 0.0);
        filter.set_threshold(2.0);
        assert_eq!(filter.threshold(), 1.0);
    }
}
