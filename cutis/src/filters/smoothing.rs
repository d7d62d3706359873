use std::sync::Arc;

use parking_lot::Mutex;
use wgpu::util::DeviceExt;

use crate::common::{Error, Result};
use crate::filters::{
    storage_entry, uniform_entry, workgroups_for, Filter, FilterCore, FilterWorker, ParamSink,
    WorkerBinding,
};
use crate::gpu::{BufferAccess, Gpu, GpuImage, KernelCache};
use crate::processing_context::{GpuPipeline, ImageBuffer, ProcessingContext};

pub const MIN_SMOOTHING_RADIUS: u32 = 1;
pub const MAX_SMOOTHING_RADIUS: u32 = 10;

const SMOOTHING_KERNEL: &str = include_str!("smoothing.wgsl");

const DIRECTION_HORIZONTAL: u32 = 0;
const DIRECTION_VERTICAL: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SmoothingParams {
    radius: u32,
}

/// Symmetric Gaussian blur.
///
/// A 1D weight vector sized by the radius is precomputed on the host and
/// regenerated only when the radius changes; execution is two separable
/// passes through a worker-owned scratch buffer.
pub struct SmoothingFilter {
    core: Arc<FilterCore<SmoothingParams>>,
}

impl SmoothingFilter {
    pub fn new() -> Self {
        Self {
            core: FilterCore::new("smoothing", SmoothingParams { radius: 1 }),
        }
    }

    pub fn radius(&self) -> u32 {
        self.core.params().radius
    }

    /// Sets the blur radius, clamped to `[1, 10]`.
    pub fn set_radius(&self, radius: u32) {
        let radius = radius.clamp(MIN_SMOOTHING_RADIUS, MAX_SMOOTHING_RADIUS);
        self.core.mutate(|p| p.radius = radius);
    }
}

impl Default for SmoothingFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for SmoothingFilter {
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
        let sink = SmoothingSink::create(ctx)?;
        let binding = WorkerBinding::bind(self.core.clone(), sink.clone());

        Ok(Box::new(SmoothingWorker {
            _binding: binding,
            sink,
        }))
    }
}

/// Normalized symmetric Gaussian weights for `2 * radius + 1` taps.
pub(crate) fn gaussian_weights(radius: u32) -> Vec<f32> {
    let sigma = (radius as f32 / 2.0).max(0.5);
    let denom = 2.0 * sigma * sigma;

    let mut weights: Vec<f32> = (-(radius as i32)..=radius as i32)
        .map(|offset| (-(offset * offset) as f32 / denom).exp())
        .collect();

    let sum: f32 = weights.iter().sum();
    for weight in &mut weights {
        *weight /= sum;
    }
    weights
}

/// Cached GPU pipeline for the separable blur passes.
/// Variants are compiled per channel count.
#[derive(Debug)]
pub struct GpuSmoothingPipeline {
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    kernels: KernelCache,
}

impl GpuSmoothingPipeline {
    pub fn new(gpu: &Gpu) -> Result<Self> {
        let device = gpu.device();

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("smoothing_bind_group_layout"),
            entries: &[
                // Params uniform
                uniform_entry(0),
                // Weight vector
                storage_entry(1, true),
                // Input image
                storage_entry(2, true),
                // Output image
                storage_entry(3, false),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("smoothing_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            ..Default::default()
        });

        Ok(Self {
            bind_group_layout,
            pipeline_layout,
            kernels: KernelCache::new("smoothing", SMOOTHING_KERNEL),
        })
    }

    pub(crate) fn pipeline_for(
        &self,
        gpu: &Gpu,
        channels: u32,
    ) -> Result<Arc<wgpu::ComputePipeline>> {
        self.kernels
            .get_or_compile(gpu, &self.pipeline_layout, &[("CHANNELS", channels)])
    }
}

impl GpuPipeline for GpuSmoothingPipeline {}

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Params {
    width: u32,
    height: u32,
    radius: u32,
    direction: u32,
}

#[derive(Default)]
struct SmoothingState {
    radius: u32,
    weights: Option<wgpu::Buffer>,
    scratch: Option<GpuImage>,
}

pub(crate) struct SmoothingSink {
    gpu: Gpu,
    pipeline: Arc<GpuSmoothingPipeline>,
    state: Mutex<SmoothingState>,
}

impl ParamSink<SmoothingParams> for SmoothingSink {
    fn apply(&self, params: &SmoothingParams) {
        let mut state = self.state.lock();
        if state.radius != params.radius || state.weights.is_none() {
            state.radius = params.radius;
            state.weights = Some(upload_weights(&self.gpu, params.radius));
        }
    }
}

pub(crate) fn upload_weights(gpu: &Gpu, radius: u32) -> wgpu::Buffer {
    gpu.device()
        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("smoothing_weights"),
            contents: bytemuck::cast_slice(&gaussian_weights(radius)),
            usage: wgpu::BufferUsages::STORAGE,
        })
}

impl SmoothingSink {
    pub fn create(ctx: &mut ProcessingContext) -> Result<Arc<Self>> {
        let gpu_ctx = ctx.gpu_context().ok_or(Error::NoGpuContext)?;
        let pipeline = gpu_ctx.get_or_create(GpuSmoothingPipeline::new)?;
        let gpu = gpu_ctx.gpu().clone();

        Ok(Arc::new(Self {
            gpu,
            pipeline,
            state: Mutex::new(SmoothingState::default()),
        }))
    }

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
                "smoothing requires a float format, got {}",
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
        }

        let radius = state.radius;
        let weights = state.weights.as_ref().expect("worker bound without parameters");
        let scratch = state.scratch.as_ref().expect("allocated above");

        let channels = desc.format.channel_count.channel_count() as u32;
        let pipeline = self.pipeline.pipeline_for(&self.gpu, channels)?;

        // Horizontal pass into the scratch buffer, vertical pass out of it.
        self.blur_pass(
            &pipeline,
            &desc,
            radius,
            DIRECTION_HORIZONTAL,
            weights,
            input_gpu.read_buffer().buffer(),
            scratch.read_buffer().buffer(),
        )?;
        self.blur_pass(
            &pipeline,
            &desc,
            radius,
            DIRECTION_VERTICAL,
            weights,
            scratch.read_buffer().buffer(),
            output_gpu.write_buffer().buffer(),
        )?;

        Ok(())
    }

    pub(crate) fn blur_pass(
        &self,
        pipeline: &wgpu::ComputePipeline,
        desc: &crate::image::ImageDesc,
        radius: u32,
        direction: u32,
        weights: &wgpu::Buffer,
        input: &wgpu::Buffer,
        output: &wgpu::Buffer,
    ) -> Result<()> {
        let params = Params {
            width: desc.width,
            height: desc.height,
            radius,
            direction,
        };
        let params_buffer =
            self.gpu
                .device()
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("smoothing_params_buffer"),
                    contents: bytemuck::bytes_of(&params),
                    usage: wgpu::BufferUsages::UNIFORM,
                });

        let bind_group = self
            .gpu
            .device()
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("smoothing_bind_group"),
                layout: &self.pipeline.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: params_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: weights.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: input.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: output.as_entire_binding(),
                    },
                ],
            });

        self.gpu.dispatch(
            "smoothing_pass",
            pipeline,
            &bind_group,
            workgroups_for(desc.pixel_count() as u32),
        )
    }
}

struct SmoothingWorker {
    _binding: WorkerBinding<SmoothingParams>,
    sink: Arc<SmoothingSink>,
}

impl FilterWorker for SmoothingWorker {
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
    fn radius_is_clamped() {
        let filter = SmoothingFilter::new();
        filter.set_radius(0);
        assert_eq!(filter.radius(), 1);
        filter.set_radius(99);
        assert_eq!(filter.radius(), 10);
    }

    #[test]
    fn weights_are_normalized_and_symmetric() {
        for radius in MIN_SMOOTHING_RADIUS..=MAX_SMOOTHING_RADIUS {
            let weights = gaussian_weights(radius);
            assert_eq!(weights.len(), (2 * radius + 1) as usize);

            let sum: f32 = weights.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5, "sum {} for radius {}", sum, radius);

            for i in 0..radius as usize {
                let mirror = weights.len() - 1 - i;
                assert_eq!(weights[i], weights[mirror]);
            }

            // The center tap dominates.
            let center = weights[radius as usize];
            assert!(weights.iter().all(|&w| w <= center));
        }
    }
}
