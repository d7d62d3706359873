use std::sync::Arc;

use parking_lot::Mutex;
use wgpu::util::DeviceExt;

use crate::common::{Error, Result};
use crate::filters::{
    storage_entry, uniform_entry, workgroups_for, Filter, FilterCore, FilterWorker, ParamSink,
    WorkerBinding,
};
use crate::gpu::{Gpu, KernelCache};
use crate::processing_context::{GpuPipeline, ImageBuffer, ProcessingContext};

const MIN_SETTING: i32 = -100;
const MAX_SETTING: i32 = 100;

/// Contrast response slopes. The positive side is intentionally steeper
/// than the negative side.
const CONTRAST_SLOPE_POSITIVE: f32 = 9.0 / 100.0;
const CONTRAST_SLOPE_NEGATIVE: f32 = 1.0 / 100.0;

const BRIGHTNESS_SCALE: f32 = 0.01;

const COLOR_ADJUST_KERNEL: &str = include_str!("color_adjust.wgsl");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ColorAdjustParams {
    brightness: i32,
    contrast: i32,
}

/// Affine brightness/contrast adjustment: `output = alpha * input + beta`.
pub struct ColorAdjustFilter {
    core: Arc<FilterCore<ColorAdjustParams>>,
}

fn alpha_for(contrast: i32) -> f32 {
    if contrast >= 0 {
        1.0 + CONTRAST_SLOPE_POSITIVE * contrast as f32
    } else {
        1.0 + CONTRAST_SLOPE_NEGATIVE * contrast as f32
    }
}

fn beta_for(brightness: i32) -> f32 {
    brightness as f32 * BRIGHTNESS_SCALE
}

impl ColorAdjustFilter {
    pub fn new() -> Self {
        Self {
            core: FilterCore::new(
                "color_adjust",
                ColorAdjustParams {
                    brightness: 0,
                    contrast: 0,
                },
            ),
        }
    }

    pub fn brightness(&self) -> i32 {
        self.core.params().brightness
    }

    /// Sets the brightness setting, clamped to `[-100, 100]`.
    pub fn set_brightness(&self, brightness: i32) {
        let brightness = brightness.clamp(MIN_SETTING, MAX_SETTING);
        self.core.mutate(|p| p.brightness = brightness);
    }

    pub fn contrast(&self) -> i32 {
        self.core.params().contrast
    }

    /// Sets the contrast setting, clamped to `[-100, 100]`.
    pub fn set_contrast(&self, contrast: i32) {
        let contrast = contrast.clamp(MIN_SETTING, MAX_SETTING);
        self.core.mutate(|p| p.contrast = contrast);
    }
}

impl Default for ColorAdjustFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for ColorAdjustFilter {
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
        let pipeline = gpu_ctx.get_or_create(GpuColorAdjustPipeline::new)?;
        let gpu = gpu_ctx.gpu().clone();

        let sink = Arc::new(ColorAdjustSink {
            gpu,
            pipeline,
            state: Mutex::new(ColorAdjustState {
                alpha: 1.0,
                beta: 0.0,
            }),
        });
        let binding = WorkerBinding::bind(self.core.clone(), sink.clone());

        Ok(Box::new(ColorAdjustWorker {
            _binding: binding,
            sink,
        }))
    }
}

/// Cached GPU pipeline for the affine color adjustment kernel.
#[derive(Debug)]
pub struct GpuColorAdjustPipeline {
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    kernels: KernelCache,
}

impl GpuColorAdjustPipeline {
    pub fn new(gpu: &Gpu) -> Result<Self> {
        let device = gpu.device();

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("color_adjust_bind_group_layout"),
            entries: &[
                // Params uniform
                uniform_entry(0),
                // Input image
                storage_entry(1, true),
                // Output image
                storage_entry(2, false),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("color_adjust_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            ..Default::default()
        });

        Ok(Self {
            bind_group_layout,
            pipeline_layout,
            kernels: KernelCache::new("color_adjust", COLOR_ADJUST_KERNEL),
        })
    }

    fn pipeline(&self, gpu: &Gpu) -> Result<Arc<wgpu::ComputePipeline>> {
        self.kernels.get_or_compile(gpu, &self.pipeline_layout, &[])
    }
}

impl GpuPipeline for GpuColorAdjustPipeline {}

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Params {
    elem_count: u32,
    _pad: u32,
    alpha: f32,
    beta: f32,
}

struct ColorAdjustState {
    alpha: f32,
    beta: f32,
}

struct ColorAdjustSink {
    gpu: Gpu,
    pipeline: Arc<GpuColorAdjustPipeline>,
    state: Mutex<ColorAdjustState>,
}

impl ParamSink<ColorAdjustParams> for ColorAdjustSink {
    fn apply(&self, params: &ColorAdjustParams) {
        let mut state = self.state.lock();
        state.alpha = alpha_for(params.contrast);
        state.beta = beta_for(params.brightness);
    }
}

impl ColorAdjustSink {
    fn run(
        &self,
        ctx: &ProcessingContext,
        input: &ImageBuffer,
        output: &mut ImageBuffer,
    ) -> Result<()> {
        let state = self.state.lock();

        let input_gpu = input.make_gpu(ctx)?;
        let mut output_gpu = output.make_gpu_mut(ctx)?;

        let desc = *input_gpu.desc();
        if !desc.format.is_float() {
            return Err(Error::InvalidPlaneFormat(format!(
                "color adjust requires a float format, got {}",
                desc.format
            )));
        }
        assert_eq!(&desc, output_gpu.desc(), "input/output desc mismatch");

        let pipeline = self.pipeline.pipeline(&self.gpu)?;

        let elem_count = (desc.size_in_bytes() / 4) as u32;
        let params = Params {
            elem_count,
            _pad: 0,
            alpha: state.alpha,
            beta: state.beta,
        };
        let params_buffer =
            self.gpu
                .device()
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("color_adjust_params_buffer"),
                    contents: bytemuck::bytes_of(&params),
                    usage: wgpu::BufferUsages::UNIFORM,
                });

        let bind_group = self
            .gpu
            .device()
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("color_adjust_bind_group"),
                layout: &self.pipeline.bind_group_layout,
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
                        resource: output_gpu.write_buffer().as_entire_binding(),
                    },
                ],
            });

        self.gpu.dispatch(
            "color_adjust_pass",
            &pipeline,
            &bind_group,
            workgroups_for(elem_count),
        )
    }
}

struct ColorAdjustWorker {
    _binding: WorkerBinding<ColorAdjustParams>,
    sink: Arc<ColorAdjustSink>,
}

impl FilterWorker for ColorAdjustWorker {
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
    fn settings_are_clamped() {
        let filter = ColorAdjustFilter::new();
        filter.set_brightness(1000);
        assert_eq!(filter.brightness(), 100);
        filter.set_contrast(-1000);
        assert_eq!(filter.contrast(), -100);
    }

    #[test]
    fn response_curve_is_asymmetric() {
        assert_eq!(alpha_for(0), 1.0);
        assert!((alpha_for(100) - 10.0).abs() < 1e-5);
        assert!(alpha_for(-100).abs() < 1e-5);
        assert!((alpha_for(50) - 5.5).abs() < 1e-5);
        assert!((alpha_for(-50) - 0.5).abs() < 1e-5);
    }

    #[test]
    fn brightness_maps_to_offset() {
        assert_eq!(beta_for(0), 0.0);
        assert!((beta_for(100) - 1.0).abs() < 1e-5);
        assert!((beta_for(-25) + 0.25).abs() < 1e-5);
    }
}
