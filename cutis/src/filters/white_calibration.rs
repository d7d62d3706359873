use std::sync::Arc;

use parking_lot::Mutex;
use wgpu::util::DeviceExt;

use crate::common::{Error, PlaneFormat, Result};
use crate::filters::{
    storage_entry, uniform_entry, workgroups_for, Filter, FilterCore, FilterWorker, ParamSink,
    WorkerBinding,
};
use crate::gpu::{Gpu, KernelCache};
use crate::image::Image;
use crate::processing_context::{GpuPipeline, ImageBuffer, ProcessingContext};

const MIN_GAIN: f32 = 0.1;
const MAX_GAIN: f32 = 10.0;

const WHITE_CALIBRATION_KERNEL: &str = include_str!("white_calibration.wgsl");

#[derive(Debug, Clone, Copy, PartialEq)]
struct WhiteCalibrationParams {
    gains: [f32; 3],
}

/// Per-channel white calibration: a simple reciprocal-gain multiply.
pub struct WhiteCalibrationFilter {
    core: Arc<FilterCore<WhiteCalibrationParams>>,
}

impl WhiteCalibrationFilter {
    pub fn new() -> Self {
        Self {
            core: FilterCore::new(
                "white_calibration",
                WhiteCalibrationParams {
                    gains: [1.0, 1.0, 1.0],
                },
            ),
        }
    }

    pub fn gains(&self) -> [f32; 3] {
        self.core.params().gains
    }

    /// Sets the per-channel gains, each clamped to `[0.1, 10]`.
    pub fn set_gains(&self, gains: [f32; 3]) {
        let gains = gains.map(|g| g.clamp(MIN_GAIN, MAX_GAIN));
        self.core.mutate(|p| p.gains = gains);
    }

    /// Derives gains from a neutral reference image: each channel is scaled
    /// so its mean matches the brightest channel's mean.
    pub fn measure(reference: &Image) -> Result<[f32; 3]> {
        if reference.desc().format != PlaneFormat::RGB_F32 {
            return Err(Error::InvalidPlaneFormat(format!(
                "white calibration reference must be RGB_F32, got {}",
                reference.desc().format
            )));
        }

        let mut sums = [0.0f64; 3];
        for px in reference.pixels::<[f32; 3]>() {
            for (sum, &v) in sums.iter_mut().zip(px.iter()) {
                *sum += v as f64;
            }
        }

        let count = reference.desc().pixel_count() as f64;
        let means = sums.map(|s| (s / count).max(1e-6));
        let target = means.iter().cloned().fold(f64::MIN, f64::max);

        Ok(means.map(|m| ((target / m) as f32).clamp(MIN_GAIN, MAX_GAIN)))
    }
}

impl Default for WhiteCalibrationFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for WhiteCalibrationFilter {
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
        let pipeline = gpu_ctx.get_or_create(GpuWhiteCalibrationPipeline::new)?;
        let gpu = gpu_ctx.gpu().clone();

        let sink = Arc::new(WhiteCalibrationSink {
            gpu,
            pipeline,
            state: Mutex::new([1.0, 1.0, 1.0]),
        });
        let binding = WorkerBinding::bind(self.core.clone(), sink.clone());

        Ok(Box::new(WhiteCalibrationWorker {
            _binding: binding,
            sink,
        }))
    }
}

/// Cached GPU pipeline for the white calibration kernel.
#[derive(Debug)]
pub struct GpuWhiteCalibrationPipeline {
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    kernels: KernelCache,
}

impl GpuWhiteCalibrationPipeline {
    pub fn new(gpu: &Gpu) -> Result<Self> {
        let device = gpu.device();

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("white_calibration_bind_group_layout"),
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
            label: Some("white_calibration_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            ..Default::default()
        });

        Ok(Self {
            bind_group_layout,
            pipeline_layout,
            kernels: KernelCache::new("white_calibration", WHITE_CALIBRATION_KERNEL),
        })
    }

    fn pipeline_for(&self, gpu: &Gpu, channels: u32) -> Result<Arc<wgpu::ComputePipeline>> {
        self.kernels
            .get_or_compile(gpu, &self.pipeline_layout, &[("CHANNELS", channels)])
    }
}

impl GpuPipeline for GpuWhiteCalibrationPipeline {}

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Params {
    pixel_count: u32,
    _pad: [u32; 3],
    gains: [f32; 4],
}

struct WhiteCalibrationSink {
    gpu: Gpu,
    pipeline: Arc<GpuWhiteCalibrationPipeline>,
    state: Mutex<[f32; 3]>,
}

impl ParamSink<WhiteCalibrationParams> for WhiteCalibrationSink {
    fn apply(&self, params: &WhiteCalibrationParams) {
        *self.state.lock() = params.gains;
    }
}

impl WhiteCalibrationSink {
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
                "white calibration requires a float format, got {}",
                desc.format
            )));
        }
        assert_eq!(&desc, output_gpu.desc(), "input/output desc mismatch");

        let channels = desc.format.channel_count.channel_count() as u32;
        let pipeline = self.pipeline.pipeline_for(&self.gpu, channels)?;

        let gains = *state;
        let params = Params {
            pixel_count: desc.pixel_count() as u32,
            _pad: [0; 3],
            gains: [gains[0], gains[1], gains[2], 1.0],
        };
        let params_buffer =
            self.gpu
                .device()
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("white_calibration_params_buffer"),
                    contents: bytemuck::bytes_of(&params),
                    usage: wgpu::BufferUsages::UNIFORM,
                });

        let bind_group = self
            .gpu
            .device()
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("white_calibration_bind_group"),
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
            "white_calibration_pass",
            &pipeline,
            &bind_group,
            workgroups_for(desc.pixel_count() as u32),
        )
    }
}

struct WhiteCalibrationWorker {
    _binding: WorkerBinding<WhiteCalibrationParams>,
    sink: Arc<WhiteCalibrationSink>,
}

impl FilterWorker for WhiteCalibrationWorker {
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
    use crate::image::ImageDesc;

    #[test]
    fn gains_are_clamped() {
        let filter = WhiteCalibrationFilter::new();
        filter.set_gains([0.0, 5.0, 100.0]);
        assert_eq!(filter.gains(), [0.1, 5.0, 10.0]);
    }

    #[test]
    fn measure_balances_toward_brightest_channel() {
        let desc = ImageDesc::new(4, 4, PlaneFormat::RGB_F32);
        let mut reference = Image::new_empty(desc).unwrap();
        for px in reference.pixels_mut::<[f32; 3]>() {
            *px = [0.5, 0.25, 1.0];
        }

        let gains = WhiteCalibrationFilter::measure(&reference).unwrap();
        assert!((gains[0] - 2.0).abs() < 1e-5);
        assert!((gains[1] - 4.0).abs() < 1e-5);
        assert!((gains[2] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn measure_rejects_non_rgb() {
        let desc = ImageDesc::new(4, 4, PlaneFormat::GRAY_F32);
        let reference = Image::new_empty(desc).unwrap();
        assert!(WhiteCalibrationFilter::measure(&reference).is_err());
    }
}
