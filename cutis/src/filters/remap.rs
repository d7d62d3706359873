//! Shared remap machinery for the geometric filters (barrel, crop,
//! transformation).
//!
//! A remap table stores one source coordinate pair per output pixel. The
//! table is regenerated on the host whenever the mapping parameters or the
//! image dimensions change, uploaded once, and applied by a single kernel
//! shared by all geometric filters.

use std::sync::Arc;

use glam::{Mat3, Vec3};
use parking_lot::Mutex;
use wgpu::util::DeviceExt;

use common::parallel::parallel_chunked;

use crate::common::{Error, Result};
use crate::filters::{storage_entry, uniform_entry, workgroups_for, ParamSink};
use crate::gpu::{Gpu, KernelCache};
use crate::image::ImageDesc;
use crate::processing_context::{GpuPipeline, ImageBuffer, ProcessingContext};

const REMAP_KERNEL: &str = include_str!("remap.wgsl");

/// Cached GPU pipeline for remap application.
/// Variants are compiled per channel count.
#[derive(Debug)]
pub struct GpuRemapPipeline {
    pub(super) bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    kernels: KernelCache,
}

impl GpuRemapPipeline {
    pub fn new(gpu: &Gpu) -> Result<Self> {
        let device = gpu.device();

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("remap_bind_group_layout"),
            entries: &[
                // Params uniform
                uniform_entry(0),
                // Remap table (2 floats per pixel)
                storage_entry(1, true),
                // Input image
                storage_entry(2, true),
                // Output image
                storage_entry(3, false),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("remap_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            ..Default::default()
        });

        Ok(Self {
            bind_group_layout,
            pipeline_layout,
            kernels: KernelCache::new("remap", REMAP_KERNEL),
        })
    }

    fn pipeline_for(&self, gpu: &Gpu, channels: u32) -> Result<Arc<wgpu::ComputePipeline>> {
        self.kernels
            .get_or_compile(gpu, &self.pipeline_layout, &[("CHANNELS", channels)])
    }
}

impl GpuPipeline for GpuRemapPipeline {}

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Params {
    width: u32,
    height: u32,
    _padding: [u32; 2],
}

/// Per-pixel source-coordinate lookup table resident on the device.
#[derive(Debug)]
pub(crate) struct RemapTable {
    buffer: wgpu::Buffer,
    desc: ImageDesc,
}

impl RemapTable {
    /// Generates the table for `desc` from a (x, y) -> source-coordinate
    /// function, computed row-parallel on the host and uploaded once.
    pub fn generate<F>(gpu: &Gpu, desc: ImageDesc, f: F) -> Self
    where
        F: Fn(u32, u32) -> [f32; 2] + Send + Sync,
    {
        let width = desc.width as usize;
        let mut coords = vec![[0.0f32; 2]; desc.pixel_count()];
        parallel_chunked(&mut coords, |i| {
            let x = (i % width) as u32;
            let y = (i / width) as u32;
            f(x, y)
        });

        let buffer = gpu
            .device()
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("remap_table"),
                contents: bytemuck::cast_slice(&coords),
                usage: wgpu::BufferUsages::STORAGE,
            });

        Self { buffer, desc }
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }
}

/// The mapping a geometric filter currently describes.
///
/// Tables are derived lazily because the image dimensions are only known
/// once the first frame arrives at the worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Mapping {
    /// Radial barrel/pincushion distortion around the image center.
    Barrel { coefficient: f32 },
    /// Scaled, centered view of a cropped sub-rectangle.
    Crop {
        left: u32,
        right: u32,
        top: u32,
        bottom: u32,
    },
    /// Arbitrary 3x3 homogeneous transform (backward mapping uses its inverse).
    Matrix { matrix: Mat3 },
}

impl Mapping {
    fn source_for(&self, desc: ImageDesc) -> Box<dyn Fn(u32, u32) -> [f32; 2] + Send + Sync> {
        match *self {
            Mapping::Barrel { coefficient } => {
                let cx = desc.width as f32 / 2.0;
                let cy = desc.height as f32 / 2.0;
                Box::new(move |x, y| {
                    let dx = x as f32 - cx;
                    let dy = y as f32 - cy;
                    let nx = dx / cx;
                    let ny = dy / cy;
                    let scale = 1.0 + coefficient * (nx * nx + ny * ny);
                    [cx + dx * scale, cy + dy * scale]
                })
            }
            Mapping::Crop {
                left,
                right,
                top,
                bottom,
            } => {
                let width = desc.width as f32;
                let height = desc.height as f32;
                let cropped_w = width - (left + right) as f32;
                let cropped_h = height - (top + bottom) as f32;
                // Largest uniform scale that fits the cropped rectangle back
                // into the original frame, centered.
                let scale = (width / cropped_w).min(height / cropped_h);
                let offset_x = (width - cropped_w * scale) / 2.0;
                let offset_y = (height - cropped_h * scale) / 2.0;
                let crop_x = left as f32;
                let crop_y = top as f32;
                Box::new(move |x, y| {
                    let sx = (x as f32 - offset_x) / scale + crop_x;
                    let sy = (y as f32 - offset_y) / scale + crop_y;
                    let inside = sx >= crop_x
                        && sx <= crop_x + cropped_w - 1.0
                        && sy >= crop_y
                        && sy <= crop_y + cropped_h - 1.0;
                    if inside {
                        [sx, sy]
                    } else {
                        [-1.0, -1.0]
                    }
                })
            }
            Mapping::Matrix { matrix } => {
                let inverse = if matrix.determinant().abs() > f32::EPSILON {
                    matrix.inverse()
                } else {
                    tracing::warn!("transformation matrix is singular, using identity");
                    Mat3::IDENTITY
                };
                Box::new(move |x, y| {
                    let p = inverse * Vec3::new(x as f32, y as f32, 1.0);
                    [p.x / p.z, p.y / p.z]
                })
            }
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct RemapState {
    mapping: Option<Mapping>,
    table: Option<RemapTable>,
}

/// Worker-side state shared by all geometric filters: the current mapping
/// plus the derived device-resident table.
pub(crate) struct RemapSink {
    gpu: Gpu,
    pipeline: Arc<GpuRemapPipeline>,
    state: Mutex<RemapState>,
}

impl RemapSink {
    pub fn create(ctx: &mut ProcessingContext) -> Result<Arc<Self>> {
        let gpu_ctx = ctx.gpu_context().ok_or(Error::NoGpuContext)?;
        let pipeline = gpu_ctx.get_or_create(GpuRemapPipeline::new)?;
        let gpu = gpu_ctx.gpu().clone();

        Ok(Arc::new(Self {
            gpu,
            pipeline,
            state: Mutex::new(RemapState::default()),
        }))
    }

    fn set_mapping(&self, mapping: Mapping) {
        let mut state = self.state.lock();
        if state.mapping != Some(mapping) {
            state.mapping = Some(mapping);
            // Table dimensions are only known at run time; invalidate and
            // regenerate on the next frame.
            state.table = None;
        }
    }

    /// Executes the remap for one frame. Serialized by the worker lock, so
    /// the table cannot be swapped out mid-run by a configuration change.
    pub fn run(
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
                "remap filters require a float format, got {}",
                desc.format
            )));
        }
        assert_eq!(&desc, output_gpu.desc(), "input/output desc mismatch");

        let mapping = state.mapping.expect("worker bound without parameters");
        let stale = match &state.table {
            Some(table) => table.desc() != &desc,
            None => true,
        };
        if stale {
            state.table = Some(RemapTable::generate(
                &self.gpu,
                desc,
                mapping.source_for(desc),
            ));
        }
        let table = state.table.as_ref().expect("generated above");

        let channels = desc.format.channel_count.channel_count() as u32;
        let pipeline = self.pipeline.pipeline_for(&self.gpu, channels)?;

        let params = Params {
            width: desc.width,
            height: desc.height,
            _padding: [0; 2],
        };
        let params_buffer =
            self.gpu
                .device()
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("remap_params_buffer"),
                    contents: bytemuck::bytes_of(&params),
                    usage: wgpu::BufferUsages::UNIFORM,
                });

        let bind_group = self
            .gpu
            .device()
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("remap_bind_group"),
                layout: &self.pipeline.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: params_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: table.buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: input_gpu.read_buffer().as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: output_gpu.write_buffer().as_entire_binding(),
                    },
                ],
            });

        self.gpu.dispatch(
            "remap_pass",
            &pipeline,
            &bind_group,
            workgroups_for(desc.pixel_count() as u32),
        )
    }
}

/// Sinks for the three geometric filters only differ in how parameters
/// become a [`Mapping`].
pub(crate) struct MappedSink<P, F>
where
    F: Fn(&P) -> Mapping + Send + Sync,
{
    remap: Arc<RemapSink>,
    to_mapping: F,
    _params: std::marker::PhantomData<fn(&P)>,
}

impl<P, F> MappedSink<P, F>
where
    F: Fn(&P) -> Mapping + Send + Sync,
{
    pub fn new(remap: Arc<RemapSink>, to_mapping: F) -> Self {
        Self {
            remap,
            to_mapping,
            _params: std::marker::PhantomData,
        }
    }
}

impl<P, F> ParamSink<P> for MappedSink<P, F>
where
    P: Send + Sync,
    F: Fn(&P) -> Mapping + Send + Sync,
{
    fn apply(&self, params: &P) {
        self.remap.set_mapping((self.to_mapping)(params));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PlaneFormat;

    fn desc(width: u32, height: u32) -> ImageDesc {
        ImageDesc::new(width, height, PlaneFormat::RGB_F32)
    }

    #[test]
    fn barrel_zero_factor_is_identity() {
        let mapping = Mapping::Barrel { coefficient: 0.0 };
        let f = mapping.source_for(desc(64, 48));
        for &(x, y) in &[(0u32, 0u32), (10, 20), (63, 47), (32, 24)] {
            assert_eq!(f(x, y), [x as f32, y as f32]);
        }
    }

    #[test]
    fn barrel_positive_factor_pushes_corners_outward() {
        let mapping = Mapping::Barrel { coefficient: 0.25 };
        let f = mapping.source_for(desc(64, 64));
        let [sx, sy] = f(0, 0);
        // Corner samples from outside the frame: barrel distortion.
        assert!(sx < 0.0);
        assert!(sy < 0.0);
        // Center is a fixed point.
        assert_eq!(f(32, 32), [32.0, 32.0]);
    }

    #[test]
    fn crop_zero_margins_is_identity() {
        let mapping = Mapping::Crop {
            left: 0,
            right: 0,
            top: 0,
            bottom: 0,
        };
        let f = mapping.source_for(desc(64, 48));
        for &(x, y) in &[(0u32, 0u32), (63, 47), (17, 5)] {
            assert_eq!(f(x, y), [x as f32, y as f32]);
        }
    }

    #[test]
    fn crop_samples_only_inside_the_cropped_rect() {
        let mapping = Mapping::Crop {
            left: 8,
            right: 8,
            top: 4,
            bottom: 4,
        };
        let f = mapping.source_for(desc(64, 48));
        for y in 0..48u32 {
            for x in 0..64u32 {
                let [sx, sy] = f(x, y);
                if sx >= 0.0 {
                    assert!((8.0..=55.0).contains(&sx), "sx {} out of crop", sx);
                    assert!((4.0..=43.0).contains(&sy), "sy {} out of crop", sy);
                }
            }
        }
    }

    #[test]
    fn matrix_identity_is_identity() {
        let mapping = Mapping::Matrix {
            matrix: Mat3::IDENTITY,
        };
        let f = mapping.source_for(desc(32, 32));
        for &(x, y) in &[(0u32, 0u32), (31, 31), (7, 19)] {
            assert_eq!(f(x, y), [x as f32, y as f32]);
        }
    }

    #[test]
    fn matrix_translation_shifts_sources() {
        let matrix = Mat3::from_translation(glam::Vec2::new(3.0, -2.0));
        let mapping = Mapping::Matrix { matrix };
        let f = mapping.source_for(desc(32, 32));
        assert_eq!(f(10, 10), [7.0, 12.0]);
    }
}
