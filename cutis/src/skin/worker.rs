use std::sync::Arc;

use glam::Vec2;
use parking_lot::Mutex;
use wgpu::util::DeviceExt;

use crate::common::{Error, PlaneFormat, Result};
use crate::filters::{
    storage_entry, uniform_entry, workgroups_for, FilterCore, ParamSink, WorkerBinding,
    WORKGROUP_SIZE,
};
use crate::gpu::{Gpu, KernelCache};
use crate::image::ImageDesc;
use crate::processing_context::{GpuPipeline, ImageBuffer, ProcessingContext};
use crate::skin::{rasterize_polygon, Backend, SkinParams};

const CLASSIFY_KERNEL: &str = include_str!("classify.wgsl");
const REDUCE_KERNEL: &str = include_str!("reduce.wgsl");

const METHOD_GAUSSIAN: u32 = 0;
const METHOD_GAUSSIAN_THRESHOLD: u32 = 1;
const METHOD_BOUNDING_BOX: u32 = 2;

/// Outcome of one classification run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    /// Masked skin pixels divided by the ROI area, in `[0, 1]`.
    pub skin_ratio: f32,
    pub skin_pixels: u32,
    pub roi_area: u32,
}

/// Cached GPU pipeline for the per-pixel classification kernel.
#[derive(Debug)]
pub struct GpuClassifyPipeline {
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    kernels: KernelCache,
}

impl GpuClassifyPipeline {
    pub fn new(gpu: &Gpu) -> Result<Self> {
        let device = gpu.device();

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("classify_bind_group_layout"),
            entries: &[
                // Params uniform
                uniform_entry(0),
                // Input composite (RGB)
                storage_entry(1, true),
                // ROI mask
                storage_entry(2, true),
                // Likelihood map
                storage_entry(3, false),
                // Skin flags
                storage_entry(4, false),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("classify_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            ..Default::default()
        });

        Ok(Self {
            bind_group_layout,
            pipeline_layout,
            kernels: KernelCache::new("classify", CLASSIFY_KERNEL),
        })
    }

    fn pipeline(&self, gpu: &Gpu) -> Result<Arc<wgpu::ComputePipeline>> {
        self.kernels.get_or_compile(gpu, &self.pipeline_layout, &[])
    }
}

impl GpuPipeline for GpuClassifyPipeline {}

/// Cached GPU pipeline for the tree-reduction counter.
#[derive(Debug)]
pub struct GpuReducePipeline {
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    kernels: KernelCache,
}

impl GpuReducePipeline {
    pub fn new(gpu: &Gpu) -> Result<Self> {
        let device = gpu.device();

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("reduce_bind_group_layout"),
            entries: &[
                // Params uniform
                uniform_entry(0),
                // Source counts
                storage_entry(1, true),
                // Partial sums
                storage_entry(2, false),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("reduce_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            ..Default::default()
        });

        Ok(Self {
            bind_group_layout,
            pipeline_layout,
            kernels: KernelCache::new("reduce", REDUCE_KERNEL),
        })
    }

    fn pipeline(&self, gpu: &Gpu) -> Result<Arc<wgpu::ComputePipeline>> {
        self.kernels.get_or_compile(gpu, &self.pipeline_layout, &[])
    }
}

impl GpuPipeline for GpuReducePipeline {}

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct ClassifyParams {
    width: u32,
    height: u32,
    method: u32,
    use_mask: u32,
    threshold: f32,
    _pad: [f32; 3],
    mean: [f32; 4],
    inv_two_var: [f32; 4],
    lo: [f32; 4],
    hi: [f32; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct ReduceParams {
    len: u32,
    _pad: [u32; 3],
}

struct SkinState {
    backend: Option<Backend>,
    roi: Vec<Vec2>,
    /// Derived per-resolution buffers; rebuilt when the frame size changes.
    derived: Option<Derived>,
}

struct Derived {
    desc: ImageDesc,
    flags: wgpu::Buffer,
    /// ROI mask and its reduced pixel count; `None` until first use or
    /// after an actual vertex-list change.
    roi_mask: Option<wgpu::Buffer>,
    roi_area: Option<u32>,
    /// Ping-pong partial-sum buffers for the tree reduction.
    partials: (wgpu::Buffer, wgpu::Buffer),
}

pub(crate) struct SkinSink {
    gpu: Gpu,
    classify: Arc<GpuClassifyPipeline>,
    reduce: Arc<GpuReducePipeline>,
    /// Bound in place of the ROI mask when classifying the whole image.
    dummy_mask: wgpu::Buffer,
    state: Mutex<SkinState>,
}

impl ParamSink<SkinParams> for SkinSink {
    fn apply(&self, params: &SkinParams) {
        let mut state = self.state.lock();
        state.backend = Some(Backend::from_params(params));

        if state.roi != params.roi {
            state.roi = params.roi.clone();
            if let Some(derived) = &mut state.derived {
                derived.roi_mask = None;
                derived.roi_area = None;
            }
        }
    }
}

/// Per-execution-context classifier state.
///
/// `run` is guarded end to end by the worker lock, so a configuration
/// broadcast can never observe or replace the intermediate device buffers
/// of an in-flight classification.
pub struct SkinClassifierWorker {
    _binding: WorkerBinding<SkinParams>,
    sink: Arc<SkinSink>,
}

impl SkinClassifierWorker {
    pub(crate) fn create(
        core: Arc<FilterCore<SkinParams>>,
        ctx: &mut ProcessingContext,
    ) -> Result<Self> {
        let gpu_ctx = ctx.gpu_context().ok_or(Error::NoGpuContext)?;
        let classify = gpu_ctx.get_or_create(GpuClassifyPipeline::new)?;
        let reduce = gpu_ctx.get_or_create(GpuReducePipeline::new)?;
        let gpu = gpu_ctx.gpu().clone();

        let dummy_mask = gpu
            .device()
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("classify_dummy_mask"),
                contents: &[0u8; 4],
                usage: wgpu::BufferUsages::STORAGE,
            });

        let sink = Arc::new(SkinSink {
            gpu,
            classify,
            reduce,
            dummy_mask,
            state: Mutex::new(SkinState {
                backend: None,
                roi: Vec::new(),
                derived: None,
            }),
        });
        let binding = WorkerBinding::bind(core, sink.clone());

        Ok(Self {
            _binding: binding,
            sink,
        })
    }

    /// Classifies one composite frame.
    ///
    /// Writes the per-pixel likelihood map into `likelihood` and returns
    /// the skin ratio over the configured ROI.
    pub fn run(
        &mut self,
        ctx: &ProcessingContext,
        input: &ImageBuffer,
        likelihood: &mut ImageBuffer,
    ) -> Result<Classification> {
        self.sink.run(ctx, input, likelihood)
    }
}

impl SkinSink {
    fn run(
        &self,
        ctx: &ProcessingContext,
        input: &ImageBuffer,
        likelihood: &mut ImageBuffer,
    ) -> Result<Classification> {
        let mut state = self.state.lock();

        let input_gpu = input.make_gpu(ctx)?;
        let mut likelihood_gpu = likelihood.make_gpu_mut(ctx)?;

        let desc = *input_gpu.desc();
        if desc.format != PlaneFormat::RGB_F32 {
            return Err(Error::InvalidPlaneFormat(format!(
                "classification expects an RGB_F32 composite, got {}",
                desc.format
            )));
        }
        if likelihood_gpu.desc().format != PlaneFormat::GRAY_F32
            || likelihood_gpu.desc().width != desc.width
            || likelihood_gpu.desc().height != desc.height
        {
            return Err(Error::InvalidPlaneFormat(format!(
                "likelihood map must be GRAY_F32 of {}x{}",
                desc.width, desc.height
            )));
        }

        let backend = state
            .backend
            .expect("worker bound without parameters");

        self.ensure_derived(&mut state, desc);
        self.ensure_roi_mask(&mut state, desc)?;

        let pixel_count = desc.pixel_count() as u32;
        let derived = state.derived.as_ref().expect("ensured above");
        let roi_area = derived.roi_area.unwrap_or(pixel_count);

        // Per-pixel classification writes both the likelihood map and the
        // masked skin flags in a single pass.
        let params = classify_params(&backend, desc, derived.roi_mask.is_some());
        let params_buffer =
            self.gpu
                .device()
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("classify_params_buffer"),
                    contents: bytemuck::bytes_of(&params),
                    usage: wgpu::BufferUsages::UNIFORM,
                });

        let mask_binding = derived.roi_mask.as_ref().unwrap_or(&self.dummy_mask);

        let bind_group = self
            .gpu
            .device()
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("classify_bind_group"),
                layout: &self.classify.bind_group_layout,
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
                        resource: mask_binding.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: likelihood_gpu.write_buffer().as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: derived.flags.as_entire_binding(),
                    },
                ],
            });

        let pipeline = self.classify.pipeline(&self.gpu)?;
        self.gpu.dispatch(
            "classify_pass",
            &pipeline,
            &bind_group,
            workgroups_for(pixel_count),
        )?;

        let skin_pixels = self.reduce_count(derived, &derived.flags, pixel_count)?;

        let skin_ratio = if roi_area > 0 {
            (skin_pixels as f32 / roi_area as f32).clamp(0.0, 1.0)
        } else {
            0.0
        };

        Ok(Classification {
            skin_ratio,
            skin_pixels,
            roi_area,
        })
    }

    fn ensure_derived(&self, state: &mut SkinState, desc: ImageDesc) {
        let stale = match &state.derived {
            Some(derived) => derived.desc != desc,
            None => true,
        };
        if !stale {
            return;
        }

        let pixel_count = desc.pixel_count() as u32;
        let partial_len = pixel_count.div_ceil(WORKGROUP_SIZE).max(1);

        let flags = self.gpu.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some("classify_flags"),
            size: pixel_count as u64 * 4,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let partial = |label| {
            self.gpu.device().create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: partial_len as u64 * 4,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        };

        state.derived = Some(Derived {
            desc,
            flags,
            roi_mask: None,
            roi_area: None,
            partials: (partial("reduce_partials_a"), partial("reduce_partials_b")),
        });
    }

    /// Rasterizes and measures the ROI, only when the vertex list or the
    /// resolution actually changed since the last run.
    fn ensure_roi_mask(&self, state: &mut SkinState, desc: ImageDesc) -> Result<()> {
        let derived = state.derived.as_mut().expect("ensured above");

        if state.roi.is_empty() {
            derived.roi_mask = None;
            derived.roi_area = None;
            return Ok(());
        }
        if derived.roi_mask.is_some() {
            return Ok(());
        }

        let mask = rasterize_polygon(&state.roi, desc.width, desc.height);
        let buffer = self
            .gpu
            .device()
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("roi_mask"),
                contents: bytemuck::cast_slice(&mask),
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            });

        derived.roi_mask = Some(buffer);

        // ROI area and skin count share the same reduction primitive.
        let derived = state.derived.as_ref().expect("ensured above");
        let area = self.reduce_count(
            derived,
            derived.roi_mask.as_ref().expect("stored above"),
            desc.pixel_count() as u32,
        )?;

        let derived = state.derived.as_mut().expect("ensured above");
        derived.roi_area = Some(area);
        tracing::debug!(area, "ROI mask regenerated");

        Ok(())
    }

    /// Parallel log-step reduction of a u32 buffer to its element sum.
    fn reduce_count(&self, derived: &Derived, src: &wgpu::Buffer, len: u32) -> Result<u32> {
        let pipeline = self.reduce.pipeline(&self.gpu)?;

        let mut current_len = len;
        let mut src_buffer = src;
        let (mut dst_buffer, mut alt_buffer) = (&derived.partials.0, &derived.partials.1);

        while current_len > 1 {
            let params = ReduceParams {
                len: current_len,
                _pad: [0; 3],
            };
            let params_buffer =
                self.gpu
                    .device()
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("reduce_params_buffer"),
                        contents: bytemuck::bytes_of(&params),
                        usage: wgpu::BufferUsages::UNIFORM,
                    });

            let bind_group = self
                .gpu
                .device()
                .create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("reduce_bind_group"),
                    layout: &self.reduce.bind_group_layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: params_buffer.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: src_buffer.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: dst_buffer.as_entire_binding(),
                        },
                    ],
                });

            let groups = current_len.div_ceil(WORKGROUP_SIZE);
            self.gpu
                .dispatch("reduce_pass", &pipeline, &bind_group, (groups, 1, 1))?;

            current_len = groups;
            src_buffer = dst_buffer;
            std::mem::swap(&mut dst_buffer, &mut alt_buffer);
        }

        let bytes = self.gpu.read_buffer(src_buffer, 4)?;
        Ok(u32::from_le_bytes(bytes[..4].try_into().expect("4 bytes")))
    }
}

fn classify_params(backend: &Backend, desc: ImageDesc, use_mask: bool) -> ClassifyParams {
    let mut params = ClassifyParams {
        width: desc.width,
        height: desc.height,
        method: 0,
        use_mask: use_mask as u32,
        threshold: 0.0,
        _pad: [0.0; 3],
        mean: [0.0; 4],
        inv_two_var: [0.0; 4],
        lo: [0.0; 4],
        hi: [0.0; 4],
    };

    match *backend {
        Backend::Gaussian {
            mean,
            inv_two_var,
            threshold,
        } => {
            params.method = METHOD_GAUSSIAN;
            params.threshold = threshold;
            params.mean[..3].copy_from_slice(&mean);
            params.inv_two_var[..3].copy_from_slice(&inv_two_var);
        }
        Backend::GaussianThreshold {
            mean,
            inv_two_var,
            threshold,
        } => {
            params.method = METHOD_GAUSSIAN_THRESHOLD;
            params.threshold = threshold;
            params.mean[..3].copy_from_slice(&mean);
            params.inv_two_var[..3].copy_from_slice(&inv_two_var);
        }
        Backend::BoundingBox { lo, hi } => {
            params.method = METHOD_BOUNDING_BOX;
            params.lo[..3].copy_from_slice(&lo);
            params.hi[..3].copy_from_slice(&hi);
        }
    }

    params
}
