mod gpu_context;
mod image_buffer;
#[cfg(test)]
mod tests;

pub use gpu_context::{GpuContext, GpuPipeline};
pub use image_buffer::{ImageBuffer, Storage};

use crate::common::{Error, Result};
use crate::gpu::Gpu;

/// Processing context that manages GPU resources and cached pipelines.
///
/// This is the main entry point for running filter and classifier work.
/// Each pipeline thread owns one; the underlying [`Gpu`] gateway is shared
/// by cloning it into every context.
#[derive(Debug)]
pub struct ProcessingContext {
    gpu_context: Option<GpuContext>,
}

impl ProcessingContext {
    /// Creates a new ProcessingContext, attempting to initialize GPU.
    /// Falls back to CPU-only if GPU is unavailable.
    pub fn new() -> Self {
        match Gpu::new() {
            Ok(gpu) => Self {
                gpu_context: Some(GpuContext::new(gpu)),
            },
            Err(e) => {
                tracing::warn!("GPU initialization failed, falling back to CPU: {}", e);
                Self { gpu_context: None }
            }
        }
    }

    /// Creates a CPU-only ProcessingContext (no GPU).
    pub fn cpu_only() -> Self {
        Self { gpu_context: None }
    }

    /// Creates a ProcessingContext sharing an existing gateway.
    pub fn with_gpu(gpu: Gpu) -> Self {
        Self {
            gpu_context: Some(GpuContext::new(gpu)),
        }
    }

    /// Returns true if GPU is available.
    pub fn has_gpu(&self) -> bool {
        self.gpu_context.is_some()
    }

    /// Returns a reference to the gateway if available.
    pub fn gpu(&self) -> Option<&Gpu> {
        self.gpu_context.as_ref().map(|p| p.gpu())
    }

    /// Returns the gateway or fails with [`Error::NoGpuContext`].
    pub fn require_gpu(&self) -> Result<&Gpu> {
        self.gpu().ok_or(Error::NoGpuContext)
    }

    /// Returns a mutable reference to the GPU processing context.
    /// Returns None if no GPU is available.
    pub fn gpu_context(&mut self) -> Option<&mut GpuContext> {
        self.gpu_context.as_mut()
    }
}

impl Default for ProcessingContext {
    fn default() -> Self {
        Self::new()
    }
}
