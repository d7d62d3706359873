use std::any::{Any, TypeId};
use std::sync::Arc;

use hashbrown::HashMap;

use crate::common::Result;
use crate::gpu::Gpu;

/// Trait marker for GPU pipelines that can be cached.
pub trait GpuPipeline: Any + std::fmt::Debug + Send + Sync {}

/// Cache for GPU pipelines.
///
/// Lazily initializes pipelines on first use to avoid startup cost for
/// unused operations. Pipelines are stored by their TypeId and handed out
/// as shared `Arc`s so workers can keep them across threads.
#[derive(Debug)]
pub struct GpuContext {
    gpu: Gpu,
    pipelines: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl GpuContext {
    /// Creates a new pipeline cache with no pipelines initialized.
    pub fn new(gpu: Gpu) -> Self {
        Self {
            gpu,
            pipelines: HashMap::new(),
        }
    }

    /// Returns the pipeline of type T, creating it with the provided function if needed.
    pub fn get_or_create<T, F>(&mut self, create: F) -> Result<Arc<T>>
    where
        T: GpuPipeline,
        F: FnOnce(&Gpu) -> Result<T>,
    {
        let type_id = TypeId::of::<T>();

        if !self.pipelines.contains_key(&type_id) {
            let pipeline: Arc<dyn Any + Send + Sync> = Arc::new(create(&self.gpu)?);
            self.pipelines.insert(type_id, pipeline);
        }

        let pipeline = self
            .pipelines
            .get(&type_id)
            .expect("inserted above")
            .clone();

        Ok(pipeline
            .downcast::<T>()
            .ok()
            .expect("pipeline type mismatch - this is a bug"))
    }

    /// Returns a reference to the gateway.
    pub fn gpu(&self) -> &Gpu {
        &self.gpu
    }
}
