use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use super::Gpu;
use crate::common::Result;

/// Lazy compute-kernel cache keyed by define set.
///
/// A kernel variant is identified by its name plus the sorted list of
/// integer defines baked into the WGSL source as module constants.
/// Variants are compiled on first use and rebuilt only on cache miss.
#[derive(Debug)]
pub struct KernelCache {
    name: &'static str,
    source: &'static str,
    pipelines: Mutex<HashMap<Vec<(String, u32)>, Arc<wgpu::ComputePipeline>>>,
}

impl KernelCache {
    pub fn new(name: &'static str, source: &'static str) -> Self {
        Self {
            name,
            source,
            pipelines: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the pipeline for the given define set, compiling it on miss.
    pub fn get_or_compile(
        &self,
        gpu: &Gpu,
        layout: &wgpu::PipelineLayout,
        defines: &[(&str, u32)],
    ) -> Result<Arc<wgpu::ComputePipeline>> {
        let mut key: Vec<(String, u32)> = defines
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect();
        key.sort();

        let mut cache = self.pipelines.lock();
        if let Some(pipeline) = cache.get(&key) {
            return Ok(pipeline.clone());
        }

        tracing::debug!(kernel = self.name, ?key, "compiling kernel variant");

        let header: String = key
            .iter()
            .map(|(name, value)| format!("const {}: u32 = {}u;\n", name, value))
            .collect();
        let source = format!("{}{}", header, self.source);

        let pipeline = Arc::new(gpu.compile_kernel(self.name, &source, layout)?);
        cache.insert(key, pipeline.clone());

        Ok(pipeline)
    }
}
