use std::sync::Arc;

use crate::common::Result;
use crate::filters::remap::{Mapping, MappedSink, RemapSink};
use crate::filters::{Filter, FilterCore, FilterWorker, ParamSink, WorkerBinding};
use crate::processing_context::{ImageBuffer, ProcessingContext};

const MIN_FACTOR: i32 = -100;
const MAX_FACTOR: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BarrelParams {
    factor: i32,
}

/// Radial barrel/pincushion distortion correction.
///
/// The signed integer factor maps to a continuous distortion coefficient
/// with an asymmetric slope; factor 0 is the identity mapping.
pub struct BarrelFilter {
    core: Arc<FilterCore<BarrelParams>>,
}

fn coefficient(factor: i32) -> f32 {
    if factor >= 0 {
        factor as f32 * 0.005
    } else {
        factor as f32 * 0.002
    }
}

impl BarrelFilter {
    pub fn new() -> Self {
        Self {
            core: FilterCore::new("barrel", BarrelParams { factor: 0 }),
        }
    }

    pub fn factor(&self) -> i32 {
        self.core.params().factor
    }

    /// Sets the distortion factor, clamped to `[-100, 100]`.
    pub fn set_factor(&self, factor: i32) {
        let factor = factor.clamp(MIN_FACTOR, MAX_FACTOR);
        self.core.mutate(|p| p.factor = factor);
    }
}

impl Default for BarrelFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for BarrelFilter {
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
        let remap = RemapSink::create(ctx)?;
        let sink: Arc<dyn ParamSink<BarrelParams>> =
            Arc::new(MappedSink::new(remap.clone(), |p: &BarrelParams| {
                Mapping::Barrel {
                    coefficient: coefficient(p.factor),
                }
            }));
        let binding = WorkerBinding::bind(self.core.clone(), sink);

        Ok(Box::new(BarrelWorker {
            _binding: binding,
            remap,
        }))
    }
}

struct BarrelWorker {
    _binding: WorkerBinding<BarrelParams>,
    remap: Arc<RemapSink>,
}

impl FilterWorker for BarrelWorker {
    fn run(
        &mut self,
        ctx: &ProcessingContext,
        input: &ImageBuffer,
        output: &mut ImageBuffer,
    ) -> Result<()> {
        self.remap.run(ctx, input, output)
    }
}
