use std::sync::Arc;

use glam::Mat3;

use crate::common::Result;
use crate::filters::remap::{Mapping, MappedSink, RemapSink};
use crate::filters::{Filter, FilterCore, FilterWorker, ParamSink, WorkerBinding};
use crate::processing_context::{ImageBuffer, ProcessingContext};

#[derive(Debug, Clone, Copy, PartialEq)]
struct TransformationParams {
    matrix: Mat3,
}

/// Arbitrary 3x3 homogeneous image transformation.
///
/// The remap table is regenerated on every matrix change; the identity
/// matrix is the identity mapping. Singular matrices fall back to identity
/// with a warning.
pub struct TransformationFilter {
    core: Arc<FilterCore<TransformationParams>>,
}

impl TransformationFilter {
    pub fn new() -> Self {
        Self {
            core: FilterCore::new(
                "transformation",
                TransformationParams {
                    matrix: Mat3::IDENTITY,
                },
            ),
        }
    }

    pub fn matrix(&self) -> Mat3 {
        self.core.params().matrix
    }

    pub fn set_matrix(&self, matrix: Mat3) {
        self.core.mutate(|p| p.matrix = matrix);
    }
}

impl Default for TransformationFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for TransformationFilter {
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
        let sink: Arc<dyn ParamSink<TransformationParams>> = Arc::new(MappedSink::new(
            remap.clone(),
            |p: &TransformationParams| Mapping::Matrix { matrix: p.matrix },
        ));
        let binding = WorkerBinding::bind(self.core.clone(), sink);

        Ok(Box::new(TransformationWorker {
            _binding: binding,
            remap,
        }))
    }
}

struct TransformationWorker {
    _binding: WorkerBinding<TransformationParams>,
    remap: Arc<RemapSink>,
}

impl FilterWorker for TransformationWorker {
    fn run(
        &mut self,
        ctx: &ProcessingContext,
        input: &ImageBuffer,
        output: &mut ImageBuffer,
    ) -> Result<()> {
        self.remap.run(ctx, input, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matrix_is_identity() {
        let filter = TransformationFilter::new();
        assert_eq!(filter.matrix(), Mat3::IDENTITY);
    }

    #[test]
    fn matrix_is_stored_verbatim() {
        let filter = TransformationFilter::new();
        let m = Mat3::from_scale_angle_translation(
            glam::Vec2::new(2.0, 2.0),
            0.5,
            glam::Vec2::new(3.0, 4.0),
        );
        filter.set_matrix(m);
        assert_eq!(filter.matrix(), m);
    }
}
