use std::sync::Arc;

use crate::common::Result;
use crate::filters::remap::{Mapping, MappedSink, RemapSink};
use crate::filters::{Filter, FilterCore, FilterWorker, ParamSink, WorkerBinding};
use crate::processing_context::{ImageBuffer, ProcessingContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CropParams {
    left: u32,
    right: u32,
    top: u32,
    bottom: u32,
}

/// Border-crop filter.
///
/// Four margins define a sub-rectangle; the output shows that rectangle
/// scaled by the largest uniform factor that fits back into the original
/// frame, centered. All-zero margins are the identity mapping.
pub struct CropFilter {
    core: Arc<FilterCore<CropParams>>,
    width: u32,
    height: u32,
}

impl CropFilter {
    /// Creates a crop filter for images of the given fixed resolution.
    /// Margin clamping depends on it.
    pub fn new(width: u32, height: u32) -> Self {
        assert!(width > 4 && height > 4, "image too small to crop");
        Self {
            core: FilterCore::new(
                "crop",
                CropParams {
                    left: 0,
                    right: 0,
                    top: 0,
                    bottom: 0,
                },
            ),
            width,
            height,
        }
    }

    pub fn margins(&self) -> (u32, u32, u32, u32) {
        let p = self.core.params();
        (p.left, p.right, p.top, p.bottom)
    }

    /// Sets the four border margins. Each margin is clamped to at most half
    /// the respective dimension minus 2.
    pub fn set_margins(&self, left: u32, right: u32, top: u32, bottom: u32) {
        let max_x = self.width / 2 - 2;
        let max_y = self.height / 2 - 2;
        let params = CropParams {
            left: left.min(max_x),
            right: right.min(max_x),
            top: top.min(max_y),
            bottom: bottom.min(max_y),
        };
        self.core.set_params(params);
    }
}

impl Filter for CropFilter {
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
        let sink: Arc<dyn ParamSink<CropParams>> =
            Arc::new(MappedSink::new(remap.clone(), |p: &CropParams| {
                Mapping::Crop {
                    left: p.left,
                    right: p.right,
                    top: p.top,
                    bottom: p.bottom,
                }
            }));
        let binding = WorkerBinding::bind(self.core.clone(), sink);

        Ok(Box::new(CropWorker {
            _binding: binding,
            remap,
        }))
    }
}

struct CropWorker {
    _binding: WorkerBinding<CropParams>,
    remap: Arc<RemapSink>,
}

impl FilterWorker for CropWorker {
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
    fn margins_are_clamped_to_half_dimension_minus_two() {
        let filter = CropFilter::new(64, 48);
        filter.set_margins(1000, 1000, 1000, 1000);
        assert_eq!(filter.margins(), (30, 30, 22, 22));
    }

    #[test]
    fn in_range_margins_are_stored_verbatim() {
        let filter = CropFilter::new(64, 48);
        filter.set_margins(3, 5, 7, 9);
        assert_eq!(filter.margins(), (3, 5, 7, 9));
    }
}
