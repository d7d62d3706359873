use std::sync::Arc;

use crate::common::Result;
use crate::filters::{Filter, FilterWorker};
use crate::processing_context::{ImageBuffer, ProcessingContext};

/// An insertion-ordered list of filters.
///
/// The order is the pipeline topology and is fixed at construction; only
/// the per-filter enabled flags change at runtime.
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Arc<dyn Filter>>) -> Self {
        Self { filters }
    }

    pub fn filters(&self) -> &[Arc<dyn Filter>] {
        &self.filters
    }

    /// Derives the per-thread execution state for this chain.
    pub fn create_worker(&self, ctx: &mut ProcessingContext) -> Result<ChainWorker> {
        let stages = self
            .filters
            .iter()
            .map(|filter| {
                filter
                    .create_worker(ctx)
                    .map(|worker| (filter.clone(), worker))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ChainWorker {
            stages,
            scratch: None,
        })
    }
}

/// Per-thread chain executor with a two-buffer ping-pong scratch pair.
pub struct ChainWorker {
    stages: Vec<(Arc<dyn Filter>, Box<dyn FilterWorker>)>,
    scratch: Option<[ImageBuffer; 2]>,
}

impl ChainWorker {
    /// Runs the enabled subset of the chain, in insertion order.
    ///
    /// With no filter enabled the input is copied to the output verbatim.
    /// Otherwise intermediate results alternate between the two scratch
    /// buffers and the last enabled filter writes directly into the
    /// caller's output, avoiding a trailing copy.
    pub fn run(
        &mut self,
        ctx: &ProcessingContext,
        input: &ImageBuffer,
        output: &mut ImageBuffer,
    ) -> Result<()> {
        let desc = *input.desc();
        assert_eq!(&desc, output.desc(), "input/output desc mismatch");

        let enabled: Vec<usize> = self
            .stages
            .iter()
            .enumerate()
            .filter(|(_, (filter, _))| filter.is_enabled())
            .map(|(index, _)| index)
            .collect();

        if enabled.is_empty() {
            return copy_verbatim(ctx, input, output);
        }

        let scratch_stale = match &self.scratch {
            Some([a, _]) => a.desc() != &desc,
            None => true,
        };
        if scratch_stale {
            self.scratch = Some([ImageBuffer::new_empty(desc), ImageBuffer::new_empty(desc)]);
        }

        let Self { stages, scratch } = self;
        let [ping, pong] = scratch.as_mut().expect("allocated above");
        let mut ping: &mut ImageBuffer = ping;
        let mut pong: &mut ImageBuffer = pong;

        let last = enabled.len() - 1;
        for (step, &index) in enabled.iter().enumerate() {
            let worker = &mut stages[index].1;
            match (step, step == last) {
                (0, true) => worker.run(ctx, input, output)?,
                (0, false) => worker.run(ctx, input, ping)?,
                (_, true) => worker.run(ctx, ping, output)?,
                (_, false) => {
                    worker.run(ctx, ping, pong)?;
                    std::mem::swap(&mut ping, &mut pong);
                }
            }
        }

        Ok(())
    }
}

/// Bit-identical copy for the no-filters-enabled case, staying on the
/// device when the data is already there.
fn copy_verbatim(
    ctx: &ProcessingContext,
    input: &ImageBuffer,
    output: &mut ImageBuffer,
) -> Result<()> {
    if ctx.has_gpu() {
        let src = input.make_gpu(ctx)?;
        let mut dst = output.make_gpu_mut(ctx)?;
        dst.copy_from(ctx.require_gpu()?, &src)
    } else {
        let src = input.make_cpu(ctx)?;
        let mut dst = output.make_cpu_mut(ctx)?;
        dst.bytes_mut().copy_from_slice(src.bytes());
        Ok(())
    }
}
