use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::common::{Error, Result};
use crate::pipeline::source::PlaneSet;

struct GateState {
    pending: Option<PlaneSet>,
    error: Option<Error>,
    closed: bool,
    spares: Vec<PlaneSet>,
}

/// Producer-to-pipeline frame handoff.
///
/// The producer publishes plane sets (or a captured error); consumers wait
/// with a timeout. A recorded producer error is re-raised on the consumer
/// thread at its next poll and always takes precedence over an available
/// frame, so a consumer can never trust a stale availability flag past a
/// failure. Spent plane sets cycle back through a spare list to keep the
/// handoff allocation-free at frame rate.
pub(crate) struct FrameGate {
    state: Mutex<GateState>,
    condvar: Condvar,
}

impl FrameGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                pending: None,
                error: None,
                closed: false,
                spares: Vec::new(),
            }),
            condvar: Condvar::new(),
        }
    }

    /// Publishes the next plane set, replacing any unconsumed one.
    pub fn publish(&self, planes: PlaneSet) {
        let mut state = self.state.lock();
        if let Some(stale) = state.pending.replace(planes) {
            // The consumer fell behind; recycle the frame it never took.
            state.spares.push(stale);
        }
        self.condvar.notify_one();
    }

    /// Records a producer-side failure for the next consumer poll.
    pub fn fail(&self, error: Error) {
        let mut state = self.state.lock();
        state.error = Some(error);
        self.condvar.notify_all();
    }

    /// Closes the gate; blocked and future consumers get `PipelineClosed`.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.condvar.notify_all();
    }

    /// Waits for the next plane set.
    ///
    /// Checks the error flag before the availability flag, re-raising any
    /// producer error here on the consumer thread. A bare expiry yields
    /// [`Error::FrameTimeout`].
    pub fn take(&self, timeout: Duration) -> Result<PlaneSet> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        loop {
            if let Some(error) = state.error.take() {
                return Err(error);
            }
            if let Some(planes) = state.pending.take() {
                return Ok(planes);
            }
            if state.closed {
                return Err(Error::PipelineClosed);
            }

            if self.condvar.wait_until(&mut state, deadline).timed_out() {
                if let Some(error) = state.error.take() {
                    return Err(error);
                }
                if let Some(planes) = state.pending.take() {
                    return Ok(planes);
                }
                return Err(Error::FrameTimeout);
            }
        }
    }

    /// Returns a spent plane set for reuse by the producer.
    pub fn recycle(&self, planes: PlaneSet) {
        self.state.lock().spares.push(planes);
    }

    /// Takes a recycled plane set, if any.
    pub fn take_spare(&self) -> Option<PlaneSet> {
        self.state.lock().spares.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    const SHORT: Duration = Duration::from_millis(50);

    #[test]
    fn timeout_without_data_is_a_timing_error() {
        let gate = FrameGate::new();
        let result = gate.take(Duration::from_millis(10));
        assert!(matches!(result, Err(Error::FrameTimeout)));
    }

    #[test]
    fn published_planes_are_taken() {
        let gate = FrameGate::new();
        gate.publish(PlaneSet::allocate(4, 4).unwrap());

        let planes = gate.take(SHORT).unwrap();
        assert_eq!(planes.desc().width, 4);
    }

    #[test]
    fn producer_error_is_rethrown_at_the_next_poll() {
        let gate = FrameGate::new();
        gate.fail(Error::Gpu("producer exploded".to_string()));

        let result = gate.take(SHORT);
        assert!(matches!(result, Err(Error::Gpu(_))));

        // The error is consumed; a further poll times out instead.
        let result = gate.take(Duration::from_millis(10));
        assert!(matches!(result, Err(Error::FrameTimeout)));
    }

    #[test]
    fn error_takes_precedence_over_available_data() {
        let gate = FrameGate::new();
        gate.publish(PlaneSet::allocate(4, 4).unwrap());
        gate.fail(Error::FrameTimeout);

        assert!(matches!(gate.take(SHORT), Err(Error::FrameTimeout)));
        // The data is still there once the error is drained.
        assert!(gate.take(SHORT).is_ok());
    }

    #[test]
    fn close_wakes_blocked_consumers() {
        let gate = Arc::new(FrameGate::new());

        let waiter = {
            let gate = gate.clone();
            std::thread::spawn(move || gate.take(Duration::from_secs(5)))
        };

        std::thread::sleep(Duration::from_millis(20));
        gate.close();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(Error::PipelineClosed)));
    }

    #[test]
    fn cross_thread_publish_wakes_consumer() {
        let gate = Arc::new(FrameGate::new());

        let producer = {
            let gate = gate.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                gate.publish(PlaneSet::allocate(4, 4).unwrap());
            })
        };

        let planes = gate.take(Duration::from_secs(5)).unwrap();
        assert_eq!(planes.desc().width, 4);
        producer.join().unwrap();
    }

    #[test]
    fn unconsumed_frames_are_recycled_not_leaked() {
        let gate = FrameGate::new();
        gate.publish(PlaneSet::allocate(4, 4).unwrap());
        gate.publish(PlaneSet::allocate(4, 4).unwrap());

        // The first publish was displaced into the spare list.
        assert!(gate.take_spare().is_some());
        assert!(gate.take_spare().is_none());
        assert!(gate.take(SHORT).is_ok());
    }
}
