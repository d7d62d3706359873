//! Fixed-capacity pool of pre-allocated result frames.
//!
//! A published [`Frame`] is a thin reference-counted handle to a pooled
//! slot. Copying a handle touches one atomic; the last handle to go away
//! returns the slot to the pool's free list, never to the allocator.

use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::common::{PlaneFormat, Result};
use crate::image::{Image, ImageDesc};

/// The full payload of one completed pipeline iteration.
#[derive(Debug)]
pub struct FrameData {
    pub sequence: u64,
    pub skin_ratio: f32,
    /// Raw 16-bit camera planes.
    pub dark: Image,
    pub channel0: Image,
    pub channel1: Image,
    pub channel2: Image,
    /// Calibrated, filtered composite.
    pub composite: Image,
    /// Per-pixel skin likelihood map.
    pub likelihood: Image,
}

impl FrameData {
    fn allocate(width: u32, height: u32) -> Result<Self> {
        let raw = ImageDesc::new(width, height, PlaneFormat::GRAY_U16);
        let composite = ImageDesc::new(width, height, PlaneFormat::RGB_F32);
        let likelihood = ImageDesc::new(width, height, PlaneFormat::GRAY_F32);

        Ok(Self {
            sequence: 0,
            skin_ratio: 0.0,
            dark: Image::new_empty(raw)?,
            channel0: Image::new_empty(raw)?,
            channel1: Image::new_empty(raw)?,
            channel2: Image::new_empty(raw)?,
            composite: Image::new_empty(composite)?,
            likelihood: Image::new_empty(likelihood)?,
        })
    }
}

struct PoolInner {
    slots: Vec<RwLock<FrameData>>,
    /// Side-table of per-slot reference counts.
    refcounts: Vec<AtomicUsize>,
    free: Mutex<Vec<usize>>,
}

impl PoolInner {
    fn release(&self, slot: usize) {
        if self.refcounts[slot].fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            self.free.lock().push(slot);
        }
    }
}

/// Pre-allocated pool of frame slots for cross-thread publication.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl FramePool {
    /// Allocates `capacity` slots for frames of the given resolution.
    pub fn new(capacity: usize, width: u32, height: u32) -> Result<Self> {
        assert!(capacity > 0, "pool capacity must be positive");

        let slots = (0..capacity)
            .map(|_| Ok(RwLock::new(FrameData::allocate(width, height)?)))
            .collect::<Result<Vec<_>>>()?;
        let refcounts = (0..capacity).map(|_| AtomicUsize::new(0)).collect();
        let free = Mutex::new((0..capacity).rev().collect());

        Ok(Self {
            inner: Arc::new(PoolInner {
                slots,
                refcounts,
                free,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }

    /// Number of slots currently available for acquisition.
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Takes a free slot for writing, or `None` when the pool is exhausted
    /// (all slots still referenced by live frames).
    pub fn acquire(&self) -> Option<FrameWriter> {
        let slot = self.inner.free.lock().pop()?;

        let previous = self.inner.refcounts[slot].swap(1, Ordering::AcqRel);
        debug_assert_eq!(previous, 0, "acquired a slot with live references");

        Some(FrameWriter {
            handle: Handle {
                pool: self.inner.clone(),
                slot,
            },
        })
    }
}

/// Owns one reference to a slot; dropping the last one frees the slot.
struct Handle {
    pool: Arc<PoolInner>,
    slot: usize,
}

impl Handle {
    fn clone_ref(&self) -> Handle {
        self.pool.refcounts[self.slot].fetch_add(1, Ordering::Relaxed);
        Handle {
            pool: self.pool.clone(),
            slot: self.slot,
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.pool.release(self.slot);
    }
}

/// Exclusive write access to a pooled slot before publication.
pub struct FrameWriter {
    handle: Handle,
}

impl FrameWriter {
    /// Mutable access to the slot contents. Exclusive by construction:
    /// the writer is the only handle to this slot.
    pub fn data_mut(&mut self) -> RwLockWriteGuard<'_, FrameData> {
        self.handle.pool.slots[self.handle.slot].write()
    }

    /// Publishes the slot as an immutable frame.
    pub fn publish(self) -> Frame {
        Frame {
            handle: self.handle,
        }
    }
}

/// Immutable, cheaply copyable handle to a published pooled frame.
///
/// Never mutated after publication; concurrent clones and drops across
/// threads are race-free via the slot's atomic reference count.
pub struct Frame {
    handle: Handle,
}

impl Frame {
    /// Read access to the frame payload.
    pub fn data(&self) -> RwLockReadGuard<'_, FrameData> {
        self.handle.pool.slots[self.handle.slot].read()
    }

    pub fn sequence(&self) -> u64 {
        self.data().sequence
    }

    pub fn skin_ratio(&self) -> f32 {
        self.data().skin_ratio
    }
}

impl Clone for Frame {
    fn clone(&self) -> Self {
        Frame {
            handle: self.handle.clone_ref(),
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("slot", &self.handle.slot)
            .field("sequence", &self.data().sequence)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_publish_release_cycle() {
        let pool = FramePool::new(2, 8, 8).unwrap();
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.available(), 2);

        let mut writer = pool.acquire().unwrap();
        assert_eq!(pool.available(), 1);

        writer.data_mut().skin_ratio = 0.75;
        writer.data_mut().sequence = 42;

        let frame = writer.publish();
        assert_eq!(frame.skin_ratio(), 0.75);
        assert_eq!(frame.sequence(), 42);
        assert_eq!(pool.available(), 1);

        drop(frame);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn slot_returns_exactly_once_after_last_handle() {
        let pool = FramePool::new(1, 4, 4).unwrap();

        let writer = pool.acquire().unwrap();
        let frame = writer.publish();

        let copies: Vec<Frame> = (0..10).map(|_| frame.clone()).collect();
        assert_eq!(pool.available(), 0);

        drop(frame);
        assert_eq!(pool.available(), 0);

        for copy in copies {
            assert_eq!(pool.available(), 0);
            drop(copy);
        }
        // Dropping the final copy above returned the slot.
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn exhausted_pool_yields_none() {
        let pool = FramePool::new(1, 4, 4).unwrap();

        let held = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());

        drop(held);
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn writer_drop_without_publish_frees_the_slot() {
        let pool = FramePool::new(1, 4, 4).unwrap();

        let writer = pool.acquire().unwrap();
        drop(writer);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn concurrent_clone_and_drop_is_race_free() {
        let pool = FramePool::new(1, 4, 4).unwrap();
        let frame = pool.acquire().unwrap().publish();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let frame = frame.clone();
                scope.spawn(move || {
                    for _ in 0..1000 {
                        let copy = frame.clone();
                        assert_eq!(copy.sequence(), 0);
                        drop(copy);
                    }
                });
            }
        });

        drop(frame);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn planes_have_the_configured_resolution() {
        let pool = FramePool::new(1, 16, 12).unwrap();
        let writer = pool.acquire().unwrap();
        let frame = writer.publish();

        let data = frame.data();
        assert_eq!(data.dark.desc().width, 16);
        assert_eq!(data.dark.desc().height, 12);
        assert_eq!(data.dark.desc().format, PlaneFormat::GRAY_U16);
        assert_eq!(data.composite.desc().format, PlaneFormat::RGB_F32);
        assert_eq!(data.likelihood.desc().format, PlaneFormat::GRAY_F32);
    }
}
