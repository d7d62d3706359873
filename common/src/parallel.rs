//! Row-parallel traversal over contiguous 2D byte regions.

use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;

/// Multiplier for number of chunks relative to CPU threads.
/// Using 2x threads provides good load balancing when some chunks finish faster.
const CHUNKS_PER_THREAD: usize = 2;

/// Outcome of a failed row task: either the closure's error, or a payload
/// captured from a panicking worker thread.
#[derive(Debug)]
pub enum RowTaskFailure<E> {
    Err(E),
    Panic(Box<dyn std::any::Any + Send + 'static>),
}

impl<E> RowTaskFailure<E> {
    /// Unwraps the error value, resuming the unwind if the task panicked.
    pub fn into_error(self) -> E {
        match self {
            RowTaskFailure::Err(e) => e,
            RowTaskFailure::Panic(payload) => std::panic::resume_unwind(payload),
        }
    }
}

struct RowBase(*mut u8);

// The atomic cursor hands each row index to exactly one worker, so the
// row slices derived from this pointer never alias.
unsafe impl Sync for RowBase {}

/// Visits every row of a packed 2D byte region, splitting rows across
/// `max(available_parallelism, 1)` worker threads.
///
/// Workers pull row indices from a shared atomic cursor, so each row is
/// visited by exactly one worker with no ordering guarantee between rows.
/// All workers are waited for before the first failure (closure error or
/// worker panic) is reported, which lets callers release any underlying
/// mapping before acting on the failure.
///
/// # Panics
/// Panics if `bytes.len()` is not a multiple of `row_bytes`.
pub fn try_for_each_row<E, F>(
    bytes: &mut [u8],
    row_bytes: usize,
    f: F,
) -> Result<(), RowTaskFailure<E>>
where
    E: Send,
    F: Fn(usize, &mut [u8]) -> Result<(), E> + Sync,
{
    assert!(row_bytes > 0, "row_bytes must be > 0");
    assert!(
        bytes.len() % row_bytes == 0,
        "byte region is not a whole number of rows"
    );

    let height = bytes.len() / row_bytes;
    if height == 0 {
        return Ok(());
    }

    let worker_count = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(1);

    let next_row = AtomicUsize::new(0);
    let base = RowBase(bytes.as_mut_ptr());

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..worker_count)
            .map(|_| {
                scope.spawn(|| -> Result<(), E> {
                    loop {
                        let y = next_row.fetch_add(1, Ordering::Relaxed);
                        if y >= height {
                            return Ok(());
                        }
                        // SAFETY: `y` was claimed exactly once from the cursor,
                        // so this row slice is not aliased by any other worker.
                        let row = unsafe {
                            std::slice::from_raw_parts_mut(base.0.add(y * row_bytes), row_bytes)
                        };
                        f(y, row)?;
                    }
                })
            })
            .collect();

        let mut failure = None;
        for handle in handles {
            let outcome = match handle.join() {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(RowTaskFailure::Err(e)),
                Err(payload) => Some(RowTaskFailure::Panic(payload)),
            };
            if failure.is_none() {
                failure = outcome;
            }
        }

        match failure {
            None => Ok(()),
            Some(f) => Err(f),
        }
    })
}

/// Infallible variant of [`try_for_each_row`]. Worker panics are re-raised
/// after all workers have finished.
pub fn for_each_row<F>(bytes: &mut [u8], row_bytes: usize, f: F)
where
    F: Fn(usize, &mut [u8]) + Sync,
{
    let result: Result<(), RowTaskFailure<std::convert::Infallible>> =
        try_for_each_row(bytes, row_bytes, |y, row| {
            f(y, row);
            Ok(())
        });

    if let Err(failure) = result {
        match failure {
            RowTaskFailure::Err(e) => match e {},
            RowTaskFailure::Panic(payload) => std::panic::resume_unwind(payload),
        }
    }
}

/// Apply a function to each index in parallel, modifying the slice in place.
///
/// # Arguments
/// * `data` - Mutable slice to fill with values
/// * `f` - Function that takes an index and returns a value
pub fn parallel_chunked<T, F>(data: &mut [T], f: F)
where
    T: Send + Sync,
    F: Fn(usize) -> T + Sync + Send,
{
    if data.is_empty() {
        return;
    }

    let num_chunks = rayon::current_num_threads() * CHUNKS_PER_THREAD;
    let chunk_size = (data.len() / num_chunks).max(1);

    data.par_chunks_mut(chunk_size)
        .enumerate()
        .for_each(|(chunk_idx, chunk)| {
            let start_idx = chunk_idx * chunk_size;
            for (i, val) in chunk.iter_mut().enumerate() {
                *val = f(start_idx + i);
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[test]
    fn each_row_visited_exactly_once() {
        let mut bytes = vec![0u8; 64 * 16];
        let visited = Mutex::new(Vec::new());

        for_each_row(&mut bytes, 16, |y, row| {
            assert_eq!(row.len(), 16);
            row.fill(y as u8);
            visited.lock().unwrap().push(y);
        });

        let visited = visited.into_inner().unwrap();
        assert_eq!(visited.len(), 64);
        let unique: HashSet<_> = visited.iter().copied().collect();
        assert_eq!(unique.len(), 64);

        for (y, row) in bytes.chunks(16).enumerate() {
            assert!(row.iter().all(|&b| b == y as u8));
        }
    }

    #[test]
    fn error_reported_after_all_rows_settle() {
        let mut bytes = vec![0u8; 8 * 4];

        let result = try_for_each_row(&mut bytes, 4, |y, _row| {
            if y == 3 {
                Err("row 3 failed")
            } else {
                Ok(())
            }
        });

        match result {
            Err(RowTaskFailure::Err(e)) => assert_eq!(e, "row 3 failed"),
            other => panic!("expected closure error, got {:?}", other.is_ok()),
        }
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn worker_panic_is_reraised() {
        let mut bytes = vec![0u8; 4 * 4];
        for_each_row(&mut bytes, 4, |y, _row| {
            if y == 2 {
                panic!("boom");
            }
        });
    }

    #[test]
    fn empty_region_is_a_noop() {
        let mut bytes: Vec<u8> = Vec::new();
        for_each_row(&mut bytes, 16, |_, _| panic!("must not be called"));
    }

    #[test]
    fn test_parallel_chunked_f32() {
        let mut result = vec![0.0f32; 10];
        parallel_chunked(&mut result, |i| i as f32 * 2.0);
        assert_eq!(result.len(), 10);
        for (i, &v) in result.iter().enumerate() {
            assert!((v - i as f32 * 2.0).abs() < f32::EPSILON);
        }
    }

    #[test]
    fn test_parallel_chunked_large() {
        let len = 100_000;
        let mut result = vec![0u32; len];
        parallel_chunked(&mut result, |i| i as u32);
        for (i, &v) in result.iter().enumerate() {
            assert_eq!(v, i as u32);
        }
    }
}
