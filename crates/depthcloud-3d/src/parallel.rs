use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons a kernel launch is refused before any work item runs.
#[derive(Error, Debug, PartialEq)]
pub enum ParallelError {
    /// Rayon could not create the dedicated pool.
    #[error("rayon pool: {0}")]
    BuildError(String),

    /// `Fixed` was given a thread count of zero.
    #[error("a fixed pool needs at least one thread, got {0}")]
    InvalidThreadCount(usize),

    /// `Chunks` was given a chunk length of zero.
    #[error("chunks need at least one work item each, got {0}")]
    InvalidChunkLen(usize),
}

/// Controls how a flat kernel launch is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Every work item is its own task on the global rayon pool.
    #[default]
    ParallelElements,

    /// Use the global Rayon thread pool, handing out at least `n` consecutive
    /// work items per task.
    ///
    /// Passing the image width keeps each task on one row, which is often more
    /// cache-friendly than [`ExecutionStrategy::ParallelElements`].
    Chunks(usize),

    /// Plain loop on the calling thread, in index order.
    Serial,

    /// A pool of exactly `n` threads, built for this launch and dropped after it.
    /// Building the pool costs far more than a small launch.
    Fixed(usize),
}

/// Runs `f(i)` exactly once for every work item `i` in `0..n`.
///
/// Returns only after every work item has completed, so state shared with the
/// workers (atomics, views) can be read back as soon as the call returns.
///
/// A zero thread count or chunk length, or a pool that fails to build, is
/// reported as a [`ParallelError`] and no work item runs.
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use depthcloud_3d::parallel::{launch_general_kernel, ExecutionStrategy};
///
/// let sum = AtomicUsize::new(0);
/// launch_general_kernel(10, ExecutionStrategy::ParallelElements, |i| {
///     sum.fetch_add(i, Ordering::Relaxed);
/// })
/// .unwrap();
/// assert_eq!(sum.into_inner(), 45);
/// ```
pub fn launch_general_kernel<F>(
    n: usize,
    strategy: ExecutionStrategy,
    f: F,
) -> Result<(), ParallelError>
where
    F: Fn(usize) + Send + Sync,
{
    match strategy {
        ExecutionStrategy::Serial => {
            (0..n).for_each(f);
        }
        ExecutionStrategy::ParallelElements => {
            (0..n).into_par_iter().for_each(f);
        }
        ExecutionStrategy::Chunks(len) => {
            if len == 0 {
                return Err(ParallelError::InvalidChunkLen(len));
            }
            (0..n).into_par_iter().with_min_len(len).for_each(f);
        }
        ExecutionStrategy::Fixed(threads) => {
            if threads == 0 {
                return Err(ParallelError::InvalidThreadCount(threads));
            }
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| ParallelError::BuildError(e.to_string()))?;

            pool.install(|| {
                (0..n).into_par_iter().for_each(f);
            });
        }
    }
    Ok(())
}
