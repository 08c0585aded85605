//! Execution strategies for batched kernels.
//!
//! A batched kernel maps a contiguous range of units to one output row per unit. The
//! single strategy runs it once over the whole batch. The parallel strategy splits the
//! batch into `workers` equal partitions of `batch / workers` units, runs every
//! partition on its own pool thread, reassembles the partitions in order, and finally
//! runs the `batch % workers` remainder through the single path and appends it last.

use crate::types::AccelerationKind;
use ndarray::{Array2, ArrayView2, Axis, ShapeError, concatenate};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use std::ops::Range;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccelerationError {
    #[error("{0} acceleration is not supported.")]
    Unsupported(String),
    #[error("Parallel acceleration needs at least one worker.")]
    ZeroWorkers,
    #[error("Failed to build the worker pool: {0}")]
    PoolBuild(#[from] ThreadPoolBuildError),
    #[error("Partition outputs could not be reassembled: {0}")]
    Reassembly(#[from] ShapeError),
}

/// A fixed pool of workers that owns its threads for its whole lifetime.
pub struct WorkerPool {
    workers: usize,
    pool: ThreadPool,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self, AccelerationError> {
        if workers == 0 {
            return Err(AccelerationError::ZeroWorkers);
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|index| format!("fedgwas-worker-{index}"))
            .build()?;
        Ok(Self { workers, pool })
    }

    /// Sizes the pool to the available processor cores.
    pub fn with_available_cores() -> Result<Self, AccelerationError> {
        Self::new(num_cpus::get().max(1))
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

pub enum Accelerator {
    Single,
    Parallel(WorkerPool),
}

impl std::fmt::Debug for Accelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single => f.write_str("Accelerator::Single"),
            Self::Parallel(pool) => write!(f, "Accelerator::Parallel({} workers)", pool.workers),
        }
    }
}

impl Accelerator {
    /// Resolves a configured mode. `workers` of `None` sizes a parallel pool to the cores.
    pub fn from_kind(kind: AccelerationKind, workers: Option<usize>) -> Result<Self, AccelerationError> {
        match kind {
            AccelerationKind::Single => Ok(Self::Single),
            AccelerationKind::Parallel => {
                let pool = match workers {
                    Some(count) => WorkerPool::new(count)?,
                    None => WorkerPool::with_available_cores()?,
                };
                Ok(Self::Parallel(pool))
            }
        }
    }

    /// Resolves a mode by name, failing on anything other than `single` or `parallel`.
    pub fn from_name(name: &str) -> Result<Self, AccelerationError> {
        let kind = name
            .parse::<AccelerationKind>()
            .map_err(|_| AccelerationError::Unsupported(name.to_string()))?;
        Self::from_kind(kind, None)
    }

    pub fn kind(&self) -> AccelerationKind {
        match self {
            Self::Single => AccelerationKind::Single,
            Self::Parallel(_) => AccelerationKind::Parallel,
        }
    }

    /// Runs `kernel` over units `0..batch` and returns the rows in original unit order.
    ///
    /// The kernel must return exactly one row per unit in the range it is given.
    pub fn map_batch<F>(&self, batch: usize, kernel: F) -> Result<Array2<f64>, AccelerationError>
    where
        F: Fn(Range<usize>) -> Array2<f64> + Sync,
    {
        let pool = match self {
            Self::Single => return Ok(kernel(0..batch)),
            Self::Parallel(pool) => pool,
        };

        let workers = pool.workers;
        let minibatch = batch / workers;
        if minibatch == 0 {
            return Ok(kernel(0..batch));
        }

        let split = minibatch * workers;
        let mut parts: Vec<Array2<f64>> = pool.pool.install(|| {
            (0..workers)
                .into_par_iter()
                .map(|worker| kernel(worker * minibatch..(worker + 1) * minibatch))
                .collect()
        });

        if split < batch {
            log::debug!(
                "Parallel map: {} units over {} workers, {} remainder units on the single path",
                split,
                workers,
                batch - split
            );
            parts.push(kernel(split..batch));
        }

        let views: Vec<ArrayView2<f64>> = parts.iter().map(|part| part.view()).collect();
        Ok(concatenate(Axis(0), &views)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    fn unit_rows(range: Range<usize>) -> Array2<f64> {
        let units = Array1::from_iter(range.map(|u| u as f64));
        Array2::from_shape_fn((units.len(), 3), |(i, j)| units[i] * 10.0 + j as f64)
    }

    #[test]
    fn parallel_map_preserves_order_with_a_remainder() {
        let single = Accelerator::Single.map_batch(11, unit_rows).unwrap();
        let parallel = Accelerator::Parallel(WorkerPool::new(4).unwrap())
            .map_batch(11, unit_rows)
            .unwrap();
        assert_eq!(single, parallel);
        assert_eq!(parallel.column(0).to_vec(), (0..11).map(|u| u as f64 * 10.0).collect::<Vec<_>>());
    }

    #[test]
    fn batches_smaller_than_the_pool_use_the_single_path() {
        let accel = Accelerator::Parallel(WorkerPool::new(8).unwrap());
        assert_eq!(accel.map_batch(3, unit_rows).unwrap(), unit_rows(0..3));
        assert_eq!(accel.map_batch(0, unit_rows).unwrap().nrows(), 0);
    }

    #[test]
    fn unknown_modes_and_empty_pools_are_rejected() {
        assert!(matches!(
            Accelerator::from_name("gpu"),
            Err(AccelerationError::Unsupported(name)) if name == "gpu"
        ));
        assert!(matches!(WorkerPool::new(0), Err(AccelerationError::ZeroWorkers)));
        assert_eq!(
            Accelerator::from_name("single").unwrap().kind(),
            AccelerationKind::Single
        );
        let parallel = Accelerator::from_kind(AccelerationKind::Parallel, Some(2)).unwrap();
        assert_eq!(parallel.kind(), AccelerationKind::Parallel);
    }
}
