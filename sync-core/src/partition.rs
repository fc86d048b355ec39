// sync-core/src/partition.rs

//! Strategies for spreading the units of one step over the addressed workers.
//!
//! Every strategy is a pure function of `(batch_size, workers)`, so the same
//! request always produces the same assignment.

use crate::config::PartitionStrategy;

/// Units of one step assigned to one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerAssignment {
    /// Pool index of the worker.
    pub worker_index: usize,
    /// Assigned unit indices, ascending.
    pub units: Vec<u32>,
}

impl WorkerAssignment {
    pub fn new(worker_index: usize) -> Self {
        Self {
            worker_index,
            units: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Trait for unit partitioning strategies.
pub trait WorkPartitioner: Send + Sync {
    /// Split `batch_size` units over `workers` (pool indices, ascending).
    ///
    /// Returns one assignment per worker, in the order of `workers`. Workers
    /// may receive no units when `batch_size < workers.len()`.
    fn partition(&self, batch_size: usize, workers: &[usize]) -> Vec<WorkerAssignment>;

    /// Get the strategy type.
    fn strategy(&self) -> PartitionStrategy;
}

/// Consecutive blocks of units per worker.
///
/// Units are divided evenly; the first `batch_size % workers` workers get one
/// extra unit.
#[derive(Debug, Default)]
pub struct ContiguousPartitioner;

impl WorkPartitioner for ContiguousPartitioner {
    fn partition(&self, batch_size: usize, workers: &[usize]) -> Vec<WorkerAssignment> {
        if workers.is_empty() {
            return Vec::new();
        }

        let per_worker = batch_size / workers.len();
        let remainder = batch_size % workers.len();

        let mut start = 0u32;
        workers
            .iter()
            .enumerate()
            .map(|(i, &worker_index)| {
                let extra = usize::from(i < remainder);
                let count = (per_worker + extra) as u32;
                let mut assignment = WorkerAssignment::new(worker_index);
                assignment.units.extend(start..start + count);
                start += count;
                assignment
            })
            .collect()
    }

    fn strategy(&self) -> PartitionStrategy {
        PartitionStrategy::Contiguous
    }
}

/// Unit `u` goes to the `u % W`-th addressed worker.
#[derive(Debug, Default)]
pub struct RoundRobinPartitioner;

impl WorkPartitioner for RoundRobinPartitioner {
    fn partition(&self, batch_size: usize, workers: &[usize]) -> Vec<WorkerAssignment> {
        let mut assignments: Vec<_> = workers.iter().map(|&w| WorkerAssignment::new(w)).collect();
        if assignments.is_empty() {
            return assignments;
        }
        let n = assignments.len();
        for unit in 0..batch_size {
            assignments[unit % n].units.push(unit as u32);
        }
        assignments
    }

    fn strategy(&self) -> PartitionStrategy {
        PartitionStrategy::RoundRobin
    }
}

/// Build the partitioner for a configured strategy.
pub fn partitioner_for(strategy: PartitionStrategy) -> Box<dyn WorkPartitioner> {
    match strategy {
        PartitionStrategy::Contiguous => Box::new(ContiguousPartitioner),
        PartitionStrategy::RoundRobin => Box::new(RoundRobinPartitioner),
    }
}
