// sync-core/src/step/mod.rs

//! Step execution: dispatch, collection and ordered aggregation.

mod coordinator;
mod pending;

pub use coordinator::StepCoordinator;
pub use pending::{PendingRequest, PendingRequestQueue};

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

/// Lifecycle of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Idle,
    Dispatched,
    Collecting,
    Aggregating,
    /// The last step failed; the next request starts a fresh step.
    Failed,
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepState::Idle => "idle",
            StepState::Dispatched => "dispatched",
            StepState::Collecting => "collecting",
            StepState::Aggregating => "aggregating",
            StepState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One produced unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub step_index: u64,
    pub worker_index: usize,
    pub unit: u32,
    pub payload: Bytes,
}

/// Aggregated output of one step.
///
/// `samples` is ordered by `(step_index, worker_index, unit)` regardless of
/// the order in which results arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepBatch {
    pub step_index: u64,
    /// Units requested by the caller.
    pub requested: usize,
    pub samples: Vec<Sample>,
    /// Workers that sent EXIT before finishing their units.
    pub exited_workers: Vec<usize>,
    /// Bad samples reported per worker (and retried) during the step.
    pub wrong_samples: BTreeMap<usize, u32>,
}

impl StepBatch {
    /// True iff every requested unit produced a sample.
    pub fn is_complete(&self) -> bool {
        self.samples.len() == self.requested && self.exited_workers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn total_wrong_samples(&self) -> u32 {
        self.wrong_samples.values().sum()
    }

    pub fn payloads(&self) -> impl Iterator<Item = &Bytes> + '_ {
        self.samples.iter().map(|s| &s.payload)
    }
}
