// sync-core/src/error.rs

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {

    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Unknown worker {index} (pool size: {pool_size})")]
    UnknownWorker {
        index: usize,
        pool_size: usize,
    },

    #[error("Worker {index} is not available (exited or lost)")]
    WorkerUnavailable {
        index: usize,
    },

    #[error("No available workers to address")]
    NoAvailableWorkers,

    #[error("Duplicate worker identity {identity} from {first_peer} and {second_peer}")]
    DuplicateIdentity {
        identity: u32,
        first_peer: String,
        second_peer: String,
    },

    #[error("Handshake with {peer} failed: {message}")]
    HandshakeFailed {
        peer: String,
        message: String,
    },

    #[error(
        "Pool not ready after {waited:?}: {} of {expected} workers completed handshake \
         (registered identities: {registered:?}, missing slots: {missing_slots:?})",
        registered.len()
    )]
    StartupTimeout {
        expected: usize,
        registered: Vec<u32>,
        missing_slots: Vec<usize>,
        waited: Duration,
    },

    #[error("Worker {worker} exceeded {limit} wrong samples in step {step}")]
    WrongSampleLimitExceeded {
        worker: usize,
        step: u64,
        limit: u32,
    },

    #[error("Worker {worker} lost during step {step}")]
    WorkerLost {
        worker: usize,
        step: u64,
        #[source]
        source: Box<SyncError>,
    },

    #[error("Workers {workers:?} did not finish step {step} within {timeout:?}")]
    WorkerTimeout {
        step: u64,
        workers: Vec<usize>,
        timeout: Duration,
    },

    #[error("Worker {worker} reported failure in step {step}: {message}")]
    WorkerFailed {
        worker: usize,
        step: u64,
        message: String,
    },

    #[error("Protocol violation by worker {worker}: {message}")]
    Protocol {
        worker: usize,
        message: String,
    },

    #[error("Failed to spawn worker slot {slot}: {message}")]
    Spawn {
        slot: usize,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Worker pool has been shut down")]
    PoolClosed,
}

pub type Result<T> = std::result::Result<T, SyncError>;

// Convenience constructors
impl SyncError {

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    pub fn connection_with_source(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn unknown_worker(index: usize, pool_size: usize) -> Self {
        Self::UnknownWorker { index, pool_size }
    }

    pub fn worker_lost(worker: usize, step: u64, source: SyncError) -> Self {
        Self::WorkerLost {
            worker,
            step,
            source: Box::new(source),
        }
    }

    pub fn protocol(worker: usize, message: impl Into<String>) -> Self {
        Self::Protocol {
            worker,
            message: message.into(),
        }
    }

    pub fn spawn(slot: usize, message: impl Into<String>) -> Self {
        Self::Spawn {
            slot,
            message: message.into(),
            source: None,
        }
    }

    pub fn spawn_with_source(
        slot: usize,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Spawn {
            slot,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Index of the worker this error is attributed to, if any.
    pub fn worker_index(&self) -> Option<usize> {
        match self {
            Self::UnknownWorker { index, .. } | Self::WorkerUnavailable { index } => Some(*index),
            Self::WrongSampleLimitExceeded { worker, .. }
            | Self::WorkerLost { worker, .. }
            | Self::WorkerFailed { worker, .. }
            | Self::Protocol { worker, .. } => Some(*worker),
            _ => None,
        }
    }

    /// Whether the pool is still usable for the next step after this error.
    pub fn is_step_local(&self) -> bool {
        matches!(
            self,
            Self::WrongSampleLimitExceeded { .. } | Self::WorkerFailed { .. }
        )
    }
}
