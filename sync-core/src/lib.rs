// sync-core/src/lib.rs

//! Step-synchronized worker pool over TCP.
//!
//! A coordinator accepts a fixed number of worker connections, orders them
//! by the identity each worker announces, and then runs "steps": every
//! addressed worker receives a share of the step's units and the step
//! completes only when all of them have answered. Results come back in a
//! deterministic `(step, worker, unit)` order no matter how the network
//! interleaves them.

pub mod config;
pub mod error;

// Re-export commonly used types for convenience
pub use config::{CoordinatorConfig, HandshakeFailurePolicy, PartitionStrategy};
pub use error::{Result, SyncError};

pub mod framing;
pub mod protocol;
pub use protocol::{CoordinatorMessage, StepRequest, WorkerMessage};

pub mod connection;
pub mod handshake;
pub mod pool;
pub use connection::ConnectionHandle;
pub use handshake::HandshakeRegistry;
pub use pool::{Readiness, WorkerEvent, WorkerEvents, WorkerPool};

pub mod partition;
pub mod step;
pub use partition::{ContiguousPartitioner, RoundRobinPartitioner, WorkPartitioner, WorkerAssignment};
pub use step::{PendingRequestQueue, Sample, StepBatch, StepCoordinator, StepState};

pub mod lifecycle;
pub use lifecycle::{
    LifecycleSupervisor, ProcessSpawner, ShutdownSummary, SpawnedWorker, WorkerSlot, WorkerSpawner,
};

pub mod retry;
pub mod worker;
pub use retry::RetryConfig;
pub use worker::{StepHandler, UnitOutcome, WorkerClient, WorkerStats};
