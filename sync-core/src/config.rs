// sync-core/src/config.rs

//! Configuration for the worker-coordination layer.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SyncError};

/// Largest frame body accepted on either side of a connection (64 MB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

// Top-level coordinator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub server: ServerConfig,
    pub pool: PoolConfig,
    pub step: StepConfig,
    pub worker: WorkerConfig,
}

/// What the handshake registry does when a connection drops before it has
/// sent its identity frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeFailurePolicy {
    /// Log the failure and keep the slot open for another connection.
    #[default]
    WaitForReplacement,
    /// Abort startup on the first failed handshake.
    FailStartup,
}

/// How the units of one step are spread over the addressed workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// Consecutive blocks of units per worker.
    #[default]
    Contiguous,
    /// Unit `u` goes to worker `u % W`.
    RoundRobin,
}

// Listener and wire options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    // Address to bind the coordinator listener to.
    pub address: String,
    // Port to bind to (0 picks an ephemeral port).
    pub port: u16,
    /// Upper bound on handshakes in flight at once.
    pub max_connections: usize,
    /// Deadline (milliseconds) for a connection to send its identity frame.
    pub handshake_timeout_ms: u64,
    /// Behavior when a connection drops before sending its identity.
    pub on_handshake_failure: HandshakeFailurePolicy,
    /// Largest frame body accepted from a peer, in bytes.
    pub max_frame_bytes: usize,
}

// Pool sizing and lifecycle deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    // Number of workers expected to register.
    pub worker_count: usize,
    // Time (milliseconds) allowed for the pool to become ready.
    pub startup_timeout_ms: u64,
    // Time (milliseconds) workers get to acknowledge EXIT on shutdown.
    pub shutdown_grace_ms: u64,
}

// Step dispatch options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    // Units of work requested per step.
    pub batch_size: usize,
    // Bad samples a single worker may report within one step.
    pub max_wrong_samples_per_step: u32,
    // Per-step deadline in milliseconds (0 disables it).
    pub step_timeout_ms: u64,
    /// Unit partitioning policy.
    pub partition: PartitionStrategy,
    // Capacity of the reader-task event channel.
    pub event_buffer: usize,
}

/// Options used by the worker-side client when dialing back in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of connection attempts before giving up.
    pub connect_retries: u32,
    /// Initial delay (milliseconds) between attempts.
    pub retry_delay_ms: u64,
    /// Maximum delay (milliseconds) between attempts.
    pub max_retry_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 0,
            max_connections: 64,
            handshake_timeout_ms: 10_000,
            on_handshake_failure: HandshakeFailurePolicy::WaitForReplacement,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            startup_timeout_ms: 30_000,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            max_wrong_samples_per_step: 3,
            step_timeout_ms: 0,
            partition: PartitionStrategy::Contiguous,
            event_buffer: 1024,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            connect_retries: 10,
            retry_delay_ms: 50,
            max_retry_delay_ms: 2_000,
        }
    }
}

impl ServerConfig {
    /// Resolve `address:port` into a socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.address, self.port)
            .parse()
            .map_err(|e| {
                SyncError::config_with_source(
                    format!("invalid listen address '{}:{}'", self.address, self.port),
                    e,
                )
            })
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl PoolConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Clamp `worker_count` to the parallelism available on this host.
    #[must_use]
    pub fn clamped_to_cpus(mut self) -> Self {
        let cpus = num_cpus::get().max(1);
        if self.worker_count > cpus {
            tracing::warn!(
                "worker_count {} exceeds available parallelism, clamping to {}",
                self.worker_count,
                cpus
            );
            self.worker_count = cpus;
        }
        self
    }
}

impl StepConfig {
    /// Per-step deadline, or `None` when steps may block indefinitely.
    pub fn step_timeout(&self) -> Option<Duration> {
        (self.step_timeout_ms > 0).then(|| Duration::from_millis(self.step_timeout_ms))
    }
}

impl FromStr for CoordinatorConfig {
    type Err = SyncError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| SyncError::config_with_source("failed to parse TOML config", e))
    }
}

impl CoordinatorConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed, or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::config_with_source(
                format!("failed to read config file '{}'", path.display()),
                e,
            )
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Variables are prefixed with `SYNC_` followed by section and field,
    // e.g. `SYNC_POOL_WORKER_COUNT` or `SYNC_STEP_BATCH_SIZE`. Values that
    // fail to parse are ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Server overrides
        if let Ok(val) = std::env::var("SYNC_SERVER_ADDRESS") {
            self.server.address = val;
        }
        if let Ok(val) = std::env::var("SYNC_SERVER_PORT") {
            if let Ok(v) = val.parse() {
                self.server.port = v;
            }
        }
        if let Ok(val) = std::env::var("SYNC_SERVER_MAX_CONNECTIONS") {
            if let Ok(v) = val.parse() {
                self.server.max_connections = v;
            }
        }
        if let Ok(val) = std::env::var("SYNC_SERVER_HANDSHAKE_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.server.handshake_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("SYNC_SERVER_MAX_FRAME_BYTES") {
            if let Ok(v) = val.parse() {
                self.server.max_frame_bytes = v;
            }
        }
        if let Ok(val) = std::env::var("SYNC_SERVER_ON_HANDSHAKE_FAILURE") {
            match val.to_lowercase().as_str() {
                "wait_for_replacement" => {
                    self.server.on_handshake_failure = HandshakeFailurePolicy::WaitForReplacement
                }
                "fail_startup" => {
                    self.server.on_handshake_failure = HandshakeFailurePolicy::FailStartup
                }
                _ => {} // ignore invalid values
            }
        }

        // Pool overrides
        if let Ok(val) = std::env::var("SYNC_POOL_WORKER_COUNT") {
            if let Ok(v) = val.parse() {
                self.pool.worker_count = v;
            }
        }
        if let Ok(val) = std::env::var("SYNC_POOL_STARTUP_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.pool.startup_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("SYNC_POOL_SHUTDOWN_GRACE_MS") {
            if let Ok(v) = val.parse() {
                self.pool.shutdown_grace_ms = v;
            }
        }

        // Step overrides
        if let Ok(val) = std::env::var("SYNC_STEP_BATCH_SIZE") {
            if let Ok(v) = val.parse() {
                self.step.batch_size = v;
            }
        }
        if let Ok(val) = std::env::var("SYNC_STEP_MAX_WRONG_SAMPLES_PER_STEP") {
            if let Ok(v) = val.parse() {
                self.step.max_wrong_samples_per_step = v;
            }
        }
        if let Ok(val) = std::env::var("SYNC_STEP_STEP_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.step.step_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("SYNC_STEP_EVENT_BUFFER") {
            if let Ok(v) = val.parse() {
                self.step.event_buffer = v;
            }
        }
        if let Ok(val) = std::env::var("SYNC_STEP_PARTITION") {
            match val.to_lowercase().as_str() {
                "contiguous" => self.step.partition = PartitionStrategy::Contiguous,
                "round_robin" | "round-robin" => {
                    self.step.partition = PartitionStrategy::RoundRobin
                }
                _ => {}
            }
        }

        // Worker overrides
        if let Ok(val) = std::env::var("SYNC_WORKER_CONNECT_RETRIES") {
            if let Ok(v) = val.parse() {
                self.worker.connect_retries = v;
            }
        }
        if let Ok(val) = std::env::var("SYNC_WORKER_RETRY_DELAY_MS") {
            if let Ok(v) = val.parse() {
                self.worker.retry_delay_ms = v;
            }
        }
        if let Ok(val) = std::env::var("SYNC_WORKER_MAX_RETRY_DELAY_MS") {
            if let Ok(v) = val.parse() {
                self.worker.max_retry_delay_ms = v;
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        // Server validation
        self.server.socket_addr()?;
        if self.server.max_connections == 0 {
            return Err(SyncError::config(
                "server.max_connections must be greater than 0",
            ));
        }
        if self.server.handshake_timeout_ms == 0 {
            return Err(SyncError::config(
                "server.handshake_timeout_ms must be greater than 0",
            ));
        }
        if self.server.max_frame_bytes < 16 {
            return Err(SyncError::config(
                "server.max_frame_bytes must be at least 16",
            ));
        }

        // Pool validation
        if self.pool.worker_count == 0 {
            return Err(SyncError::config("pool.worker_count must be greater than 0"));
        }
        if self.pool.worker_count > u32::MAX as usize {
            return Err(SyncError::config("pool.worker_count is too large"));
        }
        if self.pool.startup_timeout_ms == 0 {
            return Err(SyncError::config(
                "pool.startup_timeout_ms must be greater than 0",
            ));
        }

        // Step validation
        if self.step.batch_size == 0 {
            return Err(SyncError::config("step.batch_size must be greater than 0"));
        }
        if self.step.batch_size > u32::MAX as usize {
            return Err(SyncError::config("step.batch_size is too large"));
        }
        if self.step.max_wrong_samples_per_step == 0 {
            return Err(SyncError::config(
                "step.max_wrong_samples_per_step must be at least 1",
            ));
        }
        if self.step.event_buffer == 0 {
            return Err(SyncError::config("step.event_buffer must be greater than 0"));
        }

        Ok(())
    }
}
