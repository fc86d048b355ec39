// sync-core/src/lifecycle/spawn.rs

//! How worker processes come into existence.
//!
//! The supervisor never starts workers itself; it asks a [`WorkerSpawner`]
//! once per slot and keeps whatever comes back so it can reap it at
//! shutdown. Any async closure `Fn(WorkerSlot) -> Future<Output =
//! Result<SpawnedWorker>>` is a spawner, which keeps in-process test workers
//! and subprocess launchers behind the same seam.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Result, SyncError};

/// Everything a new worker needs to dial back in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSlot {
    /// Position in spawn order, `0..worker_count`.
    pub slot: usize,
    /// Identity the worker must announce during handshake.
    pub identity: u32,
    /// Coordinator address to connect to.
    pub address: SocketAddr,
}

impl WorkerSlot {
    /// Slot whose identity equals its slot number.
    pub fn new(slot: usize, address: SocketAddr) -> Self {
        Self {
            slot,
            identity: slot as u32,
            address,
        }
    }
}

/// Handle to a started worker, kept for reaping at shutdown.
#[derive(Debug)]
pub enum SpawnedWorker {
    Process(Child),
    Task(JoinHandle<()>),
    /// Started elsewhere; nothing to reap.
    External,
}

impl SpawnedWorker {
    /// Wait until `deadline` for the worker to finish on its own, then kill
    /// or abort it. Returns true if it had to be forced.
    pub async fn terminate(self, slot: usize, deadline: Instant) -> bool {
        match self {
            SpawnedWorker::Process(mut child) => {
                match tokio::time::timeout_at(deadline, child.wait()).await {
                    Ok(Ok(status)) => {
                        tracing::debug!("worker slot {} exited with {}", slot, status);
                        false
                    }
                    Ok(Err(e)) => {
                        tracing::warn!("failed to reap worker slot {}: {}", slot, e);
                        false
                    }
                    Err(_) => {
                        tracing::warn!("killing worker slot {} (pid {:?})", slot, child.id());
                        if let Err(e) = child.kill().await {
                            tracing::warn!("failed to kill worker slot {}: {}", slot, e);
                        }
                        true
                    }
                }
            }
            SpawnedWorker::Task(mut handle) => {
                match tokio::time::timeout_at(deadline, &mut handle).await {
                    Ok(_) => false,
                    Err(_) => {
                        tracing::warn!("aborting in-process worker slot {}", slot);
                        handle.abort();
                        true
                    }
                }
            }
            SpawnedWorker::External => false,
        }
    }
}

#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    /// Start the worker for `slot`. Must not wait for its handshake.
    async fn spawn(&self, slot: WorkerSlot) -> Result<SpawnedWorker>;
}

#[async_trait]
impl<F, Fut> WorkerSpawner for F
where
    F: Fn(WorkerSlot) -> Fut + Send + Sync,
    Fut: Future<Output = Result<SpawnedWorker>> + Send + 'static,
{
    async fn spawn(&self, slot: WorkerSlot) -> Result<SpawnedWorker> {
        (self)(slot).await
    }
}

/// Launches one subprocess per slot.
///
/// Arguments may contain `{address}`, `{identity}` and `{slot}`
/// placeholders, replaced per slot. Children get a null stdin and are
/// killed if their handle is dropped.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, template: impl Into<String>) -> Self {
        self.args.push(template.into());
        self
    }

    pub fn args<I, S>(mut self, templates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(templates.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Arguments for `slot` with every placeholder substituted.
    pub fn render_args(&self, slot: &WorkerSlot) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{address}", &slot.address.to_string())
                    .replace("{identity}", &slot.identity.to_string())
                    .replace("{slot}", &slot.slot.to_string())
            })
            .collect()
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, slot: WorkerSlot) -> Result<SpawnedWorker> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.render_args(&slot));
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            SyncError::spawn_with_source(
                slot.slot,
                format!("failed to launch {}", self.program.display()),
                e,
            )
        })?;

        tracing::info!(
            "spawned worker slot {} (identity {}, pid {})",
            slot.slot,
            slot.identity,
            child.id().unwrap_or(0)
        );
        Ok(SpawnedWorker::Process(child))
    }
}
