// sync-core/src/lifecycle/mod.rs

//! Startup and shutdown ordering for a worker pool.
//!
//! Startup binds the handshake registry, spawns one worker per slot and
//! waits (without polling) for the pool to fill, bounded by
//! `pool.startup_timeout_ms`. Shutdown asks every worker to exit, waits a
//! grace period, force-closes whatever is left and reaps spawned workers.

mod spawn;

pub use spawn::{ProcessSpawner, SpawnedWorker, WorkerSlot, WorkerSpawner};

use std::net::SocketAddr;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;

use crate::config::CoordinatorConfig;
use crate::error::{Result, SyncError};
use crate::handshake::HandshakeRegistry;
use crate::pool::Readiness;
use crate::step::{StepBatch, StepCoordinator};

/// What happened to each worker during shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownSummary {
    /// Workers that answered EXIT or closed their side within the grace period.
    pub acknowledged: Vec<usize>,
    /// Workers still connected when the grace period ran out.
    pub forced: Vec<usize>,
    /// Workers whose connection had already failed.
    pub lost: Vec<usize>,
}

impl ShutdownSummary {
    pub fn is_clean(&self) -> bool {
        self.forced.is_empty() && self.lost.is_empty()
    }
}

pub struct LifecycleSupervisor {
    coordinator: StepCoordinator,
    local_addr: SocketAddr,
    readiness: Readiness,
    spawned: Vec<(usize, SpawnedWorker)>,
    shutdown_grace: Duration,
    shut_down: bool,
}

impl LifecycleSupervisor {
    /// Bind, spawn `pool.worker_count` workers and wait for all of them to
    /// complete handshake.
    pub async fn start<S>(config: &CoordinatorConfig, spawner: &S) -> Result<Self>
    where
        S: WorkerSpawner + ?Sized,
    {
        config.validate()?;
        let expected = config.pool.worker_count;
        let startup_timeout = config.pool.startup_timeout();
        let deadline = Instant::now() + startup_timeout;

        let registry = HandshakeRegistry::bind(&config.server, expected).await?;
        let local_addr = registry.local_addr();
        let readiness = registry.readiness();
        let mut accept = tokio::spawn(registry.accept_all());

        let mut slots = Vec::with_capacity(expected);
        let mut spawned = Vec::with_capacity(expected);
        for n in 0..expected {
            let slot = WorkerSlot::new(n, local_addr);
            match spawner.spawn(slot).await {
                Ok(worker) => {
                    slots.push(slot);
                    spawned.push((n, worker));
                }
                Err(e) => {
                    tracing::error!("aborting startup: {}", e);
                    accept.abort();
                    reap(&mut spawned, Instant::now()).await;
                    return Err(e);
                }
            }
        }

        // Readiness flips as the last identity registers; the accept task
        // then only has to freeze the pool.
        let joined = tokio::select! {
            joined = &mut accept => Some(joined),
            ready = tokio::time::timeout_at(deadline, readiness.wait_ready()) => match ready {
                Ok(()) => Some((&mut accept).await),
                Err(_) => None,
            },
        };

        let pool = match joined {
            Some(Ok(Ok(pool))) => pool,
            Some(Ok(Err(e))) => {
                reap(&mut spawned, Instant::now()).await;
                return Err(e);
            }
            Some(Err(e)) => {
                reap(&mut spawned, Instant::now()).await;
                return Err(SyncError::connection(format!("handshake task failed: {}", e)));
            }
            None => {
                accept.abort();
                let registered = readiness.registered_identities();
                let missing_slots = slots
                    .iter()
                    .filter(|s| !registered.contains(&s.identity))
                    .map(|s| s.slot)
                    .collect();
                reap(&mut spawned, Instant::now()).await;
                return Err(SyncError::StartupTimeout {
                    expected,
                    registered,
                    missing_slots,
                    waited: startup_timeout,
                });
            }
        };

        tracing::info!("worker pool ready: {} workers on {}", pool.len(), local_addr);

        Ok(Self {
            coordinator: StepCoordinator::new(pool, &config.step),
            local_addr,
            readiness,
            spawned,
            shutdown_grace: config.pool.shutdown_grace(),
            shut_down: false,
        })
    }

    pub fn coordinator(&self) -> &StepCoordinator {
        &self.coordinator
    }

    pub fn coordinator_mut(&mut self) -> &mut StepCoordinator {
        &mut self.coordinator
    }

    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Run one step over every available worker.
    pub async fn run_step(&mut self, batch_size: usize) -> Result<StepBatch> {
        if self.shut_down {
            return Err(SyncError::PoolClosed);
        }
        self.coordinator.run_step(batch_size).await
    }

    /// Shut down with the configured grace period.
    pub async fn shutdown(&mut self) -> ShutdownSummary {
        self.shutdown_with_grace(self.shutdown_grace).await
    }

    /// Safe to call repeatedly; later calls return an empty summary.
    pub async fn shutdown_with_grace(&mut self, grace: Duration) -> ShutdownSummary {
        if self.shut_down {
            tracing::debug!("shutdown already completed");
            return ShutdownSummary::default();
        }
        self.shut_down = true;

        let summary = self.coordinator.shutdown(grace).await;
        reap(&mut self.spawned, Instant::now() + grace).await;

        tracing::info!(
            "pool shut down: {} acknowledged, {} forced, {} lost",
            summary.acknowledged.len(),
            summary.forced.len(),
            summary.lost.len()
        );
        summary
    }
}

impl Drop for LifecycleSupervisor {
    fn drop(&mut self) {
        // Processes are kill_on_drop; in-process tasks need an explicit abort.
        for (_, worker) in &self.spawned {
            if let SpawnedWorker::Task(handle) = worker {
                handle.abort();
            }
        }
    }
}

/// Terminate every spawned worker concurrently against one shared deadline.
async fn reap(spawned: &mut Vec<(usize, SpawnedWorker)>, deadline: Instant) {
    let outcomes = join_all(
        spawned
            .drain(..)
            .map(|(slot, worker)| worker.terminate(slot, deadline)),
    )
    .await;
    let forced = outcomes.into_iter().filter(|forced| *forced).count();
    if forced > 0 {
        tracing::warn!("{} spawned worker(s) had to be killed", forced);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::retry::RetryConfig;
    use crate::worker::{StepHandler, UnitOutcome, WorkerClient};
    use async_trait::async_trait;
    use bytes::Bytes;

    struct Echo;

    #[async_trait]
    impl StepHandler for Echo {
        async fn process(&mut self, _step_index: u64, unit: u32) -> UnitOutcome {
            UnitOutcome::Sample(Bytes::copy_from_slice(&unit.to_be_bytes()))
        }
    }

    fn config(workers: usize) -> CoordinatorConfig {
        let mut config = CoordinatorConfig::default();
        config.pool.worker_count = workers;
        config.pool.startup_timeout_ms = 5_000;
        config.pool.shutdown_grace_ms = 1_000;
        config
    }

    async fn in_process(slot: WorkerSlot) -> Result<SpawnedWorker> {
        Ok(SpawnedWorker::Task(tokio::spawn(async move {
            let address = slot.address.to_string();
            match WorkerClient::connect(&address, slot.identity, &RetryConfig::default()).await {
                Ok(client) => {
                    if let Err(e) = client.run(&mut Echo).await {
                        tracing::warn!("test worker {} failed: {}", slot.identity, e);
                    }
                }
                Err(e) => tracing::warn!("test worker {} could not connect: {}", slot.identity, e),
            }
        })))
    }

    #[tokio::test]
    async fn test_start_step_shutdown() {
        let mut supervisor = LifecycleSupervisor::start(&config(2), &in_process).await.unwrap();
        assert!(supervisor.readiness().is_ready());
        assert!(supervisor.coordinator().pool().all_ready());

        let batch = supervisor.run_step(4).await.unwrap();
        assert!(batch.is_complete());

        let summary = supervisor.shutdown().await;
        assert_eq!(summary.acknowledged, vec![0, 1]);
        assert!(summary.is_clean());
        assert_eq!(supervisor.shutdown().await, ShutdownSummary::default());
        assert!(matches!(supervisor.run_step(1).await, Err(SyncError::PoolClosed)));
    }

    #[tokio::test]
    async fn test_spawn_failure_aborts_startup() {
        let spawner = |slot: WorkerSlot| async move {
            if slot.slot == 1 {
                Err(SyncError::spawn(slot.slot, "out of workers"))
            } else {
                in_process(slot).await
            }
        };
        let err = LifecycleSupervisor::start(&config(3), &spawner).await.err().unwrap();
        assert!(matches!(err, SyncError::Spawn { slot: 1, .. }));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut bad = config(1);
        bad.step.max_wrong_samples_per_step = 0;
        let err = LifecycleSupervisor::start(&bad, &in_process).await.err().unwrap();
        assert!(matches!(err, SyncError::Config { .. }));
    }

    #[tokio::test]
    async fn test_startup_returns_on_readiness_not_deadline() {
        let mut slow = config(2);
        slow.pool.startup_timeout_ms = 30_000;
        let started = Instant::now();
        let mut supervisor = LifecycleSupervisor::start(&slow, &in_process).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(supervisor.readiness().registered_count(), 2);
        supervisor.shutdown().await;

        // A registry failure surfaces before the deadline too.
        let twins = |slot: WorkerSlot| {
            in_process(WorkerSlot {
                identity: 0,
                ..slot
            })
        };
        let started = Instant::now();
        let err = LifecycleSupervisor::start(&slow, &twins).await.err().unwrap();
        assert!(matches!(err, SyncError::DuplicateIdentity { identity: 0, .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
