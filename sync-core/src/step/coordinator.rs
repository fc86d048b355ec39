// sync-core/src/step/coordinator.rs

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use super::pending::PendingRequestQueue;
use super::{Sample, StepBatch, StepState};
use crate::config::StepConfig;
use crate::error::{Result, SyncError};
use crate::lifecycle::ShutdownSummary;
use crate::partition::{partitioner_for, WorkPartitioner};
use crate::pool::{WorkerEvent, WorkerEvents, WorkerPool};
use crate::protocol::{CoordinatorMessage, StepRequest, WorkerMessage};

/// Drives synchronized steps over a [`WorkerPool`].
///
/// Steps run strictly one after another: `run_step` takes `&mut self` and
/// does not return until every addressed worker has reached a terminal
/// signal or the step has failed.
pub struct StepCoordinator {
    pool: WorkerPool,
    events: WorkerEvents,
    partitioner: Box<dyn WorkPartitioner>,
    max_wrong_samples: u32,
    step_timeout: Option<Duration>,
    next_step: u64,
    state: StepState,
    pending: PendingRequestQueue,
    /// Worker whose STEP_REQUEST is being written right now.
    sending: Option<usize>,
}

/// Results gathered while a step is collecting.
struct Collector {
    step_index: u64,
    requested: usize,
    samples: BTreeMap<(usize, u32), Bytes>,
    exited: Vec<usize>,
    wrong: BTreeMap<usize, u32>,
}

impl Collector {
    fn new(step_index: u64, requested: usize) -> Self {
        Self {
            step_index,
            requested,
            samples: BTreeMap::new(),
            exited: Vec::new(),
            wrong: BTreeMap::new(),
        }
    }

    /// Count one bad sample for `worker`, returning the new total.
    fn record_wrong(&mut self, worker: usize) -> u32 {
        let count = self.wrong.entry(worker).or_insert(0);
        *count += 1;
        *count
    }

    fn finish(mut self) -> StepBatch {
        self.exited.sort_unstable();
        let step_index = self.step_index;
        StepBatch {
            step_index,
            requested: self.requested,
            // BTreeMap order is (worker_index, unit).
            samples: self
                .samples
                .into_iter()
                .map(|((worker_index, unit), payload)| Sample {
                    step_index,
                    worker_index,
                    unit,
                    payload,
                })
                .collect(),
            exited_workers: self.exited,
            wrong_samples: self.wrong,
        }
    }
}

impl StepCoordinator {
    /// Take ownership of the pool and start one reader task per worker.
    pub fn new(mut pool: WorkerPool, config: &StepConfig) -> Self {
        let events = pool.take_events(config.event_buffer);
        Self {
            pool,
            events,
            partitioner: partitioner_for(config.partition),
            max_wrong_samples: config.max_wrong_samples_per_step,
            step_timeout: config.step_timeout(),
            next_step: 0,
            state: StepState::Idle,
            pending: PendingRequestQueue::new(),
            sending: None,
        }
    }

    /// Replace the partitioning strategy.
    pub fn with_partitioner(mut self, partitioner: Box<dyn WorkPartitioner>) -> Self {
        self.partitioner = partitioner;
        self
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn pending(&self) -> &PendingRequestQueue {
        &self.pending
    }

    /// Index the next step will carry.
    pub fn next_step_index(&self) -> u64 {
        self.next_step
    }

    /// Run one step over every available worker.
    pub async fn run_step(&mut self, batch_size: usize) -> Result<StepBatch> {
        let workers = self.pool.available_workers();
        self.run_step_on(&workers, batch_size).await
    }

    /// Run one step over an explicit subset of workers.
    pub async fn run_step_on(&mut self, workers: &[usize], batch_size: usize) -> Result<StepBatch> {
        if self.pool.is_closed() {
            return Err(SyncError::PoolClosed);
        }
        if batch_size == 0 {
            return Err(SyncError::config("batch_size must be greater than 0"));
        }
        self.recover_abandoned_step();

        let mut targets: Vec<usize> = workers.to_vec();
        targets.sort_unstable();
        targets.dedup();
        for &index in &targets {
            if !self.pool.handle(index)?.is_available() {
                return Err(SyncError::WorkerUnavailable { index });
            }
        }
        if targets.is_empty() {
            return Err(SyncError::NoAvailableWorkers);
        }

        let step_index = self.next_step;
        self.next_step += 1;

        let result = self.execute(step_index, &targets, batch_size).await;
        self.pending.clear();
        match &result {
            Ok(batch) => {
                self.state = StepState::Idle;
                tracing::debug!(
                    "step {} produced {}/{} samples",
                    step_index,
                    batch.len(),
                    batch.requested
                );
            }
            Err(e) => {
                self.state = StepState::Failed;
                tracing::warn!("step {} failed: {}", step_index, e);
            }
        }
        result
    }

    /// Reset bookkeeping left behind when a previous `run_step` future was
    /// dropped before it finished.
    ///
    /// Late replies to that step carry its old index and are discarded as
    /// stale. A worker whose request frame was only partly written cannot be
    /// trusted to parse the next one, so it is marked lost.
    fn recover_abandoned_step(&mut self) {
        let interrupted = matches!(
            self.state,
            StepState::Dispatched | StepState::Collecting | StepState::Aggregating
        );
        if !interrupted && self.pending.is_empty() && self.sending.is_none() {
            return;
        }
        tracing::warn!(
            "previous step was abandoned while {} (workers {:?} still pending)",
            self.state,
            self.pending.workers()
        );
        if let Some(worker) = self.sending.take() {
            tracing::warn!("worker {} may hold a partial frame, marking it lost", worker);
            self.pool.mark_lost(worker);
        }
        self.pending.clear();
        self.state = StepState::Failed;
    }

    /// Write one STEP_REQUEST, remembering the target while the write is in
    /// progress.
    async fn dispatch(&mut self, worker: usize, step_index: u64, units: Vec<u32>) -> Result<()> {
        let request = CoordinatorMessage::Step(StepRequest::new(step_index, units));
        self.sending = Some(worker);
        let sent = self.pool.send_to(worker, &request).await;
        self.sending = None;
        sent.map_err(|e| SyncError::worker_lost(worker, step_index, e))
    }

    async fn execute(&mut self, step_index: u64, targets: &[usize], batch_size: usize) -> Result<StepBatch> {
        self.state = StepState::Dispatched;
        let assignments = self.partitioner.partition(batch_size, targets);
        for assignment in assignments.iter().filter(|a| !a.is_empty()) {
            let worker = assignment.worker_index;
            self.pending.push(worker, step_index, &assignment.units);
            self.dispatch(worker, step_index, assignment.units.clone()).await?;
        }
        tracing::debug!(
            "step {} dispatched {} units to {} workers",
            step_index,
            batch_size,
            self.pending.len()
        );

        self.state = StepState::Collecting;
        let mut collector = Collector::new(step_index, batch_size);
        let deadline = self.step_timeout.map(|t| (Instant::now() + t, t));

        while !self.pending.is_empty() {
            let event = match deadline {
                Some((at, timeout)) => match tokio::time::timeout_at(at, self.events.recv()).await {
                    Ok(event) => event,
                    Err(_) => {
                        return Err(SyncError::WorkerTimeout {
                            step: step_index,
                            workers: self.pending.workers(),
                            timeout,
                        });
                    }
                },
                None => self.events.recv().await,
            };

            let Some(event) = event else {
                // Every reader has stopped, so nothing pending can resolve.
                let worker = self.pending.workers().first().copied().unwrap_or_default();
                return Err(SyncError::worker_lost(
                    worker,
                    step_index,
                    SyncError::connection("worker event stream closed"),
                ));
            };
            self.handle_event(step_index, event, &mut collector).await?;
        }

        self.state = StepState::Aggregating;
        Ok(collector.finish())
    }

    async fn handle_event(&mut self, step_index: u64, event: WorkerEvent, collector: &mut Collector) -> Result<()> {
        let WorkerEvent { worker, message } = event;
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                self.pool.mark_lost(worker);
                if self.pending.contains(worker, step_index) {
                    return Err(SyncError::worker_lost(worker, step_index, e));
                }
                tracing::warn!("worker {} lost outside step {}: {}", worker, step_index, e);
                return Ok(());
            }
        };

        if let Some(step) = message.step_index() {
            if step != step_index {
                tracing::warn!(
                    "discarding stale {} from worker {} for step {} (current step {})",
                    message.kind(),
                    worker,
                    step,
                    step_index
                );
                return Ok(());
            }
        }

        match message {
            WorkerMessage::StepComplete { unit, payload, .. } => {
                if self.pending.complete_unit(worker, step_index, unit).is_none() {
                    return Err(SyncError::protocol(
                        worker,
                        format!("result for unit {} which is not outstanding in step {}", unit, step_index),
                    ));
                }
                collector.samples.insert((worker, unit), payload);
            }
            WorkerMessage::BadSample { unit, .. } => {
                if !self.pending.is_outstanding(worker, step_index, unit) {
                    return Err(SyncError::protocol(
                        worker,
                        format!("bad sample for unit {} which is not outstanding in step {}", unit, step_index),
                    ));
                }
                let count = collector.record_wrong(worker);
                if count > self.max_wrong_samples {
                    return Err(SyncError::WrongSampleLimitExceeded {
                        worker,
                        step: step_index,
                        limit: self.max_wrong_samples,
                    });
                }
                tracing::debug!(
                    "worker {} rejected unit {} of step {} ({}/{}), re-dispatching",
                    worker,
                    unit,
                    step_index,
                    count,
                    self.max_wrong_samples
                );
                self.dispatch(worker, step_index, vec![unit]).await?;
            }
            WorkerMessage::Error { message, .. } => {
                if !self.pending.contains(worker, step_index) {
                    return Err(SyncError::protocol(
                        worker,
                        format!("error report for step {} it was not addressed in", step_index),
                    ));
                }
                return Err(SyncError::WorkerFailed {
                    worker,
                    step: step_index,
                    message,
                });
            }
            WorkerMessage::Exit => {
                self.pool.mark_done(worker);
                match self.pending.resolve(worker, step_index) {
                    Some(entry) => {
                        tracing::warn!(
                            "worker {} exited during step {} with {} unit(s) outstanding",
                            worker,
                            step_index,
                            entry.outstanding_count()
                        );
                        collector.exited.push(worker);
                    }
                    None => tracing::info!("worker {} exited", worker),
                }
            }
        }
        Ok(())
    }

    /// Ask every connected worker to exit, wait up to `grace` for each to
    /// acknowledge or close, then close every socket.
    ///
    /// A second call returns an empty summary.
    pub async fn shutdown(&mut self, grace: Duration) -> ShutdownSummary {
        let mut summary = ShutdownSummary::default();
        if self.pool.is_closed() {
            return summary;
        }

        for handle in self.pool.handles() {
            if handle.is_done() {
                summary.acknowledged.push(handle.index());
            }
        }

        if let Err(e) = self.pool.broadcast(&CoordinatorMessage::Exit).await {
            tracing::warn!("failed to deliver EXIT to every worker: {}", e);
        }

        let mut waiting: BTreeSet<usize> = self.pool.available_workers().into_iter().collect();
        let deadline = Instant::now() + grace;
        while !waiting.is_empty() {
            let event = match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) | Err(_) => break,
            };
            match event.message {
                Ok(WorkerMessage::Exit) | Err(_) => {
                    if waiting.remove(&event.worker) {
                        self.pool.mark_done(event.worker);
                        summary.acknowledged.push(event.worker);
                    }
                }
                Ok(other) => tracing::debug!(
                    "ignoring {} from worker {} during shutdown",
                    other.kind(),
                    event.worker
                ),
            }
        }

        summary.forced = waiting.into_iter().collect();
        summary.lost = self
            .pool
            .handles()
            .iter()
            .filter(|h| h.is_lost())
            .map(|h| h.index())
            .collect();
        summary.acknowledged.sort_unstable();
        if !summary.forced.is_empty() {
            tracing::warn!(
                "force-closing workers {:?} after {:?} grace period",
                summary.forced,
                grace
            );
        }

        self.pool.close_all().await;
        self.events.abort();
        self.pending.clear();
        self.state = StepState::Idle;
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::framing::{read_frame, write_frame, write_identity};
    use crate::handshake::HandshakeRegistry;
    use tokio::net::TcpStream;

    /// Pool of `n` workers whose identities equal their indices.
    async fn pool_of(n: usize) -> (WorkerPool, Vec<TcpStream>) {
        let registry = HandshakeRegistry::bind(&ServerConfig::default(), n).await.unwrap();
        let addr = registry.local_addr();
        let accept = tokio::spawn(registry.accept_all());
        let mut clients = Vec::new();
        for identity in 0..n as u32 {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            write_identity(&mut stream, identity).await.unwrap();
            clients.push(stream);
        }
        (accept.await.unwrap().unwrap(), clients)
    }

    fn step_config(max_wrong: u32, timeout_ms: u64) -> StepConfig {
        StepConfig {
            max_wrong_samples_per_step: max_wrong,
            step_timeout_ms: timeout_ms,
            ..Default::default()
        }
    }

    async fn next_request(stream: &mut TcpStream) -> Option<CoordinatorMessage> {
        let body = read_frame(stream, 1 << 20).await.unwrap()?;
        Some(CoordinatorMessage::decode(body).unwrap())
    }

    async fn reply(stream: &mut TcpStream, message: WorkerMessage) {
        write_frame(stream, &message.encode()).await.unwrap();
    }

    fn payload(step: u64, unit: u32) -> Bytes {
        Bytes::from(format!("{}:{}", step, unit))
    }

    /// Answer every unit (in reverse order) after `delay`, ack EXIT.
    fn spawn_worker(mut stream: TcpStream, delay: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = next_request(&mut stream).await {
                match message {
                    CoordinatorMessage::Step(request) => {
                        tokio::time::sleep(delay).await;
                        for &unit in request.units.iter().rev() {
                            let message = WorkerMessage::StepComplete {
                                step_index: request.step_index,
                                unit,
                                payload: payload(request.step_index, unit),
                            };
                            reply(&mut stream, message).await;
                        }
                    }
                    CoordinatorMessage::Exit => {
                        reply(&mut stream, WorkerMessage::Exit).await;
                        return;
                    }
                }
            }
        })
    }

    #[tokio::test]
    async fn test_output_order_independent_of_arrival() {
        let (pool, clients) = pool_of(3).await;
        let mut coordinator = StepCoordinator::new(pool, &StepConfig::default());
        for (i, client) in clients.into_iter().enumerate() {
            // Worker 0 answers last
            let delay = if i == 0 { 150 } else { 0 };
            spawn_worker(client, Duration::from_millis(delay));
        }

        let batch = coordinator.run_step(6).await.unwrap();
        assert!(batch.is_complete());
        let order: Vec<(usize, u32)> = batch.samples.iter().map(|s| (s.worker_index, s.unit)).collect();
        assert_eq!(order, vec![(0, 0), (0, 1), (1, 2), (1, 3), (2, 4), (2, 5)]);
        assert_eq!(batch.samples[3].payload, payload(0, 3));
        assert_eq!(coordinator.state(), StepState::Idle);
        assert!(coordinator.pending().is_empty());

        let second = coordinator.run_step(6).await.unwrap();
        assert_eq!(second.step_index, 1);
        assert_eq!(second.samples, {
            let mut expected = batch.samples.clone();
            for s in &mut expected {
                s.step_index = 1;
                s.payload = payload(1, s.unit);
            }
            expected
        });
    }

    /// Worker that rejects its first `rejections` attempts, then completes.
    fn spawn_rejecting_worker(mut stream: TcpStream, rejections: u32) {
        tokio::spawn(async move {
            let mut rejected = 0;
            while let Some(CoordinatorMessage::Step(request)) = next_request(&mut stream).await {
                for &unit in &request.units {
                    let message = if rejected < rejections {
                        rejected += 1;
                        WorkerMessage::BadSample {
                            step_index: request.step_index,
                            unit,
                        }
                    } else {
                        WorkerMessage::StepComplete {
                            step_index: request.step_index,
                            unit,
                            payload: payload(request.step_index, unit),
                        }
                    };
                    reply(&mut stream, message).await;
                }
            }
        });
    }

    #[tokio::test]
    async fn test_wrong_samples_up_to_limit_complete() {
        let (pool, mut clients) = pool_of(1).await;
        let mut coordinator = StepCoordinator::new(pool, &step_config(2, 0));
        spawn_rejecting_worker(clients.remove(0), 2);

        let batch = coordinator.run_step(3).await.unwrap();
        assert!(batch.is_complete());
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.wrong_samples.get(&0), Some(&2));
    }

    #[tokio::test]
    async fn test_wrong_samples_over_limit_fail_step_only() {
        let (pool, mut clients) = pool_of(1).await;
        let mut coordinator = StepCoordinator::new(pool, &step_config(2, 0));
        spawn_rejecting_worker(clients.remove(0), 3);

        let err = coordinator.run_step(1).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::WrongSampleLimitExceeded { worker: 0, step: 0, limit: 2 }
        ));
        assert_eq!(coordinator.state(), StepState::Failed);
        assert!(coordinator.pending().is_empty());

        // Budget is per step: the worker now succeeds.
        let batch = coordinator.run_step(1).await.unwrap();
        assert_eq!(batch.step_index, 1);
        assert!(batch.is_complete());
    }

    #[tokio::test]
    async fn test_silent_worker_times_out_and_stale_results_are_dropped() {
        let (pool, mut clients) = pool_of(2).await;
        let mut coordinator = StepCoordinator::new(pool, &step_config(1, 100));
        spawn_worker(clients.remove(0), Duration::ZERO);
        let mut slow = clients.remove(0);

        let err = coordinator.run_step(2).await.unwrap_err();
        match err {
            SyncError::WorkerTimeout { step, workers, .. } => {
                assert_eq!(step, 0);
                assert_eq!(workers, vec![1]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(coordinator.pending().is_empty());

        // The slow worker finally answers step 0, then serves step 1.
        let Some(CoordinatorMessage::Step(old)) = next_request(&mut slow).await else {
            panic!("expected a step request");
        };
        reply(
            &mut slow,
            WorkerMessage::StepComplete {
                step_index: old.step_index,
                unit: old.units[0],
                payload: payload(0, old.units[0]),
            },
        )
        .await;
        spawn_worker(slow, Duration::ZERO);

        let batch = coordinator.run_step(2).await.unwrap();
        assert_eq!(batch.step_index, 1);
        assert!(batch.samples.iter().all(|s| s.payload == payload(1, s.unit)));
    }

    #[tokio::test]
    async fn test_connection_loss_names_worker() {
        let (pool, mut clients) = pool_of(3).await;
        let mut coordinator = StepCoordinator::new(pool, &StepConfig::default());
        let lost = clients.remove(1);
        for client in clients {
            spawn_worker(client, Duration::from_millis(50));
        }
        drop(lost);

        let err = coordinator.run_step(3).await.unwrap_err();
        assert!(matches!(err, SyncError::WorkerLost { worker: 1, step: 0, .. }));
        assert!(coordinator.pool().handle(1).unwrap().is_lost());
        assert_eq!(coordinator.pool().available_workers(), vec![0, 2]);

        let summary = coordinator.shutdown(Duration::from_secs(2)).await;
        assert_eq!(summary.acknowledged, vec![0, 2]);
        assert_eq!(summary.lost, vec![1]);
        assert!(summary.forced.is_empty());
        assert!(coordinator.pool().handles().iter().all(|h| h.is_closed()));
    }

    #[tokio::test]
    async fn test_error_frame_fails_step() {
        let (pool, mut clients) = pool_of(1).await;
        let mut coordinator = StepCoordinator::new(pool, &StepConfig::default());
        let mut client = clients.remove(0);
        tokio::spawn(async move {
            if let Some(CoordinatorMessage::Step(request)) = next_request(&mut client).await {
                let message = WorkerMessage::Error {
                    step_index: request.step_index,
                    message: "simulation diverged".to_string(),
                };
                reply(&mut client, message).await;
            }
            // Keep the socket open until the coordinator is done.
            let _ = next_request(&mut client).await;
        });

        let err = coordinator.run_step(2).await.unwrap_err();
        match err {
            SyncError::WorkerFailed { worker, message, .. } => {
                assert_eq!(worker, 0);
                assert_eq!(message, "simulation diverged");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_exit_mid_step_yields_short_batch() {
        let (pool, mut clients) = pool_of(2).await;
        let mut coordinator = StepCoordinator::new(pool, &StepConfig::default());
        let mut quitter = clients.remove(1);
        spawn_worker(clients.remove(0), Duration::ZERO);
        tokio::spawn(async move {
            let _ = next_request(&mut quitter).await;
            reply(&mut quitter, WorkerMessage::Exit).await;
            let _ = next_request(&mut quitter).await;
        });

        let batch = coordinator.run_step(4).await.unwrap();
        assert!(!batch.is_complete());
        assert_eq!(batch.exited_workers, vec![1]);
        assert_eq!(batch.len(), 2);
        assert!(coordinator.pool().handle(1).unwrap().is_done());

        // Exited workers are skipped by later steps and rejected when named.
        let next = coordinator.run_step(2).await.unwrap();
        assert!(next.samples.iter().all(|s| s.worker_index == 0));
        let err = coordinator.run_step_on(&[1], 1).await.unwrap_err();
        assert!(matches!(err, SyncError::WorkerUnavailable { index: 1 }));
    }

    #[tokio::test]
    async fn test_unknown_worker_and_closed_pool() {
        let (pool, clients) = pool_of(2).await;
        let mut coordinator = StepCoordinator::new(pool, &StepConfig::default());
        for client in clients {
            spawn_worker(client, Duration::ZERO);
        }

        let err = coordinator.run_step_on(&[0, 5], 2).await.unwrap_err();
        assert!(matches!(err, SyncError::UnknownWorker { index: 5, pool_size: 2 }));
        assert_eq!(coordinator.next_step_index(), 0);

        let batch = coordinator.run_step_on(&[1], 2).await.unwrap();
        assert!(batch.samples.iter().all(|s| s.worker_index == 1));

        let first = coordinator.shutdown(Duration::from_secs(2)).await;
        assert_eq!(first.acknowledged, vec![0, 1]);
        let second = coordinator.shutdown(Duration::from_secs(2)).await;
        assert!(second.acknowledged.is_empty() && second.forced.is_empty());
        assert!(matches!(coordinator.run_step(1).await, Err(SyncError::PoolClosed)));
    }

    #[tokio::test]
    async fn test_cancelled_step_does_not_block_next() {
        let (pool, mut clients) = pool_of(1).await;
        let mut coordinator = StepCoordinator::new(pool, &StepConfig::default());
        spawn_worker(clients.remove(0), Duration::from_millis(300));

        let cancelled = tokio::time::timeout(Duration::from_millis(50), coordinator.run_step(1)).await;
        assert!(cancelled.is_err());
        assert_eq!(coordinator.state(), StepState::Collecting);
        assert!(!coordinator.pending().is_empty());

        // Late step 0 replies are discarded as stale.
        let batch = tokio::time::timeout(Duration::from_secs(2), coordinator.run_step(1))
            .await
            .expect("next step must not hang")
            .unwrap();
        assert_eq!(batch.step_index, 1);
        assert_eq!(batch.samples[0].payload, payload(1, 0));
        assert!(coordinator.pending().is_empty());
        assert_eq!(coordinator.state(), StepState::Idle);
        assert_eq!(coordinator.pool().available_workers(), vec![0]);
    }

    #[tokio::test]
    async fn test_duplicate_result_is_protocol_error() {
        let (pool, mut clients) = pool_of(1).await;
        let mut coordinator = StepCoordinator::new(pool, &StepConfig::default());
        let mut client = clients.remove(0);
        tokio::spawn(async move {
            if let Some(CoordinatorMessage::Step(request)) = next_request(&mut client).await {
                for _ in 0..2 {
                    let message = WorkerMessage::StepComplete {
                        step_index: request.step_index,
                        unit: request.units[0],
                        payload: payload(request.step_index, request.units[0]),
                    };
                    reply(&mut client, message).await;
                }
            }
            let _ = next_request(&mut client).await;
        });

        let err = coordinator.run_step(2).await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol { worker: 0, .. }));
        assert_eq!(err.worker_index(), Some(0));
        assert!(coordinator.pending().is_empty());
    }

    #[tokio::test]
    async fn test_unassigned_unit_is_protocol_error() {
        let (pool, mut clients) = pool_of(2).await;
        let mut coordinator = StepCoordinator::new(pool, &StepConfig::default());
        spawn_worker(clients.remove(0), Duration::ZERO);
        let mut client = clients.remove(0);
        tokio::spawn(async move {
            if let Some(CoordinatorMessage::Step(request)) = next_request(&mut client).await {
                // Unit 0 belongs to worker 0.
                let message = WorkerMessage::BadSample {
                    step_index: request.step_index,
                    unit: 0,
                };
                reply(&mut client, message).await;
            }
            let _ = next_request(&mut client).await;
        });

        let err = coordinator.run_step(2).await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol { worker: 1, .. }));
    }
}
