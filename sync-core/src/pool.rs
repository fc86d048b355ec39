// sync-core/src/pool.rs

//! The ordered set of registered worker connections.
//!
//! The pool is built once by the handshake registry and never grows or
//! shrinks afterwards; workers that exit or fail are flagged on their handle
//! instead of being removed, so indices stay stable for the whole session.
//!
//! Reads happen on one task per connection (see [`WorkerPool::take_events`]);
//! writes happen only on the coordination path that owns the pool.

use std::sync::Arc;

use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::connection::ConnectionHandle;
use crate::error::{Result, SyncError};
use crate::framing::read_frame;
use crate::protocol::{CoordinatorMessage, WorkerMessage};

/// Shared, queryable readiness of a pool under construction.
///
/// Cloning is cheap; every clone observes the same state.
#[derive(Debug, Clone)]
pub struct Readiness {
    target: usize,
    registered: Arc<watch::Sender<Vec<u32>>>,
}

impl Readiness {
    pub fn new(target: usize) -> Self {
        let (tx, _rx) = watch::channel(Vec::new());
        Self {
            target,
            registered: Arc::new(tx),
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn registered_count(&self) -> usize {
        self.registered.borrow().len()
    }

    /// Identities that completed handshake, in arrival order.
    pub fn registered_identities(&self) -> Vec<u32> {
        self.registered.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.registered_count() >= self.target
    }

    /// Suspend until every expected worker has registered.
    pub async fn wait_ready(&self) {
        let mut rx = self.registered.subscribe();
        let target = self.target;
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|ids| ids.len() >= target).await;
    }

    pub(crate) fn register(&self, identity: u32) {
        self.registered.send_modify(|ids| ids.push(identity));
    }
}

/// One message (or transport failure) observed on a worker's socket.
#[derive(Debug)]
pub struct WorkerEvent {
    pub worker: usize,
    pub message: Result<WorkerMessage>,
}

/// Merged stream of events from every worker's reader task.
#[derive(Debug)]
pub struct WorkerEvents {
    rx: mpsc::Receiver<WorkerEvent>,
    readers: Vec<JoinHandle<()>>,
}

impl WorkerEvents {
    /// Next event from any worker; `None` once every reader has stopped.
    pub async fn recv(&mut self) -> Option<WorkerEvent> {
        self.rx.recv().await
    }

    /// Stop all reader tasks.
    pub fn abort(&mut self) {
        for reader in self.readers.drain(..) {
            reader.abort();
        }
    }
}

impl Drop for WorkerEvents {
    fn drop(&mut self) {
        self.abort();
    }
}

async fn read_loop(
    worker: usize,
    mut reader: OwnedReadHalf,
    max_frame_bytes: usize,
    tx: mpsc::Sender<WorkerEvent>,
) {
    loop {
        let message = match read_frame(&mut reader, max_frame_bytes).await {
            Ok(Some(body)) => WorkerMessage::decode(body),
            Ok(None) => Err(SyncError::connection(format!(
                "worker {} closed the connection",
                worker
            ))),
            Err(e) => Err(e),
        };

        // EXIT and any error end this connection's stream.
        let last = !matches!(&message, Ok(m) if *m != WorkerMessage::Exit);
        if tx.send(WorkerEvent { worker, message }).await.is_err() {
            break;
        }
        if last {
            break;
        }
    }
    tracing::debug!("reader for worker {} stopped", worker);
}

#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<ConnectionHandle>,
    readiness: Readiness,
    closed: bool,
}

impl WorkerPool {
    /// Freeze a set of registered handles into a pool.
    ///
    /// Handles must be ordered by index with indices `0..len`.
    pub(crate) fn new(handles: Vec<ConnectionHandle>, readiness: Readiness) -> Result<Self> {
        if handles.len() > readiness.target() {
            return Err(SyncError::config(format!(
                "pool received {} handles but expects at most {}",
                handles.len(),
                readiness.target()
            )));
        }
        debug_assert!(handles.iter().enumerate().all(|(i, h)| h.index() == i));
        Ok(Self {
            handles,
            readiness,
            closed: false,
        })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn target_size(&self) -> usize {
        self.readiness.target()
    }

    /// True iff every expected worker is registered.
    pub fn all_ready(&self) -> bool {
        self.handles.len() == self.readiness.target()
    }

    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn handles(&self) -> &[ConnectionHandle] {
        &self.handles
    }

    pub fn handle(&self, index: usize) -> Result<&ConnectionHandle> {
        self.handles
            .get(index)
            .ok_or_else(|| SyncError::unknown_worker(index, self.handles.len()))
    }

    pub(crate) fn handle_mut(&mut self, index: usize) -> Result<&mut ConnectionHandle> {
        let len = self.handles.len();
        self.handles
            .get_mut(index)
            .ok_or_else(|| SyncError::unknown_worker(index, len))
    }

    /// Indices of workers that can take new work, ascending.
    pub fn available_workers(&self) -> Vec<usize> {
        self.handles
            .iter()
            .filter(|h| h.is_available())
            .map(|h| h.index())
            .collect()
    }

    /// Send to exactly one worker.
    pub async fn send_to(&mut self, index: usize, message: &CoordinatorMessage) -> Result<()> {
        if self.closed {
            return Err(SyncError::PoolClosed);
        }
        let handle = self.handle_mut(index)?;
        if !handle.is_available() {
            return Err(SyncError::WorkerUnavailable { index });
        }
        if let Err(e) = handle.send(message).await {
            handle.mark_lost();
            return Err(e);
        }
        Ok(())
    }

    /// Send the same message to every available worker in index order.
    ///
    /// Every worker is attempted; the first failure (if any) is returned
    /// after the loop and failing workers are flagged as lost.
    pub async fn broadcast(&mut self, message: &CoordinatorMessage) -> Result<()> {
        if self.closed {
            return Err(SyncError::PoolClosed);
        }
        let mut first_error = None;
        for handle in self.handles.iter_mut().filter(|h| h.is_available()) {
            if let Err(e) = handle.send(message).await {
                tracing::warn!("broadcast to worker {} failed: {}", handle.index(), e);
                handle.mark_lost();
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub(crate) fn mark_done(&mut self, index: usize) {
        if let Some(handle) = self.handles.get_mut(index) {
            handle.mark_done();
        }
    }

    pub(crate) fn mark_lost(&mut self, index: usize) {
        if let Some(handle) = self.handles.get_mut(index) {
            handle.mark_lost();
        }
    }

    /// Hand every read half to its own reader task and merge their output.
    ///
    /// Handles whose read half was already taken are skipped.
    pub fn take_events(&mut self, buffer: usize) -> WorkerEvents {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let readers = self
            .handles
            .iter_mut()
            .filter_map(|handle| {
                let index = handle.index();
                let max = handle.max_frame_bytes();
                handle
                    .take_reader()
                    .map(|reader| tokio::spawn(read_loop(index, reader, max, tx.clone())))
            })
            .collect();
        WorkerEvents { rx, readers }
    }

    /// Close every socket. Safe to call more than once.
    pub async fn close_all(&mut self) {
        for handle in &mut self.handles {
            handle.close().await;
        }
        self.closed = true;
    }
}
