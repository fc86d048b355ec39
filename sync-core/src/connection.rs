// sync-core/src/connection.rs

//! One worker's transport.
//!
//! A `ConnectionHandle` owns both halves of an accepted socket, carries the
//! pool index assigned at handshake, and exposes framed `send`/`receive`.
//! I/O errors are never retried here; they are returned to the caller.

use std::net::SocketAddr;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::{Result, SyncError};
use crate::framing::{read_frame, write_frame};
use crate::protocol::{CoordinatorMessage, WorkerMessage};

#[derive(Debug)]
pub struct ConnectionHandle {
    index: usize,
    identity: u32,
    peer: SocketAddr,
    reader: Option<OwnedReadHalf>,
    writer: Option<OwnedWriteHalf>,
    max_frame_bytes: usize,
    /// Worker signaled EXIT; it takes no more work in this lifetime.
    done: bool,
    /// Transport failed; the socket is unusable.
    lost: bool,
}

impl ConnectionHandle {
    pub(crate) fn new(
        index: usize,
        identity: u32,
        peer: SocketAddr,
        stream: TcpStream,
        max_frame_bytes: usize,
    ) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            index,
            identity,
            peer,
            reader: Some(reader),
            writer: Some(writer),
            max_frame_bytes,
            done: false,
            lost: false,
        }
    }

    /// Pool index, fixed at handshake.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Identity value the worker announced.
    pub fn identity(&self) -> u32 {
        self.identity
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn is_lost(&self) -> bool {
        self.lost
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }

    /// Whether this worker can be addressed with new work.
    pub fn is_available(&self) -> bool {
        !self.done && !self.lost && self.writer.is_some()
    }

    pub(crate) fn mark_done(&mut self) {
        self.done = true;
    }

    pub(crate) fn mark_lost(&mut self) {
        self.lost = true;
    }

    /// Serialize and write one frame; resolves once it is fully written.
    pub async fn send(&mut self, message: &CoordinatorMessage) -> Result<()> {
        let index = self.index;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SyncError::connection(format!("worker {} connection is closed", index)))?;
        write_frame(writer, &message.encode()).await
    }

    /// Read one frame and decode it.
    ///
    /// Only usable while the read half has not been handed to the pool's
    /// event loop (see [`crate::pool::WorkerPool::take_events`]).
    pub async fn receive(&mut self) -> Result<WorkerMessage> {
        let index = self.index;
        let max = self.max_frame_bytes;
        let reader = self.reader.as_mut().ok_or_else(|| {
            SyncError::connection(format!(
                "worker {} read half is owned by the event loop",
                index
            ))
        })?;
        match read_frame(reader, max).await? {
            Some(body) => WorkerMessage::decode(body),
            None => Err(SyncError::connection(format!(
                "worker {} closed the connection",
                index
            ))),
        }
    }

    pub(crate) fn take_reader(&mut self) -> Option<OwnedReadHalf> {
        self.reader.take()
    }

    pub(crate) fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Shut down the write side and drop the socket. Closing twice is a no-op.
    pub async fn close(&mut self) {
        self.reader = None;
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("worker {}: shutdown of write half failed: {}", self.index, e);
            }
        }
    }
}
