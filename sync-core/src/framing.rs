// sync-core/src/framing.rs

//! Length-prefixed stream framing.
//!
//! Shared by the coordinator and the worker client so the two sides cannot
//! drift apart.
//!
//! # Wire format
//!
//! ```text
//! identity:  [4-byte big-endian u32]              (once, right after connect)
//! frame:     [4-byte big-endian length][body]     (body = tag + fields)
//! ```

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SyncError};

/// Size of the identity frame in bytes.
pub const IDENTITY_FRAME_LEN: usize = 4;

/// Write a length-prefixed frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    let len = u32::try_from(body.len())
        .map_err(|_| SyncError::connection(format!("frame too large: {} bytes", body.len())))?;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| io_error("failed to write frame length", e))?;
    writer
        .write_all(body)
        .await
        .map_err(|e| io_error("failed to write frame body", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_error("failed to flush frame", e))?;
    Ok(())
}

/// Read one length-prefixed frame body.
///
/// Returns `Ok(None)` when the peer closes before a length prefix is complete.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<Bytes>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(io_error("failed to read frame length", e)),
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len == 0 {
        return Err(SyncError::connection("malformed frame: zero-length body"));
    }
    if len > max_size {
        return Err(SyncError::connection(format!(
            "frame too large: {} bytes (limit {})",
            len, max_size
        )));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| io_error("connection closed mid-frame", e))?;
    Ok(Some(Bytes::from(body)))
}

/// Send the 4-byte identity frame.
pub async fn write_identity<W: AsyncWrite + Unpin>(writer: &mut W, identity: u32) -> Result<()> {
    writer
        .write_all(&identity.to_be_bytes())
        .await
        .map_err(|e| io_error("failed to write identity frame", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_error("failed to flush identity frame", e))
}

/// Read the 4-byte identity frame.
pub async fn read_identity<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u32> {
    let mut bytes = [0u8; IDENTITY_FRAME_LEN];
    reader
        .read_exact(&mut bytes)
        .await
        .map_err(|e| io_error("peer closed before sending identity", e))?;
    Ok(u32::from_be_bytes(bytes))
}

fn io_error(message: &str, source: io::Error) -> SyncError {
    SyncError::connection_with_source(message, source)
}
