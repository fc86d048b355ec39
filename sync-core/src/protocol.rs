// sync-core/src/protocol.rs

//! Message types exchanged between the coordinator and its workers.
//!
//! Every frame body starts with a one-byte tag followed by big-endian fields:
//!
//! ```text
//! +------+---------------------------------------------------------+
//! | 0x01 | STEP_REQUEST   step: u64 | count: u32 | count x unit: u32 |
//! | 0x02 | EXIT           (no fields, both directions)             |
//! | 0x10 | STEP_COMPLETE  step: u64 | unit: u32 | payload (rest)   |
//! | 0x11 | BAD_SAMPLE     step: u64 | unit: u32                    |
//! | 0x12 | ERROR          step: u64 | UTF-8 message (rest)         |
//! +------+---------------------------------------------------------+
//! ```
//!
//! Bodies are decoded once, here, into tagged enums; nothing downstream
//! inspects raw bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, SyncError};

pub const TAG_STEP_REQUEST: u8 = 0x01;
pub const TAG_EXIT: u8 = 0x02;
pub const TAG_STEP_COMPLETE: u8 = 0x10;
pub const TAG_BAD_SAMPLE: u8 = 0x11;
pub const TAG_ERROR: u8 = 0x12;

/// A request for one worker to produce the listed units of a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRequest {
    pub step_index: u64,
    /// Global unit indices within the step, ascending.
    pub units: Vec<u32>,
}

impl StepRequest {
    pub fn new(step_index: u64, units: Vec<u32>) -> Self {
        Self { step_index, units }
    }
}

/// Frames sent by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorMessage {
    Step(StepRequest),
    Exit,
}

/// Frames sent by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMessage {
    /// A unit of work finished and produced a sample.
    StepComplete {
        step_index: u64,
        unit: u32,
        payload: Bytes,
    },
    /// A unit of work was rejected by the worker's own validity check.
    BadSample { step_index: u64, unit: u32 },
    /// The worker could not perform the step at all.
    Error { step_index: u64, message: String },
    /// The worker is leaving (voluntarily or acknowledging a coordinator EXIT).
    Exit,
}

impl WorkerMessage {
    /// Step index carried by the message; `None` for EXIT.
    pub fn step_index(&self) -> Option<u64> {
        match self {
            Self::StepComplete { step_index, .. }
            | Self::BadSample { step_index, .. }
            | Self::Error { step_index, .. } => Some(*step_index),
            Self::Exit => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::StepComplete { .. } => "STEP_COMPLETE",
            Self::BadSample { .. } => "BAD_SAMPLE",
            Self::Error { .. } => "ERROR",
            Self::Exit => "EXIT",
        }
    }
}

impl CoordinatorMessage {
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Step(request) => {
                let mut buf = BytesMut::with_capacity(13 + request.units.len() * 4);
                buf.put_u8(TAG_STEP_REQUEST);
                buf.put_u64(request.step_index);
                buf.put_u32(request.units.len() as u32);
                for unit in &request.units {
                    buf.put_u32(*unit);
                }
                buf.freeze()
            }
            Self::Exit => Bytes::from_static(&[TAG_EXIT]),
        }
    }

    pub fn decode(mut body: Bytes) -> Result<Self> {
        let tag = take_tag(&mut body)?;
        let message = match tag {
            TAG_STEP_REQUEST => {
                let step_index = take_u64(&mut body, "step index")?;
                let count = take_u32(&mut body, "unit count")? as usize;
                if body.remaining() != count * 4 {
                    return Err(SyncError::connection(format!(
                        "malformed STEP_REQUEST: {} units declared, {} bytes follow",
                        count,
                        body.remaining()
                    )));
                }
                let units = (0..count).map(|_| body.get_u32()).collect();
                Self::Step(StepRequest { step_index, units })
            }
            TAG_EXIT => Self::Exit,
            other => {
                return Err(SyncError::connection(format!(
                    "unknown coordinator frame tag 0x{:02x}",
                    other
                )))
            }
        };
        expect_empty(&body, tag)?;
        Ok(message)
    }
}

impl WorkerMessage {
    pub fn encode(&self) -> Bytes {
        match self {
            Self::StepComplete {
                step_index,
                unit,
                payload,
            } => {
                let mut buf = BytesMut::with_capacity(13 + payload.len());
                buf.put_u8(TAG_STEP_COMPLETE);
                buf.put_u64(*step_index);
                buf.put_u32(*unit);
                buf.put_slice(payload);
                buf.freeze()
            }
            Self::BadSample { step_index, unit } => {
                let mut buf = BytesMut::with_capacity(13);
                buf.put_u8(TAG_BAD_SAMPLE);
                buf.put_u64(*step_index);
                buf.put_u32(*unit);
                buf.freeze()
            }
            Self::Error {
                step_index,
                message,
            } => {
                let mut buf = BytesMut::with_capacity(9 + message.len());
                buf.put_u8(TAG_ERROR);
                buf.put_u64(*step_index);
                buf.put_slice(message.as_bytes());
                buf.freeze()
            }
            Self::Exit => Bytes::from_static(&[TAG_EXIT]),
        }
    }

    pub fn decode(mut body: Bytes) -> Result<Self> {
        let tag = take_tag(&mut body)?;
        match tag {
            TAG_STEP_COMPLETE => {
                let step_index = take_u64(&mut body, "step index")?;
                let unit = take_u32(&mut body, "unit")?;
                // The payload is whatever remains; `body` is already advanced.
                Ok(Self::StepComplete {
                    step_index,
                    unit,
                    payload: body,
                })
            }
            TAG_BAD_SAMPLE => {
                let step_index = take_u64(&mut body, "step index")?;
                let unit = take_u32(&mut body, "unit")?;
                expect_empty(&body, tag)?;
                Ok(Self::BadSample { step_index, unit })
            }
            TAG_ERROR => {
                let step_index = take_u64(&mut body, "step index")?;
                let message = String::from_utf8(body.to_vec()).map_err(|_| {
                    SyncError::connection("malformed ERROR frame: message is not UTF-8")
                })?;
                Ok(Self::Error {
                    step_index,
                    message,
                })
            }
            TAG_EXIT => {
                expect_empty(&body, tag)?;
                Ok(Self::Exit)
            }
            other => Err(SyncError::connection(format!(
                "unknown worker frame tag 0x{:02x}",
                other
            ))),
        }
    }
}

fn take_tag(body: &mut Bytes) -> Result<u8> {
    if !body.has_remaining() {
        return Err(SyncError::connection("empty frame body"));
    }
    Ok(body.get_u8())
}

fn take_u64(body: &mut Bytes, field: &str) -> Result<u64> {
    if body.remaining() < 8 {
        return Err(SyncError::connection(format!("truncated frame: missing {}", field)));
    }
    Ok(body.get_u64())
}

fn take_u32(body: &mut Bytes, field: &str) -> Result<u32> {
    if body.remaining() < 4 {
        return Err(SyncError::connection(format!("truncated frame: missing {}", field)));
    }
    Ok(body.get_u32())
}

fn expect_empty(body: &Bytes, tag: u8) -> Result<()> {
    if body.has_remaining() {
        return Err(SyncError::connection(format!(
            "{} trailing bytes after frame tag 0x{:02x}",
            body.remaining(),
            tag
        )));
    }
    Ok(())
}
