//! Synthetic worker used by `sync-coordinator worker`.
//!
//! Produces a deterministic payload per `(step, unit)` and can be told to
//! reject every K-th attempt, which exercises the coordinator's bad-sample
//! retry path end to end.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use sync_core::{StepHandler, UnitOutcome};

/// Header written at the start of every payload: step (u64) + unit (u32) + identity (u32).
const HEADER_LEN: usize = 16;

pub struct SyntheticWorker {
    identity: u32,
    reject_every: u64,
    payload_bytes: usize,
    attempts: u64,
}

impl SyntheticWorker {
    pub fn new(identity: u32, reject_every: u64, payload_bytes: usize) -> Self {
        Self {
            identity,
            reject_every,
            payload_bytes: payload_bytes.max(HEADER_LEN),
            attempts: 0,
        }
    }

    fn payload(&self, step_index: u64, unit: u32) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload_bytes);
        buf.put_u64(step_index);
        buf.put_u32(unit);
        buf.put_u32(self.identity);
        let seed = step_index.wrapping_mul(31).wrapping_add(unit as u64);
        for i in HEADER_LEN..self.payload_bytes {
            buf.put_u8(seed.wrapping_add(i as u64) as u8);
        }
        buf.freeze()
    }
}

#[async_trait]
impl StepHandler for SyntheticWorker {
    async fn process(&mut self, step_index: u64, unit: u32) -> UnitOutcome {
        self.attempts += 1;
        if self.reject_every > 0 && self.attempts % self.reject_every == 0 {
            tracing::debug!(
                "worker {}: rejecting unit {} of step {} (attempt {})",
                self.identity,
                unit,
                step_index,
                self.attempts
            );
            return UnitOutcome::BadSample;
        }
        UnitOutcome::Sample(self.payload(step_index, unit))
    }
}
