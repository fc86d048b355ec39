// sync-core/src/worker.rs

//! Worker side of the protocol.
//!
//! A worker dials the coordinator, announces its identity, then answers
//! STEP_REQUEST frames unit by unit until it is told to exit.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::config::DEFAULT_MAX_FRAME_BYTES;
use crate::error::{Result, SyncError};
use crate::framing::{read_frame, write_frame, write_identity};
use crate::protocol::{CoordinatorMessage, WorkerMessage};
use crate::retry::{is_transient_connect_error, retry_async, RetryConfig, RetryResult};

/// Result of processing one unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Sample(Bytes),
    /// The unit failed the worker's own validity check; the coordinator
    /// may send it again.
    BadSample,
    /// Unrecoverable failure; fails the coordinator's step.
    Failed(String),
}

/// Domain logic run by a worker for each assigned unit.
#[async_trait]
pub trait StepHandler: Send {
    async fn process(&mut self, step_index: u64, unit: u32) -> UnitOutcome;
}

/// Counters reported when a worker stops serving.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub requests: u64,
    pub samples: u64,
    pub bad_samples: u64,
    pub failures: u64,
}

pub struct WorkerClient {
    identity: u32,
    stream: TcpStream,
    max_frame_bytes: usize,
}

impl WorkerClient {
    /// Dial `address`, retrying refused connects, and announce `identity`.
    pub async fn connect(address: &str, identity: u32, retry: &RetryConfig) -> Result<Self> {
        let retry = retry.clone().with_jitter_seed(identity);
        let mut stream = retry_async(&retry, || async move {
            match TcpStream::connect(address).await {
                Ok(stream) => RetryResult::Ok(stream),
                Err(e) if is_transient_connect_error(&e) => RetryResult::Retry(e),
                Err(e) => RetryResult::Fail(e),
            }
        })
        .await
        .map_err(|e| {
            SyncError::connection_with_source(
                format!("failed to connect to coordinator at {}", address),
                e,
            )
        })?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed: {}", e);
        }
        write_identity(&mut stream, identity).await?;
        tracing::info!("worker {} connected to coordinator at {}", identity, address);

        Ok(Self {
            identity,
            stream,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        })
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    pub fn identity(&self) -> u32 {
        self.identity
    }

    /// Serve step requests until the coordinator sends EXIT or closes the
    /// connection.
    pub async fn run<H: StepHandler>(mut self, handler: &mut H) -> Result<WorkerStats> {
        let mut stats = WorkerStats::default();
        loop {
            let Some(body) = read_frame(&mut self.stream, self.max_frame_bytes).await? else {
                tracing::info!("worker {}: coordinator closed the connection", self.identity);
                return Ok(stats);
            };

            match CoordinatorMessage::decode(body)? {
                CoordinatorMessage::Step(request) => {
                    stats.requests += 1;
                    tracing::debug!(
                        "worker {}: step {} with {} unit(s)",
                        self.identity,
                        request.step_index,
                        request.units.len()
                    );
                    for unit in request.units {
                        let reply = match handler.process(request.step_index, unit).await {
                            UnitOutcome::Sample(payload) => {
                                stats.samples += 1;
                                WorkerMessage::StepComplete {
                                    step_index: request.step_index,
                                    unit,
                                    payload,
                                }
                            }
                            UnitOutcome::BadSample => {
                                stats.bad_samples += 1;
                                WorkerMessage::BadSample {
                                    step_index: request.step_index,
                                    unit,
                                }
                            }
                            UnitOutcome::Failed(message) => {
                                stats.failures += 1;
                                WorkerMessage::Error {
                                    step_index: request.step_index,
                                    message,
                                }
                            }
                        };
                        write_frame(&mut self.stream, &reply.encode()).await?;
                    }
                }
                CoordinatorMessage::Exit => {
                    tracing::info!("worker {}: exit requested", self.identity);
                    self.exit().await?;
                    return Ok(stats);
                }
            }
        }
    }

    /// Send EXIT and close the write side.
    pub async fn exit(&mut self) -> Result<()> {
        write_frame(&mut self.stream, &WorkerMessage::Exit.encode()).await?;
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!("worker {}: shutdown failed: {}", self.identity, e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::read_identity;
    use crate::protocol::StepRequest;
    use std::time::Duration;
    use tokio::net::TcpListener;

    struct RejectFirst {
        rejected: bool,
    }

    #[async_trait]
    impl StepHandler for RejectFirst {
        async fn process(&mut self, step_index: u64, unit: u32) -> UnitOutcome {
            if unit == 99 {
                return UnitOutcome::Failed("unit 99 is cursed".to_string());
            }
            if !self.rejected {
                self.rejected = true;
                return UnitOutcome::BadSample;
            }
            UnitOutcome::Sample(Bytes::from(format!("{}/{}", step_index, unit)))
        }
    }

    async fn recv(stream: &mut TcpStream) -> WorkerMessage {
        let body = read_frame(stream, 1024).await.unwrap().unwrap();
        WorkerMessage::decode(body).unwrap()
    }

    #[tokio::test]
    async fn test_serves_requests_until_exit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let worker = tokio::spawn(async move {
            let client = WorkerClient::connect(&addr, 7, &RetryConfig::no_retry()).await.unwrap();
            let mut handler = RejectFirst { rejected: false };
            client.run(&mut handler).await.unwrap()
        });

        let (mut server, _) = listener.accept().await.unwrap();
        assert_eq!(read_identity(&mut server).await.unwrap(), 7);

        let request = CoordinatorMessage::Step(StepRequest::new(3, vec![0, 1]));
        write_frame(&mut server, &request.encode()).await.unwrap();
        assert_eq!(recv(&mut server).await, WorkerMessage::BadSample { step_index: 3, unit: 0 });
        assert_eq!(
            recv(&mut server).await,
            WorkerMessage::StepComplete {
                step_index: 3,
                unit: 1,
                payload: Bytes::from_static(b"3/1"),
            }
        );

        let failing = CoordinatorMessage::Step(StepRequest::new(4, vec![99]));
        write_frame(&mut server, &failing.encode()).await.unwrap();
        assert!(matches!(recv(&mut server).await, WorkerMessage::Error { step_index: 4, .. }));

        write_frame(&mut server, &CoordinatorMessage::Exit.encode()).await.unwrap();
        assert_eq!(recv(&mut server).await, WorkerMessage::Exit);

        let stats = worker.await.unwrap();
        assert_eq!(
            stats,
            WorkerStats {
                requests: 2,
                samples: 1,
                bad_samples: 1,
                failures: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_retries() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let retry = RetryConfig {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 1.0,
            jitter: false,
            jitter_seed: 0,
        };
        let err = WorkerClient::connect(&addr, 1, &retry).await.err().unwrap();
        assert!(matches!(err, SyncError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_coordinator_close_ends_run() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let worker = tokio::spawn(async move {
            let client = WorkerClient::connect(&addr, 2, &RetryConfig::no_retry()).await.unwrap();
            client.run(&mut RejectFirst { rejected: true }).await.unwrap()
        });
        let (mut server, _) = listener.accept().await.unwrap();
        assert_eq!(read_identity(&mut server).await.unwrap(), 2);
        drop(server);
        assert_eq!(worker.await.unwrap(), WorkerStats::default());
    }
}
