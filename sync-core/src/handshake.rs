// sync-core/src/handshake.rs

//! Identity handshake and index assignment.
//!
//! The registry accepts connections until `expected` distinct identities have
//! been announced. Each accepted socket gets its own handshake task (at most
//! `server.max_connections` at once) that reads the 4-byte identity frame.
//! Once the set is complete, handles are sorted by identity and the sort
//! position becomes the pool index, so the result does not depend on the
//! order in which workers happened to connect.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

use crate::config::{HandshakeFailurePolicy, ServerConfig};
use crate::connection::ConnectionHandle;
use crate::error::{Result, SyncError};
use crate::framing::read_identity;
use crate::pool::{Readiness, WorkerPool};

type HandshakeOutcome = (SocketAddr, Result<(u32, TcpStream)>);

pub struct HandshakeRegistry {
    listener: TcpListener,
    local_addr: SocketAddr,
    expected: usize,
    max_connections: usize,
    handshake_timeout: Duration,
    policy: HandshakeFailurePolicy,
    max_frame_bytes: usize,
    readiness: Readiness,
}

impl HandshakeRegistry {
    /// Bind the listener described by `config`.
    pub async fn bind(config: &ServerConfig, expected: usize) -> Result<Self> {
        let addr = config.socket_addr()?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            SyncError::connection_with_source(format!("failed to bind {}", addr), e)
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| SyncError::connection_with_source("failed to read local address", e))?;
        tracing::info!("handshake registry listening on {} for {} workers", local_addr, expected);

        Ok(Self {
            listener,
            local_addr,
            expected,
            max_connections: config.max_connections.max(1),
            handshake_timeout: config.handshake_timeout(),
            policy: config.on_handshake_failure,
            max_frame_bytes: config.max_frame_bytes,
            readiness: Readiness::new(expected),
        })
    }

    /// Address workers should dial; resolves port 0 to the real port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness.clone()
    }

    /// Accept connections until every expected worker has registered, then
    /// freeze them into a pool ordered by identity.
    pub async fn accept_all(self) -> Result<WorkerPool> {
        let mut in_flight: JoinSet<HandshakeOutcome> = JoinSet::new();
        let mut registered: BTreeMap<u32, (SocketAddr, TcpStream)> = BTreeMap::new();

        while registered.len() < self.expected {
            tokio::select! {
                accepted = self.listener.accept(), if in_flight.len() < self.max_connections => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                tracing::debug!("set_nodelay failed for {}: {}", peer, e);
                            }
                            tracing::debug!("accepted connection from {}", peer);
                            in_flight.spawn(handshake(stream, peer, self.handshake_timeout));
                        }
                        Err(e) => tracing::warn!("accept failed: {}", e),
                    }
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    let (peer, outcome) = joined.map_err(|e| {
                        SyncError::connection(format!("handshake task failed: {}", e))
                    })?;
                    match outcome {
                        Ok((identity, stream)) => {
                            if let Some((first_peer, _)) = registered.get(&identity) {
                                return Err(SyncError::DuplicateIdentity {
                                    identity,
                                    first_peer: first_peer.to_string(),
                                    second_peer: peer.to_string(),
                                });
                            }
                            registered.insert(identity, (peer, stream));
                            self.readiness.register(identity);
                            tracing::info!(
                                "worker identity {} registered from {} ({}/{})",
                                identity,
                                peer,
                                registered.len(),
                                self.expected
                            );
                        }
                        Err(e) => match self.policy {
                            HandshakeFailurePolicy::FailStartup => {
                                return Err(SyncError::HandshakeFailed {
                                    peer: peer.to_string(),
                                    message: e.to_string(),
                                });
                            }
                            HandshakeFailurePolicy::WaitForReplacement => {
                                tracing::warn!(
                                    "handshake with {} failed, waiting for a replacement: {}",
                                    peer,
                                    e
                                );
                            }
                        },
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            tracing::warn!(
                "dropping {} surplus connection(s) still in handshake",
                in_flight.len()
            );
        }

        // BTreeMap iterates in identity order: position == pool index.
        let handles = registered
            .into_iter()
            .enumerate()
            .map(|(index, (identity, (peer, stream)))| {
                tracing::debug!("identity {} -> worker index {}", identity, index);
                ConnectionHandle::new(index, identity, peer, stream, self.max_frame_bytes)
            })
            .collect();

        WorkerPool::new(handles, self.readiness)
    }
}

async fn handshake(mut stream: TcpStream, peer: SocketAddr, deadline: Duration) -> HandshakeOutcome {
    let outcome = match tokio::time::timeout(deadline, read_identity(&mut stream)).await {
        Ok(Ok(identity)) => Ok((identity, stream)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(SyncError::connection(format!(
            "no identity frame within {:?}",
            deadline
        ))),
    };
    (peer, outcome)
}
