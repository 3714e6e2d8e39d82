//! TCP service loop for the coordinator.
//!
//! Accepts brokerage client connections and serves the three protocol
//! messages. Each accepted connection is owned by one task, so messages on a
//! single connection are processed strictly in arrival order; interleavings
//! across connections are arbitrary and serialized by the registry lock.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use brokerage_core::error::{BrokerageError, Result};
use brokerage_core::protocol::Message;
use brokerage_core::transport::Connection;

use crate::state::CoordinatorState;

/// A bound, not-yet-running coordinator server.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
}

impl Server {
    /// Binds the coordinator port. Fails when the port is in use.
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| BrokerageError::bind(port, e))?;
        Ok(Self { listener })
    }

    /// The actually-bound address (relevant when binding port 0 in tests).
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves connections until `shutdown` completes.
    pub async fn run(self, state: Arc<CoordinatorState>, shutdown: impl std::future::Future) {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("connection from {peer}");
                            let state = state.clone();
                            tokio::spawn(async move {
                                handle_connection(state, Connection::from_stream(stream, peer)).await;
                            });
                        }
                        Err(e) => warn!("accept failed: {e}"),
                    }
                }
                _ = &mut shutdown => {
                    info!("shutting down coordinator");
                    break;
                }
            }
        }
    }
}

/// Serves one connection until the peer disconnects or violates the
/// protocol. A protocol violation drops the connection without a reply and
/// leaves the registry untouched.
async fn handle_connection(state: Arc<CoordinatorState>, mut conn: Connection) {
    let peer = conn.peer_addr();

    loop {
        match conn.receive().await {
            Ok(Some(Message::SetWorkerStatus {
                available,
                protocol_version,
                platform,
            })) => {
                // The worker's address comes from the TCP peer, never from
                // the message.
                let Some(address) = conn.peer_addr_wire() else {
                    warn!("ignoring status from non-IPv4 peer {peer}");
                    continue;
                };
                state
                    .set_worker_status(address, available, protocol_version, platform)
                    .await;
            }
            Ok(Some(Message::RequestWorkerList {
                protocol_version,
                platform,
            })) => {
                let workers = state.matching_workers(protocol_version, platform).await;
                debug!(
                    "worker list request from {peer} (v{protocol_version}, platform {platform}): {} matches",
                    workers.len()
                );
                if let Err(e) = conn.send(&Message::WorkerList { workers }).await {
                    warn!("failed to send worker list to {peer}: {e}");
                    return;
                }
            }
            Ok(Some(Message::WorkerList { .. })) => {
                // Only the coordinator sends worker lists.
                debug!("ignoring worker list from {peer}");
            }
            Ok(None) => {
                debug!("{peer} disconnected");
                return;
            }
            Err(e) => {
                warn!("dropping {peer}: {e}");
                return;
            }
        }
    }
}
