//! Delivery of Raft messages between coordinators.
//!
//! Raft tolerates lost, duplicated and reordered messages, so the transport
//! is fire-and-forget: a message that cannot be delivered is dropped and
//! recovered by the next heartbeat or retransmission.

use super::{Envelope, NodeId};
use crate::common::{grpc_url, Error, Result};
use crate::proto::coordinator_internal_client::CoordinatorInternalClient;
use crate::proto::RaftMessage;

use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tonic::transport::{Channel, Endpoint};

const PEER_QUEUE: usize = 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const SEND_TIMEOUT: Duration = Duration::from_millis(500);

/// Outbound message delivery.
pub trait Transport: Send + Sync + 'static {
    /// Queue an envelope for delivery to `envelope.to`. Never blocks.
    fn send(&self, envelope: Envelope);
}

/// Sends envelopes over the `CoordinatorInternal.Step` RPC, one ordered
/// queue and sender task per peer.
pub struct GrpcTransport {
    queues: BTreeMap<NodeId, mpsc::Sender<Envelope>>,
}

impl GrpcTransport {
    /// Build lazily-connecting channels to every peer. Must be called inside
    /// a tokio runtime.
    pub fn new(peers: &BTreeMap<NodeId, String>) -> Result<Self> {
        let mut queues = BTreeMap::new();
        for (id, addr) in peers {
            let endpoint = Endpoint::from_shared(grpc_url(addr))
                .map_err(|e| Error::InvalidConfig(format!("peer {} address {}: {}", id, addr, e)))?
                .connect_timeout(CONNECT_TIMEOUT)
                .timeout(SEND_TIMEOUT);
            let client = CoordinatorInternalClient::new(endpoint.connect_lazy());
            let (tx, rx) = mpsc::channel(PEER_QUEUE);
            tokio::spawn(Self::sender(id.clone(), client, rx));
            queues.insert(id.clone(), tx);
        }
        Ok(Self { queues })
    }

    async fn sender(
        peer: NodeId,
        mut client: CoordinatorInternalClient<Channel>,
        mut rx: mpsc::Receiver<Envelope>,
    ) {
        let mut failing = false;
        while let Some(envelope) = rx.recv().await {
            let data = match envelope.encode() {
                Ok(data) => data,
                Err(e) => {
                    tracing::error!("Failed to encode message for {}: {}", peer, e);
                    continue;
                }
            };
            match client.step(RaftMessage { data }).await {
                Ok(_) => {
                    if failing {
                        tracing::info!("Raft peer {} reachable again", peer);
                        failing = false;
                    }
                }
                Err(status) => {
                    if !failing {
                        tracing::warn!("Raft peer {} unreachable: {}", peer, status.message());
                        failing = true;
                    }
                }
            }
        }
    }
}

impl Transport for GrpcTransport {
    fn send(&self, envelope: Envelope) {
        let Some(queue) = self.queues.get(&envelope.to) else {
            tracing::warn!("No route to Raft peer {}", envelope.to);
            return;
        };
        if let Err(e) = queue.try_send(envelope) {
            tracing::debug!("Dropping Raft message: {}", e);
        }
    }
}
