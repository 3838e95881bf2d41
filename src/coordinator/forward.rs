//! Follower-to-leader write forwarding
//!
//! A follower that receives a write relays it to the leader over a pooled
//! channel and returns the leader's response unmodified. The caller's
//! remaining deadline travels with the request as `grpc-timeout`.

use super::service::{WriteRequest, WriteResponse};
use crate::common::{grpc_url, Error, Result};
use crate::proto::control_plane_client::ControlPlaneClient;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint};

/// Metadata key marking a request that has already been forwarded once.
pub const FORWARDED_HEADER: &str = "x-minictl-forwarded";

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Relays a write to the leader.
#[tonic::async_trait]
pub trait Forwarder: Send + Sync + 'static {
    async fn forward(
        &self,
        leader_addr: &str,
        request: WriteRequest,
        timeout: Duration,
    ) -> Result<WriteResponse>;
}

/// Lazily-connected channels keyed by leader address. tonic channels
/// multiplex, so one per address is shared by every request handler.
#[derive(Default)]
pub struct LeaderConnectionPool {
    channels: Mutex<HashMap<String, Channel>>,
}

impl LeaderConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self, addr: &str) -> Result<Channel> {
        let mut channels = self.channels.lock();
        if let Some(channel) = channels.get(addr) {
            return Ok(channel.clone());
        }
        let channel = Endpoint::from_shared(grpc_url(addr))
            .map_err(|e| Error::ConnectionFailed(format!("invalid leader address {}: {}", addr, e)))?
            .connect_timeout(CONNECT_TIMEOUT)
            .connect_lazy();
        channels.insert(addr.to_string(), channel.clone());
        Ok(channel)
    }

    /// Drop the channel for `addr`, so the next request reconnects.
    pub fn evict(&self, addr: &str) {
        self.channels.lock().remove(addr);
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Forwards over the public `ControlPlane` service of the leader.
#[derive(Default)]
pub struct GrpcForwarder {
    pool: LeaderConnectionPool,
}

impl GrpcForwarder {
    pub fn new() -> Self {
        Self::default()
    }
}

fn forwarded<T>(message: T, timeout: Duration) -> tonic::Request<T> {
    let mut request = tonic::Request::new(message);
    request.set_timeout(timeout);
    request
        .metadata_mut()
        .insert(FORWARDED_HEADER, MetadataValue::from_static("1"));
    request
}

#[tonic::async_trait]
impl Forwarder for GrpcForwarder {
    async fn forward(
        &self,
        leader_addr: &str,
        request: WriteRequest,
        timeout: Duration,
    ) -> Result<WriteResponse> {
        let mut client = ControlPlaneClient::new(self.pool.channel(leader_addr)?);
        tracing::debug!("Forwarding {} to leader at {}", request.name(), leader_addr);

        let result = match request {
            WriteRequest::RegisterWorker(r) => client
                .register_worker(forwarded(r, timeout))
                .await
                .map(|resp| WriteResponse::RegisterWorker(resp.into_inner())),
            WriteRequest::RegisterLauncher(r) => client
                .register_launcher(forwarded(r, timeout))
                .await
                .map(|resp| WriteResponse::Ack(resp.into_inner())),
            WriteRequest::CreateNamespace(r) => client
                .create_namespace(forwarded(r, timeout))
                .await
                .map(|resp| WriteResponse::CreateNamespace(resp.into_inner())),
            WriteRequest::AssignPlacement(r) => client
                .assign_placement(forwarded(r, timeout))
                .await
                .map(|resp| WriteResponse::AssignPlacement(resp.into_inner())),
            WriteRequest::Heartbeat(r) => client
                .heartbeat(forwarded(r, timeout))
                .await
                .map(|resp| WriteResponse::Ack(resp.into_inner())),
        };

        result.map_err(|status| {
            if status.code() == tonic::Code::Unavailable {
                self.pool.evict(leader_addr);
            }
            Error::Grpc(status)
        })
    }
}
