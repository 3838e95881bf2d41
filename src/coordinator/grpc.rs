//! Coordinator gRPC services
//!
//! `ControlPlaneGrpc` adapts the public control-plane API onto
//! `ControlPlaneService`. `RaftGrpc` receives Raft messages from peers.
//! Both translate errors with `Error::to_grpc_status`.

use super::forward::FORWARDED_HEADER;
use super::service::{ControlPlaneService, WriteRequest, WriteResponse};
use crate::common::parse_grpc_timeout;
use crate::proto::control_plane_server::{ControlPlane, ControlPlaneServer};
use crate::proto::coordinator_internal_server::{CoordinatorInternal, CoordinatorInternalServer};
use crate::proto::*;
use crate::raft::{Envelope, RaftHandle};

use std::time::Duration;
use tokio::time::Instant;
use tonic::{Request, Response, Status};

/// Headroom kept from the caller's deadline so our own error reaches them
/// before their transport gives up.
const DEADLINE_MARGIN: Duration = Duration::from_millis(10);

/// Server-side deadline derived from an inbound `grpc-timeout` header.
fn deadline<T>(request: &Request<T>) -> Option<Instant> {
    request
        .metadata()
        .get("grpc-timeout")
        .and_then(|value| value.to_str().ok())
        .and_then(parse_grpc_timeout)
        .map(|timeout| Instant::now() + timeout.saturating_sub(DEADLINE_MARGIN))
}

fn is_forwarded<T>(request: &Request<T>) -> bool {
    request.metadata().get(FORWARDED_HEADER).is_some()
}

fn unexpected(response: WriteResponse) -> Status {
    Status::internal(format!("unexpected write response {:?}", response))
}

/// Public control-plane API.
pub struct ControlPlaneGrpc {
    service: ControlPlaneService,
}

impl ControlPlaneGrpc {
    pub fn new(service: ControlPlaneService) -> Self {
        Self { service }
    }

    pub fn into_server(self) -> ControlPlaneServer<Self> {
        ControlPlaneServer::new(self)
    }

    async fn write<T>(
        &self,
        request: Request<T>,
        wrap: fn(T) -> WriteRequest,
    ) -> Result<WriteResponse, Status> {
        let deadline = deadline(&request);
        let forwarded = is_forwarded(&request);
        self.service
            .execute_write(wrap(request.into_inner()), deadline, forwarded)
            .await
            .map_err(|e| e.to_grpc_status())
    }
}

#[tonic::async_trait]
impl ControlPlane for ControlPlaneGrpc {
    async fn register_worker(
        &self,
        req: Request<RegisterWorkerRequest>,
    ) -> Result<Response<RegisterWorkerResponse>, Status> {
        match self.write(req, WriteRequest::RegisterWorker).await? {
            WriteResponse::RegisterWorker(resp) => Ok(Response::new(resp)),
            other => Err(unexpected(other)),
        }
    }

    async fn register_launcher(
        &self,
        req: Request<RegisterLauncherRequest>,
    ) -> Result<Response<Ack>, Status> {
        match self.write(req, WriteRequest::RegisterLauncher).await? {
            WriteResponse::Ack(ack) => Ok(Response::new(ack)),
            other => Err(unexpected(other)),
        }
    }

    async fn create_namespace(
        &self,
        req: Request<CreateNamespaceRequest>,
    ) -> Result<Response<CreateNamespaceResponse>, Status> {
        match self.write(req, WriteRequest::CreateNamespace).await? {
            WriteResponse::CreateNamespace(resp) => Ok(Response::new(resp)),
            other => Err(unexpected(other)),
        }
    }

    async fn assign_placement(
        &self,
        req: Request<AssignPlacementRequest>,
    ) -> Result<Response<AssignPlacementResponse>, Status> {
        match self.write(req, WriteRequest::AssignPlacement).await? {
            WriteResponse::AssignPlacement(resp) => Ok(Response::new(resp)),
            other => Err(unexpected(other)),
        }
    }

    async fn heartbeat(&self, req: Request<HeartbeatRequest>) -> Result<Response<Ack>, Status> {
        match self.write(req, WriteRequest::Heartbeat).await? {
            WriteResponse::Ack(ack) => Ok(Response::new(ack)),
            other => Err(unexpected(other)),
        }
    }

    async fn launcher_heartbeat(
        &self,
        req: Request<LauncherHeartbeatRequest>,
    ) -> Result<Response<Ack>, Status> {
        match self.write(req, WriteRequest::LauncherHeartbeat).await? {
            WriteResponse::Ack(ack) => Ok(Response::new(ack)),
            other => Err(unexpected(other)),
        }
    }

    async fn get_namespace(
        &self,
        req: Request<GetNamespaceRequest>,
    ) -> Result<Response<NamespaceInfo>, Status> {
        let deadline = deadline(&req);
        let req = req.into_inner();
        self.service
            .get_namespace(&req.name, req.consistency, deadline)
            .await
            .map(Response::new)
            .map_err(|e| e.to_grpc_status())
    }

    async fn list_namespaces(
        &self,
        req: Request<ListNamespacesRequest>,
    ) -> Result<Response<ListNamespacesResponse>, Status> {
        let deadline = deadline(&req);
        self.service
            .list_namespaces(req.into_inner().consistency, deadline)
            .await
            .map(Response::new)
            .map_err(|e| e.to_grpc_status())
    }

    async fn get_cluster_status(
        &self,
        req: Request<GetClusterStatusRequest>,
    ) -> Result<Response<ClusterStatus>, Status> {
        let deadline = deadline(&req);
        self.service
            .get_cluster_status(req.into_inner().consistency, deadline)
            .await
            .map(Response::new)
            .map_err(|e| e.to_grpc_status())
    }
}

/// Internal API carrying Raft messages between coordinators.
pub struct RaftGrpc {
    raft: RaftHandle,
}

impl RaftGrpc {
    pub fn new(raft: RaftHandle) -> Self {
        Self { raft }
    }

    pub fn into_server(self) -> CoordinatorInternalServer<Self> {
        CoordinatorInternalServer::new(self)
    }
}

#[tonic::async_trait]
impl CoordinatorInternal for RaftGrpc {
    async fn step(&self, req: Request<RaftMessage>) -> Result<Response<StepAck>, Status> {
        let envelope = Envelope::decode(&req.into_inner().data).map_err(|e| e.to_grpc_status())?;
        if envelope.to != *self.raft.id() {
            return Err(Status::invalid_argument(format!(
                "message for {} delivered to {}",
                envelope.to,
                self.raft.id()
            )));
        }
        self.raft
            .step(envelope)
            .await
            .map_err(|e| e.to_grpc_status())?;
        Ok(Response::new(StepAck {}))
    }
}
