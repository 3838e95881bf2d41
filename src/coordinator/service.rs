//! Control-plane request handling
//!
//! Writes run on the leader. A follower forwards them once, to the leader
//! it currently knows about; with no known leader the write fails fast with
//! `Unavailable`. Reads run at one of three consistency levels:
//!
//! - `Stale`: any node, from the local state machine.
//! - `LeaseBased`: leader only, trusting the leader lease. Falls back to a
//!   quorum round when the lease has lapsed.
//! - `Linearizable`: leader only, after a quorum round confirms leadership
//!   and the read index is applied.

use super::command::{Command, CommandOutput, Operation};
use super::forward::Forwarder;
use super::metadata::{AdminState, NamespaceEntry};
use super::placement::{PartitionCalculator, PartitionRange};
use super::state_machine::AdminReader;
use crate::common::{timestamp_now_millis, ConsistencyLevel, Error, ReadConsistencyTable, Result};
use crate::proto;
use crate::raft::{NodeId, RaftHandle};

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Where a write should execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// This node is leader.
    Local,
    /// Relay to the leader at this address.
    Forward(String),
    /// No leader is known.
    Unavailable,
}

/// Decide where a write executes, from the local role and known leader.
pub fn route(is_leader: bool, leader_address: Option<String>) -> Route {
    match (is_leader, leader_address) {
        (true, _) => Route::Local,
        (false, Some(addr)) => Route::Forward(addr),
        (false, None) => Route::Unavailable,
    }
}

/// A write as received on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteRequest {
    RegisterWorker(proto::RegisterWorkerRequest),
    RegisterLauncher(proto::RegisterLauncherRequest),
    CreateNamespace(proto::CreateNamespaceRequest),
    AssignPlacement(proto::AssignPlacementRequest),
    Heartbeat(proto::HeartbeatRequest),
    LauncherHeartbeat(proto::LauncherHeartbeatRequest),
}

impl WriteRequest {
    pub fn name(&self) -> &'static str {
        match self {
            WriteRequest::RegisterWorker(_) => "RegisterWorker",
            WriteRequest::RegisterLauncher(_) => "RegisterLauncher",
            WriteRequest::CreateNamespace(_) => "CreateNamespace",
            WriteRequest::AssignPlacement(_) => "AssignPlacement",
            WriteRequest::Heartbeat(_) => "Heartbeat",
            WriteRequest::LauncherHeartbeat(_) => "LauncherHeartbeat",
        }
    }

    /// The replicated command for this request, stamped with `timestamp`.
    pub fn to_command(&self, timestamp: u64) -> Command {
        let op = match self {
            WriteRequest::RegisterWorker(r) => Operation::RegisterWorker {
                worker_id: r.worker_id.clone(),
                address: r.address.clone(),
                capabilities: r.capabilities.clone(),
            },
            WriteRequest::RegisterLauncher(r) => Operation::RegisterLauncher {
                launcher_id: r.launcher_id.clone(),
                address: r.address.clone(),
                capabilities: r.capabilities.clone(),
                max_processes: r.max_processes,
            },
            WriteRequest::CreateNamespace(r) => Operation::CreateNamespace {
                name: r.name.clone(),
                config: r.config.clone(),
            },
            WriteRequest::AssignPlacement(r) => Operation::AssignPlacement {
                unit_id: r.unit_id.clone(),
                namespace: r.namespace.clone(),
                config: r.config.clone(),
            },
            WriteRequest::Heartbeat(r) => Operation::UpdateWorkerStatus {
                worker_id: r.worker_id.clone(),
                health: r.health.clone(),
            },
            WriteRequest::LauncherHeartbeat(r) => Operation::UpdateLauncherStatus {
                launcher_id: r.launcher_id.clone(),
                health: r.health.clone(),
                available_slots: r.available_slots,
            },
        };
        Command::new(timestamp, op)
    }
}

/// The leader's answer to a write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteResponse {
    RegisterWorker(proto::RegisterWorkerResponse),
    CreateNamespace(proto::CreateNamespaceResponse),
    AssignPlacement(proto::AssignPlacementResponse),
    Ack(proto::Ack),
}

/// Pick the effective level for a read from the wire value and the
/// operation's default.
pub fn resolve_consistency(requested: i32, default: ConsistencyLevel) -> Result<ConsistencyLevel> {
    match proto::ReadConsistency::try_from(requested) {
        Ok(proto::ReadConsistency::Unspecified) => Ok(default),
        Ok(proto::ReadConsistency::Stale) => Ok(ConsistencyLevel::Stale),
        Ok(proto::ReadConsistency::LeaseBased) => Ok(ConsistencyLevel::LeaseBased),
        Ok(proto::ReadConsistency::Linearizable) => Ok(ConsistencyLevel::Linearizable),
        Err(_) => Err(Error::InvalidCommand(format!(
            "unknown consistency level {}",
            requested
        ))),
    }
}

pub(crate) fn namespace_info(ns: &NamespaceEntry, owner: Option<&str>) -> proto::NamespaceInfo {
    proto::NamespaceInfo {
        name: ns.name.clone(),
        partition_id: ns.partition_id,
        config: ns.config.clone(),
        owner_worker_id: owner.unwrap_or_default().to_string(),
        created_at: ns.created_at,
    }
}

fn range_info(range: &PartitionRange) -> proto::PartitionRange {
    proto::PartitionRange {
        start: range.start,
        end: range.end,
    }
}

/// Time left before `deadline`, capped at `cap`.
fn remaining(deadline: Option<Instant>, cap: Duration) -> Result<Duration> {
    let Some(deadline) = deadline else {
        return Ok(cap);
    };
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(Error::DeadlineExceeded("deadline expired before dispatch".into()));
    }
    Ok(left.min(cap))
}

/// The transport-agnostic control-plane service.
#[derive(Clone)]
pub struct ControlPlaneService {
    raft: RaftHandle,
    reader: AdminReader,
    calculator: PartitionCalculator,
    forwarder: Arc<dyn Forwarder>,
    consistency: ReadConsistencyTable,
    apply_timeout: Duration,
    tick_interval: Duration,
}

impl ControlPlaneService {
    pub fn new(
        raft: RaftHandle,
        reader: AdminReader,
        calculator: PartitionCalculator,
        forwarder: Arc<dyn Forwarder>,
        consistency: ReadConsistencyTable,
        apply_timeout: Duration,
        tick_interval: Duration,
    ) -> Self {
        Self {
            raft,
            reader,
            calculator,
            forwarder,
            consistency,
            apply_timeout,
            tick_interval,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        self.raft.id()
    }

    pub fn raft(&self) -> &RaftHandle {
        &self.raft
    }

    pub fn reader(&self) -> &AdminReader {
        &self.reader
    }

    // === Writes ===

    /// Execute a write here if leader, otherwise forward it to the leader.
    /// `forwarded` marks a request relayed by another node; those are never
    /// forwarded again.
    pub async fn execute_write(
        &self,
        request: WriteRequest,
        deadline: Option<Instant>,
        forwarded: bool,
    ) -> Result<WriteResponse> {
        // Malformed requests can never succeed; reject them before routing.
        request.to_command(0).validate()?;
        let timeout = remaining(deadline, self.apply_timeout)?;

        match route(self.raft.is_leader(), self.raft.leader_address()) {
            Route::Local => self.apply_local(request, timeout).await,
            Route::Forward(_) if forwarded => Err(Error::NotLeader(self.raft.leader())),
            Route::Forward(addr) => self.forwarder.forward(&addr, request, timeout).await,
            Route::Unavailable => Err(Error::Unavailable("no leader elected".into())),
        }
    }

    async fn apply_local(&self, request: WriteRequest, timeout: Duration) -> Result<WriteResponse> {
        let command = request.to_command(timestamp_now_millis());
        debug!("Proposing {}", command.idempotency_key());
        let output = self.raft.apply(command.encode()?, timeout).await?;
        self.write_response(&request, CommandOutput::decode(&output)?)
    }

    fn write_response(&self, request: &WriteRequest, output: CommandOutput) -> Result<WriteResponse> {
        let response = match (request, output) {
            (
                WriteRequest::RegisterWorker(r),
                CommandOutput::WorkerRegistered {
                    ranges, namespaces, ..
                },
            ) => WriteResponse::RegisterWorker(proto::RegisterWorkerResponse {
                ranges: ranges.iter().map(range_info).collect(),
                namespaces: namespaces
                    .iter()
                    .map(|ns| namespace_info(ns, Some(&r.worker_id)))
                    .collect(),
                partition_count: self.calculator.num_partitions(),
            }),
            (
                WriteRequest::CreateNamespace(_),
                CommandOutput::NamespaceCreated {
                    partition_id,
                    owner,
                    revision,
                    ..
                },
            ) => WriteResponse::CreateNamespace(proto::CreateNamespaceResponse {
                partition_id,
                owner_worker_id: owner.unwrap_or_default(),
                revision,
            }),
            (WriteRequest::AssignPlacement(_), CommandOutput::PlacementAssigned { worker_id, .. }) => {
                WriteResponse::AssignPlacement(proto::AssignPlacementResponse {
                    assigned_worker_id: worker_id,
                })
            }
            (WriteRequest::RegisterLauncher(_), CommandOutput::LauncherRegistered { revision, .. })
            | (WriteRequest::Heartbeat(_), CommandOutput::WorkerStatusUpdated { revision })
            | (
                WriteRequest::LauncherHeartbeat(_),
                CommandOutput::LauncherStatusUpdated { revision },
            ) => {
                WriteResponse::Ack(proto::Ack { revision })
            }
            (request, output) => {
                return Err(Error::Internal(format!(
                    "{} produced unexpected output {:?}",
                    request.name(),
                    output
                )))
            }
        };
        Ok(response)
    }

    // === Reads ===

    /// Wait until a read at `level` may be served from the local state.
    pub async fn read_barrier(&self, level: ConsistencyLevel, deadline: Option<Instant>) -> Result<()> {
        if level == ConsistencyLevel::Stale {
            return Ok(());
        }
        if !self.raft.is_leader() {
            return Err(match self.raft.leader() {
                Some(leader) => Error::NotLeader(Some(leader)),
                None => Error::Unavailable("no leader elected".into()),
            });
        }
        if level == ConsistencyLevel::LeaseBased && self.raft.lease_valid().await {
            return Ok(());
        }
        debug!("Confirming leadership for {} read", level);
        let timeout = remaining(deadline, self.apply_timeout)?;
        self.raft.verify_leader(timeout).await.map(|_| ())
    }

    pub async fn get_namespace(
        &self,
        name: &str,
        consistency: i32,
        deadline: Option<Instant>,
    ) -> Result<proto::NamespaceInfo> {
        let level = resolve_consistency(consistency, self.consistency.get_namespace)?;
        self.read_barrier(level, deadline).await?;
        self.reader
            .read(|state| {
                state
                    .namespaces
                    .get(name)
                    .map(|ns| self.namespace_info_in(state, ns))
            })
            .ok_or_else(|| Error::NotFound(format!("namespace {}", name)))
    }

    pub async fn list_namespaces(
        &self,
        consistency: i32,
        deadline: Option<Instant>,
    ) -> Result<proto::ListNamespacesResponse> {
        let level = resolve_consistency(consistency, self.consistency.list_namespaces)?;
        self.read_barrier(level, deadline).await?;
        let namespaces = self.reader.read(|state| {
            state
                .namespaces
                .values()
                .map(|ns| self.namespace_info_in(state, ns))
                .collect()
        });
        Ok(proto::ListNamespacesResponse { namespaces })
    }

    pub async fn get_cluster_status(
        &self,
        consistency: i32,
        deadline: Option<Instant>,
    ) -> Result<proto::ClusterStatus> {
        let level = resolve_consistency(consistency, self.consistency.get_cluster_status)?;
        self.read_barrier(level, deadline).await?;

        let status = self.raft.status();
        let tick_ms = self.tick_interval.as_millis() as u64;
        let peers = status
            .peers
            .iter()
            .map(|peer| proto::PeerHealth {
                node_id: peer.id.clone(),
                address: self.raft.address_of(&peer.id).unwrap_or_default(),
                state: peer.state.to_string(),
                last_seen_ms: peer.last_seen.saturating_mul(tick_ms),
                healthy: peer.state.is_healthy(),
            })
            .collect();
        let (worker_count, namespace_count, launcher_count, available_slots) =
            self.reader.read(|state| {
                (
                    state.workers.len() as u32,
                    state.namespaces.len() as u32,
                    state.launchers.len() as u32,
                    state
                        .launchers
                        .values()
                        .fold(0u32, |acc, l| acc.saturating_add(l.available_slots)),
                )
            });

        Ok(proto::ClusterStatus {
            node_id: status.id,
            leader_id: status.leader.unwrap_or_default(),
            term: status.term,
            role: status.role.to_string(),
            commit_index: status.commit_index,
            applied_index: status.applied_index,
            peers,
            worker_count,
            namespace_count,
            launcher_count,
            available_slots,
        })
    }

    fn namespace_info_in(&self, state: &AdminState, ns: &NamespaceEntry) -> proto::NamespaceInfo {
        let workers = state.worker_ids();
        namespace_info(ns, self.calculator.owner_of(ns.partition_id, &workers))
    }
}
