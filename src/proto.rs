//! Wire messages for the coordinator gRPC services.
//!
//! Messages are declared with prost derives; the service stubs are generated
//! by `build.rs` and included below.

use std::collections::BTreeMap;

/// Read consistency requested by a caller. `Unspecified` selects the
/// operation's configured default.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ReadConsistency {
    Unspecified = 0,
    Stale = 1,
    LeaseBased = 2,
    Linearizable = 3,
}

// === Raft transport ===

/// A bincode-encoded `raft::Envelope`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RaftMessage {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StepAck {}

// === Control plane ===

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PartitionRange {
    #[prost(uint32, tag = "1")]
    pub start: u32,
    #[prost(uint32, tag = "2")]
    pub end: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NamespaceInfo {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint32, tag = "2")]
    pub partition_id: u32,
    #[prost(btree_map = "string, string", tag = "3")]
    pub config: BTreeMap<String, String>,
    /// Worker currently owning the namespace's partition, empty when no
    /// worker is registered. Always recomputed, never stored.
    #[prost(string, tag = "4")]
    pub owner_worker_id: String,
    #[prost(uint64, tag = "5")]
    pub created_at: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterWorkerRequest {
    #[prost(string, tag = "1")]
    pub worker_id: String,
    #[prost(string, tag = "2")]
    pub address: String,
    #[prost(string, repeated, tag = "3")]
    pub capabilities: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterWorkerResponse {
    #[prost(message, repeated, tag = "1")]
    pub ranges: Vec<PartitionRange>,
    #[prost(message, repeated, tag = "2")]
    pub namespaces: Vec<NamespaceInfo>,
    #[prost(uint32, tag = "3")]
    pub partition_count: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterLauncherRequest {
    #[prost(string, tag = "1")]
    pub launcher_id: String,
    #[prost(string, tag = "2")]
    pub address: String,
    #[prost(string, repeated, tag = "3")]
    pub capabilities: Vec<String>,
    #[prost(uint32, tag = "4")]
    pub max_processes: u32,
}

/// Generic acknowledgement, carrying the admin state revision after apply.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ack {
    #[prost(uint64, tag = "1")]
    pub revision: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateNamespaceRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(btree_map = "string, string", tag = "2")]
    pub config: BTreeMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateNamespaceResponse {
    #[prost(uint32, tag = "1")]
    pub partition_id: u32,
    #[prost(string, tag = "2")]
    pub owner_worker_id: String,
    #[prost(uint64, tag = "3")]
    pub revision: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AssignPlacementRequest {
    #[prost(string, tag = "1")]
    pub unit_id: String,
    #[prost(string, tag = "2")]
    pub namespace: String,
    #[prost(btree_map = "string, string", tag = "3")]
    pub config: BTreeMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AssignPlacementResponse {
    #[prost(string, tag = "1")]
    pub assigned_worker_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatRequest {
    #[prost(string, tag = "1")]
    pub worker_id: String,
    /// Free-form health reported by the worker ("healthy", "degraded", ...).
    #[prost(string, tag = "2")]
    pub health: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LauncherHeartbeatRequest {
    #[prost(string, tag = "1")]
    pub launcher_id: String,
    #[prost(string, tag = "2")]
    pub health: String,
    #[prost(uint32, tag = "3")]
    pub available_slots: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetNamespaceRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(enumeration = "ReadConsistency", tag = "2")]
    pub consistency: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListNamespacesRequest {
    #[prost(enumeration = "ReadConsistency", tag = "1")]
    pub consistency: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListNamespacesResponse {
    #[prost(message, repeated, tag = "1")]
    pub namespaces: Vec<NamespaceInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetClusterStatusRequest {
    #[prost(enumeration = "ReadConsistency", tag = "1")]
    pub consistency: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PeerHealth {
    #[prost(string, tag = "1")]
    pub node_id: String,
    #[prost(string, tag = "2")]
    pub address: String,
    /// "alive", "suspect" or "dead".
    #[prost(string, tag = "3")]
    pub state: String,
    #[prost(uint64, tag = "4")]
    pub last_seen_ms: u64,
    #[prost(bool, tag = "5")]
    pub healthy: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClusterStatus {
    #[prost(string, tag = "1")]
    pub node_id: String,
    #[prost(string, tag = "2")]
    pub leader_id: String,
    #[prost(uint64, tag = "3")]
    pub term: u64,
    #[prost(string, tag = "4")]
    pub role: String,
    #[prost(uint64, tag = "5")]
    pub commit_index: u64,
    #[prost(uint64, tag = "6")]
    pub applied_index: u64,
    #[prost(message, repeated, tag = "7")]
    pub peers: Vec<PeerHealth>,
    #[prost(uint32, tag = "8")]
    pub worker_count: u32,
    #[prost(uint32, tag = "9")]
    pub namespace_count: u32,
    #[prost(uint32, tag = "10")]
    pub launcher_count: u32,
    /// Free process slots summed over launchers.
    #[prost(uint32, tag = "11")]
    pub available_slots: u32,
}

include!(concat!(env!("OUT_DIR"), "/minictl.CoordinatorInternal.rs"));
include!(concat!(env!("OUT_DIR"), "/minictl.ControlPlane.rs"));
