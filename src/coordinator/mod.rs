//! Coordinator control plane
//!
//! The coordinator is responsible for:
//! - Admin metadata (namespaces, workers, launchers, placements), replicated
//!   through Raft and applied by `AdminStateMachine`
//! - Partition assignment (HRW over virtual partitions, always recomputed)
//! - Request routing: local writes on the leader, forwarding on followers,
//!   and reads at the requested consistency level
//! - Peer health reporting

pub mod command;
pub mod forward;
pub mod grpc;
pub mod metadata;
pub mod placement;
pub mod server;
pub mod service;
pub mod state_machine;

pub use command::{Command, CommandOutput, Operation};
pub use forward::{Forwarder, GrpcForwarder, LeaderConnectionPool};
pub use metadata::AdminState;
pub use placement::{PartitionCalculator, PartitionRange};
pub use server::{Coordinator, CoordinatorHandle};
pub use service::{route, ControlPlaneService, Route, WriteRequest, WriteResponse};
pub use state_machine::{AdminReader, AdminStateMachine};
