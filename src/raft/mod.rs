//! Raft consensus for the coordinator group.
//!
//! Coordinators replicate an ordered log of admin commands. Once an entry is
//! stored on a quorum it is committed, and every node applies committed
//! entries to its state machine in log order, so all replicas converge on
//! the same admin state.
//!
//! The protocol core (`RaftNode`) is synchronous and deterministic: it is
//! driven by `tick()` for the passage of time, `step()` for inbound peer
//! messages and `request()` for client requests, and it emits outbound
//! messages and client responses through queues drained by its caller. The
//! async `RaftServer` owns one node and drives it from a tokio event loop;
//! tests drive nodes directly.
//!
//! Beyond the basic algorithm the node implements:
//!
//! * A no-op entry on election, since a leader may only commit entries from
//!   its own term by counting replicas.
//! * Read indexes. `VerifyLeader` registers a read sequence number that is
//!   confirmed by a quorum heartbeat round issued after the request.
//! * Leader leases. Heartbeats carry the leader's clock and responses echo
//!   it; the lease holds while a quorum acknowledged a heartbeat sent within
//!   the lease duration. Followers that heard from their leader within the
//!   minimum election timeout refuse to vote for anyone else, which is what
//!   keeps the lease exclusive.
//! * Check-quorum. A leader that has not heard from a quorum for an
//!   election timeout steps down, so an isolated minority leader stops
//!   accepting requests.
//! * Snapshots and compaction, with `InstallSnapshot` for followers that
//!   fall behind the compaction point.

mod log;
mod membership;
mod message;
mod node;
mod server;
mod store;
mod transport;

pub use self::log::{Entry, RaftLog};
pub use membership::{Membership, PeerStatus};
pub use message::{Envelope, Message};
pub use node::{NodeStatus, RaftNode, RaftOptions, RaftRole, Request, RequestId, Response};
pub use server::{RaftHandle, RaftServer};
pub use store::{FileStore, HardState, LogStore, MemoryStore, StoredLog};
pub use transport::{GrpcTransport, Transport};

use crate::common::Result;
use serde::{Deserialize, Serialize};

/// A node ID, unique in the cluster.
pub type NodeId = String;

/// A leader term.
pub type Term = u64;

/// A log index. Starts at 1; 0 means "none".
pub type Index = u64;

/// A logical clock interval as number of ticks.
pub type Ticks = u64;

/// A read sequence number, used to confirm leadership for read indexes.
pub type ReadSequence = u64;

/// A state machine snapshot, taken at `last_index`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_index: Index,
    pub last_term: Term,
    /// Version of the serialized state layout.
    pub schema_version: u32,
    pub data: Vec<u8>,
}

/// A replicated state machine, fed committed entries in log order.
///
/// Implementations must be deterministic: the same entries applied to the
/// same state must produce the same state on every node.
pub trait StateMachine: Send {
    /// Index of the last applied entry.
    fn applied_index(&self) -> Index;

    /// Apply a committed entry. An error is the command's outcome, returned
    /// to the proposer; the entry is applied either way.
    fn apply(&mut self, entry: &Entry) -> Result<Vec<u8>>;

    /// Capture the full state at the applied index, as one atomic view.
    fn snapshot(&self) -> Result<Snapshot>;

    /// Replace the full state with a snapshot.
    fn restore(&mut self, snapshot: &Snapshot) -> Result<()>;
}
