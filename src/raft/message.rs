//! Raft messages exchanged between coordinators.

use super::{Entry, Index, NodeId, ReadSequence, Snapshot, Term, Ticks};
use serde::{Deserialize, Serialize};

/// A message envelope, addressed from one node to another.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    /// The sender's current term.
    pub term: Term,
    pub message: Message,
}

impl Envelope {
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Leader liveness probe. Also advances follower commit indexes, confirms
    /// read sequences and renews the leader's lease.
    Heartbeat {
        /// Leader's commit index. Followers only adopt it if they hold the
        /// matching entry.
        commit_index: Index,
        commit_term: Term,
        read_seq: ReadSequence,
        /// Leader tick at send time, echoed back for lease accounting.
        sent_at: Ticks,
        /// Ticks since the leader last heard from each peer.
        seen: Vec<(NodeId, Ticks)>,
    },

    HeartbeatResponse {
        last_index: Index,
        last_term: Term,
        read_seq: ReadSequence,
        sent_at: Ticks,
    },

    VoteRequest { last_index: Index, last_term: Term },

    VoteResponse { granted: bool },

    /// Entries to splice after (prev_index, prev_term). Empty entries act as a
    /// probe.
    AppendEntries {
        prev_index: Index,
        prev_term: Term,
        entries: Vec<Entry>,
        commit_index: Index,
    },

    /// On success, `last_index` is the highest index known to match the
    /// leader. On rejection it is a hint for the next probe.
    AppendResponse { reject: bool, last_index: Index },

    /// Sent to followers whose next entry was compacted away.
    InstallSnapshot { snapshot: Snapshot },
}

impl Message {
    /// Whether only a leader sends this message.
    pub fn is_from_leader(&self) -> bool {
        matches!(
            self,
            Message::Heartbeat { .. }
                | Message::AppendEntries { .. }
                | Message::InstallSnapshot { .. }
        )
    }
}
