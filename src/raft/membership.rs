//! Peer liveness tracking.
//!
//! Every node counts ticks since it last heard from each peer. The leader
//! piggybacks its own counts on heartbeats, so followers, which only talk
//! to the leader, still report cluster-wide health.

use super::{NodeId, Ticks};
use crate::common::NodeState;
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq)]
pub struct PeerStatus {
    pub id: NodeId,
    pub state: NodeState,
    /// Ticks since this peer was last heard from, directly or via the leader.
    pub last_seen: Ticks,
}

pub struct Membership {
    id: NodeId,
    last_seen: BTreeMap<NodeId, Ticks>,
    suspect_after: Ticks,
    dead_after: Ticks,
}

impl Membership {
    /// Peers start out suspect until heard from.
    pub fn new(
        id: NodeId,
        peers: impl IntoIterator<Item = NodeId>,
        suspect_after: Ticks,
        dead_after: Ticks,
    ) -> Self {
        Self {
            id,
            last_seen: peers.into_iter().map(|p| (p, suspect_after)).collect(),
            suspect_after,
            dead_after,
        }
    }

    pub fn tick(&mut self) {
        for ticks in self.last_seen.values_mut() {
            *ticks = ticks.saturating_add(1);
        }
    }

    /// Record direct contact with a peer.
    pub fn observe(&mut self, peer: &str) {
        if let Some(ticks) = self.last_seen.get_mut(peer) {
            *ticks = 0;
        }
    }

    /// Merge the leader's view. Only fresher observations are taken.
    pub fn merge(&mut self, report: &[(NodeId, Ticks)]) {
        for (peer, reported) in report {
            if *peer == self.id {
                continue;
            }
            if let Some(ticks) = self.last_seen.get_mut(peer) {
                *ticks = (*ticks).min(*reported);
            }
        }
    }

    /// This node's view, for piggybacking on heartbeats.
    pub fn report(&self) -> Vec<(NodeId, Ticks)> {
        self.last_seen
            .iter()
            .map(|(peer, ticks)| (peer.clone(), *ticks))
            .collect()
    }

    pub fn health(&self, peer: &str) -> Option<NodeState> {
        self.last_seen.get(peer).map(|ticks| self.classify(*ticks))
    }

    fn classify(&self, ticks: Ticks) -> NodeState {
        if ticks < self.suspect_after {
            NodeState::Alive
        } else if ticks < self.dead_after {
            NodeState::Suspect
        } else {
            NodeState::Dead
        }
    }

    /// Status of every peer, in node ID order.
    pub fn peers(&self) -> Vec<PeerStatus> {
        self.last_seen
            .iter()
            .map(|(peer, ticks)| PeerStatus {
                id: peer.clone(),
                state: self.classify(*ticks),
                last_seen: *ticks,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn membership() -> Membership {
        Membership::new("n1".into(), vec!["n2".into(), "n3".into()], 3, 6)
    }

    #[test]
    fn test_health_transitions() {
        let mut m = membership();
        assert_eq!(m.health("n2"), Some(NodeState::Suspect));

        m.observe("n2");
        assert_eq!(m.health("n2"), Some(NodeState::Alive));

        for _ in 0..3 {
            m.tick();
        }
        assert_eq!(m.health("n2"), Some(NodeState::Suspect));

        for _ in 0..3 {
            m.tick();
        }
        assert_eq!(m.health("n2"), Some(NodeState::Dead));
        assert_eq!(m.health("unknown"), None);
    }

    #[test]
    fn test_merge_takes_fresher_view() {
        let mut m = membership();
        for _ in 0..10 {
            m.tick();
        }
        m.merge(&[("n3".into(), 1), ("n1".into(), 0)]);
        assert_eq!(m.health("n3"), Some(NodeState::Alive));
        assert_eq!(m.health("n2"), Some(NodeState::Dead));

        // A staler report never makes a peer look older.
        m.observe("n2");
        m.merge(&[("n2".into(), 9)]);
        assert_eq!(m.health("n2"), Some(NodeState::Alive));
    }
}
