use super::{
    Entry, Envelope, Index, LogStore, Membership, Message, NodeId, PeerStatus, RaftLog,
    ReadSequence, Snapshot, StateMachine, Term, Ticks,
};
use crate::common::{CoordinatorConfig, Error, Result};

use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng as _};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, info, warn};

/// Identifies a client request within one node.
pub type RequestId = u64;

/// A client request to the Raft node.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    /// Replicate and apply a command.
    Write(Vec<u8>),
    /// Confirm leadership with a quorum round and return a read index.
    VerifyLeader,
}

/// A response to a client request.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    /// The state machine's output for the applied command.
    Write(Vec<u8>),
    /// Leadership confirmed. Entries up to this index are applied.
    ReadIndex(Index),
}

/// The externally visible Raft role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Timing and log-retention settings, in ticks and entries.
#[derive(Clone, Debug)]
pub struct RaftOptions {
    pub heartbeat_interval: Ticks,
    /// Lower bound of the randomized election timeout `[t, 2t)`.
    pub election_timeout: Ticks,
    /// Must be shorter than `election_timeout`. 0 disables the lease.
    pub lease: Ticks,
    /// Applied entries between snapshots. 0 disables snapshots.
    pub snapshot_threshold: u64,
    pub trailing_logs: u64,
    pub suspect_after: Ticks,
    pub dead_after: Ticks,
    /// Maximum entries per `AppendEntries`.
    pub max_append_entries: usize,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self::from_config(&CoordinatorConfig::default())
    }
}

impl RaftOptions {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            heartbeat_interval: config.ticks(config.heartbeat_interval_ms),
            election_timeout: config.ticks(config.election_timeout_ms),
            lease: match config.lease_duration_ms {
                0 => 0,
                ms => config.ticks(ms),
            },
            snapshot_threshold: config.snapshot_threshold,
            trailing_logs: config.trailing_logs,
            suspect_after: config.ticks(config.suspect_after_ms),
            dead_after: config.ticks(config.dead_after_ms),
            max_append_entries: 64,
        }
    }
}

/// A point-in-time view of a node, for status reporting.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: RaftRole,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub commit_index: Index,
    pub applied_index: Index,
    pub last_index: Index,
    pub snapshot_index: Index,
    pub peers: Vec<PeerStatus>,
}

struct Follower {
    /// Known leader in the current term.
    leader: Option<NodeId>,
    /// Ticks since the leader (or a vote grant) was last seen.
    leader_seen: Ticks,
    election_timeout: Ticks,
}

struct Candidate {
    votes: BTreeSet<NodeId>,
    election_duration: Ticks,
    election_timeout: Ticks,
}

/// Replication progress of one follower.
struct Progress {
    /// Next index to send.
    next: Index,
    /// Highest index known to match the leader's log.
    matched: Index,
    /// Highest read sequence confirmed by the follower.
    read_seq: ReadSequence,
    /// Highest echoed heartbeat send time.
    lease_ack: Option<Ticks>,
}

struct PendingRead {
    seq: ReadSequence,
    id: RequestId,
}

struct Leader {
    progress: BTreeMap<NodeId, Progress>,
    since_heartbeat: Ticks,
    read_seq: ReadSequence,
    /// Proposed writes awaiting application, by log index.
    writes: BTreeMap<Index, RequestId>,
    reads: VecDeque<PendingRead>,
    /// Peers heard from during the current check-quorum window.
    active: BTreeSet<NodeId>,
    since_quorum_check: Ticks,
}

enum Role {
    Follower(Follower),
    Candidate(Candidate),
    Leader(Leader),
}

/// A Raft node. See the module docs for the driving model.
pub struct RaftNode {
    id: NodeId,
    peers: BTreeSet<NodeId>,
    log: RaftLog,
    state: Box<dyn StateMachine>,
    opts: RaftOptions,
    role: Role,
    /// Local logical clock.
    now: Ticks,
    rng: StdRng,
    membership: Membership,
    outbox: Vec<Envelope>,
    responses: Vec<(RequestId, Result<Response>)>,
}

impl RaftNode {
    /// Recover a node from its store and state machine. The node starts as a
    /// leaderless follower, or as leader when it has no peers.
    pub fn new(
        id: NodeId,
        peers: BTreeSet<NodeId>,
        store: Box<dyn LogStore>,
        mut state: Box<dyn StateMachine>,
        opts: RaftOptions,
        seed: u64,
    ) -> Result<Self> {
        if peers.contains(&id) {
            return Err(Error::InvalidConfig(format!("node {} lists itself as peer", id)));
        }
        if opts.lease >= opts.election_timeout || opts.heartbeat_interval >= opts.election_timeout
        {
            return Err(Error::InvalidConfig(
                "heartbeat interval and lease must be shorter than the election timeout".into(),
            ));
        }

        let log = RaftLog::new(store)?;
        if let Some(snapshot) = log.snapshot() {
            if state.applied_index() < snapshot.last_index {
                info!(
                    "Restoring state machine from snapshot at index {}",
                    snapshot.last_index
                );
                state.restore(snapshot)?;
            }
        }

        let membership = Membership::new(
            id.clone(),
            peers.iter().cloned(),
            opts.suspect_after,
            opts.dead_after,
        );
        let mut rng = StdRng::seed_from_u64(seed);
        let election_timeout = rng.gen_range(opts.election_timeout..opts.election_timeout * 2);

        let mut node = Self {
            id,
            peers,
            log,
            state,
            opts,
            role: Role::Follower(Follower {
                leader: None,
                leader_seen: 0,
                election_timeout,
            }),
            now: 0,
            rng,
            membership,
            outbox: Vec::new(),
            responses: Vec::new(),
        };

        // Catch up on entries committed before the restart.
        node.apply_committed()?;
        info!(
            "Raft node {} starting at term {} (commit {}, applied {})",
            node.id,
            node.log.term(),
            node.log.commit_index(),
            node.state.applied_index()
        );

        if node.peers.is_empty() {
            node.campaign()?;
        }
        Ok(node)
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn term(&self) -> Term {
        self.log.term()
    }

    pub fn role(&self) -> RaftRole {
        match self.role {
            Role::Follower(_) => RaftRole::Follower,
            Role::Candidate(_) => RaftRole::Candidate,
            Role::Leader(_) => RaftRole::Leader,
        }
    }

    /// The leader of the current term, if known.
    pub fn leader(&self) -> Option<&NodeId> {
        match &self.role {
            Role::Follower(f) => f.leader.as_ref(),
            Role::Candidate(_) => None,
            Role::Leader(_) => Some(&self.id),
        }
    }

    pub fn commit_index(&self) -> Index {
        self.log.commit_index()
    }

    pub fn applied_index(&self) -> Index {
        self.state.applied_index()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id.clone(),
            role: self.role(),
            term: self.term(),
            leader: self.leader().cloned(),
            commit_index: self.log.commit_index(),
            applied_index: self.state.applied_index(),
            last_index: self.log.last_index(),
            snapshot_index: self.log.snapshot_index(),
            peers: self.membership.peers(),
        }
    }

    /// Drain outbound messages.
    pub fn take_outbox(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.outbox)
    }

    /// Drain client responses.
    pub fn take_responses(&mut self) -> Vec<(RequestId, Result<Response>)> {
        std::mem::take(&mut self.responses)
    }

    fn quorum_size(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// The value reached by a quorum of nodes, given one value per node.
    fn quorum_value<T: Ord + Copy>(&self, mut values: Vec<T>) -> T {
        values.sort_unstable_by(|a, b| b.cmp(a));
        values[self.quorum_size() - 1]
    }

    fn random_election_timeout(&mut self) -> Ticks {
        self.rng
            .gen_range(self.opts.election_timeout..self.opts.election_timeout * 2)
    }

    fn send(&mut self, to: &NodeId, message: Message) {
        self.outbox.push(Envelope {
            from: self.id.clone(),
            to: to.clone(),
            term: self.log.term(),
            message,
        });
    }

    fn broadcast(&mut self, message: Message) {
        let peers: Vec<NodeId> = self.peers.iter().cloned().collect();
        for peer in &peers {
            self.send(peer, message.clone());
        }
    }

    /// Whether this leader holds an unexpired lease: a quorum acknowledged a
    /// heartbeat sent less than `lease` ticks ago, and an entry from the
    /// current term is committed.
    pub fn lease_valid(&self) -> bool {
        let Role::Leader(leader) = &self.role else {
            return false;
        };
        if self.log.commit_term() != self.log.term() {
            return false;
        }
        let mut acks: Vec<Option<Ticks>> =
            leader.progress.values().map(|p| p.lease_ack).collect();
        acks.push(Some(self.now));
        match self.quorum_value(acks) {
            Some(sent_at) => self.now - sent_at < self.opts.lease,
            None => false,
        }
    }

    /// Advance time by one tick.
    pub fn tick(&mut self) -> Result<()> {
        self.now += 1;
        self.membership.tick();
        let quorum = self.quorum_size();

        match &mut self.role {
            Role::Follower(f) => {
                f.leader_seen += 1;
                if f.leader_seen >= f.election_timeout {
                    return self.campaign();
                }
            }
            Role::Candidate(c) => {
                c.election_duration += 1;
                if c.election_duration >= c.election_timeout {
                    return self.campaign();
                }
            }
            Role::Leader(l) => {
                l.since_heartbeat += 1;
                l.since_quorum_check += 1;
                if l.since_quorum_check >= self.opts.election_timeout {
                    let active = l.active.len() + 1;
                    l.active.clear();
                    l.since_quorum_check = 0;
                    if active < quorum {
                        warn!(
                            "Leader {} heard from {} of {} nodes, stepping down",
                            self.id,
                            active,
                            self.peers.len() + 1
                        );
                        let term = self.log.term();
                        return self.become_follower(term, None);
                    }
                }
                if l.since_heartbeat >= self.opts.heartbeat_interval {
                    self.heartbeat();
                }
            }
        }
        Ok(())
    }

    /// Process an inbound message.
    pub fn step(&mut self, envelope: Envelope) -> Result<()> {
        if envelope.to != self.id || !self.peers.contains(&envelope.from) {
            warn!(
                "Dropping misaddressed message from {} to {}",
                envelope.from, envelope.to
            );
            return Ok(());
        }
        self.membership.observe(&envelope.from);

        if envelope.term < self.log.term() {
            debug!(
                "Dropping message from {} with stale term {}",
                envelope.from, envelope.term
            );
            return Ok(());
        }

        if envelope.term > self.log.term() {
            if matches!(envelope.message, Message::VoteRequest { .. }) && self.has_recent_leader()
            {
                debug!(
                    "Ignoring vote request from {} while following a live leader",
                    envelope.from
                );
                return Ok(());
            }
            let leader = envelope
                .message
                .is_from_leader()
                .then(|| envelope.from.clone());
            self.become_follower(envelope.term, leader)?;
        }

        match self.role {
            Role::Follower(_) => self.step_follower(envelope),
            Role::Candidate(_) => self.step_candidate(envelope),
            Role::Leader(_) => self.step_leader(envelope),
        }
    }

    /// Whether this follower heard from its leader within the minimum
    /// election timeout.
    fn has_recent_leader(&self) -> bool {
        match &self.role {
            Role::Follower(f) => {
                f.leader.is_some() && f.leader_seen < self.opts.election_timeout
            }
            _ => false,
        }
    }

    /// Submit a client request. The outcome arrives via `take_responses`.
    pub fn request(&mut self, id: RequestId, request: Request) -> Result<()> {
        if !matches!(self.role, Role::Leader(_)) {
            let error = match self.leader() {
                Some(leader) => Error::NotLeader(Some(leader.clone())),
                None => Error::Unavailable("no leader elected".into()),
            };
            self.responses.push((id, Err(error)));
            return Ok(());
        }

        match request {
            Request::Write(command) => {
                let index = self.log.append(Some(command))?;
                if let Role::Leader(l) = &mut self.role {
                    l.writes.insert(index, id);
                }
                self.replicate()?;
            }
            Request::VerifyLeader => {
                if let Role::Leader(l) = &mut self.role {
                    l.read_seq += 1;
                    let seq = l.read_seq;
                    l.reads.push_back(PendingRead { seq, id });
                }
                if self.peers.is_empty() {
                    self.maybe_resolve_reads();
                } else {
                    self.heartbeat();
                }
            }
        }
        Ok(())
    }

    fn become_follower(&mut self, term: Term, leader: Option<NodeId>) -> Result<()> {
        if term > self.log.term() {
            self.log.set_term(term, None)?;
        }

        let old = std::mem::replace(
            &mut self.role,
            Role::Follower(Follower {
                leader: leader.clone(),
                leader_seen: 0,
                election_timeout: 0,
            }),
        );
        let election_timeout = self.random_election_timeout();
        if let Role::Follower(f) = &mut self.role {
            f.election_timeout = election_timeout;
        }

        if let Role::Leader(l) = old {
            info!("Node {} lost leadership in term {}", self.id, term);
            for (_, id) in l.writes {
                self.responses
                    .push((id, Err(Error::Unavailable("leadership lost".into()))));
            }
            for read in l.reads {
                self.responses
                    .push((read.id, Err(Error::Unavailable("leadership lost".into()))));
            }
        }
        match &leader {
            Some(leader) => info!("Node {} following leader {} in term {}", self.id, leader, term),
            None => debug!("Node {} is a leaderless follower in term {}", self.id, term),
        }
        Ok(())
    }

    /// Start an election in a new term.
    fn campaign(&mut self) -> Result<()> {
        let term = self.log.term() + 1;
        info!("Node {} starting election for term {}", self.id, term);
        self.log.set_term(term, Some(self.id.clone()))?;

        let election_timeout = self.random_election_timeout();
        self.role = Role::Candidate(Candidate {
            votes: BTreeSet::from([self.id.clone()]),
            election_duration: 0,
            election_timeout,
        });

        if self.quorum_size() == 1 {
            return self.become_leader();
        }
        let message = Message::VoteRequest {
            last_index: self.log.last_index(),
            last_term: self.log.last_term(),
        };
        self.broadcast(message);
        Ok(())
    }

    fn become_leader(&mut self) -> Result<()> {
        let term = self.log.term();
        info!("Node {} won election, now leader in term {}", self.id, term);

        let next = self.log.last_index() + 1;
        let progress = self
            .peers
            .iter()
            .map(|peer| {
                (
                    peer.clone(),
                    Progress {
                        next,
                        matched: 0,
                        read_seq: 0,
                        lease_ack: None,
                    },
                )
            })
            .collect();
        self.role = Role::Leader(Leader {
            progress,
            since_heartbeat: 0,
            read_seq: 0,
            writes: BTreeMap::new(),
            reads: VecDeque::new(),
            active: BTreeSet::new(),
            since_quorum_check: 0,
        });

        // Entries from earlier terms commit once this no-op does.
        self.log.append(None)?;
        self.heartbeat();
        self.replicate()
    }

    fn step_follower(&mut self, envelope: Envelope) -> Result<()> {
        let Envelope { from, message, .. } = envelope;

        if message.is_from_leader() {
            let Role::Follower(f) = &mut self.role else {
                return Ok(());
            };
            match &f.leader {
                None => {
                    info!("Node {} following leader {} in term {}", self.id, from, self.log.term());
                    f.leader = Some(from.clone());
                }
                Some(leader) if *leader != from => {
                    warn!(
                        "Second leader {} seen in term {} (following {})",
                        from,
                        self.log.term(),
                        leader
                    );
                    return Ok(());
                }
                Some(_) => {}
            }
            f.leader_seen = 0;
        }

        match message {
            Message::Heartbeat {
                commit_index,
                commit_term,
                read_seq,
                sent_at,
                seen,
            } => {
                self.membership.merge(&seen);
                if self.log.has(commit_index, commit_term) && commit_index <= self.log.last_index()
                {
                    self.log.commit(commit_index)?;
                    self.apply_committed()?;
                }
                let response = Message::HeartbeatResponse {
                    last_index: self.log.last_index(),
                    last_term: self.log.last_term(),
                    read_seq,
                    sent_at,
                };
                self.send(&from, response);
            }

            Message::AppendEntries {
                prev_index,
                prev_term,
                entries,
                commit_index,
            } => {
                if !self.log.has(prev_index, prev_term) {
                    debug!("Rejecting append at {}@{} from {}", prev_index, prev_term, from);
                    let hint = prev_index.saturating_sub(1).min(self.log.last_index());
                    self.send(
                        &from,
                        Message::AppendResponse {
                            reject: true,
                            last_index: hint,
                        },
                    );
                    return Ok(());
                }
                let matched = prev_index + entries.len() as u64;
                self.log.splice(entries)?;
                let commit = commit_index.min(matched);
                if commit > self.log.commit_index() {
                    self.log.commit(commit)?;
                    self.apply_committed()?;
                }
                self.send(
                    &from,
                    Message::AppendResponse {
                        reject: false,
                        last_index: matched,
                    },
                );
            }

            Message::InstallSnapshot { snapshot } => {
                let last_index = if snapshot.last_index <= self.log.commit_index() {
                    self.log.commit_index()
                } else {
                    info!(
                        "Installing snapshot at index {} from {}",
                        snapshot.last_index, from
                    );
                    let last_index = snapshot.last_index;
                    self.state.restore(&snapshot)?;
                    self.log.install_snapshot(snapshot)?;
                    last_index
                };
                self.send(
                    &from,
                    Message::AppendResponse {
                        reject: false,
                        last_index,
                    },
                );
            }

            Message::VoteRequest {
                last_index,
                last_term,
            } => self.handle_vote_request(from, last_index, last_term)?,

            // Responses from a previous role in this term.
            Message::VoteResponse { .. }
            | Message::HeartbeatResponse { .. }
            | Message::AppendResponse { .. } => {}
        }
        Ok(())
    }

    fn handle_vote_request(
        &mut self,
        from: NodeId,
        last_index: Index,
        last_term: Term,
    ) -> Result<()> {
        let has_leader = matches!(&self.role, Role::Follower(f) if f.leader.is_some())
            || matches!(self.role, Role::Leader(_));
        let can_vote = match self.log.vote() {
            None => true,
            Some(vote) => *vote == from,
        };
        let up_to_date = (last_term, last_index) >= (self.log.last_term(), self.log.last_index());
        let granted = !has_leader && can_vote && up_to_date;

        if granted {
            info!("Node {} voting for {} in term {}", self.id, from, self.log.term());
            let term = self.log.term();
            self.log.set_term(term, Some(from.clone()))?;
            if let Role::Follower(f) = &mut self.role {
                f.leader_seen = 0;
            }
        }
        self.send(&from, Message::VoteResponse { granted });
        Ok(())
    }

    fn step_candidate(&mut self, envelope: Envelope) -> Result<()> {
        if envelope.message.is_from_leader() {
            // Someone else won this term.
            let term = envelope.term;
            self.become_follower(term, Some(envelope.from.clone()))?;
            return self.step_follower(envelope);
        }

        match envelope.message {
            Message::VoteResponse { granted: true } => {
                let quorum = self.quorum_size();
                let won = match &mut self.role {
                    Role::Candidate(c) => {
                        c.votes.insert(envelope.from);
                        c.votes.len() >= quorum
                    }
                    _ => false,
                };
                if won {
                    self.become_leader()?;
                }
            }
            Message::VoteRequest {
                last_index,
                last_term,
            } => self.handle_vote_request(envelope.from, last_index, last_term)?,
            _ => {}
        }
        Ok(())
    }

    fn step_leader(&mut self, envelope: Envelope) -> Result<()> {
        let Envelope { from, message, .. } = envelope;
        if let Role::Leader(l) = &mut self.role {
            l.active.insert(from.clone());
        }

        match message {
            Message::HeartbeatResponse {
                last_index,
                last_term,
                read_seq,
                sent_at,
            } => {
                let matches = self.log.has(last_index, last_term);
                let leader_last = self.log.last_index();
                let mut resend = false;
                if let Role::Leader(l) = &mut self.role {
                    if let Some(p) = l.progress.get_mut(&from) {
                        p.read_seq = p.read_seq.max(read_seq);
                        p.lease_ack = p.lease_ack.max(Some(sent_at));
                        if matches && last_index > p.matched {
                            p.matched = last_index;
                            p.next = p.next.max(last_index + 1);
                        }
                        if last_index < leader_last || !matches {
                            p.next = (p.matched + 1).max(p.next.min(last_index + 1));
                            resend = true;
                        }
                    }
                }
                self.maybe_commit()?;
                self.maybe_resolve_reads();
                if resend {
                    self.send_log(&from)?;
                }
            }

            Message::AppendResponse {
                reject: false,
                last_index,
            } => {
                let mut more = false;
                if let Role::Leader(l) = &mut self.role {
                    if let Some(p) = l.progress.get_mut(&from) {
                        p.matched = p.matched.max(last_index);
                        p.next = p.next.max(last_index + 1);
                        more = p.next <= self.log.last_index();
                    }
                }
                self.maybe_commit()?;
                if more {
                    self.send_log(&from)?;
                }
            }

            Message::AppendResponse {
                reject: true,
                last_index,
            } => {
                if let Role::Leader(l) = &mut self.role {
                    if let Some(p) = l.progress.get_mut(&from) {
                        p.next = (p.matched + 1).max(p.next.saturating_sub(1).min(last_index + 1));
                    }
                }
                self.send_log(&from)?;
            }

            Message::VoteRequest {
                last_index,
                last_term,
            } => self.handle_vote_request(from, last_index, last_term)?,

            Message::VoteResponse { .. } => {}

            Message::Heartbeat { .. }
            | Message::AppendEntries { .. }
            | Message::InstallSnapshot { .. } => {
                warn!(
                    "Leader {} received leader message from {} in term {}",
                    self.id,
                    from,
                    self.log.term()
                );
            }
        }
        Ok(())
    }

    /// Broadcast a heartbeat carrying the commit index and read sequence.
    fn heartbeat(&mut self) {
        let Role::Leader(l) = &mut self.role else {
            return;
        };
        l.since_heartbeat = 0;
        let message = Message::Heartbeat {
            commit_index: self.log.commit_index(),
            commit_term: self.log.commit_term(),
            read_seq: l.read_seq,
            sent_at: self.now,
            seen: self.membership.report(),
        };
        self.broadcast(message);
    }

    /// Send pending entries to every follower that is caught up, so new
    /// writes pipeline without waiting for a heartbeat.
    fn replicate(&mut self) -> Result<()> {
        let last_index = self.log.last_index();
        let ready: Vec<NodeId> = match &self.role {
            Role::Leader(l) => l
                .progress
                .iter()
                .filter(|(_, p)| p.next <= last_index && p.matched + 1 >= p.next)
                .map(|(peer, _)| peer.clone())
                .collect(),
            _ => return Ok(()),
        };
        for peer in &ready {
            self.send_log(peer)?;
        }
        self.maybe_commit()
    }

    /// Send entries from the follower's next index, or the snapshot if they
    /// were compacted away. Advances `next` optimistically.
    fn send_log(&mut self, peer: &NodeId) -> Result<()> {
        let Role::Leader(l) = &mut self.role else {
            return Ok(());
        };
        let Some(progress) = l.progress.get_mut(peer) else {
            return Ok(());
        };

        let next = progress.next;
        let prev_index = next - 1;
        let last = (next + self.opts.max_append_entries as u64 - 1).min(self.log.last_index());
        let prev_term = self.log.term_at(prev_index);
        let entries = self.log.scan(next, last);

        let message = match (prev_term, entries) {
            (Some(prev_term), Some(entries)) => {
                if let Some(entry) = entries.last() {
                    progress.next = entry.index + 1;
                }
                debug!(
                    "Replicating {} entries after {} to {}",
                    entries.len(),
                    prev_index,
                    peer
                );
                Message::AppendEntries {
                    prev_index,
                    prev_term,
                    entries,
                    commit_index: self.log.commit_index(),
                }
            }
            _ => {
                let Some(snapshot) = self.log.snapshot().cloned() else {
                    return Err(Error::Internal(format!(
                        "entry {} compacted without a snapshot",
                        next
                    )));
                };
                info!(
                    "Sending snapshot at index {} to {}",
                    snapshot.last_index, peer
                );
                progress.next = snapshot.last_index + 1;
                Message::InstallSnapshot { snapshot }
            }
        };
        self.send(peer, message);
        Ok(())
    }

    /// Commit the highest current-term index stored on a quorum.
    fn maybe_commit(&mut self) -> Result<()> {
        let Role::Leader(l) = &self.role else {
            return Ok(());
        };
        let mut matched: Vec<Index> = l.progress.values().map(|p| p.matched).collect();
        matched.push(self.log.last_index());
        let index = self.quorum_value(matched);

        if index <= self.log.commit_index() || self.log.term_at(index) != Some(self.log.term()) {
            return Ok(());
        }
        debug!("Committing up to index {}", index);
        self.log.commit(index)?;
        self.apply_committed()?;
        self.maybe_resolve_reads();
        Ok(())
    }

    /// Answer reads whose sequence a quorum has confirmed.
    fn maybe_resolve_reads(&mut self) {
        if self.log.commit_term() != self.log.term() {
            return;
        }
        let Role::Leader(l) = &self.role else {
            return;
        };
        let mut seqs: Vec<ReadSequence> = l.progress.values().map(|p| p.read_seq).collect();
        seqs.push(l.read_seq);
        let confirmed = self.quorum_value(seqs);
        let index = self.log.commit_index();

        let Role::Leader(l) = &mut self.role else {
            return;
        };
        while l.reads.front().is_some_and(|r| r.seq <= confirmed) {
            if let Some(read) = l.reads.pop_front() {
                self.responses.push((read.id, Ok(Response::ReadIndex(index))));
            }
        }
    }

    /// Apply committed entries to the state machine, answering pending
    /// writes, then snapshot if due.
    fn apply_committed(&mut self) -> Result<()> {
        let commit_index = self.log.commit_index();
        while self.state.applied_index() < commit_index {
            let index = self.state.applied_index() + 1;
            let Some(entry) = self.log.get(index).cloned() else {
                return Err(Error::Internal(format!(
                    "committed entry {} missing from log",
                    index
                )));
            };
            let result = self.state.apply(&entry);
            if let Role::Leader(l) = &mut self.role {
                if let Some(id) = l.writes.remove(&index) {
                    self.responses.push((id, result.map(Response::Write)));
                }
            }
        }
        self.maybe_snapshot()
    }

    fn maybe_snapshot(&mut self) -> Result<()> {
        let threshold = self.opts.snapshot_threshold;
        let applied = self.state.applied_index();
        if threshold == 0 || applied - self.log.snapshot_index() < threshold {
            return Ok(());
        }
        let snapshot: Snapshot = self.state.snapshot()?;
        info!(
            "Snapshot taken at index {}, compacting log",
            snapshot.last_index
        );
        self.log.compact(snapshot, self.opts.trailing_logs)
    }

    /// Entries as currently held, for tests and diagnostics.
    pub fn log_entries(&self, from: Index) -> Vec<Entry> {
        self.log
            .scan(from.max(self.log.first_index()), self.log.last_index())
            .unwrap_or_default()
    }
}
