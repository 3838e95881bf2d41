//! Deterministic in-process cluster for integration tests.
//!
//! Nodes are driven tick by tick with zero-latency delivery. Links can be
//! cut to simulate partitions, and nodes can be crashed and restarted over
//! their in-memory stores.

#![allow(dead_code)]

use minictl::coordinator::{
    AdminReader, AdminState, AdminStateMachine, Command, CommandOutput, Operation,
    PartitionCalculator,
};
use minictl::raft::{
    Envelope, MemoryStore, NodeId, RaftNode, RaftOptions, RaftRole, Request, RequestId, Response,
};
use minictl::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};

pub struct TestNode {
    pub node: Option<RaftNode>,
    pub store: MemoryStore,
    pub reader: AdminReader,
    restarts: u64,
}

pub struct TestCluster {
    pub opts: RaftOptions,
    pub calculator: PartitionCalculator,
    ids: Vec<NodeId>,
    nodes: BTreeMap<NodeId, TestNode>,
    cut: BTreeSet<(NodeId, NodeId)>,
    responses: BTreeMap<RequestId, Result<Response>>,
    next_request: RequestId,
    now: u64,
}

impl TestCluster {
    pub fn new(size: usize) -> Self {
        Self::with_options(size, RaftOptions::default())
    }

    pub fn with_options(size: usize, opts: RaftOptions) -> Self {
        let ids: Vec<NodeId> = (1..=size).map(|i| format!("n{}", i)).collect();
        let mut cluster = Self {
            opts,
            calculator: PartitionCalculator::new(256),
            ids: ids.clone(),
            nodes: BTreeMap::new(),
            cut: BTreeSet::new(),
            responses: BTreeMap::new(),
            next_request: 0,
            now: 0,
        };
        for id in &ids {
            let store = MemoryStore::new();
            let node = cluster.build_node(id, store.clone(), 0);
            cluster.nodes.insert(id.clone(), node);
        }
        cluster.collect();
        cluster
    }

    fn build_node(&self, id: &str, store: MemoryStore, restarts: u64) -> TestNode {
        let fsm = AdminStateMachine::new(self.calculator);
        let reader = fsm.reader();
        let peers: BTreeSet<NodeId> = self.ids.iter().filter(|p| *p != id).cloned().collect();
        let position = self.ids.iter().position(|p| p == id).unwrap_or(0) as u64;
        let seed = position * 1_000 + restarts + 7;
        let node = RaftNode::new(
            id.to_string(),
            peers,
            Box::new(store.clone()),
            Box::new(fsm),
            self.opts.clone(),
            seed,
        )
        .expect("node starts");
        TestNode {
            node: Some(node),
            store,
            reader,
            restarts,
        }
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.ids.clone()
    }

    pub fn node(&self, id: &str) -> &RaftNode {
        self.nodes[id].node.as_ref().expect("node is running")
    }

    fn node_mut(&mut self, id: &str) -> &mut RaftNode {
        self.nodes
            .get_mut(id)
            .and_then(|n| n.node.as_mut())
            .expect("node is running")
    }

    pub fn is_up(&self, id: &str) -> bool {
        self.nodes[id].node.is_some()
    }

    pub fn reader(&self, id: &str) -> &AdminReader {
        &self.nodes[id].reader
    }

    pub fn state(&self, id: &str) -> AdminState {
        self.nodes[id].reader.snapshot()
    }

    // === Faults ===

    /// Stop a node. Its store survives.
    pub fn crash(&mut self, id: &str) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.node = None;
        }
    }

    /// Start a crashed node again from its store.
    pub fn restart(&mut self, id: &str) {
        let (store, restarts) = {
            let node = &self.nodes[id];
            (node.store.clone(), node.restarts + 1)
        };
        let node = self.build_node(id, store, restarts);
        self.nodes.insert(id.to_string(), node);
        self.collect();
    }

    /// Cut every link between `group` and the other nodes.
    pub fn partition(&mut self, group: &[&str]) {
        for a in group {
            for b in &self.ids {
                if !group.contains(&b.as_str()) {
                    self.cut.insert((a.to_string(), b.clone()));
                    self.cut.insert((b.clone(), a.to_string()));
                }
            }
        }
    }

    pub fn heal(&mut self) {
        self.cut.clear();
    }

    fn linked(&self, from: &str, to: &str) -> bool {
        !self.cut.contains(&(from.to_string(), to.to_string()))
    }

    // === Driving ===

    /// Advance every running node by one tick and deliver all resulting
    /// traffic.
    pub fn tick(&mut self) {
        self.now += 1;
        for id in self.ids.clone() {
            if let Some(node) = self.nodes.get_mut(&id).and_then(|n| n.node.as_mut()) {
                node.tick().expect("tick");
            }
        }
        self.deliver();
    }

    pub fn run(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    /// Tick until `done` holds, up to `max_ticks`. Returns the ticks taken.
    pub fn run_until(&mut self, max_ticks: u64, done: impl Fn(&Self) -> bool) -> Option<u64> {
        for ticks in 0..=max_ticks {
            if done(self) {
                return Some(ticks);
            }
            self.tick();
        }
        None
    }

    fn collect(&mut self) -> Vec<Envelope> {
        let mut outbox = Vec::new();
        for node in self.nodes.values_mut() {
            if let Some(raft) = node.node.as_mut() {
                outbox.extend(raft.take_outbox());
                for (id, response) in raft.take_responses() {
                    self.responses.insert(id, response);
                }
            }
        }
        outbox
    }

    /// Deliver messages until the network is quiet.
    pub fn deliver(&mut self) {
        let mut in_flight = self.collect();
        while !in_flight.is_empty() {
            for envelope in in_flight {
                if !self.linked(&envelope.from, &envelope.to) {
                    continue;
                }
                if let Some(node) = self
                    .nodes
                    .get_mut(&envelope.to)
                    .and_then(|n| n.node.as_mut())
                {
                    node.step(envelope).expect("step");
                }
            }
            in_flight = self.collect();
        }
    }

    // === Observation ===

    /// Running nodes that consider themselves leader.
    pub fn leaders(&self) -> Vec<NodeId> {
        self.ids
            .iter()
            .filter(|id| self.is_up(id) && self.node(id).role() == RaftRole::Leader)
            .cloned()
            .collect()
    }

    /// The leader among `group`, if exactly one exists there.
    pub fn leader_among(&self, group: &[&str]) -> Option<NodeId> {
        let leaders: Vec<NodeId> = self
            .leaders()
            .into_iter()
            .filter(|id| group.contains(&id.as_str()))
            .collect();
        match leaders.as_slice() {
            [leader] => Some(leader.clone()),
            _ => None,
        }
    }

    /// Tick until a single leader exists and every running node follows it.
    pub fn elect(&mut self, max_ticks: u64) -> NodeId {
        self.run_until(max_ticks, |c| {
            let leaders = c.leaders();
            leaders.len() == 1
                && c.ids.iter().filter(|id| c.is_up(id)).all(|id| {
                    c.node(id).leader() == Some(&leaders[0])
                        && c.node(id).term() == c.node(&leaders[0]).term()
                })
        })
        .expect("leader elected");
        self.leaders()[0].clone()
    }

    // === Requests ===

    pub fn command(&self, op: Operation) -> Vec<u8> {
        Command::new(self.now, op).encode().expect("encode")
    }

    /// Submit a write on `id` without waiting.
    pub fn propose(&mut self, id: &str, op: Operation) -> RequestId {
        let command = self.command(op);
        self.request(id, Request::Write(command))
    }

    pub fn request(&mut self, id: &str, request: Request) -> RequestId {
        self.next_request += 1;
        let request_id = self.next_request;
        self.node_mut(id)
            .request(request_id, request)
            .expect("request accepted");
        self.deliver();
        request_id
    }

    pub fn response(&mut self, request: RequestId) -> Option<Result<Response>> {
        self.responses.remove(&request)
    }

    /// Submit a write on `id` and tick until it completes.
    pub fn apply(&mut self, id: &str, op: Operation, max_ticks: u64) -> Result<CommandOutput> {
        let request = self.propose(id, op);
        for _ in 0..=max_ticks {
            if let Some(response) = self.response(request) {
                return match response? {
                    Response::Write(output) => CommandOutput::decode(&output),
                    other => Err(Error::Internal(format!("unexpected {:?}", other))),
                };
            }
            self.tick();
        }
        Err(Error::DeadlineExceeded(format!(
            "request {} incomplete after {} ticks",
            request, max_ticks
        )))
    }

    /// Whether every running node has applied the same state.
    pub fn converged(&self) -> bool {
        let mut states = self
            .ids
            .iter()
            .filter(|id| self.is_up(id))
            .map(|id| self.state(id));
        match states.next() {
            Some(first) => states.all(|s| s == first),
            None => true,
        }
    }
}

// === Command builders ===

pub fn register_worker(worker_id: &str) -> Operation {
    Operation::RegisterWorker {
        worker_id: worker_id.to_string(),
        address: format!("{}.local:9000", worker_id),
        capabilities: vec!["cpu".to_string()],
    }
}

pub fn create_namespace(name: &str) -> Operation {
    Operation::CreateNamespace {
        name: name.to_string(),
        config: BTreeMap::from([("replicas".to_string(), "3".to_string())]),
    }
}

pub fn assign_placement(unit_id: &str, namespace: &str) -> Operation {
    Operation::AssignPlacement {
        unit_id: unit_id.to_string(),
        namespace: namespace.to_string(),
        config: BTreeMap::new(),
    }
}
