//! Async driver for a `RaftNode`.
//!
//! One tokio task owns the node and is its only caller. Ticks, inbound peer
//! messages and client requests arrive on queues and are handled one at a
//! time; after each event the node's outbox goes to the transport, client
//! responses go back to their waiters and the status snapshot is published.

use super::{
    Envelope, Index, NodeId, NodeStatus, RaftNode, RaftRole, Request, RequestId, Response,
    Transport,
};
use crate::common::{Error, Result};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const INBOUND_QUEUE: usize = 4096;
const REQUEST_QUEUE: usize = 1024;

enum Command {
    Request(Request, oneshot::Sender<Result<Response>>),
    LeaseValid(oneshot::Sender<bool>),
}

pub struct RaftServer;

impl RaftServer {
    /// Spawn the event loop for `node`. `addresses` maps every node ID,
    /// including this node's, to its advertised gRPC address.
    pub fn spawn(
        node: RaftNode,
        transport: Arc<dyn Transport>,
        addresses: BTreeMap<NodeId, String>,
        tick_interval: Duration,
    ) -> (RaftHandle, JoinHandle<()>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (command_tx, command_rx) = mpsc::channel(REQUEST_QUEUE);
        let (status_tx, status_rx) = watch::channel(node.status());

        let handle = RaftHandle {
            id: node.id().clone(),
            addresses: Arc::new(addresses),
            commands: command_tx,
            inbound: inbound_tx,
            status: status_rx,
        };
        let task = tokio::spawn(Self::eventloop(
            node,
            transport,
            inbound_rx,
            command_rx,
            status_tx,
            tick_interval,
        ));
        (handle, task)
    }

    async fn eventloop(
        mut node: RaftNode,
        transport: Arc<dyn Transport>,
        mut inbound_rx: mpsc::Receiver<Envelope>,
        mut command_rx: mpsc::Receiver<Command>,
        status_tx: watch::Sender<NodeStatus>,
        tick_interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pending: HashMap<RequestId, oneshot::Sender<Result<Response>>> = HashMap::new();
        let mut next_id: RequestId = 0;

        loop {
            let result = tokio::select! {
                _ = ticker.tick() => node.tick(),
                Some(envelope) = inbound_rx.recv() => node.step(envelope),
                Some(command) = command_rx.recv() => match command {
                    Command::Request(request, response_tx) => {
                        next_id += 1;
                        pending.insert(next_id, response_tx);
                        node.request(next_id, request)
                    }
                    Command::LeaseValid(response_tx) => {
                        let _ = response_tx.send(node.lease_valid());
                        Ok(())
                    }
                },
            };
            if let Err(e) = result {
                tracing::error!("Raft node {} stopped: {}", node.id(), e);
                break;
            }

            for envelope in node.take_outbox() {
                transport.send(envelope);
            }
            for (id, response) in node.take_responses() {
                if let Some(response_tx) = pending.remove(&id) {
                    // The caller may have timed out and gone away.
                    let _ = response_tx.send(response);
                }
            }
            pending.retain(|_, tx| !tx.is_closed());

            let status = node.status();
            status_tx.send_if_modified(|current| {
                if *current != status {
                    *current = status;
                    true
                } else {
                    false
                }
            });
        }
    }
}

/// Cloneable handle to a running Raft node.
#[derive(Clone)]
pub struct RaftHandle {
    id: NodeId,
    addresses: Arc<BTreeMap<NodeId, String>>,
    commands: mpsc::Sender<Command>,
    inbound: mpsc::Sender<Envelope>,
    status: watch::Receiver<NodeStatus>,
}

impl RaftHandle {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    async fn request(&self, request: Request, timeout: Duration) -> Result<Response> {
        let (response_tx, response_rx) = oneshot::channel();
        let submit = self
            .commands
            .send(Command::Request(request, response_tx));
        let wait = async {
            submit
                .await
                .map_err(|_| Error::Unavailable("raft node stopped".into()))?;
            response_rx
                .await
                .map_err(|_| Error::Unavailable("raft node stopped".into()))?
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::DeadlineExceeded(format!(
                "not committed within {:?}, outcome unknown",
                timeout
            ))),
        }
    }

    /// Replicate a command and wait until it is applied, returning the state
    /// machine's output. On `DeadlineExceeded` the command may still apply.
    pub async fn apply(&self, command: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        match self.request(Request::Write(command), timeout).await? {
            Response::Write(output) => Ok(output),
            other => Err(Error::Internal(format!("unexpected response {:?}", other))),
        }
    }

    /// Confirm leadership with a quorum round. Returns once every entry
    /// committed before the call is applied locally.
    pub async fn verify_leader(&self, timeout: Duration) -> Result<Index> {
        let deadline = tokio::time::Instant::now() + timeout;
        let index = match self.request(Request::VerifyLeader, timeout).await? {
            Response::ReadIndex(index) => index,
            other => return Err(Error::Internal(format!("unexpected response {:?}", other))),
        };
        let mut status = self.status.clone();
        let applied = tokio::time::timeout_at(deadline, status.wait_for(|s| s.applied_index >= index))
            .await
            .map(|waited| waited.is_ok());
        match applied {
            Ok(true) => Ok(index),
            Ok(false) => Err(Error::Unavailable("raft node stopped".into())),
            Err(_) => Err(Error::DeadlineExceeded(format!(
                "read index {} not applied within {:?}",
                index, timeout
            ))),
        }
    }

    /// Whether this node is leader with an unexpired lease.
    pub async fn lease_valid(&self) -> bool {
        let (response_tx, response_rx) = oneshot::channel();
        if self.commands.send(Command::LeaseValid(response_tx)).await.is_err() {
            return false;
        }
        response_rx.await.unwrap_or(false)
    }

    /// Deliver an inbound peer message.
    pub async fn step(&self, envelope: Envelope) -> Result<()> {
        self.inbound
            .send(envelope)
            .await
            .map_err(|_| Error::Unavailable("raft node stopped".into()))
    }

    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.status.clone()
    }

    pub fn state(&self) -> RaftRole {
        self.status.borrow().role
    }

    pub fn is_leader(&self) -> bool {
        self.state() == RaftRole::Leader
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.status.borrow().leader.clone()
    }

    pub fn address_of(&self, id: &str) -> Option<String> {
        self.addresses.get(id).cloned()
    }

    /// Advertised address of the current leader, if one is known.
    pub fn leader_address(&self) -> Option<String> {
        self.leader().and_then(|leader| self.address_of(&leader))
    }

    /// Wait until some leader is known.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId> {
        let mut status = self.status.clone();
        let found = tokio::time::timeout(timeout, status.wait_for(|s| s.leader.is_some()))
            .await
            .map(|waited| waited.map(|status| status.leader.clone()));
        match found {
            Ok(Ok(leader)) => leader.ok_or_else(|| Error::Internal("leader vanished".into())),
            Ok(Err(_)) => Err(Error::Unavailable("raft node stopped".into())),
            Err(_) => Err(Error::Unavailable(format!(
                "no leader elected within {:?}",
                timeout
            ))),
        }
    }
}
