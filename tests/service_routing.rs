//! Write routing and read barriers of `ControlPlaneService`, over an
//! in-process Raft transport and a recording forwarder.

use minictl::common::{CoordinatorConfig, ReadConsistencyTable};
use minictl::coordinator::{
    AdminStateMachine, ControlPlaneService, Forwarder, PartitionCalculator, WriteRequest,
    WriteResponse,
};
use minictl::proto::{self, ReadConsistency};
use minictl::raft::{
    Envelope, MemoryStore, NodeId, RaftHandle, RaftNode, RaftOptions, RaftServer, Transport,
};
use minictl::{Error, Result};

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// Delivers envelopes between handles in this process.
#[derive(Default)]
struct LocalNet {
    handles: RwLock<BTreeMap<NodeId, RaftHandle>>,
}

struct LocalTransport(Arc<LocalNet>);

impl Transport for LocalTransport {
    fn send(&self, envelope: Envelope) {
        let Some(handle) = self.0.handles.read().get(&envelope.to).cloned() else {
            return;
        };
        tokio::spawn(async move {
            let _ = handle.step(envelope).await;
        });
    }
}

/// Records every forwarded write and acknowledges it.
#[derive(Default)]
struct RecordingForwarder {
    calls: Mutex<Vec<String>>,
}

#[tonic::async_trait]
impl Forwarder for RecordingForwarder {
    async fn forward(
        &self,
        leader_addr: &str,
        _request: WriteRequest,
        _timeout: Duration,
    ) -> Result<WriteResponse> {
        self.calls.lock().push(leader_addr.to_string());
        Ok(WriteResponse::Ack(proto::Ack { revision: 42 }))
    }
}

fn address(id: &str) -> String {
    format!("{}.local:7000", id)
}

fn config(id: &str, ids: &[&str], lease_duration_ms: u64) -> CoordinatorConfig {
    CoordinatorConfig {
        node_id: id.to_string(),
        peers: ids
            .iter()
            .filter(|p| **p != id)
            .map(|p| (p.to_string(), address(p)))
            .collect(),
        tick_interval_ms: 5,
        heartbeat_interval_ms: 25,
        election_timeout_ms: 100,
        lease_duration_ms,
        suspect_after_ms: 150,
        dead_after_ms: 600,
        ..Default::default()
    }
}

/// Start `started` out of the cluster `ids`. Nodes not started simply never
/// answer.
fn start(
    ids: &[&str],
    started: &[&str],
    lease_duration_ms: u64,
    forwarder: Arc<RecordingForwarder>,
) -> Vec<ControlPlaneService> {
    let net = Arc::new(LocalNet::default());
    let addresses: BTreeMap<NodeId, String> =
        ids.iter().map(|id| (id.to_string(), address(id))).collect();

    let mut services = Vec::new();
    for (i, id) in started.iter().enumerate() {
        let config = config(id, ids, lease_duration_ms);
        let calculator = PartitionCalculator::new(config.num_partitions);
        let fsm = AdminStateMachine::new(calculator);
        let reader = fsm.reader();
        let peers: BTreeSet<NodeId> = config.peers.keys().cloned().collect();
        let node = RaftNode::new(
            id.to_string(),
            peers,
            Box::new(MemoryStore::new()),
            Box::new(fsm),
            RaftOptions::from_config(&config),
            i as u64 + 11,
        )
        .unwrap();
        let (raft, _task) = RaftServer::spawn(
            node,
            Arc::new(LocalTransport(Arc::clone(&net))),
            addresses.clone(),
            config.tick_interval(),
        );
        net.handles.write().insert(id.to_string(), raft.clone());
        services.push(ControlPlaneService::new(
            raft,
            reader,
            calculator,
            forwarder.clone(),
            ReadConsistencyTable::default(),
            Duration::from_secs(2),
            config.tick_interval(),
        ));
    }
    services
}

async fn wait_for_leader(services: &[ControlPlaneService]) -> NodeId {
    for service in services {
        service
            .raft()
            .wait_for_leader(Duration::from_secs(5))
            .await
            .unwrap();
    }
    services[0].raft().leader().unwrap()
}

fn register_worker(worker_id: &str) -> WriteRequest {
    WriteRequest::RegisterWorker(proto::RegisterWorkerRequest {
        worker_id: worker_id.into(),
        address: format!("{}.local:9000", worker_id),
        capabilities: vec![],
    })
}

fn create_namespace(name: &str) -> WriteRequest {
    WriteRequest::CreateNamespace(proto::CreateNamespaceRequest {
        name: name.into(),
        config: BTreeMap::new(),
    })
}

#[tokio::test]
async fn write_without_known_leader_is_unavailable() {
    let forwarder = Arc::new(RecordingForwarder::default());
    let services = start(&["n1", "n2", "n3"], &["n1"], 50, forwarder.clone());
    let service = &services[0];

    // Let a few elections fail for lack of votes.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(service.raft().leader().is_none());

    let err = service
        .execute_write(register_worker("w1"), None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unavailable(_)), "got {:?}", err);
    assert!(forwarder.calls.lock().is_empty());

    for level in [ReadConsistency::LeaseBased, ReadConsistency::Linearizable] {
        let err = service
            .get_namespace("orders", level as i32, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)), "got {:?}", err);
    }
    let listed = service
        .list_namespaces(ReadConsistency::Stale as i32, None)
        .await
        .unwrap();
    assert!(listed.namespaces.is_empty());
}

#[tokio::test]
async fn follower_forwards_once_and_refuses_leader_reads() {
    let ids = ["n1", "n2", "n3"];
    let forwarder = Arc::new(RecordingForwarder::default());
    let services = start(&ids, &ids, 50, forwarder.clone());
    let leader = wait_for_leader(&services).await;
    let follower = services
        .iter()
        .find(|s| *s.node_id() != leader)
        .unwrap();

    // A client write is relayed to the leader's address.
    let response = follower
        .execute_write(register_worker("w1"), None, false)
        .await
        .unwrap();
    assert_eq!(response, WriteResponse::Ack(proto::Ack { revision: 42 }));
    assert_eq!(*forwarder.calls.lock(), vec![address(&leader)]);

    // A write that was already relayed once is not relayed again.
    let err = follower
        .execute_write(register_worker("w1"), None, true)
        .await
        .unwrap_err();
    match err {
        Error::NotLeader(hint) => assert_eq!(hint.as_deref(), Some(leader.as_str())),
        other => panic!("expected NotLeader, got {:?}", other),
    }
    assert_eq!(forwarder.calls.lock().len(), 1);

    // Leader-only reads are refused with a hint; stale reads are served.
    for level in [ReadConsistency::LeaseBased, ReadConsistency::Linearizable] {
        let err = follower
            .get_namespace("orders", level as i32, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotLeader(Some(_))), "got {:?}", err);
    }
    let err = follower
        .get_namespace("orders", ReadConsistency::Stale as i32, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn lease_based_read_without_lease_confirms_leadership() {
    let ids = ["n1", "n2", "n3"];
    let forwarder = Arc::new(RecordingForwarder::default());
    // A zero lease never holds, so every lease-based read needs a quorum round.
    let services = start(&ids, &ids, 0, forwarder.clone());
    let leader_id = wait_for_leader(&services).await;
    let leader = services
        .iter()
        .find(|s| *s.node_id() == leader_id)
        .unwrap();

    let created = match leader
        .execute_write(create_namespace("orders"), None, false)
        .await
        .unwrap()
    {
        WriteResponse::CreateNamespace(resp) => resp,
        other => panic!("unexpected response {:?}", other),
    };
    assert!(forwarder.calls.lock().is_empty());

    assert!(!leader.raft().lease_valid().await);
    let info = leader
        .get_namespace("orders", ReadConsistency::LeaseBased as i32, None)
        .await
        .unwrap();
    assert_eq!(info.partition_id, created.partition_id);

    // Launchers report free slots through heartbeats.
    leader
        .execute_write(
            WriteRequest::RegisterLauncher(proto::RegisterLauncherRequest {
                launcher_id: "l1".into(),
                address: "l1.local:7100".into(),
                capabilities: vec![],
                max_processes: 8,
            }),
            None,
            false,
        )
        .await
        .unwrap();
    leader
        .execute_write(
            WriteRequest::LauncherHeartbeat(proto::LauncherHeartbeatRequest {
                launcher_id: "l1".into(),
                health: "healthy".into(),
                available_slots: 3,
            }),
            None,
            false,
        )
        .await
        .unwrap();
    let status = leader
        .get_cluster_status(ReadConsistency::Linearizable as i32, None)
        .await
        .unwrap();
    assert_eq!(status.launcher_count, 1);
    assert_eq!(status.available_slots, 3);

    // Followers report healthy once the leader has heard from them.
    let mut healthy = false;
    for _ in 0..50 {
        let status = leader
            .get_cluster_status(ReadConsistency::Stale as i32, None)
            .await
            .unwrap();
        if status.peers.len() == 2 && status.peers.iter().all(|p| p.healthy) {
            healthy = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(healthy, "leader never saw its followers as alive");
}
