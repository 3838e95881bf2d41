//! End-to-end: three coordinators over gRPC on localhost

use minictl::common::{retry_with_backoff, CoordinatorConfig};
use minictl::coordinator::{CoordinatorHandle, PartitionCalculator};
use minictl::proto::control_plane_client::ControlPlaneClient;
use minictl::proto::{
    ClusterStatus, CreateNamespaceRequest, GetClusterStatusRequest, GetNamespaceRequest,
    ReadConsistency, RegisterWorkerRequest,
};
use minictl::{Coordinator, Error};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::net::TcpListener;
use tonic::transport::Channel;

async fn start_cluster(size: usize) -> Vec<CoordinatorHandle> {
    let mut listeners = Vec::new();
    let mut addresses = BTreeMap::new();
    for i in 1..=size {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        addresses.insert(
            format!("c{}", i),
            listener.local_addr().unwrap().to_string(),
        );
        listeners.push(listener);
    }

    let mut handles = Vec::new();
    for (i, listener) in listeners.into_iter().enumerate() {
        let id = format!("c{}", i + 1);
        let mut peers = addresses.clone();
        let advertise = peers.remove(&id);
        let config = CoordinatorConfig {
            node_id: id,
            advertise_addr: advertise,
            peers,
            tick_interval_ms: 5,
            heartbeat_interval_ms: 25,
            election_timeout_ms: 100,
            lease_duration_ms: 50,
            suspect_after_ms: 150,
            dead_after_ms: 600,
            ..Default::default()
        };
        let coordinator = Coordinator::new(config).unwrap();
        handles.push(coordinator.start(listener).await.unwrap());
    }
    handles
}

async fn client(handle: &CoordinatorHandle) -> ControlPlaneClient<Channel> {
    ControlPlaneClient::connect(format!("http://{}", handle.local_addr))
        .await
        .unwrap()
}

async fn cluster_status(handle: &CoordinatorHandle) -> ClusterStatus {
    client(handle)
        .await
        .get_cluster_status(GetClusterStatusRequest {
            consistency: ReadConsistency::Stale as i32,
        })
        .await
        .unwrap()
        .into_inner()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn register_worker_then_fail_over() {
    let mut handles = start_cluster(3).await;
    for handle in &handles {
        handle
            .raft
            .wait_for_leader(Duration::from_secs(5))
            .await
            .unwrap();
    }
    let leader_id = handles[0].raft.leader().unwrap();
    let leader_pos = handles
        .iter()
        .position(|h| *h.raft.id() == leader_id)
        .unwrap();
    let follower_pos = (leader_pos + 1) % handles.len();

    // Registration on the leader returns the deterministic ranges.
    let response = client(&handles[leader_pos])
        .await
        .register_worker(RegisterWorkerRequest {
            worker_id: "w1".into(),
            address: "127.0.0.1:9100".into(),
            capabilities: vec![],
        })
        .await
        .unwrap()
        .into_inner();
    let expected = PartitionCalculator::new(256).compute_ranges("w1", &["w1"]);
    let ranges: Vec<(u32, u32)> = response.ranges.iter().map(|r| (r.start, r.end)).collect();
    let expected: Vec<(u32, u32)> = expected.iter().map(|r| (r.start, r.end)).collect();
    assert_eq!(ranges, expected);
    assert_eq!(response.partition_count, 256);

    // A follower forwards writes to the leader transparently.
    let created = client(&handles[follower_pos])
        .await
        .create_namespace(CreateNamespaceRequest {
            name: "orders".into(),
            config: BTreeMap::new(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(created.owner_worker_id, "w1");

    // Stale reads on the follower catch up; leader-only reads are refused.
    let mut follower = client(&handles[follower_pos]).await;
    let mut found = false;
    for _ in 0..50 {
        let read = follower
            .get_namespace(GetNamespaceRequest {
                name: "orders".into(),
                consistency: ReadConsistency::Stale as i32,
            })
            .await;
        if read.is_ok() {
            found = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(found, "follower never saw the namespace");
    for consistency in [ReadConsistency::LeaseBased, ReadConsistency::Linearizable] {
        let refused = follower
            .get_namespace(GetNamespaceRequest {
                name: "orders".into(),
                consistency: consistency as i32,
            })
            .await
            .unwrap_err();
        assert_eq!(refused.code(), tonic::Code::FailedPrecondition);
    }

    let linearizable = client(&handles[leader_pos])
        .await
        .get_namespace(GetNamespaceRequest {
            name: "orders".into(),
            consistency: ReadConsistency::Linearizable as i32,
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(linearizable.partition_id, created.partition_id);

    // Kill the leader.
    let old_term = cluster_status(&handles[leader_pos]).await.term;
    let killed = handles.remove(leader_pos);
    killed.kill();

    let mut agreed = None;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut statuses = Vec::new();
        for handle in &handles {
            statuses.push(cluster_status(handle).await);
        }
        let leaders: Vec<&str> = statuses.iter().map(|s| s.leader_id.as_str()).collect();
        let terms: Vec<u64> = statuses.iter().map(|s| s.term).collect();
        if !leaders[0].is_empty()
            && leaders[0] != leader_id
            && leaders.iter().all(|l| *l == leaders[0])
            && terms.iter().all(|t| *t == terms[0])
        {
            agreed = Some((leaders[0].to_string(), terms[0]));
            break;
        }
    }
    let (new_leader, new_term) = agreed.expect("survivors agree on a new leader");
    assert_ne!(new_leader, leader_id);
    assert!(new_term > old_term);

    // Writes keep working through any survivor, and the state from before
    // the failover is intact.
    let addr = handles[0].local_addr;
    let response = retry_with_backoff(
        || async move {
            let mut client = ControlPlaneClient::connect(format!("http://{}", addr))
                .await
                .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
            client
                .register_worker(RegisterWorkerRequest {
                    worker_id: "w2".into(),
                    address: "127.0.0.1:9101".into(),
                    capabilities: vec![],
                })
                .await
                .map(|r| r.into_inner())
                .map_err(Error::Grpc)
        },
        10,
        Duration::from_millis(50),
    )
    .await
    .unwrap();
    let expected: Vec<(u32, u32)> = PartitionCalculator::new(256)
        .compute_ranges("w2", &["w1", "w2"])
        .iter()
        .map(|r| (r.start, r.end))
        .collect();
    let ranges: Vec<(u32, u32)> = response.ranges.iter().map(|r| (r.start, r.end)).collect();
    assert_eq!(ranges, expected);

    for handle in handles {
        handle.shutdown().await;
    }
}
