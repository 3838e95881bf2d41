//! Control-plane semantics: idempotency, conflicts, partitioning, routing

mod common;

use common::*;
use minictl::coordinator::{
    route, AdminStateMachine, Command, CommandOutput, Operation, PartitionCalculator, Route,
};
use minictl::raft::{Entry, StateMachine};
use minictl::Error;
use std::collections::BTreeMap;

fn apply_all(fsm: &mut AdminStateMachine, ops: Vec<Operation>) {
    for (i, op) in ops.into_iter().enumerate() {
        let index = fsm.applied_index() + 1;
        let entry = Entry {
            index,
            term: 1,
            command: Some(Command::new(i as u64, op).encode().unwrap()),
        };
        // Outcomes (including conflicts) are irrelevant here.
        let _ = fsm.apply(&entry);
    }
}

#[test]
fn snapshot_restore_reproduces_state() {
    let calculator = PartitionCalculator::new(256);
    let mut fsm = AdminStateMachine::new(calculator);
    apply_all(
        &mut fsm,
        vec![
            register_worker("w1"),
            register_worker("w2"),
            create_namespace("orders"),
            create_namespace("billing"),
            assign_placement("u1", "orders"),
            assign_placement("u2", "billing"),
            Operation::RegisterLauncher {
                launcher_id: "l1".into(),
                address: "l1.local:7100".into(),
                capabilities: vec!["docker".into()],
                max_processes: 16,
            },
            Operation::UpdateLauncherStatus {
                launcher_id: "l1".into(),
                health: "healthy".into(),
                available_slots: 12,
            },
            Operation::UpdateWorkerStatus {
                worker_id: "w1".into(),
                health: "degraded".into(),
            },
        ],
    );

    let snapshot = fsm.snapshot().unwrap();
    let mut restored = AdminStateMachine::new(calculator);
    restored.restore(&snapshot).unwrap();

    assert_eq!(restored.reader().snapshot(), fsm.reader().snapshot());
    // The restored copy keeps evolving identically.
    apply_all(&mut fsm, vec![register_worker("w3")]);
    apply_all(&mut restored, vec![register_worker("w3")]);
    assert_eq!(restored.reader().snapshot(), fsm.reader().snapshot());
}

#[test]
fn registration_returns_computed_ranges_and_namespaces() {
    let calculator = PartitionCalculator::new(256);
    let mut cluster = TestCluster::new(3);
    let leader = cluster.elect(200);

    for ns in ["orders", "billing", "search", "audit"] {
        cluster.apply(&leader, create_namespace(ns), 50).unwrap();
    }
    let mut workers: Vec<String> = Vec::new();
    for w in ["w1", "w2", "w3"] {
        workers.push(w.to_string());
        match cluster.apply(&leader, register_worker(w), 50).unwrap() {
            CommandOutput::WorkerRegistered {
                ranges, namespaces, ..
            } => {
                assert_eq!(ranges, calculator.compute_ranges(w, &workers));
                for ns in &namespaces {
                    assert!(ranges.iter().any(|r| r.contains(ns.partition_id)));
                }
                let expected = cluster
                    .state(&leader)
                    .namespaces
                    .values()
                    .filter(|ns| ranges.iter().any(|r| r.contains(ns.partition_id)))
                    .count();
                assert_eq!(namespaces.len(), expected);
            }
            other => panic!("unexpected output {:?}", other),
        }
    }
}

#[test]
fn divergent_payload_is_a_conflict_on_every_replica() {
    let mut cluster = TestCluster::new(3);
    let leader = cluster.elect(200);
    cluster.apply(&leader, create_namespace("orders"), 50).unwrap();

    let divergent = Operation::CreateNamespace {
        name: "orders".into(),
        config: BTreeMap::from([("replicas".to_string(), "5".to_string())]),
    };
    let err = cluster.apply(&leader, divergent, 50).unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    // The rejected entry is still applied everywhere, and changed nothing.
    cluster.run(cluster.opts.heartbeat_interval);
    assert!(cluster.converged());
    let ns = cluster.reader("n1").namespace("orders").unwrap();
    assert_eq!(ns.config["replicas"], "3");
}

#[test]
fn placement_requires_namespace_and_workers() {
    let mut cluster = TestCluster::new(3);
    let leader = cluster.elect(200);

    let err = cluster
        .apply(&leader, assign_placement("u1", "orders"), 50)
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    cluster.apply(&leader, create_namespace("orders"), 50).unwrap();
    let err = cluster
        .apply(&leader, assign_placement("u1", "orders"), 50)
        .unwrap_err();
    assert!(matches!(err, Error::NoWorkers));

    cluster.apply(&leader, register_worker("w1"), 50).unwrap();
    match cluster
        .apply(&leader, assign_placement("u1", "orders"), 50)
        .unwrap()
    {
        CommandOutput::PlacementAssigned { worker_id, .. } => assert_eq!(worker_id, "w1"),
        other => panic!("unexpected output {:?}", other),
    }
}

#[test]
fn heartbeat_from_unknown_worker_is_not_found() {
    let mut cluster = TestCluster::new(1);
    let err = cluster
        .apply(
            "n1",
            Operation::UpdateWorkerStatus {
                worker_id: "ghost".into(),
                health: "healthy".into(),
            },
            10,
        )
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[test]
fn removing_a_worker_only_moves_its_partitions() {
    let calculator = PartitionCalculator::new(256);
    let before: Vec<String> = (1..=6).map(|i| format!("w{}", i)).collect();
    let after: Vec<String> = before.iter().filter(|w| *w != "w4").cloned().collect();

    let owners_before = calculator.assignments(&before);
    for partition in calculator.moved_partitions(&before, &after) {
        assert_eq!(owners_before[partition as usize].as_deref(), Some("w4"));
    }
    calculator
        .validate_coverage(&calculator.compute_all_ranges(&after))
        .unwrap();
}

#[test]
fn write_routing_decision() {
    assert_eq!(route(true, Some("10.0.0.1:7001".into())), Route::Local);
    assert_eq!(
        route(false, Some("10.0.0.1:7001".into())),
        Route::Forward("10.0.0.1:7001".into())
    );
    assert_eq!(route(false, None), Route::Unavailable);
}
