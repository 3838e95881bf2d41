//! Admin metadata held by the replicated state machine
//!
//! Stores:
//! - Namespace registry (name → partition, config)
//! - Worker registry (worker_id → address, capabilities, health)
//! - Launcher registry
//! - Placement assignments (unit_id → namespace, worker)
//!
//! Every map is a `BTreeMap` so serialization is byte-identical on every
//! replica. Partition ownership is not stored here; it is derived from the
//! worker set by the partition calculator.

use crate::raft::{Index, Term};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Free-form key/value settings attached to namespaces and placements.
pub type Settings = BTreeMap<String, String>;

/// Namespace metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceEntry {
    pub name: String,
    pub partition_id: u32,
    pub config: Settings,
    pub created_at: u64,
}

/// Worker metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEntry {
    pub worker_id: String,
    pub address: String,
    pub capabilities: Vec<String>,
    /// Last health string reported by the worker.
    pub health: String,
    pub registered_at: u64,
    pub last_heartbeat: u64,
}

/// Launcher metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LauncherEntry {
    pub launcher_id: String,
    pub address: String,
    pub capabilities: Vec<String>,
    pub max_processes: u32,
    /// Last health reported by the launcher.
    pub health: String,
    pub available_slots: u32,
    pub registered_at: u64,
    pub updated_at: u64,
    pub last_heartbeat: u64,
}

/// Placement of a unit on a worker, fixed at first assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementEntry {
    pub unit_id: String,
    pub namespace: String,
    pub config: Settings,
    pub worker_id: String,
    pub assigned_at: u64,
}

/// The full admin state. Mutated only by the state machine's apply path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminState {
    pub namespaces: BTreeMap<String, NamespaceEntry>,
    pub workers: BTreeMap<String, WorkerEntry>,
    pub launchers: BTreeMap<String, LauncherEntry>,
    pub placements: BTreeMap<String, PlacementEntry>,
    /// Bumped by every command that changed the state.
    pub revision: u64,
    pub last_applied_index: Index,
    pub last_applied_term: Term,
}

impl AdminState {
    /// Registered worker IDs, in order.
    pub fn worker_ids(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    /// Namespaces whose partition satisfies `owned`.
    pub fn namespaces_in(&self, owned: impl Fn(u32) -> bool) -> Vec<NamespaceEntry> {
        self.namespaces
            .values()
            .filter(|ns| owned(ns.partition_id))
            .cloned()
            .collect()
    }
}
