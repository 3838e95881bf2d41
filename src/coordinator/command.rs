//! Commands replicated through the Raft log
//!
//! Each command carries a natural idempotency key (namespace name, worker
//! ID, launcher ID or unit ID) and the leader's wall clock at proposal time.
//! That timestamp is the only clock the state machine reads, so replay on
//! any node yields the same state.

use super::metadata::{NamespaceEntry, Settings};
use super::placement::PartitionRange;
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};

/// A mutation intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    CreateNamespace {
        name: String,
        config: Settings,
    },
    RegisterWorker {
        worker_id: String,
        address: String,
        capabilities: Vec<String>,
    },
    RegisterLauncher {
        launcher_id: String,
        address: String,
        capabilities: Vec<String>,
        max_processes: u32,
    },
    AssignPlacement {
        unit_id: String,
        namespace: String,
        config: Settings,
    },
    /// Worker heartbeat.
    UpdateWorkerStatus {
        worker_id: String,
        health: String,
    },
    /// Launcher heartbeat.
    UpdateLauncherStatus {
        launcher_id: String,
        health: String,
        available_slots: u32,
    },
}

/// A command as stored in a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Milliseconds since the epoch, set by the proposer.
    pub timestamp: u64,
    pub op: Operation,
}

impl Command {
    pub fn new(timestamp: u64, op: Operation) -> Self {
        Self { timestamp, op }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| Error::InvalidCommand(format!("undecodable command: {}", e)))
    }

    /// The natural key retries of this command share.
    pub fn idempotency_key(&self) -> String {
        match &self.op {
            Operation::CreateNamespace { name, .. } => format!("namespace/{}", name),
            Operation::RegisterWorker { worker_id, .. } => format!("worker/{}", worker_id),
            Operation::RegisterLauncher { launcher_id, .. } => format!("launcher/{}", launcher_id),
            Operation::AssignPlacement { unit_id, .. } => format!("placement/{}", unit_id),
            Operation::UpdateWorkerStatus { worker_id, .. } => format!("heartbeat/{}", worker_id),
            Operation::UpdateLauncherStatus { launcher_id, .. } => {
                format!("launcher-heartbeat/{}", launcher_id)
            }
        }
    }

    /// Structural checks. A command failing these can never succeed, so the
    /// service rejects it before proposing and the state machine rejects it
    /// again on apply.
    pub fn validate(&self) -> Result<()> {
        fn required(field: &str, value: &str) -> Result<()> {
            if value.trim().is_empty() {
                return Err(Error::InvalidCommand(format!("{} must not be empty", field)));
            }
            Ok(())
        }

        match &self.op {
            Operation::CreateNamespace { name, .. } => required("namespace name", name),
            Operation::RegisterWorker {
                worker_id, address, ..
            } => {
                required("worker_id", worker_id)?;
                required("address", address)
            }
            Operation::RegisterLauncher {
                launcher_id,
                address,
                max_processes,
                ..
            } => {
                required("launcher_id", launcher_id)?;
                required("address", address)?;
                if *max_processes == 0 {
                    return Err(Error::InvalidCommand(
                        "max_processes must be positive".into(),
                    ));
                }
                Ok(())
            }
            Operation::AssignPlacement {
                unit_id, namespace, ..
            } => {
                required("unit_id", unit_id)?;
                required("namespace", namespace)
            }
            Operation::UpdateWorkerStatus { worker_id, .. } => required("worker_id", worker_id),
            Operation::UpdateLauncherStatus { launcher_id, .. } => {
                required("launcher_id", launcher_id)
            }
        }
    }
}

/// Result of applying a command, returned to the proposer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOutput {
    /// An entry without a command (a leader's no-op).
    Noop,
    NamespaceCreated {
        partition_id: u32,
        /// Current owner of the namespace partition, if any worker exists.
        owner: Option<String>,
        created: bool,
        revision: u64,
    },
    WorkerRegistered {
        ranges: Vec<PartitionRange>,
        namespaces: Vec<NamespaceEntry>,
        created: bool,
        revision: u64,
    },
    LauncherRegistered {
        created: bool,
        revision: u64,
    },
    PlacementAssigned {
        worker_id: String,
        created: bool,
        revision: u64,
    },
    WorkerStatusUpdated {
        revision: u64,
    },
    LauncherStatusUpdated {
        revision: u64,
    },
}

impl CommandOutput {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
