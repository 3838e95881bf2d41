//! The admin state machine
//!
//! Applies committed commands to `AdminState`. The Raft task is the only
//! writer; request handlers read through an `AdminReader`. Both share one
//! `RwLock`, so a read never observes a half-applied command, and a
//! snapshot is serialized from a single consistent view.

use super::command::{Command, CommandOutput, Operation};
use super::metadata::{
    AdminState, LauncherEntry, NamespaceEntry, PlacementEntry, Settings, WorkerEntry,
};
use super::placement::PartitionCalculator;
use crate::common::{Error, Result};
use crate::raft::{Entry, Index, Snapshot, StateMachine};

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Layout version of serialized `AdminState` snapshots.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Health recorded for a worker that has registered but not yet reported.
const INITIAL_HEALTH: &str = "registered";

pub struct AdminStateMachine {
    state: Arc<RwLock<AdminState>>,
    calculator: PartitionCalculator,
}

impl AdminStateMachine {
    pub fn new(calculator: PartitionCalculator) -> Self {
        Self {
            state: Arc::new(RwLock::new(AdminState::default())),
            calculator,
        }
    }

    /// A read-only view that follows this state machine.
    pub fn reader(&self) -> AdminReader {
        AdminReader {
            state: Arc::clone(&self.state),
        }
    }

    fn execute(&self, state: &mut AdminState, command: Command) -> Result<CommandOutput> {
        let ts = command.timestamp;
        match command.op {
            Operation::CreateNamespace { name, config } => {
                self.create_namespace(state, ts, name, config)
            }
            Operation::RegisterWorker {
                worker_id,
                address,
                capabilities,
            } => self.register_worker(state, ts, worker_id, address, capabilities),
            Operation::RegisterLauncher {
                launcher_id,
                address,
                capabilities,
                max_processes,
            } => Self::register_launcher(state, ts, launcher_id, address, capabilities, max_processes),
            Operation::AssignPlacement {
                unit_id,
                namespace,
                config,
            } => self.assign_placement(state, ts, unit_id, namespace, config),
            Operation::UpdateWorkerStatus { worker_id, health } => {
                Self::update_worker_status(state, ts, worker_id, health)
            }
            Operation::UpdateLauncherStatus {
                launcher_id,
                health,
                available_slots,
            } => Self::update_launcher_status(state, ts, launcher_id, health, available_slots),
        }
    }

    fn create_namespace(
        &self,
        state: &mut AdminState,
        ts: u64,
        name: String,
        config: Settings,
    ) -> Result<CommandOutput> {
        let created = match state.namespaces.get(&name) {
            Some(existing) if existing.config == config => false,
            Some(_) => {
                return Err(Error::Conflict(format!(
                    "namespace {} exists with a different config",
                    name
                )))
            }
            None => {
                let partition_id = self.calculator.partition_for(&name);
                info!("Namespace {} created in partition {}", name, partition_id);
                state.namespaces.insert(
                    name.clone(),
                    NamespaceEntry {
                        name: name.clone(),
                        partition_id,
                        config,
                        created_at: ts,
                    },
                );
                state.revision += 1;
                true
            }
        };

        let partition_id = state.namespaces[&name].partition_id;
        let workers = state.worker_ids();
        Ok(CommandOutput::NamespaceCreated {
            partition_id,
            owner: self
                .calculator
                .owner_of(partition_id, &workers)
                .map(str::to_string),
            created,
            revision: state.revision,
        })
    }

    fn register_worker(
        &self,
        state: &mut AdminState,
        ts: u64,
        worker_id: String,
        address: String,
        capabilities: Vec<String>,
    ) -> Result<CommandOutput> {
        let created = match state.workers.get_mut(&worker_id) {
            Some(existing) => {
                if existing.address != address || existing.capabilities != capabilities {
                    info!("Worker {} re-registered at {}", worker_id, address);
                    existing.address = address;
                    existing.capabilities = capabilities;
                    state.revision += 1;
                }
                false
            }
            None => {
                info!("Worker {} registered at {}", worker_id, address);
                state.workers.insert(
                    worker_id.clone(),
                    WorkerEntry {
                        worker_id: worker_id.clone(),
                        address,
                        capabilities,
                        health: INITIAL_HEALTH.to_string(),
                        registered_at: ts,
                        last_heartbeat: ts,
                    },
                );
                state.revision += 1;
                true
            }
        };

        let workers = state.worker_ids();
        let ranges = self.calculator.compute_ranges(&worker_id, &workers);
        let namespaces = state.namespaces_in(|p| ranges.iter().any(|r| r.contains(p)));
        Ok(CommandOutput::WorkerRegistered {
            ranges,
            namespaces,
            created,
            revision: state.revision,
        })
    }

    fn register_launcher(
        state: &mut AdminState,
        ts: u64,
        launcher_id: String,
        address: String,
        capabilities: Vec<String>,
        max_processes: u32,
    ) -> Result<CommandOutput> {
        let created = match state.launchers.get_mut(&launcher_id) {
            Some(existing) => {
                if existing.address != address
                    || existing.capabilities != capabilities
                    || existing.max_processes != max_processes
                {
                    existing.address = address;
                    existing.capabilities = capabilities;
                    existing.max_processes = max_processes;
                    existing.available_slots = existing.available_slots.min(max_processes);
                    existing.updated_at = ts;
                    state.revision += 1;
                }
                false
            }
            None => {
                info!("Launcher {} registered at {}", launcher_id, address);
                state.launchers.insert(
                    launcher_id.clone(),
                    LauncherEntry {
                        launcher_id,
                        address,
                        capabilities,
                        max_processes,
                        health: INITIAL_HEALTH.to_string(),
                        available_slots: max_processes,
                        registered_at: ts,
                        updated_at: ts,
                        last_heartbeat: 0,
                    },
                );
                state.revision += 1;
                true
            }
        };
        Ok(CommandOutput::LauncherRegistered {
            created,
            revision: state.revision,
        })
    }

    fn assign_placement(
        &self,
        state: &mut AdminState,
        ts: u64,
        unit_id: String,
        namespace: String,
        config: Settings,
    ) -> Result<CommandOutput> {
        if let Some(existing) = state.placements.get(&unit_id) {
            if existing.namespace == namespace && existing.config == config {
                return Ok(CommandOutput::PlacementAssigned {
                    worker_id: existing.worker_id.clone(),
                    created: false,
                    revision: state.revision,
                });
            }
            return Err(Error::Conflict(format!(
                "unit {} already placed with a different payload",
                unit_id
            )));
        }

        let partition_id = state
            .namespaces
            .get(&namespace)
            .map(|ns| ns.partition_id)
            .ok_or_else(|| Error::NotFound(format!("namespace {}", namespace)))?;
        let workers = state.worker_ids();
        let worker_id = self
            .calculator
            .owner_of(partition_id, &workers)
            .map(str::to_string)
            .ok_or(Error::NoWorkers)?;

        info!("Unit {} placed on worker {}", unit_id, worker_id);
        state.placements.insert(
            unit_id.clone(),
            PlacementEntry {
                unit_id,
                namespace,
                config,
                worker_id: worker_id.clone(),
                assigned_at: ts,
            },
        );
        state.revision += 1;
        Ok(CommandOutput::PlacementAssigned {
            worker_id,
            created: true,
            revision: state.revision,
        })
    }

    fn update_worker_status(
        state: &mut AdminState,
        ts: u64,
        worker_id: String,
        health: String,
    ) -> Result<CommandOutput> {
        let worker = state
            .workers
            .get_mut(&worker_id)
            .ok_or_else(|| Error::NotFound(format!("worker {}", worker_id)))?;
        // Retries may be applied out of wall-clock order; an older report
        // never replaces a newer one.
        if ts >= worker.last_heartbeat
            && (ts != worker.last_heartbeat || worker.health != health)
        {
            debug!("Worker {} reported {}", worker_id, health);
            worker.health = health;
            worker.last_heartbeat = ts;
            state.revision += 1;
        }
        Ok(CommandOutput::WorkerStatusUpdated {
            revision: state.revision,
        })
    }

    fn update_launcher_status(
        state: &mut AdminState,
        ts: u64,
        launcher_id: String,
        health: String,
        available_slots: u32,
    ) -> Result<CommandOutput> {
        let launcher = state.launchers.get_mut(&launcher_id).ok_or_else(|| {
            warn!("Status update for unregistered launcher {}", launcher_id);
            Error::NotFound(format!("launcher {}", launcher_id))
        })?;
        let available_slots = available_slots.min(launcher.max_processes);
        if ts >= launcher.last_heartbeat
            && (ts != launcher.last_heartbeat
                || launcher.health != health
                || launcher.available_slots != available_slots)
        {
            debug!(
                "Launcher {} reported {} with {} free slots",
                launcher_id, health, available_slots
            );
            launcher.health = health;
            launcher.available_slots = available_slots;
            launcher.last_heartbeat = ts;
            state.revision += 1;
        }
        Ok(CommandOutput::LauncherStatusUpdated {
            revision: state.revision,
        })
    }
}

impl StateMachine for AdminStateMachine {
    fn applied_index(&self) -> Index {
        self.state.read().last_applied_index
    }

    fn apply(&mut self, entry: &Entry) -> Result<Vec<u8>> {
        let mut state = self.state.write();
        if entry.index <= state.last_applied_index {
            return Err(Error::Internal(format!(
                "entry {} already applied (applied index {})",
                entry.index, state.last_applied_index
            )));
        }
        // The entry counts as applied whatever its outcome.
        state.last_applied_index = entry.index;
        state.last_applied_term = entry.term;

        let Some(bytes) = &entry.command else {
            return CommandOutput::Noop.encode();
        };
        let command = Command::decode(bytes).and_then(|command| {
            command.validate()?;
            Ok(command)
        });
        let command = match command {
            Ok(command) => command,
            Err(e) => {
                warn!("Rejected entry {}: {}", entry.index, e);
                return Err(e);
            }
        };

        debug!("Applying {} at index {}", command.idempotency_key(), entry.index);
        self.execute(&mut state, command)?.encode()
    }

    fn snapshot(&self) -> Result<Snapshot> {
        let state = self.state.read();
        Ok(Snapshot {
            last_index: state.last_applied_index,
            last_term: state.last_applied_term,
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            data: bincode::serialize(&*state)?,
        })
    }

    fn restore(&mut self, snapshot: &Snapshot) -> Result<()> {
        if snapshot.schema_version != SNAPSHOT_SCHEMA_VERSION {
            return Err(Error::Corrupted(format!(
                "unsupported snapshot schema version {}",
                snapshot.schema_version
            )));
        }
        let restored: AdminState = bincode::deserialize(&snapshot.data)?;
        if restored.last_applied_index != snapshot.last_index {
            return Err(Error::Corrupted(format!(
                "snapshot at index {} holds state applied to {}",
                snapshot.last_index, restored.last_applied_index
            )));
        }
        *self.state.write() = restored;
        info!("Admin state restored from snapshot at index {}", snapshot.last_index);
        Ok(())
    }
}

/// Read access to the admin state, for request handlers.
///
/// Reads reflect the local node's applied index. They may lag the leader
/// but never go backwards.
#[derive(Clone)]
pub struct AdminReader {
    state: Arc<RwLock<AdminState>>,
}

impl AdminReader {
    /// Run `f` against a consistent view.
    pub fn read<T>(&self, f: impl FnOnce(&AdminState) -> T) -> T {
        f(&self.state.read())
    }

    /// A full copy of the current state.
    pub fn snapshot(&self) -> AdminState {
        self.state.read().clone()
    }

    pub fn applied_index(&self) -> Index {
        self.state.read().last_applied_index
    }

    pub fn revision(&self) -> u64 {
        self.state.read().revision
    }

    pub fn namespace(&self, name: &str) -> Option<NamespaceEntry> {
        self.state.read().namespaces.get(name).cloned()
    }

    pub fn namespaces(&self) -> Vec<NamespaceEntry> {
        self.state.read().namespaces.values().cloned().collect()
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.state.read().worker_ids()
    }
}
