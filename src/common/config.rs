//! Configuration for minictl coordinators

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Global configuration, as loaded from `minictl.toml` and `MINICTL__*`
/// environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Coordinator-specific config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<CoordinatorConfig>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load `minictl.toml` (optional) from the working directory, overlaid
    /// with `MINICTL__SECTION__KEY` environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from("minictl")
    }

    /// Load from an explicit file stem or path (extension optional).
    pub fn load_from(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("MINICTL")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

/// Read consistency level for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyLevel {
    /// Local FSM copy, any node, no leader check.
    Stale,
    /// Leader only, trusting an unexpired leadership lease.
    LeaseBased,
    /// Leader only, after a fresh quorum round.
    Linearizable,
}

impl std::fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsistencyLevel::Stale => write!(f, "stale"),
            ConsistencyLevel::LeaseBased => write!(f, "lease_based"),
            ConsistencyLevel::Linearizable => write!(f, "linearizable"),
        }
    }
}

/// Default consistency per read operation, used when a caller leaves the
/// level unspecified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadConsistencyTable {
    #[serde(default = "default_stale")]
    pub get_namespace: ConsistencyLevel,
    #[serde(default = "default_stale")]
    pub list_namespaces: ConsistencyLevel,
    #[serde(default = "default_stale")]
    pub get_cluster_status: ConsistencyLevel,
}

fn default_stale() -> ConsistencyLevel {
    ConsistencyLevel::Stale
}

impl Default for ReadConsistencyTable {
    fn default() -> Self {
        Self {
            get_namespace: ConsistencyLevel::Stale,
            list_namespaces: ConsistencyLevel::Stale,
            get_cluster_status: ConsistencyLevel::Stale,
        }
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Node ID, unique in the cluster
    pub node_id: String,

    /// Bind address for the gRPC listener
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Address peers use to reach this node. Defaults to `bind_addr`.
    #[serde(default)]
    pub advertise_addr: Option<String>,

    /// Directory for the Raft log, hard state and snapshots. In-memory when
    /// absent.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Other coordinators: node ID to gRPC address
    #[serde(default)]
    pub peers: BTreeMap<String, String>,

    /// Raft logical clock resolution
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Leader heartbeat interval
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Lower bound of the randomized election timeout; the upper bound is
    /// twice this value.
    #[serde(default = "default_election_timeout")]
    pub election_timeout_ms: u64,

    /// Leadership lease, must be shorter than the election timeout.
    /// 0 disables leases, so lease-based reads always confirm leadership.
    #[serde(default = "default_lease_duration")]
    pub lease_duration_ms: u64,

    /// Default time a write waits for commitment
    #[serde(default = "default_apply_timeout")]
    pub apply_timeout_ms: u64,

    /// Applied entries between snapshots
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,

    /// Entries kept behind a snapshot for slow followers
    #[serde(default = "default_trailing_logs")]
    pub trailing_logs: u64,

    /// Number of virtual partitions
    #[serde(default = "default_num_partitions")]
    pub num_partitions: u32,

    /// Peer silence before it is reported suspect
    #[serde(default = "default_suspect_after")]
    pub suspect_after_ms: u64,

    /// Peer silence before it is reported dead
    #[serde(default = "default_dead_after")]
    pub dead_after_ms: u64,

    #[serde(default)]
    pub read_consistency: ReadConsistencyTable,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7001))
}
fn default_tick_interval() -> u64 {
    10
}
fn default_heartbeat_interval() -> u64 {
    50
}
fn default_election_timeout() -> u64 {
    150
}
fn default_lease_duration() -> u64 {
    100
}
fn default_apply_timeout() -> u64 {
    3_000
}
fn default_snapshot_threshold() -> u64 {
    10_000
}
fn default_trailing_logs() -> u64 {
    1_024
}
fn default_num_partitions() -> u32 {
    256
}
fn default_suspect_after() -> u64 {
    300
}
fn default_dead_after() -> u64 {
    1_500
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: "n1".to_string(),
            bind_addr: default_bind_addr(),
            advertise_addr: None,
            data_dir: None,
            peers: BTreeMap::new(),
            tick_interval_ms: default_tick_interval(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            election_timeout_ms: default_election_timeout(),
            lease_duration_ms: default_lease_duration(),
            apply_timeout_ms: default_apply_timeout(),
            snapshot_threshold: default_snapshot_threshold(),
            trailing_logs: default_trailing_logs(),
            num_partitions: default_num_partitions(),
            suspect_after_ms: default_suspect_after(),
            dead_after_ms: default_dead_after(),
            read_consistency: ReadConsistencyTable::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Reject configurations under which elections or leases are unsafe.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(Error::InvalidConfig("node_id cannot be empty".into()));
        }
        if self.peers.contains_key(&self.node_id) {
            return Err(Error::InvalidConfig(format!(
                "peers must not contain this node ({})",
                self.node_id
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(Error::InvalidConfig("tick_interval_ms must be > 0".into()));
        }
        if self.heartbeat_interval_ms < self.tick_interval_ms {
            return Err(Error::InvalidConfig(
                "heartbeat_interval_ms must be at least one tick".into(),
            ));
        }
        if self.election_timeout_ms <= self.heartbeat_interval_ms {
            return Err(Error::InvalidConfig(
                "election_timeout_ms must exceed heartbeat_interval_ms".into(),
            ));
        }
        if self.lease_duration_ms >= self.election_timeout_ms {
            return Err(Error::InvalidConfig(
                "lease_duration_ms must be shorter than election_timeout_ms".into(),
            ));
        }
        if self.num_partitions == 0 {
            return Err(Error::InvalidConfig("num_partitions must be > 0".into()));
        }
        if self.suspect_after_ms >= self.dead_after_ms {
            return Err(Error::InvalidConfig(
                "suspect_after_ms must be below dead_after_ms".into(),
            ));
        }
        Ok(())
    }

    /// Address advertised to peers and to forwarding followers.
    pub fn advertise_addr(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| self.bind_addr.to_string())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    /// Convert a millisecond setting to whole ticks, at least one.
    pub fn ticks(&self, ms: u64) -> u64 {
        (ms / self.tick_interval_ms.max(1)).max(1)
    }
}
