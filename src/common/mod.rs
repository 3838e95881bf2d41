//! Common utilities and types shared across minictl

pub mod config;
pub mod error;
pub mod hash;
pub mod utils;

pub use config::{Config, ConsistencyLevel, CoordinatorConfig, ReadConsistencyTable};
pub use error::{Error, Result};
pub use hash::{hrw_owner, hrw_weight, shard_key};
pub use utils::{
    crc32, grpc_url, parse_grpc_timeout, retry_with_backoff, timestamp_now_millis, NodeState,
};
