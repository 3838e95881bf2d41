//! # minictl
//!
//! The replicated core of a control plane:
//! - Raft consensus among coordinators, with leader leases and read indexes
//! - An idempotent admin state machine (namespaces, workers, launchers,
//!   placements) with snapshots and log compaction
//! - HRW partition assignment, recomputed from the worker set on demand
//! - gRPC control-plane API with per-read consistency levels and
//!   transparent follower-to-leader forwarding
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │            Coordinator Cluster               │
//! │   (Raft log of admin commands)               │
//! │   - Leader: applies writes, serves           │
//! │     lease-based and linearizable reads       │
//! │   - Followers: replicate, serve stale reads, │
//! │     forward writes to the leader             │
//! └───────────┬──────────────────────────────────┘
//!             │ gRPC (ControlPlane)
//!   ┌─────────┴──────────┬──────────────┐
//!   │                    │              │
//! ┌─▼──────────┐   ┌─────▼──────┐   ┌───▼──────────┐
//! │ Worker 1   │   │ Worker 2   │   │ Launcher     │
//! │ (ranges)   │   │ (ranges)   │   │              │
//! └────────────┘   └────────────┘   └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! minictl-coord serve \
//!   --id c1 \
//!   --bind 0.0.0.0:7001 \
//!   --data ./c1-data \
//!   --peers c2=10.0.0.2:7001,c3=10.0.0.3:7001
//! ```

pub mod common;
pub mod coordinator;
pub mod proto;
pub mod raft;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::{Coordinator, CoordinatorHandle};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
