//! Standby replication for active-passive clusters.
//!
//! A **primary** server replicates each database's root hash to a standby
//! after every local commit: a [`StandbyReplicationHook`] per (database,
//! remote) pair pushes the newest head from a background worker, while the
//! committing session may block on an optional wait handle until its write
//! is on the standby. The [`ClusterController`] owns the hooks, fans out
//! role changes, and samples catch-up for graceful role transitions.

/// The per-database replication commit hook and its background worker.
pub mod commithook;
/// Hook ownership, role fan-out, and catch-up waiting.
pub mod controller;
/// Cluster roles.
pub mod role;

pub use commithook::{DestDbFactory, HookStatus, ReplicationWait, StandbyReplicationHook};
pub use controller::ClusterController;
pub use role::Role;

use dagdb_core::StoreError;
use thiserror::Error;

/// Errors surfaced by the replication subsystem.
///
/// The `DestDbRootHashMoved` and `CircuitBreakerOpen` message texts are
/// operator-visible and load-bearing; tooling greps for them.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("cluster/commithook: standby replication: destination database root hash moved during our write, while it is assumed we are the only writer.")]
    DestDbRootHashMoved,

    #[error("circuit breaker for replication to {remote}/{database} is open. this commit did not necessarily replicate successfully.")]
    CircuitBreakerOpen { remote: String, database: String },

    /// An in-flight attempt was interrupted by a role change or shutdown.
    #[error("replication attempt cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}
