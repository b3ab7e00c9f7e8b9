//! Cluster roles.

use std::fmt;

/// Role of this server in the replication topology.
///
/// Transitions are operator-driven through `ClusterController::set_role`;
/// the hooks only react. `DetectedBrokenConfig` is entered after observing
/// two primaries in the same epoch and freezes writes until a new role is
/// assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Originates writes and replicates them to the standby.
    Primary,
    /// Receives replicated roots; all local databases are read-only.
    Standby,
    /// Split-primary observed; refuses writes and reports the canonical
    /// error until reconfigured.
    DetectedBrokenConfig,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Standby => "standby",
            Role::DetectedBrokenConfig => "detected_broken_config",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-visible message installed as the current error while in
/// `DetectedBrokenConfig`. Wording is stable.
pub const DETECTED_BROKEN_CONFIG_ERROR: &str = "error: more than one server was configured as primary in the same epoch. this server has stopped accepting writes. choose a primary in the cluster and call dolt_assume_cluster_role() on servers in the cluster to start replication at a higher epoch";
