//! Replication system variables.
//!
//! Read through a shared handle rather than a process global so tests can
//! swap the whole table. Empty strings mean "unset", matching the global
//! settings table these mirror.

use parking_lot::RwLock;

#[derive(Debug, Clone, Default)]
struct Vars {
    read_replica_remote: String,
    replicate_to_remote: String,
    replication_remote_url_template: String,
    show_branch_databases: bool,
}

/// The replication-relevant slice of the global settings table.
#[derive(Debug, Default)]
pub struct SystemVariables {
    inner: RwLock<Vars>,
}

impl SystemVariables {
    pub fn new() -> SystemVariables {
        SystemVariables::default()
    }

    /// Remote this server pulls from on demand as a read replica.
    pub fn read_replica_remote(&self) -> String {
        self.inner.read().read_replica_remote.clone()
    }

    pub fn set_read_replica_remote(&self, v: impl Into<String>) {
        self.inner.write().read_replica_remote = v.into();
    }

    /// Remote every database replicates to as a primary.
    pub fn replicate_to_remote(&self) -> String {
        self.inner.read().replicate_to_remote.clone()
    }

    pub fn set_replicate_to_remote(&self, v: impl Into<String>) {
        self.inner.write().replicate_to_remote = v.into();
    }

    /// URL template with a `{database}` placeholder, expanded per database.
    pub fn replication_remote_url_template(&self) -> String {
        self.inner.read().replication_remote_url_template.clone()
    }

    pub fn set_replication_remote_url_template(&self, v: impl Into<String>) {
        self.inner.write().replication_remote_url_template = v.into();
    }

    /// Whether `all_databases` also lists one database per branch.
    pub fn show_branch_databases(&self) -> bool {
        self.inner.read().show_branch_databases
    }

    pub fn set_show_branch_databases(&self, v: bool) {
        self.inner.write().show_branch_databases = v;
    }
}
