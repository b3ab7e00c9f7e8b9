//! Global configuration constants for dagdb.
//!
//! Tuning parameters and on-disk layout names live here; runtime settings
//! (replication remotes, URL templates) are system variables owned by the
//! server crate.

/// Name of the metadata directory inside every database directory.
pub const DOLT_DIR: &str = ".dolt";

/// File inside [`DOLT_DIR`] holding the database's refs metadata.
pub const REFS_FILE: &str = "refs.json";

/// Branch created for a database when none is configured.
pub const DEFAULT_BRANCH: &str = "main";

/// Delimiter between a database name and a revision spec (`db/branch`).
pub const DB_REVISION_DELIMITER: char = '/';

/// Delay before a failed replication attempt is retried.
///
/// Fixed rather than exponential; a newer head arriving clears it.
pub const REPLICATION_RETRY_DELAY_MS: u64 = 1_000;

/// Wakeup period of the per-hook ticker that drives retry backoff and
/// heartbeats when no commits arrive.
pub const REPLICATION_TICK_MS: u64 = 1_000;

/// Upper bound on a standby liveness heartbeat.
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 5;
