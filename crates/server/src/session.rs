//! SQL sessions and the live-session registry.
//!
//! Only the slice of session state the provider cares about is modeled:
//! the current database, per-database current heads, the revision-database
//! cache, and session-level flags. The provider walks the registry to
//! invalidate state in every live session when a database is dropped.

use crate::provider::SqlDatabase;
use dagdb_core::config::DB_REVISION_DELIMITER;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// One client session.
pub struct Session {
    id: u64,
    current_database: Mutex<String>,
    /// base database name (lowercase) -> current branch.
    current_heads: Mutex<HashMap<String, String>>,
    /// revision-qualified name (lowercase) -> resolved database.
    revision_dbs: Mutex<HashMap<String, SqlDatabase>>,
    foreign_key_checks: AtomicBool,
}

impl Session {
    fn new(id: u64) -> Arc<Session> {
        Arc::new(Session {
            id,
            current_database: Mutex::new(String::new()),
            current_heads: Mutex::new(HashMap::new()),
            revision_dbs: Mutex::new(HashMap::new()),
            foreign_key_checks: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn current_database(&self) -> String {
        self.current_database.lock().clone()
    }

    pub fn set_current_database(&self, name: impl Into<String>) {
        *self.current_database.lock() = name.into();
    }

    /// The branch this session has checked out for `base`, if any.
    pub fn current_head(&self, base: &str) -> Option<String> {
        self.current_heads.lock().get(&base.to_lowercase()).cloned()
    }

    pub fn set_current_head(&self, base: &str, branch: impl Into<String>) {
        self.current_heads
            .lock()
            .insert(base.to_lowercase(), branch.into());
    }

    /// Session-level `foreign_key_checks` flag.
    pub fn foreign_key_checks(&self) -> bool {
        self.foreign_key_checks.load(Ordering::Acquire)
    }

    pub fn set_foreign_key_checks(&self, on: bool) {
        self.foreign_key_checks.store(on, Ordering::Release);
    }

    pub fn cached_revision_db(&self, qualified_name: &str) -> Option<SqlDatabase> {
        self.revision_dbs
            .lock()
            .get(&qualified_name.to_lowercase())
            .cloned()
    }

    pub fn cache_revision_db(&self, qualified_name: &str, db: SqlDatabase) {
        self.revision_dbs
            .lock()
            .insert(qualified_name.to_lowercase(), db);
    }

    /// Forget everything cached for `name`: its current head, the database
    /// itself, and every `name/rev` derivative. Called when the database is
    /// dropped so no session keeps stale state.
    pub fn remove_db_state(&self, name: &str) {
        let base = name.to_lowercase();
        let prefix = format!("{base}{DB_REVISION_DELIMITER}");
        self.current_heads.lock().remove(&base);
        self.revision_dbs
            .lock()
            .retain(|k, _| k != &base && !k.starts_with(&prefix));
        let mut current = self.current_database.lock();
        let current_base = current
            .split(DB_REVISION_DELIMITER)
            .next()
            .unwrap_or("")
            .to_lowercase();
        if current_base == base {
            current.clear();
        }
    }
}

/// Registry of live sessions.
#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<Vec<Weak<Session>>>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new() -> Arc<SessionManager> {
        Arc::new(SessionManager::default())
    }

    pub fn new_session(&self) -> Arc<Session> {
        let session = Session::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sessions.lock().push(Arc::downgrade(&session));
        session
    }

    /// Visit every live session, pruning dead entries as a side effect.
    pub fn for_each(&self, mut f: impl FnMut(&Session)) {
        let mut sessions = self.sessions.lock();
        sessions.retain(|weak| match weak.upgrade() {
            Some(session) => {
                f(&session);
                true
            }
            None => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_db_state_clears_derivatives() {
        let mgr = SessionManager::new();
        let session = mgr.new_session();
        session.set_current_database("appdb/feature");
        session.set_current_head("appdb", "main");
        assert_eq!(session.current_head("APPDB"), Some("main".to_string()));

        session.remove_db_state("AppDb");
        assert!(session.current_head("appdb").is_none());
        assert_eq!(session.current_database(), "");
    }

    #[test]
    fn test_for_each_prunes_dead_sessions() {
        let mgr = SessionManager::new();
        let keep = mgr.new_session();
        drop(mgr.new_session());
        let mut seen = Vec::new();
        mgr.for_each(|s| seen.push(s.id()));
        assert_eq!(seen, vec![keep.id()]);
        let mut second = 0;
        mgr.for_each(|_| second += 1);
        assert_eq!(second, 1);
    }
}
