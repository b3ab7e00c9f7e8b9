//! Named database handle.
//!
//! A [`Db`] ties a chunk store to a directory on disk and the refs metadata
//! stored under its `.dolt` subdirectory: branches, remote-tracking branches,
//! tags, known commits, and configured remotes. Refs are tiny and rewritten
//! atomically (temp file + rename) on every mutation.
//!
//! After the engine finalizes a commit it runs the database's
//! [`CommitHook`]s; a hook may hand back a wait future the session blocks on
//! until the write has been replicated.

use crate::chunkstore::{ChunkStore, StoreError};
use crate::config::{DOLT_DIR, REFS_FILE};
use crate::hash::Head;
use crate::remotes::Remote;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Future a session can await until its commit has been replicated.
pub type CommitWait =
    Pin<Box<dyn Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>> + Send>>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database is closed")]
    Closed,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt refs metadata: {0}")]
    CorruptRefs(serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Hook invoked by the storage layer after a local commit succeeds.
#[async_trait]
pub trait CommitHook: Send + Sync {
    /// React to a commit on `dataset`. The returned future, if any, resolves
    /// once the commit has been replicated (or fails fast, see the cluster
    /// module).
    async fn execute(&self, dataset: &str, db: &Db) -> Result<Option<CommitWait>, DbError>;

    /// Invoked when `execute` returns an error; the default swallows it.
    async fn handle_error(&self, _err: &DbError) {}

    /// Whether the hook also fires for working-set updates, not just branch
    /// head moves.
    fn execute_for_working_sets(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RefData {
    default_branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    collation: Option<String>,
    branches: BTreeMap<String, Head>,
    remote_branches: BTreeMap<String, Head>,
    tags: BTreeMap<String, Head>,
    commits: BTreeSet<Head>,
    remotes: BTreeMap<String, String>,
}

/// A named database: chunk store + refs metadata + commit hooks.
pub struct Db {
    name: String,
    dir: PathBuf,
    store: Arc<dyn ChunkStore>,
    refs: RwLock<RefData>,
    hooks: RwLock<Vec<Arc<dyn CommitHook>>>,
    closed: AtomicBool,
}

impl Db {
    /// Initialize a fresh database in `dir`, creating the `.dolt` directory
    /// and refs metadata with `default_branch`.
    pub fn init(
        name: impl Into<String>,
        dir: impl Into<PathBuf>,
        store: Arc<dyn ChunkStore>,
        default_branch: &str,
    ) -> Result<Arc<Db>, DbError> {
        let dir = dir.into();
        fs::create_dir_all(dir.join(DOLT_DIR))?;
        let mut refs = RefData {
            default_branch: default_branch.to_string(),
            ..RefData::default()
        };
        refs.branches.insert(default_branch.to_string(), Head::EMPTY);
        save_refs(&dir, &refs)?;
        Ok(Arc::new(Db {
            name: name.into(),
            dir,
            store,
            refs: RwLock::new(refs),
            hooks: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }

    /// Open an existing database directory, loading its refs metadata.
    pub fn open(
        name: impl Into<String>,
        dir: impl Into<PathBuf>,
        store: Arc<dyn ChunkStore>,
    ) -> Result<Arc<Db>, DbError> {
        let dir = dir.into();
        let refs = load_refs(&dir)?;
        Ok(Arc::new(Db {
            name: name.into(),
            dir,
            store,
            refs: RwLock::new(refs),
            hooks: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn chunk_store(&self) -> Arc<dyn ChunkStore> {
        self.store.clone()
    }

    pub fn default_branch(&self) -> String {
        self.refs.read().default_branch.clone()
    }

    /// Default collation, when one was set at create time.
    pub fn collation(&self) -> Option<String> {
        self.refs.read().collation.clone()
    }

    pub fn set_collation(&self, collation: &str) -> Result<(), DbError> {
        let mut refs = self.refs.write();
        refs.collation = Some(collation.to_string());
        save_refs(&self.dir, &refs)
    }

    /// Mark the handle closed. Outstanding clones of the chunk store remain
    /// usable; the provider owns actual resource teardown.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Case-insensitive branch lookup returning the case-sensitive name.
    pub fn has_branch(&self, branch: &str) -> Option<String> {
        let refs = self.refs.read();
        refs.branches
            .keys()
            .find(|b| b.eq_ignore_ascii_case(branch))
            .cloned()
    }

    /// Case-insensitive remote-tracking branch lookup returning the
    /// case-sensitive name.
    pub fn has_remote_tracking_branch(&self, branch: &str) -> Option<String> {
        let refs = self.refs.read();
        refs.remote_branches
            .keys()
            .find(|b| b.eq_ignore_ascii_case(branch))
            .cloned()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.refs.read().tags.contains_key(tag)
    }

    /// Whether `head` names a commit known to this database.
    pub fn commit_exists(&self, head: Head) -> bool {
        self.refs.read().commits.contains(&head)
    }

    pub fn branch_head(&self, branch: &str) -> Option<Head> {
        self.refs.read().branches.get(branch).copied()
    }

    /// All local branch names, sorted.
    pub fn branches(&self) -> Vec<String> {
        self.refs.read().branches.keys().cloned().collect()
    }

    /// Move a branch head and persist the refs.
    pub fn set_branch_head(&self, branch: &str, head: Head) -> Result<(), DbError> {
        let mut refs = self.refs.write();
        refs.branches.insert(branch.to_string(), head);
        refs.commits.insert(head);
        save_refs(&self.dir, &refs)
    }

    /// Record a remote-tracking branch head and persist the refs.
    pub fn set_remote_branch_head(&self, branch: &str, head: Head) -> Result<(), DbError> {
        let mut refs = self.refs.write();
        refs.remote_branches.insert(branch.to_string(), head);
        refs.commits.insert(head);
        save_refs(&self.dir, &refs)
    }

    /// Record a tag and persist the refs.
    pub fn set_tag(&self, tag: &str, head: Head) -> Result<(), DbError> {
        let mut refs = self.refs.write();
        refs.tags.insert(tag.to_string(), head);
        refs.commits.insert(head);
        save_refs(&self.dir, &refs)
    }

    /// Add a remote if no remote with that name exists yet; adding the same
    /// remote twice is a no-op.
    pub fn add_remote(&self, remote: &Remote) -> Result<(), DbError> {
        let mut refs = self.refs.write();
        if let Some(existing) = refs.remotes.get(&remote.name) {
            if *existing == remote.url {
                return Ok(());
            }
            return Err(DbError::Other(format!(
                "remote {} already exists with url {}",
                remote.name, existing
            )));
        }
        refs.remotes.insert(remote.name.clone(), remote.url.clone());
        save_refs(&self.dir, &refs)
    }

    pub fn get_remote(&self, name: &str) -> Option<Remote> {
        self.refs
            .read()
            .remotes
            .get(name)
            .map(|url| Remote::new(name, url.clone()))
    }

    /// Replace the database's commit hooks.
    pub fn set_commit_hooks(&self, hooks: Vec<Arc<dyn CommitHook>>) {
        *self.hooks.write() = hooks;
    }

    pub fn commit_hooks(&self) -> Vec<Arc<dyn CommitHook>> {
        self.hooks.read().clone()
    }

    /// Run every commit hook for `dataset`, collecting their wait futures.
    ///
    /// Hook errors are reported to the hook itself and logged; they never
    /// fail the commit that already landed.
    pub async fn execute_commit_hooks(&self, dataset: &str) -> Vec<CommitWait> {
        let hooks = self.commit_hooks();
        let mut waits = Vec::new();
        for hook in hooks {
            match hook.execute(dataset, self).await {
                Ok(Some(wait)) => waits.push(wait),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(db = %self.name, dataset, "commit hook failed: {err}");
                    hook.handle_error(&err).await;
                }
            }
        }
        waits
    }
}

fn refs_path(dir: &Path) -> PathBuf {
    dir.join(DOLT_DIR).join(REFS_FILE)
}

fn load_refs(dir: &Path) -> Result<RefData, DbError> {
    let bytes = fs::read(refs_path(dir))?;
    serde_json::from_slice(&bytes).map_err(DbError::CorruptRefs)
}

/// Atomic refs write: temp file in the same directory, then rename.
fn save_refs(dir: &Path, refs: &RefData) -> Result<(), DbError> {
    let path = refs_path(dir);
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(refs).map_err(DbError::CorruptRefs)?;
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}
