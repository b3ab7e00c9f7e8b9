//! The database provider.
//!
//! Maps database names to databases for the SQL engine: splits `db/rev`
//! names and resolves revisions, clones read replicas on demand, creates and
//! drops databases on disk (one directory each, with a `.dolt` metadata
//! subdirectory), and wraps every database read-only while the server is a
//! standby. The `InitDatabaseHook`/`DropDatabaseHook` callbacks are how the
//! cluster controller attaches and detaches replication hooks.
//!
//! One RW lock guards the name maps; it is never held across a remote call.

/// Revision databases and revision-spec classification.
pub mod revision;

pub use revision::{classify_revision, split_revision_db_name, Revision, RevisionType, SqlDatabase};

use crate::session::{Session, SessionManager};
use crate::sysvars::SystemVariables;
use dagdb_core::config::{DB_REVISION_DELIMITER, DOLT_DIR};
use dagdb_core::db::{Db, DbError};
use dagdb_core::remotes::{expand_url_template, Remote, RemoteFactoryRegistry};
use dagdb_core::{ChunkStore, MemoryChunkStore, StoreError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("database not found: {0}")]
    DatabaseNotFound(String),

    #[error("can't create database {0}; database exists")]
    DatabaseExists(String),

    #[error("cannot create database, file exists at {0}")]
    FileExists(String),

    #[error("unable to drop revision database: {0}")]
    DropRevisionDatabase(String),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

type HookFuture = Pin<Box<dyn Future<Output = Result<(), ProviderError>> + Send>>;

/// Invoked after a database is created or cloned, before it is published.
/// The default installed by the cluster controller attaches replication.
pub type InitDatabaseHook = Arc<dyn Fn(String, Arc<Db>) -> HookFuture + Send + Sync>;

/// Invoked while a database is being dropped.
pub type DropDatabaseHook = Arc<dyn Fn(&str) + Send + Sync>;

struct ProviderState {
    /// lowercase base name -> base database.
    databases: HashMap<String, SqlDatabase>,
    /// lowercase base name -> database directory.
    db_locations: HashMap<String, PathBuf>,
    /// When set, every returned database is wrapped read-only.
    is_standby: bool,
}

/// Maps database names to databases and owns their on-disk lifecycle.
pub struct DatabaseProvider {
    root: PathBuf,
    default_branch: String,
    sysvars: Arc<SystemVariables>,
    remotes: Arc<RemoteFactoryRegistry>,
    sessions: Arc<SessionManager>,
    state: RwLock<ProviderState>,
    init_hook: RwLock<Option<InitDatabaseHook>>,
    drop_hook: RwLock<Option<DropDatabaseHook>>,
}

impl DatabaseProvider {
    /// Build a provider rooted at `root`, loading any databases already on
    /// disk (directories with a `.dolt` subdirectory).
    pub fn new(
        root: impl Into<PathBuf>,
        default_branch: impl Into<String>,
        sysvars: Arc<SystemVariables>,
        remotes: Arc<RemoteFactoryRegistry>,
        sessions: Arc<SessionManager>,
    ) -> Result<Arc<DatabaseProvider>, ProviderError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let provider = Arc::new(DatabaseProvider {
            root,
            default_branch: default_branch.into(),
            sysvars,
            remotes,
            sessions,
            state: RwLock::new(ProviderState {
                databases: HashMap::new(),
                db_locations: HashMap::new(),
                is_standby: false,
            }),
            init_hook: RwLock::new(None),
            drop_hook: RwLock::new(None),
        });
        provider.load_existing()?;
        Ok(provider)
    }

    fn load_existing(&self) -> Result<(), ProviderError> {
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let dir = entry.path();
            if !dir.join(DOLT_DIR).is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            match Db::open(name.as_str(), &dir, self.store_for_location(&dir)) {
                Ok(db) => self.publish(SqlDatabase::base(db), dir),
                Err(err) => {
                    tracing::warn!(db = %name, "skipping unreadable database directory: {err}");
                }
            }
        }
        Ok(())
    }

    /// The chunk store for a database directory, memoized in the singleton
    /// cache so a drop can evict it.
    fn store_for_location(&self, dir: &Path) -> Arc<dyn ChunkStore> {
        let key = dir.to_string_lossy().to_string();
        if let Some(store) = self.remotes.cache().get(&key) {
            return store;
        }
        let store: Arc<dyn ChunkStore> = Arc::new(MemoryChunkStore::new());
        self.remotes.cache().insert(key, store.clone());
        store
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn default_branch(&self) -> &str {
        &self.default_branch
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn set_init_database_hook(&self, hook: Option<InitDatabaseHook>) {
        *self.init_hook.write() = hook;
    }

    pub fn set_drop_database_hook(&self, hook: Option<DropDatabaseHook>) {
        *self.drop_hook.write() = hook;
    }

    /// Standby mode: every database handed out is read-only until cleared.
    pub fn set_is_standby(&self, standby: bool) {
        self.state.write().is_standby = standby;
    }

    pub fn is_standby(&self) -> bool {
        self.state.read().is_standby
    }

    /// Register an already-open database (e.g. one living at the provider
    /// root) under its own name.
    pub fn register_database(&self, db: Arc<Db>, location: impl Into<PathBuf>) {
        self.publish(SqlDatabase::base(db), location.into());
    }

    fn publish(&self, db: SqlDatabase, location: PathBuf) {
        let key = db.db().name().to_lowercase();
        let mut st = self.state.write();
        st.databases.insert(key.clone(), db);
        st.db_locations.insert(key, location);
    }

    /// Directory of the named database (revision suffix ignored).
    pub fn file_system_for_database(&self, name: &str) -> Result<PathBuf, ProviderError> {
        let (base, _) = split_revision_db_name(name);
        self.state
            .read()
            .db_locations
            .get(&base.to_lowercase())
            .cloned()
            .ok_or_else(|| ProviderError::DatabaseNotFound(name.to_string()))
    }

    fn wrap_for_standby(&self, db: SqlDatabase, standby: bool) -> SqlDatabase {
        if standby && !db.is_read_only() {
            db.into_read_only()
        } else {
            db
        }
    }

    /// Base database lookup, revision suffix ignored. No clone-on-demand.
    pub fn base_database(&self, name: &str) -> Option<SqlDatabase> {
        let (base, _) = split_revision_db_name(name);
        self.state
            .read()
            .databases
            .get(&base.to_lowercase())
            .cloned()
    }

    /// Resolve `name` for a session, or error when it cannot be found.
    pub async fn database(
        &self,
        session: &Session,
        name: &str,
    ) -> Result<SqlDatabase, ProviderError> {
        self.session_database(session, name)
            .await?
            .ok_or_else(|| ProviderError::DatabaseNotFound(name.to_string()))
    }

    pub async fn has_database(&self, session: &Session, name: &str) -> bool {
        match self.session_database(session, name).await {
            Ok(found) => found.is_some(),
            Err(err) => {
                tracing::warn!(db = name, "error getting database: {err}");
                false
            }
        }
    }

    /// Resolve `name` for a session: base lookup (with read-replica
    /// clone-on-demand on miss), then revision resolution. Unqualified names
    /// resolve through the session's current head when one is set.
    pub async fn session_database(
        &self,
        session: &Session,
        name: &str,
    ) -> Result<Option<SqlDatabase>, ProviderError> {
        let (base, rev) = split_revision_db_name(name);
        let base_key = base.to_lowercase();

        let (mut found, standby) = {
            let st = self.state.read();
            (st.databases.get(&base_key).cloned(), st.is_standby)
        };

        if found.is_none() {
            // A failed clone is a miss, not an error: the replica may simply
            // not have this database.
            found = match self.attempt_clone_replica(session, &base_key).await {
                Ok(cloned) => cloned,
                Err(err) => {
                    tracing::warn!(db = %base_key, "couldn't clone database: {err}");
                    None
                }
            };
        }
        let Some(base_db) = found else {
            return Ok(None);
        };

        let qualified = match rev {
            Some(_) => Some(name.to_string()),
            // A session with a checked-out head addresses that revision even
            // through the bare name.
            None => session
                .current_head(base)
                .map(|head| format!("{base}{DB_REVISION_DELIMITER}{head}")),
        };

        let resolved = match qualified {
            Some(qualified) => match self.database_for_revision(session, &qualified, name)? {
                Some(db) => db,
                None => return Ok(None),
            },
            None => base_db,
        };

        Ok(Some(self.wrap_for_standby(resolved, standby)))
    }

    /// Resolve a revision-qualified name, consulting the session cache first.
    fn database_for_revision(
        &self,
        session: &Session,
        qualified_name: &str,
        requested_name: &str,
    ) -> Result<Option<SqlDatabase>, ProviderError> {
        let (base, Some(rev)) = split_revision_db_name(qualified_name) else {
            return Ok(None);
        };

        if let Some(cached) = session.cached_revision_db(qualified_name) {
            return Ok(Some(cached));
        }

        let src = self.state.read().databases.get(&base.to_lowercase()).cloned();
        let Some(src) = src else {
            return Ok(None);
        };

        match classify_revision(src.db(), rev) {
            Some(revision) => {
                let db = SqlDatabase::revision(src.db().clone(), requested_name, revision);
                session.cache_revision_db(qualified_name, db.clone());
                Ok(Some(db))
            }
            // The fully qualified name is our only chance to report what
            // exactly could not be found (e.g. a branch deleted elsewhere).
            None => Err(ProviderError::DatabaseNotFound(qualified_name.to_string())),
        }
    }

    /// Every known database, plus revision databases per branch when
    /// `show_branch_databases` is set, plus the session's current revision
    /// database. Sorted by name for a stable listing.
    pub fn all_databases(&self, session: &Session) -> Vec<SqlDatabase> {
        let (bases, standby) = {
            let st = self.state.read();
            (
                st.databases.values().cloned().collect::<Vec<_>>(),
                st.is_standby,
            )
        };
        let show_branches = self.sysvars.show_branch_databases();

        let mut all = Vec::with_capacity(bases.len());
        for db in &bases {
            all.push(db.clone());
            if show_branches {
                for branch in db.db().branches() {
                    let name = format!("{}{DB_REVISION_DELIMITER}{branch}", db.db().name());
                    all.push(SqlDatabase::revision(
                        db.db().clone(),
                        name,
                        Revision {
                            spec: branch,
                            kind: RevisionType::Branch,
                        },
                    ));
                }
            }
        }

        let current = session.current_database();
        let (_, current_rev) = split_revision_db_name(&current);
        if current_rev.is_some() && !show_branches {
            match self.database_for_revision(session, &current, &current) {
                Ok(Some(db)) => all.push(db),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(db = %current, "error fetching revision database: {err}")
                }
            }
        }

        all.sort_by(|a, b| a.name().to_lowercase().cmp(&b.name().to_lowercase()));
        all.into_iter()
            .map(|db| self.wrap_for_standby(db, standby))
            .collect()
    }

    /// Clone a missing database from the read-replica remote, when both
    /// `read_replica_remote` and `replication_remote_url_template` are set.
    async fn attempt_clone_replica(
        &self,
        session: &Session,
        base_key: &str,
    ) -> Result<Option<SqlDatabase>, ProviderError> {
        let remote_name = self.sysvars.read_replica_remote();
        if remote_name.is_empty() {
            return Ok(None);
        }
        let template = self.sysvars.replication_remote_url_template();
        if template.is_empty() {
            return Ok(None);
        }

        let remote_url = expand_url_template(&template, base_key);
        let default_branch = self.default_branch.clone();
        self.clone_database_from_remote(session, base_key, &default_branch, &remote_name, &remote_url)
            .await?;

        // Register the fresh clone with the requesting session.
        session.set_current_head(base_key, self.default_branch.clone());
        Ok(self.state.read().databases.get(base_key).cloned())
    }

    /// Create an empty database with the default collation.
    pub async fn create_database(
        &self,
        session: &Session,
        name: &str,
    ) -> Result<(), ProviderError> {
        self.create_collated_database(session, name, None).await
    }

    /// Create an empty database. The `create_dir` is the filesystem-level
    /// exclusive lock: success means we own the name.
    pub async fn create_collated_database(
        &self,
        session: &Session,
        name: &str,
        collation: Option<&str>,
    ) -> Result<(), ProviderError> {
        let dir = self.root.join(name);
        if dir.is_file() {
            return Err(ProviderError::FileExists(dir.display().to_string()));
        }
        if let Err(err) = fs::create_dir(&dir) {
            return Err(if err.kind() == std::io::ErrorKind::AlreadyExists {
                ProviderError::DatabaseExists(name.to_string())
            } else {
                err.into()
            });
        }

        let db = Db::init(
            name,
            &dir,
            self.store_for_location(&dir),
            &self.default_branch,
        )?;
        if let Some(collation) = collation {
            db.set_collation(collation)?;
        }

        // By default the init hook configures standby replication for the
        // new database when a remote URL template is set.
        let init_hook = self.init_hook.read().clone();
        if let Some(hook) = init_hook {
            hook(name.to_string(), db.clone()).await?;
        }

        let sql_db = SqlDatabase::base(db)
            .with_foreign_key_checks_disabled(!session.foreign_key_checks());
        self.publish(sql_db, dir);
        Ok(())
    }

    /// Clone a database from a remote. Any failure deletes the partial
    /// directory best-effort before the error is returned.
    pub async fn clone_database_from_remote(
        &self,
        session: &Session,
        name: &str,
        branch: &str,
        remote_name: &str,
        remote_url: &str,
    ) -> Result<(), ProviderError> {
        let dir = self.root.join(name);
        if dir.is_file() {
            return Err(ProviderError::FileExists(dir.display().to_string()));
        }
        if dir.is_dir() {
            return Err(ProviderError::DatabaseExists(name.to_string()));
        }

        match self
            .clone_inner(session, name, &dir, branch, remote_name, remote_url)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                if dir.exists() {
                    if let Err(cleanup) = fs::remove_dir_all(&dir) {
                        return Err(ProviderError::Other(format!(
                            "{err}: unable to clean up failed clone in directory '{}': {cleanup}",
                            dir.display()
                        )));
                    }
                }
                Err(err)
            }
        }
    }

    async fn clone_inner(
        &self,
        session: &Session,
        name: &str,
        dir: &Path,
        branch: &str,
        remote_name: &str,
        remote_url: &str,
    ) -> Result<(), ProviderError> {
        fs::create_dir(dir)?;
        let remote_store = self.remotes.open(remote_url).await?;
        let local_store = self.store_for_location(dir);
        let db = Db::init(name, dir, local_store.clone(), branch)?;

        remote_store.rebase().await?;
        let head = remote_store.root().await?;
        if !head.is_empty() {
            let temp_dir = dir.join(DOLT_DIR).join("tmp");
            fs::create_dir_all(&temp_dir)?;
            local_store
                .pull_chunks(&temp_dir, remote_store.clone(), &[head])
                .await?;
            local_store.commit(head, dagdb_core::Head::EMPTY).await?;
            db.set_branch_head(branch, head)?;
            db.set_remote_branch_head(branch, head)?;
        }
        db.add_remote(&Remote::new(remote_name, remote_url))?;

        let init_hook = self.init_hook.read().clone();
        if let Some(hook) = init_hook {
            hook(name.to_string(), db.clone()).await?;
        }

        let sql_db = SqlDatabase::base(db)
            .with_foreign_key_checks_disabled(!session.foreign_key_checks());
        self.publish(sql_db, dir.to_path_buf());
        Ok(())
    }

    /// Drop a database: close it, evict its chunk-store cache entry, run the
    /// drop hook, delete its directory (only the `.dolt` subdirectory when
    /// the database sits at the provider root, so nested databases survive),
    /// purge derivative entries, and invalidate state in every live session.
    pub fn drop_database(&self, name: &str) -> Result<(), ProviderError> {
        let (_, rev) = split_revision_db_name(name);
        if rev.is_some() {
            return Err(ProviderError::DropRevisionDatabase(name.to_string()));
        }

        let key = name.to_lowercase();
        let (db, location) = {
            let st = self.state.read();
            match (st.databases.get(&key), st.db_locations.get(&key)) {
                (Some(db), Some(location)) => (db.clone(), location.clone()),
                _ => return Err(ProviderError::DatabaseNotFound(name.to_string())),
            }
        };

        db.db().close();

        // A re-created database must not see cached results.
        self.remotes
            .cache()
            .evict(&location.to_string_lossy());

        let drop_hook = self.drop_hook.read().clone();
        if let Some(hook) = drop_hook {
            // Hooks see the name as addressed, not the map key.
            hook(name);
        }

        let dir_to_delete = if location == self.root {
            let dolt_dir = location.join(DOLT_DIR);
            if !dolt_dir.is_dir() {
                return Err(ProviderError::DatabaseNotFound(name.to_string()));
            }
            dolt_dir
        } else {
            if !location.is_dir() {
                return Err(ProviderError::DatabaseNotFound(name.to_string()));
            }
            location.clone()
        };
        fs::remove_dir_all(&dir_to_delete)?;

        {
            let mut st = self.state.write();
            st.databases.remove(&key);
            st.db_locations.remove(&key);
            // USE and connection strings leave derivative revision entries.
            let derivative_prefix = format!("{key}{DB_REVISION_DELIMITER}");
            st.databases.retain(|k, _| !k.starts_with(&derivative_prefix));
        }

        self.sessions.for_each(|session| session.remove_db_state(name));
        Ok(())
    }
}
