//! The standby replication commit hook.
//!
//! One hook exists per (database, remote) pair. Commits land through
//! [`StandbyReplicationHook::execute`], which records the new head and wakes
//! the background worker; the worker pushes chunks to the standby and
//! advances its root, always targeting the *latest* head rather than a
//! queue. Committing sessions may block on a [`ReplicationWait`] until some
//! head at least as new as theirs is on the standby.
//!
//! Locking: every state field lives in one `parking_lot::Mutex`, released
//! around all remote calls; `shutdown` is atomic so the ticker can poll it
//! without the lock. The worker's condition variable is a
//! [`tokio::sync::Notify`] whose stored permit preserves "signal coalesces
//! if the worker hasn't consumed" semantics.

use crate::background::BackgroundThreads;
use crate::cluster::role::{Role, DETECTED_BROKEN_CONFIG_ERROR};
use crate::cluster::ReplicationError;
use dagdb_core::config::{HEARTBEAT_TIMEOUT_SECS, REPLICATION_RETRY_DELAY_MS, REPLICATION_TICK_MS};
use dagdb_core::db::{CommitHook, CommitWait, Db, DbError};
use dagdb_core::remotes::{Remote, RemoteFactoryRegistry};
use dagdb_core::{ChunkStore, Head, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{oneshot, watch, Notify};

/// Future resolving to a chunk-store client for the standby side.
pub type DestDbFuture = Pin<Box<dyn Future<Output = Result<Arc<dyn ChunkStore>, StoreError>> + Send>>;

/// Lazily dials the destination database. Called until it first succeeds;
/// failures are transient and retried with backoff.
pub type DestDbFactory = Arc<dyn Fn() -> DestDbFuture + Send + Sync>;

type WaitNotify = Box<dyn Fn() + Send + Sync>;

/// Point-in-time view of a hook, for operator status tables.
#[derive(Debug, Clone)]
pub struct HookStatus {
    pub role: Role,
    pub database: String,
    pub remote: String,
    /// Wall-clock time since the last successful replication, when behind.
    /// `Some(ZERO)` when caught up; `None` before the first push.
    pub replication_lag: Option<Duration>,
    pub last_update: Option<SystemTime>,
    pub current_error: Option<String>,
}

/// Handle a committing session blocks on until its write is replicated.
pub struct ReplicationWait {
    inner: WaitInner,
}

enum WaitInner {
    /// Circuit breaker is open: fail without blocking.
    CircuitOpen { remote: String, database: String },
    /// Resolves when the shared success channel closes.
    Pending(watch::Receiver<()>),
}

impl ReplicationWait {
    /// Block until the commit has been replicated.
    ///
    /// Callers bound this with `tokio::time::timeout`; dropping the future
    /// abandons the wait without affecting replication.
    pub async fn wait(self) -> Result<(), ReplicationError> {
        match self.inner {
            WaitInner::CircuitOpen { remote, database } => {
                Err(ReplicationError::CircuitBreakerOpen { remote, database })
            }
            WaitInner::Pending(mut rx) => {
                // The hook never sends values; the senders are dropped
                // together on success, which is the completion signal.
                while rx.changed().await.is_ok() {}
                Ok(())
            }
        }
    }

    /// Adapt into the storage layer's wait-future shape.
    pub fn into_commit_wait(self) -> CommitWait {
        Box::pin(async move {
            self.wait()
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
        })
    }
}

struct HookState {
    role: Role,
    /// Latest head the primary wants replicated; zero when unknown.
    next_head: Head,
    /// When `next_head` was first observed.
    next_head_incoming_time: Option<SystemTime>,
    /// Last head the standby acknowledged. Never regresses within a role
    /// epoch.
    last_pushed_head: Head,
    /// Incoming time of the last successfully replicated head.
    last_success: Option<SystemTime>,
    /// Earliest moment another attempt is allowed; `None` means immediately.
    next_push_attempt: Option<Instant>,
    current_error: Option<String>,
    /// Pending completion signals. All receivers subscribed to any sender in
    /// here resolve together when the senders are dropped on success.
    success_txs: Vec<watch::Sender<()>>,
    /// Circuit breaker: new wait requests fail immediately while set.
    fast_fail_replication_wait: bool,
    /// Interrupts the in-flight push or heartbeat, if any.
    cancel_replicate: Option<oneshot::Sender<()>>,
    /// Controller-installed probe, run once per idle loop iteration.
    wait_notify: Option<WaitNotify>,
    /// Lazily dialed standby client, memoized after the first success.
    dest_db: Option<Arc<dyn ChunkStore>>,
}

impl HookState {
    fn new(role: Role) -> HookState {
        HookState {
            role,
            next_head: Head::EMPTY,
            next_head_incoming_time: None,
            last_pushed_head: Head::EMPTY,
            last_success: None,
            next_push_attempt: None,
            current_error: None,
            success_txs: Vec::new(),
            fast_fail_replication_wait: false,
            cancel_replicate: None,
            wait_notify: None,
            dest_db: None,
        }
    }

    /// True when the standby has everything we know about. Non-primaries are
    /// caught up by definition, as is a primary with no head to push yet.
    fn is_caught_up(&self) -> bool {
        if self.role != Role::Primary {
            return true;
        }
        if self.next_head.is_empty() {
            return true;
        }
        self.next_head == self.last_pushed_head
    }

    /// Whether an attempt should run now: behind, and past any backoff.
    fn should_replicate(&self) -> bool {
        if self.is_caught_up() {
            return false;
        }
        match self.next_push_attempt {
            None => true,
            Some(at) => Instant::now() >= at,
        }
    }

    /// A fresh primary has no head yet and must adopt the local root.
    fn primary_needs_init(&self) -> bool {
        self.role == Role::Primary && self.next_head.is_empty()
    }

    fn heartbeat_target(&self) -> Option<(Head, Arc<dyn ChunkStore>)> {
        if self.role != Role::Primary || self.last_pushed_head.is_empty() {
            return None;
        }
        let dest = self.dest_db.clone()?;
        Some((self.last_pushed_head, dest))
    }

    fn schedule_retry(&mut self, attempted: Head) {
        // Only back off if no newer head arrived while we were pushing.
        if attempted == self.next_head {
            self.next_push_attempt =
                Some(Instant::now() + Duration::from_millis(REPLICATION_RETRY_DELAY_MS));
        }
    }
}

/// Replicates one database's root hash to one standby remote.
pub struct StandbyReplicationHook {
    remote_name: String,
    remote_url: String,
    db_name: String,
    temp_dir: PathBuf,
    src_store: Arc<dyn ChunkStore>,
    dest_db_factory: DestDbFactory,
    state: Mutex<HookState>,
    work: Notify,
    shutdown: AtomicBool,
}

impl StandbyReplicationHook {
    pub fn new(
        remote: &Remote,
        db_name: impl Into<String>,
        role: Role,
        dest_db_factory: DestDbFactory,
        src_store: Arc<dyn ChunkStore>,
        temp_dir: impl Into<PathBuf>,
    ) -> Arc<StandbyReplicationHook> {
        Arc::new(StandbyReplicationHook {
            remote_name: remote.name.clone(),
            remote_url: remote.url.clone(),
            db_name: db_name.into(),
            temp_dir: temp_dir.into(),
            src_store,
            dest_db_factory,
            state: Mutex::new(HookState::new(role)),
            work: Notify::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Destination factory that dials `url` through the remote registry.
    pub fn registry_factory(registry: Arc<RemoteFactoryRegistry>, url: String) -> DestDbFactory {
        Arc::new(move || {
            let registry = registry.clone();
            let url = url.clone();
            Box::pin(async move { registry.open(&url).await })
        })
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    pub fn remote_url(&self) -> &str {
        &self.remote_url
    }

    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    pub fn is_caught_up(&self) -> bool {
        self.state.lock().is_caught_up()
    }

    /// Bind the worker and its ticker to the background registry.
    pub fn bind(self: &Arc<Self>, bt: &BackgroundThreads) {
        let name = format!(
            "Standby Replication - {} to {}",
            self.db_name, self.remote_name
        );
        let hook = Arc::clone(self);
        bt.add(name, move |ctx| hook.run(ctx));
    }

    /// Called by the storage layer after a local commit succeeds.
    ///
    /// Records the new head, wakes the worker, and hands back an optional
    /// wait handle. Non-primaries accept the commit without replicating it.
    pub async fn execute(
        &self,
        dataset: &str,
        db: &Db,
    ) -> Result<Option<ReplicationWait>, ReplicationError> {
        tracing::trace!(db = %self.db_name, "cluster/commithook: execute called post commit");
        let root = match db.chunk_store().root().await {
            Ok(root) => root,
            Err(err) => {
                tracing::error!(
                    db = %self.db_name,
                    "cluster/commithook: execute: error retrieving local database root: {err}"
                );
                return Err(err.into());
            }
        };

        let mut st = self.state.lock();
        if st.role != Role::Primary {
            tracing::warn!(
                db = %self.db_name,
                dataset,
                role = %st.role,
                "cluster/commithook received commit callback for a commit, but we are not role \
                 primary; not replicating the commit, which is likely to be lost"
            );
            return Ok(None);
        }
        if root != st.next_head {
            tracing::trace!(db = %self.db_name, head = %root, "signaling replication thread to push new head");
            st.next_head_incoming_time = Some(SystemTime::now());
            st.next_head = root;
            st.next_push_attempt = None;
            self.work.notify_one();
        }
        if st.is_caught_up() {
            return Ok(None);
        }
        if st.fast_fail_replication_wait {
            return Ok(Some(ReplicationWait {
                inner: WaitInner::CircuitOpen {
                    remote: self.remote_name.clone(),
                    database: self.db_name.clone(),
                },
            }));
        }
        // Waiters share one channel: everyone subscribed resolves together
        // on the next success.
        if st.success_txs.is_empty() {
            let (tx, _) = watch::channel(());
            st.success_txs.push(tx);
        }
        let rx = st.success_txs[0].subscribe();
        Ok(Some(ReplicationWait {
            inner: WaitInner::Pending(rx),
        }))
    }

    /// Open the circuit breaker. Called by the controller after observing a
    /// blocked committer time out; cleared by the next successful push.
    pub fn notify_wait_failed(&self) {
        self.state.lock().fast_fail_replication_wait = true;
    }

    /// The database behind this hook was dropped; stop the worker.
    pub fn database_was_dropped(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.work.notify_one();
    }

    /// Standby-side acknowledgment of a commit received over the wire.
    pub fn record_successful_remote_srv_commit(&self) {
        let mut st = self.state.lock();
        if st.role != Role::Standby {
            return;
        }
        st.last_success = Some(SystemTime::now());
        st.current_error = None;
    }

    /// Assign a new role, resetting replication state and cancelling any
    /// in-flight push. When transitioning into Primary the worker adopts the
    /// current chunk-store root as the head to replicate.
    pub fn set_role(&self, role: Role) {
        let mut st = self.state.lock();
        st.current_error = None;
        st.next_head = Head::EMPTY;
        st.next_head_incoming_time = None;
        st.last_pushed_head = Head::EMPTY;
        st.last_success = None;
        st.next_push_attempt = None;
        st.role = role;
        if let Some(cancel) = st.cancel_replicate.take() {
            let _ = cancel.send(());
        }
        if role == Role::DetectedBrokenConfig {
            st.current_error = Some(DETECTED_BROKEN_CONFIG_ERROR.to_string());
        }
        tracing::info!(db = %self.db_name, role = %role, "cluster/commithook: role assigned");
        self.work.notify_one();
    }

    /// Install (or clear) the controller's idle probe. Single slot: a second
    /// install is refused so observers cannot overlap.
    pub fn set_wait_notify(&self, f: Option<WaitNotify>) -> bool {
        let mut st = self.state.lock();
        if let Some(f) = f {
            if st.wait_notify.is_some() {
                return false;
            }
            f();
            st.wait_notify = Some(f);
        } else {
            st.wait_notify = None;
        }
        true
    }

    /// Operator status: lag, last update, and the current error if any.
    pub fn status(&self) -> HookStatus {
        let st = self.state.lock();
        let mut replication_lag = None;
        if st.role == Role::Primary && !st.last_pushed_head.is_empty() {
            replication_lag = Some(if st.next_head != st.last_pushed_head {
                // Wall-clock time since the last success. If the server has
                // been idle this overstates the backlog, but a write that
                // fails to replicate for a long time merits investigation
                // regardless of how many writes are behind it.
                st.last_success
                    .and_then(|t| SystemTime::now().duration_since(t).ok())
                    .unwrap_or_default()
            } else {
                Duration::ZERO
            });
        }
        HookStatus {
            role: st.role,
            database: self.db_name.clone(),
            remote: self.remote_name.clone(),
            replication_lag,
            last_update: st.last_success,
            current_error: st.current_error.clone(),
        }
    }

    async fn run(self: Arc<Self>, ctx: watch::Receiver<bool>) {
        tracing::trace!(db = %self.db_name, "cluster/commithook: background thread: running");
        let ticker = tokio::spawn(Arc::clone(&self).tick(ctx.clone()));
        self.replicate_loop(ctx).await;
        let _ = ticker.await;
        tracing::trace!(db = %self.db_name, "cluster/commithook: background thread: completed");
    }

    /// Wakes the worker once a second so retry backoff and heartbeats fire
    /// even when no commit arrives.
    async fn tick(self: Arc<Self>, mut ctx: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_millis(REPLICATION_TICK_MS));
        while !self.shutdown.load(Ordering::Acquire) {
            tokio::select! {
                _ = interval.tick() => self.work.notify_one(),
                _ = ctx.changed() => return,
            }
        }
    }

    async fn replicate_loop(&self, mut ctx: watch::Receiver<bool>) {
        enum Step {
            Init,
            Replicate,
            Idle {
                heartbeat: Option<(Head, Arc<dyn ChunkStore>)>,
            },
        }

        let mut should_heartbeat = false;
        while !self.shutdown.load(Ordering::Acquire) {
            let cancelled = { *ctx.borrow() };
            if cancelled {
                tracing::trace!(
                    db = %self.db_name,
                    "cluster/commithook: replicate thread exiting; context cancelled"
                );
                if self.state.lock().should_replicate() {
                    // One last best-effort true-up of the standby, not bound
                    // to the cancelled context.
                    self.attempt_replicate(None).await;
                }
                return;
            }

            let step = {
                let mut st = self.state.lock();
                if st.primary_needs_init() {
                    Step::Init
                } else if st.should_replicate() {
                    Step::Replicate
                } else {
                    if let Some(probe) = st.wait_notify.as_ref() {
                        probe();
                    }
                    let caught_up = st.is_caught_up();
                    if caught_up && !st.success_txs.is_empty() {
                        // Dropping the senders closes every wait channel.
                        st.success_txs.clear();
                        st.fast_fail_replication_wait = false;
                    }
                    let heartbeat = if should_heartbeat {
                        st.heartbeat_target()
                    } else {
                        if caught_up {
                            should_heartbeat = true;
                        }
                        None
                    };
                    Step::Idle { heartbeat }
                }
            };

            match step {
                Step::Init => {
                    // The worker comes up trying to replicate the current head.
                    tracing::trace!(db = %self.db_name, "cluster/commithook: fetching current head");
                    match self.src_store.root().await {
                        Ok(root) if !root.is_empty() => {
                            let mut st = self.state.lock();
                            if st.primary_needs_init() {
                                st.next_head = root;
                                // We do not know when this head was written;
                                // we are starting to replicate it now.
                                st.next_head_incoming_time = Some(SystemTime::now());
                            }
                        }
                        Ok(_) => {
                            // Nothing committed locally yet; look again next
                            // tick.
                            self.wait_for_work(&mut ctx).await;
                        }
                        Err(err) => {
                            tracing::warn!(
                                db = %self.db_name,
                                "standby replication thread failed to load database root: {err}"
                            );
                            self.wait_for_work(&mut ctx).await;
                        }
                    }
                }
                Step::Replicate => {
                    self.attempt_replicate(Some(ctx.clone())).await;
                    should_heartbeat = false;
                }
                Step::Idle { heartbeat } => {
                    if let Some((head, dest)) = heartbeat {
                        self.attempt_heartbeat(head, dest, ctx.clone()).await;
                    }
                    tracing::trace!(db = %self.db_name, "cluster/commithook: background thread: waiting for signal");
                    self.wait_for_work(&mut ctx).await;
                }
            }
        }
    }

    async fn wait_for_work(&self, ctx: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = self.work.notified() => {}
            _ = ctx.changed() => {}
        }
    }

    /// Push `next_head` to the destination and advance its root.
    ///
    /// Steals the pending wait channels for the duration of the attempt;
    /// they are closed on success and put back on any other outcome so no
    /// registered waiter ever loses its wake-up.
    async fn attempt_replicate(&self, ctx: Option<watch::Receiver<bool>>) {
        let (to_push, incoming_time, known_dest, success_txs, mut cancel_rx) = {
            let mut st = self.state.lock();
            let (cancel_tx, cancel_rx) = oneshot::channel();
            st.cancel_replicate = Some(cancel_tx);
            (
                st.next_head,
                st.next_head_incoming_time,
                st.dest_db.clone(),
                std::mem::take(&mut st.success_txs),
                cancel_rx,
            )
        };

        let dest_db = match known_dest {
            Some(dest) => dest,
            None => {
                tracing::trace!(db = %self.db_name, "cluster/commithook: attempting to fetch destDB");
                let fetched =
                    race_cancellable((self.dest_db_factory)(), &mut cancel_rx, ctx.clone()).await;
                match fetched {
                    Ok(Ok(dest)) => {
                        tracing::trace!(db = %self.db_name, "cluster/commithook: fetched destDB");
                        self.state.lock().dest_db = Some(dest.clone());
                        dest
                    }
                    Ok(Err(err)) => {
                        return self.finish_failed_attempt(
                            to_push,
                            success_txs,
                            format!("could not replicate to standby: error fetching destDB: {err}"),
                        );
                    }
                    Err(cancelled) => {
                        return self.finish_failed_attempt(
                            to_push,
                            success_txs,
                            format!("could not replicate to standby: error fetching destDB: {cancelled}"),
                        );
                    }
                }
            }
        };

        tracing::trace!(
            db = %self.db_name,
            head = %to_push,
            "cluster/commithook: pushing chunks for root hash to destDB"
        );
        let push = async {
            dest_db
                .pull_chunks(&self.temp_dir, self.src_store.clone(), &[to_push])
                .await?;
            tracing::trace!(db = %self.db_name, "cluster/commithook: successfully pushed chunks, setting root");
            dest_db.rebase().await?;
            let cur_root = dest_db.root().await?;
            if dest_db.commit(to_push, cur_root).await? {
                Ok(())
            } else {
                Err(ReplicationError::DestDbRootHashMoved)
            }
        };
        let result = match race_cancellable(push, &mut cancel_rx, ctx).await {
            Ok(inner) => inner,
            Err(cancelled) => Err(cancelled),
        };

        let mut st = self.state.lock();
        st.cancel_replicate = None;
        if st.role != Role::Primary {
            // Role moved underneath us; the idle loop resolves the waiters.
            st.success_txs.extend(success_txs);
            return;
        }
        match result {
            Ok(()) => {
                tracing::trace!(db = %self.db_name, "cluster/commithook: successfully committed chunks on destDB");
                st.current_error = None;
                st.last_pushed_head = to_push;
                st.last_success = incoming_time;
                st.next_push_attempt = None;
                st.fast_fail_replication_wait = false;
                // Dropping the stolen senders closes every wait channel.
                drop(success_txs);
            }
            Err(err) => {
                let msg = format!("failed to commit chunks on destDB: {err}");
                tracing::warn!(db = %self.db_name, "cluster/commithook: {msg}");
                st.current_error = Some(msg);
                st.schedule_retry(to_push);
                st.success_txs.extend(success_txs);
            }
        }
    }

    /// Failure epilogue for attempts that died before the push: record the
    /// error, back off, and put the stolen wait channels back.
    fn finish_failed_attempt(
        &self,
        attempted: Head,
        success_txs: Vec<watch::Sender<()>>,
        msg: String,
    ) {
        tracing::warn!(db = %self.db_name, "cluster/commithook: {msg}");
        let mut st = self.state.lock();
        st.current_error = Some(msg);
        st.schedule_retry(attempted);
        st.cancel_replicate = None;
        st.success_txs.extend(success_txs);
    }

    /// Best-effort liveness signal to the standby while idle: a no-op
    /// `commit(head, head)` bounded to five seconds. Errors are swallowed;
    /// heartbeats are informational.
    async fn attempt_heartbeat(
        &self,
        head: Head,
        dest_db: Arc<dyn ChunkStore>,
        ctx: watch::Receiver<bool>,
    ) {
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        {
            let mut st = self.state.lock();
            if st.role != Role::Primary {
                return;
            }
            st.cancel_replicate = Some(cancel_tx);
        }
        let bounded = tokio::time::timeout(
            Duration::from_secs(HEARTBEAT_TIMEOUT_SECS),
            dest_db.commit(head, head),
        );
        match race_cancellable(bounded, &mut cancel_rx, Some(ctx)).await {
            Ok(Ok(Ok(_))) => {}
            Ok(Ok(Err(err))) => {
                tracing::trace!(db = %self.db_name, "cluster/commithook: heartbeat failed: {err}")
            }
            Ok(Err(_elapsed)) => {
                tracing::trace!(db = %self.db_name, "cluster/commithook: heartbeat timed out")
            }
            Err(_) => {}
        }
        self.state.lock().cancel_replicate = None;
    }
}

/// Race `fut` against the attempt's cancel handle and the worker context.
async fn race_cancellable<T>(
    fut: impl Future<Output = T>,
    cancel_rx: &mut oneshot::Receiver<()>,
    ctx: Option<watch::Receiver<bool>>,
) -> Result<T, ReplicationError> {
    let ctx_done = async {
        match ctx {
            Some(mut rx) => {
                if !*rx.borrow() {
                    let _ = rx.changed().await;
                }
            }
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        v = fut => Ok(v),
        _ = cancel_rx => Err(ReplicationError::Cancelled),
        _ = ctx_done => Err(ReplicationError::Cancelled),
    }
}

#[async_trait]
impl CommitHook for StandbyReplicationHook {
    async fn execute(&self, dataset: &str, db: &Db) -> Result<Option<CommitWait>, DbError> {
        match StandbyReplicationHook::execute(self, dataset, db).await {
            Ok(wait) => Ok(wait.map(ReplicationWait::into_commit_wait)),
            Err(err) => Err(DbError::Other(err.to_string())),
        }
    }

    // The hook fires for working-set updates as well as branch commits.
    fn execute_for_working_sets(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagdb_core::MemoryChunkStore;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn test_hook(role: Role, tmp: &TempDir) -> (Arc<StandbyReplicationHook>, Arc<Db>) {
        let src = Arc::new(MemoryChunkStore::new());
        let src_dyn: Arc<dyn ChunkStore> = src;
        let db = Db::init("appdb", tmp.path().join("appdb"), src_dyn.clone(), "main").unwrap();
        let dest = Arc::new(MemoryChunkStore::new());
        let factory: DestDbFactory = Arc::new(move || {
            let dest: Arc<dyn ChunkStore> = dest.clone();
            Box::pin(async move { Ok(dest) })
        });
        let hook = StandbyReplicationHook::new(
            &Remote::new("standby", "mem://standby/appdb"),
            "appdb",
            role,
            factory,
            src_dyn,
            tmp.path().join("tmp"),
        );
        (hook, db)
    }

    #[tokio::test]
    async fn test_execute_on_non_primary_is_a_noop() {
        let tmp = TempDir::new().unwrap();
        let (hook, db) = test_hook(Role::Standby, &tmp);
        let wait = hook.execute("refs/heads/main", &db).await.unwrap();
        assert!(wait.is_none());
        assert!(hook.is_caught_up());
    }

    #[tokio::test]
    async fn test_execute_same_root_shares_one_wait_channel() {
        let tmp = TempDir::new().unwrap();
        let (hook, db) = test_hook(Role::Primary, &tmp);
        let head = Head::of(b"c1");
        db.chunk_store().commit(head, Head::EMPTY).await.unwrap();

        // No worker is running, so both waits stay pending on one channel.
        let w1 = hook.execute("refs/heads/main", &db).await.unwrap().unwrap();
        let w2 = hook.execute("refs/heads/main", &db).await.unwrap().unwrap();
        assert_eq!(hook.state.lock().success_txs.len(), 1);

        // A role change makes the hook caught up; channels close on the next
        // idle iteration, which we stand in for by clearing directly.
        hook.set_role(Role::Standby);
        hook.state.lock().success_txs.clear();
        tokio::time::timeout(Duration::from_secs(1), w1.wait())
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), w2.wait())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_circuit_breaker_wait_fails_without_blocking() {
        let tmp = TempDir::new().unwrap();
        let (hook, db) = test_hook(Role::Primary, &tmp);
        let head = Head::of(b"c1");
        db.chunk_store().commit(head, Head::EMPTY).await.unwrap();

        hook.notify_wait_failed();
        let wait = hook.execute("refs/heads/main", &db).await.unwrap().unwrap();
        let err = wait.wait().await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("circuit breaker for replication to standby/appdb is open"));
    }

    #[tokio::test]
    async fn test_set_wait_notify_is_single_slot() {
        let tmp = TempDir::new().unwrap();
        let (hook, _db) = test_hook(Role::Primary, &tmp);
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        assert!(hook.set_wait_notify(Some(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }))));
        // Installed probes run once immediately.
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(!hook.set_wait_notify(Some(Box::new(|| {}))));
        assert!(hook.set_wait_notify(None));
        assert!(hook.set_wait_notify(Some(Box::new(|| {}))));
    }

    #[tokio::test]
    async fn test_set_role_resets_state() {
        let tmp = TempDir::new().unwrap();
        let (hook, db) = test_hook(Role::Primary, &tmp);
        let head = Head::of(b"c1");
        db.chunk_store().commit(head, Head::EMPTY).await.unwrap();
        let _ = hook.execute("refs/heads/main", &db).await.unwrap();
        assert!(!hook.is_caught_up());

        hook.set_role(Role::Standby);
        assert!(hook.is_caught_up());
        let status = hook.status();
        assert_eq!(status.role, Role::Standby);
        assert!(status.replication_lag.is_none());
        assert!(status.last_update.is_none());
        assert!(status.current_error.is_none());
    }

    #[tokio::test]
    async fn test_detected_broken_config_reports_canonical_error() {
        let tmp = TempDir::new().unwrap();
        let (hook, _db) = test_hook(Role::Primary, &tmp);
        hook.set_role(Role::DetectedBrokenConfig);
        let status = hook.status();
        assert_eq!(
            status.current_error.as_deref(),
            Some(DETECTED_BROKEN_CONFIG_ERROR)
        );
        // Broken config still counts as "caught up": there is nothing to wait
        // on when writes are frozen.
        assert!(hook.is_caught_up());
    }

    #[tokio::test]
    async fn test_record_remote_srv_commit_only_applies_to_standby() {
        let tmp = TempDir::new().unwrap();
        let (hook, _db) = test_hook(Role::Primary, &tmp);
        hook.record_successful_remote_srv_commit();
        assert!(hook.status().last_update.is_none());

        hook.set_role(Role::Standby);
        hook.record_successful_remote_srv_commit();
        assert!(hook.status().last_update.is_some());
    }
}
