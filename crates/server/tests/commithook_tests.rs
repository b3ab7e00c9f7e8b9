//! End-to-end tests of the standby replication hook against controllable
//! chunk-store doubles: a running worker, real timers, injected failures.

use async_trait::async_trait;
use dagdb_core::{Chunk, ChunkStore, Db, Head, MemoryChunkStore, StoreError};
use dagdb_server::background::BackgroundThreads;
use dagdb_server::cluster::{DestDbFactory, Role, StandbyReplicationHook};
use dagdb_core::remotes::Remote;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex as AsyncMutex;

/// Destination-store double: delegates to an in-memory store, with a gate
/// that test code can hold to stall pulls, a one-shot "root moved" switch,
/// and counters for pulls and commits.
struct StandbyStore {
    inner: Arc<MemoryChunkStore>,
    gate: Arc<AsyncMutex<()>>,
    reject_next_commit: AtomicBool,
    pulls_started: AtomicUsize,
    commits: AtomicUsize,
}

impl StandbyStore {
    fn new() -> Arc<StandbyStore> {
        Arc::new(StandbyStore {
            inner: Arc::new(MemoryChunkStore::new()),
            gate: Arc::new(AsyncMutex::new(())),
            reject_next_commit: AtomicBool::new(false),
            pulls_started: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ChunkStore for StandbyStore {
    async fn root(&self) -> Result<Head, StoreError> {
        self.inner.root().await
    }

    async fn rebase(&self) -> Result<(), StoreError> {
        self.inner.rebase().await
    }

    async fn commit(&self, new: Head, expected: Head) -> Result<bool, StoreError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        if self.reject_next_commit.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        self.inner.commit(new, expected).await
    }

    async fn has_chunk(&self, hash: Head) -> Result<bool, StoreError> {
        self.inner.has_chunk(hash).await
    }

    async fn get_chunk(&self, hash: Head) -> Result<Option<Chunk>, StoreError> {
        self.inner.get_chunk(hash).await
    }

    async fn put_chunk(&self, chunk: Chunk) -> Result<(), StoreError> {
        self.inner.put_chunk(chunk).await
    }

    async fn pull_chunks(
        &self,
        temp_dir: &Path,
        src: Arc<dyn ChunkStore>,
        heads: &[Head],
    ) -> Result<(), StoreError> {
        self.pulls_started.fetch_add(1, Ordering::SeqCst);
        let _held = self.gate.lock().await;
        self.inner.pull_chunks(temp_dir, src, heads).await
    }
}

struct Fixture {
    _tmp: TempDir,
    db: Arc<Db>,
    src: Arc<dyn ChunkStore>,
    dest: Arc<StandbyStore>,
    hook: Arc<StandbyReplicationHook>,
    bt: Arc<BackgroundThreads>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Hook wired to a [`StandbyStore`], its worker running, with `factory_fails`
/// leading factory attempts erroring before the destination is handed out.
fn fixture(factory_fails: usize) -> Fixture {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let src: Arc<dyn ChunkStore> = Arc::new(MemoryChunkStore::new());
    let db = Db::init("appdb", tmp.path().join("appdb"), src.clone(), "main").unwrap();
    let dest = StandbyStore::new();

    let remaining = Arc::new(AtomicUsize::new(factory_fails));
    let factory_dest = dest.clone();
    let factory: DestDbFactory = Arc::new(move || {
        let dest = factory_dest.clone();
        let remaining = remaining.clone();
        Box::pin(async move {
            if remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::Unreachable("standby not up yet".to_string()));
            }
            let dest: Arc<dyn ChunkStore> = dest;
            Ok(dest)
        })
    });

    let hook = StandbyReplicationHook::new(
        &Remote::new("standby", "mem://standby/appdb"),
        "appdb",
        Role::Primary,
        factory,
        src.clone(),
        tmp.path().join("tmp"),
    );
    let bt = Arc::new(BackgroundThreads::new());
    hook.bind(&bt);

    Fixture {
        _tmp: tmp,
        db,
        src,
        dest,
        hook,
        bt,
    }
}

/// Append a chunk and advance the local root, as the engine does on commit.
async fn commit_local(f: &Fixture, data: &[u8]) -> Head {
    let chunk = Chunk::new(data.to_vec(), vec![]);
    f.src.put_chunk(chunk.clone()).await.unwrap();
    let old = f.src.root().await.unwrap();
    assert!(f.src.commit(chunk.hash(), old).await.unwrap());
    chunk.hash()
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_baseline_push() {
    let f = fixture(0);
    let h1 = commit_local(&f, b"c1").await;

    let wait = f
        .hook
        .execute("refs/heads/main", &f.db)
        .await
        .unwrap()
        .expect("not caught up yet, so a wait handle is returned");
    tokio::time::timeout(Duration::from_secs(5), wait.wait())
        .await
        .expect("replication finished")
        .unwrap();

    assert_eq!(f.dest.root().await.unwrap(), h1);
    assert!(f.hook.is_caught_up());
    let status = f.hook.status();
    assert!(status.current_error.is_none());
    assert_eq!(status.replication_lag, Some(Duration::ZERO));
    assert!(status.last_update.is_some());

    f.bt.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_transient_factory_failure_retries() {
    let f = fixture(1);
    let h1 = commit_local(&f, b"c1").await;
    let _ = f.hook.execute("refs/heads/main", &f.db).await.unwrap();

    let hook = f.hook.clone();
    wait_until("factory failure surfaced", || {
        hook.status()
            .current_error
            .as_deref()
            .is_some_and(|e| e.contains("error fetching destDB"))
    })
    .await;

    // The 1s backoff elapses, the second factory call succeeds, and the
    // head present at that point replicates.
    wait_until("retry caught up", || hook.is_caught_up()).await;
    assert_eq!(f.dest.root().await.unwrap(), h1);
    assert!(f.hook.status().current_error.is_none());

    f.bt.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_newer_head_during_push_is_pushed_next() {
    let f = fixture(0);

    // Stall the destination so the first push stays in flight.
    let gate = f.dest.gate.clone().lock_owned().await;
    let h1 = commit_local(&f, b"c1").await;
    let w1 = f
        .hook
        .execute("refs/heads/main", &f.db)
        .await
        .unwrap()
        .unwrap();

    let dest = f.dest.clone();
    wait_until("first pull in flight", || {
        dest.pulls_started.load(Ordering::SeqCst) >= 1
    })
    .await;

    // A newer head arrives while H1 is being pushed; its waiter registers on
    // a fresh channel.
    let h2 = commit_local(&f, b"c2").await;
    let w2 = f
        .hook
        .execute("refs/heads/main", &f.db)
        .await
        .unwrap()
        .unwrap();

    drop(gate);

    // Waiters registered before H2 resolve with H1's success; the worker
    // immediately re-enters and pushes H2.
    tokio::time::timeout(Duration::from_secs(5), w1.wait())
        .await
        .expect("w1 resolved on H1 success")
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), w2.wait())
        .await
        .expect("w2 resolved on H2 success")
        .unwrap();

    let hook = f.hook.clone();
    wait_until("H2 replicated", || hook.is_caught_up()).await;
    assert_eq!(f.dest.root().await.unwrap(), h2);
    assert_ne!(h1, h2);

    f.bt.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_destination_root_moved_backs_off_and_retries() {
    let f = fixture(0);
    f.dest.reject_next_commit.store(true, Ordering::SeqCst);
    let h1 = commit_local(&f, b"c1").await;
    let _ = f.hook.execute("refs/heads/main", &f.db).await.unwrap();

    let hook = f.hook.clone();
    wait_until("root-moved error surfaced", || {
        hook.status().current_error.as_deref().is_some_and(|e| {
            e.contains("destination database root hash moved during our write")
        })
    })
    .await;
    assert!(!f.hook.is_caught_up());
    assert!(f.dest.root().await.unwrap().is_empty());

    // Next tick retries; the switch only rejected once.
    wait_until("retry succeeded", || hook.is_caught_up()).await;
    assert_eq!(f.dest.root().await.unwrap(), h1);

    f.bt.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_circuit_breaker_clears_on_next_success() {
    let f = fixture(0);

    let gate = f.dest.gate.clone().lock_owned().await;
    let _h1 = commit_local(&f, b"c1").await;
    let w1 = f
        .hook
        .execute("refs/heads/main", &f.db)
        .await
        .unwrap()
        .unwrap();

    // The controller observed a blocked committer time out.
    f.hook.notify_wait_failed();

    let fast = f
        .hook
        .execute("refs/heads/main", &f.db)
        .await
        .unwrap()
        .unwrap();
    let err = fast.wait().await.unwrap_err();
    assert!(err.to_string().contains("circuit breaker for replication"));

    // The push completes; pending channels close and the breaker clears.
    drop(gate);
    tokio::time::timeout(Duration::from_secs(5), w1.wait())
        .await
        .expect("pre-breaker waiter resolved by the success")
        .unwrap();

    let h2 = commit_local(&f, b"c2").await;
    let w2 = f
        .hook
        .execute("refs/heads/main", &f.db)
        .await
        .unwrap()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), w2.wait())
        .await
        .expect("breaker cleared, wait behaves normally")
        .unwrap();

    let hook = f.hook.clone();
    wait_until("H2 replicated", || hook.is_caught_up()).await;
    assert_eq!(f.dest.root().await.unwrap(), h2);

    f.bt.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_role_flip_cancels_inflight_push_and_resets() {
    let f = fixture(0);

    let gate = f.dest.gate.clone().lock_owned().await;
    let _h1 = commit_local(&f, b"c1").await;
    let w1 = f
        .hook
        .execute("refs/heads/main", &f.db)
        .await
        .unwrap()
        .unwrap();

    let dest = f.dest.clone();
    wait_until("push in flight", || {
        dest.pulls_started.load(Ordering::SeqCst) >= 1
    })
    .await;

    f.hook.set_role(Role::Standby);
    assert!(f.hook.is_caught_up());
    let status = f.hook.status();
    assert_eq!(status.role, Role::Standby);
    assert!(status.replication_lag.is_none());
    assert!(status.last_update.is_none());
    assert!(status.current_error.is_none());

    // Registered waiters are resolved by the idle loop after the reset.
    tokio::time::timeout(Duration::from_secs(5), w1.wait())
        .await
        .expect("waiter released on role change")
        .unwrap();

    drop(gate);
    f.bt.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_heartbeat_after_caught_up_leaves_root_unchanged() {
    let f = fixture(0);
    let h1 = commit_local(&f, b"c1").await;
    let _ = f.hook.execute("refs/heads/main", &f.db).await.unwrap();

    let hook = f.hook.clone();
    wait_until("caught up", || hook.is_caught_up()).await;
    let after_push = f.dest.commits.load(Ordering::SeqCst);

    // Idle ticks produce no-op commit(head, head) liveness probes.
    let dest = f.dest.clone();
    wait_until("heartbeat issued", || {
        dest.commits.load(Ordering::SeqCst) > after_push
    })
    .await;
    assert_eq!(f.dest.root().await.unwrap(), h1);
    assert!(f.hook.status().current_error.is_none());

    f.bt.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_database_was_dropped_stops_worker() {
    let f = fixture(0);
    let h1 = commit_local(&f, b"c1").await;
    let _ = f.hook.execute("refs/heads/main", &f.db).await.unwrap();

    let hook = f.hook.clone();
    wait_until("caught up", || hook.is_caught_up()).await;
    assert_eq!(f.dest.root().await.unwrap(), h1);

    f.hook.database_was_dropped();
    // The worker and ticker drain; shutdown would hang otherwise.
    tokio::time::timeout(Duration::from_secs(5), f.bt.shutdown())
        .await
        .expect("worker exited after drop");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_primary_adopts_existing_root_on_startup() {
    // A head committed before the worker starts is replicated without any
    // execute() call: the fresh primary initializes from the local root.
    let tmp = TempDir::new().unwrap();
    let src: Arc<dyn ChunkStore> = Arc::new(MemoryChunkStore::new());
    let chunk = Chunk::new(b"preexisting".to_vec(), vec![]);
    src.put_chunk(chunk.clone()).await.unwrap();
    src.commit(chunk.hash(), Head::EMPTY).await.unwrap();

    let dest = StandbyStore::new();
    let factory_dest = dest.clone();
    let factory: DestDbFactory = Arc::new(move || {
        let dest: Arc<dyn ChunkStore> = factory_dest.clone();
        Box::pin(async move { Ok(dest) })
    });
    let hook = StandbyReplicationHook::new(
        &Remote::new("standby", "mem://standby/appdb"),
        "appdb",
        Role::Primary,
        factory,
        src.clone(),
        tmp.path().join("tmp"),
    );
    let bt = Arc::new(BackgroundThreads::new());
    hook.bind(&bt);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while dest.root().await.unwrap() != chunk.hash() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for startup true-up");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(hook.is_caught_up());

    bt.shutdown().await;
}
