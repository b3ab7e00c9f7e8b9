//! Cluster controller: hook ownership, role fan-out, catch-up waiting.

use crate::background::BackgroundThreads;
use crate::cluster::commithook::{HookStatus, StandbyReplicationHook};
use crate::cluster::role::Role;
use crate::provider::{DatabaseProvider, InitDatabaseHook, ProviderError};
use crate::sysvars::SystemVariables;
use dagdb_core::config::DOLT_DIR;
use dagdb_core::db::{CommitHook, Db};
use dagdb_core::remotes::{expand_url_template, Remote, RemoteFactoryRegistry};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct ControllerState {
    role: Role,
    epoch: u64,
    hooks: Vec<Arc<StandbyReplicationHook>>,
}

/// Owns the commit hooks, one per (database, remote) pair, and arbitrates
/// operator-driven role changes across all of them.
///
/// The epoch is an externally managed generation counter; the controller
/// records it for status reporting and split-primary diagnosis but does not
/// originate bumps.
pub struct ClusterController {
    state: Mutex<ControllerState>,
}

impl ClusterController {
    pub fn new(role: Role, epoch: u64) -> Arc<ClusterController> {
        Arc::new(ClusterController {
            state: Mutex::new(ControllerState {
                role,
                epoch,
                hooks: Vec::new(),
            }),
        })
    }

    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Adopt a hook; it immediately takes the controller's current role.
    pub fn register_hook(&self, hook: Arc<StandbyReplicationHook>) {
        let mut st = self.state.lock();
        hook.set_role(st.role);
        st.hooks.push(hook);
    }

    fn hooks(&self) -> Vec<Arc<StandbyReplicationHook>> {
        self.state.lock().hooks.clone()
    }

    /// Assign a role at an epoch, fanning out to every hook. Each hook
    /// resets its replication state and cancels in-flight work.
    pub fn set_role(&self, role: Role, epoch: u64) {
        let hooks = {
            let mut st = self.state.lock();
            st.role = role;
            st.epoch = epoch;
            st.hooks.clone()
        };
        tracing::info!(role = %role, epoch, "cluster: assuming role");
        for hook in hooks {
            hook.set_role(role);
        }
    }

    /// Open the circuit breaker on every hook after a blocked committer
    /// timed out.
    pub fn notify_wait_failed(&self) {
        for hook in self.hooks() {
            hook.notify_wait_failed();
        }
    }

    /// Standby-side acknowledgment of a commit received over the wire.
    pub fn record_successful_remote_srv_commit(&self) {
        for hook in self.hooks() {
            hook.record_successful_remote_srv_commit();
        }
    }

    /// Tear down the hooks attached to a dropped database.
    pub fn database_was_dropped(&self, db_name: &str) {
        let mut st = self.state.lock();
        st.hooks.retain(|hook| {
            if hook.db_name().eq_ignore_ascii_case(db_name) {
                hook.database_was_dropped();
                false
            } else {
                true
            }
        });
    }

    /// Block until every hook reports caught-up or the deadline fires.
    /// Returns whether all hooks caught up.
    ///
    /// Installs an idle probe on each hook; the probe pings this waiter on
    /// every idle loop iteration and the waiter re-samples. Fails fast with
    /// `false` if another observer already holds a probe slot.
    pub async fn wait_for_replicate(&self, deadline: Duration) -> bool {
        let hooks = self.hooks();
        if hooks.is_empty() {
            return true;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let mut installed: Vec<Arc<StandbyReplicationHook>> = Vec::new();
        for hook in &hooks {
            let tx = tx.clone();
            let probe = Box::new(move || {
                let _ = tx.send(());
            });
            if !hook.set_wait_notify(Some(probe)) {
                for h in &installed {
                    h.set_wait_notify(None);
                }
                return false;
            }
            installed.push(hook.clone());
        }
        drop(tx);

        let caught_up = tokio::time::timeout(deadline, async {
            loop {
                if hooks.iter().all(|h| h.is_caught_up()) {
                    return;
                }
                if rx.recv().await.is_none() {
                    return;
                }
            }
        })
        .await
        .is_ok()
            && hooks.iter().all(|h| h.is_caught_up());

        for hook in &installed {
            hook.set_wait_notify(None);
        }
        caught_up
    }

    /// Per-hook status rows for the operator status table.
    pub fn status(&self) -> Vec<HookStatus> {
        self.hooks().iter().map(|h| h.status()).collect()
    }

    /// Install the replication lifecycle hooks on a provider: creating or
    /// cloning a database attaches a standby replication hook (when
    /// `replicate_to_remote` and the URL template are set) and performs the
    /// first push; dropping a database detaches its hooks.
    pub fn install_provider_hooks(
        self: &Arc<Self>,
        provider: &DatabaseProvider,
        sysvars: Arc<SystemVariables>,
        remotes: Arc<RemoteFactoryRegistry>,
        bt: Arc<BackgroundThreads>,
    ) {
        let controller = Arc::clone(self);
        let init: InitDatabaseHook = Arc::new(move |name, db| {
            let controller = controller.clone();
            let sysvars = sysvars.clone();
            let remotes = remotes.clone();
            let bt = bt.clone();
            Box::pin(async move {
                configure_replication_database_hook(controller, sysvars, remotes, bt, name, db)
                    .await
            })
        });
        provider.set_init_database_hook(Some(init));

        let controller = Arc::clone(self);
        provider.set_drop_database_hook(Some(Arc::new(move |name: &str| {
            controller.database_was_dropped(name);
        })));
    }
}

/// Set up replication for a newly created or cloned database: add the remote
/// from the URL template, attach a standby replication hook bound to the
/// background registry, and push the current head once.
async fn configure_replication_database_hook(
    controller: Arc<ClusterController>,
    sysvars: Arc<SystemVariables>,
    remotes: Arc<RemoteFactoryRegistry>,
    bt: Arc<BackgroundThreads>,
    name: String,
    db: Arc<Db>,
) -> Result<(), ProviderError> {
    let remote_name = sysvars.replicate_to_remote();
    if remote_name.is_empty() {
        return Ok(());
    }
    let template = sysvars.replication_remote_url_template();
    if template.is_empty() {
        return Ok(());
    }

    let remote = Remote::new(remote_name, expand_url_template(&template, &name));
    db.add_remote(&remote)?;

    let temp_dir = db.dir().join(DOLT_DIR).join("tmp");
    std::fs::create_dir_all(&temp_dir)?;

    let factory = StandbyReplicationHook::registry_factory(remotes, remote.url.clone());
    let hook = StandbyReplicationHook::new(
        &remote,
        name.as_str(),
        controller.role(),
        factory,
        db.chunk_store(),
        temp_dir,
    );
    controller.register_hook(hook.clone());
    hook.bind(&bt);

    let dyn_hook: Arc<dyn CommitHook> = hook;
    db.set_commit_hooks(vec![dyn_hook]);

    // First push of the branch that already exists on the new database.
    let branch_ref = format!("refs/heads/{}", db.default_branch());
    let _ = db.execute_commit_hooks(&branch_ref).await;
    Ok(())
}
