//! Named background tasks with shared cancellation.
//!
//! Long-lived server work (replication workers, tickers) binds here so
//! shutdown is one call: flip the cancellation watch, then join every task.

use parking_lot::Mutex;
use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Registry of named background tasks sharing one cancellation signal.
pub struct BackgroundThreads {
    cancel: watch::Sender<bool>,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl BackgroundThreads {
    pub fn new() -> BackgroundThreads {
        let (cancel, _) = watch::channel(false);
        BackgroundThreads {
            cancel,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `f` as a named task. The closure receives a cancellation
    /// receiver that observes `true` once [`shutdown`](Self::shutdown) runs.
    pub fn add<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        tracing::trace!(task = %name, "starting background task");
        let handle = tokio::spawn(f(self.cancel.subscribe()));
        self.handles.lock().push((name, handle));
    }

    /// Signal cancellation and wait for every registered task to exit.
    pub async fn shutdown(&self) {
        let _ = self.cancel.send(true);
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for (name, handle) in handles {
            if let Err(err) = handle.await {
                tracing::warn!(task = %name, "background task panicked: {err}");
            }
        }
    }
}

impl Default for BackgroundThreads {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_shutdown_cancels_and_joins() {
        let bt = BackgroundThreads::new();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        bt.add("waiter", move |mut ctx| async move {
            let _ = ctx.changed().await;
            flag.store(true, Ordering::SeqCst);
        });
        bt.shutdown().await;
        assert!(finished.load(Ordering::SeqCst));
    }
}
