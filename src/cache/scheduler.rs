//! Detached background refreshes.
//!
//! Requests hand refresh work to the scheduler and return immediately. Nothing
//! on the request path ever awaits a spawned refresh; the scheduler only keeps
//! enough bookkeeping to let shutdown (and tests) wait for pending work.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use dashmap::DashSet;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Clone)]
pub struct RefreshScheduler {
    single_flight: bool,
    inflight: Arc<DashSet<String>>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl RefreshScheduler {
    pub fn new(single_flight: bool) -> Self {
        Self {
            single_flight,
            inflight: Arc::new(DashSet::new()),
            pending: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Spawn `work` as a detached task.
    ///
    /// With single-flight enabled, returns `false` without spawning when work for
    /// the same key is still running.
    pub fn spawn<F>(&self, key: String, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.single_flight && !self.inflight.insert(key.clone()) {
            debug!(key = %key, "refresh already in flight, skipping");
            metrics::counter!("dyncache_refresh_collapsed_total").increment(1);
            return false;
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        let guard = PendingGuard {
            key: self.single_flight.then_some(key),
            scheduler: self.clone(),
        };

        tokio::spawn(async move {
            let _guard = guard;
            work.await;
        });

        true
    }

    /// Number of refreshes spawned but not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Wait until no refresh is pending. Returns `false` if `timeout` elapsed first.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.idle.notified();
                if self.pending() == 0 {
                    return;
                }
                notified.await;
            }
        };

        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

/// Releases the bookkeeping for one refresh, even if the task panics.
struct PendingGuard {
    key: Option<String>,
    scheduler: RefreshScheduler,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.scheduler.inflight.remove(&key);
        }
        if self.scheduler.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.scheduler.idle.notify_waiters();
        }
    }
}
