//! De-duplicating work queue and the worker pool draining it.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use defrev_core::{ComponentDefinition, LabelSelector, Object, ObjectKey, ResourceClient};
use futures::FutureExt;
use metrics::gauge;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::reconciler::Reconciler;

const RETRY_BASE: Duration = Duration::from_millis(5);
const RETRY_MAX: Duration = Duration::from_secs(1000);

#[derive(Default)]
struct QueueState {
    order: VecDeque<ObjectKey>,
    queued: FxHashSet<ObjectKey>,
    processing: FxHashSet<ObjectKey>,
    dirty: FxHashSet<ObjectKey>,
    failures: FxHashMap<ObjectKey, u32>,
    shut_down: bool,
}

impl QueueState {
    fn push(&mut self, key: ObjectKey) -> bool {
        if self.queued.insert(key.clone()) {
            self.order.push_back(key);
            true
        } else {
            false
        }
    }
}

/// A key waits at most once; a key being processed is never handed out again
/// until `done`, and re-adds during processing are replayed afterwards.
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    ready: Notify,
}

impl WorkQueue {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, key: ObjectKey) {
        let mut st = self.lock();
        if st.shut_down {
            return;
        }
        if st.processing.contains(&key) {
            st.dirty.insert(key);
            return;
        }
        if st.push(key) {
            gauge!("queue_depth", st.order.len() as f64);
            drop(st);
            self.ready.notify_one();
        }
    }

    /// Add `key` once `delay` has passed.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Per-key exponential delay: 5ms doubling per consecutive failure, capped at 1000s.
    pub fn retry_delay(&self, key: &ObjectKey) -> Duration {
        let failures = self.lock().failures.get(key).copied().unwrap_or(0);
        let exp = failures.saturating_sub(1).min(32);
        RETRY_BASE.saturating_mul(2u32.saturating_pow(exp)).min(RETRY_MAX)
    }

    /// Count a failure for `key` and schedule it again after its backoff.
    pub fn add_rate_limited(self: &Arc<Self>, key: ObjectKey) {
        {
            let mut st = self.lock();
            let n = st.failures.entry(key.clone()).or_insert(0);
            *n = n.saturating_add(1);
        }
        let delay = self.retry_delay(&key);
        debug!(definition = %key, delay_ms = delay.as_millis() as u64, "requeue after failure");
        self.add_after(key, delay);
    }

    /// Reset the failure count of `key`.
    pub fn forget(&self, key: &ObjectKey) {
        self.lock().failures.remove(key);
    }

    /// Next key to process, waiting for one. `None` once shut down.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if st.shut_down {
                    return None;
                }
                if let Some(key) = st.order.pop_front() {
                    st.queued.remove(&key);
                    st.processing.insert(key.clone());
                    gauge!("queue_depth", st.order.len() as f64);
                    let more = !st.order.is_empty();
                    drop(st);
                    if more {
                        self.ready.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark processing of `key` finished; replays an add that arrived meanwhile.
    pub fn done(&self, key: &ObjectKey) {
        let mut st = self.lock();
        st.processing.remove(key);
        if st.dirty.remove(key) && !st.shut_down && st.push(key.clone()) {
            drop(st);
            self.ready.notify_one();
        }
    }

    /// Stop handing out keys; waiting work is dropped.
    pub fn shutdown(&self) {
        let mut st = self.lock();
        st.shut_down = true;
        st.order.clear();
        st.queued.clear();
        st.dirty.clear();
        drop(st);
        self.ready.notify_waiters();
    }

    pub fn len(&self) -> usize { self.lock().order.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn is_processing(&self, key: &ObjectKey) -> bool { self.lock().processing.contains(key) }
}

async fn worker(id: usize, reconciler: Arc<Reconciler>, queue: Arc<WorkQueue>) {
    while let Some(key) = queue.get().await {
        // A panicking pass must still release the key, or it is never processed again.
        match AssertUnwindSafe(reconciler.reconcile(&key)).catch_unwind().await {
            Ok(Ok(action)) => {
                queue.forget(&key);
                if let Some(after) = action.requeue_after {
                    queue.add_after(key.clone(), after);
                }
            }
            Ok(Err(e)) => {
                warn!(worker = id, definition = %key, error = %e, "reconcile failed; will retry");
                queue.add_rate_limited(key.clone());
            }
            Err(_) => {
                error!(worker = id, definition = %key, "reconcile panicked; will retry");
                queue.add_rate_limited(key.clone());
            }
        }
        queue.done(&key);
    }
    debug!(worker = id, "worker stopped");
}

async fn enqueue_all(client: &dyn ResourceClient, namespace: Option<&str>, queue: &WorkQueue) {
    match client.list_obj::<ComponentDefinition>(namespace, &LabelSelector::new()).await {
        Ok(defs) => {
            debug!(count = defs.len(), "resync");
            for def in defs {
                queue.add(def.key());
            }
        }
        Err(e) => warn!(error = %e, "resync list failed"),
    }
}

/// Drive `reconciler` from `keys` plus a periodic full resync until `token` is
/// cancelled. In-flight passes finish; waiting keys are dropped.
pub async fn run_controller(
    reconciler: Arc<Reconciler>,
    client: Arc<dyn ResourceClient>,
    config: ControllerConfig,
    mut keys: mpsc::Receiver<ObjectKey>,
    token: CancellationToken,
) -> Result<()> {
    let queue = Arc::new(WorkQueue::new());
    let workers: Vec<_> = (0..config.concurrent_reconciles.max(1))
        .map(|id| tokio::spawn(worker(id, reconciler.clone(), queue.clone())))
        .collect();
    info!(workers = workers.len(), resync_secs = config.resync.as_secs(), ns = ?config.namespace, "controller started");

    let mut resync = tokio::time::interval(config.resync.max(Duration::from_secs(1)));
    let mut keys_open = true;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = resync.tick() => enqueue_all(client.as_ref(), config.namespace.as_deref(), &queue).await,
            key = keys.recv(), if keys_open => match key {
                Some(key) => queue.add(key),
                None => {
                    debug!("key source closed");
                    keys_open = false;
                }
            },
        }
    }

    info!("controller shutting down");
    queue.shutdown();
    for handle in futures::future::join_all(workers).await {
        if let Err(e) = handle {
            warn!(error = %e, "worker task ended abnormally");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ObjectKey { ObjectKey::namespaced("vela-system", name) }

    #[tokio::test]
    async fn waiting_keys_are_deduplicated() {
        let q = WorkQueue::new();
        q.add(key("a"));
        q.add(key("b"));
        q.add(key("a"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some(key("a")));
        assert_eq!(q.get().await, Some(key("b")));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn add_while_processing_is_replayed_after_done() {
        let q = WorkQueue::new();
        q.add(key("a"));
        let got = q.get().await.unwrap();
        q.add(key("a"));
        q.add(key("a"));
        assert!(q.is_empty(), "in-flight key must not be handed out twice");
        q.done(&got);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some(key("a")));
    }

    #[tokio::test]
    async fn failure_delay_doubles_and_resets() {
        let q = Arc::new(WorkQueue::new());
        let k = key("a");
        assert_eq!(q.retry_delay(&k), Duration::from_millis(5));
        q.add_rate_limited(k.clone());
        assert_eq!(q.retry_delay(&k), Duration::from_millis(5));
        q.add_rate_limited(k.clone());
        q.add_rate_limited(k.clone());
        assert_eq!(q.retry_delay(&k), Duration::from_millis(20));
        q.forget(&k);
        assert_eq!(q.retry_delay(&k), Duration::from_millis(5));
    }

    #[test]
    fn failure_delay_is_capped() {
        let q = WorkQueue::new();
        let k = key("a");
        q.lock().failures.insert(k.clone(), 40);
        assert_eq!(q.retry_delay(&k), RETRY_MAX);
    }

    #[tokio::test]
    async fn shutdown_wakes_waiters() {
        let q = Arc::new(WorkQueue::new());
        let waiter = tokio::spawn({
            let q = q.clone();
            async move { q.get().await }
        });
        tokio::task::yield_now().await;
        q.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
        q.add(key("late"));
        assert!(q.is_empty());
    }
}
