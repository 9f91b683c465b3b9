//! Event dispatch with per-declaration serialization.
//!
//! Notifications are collapsed into a work queue keyed by [`ObjectKey`]. A key
//! is handed to at most one worker at a time; a key added while it is being
//! processed is parked and handed out again once the worker calls
//! [`WorkQueue::done`]. Distinct keys are processed in parallel.
//!
//! Failed passes that may succeed later are re-queued with exponential
//! backoff until the per-key retry budget runs out.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bqtable_events::{ObjectKey, ReconcileEvent};
use bqtable_reconcile::{
    BackoffPolicy, DeclarationStore, ReconcileError, Reconciler, ResourceBackend, RetryTracker,
    DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW,
};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Default)]
struct QueueState {
    /// Keys ready to be handed out, oldest first.
    order: VecDeque<ObjectKey>,
    /// Keys waiting for a worker, including parked ones.
    queued: HashSet<ObjectKey>,
    /// Keys a worker currently holds.
    active: HashSet<ObjectKey>,
    shutting_down: bool,
}

/// De-duplicating queue that never hands one key to two workers at once.
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a key. No-op if it is already waiting or the queue is shut down.
    pub async fn add(&self, key: ObjectKey) {
        let mut state = self.state.lock().await;
        if state.shutting_down || state.queued.contains(&key) {
            return;
        }
        state.queued.insert(key.clone());

        // An active key is re-queued by `done`.
        if state.active.contains(&key) {
            return;
        }
        state.order.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Queue a key once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key).await;
        });
    }

    /// Wait for the next key. `None` once the queue is shut down.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.order.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    if !state.order.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Release a key taken with [`get`](Self::get).
    pub async fn done(&self, key: &ObjectKey) {
        let mut state = self.state.lock().await;
        state.active.remove(key);
        if state.queued.contains(key) && !state.shutting_down {
            state.order.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys. Waiting keys are dropped; active ones finish.
    pub async fn shut_down(&self) {
        let mut state = self.state.lock().await;
        state.shutting_down = true;
        state.order.clear();
        state.queued.clear();
        drop(state);
        self.notify.notify_waiters();
    }

    /// Keys waiting for a worker.
    pub async fn len(&self) -> usize {
        self.state.lock().await.queued.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether a worker currently holds `key`.
    pub async fn is_active(&self, key: &ObjectKey) -> bool {
        self.state.lock().await.active.contains(key)
    }
}

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of concurrent workers.
    pub workers: usize,

    /// Deadline for one reconciliation pass.
    pub reconcile_timeout: Duration,

    /// Retries per key within `retry_window`.
    pub max_retries: u32,

    pub retry_window: Duration,

    pub backoff: BackoffPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            reconcile_timeout: Duration::from_secs(30),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_window: DEFAULT_RETRY_WINDOW,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Feeds notifications to a pool of reconciliation workers.
pub struct Dispatcher<S, B> {
    reconciler: Arc<Reconciler<S, B>>,
    queue: Arc<WorkQueue>,
    retries: Arc<Mutex<RetryTracker>>,
    config: DispatcherConfig,
}

impl<S, B> Dispatcher<S, B>
where
    S: DeclarationStore + 'static,
    B: ResourceBackend + 'static,
{
    pub fn new(reconciler: Reconciler<S, B>, config: DispatcherConfig) -> Self {
        let retries = RetryTracker::new(config.max_retries, config.retry_window);
        Self {
            reconciler: Arc::new(reconciler),
            queue: Arc::new(WorkQueue::new()),
            retries: Arc::new(Mutex::new(retries)),
            config,
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Consume notifications until shutdown is signaled or the channel closes,
    /// then wait for in-flight passes to finish.
    #[instrument(skip_all, fields(workers = self.config.workers))]
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<ReconcileEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!(
            reconcile_timeout_secs = self.config.reconcile_timeout.as_secs(),
            max_retries = self.config.max_retries,
            "Starting dispatcher"
        );

        let mut workers = JoinSet::new();
        for id in 0..self.config.workers.max(1) {
            let worker = Worker {
                id,
                reconciler: Arc::clone(&self.reconciler),
                queue: Arc::clone(&self.queue),
                retries: Arc::clone(&self.retries),
                config: self.config.clone(),
            };
            workers.spawn(worker.run());
        }

        let mut prune = tokio::time::interval(self.config.retry_window);
        prune.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        debug!(kind = %event.kind, key = %event.key, "Queueing declaration");
                        self.queue.add(event.key).await;
                    }
                    None => {
                        info!("Event channel closed");
                        break;
                    }
                },
                _ = prune.tick() => {
                    self.retries.lock().await.prune();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Dispatcher shutting down");
                        break;
                    }
                }
            }
        }

        self.queue.shut_down().await;
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task failed");
            }
        }
        info!("Dispatcher stopped");
        Ok(())
    }
}

struct Worker<S, B> {
    id: usize,
    reconciler: Arc<Reconciler<S, B>>,
    queue: Arc<WorkQueue>,
    retries: Arc<Mutex<RetryTracker>>,
    config: DispatcherConfig,
}

impl<S, B> Worker<S, B>
where
    S: DeclarationStore + 'static,
    B: ResourceBackend + 'static,
{
    async fn run(self) {
        debug!(worker = self.id, "Worker started");
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
            self.queue.done(&key).await;
        }
        debug!(worker = self.id, "Worker stopped");
    }

    async fn process(&self, key: &ObjectKey) {
        let timeout = self.config.reconcile_timeout;
        let result = match tokio::time::timeout(timeout, self.reconciler.reconcile(key)).await {
            Ok(result) => result,
            Err(_) => Err(ReconcileError::Timeout {
                key: key.clone(),
                elapsed: timeout,
            }),
        };

        let retry_key = key.to_string();
        match result {
            Ok(outcome) => {
                self.retries.lock().await.clear(&retry_key);
                if outcome.is_mutation() {
                    info!(key = %key, outcome = %outcome, "Reconciled");
                } else {
                    debug!(key = %key, outcome = %outcome, "Reconciled");
                }
            }
            Err(e) if e.is_retryable() => {
                let (exhausted, failures) = {
                    let mut retries = self.retries.lock().await;
                    let exhausted = retries.record_failure(&retry_key);
                    (exhausted, retries.failures(&retry_key))
                };

                if exhausted {
                    error!(
                        key = %key,
                        error = %e,
                        kind = e.kind(),
                        failures,
                        "Retries exhausted, waiting for the next change or resync"
                    );
                    return;
                }

                let delay = self.config.backoff.delay(failures.saturating_sub(1));
                warn!(
                    key = %key,
                    error = %e,
                    kind = e.kind(),
                    failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "Reconciliation failed, will retry"
                );
                self.queue.add_after(key.clone(), delay);
            }
            Err(e) => {
                self.retries.lock().await.clear(&retry_key);
                error!(
                    key = %key,
                    error = %e,
                    kind = e.kind(),
                    "Reconciliation failed permanently, waiting for the next change"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("default", name)
    }

    #[tokio::test]
    async fn test_queue_deduplicates_waiting_keys() {
        let queue = WorkQueue::new();
        queue.add(key("a")).await;
        queue.add(key("a")).await;
        queue.add(key("b")).await;
        assert_eq!(queue.len().await, 2);

        assert_eq!(queue.get().await, Some(key("a")));
        assert_eq!(queue.get().await, Some(key("b")));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_active_key_is_parked_until_done() {
        let queue = WorkQueue::new();
        queue.add(key("a")).await;
        let taken = queue.get().await.unwrap();
        assert!(queue.is_active(&taken).await);

        // Re-added while held: parked, not handed out.
        queue.add(key("a")).await;
        queue.add(key("b")).await;
        assert_eq!(queue.get().await, Some(key("b")));

        queue.done(&taken).await;
        assert!(!queue.is_active(&taken).await);
        assert_eq!(queue.get().await, Some(key("a")));
    }

    #[tokio::test]
    async fn test_done_without_readd_does_not_requeue() {
        let queue = WorkQueue::new();
        queue.add(key("a")).await;
        let taken = queue.get().await.unwrap();
        queue.done(&taken).await;
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters_and_drops_pending() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;

        queue.shut_down().await;
        assert_eq!(waiter.await.unwrap(), None);

        queue.add(key("late")).await;
        assert!(queue.is_empty().await);
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_delays_key() {
        let queue = Arc::new(WorkQueue::new());
        queue.add_after(key("a"), Duration::from_secs(5));
        tokio::task::yield_now().await;
        assert!(queue.is_empty().await);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(queue.get().await, Some(key("a")));
    }
}
