//! Watch-driven reconcile loop.
//!
//! Each controller feeds watch notifications for one resource kind into a
//! [`WorkQueue`] and runs a pool of workers over it. The queue guarantees at
//! most one in-flight reconcile per key; keys that change while in flight are
//! reconciled again once the current pass finishes. Nothing serializes work
//! across different keys.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::error::LicensingResult;
use crate::infrastructure::{ResourceStore, Selector, Stores};
use crate::retry::{BackoffConfig, RetryPolicy};
use crate::token::TrustAnchors;
use crate::types::{ObjectKey, Resource};

/// Everything a reconciler needs, shared by reference.
#[derive(Clone)]
pub struct ReconcileContext {
    pub stores: Stores,
    pub trust: Arc<TrustAnchors>,
    pub clock: Arc<dyn Clock>,
    /// Applied to every version-checked write
    pub retry: RetryPolicy,
}

/// A control loop for one resource kind, driven by object key.
pub trait Reconciler: Send + Sync + 'static {
    type Object: Resource;

    /// Used in logs.
    const NAME: &'static str;

    fn reconcile(&self, key: &ObjectKey) -> LicensingResult<()>;
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    active: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    shutdown: bool,
}

/// Deduplicating key queue with per-key in-flight exclusion.
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, key: ObjectKey) {
        let mut state = self.lock();
        if state.shutdown {
            return;
        }
        if state.active.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.queue.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Waits for the next key. Returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.shutdown {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Marks `key` finished, re-queueing it if it changed meanwhile.
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.lock();
        state.active.remove(key);
        if state.dirty.remove(key) && state.queued.insert(key.clone()) {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    /// Keys waiting to be picked up.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub workers: usize,
    /// Re-enqueue every object on this period
    pub resync_interval: Option<Duration>,
    /// Delay before a failed key is retried
    pub requeue_backoff: BackoffConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            resync_interval: None,
            requeue_backoff: BackoffConfig::Exponential {
                initial_delay_ms: 100,
                max_delay_ms: 30_000,
                multiplier: 2.0,
            },
        }
    }
}

pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    store: Arc<dyn ResourceStore<R::Object>>,
    queue: Arc<WorkQueue>,
    config: ControllerConfig,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(
        reconciler: R,
        store: Arc<dyn ResourceStore<R::Object>>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            store,
            queue: Arc::new(WorkQueue::new()),
            config,
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        self.queue.clone()
    }

    /// Starts the watch feeder, the optional resync ticker and the workers.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        handles.push(tokio::spawn(feed_watch(
            R::NAME,
            self.store.clone(),
            self.queue.clone(),
            shutdown.clone(),
        )));

        if let Some(period) = self.config.resync_interval {
            handles.push(tokio::spawn(resync_every(
                R::NAME,
                period,
                self.store.clone(),
                self.queue.clone(),
                shutdown.clone(),
            )));
        }

        let failures = Arc::new(Mutex::new(HashMap::new()));
        for worker in 0..self.config.workers.max(1) {
            handles.push(tokio::spawn(run_worker(
                worker,
                self.reconciler.clone(),
                self.queue.clone(),
                failures.clone(),
                self.config.requeue_backoff.clone(),
            )));
        }

        tracing::info!(controller = R::NAME, workers = self.config.workers.max(1), "controller started");
        handles
    }
}

async fn list_keys<O: Resource>(store: Arc<dyn ResourceStore<O>>) -> Vec<ObjectKey> {
    let listed = tokio::task::spawn_blocking(move || store.list(&Selector::all())).await;
    match listed {
        Ok(Ok(objects)) => objects.iter().map(Resource::key).collect(),
        Ok(Err(err)) => {
            tracing::error!(kind = %O::KIND, error = %err, "list failed during resync");
            Vec::new()
        }
        Err(err) => {
            tracing::error!(kind = %O::KIND, error = %err, "list task failed");
            Vec::new()
        }
    }
}

async fn feed_watch<O: Resource>(
    name: &'static str,
    store: Arc<dyn ResourceStore<O>>,
    queue: Arc<WorkQueue>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Subscribe before listing so nothing falls between the two.
    let mut events = store.watch();
    for key in list_keys(store.clone()).await {
        queue.add(key);
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => queue.add(event.object().key()),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(controller = name, missed, "watch lagged; resyncing");
                    for key in list_keys(store.clone()).await {
                        queue.add(key);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    queue.shutdown();
    tracing::info!(controller = name, "controller stopped");
}

async fn resync_every<O: Resource>(
    name: &'static str,
    period: Duration,
    store: Arc<dyn ResourceStore<O>>,
    queue: Arc<WorkQueue>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    // The first tick fires immediately; the watch feeder already listed.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let keys = list_keys(store.clone()).await;
                tracing::debug!(controller = name, objects = keys.len(), "periodic resync");
                for key in keys {
                    queue.add(key);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Enqueues keys derived from changes to a different kind.
pub fn spawn_related<S, F>(
    name: &'static str,
    source: Arc<dyn ResourceStore<S>>,
    queue: Arc<WorkQueue>,
    mapper: F,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    S: Resource,
    F: Fn(&S) -> Vec<ObjectKey> + Send + Sync + 'static,
{
    let mapper = Arc::new(mapper);
    tokio::spawn(async move {
        let mut events = source.watch();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        let mapper = mapper.clone();
                        let object = event.object().clone();
                        match tokio::task::spawn_blocking(move || mapper(&object)).await {
                            Ok(keys) => keys.into_iter().for_each(|key| queue.add(key)),
                            Err(err) => tracing::error!(trigger = name, error = %err, "mapper task failed"),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(trigger = name, missed, "related watch lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    })
}

async fn run_worker<R: Reconciler>(
    worker: usize,
    reconciler: Arc<R>,
    queue: Arc<WorkQueue>,
    failures: Arc<Mutex<HashMap<ObjectKey, u32>>>,
    backoff: BackoffConfig,
) {
    while let Some(key) = queue.next().await {
        let task_reconciler = reconciler.clone();
        let task_key = key.clone();
        let outcome =
            tokio::task::spawn_blocking(move || task_reconciler.reconcile(&task_key)).await;

        match outcome {
            Ok(Ok(())) => {
                failures.lock().unwrap_or_else(|e| e.into_inner()).remove(&key);
            }
            Ok(Err(err)) if err.is_requeueable() => {
                let attempt = {
                    let mut failures = failures.lock().unwrap_or_else(|e| e.into_inner());
                    let attempt = failures.entry(key.clone()).or_insert(0);
                    *attempt += 1;
                    *attempt
                };
                let delay = backoff.delay_for_attempt(attempt);
                tracing::warn!(
                    controller = R::NAME,
                    worker,
                    key = %key,
                    attempt,
                    ?delay,
                    error = %err,
                    "reconcile failed; requeueing"
                );
                let queue = queue.clone();
                let retry_key = key.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.add(retry_key);
                });
            }
            Ok(Err(err)) => {
                tracing::error!(
                    controller = R::NAME,
                    worker,
                    key = %key,
                    error = %err,
                    "reconcile failed; needs external correction"
                );
            }
            Err(err) => {
                tracing::error!(controller = R::NAME, worker, key = %key, error = %err, "reconcile task panicked");
            }
        }
        queue.done(&key);
    }
}
