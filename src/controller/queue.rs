//! Keyed work queue feeding the reconcile workers
//!
//! A key is queued at most once. A key being processed is never handed to a
//! second worker; adding it meanwhile marks it dirty and it is queued again
//! once the current worker calls [`WorkQueue::done`]. A key whose input
//! changed while it is processed can be superseded, which cancels the
//! running invocation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::reconciler::{Outcome, error_policy};
use crate::controller::store::ObjectKey;

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    in_flight: HashMap<ObjectKey, CancellationToken>,
    failures: HashMap<ObjectKey, u32>,
    shutting_down: bool,
}

struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: BackoffConfig,
}

#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

impl WorkQueue {
    pub fn new(backoff: BackoffConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        // Keep serving keys after a worker panic
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, key: ObjectKey) {
        let mut state = self.state();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Add the key once `delay` has elapsed
    pub fn add_after(&self, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Add the key after a per-key exponential backoff
    pub fn add_rate_limited(&self, key: ObjectKey) -> Duration {
        let attempt = self.next_attempt(&key);
        let delay = self.inner.backoff.delay_for_attempt(attempt);
        self.add_after(key, delay);
        delay
    }

    /// Count a failure for `key`, returning how many preceded it
    pub fn next_attempt(&self, key: &ObjectKey) -> u32 {
        let mut state = self.state();
        let failures = state.failures.entry(key.clone()).or_insert(0);
        let attempt = *failures;
        *failures = failures.saturating_add(1);
        attempt
    }

    /// Reset the backoff of `key`
    pub fn forget(&self, key: &ObjectKey) {
        self.state().failures.remove(key);
    }

    /// Wait for the next key, `None` once the queue is shut down
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Token cancelled when the key is superseded while being processed
    pub fn start(&self, key: &ObjectKey, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        self.state().in_flight.insert(key.clone(), token.clone());
        token
    }

    /// Cancel the invocation processing `key`, if any
    pub fn supersede(&self, key: &ObjectKey) -> bool {
        match self.state().in_flight.get(key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Release a key handed out by [`WorkQueue::get`]
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.state();
        state.processing.remove(key);
        state.in_flight.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    pub fn shutdown(&self) {
        self.state().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run `concurrency` workers pulling keys until `token` is cancelled.
///
/// Each invocation gets a child token, so in-flight reconciles observe
/// shutdown or [`WorkQueue::supersede`] at their next cancellation point.
pub async fn run_workers<F, Fut>(
    queue: WorkQueue,
    concurrency: usize,
    token: CancellationToken,
    handler: F,
) where
    F: Fn(ObjectKey, CancellationToken) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome>> + Send + 'static,
{
    let mut workers = JoinSet::new();

    {
        let queue = queue.clone();
        let token = token.clone();
        workers.spawn(async move {
            token.cancelled().await;
            info!("Shutting down work queue");
            queue.shutdown();
        });
    }

    for id in 0..concurrency.max(1) {
        let queue = queue.clone();
        let token = token.clone();
        let handler = handler.clone();
        workers.spawn(async move {
            while let Some(key) = queue.get().await {
                let invocation = queue.start(&key, &token);
                let result = handler(key.clone(), invocation).await;
                handle_result(&queue, &key, result);
                queue.done(&key);
            }
            debug!(worker = id, "Worker stopped");
        });
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!("Worker task failed: {}", e);
        }
    }
}

fn handle_result(queue: &WorkQueue, key: &ObjectKey, result: Result<Outcome>) {
    match result {
        Ok(Outcome::Done) => queue.forget(key),
        Ok(Outcome::Requeue) => {
            let delay = queue.add_rate_limited(key.clone());
            debug!(key = %key, delay = ?delay, "Requeued with backoff");
        }
        Ok(Outcome::RequeueAfter(delay)) => {
            queue.forget(key);
            queue.add_after(key.clone(), delay);
        }
        Err(Error::Cancelled) => {
            let delay = queue.add_rate_limited(key.clone());
            debug!(key = %key, delay = ?delay, "Reconcile cancelled, requeued");
        }
        Err(e) => {
            let attempt = queue.next_attempt(key);
            queue.add_after(key.clone(), error_policy(key, &e, attempt));
        }
    }
}
