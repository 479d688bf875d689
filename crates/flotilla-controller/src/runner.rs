use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ControllerError;
use crate::queue::{QueueKey, WorkQueue};

/// What a reconcile decided about follow-up work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing further to do until the resource changes again.
    Complete,
    /// Re-run after the given delay (immediately when `None`).
    Retry(Option<Duration>),
}

#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Key: QueueKey;

    fn name(&self) -> &'static str;

    async fn reconcile(&self, key: &Self::Key) -> Result<ReconcileOutcome, ControllerError>;

    /// Called once when a key keeps failing past the pool's threshold. The
    /// key keeps retrying at the capped backoff afterwards.
    async fn on_persistent_failure(
        &self,
        _key: &Self::Key,
        _attempts: u32,
        _error: &ControllerError,
    ) {
    }
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub workers: usize,
    /// Deadline per reconcile invocation.
    pub reconcile_timeout: Duration,
    /// Consecutive failures before `on_persistent_failure` fires.
    pub failure_threshold: u32,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            reconcile_timeout: Duration::from_secs(30),
            failure_threshold: 5,
        }
    }
}

fn requeue_backoff() -> backoff::ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(100))
        .with_multiplier(2.0)
        .with_max_interval(Duration::from_secs(30))
        .with_randomization_factor(0.1)
        .with_max_elapsed_time(None)
        .build()
}

/// Runs a pool of worker tasks draining a [`WorkQueue`] through a
/// [`Reconciler`], enforcing per-reconcile deadlines and exponential
/// backoff with jitter on failing keys.
pub struct ControllerPool {
    tasks: Vec<JoinHandle<()>>,
}

struct FailureTracker<K> {
    attempts: HashMap<K, (u32, backoff::ExponentialBackoff)>,
}

impl ControllerPool {
    pub fn spawn<R: Reconciler>(
        reconciler: Arc<R>,
        queue: WorkQueue<R::Key>,
        options: PoolOptions,
    ) -> Self {
        let failures = Arc::new(Mutex::new(FailureTracker {
            attempts: HashMap::new(),
        }));

        let tasks = (0..options.workers.max(1))
            .map(|_| {
                let reconciler = reconciler.clone();
                let queue = queue.clone();
                let failures = failures.clone();
                let options = options.clone();
                tokio::spawn(async move {
                    worker_loop(reconciler, queue, failures, options).await;
                })
            })
            .collect();

        Self { tasks }
    }

    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

async fn worker_loop<R: Reconciler>(
    reconciler: Arc<R>,
    queue: WorkQueue<R::Key>,
    failures: Arc<Mutex<FailureTracker<R::Key>>>,
    options: PoolOptions,
) {
    loop {
        let key = queue.next().await;
        debug!(controller = reconciler.name(), ?key, "reconciling");

        let result =
            tokio::time::timeout(options.reconcile_timeout, reconciler.reconcile(&key)).await;

        match result {
            Ok(Ok(outcome)) => {
                failures.lock().await.attempts.remove(&key);
                queue.done(&key).await;
                if let ReconcileOutcome::Retry(delay) = outcome {
                    queue.add_after(key, delay.unwrap_or(Duration::from_secs(1)));
                }
            }
            Ok(Err(error)) if error.is_conflict() => {
                // lost a CAS race; someone else made progress, go again
                failures.lock().await.attempts.remove(&key);
                queue.done(&key).await;
                queue.add_after(key, Duration::from_millis(50));
            }
            Ok(Err(error)) => {
                let delay =
                    record_failure(&reconciler, &failures, &key, &error, &options).await;
                queue.done(&key).await;
                queue.add_after(key, delay);
            }
            Err(_elapsed) => {
                let error = ControllerError::Internal(format!(
                    "reconcile deadline of {:?} exceeded",
                    options.reconcile_timeout
                ));
                let delay =
                    record_failure(&reconciler, &failures, &key, &error, &options).await;
                queue.done(&key).await;
                queue.add_after(key, delay);
            }
        }
    }
}

async fn record_failure<R: Reconciler>(
    reconciler: &Arc<R>,
    failures: &Arc<Mutex<FailureTracker<R::Key>>>,
    key: &R::Key,
    error: &ControllerError,
    options: &PoolOptions,
) -> Duration {
    let (attempts, delay) = {
        let mut tracker = failures.lock().await;
        let entry = tracker
            .attempts
            .entry(key.clone())
            .or_insert_with(|| (0, requeue_backoff()));
        entry.0 += 1;
        let delay = entry.1.next_backoff().unwrap_or(Duration::from_secs(30));
        (entry.0, delay)
    };

    warn!(
        controller = reconciler.name(),
        ?key,
        attempts,
        error = %error,
        "reconcile failed, requeueing"
    );

    if attempts == options.failure_threshold {
        reconciler.on_persistent_failure(key, attempts, error).await;
    }
    delay
}
