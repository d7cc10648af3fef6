//! Worker pool driving reconciles off the work queue.
//!
//! Each worker loops `get → reconcile → record outcome → done`. Every
//! reconcile runs in its own task so a panic or a hang is confined to that
//! one key: the worker turns it into a retryable error and moves on.

use crate::error::ControllerError;
use crate::event::ReconcileKey;
use crate::metrics::{Metrics, RESULT_ERROR, RESULT_REQUEUE, RESULT_SUCCESS};
use crate::queue::WorkQueue;
use crate::reconciler::{Action, Reconcile};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Fixed set of workers draining one queue.
#[derive(Debug)]
pub struct WorkerPool {
    queue: WorkQueue<ReconcileKey>,
    workers: JoinSet<()>,
}

impl WorkerPool {
    /// Spawn `workers` tasks reconciling keys from `queue`.
    pub fn start(
        queue: WorkQueue<ReconcileKey>,
        reconciler: Arc<dyn Reconcile>,
        workers: usize,
        reconcile_timeout: Duration,
        metrics: Metrics,
    ) -> Self {
        info!(workers, ?reconcile_timeout, "Starting worker pool");
        let mut set = JoinSet::new();
        for id in 0..workers {
            set.spawn(worker_loop(
                id,
                queue.clone(),
                Arc::clone(&reconciler),
                reconcile_timeout,
                metrics.clone(),
            ));
        }
        Self { queue, workers: set }
    }

    /// Shut the queue down, let in-flight reconciles finish for up to
    /// `grace`, then abort whatever is still running.
    pub async fn stop(mut self, grace: Duration) {
        info!(?grace, "Stopping worker pool");
        self.queue.shut_down();

        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = self.workers.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Worker exited abnormally");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(remaining = self.workers.len(), "Grace period elapsed, aborting workers");
            self.workers.shutdown().await;
        } else {
            info!("Worker pool stopped");
        }
    }
}

async fn worker_loop(
    id: usize,
    queue: WorkQueue<ReconcileKey>,
    reconciler: Arc<dyn Reconcile>,
    reconcile_timeout: Duration,
    metrics: Metrics,
) {
    debug!(worker = id, "Worker started");
    while let Some(key) = queue.get().await {
        let started = Instant::now();
        let result = reconcile_isolated(&reconciler, &key, reconcile_timeout).await;
        let elapsed = started.elapsed();

        match result {
            Ok(action) => match action.requeue_after() {
                Some(delay) => {
                    debug!(worker = id, %key, ?delay, "Reconciled, requeue requested");
                    metrics.record_reconcile(RESULT_REQUEUE, elapsed);
                    queue.forget(&key);
                    queue.add_after(key.clone(), delay);
                }
                None => {
                    debug!(worker = id, %key, ?elapsed, "Reconciled");
                    metrics.record_reconcile(RESULT_SUCCESS, elapsed);
                    queue.forget(&key);
                }
            },
            Err(e) => {
                let failures = queue.num_requeues(&key);
                if e.is_retryable() {
                    warn!(worker = id, %key, failures, error = %e, "Reconcile failed, retrying with backoff");
                } else {
                    error!(worker = id, %key, failures, error = %e, "Reconcile failed");
                }
                metrics.record_reconcile(RESULT_ERROR, elapsed);
                queue.add_rate_limited(key.clone());
            }
        }
        queue.done(&key);
    }
    debug!(worker = id, "Worker stopped");
}

/// Run one reconcile in its own task, bounded by `limit`.
async fn reconcile_isolated(
    reconciler: &Arc<dyn Reconcile>,
    key: &ReconcileKey,
    limit: Duration,
) -> Result<Action, ControllerError> {
    let task_reconciler = Arc::clone(reconciler);
    let task_key = key.clone();
    let mut task = AbortOnDrop(tokio::spawn(async move {
        task_reconciler.reconcile(&task_key).await
    }));

    match tokio::time::timeout(limit, &mut task.0).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) if join_error.is_panic() => {
            Err(ControllerError::Panicked(panic_message(join_error.into_panic())))
        }
        Ok(Err(join_error)) => Err(ControllerError::Panicked(join_error.to_string())),
        Err(_) => Err(ControllerError::Timeout(limit)),
    }
}

/// Aborts the reconcile task when the worker gives up on it or is itself aborted.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map_or_else(|| "non-string panic payload".to_string(), |s| (*s).to_string()),
    }
}
