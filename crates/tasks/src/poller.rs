//! Polling fallback for lost push notifications.
//!
//! Every tracked job gets its own watch loop that queries the history
//! endpoint on a fixed interval. The loop ends when the job is terminal
//! on either channel, when the task disappears, on shutdown, or at the
//! absolute deadline. Hitting the deadline always fails the task: the
//! FAILED write is retried until the store accepts it or the record is
//! seen terminal.

use std::sync::Arc;
use std::time::Duration;

use stylize_comfyui::history::HistoryStatus;
use stylize_core::backoff::BackoffConfig;
use stylize_core::types::TaskId;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::backend::ComputeBackend;
use crate::reconciler::{CompletionReconciler, Reconciled};
use crate::registry::{RegistryError, TaskStore};

/// Why a watch loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchExit {
    /// This loop applied the terminal state.
    Reconciled,
    /// The task was already terminal (typically via the push channel).
    AlreadyTerminal,
    /// The deadline passed and the task was failed.
    TimedOut,
    /// The task or its correlation no longer exists.
    TaskGone,
    Cancelled,
}

/// Stand-in for an instant too far out to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Failure detail recorded when the deadline passes.
pub fn timeout_detail(external_job_id: &str, timeout: Duration) -> String {
    format!("timed out after {timeout:?} waiting for job {external_job_id}")
}

fn instant_after(start: Instant, wait: Duration) -> Instant {
    start
        .checked_add(wait)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

pub struct PollingFallback {
    backend: Arc<dyn ComputeBackend>,
    store: Arc<dyn TaskStore>,
    reconciler: Arc<CompletionReconciler>,
    interval: Duration,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl PollingFallback {
    pub fn new(
        backend: Arc<dyn ComputeBackend>,
        store: Arc<dyn TaskStore>,
        reconciler: Arc<CompletionReconciler>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backend,
            store,
            reconciler,
            interval,
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    /// Spawn a watch loop for `external_job_id`.
    pub fn watch(self: &Arc<Self>, task_id: TaskId, external_job_id: String, timeout: Duration) {
        let this = Arc::clone(self);
        self.tracker.spawn(async move {
            let exit = this.run_watch(task_id, &external_job_id, timeout).await;
            tracing::debug!(task_id = %task_id, prompt_id = %external_job_id, ?exit, "Poll loop finished");
        });
    }

    /// Number of watch loops still running.
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting new loops and wait for the running ones. Loops exit
    /// promptly once the cancellation token fires.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Run one watch loop to completion on the current task.
    pub async fn run_watch(
        &self,
        task_id: TaskId,
        external_job_id: &str,
        timeout: Duration,
    ) -> WatchExit {
        let deadline = instant_after(Instant::now(), timeout);

        loop {
            match self.store.get(task_id).await {
                Ok(record) if record.is_terminal() => return WatchExit::AlreadyTerminal,
                Ok(_) => {}
                Err(RegistryError::NotFound(_)) => return WatchExit::TaskGone,
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "Task lookup failed, will retry");
                }
            }

            if Instant::now() >= deadline {
                return self.expire(task_id, external_job_id, timeout).await;
            }

            let polled = tokio::select! {
                _ = self.cancel.cancelled() => return WatchExit::Cancelled,
                polled = tokio::time::timeout_at(deadline, self.backend.fetch_history(external_job_id)) => polled,
            };

            let outcome = match polled {
                Err(_elapsed) => None,
                Ok(Err(e)) => {
                    tracing::warn!(
                        task_id = %task_id,
                        prompt_id = %external_job_id,
                        error = %e,
                        "History poll failed, retrying next interval",
                    );
                    None
                }
                Ok(Ok(HistoryStatus::Pending)) => None,
                Ok(Ok(HistoryStatus::Succeeded { outputs })) => {
                    Some(self.reconciler.on_completion(external_job_id, &outputs).await)
                }
                Ok(Ok(HistoryStatus::Failed { reason })) => {
                    Some(self.reconciler.on_failure(external_job_id, &reason).await)
                }
            };

            match outcome {
                Some(Reconciled::Applied(_)) => return WatchExit::Reconciled,
                Some(Reconciled::CorrelationMiss | Reconciled::NotFound) => {
                    return WatchExit::TaskGone;
                }
                Some(Reconciled::Ignored | Reconciled::StoreError(_)) | None => {}
            }

            let wake = instant_after(Instant::now(), self.interval).min(deadline);
            tokio::select! {
                _ = self.cancel.cancelled() => return WatchExit::Cancelled,
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    /// Fail the task for missing its deadline. Store errors are retried
    /// until the write lands or the record reads terminal.
    async fn expire(&self, task_id: TaskId, external_job_id: &str, timeout: Duration) -> WatchExit {
        let detail = timeout_detail(external_job_id, timeout);
        tracing::warn!(task_id = %task_id, prompt_id = %external_job_id, "Job timed out");
        let backoff = BackoffConfig::local_retry();

        loop {
            let failed = tokio::select! {
                _ = self.cancel.cancelled() => return WatchExit::Cancelled,
                failed = self.reconciler.fail_task_retrying(task_id, &detail, backoff.delays()) => failed,
            };
            match failed {
                Reconciled::Applied(_) => return WatchExit::TimedOut,
                Reconciled::NotFound | Reconciled::CorrelationMiss => return WatchExit::TaskGone,
                Reconciled::Ignored | Reconciled::StoreError(_) => {}
            }

            match self.store.get(task_id).await {
                Ok(record) if record.is_terminal() => return WatchExit::AlreadyTerminal,
                Err(RegistryError::NotFound(_)) => return WatchExit::TaskGone,
                _ => {}
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return WatchExit::Cancelled,
                _ = tokio::time::sleep(backoff.max_delay) => {}
            }
        }
    }
}
