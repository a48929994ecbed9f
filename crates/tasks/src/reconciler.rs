//! The merge point for push and poll signals.
//!
//! Both channels call into [`CompletionReconciler`]; neither touches the
//! task store directly. Every signal is resolved through the correlation
//! index and applied as a [`TaskPatch`]. Because terminal records absorb
//! all patches, at most one terminal transition is ever applied per task
//! no matter how the two channels interleave, and a [`TaskUpdate`] is
//! published only for applied changes.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use stylize_comfyui::events::PushEvent;
use stylize_comfyui::outputs::primary_image;
use stylize_core::task::{TaskPatch, TaskRecord};
use stylize_core::types::TaskId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::ComputeBackend;
use crate::progress;
use crate::registry::{RegistryError, TaskStore, UpdateOutcome};
use crate::updates::{TaskUpdate, UpdateBus};

/// Failure detail when a finished job produced no image.
pub const NO_OUTPUT_IMAGE: &str = "no output image produced";

/// What a signal did to the task it referred to.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// The task changed; carries its new state.
    Applied(TaskRecord),
    /// Filtered, stale or duplicate. The task already reflects it.
    Ignored,
    /// The store could not be read or written; the signal was not applied.
    StoreError(String),
    /// No task is tracking the external job id.
    CorrelationMiss,
    /// The correlated task no longer exists.
    NotFound,
}

impl Reconciled {
    pub fn is_applied(&self) -> bool {
        matches!(self, Reconciled::Applied(_))
    }
}

pub struct CompletionReconciler {
    store: Arc<dyn TaskStore>,
    backend: Arc<dyn ComputeBackend>,
    updates: Arc<UpdateBus>,
}

impl CompletionReconciler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        backend: Arc<dyn ComputeBackend>,
        updates: Arc<UpdateBus>,
    ) -> Self {
        Self {
            store,
            backend,
            updates,
        }
    }

    /// Step progress for an external job.
    pub async fn on_progress(
        &self,
        external_job_id: &str,
        step_id: Option<&str>,
        value: i64,
        max: i64,
    ) -> Reconciled {
        let record = match self.correlate(external_job_id).await {
            Ok(record) => record,
            Err(outcome) => return outcome,
        };

        let Some(percent) = progress::aggregate(&record, step_id, value, max) else {
            tracing::trace!(
                task_id = %record.task_id,
                prompt_id = %external_job_id,
                step_id = ?step_id,
                "Progress event discarded",
            );
            return Reconciled::Ignored;
        };

        self.apply(record.task_id, TaskPatch::progress(percent)).await
    }

    /// The external job finished; `outputs` may be in any supported shape.
    pub async fn on_completion(&self, external_job_id: &str, outputs: &Value) -> Reconciled {
        let record = match self.correlate(external_job_id).await {
            Ok(record) => record,
            Err(outcome) => return outcome,
        };
        if record.is_terminal() {
            tracing::debug!(task_id = %record.task_id, prompt_id = %external_job_id, "Duplicate completion ignored");
            return Reconciled::Ignored;
        }

        let patch = match primary_image(outputs) {
            None => TaskPatch::failed(NO_OUTPUT_IMAGE),
            Some(image) => match self.backend.artifact_locator(&image) {
                Ok(locator) => TaskPatch::completed(locator),
                Err(e) => TaskPatch::failed(format!("cannot locate output '{}': {e}", image.filename)),
            },
        };
        self.apply(record.task_id, patch).await
    }

    /// The external job failed or was interrupted.
    pub async fn on_failure(&self, external_job_id: &str, reason: &str) -> Reconciled {
        let record = match self.correlate(external_job_id).await {
            Ok(record) => record,
            Err(outcome) => return outcome,
        };
        self.apply(record.task_id, TaskPatch::failed(reason)).await
    }

    /// Fail a task by its own id: timeouts and local tracking failures.
    pub async fn fail_task(&self, task_id: TaskId, detail: &str) -> Reconciled {
        self.apply(task_id, TaskPatch::failed(detail)).await
    }

    /// [`fail_task`](Self::fail_task), retrying store errors after each of
    /// `delays`. Returns the last [`Reconciled::StoreError`] once the delays
    /// run out.
    pub async fn fail_task_retrying(
        &self,
        task_id: TaskId,
        detail: &str,
        delays: impl IntoIterator<Item = Duration>,
    ) -> Reconciled {
        let mut delays = delays.into_iter();
        loop {
            let outcome = self.fail_task(task_id, detail).await;
            if !matches!(outcome, Reconciled::StoreError(_)) {
                return outcome;
            }
            match delays.next() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => return outcome,
            }
        }
    }

    /// Route one push-channel event.
    pub async fn handle(&self, event: PushEvent) -> Option<Reconciled> {
        match event {
            PushEvent::Progress {
                prompt_id,
                node,
                value,
                max,
            } => Some(self.on_progress(&prompt_id, node.as_deref(), value, max).await),
            PushEvent::Completed { prompt_id, outputs } => {
                Some(self.on_completion(&prompt_id, &outputs).await)
            }
            PushEvent::Failed { prompt_id, reason } => {
                Some(self.on_failure(&prompt_id, &reason).await)
            }
            PushEvent::Connected { client_id } => {
                tracing::info!(client_id = %client_id, "Push channel connected");
                None
            }
            PushEvent::Disconnected => {
                tracing::warn!("Push channel disconnected, relying on polling until it returns");
                None
            }
        }
    }

    /// Consume the listener handoff channel until it closes or `cancel` fires.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<PushEvent>, cancel: CancellationToken) {
        tracing::info!("Reconciler started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle(event).await;
                    }
                    None => break,
                },
            }
        }
        tracing::info!("Reconciler stopped");
    }

    // ---- private helpers ----

    async fn correlate(&self, external_job_id: &str) -> Result<TaskRecord, Reconciled> {
        let task_id = match self.store.resolve(external_job_id).await {
            Ok(Some(task_id)) => task_id,
            Ok(None) => {
                tracing::debug!(prompt_id = %external_job_id, "Event for unknown job discarded");
                return Err(Reconciled::CorrelationMiss);
            }
            Err(e) => {
                tracing::warn!(prompt_id = %external_job_id, error = %e, "Correlation lookup failed");
                return Err(Reconciled::StoreError(e.to_string()));
            }
        };

        match self.store.get(task_id).await {
            Ok(record) => Ok(record),
            Err(RegistryError::NotFound(_)) => Err(Reconciled::NotFound),
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Task lookup failed");
                Err(Reconciled::StoreError(e.to_string()))
            }
        }
    }

    async fn apply(&self, task_id: TaskId, patch: TaskPatch) -> Reconciled {
        match self.store.update(task_id, patch).await {
            Ok(UpdateOutcome::Applied(record)) => {
                if record.is_terminal() {
                    tracing::info!(
                        task_id = %task_id,
                        status = %record.status,
                        output_reference = ?record.output_reference,
                        error_detail = ?record.error_detail,
                        "Task finished",
                    );
                } else {
                    tracing::debug!(task_id = %task_id, progress = record.progress, "Task progress");
                }
                self.updates.publish(TaskUpdate::from_record(&record));
                Reconciled::Applied(record)
            }
            Ok(UpdateOutcome::Unchanged(_)) => Reconciled::Ignored,
            Err(RegistryError::NotFound(_)) => Reconciled::NotFound,
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Task update refused");
                Reconciled::StoreError(e.to_string())
            }
        }
    }
}
