//! Job submission and task/job correlation.
//!
//! [`JobSubmissionClient::submit`] takes a `PENDING` task through upload,
//! template instantiation and submission, then records the external job
//! id on the task (which also makes it resolvable) and starts the polling
//! fallback.
//!
//! Once the service has accepted the job, a failure to record it locally
//! leaves a job running with nothing watching it. The tracking update is
//! retried with backoff; if it still fails the task is failed locally and
//! the orphaned job id is logged and returned in the error. Marking the task
//! failed is retried the same way. If the store refuses that too, the task
//! stays `PENDING` and the error log is the only trace of the job.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use stylize_core::backoff::BackoffConfig;
use stylize_core::error::CoreError;
use stylize_core::task::TaskPatch;
use stylize_core::types::TaskId;
use stylize_core::workflow::{instantiate, JobParams};

use crate::backend::{BackendError, ComputeBackend};
use crate::poller::PollingFallback;
use crate::reconciler::{CompletionReconciler, Reconciled};
use crate::registry::{RegistryError, TaskStore, UpdateOutcome};

/// Attempts at recording a freshly accepted job before giving up.
const TRACKING_ATTEMPTS: usize = 5;

/// Extension used when the caller's filename has none.
const DEFAULT_INPUT_EXTENSION: &str = "png";

/// Raw input artifact supplied by the caller.
#[derive(Debug, Clone)]
pub struct InputArtifact {
    pub bytes: Vec<u8>,
    /// Original filename; only its extension is kept.
    pub filename: String,
}

impl InputArtifact {
    pub fn new(bytes: Vec<u8>, filename: impl Into<String>) -> Self {
        Self {
            bytes,
            filename: filename.into(),
        }
    }

    /// Service-side filename for `task_id`'s input.
    pub fn upload_name(&self, task_id: TaskId) -> String {
        let ext = Path::new(&self.filename)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or(DEFAULT_INPUT_EXTENSION)
            .to_ascii_lowercase();
        format!("input_{task_id}.{ext}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("Input upload failed: {0}")]
    Upload(#[source] BackendError),

    #[error("Invalid job: {0}")]
    Template(#[from] CoreError),

    #[error("Job rejected: {0}")]
    Rejected(String),

    #[error("Compute service unreachable: {0}")]
    Unreachable(String),

    /// The job is running externally but could not be tracked.
    #[error("Job {external_job_id} submitted but not tracked: {reason}")]
    Tracking {
        external_job_id: String,
        reason: String,
    },
}

impl From<BackendError> for SubmissionError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Rejected(msg) => SubmissionError::Rejected(msg),
            BackendError::Unreachable(msg) => SubmissionError::Unreachable(msg),
        }
    }
}

pub struct JobSubmissionClient {
    backend: Arc<dyn ComputeBackend>,
    store: Arc<dyn TaskStore>,
    reconciler: Arc<CompletionReconciler>,
    poller: Arc<PollingFallback>,
    job_timeout: Duration,
    tracking_backoff: BackoffConfig,
}

impl JobSubmissionClient {
    pub fn new(
        backend: Arc<dyn ComputeBackend>,
        store: Arc<dyn TaskStore>,
        reconciler: Arc<CompletionReconciler>,
        poller: Arc<PollingFallback>,
        job_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            store,
            reconciler,
            poller,
            job_timeout,
            tracking_backoff: BackoffConfig::local_retry(),
        }
    }

    pub fn with_tracking_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.tracking_backoff = backoff;
        self
    }

    /// Submit `task_id`'s job and start tracking it. Returns the external
    /// job id.
    ///
    /// Any error before the service accepts the job leaves the task
    /// `PENDING`.
    pub async fn submit(
        &self,
        task_id: TaskId,
        input: InputArtifact,
        template: &Value,
        params: &JobParams,
    ) -> Result<String, SubmissionError> {
        params.validate()?;

        let upload_name = input.upload_name(task_id);
        let input_reference = self
            .backend
            .upload_input(input.bytes, &upload_name)
            .await
            .map_err(SubmissionError::Upload)?;
        tracing::debug!(task_id = %task_id, input = %input_reference, "Input uploaded");

        let job = instantiate(template, &input_reference, params)?;

        let external_job_id = self.backend.submit_job(&job.graph).await?;
        tracing::info!(
            task_id = %task_id,
            prompt_id = %external_job_id,
            relevant_steps = job.relevant_step_ids.len(),
            "Job submitted",
        );

        if let Err(reason) = self
            .record_tracking(task_id, &external_job_id, job.relevant_step_ids)
            .await
        {
            tracing::error!(
                task_id = %task_id,
                prompt_id = %external_job_id,
                reason = %reason,
                "Job is running externally but could not be tracked",
            );
            let detail = format!("job {external_job_id} could not be tracked locally: {reason}");
            let retries = self.tracking_backoff.delays().take(TRACKING_ATTEMPTS - 1);
            if let Reconciled::StoreError(error) =
                self.reconciler.fail_task_retrying(task_id, &detail, retries).await
            {
                tracing::error!(
                    task_id = %task_id,
                    prompt_id = %external_job_id,
                    error = %error,
                    "Untracked task could not be marked failed",
                );
            }
            return Err(SubmissionError::Tracking {
                external_job_id,
                reason,
            });
        }

        self.poller
            .watch(task_id, external_job_id.clone(), self.job_timeout);
        Ok(external_job_id)
    }

    // ---- private helpers ----

    async fn record_tracking(
        &self,
        task_id: TaskId,
        external_job_id: &str,
        steps: std::collections::HashSet<String>,
    ) -> Result<(), String> {
        let patch = TaskPatch::tracking(external_job_id, steps);
        let mut last_error = String::new();

        for (attempt, delay) in self
            .tracking_backoff
            .delays()
            .take(TRACKING_ATTEMPTS)
            .enumerate()
        {
            match self.store.update(task_id, patch.clone()).await {
                Ok(UpdateOutcome::Applied(_)) => return Ok(()),
                Ok(UpdateOutcome::Unchanged(record)) => {
                    return if record.external_job_id.as_deref() == Some(external_job_id) {
                        Ok(())
                    } else {
                        Err(format!("task already {}", record.status))
                    };
                }
                Err(e @ RegistryError::Unavailable(_)) => {
                    tracing::warn!(
                        task_id = %task_id,
                        attempt = attempt + 1,
                        error = %e,
                        "Recording job failed, retrying",
                    );
                    last_error = e.to_string();
                    if attempt + 1 < TRACKING_ATTEMPTS {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e.to_string()),
            }
        }

        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_name_keeps_extension() {
        let id = TaskId::nil();
        let input = InputArtifact::new(vec![], "Holiday.JPG");
        assert_eq!(
            input.upload_name(id),
            "input_00000000-0000-0000-0000-000000000000.jpg"
        );
    }

    #[test]
    fn upload_name_defaults_extension() {
        let id = TaskId::nil();
        assert!(InputArtifact::new(vec![], "noext").upload_name(id).ends_with(".png"));
        assert!(InputArtifact::new(vec![], "weird.p/g").upload_name(id).ends_with(".png"));
    }

    #[test]
    fn backend_errors_map_to_submission_errors() {
        assert!(matches!(
            SubmissionError::from(BackendError::Rejected("bad".into())),
            SubmissionError::Rejected(_)
        ));
        assert!(matches!(
            SubmissionError::from(BackendError::Unreachable("down".into())),
            SubmissionError::Unreachable(_)
        ));
    }
}
