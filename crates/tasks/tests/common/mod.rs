#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use stylize_comfyui::history::HistoryStatus;
use stylize_comfyui::outputs::OutputImage;
use stylize_core::task::{TaskPatch, TaskRecord, TaskStats, TaskStatus};
use stylize_core::types::TaskId;
use tokio_util::sync::CancellationToken;

use stylize_tasks::backend::{BackendError, ComputeBackend};
use stylize_tasks::poller::PollingFallback;
use stylize_tasks::reconciler::CompletionReconciler;
use stylize_tasks::registry::{RegistryError, TaskRegistry, TaskStore, UpdateOutcome};
use stylize_tasks::submission::JobSubmissionClient;
use stylize_tasks::updates::UpdateBus;

/// The built-in template, whose only sampler is node `5`.
pub fn style_change_template() -> Value {
    serde_json::from_str(include_str!("../../templates/style_change.json")).unwrap()
}

/// Outputs in ComfyUI's nested-by-node shape with one saved image.
pub fn image_outputs(filename: &str) -> Value {
    json!({
        "8": {
            "images": [{ "filename": filename, "subfolder": "", "type": "output" }]
        }
    })
}

pub fn steps(ids: &[&str]) -> HashSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Scripted compute backend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeState {
    next_job: usize,
    uploads: Vec<String>,
    submitted: Vec<Value>,
    upload_error: Option<BackendError>,
    submit_errors: VecDeque<BackendError>,
    history: HashMap<String, VecDeque<Result<HistoryStatus, BackendError>>>,
    history_calls: HashMap<String, usize>,
}

/// In-process [`ComputeBackend`].
///
/// Jobs are numbered `job_1`, `job_2`, ... History answers are consumed in
/// the order scripted; the last one repeats. Unscripted jobs stay pending.
/// The artifact locator is the bare filename.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_uploads(&self, error: BackendError) {
        self.state.lock().unwrap().upload_error = Some(error);
    }

    pub fn fail_next_submit(&self, error: BackendError) {
        self.state.lock().unwrap().submit_errors.push_back(error);
    }

    pub fn script_history(&self, job: &str, answers: Vec<Result<HistoryStatus, BackendError>>) {
        self.state
            .lock()
            .unwrap()
            .history
            .insert(job.to_string(), answers.into());
    }

    pub fn history_calls(&self, job: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .history_calls
            .get(job)
            .copied()
            .unwrap_or(0)
    }

    pub fn uploads(&self) -> Vec<String> {
        self.state.lock().unwrap().uploads.clone()
    }

    pub fn submitted(&self) -> Vec<Value> {
        self.state.lock().unwrap().submitted.clone()
    }
}

#[async_trait]
impl ComputeBackend for FakeBackend {
    async fn upload_input(&self, _bytes: Vec<u8>, filename: &str) -> Result<String, BackendError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.upload_error.clone() {
            return Err(error);
        }
        state.uploads.push(filename.to_string());
        Ok(filename.to_string())
    }

    async fn submit_job(&self, graph: &Value) -> Result<String, BackendError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.submit_errors.pop_front() {
            return Err(error);
        }
        state.submitted.push(graph.clone());
        state.next_job += 1;
        Ok(format!("job_{}", state.next_job))
    }

    async fn fetch_history(&self, external_job_id: &str) -> Result<HistoryStatus, BackendError> {
        let mut state = self.state.lock().unwrap();
        *state
            .history_calls
            .entry(external_job_id.to_string())
            .or_default() += 1;
        let Some(answers) = state.history.get_mut(external_job_id) else {
            return Ok(HistoryStatus::Pending);
        };
        if answers.len() > 1 {
            answers.pop_front().unwrap_or(Ok(HistoryStatus::Pending))
        } else {
            answers.front().cloned().unwrap_or(Ok(HistoryStatus::Pending))
        }
    }

    fn artifact_locator(&self, image: &OutputImage) -> Result<String, BackendError> {
        Ok(image.filename.clone())
    }
}

// ---------------------------------------------------------------------------
// Store with scripted outages
// ---------------------------------------------------------------------------

/// Registry whose matching updates fail with `Unavailable` a set number of
/// times. Reads always succeed.
pub struct FlakyStore {
    inner: TaskRegistry,
    failures_left: AtomicUsize,
    refused: AtomicUsize,
    matches: fn(&TaskPatch) -> bool,
}

impl FlakyStore {
    pub fn new(failures: usize, matches: fn(&TaskPatch) -> bool) -> Arc<Self> {
        Arc::new(Self {
            inner: TaskRegistry::new(),
            failures_left: AtomicUsize::new(failures),
            refused: AtomicUsize::new(0),
            matches,
        })
    }

    /// Updates refused so far.
    pub fn refused(&self) -> usize {
        self.refused.load(Ordering::SeqCst)
    }
}

pub fn tracking_patch(patch: &TaskPatch) -> bool {
    patch.external_job_id.is_some()
}

pub fn failed_patch(patch: &TaskPatch) -> bool {
    patch.status == Some(TaskStatus::Failed)
}

pub fn any_patch(_: &TaskPatch) -> bool {
    true
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn create(&self, owner: &str) -> Result<TaskRecord, RegistryError> {
        self.inner.create(owner).await
    }

    async fn get(&self, task_id: TaskId) -> Result<TaskRecord, RegistryError> {
        self.inner.get(task_id).await
    }

    async fn update(&self, task_id: TaskId, patch: TaskPatch) -> Result<UpdateOutcome, RegistryError> {
        if (self.matches)(&patch)
            && self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            self.refused.fetch_add(1, Ordering::SeqCst);
            return Err(RegistryError::Unavailable("store offline".into()));
        }
        self.inner.update(task_id, patch).await
    }

    async fn resolve(&self, external_job_id: &str) -> Result<Option<TaskId>, RegistryError> {
        self.inner.resolve(external_job_id).await
    }

    async fn list_by_owner(&self, owner: &str, limit: usize) -> Result<Vec<TaskRecord>, RegistryError> {
        self.inner.list_by_owner(owner, limit).await
    }

    async fn sweep_older_than(&self, age: Duration) -> Result<usize, RegistryError> {
        self.inner.sweep_older_than(age).await
    }

    async fn stats(&self) -> Result<TaskStats, RegistryError> {
        self.inner.stats().await
    }
}

// ---------------------------------------------------------------------------
// Wired components
// ---------------------------------------------------------------------------

pub struct Harness {
    pub store: Arc<dyn TaskStore>,
    pub backend: Arc<FakeBackend>,
    pub updates: Arc<UpdateBus>,
    pub reconciler: Arc<CompletionReconciler>,
    pub poller: Arc<PollingFallback>,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn new(poll_interval: Duration) -> Self {
        Self::with_store(Arc::new(TaskRegistry::new()), poll_interval)
    }

    pub fn with_store(store: Arc<dyn TaskStore>, poll_interval: Duration) -> Self {
        let backend = FakeBackend::new();
        let updates = Arc::new(UpdateBus::default());
        let cancel = CancellationToken::new();
        let reconciler = Arc::new(CompletionReconciler::new(
            store.clone(),
            backend.clone(),
            updates.clone(),
        ));
        let poller = Arc::new(PollingFallback::new(
            backend.clone(),
            store.clone(),
            reconciler.clone(),
            poll_interval,
            cancel.clone(),
        ));
        Self {
            store,
            backend,
            updates,
            reconciler,
            poller,
            cancel,
        }
    }

    pub fn submission(&self, job_timeout: Duration) -> JobSubmissionClient {
        JobSubmissionClient::new(
            self.backend.clone(),
            self.store.clone(),
            self.reconciler.clone(),
            self.poller.clone(),
            job_timeout,
        )
    }

    /// A `PROCESSING` task already correlated with `job`.
    pub async fn tracked_task(&self, owner: &str, job: &str, relevant: &[&str]) -> TaskId {
        let task = self.store.create(owner).await.unwrap();
        self.store
            .update(task.task_id, TaskPatch::tracking(job, steps(relevant)))
            .await
            .unwrap();
        task.task_id
    }
}
