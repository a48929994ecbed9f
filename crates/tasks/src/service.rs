//! The public face of the orchestration core.
//!
//! [`TaskService`] owns every long-lived component and the background
//! tasks that drive them:
//!
//! - the reconciler consumer, fed by the push-channel handoff
//! - the retention sweeper
//! - the polling fallback's watch loops
//! - optionally the ComfyUI push listener
//!
//! All of them hang off one master [`CancellationToken`].

use std::sync::Arc;
use std::time::Duration;

use stylize_comfyui::api::ComfyUIApi;
use stylize_comfyui::client::ComfyUIClient;
use stylize_comfyui::events::PushEvent;
use stylize_comfyui::listener::{PushChannelListener, PUSH_CHANNEL_CAPACITY};
use stylize_core::backoff::BackoffConfig;
use stylize_core::error::CoreError;
use stylize_core::task::{TaskRecord, TaskStats};
use stylize_core::types::TaskId;
use stylize_core::workflow::JobParams;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{ComfyUIBackend, ComputeBackend};
use crate::config::ServiceConfig;
use crate::poller::PollingFallback;
use crate::reconciler::CompletionReconciler;
use crate::registry::{RegistryError, TaskRegistry, TaskStore, DEFAULT_LIST_LIMIT};
use crate::submission::{InputArtifact, JobSubmissionClient, SubmissionError};
use crate::sweeper;
use crate::templates::{TemplateError, TemplateLibrary, BUILTIN_TEMPLATE};
use crate::updates::{TaskUpdate, UpdateBus};

/// How long shutdown waits for each background task.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A request to restyle one input.
#[derive(Debug, Clone)]
pub struct CreateTask {
    pub input: InputArtifact,
    /// Template name; `style_change` when `None`.
    pub template: Option<String>,
    pub params: JobParams,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Task {0} not found")]
    TaskNotFound(TaskId),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    InvalidParams(#[from] CoreError),

    #[error(transparent)]
    Registry(RegistryError),

    /// The task exists. It is still `PENDING` unless the job was accepted
    /// but could not be tracked, in which case it is `FAILED` (or `PENDING`
    /// if the store refused that write as well).
    #[error("Task {task_id}: {source}")]
    Submission {
        task_id: TaskId,
        #[source]
        source: SubmissionError,
    },

    #[error("Batch of {size} inputs exceeds the limit of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("Batch is empty")]
    EmptyBatch,
}

impl From<RegistryError> for ServiceError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(task_id) => ServiceError::TaskNotFound(task_id),
            other => ServiceError::Registry(other),
        }
    }
}

pub struct TaskService {
    config: ServiceConfig,
    store: Arc<dyn TaskStore>,
    updates: Arc<UpdateBus>,
    templates: TemplateLibrary,
    submission: JobSubmissionClient,
    poller: Arc<PollingFallback>,
    push_tx: mpsc::Sender<PushEvent>,
    listener: Mutex<Option<PushChannelListener>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl TaskService {
    /// Wire the core around `backend` and `store` and spawn its background
    /// tasks. No push listener is attached; push events can be injected
    /// through [`TaskService::push_sender`].
    pub fn start(
        config: ServiceConfig,
        backend: Arc<dyn ComputeBackend>,
        store: Arc<dyn TaskStore>,
    ) -> Arc<Self> {
        Self::launch(config, backend, store, None)
    }

    /// Start against a real ComfyUI server with an in-memory registry.
    ///
    /// The push listener and the REST backend share one client id so that
    /// ComfyUI routes this process's job events to its socket.
    pub fn connect_comfyui(config: ServiceConfig) -> Arc<Self> {
        let client = ComfyUIClient::with_random_id(config.comfyui_ws_url.clone());
        let backend = ComfyUIBackend::new(
            ComfyUIApi::new(config.comfyui_url.clone()),
            client.client_id().to_string(),
        );
        tracing::info!(
            comfyui_url = %config.comfyui_url,
            client_id = %client.client_id(),
            "Connecting to ComfyUI",
        );
        Self::launch(
            config,
            Arc::new(backend),
            Arc::new(TaskRegistry::new()),
            Some(client),
        )
    }

    fn launch(
        config: ServiceConfig,
        backend: Arc<dyn ComputeBackend>,
        store: Arc<dyn TaskStore>,
        push_client: Option<ComfyUIClient>,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let updates = Arc::new(UpdateBus::default());

        let reconciler = Arc::new(CompletionReconciler::new(
            Arc::clone(&store),
            Arc::clone(&backend),
            Arc::clone(&updates),
        ));
        let poller = Arc::new(PollingFallback::new(
            Arc::clone(&backend),
            Arc::clone(&store),
            Arc::clone(&reconciler),
            config.poll_interval,
            cancel.child_token(),
        ));
        let submission = JobSubmissionClient::new(
            backend,
            Arc::clone(&store),
            Arc::clone(&reconciler),
            Arc::clone(&poller),
            config.job_timeout,
        );

        let (push_tx, push_rx) = mpsc::channel(PUSH_CHANNEL_CAPACITY);

        let handles = vec![
            tokio::spawn(Arc::clone(&reconciler).run(push_rx, cancel.child_token())),
            tokio::spawn(sweeper::run(
                Arc::clone(&store),
                config.retention,
                config.sweep_interval,
                cancel.child_token(),
            )),
        ];

        let listener = push_client.map(|client| {
            PushChannelListener::spawn(
                client,
                BackoffConfig::default(),
                push_tx.clone(),
                cancel.child_token(),
            )
        });

        tracing::info!(
            job_timeout_secs = config.job_timeout.as_secs(),
            poll_interval_secs = config.poll_interval.as_secs(),
            "Task service started"
        );

        Arc::new(Self {
            templates: TemplateLibrary::new(config.workflow_dir.clone()),
            config,
            store,
            updates,
            submission,
            poller,
            push_tx,
            listener: Mutex::new(listener),
            handles: Mutex::new(handles),
            cancel,
        })
    }

    /// Create a task for `owner` and submit its job.
    ///
    /// Template and parameter problems are reported before any record
    /// exists. A [`ServiceError::Submission`] means the record was created;
    /// see that variant for its state.
    pub async fn create_task(&self, owner: &str, request: CreateTask) -> Result<TaskId, ServiceError> {
        request.params.validate()?;
        let template_name = request.template.as_deref().unwrap_or(BUILTIN_TEMPLATE);
        let template = self.templates.load(template_name).await?;

        let record = self.store.create(owner).await?;
        let task_id = record.task_id;
        tracing::info!(task_id = %task_id, owner = %owner, template = %template_name, "Task created");

        match self
            .submission
            .submit(task_id, request.input, &template, &request.params)
            .await
        {
            Ok(_) => Ok(task_id),
            Err(source) => {
                tracing::warn!(task_id = %task_id, error = %source, "Submission failed");
                Err(ServiceError::Submission { task_id, source })
            }
        }
    }

    /// Create one task per input with shared template and parameters.
    /// Results are in input order; one failure does not stop the others.
    pub async fn create_batch(
        &self,
        owner: &str,
        inputs: Vec<InputArtifact>,
        template: Option<String>,
        params: JobParams,
    ) -> Result<Vec<Result<TaskId, ServiceError>>, ServiceError> {
        if inputs.is_empty() {
            return Err(ServiceError::EmptyBatch);
        }
        if inputs.len() > self.config.max_batch_size {
            return Err(ServiceError::BatchTooLarge {
                size: inputs.len(),
                max: self.config.max_batch_size,
            });
        }

        let requests = inputs.into_iter().map(|input| {
            self.create_task(
                owner,
                CreateTask {
                    input,
                    template: template.clone(),
                    params: params.clone(),
                },
            )
        });
        let results = futures::future::join_all(requests).await;

        let submitted = results.iter().filter(|r| r.is_ok()).count();
        tracing::info!(owner = %owner, total = results.len(), submitted, "Batch submitted");
        Ok(results)
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<TaskRecord, ServiceError> {
        Ok(self.store.get(task_id).await?)
    }

    /// Newest first; `limit` defaults to 50.
    pub async fn list_tasks(
        &self,
        owner: &str,
        limit: Option<usize>,
    ) -> Result<Vec<TaskRecord>, ServiceError> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT);
        Ok(self.store.list_by_owner(owner, limit).await?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskUpdate> {
        self.updates.subscribe()
    }

    pub async fn stats(&self) -> Result<TaskStats, ServiceError> {
        Ok(self.store.stats().await?)
    }

    /// Whether the push listener currently holds an open socket. Always
    /// false when no listener is attached.
    pub async fn listener_connected(&self) -> bool {
        self.listener
            .lock()
            .await
            .as_ref()
            .is_some_and(PushChannelListener::is_connected)
    }

    /// Handoff channel into the reconciler.
    pub fn push_sender(&self) -> mpsc::Sender<PushEvent> {
        self.push_tx.clone()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Number of jobs still being watched by the polling fallback.
    pub fn active_watches(&self) -> usize {
        self.poller.active()
    }

    /// Cancel every background task and wait for them to stop.
    pub async fn shutdown(&self) {
        tracing::info!("Task service shutting down");
        self.cancel.cancel();

        if let Some(listener) = self.listener.lock().await.take() {
            listener.shutdown().await;
        }

        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
                tracing::warn!("Background task did not stop in time");
            }
        }

        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.poller.wait())
            .await
            .is_err()
        {
            tracing::warn!(active = self.poller.active(), "Poll loops did not stop in time");
        }
        tracing::info!("Task service stopped");
    }
}
