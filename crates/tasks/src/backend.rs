//! The compute-service seam.
//!
//! Submission and polling talk to the external service only through
//! [`ComputeBackend`]. [`ComfyUIBackend`] is the production adapter; tests
//! substitute a scripted fake.

use async_trait::async_trait;
use serde_json::Value;
use stylize_comfyui::api::{ComfyUIApi, ComfyUIApiError};
use stylize_comfyui::history::{parse_history, HistoryStatus};
use stylize_comfyui::outputs::OutputImage;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The service understood the request and refused it.
    #[error("rejected by compute service: {0}")]
    Rejected(String),

    /// The service could not be reached or failed internally.
    #[error("compute service unreachable: {0}")]
    Unreachable(String),
}

impl From<ComfyUIApiError> for BackendError {
    fn from(e: ComfyUIApiError) -> Self {
        if e.is_rejection() {
            BackendError::Rejected(e.to_string())
        } else {
            BackendError::Unreachable(e.to_string())
        }
    }
}

/// Operations the orchestration core needs from the compute service.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Store an input artifact; returns the service-side reference.
    async fn upload_input(&self, bytes: Vec<u8>, filename: &str) -> Result<String, BackendError>;

    /// Queue an instantiated job graph; returns the external job id.
    async fn submit_job(&self, graph: &Value) -> Result<String, BackendError>;

    /// Current history status of an external job.
    async fn fetch_history(&self, external_job_id: &str) -> Result<HistoryStatus, BackendError>;

    /// Locator reported to callers for a finished artifact.
    fn artifact_locator(&self, image: &OutputImage) -> Result<String, BackendError>;
}

/// [`ComputeBackend`] over the ComfyUI REST API.
///
/// Submissions carry the push listener's client id so ComfyUI routes the
/// prompt's events to that socket.
#[derive(Clone)]
pub struct ComfyUIBackend {
    api: ComfyUIApi,
    client_id: String,
}

impl ComfyUIBackend {
    pub fn new(api: ComfyUIApi, client_id: String) -> Self {
        Self { api, client_id }
    }

    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

#[async_trait]
impl ComputeBackend for ComfyUIBackend {
    async fn upload_input(&self, bytes: Vec<u8>, filename: &str) -> Result<String, BackendError> {
        let uploaded = self.api.upload_image(bytes, filename).await?;
        Ok(uploaded.reference())
    }

    async fn submit_job(&self, graph: &Value) -> Result<String, BackendError> {
        let submitted = self.api.submit_workflow(graph, &self.client_id).await?;
        tracing::debug!(
            prompt_id = %submitted.prompt_id,
            queue_position = submitted.number,
            "Workflow queued",
        );
        Ok(submitted.prompt_id)
    }

    async fn fetch_history(&self, external_job_id: &str) -> Result<HistoryStatus, BackendError> {
        let history = self.api.get_history(external_job_id).await?;
        Ok(parse_history(external_job_id, &history))
    }

    fn artifact_locator(&self, image: &OutputImage) -> Result<String, BackendError> {
        Ok(self.api.view_url(image)?.to_string())
    }
}
