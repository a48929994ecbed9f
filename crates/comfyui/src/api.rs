//! ComfyUI over HTTP.
//!
//! [`ComfyUIApi`] covers the four endpoints task orchestration needs:
//! `/upload/image`, `/prompt`, `/history/{id}` and `/view`.

use serde::Deserialize;

use crate::outputs::OutputImage;

/// REST handle bound to one ComfyUI base URL. Cheap to clone.
#[derive(Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Body of a `/prompt` reply.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// External job id used to correlate every later event.
    pub prompt_id: String,
    /// Queue position at submission time.
    #[serde(default)]
    pub number: i64,
    /// Per-node validation errors; non-empty means the prompt was refused.
    #[serde(default)]
    pub node_errors: serde_json::Value,
}

/// Response returned by `/upload/image`.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    /// Stored filename (ComfyUI may rename on collision).
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

impl UploadResponse {
    /// Value to place in a `LoadImage` node's `image` input.
    pub fn reference(&self) -> String {
        if self.subfolder.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.subfolder, self.name)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// Transport failure; the server was never heard from.
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        status: u16,
        body: String,
    },

    /// The prompt was accepted over HTTP but failed node validation.
    #[error("ComfyUI rejected the workflow: {0}")]
    Rejected(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl ComfyUIApiError {
    /// True when the service understood the request and refused it.
    pub fn is_rejection(&self) -> bool {
        match self {
            ComfyUIApiError::Rejected(_) => true,
            ComfyUIApiError::ApiError { status, .. } => (400..500).contains(status),
            ComfyUIApiError::Request(_) | ComfyUIApiError::InvalidUrl(_) => false,
        }
    }
}

impl ComfyUIApi {
    /// `api_url` is the HTTP base, e.g. `http://127.0.0.1:8188`; a trailing
    /// slash is dropped.
    pub fn new(api_url: String) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Upload an input image.
    ///
    /// Sends a multipart `POST /upload/image` with `overwrite=true`.
    pub async fn upload_image(
        &self,
        bytes: Vec<u8>,
        filename: &str,
    ) -> Result<UploadResponse, ComfyUIApiError> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("overwrite", "true");

        let response = self
            .client
            .post(format!("{}/upload/image", self.api_url))
            .multipart(form)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Queue `workflow` via `POST /prompt`.
    ///
    /// `client_id` must match the push listener's so ComfyUI sends this
    /// prompt's frames to that socket.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        let submitted: SubmitResponse = Self::parse_response(response).await?;
        if has_node_errors(&submitted.node_errors) {
            return Err(ComfyUIApiError::Rejected(submitted.node_errors.to_string()));
        }
        Ok(submitted)
    }

    /// Raw `GET /history/{prompt_id}` body; `{}` while the prompt is
    /// still queued or running.
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Public URL of an output artifact (`GET /view`).
    pub fn view_url(&self, image: &OutputImage) -> Result<reqwest::Url, ComfyUIApiError> {
        reqwest::Url::parse_with_params(
            &format!("{}/view", self.api_url),
            &[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.kind.as_str()),
            ],
        )
        .map_err(|e| ComfyUIApiError::InvalidUrl(e.to_string()))
    }

    /// Download an output artifact.
    pub async fn download_output(&self, image: &OutputImage) -> Result<Vec<u8>, ComfyUIApiError> {
        let url = self.view_url(image)?;
        self.download_url(url.as_str()).await
    }

    /// Download from an artifact URL previously produced by [`Self::view_url`].
    pub async fn download_url(&self, url: &str) -> Result<Vec<u8>, ComfyUIApiError> {
        let response = self.client.get(url).send().await?;
        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    // ---- private helpers ----

    /// Pass 2xx responses through; anything else becomes
    /// [`ComfyUIApiError::ApiError`] carrying the body text.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

fn has_node_errors(node_errors: &serde_json::Value) -> bool {
    match node_errors {
        serde_json::Value::Object(map) => !map.is_empty(),
        serde_json::Value::Array(items) => !items.is_empty(),
        serde_json::Value::Null => false,
        _ => true,
    }
}
