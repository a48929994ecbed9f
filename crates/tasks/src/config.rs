//! Service configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Orchestration settings.
///
/// All fields have defaults suitable for a local ComfyUI on its standard
/// port.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// HTTP base of the ComfyUI server.
    pub comfyui_url: String,
    /// WebSocket base of the ComfyUI server.
    pub comfyui_ws_url: String,
    /// Directory holding `<template>.json` job graphs.
    pub workflow_dir: PathBuf,
    /// Absolute deadline for a job once submitted.
    pub job_timeout: Duration,
    /// Fixed interval between history polls.
    pub poll_interval: Duration,
    /// Age past which task records are swept.
    pub retention: Duration,
    /// How often the sweeper runs.
    pub sweep_interval: Duration,
    /// Maximum inputs per batch request.
    pub max_batch_size: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} is not a valid http(s) URL: {value}")]
    InvalidUrl { var: &'static str, value: String },
}

const DEFAULT_COMFYUI_URL: &str = "http://127.0.0.1:8188";
const DEFAULT_WORKFLOW_DIR: &str = "workflows";
const DEFAULT_JOB_TIMEOUT_SECS: u64 = 300;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 3;
const DEFAULT_RETENTION_HOURS: u64 = 24;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3600;
const DEFAULT_MAX_BATCH_SIZE: usize = 10;
/// Upper bound on any timeout or interval: one week.
const MAX_DURATION_SECS: u64 = 7 * 24 * 3600;

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            comfyui_url: DEFAULT_COMFYUI_URL.to_string(),
            comfyui_ws_url: derive_ws_url(DEFAULT_COMFYUI_URL),
            workflow_dir: PathBuf::from(DEFAULT_WORKFLOW_DIR),
            job_timeout: Duration::from_secs(DEFAULT_JOB_TIMEOUT_SECS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            retention: Duration::from_secs(DEFAULT_RETENTION_HOURS * 3600),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                | Default                  |
    /// |------------------------|--------------------------|
    /// | `COMFYUI_URL`          | `http://127.0.0.1:8188`  |
    /// | `COMFYUI_WS_URL`       | `COMFYUI_URL` as `ws://` |
    /// | `WORKFLOW_DIR`         | `workflows`              |
    /// | `JOB_TIMEOUT_SECS`     | `300`                    |
    /// | `POLL_INTERVAL_SECS`   | `3`                      |
    /// | `TASK_RETENTION_HOURS` | `24`                     |
    /// | `SWEEP_INTERVAL_SECS`  | `3600`                   |
    /// | `MAX_BATCH_SIZE`       | `10`                     |
    ///
    /// Unparsable numbers fall back to their default. Intervals and the batch
    /// size are at least 1; timeouts and intervals are capped at one week.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let comfyui_url = lookup("COMFYUI_URL")
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_COMFYUI_URL.into());
        if !is_http_url(&comfyui_url) {
            return Err(ConfigError::InvalidUrl {
                var: "COMFYUI_URL",
                value: comfyui_url,
            });
        }

        let comfyui_ws_url = lookup("COMFYUI_WS_URL")
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .unwrap_or_else(|| derive_ws_url(&comfyui_url));

        let number = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };

        let poll_interval_secs =
            number("POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS).clamp(1, MAX_DURATION_SECS);
        let sweep_interval_secs =
            number("SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS).clamp(1, MAX_DURATION_SECS);

        Ok(Self {
            comfyui_url,
            comfyui_ws_url,
            workflow_dir: lookup("WORKFLOW_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKFLOW_DIR)),
            job_timeout: Duration::from_secs(
                number("JOB_TIMEOUT_SECS", DEFAULT_JOB_TIMEOUT_SECS).min(MAX_DURATION_SECS),
            ),
            poll_interval: Duration::from_secs(poll_interval_secs),
            retention: Duration::from_secs(
                number("TASK_RETENTION_HOURS", DEFAULT_RETENTION_HOURS).saturating_mul(3600),
            ),
            sweep_interval: Duration::from_secs(sweep_interval_secs),
            max_batch_size: lookup("MAX_BATCH_SIZE")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_MAX_BATCH_SIZE)
                .max(1),
        })
    }
}

fn is_http_url(url: &str) -> bool {
    match reqwest::Url::parse(url) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https") && parsed.has_host(),
        Err(_) => false,
    }
}

/// `http://host` -> `ws://host`, `https://host` -> `wss://host`.
fn derive_ws_url(http_url: &str) -> String {
    if let Some(rest) = http_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = http_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        http_url.to_string()
    }
}
