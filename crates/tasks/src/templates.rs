//! Job template library.
//!
//! Templates are ComfyUI API-format graphs stored as
//! `<WORKFLOW_DIR>/<name>.json`. Each is validated on first load and
//! cached. The `style_change` template ships with the crate and is used
//! when no file of that name exists.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use stylize_core::error::CoreError;
use stylize_core::workflow::parse_workflow;
use tokio::sync::RwLock;

/// Name of the built-in template.
pub const BUILTIN_TEMPLATE: &str = "style_change";

const BUILTIN_STYLE_CHANGE: &str = include_str!("../templates/style_change.json");

/// Maximum length of a template name.
const MAX_TEMPLATE_NAME_LENGTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Invalid template name '{0}'")]
    InvalidName(String),

    #[error("Template '{0}' not found")]
    NotFound(String),

    #[error("Failed to read template '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Template '{name}' is not valid JSON: {source}")]
    Json {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Template '{name}' is not a valid job graph: {source}")]
    Invalid {
        name: String,
        #[source]
        source: CoreError,
    },
}

pub struct TemplateLibrary {
    dir: PathBuf,
    cache: RwLock<HashMap<String, Arc<Value>>>,
}

impl TemplateLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load (or fetch from cache) the template called `name`.
    pub async fn load(&self, name: &str) -> Result<Arc<Value>, TemplateError> {
        validate_name(name)?;

        if let Some(cached) = self.cache.read().await.get(name) {
            return Ok(Arc::clone(cached));
        }

        let path = self.dir.join(format!("{name}.json"));
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if name != BUILTIN_TEMPLATE {
                    return Err(TemplateError::NotFound(name.to_string()));
                }
                tracing::debug!(path = %path.display(), "Using built-in template");
                BUILTIN_STYLE_CHANGE.to_string()
            }
            Err(source) => {
                return Err(TemplateError::Io {
                    name: name.to_string(),
                    source,
                })
            }
        };

        let template = Arc::new(parse_template(name, &raw)?);
        tracing::info!(template = %name, "Loaded job template");

        self.cache
            .write()
            .await
            .insert(name.to_string(), Arc::clone(&template));
        Ok(template)
    }

    /// Drop every cached template so the next load rereads disk.
    pub async fn invalidate(&self) {
        self.cache.write().await.clear();
    }
}

fn validate_name(name: &str) -> Result<(), TemplateError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_TEMPLATE_NAME_LENGTH
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(TemplateError::InvalidName(name.to_string()))
    }
}

fn parse_template(name: &str, raw: &str) -> Result<Value, TemplateError> {
    let value: Value = serde_json::from_str(raw).map_err(|source| TemplateError::Json {
        name: name.to_string(),
        source,
    })?;
    parse_workflow(&value).map_err(|source| TemplateError::Invalid {
        name: name.to_string(),
        source,
    })?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn builtin_used_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let library = TemplateLibrary::new(dir.path());
        let template = library.load(BUILTIN_TEMPLATE).await.unwrap();
        assert_eq!(template["5"]["class_type"], "KSampler");
        assert_eq!(template["8"]["inputs"]["filename_prefix"], "style_transform");
    }

    #[tokio::test]
    async fn file_overrides_builtin() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("style_change.json"),
            r#"{"1": {"class_type": "LoadImage", "inputs": {"image": "x.png"}}}"#,
        )
        .await
        .unwrap();
        let library = TemplateLibrary::new(dir.path());
        let template = library.load("style_change").await.unwrap();
        assert!(template.get("5").is_none());
    }

    #[tokio::test]
    async fn unknown_template_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let library = TemplateLibrary::new(dir.path());
        assert_matches!(library.load("portrait").await, Err(TemplateError::NotFound(_)));
    }

    #[tokio::test]
    async fn path_traversal_rejected() {
        let library = TemplateLibrary::new("workflows");
        assert_matches!(library.load("../secrets").await, Err(TemplateError::InvalidName(_)));
        assert_matches!(library.load("").await, Err(TemplateError::InvalidName(_)));
    }

    #[tokio::test]
    async fn invalid_graph_rejected() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("broken.json"), r#"{"1": {"inputs": {}}}"#)
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("garbled.json"), "{").await.unwrap();
        let library = TemplateLibrary::new(dir.path());
        assert_matches!(library.load("broken").await, Err(TemplateError::Invalid { .. }));
        assert_matches!(library.load("garbled").await, Err(TemplateError::Json { .. }));
    }

    #[tokio::test]
    async fn cached_until_invalidated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");
        tokio::fs::write(&path, r#"{"1": {"class_type": "A"}}"#).await.unwrap();
        let library = TemplateLibrary::new(dir.path());
        library.load("t").await.unwrap();

        tokio::fs::write(&path, r#"{"1": {"class_type": "B"}}"#).await.unwrap();
        assert_eq!(library.load("t").await.unwrap()["1"]["class_type"], "A");

        library.invalidate().await;
        assert_eq!(library.load("t").await.unwrap()["1"]["class_type"], "B");
    }
}
