//! Normalised events produced by the push-channel listener.
//!
//! The listener folds ComfyUI's chatty message stream into these few
//! variants before handing them across to the task side.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PushEvent {
    /// The push channel is (re)established.
    Connected { client_id: String },

    /// The push channel dropped; reconnection is under way.
    Disconnected,

    /// Step progress for one node of a prompt.
    Progress {
        prompt_id: String,
        node: Option<String>,
        value: i64,
        max: i64,
    },

    /// The prompt finished. `outputs` is nested by node id.
    Completed {
        prompt_id: String,
        outputs: serde_json::Value,
    },

    /// The prompt failed or was interrupted.
    Failed { prompt_id: String, reason: String },
}

impl PushEvent {
    /// External job id the event refers to, if any.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            PushEvent::Progress { prompt_id, .. }
            | PushEvent::Completed { prompt_id, .. }
            | PushEvent::Failed { prompt_id, .. } => Some(prompt_id),
            PushEvent::Connected { .. } | PushEvent::Disconnected => None,
        }
    }
}
