//! Interpretation of `GET /history/{prompt_id}` responses.
//!
//! The endpoint answers `{}` until the prompt has run. Afterwards the
//! record is keyed by prompt id and carries `outputs` plus a `status`
//! block with `status_str`, `completed` and the execution `messages`.

use serde_json::Value;

/// What the history endpoint says about one prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryStatus {
    /// No record yet: queued, running, or unknown to the server.
    Pending,
    Succeeded { outputs: Value },
    Failed { reason: String },
}

impl HistoryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HistoryStatus::Pending)
    }
}

const STATUS_SUCCESS: &str = "success";
const STATUS_ERROR: &str = "error";

/// Interpret a history response for `prompt_id`.
///
/// Accepts both the keyed form and a bare record (some proxies unwrap it).
pub fn parse_history(prompt_id: &str, history: &Value) -> HistoryStatus {
    let entry = match history.get(prompt_id) {
        Some(entry) => entry,
        None if history.get("outputs").is_some() || history.get("status").is_some() => history,
        None => return HistoryStatus::Pending,
    };

    let outputs = entry
        .get("outputs")
        .cloned()
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    let status = entry.get("status");
    let status_str = status
        .and_then(|s| s.get("status_str"))
        .and_then(Value::as_str);
    let completed = status
        .and_then(|s| s.get("completed"))
        .and_then(Value::as_bool);

    match status_str {
        Some(STATUS_ERROR) => HistoryStatus::Failed {
            reason: failure_reason(status),
        },
        Some(STATUS_SUCCESS) => HistoryStatus::Succeeded { outputs },
        _ if completed == Some(true) => HistoryStatus::Succeeded { outputs },
        // Servers predating the status block only list finished prompts.
        _ if status.is_none() && has_entries(&outputs) => HistoryStatus::Succeeded { outputs },
        _ => HistoryStatus::Pending,
    }
}

fn has_entries(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        _ => false,
    }
}

/// Pull a readable reason out of the `messages` list, which holds
/// `[event_name, payload]` pairs.
fn failure_reason(status: Option<&Value>) -> String {
    let messages = status
        .and_then(|s| s.get("messages"))
        .and_then(Value::as_array);

    for msg in messages.into_iter().flatten() {
        let Some(pair) = msg.as_array() else { continue };
        match pair.first().and_then(Value::as_str) {
            Some("execution_error") => {
                let payload = pair.get(1);
                let text = |key: &str| {
                    payload
                        .and_then(|p| p.get(key))
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                };
                if let Some(message) = text("exception_message").or_else(|| text("exception_type")) {
                    return message.trim().to_string();
                }
            }
            Some("execution_interrupted") => return "execution interrupted".to_string(),
            _ => {}
        }
    }
    "execution failed".to_string()
}
