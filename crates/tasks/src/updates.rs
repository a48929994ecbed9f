//! Fan-out of task state changes to external subscribers.
//!
//! [`UpdateBus`] wraps a `tokio::sync::broadcast` channel. It is separate
//! from the push channel to ComfyUI: this is what callers (WebSocket
//! bridges, the CLI) subscribe to.

use serde::Serialize;
use stylize_core::job_events::{MSG_TYPE_JOB_COMPLETED, MSG_TYPE_JOB_FAILED, MSG_TYPE_JOB_PROGRESS};
use stylize_core::task::{TaskRecord, TaskStatus};
use stylize_core::types::{TaskId, Timestamp};
use tokio::sync::broadcast;

/// One observable change to a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskUpdate {
    /// One of the `MSG_TYPE_JOB_*` constants.
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub task_id: TaskId,
    pub owner: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub output_reference: Option<String>,
    pub error_detail: Option<String>,
    pub timestamp: Timestamp,
}

impl TaskUpdate {
    pub fn from_record(record: &TaskRecord) -> Self {
        let kind = match record.status {
            TaskStatus::Completed => MSG_TYPE_JOB_COMPLETED,
            TaskStatus::Failed => MSG_TYPE_JOB_FAILED,
            TaskStatus::Pending | TaskStatus::Processing => MSG_TYPE_JOB_PROGRESS,
        };
        Self {
            kind,
            task_id: record.task_id,
            owner: record.owner.clone(),
            status: record.status,
            progress: record.progress,
            output_reference: record.output_reference.clone(),
            error_detail: record.error_detail.clone(),
            timestamp: record.updated_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

pub struct UpdateBus {
    sender: broadcast::Sender<TaskUpdate>,
}

impl UpdateBus {
    /// Slow receivers beyond `capacity` observe `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to all current subscribers; silently dropped when there are none.
    pub fn publish(&self, update: TaskUpdate) {
        let _ = self.sender.send(update);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskUpdate> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for UpdateBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
