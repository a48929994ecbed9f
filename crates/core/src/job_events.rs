//! Message type constants for task update fan-out.
//!
//! Carried in the `type` field of every serialized task update so that
//! subscribers (WebSocket bridges, CLIs) can dispatch without inspecting
//! the rest of the payload.

/// Progress update while the external job is running.
pub const MSG_TYPE_JOB_PROGRESS: &str = "job_progress";

/// Task reached `COMPLETED`.
pub const MSG_TYPE_JOB_COMPLETED: &str = "job_completed";

/// Task reached `FAILED` (explicit error, timeout, or local failure).
pub const MSG_TYPE_JOB_FAILED: &str = "job_failed";
