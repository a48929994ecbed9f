//! Task records and the task state machine.
//!
//! A [`TaskRecord`] is mutated only through [`TaskRecord::apply`], which
//! enforces the lifecycle rules every task store must honour:
//!
//! ```text
//! PENDING ──► PROCESSING ──► COMPLETED
//!    │             │
//!    └─────────────┴───────► FAILED
//! ```
//!
//! Terminal records absorb every further patch without change.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{TaskId, Timestamp};

/// Upper bound of the progress percentage.
pub const PROGRESS_MAX: f64 = 100.0;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Status moves reachable from `self`, excluding the same-status move.
    pub fn valid_transitions(self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Pending => &[TaskStatus::Processing, TaskStatus::Failed],
            TaskStatus::Processing => &[TaskStatus::Completed, TaskStatus::Failed],
            TaskStatus::Completed | TaskStatus::Failed => &[],
        }
    }

    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        self == to || self.valid_transitions().contains(&to)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One caller-visible unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub owner: String,
    pub external_job_id: Option<String>,
    pub status: TaskStatus,
    pub progress: f64,
    /// Step ids whose progress events count toward `progress`. Empty means
    /// every step counts.
    pub relevant_step_ids: HashSet<String>,
    pub output_reference: Option<String>,
    pub error_detail: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

impl TaskRecord {
    pub fn new(task_id: TaskId, owner: impl Into<String>, now: Timestamp) -> Self {
        Self {
            task_id,
            owner: owner.into(),
            external_job_id: None,
            status: TaskStatus::Pending,
            progress: 0.0,
            relevant_step_ids: HashSet::new(),
            output_reference: None,
            error_detail: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply `patch` in place.
    ///
    /// Returns `Ok(true)` when any field changed, `Ok(false)` when the patch
    /// was absorbed (terminal record, stale progress, repeated values). A
    /// rejected patch leaves the record untouched.
    pub fn apply(&mut self, patch: &TaskPatch, now: Timestamp) -> Result<bool, PatchRejection> {
        if self.is_terminal() {
            return Ok(false);
        }

        let target = patch.status.unwrap_or(self.status);
        if !self.status.can_transition_to(target) {
            return Err(PatchRejection::InvalidTransition {
                from: self.status,
                to: target,
            });
        }

        let assigns_job_id = match (&self.external_job_id, &patch.external_job_id) {
            (Some(existing), Some(requested)) if existing != requested => {
                return Err(PatchRejection::JobIdConflict {
                    existing: existing.clone(),
                    requested: requested.clone(),
                });
            }
            (None, Some(_)) => true,
            _ => false,
        };

        if patch.relevant_step_ids.is_some() && !assigns_job_id {
            return Err(PatchRejection::StepsAfterSubmission);
        }
        if patch.output_reference.is_some() && target != TaskStatus::Completed {
            return Err(PatchRejection::MisplacedField("output_reference"));
        }
        if patch.error_detail.is_some() && target != TaskStatus::Failed {
            return Err(PatchRejection::MisplacedField("error_detail"));
        }

        let mut changed = false;

        if assigns_job_id {
            self.external_job_id = patch.external_job_id.clone();
            if let Some(steps) = &patch.relevant_step_ids {
                self.relevant_step_ids = steps.clone();
            }
            changed = true;
        }

        if target == TaskStatus::Processing {
            if let Some(p) = patch.progress {
                let p = clamp_progress(p);
                if p > self.progress {
                    self.progress = p;
                    changed = true;
                }
            }
        }

        if target != self.status {
            self.status = target;
            changed = true;
            match target {
                TaskStatus::Completed => {
                    self.progress = PROGRESS_MAX;
                    self.output_reference = patch.output_reference.clone();
                    self.completed_at = Some(now);
                }
                TaskStatus::Failed => {
                    self.error_detail = patch.error_detail.clone();
                    self.completed_at = Some(now);
                }
                TaskStatus::Pending | TaskStatus::Processing => {}
            }
        }

        if changed {
            self.updated_at = now;
        }
        Ok(changed)
    }
}

/// Clamp a raw percentage into `[0, 100]`; NaN maps to 0.
pub fn clamp_progress(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, PROGRESS_MAX)
    }
}

// ---------------------------------------------------------------------------
// Patch
// ---------------------------------------------------------------------------

/// Partial update of a [`TaskRecord`]. `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub external_job_id: Option<String>,
    pub relevant_step_ids: Option<HashSet<String>>,
    pub progress: Option<f64>,
    pub output_reference: Option<String>,
    pub error_detail: Option<String>,
}

impl TaskPatch {
    /// Submission accepted: record the job id and steps, move to PROCESSING.
    pub fn tracking(external_job_id: impl Into<String>, steps: HashSet<String>) -> Self {
        Self {
            status: Some(TaskStatus::Processing),
            external_job_id: Some(external_job_id.into()),
            relevant_step_ids: Some(steps),
            ..Default::default()
        }
    }

    pub fn progress(percent: f64) -> Self {
        Self {
            progress: Some(percent),
            ..Default::default()
        }
    }

    pub fn completed(output_reference: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Completed),
            output_reference: Some(output_reference.into()),
            ..Default::default()
        }
    }

    pub fn failed(error_detail: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            error_detail: Some(error_detail.into()),
            ..Default::default()
        }
    }
}

/// Why a patch was refused outright.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PatchRejection {
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("External job id already set to '{existing}', refusing '{requested}'")]
    JobIdConflict { existing: String, requested: String },

    #[error("Relevant step ids can only be set with the first external job id")]
    StepsAfterSubmission,

    #[error("Field '{0}' does not match the requested status")]
    MisplacedField(&'static str),
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Snapshot counters over a task store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub total_tasks: usize,
    pub total_owners: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskStats {
    pub fn count(&mut self, status: TaskStatus) {
        self.total_tasks += 1;
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Processing => self.processing += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::{Duration, Utc};

    fn record() -> TaskRecord {
        TaskRecord::new(TaskId::new_v4(), "alice", Utc::now())
    }

    fn steps(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn processing() -> TaskRecord {
        let mut r = record();
        r.apply(&TaskPatch::tracking("job_42", steps(&["5"])), Utc::now())
            .unwrap();
        r
    }

    // -----------------------------------------------------------------------
    // Status transitions
    // -----------------------------------------------------------------------

    #[test]
    fn pending_moves_to_processing_or_failed() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn processing_moves_to_terminal() {
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Processing.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        assert!(TaskStatus::Completed.valid_transitions().is_empty());
        assert!(TaskStatus::Failed.valid_transitions().is_empty());
    }

    // -----------------------------------------------------------------------
    // apply
    // -----------------------------------------------------------------------

    #[test]
    fn tracking_sets_job_id_and_steps() {
        let r = processing();
        assert_eq!(r.status, TaskStatus::Processing);
        assert_eq!(r.external_job_id.as_deref(), Some("job_42"));
        assert_eq!(r.relevant_step_ids, steps(&["5"]));
    }

    #[test]
    fn job_id_is_set_once() {
        let mut r = processing();
        let err = r
            .apply(&TaskPatch::tracking("job_43", HashSet::new()), Utc::now())
            .unwrap_err();
        assert_matches!(err, PatchRejection::JobIdConflict { .. });
        assert_eq!(r.external_job_id.as_deref(), Some("job_42"));
    }

    #[test]
    fn steps_cannot_change_after_submission() {
        let mut r = processing();
        let patch = TaskPatch {
            relevant_step_ids: Some(steps(&["9"])),
            ..Default::default()
        };
        assert_matches!(
            r.apply(&patch, Utc::now()),
            Err(PatchRejection::StepsAfterSubmission)
        );
    }

    #[test]
    fn progress_is_clamped_and_monotone() {
        let mut r = processing();
        assert!(r.apply(&TaskPatch::progress(40.0), Utc::now()).unwrap());
        assert!(!r.apply(&TaskPatch::progress(30.0), Utc::now()).unwrap());
        assert_eq!(r.progress, 40.0);
        r.apply(&TaskPatch::progress(250.0), Utc::now()).unwrap();
        assert_eq!(r.progress, 100.0);
    }

    #[test]
    fn progress_ignored_while_pending() {
        let mut r = record();
        assert!(!r.apply(&TaskPatch::progress(50.0), Utc::now()).unwrap());
        assert_eq!(r.progress, 0.0);
    }

    #[test]
    fn completion_forces_full_progress() {
        let mut r = processing();
        r.apply(&TaskPatch::progress(10.0), Utc::now()).unwrap();
        let now = Utc::now();
        assert!(r.apply(&TaskPatch::completed("img_out.png"), now).unwrap());
        assert_eq!(r.status, TaskStatus::Completed);
        assert_eq!(r.progress, 100.0);
        assert_eq!(r.output_reference.as_deref(), Some("img_out.png"));
        assert_eq!(r.completed_at, Some(now));
    }

    #[test]
    fn failure_keeps_last_progress() {
        let mut r = processing();
        r.apply(&TaskPatch::progress(35.0), Utc::now()).unwrap();
        r.apply(&TaskPatch::failed("boom"), Utc::now()).unwrap();
        assert_eq!(r.status, TaskStatus::Failed);
        assert_eq!(r.progress, 35.0);
        assert_eq!(r.error_detail.as_deref(), Some("boom"));
        assert!(r.output_reference.is_none());
    }

    #[test]
    fn terminal_record_absorbs_everything() {
        let mut r = processing();
        r.apply(&TaskPatch::completed("a.png"), Utc::now()).unwrap();
        let before = r.clone();

        let later = Utc::now() + Duration::seconds(5);
        assert!(!r.apply(&TaskPatch::failed("late"), later).unwrap());
        assert!(!r.apply(&TaskPatch::completed("b.png"), later).unwrap());
        assert!(!r.apply(&TaskPatch::progress(1.0), later).unwrap());
        assert_eq!(r, before);
    }

    #[test]
    fn completion_from_pending_is_rejected() {
        let mut r = record();
        assert_matches!(
            r.apply(&TaskPatch::completed("x.png"), Utc::now()),
            Err(PatchRejection::InvalidTransition {
                from: TaskStatus::Pending,
                to: TaskStatus::Completed
            })
        );
        assert_eq!(r.status, TaskStatus::Pending);
    }

    #[test]
    fn output_requires_completed_status() {
        let mut r = processing();
        let patch = TaskPatch {
            output_reference: Some("x.png".into()),
            ..Default::default()
        };
        assert_matches!(
            r.apply(&patch, Utc::now()),
            Err(PatchRejection::MisplacedField("output_reference"))
        );
    }

    #[test]
    fn local_failure_from_pending() {
        let mut r = record();
        assert!(r.apply(&TaskPatch::failed("untracked"), Utc::now()).unwrap());
        assert_eq!(r.status, TaskStatus::Failed);
    }

    #[test]
    fn nan_progress_clamps_to_zero() {
        assert_eq!(clamp_progress(f64::NAN), 0.0);
        assert_eq!(clamp_progress(-3.0), 0.0);
    }

    #[test]
    fn stats_count_by_status() {
        let mut stats = TaskStats::default();
        stats.count(TaskStatus::Pending);
        stats.count(TaskStatus::Failed);
        stats.count(TaskStatus::Failed);
        assert_eq!(stats.total_tasks, 3);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.pending, 1);
    }
}
