//! Task storage and the external-job correlation index.
//!
//! [`TaskStore`] is the contract the rest of the crate codes against.
//! [`TaskRegistry`] is the in-memory implementation: one `RwLock` guards
//! the task map, the owner index and the correlation index together, so
//! assigning an external job id and making it resolvable happen in the
//! same critical section.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use stylize_core::task::{PatchRejection, TaskPatch, TaskRecord, TaskStats, TaskStatus};
use stylize_core::types::{TaskId, Timestamp};
use tokio::sync::RwLock;

/// Default page size for [`TaskStore::list_by_owner`].
pub const DEFAULT_LIST_LIMIT: usize = 50;

/// Result of a successful [`TaskStore::update`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The patch changed the record; carries the new state.
    Applied(TaskRecord),
    /// The patch was absorbed without change (terminal record, stale
    /// progress, repeated values); carries the current state.
    Unchanged(TaskRecord),
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied(_))
    }

    pub fn record(&self) -> &TaskRecord {
        match self {
            UpdateOutcome::Applied(r) | UpdateOutcome::Unchanged(r) => r,
        }
    }

    pub fn into_record(self) -> TaskRecord {
        match self {
            UpdateOutcome::Applied(r) | UpdateOutcome::Unchanged(r) => r,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Task {0} not found")]
    NotFound(TaskId),

    #[error("Task {task_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {task_id}: {reason}")]
    Conflict { task_id: TaskId, reason: String },

    #[error("Task {task_id}: {reason}")]
    InvalidPatch { task_id: TaskId, reason: String },

    /// The backing store cannot serve requests right now. Never produced
    /// by the in-memory registry.
    #[error("Task store unavailable: {0}")]
    Unavailable(String),
}

impl RegistryError {
    fn from_rejection(task_id: TaskId, rejection: PatchRejection) -> Self {
        match rejection {
            PatchRejection::InvalidTransition { from, to } => {
                RegistryError::InvalidTransition { task_id, from, to }
            }
            PatchRejection::JobIdConflict { .. } => RegistryError::Conflict {
                task_id,
                reason: rejection.to_string(),
            },
            PatchRejection::StepsAfterSubmission | PatchRejection::MisplacedField(_) => {
                RegistryError::InvalidPatch {
                    task_id,
                    reason: rejection.to_string(),
                }
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, RegistryError::Unavailable(_))
    }
}

/// Storage contract for task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create a `PENDING` record for `owner`.
    async fn create(&self, owner: &str) -> Result<TaskRecord, RegistryError>;

    async fn get(&self, task_id: TaskId) -> Result<TaskRecord, RegistryError>;

    /// Apply `patch` under the task state machine. Terminal records absorb
    /// every patch and report [`UpdateOutcome::Unchanged`].
    async fn update(&self, task_id: TaskId, patch: TaskPatch)
        -> Result<UpdateOutcome, RegistryError>;

    /// Map an external job id to its task.
    async fn resolve(&self, external_job_id: &str) -> Result<Option<TaskId>, RegistryError>;

    /// Newest first, at most `limit` records.
    async fn list_by_owner(&self, owner: &str, limit: usize)
        -> Result<Vec<TaskRecord>, RegistryError>;

    /// Remove records created more than `age` ago. Returns how many went.
    async fn sweep_older_than(&self, age: Duration) -> Result<usize, RegistryError>;

    async fn stats(&self) -> Result<TaskStats, RegistryError>;
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, TaskRecord>,
    by_owner: HashMap<String, HashSet<TaskId>>,
    by_job: HashMap<String, TaskId>,
}

impl Inner {
    fn remove(&mut self, task_id: TaskId) -> Option<TaskRecord> {
        let record = self.tasks.remove(&task_id)?;
        if let Some(ids) = self.by_owner.get_mut(&record.owner) {
            ids.remove(&task_id);
            if ids.is_empty() {
                self.by_owner.remove(&record.owner);
            }
        }
        if let Some(job) = &record.external_job_id {
            self.by_job.remove(job);
        }
        Some(record)
    }
}

/// In-memory [`TaskStore`]. State lives for the process lifetime only.
#[derive(Default)]
pub struct TaskRegistry {
    inner: RwLock<Inner>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every record created strictly before `cutoff`.
    pub async fn sweep_created_before(&self, cutoff: Timestamp) -> usize {
        let mut inner = self.inner.write().await;
        let expired: Vec<TaskId> = inner
            .tasks
            .values()
            .filter(|r| r.created_at < cutoff)
            .map(|r| r.task_id)
            .collect();
        for task_id in &expired {
            inner.remove(*task_id);
        }
        expired.len()
    }
}

#[async_trait]
impl TaskStore for TaskRegistry {
    async fn create(&self, owner: &str) -> Result<TaskRecord, RegistryError> {
        let record = TaskRecord::new(TaskId::new_v4(), owner, Utc::now());
        let mut inner = self.inner.write().await;
        inner
            .by_owner
            .entry(record.owner.clone())
            .or_default()
            .insert(record.task_id);
        inner.tasks.insert(record.task_id, record.clone());
        tracing::debug!(task_id = %record.task_id, owner = %record.owner, "Task created");
        Ok(record)
    }

    async fn get(&self, task_id: TaskId) -> Result<TaskRecord, RegistryError> {
        self.inner
            .read()
            .await
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or(RegistryError::NotFound(task_id))
    }

    async fn update(
        &self,
        task_id: TaskId,
        patch: TaskPatch,
    ) -> Result<UpdateOutcome, RegistryError> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;

        let Some(record) = inner.tasks.get_mut(&task_id) else {
            tracing::warn!(task_id = %task_id, "Update for unknown task");
            return Err(RegistryError::NotFound(task_id));
        };

        if !record.is_terminal() {
            if let Some(job) = &patch.external_job_id {
                if let Some(other) = inner.by_job.get(job).filter(|other| **other != task_id) {
                    return Err(RegistryError::Conflict {
                        task_id,
                        reason: format!("external job id '{job}' already tracked by task {other}"),
                    });
                }
            }
        }

        let had_job = record.external_job_id.is_some();
        let changed = record
            .apply(&patch, Utc::now())
            .map_err(|e| RegistryError::from_rejection(task_id, e))?;
        let snapshot = record.clone();

        if !had_job {
            if let Some(job) = &snapshot.external_job_id {
                inner.by_job.insert(job.clone(), task_id);
            }
        }

        if changed {
            Ok(UpdateOutcome::Applied(snapshot))
        } else {
            Ok(UpdateOutcome::Unchanged(snapshot))
        }
    }

    async fn resolve(&self, external_job_id: &str) -> Result<Option<TaskId>, RegistryError> {
        Ok(self.inner.read().await.by_job.get(external_job_id).copied())
    }

    async fn list_by_owner(
        &self,
        owner: &str,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, RegistryError> {
        let inner = self.inner.read().await;
        let mut records: Vec<TaskRecord> = inner
            .by_owner
            .get(owner)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.tasks.get(id).cloned())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn sweep_older_than(&self, age: Duration) -> Result<usize, RegistryError> {
        let Some(cutoff) = chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(0);
        };
        Ok(self.sweep_created_before(cutoff).await)
    }

    async fn stats(&self) -> Result<TaskStats, RegistryError> {
        let inner = self.inner.read().await;
        let mut stats = TaskStats {
            total_owners: inner.by_owner.len(),
            ..Default::default()
        };
        for record in inner.tasks.values() {
            stats.count(record.status);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn steps(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn create_then_get() {
        let registry = TaskRegistry::new();
        let created = registry.create("alice").await.unwrap();
        let fetched = registry.get(created.task_id).await.unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let registry = TaskRegistry::new();
        let id = TaskId::new_v4();
        assert_matches!(registry.get(id).await, Err(RegistryError::NotFound(missing)) if missing == id);
    }

    #[tokio::test]
    async fn update_unknown_is_not_found() {
        let registry = TaskRegistry::new();
        assert_matches!(
            registry.update(TaskId::new_v4(), TaskPatch::progress(5.0)).await,
            Err(RegistryError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn tracking_makes_job_resolvable() {
        let registry = TaskRegistry::new();
        let task = registry.create("alice").await.unwrap();
        assert_eq!(registry.resolve("job_42").await.unwrap(), None);

        let outcome = registry
            .update(task.task_id, TaskPatch::tracking("job_42", steps(&["B"])))
            .await
            .unwrap();
        assert!(outcome.is_applied());
        assert_eq!(registry.resolve("job_42").await.unwrap(), Some(task.task_id));
    }

    #[tokio::test]
    async fn job_id_cannot_be_shared_between_tasks() {
        let registry = TaskRegistry::new();
        let a = registry.create("alice").await.unwrap();
        let b = registry.create("alice").await.unwrap();
        registry
            .update(a.task_id, TaskPatch::tracking("job_42", HashSet::new()))
            .await
            .unwrap();

        let err = registry
            .update(b.task_id, TaskPatch::tracking("job_42", HashSet::new()))
            .await
            .unwrap_err();
        assert_matches!(err, RegistryError::Conflict { .. });
        assert_eq!(registry.resolve("job_42").await.unwrap(), Some(a.task_id));
        assert!(registry.get(b.task_id).await.unwrap().external_job_id.is_none());
    }

    #[tokio::test]
    async fn terminal_update_is_unchanged() {
        let registry = TaskRegistry::new();
        let task = registry.create("alice").await.unwrap();
        registry
            .update(task.task_id, TaskPatch::tracking("job_1", HashSet::new()))
            .await
            .unwrap();
        registry
            .update(task.task_id, TaskPatch::completed("out.png"))
            .await
            .unwrap();

        let outcome = registry
            .update(task.task_id, TaskPatch::failed("late failure"))
            .await
            .unwrap();
        assert_matches!(outcome, UpdateOutcome::Unchanged(ref r)
            if r.status == TaskStatus::Completed && r.output_reference.as_deref() == Some("out.png"));
        assert!(outcome.record().error_detail.is_none());
    }

    #[tokio::test]
    async fn invalid_transition_reported() {
        let registry = TaskRegistry::new();
        let task = registry.create("alice").await.unwrap();
        assert_matches!(
            registry.update(task.task_id, TaskPatch::completed("x.png")).await,
            Err(RegistryError::InvalidTransition { from: TaskStatus::Pending, to: TaskStatus::Completed, .. })
        );
    }

    #[tokio::test]
    async fn list_by_owner_newest_first_with_limit() {
        let registry = TaskRegistry::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(registry.create("alice").await.unwrap().task_id);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        registry.create("bob").await.unwrap();

        let listed = registry.list_by_owner("alice", 2).await.unwrap();
        let listed_ids: Vec<TaskId> = listed.iter().map(|r| r.task_id).collect();
        assert_eq!(listed_ids, vec![ids[2], ids[1]]);
        assert!(registry.list_by_owner("carol", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_removes_indexes() {
        let registry = TaskRegistry::new();
        let task = registry.create("alice").await.unwrap();
        registry
            .update(task.task_id, TaskPatch::tracking("job_1", HashSet::new()))
            .await
            .unwrap();

        let removed = registry
            .sweep_created_before(Utc::now() + chrono::Duration::seconds(1))
            .await;
        assert_eq!(removed, 1);
        assert_eq!(registry.resolve("job_1").await.unwrap(), None);
        assert!(registry.list_by_owner("alice", 10).await.unwrap().is_empty());
        assert_eq!(registry.stats().await.unwrap().total_owners, 0);
    }

    #[tokio::test]
    async fn sweep_keeps_recent_records() {
        let registry = TaskRegistry::new();
        registry.create("alice").await.unwrap();
        let removed = registry
            .sweep_older_than(Duration::from_secs(24 * 3600))
            .await
            .unwrap();
        assert_eq!(removed, 0);
        assert_eq!(registry.stats().await.unwrap().total_tasks, 1);
    }

    #[tokio::test]
    async fn stats_count_owners_and_statuses() {
        let registry = TaskRegistry::new();
        let a = registry.create("alice").await.unwrap();
        registry.create("alice").await.unwrap();
        registry.create("bob").await.unwrap();
        registry
            .update(a.task_id, TaskPatch::failed("upload refused"))
            .await
            .unwrap();

        let stats = registry.stats().await.unwrap();
        assert_eq!(stats.total_tasks, 3);
        assert_eq!(stats.total_owners, 2);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.failed, 1);
    }
}
