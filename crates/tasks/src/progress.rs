//! Progress aggregation.
//!
//! ComfyUI reports step progress for every node that loops (samplers,
//! upscalers, VAE tiling...). Only the steps recorded on the task at
//! submission count, and each accepted event becomes a percentage of its
//! own `max`. Monotonicity is enforced by the registry, which folds new
//! values with the current one.

use std::collections::HashSet;

use stylize_core::task::{clamp_progress, TaskRecord, TaskStatus};

/// Whether an event from `step_id` counts toward task progress.
///
/// An empty relevant set accepts everything. An event without a step id
/// is rejected when the set is non-empty, since it cannot be attributed.
pub fn is_relevant(step_id: Option<&str>, relevant: &HashSet<String>) -> bool {
    if relevant.is_empty() {
        return true;
    }
    step_id.is_some_and(|step| relevant.contains(step))
}

/// `value / max` as a percentage in `[0, 100]`; `None` when `max <= 0`.
pub fn percent(value: i64, max: i64) -> Option<f64> {
    if max <= 0 {
        return None;
    }
    Some(clamp_progress(value as f64 / max as f64 * 100.0))
}

/// Percentage to record for `record`, or `None` when the event must be
/// discarded.
pub fn aggregate(record: &TaskRecord, step_id: Option<&str>, value: i64, max: i64) -> Option<f64> {
    if record.status != TaskStatus::Processing {
        return None;
    }
    if !is_relevant(step_id, &record.relevant_step_ids) {
        return None;
    }
    percent(value, max)
}
