//! Shared lifecycle predicates used by the query layer and the service.
//!
//! Centralizes the transition graph, the clock-skew-safe completion
//! timestamp rule, and the attempt duration derivation so that every
//! commit point applies the same invariants.

use chrono::{DateTime, Utc};

use crate::models::{TaskExecution, TaskStatus};

/// The task lifecycle graph.
///
/// ```text
/// pending -> queued          (enqueue)
/// queued  -> running         (worker picked up)
/// running -> completed
/// running -> failed
/// failed  -> queued          (retry: new attempt)
/// pending | queued | running -> cancelled   (user-initiated force)
/// ```
pub struct TaskLifecycle;

impl TaskLifecycle {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the lifecycle graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        matches!(
            (from, to),
            (TaskStatus::Pending, TaskStatus::Queued)
                | (TaskStatus::Queued, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Failed, TaskStatus::Queued)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Queued, TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Cancelled)
        )
    }
}

/// Resolve the completion timestamp for a finishing attempt.
///
/// Always `max(now, started_at)`: the `valid_execution_time` constraint
/// requires `completed_at >= started_at`, and wall clocks are not
/// guaranteed monotone across processes.
pub fn resolve_completed_at(
    now: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    match started_at {
        Some(started) if started > now => started,
        _ => now,
    }
}

/// Attempt duration in milliseconds, when both endpoints are known.
pub fn duration_ms(
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
) -> Option<i32> {
    match (started_at, completed_at) {
        (Some(started), Some(completed)) => {
            let ms = completed.signed_duration_since(started).num_milliseconds();
            Some(ms.clamp(0, i32::MAX as i64) as i32)
        }
        _ => None,
    }
}

/// Whether `dispatch_id` identifies the latest attempt.
///
/// Worker callbacks carrying any other dispatch id are stale -- a retry has
/// superseded their attempt -- and must become no-ops.
pub fn is_latest_dispatch(latest: &TaskExecution, dispatch_id: &str) -> bool {
    latest.dispatch_id.as_deref() == Some(dispatch_id)
}
