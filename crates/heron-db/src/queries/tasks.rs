//! Database query functions for the `tasks` table and its coupled
//! `task_executions` transitions.
//!
//! Every state-mutating function opens a transaction, takes a row-level
//! exclusive lock on the task (`SELECT ... FOR UPDATE`), applies the
//! transition to the task row and its attempt row together, and commits
//! before returning. Concurrent worker callbacks for the same task are
//! therefore fully serialized.
//!
//! The `_tx` variants operate inside a caller-owned transaction; the batch
//! creation path uses them to make a multi-task insert all-or-nothing.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::lifecycle::{is_latest_dispatch, resolve_completed_at};
use crate::models::{ExecutionPriority, Task, TaskExecution, TaskStatus};
use crate::queries::executions;

/// Error type recorded on attempts that were cancelled by user request.
pub const ERROR_TYPE_CANCELLED: &str = "TaskCancelled";

/// Fields for a new task row. Server-side defaults fill in id, status,
/// timestamps, and retry counters.
#[derive(Debug, Clone, Default)]
pub struct NewTask<'a> {
    pub name: &'a str,
    pub prompt: &'a str,
    pub priority: Option<ExecutionPriority>,
    pub max_retries: Option<i32>,
    pub execute_after: Option<DateTime<Utc>>,
    pub parent_task_id: Option<Uuid>,
    pub created_by: Option<&'a str>,
    pub metadata: Option<serde_json::Value>,
}

/// Usage metrics reported by the provider for a completed attempt.
#[derive(Debug, Clone, Default)]
pub struct ExecutionUsage {
    pub model_name: Option<String>,
    pub prompt_tokens: Option<i32>,
    pub completion_tokens: Option<i32>,
    pub total_tokens: Option<i32>,
}

// ---------------------------------------------------------------------------
// Create / read
// ---------------------------------------------------------------------------

/// Insert a new task row in `pending` and commit.
pub async fn insert_task(pool: &PgPool, new: &NewTask<'_>) -> Result<Task> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    let task = insert_task_tx(&mut tx, new).await?;
    tx.commit().await.context("failed to commit task insert")?;
    Ok(task)
}

/// Insert a new task row inside a caller-owned transaction.
pub async fn insert_task_tx(tx: &mut Transaction<'_, Postgres>, new: &NewTask<'_>) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks \
             (name, prompt, priority, max_retries, execute_after, parent_task_id, created_by, metadata) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(new.name)
    .bind(new.prompt)
    .bind(new.priority.unwrap_or(ExecutionPriority::Normal))
    .bind(new.max_retries.unwrap_or(3))
    .bind(new.execute_after)
    .bind(new.parent_task_id)
    .bind(new.created_by)
    .bind(
        new.metadata
            .clone()
            .unwrap_or_else(|| serde_json::json!({})),
    )
    .fetch_one(&mut **tx)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Fetch a task by ID with a row-level exclusive lock.
///
/// The lock is held until the enclosing transaction commits or rolls back,
/// serializing every state transition for the task.
pub async fn get_task_for_update(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .context("failed to fetch task for update")?;

    Ok(task)
}

/// List tasks with pagination, optional status filter, and optional
/// case-insensitive substring search over id, name, prompt, output, and
/// error message. Returns the page plus the total matching count.
pub async fn list_tasks(
    pool: &PgPool,
    limit: i64,
    offset: i64,
    status: Option<TaskStatus>,
    query: Option<&str>,
) -> Result<(Vec<Task>, i64)> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE ($1::task_status IS NULL OR status = $1) \
           AND ($2::text IS NULL \
                OR id::text ILIKE '%' || $2 || '%' \
                OR name ILIKE '%' || $2 || '%' \
                OR prompt ILIKE '%' || $2 || '%' \
                OR output ILIKE '%' || $2 || '%' \
                OR error_message ILIKE '%' || $2 || '%') \
         ORDER BY created_at DESC \
         LIMIT $3 OFFSET $4",
    )
    .bind(status)
    .bind(query)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .context("failed to list tasks")?;

    let total: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM tasks \
         WHERE ($1::task_status IS NULL OR status = $1) \
           AND ($2::text IS NULL \
                OR id::text ILIKE '%' || $2 || '%' \
                OR name ILIKE '%' || $2 || '%' \
                OR prompt ILIKE '%' || $2 || '%' \
                OR output ILIKE '%' || $2 || '%' \
                OR error_message ILIKE '%' || $2 || '%')",
    )
    .bind(status)
    .bind(query)
    .fetch_one(pool)
    .await
    .context("failed to count tasks")?;

    Ok((tasks, total))
}

// ---------------------------------------------------------------------------
// Enqueue
// ---------------------------------------------------------------------------

/// Queue a new execution attempt for a task and commit.
///
/// Returns `None` if the task does not exist.
pub async fn enqueue_execution(
    pool: &PgPool,
    task_id: Uuid,
    dispatch_id: &str,
    increment_retry_count: bool,
) -> Result<Option<(Task, TaskExecution)>> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    let result = enqueue_execution_tx(&mut tx, task_id, dispatch_id, increment_retry_count).await?;
    tx.commit().await.context("failed to commit enqueue")?;
    Ok(result)
}

/// Queue a new execution attempt inside a caller-owned transaction.
///
/// In one locked step: computes `max(attempt_number) + 1`, optionally
/// increments the retry counter, resets the task's result fields, sets the
/// task to `queued`, and inserts the attempt row carrying `dispatch_id`.
/// Reading the max inside the same transaction that inserts keeps attempt
/// numbers dense and monotone.
pub async fn enqueue_execution_tx(
    tx: &mut Transaction<'_, Postgres>,
    task_id: Uuid,
    dispatch_id: &str,
    increment_retry_count: bool,
) -> Result<Option<(Task, TaskExecution)>> {
    let Some(task) = get_task_for_update(tx, task_id).await? else {
        return Ok(None);
    };

    let next_attempt: i32 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(attempt_number), 0) + 1 FROM task_executions WHERE task_id = $1",
    )
    .bind(task.id)
    .fetch_one(&mut **tx)
    .await
    .context("failed to compute next attempt number")?;

    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'queued', \
             retry_count = retry_count + CASE WHEN $2 THEN 1 ELSE 0 END, \
             started_at = NULL, \
             completed_at = NULL, \
             output = NULL, \
             error_message = NULL \
         WHERE id = $1 \
         RETURNING *",
    )
    .bind(task.id)
    .bind(increment_retry_count)
    .fetch_one(&mut **tx)
    .await
    .context("failed to queue task")?;

    let execution = sqlx::query_as::<_, TaskExecution>(
        "INSERT INTO task_executions (task_id, attempt_number, status, dispatch_id) \
         VALUES ($1, $2, 'queued', $3) \
         RETURNING *",
    )
    .bind(task.id)
    .bind(next_attempt)
    .bind(dispatch_id)
    .fetch_one(&mut **tx)
    .await
    .context("failed to insert execution attempt")?;

    Ok(Some((task, execution)))
}

// ---------------------------------------------------------------------------
// Worker-driven transitions
// ---------------------------------------------------------------------------

/// Mark a task as running on behalf of a worker.
///
/// No-op (returning the unchanged task) when the task is terminal or when
/// `dispatch_id` does not belong to the latest attempt -- a retry has
/// superseded the caller's attempt and its callbacks are stale.
pub async fn mark_running(
    pool: &PgPool,
    task_id: Uuid,
    dispatch_id: &str,
    worker_id: Option<&str>,
) -> Result<Option<Task>> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let Some(task) = get_task_for_update(&mut tx, task_id).await? else {
        return Ok(None);
    };

    if task.status.is_terminal() {
        tx.commit().await.context("failed to commit")?;
        return Ok(Some(task));
    }

    let latest = executions::get_latest_execution_tx(&mut tx, task_id).await?;
    let Some(latest) = latest else {
        tx.commit().await.context("failed to commit")?;
        return Ok(Some(task));
    };
    if !is_latest_dispatch(&latest, dispatch_id) {
        tracing::debug!(
            task_id = %task_id,
            dispatch_id,
            latest_attempt = latest.attempt_number,
            "ignoring stale mark_running"
        );
        tx.commit().await.context("failed to commit")?;
        return Ok(Some(task));
    }

    let now = Utc::now();

    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'running', started_at = $2, completed_at = NULL, error_message = NULL \
         WHERE id = $1 \
         RETURNING *",
    )
    .bind(task_id)
    .bind(now)
    .fetch_one(&mut *tx)
    .await
    .context("failed to mark task running")?;

    sqlx::query(
        "UPDATE task_executions \
         SET status = 'running', started_at = $2, completed_at = NULL, \
             error_message = NULL, error_type = NULL, worker_id = $3 \
         WHERE id = $1",
    )
    .bind(latest.id)
    .bind(now)
    .bind(worker_id)
    .execute(&mut *tx)
    .await
    .context("failed to mark execution running")?;

    tx.commit().await.context("failed to commit mark_running")?;
    Ok(Some(task))
}

/// Mark a task as completed on behalf of a worker.
///
/// Cancellation wins the race: if the task is already `cancelled`, only the
/// matching attempt row is flipped to `cancelled` and the task keeps its
/// state (and no output is recorded on it). Already completed/failed tasks
/// are left untouched. Stale dispatch ids are no-ops.
pub async fn mark_completed(
    pool: &PgPool,
    task_id: Uuid,
    dispatch_id: &str,
    output: &str,
    usage: &ExecutionUsage,
) -> Result<Option<Task>> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let Some(task) = get_task_for_update(&mut tx, task_id).await? else {
        return Ok(None);
    };

    if task.status == TaskStatus::Cancelled {
        cancel_attempt_row(&mut tx, task_id, dispatch_id).await?;
        tx.commit().await.context("failed to commit")?;
        return Ok(Some(task));
    }
    if task.status.is_terminal() {
        tx.commit().await.context("failed to commit")?;
        return Ok(Some(task));
    }

    let latest = executions::get_latest_execution_tx(&mut tx, task_id).await?;
    let Some(latest) = latest else {
        tx.commit().await.context("failed to commit")?;
        return Ok(Some(task));
    };
    if !is_latest_dispatch(&latest, dispatch_id) {
        tracing::debug!(
            task_id = %task_id,
            dispatch_id,
            latest_attempt = latest.attempt_number,
            "ignoring stale mark_completed"
        );
        tx.commit().await.context("failed to commit")?;
        return Ok(Some(task));
    }

    let completed_at = resolve_completed_at(Utc::now(), task.started_at);

    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'completed', output = $2, error_message = NULL, completed_at = $3 \
         WHERE id = $1 \
         RETURNING *",
    )
    .bind(task_id)
    .bind(output)
    .bind(completed_at)
    .fetch_one(&mut *tx)
    .await
    .context("failed to mark task completed")?;

    sqlx::query(
        "UPDATE task_executions \
         SET status = 'completed', output = $2, error_message = NULL, error_type = NULL, \
             model_name = $3, prompt_tokens = $4, completion_tokens = $5, total_tokens = $6, \
             completed_at = $7 \
         WHERE id = $1",
    )
    .bind(latest.id)
    .bind(output)
    .bind(usage.model_name.as_deref())
    .bind(usage.prompt_tokens)
    .bind(usage.completion_tokens)
    .bind(usage.total_tokens)
    .bind(resolve_completed_at(completed_at, latest.started_at))
    .execute(&mut *tx)
    .await
    .context("failed to mark execution completed")?;

    tx.commit().await.context("failed to commit mark_completed")?;
    Ok(Some(task))
}

/// Mark a task as failed on behalf of a worker. Mirror of [`mark_completed`].
pub async fn mark_failed(
    pool: &PgPool,
    task_id: Uuid,
    dispatch_id: &str,
    error_message: &str,
    error_type: &str,
) -> Result<Option<Task>> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let Some(task) = get_task_for_update(&mut tx, task_id).await? else {
        return Ok(None);
    };

    if task.status == TaskStatus::Cancelled {
        cancel_attempt_row(&mut tx, task_id, dispatch_id).await?;
        tx.commit().await.context("failed to commit")?;
        return Ok(Some(task));
    }
    if task.status.is_terminal() {
        tx.commit().await.context("failed to commit")?;
        return Ok(Some(task));
    }

    let latest = executions::get_latest_execution_tx(&mut tx, task_id).await?;
    let Some(latest) = latest else {
        tx.commit().await.context("failed to commit")?;
        return Ok(Some(task));
    };
    if !is_latest_dispatch(&latest, dispatch_id) {
        tracing::debug!(
            task_id = %task_id,
            dispatch_id,
            latest_attempt = latest.attempt_number,
            "ignoring stale mark_failed"
        );
        tx.commit().await.context("failed to commit")?;
        return Ok(Some(task));
    }

    let completed_at = resolve_completed_at(Utc::now(), task.started_at);

    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'failed', error_message = $2, completed_at = $3 \
         WHERE id = $1 \
         RETURNING *",
    )
    .bind(task_id)
    .bind(error_message)
    .bind(completed_at)
    .fetch_one(&mut *tx)
    .await
    .context("failed to mark task failed")?;

    sqlx::query(
        "UPDATE task_executions \
         SET status = 'failed', error_message = $2, error_type = $3, completed_at = $4 \
         WHERE id = $1",
    )
    .bind(latest.id)
    .bind(error_message)
    .bind(error_type)
    .bind(resolve_completed_at(completed_at, latest.started_at))
    .execute(&mut *tx)
    .await
    .context("failed to mark execution failed")?;

    tx.commit().await.context("failed to commit mark_failed")?;
    Ok(Some(task))
}

/// Cancel a task. User-initiated force transition: bypasses the
/// latest-dispatch guard and applies from any state.
///
/// The latest attempt, if still in flight (`pending`, `queued`, or
/// `running`), is mirrored to `cancelled` with `error_type = "TaskCancelled"`.
pub async fn mark_cancelled(pool: &PgPool, task_id: Uuid, reason: &str) -> Result<Option<Task>> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let Some(task) = get_task_for_update(&mut tx, task_id).await? else {
        return Ok(None);
    };

    let completed_at = resolve_completed_at(Utc::now(), task.started_at);

    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'cancelled', error_message = $2, completed_at = $3 \
         WHERE id = $1 \
         RETURNING *",
    )
    .bind(task_id)
    .bind(reason)
    .bind(completed_at)
    .fetch_one(&mut *tx)
    .await
    .context("failed to mark task cancelled")?;

    if let Some(latest) = executions::get_latest_execution_tx(&mut tx, task_id).await? {
        if !latest.status.is_terminal() {
            sqlx::query(
                "UPDATE task_executions \
                 SET status = 'cancelled', error_message = $2, error_type = $3, completed_at = $4 \
                 WHERE id = $1",
            )
            .bind(latest.id)
            .bind(reason)
            .bind(ERROR_TYPE_CANCELLED)
            .bind(resolve_completed_at(completed_at, latest.started_at))
            .execute(&mut *tx)
            .await
            .context("failed to cancel execution attempt")?;
        }
    }

    tx.commit().await.context("failed to commit mark_cancelled")?;
    Ok(Some(task))
}

/// Flip the attempt row matching `dispatch_id` to `cancelled` without
/// touching the task. Used when a worker callback loses the race against a
/// user cancellation.
async fn cancel_attempt_row(
    tx: &mut Transaction<'_, Postgres>,
    task_id: Uuid,
    dispatch_id: &str,
) -> Result<()> {
    if let Some(execution) =
        executions::get_execution_by_dispatch_id_tx(tx, task_id, dispatch_id).await?
    {
        sqlx::query(
            "UPDATE task_executions SET status = 'cancelled', completed_at = $2 WHERE id = $1",
        )
        .bind(execution.id)
        .bind(resolve_completed_at(Utc::now(), execution.started_at))
        .execute(&mut **tx)
        .await
        .context("failed to cancel attempt row")?;
    }
    Ok(())
}
