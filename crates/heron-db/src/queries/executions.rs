//! Query functions for the `task_executions` attempt log.

use anyhow::{Context, Result};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::TaskExecution;

/// Fetch the latest attempt for a task: highest `attempt_number`, with
/// `created_at` as the tiebreaker.
pub async fn get_latest_execution(pool: &PgPool, task_id: Uuid) -> Result<Option<TaskExecution>> {
    let execution = sqlx::query_as::<_, TaskExecution>(
        "SELECT * FROM task_executions \
         WHERE task_id = $1 \
         ORDER BY attempt_number DESC, created_at DESC \
         LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest execution")?;

    Ok(execution)
}

/// Transaction-scoped variant of [`get_latest_execution`], used inside
/// locked state transitions.
pub async fn get_latest_execution_tx(
    tx: &mut Transaction<'_, Postgres>,
    task_id: Uuid,
) -> Result<Option<TaskExecution>> {
    let execution = sqlx::query_as::<_, TaskExecution>(
        "SELECT * FROM task_executions \
         WHERE task_id = $1 \
         ORDER BY attempt_number DESC, created_at DESC \
         LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(&mut **tx)
    .await
    .context("failed to fetch latest execution")?;

    Ok(execution)
}

/// Fetch the attempt carrying a given dispatch id for a task.
pub async fn get_execution_by_dispatch_id_tx(
    tx: &mut Transaction<'_, Postgres>,
    task_id: Uuid,
    dispatch_id: &str,
) -> Result<Option<TaskExecution>> {
    let execution = sqlx::query_as::<_, TaskExecution>(
        "SELECT * FROM task_executions \
         WHERE task_id = $1 AND dispatch_id = $2 \
         ORDER BY created_at DESC \
         LIMIT 1",
    )
    .bind(task_id)
    .bind(dispatch_id)
    .fetch_optional(&mut **tx)
    .await
    .context("failed to fetch execution by dispatch id")?;

    Ok(execution)
}

/// Full attempt history for a task, oldest first.
pub async fn list_executions(pool: &PgPool, task_id: Uuid) -> Result<Vec<TaskExecution>> {
    let executions = sqlx::query_as::<_, TaskExecution>(
        "SELECT * FROM task_executions \
         WHERE task_id = $1 \
         ORDER BY attempt_number ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list executions")?;

    Ok(executions)
}
