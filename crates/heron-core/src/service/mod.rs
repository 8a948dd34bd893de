//! Task lifecycle policy layer.
//!
//! Sits between the RPC adapter / worker runtime and the storage layer.
//! Owns parent validation, retry eligibility, cancellation policy, batch
//! all-or-nothing creation, template rendering, lineage assembly, and the
//! storage-first enqueue-then-dispatch ordering.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use heron_db::lifecycle::TaskLifecycle;
use heron_db::models::{ExecutionPriority, Task, TaskExecution, TaskStatus};
use heron_db::queries::tasks::{ExecutionUsage, NewTask};
use heron_db::queries::{executions, lineage, tasks as task_db};

use crate::dispatch::{DispatchError, Dispatcher, EXECUTE_LLM, JobRequest};
use crate::template::{TaskTemplate, TemplateRegistry};

/// Reason recorded on tasks cancelled through [`TaskService::cancel_task`].
const CANCEL_REASON: &str = "Task cancelled by user request";

/// Error message / type recorded on attempts whose broker submission failed.
const ENQUEUE_ERROR_MESSAGE: &str = "Failed to submit task to broker";
const ENQUEUE_ERROR_TYPE: &str = "EnqueueError";

/// A create request is treated as immediate unless its `execute_after` is
/// at least this many seconds in the future.
const MIN_ETA_LEAD_SECS: i64 = 1;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Domain errors surfaced by the service. The RPC adapter maps these onto
/// its status codes; storage errors roll back the failing transaction and
/// pass through transparently.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("task not found")]
    NotFound,

    #[error("parent task does not exist")]
    ParentNotFound,

    #[error("task template not found")]
    TemplateNotFound,

    #[error("{0}")]
    Validation(String),

    #[error("only failed tasks can be retried")]
    RetryNotAllowed,

    #[error("task has reached maximum retry limit")]
    RetryLimitReached,

    #[error("only pending, queued, or running tasks can be cancelled")]
    CancelNotAllowed,

    #[error("failed to submit task to broker")]
    Enqueue(#[source] DispatchError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// Inputs / outputs
// ---------------------------------------------------------------------------

/// Fields accepted when creating a task.
#[derive(Debug, Clone, Default)]
pub struct CreateTaskInput {
    pub name: String,
    pub prompt: String,
    pub priority: Option<ExecutionPriority>,
    pub max_retries: Option<i32>,
    pub execute_after: Option<DateTime<Utc>>,
    pub parent_task_id: Option<Uuid>,
    pub created_by: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Pagination and filters for listing tasks.
#[derive(Debug, Clone)]
pub struct ListTasksInput {
    pub limit: i64,
    pub offset: i64,
    pub status: Option<TaskStatus>,
    pub query: Option<String>,
}

/// Fields accepted when creating a task from a template.
#[derive(Debug, Clone, Default)]
pub struct CreateFromTemplateInput {
    pub template_id: String,
    pub input_text: String,
    pub name: Option<String>,
    pub parent_task_id: Option<Uuid>,
    pub created_by: Option<String>,
}

/// The ancestor/descendant view around a root task.
#[derive(Debug, Clone)]
pub struct TaskLineage {
    pub root: Task,
    /// Depth 1..k walking the parent link upward; root excluded.
    pub ancestors: Vec<(Task, i32)>,
    /// Breadth-first, depth 1..k below the root.
    pub descendants: Vec<(Task, i32)>,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// The task lifecycle service.
pub struct TaskService {
    pool: PgPool,
    dispatcher: Arc<dyn Dispatcher>,
    templates: TemplateRegistry,
}

impl TaskService {
    pub fn new(pool: PgPool, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            pool,
            dispatcher,
            templates: TemplateRegistry::builtin(),
        }
    }

    /// Create a task, persist a queued attempt, and dispatch it.
    ///
    /// The returned task reflects the post-enqueue state (`queued`).
    pub async fn create_task(&self, input: CreateTaskInput) -> Result<Task, ServiceError> {
        validate_task_fields(&input.name, &input.prompt)?;

        if let Some(parent_id) = input.parent_task_id {
            if task_db::get_task(&self.pool, parent_id).await?.is_none() {
                return Err(ServiceError::ParentNotFound);
            }
        }

        let execute_after = normalize_execute_after(input.execute_after, Utc::now());

        let task = task_db::insert_task(
            &self.pool,
            &NewTask {
                name: &input.name,
                prompt: &input.prompt,
                priority: input.priority,
                max_retries: input.max_retries,
                execute_after,
                parent_task_id: input.parent_task_id,
                created_by: input.created_by.as_deref(),
                metadata: input.metadata,
            },
        )
        .await?;

        tracing::info!(task_id = %task.id, name = %task.name, "task created");

        self.enqueue_and_dispatch(task.id, false, execute_after)
            .await
    }

    /// List tasks with the given filters, plus the total matching count.
    pub async fn list_tasks(&self, input: ListTasksInput) -> Result<(Vec<Task>, i64), ServiceError> {
        let result = task_db::list_tasks(
            &self.pool,
            input.limit,
            input.offset,
            input.status,
            input.query.as_deref(),
        )
        .await?;
        Ok(result)
    }

    /// Fetch a single task.
    pub async fn get_task(&self, id: Uuid) -> Result<Task, ServiceError> {
        task_db::get_task(&self.pool, id)
            .await?
            .ok_or(ServiceError::NotFound)
    }

    /// Fetch a task together with its full attempt history.
    pub async fn get_task_with_executions(
        &self,
        id: Uuid,
    ) -> Result<(Task, Vec<TaskExecution>), ServiceError> {
        let task = self.get_task(id).await?;
        let history = executions::list_executions(&self.pool, id).await?;
        Ok((task, history))
    }

    /// Retry a failed task by queueing a new attempt.
    ///
    /// Only `failed` tasks with remaining retry budget are eligible.
    pub async fn retry_task(&self, id: Uuid) -> Result<Task, ServiceError> {
        let task = self.get_task(id).await?;

        if task.status != TaskStatus::Failed {
            return Err(ServiceError::RetryNotAllowed);
        }
        if task.retry_count >= task.max_retries {
            return Err(ServiceError::RetryLimitReached);
        }

        tracing::info!(
            task_id = %task.id,
            retry_count = task.retry_count,
            max_retries = task.max_retries,
            "retrying task"
        );

        self.enqueue_and_dispatch(task.id, true, None).await
    }

    /// Cancel a non-terminal task.
    ///
    /// The broker revoke is best-effort: a failure is logged and swallowed,
    /// because cancellation must succeed at the storage layer regardless of
    /// broker health.
    pub async fn cancel_task(&self, id: Uuid) -> Result<Task, ServiceError> {
        let task = self.get_task(id).await?;

        if !TaskLifecycle::is_valid_transition(task.status, TaskStatus::Cancelled) {
            return Err(ServiceError::CancelNotAllowed);
        }

        let latest = executions::get_latest_execution(&self.pool, task.id).await?;
        if let Some(dispatch_id) = latest.and_then(|e| e.dispatch_id) {
            if let Err(e) = self.dispatcher.revoke(&dispatch_id, false).await {
                tracing::warn!(
                    task_id = %task.id,
                    dispatch_id = %dispatch_id,
                    error = %e,
                    "failed to revoke dispatch during cancellation"
                );
            }
        }

        let cancelled = task_db::mark_cancelled(&self.pool, task.id, CANCEL_REASON)
            .await?
            .ok_or(ServiceError::NotFound)?;

        tracing::info!(task_id = %cancelled.id, "task cancelled");
        Ok(cancelled)
    }

    /// Create a batch of tasks all-or-nothing.
    ///
    /// Every task and its queued attempt are inserted in one transaction;
    /// any failure rolls the whole batch back. Dispatch happens after the
    /// commit, best-effort per item: a submit failure marks only that task
    /// failed while the rest stay queued.
    pub async fn batch_create_tasks(
        &self,
        items: Vec<CreateTaskInput>,
    ) -> Result<Vec<Task>, ServiceError> {
        if items.is_empty() {
            return Err(ServiceError::Validation("batch must not be empty".into()));
        }
        for item in &items {
            validate_task_fields(&item.name, &item.prompt)?;
        }

        // Pre-validate every referenced parent with a single query.
        let mut parent_ids: Vec<Uuid> = items.iter().filter_map(|i| i.parent_task_id).collect();
        parent_ids.sort_unstable();
        parent_ids.dedup();
        if !parent_ids.is_empty() {
            let existing = lineage::list_existing_task_ids(&self.pool, &parent_ids).await?;
            if existing.len() != parent_ids.len() {
                return Err(ServiceError::ParentNotFound);
            }
        }

        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ServiceError::Storage(e.into()))?;
        let mut queued: Vec<(Task, String, Option<DateTime<Utc>>)> =
            Vec::with_capacity(items.len());

        for item in &items {
            let execute_after = normalize_execute_after(item.execute_after, now);
            let task = task_db::insert_task_tx(
                &mut tx,
                &NewTask {
                    name: &item.name,
                    prompt: &item.prompt,
                    priority: item.priority,
                    max_retries: item.max_retries,
                    execute_after,
                    parent_task_id: item.parent_task_id,
                    created_by: item.created_by.as_deref(),
                    metadata: item.metadata.clone(),
                },
            )
            .await?;

            let dispatch_id = Uuid::new_v4().to_string();
            let (task, _execution) =
                task_db::enqueue_execution_tx(&mut tx, task.id, &dispatch_id, false)
                    .await?
                    .ok_or(ServiceError::NotFound)?;

            queued.push((task, dispatch_id, execute_after));
        }

        tx.commit()
            .await
            .map_err(|e| ServiceError::Storage(e.into()))?;

        tracing::info!(count = queued.len(), "task batch committed");

        // Post-commit dispatch, best-effort per item.
        let mut created = Vec::with_capacity(queued.len());
        for (task, dispatch_id, eta) in queued {
            match self
                .dispatcher
                .submit(JobRequest {
                    job_name: EXECUTE_LLM.to_string(),
                    task_id: task.id,
                    dispatch_id: dispatch_id.clone(),
                    eta,
                })
                .await
            {
                Ok(()) => created.push(task),
                Err(e) => {
                    tracing::warn!(
                        task_id = %task.id,
                        dispatch_id = %dispatch_id,
                        error = %e,
                        "batch dispatch failed; marking task failed"
                    );
                    let failed = task_db::mark_failed(
                        &self.pool,
                        task.id,
                        &dispatch_id,
                        ENQUEUE_ERROR_MESSAGE,
                        ENQUEUE_ERROR_TYPE,
                    )
                    .await?
                    .unwrap_or(task);
                    created.push(failed);
                }
            }
        }

        Ok(created)
    }

    /// All templates from the static catalog.
    pub fn list_templates(&self) -> &[TaskTemplate] {
        self.templates.list()
    }

    /// Create a task from a catalog template, substituting the input text
    /// into the template's prompt.
    pub async fn create_task_from_template(
        &self,
        input: CreateFromTemplateInput,
    ) -> Result<Task, ServiceError> {
        let template = self
            .templates
            .get(&input.template_id)
            .ok_or(ServiceError::TemplateNotFound)?;

        let prompt = template.render_prompt(&input.input_text);
        let name = match input.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => template.derived_task_name(),
        };

        self.create_task(CreateTaskInput {
            name,
            prompt,
            parent_task_id: input.parent_task_id,
            created_by: input.created_by,
            ..Default::default()
        })
        .await
    }

    /// Assemble the lineage view around a task: the root itself, its
    /// ancestor chain, and its descendant tree, both bounded by `max_depth`.
    pub async fn get_task_lineage(
        &self,
        id: Uuid,
        max_depth: i32,
    ) -> Result<TaskLineage, ServiceError> {
        let root = self.get_task(id).await?;
        let ancestors = lineage::list_ancestors(&self.pool, root.id, max_depth).await?;
        let descendants = lineage::list_descendants(&self.pool, root.id, max_depth).await?;
        Ok(TaskLineage {
            root,
            ancestors,
            descendants,
        })
    }

    // -----------------------------------------------------------------------
    // Worker-facing transitions
    // -----------------------------------------------------------------------

    /// Record that a worker started executing an attempt.
    pub async fn mark_task_running(
        &self,
        task_id: Uuid,
        dispatch_id: &str,
        worker_id: Option<&str>,
    ) -> Result<Task, ServiceError> {
        task_db::mark_running(&self.pool, task_id, dispatch_id, worker_id)
            .await?
            .ok_or(ServiceError::NotFound)
    }

    /// Record a successful attempt with its output and usage metrics.
    pub async fn mark_task_completed(
        &self,
        task_id: Uuid,
        dispatch_id: &str,
        output: &str,
        usage: &ExecutionUsage,
    ) -> Result<Task, ServiceError> {
        task_db::mark_completed(&self.pool, task_id, dispatch_id, output, usage)
            .await?
            .ok_or(ServiceError::NotFound)
    }

    /// Record a failed attempt with a categorized error.
    pub async fn mark_task_failed(
        &self,
        task_id: Uuid,
        dispatch_id: &str,
        error_message: &str,
        error_type: &str,
    ) -> Result<Task, ServiceError> {
        task_db::mark_failed(&self.pool, task_id, dispatch_id, error_message, error_type)
            .await?
            .ok_or(ServiceError::NotFound)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Queue a new attempt and hand it to the broker.
    ///
    /// The dispatch id is generated service-side and persisted with the
    /// attempt *before* the broker sees it, so a callback can always find
    /// its attempt row. A failed submission degrades to a persisted failed
    /// attempt rather than an orphaned queued task.
    async fn enqueue_and_dispatch(
        &self,
        task_id: Uuid,
        increment_retry_count: bool,
        eta: Option<DateTime<Utc>>,
    ) -> Result<Task, ServiceError> {
        let dispatch_id = Uuid::new_v4().to_string();

        let (task, execution) =
            task_db::enqueue_execution(&self.pool, task_id, &dispatch_id, increment_retry_count)
                .await?
                .ok_or(ServiceError::NotFound)?;

        tracing::debug!(
            task_id = %task.id,
            attempt = execution.attempt_number,
            dispatch_id = %dispatch_id,
            "attempt queued"
        );

        if let Err(e) = self
            .dispatcher
            .submit(JobRequest {
                job_name: EXECUTE_LLM.to_string(),
                task_id: task.id,
                dispatch_id: dispatch_id.clone(),
                eta,
            })
            .await
        {
            tracing::error!(
                task_id = %task.id,
                dispatch_id = %dispatch_id,
                error = %e,
                "broker submission failed"
            );
            task_db::mark_failed(
                &self.pool,
                task.id,
                &dispatch_id,
                ENQUEUE_ERROR_MESSAGE,
                ENQUEUE_ERROR_TYPE,
            )
            .await?;
            return Err(ServiceError::Enqueue(e));
        }

        Ok(task)
    }
}

/// Reject empty or oversized name/prompt fields.
fn validate_task_fields(name: &str, prompt: &str) -> Result<(), ServiceError> {
    if name.trim().is_empty() {
        return Err(ServiceError::Validation("name must not be empty".into()));
    }
    if name.len() > 255 {
        return Err(ServiceError::Validation(
            "name must be at most 255 characters".into(),
        ));
    }
    if prompt.trim().is_empty() {
        return Err(ServiceError::Validation("prompt must not be empty".into()));
    }
    Ok(())
}

/// Normalize a requested `execute_after` to UTC, dropping it when it is not
/// meaningfully in the future (at most 1 second of lead counts as
/// immediate).
fn normalize_execute_after(
    execute_after: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    execute_after.filter(|eta| *eta > now + TimeDelta::seconds(MIN_ETA_LEAD_SECS))
}
