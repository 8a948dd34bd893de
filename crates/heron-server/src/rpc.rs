//! RPC adapter: the JSON-over-HTTP surface in front of the task service.
//!
//! The adapter owns request-id plumbing, deadline rejection, input
//! validation, and the mapping from service errors onto HTTP statuses.
//! Every response -- success or failure -- carries the request id in the
//! `x-request-id` header; failures repeat it in the body.

use std::str::FromStr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header::HeaderName};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use heron_core::service::{
    CreateFromTemplateInput, CreateTaskInput, ListTasksInput, ServiceError, TaskService,
};
use heron_core::template::TaskTemplate;
use heron_db::lifecycle::duration_ms;
use heron_db::models::{ExecutionPriority, Task, TaskExecution, TaskStatus};

const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");
const USER_ID_HEADER: HeaderName = HeaderName::from_static("x-user-id");
const DEADLINE_HEADER: HeaderName = HeaderName::from_static("x-request-deadline-ms");

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TaskService>,
    pub pool: PgPool,
}

// ---------------------------------------------------------------------------
// Request context
// ---------------------------------------------------------------------------

/// Per-request metadata resolved at entry.
struct RequestContext {
    request_id: String,
    user_id: Option<String>,
}

impl RequestContext {
    /// Build a response carrying the request id header.
    fn respond(&self, status: StatusCode, body: impl Serialize) -> Response {
        let mut response = (status, Json(body)).into_response();
        if let Ok(value) = self.request_id.parse() {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response
    }

    fn ok(&self, body: impl Serialize) -> Response {
        self.respond(StatusCode::OK, body)
    }

    /// Translate a service error into the wire error shape.
    fn fail(&self, err: ServiceError) -> AppError {
        let (status, message) = match &err {
            ServiceError::NotFound
            | ServiceError::ParentNotFound
            | ServiceError::TemplateNotFound => (StatusCode::NOT_FOUND, err.to_string()),
            ServiceError::Validation(_) => (StatusCode::BAD_REQUEST, err.to_string()),
            ServiceError::RetryNotAllowed
            | ServiceError::RetryLimitReached
            | ServiceError::CancelNotAllowed => (StatusCode::CONFLICT, err.to_string()),
            ServiceError::Enqueue(_) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
            ServiceError::Storage(e) => {
                tracing::error!(request_id = %self.request_id, error = %e, "storage failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        AppError {
            status,
            message,
            request_id: self.request_id.clone(),
        }
    }

    fn bad_request(&self, message: impl Into<String>) -> AppError {
        AppError {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            request_id: self.request_id.clone(),
        }
    }
}

/// Resolve request metadata and enforce the entry deadline check.
///
/// A request id supplied via `x-request-id` is honoured; otherwise one is
/// minted. An already expired `x-request-deadline-ms` (unix epoch millis)
/// is rejected before any work starts.
fn begin_request(headers: &HeaderMap, method: &str) -> Result<RequestContext, AppError> {
    let request_id = headers
        .get(&REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let user_id = headers
        .get(&USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned);

    tracing::info!(
        method,
        request_id = %request_id,
        user_id = user_id.as_deref().unwrap_or("-"),
        "rpc request"
    );

    if let Some(deadline_ms) = headers
        .get(&DEADLINE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
    {
        if Utc::now().timestamp_millis() >= deadline_ms {
            return Err(AppError {
                status: StatusCode::GATEWAY_TIMEOUT,
                message: "request deadline exceeded".to_string(),
                request_id,
            });
        }
    }

    Ok(RequestContext {
        request_id,
        user_id,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
    request_id: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": format!("{} (request_id={})", self.message, self.request_id),
            "request_id": self.request_id,
        });
        let mut response = (self.status, Json(body)).into_response();
        if let Ok(value) = self.request_id.parse() {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub name: String,
    pub prompt: String,
    #[serde(default)]
    pub priority: Option<ExecutionPriority>,
    #[serde(default)]
    pub max_retries: Option<i32>,
    #[serde(default)]
    pub execute_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parent_task_id: Option<Uuid>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl CreateTaskRequest {
    fn into_input(self, default_created_by: Option<&str>) -> CreateTaskInput {
        let created_by = self
            .created_by
            .or_else(|| default_created_by.map(str::to_owned));
        CreateTaskInput {
            name: self.name,
            prompt: self.prompt,
            priority: self.priority,
            max_retries: self.max_retries,
            execute_after: self.execute_after,
            parent_task_id: self.parent_task_id,
            created_by,
            metadata: self.metadata,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListTasksParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub status: Option<String>,
    pub query: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchCreateRequest {
    pub tasks: Vec<CreateTaskRequest>,
}

#[derive(Debug, Deserialize)]
pub struct CreateFromTemplateRequest {
    pub input_text: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parent_task_id: Option<Uuid>,
    #[serde(default)]
    pub created_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LineageParams {
    pub max_depth: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    #[serde(flatten)]
    pub task: Task,
    pub duration_ms: Option<i32>,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        let duration = duration_ms(task.started_at, task.completed_at);
        Self {
            task,
            duration_ms: duration,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TaskDetailResponse {
    #[serde(flatten)]
    pub task: Task,
    pub duration_ms: Option<i32>,
    pub latest_model_name: Option<String>,
    pub total_tokens: Option<i32>,
    pub executions: Vec<TaskExecution>,
}

impl TaskDetailResponse {
    fn new(task: Task, executions: Vec<TaskExecution>) -> Self {
        let duration = duration_ms(task.started_at, task.completed_at);
        let latest = executions.last();
        Self {
            duration_ms: duration,
            latest_model_name: latest.and_then(|e| e.model_name.clone()),
            total_tokens: latest.and_then(|e| e.total_tokens),
            task,
            executions,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListTasksResponse {
    pub tasks: Vec<TaskResponse>,
    pub total_count: i64,
}

#[derive(Debug, Serialize)]
pub struct LineageEntry {
    pub depth: i32,
    pub task: Task,
}

#[derive(Debug, Serialize)]
pub struct LineageResponse {
    pub root: TaskResponse,
    pub ancestors: Vec<LineageEntry>,
    pub descendants: Vec<LineageEntry>,
}

#[derive(Debug, Serialize)]
pub struct TemplateListResponse {
    pub templates: Vec<TaskTemplate>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/tasks", post(create_task).get(list_tasks))
        .route("/v1/tasks/batch", post(batch_create_tasks))
        .route("/v1/tasks/{id}", get(get_task))
        .route("/v1/tasks/{id}/retry", post(retry_task))
        .route("/v1/tasks/{id}/cancel", post(cancel_task))
        .route("/v1/tasks/{id}/lineage", get(get_task_lineage))
        .route("/v1/templates", get(list_templates))
        .route("/v1/templates/{id}/tasks", post(create_task_from_template))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn healthz(State(state): State<AppState>) -> Response {
    match heron_db::pool::ping(&state.pool).await {
        Ok(()) => Json(serde_json::json!({"status": "ok"})).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "health check database probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"status": "degraded"})),
            )
                .into_response()
        }
    }
}

async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateTaskRequest>,
) -> Result<Response, AppError> {
    let ctx = begin_request(&headers, "CreateTask")?;

    let input = body.into_input(ctx.user_id.as_deref());
    let task = state
        .service
        .create_task(input)
        .await
        .map_err(|e| ctx.fail(e))?;

    Ok(ctx.respond(StatusCode::CREATED, TaskResponse::from(task)))
}

async fn list_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListTasksParams>,
) -> Result<Response, AppError> {
    let ctx = begin_request(&headers, "ListTasks")?;

    let limit = params.limit.unwrap_or(50);
    if !(1..=200).contains(&limit) {
        return Err(ctx.bad_request("limit must be between 1 and 200"));
    }
    let offset = params.offset.unwrap_or(0);
    if offset < 0 {
        return Err(ctx.bad_request("offset must not be negative"));
    }
    let status = match params.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            TaskStatus::from_str(raw).map_err(|e| ctx.bad_request(e.to_string()))?,
        ),
    };

    let (tasks, total_count) = state
        .service
        .list_tasks(ListTasksInput {
            limit,
            offset,
            status,
            query: params.query.filter(|q| !q.is_empty()),
        })
        .await
        .map_err(|e| ctx.fail(e))?;

    Ok(ctx.ok(ListTasksResponse {
        tasks: tasks.into_iter().map(TaskResponse::from).collect(),
        total_count,
    }))
}

async fn get_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let ctx = begin_request(&headers, "GetTask")?;

    let (task, executions) = state
        .service
        .get_task_with_executions(id)
        .await
        .map_err(|e| ctx.fail(e))?;

    Ok(ctx.ok(TaskDetailResponse::new(task, executions)))
}

async fn retry_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let ctx = begin_request(&headers, "RetryTask")?;

    let task = state.service.retry_task(id).await.map_err(|e| ctx.fail(e))?;
    Ok(ctx.ok(TaskResponse::from(task)))
}

async fn cancel_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let ctx = begin_request(&headers, "CancelTask")?;

    let task = state
        .service
        .cancel_task(id)
        .await
        .map_err(|e| ctx.fail(e))?;
    Ok(ctx.ok(TaskResponse::from(task)))
}

async fn batch_create_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<BatchCreateRequest>,
) -> Result<Response, AppError> {
    let ctx = begin_request(&headers, "BatchCreateTasks")?;

    if body.tasks.is_empty() || body.tasks.len() > 50 {
        return Err(ctx.bad_request("batch size must be between 1 and 50"));
    }

    let inputs: Vec<CreateTaskInput> = body
        .tasks
        .into_iter()
        .map(|item| item.into_input(ctx.user_id.as_deref()))
        .collect();

    let tasks = state
        .service
        .batch_create_tasks(inputs)
        .await
        .map_err(|e| ctx.fail(e))?;

    Ok(ctx.respond(
        StatusCode::CREATED,
        serde_json::json!({
            "tasks": tasks.into_iter().map(TaskResponse::from).collect::<Vec<_>>(),
        }),
    ))
}

async fn list_templates(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let ctx = begin_request(&headers, "ListTaskTemplates")?;

    Ok(ctx.ok(TemplateListResponse {
        templates: state.service.list_templates().to_vec(),
    }))
}

async fn create_task_from_template(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(template_id): Path<String>,
    Json(body): Json<CreateFromTemplateRequest>,
) -> Result<Response, AppError> {
    let ctx = begin_request(&headers, "CreateTaskFromTemplate")?;

    if body.input_text.trim().is_empty() {
        return Err(ctx.bad_request("input_text must not be empty"));
    }

    let created_by = body
        .created_by
        .or_else(|| ctx.user_id.clone());
    let task = state
        .service
        .create_task_from_template(CreateFromTemplateInput {
            template_id,
            input_text: body.input_text,
            name: body.name,
            parent_task_id: body.parent_task_id,
            created_by,
        })
        .await
        .map_err(|e| ctx.fail(e))?;

    Ok(ctx.respond(StatusCode::CREATED, TaskResponse::from(task)))
}

async fn get_task_lineage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(params): Query<LineageParams>,
) -> Result<Response, AppError> {
    let ctx = begin_request(&headers, "GetTaskLineage")?;

    let max_depth = params.max_depth.unwrap_or(10);
    if !(1..=20).contains(&max_depth) {
        return Err(ctx.bad_request("max_depth must be between 1 and 20"));
    }

    let lineage = state
        .service
        .get_task_lineage(id, max_depth)
        .await
        .map_err(|e| ctx.fail(e))?;

    let entries = |pairs: Vec<(Task, i32)>| {
        pairs
            .into_iter()
            .map(|(task, depth)| LineageEntry { depth, task })
            .collect::<Vec<_>>()
    };

    Ok(ctx.ok(LineageResponse {
        root: TaskResponse::from(lineage.root),
        ancestors: entries(lineage.ancestors),
        descendants: entries(lineage.descendants),
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
