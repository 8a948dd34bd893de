//! Integration tests for the worker runtime: the LLM execution handler's
//! three phases, and the full dispatch loop through the local queue and
//! worker pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use heron_core::dispatch::LocalDispatcher;
use heron_core::llm::{Generation, LlmClient, LlmError};
use heron_core::service::{CreateTaskInput, TaskService};
use heron_core::worker::{
    ExecuteLlmHandler, JobContext, JobHandler, WorkerPoolConfig, WorkerRegistry, run_worker_pool,
};
use heron_db::models::TaskStatus;
use heron_db::queries::executions;
use heron_db::queries::tasks as task_db;

use heron_test_utils::TestDb;

// ---------------------------------------------------------------------------
// Provider doubles
// ---------------------------------------------------------------------------

/// Scripted provider: returns a fixed generation or a fixed error, counts
/// calls, and can optionally block until released.
struct ScriptedLlm {
    output: Option<String>,
    calls: AtomicUsize,
    gate: Option<Arc<Notify>>,
}

impl ScriptedLlm {
    fn ok(output: &str) -> Self {
        Self {
            output: Some(output.to_string()),
            calls: AtomicUsize::new(0),
            gate: None,
        }
    }

    fn failing() -> Self {
        Self {
            output: None,
            calls: AtomicUsize::new(0),
            gate: None,
        }
    }

    fn gated(output: &str, gate: Arc<Notify>) -> Self {
        Self {
            output: Some(output.to_string()),
            calls: AtomicUsize::new(0),
            gate: Some(gate),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LlmClient for ScriptedLlm {
    async fn generate(&self, _prompt: &str) -> Result<Generation, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        match &self.output {
            Some(output) => Ok(Generation {
                output_text: output.clone(),
                model_name: Some("scripted-model".to_string()),
                prompt_tokens: Some(3),
                completion_tokens: Some(4),
                total_tokens: Some(7),
            }),
            None => Err(LlmError::Exhausted {
                attempts: 3,
                last_error: "scripted failure".to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn latest_dispatch_id(pool: &PgPool, task_id: Uuid) -> String {
    executions::get_latest_execution(pool, task_id)
        .await
        .unwrap()
        .unwrap()
        .dispatch_id
        .unwrap()
}

fn ctx(task_id: Uuid, dispatch_id: &str) -> JobContext {
    JobContext {
        task_id,
        dispatch_id: dispatch_id.to_string(),
        worker_id: "test-worker".to_string(),
        cancel: CancellationToken::new(),
    }
}

fn input(name: &str) -> CreateTaskInput {
    CreateTaskInput {
        name: name.to_string(),
        prompt: "say hello".to_string(),
        ..Default::default()
    }
}

/// Poll until the task reaches `status` or the timeout expires.
async fn wait_for_status(pool: &PgPool, task_id: Uuid, status: TaskStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let task = task_db::get_task(pool, task_id).await.unwrap().unwrap();
        if task.status == status {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("task {task_id} never reached {status}, stuck at {}", task.status);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ---------------------------------------------------------------------------
// Handler phases
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handler_completes_task_with_usage() {
    let db = TestDb::new().await;
    let (dispatcher, _queue) = LocalDispatcher::new();
    let service = Arc::new(TaskService::new(db.pool.clone(), Arc::new(dispatcher)));
    let llm = Arc::new(ScriptedLlm::ok("world"));
    let handler = ExecuteLlmHandler::new(service.clone(), llm.clone());

    let task = service.create_task(input("t1")).await.unwrap();
    let dispatch_id = latest_dispatch_id(&db.pool, task.id).await;

    handler.run(&ctx(task.id, &dispatch_id)).await.unwrap();

    let done = task_db::get_task(&db.pool, task.id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.output.as_deref(), Some("world"));

    let attempt = executions::get_latest_execution(&db.pool, task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(attempt.status, TaskStatus::Completed);
    assert_eq!(attempt.worker_id.as_deref(), Some("test-worker"));
    assert_eq!(attempt.model_name.as_deref(), Some("scripted-model"));
    assert_eq!(attempt.total_tokens, Some(7));
    assert_eq!(llm.call_count(), 1);

    db.finish().await;
}

#[tokio::test]
async fn handler_records_failure_and_reraises() {
    let db = TestDb::new().await;
    let (dispatcher, _queue) = LocalDispatcher::new();
    let service = Arc::new(TaskService::new(db.pool.clone(), Arc::new(dispatcher)));
    let handler = ExecuteLlmHandler::new(service.clone(), Arc::new(ScriptedLlm::failing()));

    let task = service.create_task(input("t-fail")).await.unwrap();
    let dispatch_id = latest_dispatch_id(&db.pool, task.id).await;

    let result = handler.run(&ctx(task.id, &dispatch_id)).await;
    assert!(result.is_err(), "handler should re-raise provider failures");

    let failed = task_db::get_task(&db.pool, task.id).await.unwrap().unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);

    let attempt = executions::get_latest_execution(&db.pool, task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(attempt.status, TaskStatus::Failed);
    assert_eq!(attempt.error_type.as_deref(), Some("LlmError"));

    db.finish().await;
}

#[tokio::test]
async fn handler_skips_stale_dispatch_without_calling_provider() {
    let db = TestDb::new().await;
    let (dispatcher, _queue) = LocalDispatcher::new();
    let service = Arc::new(TaskService::new(db.pool.clone(), Arc::new(dispatcher)));
    let llm = Arc::new(ScriptedLlm::ok("unused"));
    let handler = ExecuteLlmHandler::new(service.clone(), llm.clone());

    let task = service.create_task(input("t-stale")).await.unwrap();
    let stale_dispatch = latest_dispatch_id(&db.pool, task.id).await;

    // Fail attempt #1 and retry so a newer attempt owns the task.
    service
        .mark_task_running(task.id, &stale_dispatch, None)
        .await
        .unwrap();
    service
        .mark_task_failed(task.id, &stale_dispatch, "boom", "Provider")
        .await
        .unwrap();
    service.retry_task(task.id).await.unwrap();

    handler.run(&ctx(task.id, &stale_dispatch)).await.unwrap();

    let current = task_db::get_task(&db.pool, task.id).await.unwrap().unwrap();
    assert_eq!(current.status, TaskStatus::Queued);
    assert_eq!(llm.call_count(), 0, "stale attempt must not reach the provider");

    db.finish().await;
}

#[tokio::test]
async fn handler_skips_cancelled_task() {
    let db = TestDb::new().await;
    let (dispatcher, _queue) = LocalDispatcher::new();
    let service = Arc::new(TaskService::new(db.pool.clone(), Arc::new(dispatcher)));
    let llm = Arc::new(ScriptedLlm::ok("unused"));
    let handler = ExecuteLlmHandler::new(service.clone(), llm.clone());

    let task = service.create_task(input("t-cancelled")).await.unwrap();
    let dispatch_id = latest_dispatch_id(&db.pool, task.id).await;
    service.cancel_task(task.id).await.unwrap();

    handler.run(&ctx(task.id, &dispatch_id)).await.unwrap();

    let current = task_db::get_task(&db.pool, task.id).await.unwrap().unwrap();
    assert_eq!(current.status, TaskStatus::Cancelled);
    assert_eq!(llm.call_count(), 0);

    db.finish().await;
}

// ---------------------------------------------------------------------------
// Full loop: dispatcher -> queue -> pool -> handler
// ---------------------------------------------------------------------------

#[tokio::test]
async fn end_to_end_task_execution() {
    let db = TestDb::new().await;

    let (dispatcher, queue) = LocalDispatcher::new();
    let revocations = dispatcher.revocations();
    let dispatcher = Arc::new(dispatcher);
    let service = Arc::new(TaskService::new(db.pool.clone(), dispatcher.clone()));

    let mut registry = WorkerRegistry::new();
    registry.register(Arc::new(ExecuteLlmHandler::new(
        service.clone(),
        Arc::new(ScriptedLlm::ok("hello from worker")),
    )));

    let shutdown = CancellationToken::new();
    let pool_handle = tokio::spawn(run_worker_pool(
        queue,
        Arc::new(registry),
        revocations,
        WorkerPoolConfig {
            concurrency: 2,
            worker_id: "e2e-worker".to_string(),
        },
        shutdown.clone(),
    ));

    let task = service.create_task(input("e2e")).await.unwrap();
    wait_for_status(&db.pool, task.id, TaskStatus::Completed).await;

    let done = task_db::get_task(&db.pool, task.id).await.unwrap().unwrap();
    assert_eq!(done.output.as_deref(), Some("hello from worker"));

    let attempt = executions::get_latest_execution(&db.pool, task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(attempt.worker_id.as_deref(), Some("e2e-worker"));

    shutdown.cancel();
    pool_handle.await.unwrap().unwrap();

    db.finish().await;
}

#[tokio::test]
async fn cancellation_beats_late_completion() {
    let db = TestDb::new().await;

    let gate = Arc::new(Notify::new());
    let llm = Arc::new(ScriptedLlm::gated("late output", gate.clone()));

    let (dispatcher, queue) = LocalDispatcher::new();
    let revocations = dispatcher.revocations();
    let dispatcher = Arc::new(dispatcher);
    let service = Arc::new(TaskService::new(db.pool.clone(), dispatcher.clone()));

    let mut registry = WorkerRegistry::new();
    registry.register(Arc::new(ExecuteLlmHandler::new(service.clone(), llm.clone())));

    let shutdown = CancellationToken::new();
    let pool_handle = tokio::spawn(run_worker_pool(
        queue,
        Arc::new(registry),
        revocations,
        WorkerPoolConfig {
            concurrency: 1,
            worker_id: "race-worker".to_string(),
        },
        shutdown.clone(),
    ));

    let task = service.create_task(input("race")).await.unwrap();
    wait_for_status(&db.pool, task.id, TaskStatus::Running).await;

    // User cancels while the provider call is in flight; the local broker's
    // revoke(terminate = false) leaves the running job alone.
    let cancelled = service.cancel_task(task.id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);

    // The provider finally returns; the completion callback must only touch
    // the attempt row. notify_one stores a permit, so the wakeup cannot be
    // lost even if the provider future registers late.
    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let after = task_db::get_task(&db.pool, task.id).await.unwrap().unwrap();
    assert_eq!(after.status, TaskStatus::Cancelled);
    assert!(after.output.is_none());

    let attempt = executions::get_latest_execution(&db.pool, task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(attempt.status, TaskStatus::Cancelled);

    shutdown.cancel();
    pool_handle.await.unwrap().unwrap();

    db.finish().await;
}

#[tokio::test]
async fn revoked_queued_job_never_runs() {
    let db = TestDb::new().await;

    let llm = Arc::new(ScriptedLlm::ok("should not run"));

    let (dispatcher, queue) = LocalDispatcher::new();
    let revocations = dispatcher.revocations();
    let dispatcher = Arc::new(dispatcher);
    let service = Arc::new(TaskService::new(db.pool.clone(), dispatcher.clone()));

    // Cancel before any worker exists, so the job is revoked while queued.
    let task = service.create_task(input("revoked")).await.unwrap();
    service.cancel_task(task.id).await.unwrap();

    let mut registry = WorkerRegistry::new();
    registry.register(Arc::new(ExecuteLlmHandler::new(service.clone(), llm.clone())));

    let shutdown = CancellationToken::new();
    let pool_handle = tokio::spawn(run_worker_pool(
        queue,
        Arc::new(registry),
        revocations,
        WorkerPoolConfig {
            concurrency: 1,
            worker_id: "revoke-worker".to_string(),
        },
        shutdown.clone(),
    ));

    tokio::time::sleep(Duration::from_millis(300)).await;

    let after = task_db::get_task(&db.pool, task.id).await.unwrap().unwrap();
    assert_eq!(after.status, TaskStatus::Cancelled);
    assert_eq!(llm.call_count(), 0, "revoked job must not reach the provider");

    shutdown.cancel();
    pool_handle.await.unwrap().unwrap();

    db.finish().await;
}

#[tokio::test]
async fn delayed_job_waits_for_eta() {
    let db = TestDb::new().await;

    let (dispatcher, queue) = LocalDispatcher::new();
    let revocations = dispatcher.revocations();
    let dispatcher = Arc::new(dispatcher);
    let service = Arc::new(TaskService::new(db.pool.clone(), dispatcher.clone()));

    let mut registry = WorkerRegistry::new();
    registry.register(Arc::new(ExecuteLlmHandler::new(
        service.clone(),
        Arc::new(ScriptedLlm::ok("eventually")),
    )));

    let shutdown = CancellationToken::new();
    let pool_handle = tokio::spawn(run_worker_pool(
        queue,
        Arc::new(registry),
        revocations,
        WorkerPoolConfig {
            concurrency: 1,
            worker_id: "eta-worker".to_string(),
        },
        shutdown.clone(),
    ));

    let eta = chrono::Utc::now() + chrono::TimeDelta::seconds(2);
    let task = service
        .create_task(CreateTaskInput {
            execute_after: Some(eta),
            ..input("delayed")
        })
        .await
        .unwrap();

    // Still queued shortly after creation: the worker is waiting on the ETA.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let waiting = task_db::get_task(&db.pool, task.id).await.unwrap().unwrap();
    assert_eq!(waiting.status, TaskStatus::Queued);

    wait_for_status(&db.pool, task.id, TaskStatus::Completed).await;
    let done = task_db::get_task(&db.pool, task.id).await.unwrap().unwrap();
    assert!(done.started_at.unwrap() >= eta - chrono::TimeDelta::milliseconds(100));

    shutdown.cancel();
    pool_handle.await.unwrap().unwrap();

    db.finish().await;
}
