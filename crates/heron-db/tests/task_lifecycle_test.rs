//! Integration tests for the transactional task transitions: enqueue,
//! worker callbacks, cancellation, and the guards that make callbacks
//! idempotent.
//!
//! Each test creates a unique temporary database, runs migrations, and
//! drops it on completion so tests are fully isolated and idempotent.

use sqlx::PgPool;
use uuid::Uuid;

use heron_db::models::{Task, TaskStatus};
use heron_db::queries::tasks::{self as task_db, ExecutionUsage, NewTask};
use heron_db::queries::{executions, lineage};

use heron_test_utils::TestDb;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn new_task(pool: &PgPool, name: &str) -> Task {
    task_db::insert_task(
        pool,
        &NewTask {
            name,
            prompt: "say hello",
            ..Default::default()
        },
    )
    .await
    .expect("insert_task should succeed")
}

async fn new_task_with_retries(pool: &PgPool, name: &str, max_retries: i32) -> Task {
    task_db::insert_task(
        pool,
        &NewTask {
            name,
            prompt: "say hello",
            max_retries: Some(max_retries),
            ..Default::default()
        },
    )
    .await
    .expect("insert_task should succeed")
}

async fn enqueue(pool: &PgPool, task_id: Uuid, dispatch_id: &str) -> Task {
    let (task, _execution) = task_db::enqueue_execution(pool, task_id, dispatch_id, false)
        .await
        .expect("enqueue should succeed")
        .expect("task should exist");
    task
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn insert_assigns_defaults() {
    let db = TestDb::new().await;

    let task = new_task(&db.pool, "defaults").await;
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 0);
    assert_eq!(task.max_retries, 3);
    assert!(task.started_at.is_none());
    assert!(task.completed_at.is_none());
    assert_eq!(task.metadata, serde_json::json!({}));

    db.finish().await;
}

#[tokio::test]
async fn get_missing_task_returns_none() {
    let db = TestDb::new().await;

    let task = task_db::get_task(&db.pool, Uuid::new_v4()).await.unwrap();
    assert!(task.is_none());

    db.finish().await;
}

// ---------------------------------------------------------------------------
// Enqueue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn enqueue_creates_dense_attempt_numbers() {
    let db = TestDb::new().await;

    let task = new_task(&db.pool, "attempts").await;

    for expected in 1..=3 {
        let (queued, execution) =
            task_db::enqueue_execution(&db.pool, task.id, &format!("d-{expected}"), false)
                .await
                .unwrap()
                .unwrap();
        assert_eq!(queued.status, TaskStatus::Queued);
        assert_eq!(execution.attempt_number, expected);
        assert_eq!(execution.status, TaskStatus::Queued);
        assert_eq!(execution.dispatch_id.as_deref(), Some(format!("d-{expected}").as_str()));
    }

    let history = executions::list_executions(&db.pool, task.id).await.unwrap();
    let numbers: Vec<i32> = history.iter().map(|e| e.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);

    db.finish().await;
}

#[tokio::test]
async fn enqueue_resets_result_fields() {
    let db = TestDb::new().await;

    let task = new_task(&db.pool, "reset").await;
    enqueue(&db.pool, task.id, "d-1").await;
    task_db::mark_running(&db.pool, task.id, "d-1", Some("w-1"))
        .await
        .unwrap();
    task_db::mark_failed(&db.pool, task.id, "d-1", "boom", "LlmError")
        .await
        .unwrap();

    let (requeued, _) = task_db::enqueue_execution(&db.pool, task.id, "d-2", true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(requeued.status, TaskStatus::Queued);
    assert_eq!(requeued.retry_count, 1);
    assert!(requeued.started_at.is_none());
    assert!(requeued.completed_at.is_none());
    assert!(requeued.output.is_none());
    assert!(requeued.error_message.is_none());

    db.finish().await;
}

#[tokio::test]
async fn enqueue_missing_task_returns_none() {
    let db = TestDb::new().await;

    let result = task_db::enqueue_execution(&db.pool, Uuid::new_v4(), "d-1", false)
        .await
        .unwrap();
    assert!(result.is_none());

    db.finish().await;
}

#[tokio::test]
async fn retry_count_cannot_exceed_max_retries() {
    let db = TestDb::new().await;

    // max_retries = 1: the first increment is fine, the second must violate
    // the valid_retry_count constraint.
    let task = new_task_with_retries(&db.pool, "budget", 1).await;
    task_db::enqueue_execution(&db.pool, task.id, "d-1", true)
        .await
        .unwrap()
        .unwrap();

    let result = task_db::enqueue_execution(&db.pool, task.id, "d-2", true).await;
    assert!(result.is_err(), "constraint should reject retry_count > max_retries");

    db.finish().await;
}

// ---------------------------------------------------------------------------
// Worker callbacks: happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_run_and_complete() {
    let db = TestDb::new().await;

    let task = new_task(&db.pool, "happy").await;
    enqueue(&db.pool, task.id, "d-1").await;

    let running = task_db::mark_running(&db.pool, task.id, "d-1", Some("worker-9"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(running.status, TaskStatus::Running);
    assert!(running.started_at.is_some());

    let usage = ExecutionUsage {
        model_name: Some("test-model".to_string()),
        prompt_tokens: Some(3),
        completion_tokens: Some(4),
        total_tokens: Some(7),
    };
    let completed = task_db::mark_completed(&db.pool, task.id, "d-1", "world", &usage)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completed.status, TaskStatus::Completed);
    assert_eq!(completed.output.as_deref(), Some("world"));
    assert!(completed.completed_at.unwrap() >= completed.started_at.unwrap());

    let attempt = executions::get_latest_execution(&db.pool, task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(attempt.status, TaskStatus::Completed);
    assert_eq!(attempt.worker_id.as_deref(), Some("worker-9"));
    assert_eq!(attempt.total_tokens, Some(7));
    assert_eq!(attempt.model_name.as_deref(), Some("test-model"));
    // duration_ms is derived by trigger from the attempt's own timestamps.
    assert!(attempt.duration_ms.is_some());
    assert!(attempt.duration_ms.unwrap() >= 0);

    db.finish().await;
}

#[tokio::test]
async fn failure_records_error_and_type() {
    let db = TestDb::new().await;

    let task = new_task(&db.pool, "fails").await;
    enqueue(&db.pool, task.id, "d-1").await;
    task_db::mark_running(&db.pool, task.id, "d-1", None)
        .await
        .unwrap();

    let failed = task_db::mark_failed(&db.pool, task.id, "d-1", "provider exploded", "Provider")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("provider exploded"));
    assert_eq!(failed.retry_count, 0);

    let attempt = executions::get_latest_execution(&db.pool, task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(attempt.status, TaskStatus::Failed);
    assert_eq!(attempt.error_type.as_deref(), Some("Provider"));

    db.finish().await;
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stale_dispatch_is_a_noop() {
    let db = TestDb::new().await;

    // Fail attempt #1, retry into attempt #2.
    let task = new_task(&db.pool, "stale").await;
    enqueue(&db.pool, task.id, "d-1").await;
    task_db::mark_running(&db.pool, task.id, "d-1", None)
        .await
        .unwrap();
    task_db::mark_failed(&db.pool, task.id, "d-1", "boom", "Provider")
        .await
        .unwrap();
    task_db::enqueue_execution(&db.pool, task.id, "d-2", true)
        .await
        .unwrap()
        .unwrap();

    // Late callbacks for attempt #1 must change nothing.
    let after_running = task_db::mark_running(&db.pool, task.id, "d-1", Some("ghost"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after_running.status, TaskStatus::Queued);

    let after_complete =
        task_db::mark_completed(&db.pool, task.id, "d-1", "late", &ExecutionUsage::default())
            .await
            .unwrap()
            .unwrap();
    assert_eq!(after_complete.status, TaskStatus::Queued);
    assert!(after_complete.output.is_none());

    let history = executions::list_executions(&db.pool, task.id).await.unwrap();
    assert_eq!(history[0].status, TaskStatus::Failed);
    assert_eq!(history[0].output, None);
    assert_eq!(history[1].status, TaskStatus::Queued);

    db.finish().await;
}

#[tokio::test]
async fn completed_task_absorbs_further_callbacks() {
    let db = TestDb::new().await;

    let task = new_task(&db.pool, "absorbing").await;
    enqueue(&db.pool, task.id, "d-1").await;
    task_db::mark_running(&db.pool, task.id, "d-1", None)
        .await
        .unwrap();
    task_db::mark_completed(&db.pool, task.id, "d-1", "first", &ExecutionUsage::default())
        .await
        .unwrap();

    let after = task_db::mark_failed(&db.pool, task.id, "d-1", "late failure", "Provider")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.status, TaskStatus::Completed);
    assert_eq!(after.output.as_deref(), Some("first"));
    assert!(after.error_message.is_none());

    let again = task_db::mark_running(&db.pool, task.id, "d-1", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.status, TaskStatus::Completed);

    db.finish().await;
}

#[tokio::test]
async fn completion_after_cancel_touches_only_the_attempt() {
    let db = TestDb::new().await;

    let task = new_task(&db.pool, "cancel-race").await;
    enqueue(&db.pool, task.id, "d-1").await;
    task_db::mark_running(&db.pool, task.id, "d-1", None)
        .await
        .unwrap();

    let cancelled = task_db::mark_cancelled(&db.pool, task.id, "Task cancelled by user request")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);

    // The worker finishes late; the task must stay cancelled with no output,
    // and the attempt row ends cancelled rather than completed.
    let after = task_db::mark_completed(&db.pool, task.id, "d-1", "late", &ExecutionUsage::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.status, TaskStatus::Cancelled);
    assert!(after.output.is_none());

    let attempt = executions::get_latest_execution(&db.pool, task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(attempt.status, TaskStatus::Cancelled);
    assert_eq!(attempt.error_type.as_deref(), Some("TaskCancelled"));

    db.finish().await;
}

#[tokio::test]
async fn cancel_mirrors_in_flight_attempt() {
    let db = TestDb::new().await;

    let task = new_task(&db.pool, "cancel-queued").await;
    enqueue(&db.pool, task.id, "d-1").await;

    let cancelled = task_db::mark_cancelled(&db.pool, task.id, "operator said stop")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert_eq!(cancelled.error_message.as_deref(), Some("operator said stop"));

    let attempt = executions::get_latest_execution(&db.pool, task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(attempt.status, TaskStatus::Cancelled);
    assert_eq!(attempt.error_message.as_deref(), Some("operator said stop"));
    assert_eq!(attempt.error_type.as_deref(), Some("TaskCancelled"));

    db.finish().await;
}

#[tokio::test]
async fn cancel_leaves_terminal_attempt_untouched() {
    let db = TestDb::new().await;

    let task = new_task(&db.pool, "cancel-after-fail").await;
    enqueue(&db.pool, task.id, "d-1").await;
    task_db::mark_running(&db.pool, task.id, "d-1", None)
        .await
        .unwrap();
    task_db::mark_failed(&db.pool, task.id, "d-1", "boom", "Provider")
        .await
        .unwrap();

    // Force-cancel applies to the task even from failed; the already
    // terminal attempt keeps its failed record.
    let cancelled = task_db::mark_cancelled(&db.pool, task.id, "stop")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);

    let attempt = executions::get_latest_execution(&db.pool, task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(attempt.status, TaskStatus::Failed);
    assert_eq!(attempt.error_type.as_deref(), Some("Provider"));

    db.finish().await;
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_filters_by_status_and_text() {
    let db = TestDb::new().await;

    let alpha = new_task(&db.pool, "alpha-job").await;
    let beta = new_task(&db.pool, "beta-job").await;
    enqueue(&db.pool, beta.id, "d-b").await;

    let (all, total) = task_db::list_tasks(&db.pool, 50, 0, None, None).await.unwrap();
    assert_eq!(total, 2);
    assert_eq!(all.len(), 2);

    let (pending, total) = task_db::list_tasks(&db.pool, 50, 0, Some(TaskStatus::Pending), None)
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(pending[0].id, alpha.id);

    let (by_name, total) = task_db::list_tasks(&db.pool, 50, 0, None, Some("BETA"))
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(by_name[0].id, beta.id);

    let id_fragment = alpha.id.to_string()[..8].to_string();
    let (by_id, _) = task_db::list_tasks(&db.pool, 50, 0, None, Some(&id_fragment))
        .await
        .unwrap();
    assert!(by_id.iter().any(|t| t.id == alpha.id));

    let (paged, total) = task_db::list_tasks(&db.pool, 1, 1, None, None).await.unwrap();
    assert_eq!(total, 2);
    assert_eq!(paged.len(), 1);

    db.finish().await;
}

// ---------------------------------------------------------------------------
// Parent pre-validation helper
// ---------------------------------------------------------------------------

#[tokio::test]
async fn existing_task_ids_intersection() {
    let db = TestDb::new().await;

    let a = new_task(&db.pool, "a").await;
    let b = new_task(&db.pool, "b").await;
    let missing = Uuid::new_v4();

    let mut found = lineage::list_existing_task_ids(&db.pool, &[a.id, b.id, missing])
        .await
        .unwrap();
    found.sort();
    let mut expected = vec![a.id, b.id];
    expected.sort();
    assert_eq!(found, expected);

    let empty = lineage::list_existing_task_ids(&db.pool, &[]).await.unwrap();
    assert!(empty.is_empty());

    db.finish().await;
}
