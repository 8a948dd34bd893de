//! The `Dispatcher` trait -- the seam between the service and the job broker.
//!
//! The service persists a queued attempt first, then submits the work item
//! here. Any broker that supports caller-assigned job ids, optional ETA
//! delivery, and a revoke primitive can sit behind this trait. The trait is
//! intentionally object-safe so it can be shared as `Arc<dyn Dispatcher>`.

pub mod local;

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use local::LocalDispatcher;

/// Job name for the LLM execution handler. Workers resolve this through
/// the [`crate::worker::WorkerRegistry`].
pub const EXECUTE_LLM: &str = "execute_llm";

/// A work item handed to the broker.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Registered handler name (e.g. [`EXECUTE_LLM`]).
    pub job_name: String,
    /// The task this attempt belongs to.
    pub task_id: Uuid,
    /// Caller-assigned broker job id; correlates the broker callback with
    /// the persisted attempt row.
    pub dispatch_id: String,
    /// Earliest delivery time. The broker ETA is authoritative once
    /// submitted.
    pub eta: Option<DateTime<Utc>>,
}

/// Errors surfaced by broker operations.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("broker rejected submission: {0}")]
    SubmitFailed(String),

    #[error("broker revoke failed: {0}")]
    RevokeFailed(String),

    #[error("broker is shut down")]
    Closed,
}

/// Abstract broker contract.
#[async_trait::async_trait]
pub trait Dispatcher: Send + Sync {
    /// Submit a work item. May fail; the service translates failures into
    /// its enqueue-error path (the attempt is marked failed in storage).
    async fn submit(&self, job: JobRequest) -> Result<(), DispatchError>;

    /// Ask the broker to drop or abort a previously submitted item.
    /// Best-effort: callers treat failures as non-fatal.
    async fn revoke(&self, dispatch_id: &str, terminate: bool) -> Result<(), DispatchError>;
}

// Compile-time assertion: Dispatcher must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Dispatcher) {}
};
