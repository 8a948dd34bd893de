//! Job handler registry -- the explicit registration table the worker
//! runtime resolves job names through.
//!
//! Job names are constants (see [`crate::dispatch::EXECUTE_LLM`]); the
//! registry is built at startup and shared with the worker pool.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything a handler needs to execute one dispatched job.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub task_id: Uuid,
    /// Correlation id of the attempt this job executes.
    pub dispatch_id: String,
    /// Identifier of the worker process running the job.
    pub worker_id: String,
    /// Cancelled when the dispatch is revoked with `terminate = true`.
    pub cancel: CancellationToken,
}

/// A registered job implementation.
///
/// Object-safe so handlers can be stored as `Arc<dyn JobHandler>` in the
/// registry.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job name this handler serves.
    fn name(&self) -> &str;

    /// Execute one job. Errors are recorded by the worker pool; state
    /// transitions happen through the service inside the handler.
    async fn run(&self, ctx: &JobContext) -> Result<()>;
}

// Compile-time assertion: JobHandler must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn JobHandler) {}
};

/// A collection of registered [`JobHandler`] implementations, keyed by name.
#[derive(Default)]
pub struct WorkerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl WorkerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under the name returned by [`JobHandler::name`].
    /// An existing handler with the same name is replaced and returned.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) -> Option<Arc<dyn JobHandler>> {
        let name = handler.name().to_string();
        self.handlers.insert(name, handler)
    }

    /// Look up a handler by job name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).cloned()
    }

    /// List the names of all registered handlers.
    pub fn list(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
