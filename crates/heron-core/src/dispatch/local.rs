//! In-process broker: an unbounded queue feeding the worker pool, with a
//! revocation table of per-dispatch cancellation tokens.
//!
//! This is the default push-mode broker for a single-process deployment.
//! Semantics mirror a conventional job broker:
//! - submissions carry a caller-assigned dispatch id and an optional ETA;
//! - `revoke(terminate = false)` drops a job that has not started yet but
//!   leaves a running one alone;
//! - `revoke(terminate = true)` also interrupts a running job cooperatively
//!   through its cancellation token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{DispatchError, Dispatcher, JobRequest};

/// A submitted job as seen by the worker pool.
#[derive(Debug)]
pub struct QueuedJob {
    pub request: JobRequest,
    /// Cancelled when the dispatch is revoked.
    pub cancel: CancellationToken,
}

/// Receiving half of the local queue, consumed by the worker pool.
pub type JobReceiver = mpsc::UnboundedReceiver<QueuedJob>;

struct JobControl {
    cancel: CancellationToken,
    started: bool,
}

/// Tracks in-flight dispatches so revocations can find their tokens.
#[derive(Default)]
pub struct RevocationTable {
    inner: Mutex<HashMap<String, JobControl>>,
}

impl RevocationTable {
    fn register(&self, dispatch_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let mut inner = self.inner.lock().expect("revocation table poisoned");
        inner.insert(
            dispatch_id.to_owned(),
            JobControl {
                cancel: token.clone(),
                started: false,
            },
        );
        token
    }

    /// Record that a worker slot picked the job up. Returns `false` if the
    /// dispatch was already revoked and the job must not run.
    pub fn mark_started(&self, dispatch_id: &str) -> bool {
        let mut inner = self.inner.lock().expect("revocation table poisoned");
        match inner.get_mut(dispatch_id) {
            Some(control) if control.cancel.is_cancelled() => false,
            Some(control) => {
                control.started = true;
                true
            }
            // Unknown dispatch: submitted through another dispatcher clone
            // or already cleaned up. Let it run.
            None => true,
        }
    }

    /// Drop the bookkeeping for a finished dispatch.
    pub fn remove(&self, dispatch_id: &str) {
        let mut inner = self.inner.lock().expect("revocation table poisoned");
        inner.remove(dispatch_id);
    }

    fn revoke(&self, dispatch_id: &str, terminate: bool) {
        let mut inner = self.inner.lock().expect("revocation table poisoned");
        if let Some(control) = inner.get_mut(dispatch_id) {
            if terminate || !control.started {
                control.cancel.cancel();
            }
        }
        // Revoking an unknown dispatch id is a no-op, as with any broker
        // that has already expired the job.
    }
}

/// In-process [`Dispatcher`] implementation.
#[derive(Clone)]
pub struct LocalDispatcher {
    tx: mpsc::UnboundedSender<QueuedJob>,
    revocations: Arc<RevocationTable>,
}

impl LocalDispatcher {
    /// Create the dispatcher and the queue receiver for the worker pool.
    pub fn new() -> (Self, JobReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            tx,
            revocations: Arc::new(RevocationTable::default()),
        };
        (dispatcher, rx)
    }

    /// Shared revocation table, handed to the worker pool so it can honor
    /// revocations and clean up finished dispatches.
    pub fn revocations(&self) -> Arc<RevocationTable> {
        Arc::clone(&self.revocations)
    }
}

#[async_trait::async_trait]
impl Dispatcher for LocalDispatcher {
    async fn submit(&self, job: JobRequest) -> Result<(), DispatchError> {
        let cancel = self.revocations.register(&job.dispatch_id);
        tracing::debug!(
            task_id = %job.task_id,
            dispatch_id = %job.dispatch_id,
            eta = ?job.eta,
            "submitting job to local queue"
        );
        self.tx
            .send(QueuedJob {
                request: job,
                cancel,
            })
            .map_err(|_| DispatchError::Closed)
    }

    async fn revoke(&self, dispatch_id: &str, terminate: bool) -> Result<(), DispatchError> {
        tracing::debug!(dispatch_id, terminate, "revoking dispatch");
        self.revocations.revoke(dispatch_id, terminate);
        Ok(())
    }
}
