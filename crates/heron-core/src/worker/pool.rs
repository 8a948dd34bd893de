//! Worker pool: consumes the dispatch queue and runs jobs with bounded
//! concurrency.
//!
//! Each job waits out its ETA, re-checks revocation, resolves its handler
//! through the registry, and runs in its own spawned task gated by a
//! semaphore permit. Shutdown stops intake and waits for in-flight jobs.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::dispatch::local::{JobReceiver, QueuedJob, RevocationTable};

use super::registry::{JobContext, WorkerRegistry};

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Maximum number of concurrently running jobs.
    pub concurrency: usize,
    /// Identifier recorded as `worker_id` on attempts this pool runs.
    pub worker_id: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            worker_id: format!("heron-worker-{}", std::process::id()),
        }
    }
}

/// Run the worker pool until the queue closes or `shutdown` fires.
pub async fn run_worker_pool(
    mut queue: JobReceiver,
    registry: Arc<WorkerRegistry>,
    revocations: Arc<RevocationTable>,
    config: WorkerPoolConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let mut in_flight = JoinSet::new();

    tracing::info!(
        concurrency = config.concurrency,
        worker_id = %config.worker_id,
        handlers = ?registry.list(),
        "worker pool started"
    );

    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = queue.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => {
                permit.expect("worker semaphore closed")
            }
        };

        let registry = Arc::clone(&registry);
        let revocations = Arc::clone(&revocations);
        let worker_id = config.worker_id.clone();
        in_flight.spawn(async move {
            let _permit = permit;
            run_one_job(job, registry, revocations, worker_id).await;
        });

        // Reap any jobs that already finished.
        while in_flight.try_join_next().is_some() {}
    }

    // Drain in-flight jobs before returning.
    while in_flight.join_next().await.is_some() {}

    tracing::info!("worker pool stopped");
    Ok(())
}

async fn run_one_job(
    job: QueuedJob,
    registry: Arc<WorkerRegistry>,
    revocations: Arc<RevocationTable>,
    worker_id: String,
) {
    let QueuedJob { request, cancel } = job;
    let dispatch_id = request.dispatch_id.clone();

    // Honor the ETA. The broker's delivery time is authoritative; a revoke
    // while waiting drops the job before it ever starts.
    if let Some(eta) = request.eta {
        let delay = (eta - Utc::now()).to_std().unwrap_or_default();
        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    tracing::info!(
                        task_id = %request.task_id,
                        dispatch_id = %dispatch_id,
                        "job revoked while waiting for ETA"
                    );
                    revocations.remove(&dispatch_id);
                    return;
                }
            }
        }
    }

    if !revocations.mark_started(&dispatch_id) {
        tracing::info!(
            task_id = %request.task_id,
            dispatch_id = %dispatch_id,
            "dropping revoked job"
        );
        revocations.remove(&dispatch_id);
        return;
    }

    let Some(handler) = registry.get(&request.job_name) else {
        tracing::error!(
            task_id = %request.task_id,
            job_name = %request.job_name,
            "no handler registered for job"
        );
        revocations.remove(&dispatch_id);
        return;
    };

    let ctx = JobContext {
        task_id: request.task_id,
        dispatch_id: dispatch_id.clone(),
        worker_id,
        cancel,
    };

    if let Err(e) = handler.run(&ctx).await {
        tracing::warn!(
            task_id = %ctx.task_id,
            dispatch_id = %ctx.dispatch_id,
            error = %e,
            "job handler returned error"
        );
    }

    revocations.remove(&dispatch_id);
}
