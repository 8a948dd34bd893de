//! The LLM execution handler -- drives one attempt from `running` to a
//! terminal state.
//!
//! Three phases:
//! 1. Short transaction: mark the attempt running and read the prompt.
//! 2. Provider call, with **no database transaction held**.
//! 3. Short transaction: record completion with usage metrics, or record
//!    the categorized failure and re-raise so the runtime logs it.
//!
//! Retries, cancellation races, and duplicate callbacks are all resolved by
//! the latest-dispatch and terminal-state guards in the storage layer; this
//! handler stays oblivious to them.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use heron_db::models::TaskStatus;
use heron_db::queries::tasks::ExecutionUsage;

use crate::dispatch::EXECUTE_LLM;
use crate::llm::LlmClient;
use crate::service::TaskService;

use super::registry::{JobContext, JobHandler};

/// Handler for [`EXECUTE_LLM`] jobs.
pub struct ExecuteLlmHandler {
    service: Arc<TaskService>,
    llm: Arc<dyn LlmClient>,
}

impl ExecuteLlmHandler {
    pub fn new(service: Arc<TaskService>, llm: Arc<dyn LlmClient>) -> Self {
        Self { service, llm }
    }
}

#[async_trait]
impl JobHandler for ExecuteLlmHandler {
    fn name(&self) -> &str {
        EXECUTE_LLM
    }

    async fn run(&self, ctx: &JobContext) -> Result<()> {
        // Phase 1: mark running, read the prompt.
        let task = self
            .service
            .mark_task_running(ctx.task_id, &ctx.dispatch_id, Some(&ctx.worker_id))
            .await?;

        if task.status != TaskStatus::Running {
            // The transition was a no-op: the task is terminal or this
            // dispatch is stale. Nothing to execute.
            tracing::info!(
                task_id = %ctx.task_id,
                dispatch_id = %ctx.dispatch_id,
                status = %task.status,
                "skipping execution; attempt is stale or task is terminal"
            );
            return Ok(());
        }

        tracing::info!(
            task_id = %ctx.task_id,
            dispatch_id = %ctx.dispatch_id,
            worker_id = %ctx.worker_id,
            "executing task"
        );

        // Phase 2: call the provider, racing a terminate-revoke.
        let generation = tokio::select! {
            result = self.llm.generate(&task.prompt) => result,
            _ = ctx.cancel.cancelled() => {
                // The user already cancelled the task; the storage layer has
                // recorded it. Abandon the provider call.
                tracing::info!(
                    task_id = %ctx.task_id,
                    dispatch_id = %ctx.dispatch_id,
                    "execution interrupted by revoke"
                );
                return Ok(());
            }
        };

        // Phase 3: record the outcome.
        match generation {
            Ok(generation) => {
                self.service
                    .mark_task_completed(
                        ctx.task_id,
                        &ctx.dispatch_id,
                        &generation.output_text,
                        &ExecutionUsage {
                            model_name: generation.model_name.clone(),
                            prompt_tokens: generation.prompt_tokens,
                            completion_tokens: generation.completion_tokens,
                            total_tokens: generation.total_tokens,
                        },
                    )
                    .await?;
                tracing::info!(
                    task_id = %ctx.task_id,
                    dispatch_id = %ctx.dispatch_id,
                    total_tokens = ?generation.total_tokens,
                    "task completed"
                );
                Ok(())
            }
            Err(e) => {
                self.service
                    .mark_task_failed(ctx.task_id, &ctx.dispatch_id, &e.to_string(), e.kind())
                    .await?;
                tracing::warn!(
                    task_id = %ctx.task_id,
                    dispatch_id = %ctx.dispatch_id,
                    error_type = e.kind(),
                    error = %e,
                    "task failed"
                );
                // Re-raise so the worker runtime records the failure too.
                Err(e.into())
            }
        }
    }
}
