//! Wiring for `heron serve`: pool, dispatcher, worker pool, and the RPC
//! listener, with graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use heron_core::dispatch::LocalDispatcher;
use heron_core::llm::{ChatClient, LlmConfig};
use heron_core::service::TaskService;
use heron_core::worker::{ExecuteLlmHandler, WorkerPoolConfig, WorkerRegistry, run_worker_pool};

use crate::config::ServerConfig;
use crate::rpc::{AppState, build_router};

/// Run the server until ctrl-c.
///
/// Starts the in-process dispatcher and worker pool, then serves the RPC
/// surface. On shutdown the listener stops first, then the worker pool
/// drains its in-flight jobs.
pub async fn run_serve(pool: PgPool, config: &ServerConfig) -> Result<()> {
    let (dispatcher, queue) = LocalDispatcher::new();
    let revocations = dispatcher.revocations();
    let dispatcher: Arc<LocalDispatcher> = Arc::new(dispatcher);

    let service = Arc::new(TaskService::new(pool.clone(), dispatcher.clone()));

    let llm = Arc::new(ChatClient::new(LlmConfig::from_env()));
    let mut registry = WorkerRegistry::new();
    registry.register(Arc::new(ExecuteLlmHandler::new(service.clone(), llm)));
    let registry = Arc::new(registry);

    let shutdown = CancellationToken::new();
    let worker_shutdown = shutdown.clone();
    let worker_config = WorkerPoolConfig {
        concurrency: config.workers,
        ..WorkerPoolConfig::default()
    };
    let workers = tokio::spawn(run_worker_pool(
        queue,
        registry,
        revocations,
        worker_config,
        worker_shutdown,
    ));

    let app = build_router(AppState {
        service,
        pool: pool.clone(),
    });
    let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .context("invalid bind address")?;
    tracing::info!("heron serving on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("listener stopped; draining workers");
    shutdown.cancel();
    workers.await.context("worker pool panicked")??;

    tracing::info!("heron shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}
