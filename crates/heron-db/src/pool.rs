//! Connection pool, liveness probe, and migration runner.
//!
//! `db-init` provisions a database with [`ensure_database_exists`] +
//! [`run_migrations`]; the server and the test harness connect through
//! [`connect`] and probe through [`ping`]. All of it is driven by the
//! validated [`DbConfig`], so no raw URL string manipulation happens here.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::info;

use crate::config::DbConfig;

/// Migrations shipped with this crate, resolved at compile time.
const MIGRATIONS_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/migrations");

const MAX_CONNECTIONS: u32 = 10;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Open a pool against the configured database.
pub async fn connect(config: &DbConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_with(config.connect_options())
        .await
        .with_context(|| format!("failed to connect to database {:?}", config.database()))?;
    Ok(pool)
}

/// Cheap liveness probe. Used by the health endpoint.
pub async fn ping(pool: &PgPool) -> Result<()> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .context("database ping failed")?;
    Ok(())
}

/// Apply all pending schema migrations.
///
/// Loads the SQL files from this crate's `migrations/` directory with a
/// runtime `Migrator`, so building the workspace never needs a live
/// database (unlike the `sqlx::migrate!()` macro).
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let dir = Path::new(MIGRATIONS_DIR);
    let migrator = sqlx::migrate::Migrator::new(dir)
        .await
        .with_context(|| format!("failed to load migrations from {}", dir.display()))?;

    migrator
        .run(pool)
        .await
        .context("failed to run database migrations")?;

    info!("migrations applied");
    Ok(())
}

/// Create the configured database if it is absent.
///
/// Connects to the maintenance database and issues `CREATE DATABASE`;
/// the database name is safe to interpolate because [`DbConfig::parse`]
/// restricts it to `[A-Za-z0-9_]`. Returns `true` when the database was
/// created, `false` when it already existed.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<bool> {
    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_with(config.maintenance_options())
        .await
        .context("failed to connect to maintenance database")?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(config.database())
            .fetch_one(&maint_pool)
            .await
            .context("failed to query pg_database")?;

    let created = if exists {
        info!(db = config.database(), "database already exists");
        false
    } else {
        let stmt = format!("CREATE DATABASE {}", config.database());
        maint_pool
            .execute(stmt.as_str())
            .await
            .with_context(|| format!("failed to create database {}", config.database()))?;
        info!(db = config.database(), "database created");
        true
    };

    maint_pool.close().await;
    Ok(created)
}
