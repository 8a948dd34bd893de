//! Database harness for heron's integration tests.
//!
//! Every test owns a throwaway database: [`TestDb::new`] provisions it
//! through the same `heron_db` config/pool path the binary uses (create,
//! connect, migrate), sanity-checks that the heron schema actually landed,
//! and [`TestDb::finish`] drops it again. All databases live on one shared
//! PostgreSQL server:
//!
//! - **`HERON_TEST_PG_URL`** set (CI setup script): an externally managed
//!   server; the value is the server root URL without a database name.
//! - **Unset** (`cargo test`): a testcontainers instance started once per
//!   test binary and kept alive for its lifetime.

use std::sync::atomic::{AtomicU32, Ordering};

use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

use heron_db::config::DbConfig;
use heron_db::pool;

/// Tables a freshly migrated database must contain. Catches an empty or
/// mis-resolved migrations directory before a test fails confusingly.
const CORE_TABLES: [&str; 4] = ["tasks", "task_executions", "task_chains", "task_chain_edges"];

/// Counter giving each test database in this process a distinct name.
static NEXT_DB: AtomicU32 = AtomicU32::new(0);

static SERVER: OnceCell<PgServer> = OnceCell::const_new();

/// The shared PostgreSQL server and, when testcontainers started it, the
/// container handle keeping it alive.
struct PgServer {
    base_url: String,
    _container: Option<ContainerAsync<Postgres>>,
}

impl PgServer {
    async fn get() -> &'static PgServer {
        SERVER.get_or_init(PgServer::start).await
    }

    async fn start() -> PgServer {
        if let Ok(url) = std::env::var("HERON_TEST_PG_URL") {
            return PgServer {
                base_url: url,
                _container: None,
            };
        }

        let container = Postgres::default()
            .with_tag("18")
            .start()
            .await
            .expect("failed to start PostgreSQL container");
        let host = container.get_host().await.expect("failed to get host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("failed to get mapped port");

        PgServer {
            base_url: format!("postgresql://postgres:postgres@{host}:{port}"),
            _container: Some(container),
        }
    }

    /// Validated config for a database on this server.
    fn config_for(&self, database: &str) -> DbConfig {
        DbConfig::parse(format!("{}/{database}", self.base_url))
            .expect("test database URL should be valid")
    }
}

/// A throwaway database with the heron schema applied.
pub struct TestDb {
    pub pool: PgPool,
    config: DbConfig,
}

impl TestDb {
    /// Provision a fresh database and apply migrations.
    pub async fn new() -> Self {
        let server = PgServer::get().await;
        let seq = NEXT_DB.fetch_add(1, Ordering::Relaxed);
        let name = format!("heron_test_{}_{seq}", std::process::id());
        let config = server.config_for(&name);

        let created = pool::ensure_database_exists(&config)
            .await
            .expect("failed to create test database");
        assert!(created, "test database {name} already existed");

        let pool = pool::connect(&config)
            .await
            .expect("failed to connect to test database");
        pool::run_migrations(&pool)
            .await
            .expect("migrations should apply cleanly");

        for table in CORE_TABLES {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM pg_tables \
                 WHERE schemaname = 'public' AND tablename = $1)",
            )
            .bind(table)
            .fetch_one(&pool)
            .await
            .expect("schema probe failed");
            assert!(exists, "migrations did not create the {table} table");
        }

        Self { pool, config }
    }

    /// Close the pool and drop the database.
    ///
    /// Lingering connections are terminated first so the drop cannot hang
    /// on a pool that a test forgot to release.
    pub async fn finish(self) {
        self.pool.close().await;

        let maint_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(self.config.maintenance_options())
            .await
            .expect("failed to connect to maintenance database for cleanup");

        // The database name came out of DbConfig::parse, so interpolating
        // it is safe; neither statement can be parameterised.
        let name = self.config.database();
        let terminate = format!(
            "SELECT pg_terminate_backend(pid) \
             FROM pg_stat_activity \
             WHERE datname = '{name}' AND pid <> pg_backend_pid()"
        );
        let _ = maint_pool.execute(terminate.as_str()).await;
        let _ = maint_pool
            .execute(format!("DROP DATABASE IF EXISTS {name}").as_str())
            .await;
        maint_pool.close().await;
    }
}
