mod config;
mod rpc;
mod serve;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use heron_db::config::DbConfig;
use heron_db::pool;

use config::ServerConfig;

#[derive(Parser)]
#[command(name = "heron", about = "Durable task orchestrator for LLM prompt executions")]
struct Cli {
    /// Database URL (overrides HERON_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database if needed and apply migrations
    DbInit,
    /// Run the RPC server with the in-process worker pool
    Serve {
        /// Interface to bind
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
        /// Number of concurrent worker slots
        #[arg(long)]
        workers: Option<usize>,
    },
}

fn db_config(cli: &Cli) -> Result<DbConfig> {
    let config = match &cli.database_url {
        Some(url) => DbConfig::parse(url.clone())?,
        None => DbConfig::from_env()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("heron=info")),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::DbInit => {
            let db = db_config(&cli)?;
            let created = pool::ensure_database_exists(&db).await?;
            let pg = pool::connect(&db).await?;
            pool::run_migrations(&pg).await?;
            if created {
                println!("database {} created and migrated", db.database());
            } else {
                println!("database {} migrated", db.database());
            }
            Ok(())
        }
        Commands::Serve {
            bind,
            port,
            workers,
        } => {
            let db = db_config(&cli)?;
            let mut server = ServerConfig::from_env();
            if let Some(bind) = bind {
                server.bind = bind.clone();
            }
            if let Some(port) = port {
                server.port = *port;
            }
            if let Some(workers) = workers {
                server.workers = (*workers).max(1);
            }

            let pg = pool::connect(&db).await?;
            serve::run_serve(pg, &server).await
        }
    }
}
