mod auth;
mod config;
mod error;
mod routes;
mod serve;
mod state;
mod worker_cmd;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use foreman_db::config::DbConfig;
use foreman_db::pool;

use config::ServerConfig;
use state::AppState;

#[derive(Parser)]
#[command(name = "foreman", about = "Multi-tenant workflow orchestration service")]
struct Cli {
    /// Database URL (overrides FOREMAN_DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Listen port (overrides FOREMAN_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Start a queue worker with the built-in handlers
    Worker,
    /// Create the database (if needed) and run migrations
    DbInit,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut server_config = ServerConfig::from_env();
    if let Some(url) = cli.database_url {
        server_config.db = DbConfig::new(url);
    }

    match cli.command {
        Commands::Serve { port } => {
            let port = port.unwrap_or(server_config.port);
            let db = pool::create_db(&server_config.db)
                .await
                .context("failed to connect to database")?;
            serve::run_serve(AppState::new(db, server_config), port).await
        }
        Commands::Worker => worker_cmd::run_worker(&server_config).await,
        Commands::DbInit => {
            pool::ensure_database_exists(&server_config.db).await?;
            let db = pool::create_db(&server_config.db).await?;
            pool::run_migrations(db.root_pool(), pool::default_migrations_path()).await?;
            let counts = pool::table_counts(db.root_pool()).await?;
            println!("database initialized:");
            for (table, count) in counts {
                println!("  {table}: {count} rows");
            }
            Ok(())
        }
    }
}
