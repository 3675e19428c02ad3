use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, Executor, PgConnection, PgPool};
use tracing::info;

use crate::config::DbConfig;

/// Connection pools keyed by database role.
///
/// Tenant-scoped work runs on the `rls` pool; administrative (root) work on
/// the `root` pool. A single-URL deployment backs both with the same pool.
#[derive(Debug, Clone)]
pub struct Db {
    rls: PgPool,
    root: PgPool,
}

impl Db {
    /// Build from two role-specific pools.
    pub fn new(rls: PgPool, root: PgPool) -> Self {
        Self { rls, root }
    }

    /// Pool for tenant-scoped transactions.
    pub fn rls_pool(&self) -> &PgPool {
        &self.rls
    }

    /// Pool for root transactions.
    pub fn root_pool(&self) -> &PgPool {
        &self.root
    }

    /// Close both pools.
    pub async fn close(&self) {
        self.rls.close().await;
        self.root.close().await;
    }
}

/// Create the role-keyed connection pools.
///
/// Pool size follows the recommended maximum of 20 connections per role.
pub async fn create_db(config: &DbConfig) -> Result<Db> {
    let rls = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .with_context(|| format!("failed to connect to database at {}", config.database_url))?;

    let root_url = config.effective_root_url();
    let root = if root_url == config.database_url {
        rls.clone()
    } else {
        PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(10))
            .connect(root_url)
            .await
            .with_context(|| format!("failed to connect to database at {root_url}"))?
    };

    Ok(Db::new(rls, root))
}

/// Bring the schema up to date from the SQL files in `migrations_dir`.
///
/// Migrations are resolved at runtime, so compiling this crate never needs
/// a live database.
pub async fn run_migrations(pool: &PgPool, migrations_dir: &Path) -> Result<()> {
    let migrator = sqlx::migrate::Migrator::new(migrations_dir)
        .await
        .with_context(|| format!("no usable migrations under {}", migrations_dir.display()))?;

    migrator.run(pool).await.context("schema migration failed")?;

    info!(known = migrator.iter().count(), "schema is up to date");
    Ok(())
}

/// Create the configured database when it is missing.
///
/// `CREATE DATABASE` cannot take bind parameters, so the name is
/// interpolated as a quoted identifier over a direct connection to the
/// server's maintenance database.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<()> {
    let name = config
        .database_name()
        .context("database URL carries no database name")?;

    let maintenance_url = config.maintenance_url();
    let mut conn = PgConnection::connect(&maintenance_url)
        .await
        .with_context(|| format!("failed to reach maintenance database at {maintenance_url}"))?;

    let missing: bool =
        sqlx::query_scalar("SELECT NOT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(name)
            .fetch_one(&mut conn)
            .await
            .context("failed to look up database in pg_database")?;

    if missing {
        let stmt = format!("CREATE DATABASE {}", quote_ident(name));
        conn.execute(stmt.as_str())
            .await
            .with_context(|| format!("CREATE DATABASE {name} failed"))?;
        info!(db = name, "created database");
    }

    let _ = conn.close().await;
    Ok(())
}

/// Double-quote an identifier for interpolation into DDL.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Row counts for the three foreman tables, shown by `foreman db-init`.
pub async fn table_counts(pool: &PgPool) -> Result<Vec<(String, i64)>> {
    let mut counts = Vec::with_capacity(3);
    for table in ["runs", "tasks", "run_data"] {
        let query = format!("SELECT COUNT(*) FROM {table}");
        let count: i64 = sqlx::query_scalar(&query)
            .fetch_one(pool)
            .await
            .with_context(|| format!("failed to count rows in {table}"))?;
        counts.push((table.to_owned(), count));
    }
    Ok(counts)
}

/// Migrations directory inside this crate's source tree.
///
/// `CARGO_MANIFEST_DIR` is baked in at compile time, which covers workspace
/// builds and tests; a packaged binary deployed without the source tree has
/// to ship the SQL files and point the migrator at them itself.
pub fn default_migrations_path() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
}
