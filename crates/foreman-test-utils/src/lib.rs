//! Disposable databases for foreman integration tests.
//!
//! [`create_test_db`] hands each test a [`TestDb`]: a uniquely-named
//! database on a shared PostgreSQL server, bootstrapped through the same
//! path production uses (`ensure_database_exists`, role-keyed [`Db`] pools,
//! runtime migrations). Tests therefore exercise the real rls/root pool
//! split and the RLS roles the migrations install, not a bespoke harness.
//!
//! The server comes from `FOREMAN_TEST_PG_URL` when set (so an external
//! instance, e.g. one started by a nextest setup script, is reused as-is);
//! otherwise a testcontainers PostgreSQL is started once per test binary.

use sqlx::{Connection, Executor, PgConnection, PgPool};
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use foreman_db::config::DbConfig;
use foreman_db::pool;
use foreman_db::Db;

struct PgServer {
    /// Root URL of the server, no database segment.
    url: String,
    /// Keeps the container alive for the test binary's lifetime; absent
    /// when an external server is used.
    _container: Option<ContainerAsync<Postgres>>,
}

static PG_SERVER: OnceCell<PgServer> = OnceCell::const_new();

async fn start_server() -> PgServer {
    if let Ok(url) = std::env::var("FOREMAN_TEST_PG_URL") {
        return PgServer {
            url,
            _container: None,
        };
    }

    let container = Postgres::default()
        .with_tag("18")
        .start()
        .await
        .expect("postgres container failed to start");
    let host = container.get_host().await.expect("container has no host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("container has no mapped port");

    PgServer {
        url: format!("postgresql://postgres:postgres@{host}:{port}"),
        _container: Some(container),
    }
}

async fn server_url() -> &'static str {
    &PG_SERVER.get_or_init(start_server).await.url
}

/// One test's database: migrated schema plus the role-keyed pools, wired
/// exactly the way the server wires them.
pub struct TestDb {
    /// Pools for tenant-scoped and root work over the temporary database.
    pub db: Db,
    server: String,
    name: String,
}

impl TestDb {
    /// The privileged pool, for fixtures and assertions that must bypass
    /// the row-level policies.
    pub fn admin(&self) -> &PgPool {
        self.db.root_pool()
    }

    /// Close the pools and drop the temporary database.
    ///
    /// Cleanup is best-effort: a test that already tore the server down
    /// should not fail again here.
    pub async fn done(self) {
        self.db.close().await;

        let maintenance_url = format!("{}/postgres", self.server);
        let Ok(mut conn) = PgConnection::connect(&maintenance_url).await else {
            return;
        };
        let _ = sqlx::query(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = $1 AND pid <> pg_backend_pid()",
        )
        .bind(&self.name)
        .execute(&mut conn)
        .await;
        let drop_stmt = format!("DROP DATABASE IF EXISTS \"{}\"", self.name);
        let _ = conn.execute(drop_stmt.as_str()).await;
        let _ = conn.close().await;
    }
}

/// Create a fresh database with migrations applied and both role pools
/// connected. Call [`TestDb::done`] when the test finishes.
pub async fn create_test_db() -> TestDb {
    let server = server_url().await;
    let name = format!("foreman_test_{}", Uuid::new_v4().simple());
    let config = DbConfig::new(format!("{server}/{name}"));

    pool::ensure_database_exists(&config)
        .await
        .unwrap_or_else(|e| panic!("failed to create test database {name}: {e:#}"));
    let db = pool::create_db(&config)
        .await
        .unwrap_or_else(|e| panic!("failed to connect to test database {name}: {e:#}"));
    pool::run_migrations(db.root_pool(), pool::default_migrations_path())
        .await
        .expect("migrations should apply to a fresh database");

    TestDb {
        db,
        server: server.to_owned(),
        name,
    }
}
