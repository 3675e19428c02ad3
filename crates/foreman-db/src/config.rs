use std::env;

/// Database configuration.
///
/// Reads from `FOREMAN_DATABASE_URL`, falling back to
/// `postgresql://localhost:5432/foreman` when unset. A separate URL for the
/// unrestricted role may be given via `FOREMAN_DATABASE_ROOT_URL`; when
/// absent, root work shares the primary URL.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Connection URL for tenant-scoped work (the `rls` role).
    pub database_url: String,
    /// Connection URL for root work. `None` means "same as `database_url`".
    pub root_database_url: Option<String>,
}

impl DbConfig {
    /// The default connection URL used when no environment variable is set.
    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/foreman";

    /// Build a config from the environment.
    pub fn from_env() -> Self {
        let database_url =
            env::var("FOREMAN_DATABASE_URL").unwrap_or_else(|_| Self::DEFAULT_URL.to_owned());
        let root_database_url = env::var("FOREMAN_DATABASE_ROOT_URL").ok();
        Self {
            database_url,
            root_database_url,
        }
    }

    /// Build a config from an explicit URL (useful for tests and CLI flags).
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            root_database_url: None,
        }
    }

    /// The URL used for the unrestricted role's pool.
    pub fn effective_root_url(&self) -> &str {
        self.root_database_url.as_deref().unwrap_or(&self.database_url)
    }

    /// The database name, when the URL carries one.
    pub fn database_name(&self) -> Option<&str> {
        split_database_url(&self.database_url).map(|(_, name)| name)
    }

    /// URL of the `postgres` maintenance database on the same server.
    ///
    /// Bootstrap code connects here when the configured database may not
    /// exist yet.
    pub fn maintenance_url(&self) -> String {
        match split_database_url(&self.database_url) {
            Some((server, _)) => format!("{server}/postgres"),
            None => format!("{}/postgres", self.database_url.trim_end_matches('/')),
        }
    }
}

/// Split `postgresql://…/name` into the server part and the database name.
///
/// Returns `None` when there is no database segment, e.g. for a bare
/// `postgresql://host` server URL (the final `/` there would split inside
/// the scheme).
fn split_database_url(url: &str) -> Option<(&str, &str)> {
    let (server, name) = url.rsplit_once('/')?;
    if name.is_empty() || !server.contains("://") {
        return None;
    }
    Some((server, name))
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
