use std::env;

use foreman_db::config::DbConfig;

/// Server configuration, read from `FOREMAN_*` environment variables with
/// defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db: DbConfig,
    /// Redis connection URL for the broker.
    pub redis_url: String,
    /// Pending-task queue name.
    pub tasks_queue: String,
    /// Completion-notification queue name.
    pub results_queue: String,
    /// HTTP listen port.
    pub port: u16,
    /// Environment label reported by the health endpoint.
    pub environment: String,
    /// Expected bearer token. When unset, the auth check is format-only.
    pub auth_token: Option<String>,
}

impl ServerConfig {
    pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
    pub const DEFAULT_PORT: u16 = 3000;

    /// Build a config from the environment.
    pub fn from_env() -> Self {
        let port = env::var("FOREMAN_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(Self::DEFAULT_PORT);
        Self {
            db: DbConfig::from_env(),
            redis_url: env::var("FOREMAN_REDIS_URL")
                .unwrap_or_else(|_| Self::DEFAULT_REDIS_URL.to_owned()),
            tasks_queue: env::var("FOREMAN_TASKS_QUEUE")
                .unwrap_or_else(|_| "foreman:tasks".to_owned()),
            results_queue: env::var("FOREMAN_RESULTS_QUEUE")
                .unwrap_or_else(|_| "foreman:results".to_owned()),
            port,
            environment: env::var("FOREMAN_ENV").unwrap_or_else(|_| "development".to_owned()),
            auth_token: env::var("FOREMAN_AUTH_TOKEN").ok(),
        }
    }

    /// Broker coordinates as served by the config endpoints.
    pub fn redis_coordinates(&self) -> RedisCoordinates {
        RedisCoordinates::from_url(&self.redis_url)
    }
}

/// Parsed pieces of a `redis://` URL, served to clients that enqueue work
/// themselves.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RedisCoordinates {
    pub host: String,
    pub port: u16,
    pub db: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl RedisCoordinates {
    /// Parse `redis://[user[:password]@]host[:port][/db]`.
    ///
    /// Unparseable parts fall back to defaults (localhost, 6379, db 0)
    /// rather than failing: the endpoint is informational.
    pub fn from_url(url: &str) -> Self {
        let rest = url
            .strip_prefix("redis://")
            .or_else(|| url.strip_prefix("rediss://"))
            .unwrap_or(url);

        let (auth, host_part) = match rest.rsplit_once('@') {
            Some((auth, host)) => (Some(auth), host),
            None => (None, rest),
        };
        let password = auth.and_then(|a| match a.split_once(':') {
            Some((_user, pass)) if !pass.is_empty() => Some(pass.to_owned()),
            _ => None,
        });

        let (addr, db_part) = match host_part.split_once('/') {
            Some((addr, db)) => (addr, Some(db)),
            None => (host_part, None),
        };
        let db = db_part.and_then(|d| d.parse().ok()).unwrap_or(0);

        let (host, port) = match addr.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().unwrap_or(6379)),
            None => (addr, 6379),
        };
        let host = if host.is_empty() { "localhost" } else { host };

        Self {
            host: host.to_owned(),
            port,
            db,
            password,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_host() {
        let coords = RedisCoordinates::from_url("redis://localhost:6379");
        assert_eq!(coords.host, "localhost");
        assert_eq!(coords.port, 6379);
        assert_eq!(coords.db, 0);
        assert!(coords.password.is_none());
    }

    #[test]
    fn parses_password_and_db() {
        let coords = RedisCoordinates::from_url("redis://:sekret@cache.internal:6380/2");
        assert_eq!(coords.host, "cache.internal");
        assert_eq!(coords.port, 6380);
        assert_eq!(coords.db, 2);
        assert_eq!(coords.password.as_deref(), Some("sekret"));
    }

    #[test]
    fn defaults_for_partial_urls() {
        let coords = RedisCoordinates::from_url("redis://cache");
        assert_eq!(coords.host, "cache");
        assert_eq!(coords.port, 6379);
        assert_eq!(coords.db, 0);
    }
}
