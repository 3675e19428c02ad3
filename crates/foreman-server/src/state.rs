use std::sync::Arc;

use foreman_db::Db;

use crate::config::ServerConfig;

/// Shared handler state: the role-keyed pools and the server configuration.
#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(db: Db, config: ServerConfig) -> Self {
        Self {
            db,
            config: Arc::new(config),
        }
    }
}
