use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_rusqlite::Connection;

use crate::config::AppConfig;
use crate::db;

/// Shared state for one process: the loaded config and the optional run history.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub db: Option<Connection>,
}

impl AppContext {
    pub fn new(config: AppConfig, db: Option<Connection>) -> Self {
        Self {
            config: Arc::new(config),
            db,
        }
    }

    /// Open the history database named in the config, if any.
    pub async fn init(config: AppConfig) -> Result<Self> {
        let db = match &config.paths.history_db {
            Some(path) => Some(
                db::init(path)
                    .await
                    .with_context(|| format!("Failed to open run history at {}", path.display()))?,
            ),
            None => None,
        };
        Ok(Self::new(config, db))
    }
}
