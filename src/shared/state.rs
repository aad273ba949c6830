use std::sync::Arc;

use crate::config::AppConfig;
use crate::realtime::Notifier;
use crate::shared::utils::DbPool;

/// Shared application state handed to every router.
pub struct AppState {
    pub conn: DbPool,
    pub config: AppConfig,
    pub notifier: Arc<Notifier>,
}

impl AppState {
    pub fn new(conn: DbPool, config: AppConfig) -> Self {
        Self {
            conn,
            config,
            notifier: Arc::new(Notifier::new()),
        }
    }
}
