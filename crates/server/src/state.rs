//! Application state shared across handlers.

use std::sync::Arc;
use twinstore_core::config::AppConfig;
use twinstore_sync::SyncEngine;

/// State handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: SyncEngine,
}

impl AppState {
    pub fn new(config: AppConfig, engine: SyncEngine) -> Self {
        Self {
            config: Arc::new(config),
            engine,
        }
    }
}
