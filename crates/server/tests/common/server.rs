//! Server test utilities.

use std::sync::Arc;
use tempfile::TempDir;
use twinstore_core::ReplicaId;
use twinstore_core::config::AppConfig;
use twinstore_metadata::{MetadataStore, SqliteStore};
use twinstore_server::{AppState, create_router};
use twinstore_storage::MemoryBackend;
use twinstore_sync::{ReplicaSet, SyncEngine};

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub primary: Arc<MemoryBackend>,
    pub secondary: Arc<MemoryBackend>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a test server over two in-memory replicas, "primary" and "secondary".
    pub async fn new() -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let db_path = temp_dir.path().join("twinstore.db");
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(&db_path)
                .await
                .expect("Failed to create metadata store"),
        );

        let primary = Arc::new(MemoryBackend::new());
        let secondary = Arc::new(MemoryBackend::new());
        let mut replicas = ReplicaSet::new();
        replicas.insert(ReplicaId::new("primary"), primary.clone());
        replicas.insert(ReplicaId::new("secondary"), secondary.clone());

        let mut config = AppConfig::for_testing();
        config.metadata.path = db_path;
        config.sync.retry_base_delay_ms = 1;
        config.sync.retry_max_delay_ms = 5;

        let engine = SyncEngine::new(&config.sync, replicas, metadata);
        let state = AppState::new(config, engine);
        let router = create_router(state.clone());

        Self {
            router,
            state,
            primary,
            secondary,
            _temp_dir: temp_dir,
        }
    }

    /// Get access to the underlying metadata.
    pub fn metadata(&self) -> Arc<dyn MetadataStore> {
        self.state.engine.metadata.clone()
    }
}
