//! Shared fixtures for sync engine integration tests.

#![allow(dead_code)]

use bytes::Bytes;
use std::sync::Arc;
use tempfile::TempDir;
use time::OffsetDateTime;
use twinstore_core::config::SyncConfig;
use twinstore_core::{
    BundleEntry, BundleManifest, ContentHash, FileManifest, Manifest, ManifestVersion, ObjectKey,
    ObjectKind, ObjectRef, ReplicaId, SourceKind, SyncTask,
};
use twinstore_metadata::{MetadataStore, SqliteStore};
use twinstore_storage::{MemoryBackend, ObjectStore};
use twinstore_sync::{ReplicaSet, SyncEngine};
use uuid::Uuid;

/// Part size used by the tests: small enough to build multi-part objects cheaply.
pub const PART_SIZE: u64 = 64 * 1024;

pub fn test_config() -> SyncConfig {
    SyncConfig {
        part_size: PART_SIZE,
        dependency_poll_interval_secs: 8,
        dependency_deadline_secs: 3600,
        copy_attempts: 3,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        operation_timeout_secs: 30,
        worker_concurrency: 4,
        ..SyncConfig::default()
    }
}

/// Two in-memory replicas ("primary", "secondary") and a SQLite coordination store.
pub struct Harness {
    pub config: SyncConfig,
    pub primary: Arc<MemoryBackend>,
    pub secondary: Arc<MemoryBackend>,
    pub metadata: Arc<dyn MetadataStore>,
    pub engine: SyncEngine,
    _dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: SyncConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let metadata: Arc<dyn MetadataStore> =
            Arc::new(SqliteStore::new(dir.path().join("twinstore.db")).await.unwrap());

        let primary = Arc::new(MemoryBackend::new());
        let secondary = Arc::new(MemoryBackend::new());
        let mut replicas = ReplicaSet::new();
        replicas.insert(ReplicaId::new("primary"), primary.clone());
        replicas.insert(ReplicaId::new("secondary"), secondary.clone());

        let engine = SyncEngine::new(&config, replicas, metadata.clone());
        Self {
            config,
            primary,
            secondary,
            metadata,
            engine,
            _dir: dir,
        }
    }

    /// A task copying `object` from primary to secondary.
    pub fn task(&self, object: ObjectRef, size: Option<u64>) -> SyncTask {
        SyncTask::new(
            SourceKind::StoreEvent,
            ReplicaId::new("primary"),
            ReplicaId::new("secondary"),
            object,
            size,
        )
    }

    /// Submit `task` and process everything due now.
    pub async fn sync(&self, task: SyncTask) -> OffsetDateTime {
        self.engine.submit(task).await.unwrap();
        let now = OffsetDateTime::now_utc();
        self.drain(now).await;
        now
    }

    /// Process every queue item due at `now`.
    pub async fn drain(&self, now: OffsetDateTime) -> usize {
        self.engine.worker.process_due_at(now).await.unwrap()
    }
}

/// Deterministic bytes of the given length.
pub fn payload(len: usize, seed: u8) -> Bytes {
    Bytes::from(
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect::<Vec<u8>>(),
    )
}

pub async fn put_blob(store: &dyn ObjectStore, data: Bytes) -> ObjectRef {
    let object = ObjectRef::new(ObjectKind::Blob, ObjectKey::blob(&ContentHash::compute(&data)));
    store.put(&object.storage_key(), data).await.unwrap();
    object
}

pub async fn put_manifest(store: &dyn ObjectStore, manifest: &Manifest) -> ObjectRef {
    let object = manifest.object_ref();
    store
        .put(&object.storage_key(), Bytes::from(manifest.to_json().unwrap()))
        .await
        .unwrap();
    object
}

pub fn file_manifest(blob: &Bytes) -> FileManifest {
    FileManifest {
        uuid: Uuid::new_v4(),
        version: ManifestVersion::now(),
        content_type: "application/octet-stream".into(),
        size: blob.len() as u64,
        blob: ContentHash::compute(blob),
    }
}

pub fn bundle_of(files: &[FileManifest]) -> BundleManifest {
    BundleManifest {
        uuid: Uuid::new_v4(),
        version: ManifestVersion::now(),
        files: files
            .iter()
            .enumerate()
            .map(|(i, f)| BundleEntry {
                uuid: f.uuid,
                version: f.version,
                name: format!("file-{i}"),
            })
            .collect(),
    }
}
