//! Dependency resolution.
//!
//! An object is ready to copy to a destination when everything it references
//! already exists there. Readiness checks existence only; content integrity
//! is the verifier's job.

use crate::error::{SyncError, SyncResult};
use futures::future::join_all;
use std::collections::BTreeSet;
use std::time::Duration;
use twinstore_core::{Manifest, ObjectKind, ObjectRef};
use twinstore_storage::ObjectStore;

/// Read the direct dependencies of `object` from the replica that holds it.
///
/// Blobs have none and are never read. A manifest that is missing or does
/// not parse is a permanent error.
pub async fn dependencies(
    source: &dyn ObjectStore,
    source_replica: &str,
    object: &ObjectRef,
) -> SyncResult<BTreeSet<ObjectRef>> {
    if object.kind == ObjectKind::Blob {
        return Ok(BTreeSet::new());
    }

    let key = object.storage_key();
    let body = source
        .get(&key)
        .await
        .map_err(|e| SyncError::source_read(source_replica, &key, e))?;

    let manifest = Manifest::parse(object.kind, &object.key, &body)?;
    Ok(manifest.dependencies())
}

/// Dependencies not confirmed present at the destination.
///
/// A probe that errors or times out counts as missing, so the result can
/// only err towards waiting longer.
pub async fn unconfirmed(
    destination: &dyn ObjectStore,
    deps: &BTreeSet<ObjectRef>,
    probe_timeout: Duration,
) -> Vec<ObjectRef> {
    let probes = deps.iter().map(|dep| async move {
        let key = dep.storage_key();
        match tokio::time::timeout(probe_timeout, destination.exists(&key)).await {
            Ok(Ok(true)) => None,
            Ok(Ok(false)) => Some(dep.clone()),
            Ok(Err(e)) => {
                tracing::debug!(key = %key, error = %e, "Dependency probe failed");
                Some(dep.clone())
            }
            Err(_) => {
                tracing::debug!(key = %key, "Dependency probe timed out");
                Some(dep.clone())
            }
        }
    });
    join_all(probes).await.into_iter().flatten().collect()
}

/// Whether every dependency exists at the destination. Side-effect free.
pub async fn ready(
    destination: &dyn ObjectStore,
    deps: &BTreeSet<ObjectRef>,
    probe_timeout: Duration,
) -> bool {
    let missing = unconfirmed(destination, deps, probe_timeout).await;
    if let Some(first) = missing.first() {
        tracing::debug!(
            missing = missing.len(),
            first_missing = %first,
            "Dependencies not yet at destination"
        );
    }
    missing.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use twinstore_core::{
        ContentHash, FileManifest, ManifestKey, ManifestVersion, ObjectKey,
    };
    use twinstore_storage::{MemoryBackend, StoreOp};
    use uuid::Uuid;

    const PROBE: Duration = Duration::from_secs(1);

    fn file_manifest(blob: ContentHash) -> (ObjectRef, Bytes) {
        let uuid = Uuid::new_v4();
        let version = ManifestVersion::now();
        let manifest = Manifest::File(FileManifest {
            uuid,
            version,
            content_type: "text/plain".into(),
            size: 5,
            blob,
        });
        let key = ObjectKey::manifest(&ManifestKey::new(uuid, version));
        (
            ObjectRef::new(ObjectKind::FileManifest, key),
            Bytes::from(manifest.to_json().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_blob_is_always_ready() {
        let source = MemoryBackend::new();
        let blob = ObjectRef::new(ObjectKind::Blob, ObjectKey::blob(&ContentHash::compute(b"x")));
        let deps = dependencies(&source, "primary", &blob).await.unwrap();
        assert!(deps.is_empty());
        assert!(ready(&MemoryBackend::new(), &deps, PROBE).await);
        assert_eq!(source.calls(StoreOp::Get), 0);
    }

    #[tokio::test]
    async fn test_file_manifest_waits_for_its_blob() {
        let hash = ContentHash::compute(b"hello");
        let (file, body) = file_manifest(hash);
        let source = MemoryBackend::new();
        source.put(&file.storage_key(), body).await.unwrap();

        let deps = dependencies(&source, "primary", &file).await.unwrap();
        assert_eq!(deps.len(), 1);

        let destination = MemoryBackend::new();
        assert!(!ready(&destination, &deps, PROBE).await);
        // Idempotent: asking again changes nothing.
        assert!(!ready(&destination, &deps, PROBE).await);

        destination
            .put(&format!("blobs/{}", hash.to_hex()), Bytes::from("hello"))
            .await
            .unwrap();
        assert!(ready(&destination, &deps, PROBE).await);
    }

    #[tokio::test]
    async fn test_probe_error_reads_as_not_ready() {
        let hash = ContentHash::compute(b"hello");
        let (file, body) = file_manifest(hash);
        let source = MemoryBackend::new();
        source.put(&file.storage_key(), body).await.unwrap();
        let deps = dependencies(&source, "primary", &file).await.unwrap();

        let destination = MemoryBackend::new();
        destination
            .put(&format!("blobs/{}", hash.to_hex()), Bytes::from("hello"))
            .await
            .unwrap();
        destination.fail_always(StoreOp::Exists);
        assert!(!ready(&destination, &deps, PROBE).await);
    }

    #[tokio::test]
    async fn test_missing_or_corrupt_manifest_is_permanent() {
        let (file, _) = file_manifest(ContentHash::compute(b"hello"));
        let source = MemoryBackend::new();
        let err = dependencies(&source, "primary", &file).await.unwrap_err();
        assert!(matches!(err, SyncError::SourceMissing { .. }));

        source
            .put(&file.storage_key(), Bytes::from("{not json"))
            .await
            .unwrap();
        let err = dependencies(&source, "primary", &file).await.unwrap_err();
        assert!(err.is_permanent());
    }
}
