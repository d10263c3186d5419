//! Cross-replica consistency verification.
//!
//! Walks one object kind on a source replica, confirms every object created
//! after a checkpoint is present on every other replica, and for blobs that
//! the content hashes agree. Verification only reads; the checkpoint moves
//! forward only after a clean pass.

use crate::error::{SyncError, SyncResult};
use crate::metrics;
use crate::replicas::ReplicaSet;
use futures::StreamExt;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use twinstore_core::{ContentHash, ObjectKind, ObjectRef, ReplicaId};
use twinstore_metadata::MetadataStore;
use twinstore_storage::{ListingOptions, ObjectStore, ObjectStoreListExt, StorageError};

/// Chunk size for streaming hashes.
const HASH_CHUNK: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    Missing,
    SizeDiffers,
    HashDiffers,
    /// The replica could not be read.
    Unreadable,
}

impl fmt::Display for MismatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Missing => "missing",
            Self::SizeDiffers => "size differs",
            Self::HashDiffers => "hash differs",
            Self::Unreadable => "unreadable",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mismatch {
    pub key: String,
    pub replica: String,
    pub kind: MismatchKind,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub kind: ObjectKind,
    pub source: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub since: Option<OffsetDateTime>,
    pub verified: u64,
    /// Latest creation time examined; where a clean pass may advance the checkpoint to.
    #[serde(with = "time::serde::rfc3339::option")]
    pub new_checkpoint: Option<OffsetDateTime>,
    pub mismatches: Vec<Mismatch>,
    /// Whether the stored checkpoint was advanced.
    pub checkpoint_advanced: bool,
}

impl VerificationReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}

pub struct Verifier {
    replicas: Arc<ReplicaSet>,
    page_size: usize,
    probe_timeout: Duration,
}

impl Verifier {
    pub fn new(replicas: Arc<ReplicaSet>, page_size: usize, probe_timeout: Duration) -> Self {
        Self {
            replicas,
            page_size,
            probe_timeout,
        }
    }

    /// Check every `kind` object on `source` created after `since` against
    /// the other replicas. Reads only.
    pub async fn verify(
        &self,
        kind: ObjectKind,
        source: &ReplicaId,
        since: Option<OffsetDateTime>,
    ) -> SyncResult<VerificationReport> {
        let source_store = self.replicas.get(source)?.as_ref();
        let prefix = format!("{}/", kind.prefix());
        let mut entries = source_store.list_entries(&prefix, Some(ListingOptions::new(self.page_size)));

        let mut report = VerificationReport {
            kind,
            source: source.to_string(),
            since,
            verified: 0,
            new_checkpoint: None,
            mismatches: Vec::new(),
            checkpoint_advanced: false,
        };

        while let Some(entry) = entries.next().await {
            let entry = entry.map_err(|e| SyncError::storage(source.as_str(), e))?;
            let Ok(object) = ObjectRef::from_storage_key(&entry.key) else {
                tracing::debug!(key = %entry.key, "Skipping unreplicable key");
                continue;
            };
            if object.kind != kind {
                continue;
            }
            if let (Some(since), Some(created)) = (since, entry.last_modified)
                && created <= since
            {
                continue;
            }

            let source_hash = if kind == ObjectKind::Blob {
                match self.hash(source.as_str(), source_store, &entry.key, entry.size).await {
                    Ok(hash) => Some(hash),
                    Err(e) => {
                        report.mismatches.push(Mismatch {
                            key: entry.key.clone(),
                            replica: source.to_string(),
                            kind: MismatchKind::Unreadable,
                            detail: Some(e.to_string()),
                        });
                        continue;
                    }
                }
            } else {
                None
            };

            for (replica, store) in self.replicas.others(source) {
                if let Some(mismatch) = self
                    .check_replica(replica.as_str(), store.as_ref(), &entry.key, entry.size, source_hash)
                    .await
                {
                    tracing::warn!(
                        key = %entry.key,
                        replica = %replica,
                        problem = %mismatch.0,
                        "Replica mismatch"
                    );
                    report.mismatches.push(Mismatch {
                        key: entry.key.clone(),
                        replica: replica.to_string(),
                        kind: mismatch.0,
                        detail: mismatch.1,
                    });
                }
            }

            report.verified += 1;
            if let Some(created) = entry.last_modified {
                report.new_checkpoint = report.new_checkpoint.max(Some(created));
            }
        }

        if !report.mismatches.is_empty() {
            metrics::VERIFY_MISMATCHES
                .with_label_values(&[kind.as_str()])
                .inc_by(report.mismatches.len() as u64);
        }
        tracing::info!(
            kind = %kind,
            source = %source,
            verified = report.verified,
            mismatches = report.mismatches.len(),
            "Verification pass complete"
        );
        Ok(report)
    }

    /// Verify from the stored checkpoint (or `since`, if given) and advance the
    /// checkpoint after a clean pass unless `dry_run`.
    ///
    /// The checkpoint never moves backward and never past the latest creation
    /// time examined. A `since` later than the stored checkpoint (or given when
    /// none is stored) leaves it alone.
    pub async fn verify_and_checkpoint(
        &self,
        metadata: &dyn MetadataStore,
        kind: ObjectKind,
        source: &ReplicaId,
        since: Option<OffsetDateTime>,
        dry_run: bool,
    ) -> SyncResult<VerificationReport> {
        let stored = match metadata.get_checkpoint(kind.as_str()).await? {
            Some(row) => Some(row.checkpoint()?),
            None => None,
        };
        let mut report = self.verify(kind, source, since.or(stored)).await?;

        // A window opening after the stored checkpoint skipped objects in between.
        let covers_stored = since.is_none_or(|since| stored.is_some_and(|stored| since <= stored));
        if dry_run || !report.is_clean() {
            return Ok(report);
        }
        if !covers_stored {
            tracing::info!(
                kind = %kind,
                since = ?since,
                stored = ?stored,
                "Window starts after the stored checkpoint; not advancing"
            );
            return Ok(report);
        }
        let Some(examined) = report.new_checkpoint else {
            return Ok(report);
        };
        if stored.is_some_and(|stored| examined <= stored) {
            return Ok(report);
        }

        report.checkpoint_advanced = metadata
            .compare_and_set_checkpoint(kind.as_str(), stored, examined)
            .await?;
        if report.checkpoint_advanced {
            tracing::info!(kind = %kind, checkpoint = %examined, "Verification checkpoint advanced");
        } else {
            tracing::warn!(kind = %kind, "Checkpoint moved concurrently; not advanced");
        }
        Ok(report)
    }

    async fn check_replica(
        &self,
        replica: &str,
        store: &dyn ObjectStore,
        key: &str,
        size: u64,
        source_hash: Option<ContentHash>,
    ) -> Option<(MismatchKind, Option<String>)> {
        let meta = match tokio::time::timeout(self.probe_timeout, store.head(key)).await {
            Ok(Ok(meta)) => meta,
            Ok(Err(StorageError::NotFound(_))) => return Some((MismatchKind::Missing, None)),
            Ok(Err(e)) => return Some((MismatchKind::Unreadable, Some(e.to_string()))),
            Err(_) => return Some((MismatchKind::Unreadable, Some("probe timed out".into()))),
        };
        if meta.size != size {
            return Some((
                MismatchKind::SizeDiffers,
                Some(format!("expected {size} bytes, found {}", meta.size)),
            ));
        }

        let expected = source_hash?;
        match self.hash(replica, store, key, meta.size).await {
            Ok(actual) if actual == expected => None,
            Ok(actual) => Some((
                MismatchKind::HashDiffers,
                Some(format!("expected {}, found {}", expected.to_hex(), actual.to_hex())),
            )),
            Err(e) => Some((MismatchKind::Unreadable, Some(e.to_string()))),
        }
    }

    /// Stream an object through the content hasher in ranged reads.
    async fn hash(
        &self,
        replica: &str,
        store: &dyn ObjectStore,
        key: &str,
        size: u64,
    ) -> SyncResult<ContentHash> {
        let mut hasher = ContentHash::hasher();
        let mut offset = 0;
        while offset < size {
            let end = (offset + HASH_CHUNK).min(size);
            let chunk = tokio::time::timeout(self.probe_timeout, store.get_range(key, offset, end))
                .await
                .map_err(|_| SyncError::Timeout {
                    op: "hash_range",
                    timeout: self.probe_timeout,
                })?
                .map_err(|e| SyncError::storage(replica, e))?;
            hasher.update(&chunk);
            offset = end;
        }
        Ok(hasher.finalize())
    }
}
