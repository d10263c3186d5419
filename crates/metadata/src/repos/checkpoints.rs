//! Verification checkpoint repository.

use crate::error::MetadataResult;
use crate::models::CheckpointRow;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for per-kind verification checkpoints.
#[async_trait]
pub trait CheckpointRepo: Send + Sync {
    /// Get the checkpoint for an object kind, if one was ever recorded.
    async fn get_checkpoint(&self, kind: &str) -> MetadataResult<Option<CheckpointRow>>;

    /// All recorded checkpoints.
    async fn list_checkpoints(&self) -> MetadataResult<Vec<CheckpointRow>>;

    /// Set the checkpoint to `new` if it currently equals `expected`
    /// (`None` meaning never set) and `new` is not earlier than it.
    ///
    /// Returns false when the comparison fails; the stored value is untouched.
    async fn compare_and_set_checkpoint(
        &self,
        kind: &str,
        expected: Option<OffsetDateTime>,
        new: OffsetDateTime,
    ) -> MetadataResult<bool>;
}
