//! Dead-letter repository.

use crate::error::MetadataResult;
use crate::models::DeadLetterRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use twinstore_core::WorkItem;
use uuid::Uuid;

/// Repository for failed tasks.
#[async_trait]
pub trait DeadLetterRepo: Send + Sync {
    /// Record a failed task.
    async fn push_dead_letter(&self, row: &DeadLetterRow) -> MetadataResult<()>;

    /// Get a dead letter by ID.
    async fn get_dead_letter(&self, dead_letter_id: Uuid) -> MetadataResult<Option<DeadLetterRow>>;

    /// List dead letters, oldest first, optionally filtered by state.
    async fn list_dead_letters(
        &self,
        state: Option<&str>,
        limit: u32,
    ) -> MetadataResult<Vec<DeadLetterRow>>;

    /// Mark a pending dead letter as parked. Returns false if it was not pending.
    async fn park_dead_letter(
        &self,
        dead_letter_id: Uuid,
        parked_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Atomically remove a dead letter and enqueue `item` in its place.
    ///
    /// Returns false if the dead letter no longer exists (already redriven).
    async fn redrive_dead_letter(
        &self,
        dead_letter_id: Uuid,
        item: &WorkItem,
        available_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Count dead letters in a state.
    async fn count_dead_letters(&self, state: &str) -> MetadataResult<u64>;
}
