//! Work queue repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use std::time::Duration;
use time::OffsetDateTime;
use twinstore_core::WorkItem;
use uuid::Uuid;

/// A work item handed out under a lease.
#[derive(Debug, Clone)]
pub struct LeasedItem {
    pub item_id: Uuid,
    pub item: WorkItem,
    /// Delivery count including this one.
    pub deliveries: u32,
}

/// Repository for the durable work queue.
///
/// Delivery is at-least-once: a leased item that is not acked before its lease
/// expires is handed out again.
#[async_trait]
pub trait QueueRepo: Send + Sync {
    /// Enqueue an item that becomes visible at `available_at`.
    async fn enqueue(&self, item: &WorkItem, available_at: OffsetDateTime) -> MetadataResult<Uuid>;

    /// Lease up to `limit` due items for `visibility`.
    ///
    /// Items that were already delivered `max_deliveries` times are moved to
    /// the dead-letter table instead of being returned.
    async fn lease(
        &self,
        now: OffsetDateTime,
        limit: u32,
        visibility: Duration,
        max_deliveries: u32,
    ) -> MetadataResult<Vec<LeasedItem>>;

    /// Remove a processed item. Returns false if it was already gone.
    async fn ack(&self, item_id: Uuid) -> MetadataResult<bool>;

    /// Give a leased item back, visible again at `available_at`.
    async fn release(&self, item_id: Uuid, available_at: OffsetDateTime) -> MetadataResult<()>;

    /// Number of items in the queue, leased or not.
    async fn queue_depth(&self) -> MetadataResult<u64>;
}
