//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use time::OffsetDateTime;

/// Page size constraints for listing operations.
pub const DEFAULT_PAGE_SIZE: usize = 1000;
pub const MIN_PAGE_SIZE: usize = 1;
pub const MAX_PAGE_SIZE: usize = 10000;

/// A boxed stream of listing pages.
pub type PageStream<'a> = Pin<Box<dyn Stream<Item = StorageResult<ListingPage>> + Send + 'a>>;

/// One listed object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectEntry {
    /// Key relative to the store root.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// When the object was written. Keys are write-once, so this is its creation time.
    pub last_modified: Option<OffsetDateTime>,
}

/// A single page of listing results.
#[derive(Clone, Debug, Default)]
pub struct ListingPage {
    pub entries: Vec<ObjectEntry>,
}

/// Options for listing operations.
#[derive(Clone, Debug)]
pub struct ListingOptions {
    /// Number of entries to fetch per page.
    ///
    /// Clamped to [MIN_PAGE_SIZE, MAX_PAGE_SIZE].
    pub page_size: usize,
}

impl ListingOptions {
    pub fn new(page_size: usize) -> Self {
        Self { page_size }
    }

    /// Get the normalized page size.
    pub fn normalized_page_size(&self) -> usize {
        self.page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
    }
}

impl Default for ListingOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Proof that a part was uploaded into a multipart session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartReceipt {
    /// Zero-based part index.
    pub part_index: u32,
    /// Backend tag for the part (S3 ETag), if the backend issues one.
    pub etag: Option<String>,
}

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<OffsetDateTime>,
}

/// Object store capability for one replica.
///
/// Keys are `/`-separated and relative to the store root. Writes are
/// all-or-nothing: a key either fully exists or it does not.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get an object's size without fetching content.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Get an object's content.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Get bytes `[start, end)` of an object.
    async fn get_range(&self, key: &str, start: u64, end: u64) -> StorageResult<Bytes>;

    /// Put a whole object atomically.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Open a multipart session for `key` and return its identifier.
    async fn create_multipart(&self, key: &str) -> StorageResult<String>;

    /// Upload one part into a session.
    ///
    /// Re-uploading the same index replaces the previous upload of that part.
    async fn put_part(
        &self,
        key: &str,
        session: &str,
        part_index: u32,
        data: Bytes,
    ) -> StorageResult<PartReceipt>;

    /// Join the given parts, in index order, into `key` and close the session.
    async fn compose_parts(
        &self,
        key: &str,
        session: &str,
        parts: &[PartReceipt],
    ) -> StorageResult<()>;

    /// Discard a session and any parts uploaded into it.
    async fn abort_multipart(&self, key: &str, session: &str) -> StorageResult<()>;

    /// Delete an object.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// List objects under a prefix as a stream of pages.
    fn list_pages<'a>(&'a self, prefix: &str, options: ListingOptions) -> PageStream<'a>;

    /// Static backend identifier (e.g., "s3", "filesystem") for logs and metrics.
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Flattening helper over [`ObjectStore::list_pages`].
pub trait ObjectStoreListExt: ObjectStore {
    /// List objects under a prefix as a flat stream of entries.
    fn list_entries<'a>(
        &'a self,
        prefix: &str,
        options: Option<ListingOptions>,
    ) -> Pin<Box<dyn Stream<Item = StorageResult<ObjectEntry>> + Send + 'a>> {
        let pages = self.list_pages(prefix, options.unwrap_or_default());
        let entries = pages.flat_map(|page| match page {
            Ok(page) => futures::stream::iter(page.entries.into_iter().map(Ok)).boxed(),
            Err(e) => futures::stream::once(async move { Err(e) }).boxed(),
        });
        Box::pin(entries)
    }
}

impl<T: ObjectStore + ?Sized> ObjectStoreListExt for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_options_clamp() {
        assert_eq!(ListingOptions::new(0).normalized_page_size(), MIN_PAGE_SIZE);
        assert_eq!(ListingOptions::new(50).normalized_page_size(), 50);
        assert_eq!(
            ListingOptions::new(1_000_000).normalized_page_size(),
            MAX_PAGE_SIZE
        );
    }
}
