//! In-memory storage backend with fault injection.
//!
//! Used for the `memory` storage config and throughout the test suites to
//! simulate flaky or slow replicas.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ListingOptions, ListingPage, ObjectEntry, ObjectMeta, ObjectStore, PageStream, PartReceipt,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::instrument;
use uuid::Uuid;

/// Store operations that can be targeted by injected faults.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Exists,
    Head,
    Get,
    GetRange,
    Put,
    CreateMultipart,
    PutPart,
    Compose,
    Abort,
    Delete,
    List,
}

#[derive(Clone, Debug)]
enum Fault {
    FailTimes(usize),
    FailAlways,
}

#[derive(Clone, Debug)]
struct StoredObject {
    data: Bytes,
    last_modified: OffsetDateTime,
}

#[derive(Debug)]
struct Session {
    key: String,
    parts: BTreeMap<u32, Bytes>,
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: BTreeMap<String, StoredObject>,
    sessions: HashMap<String, Session>,
    faults: HashMap<StoreOp, Fault>,
    delays: HashMap<StoreOp, Duration>,
    calls: HashMap<StoreOp, usize>,
}

/// Process-local object store.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `times` calls of `op` with a transient I/O error.
    pub fn fail_next(&self, op: StoreOp, times: usize) {
        self.lock().faults.insert(op, Fault::FailTimes(times));
    }

    /// Fail every call of `op` until cleared.
    pub fn fail_always(&self, op: StoreOp) {
        self.lock().faults.insert(op, Fault::FailAlways);
    }

    /// Delay every call of `op` before it runs.
    pub fn delay(&self, op: StoreOp, delay: Duration) {
        self.lock().delays.insert(op, delay);
    }

    /// Remove all injected faults and delays.
    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.faults.clear();
        state.delays.clear();
    }

    /// Number of times `op` has been called, including failed calls.
    pub fn calls(&self, op: StoreOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Number of open multipart sessions.
    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Insert an object with an explicit modification time.
    pub fn insert_at(&self, key: &str, data: Bytes, last_modified: OffsetDateTime) {
        self.lock().objects.insert(
            key.to_string(),
            StoredObject {
                data,
                last_modified,
            },
        );
    }

    /// Replace an object's bytes in place, keeping its modification time.
    pub fn overwrite(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let mut state = self.lock();
        let object = state
            .objects
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        object.data = data;
        Ok(())
    }

    /// Record a call and apply any injected delay and fault.
    async fn enter(&self, op: StoreOp) -> StorageResult<()> {
        let delay = {
            let mut state = self.lock();
            *state.calls.entry(op).or_insert(0) += 1;
            state.delays.get(&op).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        let fail = match state.faults.get_mut(&op) {
            Some(Fault::FailAlways) => true,
            Some(Fault::FailTimes(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        if fail {
            return Err(StorageError::Io(std::io::Error::other(format!(
                "injected fault on {op:?}"
            ))));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryBackend {
    #[instrument(skip(self), fields(backend = "memory"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.enter(StoreOp::Exists).await?;
        Ok(self.lock().objects.contains_key(key))
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.enter(StoreOp::Head).await?;
        self.lock()
            .objects
            .get(key)
            .map(|o| ObjectMeta {
                size: o.data.len() as u64,
                last_modified: Some(o.last_modified),
            })
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.enter(StoreOp::Get).await?;
        self.lock()
            .objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn get_range(&self, key: &str, start: u64, end: u64) -> StorageResult<Bytes> {
        self.enter(StoreOp::GetRange).await?;
        if end < start {
            return Err(StorageError::InvalidRange(format!(
                "end ({end}) < start ({start})"
            )));
        }
        let state = self.lock();
        let object = state
            .objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        let size = object.data.len() as u64;
        if end > size {
            return Err(StorageError::InvalidRange(format!(
                "range end {end} beyond object size {size}"
            )));
        }
        Ok(object.data.slice(start as usize..end as usize))
    }

    #[instrument(skip(self, data), fields(backend = "memory", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.enter(StoreOp::Put).await?;
        self.insert_at(key, data, OffsetDateTime::now_utc());
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn create_multipart(&self, key: &str) -> StorageResult<String> {
        self.enter(StoreOp::CreateMultipart).await?;
        let session = Uuid::new_v4().to_string();
        self.lock().sessions.insert(
            session.clone(),
            Session {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(session)
    }

    #[instrument(skip(self, data), fields(backend = "memory", size = data.len()))]
    async fn put_part(
        &self,
        key: &str,
        session: &str,
        part_index: u32,
        data: Bytes,
    ) -> StorageResult<PartReceipt> {
        self.enter(StoreOp::PutPart).await?;
        let mut state = self.lock();
        let open = state
            .sessions
            .get_mut(session)
            .filter(|s| s.key == key)
            .ok_or_else(|| StorageError::UnknownSession {
                key: key.to_string(),
                session: session.to_string(),
            })?;
        let etag = format!("{part_index}-{}", data.len());
        open.parts.insert(part_index, data);
        Ok(PartReceipt {
            part_index,
            etag: Some(etag),
        })
    }

    #[instrument(skip(self, parts), fields(backend = "memory", parts = parts.len()))]
    async fn compose_parts(
        &self,
        key: &str,
        session: &str,
        parts: &[PartReceipt],
    ) -> StorageResult<()> {
        self.enter(StoreOp::Compose).await?;
        if parts.is_empty() {
            return Err(StorageError::MissingPart(format!(
                "{key}: cannot compose an empty part list"
            )));
        }

        let mut state = self.lock();
        let open = state
            .sessions
            .get(session)
            .filter(|s| s.key == key)
            .ok_or_else(|| StorageError::UnknownSession {
                key: key.to_string(),
                session: session.to_string(),
            })?;

        let mut indexes: Vec<u32> = parts.iter().map(|p| p.part_index).collect();
        indexes.sort_unstable();
        indexes.dedup();

        let mut joined = Vec::new();
        for index in indexes {
            let part = open
                .parts
                .get(&index)
                .ok_or_else(|| StorageError::MissingPart(format!("{key}: part {index}")))?;
            joined.extend_from_slice(part);
        }

        state.sessions.remove(session);
        state.objects.insert(
            key.to_string(),
            StoredObject {
                data: Bytes::from(joined),
                last_modified: OffsetDateTime::now_utc(),
            },
        );
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn abort_multipart(&self, _key: &str, session: &str) -> StorageResult<()> {
        self.enter(StoreOp::Abort).await?;
        self.lock().sessions.remove(session);
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.enter(StoreOp::Delete).await?;
        self.lock()
            .objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn list_pages<'a>(&'a self, prefix: &str, options: ListingOptions) -> PageStream<'a> {
        let prefix = prefix.to_string();
        let page_size = options.normalized_page_size();

        let stream = async_stream::try_stream! {
            self.enter(StoreOp::List).await?;
            let entries: Vec<ObjectEntry> = self
                .lock()
                .objects
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .map(|(k, o)| ObjectEntry {
                    key: k.clone(),
                    size: o.data.len() as u64,
                    last_modified: Some(o.last_modified),
                })
                .collect();

            for page in entries.chunks(page_size) {
                yield ListingPage { entries: page.to_vec() };
            }
        };

        Box::pin(stream)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ObjectStoreListExt;
    use futures::{StreamExt, TryStreamExt};

    #[tokio::test]
    async fn test_fail_next_then_recover() {
        let store = MemoryBackend::new();
        store.fail_next(StoreOp::Put, 2);

        assert!(store.put("k", Bytes::from("v")).await.is_err());
        assert!(store.put("k", Bytes::from("v")).await.is_err());
        store.put("k", Bytes::from("v")).await.unwrap();
        assert_eq!(store.calls(StoreOp::Put), 3);
        assert_eq!(store.get("k").await.unwrap(), Bytes::from("v"));
    }

    #[tokio::test]
    async fn test_injected_faults_are_transient() {
        let store = MemoryBackend::new();
        store.fail_always(StoreOp::Exists);
        let err = store.exists("k").await.unwrap_err();
        assert!(!err.is_permanent());
        store.clear_faults();
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_multipart_lifecycle() {
        let store = MemoryBackend::new();
        let session = store.create_multipart("blobs/big").await.unwrap();
        let r1 = store
            .put_part("blobs/big", &session, 1, Bytes::from("world"))
            .await
            .unwrap();
        let r0 = store
            .put_part("blobs/big", &session, 0, Bytes::from("hello "))
            .await
            .unwrap();
        assert_eq!(store.open_sessions(), 1);

        store
            .compose_parts("blobs/big", &session, &[r1.clone(), r0])
            .await
            .unwrap();
        assert_eq!(
            store.get("blobs/big").await.unwrap(),
            Bytes::from("hello world")
        );
        assert_eq!(store.open_sessions(), 0);

        assert!(matches!(
            store.compose_parts("blobs/big", &session, &[r1]).await,
            Err(StorageError::UnknownSession { .. })
        ));
    }

    #[tokio::test]
    async fn test_session_is_bound_to_key() {
        let store = MemoryBackend::new();
        let session = store.create_multipart("blobs/a").await.unwrap();
        assert!(matches!(
            store
                .put_part("blobs/b", &session, 0, Bytes::from("x"))
                .await,
            Err(StorageError::UnknownSession { .. })
        ));
    }

    #[tokio::test]
    async fn test_listing_pages_in_key_order() {
        let store = MemoryBackend::new();
        for i in 0..5 {
            store
                .put(&format!("blobs/{i}"), Bytes::from(vec![0u8; i]))
                .await
                .unwrap();
        }
        store.put("files/x", Bytes::from("x")).await.unwrap();

        let pages: Vec<ListingPage> = store
            .list_pages("blobs/", ListingOptions::new(2))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(pages.len(), 3);

        let keys: Vec<String> = store
            .list_entries("blobs/", None)
            .map_ok(|e| e.key)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(keys, vec!["blobs/0", "blobs/1", "blobs/2", "blobs/3", "blobs/4"]);

        store.fail_always(StoreOp::List);
        let first = store.list_entries("blobs/", None).next().await.unwrap();
        assert!(first.is_err());
    }
}
