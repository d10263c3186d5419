// Behaviour every backend must share: whole-object writes, ranged reads,
// multipart upload and compose, and paged listings.

mod common;

use bytes::Bytes;
use common::{all_backends, seeded_bytes};
use futures::TryStreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use twinstore_storage::{ListingOptions, ObjectEntry, ObjectStoreListExt, StorageError};

#[tokio::test]
async fn test_whole_object_roundtrip() {
    let (_dir, backends) = all_backends().await;
    for store in backends {
        let data = seeded_bytes(1, 4096);
        store.put("blobs/object", data.clone()).await.unwrap();

        assert!(store.exists("blobs/object").await.unwrap(), "{}", store.backend_name());
        assert_eq!(store.get("blobs/object").await.unwrap(), data);
        assert_eq!(store.head("blobs/object").await.unwrap().size, 4096);
        assert_eq!(
            store.get_range("blobs/object", 100, 200).await.unwrap(),
            data.slice(100..200)
        );

        store.delete("blobs/object").await.unwrap();
        assert!(!store.exists("blobs/object").await.unwrap());
        assert!(matches!(
            store.head("blobs/object").await,
            Err(StorageError::NotFound(_))
        ));
    }
}

#[tokio::test]
async fn test_parallel_part_uploads_compose_in_order() {
    let (_dir, backends) = all_backends().await;
    for store in backends {
        let part_size = 1000usize;
        let data = seeded_bytes(7, part_size * 7 + 123);
        let session = store.create_multipart("blobs/large").await.unwrap();

        let mut handles = Vec::new();
        for (index, chunk) in data.chunks(part_size).enumerate() {
            let store = Arc::clone(&store);
            let session = session.clone();
            let chunk = Bytes::copy_from_slice(chunk);
            handles.push(tokio::spawn(async move {
                store
                    .put_part("blobs/large", &session, index as u32, chunk)
                    .await
            }));
        }

        let mut receipts = Vec::new();
        for handle in handles {
            receipts.push(handle.await.unwrap().unwrap());
        }
        receipts.reverse();

        assert!(!store.exists("blobs/large").await.unwrap());
        store
            .compose_parts("blobs/large", &session, &receipts)
            .await
            .unwrap();
        assert_eq!(
            store.get("blobs/large").await.unwrap(),
            data,
            "{}",
            store.backend_name()
        );
    }
}

#[tokio::test]
async fn test_abort_discards_parts() {
    let (_dir, backends) = all_backends().await;
    for store in backends {
        let session = store.create_multipart("blobs/aborted").await.unwrap();
        let receipt = store
            .put_part("blobs/aborted", &session, 0, Bytes::from("x"))
            .await
            .unwrap();
        store.abort_multipart("blobs/aborted", &session).await.unwrap();

        assert!(matches!(
            store
                .compose_parts("blobs/aborted", &session, &[receipt])
                .await,
            Err(StorageError::UnknownSession { .. })
        ));
        assert!(!store.exists("blobs/aborted").await.unwrap());
    }
}

#[tokio::test]
async fn test_listing_covers_prefix_exactly_once() {
    let (_dir, backends) = all_backends().await;
    for store in backends {
        for i in 0..25 {
            store
                .put(&format!("blobs/{i:03}"), Bytes::from(vec![i as u8; i]))
                .await
                .unwrap();
        }
        for i in 0..5 {
            store
                .put(&format!("files/{i:03}"), Bytes::from("f"))
                .await
                .unwrap();
        }

        let entries: Vec<ObjectEntry> = store
            .list_entries("blobs/", Some(ListingOptions::new(4)))
            .try_collect()
            .await
            .unwrap();

        let keys: HashSet<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(entries.len(), 25, "{}", store.backend_name());
        assert_eq!(keys.len(), 25);
        assert!(keys.iter().all(|k| k.starts_with("blobs/")));
        for entry in &entries {
            let i: usize = entry.key["blobs/".len()..].parse().unwrap();
            assert_eq!(entry.size, i as u64);
            assert!(entry.last_modified.is_some());
        }
    }
}

#[tokio::test]
async fn test_listing_missing_prefix_is_empty() {
    let (_dir, backends) = all_backends().await;
    for store in backends {
        let entries: Vec<ObjectEntry> = store
            .list_entries("collections/", None)
            .try_collect()
            .await
            .unwrap();
        assert!(entries.is_empty());
    }
}
