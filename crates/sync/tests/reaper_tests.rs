//! Dead-letter redrive and parking.

mod common;

use common::*;
use std::time::Duration;
use time::OffsetDateTime;
use twinstore_core::SourceKind;
use twinstore_metadata::models::{DEAD_LETTER_PARKED, DEAD_LETTER_PENDING};
use twinstore_storage::{ObjectStore, StoreOp};

#[tokio::test]
async fn test_transient_failure_is_redriven_and_completes() {
    let h = Harness::new().await;
    let data = payload(2048, 21);
    let blob = put_blob(h.primary.as_ref(), data.clone()).await;
    h.secondary.fail_always(StoreOp::Put);

    h.sync(h.task(blob.clone(), None)).await;
    assert_eq!(h.metadata.count_dead_letters(DEAD_LETTER_PENDING).await.unwrap(), 1);

    h.secondary.clear_faults();
    let now = OffsetDateTime::now_utc();
    let report = h.engine.reaper.run_once(now).await.unwrap();
    assert_eq!(report.redriven, 1);
    assert_eq!(report.parked, 0);
    assert_eq!(h.metadata.count_dead_letters(DEAD_LETTER_PENDING).await.unwrap(), 0);

    // Redriven with backoff; due shortly after.
    assert_eq!(h.drain(now + Duration::from_secs(1)).await, 1);
    assert_eq!(h.secondary.get(&blob.storage_key()).await.unwrap(), data);
    assert!(h.metadata.list_dead_letters(None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_redriven_task_keeps_attempt_count() {
    let mut config = test_config();
    config.max_task_attempts = 10;
    let h = Harness::with_config(config).await;
    let blob = put_blob(h.primary.as_ref(), payload(512, 22)).await;
    h.secondary.fail_always(StoreOp::Put);

    h.sync(h.task(blob, None)).await;
    let now = OffsetDateTime::now_utc();
    h.engine.reaper.run_once(now).await.unwrap();
    h.drain(now + Duration::from_secs(1)).await;

    let letters = h.metadata.list_dead_letters(None, 10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].attempts, 6);
    let task = letters[0].task().unwrap();
    assert_eq!(task.source_kind, SourceKind::Redrive);
}

#[tokio::test]
async fn test_exhausted_task_is_parked() {
    let mut config = test_config();
    config.max_task_attempts = 3;
    let h = Harness::with_config(config).await;
    let blob = put_blob(h.primary.as_ref(), payload(512, 23)).await;
    h.secondary.fail_always(StoreOp::Put);

    h.sync(h.task(blob, None)).await;

    let report = h
        .engine
        .reaper
        .run_once(OffsetDateTime::now_utc())
        .await
        .unwrap();
    assert_eq!(report.redriven, 0);
    assert_eq!(report.parked, 1);
    assert_eq!(h.metadata.count_dead_letters(DEAD_LETTER_PARKED).await.unwrap(), 1);
    assert_eq!(h.metadata.queue_depth().await.unwrap(), 0);

    // Parked letters stay put.
    let report = h
        .engine
        .reaper
        .run_once(OffsetDateTime::now_utc())
        .await
        .unwrap();
    assert_eq!(report.parked, 0);
    assert_eq!(h.metadata.count_dead_letters(DEAD_LETTER_PARKED).await.unwrap(), 1);
}

#[tokio::test]
async fn test_permanent_failure_is_parked_at_once() {
    let h = Harness::new().await;
    let missing = twinstore_core::ObjectRef::new(
        twinstore_core::ObjectKind::Blob,
        twinstore_core::ObjectKey::blob(&twinstore_core::ContentHash::compute(b"never written")),
    );

    h.sync(h.task(missing, None)).await;

    let report = h
        .engine
        .reaper
        .run_once(OffsetDateTime::now_utc())
        .await
        .unwrap();
    assert_eq!(report.parked, 1);
    assert_eq!(report.redriven, 0);
    assert_eq!(h.metadata.queue_depth().await.unwrap(), 0);
}

#[tokio::test]
async fn test_operator_redrive_resets_attempts() {
    let mut config = test_config();
    config.max_task_attempts = 3;
    let h = Harness::with_config(config).await;
    let data = payload(512, 24);
    let blob = put_blob(h.primary.as_ref(), data.clone()).await;
    h.secondary.fail_always(StoreOp::Put);

    h.sync(h.task(blob.clone(), None)).await;
    h.engine
        .reaper
        .run_once(OffsetDateTime::now_utc())
        .await
        .unwrap();
    let parked = h
        .metadata
        .list_dead_letters(Some(DEAD_LETTER_PARKED), 10)
        .await
        .unwrap();
    assert_eq!(parked.len(), 1);

    h.secondary.clear_faults();
    let task = twinstore_sync::dead_letter::redrive(
        h.metadata.as_ref(),
        parked[0].dead_letter_id,
        OffsetDateTime::now_utc(),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(task.attempts, 0);
    assert_eq!(task.source_kind, SourceKind::Redrive);
    assert_eq!(h.metadata.count_dead_letters(DEAD_LETTER_PARKED).await.unwrap(), 0);

    // A second redrive of the same letter finds nothing.
    assert!(
        twinstore_sync::dead_letter::redrive(
            h.metadata.as_ref(),
            parked[0].dead_letter_id,
            OffsetDateTime::now_utc(),
        )
        .await
        .unwrap()
        .is_none()
    );

    h.drain(OffsetDateTime::now_utc()).await;
    assert_eq!(h.secondary.get(&blob.storage_key()).await.unwrap(), data);
}
