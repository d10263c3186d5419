//! API integration tests for the twinsyncd HTTP surface.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::*;
use serde_json::json;
use time::OffsetDateTime;
use tower::ServiceExt;
use twinstore_storage::ObjectStore;

#[tokio::test]
async fn test_health_check() {
    let server = TestServer::new().await;

    let (status, body) = json_request(&server.router, "GET", "/v1/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["queue_depth"], 0);
    let replicas = body["replicas"].as_array().unwrap();
    assert_eq!(replicas.len(), 2);
    assert!(replicas.iter().all(|r| r["healthy"] == true));
    assert!(replicas.iter().all(|r| r["backend"] == "memory"));
}

#[tokio::test]
async fn test_store_event_fans_out_and_replicates() {
    let server = TestServer::new().await;
    let data = test_blob(4096);
    let key = blob_key(&data);
    server.primary.put(&key, data.clone()).await.unwrap();

    let (status, body) = json_request(
        &server.router,
        "POST",
        "/v1/notifications",
        Some(json!({ "replica": "primary", "key": key, "size": 4096 })),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    let queued = body["queued"].as_array().unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0]["source"], "primary");
    assert_eq!(queued[0]["destination"], "secondary");
    assert_eq!(queued[0]["object"], key.as_str());
    assert_eq!(server.metadata().queue_depth().await.unwrap(), 1);

    let processed = server
        .state
        .engine
        .worker
        .process_due_at(OffsetDateTime::now_utc())
        .await
        .unwrap();
    assert_eq!(processed, 1);
    assert_eq!(server.secondary.get(&key).await.unwrap(), data);
    assert_eq!(server.metadata().queue_depth().await.unwrap(), 0);
}

#[tokio::test]
async fn test_forwarded_notification_accepted() {
    let server = TestServer::new().await;
    let key = blob_key(&test_blob(128));

    let (status, body) = json_request(
        &server.router,
        "POST",
        "/v1/notifications",
        Some(json!({
            "source_replica": "secondary",
            "source_key": key,
            "dest_replica": "primary",
        })),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    let queued = body["queued"].as_array().unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0]["source"], "secondary");
    assert_eq!(queued[0]["destination"], "primary");
}

#[tokio::test]
async fn test_unknown_replica_rejected() {
    let server = TestServer::new().await;
    let key = blob_key(&test_blob(16));

    let (status, body) = json_request(
        &server.router,
        "POST",
        "/v1/notifications",
        Some(json!({ "replica": "elsewhere", "key": key })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "unknown_replica");
    assert_eq!(server.metadata().queue_depth().await.unwrap(), 0);
}

#[tokio::test]
async fn test_unreplicable_key_rejected() {
    let server = TestServer::new().await;

    let (status, body) = json_request(
        &server.router,
        "POST",
        "/v1/notifications",
        Some(json!({ "replica": "primary", "key": "tmp/scratch.bin" })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().is_some());
    assert_eq!(server.metadata().queue_depth().await.unwrap(), 0);
}

#[tokio::test]
async fn test_malformed_body_rejected() {
    let server = TestServer::new().await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/notifications")
        .header("Content-Type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = server.router.clone().oneshot(request).await.unwrap();
    assert!(response.status().is_client_error());

    let (status, _) = json_request(
        &server.router,
        "POST",
        "/v1/notifications",
        Some(json!({ "unexpected": true })),
    )
    .await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let server = TestServer::new().await;
    twinstore_server::metrics::register_metrics();

    let request = Request::builder()
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let response = server.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("twinstore_sync_bytes_copied_total"));
}
