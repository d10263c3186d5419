//! Prometheus metrics for the twinsyncd daemon.
//!
//! Intake counters live here; engine metrics come from `twinstore_sync::metrics`.
//! Both are registered on the same registry and served together on `/metrics`.
//! The endpoint is unauthenticated and should only be reachable by the scraper.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounterVec, Opts, TextEncoder};
use std::sync::{LazyLock, Once};
use twinstore_sync::metrics::REGISTRY;

pub static NOTIFICATIONS_RECEIVED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "twinstore_notifications_received_total",
            "Notifications received on the intake endpoint, by result",
        ),
        &["result"],
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register daemon and engine metrics. Safe to call more than once.
pub fn register_metrics() {
    twinstore_sync::metrics::register_metrics();
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(NOTIFICATIONS_RECEIVED.clone()))
            .expect("metric registration failed");
    });
}

/// Handler for the `/metrics` endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Helper to count an intake result.
pub fn record_notification(result: &str) {
    NOTIFICATIONS_RECEIVED.with_label_values(&[result]).inc();
}
