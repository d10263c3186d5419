//! Health endpoint.

use crate::error::ApiResult;
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;

/// Reachability of one replica store.
#[derive(Debug, Serialize)]
pub struct ReplicaHealth {
    pub name: String,
    pub backend: &'static str,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub queue_depth: u64,
    pub replicas: Vec<ReplicaHealth>,
}

/// GET /v1/health - Health check.
///
/// Unauthenticated, for probes and load balancers. Fails outright if the
/// coordination store is unreachable; reports `degraded` with 503 if any
/// replica store is.
pub async fn health_check(
    State(state): State<AppState>,
) -> ApiResult<(StatusCode, Json<HealthResponse>)> {
    state.engine.metadata.health_check().await?;
    let queue_depth = state.engine.metadata.queue_depth().await?;

    let mut replicas = Vec::with_capacity(state.engine.replicas.len());
    for id in state.engine.replicas.ids() {
        let store = state.engine.replicas.get(id)?;
        let result = store.health_check().await;
        replicas.push(ReplicaHealth {
            name: id.to_string(),
            backend: store.backend_name(),
            healthy: result.is_ok(),
            error: result.err().map(|e| e.to_string()),
        });
    }

    let healthy = replicas.iter().all(|r| r.healthy);
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((
        status,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            queue_depth,
            replicas,
        }),
    ))
}
