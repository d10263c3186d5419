//! Notification intake.

use crate::error::ApiResult;
use crate::metrics::record_notification;
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;
use twinstore_sync::InboundEvent;
use uuid::Uuid;

/// A task queued for a notification.
#[derive(Debug, Serialize)]
pub struct QueuedTask {
    pub task_id: Uuid,
    pub item_id: Uuid,
    pub object: String,
    pub source: String,
    pub destination: String,
}

#[derive(Debug, Serialize)]
pub struct NotificationResponse {
    pub queued: Vec<QueuedTask>,
}

/// POST /v1/notifications - Accept a store event or forwarded notification.
///
/// Delivery is at-least-once; duplicates are harmless because the engine
/// finds already-replicated objects and stops.
pub async fn post_notification(
    State(state): State<AppState>,
    Json(event): Json<InboundEvent>,
) -> ApiResult<(StatusCode, Json<NotificationResponse>)> {
    let tasks = match event.into_tasks(&state.engine.replicas) {
        Ok(tasks) => tasks,
        Err(e) => {
            record_notification("rejected");
            tracing::warn!(error = %e, "Rejected notification");
            return Err(e.into());
        }
    };

    let mut queued = Vec::with_capacity(tasks.len());
    for task in tasks {
        let item_id = state.engine.submit(task.clone()).await?;
        queued.push(QueuedTask {
            task_id: task.task_id,
            item_id,
            object: task.source_ref().storage_key(),
            source: task.source.to_string(),
            destination: task.destination.to_string(),
        });
    }

    record_notification("accepted");
    tracing::info!(tasks = queued.len(), "Notification accepted");
    Ok((StatusCode::ACCEPTED, Json(NotificationResponse { queued })))
}
