//! Database models mapping to the coordination schema.
//!
//! Timestamps are stored as integer microseconds since the Unix epoch so that
//! due-time and staleness comparisons happen numerically inside SQLite.

use crate::error::{MetadataError, MetadataResult};
use sqlx::FromRow;
use time::OffsetDateTime;
use twinstore_core::SyncTask;
use uuid::Uuid;

/// Convert a timestamp to the stored integer form.
pub fn to_micros(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000) as i64
}

/// Convert a stored integer timestamp back to an `OffsetDateTime`.
pub fn from_micros(us: i64) -> MetadataResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(us) * 1_000)
        .map_err(|e| MetadataError::Serialization(format!("timestamp {us}: {e}")))
}

// =============================================================================
// Copy jobs
// =============================================================================

pub const JOB_COPYING: &str = "copying";
pub const JOB_FINALIZING: &str = "finalizing";
pub const JOB_FAILED: &str = "failed";

/// In-flight chunked copy of one object into one destination replica.
#[derive(Debug, Clone, FromRow)]
pub struct CopyJobRow {
    pub job_id: Uuid,
    /// The sync task that dispatched this job, as JSON.
    pub task_json: String,
    pub source_replica: String,
    pub dest_replica: String,
    /// Full store key at the source (`blobs/...`).
    pub source_key: String,
    /// Full store key at the destination.
    pub dest_key: String,
    /// Multipart session id issued by the destination store.
    pub session_id: String,
    pub size: i64,
    pub part_size: i64,
    pub total_parts: i64,
    pub state: String,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl CopyJobRow {
    pub fn task(&self) -> MetadataResult<SyncTask> {
        Ok(serde_json::from_str(&self.task_json)?)
    }
}

/// A part recorded as copied into a job's multipart session.
#[derive(Debug, Clone, FromRow)]
pub struct CopyPartRow {
    pub job_id: Uuid,
    pub part_index: i64,
    pub etag: Option<String>,
    pub completed_at: i64,
}

// =============================================================================
// Work queue
// =============================================================================

/// Raw work queue record.
#[derive(Debug, Clone, FromRow)]
pub struct QueueItemRow {
    pub item_id: Uuid,
    pub item_type: String,
    pub payload: String,
    pub available_at: i64,
    pub leased_until: Option<i64>,
    pub deliveries: i64,
    pub enqueued_at: i64,
}

// =============================================================================
// Dead letters
// =============================================================================

pub const DEAD_LETTER_PENDING: &str = "pending";
pub const DEAD_LETTER_PARKED: &str = "parked";

/// A sync task that failed and awaits redrive or operator attention.
#[derive(Debug, Clone, FromRow)]
pub struct DeadLetterRow {
    pub dead_letter_id: Uuid,
    pub task_id: Uuid,
    pub task_json: String,
    /// Attempts consumed by the task, including the one that put it here.
    pub attempts: i64,
    pub failure_class: String,
    pub reason: String,
    pub state: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DeadLetterRow {
    /// Build a pending dead letter for a failed task.
    pub fn new(task: &SyncTask, failure_class: &str, reason: &str) -> MetadataResult<Self> {
        let now = to_micros(OffsetDateTime::now_utc());
        Ok(Self {
            dead_letter_id: Uuid::new_v4(),
            task_id: task.task_id,
            task_json: serde_json::to_string(task)?,
            attempts: i64::from(task.attempts),
            failure_class: failure_class.to_string(),
            reason: reason.to_string(),
            state: DEAD_LETTER_PENDING.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn task(&self) -> MetadataResult<SyncTask> {
        Ok(serde_json::from_str(&self.task_json)?)
    }
}

// =============================================================================
// Verification checkpoints
// =============================================================================

/// Per-kind verification checkpoint.
#[derive(Debug, Clone, FromRow)]
pub struct CheckpointRow {
    pub kind: String,
    pub checkpoint_us: i64,
    pub updated_at: i64,
}

impl CheckpointRow {
    pub fn checkpoint(&self) -> MetadataResult<OffsetDateTime> {
        from_micros(self.checkpoint_us)
    }
}
