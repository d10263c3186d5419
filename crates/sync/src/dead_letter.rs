//! Moving failed tasks to the dead-letter table.

use crate::error::{FailureClass, SyncResult};
use crate::metrics;
use time::OffsetDateTime;
use twinstore_core::{SyncTask, WorkItem};
use twinstore_metadata::MetadataStore;
use twinstore_metadata::models::DeadLetterRow;
use uuid::Uuid;

/// Record `task` as failed, charging `attempts` to its total attempt count.
pub async fn dead_letter(
    metadata: &dyn MetadataStore,
    task: &SyncTask,
    class: FailureClass,
    reason: &str,
    attempts: u32,
) -> SyncResult<()> {
    let mut task = task.clone();
    task.attempts = task.attempts.saturating_add(attempts.max(1));

    let row = DeadLetterRow::new(&task, class.as_str(), reason)?;
    metadata.push_dead_letter(&row).await?;

    metrics::DEAD_LETTERS
        .with_label_values(&[class.as_str()])
        .inc();
    tracing::warn!(
        task_id = %task.task_id,
        dead_letter_id = %row.dead_letter_id,
        object = %task.source_ref(),
        source = %task.source,
        destination = %task.destination,
        attempts = task.attempts,
        class = %class,
        reason,
        "Task dead-lettered"
    );
    Ok(())
}

/// Re-enqueue a dead letter on operator request, parked or not.
///
/// The task gets a fresh attempt budget. Returns `None` if the dead letter
/// does not exist (or was redriven concurrently).
pub async fn redrive(
    metadata: &dyn MetadataStore,
    dead_letter_id: Uuid,
    now: OffsetDateTime,
) -> SyncResult<Option<SyncTask>> {
    let Some(row) = metadata.get_dead_letter(dead_letter_id).await? else {
        return Ok(None);
    };
    let mut task = row.task()?.redrive();
    task.attempts = 0;

    if !metadata
        .redrive_dead_letter(dead_letter_id, &WorkItem::Sync(task.clone()), now)
        .await?
    {
        return Ok(None);
    }
    metrics::REDRIVES.inc();
    tracing::info!(
        dead_letter_id = %dead_letter_id,
        task_id = %task.task_id,
        previous_state = %row.state,
        "Dead letter redriven by operator"
    );
    Ok(Some(task))
}
