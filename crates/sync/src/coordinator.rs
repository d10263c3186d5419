//! Chunked copy coordinator.
//!
//! Large objects are copied in parts. Dispatch opens a multipart session at
//! the destination, persists a copy job and queues one work item per part.
//! Each part copy records itself in the coordination store; the transaction
//! that records the last part also claims the right to finalize, so exactly
//! one caller composes the parts.

use crate::dead_letter::dead_letter;
use crate::error::{SyncError, SyncResult};
use crate::metrics;
use crate::replicas::ReplicaSet;
use crate::retry::RetryPolicy;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::instrument;
use twinstore_core::{CopyPlan, PartRange, SyncTask, WorkItem};
use twinstore_metadata::models::{CopyJobRow, JOB_COPYING, JOB_FINALIZING, to_micros};
use twinstore_metadata::repos::PartCompletion;
use twinstore_metadata::{MetadataError, MetadataStore};
use twinstore_storage::{ObjectStore, PartReceipt};
use uuid::Uuid;

/// Result of dispatching a chunked copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A new job was created and its parts queued.
    Started { job_id: Uuid, parts: u32 },
    /// Another job is already copying this object to the destination.
    AlreadyActive { job_id: Option<Uuid> },
}

/// Result of one part copy work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartOutcome {
    /// Part recorded; other parts are still outstanding.
    Recorded,
    /// This part completed the job and the object was composed.
    Finalized,
    /// The job is gone or no longer copying; nothing was done.
    Stale,
    /// The part could not be copied; the job failed and its task was dead-lettered.
    JobFailed,
}

/// Result of finalizing a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Composed,
    /// The job no longer exists or is not in the finalizing state.
    NotClaimed,
    /// Compose failed; the job failed and its task was dead-lettered.
    Failed,
}

pub struct CopyCoordinator {
    metadata: Arc<dyn MetadataStore>,
    replicas: Arc<ReplicaSet>,
    retry: RetryPolicy,
}

impl CopyCoordinator {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        replicas: Arc<ReplicaSet>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            metadata,
            replicas,
            retry,
        }
    }

    /// Open a multipart session for `task`'s destination and queue one copy
    /// work item per planned part.
    #[instrument(skip(self, plan, task), fields(task_id = %task.task_id, object = %task.dest_ref()))]
    pub async fn dispatch(
        &self,
        plan: &CopyPlan,
        task: &SyncTask,
        now: OffsetDateTime,
    ) -> SyncResult<DispatchOutcome> {
        let dest_key = task.dest_ref().storage_key();
        let dest_name = task.destination.as_str();

        if let Some(active) = self
            .metadata
            .find_active_copy_job(dest_name, &dest_key)
            .await?
        {
            tracing::debug!(job_id = %active.job_id, "Copy job already active for destination");
            return Ok(DispatchOutcome::AlreadyActive {
                job_id: Some(active.job_id),
            });
        }

        let dest = self.replicas.get(&task.destination)?.as_ref();
        let key = dest_key.as_str();
        let session = self
            .retry
            .run("create_multipart", || async move {
                dest.create_multipart(key)
                    .await
                    .map_err(|e| SyncError::storage(dest_name, e))
            })
            .await?;

        let now_us = to_micros(now);
        let job = CopyJobRow {
            job_id: Uuid::new_v4(),
            task_json: serde_json::to_string(task).map_err(|e| {
                SyncError::Metadata(MetadataError::Serialization(e.to_string()))
            })?,
            source_replica: task.source.to_string(),
            dest_replica: task.destination.to_string(),
            source_key: task.source_ref().storage_key(),
            dest_key: dest_key.clone(),
            session_id: session.clone(),
            size: plan.total_size() as i64,
            part_size: plan.parts.first().map(|p| p.len()).unwrap_or(0) as i64,
            total_parts: i64::from(plan.part_count()),
            state: JOB_COPYING.to_string(),
            error: None,
            created_at: now_us,
            updated_at: now_us,
        };

        match self.metadata.create_copy_job(&job).await {
            Ok(()) => {}
            Err(MetadataError::Constraint(_)) => {
                // Lost a dispatch race for the same destination key.
                abort_quietly(dest, dest_name, key, &session).await;
                let active = self
                    .metadata
                    .find_active_copy_job(dest_name, &dest_key)
                    .await?;
                return Ok(DispatchOutcome::AlreadyActive {
                    job_id: active.map(|j| j.job_id),
                });
            }
            Err(e) => {
                abort_quietly(dest, dest_name, key, &session).await;
                return Err(e.into());
            }
        }

        for part in &plan.parts {
            let item = WorkItem::CopyPart {
                job_id: job.job_id,
                part: part.clone(),
            };
            if let Err(e) = self.metadata.enqueue(&item, now).await {
                // Parts already queued will find the job gone and stop.
                self.metadata.delete_copy_job(job.job_id).await?;
                abort_quietly(dest, dest_name, key, &session).await;
                return Err(e.into());
            }
        }

        tracing::info!(
            job_id = %job.job_id,
            parts = plan.part_count(),
            size = plan.total_size(),
            "Chunked copy dispatched"
        );
        Ok(DispatchOutcome::Started {
            job_id: job.job_id,
            parts: plan.part_count(),
        })
    }

    /// Copy one part of a job from source to destination session.
    ///
    /// Safe to run more than once for the same part.
    #[instrument(skip(self, part), fields(job_id = %job_id, part = part.index))]
    pub async fn copy_part(
        &self,
        job_id: Uuid,
        part: &PartRange,
        now: OffsetDateTime,
    ) -> SyncResult<PartOutcome> {
        let Some(job) = self.metadata.get_copy_job(job_id).await? else {
            tracing::debug!("Copy job no longer exists; dropping part");
            return Ok(PartOutcome::Stale);
        };
        if job.state != JOB_COPYING {
            return Ok(PartOutcome::Stale);
        }

        let task = job.task()?;
        let source = self.replicas.get(&task.source)?.as_ref();
        let dest = self.replicas.get(&task.destination)?.as_ref();
        let (source_name, dest_name) = (task.source.as_str(), task.destination.as_str());
        let (source_key, dest_key, session) = (
            job.source_key.as_str(),
            job.dest_key.as_str(),
            job.session_id.as_str(),
        );

        let result = self
            .retry
            .run("copy_part", || async move {
                let data = source
                    .get_range(source_key, part.start, part.end)
                    .await
                    .map_err(|e| SyncError::source_read(source_name, source_key, e))?;
                dest.put_part(dest_key, session, part.index, data)
                    .await
                    .map_err(|e| SyncError::storage(dest_name, e))
            })
            .await;

        let receipt = match result {
            Ok(receipt) => receipt,
            Err(e) => {
                return if self.fail_job(&job, JOB_COPYING, &task, &e, now).await? {
                    Ok(PartOutcome::JobFailed)
                } else {
                    Ok(PartOutcome::Stale)
                };
            }
        };

        metrics::PARTS_COPIED.inc();
        metrics::BYTES_COPIED.inc_by(part.len());

        let completion = match self
            .on_part_complete(job_id, part.index, receipt.etag.as_deref(), now)
            .await
        {
            Ok(completion) => completion,
            Err(SyncError::Metadata(MetadataError::NotFound(_))) => return Ok(PartOutcome::Stale),
            Err(e) => return Err(e),
        };

        match completion {
            PartCompletion::Recorded => Ok(PartOutcome::Recorded),
            PartCompletion::JobInactive => Ok(PartOutcome::Stale),
            PartCompletion::FinalizeClaimed => match self.finalize(job_id, now).await? {
                FinalizeOutcome::Composed => Ok(PartOutcome::Finalized),
                FinalizeOutcome::Failed => Ok(PartOutcome::JobFailed),
                FinalizeOutcome::NotClaimed => Ok(PartOutcome::Stale),
            },
        }
    }

    /// Record a completed part and claim the finalize right if it was the last.
    ///
    /// Only the caller that sees `FinalizeClaimed` may call [`Self::finalize`].
    pub async fn on_part_complete(
        &self,
        job_id: Uuid,
        part_index: u32,
        etag: Option<&str>,
        now: OffsetDateTime,
    ) -> SyncResult<PartCompletion> {
        let completion = self
            .metadata
            .record_part_complete(job_id, part_index, etag, now)
            .await?;
        if completion == PartCompletion::FinalizeClaimed {
            tracing::debug!(job_id = %job_id, part_index, "All parts complete; finalize claimed");
        }
        Ok(completion)
    }

    /// Compose a claimed job's parts at the destination and drop its bookkeeping.
    ///
    /// Retry-safe: a destination that already holds the object counts as composed.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn finalize(&self, job_id: Uuid, now: OffsetDateTime) -> SyncResult<FinalizeOutcome> {
        let Some(job) = self.metadata.get_copy_job(job_id).await? else {
            return Ok(FinalizeOutcome::NotClaimed);
        };
        if job.state != JOB_FINALIZING {
            return Ok(FinalizeOutcome::NotClaimed);
        }

        let task = job.task()?;
        let dest = self.replicas.get(&task.destination)?.as_ref();
        let dest_name = task.destination.as_str();
        let (dest_key, session) = (job.dest_key.as_str(), job.session_id.as_str());

        let receipts: Vec<PartReceipt> = self
            .metadata
            .completed_parts(job_id)
            .await?
            .into_iter()
            .map(|row| PartReceipt {
                part_index: row.part_index as u32,
                etag: row.etag,
            })
            .collect();
        let receipts = receipts.as_slice();

        let result = self
            .retry
            .run("finalize", || async move {
                match dest.compose_parts(dest_key, session, receipts).await {
                    Ok(()) => Ok(()),
                    // An earlier attempt may have composed before failing to report it.
                    Err(e) => match dest.exists(dest_key).await {
                        Ok(true) => Ok(()),
                        _ => Err(SyncError::storage(dest_name, e)),
                    },
                }
            })
            .await;

        if let Err(e) = result {
            return if self.fail_job(&job, JOB_FINALIZING, &task, &e, now).await? {
                Ok(FinalizeOutcome::Failed)
            } else {
                Ok(FinalizeOutcome::NotClaimed)
            };
        }

        self.metadata.delete_copy_job(job_id).await?;
        metrics::FINALIZES.inc();
        tracing::info!(
            task_id = %task.task_id,
            object = %task.dest_ref(),
            parts = receipts.len(),
            size = job.size,
            "Chunked copy finalized"
        );
        Ok(FinalizeOutcome::Composed)
    }

    /// Abort a failed job's session and delete its bookkeeping.
    pub async fn discard(&self, job: &CopyJobRow) -> SyncResult<()> {
        let dest_id = twinstore_core::ReplicaId::new(&job.dest_replica);
        if let Ok(dest) = self.replicas.get(&dest_id) {
            abort_quietly(
                dest.as_ref(),
                &job.dest_replica,
                &job.dest_key,
                &job.session_id,
            )
            .await;
        }
        self.metadata.delete_copy_job(job.job_id).await?;
        Ok(())
    }

    /// Fail a job once and dead-letter its task. Returns false, doing
    /// nothing, if the job already left `from_state`.
    async fn fail_job(
        &self,
        job: &CopyJobRow,
        from_state: &str,
        task: &SyncTask,
        error: &SyncError,
        now: OffsetDateTime,
    ) -> SyncResult<bool> {
        let reason = error.to_string();
        if !self
            .metadata
            .fail_copy_job(job.job_id, from_state, &reason, now)
            .await?
        {
            tracing::debug!(
                job_id = %job.job_id,
                from_state,
                error = %error,
                "Job no longer in expected state; not failing it"
            );
            return Ok(false);
        }

        tracing::error!(
            job_id = %job.job_id,
            task_id = %task.task_id,
            error = %error,
            "Chunked copy failed"
        );
        dead_letter(
            self.metadata.as_ref(),
            task,
            error.class(),
            &reason,
            error.attempts_consumed(),
        )
        .await?;
        self.discard(job).await?;
        Ok(true)
    }
}

async fn abort_quietly(dest: &dyn ObjectStore, replica: &str, key: &str, session: &str) {
    if let Err(e) = dest.abort_multipart(key, session).await {
        tracing::warn!(
            replica,
            key,
            session,
            error = %e,
            "Failed to abort multipart session"
        );
    }
}
