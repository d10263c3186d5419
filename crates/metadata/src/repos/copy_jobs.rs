//! Copy job repository.

use crate::error::MetadataResult;
use crate::models::{CopyJobRow, CopyPartRow};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Result of recording a completed part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartCompletion {
    /// The part was recorded; other parts are still outstanding, or another
    /// caller already holds the finalize right.
    Recorded,
    /// This caller recorded the last part and won the right to finalize.
    FinalizeClaimed,
    /// The job is no longer copying (failed or finalizing); nothing was recorded.
    JobInactive,
}

/// Repository for chunked copy bookkeeping.
#[async_trait]
pub trait CopyJobRepo: Send + Sync {
    /// Persist a new job in the `copying` state.
    ///
    /// Fails with `Constraint` if another active job already targets the same
    /// destination key.
    async fn create_copy_job(&self, job: &CopyJobRow) -> MetadataResult<()>;

    /// Get a job by ID.
    async fn get_copy_job(&self, job_id: Uuid) -> MetadataResult<Option<CopyJobRow>>;

    /// Get the active (copying or finalizing) job for a destination key.
    async fn find_active_copy_job(
        &self,
        dest_replica: &str,
        dest_key: &str,
    ) -> MetadataResult<Option<CopyJobRow>>;

    /// Record a part as copied and, in the same transaction, test whether all
    /// parts are now complete and claim the finalize right.
    ///
    /// At most one caller per job ever observes `FinalizeClaimed`.
    async fn record_part_complete(
        &self,
        job_id: Uuid,
        part_index: u32,
        etag: Option<&str>,
        completed_at: OffsetDateTime,
    ) -> MetadataResult<PartCompletion>;

    /// Recorded parts for a job, ordered by index.
    async fn completed_parts(&self, job_id: Uuid) -> MetadataResult<Vec<CopyPartRow>>;

    /// Move a job from `from_state` to `failed`. Returns true only for the
    /// caller that made the transition, so a job's failure is reported once.
    async fn fail_copy_job(
        &self,
        job_id: Uuid,
        from_state: &str,
        reason: &str,
        failed_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Re-claim finalizing jobs whose claimer went quiet before `older_than`.
    ///
    /// Each returned job has had its `updated_at` bumped to `now`, so a
    /// concurrent reaper cannot claim it too.
    async fn reclaim_stalled_finalizes(
        &self,
        older_than: OffsetDateTime,
        now: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<CopyJobRow>>;

    /// Failed jobs whose sessions still need aborting.
    async fn failed_copy_jobs(&self, limit: u32) -> MetadataResult<Vec<CopyJobRow>>;

    /// Delete a job and its part records.
    async fn delete_copy_job(&self, job_id: Uuid) -> MetadataResult<()>;
}
