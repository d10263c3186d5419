//! Periodic recovery sweep.
//!
//! Each pass:
//! - redrives pending dead letters that still have attempt budget, and parks
//!   the rest (and every permanent failure) for an operator;
//! - re-claims chunked copies whose finalizer went quiet and finalizes them;
//! - aborts the sessions of failed copy jobs and drops their bookkeeping.

use crate::coordinator::{CopyCoordinator, FinalizeOutcome};
use crate::error::{FailureClass, SyncResult};
use crate::metrics;
use crate::retry::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use twinstore_core::WorkItem;
use twinstore_core::config::SyncConfig;
use twinstore_metadata::MetadataStore;
use twinstore_metadata::models::{DEAD_LETTER_PENDING, DeadLetterRow};

const BATCH: u32 = 100;

/// What one reaper pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReaperReport {
    pub redriven: u32,
    pub parked: u32,
    pub finalized: u32,
    pub cleaned: u32,
}

pub struct Reaper {
    metadata: Arc<dyn MetadataStore>,
    coordinator: Arc<CopyCoordinator>,
    max_task_attempts: u32,
    backoff: RetryPolicy,
    finalize_lease: Duration,
    interval: Duration,
}

impl Reaper {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        coordinator: Arc<CopyCoordinator>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            metadata,
            coordinator,
            max_task_attempts: config.max_task_attempts,
            backoff: RetryPolicy::new(
                config.max_task_attempts,
                config.retry_base_delay(),
                config.operation_timeout(),
            )
            .with_max_delay(config.retry_max_delay()),
            finalize_lease: config.lease(),
            interval: config.reaper_interval(),
        }
    }

    /// Run one sweep at `now`.
    pub async fn run_once(&self, now: OffsetDateTime) -> SyncResult<ReaperReport> {
        let mut report = ReaperReport::default();

        for row in self
            .metadata
            .list_dead_letters(Some(DEAD_LETTER_PENDING), BATCH)
            .await?
        {
            if self.settle_dead_letter(&row, now).await? {
                report.redriven += 1;
            } else {
                report.parked += 1;
            }
        }

        for job in self
            .metadata
            .reclaim_stalled_finalizes(now - self.finalize_lease, now, BATCH)
            .await?
        {
            tracing::warn!(job_id = %job.job_id, dest_key = %job.dest_key, "Re-claiming stalled finalize");
            if self.coordinator.finalize(job.job_id, now).await? == FinalizeOutcome::Composed {
                report.finalized += 1;
            }
        }

        for job in self.metadata.failed_copy_jobs(BATCH).await? {
            self.coordinator.discard(&job).await?;
            report.cleaned += 1;
        }

        let depth = self.metadata.queue_depth().await?;
        metrics::QUEUE_DEPTH.set(i64::try_from(depth).unwrap_or(i64::MAX));

        if report != ReaperReport::default() {
            tracing::info!(
                redriven = report.redriven,
                parked = report.parked,
                finalized = report.finalized,
                cleaned = report.cleaned,
                queue_depth = depth,
                "Reaper pass complete"
            );
        }
        Ok(report)
    }

    /// Redrive or park one dead letter. Returns true if it was redriven.
    async fn settle_dead_letter(&self, row: &DeadLetterRow, now: OffsetDateTime) -> SyncResult<bool> {
        let class = FailureClass::parse(&row.failure_class);
        let attempts = u32::try_from(row.attempts).unwrap_or(u32::MAX);

        if class != FailureClass::Permanent && attempts < self.max_task_attempts {
            let task = row.task()?.redrive();
            let available_at = now + self.backoff.delay_for_attempt(attempts);
            if self
                .metadata
                .redrive_dead_letter(row.dead_letter_id, &WorkItem::Sync(task), available_at)
                .await?
            {
                metrics::REDRIVES.inc();
                tracing::info!(
                    dead_letter_id = %row.dead_letter_id,
                    task_id = %row.task_id,
                    attempts,
                    class = %class,
                    "Dead letter redriven"
                );
            }
            return Ok(true);
        }

        if self.metadata.park_dead_letter(row.dead_letter_id, now).await? {
            metrics::PARKED.inc();
            tracing::error!(
                dead_letter_id = %row.dead_letter_id,
                task_id = %row.task_id,
                attempts,
                max_attempts = self.max_task_attempts,
                class = %class,
                reason = %row.reason,
                "Task parked for operator intervention"
            );
        }
        Ok(false)
    }

    /// Sweep every `reaper_interval_secs` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(interval_secs = self.interval.as_secs(), "Reaper started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.run_once(OffsetDateTime::now_utc()).await {
                tracing::error!(error = %e, "Reaper pass failed");
            }
        }
        tracing::info!("Reaper stopped");
    }
}
