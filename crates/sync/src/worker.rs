//! Queue worker: leases work items and drives them.
//!
//! A `Sync` item runs the state machine; a `CopyPart` item copies one part of
//! a chunked copy job. Items are acked only once their effect is durable
//! (completed, re-enqueued, or dead-lettered). Anything else is left to the
//! lease timeout and redelivered.

use crate::coordinator::CopyCoordinator;
use crate::dead_letter::dead_letter;
use crate::error::SyncResult;
use crate::machine::{Outcome, SyncMachine};
use crate::metrics;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use twinstore_core::WorkItem;
use twinstore_core::config::SyncConfig;
use twinstore_metadata::MetadataStore;
use twinstore_metadata::repos::LeasedItem;

/// Lease and concurrency settings.
#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub lease: Duration,
    pub max_deliveries: u32,
    pub poll_interval: Duration,
}

impl From<&SyncConfig> for WorkerSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            concurrency: config.worker_concurrency.max(1),
            lease: config.lease(),
            max_deliveries: config.max_deliveries,
            poll_interval: config.poll_interval(),
        }
    }
}

pub struct Worker {
    metadata: Arc<dyn MetadataStore>,
    machine: Arc<SyncMachine>,
    coordinator: Arc<CopyCoordinator>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        machine: Arc<SyncMachine>,
        coordinator: Arc<CopyCoordinator>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            metadata,
            machine,
            coordinator,
            settings,
        }
    }

    /// Handle one leased item and ack it once its effect is recorded.
    pub async fn process(&self, leased: LeasedItem, now: OffsetDateTime) -> SyncResult<()> {
        let LeasedItem {
            item_id,
            item,
            deliveries,
        } = leased;
        tracing::debug!(item_id = %item_id, item = item.label(), deliveries, "Processing work item");

        match item {
            WorkItem::Sync(task) => {
                let started = Instant::now();
                let outcome = self.machine.run(task, now).await;
                metrics::TASK_DURATION.observe(started.elapsed().as_secs_f64());

                match outcome {
                    Outcome::Completed(completion) => {
                        metrics::record_task_outcome(completion.label());
                    }
                    Outcome::Suspended { task, resume_at } => {
                        self.metadata
                            .enqueue(&WorkItem::Sync(task), resume_at)
                            .await?;
                        metrics::record_task_outcome("suspended");
                    }
                    Outcome::Failed {
                        task,
                        class,
                        reason,
                        attempts,
                    } => {
                        dead_letter(self.metadata.as_ref(), &task, class, &reason, attempts)
                            .await?;
                        metrics::record_task_outcome("failed");
                    }
                }
            }
            WorkItem::CopyPart { job_id, part } => {
                let outcome = self.coordinator.copy_part(job_id, &part, now).await?;
                tracing::debug!(job_id = %job_id, part = part.index, outcome = ?outcome, "Part processed");
            }
        }

        self.metadata.ack(item_id).await?;
        Ok(())
    }

    /// Lease and process every item due at `now`, one at a time.
    ///
    /// Returns the number of items processed. Lets tests drain the queue
    /// without running the background loop.
    pub async fn process_due_at(&self, now: OffsetDateTime) -> SyncResult<usize> {
        let limit = u32::try_from(self.settings.concurrency).unwrap_or(u32::MAX);
        let mut processed = 0;
        loop {
            let batch = self
                .metadata
                .lease(now, limit, self.settings.lease, self.settings.max_deliveries)
                .await?;
            if batch.is_empty() {
                return Ok(processed);
            }
            for leased in batch {
                self.process(leased, now).await?;
                processed += 1;
            }
        }
    }

    /// Lease and process items until `shutdown` fires, then wait for
    /// in-flight items to finish.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.settings.concurrency));
        tracing::info!(
            concurrency = self.settings.concurrency,
            lease_secs = self.settings.lease.as_secs(),
            "Sync worker started"
        );

        while !shutdown.is_cancelled() {
            let free = permits.available_permits();
            let leased = if free == 0 {
                Vec::new()
            } else {
                match self
                    .metadata
                    .lease(
                        OffsetDateTime::now_utc(),
                        u32::try_from(free).unwrap_or(u32::MAX),
                        self.settings.lease,
                        self.settings.max_deliveries,
                    )
                    .await
                {
                    Ok(leased) => leased,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to lease work items");
                        Vec::new()
                    }
                }
            };

            if leased.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                }
                continue;
            }

            for item in leased {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let worker = self.clone();
                tokio::spawn(async move {
                    let item_id = item.item_id;
                    if let Err(e) = worker.process(item, OffsetDateTime::now_utc()).await {
                        // Left leased; redelivered once the lease expires.
                        tracing::warn!(item_id = %item_id, error = %e, "Work item not acked");
                    }
                    drop(permit);
                });
            }
        }

        tracing::info!("Sync worker draining in-flight items");
        let total = u32::try_from(self.settings.concurrency).unwrap_or(u32::MAX);
        if let Ok(all) = permits.acquire_many(total).await {
            drop(all);
        }
        tracing::info!("Sync worker stopped");
    }
}
