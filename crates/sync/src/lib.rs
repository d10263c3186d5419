//! Cross-replica synchronization engine for twinstore.
//!
//! This crate provides:
//! - Dependency resolution against destination replicas
//! - Bounded retry with backoff and per-attempt timeouts
//! - The per-task synchronization state machine
//! - Chunked copies coordinated through the metadata store
//! - Queue workers, the dead-letter reaper and the consistency verifier
//! - Prometheus metrics

pub mod coordinator;
pub mod dead_letter;
pub mod error;
pub mod machine;
pub mod metrics;
pub mod notification;
pub mod reaper;
pub mod replicas;
pub mod resolver;
pub mod retry;
pub mod verifier;
pub mod worker;

pub use coordinator::{CopyCoordinator, DispatchOutcome, FinalizeOutcome, PartOutcome};
pub use error::{FailureClass, SyncError, SyncResult};
pub use machine::{Completion, Event, MachineSettings, Outcome, SyncMachine, SyncState, step};
pub use notification::{InboundEvent, StoreEvent};
pub use reaper::{Reaper, ReaperReport};
pub use replicas::ReplicaSet;
pub use retry::RetryPolicy;
pub use verifier::{Mismatch, MismatchKind, VerificationReport, Verifier};
pub use worker::{Worker, WorkerSettings};

use std::sync::Arc;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use twinstore_core::config::SyncConfig;
use twinstore_core::{SyncTask, WorkItem};
use twinstore_metadata::MetadataStore;
use uuid::Uuid;

/// The wired-up engine: replicas, coordination store, worker and reaper.
#[derive(Clone)]
pub struct SyncEngine {
    pub replicas: Arc<ReplicaSet>,
    pub metadata: Arc<dyn MetadataStore>,
    pub coordinator: Arc<CopyCoordinator>,
    pub machine: Arc<SyncMachine>,
    pub worker: Arc<Worker>,
    pub reaper: Arc<Reaper>,
}

impl SyncEngine {
    pub fn new(config: &SyncConfig, replicas: ReplicaSet, metadata: Arc<dyn MetadataStore>) -> Self {
        let replicas = Arc::new(replicas);
        let retry = RetryPolicy::from_config(config);
        let coordinator = Arc::new(CopyCoordinator::new(
            metadata.clone(),
            replicas.clone(),
            retry.clone(),
        ));
        let machine = Arc::new(SyncMachine::new(
            replicas.clone(),
            coordinator.clone(),
            retry,
            MachineSettings::from(config),
        ));
        let worker = Arc::new(Worker::new(
            metadata.clone(),
            machine.clone(),
            coordinator.clone(),
            WorkerSettings::from(config),
        ));
        let reaper = Arc::new(Reaper::new(metadata.clone(), coordinator.clone(), config));

        Self {
            replicas,
            metadata,
            coordinator,
            machine,
            worker,
            reaper,
        }
    }

    /// Queue a task for immediate processing.
    pub async fn submit(&self, task: SyncTask) -> SyncResult<Uuid> {
        let item_id = self
            .metadata
            .enqueue(&WorkItem::Sync(task.clone()), OffsetDateTime::now_utc())
            .await?;
        tracing::debug!(
            item_id = %item_id,
            task_id = %task.task_id,
            object = %task.source_ref(),
            source = %task.source,
            destination = %task.destination,
            source_kind = task.source_kind.as_str(),
            "Task submitted"
        );
        Ok(item_id)
    }

    /// A verifier over this engine's replicas.
    pub fn verifier(&self, page_size: usize, config: &SyncConfig) -> Verifier {
        Verifier::new(self.replicas.clone(), page_size, config.operation_timeout())
    }

    /// Start the worker loop and the reaper. Both stop when `shutdown` fires.
    pub fn spawn(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.worker.clone().run(shutdown.clone())),
            tokio::spawn(self.reaper.clone().run(shutdown)),
        ]
    }
}
