//! Normalizing inbound notifications into sync tasks.
//!
//! Two shapes arrive at the intake: a bare store event ("this key was written
//! on this replica"), which fans out to every other replica, and a forwarded
//! notification naming both ends of the copy.

use crate::error::{SyncError, SyncResult};
use crate::replicas::ReplicaSet;
use serde::{Deserialize, Serialize};
use twinstore_core::{Notification, ObjectRef, ReplicaId, SourceKind, SyncTask};

/// A write observed on one replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEvent {
    pub replica: String,
    pub key: String,
    #[serde(default)]
    pub size: Option<u64>,
}

/// Any notification body accepted by the intake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InboundEvent {
    Forwarded(Notification),
    Store(StoreEvent),
}

impl InboundEvent {
    /// Tasks this event asks for. Replicas must be known to `replicas`.
    pub fn into_tasks(self, replicas: &ReplicaSet) -> SyncResult<Vec<SyncTask>> {
        match self {
            Self::Forwarded(notification) => {
                let task = SyncTask::from_notification(&notification, SourceKind::ForwardedEvent)?;
                for replica in [&task.source, &task.destination] {
                    if !replicas.contains(replica) {
                        return Err(SyncError::UnknownReplica(replica.to_string()));
                    }
                }
                Ok(vec![task])
            }
            Self::Store(event) => {
                let source = ReplicaId::new(&event.replica);
                if !replicas.contains(&source) {
                    return Err(SyncError::UnknownReplica(event.replica));
                }
                let object = ObjectRef::from_storage_key(&event.key)?;
                Ok(replicas
                    .others(&source)
                    .map(|(dest, _)| {
                        SyncTask::new(
                            SourceKind::StoreEvent,
                            source.clone(),
                            dest.clone(),
                            object.clone(),
                            event.size,
                        )
                    })
                    .collect())
            }
        }
    }
}
