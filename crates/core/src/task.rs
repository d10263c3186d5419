//! Units of replication work.

use crate::object::{ObjectKind, ObjectKey, ObjectRef};
use crate::plan::PartRange;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Name of a configured replica.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Where a task came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// A change event emitted by the source store itself.
    StoreEvent,
    /// An event relayed from another cloud's event bus.
    ForwardedEvent,
    /// Replayed from the dead-letter channel.
    Redrive,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StoreEvent => "store_event",
            Self::ForwardedEvent => "forwarded_event",
            Self::Redrive => "redrive",
        }
    }
}

/// A storage-change notification as delivered by an event source.
///
/// Keys are full store keys (`blobs/...`, `files/...`). `dest_key` defaults
/// to `source_key`; `object_kind` is inferred from the key prefix when absent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub source_replica: String,
    pub source_key: String,
    pub dest_replica: String,
    #[serde(default)]
    pub dest_key: Option<String>,
    #[serde(default)]
    pub object_kind: Option<ObjectKind>,
    #[serde(default)]
    pub size: Option<u64>,
}

/// The unit of work submitted to the synchronization state machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTask {
    pub task_id: Uuid,
    pub source_kind: SourceKind,
    pub source: ReplicaId,
    pub destination: ReplicaId,
    pub kind: ObjectKind,
    pub source_key: ObjectKey,
    pub dest_key: ObjectKey,
    /// Size in bytes if the notification carried it.
    pub size: Option<u64>,
    #[serde(with = "time::serde::rfc3339")]
    pub discovered_at: OffsetDateTime,
    /// Total attempts so far, across dead-letter redrives.
    #[serde(default)]
    pub attempts: u32,
    /// When the task first had to wait for dependencies.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub waiting_since: Option<OffsetDateTime>,
}

impl SyncTask {
    /// Create a task copying `object` between two replicas under the same key.
    pub fn new(
        source_kind: SourceKind,
        source: ReplicaId,
        destination: ReplicaId,
        object: ObjectRef,
        size: Option<u64>,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            source_kind,
            source,
            destination,
            kind: object.kind,
            source_key: object.key.clone(),
            dest_key: object.key,
            size,
            discovered_at: OffsetDateTime::now_utc(),
            attempts: 0,
            waiting_since: None,
        }
    }

    /// Normalize a notification into a task.
    pub fn from_notification(
        notification: &Notification,
        source_kind: SourceKind,
    ) -> crate::Result<Self> {
        if notification.source_replica == notification.dest_replica {
            return Err(crate::Error::InvalidKey(format!(
                "source and destination replica are both {}",
                notification.source_replica
            )));
        }

        let source = ObjectRef::from_storage_key(&notification.source_key)?;
        let dest = match &notification.dest_key {
            Some(key) => ObjectRef::from_storage_key(key)?,
            None => source.clone(),
        };
        if dest.kind != source.kind {
            return Err(crate::Error::InvalidKind(format!(
                "source {source} and destination {dest} differ in kind"
            )));
        }
        if let Some(kind) = notification.object_kind
            && kind != source.kind
        {
            return Err(crate::Error::InvalidKind(format!(
                "notification declares {kind} for {}",
                notification.source_key
            )));
        }

        let mut task = Self::new(
            source_kind,
            ReplicaId::new(&notification.source_replica),
            ReplicaId::new(&notification.dest_replica),
            source,
            notification.size,
        );
        task.dest_key = dest.key;
        Ok(task)
    }

    pub fn source_ref(&self) -> ObjectRef {
        ObjectRef::new(self.kind, self.source_key.clone())
    }

    pub fn dest_ref(&self) -> ObjectRef {
        ObjectRef::new(self.kind, self.dest_key.clone())
    }

    /// A fresh copy of this task for replay from the dead-letter channel.
    ///
    /// Keeps the attempt counter; resets the dependency wait.
    pub fn redrive(&self) -> Self {
        Self {
            source_kind: SourceKind::Redrive,
            waiting_since: None,
            ..self.clone()
        }
    }
}

/// An item on the work queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkItem {
    /// Run (or resume) the state machine for a task.
    Sync(SyncTask),
    /// Copy one part of a chunked copy job.
    CopyPart { job_id: Uuid, part: PartRange },
}

impl WorkItem {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sync(_) => "sync",
            Self::CopyPart { .. } => "copy_part",
        }
    }

    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| crate::Error::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| crate::Error::Serialization(e.to_string()))
    }
}
