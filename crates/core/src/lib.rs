//! Core domain types and shared logic for twinstore replication.
//!
//! This crate defines the data model used across all other crates:
//! - Object kinds, keys and their store layout
//! - Manifest documents and their dependency sets
//! - Content hashing
//! - Copy planning
//! - Sync tasks and work items
//! - Configuration

pub mod config;
pub mod error;
pub mod hash;
pub mod manifest;
pub mod object;
pub mod plan;
pub mod task;

pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher};
pub use manifest::{
    BundleEntry, BundleManifest, CollectionItem, CollectionManifest, FileManifest, Manifest,
};
pub use object::{ManifestKey, ManifestVersion, ObjectKey, ObjectKind, ObjectRef};
pub use plan::{CopyPlan, PartRange, plan};
pub use task::{Notification, ReplicaId, SourceKind, SyncTask, WorkItem};

/// Default part size: 64 MiB
pub const DEFAULT_PART_SIZE: u64 = 64 * 1024 * 1024;

/// Minimum part size accepted by multipart uploads: 5 MiB
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
