//! Sync engine error types.

use std::time::Duration;
use thiserror::Error;
use twinstore_metadata::MetadataError;
use twinstore_storage::StorageError;

/// How a failed task is treated by the dead-letter reaper.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// May succeed on a later attempt.
    Transient,
    /// Will fail the same way every time (missing source, corrupt manifest).
    Permanent,
    /// Dependencies did not appear at the destination before the deadline.
    DependencyStalled,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::DependencyStalled => "dependency_stalled",
        }
    }

    /// Parse the stored form. Unknown values read as transient.
    pub fn parse(s: &str) -> Self {
        match s {
            "permanent" => Self::Permanent,
            "dependency_stalled" => Self::DependencyStalled,
            _ => Self::Transient,
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sync engine errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error on replica {replica}: {source}")]
    Storage {
        replica: String,
        #[source]
        source: StorageError,
    },

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Core(#[from] twinstore_core::Error),

    #[error("source object {key} not found on replica {replica}")]
    SourceMissing { replica: String, key: String },

    #[error("unknown replica: {0}")]
    UnknownReplica(String),

    #[error("{op} timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },

    #[error("{op} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        op: &'static str,
        attempts: u32,
        #[source]
        last: Box<SyncError>,
    },
}

impl SyncError {
    /// Wrap a storage error with the replica it came from.
    pub fn storage(replica: impl Into<String>, source: StorageError) -> Self {
        Self::Storage {
            replica: replica.into(),
            source,
        }
    }

    /// Wrap an error reading from a source replica; a missing object is permanent.
    pub fn source_read(replica: &str, key: &str, source: StorageError) -> Self {
        match source {
            StorageError::NotFound(_) => Self::SourceMissing {
                replica: replica.to_string(),
                key: key.to_string(),
            },
            source => Self::storage(replica, source),
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            Self::Storage { source, .. } if source.is_permanent() => FailureClass::Permanent,
            Self::Storage { .. } | Self::Metadata(_) | Self::Timeout { .. } => {
                FailureClass::Transient
            }
            Self::Core(_) | Self::SourceMissing { .. } | Self::UnknownReplica(_) => {
                FailureClass::Permanent
            }
            Self::RetriesExhausted { last, .. } => match last.class() {
                FailureClass::Permanent => FailureClass::Permanent,
                _ => FailureClass::Transient,
            },
        }
    }

    /// Whether retrying cannot help.
    pub fn is_permanent(&self) -> bool {
        self.class() == FailureClass::Permanent
    }

    /// Attempts this failure used up from the task's total budget.
    pub fn attempts_consumed(&self) -> u32 {
        match self {
            Self::RetriesExhausted { attempts, .. } => (*attempts).max(1),
            _ => 1,
        }
    }
}

/// Result type for sync operations.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_not_found_is_permanent() {
        let err = SyncError::storage("primary", StorageError::NotFound("blobs/x".into()));
        assert!(err.is_permanent());
    }

    #[test]
    fn test_io_is_transient() {
        let err = SyncError::storage(
            "primary",
            StorageError::Io(std::io::Error::other("connection reset")),
        );
        assert_eq!(err.class(), FailureClass::Transient);
        assert_eq!(err.attempts_consumed(), 1);
    }

    #[test]
    fn test_exhausted_keeps_attempts_and_class() {
        let err = SyncError::RetriesExhausted {
            op: "copy_part",
            attempts: 3,
            last: Box::new(SyncError::Timeout {
                op: "copy_part",
                timeout: Duration::from_secs(1),
            }),
        };
        assert_eq!(err.class(), FailureClass::Transient);
        assert_eq!(err.attempts_consumed(), 3);
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[test]
    fn test_failure_class_roundtrips_through_storage_form() {
        for class in [
            FailureClass::Transient,
            FailureClass::Permanent,
            FailureClass::DependencyStalled,
        ] {
            assert_eq!(FailureClass::parse(class.as_str()), class);
        }
    }
}
