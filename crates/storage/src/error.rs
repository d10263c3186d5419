//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 error: {0}")]
    S3(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown multipart session {session} for {key}")]
    UnknownSession { key: String, session: String },

    #[error("missing part: {0}")]
    MissingPart(String),
}

impl StorageError {
    /// Whether retrying the same call cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::InvalidKey(_)
                | Self::InvalidRange(_)
                | Self::Config(_)
                | Self::UnknownSession { .. }
                | Self::MissingPart(_)
        )
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
