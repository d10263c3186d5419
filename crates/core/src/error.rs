//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("invalid object kind: {0}")]
    InvalidKind(String),

    #[error("invalid manifest version: {0}")]
    InvalidVersion(String),

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("invalid copy plan input: {0}")]
    InvalidPlan(String),

    #[error("manifest integrity error: {0}")]
    ManifestIntegrity(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
