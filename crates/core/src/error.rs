//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("invalid chunk size: {size} (must be between 1 and {max})")]
    InvalidChunkSize { size: u64, max: u64 },

    #[error("invalid chunk plan: {0}")]
    InvalidPlan(String),

    #[error("invalid task id: {0}")]
    InvalidTaskId(String),

    #[error("unknown task status: {0}")]
    UnknownStatus(String),

    #[error("invalid storage config: {0}")]
    InvalidStorageConfig(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
