//! Transfer engine error types.

use depot_core::{TaskId, TaskStatus};
use depot_metadata::MetadataError;
use depot_storage::StorageError;
use thiserror::Error;

/// Transfer engine errors.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Unknown task, or a task owned by another user.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("task {task_id} is {status}, cannot {operation}")]
    InvalidTaskStatus {
        task_id: TaskId,
        status: TaskStatus,
        operation: &'static str,
    },

    #[error("chunk index {index} out of range for {total} chunks")]
    InvalidChunkIndex { index: u32, total: u32 },

    #[error("chunk {index} is {actual} bytes, expected {expected}")]
    ChunkSizeMismatch { index: u32, expected: u64, actual: u64 },

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("merge failed: {0}")]
    MergeFailed(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Core(depot_core::Error),
}

/// Result type for transfer operations.
pub type TransferResult<T> = std::result::Result<T, TransferError>;

impl From<depot_core::Error> for TransferError {
    fn from(e: depot_core::Error) -> Self {
        match e {
            depot_core::Error::HashMismatch { expected, actual } => {
                TransferError::HashMismatch { expected, actual }
            }
            other => TransferError::Core(other),
        }
    }
}

impl TransferError {
    /// Stable snake_case code for clients and event payloads.
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::TaskNotFound(_) => "task_not_found",
            TransferError::InvalidTaskStatus { .. } => "invalid_task_status",
            TransferError::InvalidChunkIndex { .. } => "invalid_chunk_index",
            TransferError::ChunkSizeMismatch { .. } => "chunk_size_mismatch",
            TransferError::HashMismatch { .. } => "hash_mismatch",
            TransferError::InvalidRequest(_) => "invalid_request",
            TransferError::MergeFailed(_) => "merge_failed",
            TransferError::Storage(e) => e.code(),
            TransferError::Metadata(_) => "metadata_error",
            TransferError::Core(_) => "invalid_input",
        }
    }

    /// Failures confined to one chunk. The task stays as it was and the
    /// client may retry the chunk.
    pub fn is_chunk_level(&self) -> bool {
        matches!(
            self,
            TransferError::InvalidChunkIndex { .. }
                | TransferError::ChunkSizeMismatch { .. }
                | TransferError::HashMismatch { .. }
                | TransferError::Storage(_)
        )
    }

    pub(crate) fn status(task_id: TaskId, status: TaskStatus, operation: &'static str) -> Self {
        TransferError::InvalidTaskStatus {
            task_id,
            status,
            operation,
        }
    }
}
