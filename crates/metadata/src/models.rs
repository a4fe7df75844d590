//! Database models mapping to the metadata schema.

use crate::error::MetadataError;
use depot_core::{TaskId, TaskStatus, TransferTask};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Transfer tasks
// =============================================================================

/// Persisted transfer task.
#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub task_id: Uuid,
    pub user_id: String,
    pub file_name: String,
    pub object_key: String,
    pub upload_id: Option<String>,
    pub total_size: i64,
    pub content_hash: String,
    pub chunk_size: i64,
    pub total_chunks: i64,
    pub uploaded_chunks: i64,
    pub mime_type: Option<String>,
    pub platform: String,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: OffsetDateTime,
    pub started_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

impl From<&TransferTask> for TaskRow {
    fn from(task: &TransferTask) -> Self {
        Self {
            task_id: *task.task_id.as_uuid(),
            user_id: task.user_id.clone(),
            file_name: task.file_name.clone(),
            object_key: task.object_key.clone(),
            upload_id: task.upload_id.clone(),
            total_size: task.total_size as i64,
            content_hash: task.content_hash.clone(),
            chunk_size: task.chunk_size as i64,
            total_chunks: i64::from(task.total_chunks),
            uploaded_chunks: i64::from(task.uploaded_chunks),
            mime_type: task.mime_type.clone(),
            platform: task.platform.clone(),
            status: task.status.as_str().to_string(),
            error_message: task.error_message.clone(),
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            updated_at: task.updated_at,
            expires_at: task.expires_at,
        }
    }
}

impl TryFrom<TaskRow> for TransferTask {
    type Error = MetadataError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let corrupt = |field: &str| {
            MetadataError::Internal(format!("task {} has invalid {field}", row.task_id))
        };
        let status: TaskStatus = row.status.parse().map_err(|_| corrupt("status"))?;
        let total_size = u64::try_from(row.total_size).map_err(|_| corrupt("total_size"))?;
        let chunk_size = u64::try_from(row.chunk_size).map_err(|_| corrupt("chunk_size"))?;
        let total_chunks = u32::try_from(row.total_chunks).map_err(|_| corrupt("total_chunks"))?;
        let uploaded_chunks =
            u32::try_from(row.uploaded_chunks).map_err(|_| corrupt("uploaded_chunks"))?;

        Ok(TransferTask {
            task_id: TaskId::from_uuid(row.task_id),
            user_id: row.user_id,
            file_name: row.file_name,
            object_key: row.object_key,
            upload_id: row.upload_id,
            total_size,
            content_hash: row.content_hash,
            chunk_size,
            total_chunks,
            uploaded_chunks,
            mime_type: row.mime_type,
            platform: row.platform,
            status,
            error_message: row.error_message,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
            expires_at: row.expires_at,
        })
    }
}

// =============================================================================
// Chunk ledger
// =============================================================================

/// One completed chunk of a task. Never modified after insert.
#[derive(Debug, Clone, FromRow)]
pub struct ChunkRow {
    pub task_id: Uuid,
    pub chunk_index: i64,
    pub size: i64,
    pub chunk_hash: String,
    pub part_id: String,
    pub recorded_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

/// Byte counter and start time of a task's transfer.
#[derive(Debug, Clone, FromRow)]
pub struct ProgressRow {
    pub task_id: Uuid,
    pub transferred_bytes: i64,
    pub started_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

// =============================================================================
// Leased locks
// =============================================================================

/// Per-task lease lock.
#[derive(Debug, Clone, FromRow)]
pub struct LockRow {
    pub task_id: Uuid,
    pub holder: Uuid,
    pub acquired_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

// =============================================================================
// Files
// =============================================================================

/// Finalized file.
#[derive(Debug, Clone, FromRow)]
pub struct FileRow {
    pub file_id: Uuid,
    pub user_id: String,
    pub file_name: String,
    pub object_key: String,
    pub size: i64,
    pub content_hash: String,
    pub mime_type: Option<String>,
    pub platform: String,
    pub created_at: OffsetDateTime,
}

/// Rows removed by one expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub tasks: u64,
    pub chunks: u64,
    pub progress: u64,
    pub locks: u64,
}

impl PurgeStats {
    pub fn total(&self) -> u64 {
        self.tasks + self.chunks + self.progress + self.locks
    }
}
