//! Chunk ledger repository.

use crate::error::MetadataResult;
use crate::models::{ChunkRow, ProgressRow};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Durable record of completed chunks and transferred bytes.
///
/// Rows carry `expires_at`; every read takes `now` and ignores rows that
/// expired before it.
#[async_trait]
pub trait LedgerRepo: Send + Sync {
    /// Insert a chunk row unless a live row for the same index exists or
    /// the task is no longer `uploading` or `paused`.
    /// Returns true if this call inserted it.
    async fn insert_chunk(&self, chunk: &ChunkRow) -> MetadataResult<bool>;

    /// Get the live row for one index.
    async fn get_chunk(
        &self,
        task_id: Uuid,
        chunk_index: u32,
        now: OffsetDateTime,
    ) -> MetadataResult<Option<ChunkRow>>;

    /// Live rows ordered by chunk index.
    async fn list_chunks(&self, task_id: Uuid, now: OffsetDateTime) -> MetadataResult<Vec<ChunkRow>>;

    /// Number of live rows.
    async fn count_chunks(&self, task_id: Uuid, now: OffsetDateTime) -> MetadataResult<u64>;

    /// Create the progress row if absent. An existing start time is kept.
    async fn start_progress(
        &self,
        task_id: Uuid,
        started_at: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Add `delta` to the byte counter, creating the row if needed.
    /// Returns the new total, or `None` once the task is no longer
    /// `uploading`, `paused` or `merging`.
    async fn add_bytes(
        &self,
        task_id: Uuid,
        delta: u64,
        now: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> MetadataResult<Option<u64>>;

    async fn get_progress(
        &self,
        task_id: Uuid,
        now: OffsetDateTime,
    ) -> MetadataResult<Option<ProgressRow>>;

    /// Replace the expiry of every ledger row of a task.
    async fn set_ledger_expiry(&self, task_id: Uuid, expires_at: OffsetDateTime) -> MetadataResult<()>;

    /// Delete every ledger row of a task.
    async fn clear_ledger(&self, task_id: Uuid) -> MetadataResult<()>;

    /// Delete rows that expired before `now`. Returns (chunks, progress).
    async fn purge_expired_ledger(&self, now: OffsetDateTime) -> MetadataResult<(u64, u64)>;
}
