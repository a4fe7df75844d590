//! Durable chunk progress tracking.

use crate::error::{TransferError, TransferResult};
use depot_core::TaskId;
use depot_core::config::TransferConfig;
use depot_metadata::MetadataStore;
use depot_metadata::models::ChunkRow;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::instrument;

/// Result of recording a chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    /// First record for this index.
    Recorded,
    /// The index was already recorded; the original part id is kept.
    AlreadyPresent { part_id: String },
    /// The task stopped accepting chunks, nothing was written.
    Refused,
}

/// Point-in-time view of a task's transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub uploaded_chunks: u32,
    pub total_chunks: u32,
    pub transferred_bytes: u64,
    pub total_bytes: u64,
    /// Average bytes per second since the transfer started.
    pub speed_bps: u64,
    /// Seconds left at the current speed, if there is a speed to go by.
    pub eta_secs: Option<u64>,
}

impl ProgressSnapshot {
    fn compute(
        uploaded_chunks: u32,
        total_chunks: u32,
        transferred_bytes: u64,
        total_bytes: u64,
        elapsed: Duration,
    ) -> Self {
        let elapsed_ms = elapsed.whole_milliseconds();
        let speed_bps = if elapsed_ms > 0 {
            (u128::from(transferred_bytes) * 1000 / elapsed_ms as u128) as u64
        } else {
            0
        };
        let remaining = total_bytes.saturating_sub(transferred_bytes);
        let eta_secs = match (remaining, speed_bps) {
            (0, _) => Some(0),
            (_, 0) => None,
            (remaining, speed) => Some(remaining.div_ceil(speed)),
        };
        Self {
            uploaded_chunks: uploaded_chunks.min(total_chunks),
            total_chunks,
            transferred_bytes,
            total_bytes,
            speed_bps,
            eta_secs,
        }
    }
}

/// Tracks which chunks of a task are done, backed by the metadata store so
/// progress survives restarts.
///
/// Every row written carries an expiry: the normal retention while the task
/// is alive, the shorter failed window once it fails. Reads ignore expired
/// rows.
pub struct ChunkProgressTracker {
    store: Arc<dyn MetadataStore>,
    retention: Duration,
    failed_retention: Duration,
}

impl ChunkProgressTracker {
    pub fn new(store: Arc<dyn MetadataStore>, config: &TransferConfig) -> Self {
        Self {
            store,
            retention: config.retention(),
            failed_retention: config.failed_retention(),
        }
    }

    fn expiry(&self, now: OffsetDateTime) -> OffsetDateTime {
        now + self.retention
    }

    /// Record a completed chunk.
    #[instrument(skip(self, part_id, chunk_hash), fields(task_id = %task_id))]
    pub async fn record_chunk(
        &self,
        task_id: TaskId,
        chunk_index: u32,
        part_id: &str,
        size: u64,
        chunk_hash: &str,
    ) -> TransferResult<RecordOutcome> {
        let now = OffsetDateTime::now_utc();
        let row = ChunkRow {
            task_id: *task_id.as_uuid(),
            chunk_index: i64::from(chunk_index),
            size: i64::try_from(size)
                .map_err(|_| TransferError::InvalidRequest(format!("chunk size {size} out of range")))?,
            chunk_hash: chunk_hash.to_string(),
            part_id: part_id.to_string(),
            recorded_at: now,
            expires_at: self.expiry(now),
        };
        if self.store.insert_chunk(&row).await? {
            tracing::debug!(chunk_index, "Chunk recorded");
            return Ok(RecordOutcome::Recorded);
        }

        match self
            .store
            .get_chunk(*task_id.as_uuid(), chunk_index, now)
            .await?
        {
            Some(existing) => {
                tracing::debug!(chunk_index, "Chunk already recorded");
                Ok(RecordOutcome::AlreadyPresent {
                    part_id: existing.part_id,
                })
            }
            None => {
                tracing::debug!(chunk_index, "Task no longer accepts chunks");
                Ok(RecordOutcome::Refused)
            }
        }
    }

    /// Part id of an already recorded chunk.
    pub async fn recorded_part(
        &self,
        task_id: TaskId,
        chunk_index: u32,
    ) -> TransferResult<Option<String>> {
        let row = self
            .store
            .get_chunk(*task_id.as_uuid(), chunk_index, OffsetDateTime::now_utc())
            .await?;
        Ok(row.map(|r| r.part_id))
    }

    /// Mark the transfer start. A second call keeps the first start time.
    pub async fn start(&self, task_id: TaskId) -> TransferResult<()> {
        let now = OffsetDateTime::now_utc();
        self.store
            .start_progress(*task_id.as_uuid(), now, self.expiry(now))
            .await?;
        Ok(())
    }

    /// Add transferred bytes. Returns the new total, or `None` once the
    /// task was canceled, failed or completed.
    pub async fn record_bytes(&self, task_id: TaskId, delta: u64) -> TransferResult<Option<u64>> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .store
            .add_bytes(*task_id.as_uuid(), delta, now, self.expiry(now))
            .await?)
    }

    pub async fn completed_count(&self, task_id: TaskId) -> TransferResult<u32> {
        let count = self
            .store
            .count_chunks(*task_id.as_uuid(), OffsetDateTime::now_utc())
            .await?;
        u32::try_from(count)
            .map_err(|_| TransferError::InvalidRequest(format!("chunk count {count} out of range")))
    }

    pub async fn is_complete(&self, task_id: TaskId, total_chunks: u32) -> TransferResult<bool> {
        Ok(self.completed_count(task_id).await? == total_chunks)
    }

    /// Recorded chunks as `index -> part id`, ascending by index.
    pub async fn list_completed(&self, task_id: TaskId) -> TransferResult<BTreeMap<u32, String>> {
        let rows = self
            .store
            .list_chunks(*task_id.as_uuid(), OffsetDateTime::now_utc())
            .await?;
        rows.into_iter()
            .map(|row| {
                let index = u32::try_from(row.chunk_index).map_err(|_| {
                    TransferError::InvalidRequest(format!(
                        "stored chunk index {} out of range",
                        row.chunk_index
                    ))
                })?;
                Ok((index, row.part_id))
            })
            .collect()
    }

    pub async fn completed_indices(&self, task_id: TaskId) -> TransferResult<Vec<u32>> {
        Ok(self.list_completed(task_id).await?.into_keys().collect())
    }

    pub async fn snapshot(
        &self,
        task_id: TaskId,
        total_size: u64,
        total_chunks: u32,
    ) -> TransferResult<ProgressSnapshot> {
        let now = OffsetDateTime::now_utc();
        let uploaded = self.completed_count(task_id).await?;
        let progress = self.store.get_progress(*task_id.as_uuid(), now).await?;
        let (transferred, elapsed) = match progress {
            Some(p) => (p.transferred_bytes.max(0) as u64, now - p.started_at),
            None => (0, Duration::ZERO),
        };
        Ok(ProgressSnapshot::compute(
            uploaded,
            total_chunks,
            transferred,
            total_size,
            elapsed,
        ))
    }

    /// Shorten the ledger's retention to the failed-task window.
    pub async fn extend_for_failure(&self, task_id: TaskId) -> TransferResult<()> {
        let expires_at = OffsetDateTime::now_utc() + self.failed_retention;
        self.store
            .set_ledger_expiry(*task_id.as_uuid(), expires_at)
            .await?;
        Ok(())
    }

    /// Drop every tracked row of a task.
    pub async fn clear(&self, task_id: TaskId) -> TransferResult<()> {
        self.store.clear_ledger(*task_id.as_uuid()).await?;
        Ok(())
    }

    pub fn failed_retention(&self) -> Duration {
        self.failed_retention
    }
}
