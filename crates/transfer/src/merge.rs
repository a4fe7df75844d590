//! Merge coordination: at most one finalize per task.

use crate::error::{TransferError, TransferResult};
use crate::lock::{LockGuard, MergeLock};
use crate::metrics;
use crate::notify::{Notifier, TransferEvent};
use crate::pool::WorkerPool;
use crate::tracker::ChunkProgressTracker;
use depot_core::task::truncate_error_message;
use depot_core::{ChunkPlan, TaskId, TaskStatus, TransferTask};
use depot_metadata::MetadataStore;
use depot_metadata::models::FileRow;
use depot_storage::{CompletedPart, StorageBackend};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::instrument;
use uuid::Uuid;

/// Result of a merge attempt.
#[derive(Debug)]
pub enum MergeOutcome {
    /// Not every chunk is recorded yet.
    NotReady,
    /// Another caller held the task lock for the whole wait. Try later.
    LockTimeout,
    /// The task already left `uploading` (paused, merging or terminal).
    AlreadyAdvanced(TaskStatus),
    /// This caller won the transition; finalize runs on the merge pool and
    /// resolves to the new file id, or `None` if finalize did not complete
    /// the task.
    Scheduled(JoinHandle<Option<Uuid>>),
}

impl MergeOutcome {
    pub fn is_scheduled(&self) -> bool {
        matches!(self, MergeOutcome::Scheduled(_))
    }
}

/// Decides which caller finalizes a task and runs the finalize.
#[derive(Clone)]
pub struct MergeCoordinator {
    store: Arc<dyn MetadataStore>,
    tracker: Arc<ChunkProgressTracker>,
    lock: Arc<MergeLock>,
    notifier: Notifier,
    pool: WorkerPool,
}

impl MergeCoordinator {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        tracker: Arc<ChunkProgressTracker>,
        lock: Arc<MergeLock>,
        notifier: Notifier,
        pool: WorkerPool,
    ) -> Self {
        Self {
            store,
            tracker,
            lock,
            notifier,
            pool,
        }
    }

    async fn load(&self, task_id: TaskId) -> TransferResult<TransferTask> {
        let row = self
            .store
            .get_task(*task_id.as_uuid())
            .await?
            .ok_or(TransferError::TaskNotFound(task_id))?;
        Ok(TransferTask::try_from(row)?)
    }

    /// Attempt the `uploading -> merging` transition and schedule finalize.
    #[instrument(skip(self, backend), fields(task_id = %task_id))]
    pub async fn try_merge(
        &self,
        task_id: TaskId,
        backend: Arc<dyn StorageBackend>,
    ) -> TransferResult<MergeOutcome> {
        let task = self.load(task_id).await?;
        if !self.tracker.is_complete(task_id, task.total_chunks).await? {
            return Ok(MergeOutcome::NotReady);
        }

        let Some(guard) = self.lock.acquire(task_id).await? else {
            metrics::MERGE_LOCK_TIMEOUTS.inc();
            tracing::warn!("Timed out waiting for merge lock");
            return Ok(MergeOutcome::LockTimeout);
        };

        // Re-read under the lock; a concurrent caller may have advanced it.
        let task = match self.load(task_id).await {
            Ok(task) => task,
            Err(e) => {
                release(guard).await;
                return Err(e);
            }
        };
        if task.status != TaskStatus::Uploading {
            release(guard).await;
            tracing::debug!(status = %task.status, "Merge skipped, task already advanced");
            return Ok(MergeOutcome::AlreadyAdvanced(task.status));
        }

        let won = self
            .store
            .compare_and_set_status(
                *task_id.as_uuid(),
                TaskStatus::Uploading.as_str(),
                TaskStatus::Merging.as_str(),
                OffsetDateTime::now_utc(),
            )
            .await;
        release(guard).await;
        if !won? {
            let status = self.load(task_id).await?.status;
            return Ok(MergeOutcome::AlreadyAdvanced(status));
        }

        tracing::info!(total_chunks = task.total_chunks, "Merging task");
        self.notifier
            .send(&task.user_id, task_id, TransferEvent::Merging)
            .await;

        let this = self.clone();
        let handle = self.pool.spawn(async move {
            let started = Instant::now();
            let result = this.finalize(&task, backend.as_ref()).await;
            metrics::FINALIZE_DURATION.observe(started.elapsed().as_secs_f64());
            match result {
                Ok(file_id) => file_id,
                Err(e) => {
                    this.fail(&task, &e).await;
                    None
                }
            }
        });
        Ok(MergeOutcome::Scheduled(handle))
    }

    async fn finalize(
        &self,
        task: &TransferTask,
        backend: &dyn StorageBackend,
    ) -> TransferResult<Option<Uuid>> {
        let task_id = task.task_id;
        let upload_id = task
            .upload_id
            .as_deref()
            .ok_or_else(|| TransferError::MergeFailed("task has no multipart upload".into()))?;

        let recorded = self.tracker.list_completed(task_id).await?;
        if recorded.len() != task.total_chunks as usize {
            return Err(TransferError::MergeFailed(format!(
                "{} of {} chunks recorded at merge time",
                recorded.len(),
                task.total_chunks
            )));
        }
        let parts: Vec<CompletedPart> = recorded
            .into_iter()
            .map(|(index, part_id)| CompletedPart {
                part_number: ChunkPlan::part_number(index),
                part_id,
            })
            .collect();

        backend
            .complete_multipart_upload(&task.object_key, upload_id, &parts)
            .await?;

        let now = OffsetDateTime::now_utc();
        let file = FileRow {
            file_id: Uuid::new_v4(),
            user_id: task.user_id.clone(),
            file_name: task.file_name.clone(),
            object_key: task.object_key.clone(),
            size: i64::try_from(task.total_size)
                .map_err(|_| TransferError::MergeFailed("file size out of range".into()))?,
            content_hash: task.content_hash.clone(),
            mime_type: task.mime_type.clone(),
            platform: task.platform.clone(),
            created_at: now,
        };
        self.store.create_file(&file).await?;

        let completed = self
            .store
            .complete_task(*task_id.as_uuid(), TaskStatus::Merging.as_str(), now)
            .await?;
        if !completed {
            // Canceled while merging: drop what finalize produced.
            tracing::info!(task_id = %task_id, "Task left merging during finalize, discarding object");
            if let Err(e) = self.store.delete_file(file.file_id).await {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to delete orphaned file record");
            }
            if let Err(e) = backend.delete(&task.object_key).await {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to delete orphaned object");
            }
            return Ok(None);
        }

        metrics::TASKS_COMPLETED.inc();
        metrics::ACTIVE_TASKS.dec();
        tracing::info!(task_id = %task_id, file_id = %file.file_id, size = task.total_size, "Task completed");
        self.notifier
            .send(
                &task.user_id,
                task_id,
                TransferEvent::Complete {
                    file_id: file.file_id,
                },
            )
            .await;
        if let Err(e) = self.tracker.clear(task_id).await {
            tracing::warn!(task_id = %task_id, error = %e, "Failed to clear chunk ledger");
        }
        Ok(Some(file.file_id))
    }

    /// Move an active task to `failed` and tell the client once.
    ///
    /// The ledger is kept for the failed retention window so the client
    /// can inspect what was transferred.
    pub async fn fail(&self, task: &TransferTask, error: &TransferError) {
        let task_id = task.task_id;
        let message = truncate_error_message(&error.to_string());
        let now = OffsetDateTime::now_utc();
        let expires_at = now + self.tracker.failed_retention();

        match self
            .store
            .fail_task(*task_id.as_uuid(), &message, expires_at, now)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(task_id = %task_id, "Task already terminal, not failing it");
                return;
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "Failed to persist task failure");
                return;
            }
        }

        if let Err(e) = self.tracker.extend_for_failure(task_id).await {
            tracing::warn!(task_id = %task_id, error = %e, "Failed to shorten ledger retention");
        }
        metrics::TASKS_FAILED.inc();
        metrics::ACTIVE_TASKS.dec();
        tracing::warn!(task_id = %task_id, error = %message, "Task failed");
        self.notifier
            .send(
                &task.user_id,
                task_id,
                TransferEvent::Error {
                    code: error.code().to_string(),
                    message,
                    chunk_index: None,
                },
            )
            .await;
    }
}

async fn release(guard: LockGuard) {
    if let Err(e) = guard.release().await {
        tracing::warn!(error = %e, "Failed to release merge lock");
    }
}
