//! The transfer engine: task lifecycle over the tracker, merge coordinator
//! and storage facade.

use crate::error::{TransferError, TransferResult};
use crate::lock::MergeLock;
use crate::merge::{MergeCoordinator, MergeOutcome};
use crate::metrics;
use crate::notify::{NotificationSink, Notifier, TransferEvent};
use crate::pool::WorkerPool;
use crate::tracker::{ChunkProgressTracker, ProgressSnapshot, RecordOutcome};
use bytes::Bytes;
use depot_core::config::TransferConfig;
use depot_core::{ChunkPlan, ContentHash, RequestContext, TaskId, TaskStatus, TransferTask};
use depot_metadata::MetadataStore;
use depot_metadata::models::TaskRow;
use depot_storage::{StorageBackend, StorageFacade};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::instrument;
use uuid::Uuid;

/// Parameters of a new transfer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitRequest {
    pub file_name: String,
    pub total_size: u64,
    /// SHA-256 of the whole file, hex.
    pub content_hash: String,
    pub total_chunks: u32,
    pub chunk_size: u64,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// Result of the integrity check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The user already stores this content; the task completed without
    /// transferring anything.
    QuickUpload { file_id: Uuid },
    /// A multipart upload is open and chunks may be sent.
    Ready { upload_id: String },
}

/// Result of an accepted chunk.
#[derive(Debug)]
pub struct ChunkOutcome {
    pub chunk_index: u32,
    /// False when the index was already recorded.
    pub recorded: bool,
    pub progress: ProgressSnapshot,
    pub merge: MergeOutcome,
}

/// Drives resumable chunked transfers for every user.
pub struct TransferEngine {
    config: TransferConfig,
    store: Arc<dyn MetadataStore>,
    facade: Arc<StorageFacade>,
    tracker: Arc<ChunkProgressTracker>,
    merger: MergeCoordinator,
    notifier: Notifier,
    chunk_pool: WorkerPool,
}

impl TransferEngine {
    pub fn new(
        config: TransferConfig,
        store: Arc<dyn MetadataStore>,
        facade: Arc<StorageFacade>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        metrics::register_metrics();

        let notifier = Notifier::new(sink);
        let tracker = Arc::new(ChunkProgressTracker::new(Arc::clone(&store), &config));
        let lock = Arc::new(MergeLock::new(Arc::clone(&store), &config));
        let merger = MergeCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&tracker),
            lock,
            notifier.clone(),
            WorkerPool::new("merge", config.merge_workers),
        );
        Self {
            chunk_pool: WorkerPool::new("chunk", config.chunk_workers),
            config,
            store,
            facade,
            tracker,
            merger,
            notifier,
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn facade(&self) -> &Arc<StorageFacade> {
        &self.facade
    }

    /// Create a task in `initialized`.
    #[instrument(skip(self, ctx, request), fields(user_id = %ctx.user_id, file_name = %request.file_name))]
    pub async fn init(
        &self,
        ctx: &RequestContext,
        request: InitRequest,
    ) -> TransferResult<TransferTask> {
        if ctx.user_id.trim().is_empty() {
            return Err(TransferError::InvalidRequest("user id must not be blank".into()));
        }
        let file_name = request.file_name.trim();
        if file_name.is_empty() {
            return Err(TransferError::InvalidRequest("file name must not be blank".into()));
        }
        let content_hash = ContentHash::from_hex(&request.content_hash)?.to_hex();
        let plan = ChunkPlan::new(
            request.total_size,
            request.chunk_size,
            request.total_chunks,
            self.config.max_chunk_size,
        )?;
        let min_part_size = self.facade.min_part_size(ctx.platform())?;
        if plan.total_chunks > 1 && plan.chunk_size < min_part_size {
            return Err(TransferError::InvalidRequest(format!(
                "chunk size {} is below the {} byte minimum of platform '{}'",
                plan.chunk_size,
                min_part_size,
                ctx.platform()
            )));
        }

        let task = TransferTask::new(
            ctx.user_id.clone(),
            file_name,
            plan,
            content_hash,
            request.mime_type,
            ctx.platform(),
            self.config.retention(),
        );
        self.store.create_task(&TaskRow::from(&task)).await?;

        metrics::TASKS_CREATED.inc();
        metrics::ACTIVE_TASKS.inc();
        tracing::info!(
            task_id = %task.task_id,
            total_size = task.total_size,
            total_chunks = task.total_chunks,
            "Transfer task created"
        );
        self.notifier
            .send(&task.user_id, task.task_id, TransferEvent::Initialized)
            .await;
        Ok(task)
    }

    /// Verify the declared hash and either short-circuit to an existing
    /// file or open the multipart upload.
    #[instrument(skip(self, ctx, content_hash), fields(task_id = %task_id))]
    pub async fn check(
        &self,
        ctx: &RequestContext,
        task_id: TaskId,
        content_hash: &str,
    ) -> TransferResult<CheckOutcome> {
        let task = self.load_owned(ctx, task_id).await?;
        ensure_platform(ctx, &task)?;
        if task.status != TaskStatus::Initialized {
            return Err(TransferError::status(task_id, task.status, "check"));
        }
        let actual = ContentHash::from_hex(content_hash)?.to_hex();
        if actual != task.content_hash {
            return Err(TransferError::HashMismatch {
                expected: task.content_hash,
                actual,
            });
        }

        self.transition(&task, TaskStatus::Initialized, TaskStatus::Checking, "check")
            .await?;
        self.notifier
            .send(&task.user_id, task_id, TransferEvent::Checking)
            .await;

        let existing = self
            .store
            .find_by_content_hash(&task.user_id, &task.content_hash)
            .await?
            .filter(|file| file.platform == task.platform);
        if let Some(file) = existing {
            return self.quick_upload(&task, file.file_id).await;
        }

        let backend = match self.facade.current(ctx).await {
            Ok(backend) => backend,
            Err(e) => return Err(self.fail_with(&task, e.into()).await),
        };
        let upload_id = match backend
            .initiate_multipart_upload(&task.object_key, task.mime_type.as_deref())
            .await
        {
            Ok(upload_id) => upload_id,
            Err(e) => return Err(self.fail_with(&task, e.into()).await),
        };

        let began = self
            .store
            .begin_upload(*task_id.as_uuid(), &upload_id, OffsetDateTime::now_utc())
            .await?;
        if !began {
            abort_quietly(backend.as_ref(), &task, &upload_id).await;
            let status = self.load_owned(ctx, task_id).await?.status;
            return Err(TransferError::status(task_id, status, "check"));
        }
        self.tracker.start(task_id).await?;

        tracing::info!(upload_id = %upload_id, "Task ready for upload");
        self.notifier
            .send(
                &task.user_id,
                task_id,
                TransferEvent::ReadyToUpload {
                    upload_id: upload_id.clone(),
                },
            )
            .await;
        Ok(CheckOutcome::Ready { upload_id })
    }

    async fn quick_upload(
        &self,
        task: &TransferTask,
        file_id: Uuid,
    ) -> TransferResult<CheckOutcome> {
        let task_id = task.task_id;
        let completed = self
            .store
            .complete_task(
                *task_id.as_uuid(),
                TaskStatus::Checking.as_str(),
                OffsetDateTime::now_utc(),
            )
            .await?;
        if !completed {
            let status = self.reload(task_id).await?.status;
            return Err(TransferError::status(task_id, status, "check"));
        }

        metrics::QUICK_UPLOADS.inc();
        metrics::TASKS_COMPLETED.inc();
        metrics::ACTIVE_TASKS.dec();
        tracing::info!(task_id = %task_id, file_id = %file_id, "Quick upload, content already stored");
        self.notifier
            .send(&task.user_id, task_id, TransferEvent::QuickUpload { file_id })
            .await;
        Ok(CheckOutcome::QuickUpload { file_id })
    }

    /// Verify, store and record one chunk, then attempt the merge.
    ///
    /// Chunk-level failures leave the task as it was and are reported with
    /// the chunk index so the client can retry that chunk.
    #[instrument(skip(self, ctx, chunk_hash, data), fields(task_id = %task_id, size = data.len()))]
    pub async fn upload_chunk(
        &self,
        ctx: &RequestContext,
        task_id: TaskId,
        chunk_index: u32,
        chunk_hash: &str,
        data: Bytes,
    ) -> TransferResult<ChunkOutcome> {
        let task = self.load_owned(ctx, task_id).await?;
        ensure_platform(ctx, &task)?;
        if !task.status.accepts_chunks() {
            return Err(TransferError::status(task_id, task.status, "upload chunk"));
        }

        match self.store_chunk(ctx, &task, chunk_index, chunk_hash, data).await {
            Err(e) if e.is_chunk_level() => {
                metrics::CHUNK_ERRORS.inc();
                tracing::warn!(chunk_index, error = %e, "Chunk rejected");
                self.notifier
                    .send(
                        &task.user_id,
                        task_id,
                        TransferEvent::Error {
                            code: e.code().to_string(),
                            message: e.to_string(),
                            chunk_index: Some(chunk_index),
                        },
                    )
                    .await;
                Err(e)
            }
            other => other,
        }
    }

    async fn store_chunk(
        &self,
        ctx: &RequestContext,
        task: &TransferTask,
        chunk_index: u32,
        chunk_hash: &str,
        data: Bytes,
    ) -> TransferResult<ChunkOutcome> {
        let task_id = task.task_id;
        let expected = task
            .plan()
            .expected_len(chunk_index)
            .ok_or(TransferError::InvalidChunkIndex {
                index: chunk_index,
                total: task.total_chunks,
            })?;
        let size = data.len() as u64;
        if size != expected {
            return Err(TransferError::ChunkSizeMismatch {
                index: chunk_index,
                expected,
                actual: size,
            });
        }
        let chunk_hash = ContentHash::verify_hex(chunk_hash, &data)?.to_hex();
        let upload_id = task
            .upload_id
            .as_deref()
            .ok_or_else(|| TransferError::InvalidRequest("task has no multipart upload".into()))?;
        let backend = self.facade.current(ctx).await?;

        let recorded = match self.tracker.recorded_part(task_id, chunk_index).await? {
            Some(_) => false,
            None => {
                let part_id = backend
                    .upload_part(
                        &task.object_key,
                        upload_id,
                        ChunkPlan::part_number(chunk_index),
                        size,
                        data,
                    )
                    .await?;
                match self
                    .tracker
                    .record_chunk(task_id, chunk_index, &part_id, size, &chunk_hash)
                    .await?
                {
                    RecordOutcome::Recorded => {
                        if self.tracker.record_bytes(task_id, size).await?.is_none() {
                            // A racing final chunk may already have merged this part.
                            let status = self.reload(task_id).await?.status;
                            if matches!(status, TaskStatus::Canceled | TaskStatus::Failed) {
                                return Err(TransferError::status(task_id, status, "upload chunk"));
                            }
                        }
                        metrics::CHUNKS_RECORDED.inc();
                        metrics::BYTES_RECEIVED.inc_by(size);
                        true
                    }
                    RecordOutcome::AlreadyPresent { .. } => false,
                    // Canceled or failed while the part was in flight.
                    RecordOutcome::Refused => return Err(self.refused(task_id).await),
                }
            }
        };
        if recorded {
            tracing::debug!("Chunk recorded");
        } else {
            metrics::DUPLICATE_CHUNKS.inc();
            tracing::debug!("Chunk already recorded, keeping the first part");
        }

        let uploaded = self.tracker.completed_count(task_id).await?;
        self.store
            .update_uploaded_chunks(*task_id.as_uuid(), uploaded, OffsetDateTime::now_utc())
            .await?;
        let progress = self
            .tracker
            .snapshot(task_id, task.total_size, task.total_chunks)
            .await?;
        self.notifier
            .send(
                &task.user_id,
                task_id,
                TransferEvent::Progress(progress.clone()),
            )
            .await;

        let merge = self.merger.try_merge(task_id, backend).await?;
        Ok(ChunkOutcome {
            chunk_index,
            recorded,
            progress,
            merge,
        })
    }

    /// Queue a chunk on the chunk worker pool.
    pub fn submit_chunk(
        self: &Arc<Self>,
        ctx: RequestContext,
        task_id: TaskId,
        chunk_index: u32,
        chunk_hash: String,
        data: Bytes,
    ) -> JoinHandle<TransferResult<ChunkOutcome>> {
        let engine = Arc::clone(self);
        self.chunk_pool.spawn(async move {
            engine
                .upload_chunk(&ctx, task_id, chunk_index, &chunk_hash, data)
                .await
        })
    }

    /// Suspend merging. Chunks in flight still finish and record.
    #[instrument(skip(self, ctx), fields(task_id = %task_id))]
    pub async fn pause(&self, ctx: &RequestContext, task_id: TaskId) -> TransferResult<()> {
        let task = self.load_owned(ctx, task_id).await?;
        if task.status == TaskStatus::Paused {
            return Ok(());
        }
        if task.status != TaskStatus::Uploading {
            return Err(TransferError::status(task_id, task.status, "pause"));
        }
        let paused = self
            .store
            .compare_and_set_status(
                *task_id.as_uuid(),
                TaskStatus::Uploading.as_str(),
                TaskStatus::Paused.as_str(),
                OffsetDateTime::now_utc(),
            )
            .await?;
        if !paused {
            let status = self.reload(task_id).await?.status;
            if status == TaskStatus::Paused {
                return Ok(());
            }
            return Err(TransferError::status(task_id, status, "pause"));
        }

        tracing::info!("Task paused");
        self.notifier
            .send(&task.user_id, task_id, TransferEvent::Paused)
            .await;
        Ok(())
    }

    /// Re-enable merging and re-run the merge check. Returns the indices
    /// already recorded so the client sends only the rest.
    #[instrument(skip(self, ctx), fields(task_id = %task_id))]
    pub async fn resume(&self, ctx: &RequestContext, task_id: TaskId) -> TransferResult<Vec<u32>> {
        let task = self.load_owned(ctx, task_id).await?;
        ensure_platform(ctx, &task)?;
        match task.status {
            TaskStatus::Uploading => {}
            TaskStatus::Paused => {
                self.transition(&task, TaskStatus::Paused, TaskStatus::Uploading, "resume")
                    .await?;
                tracing::info!("Task resumed");
            }
            status => return Err(TransferError::status(task_id, status, "resume")),
        }

        let completed_indices = self.tracker.completed_indices(task_id).await?;
        self.notifier
            .send(
                &task.user_id,
                task_id,
                TransferEvent::Resumed {
                    completed_indices: completed_indices.clone(),
                },
            )
            .await;

        let backend = self.facade.current(ctx).await?;
        let merge = self.merger.try_merge(task_id, backend).await?;
        tracing::debug!(scheduled = merge.is_scheduled(), "Merge check after resume");
        Ok(completed_indices)
    }

    /// Cancel a non-terminal task, abort its multipart upload and forget
    /// its progress. Canceling a canceled task is a no-op.
    #[instrument(skip(self, ctx), fields(task_id = %task_id))]
    pub async fn cancel(&self, ctx: &RequestContext, task_id: TaskId) -> TransferResult<()> {
        let task = loop {
            let task = self.load_owned(ctx, task_id).await?;
            match task.status {
                TaskStatus::Canceled => return Ok(()),
                status if status.is_terminal() => {
                    return Err(TransferError::status(task_id, status, "cancel"));
                }
                status => {
                    let won = self
                        .store
                        .compare_and_set_status(
                            *task_id.as_uuid(),
                            status.as_str(),
                            TaskStatus::Canceled.as_str(),
                            OffsetDateTime::now_utc(),
                        )
                        .await?;
                    if won {
                        break task;
                    }
                }
            }
        };

        // Only the caller that won the transition aborts.
        if let Some(upload_id) = task.upload_id.as_deref() {
            match self.facade.current(ctx).await {
                Ok(backend) => abort_quietly(backend.as_ref(), &task, upload_id).await,
                Err(e) => {
                    tracing::warn!(error = %e, "No backend to abort multipart upload on")
                }
            }
        }
        if let Err(e) = self.tracker.clear(task_id).await {
            tracing::warn!(error = %e, "Failed to clear chunk ledger");
        }

        metrics::TASKS_CANCELED.inc();
        metrics::ACTIVE_TASKS.dec();
        tracing::info!(previous = %task.status, "Task canceled");
        self.notifier
            .send(&task.user_id, task_id, TransferEvent::Canceled)
            .await;
        Ok(())
    }

    /// Indices recorded so far, ascending.
    pub async fn list_completed_chunks(
        &self,
        ctx: &RequestContext,
        task_id: TaskId,
    ) -> TransferResult<Vec<u32>> {
        self.load_owned(ctx, task_id).await?;
        self.tracker.completed_indices(task_id).await
    }

    pub async fn get_task(
        &self,
        ctx: &RequestContext,
        task_id: TaskId,
    ) -> TransferResult<TransferTask> {
        self.load_owned(ctx, task_id).await
    }

    pub async fn progress(
        &self,
        ctx: &RequestContext,
        task_id: TaskId,
    ) -> TransferResult<ProgressSnapshot> {
        let task = self.load_owned(ctx, task_id).await?;
        self.tracker
            .snapshot(task_id, task.total_size, task.total_chunks)
            .await
    }

    async fn reload(&self, task_id: TaskId) -> TransferResult<TransferTask> {
        let row = self
            .store
            .get_task(*task_id.as_uuid())
            .await?
            .ok_or(TransferError::TaskNotFound(task_id))?;
        Ok(TransferTask::try_from(row)?)
    }

    /// Load a task the caller owns. Someone else's task reads as missing.
    async fn load_owned(
        &self,
        ctx: &RequestContext,
        task_id: TaskId,
    ) -> TransferResult<TransferTask> {
        match self.reload(task_id).await {
            Ok(task) if task.user_id == ctx.user_id => Ok(task),
            Ok(_) => Err(TransferError::TaskNotFound(task_id)),
            Err(e) => Err(e),
        }
    }

    async fn transition(
        &self,
        task: &TransferTask,
        from: TaskStatus,
        to: TaskStatus,
        operation: &'static str,
    ) -> TransferResult<()> {
        debug_assert!(from.can_transition_to(to));
        let task_id = task.task_id;
        let moved = self
            .store
            .compare_and_set_status(
                *task_id.as_uuid(),
                from.as_str(),
                to.as_str(),
                OffsetDateTime::now_utc(),
            )
            .await?;
        if moved {
            return Ok(());
        }
        let status = self.reload(task_id).await?.status;
        Err(TransferError::status(task_id, status, operation))
    }

    /// Error for a chunk whose task left `uploading`/`paused` mid-flight.
    async fn refused(&self, task_id: TaskId) -> TransferError {
        match self.reload(task_id).await {
            Ok(task) => {
                tracing::info!(status = %task.status, "Chunk dropped, task no longer accepts chunks");
                TransferError::status(task_id, task.status, "upload chunk")
            }
            Err(e) => e,
        }
    }

    async fn fail_with(&self, task: &TransferTask, error: TransferError) -> TransferError {
        self.merger.fail(task, &error).await;
        error
    }
}

fn ensure_platform(ctx: &RequestContext, task: &TransferTask) -> TransferResult<()> {
    if ctx.platform() != task.platform {
        return Err(TransferError::InvalidRequest(format!(
            "task {} targets platform '{}', request targets '{}'",
            task.task_id,
            task.platform,
            ctx.platform()
        )));
    }
    Ok(())
}

async fn abort_quietly(backend: &dyn StorageBackend, task: &TransferTask, upload_id: &str) {
    match backend
        .abort_multipart_upload(&task.object_key, upload_id)
        .await
    {
        Ok(()) => tracing::debug!(task_id = %task.task_id, "Multipart upload aborted"),
        Err(e) => {
            tracing::warn!(task_id = %task.task_id, error = %e, "Failed to abort multipart upload")
        }
    }
}
