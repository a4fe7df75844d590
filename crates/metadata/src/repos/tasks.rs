//! Transfer task repository.

use crate::error::MetadataResult;
use crate::models::TaskRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for transfer tasks.
///
/// Every status change is a compare-and-set on the persisted row: the
/// update applies only if the row is still in the expected status, and the
/// returned flag tells the caller whether it won.
#[async_trait]
pub trait TaskRepo: Send + Sync {
    /// Insert a new task.
    async fn create_task(&self, task: &TaskRow) -> MetadataResult<()>;

    /// Get a task by ID.
    async fn get_task(&self, task_id: Uuid) -> MetadataResult<Option<TaskRow>>;

    /// Move `from -> to`. Returns false if the row was not in `from`.
    async fn compare_and_set_status(
        &self,
        task_id: Uuid,
        from: &str,
        to: &str,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Move `checking -> uploading`, recording the multipart handle.
    async fn begin_upload(
        &self,
        task_id: Uuid,
        upload_id: &str,
        started_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Move `from -> completed`, stamping `completed_at` and marking every
    /// chunk uploaded.
    async fn complete_task(
        &self,
        task_id: Uuid,
        from: &str,
        completed_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Move any active status to `failed` with a message and a shortened
    /// retention. Returns false if the task was already terminal.
    async fn fail_task(
        &self,
        task_id: Uuid,
        error_message: &str,
        expires_at: OffsetDateTime,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Raise the synchronized uploaded-chunk count. Never lowers it.
    async fn update_uploaded_chunks(
        &self,
        task_id: Uuid,
        uploaded_chunks: u32,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Delete tasks whose retention ended before `now`.
    async fn delete_expired_tasks(&self, now: OffsetDateTime) -> MetadataResult<u64>;

    /// Count tasks in an active status.
    async fn count_active_tasks(&self) -> MetadataResult<u64>;
}
