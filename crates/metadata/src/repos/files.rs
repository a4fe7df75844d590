//! File record repository.

use crate::error::MetadataResult;
use crate::models::FileRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Finalized files, as far as the transfer engine needs them.
#[async_trait]
pub trait FileRepo: Send + Sync {
    async fn create_file(&self, file: &FileRow) -> MetadataResult<()>;

    async fn get_file(&self, file_id: Uuid) -> MetadataResult<Option<FileRow>>;

    /// Most recent file of `user_id` with this content hash.
    async fn find_by_content_hash(
        &self,
        user_id: &str,
        content_hash: &str,
    ) -> MetadataResult<Option<FileRow>>;

    async fn delete_file(&self, file_id: Uuid) -> MetadataResult<()>;
}
