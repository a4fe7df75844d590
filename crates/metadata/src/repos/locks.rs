//! Leased lock repository.

use crate::error::MetadataResult;
use crate::models::LockRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Per-task mutual exclusion with a lease.
///
/// A lock whose lease has run out is free; a crashed holder blocks others
/// for at most one lease.
#[async_trait]
pub trait LockRepo: Send + Sync {
    /// Take the lock for `holder` if it is free or its lease expired
    /// before `now`. Returns true on success.
    async fn try_acquire_lock(
        &self,
        task_id: Uuid,
        holder: Uuid,
        now: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Release the lock if `holder` still owns it.
    async fn release_lock(&self, task_id: Uuid, holder: Uuid) -> MetadataResult<bool>;

    async fn get_lock(&self, task_id: Uuid) -> MetadataResult<Option<LockRow>>;

    /// Delete locks whose lease ended before `now`.
    async fn purge_expired_locks(&self, now: OffsetDateTime) -> MetadataResult<u64>;
}
