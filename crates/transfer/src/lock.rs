//! Leased per-task lock over the metadata store.

use crate::error::TransferResult;
use depot_core::TaskId;
use depot_core::config::TransferConfig;
use depot_metadata::MetadataStore;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;
use uuid::Uuid;

/// Acquires per-task locks with a bounded wait.
///
/// A holder that dies keeps the lock for at most one lease.
pub struct MergeLock {
    store: Arc<dyn MetadataStore>,
    wait: Duration,
    lease: Duration,
    poll_interval: Duration,
}

impl MergeLock {
    pub fn new(store: Arc<dyn MetadataStore>, config: &TransferConfig) -> Self {
        Self {
            store,
            wait: config.merge_lock_wait(),
            lease: config.merge_lock_lease(),
            poll_interval: config.lock_poll_interval(),
        }
    }

    /// Take the lock, polling until it is free or the wait runs out.
    /// `None` means the wait ran out.
    pub async fn acquire(&self, task_id: TaskId) -> TransferResult<Option<LockGuard>> {
        let holder = Uuid::new_v4();
        let deadline = Instant::now() + self.wait;
        let lease = time::Duration::try_from(self.lease).unwrap_or(time::Duration::seconds(30));

        loop {
            let now = OffsetDateTime::now_utc();
            if self
                .store
                .try_acquire_lock(*task_id.as_uuid(), holder, now, now + lease)
                .await?
            {
                return Ok(Some(LockGuard {
                    store: Arc::clone(&self.store),
                    task_id,
                    holder,
                    released: false,
                }));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }
}

/// A held lock. Release it explicitly; a dropped guard releases in the
/// background, and a guard lost to a crash expires with its lease.
pub struct LockGuard {
    store: Arc<dyn MetadataStore>,
    task_id: TaskId,
    holder: Uuid,
    released: bool,
}

impl LockGuard {
    pub async fn release(mut self) -> TransferResult<()> {
        self.released = true;
        self.store
            .release_lock(*self.task_id.as_uuid(), self.holder)
            .await?;
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let (task_id, holder) = (*self.task_id.as_uuid(), self.holder);
        handle.spawn(async move {
            if let Err(e) = store.release_lock(task_id, holder).await {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to release dropped lock");
            }
        });
    }
}
