//! Periodic purge of expired tasks, ledger rows and locks.

use depot_metadata::models::PurgeStats;
use depot_metadata::{MetadataResult, MetadataStore};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

/// Run one sweep at the current time.
pub async fn sweep_once(metadata: &dyn MetadataStore) -> MetadataResult<PurgeStats> {
    let stats = metadata.purge_expired(OffsetDateTime::now_utc()).await?;
    if stats.total() > 0 {
        tracing::info!(
            tasks = stats.tasks,
            chunks = stats.chunks,
            progress = stats.progress,
            locks = stats.locks,
            "Expired transfer state purged"
        );
    } else {
        tracing::debug!("Expiry sweep found nothing to purge");
    }
    Ok(stats)
}

/// Sweep every `interval` until the handle is aborted. A failed sweep is
/// logged and retried on the next tick.
pub fn spawn_sweeper(metadata: Arc<dyn MetadataStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = sweep_once(metadata.as_ref()).await {
                tracing::error!(error = %e, "Expiry sweep failed");
            }
        }
    })
}
