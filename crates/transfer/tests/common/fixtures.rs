use super::mocks::{CallCounts, instrumented_config, instrumented_registration};
use bytes::Bytes;
use depot_core::config::{DefaultStorageSettings, TransferConfig};
use depot_core::{ContentHash, RequestContext, TaskId, TaskStatus, TransferTask};
use depot_metadata::{MetadataStore, SqliteStore};
use depot_storage::backends::builtin_registrations;
use depot_storage::{PluginRegistry, StorageFacade};
use depot_transfer::{BroadcastSink, CheckOutcome, InitRequest, TransferEngine};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// SHA-256 of data as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    ContentHash::compute(data).to_hex()
}

/// Deterministic pseudo-random test data; the same seed gives the same bytes.
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    // LCG
    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

pub fn split_chunks(data: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    (0..data.len())
        .step_by(chunk_size)
        .map(|start| data.slice(start..(start + chunk_size).min(data.len())))
        .collect()
}

/// Transfer settings with short lock waits.
pub fn fast_config() -> TransferConfig {
    TransferConfig {
        merge_lock_wait_ms: 2_000,
        merge_lock_lease_ms: 5_000,
        lock_poll_interval_ms: 10,
        ..TransferConfig::default()
    }
}

/// An engine over a temp-dir SQLite store and an instrumented backend.
#[allow(dead_code)]
pub struct Harness {
    pub dir: TempDir,
    pub engine: Arc<TransferEngine>,
    pub sink: BroadcastSink,
    /// User `u1` on the instrumented platform.
    pub ctx: RequestContext,
    pub calls: Arc<CallCounts>,
}

#[allow(dead_code)]
impl Harness {
    pub async fn new() -> Self {
        Self::with_config(fast_config()).await
    }

    pub async fn with_config(config: TransferConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(dir.path().join("metadata.db"), None)
                .await
                .unwrap(),
        );

        let mut registrations = builtin_registrations();
        registrations.push(instrumented_registration());
        let facade = Arc::new(StorageFacade::new(
            Arc::new(PluginRegistry::new(registrations)),
            &DefaultStorageSettings {
                path: dir.path().join("default"),
                public_url: None,
            },
        ));

        let sink = BroadcastSink::new(1024);
        let engine = Arc::new(TransferEngine::new(
            config,
            store,
            facade,
            Arc::new(sink.clone()),
        ));
        let (storage, calls) = instrumented_config(dir.path(), "u1");
        Self {
            ctx: RequestContext::new("u1").with_storage(storage),
            dir,
            engine,
            sink,
            calls,
        }
    }

    /// Init and check a task for `data`, leaving it in `uploading`.
    pub async fn start_upload(&self, data: &Bytes, chunk_size: u64) -> (TransferTask, Vec<Bytes>) {
        let task = self
            .engine
            .init(&self.ctx, init_request("file.bin", data, chunk_size))
            .await
            .unwrap();
        let outcome = self
            .engine
            .check(&self.ctx, task.task_id, &sha256_hex(data))
            .await
            .unwrap();
        assert!(matches!(outcome, CheckOutcome::Ready { .. }));
        (task, split_chunks(data, chunk_size as usize))
    }

    pub async fn send_chunk(
        &self,
        task_id: TaskId,
        index: u32,
        chunk: &Bytes,
    ) -> depot_transfer::TransferResult<depot_transfer::ChunkOutcome> {
        self.engine
            .upload_chunk(&self.ctx, task_id, index, &sha256_hex(chunk), chunk.clone())
            .await
    }

    /// Poll until the task reaches `status`.
    pub async fn wait_for_status(&self, task_id: TaskId, status: TaskStatus) -> TransferTask {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let task = self.engine.get_task(&self.ctx, task_id).await.unwrap();
            if task.status == status {
                return task;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task stuck in {} waiting for {status}",
                task.status
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

pub fn init_request(name: &str, data: &Bytes, chunk_size: u64) -> InitRequest {
    let total_size = data.len() as u64;
    InitRequest {
        file_name: name.to_string(),
        total_size,
        content_hash: sha256_hex(data),
        total_chunks: total_size.div_ceil(chunk_size) as u32,
        chunk_size,
        mime_type: Some("application/octet-stream".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_chunks_keeps_remainder() {
        let data = seeded_bytes(1, 2_500);
        let chunks = split_chunks(&data, 1_000);
        assert_eq!(
            chunks.iter().map(Bytes::len).collect::<Vec<_>>(),
            vec![1_000, 1_000, 500]
        );
    }
}
