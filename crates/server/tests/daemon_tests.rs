//! Daemon wiring: configuration, state assembly and the expiry sweep.

use bytes::Bytes;
use depot_core::config::AppConfig;
use depot_core::{ContentHash, RequestContext, TaskStatus};
use depot_metadata::models::ChunkRow;
use depot_server::{AppState, load_config, sweep_once};
use depot_transfer::{InitRequest, MergeOutcome};
use time::{Duration, OffsetDateTime};

fn sha256_hex(data: &[u8]) -> String {
    ContentHash::compute(data).to_hex()
}

#[tokio::test]
async fn test_initialized_state_runs_a_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::initialize(AppConfig::for_testing(dir.path()))
        .await
        .unwrap();
    assert!(state.storage.default_manager().is_created());

    let ctx = RequestContext::new("u1");
    let data = Bytes::from(vec![7u8; 3_000]);
    let task = state
        .engine
        .init(
            &ctx,
            InitRequest {
                file_name: "notes.txt".into(),
                total_size: 3_000,
                content_hash: sha256_hex(&data),
                total_chunks: 3,
                chunk_size: 1_024,
                mime_type: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(task.platform, "local");
    state
        .engine
        .check(&ctx, task.task_id, &sha256_hex(&data))
        .await
        .unwrap();

    let mut last = None;
    for (index, start) in (0..3_000).step_by(1_024).enumerate() {
        let chunk = data.slice(start..(start + 1_024).min(3_000));
        last = Some(
            state
                .engine
                .upload_chunk(&ctx, task.task_id, index as u32, &sha256_hex(&chunk), chunk)
                .await
                .unwrap(),
        );
    }
    let MergeOutcome::Scheduled(handle) = last.unwrap().merge else {
        panic!("expected merge");
    };
    assert!(handle.await.unwrap().is_some());
    let done = state.engine.get_task(&ctx, task.task_id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);

    let stored = dir.path().join("storage").join(&task.object_key);
    assert_eq!(std::fs::read(stored).unwrap(), data.to_vec());

    state.shutdown().await;
    assert!(!state.storage.default_manager().is_created());
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::for_testing(dir.path());
    config.transfer.chunk_workers = 0;
    assert!(AppState::initialize(config).await.is_err());
}

#[tokio::test]
async fn test_sweep_purges_only_expired_rows() {
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::initialize(AppConfig::for_testing(dir.path()))
        .await
        .unwrap();
    let ctx = RequestContext::new("u1");
    let data = Bytes::from_static(b"swept");
    let task = state
        .engine
        .init(
            &ctx,
            InitRequest {
                file_name: "swept.txt".into(),
                total_size: data.len() as u64,
                content_hash: sha256_hex(&data),
                total_chunks: 2,
                chunk_size: 3,
                mime_type: None,
            },
        )
        .await
        .unwrap()
        .task_id;
    state.engine.check(&ctx, task, &sha256_hex(&data)).await.unwrap();
    let now = OffsetDateTime::now_utc();

    for (index, expires_at) in [(0, now - Duration::minutes(1)), (1, now + Duration::hours(1))] {
        let inserted = state
            .metadata
            .insert_chunk(&ChunkRow {
                task_id: *task.as_uuid(),
                chunk_index: index,
                size: 1,
                chunk_hash: "00".into(),
                part_id: format!("p{index}"),
                recorded_at: now - Duration::hours(2),
                expires_at,
            })
            .await
            .unwrap();
        assert!(inserted);
    }
    let holder = uuid::Uuid::new_v4();
    assert!(
        state
            .metadata
            .try_acquire_lock(*task.as_uuid(), holder, now - Duration::minutes(5), now - Duration::minutes(1))
            .await
            .unwrap()
    );

    let stats = sweep_once(state.metadata.as_ref()).await.unwrap();
    assert_eq!(stats.chunks, 1);
    assert_eq!(stats.locks, 1);
    assert_eq!(stats.tasks, 0);

    let again = sweep_once(state.metadata.as_ref()).await.unwrap();
    assert_eq!(again.total(), 0);
    assert_eq!(
        state
            .metadata
            .count_chunks(*task.as_uuid(), now)
            .await
            .unwrap(),
        1
    );
}

#[test]
fn test_load_config_layers_file_over_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("depot.toml");
    std::fs::write(
        &path,
        r#"
[server]
sweep_interval_secs = 60

[transfer]
chunk_workers = 4

[storage]
path = "/srv/depot"

[metadata]
type = "sqlite"
path = "/srv/depot/metadata.db"
"#,
    )
    .unwrap();

    let config = load_config(&path).unwrap();
    assert_eq!(config.server.sweep_interval_secs, 60);
    assert_eq!(config.transfer.chunk_workers, 4);
    assert_eq!(config.transfer.merge_workers, 2);
    assert_eq!(config.storage.path, std::path::PathBuf::from("/srv/depot"));
    assert!(config.validate().is_ok());
}

#[test]
fn test_load_config_without_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config(&dir.path().join("missing.toml")).unwrap();
    assert_eq!(config.server.sweep_interval_secs, 300);
    assert_eq!(config.transfer.chunk_workers, 8);
}
