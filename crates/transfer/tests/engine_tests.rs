//! End-to-end transfer scenarios against the instrumented local backend.

mod common;

use common::*;
use depot_core::{DEFAULT_CHUNK_SIZE, RequestContext, TaskStatus};
use depot_storage::collect_stream;
use depot_transfer::{CheckOutcome, MergeOutcome, TransferError, TransferEvent};
use futures::StreamExt;
use std::time::Duration;

#[tokio::test]
async fn test_two_chunk_upload_completes() {
    let h = Harness::new().await;
    let data = seeded_bytes(1, 10 * 1024 * 1024);
    let (task, chunks) = h.start_upload(&data, DEFAULT_CHUNK_SIZE).await;
    assert_eq!(task.total_chunks, 2);

    let first = h.send_chunk(task.task_id, 0, &chunks[0]).await.unwrap();
    assert!(first.recorded);
    assert!(matches!(first.merge, MergeOutcome::NotReady));
    assert_eq!(first.progress.uploaded_chunks, 1);

    let last = h.send_chunk(task.task_id, 1, &chunks[1]).await.unwrap();
    let MergeOutcome::Scheduled(handle) = last.merge else {
        panic!("expected the last chunk to schedule the merge");
    };
    let file_id = handle.await.unwrap().expect("finalize should complete the task");

    let done = h.engine.get_task(&h.ctx, task.task_id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.uploaded_chunks, 2);
    assert!(done.completed_at.is_some());

    let file = h.engine.store().get_file(file_id).await.unwrap().unwrap();
    assert_eq!(file.size, 10 * 1024 * 1024);
    assert_eq!(file.object_key, task.object_key);

    let backend = h.engine.facade().current(&h.ctx).await.unwrap();
    let stored = collect_stream(backend.download(&task.object_key).await.unwrap())
        .await
        .unwrap();
    assert_eq!(stored, data);
    assert_eq!(h.calls.initiated(), 1);
    assert_eq!(h.calls.completed(), 1);

    // The ledger is dropped once the file exists.
    assert!(
        h.engine
            .list_completed_chunks(&h.ctx, task.task_id)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_known_content_is_quick_uploaded() {
    let h = Harness::new().await;
    let data = seeded_bytes(2, 3_000);
    let (first, chunks) = h.start_upload(&data, 1_024).await;
    let mut last = None;
    for (index, chunk) in chunks.iter().enumerate() {
        last = Some(h.send_chunk(first.task_id, index as u32, chunk).await.unwrap());
    }
    let MergeOutcome::Scheduled(handle) = last.unwrap().merge else {
        panic!("expected merge");
    };
    let file_id = handle.await.unwrap().unwrap();
    let initiated = h.calls.initiated();

    let second = h
        .engine
        .init(&h.ctx, init_request("copy.bin", &data, 1_024))
        .await
        .unwrap();
    let outcome = h
        .engine
        .check(&h.ctx, second.task_id, &sha256_hex(&data))
        .await
        .unwrap();
    assert_eq!(outcome, CheckOutcome::QuickUpload { file_id });

    let second = h.engine.get_task(&h.ctx, second.task_id).await.unwrap();
    assert_eq!(second.status, TaskStatus::Completed);
    assert!(second.upload_id.is_none());
    assert!(second.started_at.is_none());
    assert_eq!(h.calls.initiated(), initiated);
}

#[tokio::test]
async fn test_other_users_content_is_not_reused() {
    let h = Harness::new().await;
    let data = seeded_bytes(3, 2_000);
    let (task, chunks) = h.start_upload(&data, 1_024).await;
    for (index, chunk) in chunks.iter().enumerate() {
        h.send_chunk(task.task_id, index as u32, chunk).await.unwrap();
    }
    h.wait_for_status(task.task_id, TaskStatus::Completed).await;

    let other = RequestContext::new("u2");
    let theirs = h
        .engine
        .init(&other, init_request("file.bin", &data, 1_024))
        .await
        .unwrap();
    let outcome = h
        .engine
        .check(&other, theirs.task_id, &sha256_hex(&data))
        .await
        .unwrap();
    assert!(matches!(outcome, CheckOutcome::Ready { .. }));
}

#[tokio::test]
async fn test_pause_suppresses_merge_until_resume() {
    let h = Harness::new().await;
    let data = seeded_bytes(4, 3_000);
    let (task, chunks) = h.start_upload(&data, 1_024).await;

    h.send_chunk(task.task_id, 0, &chunks[0]).await.unwrap();
    h.send_chunk(task.task_id, 1, &chunks[1]).await.unwrap();
    h.engine.pause(&h.ctx, task.task_id).await.unwrap();
    h.engine.pause(&h.ctx, task.task_id).await.unwrap();

    // Chunks are still accepted while paused, but nothing merges.
    let last = h.send_chunk(task.task_id, 2, &chunks[2]).await.unwrap();
    assert!(matches!(
        last.merge,
        MergeOutcome::AlreadyAdvanced(TaskStatus::Paused)
    ));
    assert_eq!(h.calls.completed(), 0);
    let paused = h.engine.get_task(&h.ctx, task.task_id).await.unwrap();
    assert_eq!(paused.status, TaskStatus::Paused);

    let indices = h.engine.resume(&h.ctx, task.task_id).await.unwrap();
    assert_eq!(indices, vec![0, 1, 2]);
    h.wait_for_status(task.task_id, TaskStatus::Completed).await;
    assert_eq!(h.calls.completed(), 1);
}

#[tokio::test]
async fn test_cancel_aborts_once_and_forgets_progress() {
    let h = Harness::new().await;
    let data = seeded_bytes(5, 3_000);
    let (task, chunks) = h.start_upload(&data, 1_024).await;
    h.send_chunk(task.task_id, 0, &chunks[0]).await.unwrap();

    h.engine.cancel(&h.ctx, task.task_id).await.unwrap();
    h.engine.cancel(&h.ctx, task.task_id).await.unwrap();

    assert_eq!(h.calls.aborted(), 1);
    assert!(
        h.engine
            .list_completed_chunks(&h.ctx, task.task_id)
            .await
            .unwrap()
            .is_empty()
    );
    let canceled = h.engine.get_task(&h.ctx, task.task_id).await.unwrap();
    assert_eq!(canceled.status, TaskStatus::Canceled);

    let err = h.send_chunk(task.task_id, 1, &chunks[1]).await.unwrap_err();
    assert!(matches!(
        err,
        TransferError::InvalidTaskStatus {
            status: TaskStatus::Canceled,
            ..
        }
    ));
    assert!(matches!(
        h.engine.resume(&h.ctx, task.task_id).await,
        Err(TransferError::InvalidTaskStatus { .. })
    ));
}

#[tokio::test]
async fn test_cancel_completed_task_is_refused() {
    let h = Harness::new().await;
    let data = seeded_bytes(6, 1_000);
    let (task, chunks) = h.start_upload(&data, 1_024).await;
    h.send_chunk(task.task_id, 0, &chunks[0]).await.unwrap();
    h.wait_for_status(task.task_id, TaskStatus::Completed).await;

    assert!(matches!(
        h.engine.cancel(&h.ctx, task.task_id).await,
        Err(TransferError::InvalidTaskStatus {
            status: TaskStatus::Completed,
            ..
        })
    ));
    assert_eq!(h.calls.aborted(), 0);
}

#[tokio::test]
async fn test_rerecorded_chunk_keeps_part_and_emits_progress() {
    let h = Harness::new().await;
    let data = seeded_bytes(7, 3_000);
    let mut events = h.sink.subscribe_user("u1");
    let (task, chunks) = h.start_upload(&data, 1_024).await;

    let first = h.send_chunk(task.task_id, 0, &chunks[0]).await.unwrap();
    let again = h.send_chunk(task.task_id, 0, &chunks[0]).await.unwrap();
    assert!(first.recorded);
    assert!(!again.recorded);
    assert_eq!(again.progress.uploaded_chunks, 1);
    assert_eq!(again.progress.transferred_bytes, 1_024);
    assert_eq!(h.calls.parts(), 1);

    let mut progress_events = 0;
    while let Ok(Some(notification)) =
        tokio::time::timeout(Duration::from_millis(200), events.next()).await
    {
        if matches!(notification.event, TransferEvent::Progress(_)) {
            progress_events += 1;
        }
    }
    assert_eq!(progress_events, 2);
}

#[tokio::test]
async fn test_lifecycle_events_in_order() {
    let h = Harness::new().await;
    let data = seeded_bytes(8, 2_048);
    let mut events = h.sink.subscribe_user("u1");
    let (task, chunks) = h.start_upload(&data, 1_024).await;
    for (index, chunk) in chunks.iter().enumerate() {
        h.send_chunk(task.task_id, index as u32, chunk).await.unwrap();
    }

    let mut kinds = Vec::new();
    while let Ok(Some(notification)) =
        tokio::time::timeout(Duration::from_secs(5), events.next()).await
    {
        assert_eq!(notification.task_id, task.task_id);
        kinds.push(notification.event.kind());
        if kinds.last() == Some(&"complete") {
            break;
        }
    }
    assert_eq!(
        kinds,
        vec![
            "initialized",
            "checking",
            "ready_to_upload",
            "progress",
            "progress",
            "merging",
            "complete"
        ]
    );
}

#[tokio::test]
async fn test_failed_completion_fails_task() {
    let h = Harness::new().await;
    h.calls
        .fail_complete
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let data = seeded_bytes(9, 1_500);
    let (task, chunks) = h.start_upload(&data, 1_024).await;

    h.send_chunk(task.task_id, 0, &chunks[0]).await.unwrap();
    let last = h.send_chunk(task.task_id, 1, &chunks[1]).await.unwrap();
    let MergeOutcome::Scheduled(handle) = last.merge else {
        panic!("expected merge");
    };
    assert_eq!(handle.await.unwrap(), None);

    let failed = h.engine.get_task(&h.ctx, task.task_id).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(
        failed
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("injected completion failure"))
    );
    assert!(failed.expires_at < task.expires_at);

    // Progress stays inspectable after failure.
    assert_eq!(
        h.engine
            .list_completed_chunks(&h.ctx, task.task_id)
            .await
            .unwrap(),
        vec![0, 1]
    );
}

#[tokio::test]
async fn test_resume_after_restart_lists_recorded_chunks() {
    let h = Harness::new().await;
    let data = seeded_bytes(10, 4_096);
    let (task, chunks) = h.start_upload(&data, 1_024).await;
    for index in [3, 1] {
        h.send_chunk(task.task_id, index, &chunks[index as usize])
            .await
            .unwrap();
    }

    let recorded = h
        .engine
        .list_completed_chunks(&h.ctx, task.task_id)
        .await
        .unwrap();
    assert_eq!(recorded, vec![1, 3]);

    for index in (0..4u32).filter(|i| !recorded.contains(i)) {
        h.send_chunk(task.task_id, index, &chunks[index as usize])
            .await
            .unwrap();
    }
    h.wait_for_status(task.task_id, TaskStatus::Completed).await;
    assert_eq!(h.calls.parts(), 4);
}
