// Multipart uploads against the local backend.

mod common;

use common::{seeded_bytes, sha256_hex};
use depot_storage::backends::local::LocalBackend;
use depot_storage::{CompletedPart, StorageBackend, StorageError, collect_stream};
use std::sync::Arc;
use tempfile::TempDir;

const PART_SIZE: usize = 64 * 1024;

#[tokio::test]
async fn test_concurrent_parts_assemble_in_order() {
    let temp_dir = TempDir::new().unwrap();
    let backend = Arc::new(LocalBackend::new(temp_dir.path(), None).await.unwrap());
    let key = "u1/2026-01-01/file.bin";
    let upload_id = backend
        .initiate_multipart_upload(key, Some("application/octet-stream"))
        .await
        .unwrap();

    let parts: Vec<_> = (0..8u64).map(|i| seeded_bytes(i, PART_SIZE)).collect();
    let handles: Vec<_> = parts
        .iter()
        .enumerate()
        .rev()
        .map(|(i, data)| {
            let backend = Arc::clone(&backend);
            let upload_id = upload_id.clone();
            let data = data.clone();
            tokio::spawn(async move {
                let part_number = i as u32 + 1;
                let etag = backend
                    .upload_part(key, &upload_id, part_number, data.len() as u64, data)
                    .await
                    .unwrap();
                CompletedPart {
                    part_number,
                    part_id: etag,
                }
            })
        })
        .collect();

    let mut completed = Vec::new();
    for handle in handles {
        completed.push(handle.await.unwrap());
    }
    completed.sort_by_key(|p| p.part_number);

    let listed = backend.list_parts(key, &upload_id).await.unwrap();
    assert_eq!(listed.len(), parts.len());
    for (info, data) in listed.iter().zip(&parts) {
        assert_eq!(info.size, PART_SIZE as u64);
        assert_eq!(info.part_id, sha256_hex(data));
    }

    backend
        .complete_multipart_upload(key, &upload_id, &completed)
        .await
        .unwrap();

    let stored = collect_stream(backend.download(key).await.unwrap())
        .await
        .unwrap();
    let expected: Vec<u8> = parts.iter().flat_map(|p| p.iter().copied()).collect();
    assert_eq!(stored.as_ref(), expected.as_slice());

    // The upload id is gone once completed.
    assert!(matches!(
        backend.list_parts(key, &upload_id).await,
        Err(StorageError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_abort_discards_parts() {
    let temp_dir = TempDir::new().unwrap();
    let backend = LocalBackend::new(temp_dir.path(), None).await.unwrap();
    let key = "u1/aborted.bin";
    let upload_id = backend.initiate_multipart_upload(key, None).await.unwrap();
    let data = seeded_bytes(7, 1024);
    backend
        .upload_part(key, &upload_id, 1, data.len() as u64, data)
        .await
        .unwrap();

    backend.abort_multipart_upload(key, &upload_id).await.unwrap();
    assert!(!backend.exists(key).await.unwrap());
    assert!(matches!(
        backend.list_parts(key, &upload_id).await,
        Err(StorageError::NotFound(_))
    ));
}
