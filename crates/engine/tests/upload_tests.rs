//! End-to-end tests for the chunk upload pipeline.

mod common;

use common::{TestEngine, seeded_bytes, split_into_chunks};
use depot_core::ContentHash;
use depot_engine::error::EngineError;
use depot_engine::orchestrator::{ChunkUpload, UploadOutcome};
use depot_metadata::FileRepo;
use futures::StreamExt;

/// Collect a download stream into one buffer.
async fn download_all(fx: &TestEngine, key: &str) -> Vec<u8> {
    let mut stream = fx.state.storage.download(key).await.unwrap();
    let mut collected = Vec::new();
    while let Some(chunk) = stream.next().await {
        collected.extend_from_slice(&chunk.unwrap());
    }
    collected
}

#[tokio::test]
async fn single_chunk_upload_commits_and_settles_active() {
    let fx = TestEngine::new().await;
    let ctx = fx.context("u1");
    let data = seeded_bytes(1, 4096);

    let outcome = fx
        .state
        .orchestrator
        .upload_chunk(&ctx, fx.chunk("notes.txt", &data, 4096, 0))
        .await
        .unwrap();
    let record = match outcome {
        UploadOutcome::Committed { record } => record,
        other => panic!("expected Committed, got {other:?}"),
    };
    assert_eq!(record.size, Some(4096));
    assert_eq!(record.name, "notes.txt");

    let row = fx.wait_until_settled("u1", record.file_id.as_str()).await;
    assert_eq!(row.lifecycle, "active");
    assert_eq!(row.size, Some(4096));
    assert!(row.cover.is_none());

    let key = row.path.expect("committed file has a storage key");
    assert!(fx.state.storage.exists(&key).await.unwrap());
    assert_eq!(download_all(&fx, &key).await, data.as_ref());

    // Resume state is gone once the upload committed.
    let hash = ContentHash::compute(&data);
    assert!(fx.state.tracker.session("u1", &hash).await.unwrap().is_none());
}

#[tokio::test]
async fn out_of_order_chunks_reassemble_in_index_order() {
    let fx = TestEngine::new().await;
    let ctx = fx.context("u1");
    let data = seeded_bytes(2, 3 * 1024);

    // Chunk 0 opens the session; afterwards order does not matter.
    for (index, completed) in [(0u32, 1u32), (2, 2)] {
        let outcome = fx
            .state
            .orchestrator
            .upload_chunk(&ctx, fx.chunk("report.bin", &data, 1024, index))
            .await
            .unwrap();
        match outcome {
            UploadOutcome::ChunkAccepted { completed: done, total } => {
                assert_eq!(done, completed);
                assert_eq!(total, 3);
            }
            other => panic!("expected ChunkAccepted, got {other:?}"),
        }
    }

    let outcome = fx
        .state
        .orchestrator
        .upload_chunk(&ctx, fx.chunk("report.bin", &data, 1024, 1))
        .await
        .unwrap();
    let record = match outcome {
        UploadOutcome::Committed { record } => record,
        other => panic!("expected Committed, got {other:?}"),
    };

    let row = fx.wait_until_settled("u1", record.file_id.as_str()).await;
    assert_eq!(row.lifecycle, "active");
    let key = row.path.unwrap();
    assert_eq!(download_all(&fx, &key).await, data.as_ref());
}

#[tokio::test]
async fn resending_a_chunk_with_the_same_size_is_skipped() {
    let fx = TestEngine::new().await;
    let ctx = fx.context("u1");
    let data = seeded_bytes(3, 2 * 512);

    let first = fx
        .state
        .orchestrator
        .upload_chunk(&ctx, fx.chunk("twice.dat", &data, 512, 0))
        .await
        .unwrap();
    assert!(matches!(
        first,
        UploadOutcome::ChunkAccepted { completed: 1, .. }
    ));

    let again = fx
        .state
        .orchestrator
        .upload_chunk(&ctx, fx.chunk("twice.dat", &data, 512, 0))
        .await
        .unwrap();
    assert!(matches!(
        again,
        UploadOutcome::ChunkSkipped {
            completed: 1,
            total: 2
        }
    ));

    // The re-send did not inflate staged byte accounting.
    let hash = ContentHash::compute(&data);
    assert_eq!(fx.state.tracker.temp_bytes("u1", &hash).await.unwrap(), 512);

    let last = fx
        .state
        .orchestrator
        .upload_chunk(&ctx, fx.chunk("twice.dat", &data, 512, 1))
        .await
        .unwrap();
    assert!(matches!(last, UploadOutcome::Committed { .. }));
}

#[tokio::test]
async fn rewriting_a_chunk_with_a_different_size_charges_the_delta() {
    let fx = TestEngine::new().await;
    let ctx = fx.context("u1");

    // A client retry after a size change: same index, different payload.
    let short = seeded_bytes(4, 100);
    let long = seeded_bytes(5, 150);
    let hash = ContentHash::compute(b"rewrite-session");

    let chunk = |index: u32, data: &bytes::Bytes| ChunkUpload {
        file_name: "draft.dat".to_string(),
        content_hash: hash,
        parent_id: depot_core::ROOT_PARENT_ID.to_string(),
        chunk_index: index,
        total_chunks: 2,
        data: data.clone(),
    };

    fx.state
        .orchestrator
        .upload_chunk(&ctx, chunk(0, &short))
        .await
        .unwrap();
    assert_eq!(fx.state.tracker.temp_bytes("u1", &hash).await.unwrap(), 100);

    let rewritten = fx
        .state
        .orchestrator
        .upload_chunk(&ctx, chunk(0, &long))
        .await
        .unwrap();
    assert!(matches!(
        rewritten,
        UploadOutcome::ChunkAccepted { completed: 1, .. }
    ));
    assert_eq!(fx.state.tracker.temp_bytes("u1", &hash).await.unwrap(), 150);

    let outcome = fx
        .state
        .orchestrator
        .upload_chunk(&ctx, chunk(1, &short))
        .await
        .unwrap();
    let record = match outcome {
        UploadOutcome::Committed { record } => record,
        other => panic!("expected Committed, got {other:?}"),
    };
    assert_eq!(record.size, Some(250));
}

#[tokio::test]
async fn a_second_user_uploading_the_same_content_dedups_without_new_objects() {
    let fx = TestEngine::new().await;
    let data = seeded_bytes(6, 2 * 2048);

    let ctx_a = fx.context("user-a");
    for index in 0..2 {
        fx.state
            .orchestrator
            .upload_chunk(&ctx_a, fx.chunk("shared.txt", &data, 2048, index))
            .await
            .unwrap();
    }
    // Dedup only nominates settled sources, so wait for the transcode
    // task to promote the record first.
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
    let committed = loop {
        if let Some(row) = fx
            .state
            .metadata
            .find_active_by_hash(&ContentHash::compute(&data).to_hex())
            .await
            .unwrap()
        {
            break row;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("source record did not become active in time");
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    };

    let ctx_b = fx.context("user-b");
    let outcome = fx
        .state
        .orchestrator
        .upload_chunk(&ctx_b, fx.chunk("shared.txt", &data, 2048, 0))
        .await
        .unwrap();
    let record = match outcome {
        UploadOutcome::Deduplicated { record } => record,
        other => panic!("expected Deduplicated, got {other:?}"),
    };

    assert_eq!(record.path.as_deref(), committed.path.as_deref());
    assert_eq!(record.size, committed.size);
    assert_eq!(record.lifecycle.as_str(), "active");

    // The reference was charged against user-b's quota.
    fx.wait_for_used_space("user-b", data.len() as i64).await;

    // No session was opened and no object landed under user-b's prefix.
    let hash = ContentHash::compute(&data);
    assert!(
        fx.state
            .tracker
            .session("user-b", &hash)
            .await
            .unwrap()
            .is_none()
    );
    let source_key = committed.path.unwrap();
    let user_b_prefix = source_key.replace("user-a", "user-b");
    let month_dir = fx.storage_root.join(
        user_b_prefix
            .rsplit_once('/')
            .map(|(dir, _)| dir)
            .unwrap_or(""),
    );
    assert!(!month_dir.exists());
}

#[tokio::test]
async fn dedup_renames_on_collision_in_the_same_folder() {
    let fx = TestEngine::new().await;
    let ctx = fx.context("u1");
    let data = seeded_bytes(7, 1024);

    let outcome = fx
        .state
        .orchestrator
        .upload_chunk(&ctx, fx.chunk("doc.txt", &data, 1024, 0))
        .await
        .unwrap();
    let first = match outcome {
        UploadOutcome::Committed { record } => record,
        other => panic!("expected Committed, got {other:?}"),
    };
    fx.wait_until_settled("u1", first.file_id.as_str()).await;

    let outcome = fx
        .state
        .orchestrator
        .upload_chunk(&ctx, fx.chunk("doc.txt", &data, 1024, 0))
        .await
        .unwrap();
    let second = match outcome {
        UploadOutcome::Deduplicated { record } => record,
        other => panic!("expected Deduplicated, got {other:?}"),
    };

    assert_ne!(second.name, "doc.txt");
    assert!(second.name.starts_with("doc_"));
    assert!(second.name.ends_with(".txt"));
    assert_eq!(second.path, first.path);
}

#[tokio::test]
async fn quota_boundary_exact_fit_passes_one_over_fails() {
    let fx = TestEngine::with_config(|config| {
        config.quota.default_total_bytes = 4096;
    })
    .await;
    let ctx = fx.context("u1");

    let exact = seeded_bytes(8, 4096);
    let outcome = fx
        .state
        .orchestrator
        .upload_chunk(&ctx, fx.chunk("fits.dat", &exact, 4096, 0))
        .await
        .unwrap();
    assert!(matches!(outcome, UploadOutcome::Committed { .. }));
    fx.wait_for_used_space("u1", 4096).await;

    let over = seeded_bytes(9, 1);
    let err = fx
        .state
        .orchestrator
        .upload_chunk(&ctx, fx.chunk("over.dat", &over, 1, 0))
        .await
        .unwrap_err();
    assert!(!err.is_retryable());
    match err {
        EngineError::QuotaExceeded { needed, available } => {
            assert_eq!(needed, 1);
            assert_eq!(available, 0);
        }
        other => panic!("expected QuotaExceeded, got {other:?}"),
    }
}

#[tokio::test]
async fn uploads_beyond_the_permit_limit_are_denied() {
    let fx = TestEngine::with_config(|config| {
        config.upload.permits_per_user = 1;
    })
    .await;
    let ctx = fx.context("u1");
    let data = seeded_bytes(10, 256);

    let held = fx.state.admission.try_acquire("u1").unwrap();
    let err = fx
        .state
        .orchestrator
        .upload_chunk(&ctx, fx.chunk("wait.dat", &data, 256, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AdmissionDenied));
    assert!(err.is_retryable());

    drop(held);
    let outcome = fx
        .state
        .orchestrator
        .upload_chunk(&ctx, fx.chunk("wait.dat", &data, 256, 0))
        .await
        .unwrap();
    assert!(matches!(outcome, UploadOutcome::Committed { .. }));
}

#[tokio::test]
async fn blocked_suffixes_are_rejected_on_the_first_chunk() {
    let fx = TestEngine::new().await;
    let ctx = fx.context("u1");
    let data = seeded_bytes(11, 128);

    let err = fx
        .state
        .orchestrator
        .upload_chunk(&ctx, fx.chunk("payload.exe", &data, 128, 0))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Core(depot_core::Error::BlockedSuffix(_))
    ));
}

#[tokio::test]
async fn a_chunk_without_a_session_is_rejected() {
    let fx = TestEngine::new().await;
    let ctx = fx.context("u1");
    let data = seeded_bytes(12, 3 * 64);

    let err = fx
        .state
        .orchestrator
        .upload_chunk(&ctx, fx.chunk("orphan.dat", &data, 64, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SessionMissing));
}

#[tokio::test]
async fn invalid_chunk_params_are_rejected() {
    let fx = TestEngine::new().await;
    let ctx = fx.context("u1");

    let zero_total = ChunkUpload {
        file_name: "a.dat".to_string(),
        content_hash: ContentHash::compute(b"a"),
        parent_id: depot_core::ROOT_PARENT_ID.to_string(),
        chunk_index: 0,
        total_chunks: 0,
        data: bytes::Bytes::from_static(b"a"),
    };
    let err = fx
        .state
        .orchestrator
        .upload_chunk(&ctx, zero_total)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Core(depot_core::Error::InvalidChunkParams { .. })
    ));
    assert_eq!(err.code(), "invalid_request");

    let out_of_range = ChunkUpload {
        file_name: "a.dat".to_string(),
        content_hash: ContentHash::compute(b"a"),
        parent_id: depot_core::ROOT_PARENT_ID.to_string(),
        chunk_index: 2,
        total_chunks: 2,
        data: bytes::Bytes::from_static(b"a"),
    };
    let err = fx
        .state
        .orchestrator
        .upload_chunk(&ctx, out_of_range)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Core(depot_core::Error::InvalidChunkParams { index: 2, total: 2 })
    ));
}

#[tokio::test]
async fn declared_total_mismatch_defers_to_the_session() {
    let fx = TestEngine::new().await;
    let ctx = fx.context("u1");
    let data = seeded_bytes(13, 3 * 256);
    let chunks = split_into_chunks(&data, 256);
    let hash = ContentHash::compute(&data);

    fx.state
        .orchestrator
        .upload_chunk(&ctx, fx.chunk("fixed.dat", &data, 256, 0))
        .await
        .unwrap();

    // A retry declaring a different total gets the session's count back.
    let lying = ChunkUpload {
        file_name: "fixed.dat".to_string(),
        content_hash: hash,
        parent_id: depot_core::ROOT_PARENT_ID.to_string(),
        chunk_index: 1,
        total_chunks: 5,
        data: chunks[1].clone(),
    };
    let outcome = fx.state.orchestrator.upload_chunk(&ctx, lying).await.unwrap();
    assert!(matches!(
        outcome,
        UploadOutcome::ChunkAccepted {
            completed: 2,
            total: 3
        }
    ));

    let outcome = fx
        .state
        .orchestrator
        .upload_chunk(&ctx, fx.chunk("fixed.dat", &data, 256, 2))
        .await
        .unwrap();
    assert!(matches!(outcome, UploadOutcome::Committed { .. }));
}

#[tokio::test]
async fn failed_transcode_marks_the_record_transfer_failed() {
    let fx = TestEngine::with_config(|config| {
        config.transcode.ffmpeg_path = "/nonexistent/ffmpeg-binary".to_string();
    })
    .await;
    let ctx = fx.context("u1");
    let data = seeded_bytes(14, 2048);

    let outcome = fx
        .state
        .orchestrator
        .upload_chunk(&ctx, fx.chunk("clip.mp4", &data, 2048, 0))
        .await
        .unwrap();
    let record = match outcome {
        UploadOutcome::Committed { record } => record,
        other => panic!("expected Committed, got {other:?}"),
    };

    let row = fx.wait_until_settled("u1", record.file_id.as_str()).await;
    assert_eq!(row.lifecycle, "transfer_failed");
    // A failed transfer never becomes a dedup source.
    assert!(
        fx.state
            .metadata
            .find_active_by_hash(&ContentHash::compute(&data).to_hex())
            .await
            .unwrap()
            .is_none()
    );
}
