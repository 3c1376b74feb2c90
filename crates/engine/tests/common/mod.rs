//! Common test utilities and fixtures.

use bytes::Bytes;
use depot_core::config::{AppConfig, BackendConfig, MetadataConfig, StorageConfig};
use depot_core::{ContentHash, RequestContext};
use depot_engine::EngineState;
use depot_engine::orchestrator::ChunkUpload;
use depot_metadata::{FileRecordRow, FileRepo, MetadataStore, SqliteStore};
use depot_storage::{FilesystemBackend, StorageBackend};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A test engine wrapper with all dependencies on a temp directory.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestEngine {
    pub state: EngineState,
    /// Root of the filesystem object store, for layout assertions.
    pub storage_root: PathBuf,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestEngine {
    /// Create a test engine with temporary storage and metadata.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test engine with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let storage_root = temp_dir.path().join("objects");
        let storage: Arc<dyn StorageBackend> = Arc::new(
            FilesystemBackend::new(&storage_root)
                .await
                .expect("Failed to create storage backend"),
        );

        let db_path = temp_dir.path().join("metadata.db");
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(&db_path, None)
                .await
                .expect("Failed to create metadata store"),
        );

        let mut config = AppConfig::for_testing();
        config.storage = StorageConfig {
            primary: BackendConfig::Filesystem {
                path: storage_root.clone(),
            },
            backup: None,
            failure_threshold: 3,
        };
        config.metadata = MetadataConfig::Sqlite {
            path: db_path,
            query_timeout_secs: None,
        };
        config.upload.temp_root = temp_dir.path().join("temp");

        modifier(&mut config);

        let state = EngineState::new(config, storage, metadata);
        Self {
            state,
            storage_root,
            _temp_dir: temp_dir,
        }
    }

    /// A request context carrying the configured default quota.
    pub fn context(&self, user_id: &str) -> RequestContext {
        self.state.request_context(user_id)
    }

    /// Build the chunk at `index` for `data` split into `chunk_size` pieces.
    pub fn chunk(
        &self,
        file_name: &str,
        data: &Bytes,
        chunk_size: usize,
        index: u32,
    ) -> ChunkUpload {
        let chunks = split_into_chunks(data, chunk_size);
        ChunkUpload {
            file_name: file_name.to_string(),
            content_hash: ContentHash::compute(data),
            parent_id: depot_core::ROOT_PARENT_ID.to_string(),
            chunk_index: index,
            total_chunks: chunks.len() as u32,
            data: chunks[index as usize].clone(),
        }
    }

    /// Poll the stored record until its lifecycle leaves `transferring`.
    /// Panics after two seconds; the transcode task settles well within that.
    pub async fn wait_until_settled(&self, user_id: &str, file_id: &str) -> FileRecordRow {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let row = self
                .state
                .metadata
                .get_file(user_id, file_id)
                .await
                .expect("metadata lookup failed")
                .expect("record vanished while settling");
            if row.lifecycle != "transferring" {
                return row;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("record {file_id} did not settle in time");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll the account's durable used space until it reaches `expected`.
    pub async fn wait_for_used_space(&self, user_id: &str, expected: i64) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if self.state.quota.used_space(user_id).await.unwrap() == expected {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("used space for {user_id} did not reach {expected} in time");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Generate deterministic test data based on a seed.
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        // Simple LCG for deterministic data
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// Split data into chunks of specified size.
pub fn split_into_chunks(data: &[u8], chunk_size: usize) -> Vec<Bytes> {
    data.chunks(chunk_size)
        .map(Bytes::copy_from_slice)
        .collect()
}
