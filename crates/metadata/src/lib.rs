//! Metadata store abstraction and implementations for Depot.
//!
//! This crate provides the control-plane data model:
//! - File records, their lifecycle and deletion states
//! - Resumable upload sessions and completed-chunk tracking
//! - Per-account space usage
//! - The transactional commit boundary with after-commit hooks

pub mod commit;
pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use commit::{AfterCommit, FileCommit};
pub use error::{MetadataError, MetadataResult};
pub use models::{FileRecordRow, UploadChunkRow, UploadSessionRow};
pub use repos::{FileRepo, SessionRepo};
pub use store::{MetadataStore, SqliteStore};

use depot_core::config::MetadataConfig;
use std::sync::Arc;

/// Create a metadata store from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    match config {
        MetadataConfig::Sqlite {
            path,
            query_timeout_secs,
        } => {
            let store = SqliteStore::new(path, *query_timeout_secs).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}
