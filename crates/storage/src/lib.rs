//! Object storage abstraction and backends for Depot.
//!
//! This crate provides:
//! - A uniform upload/download/delete surface over file content
//! - Backends: local filesystem (root-jailed) and S3-compatible
//! - A primary/backup failover wrapper with a circuit breaker

pub mod backends;
pub mod error;
pub mod failover;
pub mod traits;

pub use backends::{filesystem::FilesystemBackend, s3::S3Backend};
pub use error::{StorageError, StorageResult};
pub use failover::{CircuitState, FailoverStore};
pub use traits::{ByteStream, StorageBackend};

use depot_core::config::{BackendConfig, StorageConfig};
use std::sync::Arc;

async fn backend_from_config(config: &BackendConfig) -> StorageResult<Arc<dyn StorageBackend>> {
    match config {
        BackendConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
        BackendConfig::S3 {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
        } => {
            let backend = S3Backend::new(
                bucket,
                endpoint.clone(),
                region.clone(),
                prefix.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
                *force_path_style,
            )
            .await?;
            Ok(Arc::new(backend))
        }
    }
}

/// Create the storage layer from configuration.
///
/// With a backup backend configured, the primary is wrapped in a
/// [`FailoverStore`]; otherwise the primary is returned directly and primary
/// errors surface to callers unchanged.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
    config.validate().map_err(StorageError::Config)?;

    let primary = backend_from_config(&config.primary).await?;
    match &config.backup {
        Some(backup_config) => {
            let backup = backend_from_config(backup_config).await?;
            Ok(Arc::new(FailoverStore::new(
                primary,
                backup,
                config.failure_threshold,
            )))
        }
        None => Ok(primary),
    }
}
