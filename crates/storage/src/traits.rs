//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::path::Path;
use std::pin::Pin;

/// A boxed stream of bytes for streaming downloads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Uniform upload/download/delete operations over a place file content can
/// live.
///
/// Keys are forward-slash-separated relative paths (for example
/// `u123/aB9x0q/video.mp4`). Backends treat them as opaque beyond the
/// separator; key safety (no traversal, no absolute paths) is enforced by
/// each backend before any filesystem or network call.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Upload a local file to `key`. Returns the number of bytes uploaded.
    async fn upload(&self, key: &str, local_path: &Path) -> StorageResult<u64>;

    /// Upload an in-memory buffer to `key` atomically.
    async fn upload_bytes(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Upload every regular file under `local_dir` beneath `prefix`,
    /// preserving relative paths. Returns the number of files uploaded.
    async fn upload_dir(&self, prefix: &str, local_dir: &Path) -> StorageResult<u64>;

    /// Get an object as a byte stream.
    async fn download(&self, key: &str) -> StorageResult<ByteStream>;

    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Delete an object. Returns `NotFound` if the key does not exist.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Delete a batch of objects. Keys that do not exist are skipped.
    async fn delete_batch(&self, keys: &[String]) -> StorageResult<()>;

    /// Delete every object under `prefix`. Returns the number of objects
    /// removed. A prefix with no objects is not an error.
    async fn delete_prefix(&self, prefix: &str) -> StorageResult<u64>;

    /// A location string for serving the object: a local path for the
    /// filesystem backend, an object URL for S3.
    fn url(&self, key: &str) -> String;

    /// Get the name of this storage backend.
    ///
    /// Returns a static string identifier for the backend type (e.g., "s3",
    /// "filesystem"). Used for metrics and logging.
    fn backend_name(&self) -> &'static str;

    /// Verify the backend is reachable and writable.
    async fn health_check(&self) -> StorageResult<()>;
}
