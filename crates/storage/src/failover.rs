//! Primary/backup failover with a consecutive-failure circuit breaker.

use crate::error::StorageResult;
use crate::traits::{ByteStream, StorageBackend};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::instrument;

/// Consecutive-failure counter for the primary backend.
///
/// The circuit opens once the counter reaches the threshold and closes only on
/// a primary success or an explicit [`reset`](CircuitState::reset). There is no
/// decay timer and no half-open probe: with the circuit open, nothing calls
/// the primary, so an operator reset is the only way back. Callers mutate the
/// counter without additional locking; minor imprecision under contention is
/// accepted.
#[derive(Debug)]
pub struct CircuitState {
    failures: AtomicU32,
    threshold: u32,
}

impl CircuitState {
    pub fn new(threshold: u32) -> Self {
        Self {
            failures: AtomicU32::new(0),
            threshold,
        }
    }

    /// True once the threshold has been reached.
    pub fn is_open(&self) -> bool {
        self.failures.load(Ordering::Relaxed) >= self.threshold
    }

    /// Record a primary failure. Returns the new consecutive count.
    pub fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record a primary success, closing the circuit.
    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    /// Close the circuit regardless of the current count.
    pub fn reset(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Wraps a primary and a backup backend behind one [`StorageBackend`].
///
/// Reads and writes try the primary while the circuit is closed; any primary
/// error increments the failure counter and the call falls through to the
/// backup, whose result (or error) is what the caller sees. A primary success
/// resets the counter. Deletes are best-effort against both backends and
/// never fail the caller, since the canonical metadata deletion has already
/// happened by the time storage cleanup runs.
pub struct FailoverStore {
    primary: Arc<dyn StorageBackend>,
    backup: Arc<dyn StorageBackend>,
    circuit: CircuitState,
}

impl FailoverStore {
    pub fn new(
        primary: Arc<dyn StorageBackend>,
        backup: Arc<dyn StorageBackend>,
        failure_threshold: u32,
    ) -> Self {
        Self {
            primary,
            backup,
            circuit: CircuitState::new(failure_threshold),
        }
    }

    /// Access the circuit for inspection or an operator reset.
    pub fn circuit(&self) -> &CircuitState {
        &self.circuit
    }

    /// Run `op` against the primary, falling back to `fallback` against the
    /// backup on any primary error. Circuit-open skips the primary entirely.
    async fn with_failover<T, P, PFut, B, BFut>(
        &self,
        operation: &'static str,
        op: P,
        fallback: B,
    ) -> StorageResult<T>
    where
        P: FnOnce(Arc<dyn StorageBackend>) -> PFut,
        PFut: Future<Output = StorageResult<T>>,
        B: FnOnce(Arc<dyn StorageBackend>) -> BFut,
        BFut: Future<Output = StorageResult<T>>,
    {
        if self.circuit.is_open() {
            return fallback(self.backup.clone()).await;
        }

        match op(self.primary.clone()).await {
            Ok(value) => {
                self.circuit.record_success();
                Ok(value)
            }
            Err(err) => {
                let failures = self.circuit.record_failure();
                tracing::warn!(
                    operation,
                    backend = self.primary.backend_name(),
                    consecutive_failures = failures,
                    error = %err,
                    "primary storage failed, falling back to backup"
                );
                fallback(self.backup.clone()).await
            }
        }
    }

    /// Run a delete-type `op` against both backends, swallowing errors.
    async fn best_effort_both<P, PFut, B, BFut>(
        &self,
        operation: &'static str,
        key: &str,
        primary_op: P,
        backup_op: B,
    ) where
        P: FnOnce(Arc<dyn StorageBackend>) -> PFut,
        PFut: Future<Output = StorageResult<()>>,
        B: FnOnce(Arc<dyn StorageBackend>) -> BFut,
        BFut: Future<Output = StorageResult<()>>,
    {
        if let Err(err) = primary_op(self.primary.clone()).await {
            tracing::warn!(
                operation,
                key,
                backend = self.primary.backend_name(),
                error = %err,
                "primary delete failed, continuing"
            );
        }
        if let Err(err) = backup_op(self.backup.clone()).await {
            tracing::warn!(
                operation,
                key,
                backend = self.backup.backend_name(),
                error = %err,
                "backup delete failed, continuing"
            );
        }
    }
}

#[async_trait]
impl StorageBackend for FailoverStore {
    #[instrument(skip(self, local_path), fields(backend = "failover"))]
    async fn upload(&self, key: &str, local_path: &Path) -> StorageResult<u64> {
        let key_p = key.to_string();
        let key_b = key.to_string();
        let path_p = local_path.to_path_buf();
        let path_b = local_path.to_path_buf();
        self.with_failover(
            "upload",
            |primary| async move { primary.upload(&key_p, &path_p).await },
            |backup| async move { backup.upload(&key_b, &path_b).await },
        )
        .await
    }

    #[instrument(skip(self, data), fields(backend = "failover", size = data.len()))]
    async fn upload_bytes(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let key_p = key.to_string();
        let key_b = key.to_string();
        let data_b = data.clone();
        self.with_failover(
            "upload_bytes",
            |primary| async move { primary.upload_bytes(&key_p, data).await },
            |backup| async move { backup.upload_bytes(&key_b, data_b).await },
        )
        .await
    }

    #[instrument(skip(self, local_dir), fields(backend = "failover"))]
    async fn upload_dir(&self, prefix: &str, local_dir: &Path) -> StorageResult<u64> {
        let prefix_p = prefix.to_string();
        let prefix_b = prefix.to_string();
        let dir_p = local_dir.to_path_buf();
        let dir_b = local_dir.to_path_buf();
        self.with_failover(
            "upload_dir",
            |primary| async move { primary.upload_dir(&prefix_p, &dir_p).await },
            |backup| async move { backup.upload_dir(&prefix_b, &dir_b).await },
        )
        .await
    }

    #[instrument(skip(self), fields(backend = "failover"))]
    async fn download(&self, key: &str) -> StorageResult<ByteStream> {
        let key_p = key.to_string();
        let key_b = key.to_string();
        self.with_failover(
            "download",
            |primary| async move { primary.download(&key_p).await },
            |backup| async move { backup.download(&key_b).await },
        )
        .await
    }

    #[instrument(skip(self), fields(backend = "failover"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let key_p = key.to_string();
        let key_b = key.to_string();
        self.with_failover(
            "exists",
            |primary| async move { primary.exists(&key_p).await },
            |backup| async move { backup.exists(&key_b).await },
        )
        .await
    }

    #[instrument(skip(self), fields(backend = "failover"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let key_p = key.to_string();
        let key_b = key.to_string();
        self.best_effort_both(
            "delete",
            key,
            |primary| async move { primary.delete(&key_p).await },
            |backup| async move { backup.delete(&key_b).await },
        )
        .await;
        Ok(())
    }

    #[instrument(skip(self, keys), fields(backend = "failover", count = keys.len()))]
    async fn delete_batch(&self, keys: &[String]) -> StorageResult<()> {
        let keys_p = keys.to_vec();
        let keys_b = keys.to_vec();
        self.best_effort_both(
            "delete_batch",
            "(batch)",
            |primary| async move { primary.delete_batch(&keys_p).await },
            |backup| async move { backup.delete_batch(&keys_b).await },
        )
        .await;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "failover"))]
    async fn delete_prefix(&self, prefix: &str) -> StorageResult<u64> {
        let mut removed = 0u64;
        match self.primary.delete_prefix(prefix).await {
            Ok(count) => removed = count,
            Err(err) => {
                tracing::warn!(
                    operation = "delete_prefix",
                    key = prefix,
                    backend = self.primary.backend_name(),
                    error = %err,
                    "primary delete failed, continuing"
                );
            }
        }
        match self.backup.delete_prefix(prefix).await {
            Ok(count) => removed = removed.max(count),
            Err(err) => {
                tracing::warn!(
                    operation = "delete_prefix",
                    key = prefix,
                    backend = self.backup.backend_name(),
                    error = %err,
                    "backup delete failed, continuing"
                );
            }
        }
        Ok(removed)
    }

    fn url(&self, key: &str) -> String {
        if self.circuit.is_open() {
            self.backup.url(key)
        } else {
            self.primary.url(key)
        }
    }

    fn backend_name(&self) -> &'static str {
        "failover"
    }

    #[instrument(skip(self), fields(backend = "failover"))]
    async fn health_check(&self) -> StorageResult<()> {
        match self.primary.health_check().await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(
                    backend = self.primary.backend_name(),
                    error = %err,
                    "primary storage unhealthy, checking backup"
                );
                self.backup.health_check().await
            }
        }
    }
}
