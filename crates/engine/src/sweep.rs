//! Background maintenance sweeps.
//!
//! Three sweeps keep the system from accumulating garbage: stale temp
//! chunk dirs with no live session, upload sessions past their expiry,
//! and recycled records past retention. The purge sweep is the only
//! place backend objects are deleted; it reference-counts the content
//! hash so a shared primary object survives until its last record is
//! purged, while per-record derived objects always go.
//!
//! Sweeps are batch-bounded per run. A backlog larger than one run
//! carries over to the next interval.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use depot_cache::TieredCache;
use depot_core::config::SweepConfig;
use depot_core::{ContentHash, FileRecord};
use depot_metadata::{FileRecordRow, FileRepo, MetadataStore, SessionRepo};
use depot_storage::{StorageBackend, StorageError};
use time::OffsetDateTime;

use crate::admission::QuotaGate;
use crate::dedup::DedupIndex;
use crate::error::EngineResult;
use crate::metrics;
use crate::tracker::UploadTracker;
use crate::transcode;

/// What one sweep run accomplished.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub examined: u64,
    pub deleted: u64,
    pub bytes_reclaimed: u64,
    pub errors: u64,
}

pub struct MaintenanceSweeps {
    config: SweepConfig,
    temp_root: PathBuf,
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn StorageBackend>,
    tracker: Arc<UploadTracker>,
    dedup: Arc<DedupIndex>,
    quota: Arc<QuotaGate>,
    records: Arc<TieredCache<FileRecord>>,
}

impl MaintenanceSweeps {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SweepConfig,
        temp_root: PathBuf,
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn StorageBackend>,
        tracker: Arc<UploadTracker>,
        dedup: Arc<DedupIndex>,
        quota: Arc<QuotaGate>,
        records: Arc<TieredCache<FileRecord>>,
    ) -> Self {
        Self {
            config,
            temp_root,
            metadata,
            storage,
            tracker,
            dedup,
            quota,
            records,
        }
    }

    /// Remove temp entries older than the staleness window that no live
    /// session claims.
    pub async fn sweep_stale_temp(&self) -> EngineResult<SweepStats> {
        let mut stats = SweepStats::default();
        let stale_after = Duration::from_secs(self.config.temp_stale_secs);

        let mut users = match tokio::fs::read_dir(&self.temp_root).await {
            Ok(users) => users,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(stats),
            Err(error) => return Err(error.into()),
        };
        while let Some(user_entry) = users.next_entry().await? {
            let Ok(user_id) = user_entry.file_name().into_string() else {
                continue;
            };
            let mut entries = tokio::fs::read_dir(user_entry.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                stats.examined += 1;
                let path = entry.path();

                let stale = match entry.metadata().await.and_then(|m| m.modified()) {
                    Ok(modified) => modified
                        .elapsed()
                        .map(|age| age >= stale_after)
                        .unwrap_or(false),
                    Err(error) => {
                        tracing::warn!(%error, path = %path.display(), "unreadable temp entry");
                        stats.errors += 1;
                        continue;
                    }
                };
                if !stale {
                    continue;
                }

                // Claim dirs and merged files share the session's hash
                // name with a suffix.
                let name = entry.file_name();
                let name = name.to_string_lossy();
                let hex = name
                    .strip_suffix(".assembling")
                    .or_else(|| name.strip_suffix(".merged"))
                    .unwrap_or(&name);
                let live = match ContentHash::from_hex(hex) {
                    Ok(hash) => self.tracker.session(&user_id, &hash).await?.is_some(),
                    Err(_) => false,
                };
                if live {
                    continue;
                }

                match remove_entry(&path).await {
                    Ok(bytes) => {
                        stats.deleted += 1;
                        stats.bytes_reclaimed += bytes;
                        metrics::SWEEP_DELETED.with_label_values(&["stale_temp"]).inc();
                    }
                    Err(error) => {
                        tracing::warn!(%error, path = %path.display(), "failed to remove temp entry");
                        stats.errors += 1;
                    }
                }
            }
        }
        Ok(stats)
    }

    /// Drop sessions past their expiry along with their temp dirs.
    pub async fn sweep_expired_sessions(&self) -> EngineResult<SweepStats> {
        let mut stats = SweepStats::default();
        for _ in 0..self.config.purge_max_rounds {
            let batch = self
                .tracker
                .expired_sessions(OffsetDateTime::now_utc(), self.config.purge_batch_size)
                .await?;
            let batch_len = batch.len();
            for session in batch {
                stats.examined += 1;

                let chunk_dir = self
                    .temp_root
                    .join(&session.user_id)
                    .join(&session.content_hash);
                if let Err(error) = tokio::fs::remove_dir_all(&chunk_dir).await
                    && error.kind() != std::io::ErrorKind::NotFound
                {
                    tracing::warn!(%error, dir = %chunk_dir.display(), "failed to remove chunk dir");
                    stats.errors += 1;
                }

                let cleared = match ContentHash::from_hex(&session.content_hash) {
                    Ok(hash) => self.tracker.clear(&session.user_id, &hash).await,
                    // Unparseable rows still have to go.
                    Err(_) => self
                        .metadata
                        .clear_session(&session.user_id, &session.content_hash)
                        .await
                        .map_err(Into::into),
                };
                match cleared {
                    Ok(()) => {
                        stats.deleted += 1;
                        metrics::SWEEP_DELETED
                            .with_label_values(&["expired_session"])
                            .inc();
                    }
                    Err(error) => {
                        tracing::warn!(%error, user = %session.user_id, "failed to clear session");
                        stats.errors += 1;
                    }
                }
            }
            if batch_len < self.config.purge_batch_size as usize {
                break;
            }
        }
        Ok(stats)
    }

    /// Purge recycled records past retention and delete their backend
    /// objects.
    pub async fn sweep_recycled(&self) -> EngineResult<SweepStats> {
        let mut stats = SweepStats::default();
        let cutoff = OffsetDateTime::now_utc() - self.config.recycle_retention();
        for _ in 0..self.config.purge_max_rounds {
            let batch = self
                .metadata
                .recycled_before(cutoff, self.config.purge_batch_size)
                .await?;
            let batch_len = batch.len();
            for row in batch {
                stats.examined += 1;
                match self.purge_one(&row).await {
                    Ok(bytes) => {
                        stats.deleted += 1;
                        stats.bytes_reclaimed += bytes;
                        metrics::SWEEP_DELETED.with_label_values(&["recycled"]).inc();
                    }
                    Err(error) => {
                        tracing::warn!(%error, file = %row.file_id, "failed to purge record");
                        stats.errors += 1;
                    }
                }
            }
            if batch_len < self.config.purge_batch_size as usize {
                break;
            }
        }
        Ok(stats)
    }

    async fn purge_one(&self, row: &FileRecordRow) -> EngineResult<u64> {
        let now = OffsetDateTime::now_utc();
        if !self
            .metadata
            .mark_purged(&row.user_id, &row.file_id, now)
            .await?
        {
            // Raced with another purge of the same record.
            return Ok(0);
        }

        let size = row.size.unwrap_or(0);
        if size != 0 {
            self.metadata
                .add_used_space(&row.user_id, -size, now)
                .await?;
        }

        self.records.evict(&row.file_id, &row.user_id).await?;
        if let Err(error) = self.quota.invalidate(&row.user_id).await {
            tracing::warn!(%error, user = %row.user_id, "failed to drop used-space cache");
        }

        let Some(path) = &row.path else {
            return Ok(0);
        };

        // Derived objects are per-record and always go.
        let prefix = transcode::hls_prefix(path, &row.file_id);
        self.storage.delete_prefix(&prefix).await?;
        if let Some(cover) = &row.cover {
            match self.storage.delete(cover).await {
                Ok(()) | Err(StorageError::NotFound(_)) => {}
                Err(error) => return Err(error.into()),
            }
        }

        // The primary object may be shared; it goes only when no
        // non-purged record references its hash anymore.
        let mut reclaimed = 0u64;
        match &row.content_hash {
            Some(hex) => {
                if self.metadata.hash_reference_count(hex).await? == 0 {
                    match self.storage.delete(path).await {
                        Ok(()) => reclaimed = size.max(0) as u64,
                        Err(StorageError::NotFound(_)) => {}
                        Err(error) => return Err(error.into()),
                    }
                    if let Ok(hash) = ContentHash::from_hex(hex)
                        && let Err(error) = self.dedup.forget(&hash).await
                    {
                        tracing::warn!(%error, "failed to drop dedup pointer");
                    }
                }
            }
            None => {
                tracing::debug!(file = %row.file_id, "no content hash, leaving the shared object");
            }
        }
        Ok(reclaimed)
    }

    /// Run every sweep once, logging failures without aborting the rest.
    pub async fn run_all(&self) {
        match self.sweep_stale_temp().await {
            Ok(stats) if stats.deleted > 0 || stats.errors > 0 => {
                tracing::info!(?stats, "stale temp sweep finished");
            }
            Ok(_) => {}
            Err(error) => tracing::error!(%error, "stale temp sweep failed"),
        }
        match self.sweep_expired_sessions().await {
            Ok(stats) if stats.deleted > 0 || stats.errors > 0 => {
                tracing::info!(?stats, "expired session sweep finished");
            }
            Ok(_) => {}
            Err(error) => tracing::error!(%error, "expired session sweep failed"),
        }
        match self.sweep_recycled().await {
            Ok(stats) if stats.deleted > 0 || stats.errors > 0 => {
                tracing::info!(?stats, "recycle purge sweep finished");
            }
            Ok(_) => {}
            Err(error) => tracing::error!(%error, "recycle purge sweep failed"),
        }
    }
}

async fn entry_size(path: &Path) -> u64 {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => meta.len(),
        Ok(_) => {
            let mut total = 0;
            if let Ok(mut entries) = tokio::fs::read_dir(path).await {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    if let Ok(meta) = entry.metadata().await {
                        total += meta.len();
                    }
                }
            }
            total
        }
        Err(_) => 0,
    }
}

async fn remove_entry(path: &Path) -> std::io::Result<u64> {
    let bytes = entry_size(path).await;
    let meta = tokio::fs::metadata(path).await?;
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(bytes)
}

/// Spawn the periodic maintenance task running all sweeps.
pub fn spawn_sweeps(
    sweeps: Arc<MaintenanceSweeps>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            sweeps.run_all().await;
        }
    })
}
