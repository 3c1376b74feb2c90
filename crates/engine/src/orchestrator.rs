//! The chunked upload pipeline.
//!
//! One entry point, [`UploadOrchestrator::upload_chunk`], drives the
//! whole ingestion path: admission, first-chunk dedup, the quota
//! pre-check, idempotent chunk staging, and on the last chunk assembly,
//! storage upload and the transactional commit. Everything before the
//! final commit is repeatable; a client can re-send any chunk after a
//! failure and converge on the same outcome.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use depot_cache::TieredCache;
use depot_core::config::UploadConfig;
use depot_core::context::RequestContext;
use depot_core::{
    ContentHash, FileRecord, MAX_CHUNKS_PER_UPLOAD, file_suffix, rename_with_suffix,
    suffix_blocked,
};
use depot_metadata::{FileCommit, FileRepo, MetadataStore};
use depot_storage::StorageBackend;
use time::OffsetDateTime;

use crate::admission::{AdmissionControl, QuotaGate};
use crate::assembler;
use crate::dedup::DedupIndex;
use crate::error::{EngineError, EngineResult};
use crate::metrics;
use crate::tracker::UploadTracker;
use crate::transcode::TranscodePipeline;

/// One chunk of a client upload.
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    /// Name the file will take in the owner's tree.
    pub file_name: String,
    /// Client-declared hash of the complete content.
    pub content_hash: ContentHash,
    /// Destination folder; `"0"` is the root.
    pub parent_id: String,
    /// Zero-based index of this chunk.
    pub chunk_index: u32,
    /// Declared chunk count; fixed by the first chunk's session init.
    pub total_chunks: u32,
    /// Chunk payload.
    pub data: Bytes,
}

/// What a chunk upload accomplished.
#[derive(Debug)]
pub enum UploadOutcome {
    /// The chunk was staged; more chunks are outstanding.
    ChunkAccepted { completed: u32, total: u32 },
    /// The chunk was already staged with the same size and was not
    /// rewritten.
    ChunkSkipped { completed: u32, total: u32 },
    /// The content already exists; the new record references it and no
    /// bytes were uploaded.
    Deduplicated { record: FileRecord },
    /// This was the final chunk; the file is assembled, stored, and
    /// committed in the `Transferring` state.
    Committed { record: FileRecord },
}

pub struct UploadOrchestrator {
    admission: AdmissionControl,
    quota: Arc<QuotaGate>,
    tracker: Arc<UploadTracker>,
    dedup: Arc<DedupIndex>,
    storage: Arc<dyn StorageBackend>,
    metadata: Arc<dyn MetadataStore>,
    records: Arc<TieredCache<FileRecord>>,
    transcode: Arc<TranscodePipeline>,
    temp_root: PathBuf,
}

impl UploadOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &UploadConfig,
        admission: AdmissionControl,
        quota: Arc<QuotaGate>,
        tracker: Arc<UploadTracker>,
        dedup: Arc<DedupIndex>,
        storage: Arc<dyn StorageBackend>,
        metadata: Arc<dyn MetadataStore>,
        records: Arc<TieredCache<FileRecord>>,
        transcode: Arc<TranscodePipeline>,
    ) -> Self {
        Self {
            admission,
            quota,
            tracker,
            dedup,
            storage,
            metadata,
            records,
            transcode,
            temp_root: config.temp_root.clone(),
        }
    }

    fn chunk_dir(&self, user_id: &str, content_hash: &ContentHash) -> PathBuf {
        self.temp_root.join(user_id).join(content_hash.to_hex())
    }

    /// Ingest one chunk and report how far the upload got.
    #[tracing::instrument(
        skip(self, ctx, upload),
        fields(
            user = %ctx.user_id,
            chunk = upload.chunk_index,
            declared_total = upload.total_chunks,
        )
    )]
    pub async fn upload_chunk(
        &self,
        ctx: &RequestContext,
        upload: ChunkUpload,
    ) -> EngineResult<UploadOutcome> {
        match self.handle_chunk(ctx, upload).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                metrics::record_upload_error(error.code());
                Err(error)
            }
        }
    }

    async fn handle_chunk(
        &self,
        ctx: &RequestContext,
        upload: ChunkUpload,
    ) -> EngineResult<UploadOutcome> {
        if upload.total_chunks == 0
            || upload.total_chunks > MAX_CHUNKS_PER_UPLOAD
            || upload.chunk_index >= upload.total_chunks
        {
            return Err(depot_core::Error::InvalidChunkParams {
                index: upload.chunk_index,
                total: upload.total_chunks,
            }
            .into());
        }
        if let Some(suffix) = file_suffix(&upload.file_name)
            && suffix_blocked(suffix)
        {
            return Err(depot_core::Error::BlockedSuffix(suffix.to_string()).into());
        }

        // Held for the rest of the call; dropping it on any path below
        // returns the permit.
        let _permit = self
            .admission
            .try_acquire(&ctx.user_id)
            .ok_or(EngineError::AdmissionDenied)?;

        if upload.chunk_index == 0
            && let Some(source) = self.dedup.find_source(&upload.content_hash).await?
        {
            match (&source.path, source.size) {
                (Some(path), Some(size)) => {
                    let path = path.clone();
                    return self.commit_reference(ctx, &upload, path, size).await;
                }
                _ => {
                    // A source without a settled size cannot be charged
                    // against quota; upload the bytes normally.
                    tracing::debug!(source = %source.file_id, "dedup source not settled, uploading");
                }
            }
        }

        let session = if upload.chunk_index == 0 {
            self.tracker
                .init_session(&ctx.user_id, &upload.content_hash, upload.total_chunks)
                .await?
        } else {
            self.tracker
                .session(&ctx.user_id, &upload.content_hash)
                .await?
                .ok_or(EngineError::SessionMissing)?
        };
        let total = session.total_chunks as u32;
        if total != upload.total_chunks {
            tracing::warn!(
                declared = upload.total_chunks,
                session_total = total,
                "declared total differs from the session, the session wins"
            );
            if upload.chunk_index >= total {
                return Err(depot_core::Error::InvalidChunkParams {
                    index: upload.chunk_index,
                    total,
                }
                .into());
            }
        }

        let chunk_len = upload.data.len() as i64;
        let mut previous_size = None;
        if self
            .tracker
            .is_chunk_done(&ctx.user_id, &upload.content_hash, upload.chunk_index)
            .await?
        {
            let previous = self
                .tracker
                .chunk(&ctx.user_id, &upload.content_hash, upload.chunk_index)
                .await?;
            if let Some(existing) = &previous
                && existing.size_bytes == chunk_len
            {
                metrics::CHUNKS_SKIPPED.inc();
                let completed = self
                    .tracker
                    .completed_count(&ctx.user_id, &upload.content_hash)
                    .await?;
                return Ok(UploadOutcome::ChunkSkipped { completed, total });
            }
            // Same index, different size: rewrite the chunk below.
            previous_size = previous.map(|c| c.size_bytes);
        }

        let staged = self
            .tracker
            .temp_bytes(&ctx.user_id, &upload.content_hash)
            .await?;
        self.quota.check(ctx, staged + chunk_len).await?;

        let chunk_dir = self.chunk_dir(&ctx.user_id, &upload.content_hash);
        tokio::fs::create_dir_all(&chunk_dir).await?;
        let chunk_path = chunk_dir.join(upload.chunk_index.to_string());
        tokio::fs::write(&chunk_path, &upload.data).await?;
        let written = tokio::fs::metadata(&chunk_path).await?.len();
        if written != upload.data.len() as u64 {
            metrics::CHUNK_INTEGRITY_FAILURES.inc();
            let _ = tokio::fs::remove_file(&chunk_path).await;
            return Err(EngineError::ChunkIntegrity {
                index: upload.chunk_index,
                received: upload.data.len() as u64,
                written,
            });
        }

        // A rewrite charges only the size difference.
        let staged_delta = chunk_len - previous_size.unwrap_or(0);
        self.tracker
            .add_temp_bytes(&ctx.user_id, &upload.content_hash, staged_delta)
            .await?;
        self.tracker
            .mark_chunk_done(&ctx.user_id, &upload.content_hash, upload.chunk_index, chunk_len)
            .await?;
        metrics::CHUNKS_WRITTEN.inc();
        metrics::BYTES_WRITTEN.inc_by(upload.data.len() as u64);

        let completed = self
            .tracker
            .completed_count(&ctx.user_id, &upload.content_hash)
            .await?;
        if completed < total {
            return Ok(UploadOutcome::ChunkAccepted { completed, total });
        }

        match self.finalize(ctx, &upload).await {
            Ok(Some(record)) => Ok(UploadOutcome::Committed { record }),
            Ok(None) => Ok(UploadOutcome::ChunkAccepted { completed, total }),
            Err(error) => {
                // Assembly-phase failures are terminal: the chunks are
                // gone, so resume state must go too.
                self.abandon(&ctx.user_id, &upload.content_hash).await;
                Err(error)
            }
        }
    }

    /// Commit a record that references an existing source's bytes.
    async fn commit_reference(
        &self,
        ctx: &RequestContext,
        upload: &ChunkUpload,
        source_path: String,
        size: i64,
    ) -> EngineResult<UploadOutcome> {
        self.quota.check(ctx, size).await?;

        let mut name = upload.file_name.clone();
        if self
            .metadata
            .name_exists(&ctx.user_id, &upload.parent_id, &name)
            .await?
        {
            name = rename_with_suffix(&name);
        }

        let mut record = FileRecord::new_file(
            &ctx.user_id,
            &upload.parent_id,
            name,
            upload.content_hash,
            source_path,
        );
        record.size = Some(size);
        // No transcode runs for a reference, so it is Active immediately.
        // Derived assets are per-record and are not copied from the source.
        record.lifecycle = depot_core::LifecycleStatus::Active;
        record.validate()?;

        let commit = FileCommit::new(&record, size).on_commit(self.quota_refresh(&ctx.user_id));
        self.metadata.commit_file(commit).await?;

        self.records
            .store(record.file_id.as_str(), &ctx.user_id, Some(record.clone()))
            .await?;
        self.dedup.admit(&upload.content_hash, &record).await?;
        metrics::FILES_DEDUPLICATED.inc();
        metrics::BYTES_DEDUPLICATED.inc_by(size as u64);
        tracing::info!(file = %record.file_id, size, "deduplicated against existing content");
        Ok(UploadOutcome::Deduplicated { record })
    }

    /// Assemble, store, and commit a completed session. Returns `None`
    /// when a concurrent final chunk claimed the assembly first.
    async fn finalize(
        &self,
        ctx: &RequestContext,
        upload: &ChunkUpload,
    ) -> EngineResult<Option<FileRecord>> {
        let hex = upload.content_hash.to_hex();
        let chunk_dir = self.chunk_dir(&ctx.user_id, &upload.content_hash);
        let claim_dir = chunk_dir.with_extension("assembling");

        // Rename is the claim: exactly one of several concurrent final
        // chunks gets the directory, the rest see NotFound.
        match tokio::fs::rename(&chunk_dir, &claim_dir).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("assembly already claimed by a concurrent chunk");
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        }

        let merged = chunk_dir.with_extension("merged");
        let timer = metrics::ASSEMBLY_DURATION.start_timer();
        let size = assembler::assemble(&claim_dir, &merged).await?;
        timer.observe_duration();

        let mut name = upload.file_name.clone();
        if self
            .metadata
            .name_exists(&ctx.user_id, &upload.parent_id, &name)
            .await?
        {
            name = rename_with_suffix(&name);
        }

        let now = OffsetDateTime::now_utc();
        let month = format!("{:04}{:02}", now.year(), u8::from(now.month()));
        let key = match file_suffix(&name) {
            Some(suffix) => format!("{month}/{}/{hex}.{suffix}", ctx.user_id),
            None => format!("{month}/{}/{hex}", ctx.user_id),
        };
        self.storage.upload(&key, &merged).await?;

        let mut record = FileRecord::new_file(
            &ctx.user_id,
            &upload.parent_id,
            name,
            upload.content_hash,
            key,
        );
        record.size = Some(size as i64);
        record.validate()?;

        let pipeline = Arc::clone(&self.transcode);
        let task_user = ctx.user_id.clone();
        let task_file = record.file_id.clone();
        let task_source = merged.clone();
        let commit = FileCommit::new(&record, size as i64)
            .on_commit(move || {
                tokio::spawn(async move {
                    if let Err(error) =
                        pipeline.process(&task_user, &task_file, &task_source).await
                    {
                        tracing::error!(%error, file = %task_file, "transcode task failed");
                    }
                });
            })
            .on_commit(self.quota_refresh(&ctx.user_id));
        self.metadata.commit_file(commit).await?;

        self.records
            .store(record.file_id.as_str(), &ctx.user_id, Some(record.clone()))
            .await?;
        self.tracker.clear(&ctx.user_id, &upload.content_hash).await?;
        self.dedup.admit(&upload.content_hash, &record).await?;
        metrics::FILES_COMMITTED.inc();
        tracing::info!(file = %record.file_id, size, "committed upload");
        Ok(Some(record))
    }

    /// After-commit hook dropping the owner's cached used-space.
    fn quota_refresh(&self, user_id: &str) -> impl FnOnce() + Send + 'static {
        let quota = Arc::clone(&self.quota);
        let owner = user_id.to_string();
        move || {
            tokio::spawn(async move {
                if let Err(error) = quota.invalidate(&owner).await {
                    tracing::warn!(%error, user = %owner, "failed to drop used-space cache");
                }
            });
        }
    }

    /// Best-effort removal of everything a failed finalize left behind.
    async fn abandon(&self, user_id: &str, content_hash: &ContentHash) {
        let chunk_dir = self.chunk_dir(user_id, content_hash);
        for dir in [chunk_dir.clone(), chunk_dir.with_extension("assembling")] {
            if let Err(error) = tokio::fs::remove_dir_all(&dir).await
                && error.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(%error, dir = %dir.display(), "failed to remove chunk dir");
            }
        }
        let merged = chunk_dir.with_extension("merged");
        if let Err(error) = tokio::fs::remove_file(&merged).await
            && error.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(%error, file = %merged.display(), "failed to remove merged file");
        }
        if let Err(error) = self.tracker.clear(user_id, content_hash).await {
            tracing::warn!(%error, "failed to clear session during cleanup");
        }
    }
}
