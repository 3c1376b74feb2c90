//! Resumable upload session tracking.
//!
//! The metadata store is the source of truth for sessions, completed
//! chunks, and temp-byte counters. The shared cache tier keeps two hot
//! mirrors per session so the chunk path rarely hits the database:
//! a set of completed chunk indexes and a temp-byte counter. Both are
//! best-effort; a tier miss or error falls back to the store.

use std::sync::Arc;

use depot_cache::SharedTier;
use depot_core::ContentHash;
use depot_core::config::UploadConfig;
use depot_metadata::{MetadataStore, SessionRepo, UploadChunkRow, UploadSessionRow};
use time::OffsetDateTime;

use crate::error::{EngineError, EngineResult};

pub struct UploadTracker {
    metadata: Arc<dyn MetadataStore>,
    tier: Arc<dyn SharedTier>,
    session_ttl: time::Duration,
    tracking_ttl: std::time::Duration,
}

impl UploadTracker {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        tier: Arc<dyn SharedTier>,
        config: &UploadConfig,
    ) -> Self {
        Self {
            metadata,
            tier,
            session_ttl: config.session_ttl(),
            tracking_ttl: std::time::Duration::from_secs(config.session_ttl_secs),
        }
    }

    fn chunks_key(user_id: &str, hash_hex: &str) -> String {
        format!("chunks:{user_id}:{hash_hex}")
    }

    fn temp_key(user_id: &str, hash_hex: &str) -> String {
        format!("tempbytes:{user_id}:{hash_hex}")
    }

    /// Create the session if none exists and return the surviving row.
    ///
    /// The first writer fixes `total_chunks`; a concurrent or repeated
    /// init with a different total gets the original row back.
    pub async fn init_session(
        &self,
        user_id: &str,
        content_hash: &ContentHash,
        total_chunks: u32,
    ) -> EngineResult<UploadSessionRow> {
        let now = OffsetDateTime::now_utc();
        let row = UploadSessionRow {
            user_id: user_id.to_string(),
            content_hash: content_hash.to_hex(),
            total_chunks: i64::from(total_chunks),
            temp_bytes: 0,
            created_at: now,
            updated_at: now,
            expires_at: now + self.session_ttl,
        };
        self.metadata.init_session(&row).await?;
        self.metadata
            .get_session(user_id, &row.content_hash)
            .await?
            .ok_or(EngineError::SessionMissing)
    }

    pub async fn session(
        &self,
        user_id: &str,
        content_hash: &ContentHash,
    ) -> EngineResult<Option<UploadSessionRow>> {
        Ok(self
            .metadata
            .get_session(user_id, &content_hash.to_hex())
            .await?)
    }

    /// Whether this chunk index has already been recorded.
    ///
    /// A tier hit is trusted because indexes are only added after the
    /// durable mark; a miss still consults the store.
    pub async fn is_chunk_done(
        &self,
        user_id: &str,
        content_hash: &ContentHash,
        chunk_index: u32,
    ) -> EngineResult<bool> {
        let hex = content_hash.to_hex();
        let key = Self::chunks_key(user_id, &hex);
        match self
            .tier
            .set_contains(&key, &chunk_index.to_string())
            .await
        {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(error) => {
                tracing::warn!(%error, key, "chunk-set probe failed, using the store");
            }
        }
        Ok(self
            .metadata
            .get_chunk(user_id, &hex, chunk_index)
            .await?
            .is_some())
    }

    pub async fn chunk(
        &self,
        user_id: &str,
        content_hash: &ContentHash,
        chunk_index: u32,
    ) -> EngineResult<Option<UploadChunkRow>> {
        Ok(self
            .metadata
            .get_chunk(user_id, &content_hash.to_hex(), chunk_index)
            .await?)
    }

    /// Record a completed chunk. Returns true only when the index was
    /// newly recorded.
    pub async fn mark_chunk_done(
        &self,
        user_id: &str,
        content_hash: &ContentHash,
        chunk_index: u32,
        size_bytes: i64,
    ) -> EngineResult<bool> {
        let hex = content_hash.to_hex();
        let row = UploadChunkRow {
            user_id: user_id.to_string(),
            content_hash: hex.clone(),
            chunk_index: i64::from(chunk_index),
            size_bytes,
            received_at: OffsetDateTime::now_utc(),
        };
        let newly = self.metadata.mark_chunk_done(&row).await?;

        let key = Self::chunks_key(user_id, &hex);
        if let Err(error) = self
            .tier
            .set_add(&key, &chunk_index.to_string(), self.tracking_ttl)
            .await
        {
            tracing::warn!(%error, key, "failed to mirror chunk completion into the tier");
        }
        Ok(newly)
    }

    pub async fn completed_count(
        &self,
        user_id: &str,
        content_hash: &ContentHash,
    ) -> EngineResult<u32> {
        Ok(self
            .metadata
            .completed_count(user_id, &content_hash.to_hex())
            .await?)
    }

    /// Charge `delta` bytes to the session's temp counter and return the
    /// new total.
    pub async fn add_temp_bytes(
        &self,
        user_id: &str,
        content_hash: &ContentHash,
        delta: i64,
    ) -> EngineResult<i64> {
        let hex = content_hash.to_hex();
        self.metadata
            .add_temp_bytes(user_id, &hex, delta, OffsetDateTime::now_utc())
            .await?;

        let key = Self::temp_key(user_id, &hex);
        match self.tier.incr(&key, delta, self.tracking_ttl).await {
            Ok(total) => Ok(total),
            Err(error) => {
                tracing::warn!(%error, key, "temp-byte counter unavailable, using the store");
                let session = self.metadata.get_session(user_id, &hex).await?;
                Ok(session.map(|s| s.temp_bytes).unwrap_or(0))
            }
        }
    }

    /// Bytes currently staged for this session.
    pub async fn temp_bytes(
        &self,
        user_id: &str,
        content_hash: &ContentHash,
    ) -> EngineResult<i64> {
        let hex = content_hash.to_hex();
        let key = Self::temp_key(user_id, &hex);
        match self.tier.get(&key).await {
            Ok(Some(raw)) => {
                if let Ok(total) = raw.parse::<i64>() {
                    return Ok(total);
                }
                tracing::warn!(key, raw, "unparseable temp-byte counter, using the store");
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(%error, key, "temp-byte probe failed, using the store");
            }
        }

        let total = self
            .metadata
            .get_session(user_id, &hex)
            .await?
            .map(|s| s.temp_bytes)
            .unwrap_or(0);
        if let Err(error) = self
            .tier
            .set(&key, total.to_string(), self.tracking_ttl)
            .await
        {
            tracing::debug!(%error, key, "failed to seed temp-byte counter");
        }
        Ok(total)
    }

    /// Drop the session, its chunk rows, and the tier mirrors.
    pub async fn clear(&self, user_id: &str, content_hash: &ContentHash) -> EngineResult<()> {
        let hex = content_hash.to_hex();
        self.metadata.clear_session(user_id, &hex).await?;
        for key in [
            Self::chunks_key(user_id, &hex),
            Self::temp_key(user_id, &hex),
        ] {
            if let Err(error) = self.tier.delete(&key).await {
                tracing::warn!(%error, key, "failed to drop session tracking key");
            }
        }
        Ok(())
    }

    pub async fn expired_sessions(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> EngineResult<Vec<UploadSessionRow>> {
        Ok(self.metadata.expired_sessions(now, limit).await?)
    }
}
