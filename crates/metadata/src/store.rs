//! Metadata store trait and implementations.

use crate::commit::FileCommit;
use crate::error::{MetadataError, MetadataResult};
use crate::repos::{FileRepo, SessionRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: FileRepo + SessionRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Apply a file commit: insert the record and adjust the owner's used
    /// space in one transaction, then run the after-commit hooks.
    ///
    /// Hooks never run if the transaction fails. Chunk writes and storage
    /// uploads are deliberately outside this transaction.
    async fn commit_file(&self, commit: FileCommit) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Create a new SQLite store.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let query_timeout_secs = query_timeout_secs.unwrap_or(600); // 10 minutes default

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // SQLite permits limited write concurrency; a single connection avoids
            // persistent "database is locked" failures under concurrent chunk marking.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::debug!(
            query_timeout_secs,
            "SQLite query timeout is advisory only; long queries are not cancelled"
        );

        Ok(store)
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn commit_file(&self, commit: FileCommit) -> MetadataResult<()> {
        let (record, space_delta, hooks) = commit.into_parts();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO file_records (
                file_id, user_id, content_hash, parent_id, name, path, size,
                category, folder_kind, lifecycle, deletion, cover,
                created_at, updated_at, recycled_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.file_id)
        .bind(&record.user_id)
        .bind(&record.content_hash)
        .bind(&record.parent_id)
        .bind(&record.name)
        .bind(&record.path)
        .bind(record.size)
        .bind(&record.category)
        .bind(&record.folder_kind)
        .bind(&record.lifecycle)
        .bind(&record.deletion)
        .bind(&record.cover)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.recycled_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO user_space (user_id, used_bytes, updated_at)
            VALUES (?, MAX(?, 0), ?)
            ON CONFLICT (user_id) DO UPDATE SET
                used_bytes = MAX(user_space.used_bytes + ?, 0),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.user_id)
        .bind(space_delta)
        .bind(record.updated_at)
        .bind(space_delta)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        // The transaction landed; deferred work may fire now.
        for hook in hooks {
            hook();
        }

        Ok(())
    }
}

// Implement the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use depot_core::record::LifecycleStatus;
    use time::OffsetDateTime;

    #[async_trait]
    impl FileRepo for SqliteStore {
        async fn insert_file(&self, record: &FileRecordRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO file_records (
                    file_id, user_id, content_hash, parent_id, name, path, size,
                    category, folder_kind, lifecycle, deletion, cover,
                    created_at, updated_at, recycled_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.file_id)
            .bind(&record.user_id)
            .bind(&record.content_hash)
            .bind(&record.parent_id)
            .bind(&record.name)
            .bind(&record.path)
            .bind(record.size)
            .bind(&record.category)
            .bind(&record.folder_kind)
            .bind(&record.lifecycle)
            .bind(&record.deletion)
            .bind(&record.cover)
            .bind(record.created_at)
            .bind(record.updated_at)
            .bind(record.recycled_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get_file(
            &self,
            user_id: &str,
            file_id: &str,
        ) -> MetadataResult<Option<FileRecordRow>> {
            let row = sqlx::query_as::<_, FileRecordRow>(
                "SELECT * FROM file_records WHERE user_id = ? AND file_id = ?",
            )
            .bind(user_id)
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn find_active_by_hash(
            &self,
            content_hash: &str,
        ) -> MetadataResult<Option<FileRecordRow>> {
            // Oldest match wins so every reference points at the same source.
            let row = sqlx::query_as::<_, FileRecordRow>(
                "SELECT * FROM file_records
                 WHERE content_hash = ? AND lifecycle = 'active' AND deletion = 'active'
                 ORDER BY created_at ASC LIMIT 1",
            )
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn name_exists(
            &self,
            user_id: &str,
            parent_id: &str,
            name: &str,
        ) -> MetadataResult<bool> {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM file_records
                 WHERE user_id = ? AND parent_id = ? AND name = ? AND deletion = 'active'",
            )
            .bind(user_id)
            .bind(parent_id)
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
            Ok(count > 0)
        }

        async fn finish_transfer(
            &self,
            user_id: &str,
            file_id: &str,
            status: LifecycleStatus,
            size: Option<i64>,
            cover: Option<&str>,
            updated_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            // Guarded on the current state so a lost race leaves the winner's
            // result untouched.
            let result = sqlx::query(
                "UPDATE file_records
                 SET lifecycle = ?, size = COALESCE(?, size), cover = COALESCE(?, cover),
                     updated_at = ?
                 WHERE user_id = ? AND file_id = ? AND lifecycle = 'transferring'",
            )
            .bind(status.as_str())
            .bind(size)
            .bind(cover)
            .bind(updated_at)
            .bind(user_id)
            .bind(file_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn recycle_file(
            &self,
            user_id: &str,
            file_id: &str,
            recycled_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE file_records
                 SET deletion = 'recycled', recycled_at = ?, updated_at = ?
                 WHERE user_id = ? AND file_id = ? AND deletion = 'active'",
            )
            .bind(recycled_at)
            .bind(recycled_at)
            .bind(user_id)
            .bind(file_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn recycled_before(
            &self,
            cutoff: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<Vec<FileRecordRow>> {
            let rows = sqlx::query_as::<_, FileRecordRow>(
                "SELECT * FROM file_records
                 WHERE deletion = 'recycled' AND recycled_at < ?
                 ORDER BY recycled_at ASC LIMIT ?",
            )
            .bind(cutoff)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn mark_purged(
            &self,
            user_id: &str,
            file_id: &str,
            updated_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE file_records
                 SET deletion = 'purged', updated_at = ?
                 WHERE user_id = ? AND file_id = ? AND deletion = 'recycled'",
            )
            .bind(updated_at)
            .bind(user_id)
            .bind(file_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn hash_reference_count(&self, content_hash: &str) -> MetadataResult<i64> {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM file_records
                 WHERE content_hash = ? AND deletion != 'purged'",
            )
            .bind(content_hash)
            .fetch_one(&self.pool)
            .await?;
            Ok(count)
        }

        async fn active_hashes(&self) -> MetadataResult<Vec<String>> {
            let hashes: Vec<String> = sqlx::query_scalar(
                "SELECT DISTINCT content_hash FROM file_records
                 WHERE content_hash IS NOT NULL AND deletion != 'purged'",
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(hashes)
        }

        async fn used_space(&self, user_id: &str) -> MetadataResult<i64> {
            let used: Option<i64> =
                sqlx::query_scalar("SELECT used_bytes FROM user_space WHERE user_id = ?")
                    .bind(user_id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(used.unwrap_or(0))
        }

        async fn add_used_space(
            &self,
            user_id: &str,
            delta: i64,
            updated_at: OffsetDateTime,
        ) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO user_space (user_id, used_bytes, updated_at)
                VALUES (?, MAX(?, 0), ?)
                ON CONFLICT (user_id) DO UPDATE SET
                    used_bytes = MAX(user_space.used_bytes + ?, 0),
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(user_id)
            .bind(delta)
            .bind(updated_at)
            .bind(delta)
            .execute(&self.pool)
            .await?;
            Ok(())
        }
    }

    #[async_trait]
    impl SessionRepo for SqliteStore {
        async fn init_session(&self, session: &UploadSessionRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO upload_sessions (
                    user_id, content_hash, total_chunks, temp_bytes,
                    created_at, updated_at, expires_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (user_id, content_hash) DO NOTHING
                "#,
            )
            .bind(&session.user_id)
            .bind(&session.content_hash)
            .bind(session.total_chunks)
            .bind(session.temp_bytes)
            .bind(session.created_at)
            .bind(session.updated_at)
            .bind(session.expires_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get_session(
            &self,
            user_id: &str,
            content_hash: &str,
        ) -> MetadataResult<Option<UploadSessionRow>> {
            let row = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE user_id = ? AND content_hash = ?",
            )
            .bind(user_id)
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn get_chunk(
            &self,
            user_id: &str,
            content_hash: &str,
            chunk_index: u32,
        ) -> MetadataResult<Option<UploadChunkRow>> {
            let row = sqlx::query_as::<_, UploadChunkRow>(
                "SELECT * FROM upload_chunks
                 WHERE user_id = ? AND content_hash = ? AND chunk_index = ?",
            )
            .bind(user_id)
            .bind(content_hash)
            .bind(chunk_index)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn mark_chunk_done(&self, chunk: &UploadChunkRow) -> MetadataResult<bool> {
            // Re-marks are no-ops so retries and duplicate deliveries cannot
            // inflate the completed count.
            let result = sqlx::query(
                r#"
                INSERT INTO upload_chunks (
                    user_id, content_hash, chunk_index, size_bytes, received_at
                ) VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (user_id, content_hash, chunk_index) DO NOTHING
                "#,
            )
            .bind(&chunk.user_id)
            .bind(&chunk.content_hash)
            .bind(chunk.chunk_index)
            .bind(chunk.size_bytes)
            .bind(chunk.received_at)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn completed_count(&self, user_id: &str, content_hash: &str) -> MetadataResult<u32> {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM upload_chunks WHERE user_id = ? AND content_hash = ?",
            )
            .bind(user_id)
            .bind(content_hash)
            .fetch_one(&self.pool)
            .await?;
            Ok(count as u32)
        }

        async fn add_temp_bytes(
            &self,
            user_id: &str,
            content_hash: &str,
            delta: i64,
            updated_at: OffsetDateTime,
        ) -> MetadataResult<()> {
            let result = sqlx::query(
                "UPDATE upload_sessions
                 SET temp_bytes = temp_bytes + ?, updated_at = ?
                 WHERE user_id = ? AND content_hash = ?",
            )
            .bind(delta)
            .bind(updated_at)
            .bind(user_id)
            .bind(content_hash)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!(
                    "upload session {user_id}/{content_hash}"
                )));
            }
            Ok(())
        }

        async fn clear_session(&self, user_id: &str, content_hash: &str) -> MetadataResult<()> {
            // Chunk rows go with the session via ON DELETE CASCADE.
            sqlx::query("DELETE FROM upload_sessions WHERE user_id = ? AND content_hash = ?")
                .bind(user_id)
                .bind(content_hash)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn expired_sessions(
            &self,
            now: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<Vec<UploadSessionRow>> {
            let rows = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE expires_at < ? ORDER BY expires_at ASC LIMIT ?",
            )
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }
}

const SCHEMA_SQL: &str = r#"
-- File records. Primary key is user-scoped: the same file_id may exist for
-- different users.
CREATE TABLE IF NOT EXISTS file_records (
    file_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    -- Dedup identity (hex). NULL once the record only references shared
    -- storage, so purging the source never orphans the pointer.
    content_hash TEXT,
    parent_id TEXT NOT NULL DEFAULT '0',
    name TEXT NOT NULL,
    path TEXT,
    size INTEGER,
    category TEXT NOT NULL,
    folder_kind TEXT NOT NULL,
    lifecycle TEXT NOT NULL DEFAULT 'transferring',
    deletion TEXT NOT NULL DEFAULT 'active',
    cover TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    recycled_at TEXT,
    PRIMARY KEY (user_id, file_id)
);
CREATE INDEX IF NOT EXISTS idx_file_records_hash ON file_records(content_hash);
CREATE INDEX IF NOT EXISTS idx_file_records_folder ON file_records(user_id, parent_id, deletion);
CREATE INDEX IF NOT EXISTS idx_file_records_recycled ON file_records(deletion, recycled_at);

-- Resumable upload sessions, keyed by uploader and content hash.
CREATE TABLE IF NOT EXISTS upload_sessions (
    user_id TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    total_chunks INTEGER NOT NULL,
    temp_bytes INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    PRIMARY KEY (user_id, content_hash)
);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_expiry ON upload_sessions(expires_at);

-- Completed chunks per session.
CREATE TABLE IF NOT EXISTS upload_chunks (
    user_id TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    size_bytes INTEGER NOT NULL,
    received_at TEXT NOT NULL,
    PRIMARY KEY (user_id, content_hash, chunk_index),
    FOREIGN KEY (user_id, content_hash)
        REFERENCES upload_sessions(user_id, content_hash) ON DELETE CASCADE
);

-- Per-account space usage.
CREATE TABLE IF NOT EXISTS user_space (
    user_id TEXT PRIMARY KEY,
    used_bytes INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileRecordRow, UploadChunkRow, UploadSessionRow};
    use depot_core::hash::ContentHash;
    use depot_core::record::{FileRecord, LifecycleStatus};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use time::{Duration, OffsetDateTime};

    async fn build_store() -> (tempfile::TempDir, SqliteStore) {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(temp_dir.path().join("metadata.db"), None)
            .await
            .unwrap();
        (temp_dir, store)
    }

    fn sample_record(user_id: &str, name: &str, data: &[u8]) -> FileRecord {
        FileRecord::new_file(
            user_id,
            "0",
            name,
            ContentHash::compute(data),
            format!("files/{name}"),
        )
    }

    fn sample_session(user_id: &str, hash: &str, total_chunks: i64) -> UploadSessionRow {
        let now = OffsetDateTime::now_utc();
        UploadSessionRow {
            user_id: user_id.to_string(),
            content_hash: hash.to_string(),
            total_chunks,
            temp_bytes: 0,
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::days(7),
        }
    }

    fn chunk(user_id: &str, hash: &str, index: i64, size: i64) -> UploadChunkRow {
        UploadChunkRow {
            user_id: user_id.to_string(),
            content_hash: hash.to_string(),
            chunk_index: index,
            size_bytes: size,
            received_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_file() {
        let (_dir, store) = build_store().await;
        let record = sample_record("u1", "a.txt", b"hello");
        store
            .insert_file(&FileRecordRow::from_record(&record))
            .await
            .unwrap();

        let fetched = store
            .get_file("u1", record.file_id.as_str())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.name, "a.txt");
        assert_eq!(fetched.lifecycle, "transferring");

        assert!(store.get_file("u2", record.file_id.as_str()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_chunk_done_idempotent() {
        let (_dir, store) = build_store().await;
        let hash = ContentHash::compute(b"chunky").to_hex();
        store.init_session(&sample_session("u1", &hash, 3)).await.unwrap();

        assert!(store.mark_chunk_done(&chunk("u1", &hash, 0, 100)).await.unwrap());
        // Re-marking the same index is a no-op.
        assert!(!store.mark_chunk_done(&chunk("u1", &hash, 0, 100)).await.unwrap());
        assert!(store.mark_chunk_done(&chunk("u1", &hash, 1, 100)).await.unwrap());

        assert_eq!(store.completed_count("u1", &hash).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_init_session_keeps_first_declaration() {
        let (_dir, store) = build_store().await;
        let hash = ContentHash::compute(b"s").to_hex();
        store.init_session(&sample_session("u1", &hash, 3)).await.unwrap();
        // A re-init with a different total must not overwrite the first.
        store.init_session(&sample_session("u1", &hash, 9)).await.unwrap();

        let session = store.get_session("u1", &hash).await.unwrap().unwrap();
        assert_eq!(session.total_chunks, 3);
    }

    #[tokio::test]
    async fn test_finish_transfer_guarded() {
        let (_dir, store) = build_store().await;
        let record = sample_record("u1", "v.mp4", b"video");
        store
            .insert_file(&FileRecordRow::from_record(&record))
            .await
            .unwrap();
        let now = OffsetDateTime::now_utc();

        let updated = store
            .finish_transfer(
                "u1",
                record.file_id.as_str(),
                LifecycleStatus::Active,
                Some(5),
                Some("cover/v.png"),
                now,
            )
            .await
            .unwrap();
        assert!(updated);

        // A late failure report loses the race and changes nothing.
        let late = store
            .finish_transfer(
                "u1",
                record.file_id.as_str(),
                LifecycleStatus::TransferFailed,
                None,
                None,
                now,
            )
            .await
            .unwrap();
        assert!(!late);

        let row = store
            .get_file("u1", record.file_id.as_str())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.lifecycle, "active");
        assert_eq!(row.size, Some(5));
        assert_eq!(row.cover.as_deref(), Some("cover/v.png"));
    }

    #[tokio::test]
    async fn test_commit_file_runs_hooks_after_commit() {
        let (_dir, store) = build_store().await;
        let record = sample_record("u1", "a.txt", b"hello");
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        let commit = FileCommit::new(&record, 5).on_commit(move || {
            flag.store(true, Ordering::SeqCst);
        });
        store.commit_file(commit).await.unwrap();

        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(store.used_space("u1").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_commit_file_failure_drops_hooks() {
        let (_dir, store) = build_store().await;
        let record = sample_record("u1", "a.txt", b"hello");
        store.commit_file(FileCommit::new(&record, 5)).await.unwrap();

        // Same primary key: the insert fails, the hook must not fire and the
        // space increment must not land.
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let dup = FileCommit::new(&record, 5).on_commit(move || {
            flag.store(true, Ordering::SeqCst);
        });
        assert!(store.commit_file(dup).await.is_err());

        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(store.used_space("u1").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_find_active_by_hash_skips_unsettled() {
        let (_dir, store) = build_store().await;
        let record = sample_record("u1", "a.txt", b"dedup me");
        let hash_hex = record.content_hash.as_ref().map(|h| h.to_hex()).unwrap();
        store
            .insert_file(&FileRecordRow::from_record(&record))
            .await
            .unwrap();

        // Still transferring: not a dedup source.
        assert!(store.find_active_by_hash(&hash_hex).await.unwrap().is_none());

        store
            .finish_transfer(
                "u1",
                record.file_id.as_str(),
                LifecycleStatus::Active,
                Some(8),
                None,
                OffsetDateTime::now_utc(),
            )
            .await
            .unwrap();

        let found = store.find_active_by_hash(&hash_hex).await.unwrap().unwrap();
        assert_eq!(found.file_id, record.file_id.as_str());
    }

    #[tokio::test]
    async fn test_temp_bytes_accumulate() {
        let (_dir, store) = build_store().await;
        let hash = ContentHash::compute(b"t").to_hex();
        store.init_session(&sample_session("u1", &hash, 2)).await.unwrap();
        let now = OffsetDateTime::now_utc();

        store.add_temp_bytes("u1", &hash, 100, now).await.unwrap();
        store.add_temp_bytes("u1", &hash, 50, now).await.unwrap();

        let session = store.get_session("u1", &hash).await.unwrap().unwrap();
        assert_eq!(session.temp_bytes, 150);

        // Unknown session is an error, not a silent zero-row update.
        assert!(store.add_temp_bytes("u1", "nope", 1, now).await.is_err());
    }

    #[tokio::test]
    async fn test_clear_session_cascades_chunks() {
        let (_dir, store) = build_store().await;
        let hash = ContentHash::compute(b"c").to_hex();
        store.init_session(&sample_session("u1", &hash, 2)).await.unwrap();
        store.mark_chunk_done(&chunk("u1", &hash, 0, 10)).await.unwrap();
        store.mark_chunk_done(&chunk("u1", &hash, 1, 10)).await.unwrap();

        store.clear_session("u1", &hash).await.unwrap();

        assert!(store.get_session("u1", &hash).await.unwrap().is_none());
        assert_eq!(store.completed_count("u1", &hash).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_sessions() {
        let (_dir, store) = build_store().await;
        let now = OffsetDateTime::now_utc();

        let mut old = sample_session("u1", &ContentHash::compute(b"old").to_hex(), 1);
        old.expires_at = now - Duration::hours(1);
        store.init_session(&old).await.unwrap();

        let fresh = sample_session("u1", &ContentHash::compute(b"fresh").to_hex(), 1);
        store.init_session(&fresh).await.unwrap();

        let expired = store.expired_sessions(now, 10).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].content_hash, old.content_hash);
    }

    #[tokio::test]
    async fn test_recycle_and_purge_flow() {
        let (_dir, store) = build_store().await;
        let record = sample_record("u1", "bin.dat", b"recycle");
        store
            .insert_file(&FileRecordRow::from_record(&record))
            .await
            .unwrap();
        let now = OffsetDateTime::now_utc();

        assert!(store.recycle_file("u1", record.file_id.as_str(), now - Duration::days(11)).await.unwrap());
        // Double recycle is a no-op.
        assert!(!store.recycle_file("u1", record.file_id.as_str(), now).await.unwrap());

        let due = store.recycled_before(now - Duration::days(10), 200).await.unwrap();
        assert_eq!(due.len(), 1);

        assert!(store.mark_purged("u1", record.file_id.as_str(), now).await.unwrap());
        assert!(store.recycled_before(now, 200).await.unwrap().is_empty());

        // Purged rows no longer contribute warm-up hashes.
        assert!(store.active_hashes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_used_space_floor_at_zero() {
        let (_dir, store) = build_store().await;
        let now = OffsetDateTime::now_utc();
        store.add_used_space("u1", 100, now).await.unwrap();
        store.add_used_space("u1", -250, now).await.unwrap();
        assert_eq!(store.used_space("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_name_exists_scoped_to_folder() {
        let (_dir, store) = build_store().await;
        let record = sample_record("u1", "a.txt", b"x");
        store
            .insert_file(&FileRecordRow::from_record(&record))
            .await
            .unwrap();

        assert!(store.name_exists("u1", "0", "a.txt").await.unwrap());
        assert!(!store.name_exists("u1", "folder9", "a.txt").await.unwrap());
        assert!(!store.name_exists("u2", "0", "a.txt").await.unwrap());
    }
}
