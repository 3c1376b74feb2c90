//! Post-commit transcode pipeline.
//!
//! Runs after a file commits in the `Transferring` state and settles its
//! lifecycle. Videos are remuxed to a transport stream, sliced into an
//! HLS playlist, and given a poster frame; images get a thumbnail unless
//! the source is already narrow enough. Derived objects live next to the
//! primary object under file-id-suffixed keys, so purging one record can
//! always remove its derivatives even when the primary bytes are shared.
//!
//! Every outcome, success or failure, goes through the guarded
//! `finish_transfer` so a transfer is settled exactly once.

use std::path::Path;
use std::sync::Arc;

use depot_core::config::TranscodeConfig;
use depot_core::{FileCategory, FileId, FileRecord, LifecycleStatus};
use depot_metadata::{FileRepo, MetadataStore};
use depot_storage::StorageBackend;
use time::OffsetDateTime;

use depot_cache::TieredCache;

use crate::error::{EngineError, EngineResult};
use crate::metrics;

/// Storage key of the cover image derived for a record.
pub(crate) fn cover_key(path_key: &str, file_id: &str) -> String {
    match path_key.rsplit_once('/') {
        Some((dir, _)) => format!("{dir}/{file_id}_.png"),
        None => format!("{file_id}_.png"),
    }
}

/// Storage prefix of the HLS playlist and segments derived for a record.
pub(crate) fn hls_prefix(path_key: &str, file_id: &str) -> String {
    match path_key.rsplit_once('/') {
        Some((dir, _)) => format!("{dir}/{file_id}_hls"),
        None => format!("{file_id}_hls"),
    }
}

fn remux_args(source: &Path, dest: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-i".into(),
        source.display().to_string(),
        "-vcodec".into(),
        "copy".into(),
        "-acodec".into(),
        "copy".into(),
        "-vbsf".into(),
        "h264_mp4toannexb".into(),
        dest.display().to_string(),
    ]
}

fn segment_args(ts: &Path, playlist: &Path, pattern: &Path, seconds: u32) -> Vec<String> {
    vec![
        "-y".into(),
        "-i".into(),
        ts.display().to_string(),
        "-c".into(),
        "copy".into(),
        "-map".into(),
        "0".into(),
        "-f".into(),
        "segment".into(),
        "-segment_list".into(),
        playlist.display().to_string(),
        "-segment_time".into(),
        seconds.to_string(),
        pattern.display().to_string(),
    ]
}

fn poster_args(source: &Path, width: u32, dest: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-i".into(),
        source.display().to_string(),
        "-vframes".into(),
        "1".into(),
        "-vf".into(),
        format!("scale={width}:{width}/a"),
        dest.display().to_string(),
    ]
}

fn thumbnail_args(source: &Path, width: u32, dest: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-i".into(),
        source.display().to_string(),
        "-vf".into(),
        format!("scale={width}:{width}/a"),
        dest.display().to_string(),
    ]
}

fn probe_args(source: &Path) -> Vec<String> {
    vec![
        "-v".into(),
        "error".into(),
        "-select_streams".into(),
        "v:0".into(),
        "-show_entries".into(),
        "stream=width".into(),
        "-of".into(),
        "csv=p=0".into(),
        source.display().to_string(),
    ]
}

async fn run_tool(program: &str, args: &[String]) -> EngineResult<Vec<u8>> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| EngineError::Transcode(format!("{program}: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr
            .lines()
            .filter(|line| !line.trim().is_empty())
            .next_back()
            .unwrap_or("no stderr");
        return Err(EngineError::Transcode(format!(
            "{program} exited with {}: {detail}",
            output.status
        )));
    }
    Ok(output.stdout)
}

pub struct TranscodePipeline {
    config: TranscodeConfig,
    storage: Arc<dyn StorageBackend>,
    metadata: Arc<dyn MetadataStore>,
    records: Arc<TieredCache<FileRecord>>,
}

impl TranscodePipeline {
    pub fn new(
        config: TranscodeConfig,
        storage: Arc<dyn StorageBackend>,
        metadata: Arc<dyn MetadataStore>,
        records: Arc<TieredCache<FileRecord>>,
    ) -> Self {
        Self {
            config,
            storage,
            metadata,
            records,
        }
    }

    /// Derive assets for a just-committed record and settle its transfer.
    ///
    /// `source` is the assembled local file; it is removed afterwards in
    /// every case. Errors from the derivation itself mark the transfer
    /// failed rather than propagating.
    #[tracing::instrument(skip(self, source), fields(user = %user_id, file = %file_id))]
    pub async fn process(
        &self,
        user_id: &str,
        file_id: &FileId,
        source: &Path,
    ) -> EngineResult<()> {
        let timer = metrics::TRANSCODE_DURATION.start_timer();
        let outcome = self.derive(user_id, file_id, source).await;
        timer.observe_duration();

        let now = OffsetDateTime::now_utc();
        let settled = match outcome {
            Ok(cover) => {
                let size = tokio::fs::metadata(source)
                    .await
                    .ok()
                    .map(|m| m.len() as i64);
                self.metadata
                    .finish_transfer(
                        user_id,
                        file_id.as_str(),
                        LifecycleStatus::Active,
                        size,
                        cover.as_deref(),
                        now,
                    )
                    .await?
            }
            Err(error) => {
                tracing::warn!(%error, "transcode failed, marking the transfer failed");
                metrics::TRANSCODE_FAILURES.inc();
                self.metadata
                    .finish_transfer(
                        user_id,
                        file_id.as_str(),
                        LifecycleStatus::TransferFailed,
                        None,
                        None,
                        now,
                    )
                    .await?
            }
        };
        if !settled {
            tracing::debug!("transfer already settled elsewhere, skipped");
        }

        self.records.evict(file_id.as_str(), user_id).await?;
        if let Err(error) = tokio::fs::remove_file(source).await
            && error.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(%error, "failed to remove assembled source file");
        }
        Ok(())
    }

    async fn derive(
        &self,
        user_id: &str,
        file_id: &FileId,
        source: &Path,
    ) -> EngineResult<Option<String>> {
        let row = self
            .metadata
            .get_file(user_id, file_id.as_str())
            .await?
            .ok_or_else(|| {
                EngineError::Transcode(format!("record {file_id} vanished before transcode"))
            })?;
        let record = row.into_record()?;
        let Some(path_key) = record.path else {
            return Ok(None);
        };

        match record.category {
            FileCategory::Video => Ok(Some(self.derive_video(&path_key, file_id, source).await?)),
            FileCategory::Image => Ok(Some(self.derive_image(&path_key, file_id, source).await?)),
            _ => Ok(None),
        }
    }

    async fn derive_video(
        &self,
        path_key: &str,
        file_id: &FileId,
        source: &Path,
    ) -> EngineResult<String> {
        let work_dir = source.with_extension("work");
        tokio::fs::create_dir_all(&work_dir).await?;
        let result = self
            .derive_video_in(&work_dir, path_key, file_id, source)
            .await;
        if let Err(error) = tokio::fs::remove_dir_all(&work_dir).await {
            tracing::debug!(%error, "failed to remove transcode work dir");
        }
        result
    }

    async fn derive_video_in(
        &self,
        work_dir: &Path,
        path_key: &str,
        file_id: &FileId,
        source: &Path,
    ) -> EngineResult<String> {
        // Remux to a transport stream first; segmentation then runs
        // without re-encoding.
        let ts_path = work_dir.join("index.ts");
        run_tool(&self.config.ffmpeg_path, &remux_args(source, &ts_path)).await?;

        let hls_dir = work_dir.join("hls");
        tokio::fs::create_dir_all(&hls_dir).await?;
        let playlist = hls_dir.join("index.m3u8");
        let pattern = hls_dir.join("%04d.ts");
        run_tool(
            &self.config.ffmpeg_path,
            &segment_args(&ts_path, &playlist, &pattern, self.config.segment_seconds),
        )
        .await?;
        tokio::fs::remove_file(&ts_path).await?;

        let prefix = hls_prefix(path_key, file_id.as_str());
        let uploaded = self.storage.upload_dir(&prefix, &hls_dir).await?;
        tracing::debug!(uploaded, prefix, "uploaded playlist segments");

        let poster = work_dir.join("cover.png");
        run_tool(
            &self.config.ffmpeg_path,
            &poster_args(source, self.config.thumbnail_width, &poster),
        )
        .await?;
        let cover = cover_key(path_key, file_id.as_str());
        self.storage.upload(&cover, &poster).await?;
        Ok(cover)
    }

    async fn derive_image(
        &self,
        path_key: &str,
        file_id: &FileId,
        source: &Path,
    ) -> EngineResult<String> {
        let thumb = source.with_extension("thumb.png");

        // Sources already at or below the target width are used as-is.
        let width = self.probe_width(source).await?;
        if width <= self.config.thumbnail_width {
            tokio::fs::copy(source, &thumb).await?;
        } else {
            run_tool(
                &self.config.ffmpeg_path,
                &thumbnail_args(source, self.config.thumbnail_width, &thumb),
            )
            .await?;
        }

        let cover = cover_key(path_key, file_id.as_str());
        let uploaded = self.storage.upload(&cover, &thumb).await;
        if let Err(error) = tokio::fs::remove_file(&thumb).await {
            tracing::debug!(%error, "failed to remove thumbnail work file");
        }
        uploaded?;
        Ok(cover)
    }

    async fn probe_width(&self, source: &Path) -> EngineResult<u32> {
        let stdout = run_tool(&self.config.ffprobe_path, &probe_args(source)).await?;
        let text = String::from_utf8_lossy(&stdout);
        text.trim().parse::<u32>().map_err(|_| {
            EngineError::Transcode(format!("unparseable ffprobe width: {:?}", text.trim()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_cache::MemoryTier;
    use depot_core::config::CacheConfig;
    use depot_core::{ContentHash, ROOT_PARENT_ID};
    use depot_metadata::{FileRecordRow, SqliteStore};
    use depot_storage::FilesystemBackend;
    use tempfile::tempdir;

    #[test]
    fn remux_template_copies_streams_into_annexb() {
        let args = remux_args(Path::new("in.mp4"), Path::new("out.ts"));
        let joined = args.join(" ");
        assert_eq!(
            joined,
            "-y -i in.mp4 -vcodec copy -acodec copy -vbsf h264_mp4toannexb out.ts"
        );
    }

    #[test]
    fn segment_template_slices_without_reencoding() {
        let args = segment_args(
            Path::new("in.ts"),
            Path::new("hls/index.m3u8"),
            Path::new("hls/%04d.ts"),
            30,
        );
        let joined = args.join(" ");
        assert_eq!(
            joined,
            "-y -i in.ts -c copy -map 0 -f segment -segment_list hls/index.m3u8 \
             -segment_time 30 hls/%04d.ts"
        );
    }

    #[test]
    fn poster_template_grabs_one_scaled_frame() {
        let args = poster_args(Path::new("in.mp4"), 150, Path::new("cover.png"));
        let joined = args.join(" ");
        assert_eq!(joined, "-y -i in.mp4 -vframes 1 -vf scale=150:150/a cover.png");
    }

    #[test]
    fn derived_keys_sit_beside_the_primary_object() {
        assert_eq!(
            cover_key("202601/u1/deadbeef.mp4", "abc123XYZ0"),
            "202601/u1/abc123XYZ0_.png"
        );
        assert_eq!(
            hls_prefix("202601/u1/deadbeef.mp4", "abc123XYZ0"),
            "202601/u1/abc123XYZ0_hls"
        );
        assert_eq!(cover_key("bare", "abc123XYZ0"), "abc123XYZ0_.png");
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        pipeline: TranscodePipeline,
        store: Arc<SqliteStore>,
        source: std::path::PathBuf,
    }

    async fn fixture(file_name: &str, ffmpeg_path: &str) -> (Fixture, FileRecord) {
        let temp = tempdir().unwrap();
        let store = Arc::new(
            SqliteStore::new(temp.path().join("meta.db"), None)
                .await
                .unwrap(),
        );
        let storage: Arc<dyn StorageBackend> = Arc::new(
            FilesystemBackend::new(temp.path().join("objects"))
                .await
                .unwrap(),
        );
        let records = Arc::new(TieredCache::new(
            "file",
            MemoryTier::new(1024),
            &CacheConfig::default(),
        ));
        let pipeline = TranscodePipeline::new(
            TranscodeConfig {
                ffmpeg_path: ffmpeg_path.to_string(),
                ffprobe_path: ffmpeg_path.to_string(),
                ..TranscodeConfig::default()
            },
            storage,
            store.clone(),
            records,
        );

        let hash = ContentHash::compute(b"transcode fixture");
        let record = FileRecord::new_file(
            "u1",
            ROOT_PARENT_ID,
            file_name,
            hash,
            format!("202601/u1/{}", hash.to_hex()),
        );
        store
            .insert_file(&FileRecordRow::from_record(&record))
            .await
            .unwrap();

        let source = temp.path().join("assembled.merged");
        tokio::fs::write(&source, b"assembled bytes").await.unwrap();

        (
            Fixture {
                _temp: temp,
                pipeline,
                store,
                source,
            },
            record,
        )
    }

    #[tokio::test]
    async fn documents_settle_active_with_size_and_no_cover() {
        let (fx, record) = fixture("notes.txt", "ffmpeg").await;
        fx.pipeline
            .process("u1", &record.file_id, &fx.source)
            .await
            .unwrap();

        let row = fx
            .store
            .get_file("u1", record.file_id.as_str())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.lifecycle, "active");
        assert_eq!(row.size, Some(b"assembled bytes".len() as i64));
        assert_eq!(row.cover, None);
        assert!(!fx.source.exists());
    }

    #[tokio::test]
    async fn a_failing_tool_marks_the_transfer_failed() {
        let (fx, record) = fixture("clip.mp4", "/nonexistent/ffmpeg-binary").await;
        fx.pipeline
            .process("u1", &record.file_id, &fx.source)
            .await
            .unwrap();

        let row = fx
            .store
            .get_file("u1", record.file_id.as_str())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.lifecycle, "transfer_failed");
        assert_eq!(row.size, None);
        assert!(!fx.source.exists());
    }

    #[tokio::test]
    async fn a_vanished_record_settles_nothing_and_still_cleans_up() {
        let (fx, _record) = fixture("notes.txt", "ffmpeg").await;
        let ghost = FileId::new("gh0st12345").unwrap();
        fx.pipeline
            .process("u1", &ghost, &fx.source)
            .await
            .unwrap();
        assert!(!fx.source.exists());
    }
}
