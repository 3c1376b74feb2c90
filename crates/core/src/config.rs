//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// A single object storage backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to AWS_ACCESS_KEY_ID env var if not set.
        /// WARNING: Prefer env vars or IAM roles over storing secrets in config files.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to AWS_SECRET_ACCESS_KEY env var if not set.
        /// WARNING: Prefer env vars or IAM roles over storing secrets in config files.
        secret_access_key: Option<String>,
        /// Force path-style URLs (e.g., `endpoint/bucket/key` instead of `bucket.endpoint/key`).
        /// Required for MinIO and some S3-compatible services.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

impl BackendConfig {
    /// Validate backend configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            BackendConfig::S3 {
                access_key_id,
                secret_access_key,
                ..
            } => match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                (Some(_), Some(_)) | (None, None) => Ok(()),
                _ => Err(
                    "s3 config requires both access_key_id and secret_access_key when either is set"
                        .to_string(),
                ),
            },
            _ => Ok(()),
        }
    }
}

/// Storage configuration: a primary backend with an optional backup behind
/// the failover wrapper.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Primary backend. All traffic goes here while its circuit is closed.
    #[serde(default)]
    pub primary: BackendConfig,
    /// Optional backup backend. Reads and writes fall back here when the
    /// primary fails; deletes always go to both.
    pub backup: Option<BackendConfig>,
    /// Consecutive primary failures before the circuit opens and all traffic
    /// goes straight to the backup. An open circuit never closes on its own;
    /// an explicit reset is the only way back to the primary.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_failure_threshold() -> u32 {
    3
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            primary: BackendConfig::default(),
            backup: None,
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration.
    /// Returns warnings for configs that are allowed but degraded.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();

        self.primary.validate()?;
        if let Some(backup) = &self.backup {
            backup.validate()?;
        } else {
            warnings.push(
                "storage.backup is not set. Primary outages will surface directly \
                 to callers instead of failing over."
                    .to_string(),
            );
        }

        if self.failure_threshold == 0 {
            return Err("storage.failure_threshold cannot be 0. \
                 The circuit would be permanently open and the primary never used. \
                 Use a value >= 1."
                .to_string());
        }

        Ok(warnings)
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database.
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Query timeout in seconds (advisory only - SQLite cannot force-cancel queries).
        /// Logs warnings for queries exceeding this duration.
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(600) // 10 minutes (advisory only)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

/// Upload admission and session configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Directory for in-flight chunk temp dirs.
    #[serde(default = "default_temp_root")]
    pub temp_root: PathBuf,
    /// Concurrent upload permits per user.
    #[serde(default = "default_permits_per_user")]
    pub permits_per_user: u32,
    /// Maximum users tracked in the permit table before new users are denied.
    /// Prevents unbounded memory growth from id spraying.
    #[serde(default = "default_permit_table_capacity")]
    pub permit_table_capacity: u32,
    /// Seconds of inactivity before a user's permit entry is reclaimed.
    #[serde(default = "default_permit_idle_secs")]
    pub permit_idle_secs: u64,
    /// Interval in seconds between permit table cleanup sweeps.
    #[serde(default = "default_permit_cleanup_interval_secs")]
    pub permit_cleanup_interval_secs: u64,
    /// Resumable session time-to-live in seconds. Sessions not completed
    /// within this window are swept along with their temp dirs.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
}

fn default_temp_root() -> PathBuf {
    PathBuf::from("./data/temp")
}

fn default_permits_per_user() -> u32 {
    5
}

fn default_permit_table_capacity() -> u32 {
    10_000
}

fn default_permit_idle_secs() -> u64 {
    600 // 10 minutes
}

fn default_permit_cleanup_interval_secs() -> u64 {
    60
}

fn default_session_ttl_secs() -> u64 {
    604_800 // 7 days
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            temp_root: default_temp_root(),
            permits_per_user: default_permits_per_user(),
            permit_table_capacity: default_permit_table_capacity(),
            permit_idle_secs: default_permit_idle_secs(),
            permit_cleanup_interval_secs: default_permit_cleanup_interval_secs(),
            session_ttl_secs: default_session_ttl_secs(),
        }
    }
}

impl UploadConfig {
    /// Get the session TTL as a Duration.
    pub fn session_ttl(&self) -> Duration {
        let secs = i64::try_from(self.session_ttl_secs).unwrap_or(i64::MAX);
        Duration::seconds(secs)
    }

    /// Get the permit idle window as a std::time::Duration.
    pub fn permit_idle(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.permit_idle_secs)
    }

    /// Get the permit cleanup interval as a std::time::Duration.
    pub fn permit_cleanup_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.permit_cleanup_interval_secs)
    }

    /// Validate upload configuration.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();

        if self.permits_per_user == 0 {
            return Err("upload.permits_per_user cannot be 0. \
                 Every upload attempt would be denied admission. \
                 Use a value >= 1."
                .to_string());
        }

        if self.permit_cleanup_interval_secs == 0 {
            return Err("upload.permit_cleanup_interval_secs cannot be 0. \
                 This would cause a panic when creating the cleanup timer. \
                 Use a value >= 1 second."
                .to_string());
        }

        if self.session_ttl_secs < 3600 {
            warnings.push(format!(
                "upload.session_ttl_secs={} is very short. \
                 Interrupted uploads lose their resume state quickly and \
                 must restart from the first chunk.",
                self.session_ttl_secs
            ));
        }

        Ok(warnings)
    }
}

/// Multi-tier cache configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum entries in the in-process L1 tier.
    #[serde(default = "default_l1_capacity")]
    pub l1_capacity: u32,
    /// Maximum entries in the in-process shared tier.
    #[serde(default = "default_l2_capacity")]
    pub l2_capacity: u32,
    /// Baseline TTL in seconds for cached values.
    #[serde(default = "default_value_ttl_secs")]
    pub value_ttl_secs: u64,
    /// TTL in seconds for null markers recorded on a confirmed miss.
    /// Guards the backing store against repeated lookups of absent keys.
    #[serde(default = "default_null_ttl_secs")]
    pub null_ttl_secs: u64,
    /// Upper bound in seconds of the random jitter added to every TTL so
    /// entries written together do not expire together.
    #[serde(default = "default_ttl_jitter_secs")]
    pub ttl_jitter_secs: u64,
    /// TTL in seconds for hash-to-file pointer entries used by dedup.
    #[serde(default = "default_pointer_ttl_secs")]
    pub pointer_ttl_secs: u64,
    /// Auto-expiry in seconds of the per-key load lock (breakdown guard).
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Backoff in milliseconds between retries when losing the load lock.
    #[serde(default = "default_lock_retry_ms")]
    pub lock_retry_ms: u64,
    /// Maximum lookup retries after losing the load lock before loading
    /// directly without it.
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,
    /// Interval in seconds between cleanup sweeps of expired entries.
    #[serde(default = "default_cache_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_l1_capacity() -> u32 {
    10_000
}

fn default_l2_capacity() -> u32 {
    100_000
}

fn default_value_ttl_secs() -> u64 {
    3600 // 1 hour
}

fn default_null_ttl_secs() -> u64 {
    300 // 5 minutes
}

fn default_ttl_jitter_secs() -> u64 {
    300
}

fn default_pointer_ttl_secs() -> u64 {
    604_800 // 7 days
}

fn default_lock_ttl_secs() -> u64 {
    10
}

fn default_lock_retry_ms() -> u64 {
    50
}

fn default_lock_retries() -> u32 {
    3
}

fn default_cache_cleanup_interval_secs() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: default_l1_capacity(),
            l2_capacity: default_l2_capacity(),
            value_ttl_secs: default_value_ttl_secs(),
            null_ttl_secs: default_null_ttl_secs(),
            ttl_jitter_secs: default_ttl_jitter_secs(),
            pointer_ttl_secs: default_pointer_ttl_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
            lock_retry_ms: default_lock_retry_ms(),
            lock_retries: default_lock_retries(),
            cleanup_interval_secs: default_cache_cleanup_interval_secs(),
        }
    }
}

impl CacheConfig {
    /// Get the value TTL as a std::time::Duration.
    pub fn value_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.value_ttl_secs)
    }

    /// Get the null marker TTL as a std::time::Duration.
    pub fn null_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.null_ttl_secs)
    }

    /// Get the pointer TTL as a std::time::Duration.
    pub fn pointer_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.pointer_ttl_secs)
    }

    /// Validate cache configuration.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();

        if self.cleanup_interval_secs == 0 {
            return Err("cache.cleanup_interval_secs cannot be 0. \
                 This would cause a panic when creating the cleanup timer. \
                 Use a value >= 1 second."
                .to_string());
        }

        if self.null_ttl_secs == 0 {
            warnings.push(
                "cache.null_ttl_secs=0 disables the penetration guard. \
                 Repeated lookups of absent keys will hit the metadata store \
                 every time."
                    .to_string(),
            );
        }

        if self.lock_ttl_secs == 0 {
            return Err("cache.lock_ttl_secs cannot be 0. \
                 A crashed holder would leave the load lock stuck forever. \
                 Use a value >= 1 second."
                .to_string());
        }

        Ok(warnings)
    }
}

/// Transcode pipeline configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TranscodeConfig {
    /// Path to the ffmpeg binary.
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// Path to the ffprobe binary (used to read source image dimensions).
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    /// Target width in pixels for thumbnails and poster frames.
    #[serde(default = "default_thumbnail_width")]
    pub thumbnail_width: u32,
    /// Segment length in seconds for video playlist slicing.
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u32,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_thumbnail_width() -> u32 {
    150
}

fn default_segment_seconds() -> u32 {
    30
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            thumbnail_width: default_thumbnail_width(),
            segment_seconds: default_segment_seconds(),
        }
    }
}

impl TranscodeConfig {
    /// Validate transcode configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.segment_seconds == 0 {
            return Err("transcode.segment_seconds cannot be 0. \
                 ffmpeg rejects a zero segment_time. Use a value >= 1 second."
                .to_string());
        }
        if self.thumbnail_width == 0 {
            return Err("transcode.thumbnail_width cannot be 0.".to_string());
        }
        Ok(())
    }
}

/// Maintenance sweep configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Interval in seconds between sweep runs.
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
    /// Age in seconds past which a temp chunk dir with no live session is
    /// deleted.
    #[serde(default = "default_temp_stale_secs")]
    pub temp_stale_secs: u64,
    /// Seconds a recycled record is retained before the purge sweep removes
    /// it and its backend objects.
    #[serde(default = "default_recycle_retention_secs")]
    pub recycle_retention_secs: u64,
    /// Records purged per batch.
    #[serde(default = "default_purge_batch_size")]
    pub purge_batch_size: u32,
    /// Maximum purge batches per sweep run. Bounds a single run on very
    /// large backlogs; the next run continues where this one stopped.
    #[serde(default = "default_purge_max_rounds")]
    pub purge_max_rounds: u32,
}

fn default_sweep_interval_secs() -> u64 {
    3600 // 1 hour
}

fn default_temp_stale_secs() -> u64 {
    86_400 // 24 hours
}

fn default_recycle_retention_secs() -> u64 {
    864_000 // 10 days
}

fn default_purge_batch_size() -> u32 {
    200
}

fn default_purge_max_rounds() -> u32 {
    2000
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval_secs(),
            temp_stale_secs: default_temp_stale_secs(),
            recycle_retention_secs: default_recycle_retention_secs(),
            purge_batch_size: default_purge_batch_size(),
            purge_max_rounds: default_purge_max_rounds(),
        }
    }
}

impl SweepConfig {
    /// Get the sweep interval as a std::time::Duration.
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs)
    }

    /// Get the recycle retention window as a Duration.
    pub fn recycle_retention(&self) -> Duration {
        let secs = i64::try_from(self.recycle_retention_secs).unwrap_or(i64::MAX);
        Duration::seconds(secs)
    }

    /// Validate sweep configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.interval_secs == 0 {
            return Err("sweep.interval_secs cannot be 0. \
                 This would cause a panic when creating the sweep timer. \
                 Use a value >= 1 second."
                .to_string());
        }
        if self.purge_batch_size == 0 {
            return Err("sweep.purge_batch_size cannot be 0. \
                 The purge sweep would loop without making progress."
                .to_string());
        }
        Ok(())
    }
}

/// Account quota configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Default total space in bytes granted to an account when the request
    /// context does not carry a tenant-specific limit.
    #[serde(default = "default_total_bytes")]
    pub default_total_bytes: i64,
}

fn default_total_bytes() -> i64 {
    10 * 1024 * 1024 * 1024 // 10 GiB
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_total_bytes: default_total_bytes(),
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Metadata store configuration.
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Upload admission and session configuration.
    #[serde(default)]
    pub upload: UploadConfig,
    /// Multi-tier cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Transcode pipeline configuration.
    #[serde(default)]
    pub transcode: TranscodeConfig,
    /// Maintenance sweep configuration.
    #[serde(default)]
    pub sweep: SweepConfig,
    /// Account quota configuration.
    #[serde(default)]
    pub quota: QuotaConfig,
}

impl AppConfig {
    /// Validate the whole configuration.
    /// Returns warnings for settings that are allowed but degraded,
    /// and errors for settings that would break at runtime.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();
        warnings.extend(self.storage.validate()?);
        warnings.extend(self.upload.validate()?);
        warnings.extend(self.cache.validate()?);
        self.transcode.validate()?;
        self.sweep.validate()?;
        Ok(warnings)
    }

    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Uses filesystem storage and SQLite metadata.
    pub fn for_testing() -> Self {
        Self::default()
    }
}
