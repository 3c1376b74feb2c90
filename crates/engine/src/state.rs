//! Engine state shared across the service.

use std::sync::Arc;
use std::time::Duration;

use depot_cache::{MemoryTier, TieredCache, tier_from_config};
use depot_core::config::AppConfig;
use depot_core::{FileRecord, RequestContext};
use depot_metadata::MetadataStore;
use depot_storage::StorageBackend;
use tokio::task::JoinHandle;

use crate::admission::{AdmissionControl, QuotaGate};
use crate::dedup::DedupIndex;
use crate::orchestrator::UploadOrchestrator;
use crate::sweep::MaintenanceSweeps;
use crate::tracker::UploadTracker;
use crate::transcode::TranscodePipeline;

/// Shared engine state.
///
/// Owns every pipeline component and the shared cache tier they sit on.
/// Cloning is cheap; all fields are reference-counted.
#[derive(Clone)]
pub struct EngineState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Object storage backend.
    pub storage: Arc<dyn StorageBackend>,
    /// Metadata store.
    pub metadata: Arc<dyn MetadataStore>,
    /// Shared cache tier behind every [`TieredCache`].
    pub tier: Arc<MemoryTier>,
    /// Per-user concurrent upload admission.
    pub admission: AdmissionControl,
    /// Account space accounting.
    pub quota: Arc<QuotaGate>,
    /// Upload session and chunk progress tracking.
    pub tracker: Arc<UploadTracker>,
    /// Content-hash dedup index.
    pub dedup: Arc<DedupIndex>,
    /// File record cache.
    pub records: Arc<TieredCache<FileRecord>>,
    /// Media post-processing pipeline.
    pub transcode: Arc<TranscodePipeline>,
    /// The chunk upload pipeline.
    pub orchestrator: Arc<UploadOrchestrator>,
    /// Periodic maintenance sweeps.
    pub sweeps: Arc<MaintenanceSweeps>,
}

impl EngineState {
    /// Create the engine state and wire every component.
    ///
    /// This performs configuration validation and logs warnings for
    /// degraded but allowed settings.
    ///
    /// # Panics
    ///
    /// Panics if configuration validation fails with an error.
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn StorageBackend>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        match config.validate() {
            Ok(warnings) => {
                for warning in warnings {
                    tracing::warn!("Configuration warning: {}", warning);
                }
            }
            Err(error) => {
                panic!("Invalid configuration: {}", error);
            }
        }

        let tier = tier_from_config(&config.cache);
        let admission = AdmissionControl::new(&config.upload);
        let quota = Arc::new(QuotaGate::new(
            metadata.clone(),
            tier.clone(),
            &config.cache,
        ));
        let tracker = Arc::new(UploadTracker::new(
            metadata.clone(),
            tier.clone(),
            &config.upload,
        ));
        let dedup = Arc::new(DedupIndex::new(
            metadata.clone(),
            tier.clone(),
            &config.cache,
        ));
        let records = Arc::new(TieredCache::new("file", tier.clone(), &config.cache));
        let transcode = Arc::new(TranscodePipeline::new(
            config.transcode.clone(),
            storage.clone(),
            metadata.clone(),
            records.clone(),
        ));
        let orchestrator = Arc::new(UploadOrchestrator::new(
            &config.upload,
            admission.clone(),
            quota.clone(),
            tracker.clone(),
            dedup.clone(),
            storage.clone(),
            metadata.clone(),
            records.clone(),
            transcode.clone(),
        ));
        let sweeps = Arc::new(MaintenanceSweeps::new(
            config.sweep.clone(),
            config.upload.temp_root.clone(),
            metadata.clone(),
            storage.clone(),
            tracker.clone(),
            dedup.clone(),
            quota.clone(),
            records.clone(),
        ));

        Self {
            config: Arc::new(config),
            storage,
            metadata,
            tier,
            admission,
            quota,
            tracker,
            dedup,
            records,
            transcode,
            orchestrator,
            sweeps,
        }
    }

    /// A request context for `user_id` carrying the default quota.
    ///
    /// Tenant-specific limits come from the caller; this covers accounts
    /// without one.
    pub fn request_context(&self, user_id: impl Into<String>) -> RequestContext {
        RequestContext::new(user_id, self.config.quota.default_total_bytes)
    }

    /// Spawn the periodic background tasks: permit table cleanup, cache
    /// tier cleanup, and the maintenance sweeps.
    ///
    /// The handles keep running until aborted or the runtime shuts down.
    pub fn spawn_background_tasks(&self) -> Vec<JoinHandle<()>> {
        vec![
            crate::admission::spawn_cleanup_task(
                self.admission.clone(),
                self.config.upload.permit_cleanup_interval(),
            ),
            depot_cache::spawn_cleanup_task(
                self.tier.clone(),
                Duration::from_secs(self.config.cache.cleanup_interval_secs),
            ),
            crate::sweep::spawn_sweeps(self.sweeps.clone(), self.config.sweep.interval()),
        ]
    }
}
