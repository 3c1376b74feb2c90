//! Upload admission control.
//!
//! Two gates sit in front of the chunk path. [`AdmissionControl`] caps
//! concurrent uploads per user with a bounded in-process permit table;
//! it never blocks, and a denial means "retry later". [`QuotaGate`]
//! checks the account's space limit against cached used-space before any
//! bytes land.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use depot_cache::{CacheError, SharedTier, TieredCache};
use depot_core::config::{CacheConfig, UploadConfig};
use depot_core::context::RequestContext;
use depot_metadata::{FileRepo, MetadataStore};

use crate::error::{EngineError, EngineResult};
use crate::metrics;

struct PermitEntry {
    in_flight: u32,
    last_touch: Instant,
}

struct AdmissionInner {
    entries: DashMap<String, PermitEntry>,
    permits_per_user: u32,
    table_capacity: usize,
    idle_window: Duration,
    warned_capacity: AtomicBool,
}

/// Per-user upload permit table.
///
/// The table is capacity-capped so an id-spraying client cannot grow it
/// without bound; entries idle past the configured window are reclaimed
/// by [`cleanup`](Self::cleanup), which the daemon runs periodically.
#[derive(Clone)]
pub struct AdmissionControl {
    inner: Arc<AdmissionInner>,
}

impl AdmissionControl {
    pub fn new(config: &UploadConfig) -> Self {
        Self {
            inner: Arc::new(AdmissionInner {
                entries: DashMap::new(),
                permits_per_user: config.permits_per_user,
                table_capacity: config.permit_table_capacity as usize,
                idle_window: config.permit_idle(),
                warned_capacity: AtomicBool::new(false),
            }),
        }
    }

    /// Try to take one upload permit for this user. Returns `None` when
    /// the user is at their concurrency limit or the table is full.
    pub fn try_acquire(&self, user_id: &str) -> Option<PermitGuard> {
        let now = Instant::now();

        // DashMap's len() iterates all shards and can deadlock while an
        // entry lock is held, so the capacity check comes first.
        if !self.inner.entries.contains_key(user_id)
            && self.inner.entries.len() >= self.inner.table_capacity
        {
            self.cleanup();
            if self.inner.entries.len() >= self.inner.table_capacity {
                self.warn_at_capacity();
                metrics::UPLOADS_DENIED.inc();
                return None;
            }
        }

        let admitted = match self.inner.entries.entry(user_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.last_touch = now;
                if entry.in_flight >= self.inner.permits_per_user {
                    false
                } else {
                    entry.in_flight += 1;
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PermitEntry {
                    in_flight: 1,
                    last_touch: now,
                });
                true
            }
        };

        if admitted {
            metrics::UPLOADS_ADMITTED.inc();
            metrics::ACTIVE_PERMITS.inc();
            Some(PermitGuard {
                control: self.clone(),
                user_id: user_id.to_string(),
            })
        } else {
            metrics::UPLOADS_DENIED.inc();
            None
        }
    }

    fn release(&self, user_id: &str) {
        if let Some(mut entry) = self.inner.entries.get_mut(user_id) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
            entry.last_touch = Instant::now();
        }
        metrics::ACTIVE_PERMITS.dec();
    }

    /// Reclaim idle entries with no permits in flight. Returns the number
    /// removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let idle_window = self.inner.idle_window;
        let stale: Vec<String> = self
            .inner
            .entries
            .iter()
            .filter(|entry| {
                entry.value().in_flight == 0
                    && now.duration_since(entry.value().last_touch) >= idle_window
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for key in stale {
            // Re-check under the entry lock: the user may have acquired a
            // permit between the scan and the removal.
            if self
                .inner
                .entries
                .remove_if(&key, |_, entry| {
                    entry.in_flight == 0 && now.duration_since(entry.last_touch) >= idle_window
                })
                .is_some()
            {
                evicted += 1;
            }
        }
        evicted
    }

    /// Number of users currently tracked.
    pub fn user_count(&self) -> usize {
        self.inner.entries.len()
    }

    fn warn_at_capacity(&self) {
        if !self.inner.warned_capacity.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                table_capacity = self.inner.table_capacity,
                "admission table at capacity, denying uploads from new users"
            );
        }
    }
}

/// Holds one upload permit; dropping it releases the permit.
#[must_use = "dropping the guard releases the permit"]
pub struct PermitGuard {
    control: AdmissionControl,
    user_id: String,
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        self.control.release(&self.user_id);
    }
}

/// Spawn a background task reclaiming idle admission entries.
pub fn spawn_cleanup_task(
    control: AdmissionControl,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let evicted = control.cleanup();
            if evicted > 0 {
                tracing::debug!(
                    evicted,
                    remaining = control.user_count(),
                    "reclaimed idle admission entries"
                );
            }
        }
    })
}

/// Account space-limit gate.
///
/// Used-space reads ride the tiered cache with a metadata-aggregate
/// loader; commit paths call [`invalidate`](Self::invalidate) so the next
/// check sees fresh usage.
pub struct QuotaGate {
    metadata: Arc<dyn MetadataStore>,
    space: TieredCache<i64>,
}

impl QuotaGate {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        tier: Arc<dyn SharedTier>,
        cache_config: &CacheConfig,
    ) -> Self {
        Self {
            metadata,
            space: TieredCache::new("space", tier, cache_config),
        }
    }

    /// Bytes currently charged to the account, via the cache.
    pub async fn used_space(&self, user_id: &str) -> EngineResult<i64> {
        let metadata = Arc::clone(&self.metadata);
        let owner = user_id.to_string();
        let cached = self
            .space
            .get_or_load("used", user_id, || {
                let metadata = Arc::clone(&metadata);
                let owner = owner.clone();
                async move {
                    let bytes = metadata
                        .used_space(&owner)
                        .await
                        .map_err(|e| CacheError::Loader(e.to_string()))?;
                    Ok(Some(bytes))
                }
            })
            .await?;
        Ok(cached.unwrap_or(0))
    }

    /// Fail with `QuotaExceeded` when charging `additional` bytes would
    /// push the account past its limit. Exactly reaching the limit passes.
    pub async fn check(&self, ctx: &RequestContext, additional: i64) -> EngineResult<()> {
        let used = self.used_space(&ctx.user_id).await?;
        if used + additional > ctx.quota_bytes {
            return Err(EngineError::QuotaExceeded {
                needed: additional,
                available: (ctx.quota_bytes - used).max(0),
            });
        }
        Ok(())
    }

    /// Drop the cached usage for an account. Every path that changes
    /// used space calls this after the change lands.
    pub async fn invalidate(&self, user_id: &str) -> EngineResult<()> {
        self.space.evict("used", user_id).await?;
        Ok(())
    }
}
