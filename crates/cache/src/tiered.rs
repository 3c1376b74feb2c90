//! Two-tier read-through cache.
//!
//! [`TieredCache`] layers a per-process L1 map over a [`SharedTier`] and
//! fills misses through a caller-supplied loader. Absent entities are
//! cached as null markers on a short TTL so repeated lookups for ids that
//! do not exist never reach the backing store. Concurrent misses for the
//! same key elect a single loader through a tier-level lock; the rest wait
//! briefly and pick up the freshly cached value.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use depot_core::config::CacheConfig;
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CacheError, CacheResult};
use crate::tier::SharedTier;

#[derive(Debug, Clone)]
struct L1Entry<T> {
    /// `None` caches the fact that the entity does not exist.
    value: Option<T>,
    expires_at: Instant,
}

impl<T> L1Entry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// Named two-tier cache for one entity type.
///
/// Keys are derived from an entity id scoped by an owner id, so identical
/// entity ids under different owners never collide. Values round-trip
/// through the shared tier as JSON; `T` must not itself serialize as JSON
/// `null`, which is reserved for the absent-entity marker.
pub struct TieredCache<T> {
    name: &'static str,
    l1: DashMap<String, L1Entry<T>>,
    l1_capacity: usize,
    tier: Arc<dyn SharedTier>,
    value_ttl: Duration,
    null_ttl: Duration,
    jitter_secs: u64,
    lock_ttl: Duration,
    lock_retry: Duration,
    lock_retries: u32,
}

impl<T> TieredCache<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(name: &'static str, tier: Arc<dyn SharedTier>, config: &CacheConfig) -> Self {
        Self {
            name,
            l1: DashMap::new(),
            l1_capacity: config.l1_capacity as usize,
            tier,
            value_ttl: config.value_ttl(),
            null_ttl: config.null_ttl(),
            jitter_secs: config.ttl_jitter_secs,
            lock_ttl: Duration::from_secs(config.lock_ttl_secs),
            lock_retry: Duration::from_millis(config.lock_retry_ms),
            lock_retries: config.lock_retries,
        }
    }

    /// Override the value TTL, for caches whose entries outlive the
    /// default (dedup pointers, for instance).
    pub fn with_value_ttl(mut self, ttl: Duration) -> Self {
        self.value_ttl = ttl;
        self
    }

    fn key(&self, entity_id: &str, scope_id: &str) -> String {
        format!("{}:{}:{}", self.name, scope_id, entity_id)
    }

    fn lock_key(key: &str) -> String {
        format!("lock:{key}")
    }

    /// Spread expirations out so entries cached together do not all fall
    /// out of the tier in the same instant.
    fn jittered(&self, base: Duration) -> Duration {
        if self.jitter_secs == 0 {
            return base;
        }
        base + Duration::from_secs(rand::rng().random_range(0..=self.jitter_secs))
    }

    fn l1_get(&self, key: &str) -> Option<Option<T>> {
        let now = Instant::now();
        match self.l1.get(key) {
            None => None,
            Some(entry) if entry.is_expired(now) => {
                drop(entry);
                self.l1.remove_if(key, |_, e| e.is_expired(now));
                None
            }
            Some(entry) => Some(entry.value.clone()),
        }
    }

    fn l1_insert(&self, key: String, value: Option<T>, ttl: Duration) {
        if !self.l1.contains_key(&key) && self.l1.len() >= self.l1_capacity {
            self.sweep_l1();
            if self.l1.len() >= self.l1_capacity {
                // L1 is best-effort; the shared tier still holds the entry.
                return;
            }
        }
        self.l1.insert(
            key,
            L1Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn sweep_l1(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = self
            .l1
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for key in stale {
            if self.l1.remove_if(&key, |_, e| e.is_expired(now)).is_some() {
                evicted += 1;
            }
        }
        evicted
    }

    /// Probe the shared tier, writing hits back into L1. Outer `None`
    /// means the tier has no entry; `Some(None)` is a cached null marker.
    async fn tier_probe(&self, key: &str) -> CacheResult<Option<Option<T>>> {
        let Some(raw) = self.tier.get(key).await? else {
            return Ok(None);
        };
        let value: Option<T> = serde_json::from_str(&raw)?;
        let ttl = if value.is_some() {
            self.jittered(self.value_ttl)
        } else {
            self.null_ttl
        };
        self.l1_insert(key.to_string(), value.clone(), ttl);
        Ok(Some(value))
    }

    /// Write a value through both tiers. Tier write failures are logged
    /// and swallowed so a degraded shared tier never fails a read path.
    async fn write_through(&self, key: &str, value: &Option<T>) -> CacheResult<()> {
        let encoded = serde_json::to_string(value)?;
        let ttl = if value.is_some() {
            self.jittered(self.value_ttl)
        } else {
            self.null_ttl
        };
        if let Err(err) = self.tier.set(key, encoded, ttl).await {
            tracing::warn!(cache = self.name, key, error = %err, "shared tier write failed");
        }
        self.l1_insert(key.to_string(), value.clone(), ttl);
        Ok(())
    }

    /// Fetch an entity, filling misses through `loader`.
    ///
    /// The loader's `Ok(None)` is cached as a null marker on the null TTL,
    /// so hammering a nonexistent id does not hammer the backing store.
    /// Loader errors propagate to the caller and are never cached.
    pub async fn get_or_load<F, Fut>(
        &self,
        entity_id: &str,
        scope_id: &str,
        loader: F,
    ) -> CacheResult<Option<T>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = CacheResult<Option<T>>>,
    {
        let key = self.key(entity_id, scope_id);
        if let Some(hit) = self.l1_get(&key) {
            return Ok(hit);
        }
        if let Some(hit) = self.tier_probe(&key).await? {
            return Ok(hit);
        }

        let lock_key = Self::lock_key(&key);
        for _ in 0..=self.lock_retries {
            let acquired = self
                .tier
                .set_if_absent(&lock_key, "1".to_string(), self.lock_ttl)
                .await?;
            if acquired {
                let result = async {
                    // Another loader may have filled the cache between our
                    // miss and the lock grant.
                    if let Some(hit) = self.l1_get(&key) {
                        return Ok(hit);
                    }
                    if let Some(hit) = self.tier_probe(&key).await? {
                        return Ok(hit);
                    }
                    let loaded = loader().await?;
                    self.write_through(&key, &loaded).await?;
                    Ok(loaded)
                }
                .await;

                // Release even when the load failed so waiters move on.
                if let Err(err) = self.tier.delete(&lock_key).await {
                    tracing::warn!(cache = self.name, key, error = %err, "breakdown lock release failed");
                }
                return result;
            }

            tokio::time::sleep(self.lock_retry).await;
            if let Some(hit) = self.l1_get(&key) {
                return Ok(hit);
            }
            if let Some(hit) = self.tier_probe(&key).await? {
                return Ok(hit);
            }
        }

        // Lock stayed contended past the retry budget. Load without it
        // rather than stall the caller; last writer wins.
        tracing::debug!(cache = self.name, key, "breakdown lock contended, loading directly");
        let loaded = loader().await?;
        self.write_through(&key, &loaded).await?;
        Ok(loaded)
    }

    /// Insert a known value, replacing whatever either tier holds.
    pub async fn store(&self, entity_id: &str, scope_id: &str, value: Option<T>) -> CacheResult<()> {
        let key = self.key(entity_id, scope_id);
        self.write_through(&key, &value).await
    }

    /// Drop an entity from both tiers. The next read goes to the loader.
    pub async fn evict(&self, entity_id: &str, scope_id: &str) -> CacheResult<()> {
        let key = self.key(entity_id, scope_id);
        self.l1.remove(&key);
        self.tier.delete(&key).await
    }

    pub fn l1_len(&self) -> usize {
        self.l1.len()
    }
}
