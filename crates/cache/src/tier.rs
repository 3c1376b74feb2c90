//! Shared cache tier.
//!
//! [`SharedTier`] is the slower, wider tier sitting behind the per-process
//! L1 map: a string keyspace with TTLs, counters, and membership sets. The
//! in-process [`MemoryTier`] is the default implementation; a networked
//! store can be dropped in behind the same trait without touching callers.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::{CacheError, CacheResult};

/// Shared tier operations.
///
/// Values are strings; callers serialize structured data before storing.
/// Every write carries a TTL and expired entries read as absent.
#[async_trait]
pub trait SharedTier: Send + Sync + 'static {
    /// Fetch a value. Returns `None` when the key is missing or expired.
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Store a value with a TTL, replacing any existing entry.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()>;

    /// Store a value only if the key is absent. Returns `true` when the
    /// write happened. Expired entries count as absent.
    async fn set_if_absent(&self, key: &str, value: String, ttl: Duration) -> CacheResult<bool>;

    /// Remove a key. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Add `delta` to a counter, creating it at `delta` when absent, and
    /// return the new total. The TTL is refreshed on every call.
    async fn incr(&self, key: &str, delta: i64, ttl: Duration) -> CacheResult<i64>;

    /// Add a member to a set, creating the set when absent. The TTL is
    /// refreshed on every call.
    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> CacheResult<()>;

    /// Whether a set contains a member. Missing or expired sets contain
    /// nothing.
    async fn set_contains(&self, key: &str, member: &str) -> CacheResult<bool>;
}

#[derive(Debug, Clone)]
enum TierValue {
    Value(String),
    Counter(i64),
    Set(HashSet<String>),
}

impl TierValue {
    fn kind(&self) -> &'static str {
        match self {
            TierValue::Value(_) => "value",
            TierValue::Counter(_) => "counter",
            TierValue::Set(_) => "set",
        }
    }
}

#[derive(Debug)]
struct TierEntry {
    value: TierValue,
    expires_at: Instant,
}

impl TierEntry {
    fn new(value: TierValue, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// In-process shared tier backed by a concurrent map.
///
/// Capacity-bounded: once `max_entries` live keys exist, writes that would
/// insert a new key sweep expired entries first and fail if the map is
/// still full. Existing keys can always be updated.
pub struct MemoryTier {
    entries: DashMap<String, TierEntry>,
    max_entries: usize,
    capacity_warning: AtomicBool,
}

impl MemoryTier {
    pub fn new(max_entries: usize) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            max_entries,
            capacity_warning: AtomicBool::new(false),
        })
    }

    /// Make room for one new key. Returns `false` when the tier is full
    /// even after sweeping expired entries.
    ///
    /// Must be called before taking an entry lock: `len()` iterates all
    /// shards and can deadlock against a held shard lock.
    fn reserve_slot(&self) -> bool {
        if self.entries.len() < self.max_entries {
            return true;
        }
        self.cleanup();
        if self.entries.len() < self.max_entries {
            return true;
        }
        if !self.capacity_warning.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                max_entries = self.max_entries,
                "shared tier at capacity, dropping new keys"
            );
        }
        false
    }

    fn at_capacity_error(&self) -> CacheError {
        CacheError::Tier(format!("tier at capacity ({} entries)", self.max_entries))
    }

    /// Remove expired entries. Returns the number evicted.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for key in stale {
            // Re-check under the entry lock: a writer may have refreshed
            // the key between the scan and the removal.
            if self
                .entries
                .remove_if(&key, |_, entry| entry.is_expired(now))
                .is_some()
            {
                evicted += 1;
            }
        }
        evicted
    }

    /// Number of live entries, counting expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn wrong_kind(key: &str, found: &TierValue, wanted: &str) -> CacheError {
        CacheError::Tier(format!(
            "key {key:?} holds a {} where a {wanted} was expected",
            found.kind()
        ))
    }
}

#[async_trait]
impl SharedTier for MemoryTier {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let now = Instant::now();
        match self.entries.get(key) {
            None => Ok(None),
            Some(entry) if entry.is_expired(now) => {
                drop(entry);
                self.entries.remove_if(key, |_, e| e.is_expired(now));
                Ok(None)
            }
            Some(entry) => match &entry.value {
                TierValue::Value(s) => Ok(Some(s.clone())),
                TierValue::Counter(n) => Ok(Some(n.to_string())),
                found @ TierValue::Set(_) => Err(Self::wrong_kind(key, found, "value")),
            },
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()> {
        if !self.entries.contains_key(key) && !self.reserve_slot() {
            return Err(self.at_capacity_error());
        }
        self.entries
            .insert(key.to_string(), TierEntry::new(TierValue::Value(value), ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: String, ttl: Duration) -> CacheResult<bool> {
        if !self.entries.contains_key(key) && !self.reserve_slot() {
            // Report the key as taken; lock callers back off and retry.
            return Ok(false);
        }
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(TierEntry::new(TierValue::Value(value), ttl));
                Ok(true)
            }
            Entry::Occupied(mut slot) => {
                if slot.get().is_expired(now) {
                    slot.insert(TierEntry::new(TierValue::Value(value), ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, delta: i64, ttl: Duration) -> CacheResult<i64> {
        if !self.entries.contains_key(key) && !self.reserve_slot() {
            return Err(self.at_capacity_error());
        }
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(TierEntry::new(TierValue::Counter(delta), ttl));
                Ok(delta)
            }
            Entry::Occupied(mut slot) => {
                if slot.get().is_expired(now) {
                    slot.insert(TierEntry::new(TierValue::Counter(delta), ttl));
                    return Ok(delta);
                }
                match &mut slot.get_mut().value {
                    TierValue::Counter(n) => {
                        *n += delta;
                        let total = *n;
                        slot.get_mut().expires_at = now + ttl;
                        Ok(total)
                    }
                    found => Err(Self::wrong_kind(key, found, "counter")),
                }
            }
        }
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> CacheResult<()> {
        if !self.entries.contains_key(key) && !self.reserve_slot() {
            return Err(self.at_capacity_error());
        }
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                let mut members = HashSet::new();
                members.insert(member.to_string());
                slot.insert(TierEntry::new(TierValue::Set(members), ttl));
                Ok(())
            }
            Entry::Occupied(mut slot) => {
                if slot.get().is_expired(now) {
                    let mut members = HashSet::new();
                    members.insert(member.to_string());
                    slot.insert(TierEntry::new(TierValue::Set(members), ttl));
                    return Ok(());
                }
                match &mut slot.get_mut().value {
                    TierValue::Set(members) => {
                        members.insert(member.to_string());
                        slot.get_mut().expires_at = now + ttl;
                        Ok(())
                    }
                    found => Err(Self::wrong_kind(key, found, "set")),
                }
            }
        }
    }

    async fn set_contains(&self, key: &str, member: &str) -> CacheResult<bool> {
        let now = Instant::now();
        match self.entries.get(key) {
            None => Ok(false),
            Some(entry) if entry.is_expired(now) => Ok(false),
            Some(entry) => match &entry.value {
                TierValue::Set(members) => Ok(members.contains(member)),
                found => Err(Self::wrong_kind(key, found, "set")),
            },
        }
    }
}

/// Spawn a background task sweeping expired tier entries.
pub fn spawn_cleanup_task(
    tier: Arc<MemoryTier>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let evicted = tier.cleanup();
            if evicted > 0 {
                tracing::debug!(evicted, remaining = tier.len(), "swept shared tier");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ttl(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let tier = MemoryTier::new(16);
        tier.set("k", "v".to_string(), ttl(60_000)).await.unwrap();
        assert_eq!(tier.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(tier.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let tier = MemoryTier::new(16);
        tier.set("k", "v".to_string(), ttl(0)).await.unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(tier.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_if_absent_is_exclusive() {
        let tier = MemoryTier::new(16);
        assert!(
            tier.set_if_absent("lock", "a".to_string(), ttl(60_000))
                .await
                .unwrap()
        );
        assert!(
            !tier
                .set_if_absent("lock", "b".to_string(), ttl(60_000))
                .await
                .unwrap()
        );
        assert_eq!(tier.get("lock").await.unwrap(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn set_if_absent_takes_over_expired_entry() {
        let tier = MemoryTier::new(16);
        assert!(
            tier.set_if_absent("lock", "a".to_string(), ttl(0))
                .await
                .unwrap()
        );
        std::thread::sleep(Duration::from_millis(10));
        assert!(
            tier.set_if_absent("lock", "b".to_string(), ttl(60_000))
                .await
                .unwrap()
        );
        assert_eq!(tier.get("lock").await.unwrap(), Some("b".to_string()));
    }

    #[tokio::test]
    async fn incr_accumulates_and_creates() {
        let tier = MemoryTier::new(16);
        assert_eq!(tier.incr("n", 5, ttl(60_000)).await.unwrap(), 5);
        assert_eq!(tier.incr("n", 3, ttl(60_000)).await.unwrap(), 8);
        assert_eq!(tier.get("n").await.unwrap(), Some("8".to_string()));
    }

    #[tokio::test]
    async fn incr_restarts_after_expiry() {
        let tier = MemoryTier::new(16);
        tier.incr("n", 100, ttl(0)).await.unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(tier.incr("n", 7, ttl(60_000)).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn incr_rejects_wrong_kind() {
        let tier = MemoryTier::new(16);
        tier.set("k", "text".to_string(), ttl(60_000)).await.unwrap();
        let err = tier.incr("k", 1, ttl(60_000)).await.unwrap_err();
        assert!(matches!(err, CacheError::Tier(_)));
    }

    #[tokio::test]
    async fn set_membership_operations() {
        let tier = MemoryTier::new(16);
        tier.set_add("s", "1", ttl(60_000)).await.unwrap();
        tier.set_add("s", "2", ttl(60_000)).await.unwrap();
        tier.set_add("s", "2", ttl(60_000)).await.unwrap();
        assert!(tier.set_contains("s", "1").await.unwrap());
        assert!(tier.set_contains("s", "2").await.unwrap());
        assert!(!tier.set_contains("s", "3").await.unwrap());
        assert!(!tier.set_contains("missing", "1").await.unwrap());
    }

    #[tokio::test]
    async fn capacity_cap_rejects_new_keys_but_allows_updates() {
        let tier = MemoryTier::new(2);
        tier.set("a", "1".to_string(), ttl(60_000)).await.unwrap();
        tier.set("b", "2".to_string(), ttl(60_000)).await.unwrap();

        assert!(matches!(
            tier.set("c", "3".to_string(), ttl(60_000)).await,
            Err(CacheError::Tier(_))
        ));
        assert!(
            !tier
                .set_if_absent("d", "4".to_string(), ttl(60_000))
                .await
                .unwrap()
        );

        // Updates to existing keys still go through.
        tier.set("a", "1b".to_string(), ttl(60_000)).await.unwrap();
        assert_eq!(tier.get("a").await.unwrap(), Some("1b".to_string()));
    }

    #[tokio::test]
    async fn full_tier_recovers_by_sweeping_expired_entries() {
        let tier = MemoryTier::new(2);
        tier.set("a", "1".to_string(), ttl(0)).await.unwrap();
        tier.set("b", "2".to_string(), ttl(60_000)).await.unwrap();
        std::thread::sleep(Duration::from_millis(10));

        tier.set("c", "3".to_string(), ttl(60_000)).await.unwrap();
        assert_eq!(tier.get("c").await.unwrap(), Some("3".to_string()));
        assert_eq!(tier.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cleanup_evicts_only_expired_entries() {
        let tier = MemoryTier::new(16);
        tier.set("stale", "x".to_string(), ttl(0)).await.unwrap();
        tier.set("live", "y".to_string(), ttl(60_000)).await.unwrap();
        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(tier.cleanup(), 1);
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.get("live").await.unwrap(), Some("y".to_string()));
    }
}
