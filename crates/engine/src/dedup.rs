//! Content-addressed duplicate detection.
//!
//! A process-wide Bloom filter answers "definitely new" without any I/O.
//! Possible duplicates go through a hash-to-file-id pointer cache whose
//! null markers absorb filter false positives, and every positive answer
//! is confirmed against the metadata store before the source record is
//! reused. A pointer is only ever a nomination; the store decides.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use depot_cache::{CacheError, SharedTier, TieredCache};
use depot_core::config::CacheConfig;
use depot_core::{ContentHash, FileRecord};
use depot_metadata::{FileRepo, MetadataStore};

use crate::error::EngineResult;

/// Hash count the boot warmup sizes the filter for.
pub const DEDUP_EXPECTED_ENTRIES: usize = 10_000_000;
/// Target false-positive rate at the expected fill.
pub const DEDUP_FALSE_POSITIVE_RATE: f64 = 1e-4;

/// Fixed-size Bloom filter over content hashes.
///
/// Probe positions are derived from the four 64-bit limbs of the hash by
/// double hashing, so membership tests never rehash the content. Bits are
/// atomic; insert and probe need no outer lock.
pub struct BloomFilter {
    bits: Vec<AtomicU64>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    pub fn with_capacity(expected_entries: usize, false_positive_rate: f64) -> Self {
        let n = expected_entries.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let num_bits = (((-n * false_positive_rate.ln()) / (ln2 * ln2)).ceil() as u64).max(64);
        let num_hashes = ((num_bits as f64 / n) * ln2).round().max(1.0) as u32;
        let words = num_bits.div_ceil(64) as usize;
        let mut bits = Vec::with_capacity(words);
        bits.resize_with(words, || AtomicU64::new(0));
        Self {
            bits,
            num_bits,
            num_hashes,
        }
    }

    fn probes(&self, hash: &ContentHash) -> impl Iterator<Item = u64> {
        let limbs = hash.limbs();
        let h1 = limbs[0] ^ limbs[2];
        let h2 = limbs[1] ^ limbs[3];
        let num_bits = self.num_bits;
        (0..u64::from(self.num_hashes)).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % num_bits)
    }

    pub fn insert(&self, hash: &ContentHash) {
        for bit in self.probes(hash) {
            let word = (bit / 64) as usize;
            self.bits[word].fetch_or(1u64 << (bit % 64), Ordering::Relaxed);
        }
    }

    /// Never false-negative; false positives occur at roughly the
    /// configured rate.
    pub fn might_contain(&self, hash: &ContentHash) -> bool {
        self.probes(hash).all(|bit| {
            let word = (bit / 64) as usize;
            self.bits[word].load(Ordering::Relaxed) & (1u64 << (bit % 64)) != 0
        })
    }
}

pub struct DedupIndex {
    filter: BloomFilter,
    metadata: Arc<dyn MetadataStore>,
    pointers: TieredCache<String>,
}

impl DedupIndex {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        tier: Arc<dyn SharedTier>,
        cache_config: &CacheConfig,
    ) -> Self {
        Self {
            filter: BloomFilter::with_capacity(DEDUP_EXPECTED_ENTRIES, DEDUP_FALSE_POSITIVE_RATE),
            metadata,
            pointers: TieredCache::new("dedup", tier, cache_config)
                .with_value_ttl(cache_config.pointer_ttl()),
        }
    }

    /// Find an active record whose content this upload can reference
    /// instead of storing again.
    ///
    /// Filter misses return immediately. On a filter hit the pointer
    /// cache is consulted; a null marker there means a recent lookup
    /// already came up empty. A present pointer nominates a candidate,
    /// and the store then confirms the canonical record, so a pointer
    /// outliving a recycled source is corrected here rather than reused.
    pub async fn find_source(&self, hash: &ContentHash) -> EngineResult<Option<FileRecord>> {
        if !self.filter.might_contain(hash) {
            return Ok(None);
        }

        let hex = hash.to_hex();
        let metadata = Arc::clone(&self.metadata);
        let lookup = hex.clone();
        let pointer = self
            .pointers
            .get_or_load(&hex, "global", || {
                let metadata = Arc::clone(&metadata);
                let hex = lookup.clone();
                async move {
                    let row = metadata
                        .find_active_by_hash(&hex)
                        .await
                        .map_err(|e| CacheError::Loader(e.to_string()))?;
                    Ok(row.map(|r| r.file_id))
                }
            })
            .await?;

        if pointer.is_none() {
            return Ok(None);
        }

        match self.metadata.find_active_by_hash(&hex).await? {
            Some(row) => Ok(Some(row.into_record()?)),
            None => {
                // The source went away since the pointer was written.
                self.pointers.store(&hex, "global", None).await?;
                Ok(None)
            }
        }
    }

    /// Record a freshly committed hash so later uploads can find it.
    pub async fn admit(&self, hash: &ContentHash, record: &FileRecord) -> EngineResult<()> {
        self.filter.insert(hash);
        self.pointers
            .store(&hash.to_hex(), "global", Some(record.file_id.to_string()))
            .await?;
        Ok(())
    }

    /// Drop the pointer for a hash whose last reference was purged. The
    /// filter bit stays set; the next probe pays one store lookup and
    /// caches the miss.
    pub async fn forget(&self, hash: &ContentHash) -> EngineResult<()> {
        self.pointers.evict(&hash.to_hex(), "global").await?;
        Ok(())
    }

    /// Preload the filter with every non-purged content hash. Returns
    /// the number of hashes loaded.
    pub async fn warm(&self) -> EngineResult<usize> {
        let hashes = self.metadata.active_hashes().await?;
        let mut loaded = 0;
        for hex in &hashes {
            match ContentHash::from_hex(hex) {
                Ok(hash) => {
                    self.filter.insert(&hash);
                    loaded += 1;
                }
                Err(error) => {
                    tracing::warn!(%error, hash = %hex, "skipping unparseable hash in warmup");
                }
            }
        }
        Ok(loaded)
    }
}
