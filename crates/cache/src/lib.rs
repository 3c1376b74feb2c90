//! Two-tier caching for hot metadata.
//!
//! Lookups on the ingestion path (file records, quota rows, dedup
//! pointers) go through a [`TieredCache`]: a per-process L1 map in front
//! of a [`SharedTier`]. The default tier is the in-process [`MemoryTier`];
//! the trait seam exists so a networked store can replace it without
//! touching call sites. Absent entities are cached as short-lived null
//! markers and concurrent misses for one key elect a single loader.

pub mod error;
pub mod tier;
pub mod tiered;

pub use error::{CacheError, CacheResult};
pub use tier::{MemoryTier, SharedTier, spawn_cleanup_task};
pub use tiered::TieredCache;

use std::sync::Arc;

use depot_core::config::CacheConfig;

/// Build the shared tier from configuration.
pub fn tier_from_config(config: &CacheConfig) -> Arc<MemoryTier> {
    MemoryTier::new(config.l2_capacity as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tier_from_config_applies_capacity() {
        let config = CacheConfig {
            l2_capacity: 1,
            ..CacheConfig::default()
        };
        let tier = tier_from_config(&config);
        tier.set("a", "1".to_string(), std::time::Duration::from_secs(60))
            .await
            .unwrap();
        assert!(
            tier.set("b", "2".to_string(), std::time::Duration::from_secs(60))
                .await
                .is_err()
        );
    }
}
