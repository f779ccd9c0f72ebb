//! L1: bounded in-process cache.
//!
//! Backed by `moka`, which uses TinyLFU admission: a new entry may be
//! rejected, or evict others, depending on its access frequency relative to
//! what is already cached. Capacity is measured in cost units (the encoded
//! size of the value) rather than entry count.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use moka::Expiry;
use moka::sync::Cache;
use serde::Serialize;

use crate::pattern::glob_match;

/// L1 sizing.
#[derive(Debug, Clone)]
pub struct LocalCacheConfig {
    /// Total cost budget. Defaults to 100 MiB of encoded values.
    pub max_cost: u64,
    /// TTL applied when the caller passes none.
    pub default_ttl: Option<Duration>,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            max_cost: 100 * 1024 * 1024,
            default_ttl: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LocalStats {
    pub entries: u64,
    pub cost: u64,
    pub max_cost: u64,
    pub hits: u64,
    pub misses: u64,
    pub rejected: u64,
}

impl LocalStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Clone)]
struct Slot<V> {
    value: V,
    cost: u32,
    ttl: Option<Duration>,
}

struct SlotExpiry {
    default_ttl: Option<Duration>,
}

impl<V> Expiry<String, Slot<V>> for SlotExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Slot<V>,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.ttl.or(self.default_ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Slot<V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl.or(self.default_ttl)
    }
}

struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    rejected: AtomicU64,
    closed: AtomicBool,
}

/// Bounded, TTL-aware local cache.
///
/// Cheap to clone; clones share storage.
#[derive(Clone)]
pub struct LocalCache<V> {
    cache: Cache<String, Slot<V>>,
    max_cost: u64,
    counters: Arc<Counters>,
}

impl<V> LocalCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: LocalCacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_cost)
            .weigher(|_key: &String, slot: &Slot<V>| slot.cost)
            .expire_after(SlotExpiry {
                default_ttl: config.default_ttl,
            })
            .support_invalidation_closures()
            .build();

        Self {
            cache,
            max_cost: config.max_cost,
            counters: Arc::new(Counters {
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        if self.is_closed() {
            return None;
        }
        match self.cache.get(key) {
            Some(slot) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(slot.value)
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Offer an entry to the cache.
    ///
    /// Returns `false` when the entry is refused outright: its cost exceeds
    /// the whole budget, or the cache is closed. Returning `true` means the
    /// entry was offered; the admission policy may still evict it before
    /// the next read.
    pub fn set(&self, key: &str, value: V, cost: u64, ttl: Option<Duration>) -> bool {
        if self.is_closed() || cost > self.max_cost || cost > u32::MAX as u64 {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.cache.insert(
            key.to_string(),
            Slot {
                value,
                cost: cost.max(1) as u32,
                ttl,
            },
        );
        true
    }

    pub fn del(&self, key: &str) {
        self.cache.invalidate(key);
    }

    /// Drop every entry whose key matches the glob `pattern`.
    pub fn invalidate_matching(&self, pattern: &str) {
        let pattern = pattern.to_string();
        if let Err(e) = self
            .cache
            .invalidate_entries_if(move |key, _| glob_match(&pattern, key))
        {
            tracing::warn!(error = %e, "L1 pattern invalidation failed");
        }
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    /// Apply pending evictions. Mostly useful before reading stats.
    pub fn sync(&self) {
        self.cache.run_pending_tasks();
    }

    pub fn stats(&self) -> LocalStats {
        LocalStats {
            entries: self.cache.entry_count(),
            cost: self.cache.weighted_size(),
            max_cost: self.max_cost,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.counters.closed.load(Ordering::Acquire)
    }

    /// Release all entries. Further reads miss and writes are refused.
    pub fn close(&self) {
        self.counters.closed.store(true, Ordering::Release);
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_cost: u64) -> LocalCache<String> {
        LocalCache::new(LocalCacheConfig {
            max_cost,
            default_ttl: None,
        })
    }

    #[test]
    fn test_get_after_set() {
        let l1 = cache(1024);
        assert!(l1.set("user:1", "ada".into(), 3, None));
        assert_eq!(l1.get("user:1").as_deref(), Some("ada"));
        assert_eq!(l1.get("user:2"), None);

        let stats = l1.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_oversized_entry_is_refused() {
        let l1 = cache(10);
        assert!(!l1.set("big", "x".repeat(64), 64, None));
        assert_eq!(l1.get("big"), None);
        assert_eq!(l1.stats().rejected, 1);
    }

    #[test]
    fn test_entry_expires() {
        let l1 = cache(1024);
        l1.set("k", "v".into(), 1, Some(Duration::from_millis(30)));
        assert!(l1.get("k").is_some());
        std::thread::sleep(Duration::from_millis(60));
        assert!(l1.get("k").is_none());
    }

    #[test]
    fn test_invalidate_matching() {
        let l1 = cache(1024);
        l1.set("user:1", "a".into(), 1, None);
        l1.set("user:2", "b".into(), 1, None);
        l1.set("order:1", "c".into(), 1, None);
        l1.invalidate_matching("user:*");
        l1.sync();
        assert!(l1.get("user:1").is_none());
        assert!(l1.get("user:2").is_none());
        assert!(l1.get("order:1").is_some());
    }

    #[test]
    fn test_closed_cache_refuses_everything() {
        let l1 = cache(1024);
        l1.set("k", "v".into(), 1, None);
        l1.close();
        assert!(l1.get("k").is_none());
        assert!(!l1.set("k", "v".into(), 1, None));
    }
}
