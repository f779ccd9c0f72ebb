//! Probabilistic pre-filter for keys known to exist.
//!
//! A "no" answer is definitive: the key was never added. A "yes" answer may
//! be a false positive at roughly the configured rate. The filter starts
//! empty, so it rejects everything until seeded with the existing key set.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use probabilistic_collections::bloom::BloomFilter;

pub const DEFAULT_EXPECTED_ITEMS: usize = 100_000;
pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.01;

pub struct MembershipFilter {
    filter: RwLock<BloomFilter<String>>,
    added: AtomicU64,
}

impl Default for MembershipFilter {
    fn default() -> Self {
        Self::new(DEFAULT_EXPECTED_ITEMS, DEFAULT_FALSE_POSITIVE_RATE)
    }
}

impl MembershipFilter {
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        Self {
            filter: RwLock::new(BloomFilter::new(expected_items.max(1), false_positive_rate)),
            added: AtomicU64::new(0),
        }
    }

    pub fn add(&self, key: &str) {
        self.filter.write().insert(&key.to_string());
        self.added.fetch_add(1, Ordering::Relaxed);
    }

    pub fn might_exist(&self, key: &str) -> bool {
        self.filter.read().contains(&key.to_string())
    }

    /// Bulk-load keys, typically at startup from the source of truth.
    pub fn seed<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = self.filter.write();
        let mut count = 0;
        for key in keys {
            filter.insert(&key.as_ref().to_string());
            count += 1;
        }
        self.added.fetch_add(count, Ordering::Relaxed);
    }

    /// Number of insertions so far, duplicates included.
    pub fn len(&self) -> u64 {
        self.added.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
