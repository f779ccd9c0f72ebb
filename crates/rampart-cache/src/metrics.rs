//! Cache metrics, recorded through the `metrics` facade.

use metrics::{counter, gauge};

pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_NEGATIVE_HITS_TOTAL: &str = "cache_negative_hits_total";
    pub const CACHE_FILTER_REJECTS_TOTAL: &str = "cache_filter_rejects_total";
    pub const CACHE_COALESCED_TOTAL: &str = "cache_coalesced_total";
    pub const CACHE_BACKEND_ERRORS_TOTAL: &str = "cache_backend_errors_total";
    pub const CACHE_ENTRIES: &str = "cache_entries";
    pub const REDIS_STALE_CLOSED_TOTAL: &str = "redis_stale_connections_closed_total";
}

pub fn record_hit(tier: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "tier" => tier).increment(1);
}

pub fn record_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

pub fn record_negative_hit() {
    counter!(names::CACHE_NEGATIVE_HITS_TOTAL).increment(1);
}

pub fn record_filter_reject() {
    counter!(names::CACHE_FILTER_REJECTS_TOTAL).increment(1);
}

pub fn record_coalesced() {
    counter!(names::CACHE_COALESCED_TOTAL).increment(1);
}

pub fn record_backend_error(op: &'static str) {
    counter!(names::CACHE_BACKEND_ERRORS_TOTAL, "op" => op).increment(1);
}

pub fn record_stale_closed(count: u64) {
    counter!(names::REDIS_STALE_CLOSED_TOTAL).increment(count);
}

pub fn set_entries(tier: &'static str, count: u64) {
    gauge!(names::CACHE_ENTRIES, "tier" => tier).set(count as f64);
}
