//! Prometheus metrics for the server.
//!
//! This module provides:
//! - HTTP request metrics (count, latency, in-flight requests)
//! - Limiter and breaker metrics
//! - Connection pool gauges and counters sampled by the telemetry collector

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

use crate::breaker::BreakerState;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Latency buckets in seconds, from 5 ms to the default request timeout.
const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "http_requests_in_flight";
    pub const HTTP_PANICS_TOTAL: &str = "http_panics_total";

    // Limiter metrics
    pub const RATE_LIMIT_DENIED_TOTAL: &str = "rate_limit_denied_total";
    pub const RATE_LIMIT_FALLBACK_TOTAL: &str = "rate_limit_fallback_total";
    pub const RATE_LIMIT_IDENTITIES: &str = "rate_limit_identities";

    // Breaker metrics
    pub const CIRCUIT_BREAKER_STATE: &str = "circuit_breaker_state";
    pub const CIRCUIT_BREAKER_REJECTED_TOTAL: &str = "circuit_breaker_rejected_total";

    // Cache metrics
    pub const CACHE_L1_COST_BYTES: &str = "cache_l1_cost_bytes";

    // Pool metrics
    pub const POOL_CONNECTIONS_OPEN: &str = "pool_connections_open";
    pub const POOL_CONNECTIONS_IN_USE: &str = "pool_connections_in_use";
    pub const POOL_CONNECTIONS_IDLE: &str = "pool_connections_idle";
    pub const POOL_WAIT_TOTAL: &str = "pool_wait_total";
    pub const POOL_WAIT_MILLISECONDS_TOTAL: &str = "pool_wait_milliseconds_total";
    pub const POOL_STALE_CLOSED_TOTAL: &str = "pool_stale_closed_total";
}

/// Install the Prometheus recorder once per process.
///
/// Later calls are no-ops and return `false`.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        return false;
    }

    let installed = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(names::HTTP_REQUEST_DURATION_SECONDS.to_string()),
            LATENCY_BUCKETS,
        )
        .and_then(|builder| builder.install_recorder());
    match installed {
        Ok(handle) => {
            let stored = PROMETHEUS_HANDLE.set(handle).is_ok();
            if stored {
                tracing::info!("metrics recorder installed");
            }
            stored
        }
        Err(e) => {
            tracing::error!(error = %e, "could not install metrics recorder");
            false
        }
    }
}

/// Prometheus text exposition, or `None` before [`init_metrics`].
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(PrometheusHandle::render)
}

// =============================================================================
// HTTP Metrics
// =============================================================================

/// Record a completed HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    let status_class = match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    };

    let normalized_path = normalize_path(path);

    counter!(
        names::HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "path" => normalized_path.clone(),
        "status" => status.to_string(),
        "status_class" => status_class.to_string()
    )
    .increment(1);

    histogram!(
        names::HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "path" => normalized_path
    )
    .record(duration.as_secs_f64());
}

pub fn increment_in_flight() {
    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);
}

pub fn decrement_in_flight() {
    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);
}

pub fn record_panic() {
    counter!(names::HTTP_PANICS_TOTAL).increment(1);
}

// =============================================================================
// Limiter / Breaker Metrics
// =============================================================================

pub fn record_limiter_denied(limiter: &str) {
    counter!(names::RATE_LIMIT_DENIED_TOTAL, "limiter" => limiter.to_string()).increment(1);
}

/// The distributed limiter could not reach Redis and used its local fallback.
pub fn record_limiter_fallback(limiter: &str) {
    counter!(names::RATE_LIMIT_FALLBACK_TOTAL, "limiter" => limiter.to_string()).increment(1);
}

pub fn set_limiter_identities(limiter: &str, count: usize) {
    gauge!(names::RATE_LIMIT_IDENTITIES, "limiter" => limiter.to_string()).set(count as f64);
}

pub fn set_breaker_state(breaker: &str, state: BreakerState) {
    gauge!(names::CIRCUIT_BREAKER_STATE, "breaker" => breaker.to_string()).set(state.as_gauge());
}

pub fn record_breaker_rejected(breaker: &str) {
    counter!(names::CIRCUIT_BREAKER_REJECTED_TOTAL, "breaker" => breaker.to_string()).increment(1);
}

// =============================================================================
// Pool Metrics
// =============================================================================

/// Record point-in-time pool gauges.
pub fn record_pool_gauges(pool: &str, open: u64, in_use: u64, idle: u64) {
    gauge!(names::POOL_CONNECTIONS_OPEN, "pool" => pool.to_string()).set(open as f64);
    gauge!(names::POOL_CONNECTIONS_IN_USE, "pool" => pool.to_string()).set(in_use as f64);
    gauge!(names::POOL_CONNECTIONS_IDLE, "pool" => pool.to_string()).set(idle as f64);
}

/// Add the growth of the pool's monotone counters since the last sample.
pub fn record_pool_deltas(pool: &str, waits: u64, wait_time: Duration, stale_closed: u64) {
    counter!(names::POOL_WAIT_TOTAL, "pool" => pool.to_string()).increment(waits);
    counter!(names::POOL_WAIT_MILLISECONDS_TOTAL, "pool" => pool.to_string())
        .increment(wait_time.as_millis() as u64);
    counter!(names::POOL_STALE_CLOSED_TOTAL, "pool" => pool.to_string()).increment(stale_closed);
}

pub fn set_cache_cost(bytes: u64) {
    gauge!(names::CACHE_L1_COST_BYTES).set(bytes as f64);
}

// =============================================================================
// Helpers
// =============================================================================

/// Collapse numeric and UUID segments into `{id}` so unmatched paths do not
/// explode label cardinality.
fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|part| if is_likely_id(part) { "{id}" } else { part })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_likely_id(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }

    if s.len() == 36 && s.chars().filter(|c| *c == '-').count() == 4 {
        return true;
    }
    if s.len() == 32 && s.chars().all(|c| c.is_ascii_hexdigit()) {
        return true;
    }

    s.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/api/v1/users/12345"), "/api/v1/users/{id}");
        assert_eq!(
            normalize_path("/api/v1/users/550e8400-e29b-41d4-a716-446655440000/projects"),
            "/api/v1/users/{id}/projects"
        );
        assert_eq!(normalize_path("/ping"), "/ping");
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn test_is_likely_id() {
        assert!(is_likely_id("12345"));
        assert!(!is_likely_id("v1"));
        assert!(!is_likely_id(""));
    }
}
