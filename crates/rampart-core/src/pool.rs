use std::time::Duration;

use serde::Serialize;

/// Point-in-time view of a connection pool.
///
/// `wait_count`, `wait_duration` and `stale_closed` are cumulative for the
/// process lifetime; the remaining fields are gauges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub max_open: u64,
    pub open: u64,
    pub in_use: u64,
    pub idle: u64,
    pub wait_count: u64,
    #[serde(rename = "wait_duration_ms", serialize_with = "as_millis")]
    pub wait_duration: Duration,
    pub stale_closed: u64,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}
