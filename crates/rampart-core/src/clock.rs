//! Time sources.
//!
//! Limiters and breakers read time through [`Clock`] so tests can drive the
//! state machines deterministically with a [`ManualClock`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use time::OffsetDateTime;

/// A monotonic clock plus a wall-clock view in nanoseconds.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant, used for TTLs, refill and breaker expiry.
    fn now(&self) -> Instant;

    /// Wall-clock time as nanoseconds since the Unix epoch.
    ///
    /// Distributed limiters send this value to the shared store, so it must
    /// be comparable across processes.
    fn unix_nanos(&self) -> i128;
}

/// The process clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_nanos(&self) -> i128 {
        OffsetDateTime::now_utc().unix_timestamp_nanos()
    }
}

impl SystemClock {
    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(SystemClock)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualState>>,
}

#[derive(Debug)]
struct ManualState {
    base: Instant,
    base_nanos: i128,
    offset: Duration,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualState {
                base: Instant::now(),
                base_nanos: OffsetDateTime::now_utc().unix_timestamp_nanos(),
                offset: Duration::ZERO,
            })),
        }
    }

    /// Move time forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.inner.lock().offset += by;
    }

    /// Total time advanced since construction.
    pub fn elapsed(&self) -> Duration {
        self.inner.lock().offset
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let state = self.inner.lock();
        state.base + state.offset
    }

    fn unix_nanos(&self) -> i128 {
        let state = self.inner.lock();
        state.base_nanos + state.offset.as_nanos() as i128
    }
}

/// Current UTC time formatted as RFC 3339, used in health payloads.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string())
}
