//! Circuit breakers for downstream dependencies.
//!
//! ```text
//!            failures ≥ ratio            timeout elapsed
//!   Closed ─────────────────▶ Open ─────────────────▶ HalfOpen
//!     ▲                        ▲                          │
//!     │                        └──── any probe fails ─────┤
//!     └──────────── max_requests consecutive successes ───┘
//! ```

mod registry;

pub use registry::BreakerRegistry;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rampart_core::{Clock, CoreError};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half_open",
            Self::Open => "open",
        }
    }

    /// Gauge encoding: 0 closed, 1 half-open, 2 open.
    pub fn as_gauge(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    /// Probes admitted while half-open, and the consecutive successes
    /// needed to close again
    pub max_requests: u32,
    /// Closed-state counters reset at this cadence; zero never resets
    pub interval: Duration,
    /// Time spent open before moving to half-open
    pub timeout: Duration,
    pub failure_ratio: f64,
    pub min_requests: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            max_requests: 2,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            failure_ratio: 0.5,
            min_requests: 10,
        }
    }
}

/// Outcome counters for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests += 1;
    }

    fn on_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

/// A named breaker. Share it behind an `Arc`.
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let expiry = (!settings.interval.is_zero()).then(|| now + settings.interval);
        let breaker = Self {
            name: name.into(),
            settings,
            clock,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
            }),
        };
        crate::metrics::set_breaker_state(&breaker.name, BreakerState::Closed);
        breaker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying any pending timeout or interval expiry.
    pub fn state(&self) -> BreakerState {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        inner.state
    }

    pub fn counts(&self) -> Counts {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        inner.counts
    }

    /// Ask to run one call. Fails fast with `CircuitOpen` when open, or when
    /// half-open and the probe budget is spent.
    pub fn try_acquire(self: &Arc<Self>) -> Result<Permit, CoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);

        match inner.state {
            BreakerState::Open => return Err(CoreError::CircuitOpen),
            BreakerState::HalfOpen if inner.counts.requests >= self.settings.max_requests => {
                return Err(CoreError::CircuitOpen);
            }
            _ => {}
        }

        inner.counts.on_request();
        Ok(Permit {
            breaker: Arc::clone(self),
            generation: inner.generation,
            recorded: false,
        })
    }

    /// Run `fut` under the breaker. A fast-fail returns `CircuitOpen`
    /// without polling `fut`.
    pub async fn execute<T, Fut>(self: &Arc<Self>, fut: Fut) -> Result<T, CoreError>
    where
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let permit = self.try_acquire()?;
        let result = fut.await;
        permit.record(result.is_ok());
        result
    }

    fn record(&self, generation: u64, success: bool) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        if inner.generation != generation {
            return;
        }

        if success {
            inner.counts.on_success();
            if inner.state == BreakerState::HalfOpen
                && inner.counts.consecutive_successes >= self.settings.max_requests
            {
                self.transition(&mut inner, BreakerState::Closed, now);
                return;
            }
        } else {
            inner.counts.on_failure();
            if inner.state == BreakerState::HalfOpen {
                self.transition(&mut inner, BreakerState::Open, now);
                return;
            }
        }

        if inner.state == BreakerState::Closed && self.ready_to_trip(&inner.counts) {
            self.transition(&mut inner, BreakerState::Open, now);
        }
    }

    fn ready_to_trip(&self, counts: &Counts) -> bool {
        counts.requests >= self.settings.min_requests
            && counts.requests > 0
            && f64::from(counts.total_failures) / f64::from(counts.requests)
                >= self.settings.failure_ratio
    }

    fn refresh(&self, inner: &mut Inner, now: Instant) {
        match inner.state {
            BreakerState::Closed => {
                if inner.expiry.is_some_and(|at| at <= now) {
                    self.new_generation(inner, now);
                }
            }
            BreakerState::Open => {
                if inner.expiry.is_some_and(|at| at <= now) {
                    self.transition(inner, BreakerState::HalfOpen, now);
                }
            }
            BreakerState::HalfOpen => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState, now: Instant) {
        if inner.state == to {
            return;
        }
        let from = inner.state;
        inner.state = to;
        self.new_generation(inner, now);

        crate::metrics::set_breaker_state(&self.name, to);
        match to {
            BreakerState::Open => {
                tracing::warn!(breaker = %self.name, %from, %to, "circuit breaker opened")
            }
            _ => tracing::info!(breaker = %self.name, %from, %to, "circuit breaker state changed"),
        }
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            BreakerState::Closed => {
                (!self.settings.interval.is_zero()).then(|| now + self.settings.interval)
            }
            BreakerState::Open => Some(now + self.settings.timeout),
            BreakerState::HalfOpen => None,
        };
    }
}

/// Admission to run one call. Record the outcome with [`Permit::record`];
/// a permit dropped without a recorded outcome counts as a failure.
#[must_use = "record the outcome or the call counts as a failure"]
pub struct Permit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    recorded: bool,
}

impl Permit {
    pub fn record(mut self, success: bool) {
        self.recorded = true;
        self.breaker.record(self.generation, success);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.recorded {
            self.breaker.record(self.generation, false);
        }
    }
}
