use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use rampart_core::{Clock, RequestContext};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::RateLimiter;

#[derive(Debug, Clone)]
pub struct LocalLimiterConfig {
    /// Tokens added per second
    pub rate: f64,
    /// Bucket capacity; a new identity starts full
    pub burst: f64,
    pub max_identities: usize,
    /// Buckets idle for longer than this are swept
    pub ttl: Duration,
    pub cleanup_interval: Duration,
}

impl Default for LocalLimiterConfig {
    fn default() -> Self {
        Self {
            rate: 100.0,
            burst: 200.0,
            max_identities: 10_000,
            ttl: Duration::from_secs(600),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_seen: Instant,
    last_refill: Instant,
}

impl Bucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_seen: now,
            last_refill: now,
        }
    }

    fn try_take(&mut self, rate: f64, capacity: f64, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
        self.last_seen = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct Sweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Per-identity token buckets bounded by an LRU.
///
/// At most `max_identities` buckets are resident; inserting a new identity
/// evicts the least recently seen ones first. A background sweeper drops
/// buckets idle for longer than `ttl`.
pub struct LocalRateLimiter {
    name: String,
    config: LocalLimiterConfig,
    clock: Arc<dyn Clock>,
    buckets: Mutex<LruCache<String, Bucket>>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl std::fmt::Debug for LocalRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRateLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

impl LocalRateLimiter {
    pub fn new(name: impl Into<String>, config: LocalLimiterConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            buckets: Mutex::new(LruCache::unbounded()),
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &LocalLimiterConfig {
        &self.config
    }

    /// Consume one token for `identity`.
    pub fn allow_now(&self, identity: &str) -> bool {
        let now = self.clock.now();
        let LocalLimiterConfig {
            rate,
            burst,
            max_identities,
            ..
        } = self.config;

        let mut buckets = self.buckets.lock();
        if let Some(bucket) = buckets.get_mut(identity) {
            return bucket.try_take(rate, burst, now);
        }
        while buckets.len() >= max_identities {
            if buckets.pop_lru().is_none() {
                break;
            }
        }
        let mut bucket = Bucket::full(burst, now);
        let allowed = bucket.try_take(rate, burst, now);
        buckets.push(identity.to_string(), bucket);
        allowed
    }

    /// Number of resident buckets.
    pub fn size(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Remove buckets idle for longer than `ttl`, oldest first, stopping at
    /// the first live one. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let ttl = self.config.ttl;
        let mut buckets = self.buckets.lock();
        let mut removed = 0;
        while let Some((_, bucket)) = buckets.peek_lru() {
            if now.saturating_duration_since(bucket.last_seen) <= ttl {
                break;
            }
            buckets.pop_lru();
            removed += 1;
        }
        removed
    }

    /// Start the background sweeper. Calling it again is a no-op.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut slot = self.sweeper.lock();
        if slot.is_some() {
            return;
        }
        let period = self.config.cleanup_interval;
        if period.is_zero() {
            tracing::warn!(limiter = %self.name, "cleanup interval is zero; sweeper not started");
            return;
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let weak: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(limiter) = weak.upgrade() else { break };
                        let removed = limiter.sweep();
                        if removed > 0 {
                            tracing::debug!(limiter = %limiter.name, removed, "swept idle rate-limit buckets");
                        }
                        crate::metrics::set_limiter_identities(&limiter.name, limiter.size());
                    }
                }
            }
        });

        *slot = Some(Sweeper { cancel, handle });
    }

    /// Stop the sweeper and wait for it to exit.
    pub async fn stop(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.cancel.cancel();
            let _ = sweeper.handle.await;
            tracing::debug!(limiter = %self.name, "rate limiter sweeper stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.sweeper.lock().is_some()
    }
}

#[async_trait]
impl RateLimiter for LocalRateLimiter {
    async fn allow(&self, _ctx: &RequestContext, identity: &str) -> bool {
        self.allow_now(identity)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_core::ManualClock;

    fn limiter(rate: f64, burst: f64, max_identities: usize) -> (LocalRateLimiter, ManualClock) {
        let clock = ManualClock::new();
        let limiter = LocalRateLimiter::new(
            "test",
            LocalLimiterConfig {
                rate,
                burst,
                max_identities,
                ttl: Duration::from_secs(600),
                cleanup_interval: Duration::from_secs(60),
            },
            Arc::new(clock.clone()),
        );
        (limiter, clock)
    }

    #[test]
    fn test_burst_then_deny() {
        let (limiter, clock) = limiter(5.0, 10.0, 100);
        let mut results = Vec::new();
        for _ in 0..15 {
            results.push(limiter.allow_now("1.2.3.4"));
            clock.advance(Duration::from_millis(6));
        }
        assert_eq!(results[..10], [true; 10]);
        assert_eq!(results[10..], [false; 5]);
        assert_eq!(limiter.size(), 1);
    }

    #[test]
    fn test_refill_over_time() {
        let (limiter, clock) = limiter(5.0, 1.0, 100);
        assert!(limiter.allow_now("a"));
        assert!(!limiter.allow_now("a"));
        clock.advance(Duration::from_millis(200));
        assert!(limiter.allow_now("a"));
    }

    #[test]
    fn test_size_never_exceeds_max_identities() {
        let (limiter, _clock) = limiter(1.0, 1.0, 3);
        for i in 0..10 {
            limiter.allow_now(&format!("10.0.0.{i}"));
            assert!(limiter.size() <= 3);
        }
        assert_eq!(limiter.size(), 3);
    }

    #[test]
    fn test_eviction_drops_least_recently_seen() {
        let (limiter, _clock) = limiter(1.0, 1.0, 2);
        limiter.allow_now("a");
        limiter.allow_now("b");
        // Touch "a" so "b" becomes the eviction candidate.
        limiter.allow_now("a");
        limiter.allow_now("c");
        // "a" is still resident with an empty bucket.
        assert!(!limiter.allow_now("a"));
        // "b" was evicted and comes back full.
        assert!(limiter.allow_now("b"));
    }

    #[test]
    fn test_sweep_removes_only_idle_buckets() {
        let (limiter, clock) = limiter(1.0, 1.0, 100);
        limiter.allow_now("old");
        clock.advance(Duration::from_secs(500));
        limiter.allow_now("recent");
        clock.advance(Duration::from_secs(200));

        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.size(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_stops_deterministically() {
        let limiter = Arc::new(LocalRateLimiter::new(
            "sweeper",
            LocalLimiterConfig {
                cleanup_interval: Duration::from_millis(10),
                ..Default::default()
            },
            rampart_core::SystemClock::shared(),
        ));
        limiter.start_sweeper();
        assert!(limiter.is_running());
        limiter.stop().await;
        assert!(!limiter.is_running());
    }

    #[tokio::test]
    async fn test_zero_cleanup_interval_does_not_start_sweeper() {
        let limiter = Arc::new(LocalRateLimiter::new(
            "idle",
            LocalLimiterConfig {
                cleanup_interval: Duration::ZERO,
                ..Default::default()
            },
            rampart_core::SystemClock::shared(),
        ));
        limiter.start_sweeper();
        assert!(!limiter.is_running());
    }
}
