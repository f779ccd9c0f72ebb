use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rampart_cache::{RedisCache, scripts};
use rampart_core::{Clock, RequestContext};
use redis::Script;
use uuid::Uuid;

use super::{LocalRateLimiter, RateLimiter};

/// Admission policy evaluated in Redis.
#[derive(Debug, Clone, PartialEq)]
pub enum Policy {
    /// At most `limit` admissions within any `window`, cluster-wide.
    SlidingWindow { limit: u64, window: Duration },
    /// Continuous refill at `rate` per second up to `capacity`.
    TokenBucket { rate: f64, capacity: f64 },
}

/// Cluster-wide limiter.
///
/// Each decision is a single atomic script execution, timestamped with this
/// process's clock. When Redis cannot be reached the decision is taken by
/// the local fallback limiter instead of admitting unconditionally.
pub struct DistributedRateLimiter {
    name: String,
    redis: RedisCache,
    policy: Policy,
    clock: Arc<dyn Clock>,
    fallback: Arc<LocalRateLimiter>,
    script: Script,
}

impl DistributedRateLimiter {
    pub fn new(
        name: impl Into<String>,
        redis: RedisCache,
        policy: Policy,
        clock: Arc<dyn Clock>,
        fallback: Arc<LocalRateLimiter>,
    ) -> Self {
        let script = match policy {
            Policy::SlidingWindow { .. } => scripts::sliding_window(),
            Policy::TokenBucket { .. } => scripts::token_bucket(),
        };
        Self {
            name: name.into(),
            redis,
            policy,
            clock,
            fallback,
            script,
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Key and script arguments for one decision taken at `now_nanos`.
    fn invocation(&self, identity: &str, now_nanos: i128) -> (String, Vec<String>) {
        match &self.policy {
            Policy::SlidingWindow { limit, window } => (
                format!("ratelimit:{identity}"),
                vec![
                    now_nanos.to_string(),
                    window.as_nanos().to_string(),
                    limit.to_string(),
                    Uuid::new_v4().simple().to_string(),
                ],
            ),
            Policy::TokenBucket { rate, capacity } => (
                format!("tokenbucket:{identity}"),
                vec![
                    capacity.to_string(),
                    rate.to_string(),
                    unix_seconds(now_nanos),
                ],
            ),
        }
    }

    async fn evaluate(&self, ctx: &RequestContext, identity: &str) -> rampart_cache::Result<bool> {
        let (key, args) = self.invocation(identity, self.clock.unix_nanos());
        let admitted: i64 = self
            .redis
            .run_script(ctx, &self.script, &[key.as_str()], &args)
            .await?;
        Ok(admitted == 1)
    }
}

/// `nanos` since the epoch as decimal seconds, without float rounding.
fn unix_seconds(nanos: i128) -> String {
    let secs = nanos.div_euclid(1_000_000_000);
    let frac = nanos.rem_euclid(1_000_000_000);
    format!("{secs}.{frac:09}")
}

#[async_trait]
impl RateLimiter for DistributedRateLimiter {
    async fn allow(&self, ctx: &RequestContext, identity: &str) -> bool {
        match self.evaluate(ctx, identity).await {
            Ok(allowed) => allowed,
            Err(e) => {
                tracing::warn!(
                    limiter = %self.name,
                    error = %e,
                    "distributed rate limiter unavailable; using local limiter"
                );
                crate::metrics::record_limiter_fallback(&self.name);
                self.fallback.allow_now(identity)
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_cluster_wide(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::LocalLimiterConfig;
    use rampart_cache::RedisCacheConfig;
    use rampart_core::SystemClock;

    fn offline_redis() -> RedisCache {
        RedisCache::new_lazy(RedisCacheConfig {
            url: "redis://127.0.0.1:1".into(),
            pool_size: Some(1),
            max_retries: 0,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_token_bucket_is_timed_in_seconds() {
        let limiter = DistributedRateLimiter::new(
            "auth",
            offline_redis(),
            Policy::TokenBucket {
                rate: 0.5,
                capacity: 5.0,
            },
            SystemClock::shared(),
            Arc::new(LocalRateLimiter::new(
                "fallback",
                LocalLimiterConfig::default(),
                SystemClock::shared(),
            )),
        );

        let (key, args) = limiter.invocation("10.0.0.1", 1_700_000_000_250_000_000);
        assert_eq!(key, "tokenbucket:10.0.0.1");
        assert_eq!(args, vec!["5", "0.5", "1700000000.250000000"]);
        assert_eq!(unix_seconds(42), "0.000000042");
    }

    #[tokio::test]
    async fn test_transport_error_falls_back_to_local() {
        let redis = offline_redis();
        let fallback = Arc::new(LocalRateLimiter::new(
            "fallback",
            LocalLimiterConfig {
                rate: 0.001,
                burst: 2.0,
                ..Default::default()
            },
            SystemClock::shared(),
        ));
        let limiter = DistributedRateLimiter::new(
            "api",
            redis,
            Policy::SlidingWindow {
                limit: 100,
                window: Duration::from_secs(1),
            },
            SystemClock::shared(),
            Arc::clone(&fallback),
        );

        let ctx = RequestContext::background().with_timeout(Duration::from_secs(5));
        assert!(limiter.allow(&ctx, "u").await);
        assert!(limiter.allow(&ctx, "u").await);
        // Fallback is fail-closed: its own budget applies.
        assert!(!limiter.allow(&ctx, "u").await);
        assert_eq!(fallback.size(), 1);
    }
}
