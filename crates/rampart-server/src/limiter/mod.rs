//! Rate limiting.
//!
//! - [`LocalRateLimiter`]: per-identity token buckets held in an LRU map
//! - [`DistributedRateLimiter`]: sliding window or token bucket evaluated
//!   atomically in Redis, falling back to a local limiter on transport errors
//!
//! Limiters that own background tasks are tracked by a [`LimiterRegistry`]
//! so shutdown can stop them all.

mod distributed;
mod local;
mod registry;

pub use distributed::{DistributedRateLimiter, Policy};
pub use local::{LocalLimiterConfig, LocalRateLimiter};
pub use registry::LimiterRegistry;

use async_trait::async_trait;
use rampart_core::RequestContext;

/// Admission decision for one request from `identity`.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn allow(&self, ctx: &RequestContext, identity: &str) -> bool;

    /// Name used in logs and metrics.
    fn name(&self) -> &str;

    /// Whether decisions are shared with other instances.
    fn is_cluster_wide(&self) -> bool {
        false
    }
}
