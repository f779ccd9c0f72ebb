//! Negative cache: remembers keys confirmed absent from the source of truth.

use std::sync::Arc;
use std::time::Duration;

use rampart_core::RequestContext;

use crate::local::{LocalCache, LocalCacheConfig};
use crate::store::SharedStore;

const NEGATIVE_PREFIX: &str = "null:";
const MARKER: &[u8] = b"1";

/// Default lifetime of a negative entry.
pub const DEFAULT_NEGATIVE_TTL: Duration = Duration::from_secs(60);

/// Marker for the L2 twin of `key`.
pub fn negative_key(key: &str) -> String {
    format!("{NEGATIVE_PREFIX}{key}")
}

/// Negative entries live in a dedicated local map and, when configured, in
/// the shared store under `null:<key>`. A negative entry is never written
/// while the positive entry exists in L2; the check and the write happen in
/// one atomic step.
pub struct NegativeCache {
    ttl: Duration,
    local: LocalCache<()>,
    shared: Option<Arc<dyn SharedStore>>,
}

impl NegativeCache {
    pub fn new(ttl: Duration, max_entries: u64, shared: Option<Arc<dyn SharedStore>>) -> Self {
        Self {
            ttl,
            local: LocalCache::new(LocalCacheConfig {
                max_cost: max_entries,
                default_ttl: Some(ttl),
            }),
            shared,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn is_negative(&self, ctx: &RequestContext, key: &str) -> bool {
        let marker = negative_key(key);
        if self.local.get(&marker).is_some() {
            return true;
        }
        let Some(shared) = &self.shared else {
            return false;
        };
        match shared.get_with_ttl(ctx, &marker).await {
            Ok(Some((_, remaining))) => {
                let ttl = remaining.map_or(self.ttl, |r| r.min(self.ttl));
                self.local.set(&marker, (), 1, Some(ttl));
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "negative cache lookup failed");
                false
            }
        }
    }

    /// Record that `key` does not exist.
    pub async fn remember(&self, ctx: &RequestContext, key: &str) {
        let marker = negative_key(key);
        let Some(shared) = &self.shared else {
            self.local.set(&marker, (), 1, Some(self.ttl));
            return;
        };
        match shared
            .set_unless_exists(ctx, key, &marker, MARKER, self.ttl)
            .await
        {
            Ok(true) => {
                self.local.set(&marker, (), 1, Some(self.ttl));
            }
            Ok(false) => {
                tracing::debug!(key = %key, "positive entry present; negative entry skipped");
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "negative cache write failed");
                self.local.set(&marker, (), 1, Some(self.ttl));
            }
        }
    }

    /// Drop the negative entry for `key` from both tiers.
    pub async fn forget(&self, ctx: &RequestContext, key: &str) {
        let marker = negative_key(key);
        self.local.del(&marker);
        if let Some(shared) = &self.shared
            && let Err(e) = shared.del(ctx, &[marker]).await
        {
            tracing::warn!(key = %key, error = %e, "negative cache delete failed");
        }
    }

    /// Forget only the local copy; used when L2 deletion is batched by the caller.
    pub fn forget_local(&self, key: &str) {
        self.local.del(&negative_key(key));
    }

    pub fn forget_matching_local(&self, pattern: &str) {
        self.local.invalidate_matching(&negative_key(pattern));
    }

    pub fn close(&self) {
        self.local.close();
    }
}
