//! Read-through cache over L1 and L2.
//!
//! ## Lookup order
//!
//! 1. Membership filter (when enabled): definite "no" returns `NotFound`
//! 2. Negative cache: a remembered absence returns `NotFound`
//! 3. L1
//! 4. L2, admitting the value to L1
//! 5. Coalesced load: concurrent misses for the same key share one loader
//!    call, which re-checks both tiers before invoking the loader
//!
//! L2 failures are logged and treated as misses. Loader errors are
//! returned unchanged, and only a `NotFound` from the loader is cached.
//!
//! ## Invalidation
//!
//! Every read takes a [`Stamp`] of the key before it starts. Invalidating a
//! key moves its stamp; a pattern invalidation moves the sweep counter
//! shared by all keys. A load whose stamp moved while it ran returns its
//! value to the callers already waiting but does not keep it: nothing is
//! admitted to L1, and whatever reached L2 is deleted again. Callers
//! arriving after the invalidation get a stamp of their own and start a
//! new wave instead of joining the stale one.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use rampart_core::{CoreError, RequestContext};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec::Codec;
use crate::local::{LocalCache, LocalCacheConfig, LocalStats};
use crate::membership::{DEFAULT_EXPECTED_ITEMS, DEFAULT_FALSE_POSITIVE_RATE, MembershipFilter};
use crate::negative::{DEFAULT_NEGATIVE_TTL, NegativeCache, negative_key};
use crate::singleflight::SingleFlight;
use crate::store::SharedStore;

const NAMESPACE_PREFIX: &str = "ns:";

/// Past this many tracked keys the per-key stamps are dropped and the sweep
/// counter moves instead.
const MAX_TRACKED_KEYS: usize = 100_000;

#[derive(Debug, Clone)]
pub struct ReadThroughConfig {
    /// Upper bound on L1 lifetime, whatever L2 says.
    pub l1_ttl_cap: Duration,
    /// TTL used by [`ReadThrough::get`].
    pub default_ttl: Duration,
    pub negative_ttl: Duration,
    pub negative_max_entries: u64,
    pub l1_max_cost: u64,
    /// Enable the membership pre-filter. It must be seeded before use.
    pub membership_filter: bool,
    pub filter_expected_items: usize,
    pub filter_false_positive_rate: f64,
    pub codec: Codec,
}

impl Default for ReadThroughConfig {
    fn default() -> Self {
        Self {
            l1_ttl_cap: Duration::from_secs(60),
            default_ttl: Duration::from_secs(5 * 60),
            negative_ttl: DEFAULT_NEGATIVE_TTL,
            negative_max_entries: 100_000,
            l1_max_cost: LocalCacheConfig::default().max_cost,
            membership_filter: false,
            filter_expected_items: DEFAULT_EXPECTED_ITEMS,
            filter_false_positive_rate: DEFAULT_FALSE_POSITIVE_RATE,
            codec: Codec::default(),
        }
    }
}

/// Invalidation state of one key at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    key: u64,
    sweep: u64,
}

/// Two-tier read-through cache for values of type `V`.
pub struct ReadThrough<V> {
    config: ReadThroughConfig,
    local: LocalCache<V>,
    shared: Option<Arc<dyn SharedStore>>,
    negative: NegativeCache,
    filter: Option<MembershipFilter>,
    flights: SingleFlight<Result<V, CoreError>>,
    /// Last invalidation tick of each invalidated key.
    versions: DashMap<String, u64>,
    ticks: AtomicU64,
    /// Moved by pattern invalidations and whenever `versions` is reset.
    sweep: AtomicU64,
    /// Shared while a read admits to L1, exclusive while an invalidation
    /// moves stamps and clears L1.
    admission: RwLock<()>,
    generations: DashMap<String, u64>,
}

impl<V> ReadThrough<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(config: ReadThroughConfig, shared: Option<Arc<dyn SharedStore>>) -> Self {
        let local = LocalCache::new(LocalCacheConfig {
            max_cost: config.l1_max_cost,
            default_ttl: Some(config.l1_ttl_cap),
        });
        let negative = NegativeCache::new(
            config.negative_ttl,
            config.negative_max_entries,
            shared.clone(),
        );
        let filter = config.membership_filter.then(|| {
            MembershipFilter::new(
                config.filter_expected_items,
                config.filter_false_positive_rate,
            )
        });

        Self {
            config,
            local,
            shared,
            negative,
            filter,
            flights: SingleFlight::new(),
            versions: DashMap::new(),
            ticks: AtomicU64::new(0),
            sweep: AtomicU64::new(0),
            admission: RwLock::new(()),
            generations: DashMap::new(),
        }
    }

    /// L1-only cache; nothing is shared between instances.
    pub fn local_only(config: ReadThroughConfig) -> Self {
        Self::new(config, None)
    }

    pub fn local(&self) -> &LocalCache<V> {
        &self.local
    }

    pub fn filter(&self) -> Option<&MembershipFilter> {
        self.filter.as_ref()
    }

    pub fn stats(&self) -> LocalStats {
        self.local.stats()
    }

    /// Read `key`, loading it with `loader` on a miss. Uses the default TTL.
    pub async fn get<F, Fut>(&self, ctx: &RequestContext, key: &str, loader: F) -> Result<V, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, CoreError>>,
    {
        self.get_with_ttl(ctx, key, self.config.default_ttl, loader)
            .await
    }

    /// Read `key`; a loaded value is kept in L2 for `ttl` and in L1 for at
    /// most the L1 cap.
    ///
    /// Waiting on another caller's load is bounded by `ctx`: once it is
    /// cancelled or expired this returns `Timeout`.
    pub async fn get_with_ttl<F, Fut>(
        &self,
        ctx: &RequestContext,
        key: &str,
        ttl: Duration,
        loader: F,
    ) -> Result<V, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, CoreError>>,
    {
        let stamp = self.stamp(key);

        if let Some(filter) = &self.filter
            && !filter.might_exist(key)
        {
            crate::metrics::record_filter_reject();
            return Err(CoreError::NotFound);
        }

        if self.negative.is_negative(ctx, key).await {
            crate::metrics::record_negative_hit();
            return Err(CoreError::NotFound);
        }

        if let Some(value) = self.local.get(key) {
            crate::metrics::record_hit("L1");
            return Ok(value);
        }

        if let Some(value) = self.read_shared(ctx, key, stamp).await {
            crate::metrics::record_hit("L2");
            return Ok(value);
        }

        crate::metrics::record_miss();
        let flight_key = format!("{key}\u{0}{}.{}", stamp.key, stamp.sweep);
        let flight = ctx
            .run(
                self.flights
                    .work(&flight_key, || self.load(ctx, key, ttl, stamp, loader)),
            )
            .await?;
        if flight.shared {
            crate::metrics::record_coalesced();
        }
        flight.value
    }

    async fn load<F, Fut>(
        &self,
        ctx: &RequestContext,
        key: &str,
        ttl: Duration,
        stamp: Stamp,
        loader: F,
    ) -> Result<V, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, CoreError>>,
    {
        // A previous wave may have filled the tiers while we queued.
        if let Some(value) = self.local.get(key) {
            return Ok(value);
        }
        if let Some(value) = self.read_shared(ctx, key, stamp).await {
            return Ok(value);
        }

        match loader().await {
            Ok(value) => {
                self.store(ctx, key, &value, ttl, stamp).await;
                Ok(value)
            }
            Err(CoreError::NotFound) => {
                if self.stamp(key) == stamp {
                    self.negative.remember(ctx, key).await;
                    if self.stamp(key) != stamp {
                        self.negative.forget(ctx, key).await;
                    }
                }
                Err(CoreError::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    fn stamp(&self, key: &str) -> Stamp {
        let sweep = self.sweep.load(Ordering::Acquire);
        let key = self.versions.get(key).map_or(0, |v| *v);
        Stamp { key, sweep }
    }

    /// Put `value` in L1 unless `key` was invalidated since `stamp`.
    fn admit(&self, key: &str, stamp: Stamp, value: V, cost: u64, ttl: Duration) -> bool {
        let _held = self.admission.read();
        if self.stamp(key) != stamp {
            return false;
        }
        self.local.set(key, value, cost, Some(ttl));
        true
    }

    async fn read_shared(&self, ctx: &RequestContext, key: &str, stamp: Stamp) -> Option<V> {
        let shared = self.shared.as_ref()?;
        let (bytes, remaining) = match shared.get_with_ttl(ctx, key).await {
            Ok(Some(found)) => found,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "L2 read failed; treating as miss");
                return None;
            }
        };

        match self.config.codec.decode::<V>(&bytes) {
            Ok(value) => {
                let l1_ttl = remaining.map_or(self.config.l1_ttl_cap, |r| {
                    r.min(self.config.l1_ttl_cap)
                });
                self.admit(key, stamp, value.clone(), bytes.len() as u64, l1_ttl);
                Some(value)
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "undecodable L2 value; treating as miss");
                None
            }
        }
    }

    async fn store(&self, ctx: &RequestContext, key: &str, value: &V, ttl: Duration, stamp: Stamp) {
        if let Some(filter) = &self.filter {
            filter.add(key);
        }
        if self.stamp(key) != stamp {
            tracing::debug!(key = %key, "invalidated during load; not caching");
            return;
        }

        self.negative.forget(ctx, key).await;

        let encoded = match self.config.codec.encode(value) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "value not encodable; L1 only");
                None
            }
        };

        if let (Some(shared), Some(bytes)) = (&self.shared, &encoded)
            && let Err(e) = shared.set(ctx, key, bytes, ttl).await
        {
            tracing::warn!(key = %key, error = %e, "L2 write failed");
        }

        let cost = encoded.as_ref().map_or(1, |b| b.len() as u64);
        let l1_ttl = ttl.min(self.config.l1_ttl_cap);
        if self.admit(key, stamp, value.clone(), cost, l1_ttl) {
            return;
        }

        tracing::debug!(key = %key, "invalidated during write; withdrawing L2 copy");
        if let (Some(shared), Some(_)) = (&self.shared, &encoded)
            && let Err(e) = shared.del(ctx, &[key.to_string()]).await
        {
            tracing::warn!(key = %key, error = %e, "L2 withdrawal failed");
        }
    }

    /// Write a value through both tiers without consulting the loader.
    pub async fn put(&self, ctx: &RequestContext, key: &str, value: &V, ttl: Duration) {
        let stamp = self.stamp(key);
        self.store(ctx, key, value, ttl, stamp).await;
    }

    /// Delete `keys` and their negative entries from both tiers.
    ///
    /// Once this returns, the next read of any of the keys reaches the
    /// loader, unless L2 is unreachable and still holds a copy.
    pub async fn invalidate(&self, ctx: &RequestContext, keys: &[&str]) {
        self.retire(keys);

        if let Some(shared) = &self.shared {
            let doomed: Vec<String> = keys
                .iter()
                .flat_map(|k| [k.to_string(), negative_key(k)])
                .collect();
            if let Err(e) = shared.del(ctx, &doomed).await {
                tracing::error!(keys = ?keys, error = %e, "L2 invalidation failed");
            }
            // Reads that fetched the old L2 value before the delete landed
            // may have admitted it to L1 meanwhile.
            self.retire(keys);
        }

        if self.versions.len() > MAX_TRACKED_KEYS {
            let _held = self.admission.write();
            self.sweep.fetch_add(1, Ordering::AcqRel);
            self.versions.clear();
        }
    }

    fn retire(&self, keys: &[&str]) {
        let _held = self.admission.write();
        for key in keys {
            let tick = self.ticks.fetch_add(1, Ordering::AcqRel) + 1;
            self.versions.insert(key.to_string(), tick);
            self.local.del(key);
            self.negative.forget_local(key);
        }
    }

    /// Delete every key matching the glob `pattern` from both tiers.
    pub async fn invalidate_pattern(&self, ctx: &RequestContext, pattern: &str) -> u64 {
        self.sweep_local(pattern);

        let Some(shared) = &self.shared else {
            return 0;
        };
        let mut deleted = 0;
        for p in [pattern.to_string(), negative_key(pattern)] {
            match shared.scan_delete(ctx, &p).await {
                Ok(n) => deleted += n,
                Err(e) => {
                    tracing::error!(pattern = %p, error = %e, "L2 pattern invalidation failed");
                }
            }
        }
        self.sweep_local(pattern);
        deleted
    }

    fn sweep_local(&self, pattern: &str) {
        let _held = self.admission.write();
        self.sweep.fetch_add(1, Ordering::AcqRel);
        self.local.invalidate_matching(pattern);
        self.negative.forget_matching_local(pattern);
    }

    /// Key for `key` under the current generation of `namespace`.
    ///
    /// Bumping the generation with [`invalidate_namespace`](Self::invalidate_namespace)
    /// orphans every key built under the previous one; they age out by TTL.
    pub async fn namespaced_key(&self, ctx: &RequestContext, namespace: &str, key: &str) -> String {
        let generation = self.namespace_generation(ctx, namespace).await;
        format!("{namespace}:v{generation}:{key}")
    }

    async fn namespace_generation(&self, ctx: &RequestContext, namespace: &str) -> u64 {
        let local = self.generations.get(namespace).map_or(0, |g| *g);
        let Some(shared) = &self.shared else {
            return local;
        };
        let counter = format!("{NAMESPACE_PREFIX}{namespace}");
        match shared.get(ctx, &counter).await {
            Ok(Some(raw)) => {
                let remote = std::str::from_utf8(&raw)
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(0);
                let generation = remote.max(local);
                self.generations.insert(namespace.to_string(), generation);
                generation
            }
            Ok(None) => local,
            Err(e) => {
                tracing::warn!(namespace = %namespace, error = %e, "namespace generation read failed");
                local
            }
        }
    }

    /// Advance the generation of `namespace`. Returns the new generation.
    pub async fn invalidate_namespace(&self, ctx: &RequestContext, namespace: &str) -> u64 {
        let local = {
            let mut entry = self.generations.entry(namespace.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        let Some(shared) = &self.shared else {
            return local;
        };
        let counter = format!("{NAMESPACE_PREFIX}{namespace}");
        match shared.incr(ctx, &counter).await {
            Ok(remote) => {
                let generation = (remote.max(0) as u64).max(local);
                self.generations.insert(namespace.to_string(), generation);
                generation
            }
            Err(e) => {
                tracing::warn!(namespace = %namespace, error = %e, "namespace generation bump failed");
                local
            }
        }
    }

    /// Tell the membership filter that `key` exists. No-op when disabled.
    pub fn mark_exists(&self, key: &str) {
        if let Some(filter) = &self.filter {
            filter.add(key);
        }
    }

    /// Bulk-load the membership filter. No-op when disabled.
    pub fn seed_filter<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if let Some(filter) = &self.filter {
            filter.seed(keys);
        }
    }

    pub fn close(&self) {
        self.local.close();
        self.negative.close();
    }
}
