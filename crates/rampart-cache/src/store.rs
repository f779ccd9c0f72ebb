//! The shared-tier seam.
//!
//! [`ReadThrough`](crate::ReadThrough) and [`NegativeCache`](crate::NegativeCache)
//! talk to L2 through [`SharedStore`]. [`RedisCache`](crate::RedisCache) is the
//! production implementation; [`MemoryStore`] serves single-instance
//! deployments and tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use rampart_core::RequestContext;

use crate::error::{CacheError, Result};
use crate::pattern::glob_match;

#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, ctx: &RequestContext, key: &str) -> Result<Option<Vec<u8>>>;

    /// Value and remaining TTL (`None` for keys without expiry).
    async fn get_with_ttl(
        &self,
        ctx: &RequestContext,
        key: &str,
    ) -> Result<Option<(Vec<u8>, Option<Duration>)>>;

    async fn set(&self, ctx: &RequestContext, key: &str, value: &[u8], ttl: Duration)
    -> Result<()>;

    async fn del(&self, ctx: &RequestContext, keys: &[String]) -> Result<u64>;

    async fn exists(&self, ctx: &RequestContext, key: &str) -> Result<bool>;

    async fn incr(&self, ctx: &RequestContext, key: &str) -> Result<i64>;

    /// Delete every key matching the glob `pattern`. Returns how many were removed.
    async fn scan_delete(&self, ctx: &RequestContext, pattern: &str) -> Result<u64>;

    /// Atomically write `marker` with `ttl` unless `guard` exists.
    ///
    /// Returns whether the marker was written.
    async fn set_unless_exists(
        &self,
        ctx: &RequestContext,
        guard: &str,
        marker: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct StoredValue {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// In-process [`SharedStore`] backed by a `DashMap`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with a transport error, or recover.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_online(&self, ctx: &RequestContext) -> Result<()> {
        ctx.check().map_err(|_| CacheError::Timeout)?;
        if self.offline.load(Ordering::SeqCst) {
            return Err(CacheError::Transport("store offline".into()));
        }
        Ok(())
    }

    fn live(&self, key: &str) -> Option<StoredValue> {
        let now = Instant::now();
        let entry = self.entries.get(key)?;
        if entry.is_live(now) {
            return Some(entry.clone());
        }
        drop(entry);
        self.entries.remove_if(key, |_, v| !v.is_live(now));
        None
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, ctx: &RequestContext, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_online(ctx)?;
        Ok(self.live(key).map(|v| v.data))
    }

    async fn get_with_ttl(
        &self,
        ctx: &RequestContext,
        key: &str,
    ) -> Result<Option<(Vec<u8>, Option<Duration>)>> {
        self.ensure_online(ctx)?;
        let now = Instant::now();
        Ok(self.live(key).map(|v| {
            let ttl = v.expires_at.map(|at| at.saturating_duration_since(now));
            (v.data, ttl)
        }))
    }

    async fn set(
        &self,
        ctx: &RequestContext,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<()> {
        self.ensure_online(ctx)?;
        self.entries.insert(
            key.to_string(),
            StoredValue {
                data: value.to_vec(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, ctx: &RequestContext, keys: &[String]) -> Result<u64> {
        self.ensure_online(ctx)?;
        Ok(keys
            .iter()
            .filter(|k| self.entries.remove(k.as_str()).is_some())
            .count() as u64)
    }

    async fn exists(&self, ctx: &RequestContext, key: &str) -> Result<bool> {
        self.ensure_online(ctx)?;
        Ok(self.live(key).is_some())
    }

    async fn incr(&self, ctx: &RequestContext, key: &str) -> Result<i64> {
        self.ensure_online(ctx)?;
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredValue {
                data: b"0".to_vec(),
                expires_at: None,
            });
        let current: i64 = std::str::from_utf8(&entry.data)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| CacheError::Command("value is not an integer".into()))?;
        let next = current + 1;
        entry.data = next.to_string().into_bytes();
        Ok(next)
    }

    async fn scan_delete(&self, ctx: &RequestContext, pattern: &str) -> Result<u64> {
        self.ensure_online(ctx)?;
        let before = self.entries.len();
        self.entries.retain(|k, _| !glob_match(pattern, k));
        Ok((before - self.entries.len()) as u64)
    }

    async fn set_unless_exists(
        &self,
        ctx: &RequestContext,
        guard: &str,
        marker: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool> {
        self.ensure_online(ctx)?;
        if self.live(guard).is_some() {
            return Ok(false);
        }
        self.entries.insert(
            marker.to_string(),
            StoredValue {
                data: value.to_vec(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }
}
