//! L2: pooled Redis client.
//!
//! Every operation takes the caller's [`RequestContext`] and gives up when it
//! expires. Transport failures are retried with exponential backoff; command
//! errors are not.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, PoolConfig, Runtime, Timeouts};
use parking_lot::Mutex;
use rampart_core::{PoolSnapshot, RequestContext};
use redis::{FromRedisValue, Script};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{CacheError, Result};
use crate::store::SharedStore;

/// Lua scripts executed atomically on the server.
pub mod scripts {
    use redis::Script;

    /// `KEYS[1]` guard, `KEYS[2]` marker, `ARGV[1]` value, `ARGV[2]` TTL seconds.
    pub const SET_UNLESS_EXISTS: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('SET', KEYS[2], ARGV[1], 'EX', ARGV[2])
return 1
"#;

    /// Sliding-window admission.
    ///
    /// `KEYS[1]` window key, `ARGV[1]` now (ns), `ARGV[2]` window (ns),
    /// `ARGV[3]` limit, `ARGV[4]` unique member suffix. Running it again
    /// with the same arguments admits without counting twice.
    pub const SLIDING_WINDOW: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[1] .. '-' .. ARGV[4]
redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, now - window)
if redis.call('ZSCORE', KEYS[1], member) then
  return 1
end
local count = redis.call('ZCARD', KEYS[1])
if count < limit then
  redis.call('ZADD', KEYS[1], now, member)
  redis.call('PEXPIRE', KEYS[1], math.ceil(window / 1000000))
  return 1
end
return 0
"#;

    /// Token-bucket admission.
    ///
    /// `KEYS[1]` bucket key, `ARGV[1]` capacity, `ARGV[2]` refill rate per
    /// second, `ARGV[3]` now (fractional unix seconds). The hash keeps
    /// `tokens` and `last`, both in those units.
    pub const TOKEN_BUCKET: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local state = redis.call('HMGET', KEYS[1], 'tokens', 'last')
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil then
  tokens = capacity
  last = now
end
local elapsed = math.max(0, now - last)
tokens = math.min(capacity, tokens + elapsed * rate)
local allowed = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
end
redis.call('HSET', KEYS[1], 'tokens', tokens, 'last', now)
redis.call('EXPIRE', KEYS[1], 60)
return allowed
"#;

    pub fn set_unless_exists() -> Script {
        Script::new(SET_UNLESS_EXISTS)
    }

    pub fn sliding_window() -> Script {
        Script::new(SLIDING_WINDOW)
    }

    pub fn token_bucket() -> Script {
        Script::new(TOKEN_BUCKET)
    }
}

/// Redis client settings.
#[derive(Debug, Clone)]
pub struct RedisCacheConfig {
    pub url: String,
    /// Upper bound on open connections. `None` means `max(100, 10 * cpus)`.
    pub pool_size: Option<usize>,
    /// Connections opened eagerly at startup.
    pub min_idle: usize,
    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub pool_timeout: Duration,
    pub max_retries: u32,
    pub min_retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    pub idle_timeout: Duration,
    pub max_conn_age: Duration,
    pub reap_interval: Duration,
    pub health_check_timeout: Duration,
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".into(),
            pool_size: None,
            min_idle: 20,
            dial_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
            pool_timeout: Duration::from_secs(2),
            max_retries: 3,
            min_retry_backoff: Duration::from_millis(8),
            max_retry_backoff: Duration::from_millis(512),
            idle_timeout: Duration::from_secs(5 * 60),
            max_conn_age: Duration::from_secs(30 * 60),
            reap_interval: Duration::from_secs(60),
            health_check_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisCacheConfig {
    pub fn effective_pool_size(&self) -> usize {
        self.pool_size
            .unwrap_or_else(|| (num_cpus::get() * 10).max(100))
            .max(1)
    }
}

enum Op<'a> {
    Cmd(&'a redis::Cmd),
    Pipe(&'a redis::Pipeline),
    Script(&'a redis::ScriptInvocation<'a>),
}

impl Op<'_> {
    async fn run<T: FromRedisValue>(
        &self,
        conn: &mut deadpool_redis::Connection,
    ) -> redis::RedisResult<T> {
        match self {
            Op::Cmd(cmd) => cmd.query_async(conn).await,
            Op::Pipe(pipe) => pipe.query_async(conn).await,
            Op::Script(invocation) => invocation.invoke_async(conn).await,
        }
    }
}

#[derive(Default)]
struct PoolCounters {
    wait_count: AtomicU64,
    wait_nanos: AtomicU64,
    stale_closed: AtomicU64,
}

struct Reaper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    pool: Pool,
    config: RedisCacheConfig,
    counters: Arc<PoolCounters>,
    reaper: Mutex<Option<Reaper>>,
    set_unless_exists: Script,
}

/// Pooled Redis client. Cheap to clone.
#[derive(Clone)]
pub struct RedisCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("pool_size", &self.inner.config.effective_pool_size())
            .finish()
    }
}

impl RedisCache {
    /// Build the pool, verify the server answers PING and warm `min_idle`
    /// connections. Fails when the server is unreachable.
    pub async fn connect(config: RedisCacheConfig) -> Result<Self> {
        let cache = Self::new_lazy(config)?;

        let ctx = RequestContext::background().with_timeout(cache.inner.config.health_check_timeout);
        cache.ping(&ctx).await?;
        cache.warm_up().await;
        cache.start_reaper();

        tracing::info!(
            pool_size = cache.inner.config.effective_pool_size(),
            min_idle = cache.inner.config.min_idle,
            "Redis cache connected"
        );
        Ok(cache)
    }

    /// Build the pool without touching the network. Connections are opened
    /// on first use.
    pub fn new_lazy(config: RedisCacheConfig) -> Result<Self> {
        if config.reap_interval.is_zero() {
            return Err(CacheError::Config("reap_interval must be > 0".into()));
        }
        let max_size = config.effective_pool_size();
        let mut redis_config = Config::from_url(&config.url);
        let mut pool_config = PoolConfig::new(max_size);
        pool_config.timeouts = Timeouts {
            wait: Some(config.pool_timeout),
            create: Some(config.dial_timeout),
            recycle: Some(config.read_timeout),
        };
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CacheError::Config(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                pool,
                config,
                counters: Arc::new(PoolCounters::default()),
                reaper: Mutex::new(None),
                set_unless_exists: scripts::set_unless_exists(),
            }),
        })
    }

    pub fn config(&self) -> &RedisCacheConfig {
        &self.inner.config
    }

    async fn warm_up(&self) {
        let target = self
            .inner
            .config
            .min_idle
            .min(self.inner.config.effective_pool_size());
        let results =
            futures_util::future::join_all((0..target).map(|_| self.inner.pool.get())).await;
        let opened = results.iter().filter(|r| r.is_ok()).count();
        if opened < target {
            tracing::debug!(opened, target, "Redis pool warm-up incomplete");
        }
    }

    fn start_reaper(&self) {
        let cancel = CancellationToken::new();
        let pool = self.inner.pool.clone();
        let counters = Arc::clone(&self.inner.counters);
        let idle_timeout = self.inner.config.idle_timeout;
        let max_age = self.inner.config.max_conn_age;
        let period = self.inner.config.reap_interval;
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let removed = AtomicU64::new(0);
                        let _ = pool.retain(|_, metrics| {
                            let keep = metrics.last_used() < idle_timeout && metrics.age() < max_age;
                            if !keep {
                                removed.fetch_add(1, Ordering::Relaxed);
                            }
                            keep
                        });
                        let removed = removed.into_inner();
                        if removed > 0 {
                            counters.stale_closed.fetch_add(removed, Ordering::Relaxed);
                            crate::metrics::record_stale_closed(removed);
                            tracing::debug!(removed, "Closed stale Redis connections");
                        }
                    }
                }
            }
        });

        *self.inner.reaper.lock() = Some(Reaper { cancel, handle });
    }

    async fn acquire(&self, ctx: &RequestContext) -> Result<deadpool_redis::Connection> {
        let started = Instant::now();
        let contended = self.inner.pool.status().available == 0;
        let conn = ctx
            .run(self.inner.pool.get())
            .await
            .map_err(|_| CacheError::Timeout)??;
        if contended {
            let counters = &self.inner.counters;
            counters.wait_count.fetch_add(1, Ordering::Relaxed);
            counters
                .wait_nanos
                .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
        }
        Ok(conn)
    }

    async fn attempt<T: FromRedisValue>(&self, ctx: &RequestContext, op: &Op<'_>) -> Result<T> {
        let mut conn = self.acquire(ctx).await?;
        let read_timeout = self.inner.config.read_timeout;
        match ctx.run(tokio::time::timeout(read_timeout, op.run(&mut conn))).await {
            Err(_) => Err(CacheError::Timeout),
            Ok(Err(_)) => Err(CacheError::Transport("read timeout".into())),
            Ok(Ok(result)) => result.map_err(CacheError::from),
        }
    }

    async fn execute<T: FromRedisValue>(
        &self,
        ctx: &RequestContext,
        name: &'static str,
        op: Op<'_>,
    ) -> Result<T> {
        self.execute_with_retries(ctx, name, op, self.inner.config.max_retries)
            .await
    }

    /// Single attempt for commands that change state on every run. A
    /// transport error after the server applied the command would
    /// otherwise apply it twice.
    async fn execute_once<T: FromRedisValue>(
        &self,
        ctx: &RequestContext,
        name: &'static str,
        op: Op<'_>,
    ) -> Result<T> {
        self.execute_with_retries(ctx, name, op, 0).await
    }

    async fn execute_with_retries<T: FromRedisValue>(
        &self,
        ctx: &RequestContext,
        name: &'static str,
        op: Op<'_>,
        max_retries: u32,
    ) -> Result<T> {
        let config = &self.inner.config;
        let mut backoff = config.min_retry_backoff;
        let mut retries = 0;
        loop {
            match self.attempt(ctx, &op).await {
                Err(e) if e.is_transport() && retries < max_retries => {
                    retries += 1;
                    tracing::debug!(op = name, retries, error = %e, "Retrying Redis command");
                    ctx.run(tokio::time::sleep(backoff))
                        .await
                        .map_err(|_| CacheError::Timeout)?;
                    backoff = (backoff * 2).min(config.max_retry_backoff);
                }
                Err(e) => {
                    crate::metrics::record_backend_error(name);
                    return Err(e);
                }
                Ok(value) => return Ok(value),
            }
        }
    }

    pub async fn get(&self, ctx: &RequestContext, key: &str) -> Result<Option<Vec<u8>>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.execute(ctx, "get", Op::Cmd(&cmd)).await
    }

    /// Value plus remaining TTL, read in one round trip.
    pub async fn get_with_ttl(
        &self,
        ctx: &RequestContext,
        key: &str,
    ) -> Result<Option<(Vec<u8>, Option<Duration>)>> {
        let mut pipe = redis::pipe();
        pipe.cmd("GET").arg(key).cmd("PTTL").arg(key);
        let (value, pttl): (Option<Vec<u8>>, i64) =
            self.execute(ctx, "get_with_ttl", Op::Pipe(&pipe)).await?;
        Ok(value.map(|v| {
            let ttl = (pttl >= 0).then(|| Duration::from_millis(pttl as u64));
            (v, ttl)
        }))
    }

    /// Store `value`. A zero or absent TTL stores without expiry.
    pub async fn set(
        &self,
        ctx: &RequestContext,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl.filter(|t| !t.is_zero()) {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        self.execute(ctx, "set", Op::Cmd(&cmd)).await
    }

    pub async fn del(&self, ctx: &RequestContext, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("DEL");
        cmd.arg(keys);
        self.execute(ctx, "del", Op::Cmd(&cmd)).await
    }

    pub async fn exists(&self, ctx: &RequestContext, key: &str) -> Result<bool> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        self.execute(ctx, "exists", Op::Cmd(&cmd)).await
    }

    pub async fn mget(&self, ctx: &RequestContext, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = redis::cmd("MGET");
        cmd.arg(keys);
        self.execute(ctx, "mget", Op::Cmd(&cmd)).await
    }

    /// Store several values atomically, each with the same TTL.
    pub async fn mset(
        &self,
        ctx: &RequestContext,
        entries: &[(String, Vec<u8>)],
        ttl: Option<Duration>,
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            let cmd = pipe.cmd("SET").arg(key).arg(value.as_slice());
            if let Some(ttl) = ttl.filter(|t| !t.is_zero()) {
                cmd.arg("PX").arg(ttl.as_millis() as u64);
            }
            cmd.ignore();
        }
        self.execute(ctx, "mset", Op::Pipe(&pipe)).await
    }

    /// Run a caller-built pipeline.
    pub async fn pipeline<T: FromRedisValue>(
        &self,
        ctx: &RequestContext,
        pipe: &redis::Pipeline,
    ) -> Result<T> {
        self.execute(ctx, "pipeline", Op::Pipe(pipe)).await
    }

    /// Evaluate `script` atomically. Uses EVALSHA and falls back to loading
    /// the script on NOSCRIPT. Never retried.
    pub async fn run_script<T: FromRedisValue>(
        &self,
        ctx: &RequestContext,
        script: &Script,
        keys: &[&str],
        args: &[String],
    ) -> Result<T> {
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(*key);
        }
        for arg in args {
            invocation.arg(arg.as_str());
        }
        self.execute_once(ctx, "script", Op::Script(&invocation))
            .await
    }

    /// Never retried.
    pub async fn incr(&self, ctx: &RequestContext, key: &str) -> Result<i64> {
        let mut cmd = redis::cmd("INCR");
        cmd.arg(key);
        self.execute_once(ctx, "incr", Op::Cmd(&cmd)).await
    }

    /// Cursor through `SCAN MATCH pattern` and delete each batch.
    pub async fn scan_delete(&self, ctx: &RequestContext, pattern: &str) -> Result<u64> {
        let mut cursor: u64 = 0;
        let mut deleted = 0;
        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor).arg("MATCH").arg(pattern).arg("COUNT").arg(100);
            let (next, keys): (u64, Vec<String>) =
                self.execute(ctx, "scan", Op::Cmd(&cmd)).await?;
            deleted += self.del(ctx, &keys).await?;
            if next == 0 {
                return Ok(deleted);
            }
            cursor = next;
        }
    }

    pub async fn ping(&self, ctx: &RequestContext) -> Result<()> {
        let cmd = redis::cmd("PING");
        let _: String = self.execute(ctx, "ping", Op::Cmd(&cmd)).await?;
        Ok(())
    }

    pub fn pool_stats(&self) -> PoolSnapshot {
        let status = self.inner.pool.status();
        let counters = &self.inner.counters;
        PoolSnapshot {
            max_open: status.max_size as u64,
            open: status.size as u64,
            in_use: status.size.saturating_sub(status.available) as u64,
            idle: status.available as u64,
            wait_count: counters.wait_count.load(Ordering::Relaxed),
            wait_duration: Duration::from_nanos(counters.wait_nanos.load(Ordering::Relaxed)),
            stale_closed: counters.stale_closed.load(Ordering::Relaxed),
        }
    }

    /// Stop the reaper and close the pool. Idempotent.
    pub async fn close(&self) {
        let reaper = self.inner.reaper.lock().take();
        if let Some(reaper) = reaper {
            reaper.cancel.cancel();
            let _ = reaper.handle.await;
        }
        if !self.inner.pool.is_closed() {
            self.inner.pool.close();
            tracing::info!("Redis pool closed");
        }
    }
}

#[async_trait]
impl SharedStore for RedisCache {
    async fn get(&self, ctx: &RequestContext, key: &str) -> Result<Option<Vec<u8>>> {
        RedisCache::get(self, ctx, key).await
    }

    async fn get_with_ttl(
        &self,
        ctx: &RequestContext,
        key: &str,
    ) -> Result<Option<(Vec<u8>, Option<Duration>)>> {
        RedisCache::get_with_ttl(self, ctx, key).await
    }

    async fn set(
        &self,
        ctx: &RequestContext,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<()> {
        RedisCache::set(self, ctx, key, value, Some(ttl)).await
    }

    async fn del(&self, ctx: &RequestContext, keys: &[String]) -> Result<u64> {
        RedisCache::del(self, ctx, keys).await
    }

    async fn exists(&self, ctx: &RequestContext, key: &str) -> Result<bool> {
        RedisCache::exists(self, ctx, key).await
    }

    async fn incr(&self, ctx: &RequestContext, key: &str) -> Result<i64> {
        RedisCache::incr(self, ctx, key).await
    }

    async fn scan_delete(&self, ctx: &RequestContext, pattern: &str) -> Result<u64> {
        RedisCache::scan_delete(self, ctx, pattern).await
    }

    async fn set_unless_exists(
        &self,
        ctx: &RequestContext,
        guard: &str,
        marker: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool> {
        let secs = ttl.as_secs().max(1);
        let value = String::from_utf8_lossy(value).into_owned();
        let written: i64 = self
            .run_script(
                ctx,
                &self.inner.set_unless_exists,
                &[guard, marker],
                &[value, secs.to_string()],
            )
            .await?;
        Ok(written == 1)
    }
}
