//! MySQL connection pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rampart_core::{CoreError, PoolSnapshot, RequestContext};
use sqlx_core::pool::{PoolConnection, PoolOptions};
use sqlx_mysql::{MySql, MySqlPool};
use tracing::{debug, info, instrument};

use crate::config::DatabaseConfig;
use crate::health::PoolProbe;

pub type MySqlPoolOptions = PoolOptions<MySql>;

/// Acquisitions slower than this count as having waited for a connection.
const WAIT_THRESHOLD: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
struct Counters {
    wait_count: AtomicU64,
    wait_nanos: AtomicU64,
    stale_closed: AtomicU64,
}

/// Pooled MySQL handle with wait and stale-connection accounting.
#[derive(Debug, Clone)]
pub struct Database {
    pool: MySqlPool,
    max_connections: u32,
    counters: Arc<Counters>,
}

impl Database {
    #[instrument(skip(config), fields(url = %mask_password(&config.url)))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, sqlx_core::Error> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            acquire_timeout_ms = config.acquire_timeout_ms,
            "Creating MySQL connection pool"
        );

        let counters = Arc::new(Counters::default());
        let idle_timeout = Duration::from_secs(config.idle_timeout_secs);
        let max_lifetime = Duration::from_secs(config.max_lifetime_secs);

        let hook_counters = Arc::clone(&counters);
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
            .idle_timeout(idle_timeout)
            .max_lifetime(max_lifetime)
            .test_before_acquire(false)
            .before_acquire(move |_conn, meta| {
                // Returning false closes the connection and acquires another.
                let stale = meta.idle_for > idle_timeout || meta.age > max_lifetime;
                if stale {
                    hook_counters.stale_closed.fetch_add(1, Ordering::Relaxed);
                }
                Box::pin(async move { Ok(!stale) })
            })
            .connect(&config.url)
            .await?;

        debug!("MySQL connection pool created successfully");
        Ok(Self {
            pool,
            max_connections: config.max_connections,
            counters,
        })
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    /// Check out a connection, recording time spent waiting for it.
    pub async fn acquire(&self, ctx: &RequestContext) -> Result<PoolConnection<MySql>, CoreError> {
        let started = Instant::now();
        let conn = ctx
            .run(self.pool.acquire())
            .await?
            .map_err(|e| CoreError::backend_unavailable(e.to_string()))?;
        let waited = started.elapsed();
        if waited >= WAIT_THRESHOLD {
            self.counters.wait_count.fetch_add(1, Ordering::Relaxed);
            self.counters
                .wait_nanos
                .fetch_add(waited.as_nanos() as u64, Ordering::Relaxed);
        }
        Ok(conn)
    }

    pub async fn ping(&self, ctx: &RequestContext) -> Result<(), CoreError> {
        let mut conn = self.acquire(ctx).await?;
        ctx.run(sqlx_core::query::query("SELECT 1").execute(&mut *conn))
            .await?
            .map_err(|e| CoreError::backend_unavailable(e.to_string()))?;
        Ok(())
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let open = self.pool.size() as u64;
        let idle = self.pool.num_idle() as u64;
        PoolSnapshot {
            max_open: self.max_connections as u64,
            open,
            in_use: open.saturating_sub(idle),
            idle,
            wait_count: self.counters.wait_count.load(Ordering::Relaxed),
            wait_duration: Duration::from_nanos(self.counters.wait_nanos.load(Ordering::Relaxed)),
            stale_closed: self.counters.stale_closed.load(Ordering::Relaxed),
        }
    }

    pub async fn close(&self) {
        if !self.pool.is_closed() {
            self.pool.close().await;
            info!("MySQL pool closed");
        }
    }
}

#[async_trait]
impl PoolProbe for Database {
    fn name(&self) -> &str {
        "mysql"
    }

    async fn ping(&self, ctx: &RequestContext) -> Result<(), CoreError> {
        Database::ping(self, ctx).await
    }

    fn snapshot(&self) -> PoolSnapshot {
        Database::snapshot(self)
    }
}

/// Masks the password in a database URL for logging.
fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.find('@')
        && let Some(colon_pos) = url[..at_pos].rfind(':')
    {
        let scheme_end = url.find("://").map(|p| p + 3).unwrap_or(0);
        if colon_pos > scheme_end {
            return format!("{}:****{}", &url[..colon_pos], &url[at_pos..]);
        }
    }
    url.to_string()
}
