//! Startup and shutdown sequencing.
//!
//! Startup: backends are opened before anything that depends on them. A
//! backend that fails to open is fatal in production and skipped (with a
//! warning) elsewhere.
//!
//! Shutdown: stop accepting, drain in-flight requests until the drain
//! deadline or a second signal, then tear down in reverse order of startup.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Context;
use rampart_cache::RedisCache;

use crate::config::AppConfig;
use crate::db::Database;
use crate::server::AppState;
use crate::telemetry::TelemetryCollector;

pub async fn open_backends(cfg: &AppConfig) -> anyhow::Result<(Option<Database>, Option<RedisCache>)> {
    let production = cfg.is_production();

    let db = if cfg.database.enabled {
        match Database::connect(&cfg.database).await {
            Ok(db) => Some(db),
            Err(e) if production => {
                return Err(e).context("failed to open MySQL pool");
            }
            Err(e) => {
                tracing::warn!(error = %e, "MySQL unavailable; continuing without database");
                None
            }
        }
    } else {
        tracing::info!("database not configured");
        None
    };

    let redis = if cfg.redis.enabled {
        match RedisCache::connect(cfg.redis.to_cache_config()).await {
            Ok(redis) => Some(redis),
            Err(e) if production => {
                if let Some(db) = &db {
                    db.close().await;
                }
                return Err(e).context("failed to open Redis pool");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Redis unavailable; continuing with local cache only");
                None
            }
        }
    } else {
        tracing::info!("redis not configured");
        None
    };

    Ok((db, redis))
}

/// Resolves on SIGINT, or SIGTERM on Unix.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[derive(Debug)]
pub enum DrainOutcome {
    /// Every connection finished; carries the server's exit result.
    Completed(io::Result<()>),
    DeadlineExceeded,
    /// A second signal arrived while draining.
    Forced,
}

/// Wait for the server to finish draining, at most `deadline`, or until
/// `force` resolves.
pub async fn drain<F, S>(server: Pin<&mut F>, deadline: Duration, force: S) -> DrainOutcome
where
    F: Future<Output = io::Result<()>>,
    S: Future<Output = ()>,
{
    tokio::select! {
        res = server => {
            tracing::info!("all connections drained");
            DrainOutcome::Completed(res)
        }
        _ = tokio::time::sleep(deadline) => {
            tracing::warn!(deadline_secs = deadline.as_secs(), "drain deadline exceeded; abandoning in-flight requests");
            DrainOutcome::DeadlineExceeded
        }
        _ = force => {
            tracing::warn!("second shutdown signal; forcing teardown");
            DrainOutcome::Forced
        }
    }
}

/// Release resources in reverse order of acquisition.
pub async fn teardown(state: &AppState, collector: &TelemetryCollector) {
    state.limiters.stop_all().await;
    collector.stop().await;
    state.cache.close();
    if let Some(redis) = &state.redis {
        redis.close().await;
    }
    if let Some(db) = &state.db {
        db.close().await;
    }
    tracing::info!("shutdown complete");
    crate::observability::shutdown_tracing();
}
