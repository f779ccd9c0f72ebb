//! Liveness and readiness reporting.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rampart_cache::{LocalStats, RedisCache};
use rampart_core::{CoreError, PoolSnapshot, RequestContext, now_rfc3339};
use serde::Serialize;

use crate::server::AppState;

/// Per-backend ping deadline.
pub const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// A pooled backend the health endpoints and telemetry collector can observe.
#[async_trait]
pub trait PoolProbe: Send + Sync {
    fn name(&self) -> &str;

    async fn ping(&self, ctx: &RequestContext) -> Result<(), CoreError>;

    fn snapshot(&self) -> PoolSnapshot;
}

#[async_trait]
impl PoolProbe for RedisCache {
    fn name(&self) -> &str {
        "redis"
    }

    async fn ping(&self, ctx: &RequestContext) -> Result<(), CoreError> {
        RedisCache::ping(self, ctx).await.map_err(CoreError::from)
    }

    fn snapshot(&self) -> PoolSnapshot {
        self.pool_stats()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    Up,
    Down,
    NotConfigured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::OK,
        }
    }
}

/// Overall status from the two backend states.
///
/// Production requires both backends up. Elsewhere a stateless deployment
/// (neither configured) is healthy, both configured and both down is
/// unhealthy, and anything in between is degraded.
pub fn classify(production: bool, mysql: BackendStatus, redis: BackendStatus) -> HealthStatus {
    use BackendStatus::*;

    if production {
        return if mysql == Up && redis == Up {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
    }
    match (mysql, redis) {
        (Up, Up) | (NotConfigured, NotConfigured) => HealthStatus::Healthy,
        (Down, Down) => HealthStatus::Unhealthy,
        _ => HealthStatus::Degraded,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub mysql: BackendStatus,
    pub redis: BackendStatus,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pools: Option<BTreeMap<String, PoolSnapshot>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<LocalStats>,
}

impl IntoResponse for HealthReport {
    fn into_response(self) -> Response {
        (self.status.http_status(), Json(self)).into_response()
    }
}

#[derive(Clone, Default)]
pub struct HealthChecker {
    production: bool,
    mysql: Option<Arc<dyn PoolProbe>>,
    redis: Option<Arc<dyn PoolProbe>>,
}

impl HealthChecker {
    pub fn new(
        production: bool,
        mysql: Option<Arc<dyn PoolProbe>>,
        redis: Option<Arc<dyn PoolProbe>>,
    ) -> Self {
        Self {
            production,
            mysql,
            redis,
        }
    }

    /// Configured backends, for the telemetry collector.
    pub fn probes(&self) -> Vec<Arc<dyn PoolProbe>> {
        self.mysql.iter().chain(self.redis.iter()).cloned().collect()
    }

    /// Ping both backends concurrently, each under its own deadline.
    pub async fn check(&self, ctx: &RequestContext) -> HealthReport {
        let (mysql, redis) = tokio::join!(
            probe_status(self.mysql.as_deref(), ctx),
            probe_status(self.redis.as_deref(), ctx),
        );
        HealthReport {
            status: classify(self.production, mysql, redis),
            mysql,
            redis,
            timestamp: now_rfc3339(),
            pools: None,
            cache: None,
        }
    }

    pub fn pools(&self) -> BTreeMap<String, PoolSnapshot> {
        self.probes()
            .into_iter()
            .map(|p| (p.name().to_string(), p.snapshot()))
            .collect()
    }
}

async fn probe_status(probe: Option<&dyn PoolProbe>, ctx: &RequestContext) -> BackendStatus {
    let Some(probe) = probe else {
        return BackendStatus::NotConfigured;
    };
    let ctx = ctx.child(PING_TIMEOUT);
    match ctx.run(probe.ping(&ctx)).await {
        Ok(Ok(())) => BackendStatus::Up,
        Ok(Err(e)) | Err(e) => {
            tracing::warn!(backend = probe.name(), error = %e, "health ping failed");
            BackendStatus::Down
        }
    }
}

pub async fn ping(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> HealthReport {
    state.health.check(&ctx).await
}

pub async fn health(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> HealthReport {
    let mut report = state.health.check(&ctx).await;
    report.pools = Some(state.health.pools());
    report.cache = Some(state.cache.stats());
    report
}
