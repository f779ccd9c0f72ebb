use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post, put},
};
use rampart_cache::{ReadThrough, RedisCache, SharedStore};
use rampart_core::{Clock, CoreError, SystemClock};
use rand::RngCore;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::breaker::{BreakerRegistry, CircuitBreaker};
use crate::config::AppConfig;
use crate::db::Database;
use crate::debug::{self, DebugGate};
use crate::error::ApiError;
use crate::health::{self, HealthChecker, PoolProbe};
use crate::handlers;
use crate::lifecycle::{self, DrainOutcome};
use crate::limiter::{DistributedRateLimiter, LimiterRegistry, LocalRateLimiter, RateLimiter};
use crate::middleware::{
    access_log::{self, AccessLog},
    auth::{self, AuthState, Hs256Verifier, TokenBlacklist},
    breaker::circuit_breaker,
    compression::{self, ExcludedExtensions},
    cors::{self, CorsPolicy},
    limit::rate_limit,
    metrics::http_metrics,
    recover::panic_guard,
    request_id::request_id_middleware,
    security::security_headers,
    timeout::{RequestTimeout, timeout_middleware},
};
use crate::telemetry::{StatsSource, TelemetryCollector};

/// Collaborators shared by the pipeline and handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub clock: Arc<dyn Clock>,
    pub db: Option<Database>,
    pub redis: Option<RedisCache>,
    /// Read-through cache for JSON payloads
    pub cache: Arc<ReadThrough<Value>>,
    pub health: HealthChecker,
    pub limiters: Arc<LimiterRegistry>,
    pub general_limiter: Option<Arc<dyn RateLimiter>>,
    pub auth_limiter: Option<Arc<dyn RateLimiter>>,
    pub breakers: Arc<BreakerRegistry>,
    pub auth: AuthState,
}

impl AppState {
    /// Wire collaborators around already-opened backends.
    ///
    /// Starts limiter sweepers, so it must run inside a Tokio runtime.
    pub fn new(config: AppConfig, db: Option<Database>, redis: Option<RedisCache>) -> Self {
        let clock = SystemClock::shared();
        let shared: Option<Arc<dyn SharedStore>> = redis
            .clone()
            .map(|r| Arc::new(r) as Arc<dyn SharedStore>);

        let cache = Arc::new(ReadThrough::new(
            config.cache.to_read_through_config(),
            shared.clone(),
        ));

        let health = HealthChecker::new(
            config.is_production(),
            db.clone().map(|d| Arc::new(d) as Arc<dyn PoolProbe>),
            redis.clone().map(|r| Arc::new(r) as Arc<dyn PoolProbe>),
        );

        let limiters = Arc::new(LimiterRegistry::new());
        let rl = &config.rate_limit;
        let (general_limiter, auth_limiter) = if rl.enabled {
            let cluster = redis.as_ref().filter(|_| rl.distributed);
            let scoped = |name: &str, local: Arc<LocalRateLimiter>, policy| -> Arc<dyn RateLimiter> {
                match cluster {
                    Some(redis) => Arc::new(DistributedRateLimiter::new(
                        name,
                        redis.clone(),
                        policy,
                        Arc::clone(&clock),
                        local,
                    )),
                    None => local,
                }
            };
            let general = scoped(
                "general",
                limiters.register(Arc::new(LocalRateLimiter::new(
                    "general",
                    rl.general(),
                    Arc::clone(&clock),
                ))),
                rl.distributed_policy(),
            );
            let auth = scoped(
                "auth",
                limiters.register(Arc::new(LocalRateLimiter::new(
                    "auth",
                    rl.auth(),
                    Arc::clone(&clock),
                ))),
                rl.auth_policy(),
            );
            tracing::info!(
                cluster_wide = general.is_cluster_wide(),
                "rate limiters ready"
            );
            (Some(general), Some(auth))
        } else {
            (None, None)
        };

        let breakers = Arc::new(BreakerRegistry::new(
            config.breaker.settings(),
            Arc::clone(&clock),
        ));

        let secret = if config.auth.jwt_secret.is_empty() {
            tracing::warn!("auth.jwt_secret not set; using a random secret, bearer tokens will not validate across restarts");
            let mut bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut bytes);
            bytes.iter().map(|b| format!("{b:02x}")).collect()
        } else {
            config.auth.jwt_secret.clone()
        };
        let auth = AuthState {
            verifier: Arc::new(Hs256Verifier::new(
                &secret,
                config.auth.issuer.as_deref(),
                config.auth.leeway_secs,
            )),
            blacklist: TokenBlacklist::new(shared),
        };

        Self {
            config: Arc::new(config),
            clock,
            db,
            redis,
            cache,
            health,
            limiters,
            general_limiter,
            auth_limiter,
            breakers,
            auth,
        }
    }

    /// Breaker guarding the authenticated API, when breaking is enabled.
    pub fn api_breaker(&self) -> Option<Arc<CircuitBreaker>> {
        self.config
            .breaker
            .enabled
            .then(|| self.breakers.get("api"))
    }
}

async fn not_found() -> ApiError {
    ApiError::from(CoreError::NotFound)
}

pub fn build_app(state: &AppState) -> Router {
    let cfg = &state.config;

    let health_routes = Router::new()
        .route("/ping", get(health::ping))
        .route("/health", get(health::health));

    let debug_routes = Router::new()
        .route("/metrics", get(debug::metrics_handler))
        .route("/debug/pprof", get(debug::pprof_index))
        .route("/debug/pprof/{*profile}", get(debug::pprof))
        .route("/debug/log-level", put(debug::set_log_level))
        .route_layer(middleware::from_fn_with_state(
            DebugGate::new(cfg.debug.resolved_token(), cfg.is_production()),
            debug::debug_gate,
        ));

    // Per-route layers: the last one added runs first.
    let mut auth_routes = Router::new()
        .route("/api/v1/auth/register", post(handlers::register))
        .route("/api/v1/auth/login", post(handlers::login));
    if let Some(limiter) = &state.auth_limiter {
        auth_routes =
            auth_routes.route_layer(middleware::from_fn_with_state(limiter.clone(), rate_limit));
    }

    let mut api_routes = Router::new().route("/api/v1/whoami", get(handlers::whoami));
    if let Some(breaker) = state.api_breaker() {
        api_routes = api_routes.route_layer(middleware::from_fn_with_state(breaker, circuit_breaker));
    }
    if let Some(limiter) = &state.general_limiter {
        api_routes =
            api_routes.route_layer(middleware::from_fn_with_state(limiter.clone(), rate_limit));
    }
    api_routes = api_routes.route_layer(middleware::from_fn_with_state(
        state.auth.clone(),
        auth::require_auth,
    ));

    if let Some(timeout) = cfg.request_timeout() {
        let layer = middleware::from_fn_with_state(RequestTimeout(timeout), timeout_middleware);
        auth_routes = auth_routes.route_layer(layer.clone());
        api_routes = api_routes.route_layer(layer);
    }

    let mut app = Router::new()
        .merge(health_routes)
        .merge(debug_routes)
        .merge(auth_routes)
        .merge(api_routes)
        .fallback(not_found)
        .with_state(state.clone())
        .layer(DefaultBodyLimit::max(cfg.server.body_limit_bytes))
        .layer(middleware::from_fn_with_state(
            AccessLog::new(&cfg.access_log),
            access_log::access_log,
        ))
        .layer(middleware::from_fn(http_metrics));

    if cfg.compression.enabled {
        app = app
            .layer(middleware::from_fn_with_state(
                ExcludedExtensions::new(&cfg.compression.excluded_extensions),
                compression::mark_excluded,
            ))
            .layer(compression::layer());
    }

    // Global layers, innermost to outermost:
    // ... -> cors -> security headers -> correlation id -> panic guard
    app.layer(middleware::from_fn_with_state(
        CorsPolicy::new(&cfg.cors, !cfg.is_production()),
        cors::cors_middleware,
    ))
    .layer(middleware::from_fn(security_headers))
    .layer(middleware::from_fn(request_id_middleware))
    .layer(middleware::from_fn(panic_guard))
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    /// Open backends, build the cache and limiters and start telemetry.
    pub async fn build(self) -> anyhow::Result<RampartServer> {
        let (db, redis) = lifecycle::open_backends(&self.config).await?;
        let interval = std::time::Duration::from_secs(self.config.telemetry.interval_secs);

        let state = AppState::new(self.config, db, redis);

        let cache = Arc::clone(&state.cache);
        let stats: StatsSource = Arc::new(move || cache.stats());
        let collector = TelemetryCollector::start(interval, state.health.probes(), Some(stats));

        let app = build_app(&state);
        Ok(RampartServer {
            addr: self.addr,
            app,
            state,
            collector,
        })
    }
}

pub struct RampartServer {
    addr: SocketAddr,
    app: Router,
    state: AppState,
    collector: TelemetryCollector,
}

impl RampartServer {
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve until a shutdown signal, drain, then tear down.
    pub async fn run(self) -> anyhow::Result<()> {
        crate::middleware::recover::install_panic_hook();

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);

        let shutdown = CancellationToken::new();
        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            lifecycle::wait_for_signal().await;
            tracing::info!("shutdown signal received; draining in-flight requests");
            signal_token.cancel();
        });

        let serve = axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .into_future();
        let mut serve = std::pin::pin!(serve);

        let result = tokio::select! {
            res = &mut serve => res.map_err(anyhow::Error::from),
            _ = shutdown.cancelled() => {
                let deadline = self.state.config.drain_deadline();
                match lifecycle::drain(serve.as_mut(), deadline, lifecycle::wait_for_signal()).await {
                    DrainOutcome::Completed(res) => res.map_err(anyhow::Error::from),
                    DrainOutcome::DeadlineExceeded | DrainOutcome::Forced => Ok(()),
                }
            }
        };

        lifecycle::teardown(&self.state, &self.collector).await;
        result
    }
}
