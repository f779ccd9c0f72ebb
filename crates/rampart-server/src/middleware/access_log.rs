//! Structured access log.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use rampart_core::RequestContext;

use crate::config::AccessLogConfig;

#[derive(Debug, Clone)]
pub struct AccessLog {
    skip_paths: Arc<Vec<String>>,
    sample_rate: f64,
    slow_threshold: Duration,
}

impl AccessLog {
    pub fn new(config: &AccessLogConfig) -> Self {
        Self {
            skip_paths: Arc::new(config.skip_paths.clone()),
            sample_rate: config.sample_rate.clamp(0.0, 1.0),
            slow_threshold: Duration::from_millis(config.slow_threshold_ms),
        }
    }

    fn skips(&self, path: &str) -> bool {
        self.skip_paths.iter().any(|p| p == path)
    }

    /// Slow requests are always recorded; the rest are sampled.
    fn should_record(&self, elapsed: Duration) -> bool {
        if elapsed >= self.slow_threshold || self.sample_rate >= 1.0 {
            return true;
        }
        rand::random::<f64>() < self.sample_rate
    }
}

pub async fn access_log(
    State(log): State<AccessLog>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if log.skips(req.uri().path()) {
        return next.run(req).await;
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let client = super::client_addr(&req);
    let request_id = req
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id().to_string())
        .unwrap_or_default();

    let started = Instant::now();
    let response = next.run(req).await;
    let elapsed = started.elapsed();

    if !log.should_record(elapsed) {
        return response;
    }

    let status = response.status();
    let latency_ms = elapsed.as_millis() as u64;
    let slow = elapsed >= log.slow_threshold;
    let level = level_for(status);
    let status = status.as_u16();
    if level == tracing::Level::ERROR {
        tracing::error!(%method, %path, status, latency_ms, %client, %request_id, slow, "request");
    } else if level == tracing::Level::WARN {
        tracing::warn!(%method, %path, status, latency_ms, %client, %request_id, slow, "request");
    } else {
        tracing::info!(%method, %path, status, latency_ms, %client, %request_id, slow, "request");
    }
    response
}

/// Log level chosen for a status.
pub fn level_for(status: StatusCode) -> tracing::Level {
    if status.is_server_error() {
        tracing::Level::ERROR
    } else if status.is_client_error() {
        tracing::Level::WARN
    } else {
        tracing::Level::INFO
    }
}
