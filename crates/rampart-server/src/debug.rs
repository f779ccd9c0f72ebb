//! Operator endpoints: `/metrics` and `/debug/*`.
//!
//! In production these require `Authorization: Bearer <DEBUG_AUTH_TOKEN>`
//! and answer 403 when no token is configured. In development they are
//! open unless a token is configured. Tokens in the query string are always
//! rejected because they end up in access logs.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{Request, StatusCode, header, header::AUTHORIZATION},
    middleware::Next,
    response::{IntoResponse, Response},
};
use rampart_core::CoreError;
use serde::Deserialize;
use serde_json::json;

use crate::error::{ApiError, envelope};

const QUERY_TOKEN_PARAMS: &[&str] = &["token", "access_token", "auth_token"];

/// Compare two secrets in time that depends only on their lengths.
pub fn secure_compare(a: &[u8], b: &[u8]) -> bool {
    let len = a.len().max(b.len());
    let mut diff = a.len() ^ b.len();
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= usize::from(x ^ y);
    }
    std::hint::black_box(diff) == 0
}

#[derive(Clone)]
pub struct DebugGate {
    token: Option<Arc<str>>,
    production: bool,
}

impl DebugGate {
    pub fn new(token: Option<String>, production: bool) -> Self {
        Self {
            token: token.map(Arc::from),
            production,
        }
    }
}

fn has_query_token(query: Option<&str>) -> bool {
    query.is_some_and(|q| {
        q.split('&')
            .filter_map(|pair| pair.split('=').next())
            .any(|name| QUERY_TOKEN_PARAMS.contains(&name))
    })
}

pub async fn debug_gate(State(gate): State<DebugGate>, req: Request<Body>, next: Next) -> Response {
    if has_query_token(req.uri().query()) {
        tracing::warn!(path = %req.uri().path(), "debug token passed in query string");
        return ApiError::from(CoreError::Unauthorized).into_response();
    }

    let Some(expected) = &gate.token else {
        if gate.production {
            return envelope(StatusCode::FORBIDDEN, 4003, "forbidden", None);
        }
        return next.run(req).await;
    };

    let presented = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .unwrap_or_default();
    if secure_compare(presented.as_bytes(), expected.as_bytes()) {
        next.run(req).await
    } else {
        ApiError::from(CoreError::Unauthorized).into_response()
    }
}

pub async fn metrics_handler() -> Response {
    match crate::metrics::render_metrics() {
        Some(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response(),
    }
}

pub async fn pprof_index() -> Response {
    Json(json!({ "profiles": ["runtime", "build"] })).into_response()
}

/// Runtime diagnostics. There is no sampling profiler here; the closest
/// equivalents are the tokio scheduler counters and the build metadata.
pub async fn pprof(Path(profile): Path<String>) -> Response {
    match profile.trim_matches('/') {
        "" => pprof_index().await,
        "runtime" => {
            let metrics = tokio::runtime::Handle::current().metrics();
            Json(json!({
                "workers": metrics.num_workers(),
                "alive_tasks": metrics.num_alive_tasks(),
                "global_queue_depth": metrics.global_queue_depth(),
            }))
            .into_response()
        }
        "build" => Json(json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "debug_assertions": cfg!(debug_assertions),
        }))
        .into_response(),
        _ => ApiError::from(CoreError::NotFound).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct LogLevelRequest {
    pub level: String,
}

pub async fn set_log_level(Json(body): Json<LogLevelRequest>) -> Response {
    match crate::observability::apply_logging_level(&body.level) {
        Ok(()) => {
            tracing::info!(level = %body.level, "log level changed");
            envelope(StatusCode::OK, 0, "ok", Some(json!({ "level": body.level })))
        }
        Err(e) => ApiError::from(CoreError::validation(4000, e)).into_response(),
    }
}
