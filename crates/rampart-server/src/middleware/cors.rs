//! Allow-list CORS.
//!
//! Preflights from allowed origins get 204 with the negotiated headers;
//! preflights from anywhere else get 403. Simple requests from unknown
//! origins pass through without CORS headers, which the browser enforces.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{
        HeaderMap, HeaderValue, Method, Request, StatusCode,
        header::{
            ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS,
            ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
            ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE,
            ACCESS_CONTROL_REQUEST_HEADERS, ACCESS_CONTROL_REQUEST_METHOD, ORIGIN, VARY,
        },
    },
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::config::CorsConfig;

const ALLOWED_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS";

#[derive(Debug, Clone)]
pub struct CorsPolicy {
    origins: Arc<Vec<String>>,
    allow_localhost: bool,
    allow_credentials: bool,
    max_age: HeaderValue,
}

impl CorsPolicy {
    /// `allow_localhost` admits any `http(s)://localhost` or `127.0.0.1`
    /// origin, whatever the port. Enabled in development.
    pub fn new(config: &CorsConfig, allow_localhost: bool) -> Self {
        Self {
            origins: Arc::new(config.allowed_origins.clone()),
            allow_localhost,
            allow_credentials: config.allow_credentials,
            max_age: HeaderValue::from(config.max_age_secs),
        }
    }

    pub fn allows(&self, origin: &str) -> bool {
        if self.origins.iter().any(|o| o == "*" || o == origin) {
            return true;
        }
        self.allow_localhost && is_localhost(origin)
    }

    fn decorate(&self, headers: &mut HeaderMap, origin: HeaderValue) {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        headers.append(VARY, HeaderValue::from_static("origin"));
        if self.allow_credentials {
            headers.insert(
                ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
    }
}

fn is_localhost(origin: &str) -> bool {
    let Some(rest) = origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"))
    else {
        return false;
    };
    let host = rest.split(':').next().unwrap_or_default();
    host == "localhost" || host == "127.0.0.1"
}

pub async fn cors_middleware(
    State(policy): State<CorsPolicy>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(origin) = req.headers().get(ORIGIN).cloned() else {
        return next.run(req).await;
    };
    let allowed = origin.to_str().is_ok_and(|o| policy.allows(o));

    let is_preflight = req.method() == Method::OPTIONS
        && req.headers().contains_key(ACCESS_CONTROL_REQUEST_METHOD);
    if is_preflight {
        if !allowed {
            tracing::debug!(origin = ?origin, "CORS preflight rejected");
            return StatusCode::FORBIDDEN.into_response();
        }
        let mut response = StatusCode::NO_CONTENT.into_response();
        let headers = response.headers_mut();
        policy.decorate(headers, origin);
        headers.insert(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOWED_METHODS),
        );
        if let Some(requested) = req.headers().get(ACCESS_CONTROL_REQUEST_HEADERS) {
            headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
        }
        headers.insert(ACCESS_CONTROL_MAX_AGE, policy.max_age.clone());
        return response;
    }

    let mut response = next.run(req).await;
    if allowed {
        let headers = response.headers_mut();
        policy.decorate(headers, origin);
        headers.insert(
            ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static(rampart_core::REQUEST_ID_HEADER),
        );
    }
    response
}
