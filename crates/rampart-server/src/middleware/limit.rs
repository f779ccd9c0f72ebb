use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use rampart_core::{CoreError, RequestContext};

use crate::error::ApiError;
use crate::limiter::RateLimiter;

/// Admit or reject the request by client address.
pub async fn rate_limit(
    State(limiter): State<Arc<dyn RateLimiter>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let identity = super::client_addr(&req);
    let ctx = req
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_else(RequestContext::background);

    if limiter.allow(&ctx, &identity).await {
        return next.run(req).await;
    }

    crate::metrics::record_limiter_denied(limiter.name());
    tracing::debug!(limiter = limiter.name(), %identity, "rate limited");
    ApiError::from(CoreError::RateLimited).into_response()
}
