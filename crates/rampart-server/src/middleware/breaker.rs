use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::breaker::CircuitBreaker;
use crate::error::ApiError;

/// Guard a route group with a breaker. 5xx responses count as failures;
/// a panic drops the permit, which also counts as a failure.
pub async fn circuit_breaker(
    State(breaker): State<Arc<CircuitBreaker>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let permit = match breaker.try_acquire() {
        Ok(permit) => permit,
        Err(e) => {
            crate::metrics::record_breaker_rejected(breaker.name());
            return ApiError::from(e).into_response();
        }
    };

    let response = next.run(req).await;
    permit.record(!response.status().is_server_error());
    response
}
