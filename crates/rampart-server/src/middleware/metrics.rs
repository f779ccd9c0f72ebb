use std::time::Instant;

use axum::{
    body::Body,
    extract::MatchedPath,
    http::Request,
    middleware::Next,
    response::Response,
};

/// Decrements the in-flight gauge even when the inner chain unwinds.
struct InFlight;

impl InFlight {
    fn enter() -> Self {
        crate::metrics::increment_in_flight();
        Self
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        crate::metrics::decrement_in_flight();
    }
}

pub async fn http_metrics(req: Request<Body>, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let _in_flight = InFlight::enter();
    let started = Instant::now();
    let response = next.run(req).await;
    crate::metrics::record_http_request(
        &method,
        &path,
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}
