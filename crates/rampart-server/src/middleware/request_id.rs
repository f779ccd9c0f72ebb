//! Correlation ID and request context.

use axum::{
    body::Body,
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use rampart_core::{REQUEST_ID_HEADER, RequestContext, RequestId};
use tracing::Instrument;

use super::recover::RecoverySlot;

/// Adopt the incoming `X-Request-ID` or mint one, open the request span and
/// attach a [`RequestContext`] for downstream layers and handlers.
///
/// The response always carries the ID.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response {
    let incoming = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|h| h.to_str().ok());
    let request_id = RequestId::adopt_or_mint(incoming);

    if let Some(slot) = req.extensions().get::<RecoverySlot>() {
        slot.fill(request_id.clone());
    }

    let ctx = RequestContext::new(request_id.clone());
    let span = ctx.span().clone();
    req.extensions_mut().insert(ctx);

    let mut response = next.run(req).instrument(span).await;

    match HeaderValue::from_str(request_id.as_str()) {
        Ok(value) => {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        Err(_) => tracing::warn!(request_id = %request_id, "request id is not a valid header value"),
    }
    response
}
