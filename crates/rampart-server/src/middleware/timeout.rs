//! Per-route request deadline.
//!
//! The inner chain runs on its own task so the 408 can be sent while the
//! handler is still working. The handler is not aborted: the request
//! context is cancelled and the handler is expected to notice at its next
//! suspension point.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use futures_util::FutureExt;
use rampart_core::{CoreError, RequestContext, RequestId};
use tracing::Instrument;

use super::recover::CaughtPanic;
use crate::error::envelope;

#[derive(Debug, Clone, Copy)]
pub struct RequestTimeout(pub Duration);

pub async fn timeout_middleware(
    State(RequestTimeout(timeout)): State<RequestTimeout>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let parent = req
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_else(|| RequestContext::new(RequestId::mint()));
    let ctx = parent.child(timeout);
    req.extensions_mut().insert(ctx.clone());

    let span = ctx.span().clone();
    let mut task = tokio::spawn(
        AssertUnwindSafe(next.run(req))
            .catch_unwind()
            .map(|outcome| outcome.map_err(CaughtPanic::from_payload))
            .instrument(span),
    );

    tokio::select! {
        joined = &mut task => match joined {
            Ok(Ok(response)) => response,
            // Re-raise so the panic guard handles it like any other panic.
            Ok(Err(caught)) => std::panic::resume_unwind(Box::new(caught)),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => {
                tracing::error!(error = %e, "request task failed");
                let err = CoreError::internal(e.to_string());
                envelope(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    err.envelope_code(),
                    &err.public_message(),
                    None,
                )
            }
        },
        _ = tokio::time::sleep(timeout) => {
            ctx.cancel();
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "request timed out");
            let err = CoreError::Timeout;
            envelope(
                StatusCode::REQUEST_TIMEOUT,
                err.envelope_code(),
                &err.public_message(),
                None,
            )
        }
    }
}
