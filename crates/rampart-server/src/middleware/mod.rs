//! The request pipeline.
//!
//! Global layers, outermost first:
//!
//! 1. [`recover`] panic guard
//! 2. [`request_id`] correlation ID and request context
//! 3. [`security`] response hardening headers
//! 4. [`cors`]
//! 5. [`compression`]
//! 6. [`metrics`]
//! 7. [`access_log`]
//!
//! Per-route layers, in this order when present: [`timeout`], [`auth`],
//! [`limit`], [`breaker`]. See `server::build_app` for the wiring.

pub mod access_log;
pub mod auth;
pub mod breaker;
pub mod compression;
pub mod cors;
pub mod limit;
pub mod metrics;
pub mod recover;
pub mod request_id;
pub mod security;
pub mod timeout;

use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::http::Request;

/// Client address as seen by the listener, or `"unknown"` when the
/// connection info was not recorded.
pub fn client_addr<B>(req: &Request<B>) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
