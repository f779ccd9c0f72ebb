//! Placeholder business routes.
//!
//! Account management belongs to the business layer; these routes exist so
//! the pipeline in front of them (auth limiter, bearer auth) is wired and
//! testable.

use axum::{Extension, http::StatusCode, response::Response};
use rampart_core::{CoreError, RequestContext};
use serde_json::json;

use crate::error::{ApiError, envelope};

pub async fn register() -> ApiError {
    ApiError::NotImplemented
}

pub async fn login() -> ApiError {
    ApiError::NotImplemented
}

/// The caller as established by bearer auth.
pub async fn whoami(Extension(ctx): Extension<RequestContext>) -> Result<Response, ApiError> {
    let identity = ctx.identity().ok_or(CoreError::Unauthorized)?;
    Ok(envelope(
        StatusCode::OK,
        0,
        "ok",
        Some(json!({ "subject": identity.subject, "roles": identity.roles })),
    ))
}
