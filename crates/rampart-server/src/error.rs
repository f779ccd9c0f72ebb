//! Error envelope returned by the pipeline and handlers.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rampart_core::CoreError;
use serde_json::{Value, json};
use thiserror::Error;

/// Envelope code for endpoints that exist but have no implementation here.
pub const CODE_NOT_IMPLEMENTED: i32 = 5001;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Route reserved for the business layer.
    #[error("not implemented")]
    NotImplemented,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Core(e) => {
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Self::NotImplemented => StatusCode::NOT_IMPLEMENTED,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::Core(e) => e.envelope_code(),
            Self::NotImplemented => CODE_NOT_IMPLEMENTED,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Core(e) => e.public_message(),
            Self::NotImplemented => "not implemented".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error()
            && let Self::Core(e) = &self
        {
            tracing::error!(error = %e, "request failed");
        }
        envelope(status, self.code(), &self.message(), None)
    }
}

/// Render `{code, message, data?}` with the given status.
pub fn envelope(status: StatusCode, code: i32, message: &str, data: Option<Value>) -> Response {
    let body = match data {
        Some(data) => json!({ "code": code, "message": message, "data": data }),
        None => json!({ "code": code, "message": message }),
    };
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_rate_limited_envelope() {
        let response = ApiError::from(CoreError::RateLimited).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            body_json(response).await,
            json!({ "code": 4029, "message": "too many requests" })
        );
    }

    #[tokio::test]
    async fn test_forbidden_renders_as_generic_unauthorized() {
        let response = ApiError::from(CoreError::Forbidden).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            body_json(response).await,
            json!({ "code": 4001, "message": "unauthorized" })
        );
    }

    #[tokio::test]
    async fn test_envelope_with_data() {
        let response = envelope(StatusCode::OK, 0, "ok", Some(json!({ "id": 42 })));
        assert_eq!(
            body_json(response).await,
            json!({ "code": 0, "message": "ok", "data": { "id": 42 } })
        );
    }

    #[test]
    fn test_not_implemented() {
        assert_eq!(ApiError::NotImplemented.status(), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(ApiError::NotImplemented.code(), CODE_NOT_IMPLEMENTED);
    }
}
