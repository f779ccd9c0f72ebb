use thiserror::Error;

/// Error kinds that cross the resilience core boundary.
///
/// These are kinds, not transport errors: infrastructure failures are
/// logged where they become visible and mapped onto one of these before
/// leaving the pipeline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("{message}")]
    Validation { code: i32, message: String },

    #[error("not found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("too many requests")]
    RateLimited,

    #[error("circuit open")]
    CircuitOpen,

    #[error("request timeout")]
    Timeout,

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Create a new Validation error with a caller-selected code
    pub fn validation(code: i32, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    /// Create a new BackendUnavailable error
    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::BackendUnavailable(message.into())
    }

    /// Create a new Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// HTTP status code this kind maps to.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::NotFound => 404,
            // Forbidden deliberately collapses into 401 with the generic body.
            Self::Unauthorized | Self::Forbidden => 401,
            Self::RateLimited => 429,
            Self::CircuitOpen => 503,
            Self::Timeout => 408,
            Self::BackendUnavailable(_) => 503,
            Self::Internal(_) => 500,
        }
    }

    /// Application code carried in the response envelope.
    pub fn envelope_code(&self) -> i32 {
        match self {
            Self::Validation { code, .. } => *code,
            Self::NotFound => 4004,
            Self::Unauthorized | Self::Forbidden => 4001,
            Self::RateLimited => 4029,
            Self::CircuitOpen => 5003,
            Self::Timeout => 4008,
            Self::BackendUnavailable(_) => 5002,
            Self::Internal(_) => 5000,
        }
    }

    /// Message exposed to clients. Never leaks backend details.
    pub fn public_message(&self) -> String {
        match self {
            Self::Validation { message, .. } => message.clone(),
            Self::NotFound => "not found".into(),
            Self::Unauthorized | Self::Forbidden => "unauthorized".into(),
            Self::RateLimited => "too many requests".into(),
            Self::CircuitOpen => "service unavailable".into(),
            Self::Timeout => "request timeout".into(),
            Self::BackendUnavailable(_) => "service unavailable".into(),
            Self::Internal(_) => "internal server error".into(),
        }
    }

    /// Whether a caller may retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::BackendUnavailable(_) | Self::CircuitOpen | Self::RateLimited
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_and_codes() {
        assert_eq!(CoreError::RateLimited.status_code(), 429);
        assert_eq!(CoreError::RateLimited.envelope_code(), 4029);
        assert_eq!(CoreError::CircuitOpen.status_code(), 503);
        assert_eq!(CoreError::CircuitOpen.envelope_code(), 5003);
        assert_eq!(CoreError::Timeout.status_code(), 408);
        assert_eq!(CoreError::Timeout.envelope_code(), 4008);
        assert_eq!(CoreError::internal("boom").status_code(), 500);
    }

    #[test]
    fn test_auth_failures_are_indistinguishable() {
        assert_eq!(
            CoreError::Unauthorized.status_code(),
            CoreError::Forbidden.status_code()
        );
        assert_eq!(
            CoreError::Unauthorized.public_message(),
            CoreError::Forbidden.public_message()
        );
    }

    #[test]
    fn test_validation_keeps_caller_code() {
        let err = CoreError::validation(4101, "username too short");
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.envelope_code(), 4101);
        assert_eq!(err.public_message(), "username too short");
    }

    #[test]
    fn test_backend_details_not_public() {
        let err = CoreError::backend_unavailable("redis://10.0.0.3 refused");
        assert!(!err.public_message().contains("redis"));
        assert!(err.is_retryable());
    }
}
