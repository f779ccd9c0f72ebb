use rampart_core::CoreError;
use thiserror::Error;

/// Errors raised by the cache tiers.
///
/// These never reach a client directly: the read-through path demotes them
/// to misses and logs them.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Connection-level failure. Safe to retry.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server rejected the command (wrong type, script error).
    #[error("command error: {0}")]
    Command(String),

    /// The caller's deadline passed or its context was cancelled.
    #[error("operation timed out")]
    Timeout,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("cache is closed")]
    Closed,

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
        {
            Self::Transport(e.to_string())
        } else {
            Self::Command(e.to_string())
        }
    }
}

impl From<deadpool_redis::PoolError> for CacheError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        match e {
            deadpool_redis::PoolError::Backend(inner) => inner.into(),
            deadpool_redis::PoolError::Closed => Self::Closed,
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<CacheError> for CoreError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Timeout => CoreError::Timeout,
            CacheError::Transport(msg) => CoreError::BackendUnavailable(msg),
            other => CoreError::Internal(other.to_string()),
        }
    }
}
