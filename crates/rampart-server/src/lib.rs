//! HTTP service built around a request-path resilience core.
//!
//! - [`middleware`]: the ordered request pipeline
//! - [`limiter`]: local and distributed rate limiting
//! - [`breaker`]: per-dependency circuit breakers
//! - [`health`] and [`telemetry`]: backend liveness and pool statistics
//! - [`server`] and [`lifecycle`]: wiring, startup and graceful shutdown

pub mod breaker;
pub mod config;
pub mod db;
pub mod debug;
pub mod error;
pub mod handlers;
pub mod health;
pub mod lifecycle;
pub mod limiter;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod server;
pub mod telemetry;

pub use config::AppConfig;
pub use error::ApiError;
pub use observability::shutdown_tracing;
pub use server::{AppState, RampartServer, ServerBuilder, build_app};
