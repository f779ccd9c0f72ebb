//! Log subscriber setup.
//!
//! The level filter sits behind a reload handle so `/debug/log-level` can
//! change it without a restart.
use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

static FILTER: OnceLock<FilterHandle> = OnceLock::new();

/// Install the global subscriber. `RUST_LOG`, when set and valid, overrides
/// `level`. Calling this twice keeps the first subscriber.
pub fn init_tracing_with_level(level: &str) {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) => EnvFilter::try_new(directives),
        Err(_) => EnvFilter::try_new(level),
    }
    .unwrap_or_else(|_| EnvFilter::new("info"));

    let (filter, handle) = reload::Layer::new(filter);
    if FILTER.set(handle).is_err() {
        return;
    }

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}

/// Swap the active filter for `level` (any `EnvFilter` directive string).
pub fn apply_logging_level(level: &str) -> Result<(), String> {
    let filter = EnvFilter::try_new(level).map_err(|e| e.to_string())?;
    FILTER
        .get()
        .ok_or_else(|| "logging is not initialized".to_string())?
        .reload(filter)
        .map_err(|e| e.to_string())
}

/// Last step of teardown.
///
/// The fmt layer writes synchronously, so flushing stdout and stderr is all
/// that is left to do.
pub fn shutdown_tracing() {
    use std::io::Write;
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_directive_is_rejected() {
        assert!(apply_logging_level("rampart=loud").is_err());
    }
}
