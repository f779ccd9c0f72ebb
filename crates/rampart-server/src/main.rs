use std::process::ExitCode;

use rampart_server::config::loader::load_config;
use rampart_server::{ServerBuilder, shutdown_tracing};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_CONFIG: &str = "rampart.toml";

/// Where the configuration path came from, for the startup log.
#[derive(Debug)]
enum ConfigPath {
    Flag(String),
    Env(String),
    Default,
}

impl ConfigPath {
    /// `--config <path>` wins over `RAMPART_CONFIG`, which wins over
    /// `rampart.toml` in the working directory.
    fn resolve(mut args: impl Iterator<Item = String>) -> Self {
        while let Some(arg) = args.next() {
            if let Some(path) = arg.strip_prefix("--config=") {
                return Self::Flag(path.to_string());
            }
            if arg == "--config"
                && let Some(path) = args.next()
            {
                return Self::Flag(path);
            }
        }
        match std::env::var("RAMPART_CONFIG") {
            Ok(path) if !path.is_empty() => Self::Env(path),
            _ => Self::Default,
        }
    }

    fn path(&self) -> &str {
        match self {
            Self::Flag(p) | Self::Env(p) => p,
            Self::Default => DEFAULT_CONFIG,
        }
    }

    fn origin(&self) -> &'static str {
        match self {
            Self::Flag(_) => "--config",
            Self::Env(_) => "RAMPART_CONFIG",
            Self::Default => "default",
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => eprintln!("ignoring unreadable .env: {e}"),
    }

    let config_path = ConfigPath::resolve(std::env::args().skip(1));
    let cfg = match load_config(Some(config_path.path())) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("invalid configuration ({}): {e}", config_path.path());
            return ExitCode::from(2);
        }
    };

    rampart_server::observability::init_tracing_with_level(&cfg.logging.level);
    rampart_server::metrics::init_metrics();
    tracing::info!(
        path = config_path.path(),
        from = config_path.origin(),
        mode = ?cfg.server.mode,
        "configuration loaded"
    );

    let server = match ServerBuilder::new().with_config(cfg).build().await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "startup failed");
            shutdown_tracing();
            return ExitCode::from(2);
        }
    };

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("server error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
