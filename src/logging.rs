//! Logging setup: console subscriber for the CLI, optional file logger.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;

/// Daemon log directory: `$ACTOR_DAEMON_LOG_DIR`, else `$HOME/.jaeger`.
pub fn default_log_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("ACTOR_DAEMON_LOG_DIR") {
        return PathBuf::from(dir);
    }
    std::env::var_os("HOME")
        .map(|home| Path::new(&home).join(".jaeger"))
        .unwrap_or_else(|| PathBuf::from(".jaeger"))
}

fn env_filter(verbosity: u8, quiet: bool) -> EnvFilter {
    let level = if quiet {
        "error"
    } else {
        match verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("jaeger={level}")))
}

/// Initialises the global subscriber for the CLI: console output plus a
/// `jaeger.log` file under the log directory when one can be opened.
pub fn init(verbosity: u8, quiet: bool, log_dir: Option<&Path>) {
    let dir = log_dir.map(Path::to_path_buf).unwrap_or_else(default_log_dir);
    let file = std::fs::create_dir_all(&dir).ok().and_then(|_| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("jaeger.log"))
            .ok()
    });

    let registry = tracing_subscriber::registry()
        .with(env_filter(verbosity, quiet))
        .with(fmt::layer());

    match file {
        Some(file) => {
            let _ = registry
                .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
                .try_init();
        }
        None => {
            let _ = registry.try_init();
        }
    }
}

/// Idempotent file-logger startup for library use. A no-op once any global
/// subscriber is installed.
pub fn start_file_loggers(config: &Config) {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    init(0, false, config.files.log_dir.as_deref());
}
