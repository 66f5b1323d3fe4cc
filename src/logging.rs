//! Tracing subscriber setup.

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

pub const DEFAULT_FILTER: &str = "forge_flow=info";

const LOG_FILE_PREFIX: &str = "forge-flow.log";

/// Keeps the non-blocking file writer flushing until dropped.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// `RUST_LOG` wins; otherwise the configured directive, otherwise the default.
pub fn filter_directive(config: &LoggingConfig, rust_log: Option<&str>) -> String {
    rust_log
        .filter(|v| !v.trim().is_empty())
        .or(config.filter.as_deref())
        .unwrap_or(DEFAULT_FILTER)
        .to_string()
}

/// Install the global subscriber. Safe to call more than once; later calls
/// leave the first subscriber in place.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let directive = filter_directive(config, rust_log.as_deref());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (file_layer, file_guard) = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    let json_layer = config
        .json
        .then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!config.json).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!(filter = %directive, json = config.json, "logging initialised");
    }

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
