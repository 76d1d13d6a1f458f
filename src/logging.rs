//! Tracing subscriber setup for the binary.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::config::LoggingConfig;

/// Filter directive: `TANDEM_LOG`, then `RUST_LOG`, then the configured level.
pub fn filter_directive(config: &LoggingConfig) -> String {
    ["TANDEM_LOG", "RUST_LOG"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| config.level.clone())
}

/// Install the global subscriber. Logs go to stderr, and also to a daily
/// rolling JSON file when `file` is given. Keep the returned guard alive
/// until exit so buffered file output is flushed.
pub fn init(config: &LoggingConfig, file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let directive = filter_directive(config);
    let filter = EnvFilter::try_new(&directive)
        .with_context(|| format!("Invalid log filter '{}'", directive))?;

    let stderr_layer = if config.json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let (file_layer, guard) = match file {
        Some(path) => {
            let dir = path.parent().unwrap_or(Path::new("."));
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log dir: {}", dir.display()))?;
            let name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "tandem.log".into());
            let appender = tracing_appender::rolling::daily(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_level_is_the_fallback() {
        let config = LoggingConfig {
            level: "tandem=debug".into(),
            ..LoggingConfig::default()
        };
        if std::env::var("TANDEM_LOG").is_err() && std::env::var("RUST_LOG").is_err() {
            assert_eq!(filter_directive(&config), "tandem=debug");
        }
        assert!(EnvFilter::try_new(filter_directive(&config)).is_ok());
    }
}
