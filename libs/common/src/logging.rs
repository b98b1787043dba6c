//! Unified logging module for VoltageEMS services
//!
//! Console output plus an optional daily-rolling file, both using the
//! `timestamp [LEVEL] message` format.

use std::path::PathBuf;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Custom event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2025-12-02T00:50:44.809Z [INFO] Service started`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.3fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m", // magenta
                Level::DEBUG => "\x1b[34m", // blue
                Level::INFO => "\x1b[32m",  // green
                Level::WARN => "\x1b[33m",  // yellow
                Level::ERROR => "\x1b[31m", // red
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

// ============================================================================
// Log Root Directory Configuration
// ============================================================================

/// Global log root directory
/// Priority: VOLTAGE_LOG_DIR env > config_dir > default "logs"
static LOG_ROOT: OnceLock<PathBuf> = OnceLock::new();

/// Initialize log root directory from config or environment.
/// Only the first call has an effect.
pub fn init_log_root(config_dir: Option<&str>) {
    LOG_ROOT.get_or_init(|| resolve_log_root(config_dir));
}

/// Get log root directory
pub fn get_log_root() -> PathBuf {
    LOG_ROOT
        .get()
        .cloned()
        .unwrap_or_else(|| resolve_log_root(None))
}

fn resolve_log_root(config_dir: Option<&str>) -> PathBuf {
    std::env::var("VOLTAGE_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            config_dir
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("logs"))
        })
}

// ============================================================================
// Configuration
// ============================================================================

/// Logging configuration section shared by services
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter spec (e.g. "info", "info,dosrv=debug")
    pub level: String,
    /// Log directory; `VOLTAGE_LOG_DIR` wins when set
    pub dir: Option<String>,
    /// Write a daily-rolling file next to console output
    pub file: bool,
    /// Use JSON lines in the log file
    pub json: bool,
    /// Colorize console output
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            file: false,
            json: false,
            ansi: true,
        }
    }
}

/// Keeps the non-blocking file writer alive; drop flushes pending lines
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Build the filter: `RUST_LOG` when set, else the configured level
fn build_filter(service_name: &str, level: &str) -> EnvFilter {
    if let Ok(env_str) = std::env::var("RUST_LOG") {
        if let Ok(filter) = EnvFilter::try_new(&env_str) {
            return filter;
        }
    }
    let spec = if level.contains('=') || level.contains(',') {
        level.to_string()
    } else {
        format!("{level},{service_name}={level}")
    };
    EnvFilter::try_new(&spec).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize logging for a service.
///
/// Installs the global subscriber; a second call in the same process fails.
pub fn init_logging(
    service_name: &str,
    config: &LoggingConfig,
) -> Result<LoggingGuard, Box<dyn std::error::Error>> {
    init_log_root(config.dir.as_deref());

    let filter = build_filter(service_name, &config.level);

    let console_layer = fmt::layer()
        .with_ansi(config.ansi)
        .event_format(BracketedLevelFormat)
        .boxed();

    let (file_layer, file_guard) = if config.file {
        let log_dir = get_log_root();
        std::fs::create_dir_all(&log_dir)?;
        let appender = tracing_appender::rolling::daily(&log_dir, format!("{service_name}.log"));
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        let layer = if config.json {
            fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_target(true)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .event_format(BracketedLevelFormat)
                .boxed()
        };
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    if config.file {
        tracing::info!("Logging: {} @ {:?}", service_name, get_log_root());
    }

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_format_level() {
        assert_eq!(format_level(&Level::INFO), "[INFO]");
        assert_eq!(format_level(&Level::ERROR), "[ERROR]");
    }

    #[test]
    fn test_logging_config_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert!(!config.file);
        assert!(config.ansi);
    }

    #[test]
    fn test_logging_config_partial_yaml() {
        let config: LoggingConfig = serde_yaml::from_str("level: debug\nfile: true\n").unwrap();
        assert_eq!(config.level, "debug");
        assert!(config.file);
        assert!(!config.json);
    }
}
