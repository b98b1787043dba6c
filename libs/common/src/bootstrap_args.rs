//! Common command-line arguments for VoltageEMS services
//!
//! Services flatten [`ServiceArgs`] into their own clap parser.

use std::path::PathBuf;

#[cfg(feature = "cli")]
use clap::Args;

/// Common service startup arguments
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "cli", derive(Args))]
pub struct ServiceArgs {
    /// Log level override (trace, debug, info, warn, error); RUST_LOG wins when set
    #[cfg_attr(feature = "cli", arg(short = 'l', long, global = true))]
    pub log_level: Option<String>,

    /// Configuration file (YAML)
    #[cfg_attr(feature = "cli", arg(short = 'c', long, global = true, env = "VOLTAGE_CONFIG"))]
    pub config: Option<PathBuf>,

    /// Custom database path override
    #[cfg_attr(feature = "cli", arg(long, global = true, env = "DB_PATH"))]
    pub db_path: Option<String>,

    /// Disable colored output (useful for log files)
    #[cfg_attr(feature = "cli", arg(long, global = true))]
    pub no_color: bool,

    /// Only validate configuration without starting service
    #[cfg_attr(feature = "cli", arg(long, global = true))]
    pub validate: bool,
}

impl ServiceArgs {
    /// Parse log level string to tracing::Level
    pub fn parse_log_level(&self) -> tracing::Level {
        match self
            .log_level
            .as_deref()
            .unwrap_or("info")
            .to_lowercase()
            .as_str()
        {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "warn" | "warning" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }

    /// Database path: flag/DB_PATH > VOLTAGE_DB_PATH > DATABASE_DIR > `default`
    pub fn get_db_path(&self, default: &str) -> String {
        if let Some(path) = &self.db_path {
            return path.clone();
        }

        if let Ok(path) = std::env::var("VOLTAGE_DB_PATH") {
            return path;
        }

        if let Ok(dir) = std::env::var("DATABASE_DIR") {
            return format!("{}/voltage.db", dir);
        }

        default.to_string()
    }
}
