//! dosrv configuration
//!
//! Layered with figment, lowest to highest priority:
//! 1. compiled defaults
//! 2. YAML file (`config/dosrv.yaml` or `--config`)
//! 3. legacy worker variables `DRY_RUN` and `WORKER_POLL_INTERVAL`
//! 4. `DOSRV_` prefixed variables, `__` separating sections
//!    (e.g. `DOSRV_WORKER__BATCH_SIZE=50`)

use std::path::Path;
use std::time::Duration;

use common::LoggingConfig;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use voltage_protocols::modbus::{constants::DEFAULT_TCP_PORT, WordOrdering, DEFAULT_ORDERINGS};

use crate::error::{DoSrvError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "config/dosrv.yaml";
pub const ENV_PREFIX: &str = "DOSRV_";

/// Full service configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct DoSrvConfig {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub worker: WorkerConfig,
    pub modbus: ModbusConfig,
    pub execution: ExecutionConfig,
    pub enforcement: EnforcementConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "dosrv".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file holding the command queue, status cache and events
    pub path: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/voltage.db".to_string(),
            max_connections: 5,
        }
    }
}

/// Dispatcher polling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Sleep after an empty batch
    pub poll_interval_secs: u64,
    /// Sleep after a batch that had work
    pub busy_interval_secs: u64,
    pub batch_size: usize,
    /// List pending work and enforcement decisions without acting on them
    pub dry_run: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            busy_interval_secs: 1,
            batch_size: 20,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModbusConfig {
    /// Port used when a device has none
    pub port: u16,
    /// Bounds connect and every request
    pub timeout_ms: u64,
    /// Float decode priority, e.g. ["BADC", "ABCD", "DCBA", "CDAB"]
    pub decode_orderings: Vec<String>,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_TCP_PORT,
            timeout_ms: 10_000,
            decode_orderings: DEFAULT_ORDERINGS
                .iter()
                .map(|o| o.as_str().to_string())
                .collect(),
        }
    }
}

/// Command execution defaults; per-device values override the register layout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Used when a command carries max_retries <= 0
    pub default_max_retries: u32,
    pub retry_delay_ms: u64,
    /// Register receiving the encoded command word
    pub write_register: u16,
    /// Register carrying the output status bit
    pub read_register: u16,
    pub status_bitmask: u16,
    /// Discrete input read when the status register cannot be read
    pub status_input: u16,
    /// Output id encoded into the low byte of the command word
    pub output_id: u8,
    pub discrete_input_fallback: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            retry_delay_ms: 1_000,
            write_register: 60008,
            read_register: 207,
            status_bitmask: 0x0001,
            status_input: 400,
            output_id: 0,
            discrete_input_fallback: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnforcementConfig {
    pub enabled: bool,
    /// Same device+coil+command pending within this window is not enqueued again
    pub duplicate_window_secs: u64,
    /// Requester recorded on automatic commands
    pub requested_by: i64,
    /// Coils above this address are skipped
    pub max_coil_address: u16,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            duplicate_window_secs: 5,
            requested_by: 1,
            max_coil_address: 9999,
        }
    }
}

impl DoSrvConfig {
    /// Provider stack for a given YAML path
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(DoSrvConfig::default()))
            .merge(Yaml::file(path))
            .merge(legacy_env())
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load from file and environment, then validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        Self::from_figment(Self::figment(path))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: DoSrvConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(DoSrvError::config("database.path must not be empty"));
        }
        if self.database.max_connections == 0 {
            return Err(DoSrvError::config("database.max_connections must be > 0"));
        }
        if self.worker.batch_size == 0 {
            return Err(DoSrvError::config("worker.batch_size must be > 0"));
        }
        if self.worker.poll_interval_secs == 0 {
            return Err(DoSrvError::config("worker.poll_interval_secs must be > 0"));
        }
        if self.modbus.timeout_ms == 0 {
            return Err(DoSrvError::config("modbus.timeout_ms must be > 0"));
        }
        if self.execution.default_max_retries == 0 {
            return Err(DoSrvError::config(
                "execution.default_max_retries must be > 0",
            ));
        }
        if self.execution.status_bitmask == 0 {
            return Err(DoSrvError::config("execution.status_bitmask must be non-zero"));
        }
        self.decode_orderings()?;
        Ok(())
    }

    pub fn decode_orderings(&self) -> Result<Vec<WordOrdering>> {
        if self.modbus.decode_orderings.is_empty() {
            return Err(DoSrvError::config("modbus.decode_orderings must not be empty"));
        }
        self.modbus
            .decode_orderings
            .iter()
            .map(|s| {
                s.parse::<WordOrdering>()
                    .map_err(|e| DoSrvError::config(e.to_string()))
            })
            .collect()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.modbus.timeout_ms)
    }
}

/// `DRY_RUN` / `WORKER_POLL_INTERVAL` from the earlier worker deployment
fn legacy_env() -> Env {
    Env::raw()
        .only(&["DRY_RUN", "WORKER_POLL_INTERVAL"])
        .map(|key| {
            if key.as_str().eq_ignore_ascii_case("DRY_RUN") {
                "worker.dry_run".into()
            } else {
                "worker.poll_interval_secs".into()
            }
        })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = DoSrvConfig::default();
        config.validate().unwrap();
        assert_eq!(config.worker.batch_size, 20);
        assert_eq!(config.worker.poll_interval_secs, 5);
        assert_eq!(config.modbus.port, 502);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.execution.write_register, 60008);
        assert_eq!(config.execution.read_register, 207);
        assert_eq!(config.enforcement.duplicate_window_secs, 5);
        assert_eq!(config.decode_orderings().unwrap(), DEFAULT_ORDERINGS.to_vec());
    }

    #[test]
    fn test_yaml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "worker:\n  batch_size: 5\n  dry_run: true\nexecution:\n  write_register: 40001\nmodbus:\n  decode_orderings: [ABCD]\n"
        )
        .unwrap();

        let figment = Figment::from(Serialized::defaults(DoSrvConfig::default()))
            .merge(Yaml::file(file.path()));
        let config = DoSrvConfig::from_figment(figment).unwrap();

        assert_eq!(config.worker.batch_size, 5);
        assert!(config.worker.dry_run);
        assert_eq!(config.worker.poll_interval_secs, 5);
        assert_eq!(config.execution.write_register, 40001);
        assert_eq!(config.execution.read_register, 207);
        assert_eq!(config.decode_orderings().unwrap(), vec![WordOrdering::ABCD]);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let figment = Figment::from(Serialized::defaults(DoSrvConfig::default()))
            .merge(Yaml::file("does/not/exist.yaml"));
        let config = DoSrvConfig::from_figment(figment).unwrap();
        assert_eq!(config, DoSrvConfig::default());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = DoSrvConfig::default();
        config.worker.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = DoSrvConfig::default();
        config.modbus.timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = DoSrvConfig::default();
        config.modbus.decode_orderings = vec!["XYZW".to_string()];
        assert!(matches!(config.validate(), Err(DoSrvError::Config(_))));

        let mut config = DoSrvConfig::default();
        config.database.path = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_nested_override_provider() {
        let figment = Figment::from(Serialized::defaults(DoSrvConfig::default()))
            .merge(Serialized::default("enforcement.enabled", false))
            .merge(Serialized::default("worker.busy_interval_secs", 2));
        let config = DoSrvConfig::from_figment(figment).unwrap();
        assert!(!config.enforcement.enabled);
        assert_eq!(config.worker.busy_interval_secs, 2);
    }

    #[test]
    fn test_sample_config_parses() {
        let text = include_str!("../config/dosrv.yaml");
        let figment = Figment::from(Serialized::defaults(DoSrvConfig::default()))
            .merge(Yaml::string(text));
        let config = DoSrvConfig::from_figment(figment).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_serialized_defaults_reload() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("dosrv.yaml");
        std::fs::write(&path, serde_yaml::to_string(&DoSrvConfig::default()).unwrap()).unwrap();

        let config = DoSrvConfig::from_figment(
            Figment::from(Serialized::defaults(DoSrvConfig::default())).merge(Yaml::file(&path)),
        )
        .unwrap();
        assert_eq!(config, DoSrvConfig::default());
    }
}
