//! Domain types for digital output control

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DoSrvError, Result};
use crate::notes::Notes;

/// Requested breaker action as stored in the queue
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandAction {
    On,
    Off,
    Toggle,
    /// Stored text that is not a known action, kept verbatim
    Unrecognized(String),
}

impl CommandAction {
    /// Case-insensitive parse; never fails
    pub fn parse(text: &str) -> Self {
        match text.trim().to_ascii_uppercase().as_str() {
            "ON" => Self::On,
            "OFF" => Self::Off,
            "TOGGLE" => Self::Toggle,
            _ => Self::Unrecognized(text.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
            Self::Toggle => "TOGGLE",
            Self::Unrecognized(text) => text,
        }
    }

    /// Target state for direct actions
    pub fn direct_state(&self) -> Option<bool> {
        match self {
            Self::On => Some(true),
            Self::Off => Some(false),
            _ => None,
        }
    }
}

impl fmt::Display for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Command lifecycle; SUCCESS and FAILED are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionResult {
    Pending,
    Success,
    Failed,
}

impl ExecutionResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "PENDING" => Some(Self::Pending),
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Queued breaker command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: i64,
    pub device_id: i64,
    pub coil_address: u16,
    pub action: CommandAction,
    pub requested_by: Option<i64>,
    pub max_retries: i32,
    pub retry_count: i32,
    pub notes: Option<String>,
    pub result: ExecutionResult,
    pub error_message: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl Command {
    pub fn parsed_notes(&self) -> Notes {
        Notes::parse(self.notes.as_deref().unwrap_or_default())
    }
}

/// Insert request for the queue
#[derive(Debug, Clone, PartialEq)]
pub struct NewCommand {
    pub device_id: i64,
    pub coil_address: u16,
    pub action: CommandAction,
    pub requested_by: Option<i64>,
    pub max_retries: i32,
    pub notes: Option<String>,
}

impl NewCommand {
    pub fn new(device_id: i64, coil_address: u16, action: CommandAction) -> Self {
        Self {
            device_id,
            coil_address,
            action,
            requested_by: None,
            max_retries: 3,
            notes: None,
        }
    }

    pub fn requested_by(mut self, user_id: i64) -> Self {
        self.requested_by = Some(user_id);
        self
    }

    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Terminal outcome written back to a PENDING command
#[derive(Debug, Clone, PartialEq)]
pub struct CommandCompletion {
    pub result: ExecutionResult,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub executed_at: DateTime<Utc>,
}

/// Device addressing resolved from the registry.
///
/// Register fields left as `None` fall back to the execution defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceTarget {
    pub device_id: i64,
    pub account_id: Option<i64>,
    pub host: String,
    pub port: Option<u16>,
    pub unit_id: u8,
    pub write_register: Option<u16>,
    pub read_register: Option<u16>,
    pub status_bitmask: Option<u16>,
    pub status_input: Option<u16>,
    pub breaker_coil: Option<u16>,
    pub breaker_enabled: bool,
    pub is_active: bool,
}

impl DeviceTarget {
    pub fn new(device_id: i64, host: impl Into<String>) -> Self {
        Self {
            device_id,
            account_id: None,
            host: host.into(),
            port: None,
            unit_id: 1,
            write_register: None,
            read_register: None,
            status_bitmask: None,
            status_input: None,
            breaker_coil: None,
            breaker_enabled: false,
            is_active: true,
        }
    }

    pub fn has_host(&self) -> bool {
        !self.host.trim().is_empty()
    }
}

/// Partial device registration written by operators.
///
/// `None` keeps the stored value; a device seen for the first time needs a host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceUpdate {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub unit_id: Option<u8>,
    pub account_id: Option<i64>,
    pub write_register: Option<u16>,
    pub read_register: Option<u16>,
    pub status_bitmask: Option<u16>,
    pub status_input: Option<u16>,
    pub breaker_coil: Option<u16>,
    pub breaker_enabled: Option<bool>,
    pub is_active: Option<bool>,
}

impl DeviceUpdate {
    pub fn apply(self, device_id: i64, existing: Option<DeviceTarget>) -> Result<DeviceTarget> {
        let mut device = match (existing, self.host.as_deref()) {
            (Some(device), _) => device,
            (None, Some(host)) if !host.trim().is_empty() => DeviceTarget::new(device_id, host),
            (None, _) => {
                return Err(DoSrvError::validation(format!(
                    "device {device_id} is not registered; --host is required"
                )))
            },
        };

        if let Some(host) = self.host {
            if host.trim().is_empty() {
                return Err(DoSrvError::validation("host must not be empty"));
            }
            device.host = host.trim().to_string();
        }
        if self.status_bitmask == Some(0) {
            return Err(DoSrvError::validation("status bitmask must be non-zero"));
        }

        device.port = self.port.or(device.port);
        device.unit_id = self.unit_id.unwrap_or(device.unit_id);
        device.account_id = self.account_id.or(device.account_id);
        device.write_register = self.write_register.or(device.write_register);
        device.read_register = self.read_register.or(device.read_register);
        device.status_bitmask = self.status_bitmask.or(device.status_bitmask);
        device.status_input = self.status_input.or(device.status_input);
        device.breaker_coil = self.breaker_coil.or(device.breaker_coil);
        device.breaker_enabled = self.breaker_enabled.unwrap_or(device.breaker_enabled);
        device.is_active = self.is_active.unwrap_or(device.is_active);
        Ok(device)
    }
}

/// Last known output state for a device coil
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoStatus {
    pub device_id: i64,
    pub coil_address: u16,
    /// `None` when the state is unknown
    pub state: Option<bool>,
    pub last_updated: DateTime<Utc>,
    pub update_source: String,
}

/// Energy allocation snapshot for one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub account_id: i64,
    pub allocated_kwh: f64,
    pub used_kwh: f64,
    pub is_active: bool,
}

impl AccountBalance {
    /// used / allocated; a non-positive allocation counts as exhausted once anything is used
    pub fn usage_ratio(&self) -> f64 {
        if self.allocated_kwh <= 0.0 {
            if self.used_kwh > 0.0 {
                1.0
            } else {
                0.0
            }
        } else {
            self.used_kwh / self.allocated_kwh
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLevel {
    Info,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Error => "ERROR",
        }
    }
}

pub const EVENT_DO_CONTROL: &str = "do_control";
pub const EVENT_DO_CONTROL_FAILED: &str = "do_control_failed";

/// Audit record emitted for every execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub device_id: i64,
    pub level: EventLevel,
    pub event_type: String,
    pub message: String,
    pub source: String,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}
