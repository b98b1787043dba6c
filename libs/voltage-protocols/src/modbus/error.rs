//! Link error types
//!
//! `voltage_modbus` reports failures through its own `ModbusError`; the
//! digital output path only needs to know whether the device answered with an
//! exception (socket still usable) or the transport broke (reconnect).

use thiserror::Error;

/// Result alias for link operations
pub type LinkResult<T> = std::result::Result<T, LinkError>;

/// Errors raised while talking to one device
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    /// Address resolution or TCP connect failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Request exceeded the configured timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Socket or framing failure reported by the Modbus client
    #[error("Transport error: {0}")]
    Transport(String),

    /// Response arrived but could not be used (short read, bad quantity)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Device answered with an exception response (function code | 0x80)
    #[error("Modbus exception: function {function:#04X}, code {code:#04X}")]
    Exception { function: u8, code: u8 },

    /// No connection is open
    #[error("Not connected")]
    NotConnected,
}

impl LinkError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Whether the socket can no longer be trusted after this error.
    ///
    /// Exception responses and unusable payloads leave the stream in sync;
    /// everything else requires a reconnect.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self, Self::Exception { .. } | Self::Protocol(_))
    }
}

impl From<voltage_modbus::ModbusError> for LinkError {
    fn from(err: voltage_modbus::ModbusError) -> Self {
        use voltage_modbus::ModbusError;

        match &err {
            ModbusError::Exception { function, code, .. } => Self::Exception {
                function: *function,
                code: *code,
            },
            ModbusError::Timeout { .. } => Self::Timeout(err.to_string()),
            _ => Self::Transport(err.to_string()),
        }
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Self::Timeout(err.to_string()),
            _ => Self::Connection(err.to_string()),
        }
    }
}
