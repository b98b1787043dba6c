//! Error types for the digital output service

use thiserror::Error;
use voltage_protocols::LinkError;

/// Result alias used across dosrv
pub type Result<T> = std::result::Result<T, DoSrvError>;

/// Service level errors.
///
/// Per-command device failures are not errors: they end as a FAILED command
/// with a [`crate::engine::FailureReason`]. This type covers what stops an
/// operation from completing at all.
#[derive(Error, Debug)]
pub enum DoSrvError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transport error: {0}")]
    Transport(#[from] LinkError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DoSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl From<sqlx::Error> for DoSrvError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<figment::Error> for DoSrvError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<serde_json::Error> for DoSrvError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {err}"))
    }
}

impl From<std::io::Error> for DoSrvError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(format!("IO error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            DoSrvError::storage("locked").to_string(),
            "Storage error: locked"
        );
        let err: DoSrvError = LinkError::timeout("slow").into();
        assert_eq!(err.to_string(), "Transport error: Timeout: slow");
    }

    #[test]
    fn test_sqlx_conversion() {
        let err: DoSrvError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, DoSrvError::Storage(_)));
    }
}
