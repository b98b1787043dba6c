//! `VoltageEMS` basic library
//!
//! Functions shared by all services:
//! - logging bootstrap
//! - shutdown signal handling
//! - common command-line arguments

pub mod bootstrap_args;
pub mod logging;
pub mod shutdown;

pub use bootstrap_args::ServiceArgs;
pub use logging::{init_logging, LoggingConfig, LoggingGuard};
pub use shutdown::{shutdown_token, wait_for_shutdown};

// Re-export CLI dependencies when cli feature is enabled
#[cfg(feature = "cli")]
pub use clap;
