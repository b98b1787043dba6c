//! dosrv - Digital output (breaker) control service
//!
//! Executes queued ON/OFF/TOGGLE commands against metering devices over
//! Modbus TCP with read-back verification, and enforces energy allocations by
//! queueing OFF/ON commands automatically.
//!
//! - [`engine`]: per-command state machine
//! - [`dispatcher`]: polling loop and batch isolation
//! - [`enforcement`]: allocation checks and duplicate suppression
//! - [`store`]: queue, device registry, status cache, audit events

pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod enforcement;
pub mod engine;
pub mod error;
pub mod model;
pub mod notes;
pub mod store;
pub mod transport;

pub use config::DoSrvConfig;
pub use dispatcher::{BatchSummary, Dispatcher, DispatcherSettings};
pub use enforcement::{DuplicateSuppressor, EnforcementLoop, EnforcementSettings};
pub use engine::{ExecutionEngine, ExecutionReport, ExecutionSettings, FailureReason, Outcome};
pub use error::{DoSrvError, Result};
