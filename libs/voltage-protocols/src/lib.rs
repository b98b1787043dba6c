//! VoltageEMS Protocol Implementations
//!
//! Modbus TCP support used for digital output control:
//!
//! ```text
//! voltage-protocols/modbus
//!     ├── ModbusTcpLink (voltage_modbus client pinned to one unit id)
//!     ├── LinkError (exception vs transport failure)
//!     ├── codec (command word, status bitmask, float decoding)
//!     └── ModbusSimulator (in-memory slave for tests and bench work)
//! ```

pub mod modbus;

pub use modbus::{LinkError, LinkResult, ModbusTcpLink};
