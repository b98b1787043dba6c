//! Modbus TCP for digital output control
//!
//! Function codes used: FC02, FC03, FC04, FC05, FC06. Framing and the client
//! come from `voltage_modbus`; this module adds the register meaning and a
//! breaker simulator.

mod codec;
pub mod constants;
mod error;
mod link;
pub mod simulator;

pub use codec::{
    decode_do_status, decode_float32, decode_float64, encode_do_command, UnknownOrdering,
    WordOrdering, DEFAULT_ORDERINGS, DO_ACTION_OFF, DO_ACTION_ON, FLOAT32_PLAUSIBLE_MAX,
    FLOAT64_PLAUSIBLE_MAX,
};
pub use error::{LinkError, LinkResult};
pub use link::ModbusTcpLink;
pub use simulator::{BreakerModel, ModbusSimulator};
