//! Modbus protocol constants
//!
//! Frame limits follow the Modbus specification (253-byte PDU inherited from the
//! RS485 ADU). Function codes cover the subset used for digital output control.

pub use voltage_modbus::DEFAULT_TCP_PORT;

// ============================================================================
// Frame Size Constants
// ============================================================================

/// MBAP header bytes read before the length-delimited remainder
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2)
/// The Unit ID is counted by the Length field and read with the PDU
pub const MBAP_HEADER_LEN: usize = 6;

/// Maximum PDU (Protocol Data Unit) size
/// RS485 ADU (256 bytes) - Slave Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Default unit (slave) identifier
pub const DEFAULT_UNIT_ID: u8 = 1;

/// Maximum registers for FC03/FC04: (253 - 2) / 2
pub const MAX_READ_REGISTERS: usize = 125;

/// Maximum discrete inputs for FC02
pub const MAX_READ_DISCRETE_INPUTS: usize = 2000;

// ============================================================================
// Function Codes
// ============================================================================

pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Bit set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

/// FC05 request value for ON
pub const COIL_ON: u16 = 0xFF00;
/// FC05 request value for OFF
pub const COIL_OFF: u16 = 0x0000;
