//! Modbus TCP simulator for testing
//!
//! In-memory Modbus TCP server with an optional breaker model: writing the
//! command word (or the breaker coil) flips a status bit in a holding register
//! and a discrete input, the way a PAC3220 digital output reports back.
//! PDUs are parsed and built with `voltage_modbus::ModbusPdu`; only the MBAP
//! framing is done here.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tracing::{debug, error, info};
use voltage_modbus::{ModbusPdu, ModbusResult};

use super::constants::{
    COIL_OFF, COIL_ON, EXCEPTION_FLAG, FC_READ_DISCRETE_INPUTS, FC_READ_HOLDING_REGISTERS,
    FC_READ_INPUT_REGISTERS, FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER, MAX_MBAP_LENGTH,
    MAX_READ_DISCRETE_INPUTS, MAX_READ_REGISTERS, MBAP_HEADER_LEN,
};

/// Exception: illegal function
pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;
/// Exception: illegal data value
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;
/// Exception: slave device failure
pub const EXCEPTION_DEVICE_FAILURE: u8 = 0x04;

/// Register layout of a simulated breaker output
#[derive(Debug, Clone)]
pub struct BreakerModel {
    /// Holding register receiving the encoded command word
    pub command_register: u16,
    /// Holding register carrying the status bit
    pub status_register: u16,
    pub status_bitmask: u16,
    /// Discrete input mirroring the status bit
    pub status_input: u16,
    /// Coil accepted as the fallback write path
    pub coil: u16,
}

impl Default for BreakerModel {
    fn default() -> Self {
        Self {
            command_register: 60008,
            status_register: 207,
            status_bitmask: 0x0001,
            status_input: 400,
            coil: 0,
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    holding_registers: HashMap<u16, u16>,
    input_registers: HashMap<u16, u16>,
    coils: HashMap<u16, bool>,
    discrete_inputs: HashMap<u16, bool>,
    breaker: Option<BreakerModel>,
    /// Accept writes but never change the reported status
    stuck: bool,
    /// Answer FC06 with this exception code
    register_write_exception: Option<u8>,
    /// Answer FC05 with this exception code
    coil_write_exception: Option<u8>,
    /// Answer FC03 with this exception code
    holding_read_exception: Option<u8>,
}

/// Simple Modbus TCP simulator. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ModbusSimulator {
    state: Arc<RwLock<SimState>>,
    connections: Arc<AtomicUsize>,
}

impl ModbusSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulator with a breaker output in the given initial state
    pub async fn with_breaker(model: BreakerModel, initially_on: bool) -> Self {
        let sim = Self::new();
        {
            let mut state = sim.state.write().await;
            state.breaker = Some(model);
            Self::apply_breaker_state(&mut state, initially_on);
        }
        sim
    }

    /// Start listening on 127.0.0.1:`port` (0 picks a free port)
    pub async fn start(&self, port: u16) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let local_addr = listener.local_addr()?;
        info!("Modbus simulator listening on {}", local_addr);

        let sim = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("New connection from {}", addr);
                        sim.connections.fetch_add(1, Ordering::SeqCst);
                        let sim = sim.clone();
                        tokio::spawn(async move {
                            if let Err(e) = sim.handle_connection(stream).await {
                                debug!("Connection closed: {}", e);
                            }
                        });
                    },
                    Err(e) => {
                        error!("Accept error: {}", e);
                        break;
                    },
                }
            }
        });

        Ok(local_addr)
    }

    /// Number of accepted TCP connections so far
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub async fn set_holding_register(&self, addr: u16, value: u16) {
        self.state.write().await.holding_registers.insert(addr, value);
    }

    pub async fn set_input_register(&self, addr: u16, value: u16) {
        self.state.write().await.input_registers.insert(addr, value);
    }

    pub async fn set_discrete_input(&self, addr: u16, value: bool) {
        self.state.write().await.discrete_inputs.insert(addr, value);
    }

    pub async fn holding_register(&self, addr: u16) -> Option<u16> {
        self.state.read().await.holding_registers.get(&addr).copied()
    }

    pub async fn coil(&self, addr: u16) -> Option<bool> {
        self.state.read().await.coils.get(&addr).copied()
    }

    pub async fn set_stuck(&self, stuck: bool) {
        self.state.write().await.stuck = stuck;
    }

    pub async fn set_register_write_exception(&self, code: Option<u8>) {
        self.state.write().await.register_write_exception = code;
    }

    pub async fn set_coil_write_exception(&self, code: Option<u8>) {
        self.state.write().await.coil_write_exception = code;
    }

    pub async fn set_holding_read_exception(&self, code: Option<u8>) {
        self.state.write().await.holding_read_exception = code;
    }

    /// Current breaker state as reported by the status register
    pub async fn breaker_state(&self) -> Option<bool> {
        let state = self.state.read().await;
        let model = state.breaker.as_ref()?;
        let raw = state
            .holding_registers
            .get(&model.status_register)
            .copied()
            .unwrap_or(0);
        Some(raw & model.status_bitmask != 0)
    }

    fn apply_breaker_state(state: &mut SimState, on: bool) {
        let Some(model) = state.breaker.clone() else {
            return;
        };
        let raw = state
            .holding_registers
            .entry(model.status_register)
            .or_insert(0);
        if on {
            *raw |= model.status_bitmask;
        } else {
            *raw &= !model.status_bitmask;
        }
        state.discrete_inputs.insert(model.status_input, on);
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> std::io::Result<()> {
        loop {
            let mut header = [0u8; MBAP_HEADER_LEN];
            stream.read_exact(&mut header).await?;

            let transaction_id = u16::from_be_bytes([header[0], header[1]]);
            let protocol_id = u16::from_be_bytes([header[2], header[3]]);
            let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
            if protocol_id != 0 || length < 2 || length > MAX_MBAP_LENGTH {
                return Ok(());
            }

            let mut body = vec![0u8; length];
            stream.read_exact(&mut body).await?;
            let unit_id = body[0];

            let request = match ModbusPdu::from_slice(&body[1..]) {
                Ok(pdu) => pdu,
                Err(e) => {
                    debug!("Dropping malformed request: {}", e);
                    return Ok(());
                },
            };
            let function_code = request.function_code().unwrap_or(0);
            debug!(
                "Transaction: {}, Unit: {}, Function: 0x{:02X}",
                transaction_id, unit_id, function_code
            );

            let response = match self.handle_pdu(&request).await {
                Ok(pdu) => pdu,
                Err(e) => {
                    error!("Failed to build response: {}", e);
                    exception(function_code, EXCEPTION_DEVICE_FAILURE)
                        .map_err(|e| std::io::Error::other(e.to_string()))?
                },
            };
            let pdu = response.as_slice();

            let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len());
            frame.extend_from_slice(&transaction_id.to_be_bytes());
            frame.extend_from_slice(&[0x00, 0x00]); // Protocol ID
            frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
            frame.push(unit_id);
            frame.extend_from_slice(pdu);
            stream.write_all(&frame).await?;
        }
    }

    async fn handle_pdu(&self, request: &ModbusPdu) -> ModbusResult<ModbusPdu> {
        let data = request.as_slice();
        let function_code = request.function_code().unwrap_or(0);
        if data.len() < 5 {
            return exception(function_code, EXCEPTION_ILLEGAL_DATA_VALUE);
        }
        let addr = u16::from_be_bytes([data[1], data[2]]);
        let value = u16::from_be_bytes([data[3], data[4]]);

        match function_code {
            FC_READ_DISCRETE_INPUTS => {
                let state = self.state.read().await;
                read_bits(&state.discrete_inputs, function_code, addr, value)
            },
            FC_READ_HOLDING_REGISTERS => {
                let state = self.state.read().await;
                if let Some(code) = state.holding_read_exception {
                    return exception(function_code, code);
                }
                read_registers(&state.holding_registers, function_code, addr, value)
            },
            FC_READ_INPUT_REGISTERS => {
                let state = self.state.read().await;
                read_registers(&state.input_registers, function_code, addr, value)
            },
            FC_WRITE_SINGLE_REGISTER => {
                let mut state = self.state.write().await;
                if let Some(code) = state.register_write_exception {
                    return exception(function_code, code);
                }
                state.holding_registers.insert(addr, value);
                let command_register = state.breaker.as_ref().map(|m| m.command_register);
                if command_register == Some(addr) && !state.stuck {
                    Self::apply_breaker_state(&mut state, (value >> 8) != 0);
                }
                echo(function_code, addr, value)
            },
            FC_WRITE_SINGLE_COIL => {
                let mut state = self.state.write().await;
                if let Some(code) = state.coil_write_exception {
                    return exception(function_code, code);
                }
                let on = match value {
                    COIL_ON => true,
                    COIL_OFF => false,
                    _ => return exception(function_code, EXCEPTION_ILLEGAL_DATA_VALUE),
                };
                state.coils.insert(addr, on);
                let coil = state.breaker.as_ref().map(|m| m.coil);
                if coil == Some(addr) && !state.stuck {
                    Self::apply_breaker_state(&mut state, on);
                }
                echo(function_code, addr, value)
            },
            _ => exception(function_code, EXCEPTION_ILLEGAL_FUNCTION),
        }
    }
}

fn exception(function_code: u8, code: u8) -> ModbusResult<ModbusPdu> {
    let mut pdu = ModbusPdu::new();
    pdu.push(function_code | EXCEPTION_FLAG)?;
    pdu.push(code)?;
    Ok(pdu)
}

/// FC05/FC06 responses repeat the request
fn echo(function_code: u8, addr: u16, value: u16) -> ModbusResult<ModbusPdu> {
    let mut pdu = ModbusPdu::new();
    pdu.push(function_code)?;
    pdu.push_u16(addr)?;
    pdu.push_u16(value)?;
    Ok(pdu)
}

fn read_registers(
    map: &HashMap<u16, u16>,
    function_code: u8,
    start: u16,
    count: u16,
) -> ModbusResult<ModbusPdu> {
    if count == 0 || usize::from(count) > MAX_READ_REGISTERS {
        return exception(function_code, EXCEPTION_ILLEGAL_DATA_VALUE);
    }
    let mut pdu = ModbusPdu::new();
    pdu.push(function_code)?;
    pdu.push((count * 2) as u8)?;
    for i in 0..count {
        pdu.push_u16(map.get(&start.wrapping_add(i)).copied().unwrap_or(0))?;
    }
    Ok(pdu)
}

fn read_bits(
    map: &HashMap<u16, bool>,
    function_code: u8,
    start: u16,
    count: u16,
) -> ModbusResult<ModbusPdu> {
    if count == 0 || usize::from(count) > MAX_READ_DISCRETE_INPUTS {
        return exception(function_code, EXCEPTION_ILLEGAL_DATA_VALUE);
    }
    let byte_count = usize::from(count).div_ceil(8);
    let mut bytes = vec![0u8; byte_count];
    for i in 0..usize::from(count) {
        if map
            .get(&start.wrapping_add(i as u16))
            .copied()
            .unwrap_or(false)
        {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }

    let mut pdu = ModbusPdu::new();
    pdu.push(function_code)?;
    pdu.push(byte_count as u8)?;
    for byte in bytes {
        pdu.push(byte)?;
    }
    Ok(pdu)
}
