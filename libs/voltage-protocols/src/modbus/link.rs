//! Modbus TCP link to one device
//!
//! Session over `voltage_modbus::ModbusTcpClient`. The client takes a slave id
//! per call; a link pins one unit id, resolves host names and stops issuing
//! requests once the transport has failed.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::lookup_host;
use tracing::{debug, warn};
use voltage_modbus::{ModbusClient, ModbusResult, ModbusTcpClient, TcpTransport};

use super::codec::{decode_float32, decode_float64, WordOrdering};
use super::constants::{MAX_READ_DISCRETE_INPUTS, MAX_READ_REGISTERS};
use super::error::{LinkError, LinkResult};

/// Open Modbus TCP connection bound to one unit id
pub struct ModbusTcpLink {
    client: ModbusTcpClient,
    peer: SocketAddr,
    unit_id: u8,
    connected: bool,
}

impl std::fmt::Debug for ModbusTcpLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusTcpLink")
            .field("peer", &self.peer)
            .field("unit_id", &self.unit_id)
            .field("connected", &self.connected)
            .finish()
    }
}

impl ModbusTcpLink {
    /// Resolve `host` and connect, both bounded by `timeout`
    pub async fn connect(
        host: &str,
        port: u16,
        unit_id: u8,
        timeout: Duration,
    ) -> LinkResult<Self> {
        let peer = tokio::time::timeout(timeout, lookup_host((host, port)))
            .await
            .map_err(|_| LinkError::timeout(format!("resolving {host}")))??
            .next()
            .ok_or_else(|| LinkError::connection(format!("{host} did not resolve")))?;

        debug!("Connecting to Modbus TCP {} unit {}", peer, unit_id);
        let transport = TcpTransport::new(peer, timeout)
            .await
            .map_err(|e| LinkError::connection(format!("{peer}: {e}")))?;

        Ok(Self {
            client: ModbusTcpClient::from_transport(transport),
            peer,
            unit_id,
            connected: true,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub async fn close(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        if let Err(e) = self.client.close().await {
            warn!("Error closing Modbus TCP connection to {}: {}", self.peer, e);
        }
    }

    fn ensure_connected(&self) -> LinkResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(LinkError::NotConnected)
        }
    }

    /// Convert the client result, marking the link dead on transport failures
    fn track<T>(&mut self, result: ModbusResult<T>) -> LinkResult<T> {
        result.map_err(|e| {
            let err = LinkError::from(e);
            if err.is_connection_fatal() {
                debug!("Link to {} unusable: {}", self.peer, err);
                self.connected = false;
            }
            err
        })
    }

    fn check_quantity(quantity: u16, max: usize) -> LinkResult<()> {
        if quantity == 0 || usize::from(quantity) > max {
            return Err(LinkError::protocol(format!(
                "Invalid quantity {quantity} (1..={max})"
            )));
        }
        Ok(())
    }

    /// FC06
    pub async fn write_single_register(&mut self, address: u16, value: u16) -> LinkResult<()> {
        self.ensure_connected()?;
        let result = self.client.write_06(self.unit_id, address, value).await;
        self.track(result).map(|_| ())
    }

    /// FC05
    pub async fn write_single_coil(&mut self, address: u16, value: bool) -> LinkResult<()> {
        self.ensure_connected()?;
        let result = self.client.write_05(self.unit_id, address, value).await;
        self.track(result).map(|_| ())
    }

    /// FC03
    pub async fn read_holding_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> LinkResult<Vec<u16>> {
        self.ensure_connected()?;
        Self::check_quantity(quantity, MAX_READ_REGISTERS)?;
        let result = self.client.read_03(self.unit_id, address, quantity).await;
        let values = self.track(result)?;
        exact(values, quantity, "FC03")
    }

    pub async fn read_holding_register(&mut self, address: u16) -> LinkResult<u16> {
        let values = self.read_holding_registers(address, 1).await?;
        Ok(values[0])
    }

    /// FC04
    pub async fn read_input_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> LinkResult<Vec<u16>> {
        self.ensure_connected()?;
        Self::check_quantity(quantity, MAX_READ_REGISTERS)?;
        let result = self.client.read_04(self.unit_id, address, quantity).await;
        let values = self.track(result)?;
        exact(values, quantity, "FC04")
    }

    /// FC02
    pub async fn read_discrete_inputs(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> LinkResult<Vec<bool>> {
        self.ensure_connected()?;
        Self::check_quantity(quantity, MAX_READ_DISCRETE_INPUTS)?;
        let result = self.client.read_02(self.unit_id, address, quantity).await;
        let bits = self.track(result)?;
        exact(bits, quantity, "FC02")
    }

    pub async fn read_discrete_input(&mut self, address: u16) -> LinkResult<bool> {
        let bits = self.read_discrete_inputs(address, 1).await?;
        Ok(bits[0])
    }

    /// Two holding registers decoded with the ordering fallback
    pub async fn read_float32(
        &mut self,
        address: u16,
        orderings: &[WordOrdering],
    ) -> LinkResult<Option<f32>> {
        let regs = self.read_holding_registers(address, 2).await?;
        Ok(decode_float32(&[regs[0], regs[1]], orderings))
    }

    /// Four holding registers decoded with the ordering fallback
    pub async fn read_float64(
        &mut self,
        address: u16,
        orderings: &[WordOrdering],
    ) -> LinkResult<Option<f64>> {
        let regs = self.read_holding_registers(address, 4).await?;
        Ok(decode_float64(&[regs[0], regs[1], regs[2], regs[3]], orderings))
    }
}

/// Partial data is an error: read-back verification needs a definite value.
/// Bit reads may come back padded to a whole byte.
fn exact<T>(mut values: Vec<T>, quantity: u16, function: &str) -> LinkResult<Vec<T>> {
    let wanted = usize::from(quantity);
    if values.len() < wanted {
        return Err(LinkError::protocol(format!(
            "{function} returned {} values, expected {wanted}",
            values.len()
        )));
    }
    values.truncate(wanted);
    Ok(values)
}
