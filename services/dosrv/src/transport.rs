//! Device link seam between the execution engine and the wire protocol
//!
//! The engine only talks to [`DigitalOutputLink`]; production uses Modbus TCP
//! through [`ModbusTcpConnector`] (a `voltage_modbus` client per device), tests
//! script their own connectors.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use voltage_protocols::{LinkResult, ModbusTcpLink};

use crate::model::DeviceTarget;

/// Network address of one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
}

impl Endpoint {
    /// Address of a registered device; a missing port falls back to `default_port`
    pub fn for_target(target: &DeviceTarget, default_port: u16) -> Self {
        Self {
            host: target.host.trim().to_string(),
            port: target.port.unwrap_or(default_port),
            unit_id: target.unit_id,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}#{}", self.host, self.port, self.unit_id)
    }
}

/// An open connection to one device
#[async_trait]
pub trait DigitalOutputLink: Send {
    /// FC06
    async fn write_register(&mut self, address: u16, value: u16) -> LinkResult<()>;

    /// FC05
    async fn write_coil(&mut self, address: u16, value: bool) -> LinkResult<()>;

    /// FC03, single register
    async fn read_holding_register(&mut self, address: u16) -> LinkResult<u16>;

    /// FC02, single input
    async fn read_discrete_input(&mut self, address: u16) -> LinkResult<bool>;

    fn is_connected(&self) -> bool;

    async fn close(&mut self);
}

/// Opens links; one per command execution
#[async_trait]
pub trait LinkConnector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> LinkResult<Box<dyn DigitalOutputLink>>;
}

#[async_trait]
impl DigitalOutputLink for ModbusTcpLink {
    async fn write_register(&mut self, address: u16, value: u16) -> LinkResult<()> {
        ModbusTcpLink::write_single_register(self, address, value).await
    }

    async fn write_coil(&mut self, address: u16, value: bool) -> LinkResult<()> {
        ModbusTcpLink::write_single_coil(self, address, value).await
    }

    async fn read_holding_register(&mut self, address: u16) -> LinkResult<u16> {
        ModbusTcpLink::read_holding_register(self, address).await
    }

    async fn read_discrete_input(&mut self, address: u16) -> LinkResult<bool> {
        ModbusTcpLink::read_discrete_input(self, address).await
    }

    fn is_connected(&self) -> bool {
        ModbusTcpLink::is_connected(self)
    }

    async fn close(&mut self) {
        ModbusTcpLink::close(self).await
    }
}

/// Modbus TCP connector bounded by the request timeout
#[derive(Debug, Clone)]
pub struct ModbusTcpConnector {
    timeout: Duration,
}

impl ModbusTcpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Concrete link, for callers that need more than the engine's operations
    pub async fn open(&self, endpoint: &Endpoint) -> LinkResult<ModbusTcpLink> {
        debug!("Connecting to {}", endpoint);
        ModbusTcpLink::connect(&endpoint.host, endpoint.port, endpoint.unit_id, self.timeout).await
    }
}

#[async_trait]
impl LinkConnector for ModbusTcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> LinkResult<Box<dyn DigitalOutputLink>> {
        Ok(Box::new(self.open(endpoint).await?))
    }
}
