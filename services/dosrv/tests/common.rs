//! Test Common Utilities
//!
//! Scripted device links and store fixtures shared by dosrv integration tests

#![allow(dead_code)]
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use dosrv::clock::ManualClock;
use dosrv::engine::{ExecutionEngine, ExecutionSettings};
use dosrv::model::{Command, CommandAction, DeviceTarget, NewCommand};
use dosrv::store::{CommandQueue, MemoryStore, StoreHandles};
use dosrv::transport::{DigitalOutputLink, Endpoint, LinkConnector};
use voltage_protocols::{LinkError, LinkResult};

pub const DEVICE_ID: i64 = 1;
pub const COIL: u16 = 0;

/// Wire operations observed by the scripted device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Connect,
    WriteRegister(u16, u16),
    WriteCoil(u16, bool),
    ReadHolding(u16),
    ReadDiscrete(u16),
    Close,
}

/// Behaviour of a simulated breaker behind the link
#[derive(Debug, Default)]
pub struct DeviceScript {
    /// Physical output state
    pub state: bool,
    /// Writes are accepted but the output does not move
    pub stuck: bool,
    pub status_bitmask: u16,
    /// Failures returned by successive connect calls
    pub connect_failures: VecDeque<LinkError>,
    /// Failures returned by successive FC06 writes
    pub register_write_failures: VecDeque<LinkError>,
    pub coil_write_failure: Option<LinkError>,
    pub holding_read_failure: Option<LinkError>,
    pub discrete_read_failure: Option<LinkError>,
    pub ops: Vec<Op>,
}

impl DeviceScript {
    pub fn count(&self, pred: impl Fn(&Op) -> bool) -> usize {
        self.ops.iter().filter(|op| pred(op)).count()
    }

    pub fn writes(&self) -> usize {
        self.count(|op| matches!(op, Op::WriteRegister(..) | Op::WriteCoil(..)))
    }
}

#[derive(Clone)]
pub struct ScriptedConnector {
    pub device: Arc<Mutex<DeviceScript>>,
}

impl ScriptedConnector {
    pub fn new(initial_state: bool) -> Self {
        Self {
            device: Arc::new(Mutex::new(DeviceScript {
                state: initial_state,
                status_bitmask: 0x0001,
                ..Default::default()
            })),
        }
    }

    pub fn script(&self) -> parking_lot::MutexGuard<'_, DeviceScript> {
        self.device.lock()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.device.lock().ops.clone()
    }
}

struct ScriptedLink {
    device: Arc<Mutex<DeviceScript>>,
    connected: bool,
}

#[async_trait]
impl LinkConnector for ScriptedConnector {
    async fn connect(&self, _endpoint: &Endpoint) -> LinkResult<Box<dyn DigitalOutputLink>> {
        let mut device = self.device.lock();
        device.ops.push(Op::Connect);
        if let Some(err) = device.connect_failures.pop_front() {
            return Err(err);
        }
        Ok(Box::new(ScriptedLink {
            device: Arc::clone(&self.device),
            connected: true,
        }))
    }
}

#[async_trait]
impl DigitalOutputLink for ScriptedLink {
    async fn write_register(&mut self, address: u16, value: u16) -> LinkResult<()> {
        let mut device = self.device.lock();
        device.ops.push(Op::WriteRegister(address, value));
        if let Some(err) = device.register_write_failures.pop_front() {
            if err.is_connection_fatal() {
                self.connected = false;
            }
            return Err(err);
        }
        if !device.stuck {
            device.state = (value >> 8) == 1;
        }
        Ok(())
    }

    async fn write_coil(&mut self, address: u16, value: bool) -> LinkResult<()> {
        let mut device = self.device.lock();
        device.ops.push(Op::WriteCoil(address, value));
        if let Some(err) = device.coil_write_failure.clone() {
            return Err(err);
        }
        if !device.stuck {
            device.state = value;
        }
        Ok(())
    }

    async fn read_holding_register(&mut self, address: u16) -> LinkResult<u16> {
        let mut device = self.device.lock();
        device.ops.push(Op::ReadHolding(address));
        if let Some(err) = device.holding_read_failure.clone() {
            return Err(err);
        }
        Ok(if device.state { device.status_bitmask } else { 0 })
    }

    async fn read_discrete_input(&mut self, address: u16) -> LinkResult<bool> {
        let mut device = self.device.lock();
        device.ops.push(Op::ReadDiscrete(address));
        if let Some(err) = device.discrete_read_failure.clone() {
            return Err(err);
        }
        Ok(device.state)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn close(&mut self) {
        if self.connected {
            self.connected = false;
            self.device.lock().ops.push(Op::Close);
        }
    }
}

/// Execution settings without inter-attempt delay
pub fn fast_settings() -> ExecutionSettings {
    ExecutionSettings {
        retry_delay: Duration::ZERO,
        ..ExecutionSettings::default()
    }
}

pub fn device(device_id: i64) -> DeviceTarget {
    let mut target = DeviceTarget::new(device_id, "10.0.0.5");
    target.account_id = Some(100);
    target.breaker_coil = Some(COIL);
    target.breaker_enabled = true;
    target
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub connector: ScriptedConnector,
    pub clock: ManualClock,
    pub engine: Arc<ExecutionEngine>,
}

impl Harness {
    pub fn new(initial_state: bool) -> Self {
        Self::with_settings(initial_state, fast_settings())
    }

    pub fn with_settings(initial_state: bool, settings: ExecutionSettings) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.upsert_device(device(DEVICE_ID));
        let connector = ScriptedConnector::new(initial_state);
        let clock = ManualClock::new(Utc::now());
        let engine = Arc::new(ExecutionEngine::new(
            StoreHandles::from_store(store.clone()),
            Arc::new(connector.clone()),
            Arc::new(clock.clone()),
            settings,
        ));
        Self {
            store,
            connector,
            clock,
            engine,
        }
    }

    pub fn stores(&self) -> StoreHandles {
        StoreHandles::from_store(self.store.clone())
    }

    pub async fn enqueue(&self, action: CommandAction, notes: Option<&str>) -> Command {
        let mut command = NewCommand::new(DEVICE_ID, COIL, action);
        if let Some(notes) = notes {
            command = command.notes(notes);
        }
        let id = self
            .store
            .enqueue(command, Utc::now())
            .await
            .expect("enqueue");
        self.store
            .get_command(id)
            .await
            .expect("get_command")
            .expect("command exists")
    }
}
