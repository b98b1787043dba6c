//! In-memory store implementation
//!
//! Mirrors the SQLite semantics closely enough for engine and loop tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{AccountSource, CommandQueue, DeviceRegistry, EventRecorder, StatusCache};
use crate::error::Result;
use crate::model::{
    AccountBalance, AuditEvent, Command, CommandAction, CommandCompletion, DeviceTarget, DoStatus,
    ExecutionResult, NewCommand,
};

#[derive(Default)]
struct Inner {
    next_id: i64,
    commands: Vec<Command>,
    devices: HashMap<i64, DeviceTarget>,
    status: HashMap<(i64, u16), DoStatus>,
    events: Vec<AuditEvent>,
    accounts: HashMap<i64, AccountBalance>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_device(&self, device: DeviceTarget) {
        self.inner.write().devices.insert(device.device_id, device);
    }

    pub fn upsert_account(&self, account: AccountBalance) {
        self.inner.write().accounts.insert(account.account_id, account);
    }

    pub fn commands(&self) -> Vec<Command> {
        self.inner.read().commands.clone()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.inner.read().events.clone()
    }

    pub fn status(&self, device_id: i64, coil_address: u16) -> Option<DoStatus> {
        self.inner
            .read()
            .status
            .get(&(device_id, coil_address))
            .cloned()
    }

    pub fn set_status(&self, device_id: i64, coil_address: u16, state: Option<bool>) {
        self.inner.write().status.insert(
            (device_id, coil_address),
            DoStatus {
                device_id,
                coil_address,
                state,
                last_updated: Utc::now(),
                update_source: "seed".to_string(),
            },
        );
    }
}

#[async_trait]
impl CommandQueue for MemoryStore {
    async fn enqueue(&self, command: NewCommand, requested_at: DateTime<Utc>) -> Result<i64> {
        let mut inner = self.inner.write();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.commands.push(Command {
            id,
            device_id: command.device_id,
            coil_address: command.coil_address,
            action: command.action,
            requested_by: command.requested_by,
            max_retries: command.max_retries,
            retry_count: 0,
            notes: command.notes,
            result: ExecutionResult::Pending,
            error_message: None,
            requested_at,
            executed_at: None,
        });
        Ok(id)
    }

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<Command>> {
        let inner = self.inner.read();
        let mut pending: Vec<Command> = inner
            .commands
            .iter()
            .filter(|c| c.result == ExecutionResult::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.requested_at.cmp(&b.requested_at).then(a.id.cmp(&b.id)));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn get_command(&self, id: i64) -> Result<Option<Command>> {
        Ok(self.inner.read().commands.iter().find(|c| c.id == id).cloned())
    }

    async fn has_recent_pending(
        &self,
        device_id: i64,
        coil_address: u16,
        action: &CommandAction,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self.inner.read().commands.iter().any(|c| {
            c.result == ExecutionResult::Pending
                && c.device_id == device_id
                && c.coil_address == coil_address
                && c.action.as_str() == action.as_str()
                && c.requested_at >= since
        }))
    }

    async fn complete(&self, id: i64, completion: &CommandCompletion) -> Result<bool> {
        let mut inner = self.inner.write();
        let Some(command) = inner
            .commands
            .iter_mut()
            .find(|c| c.id == id && c.result == ExecutionResult::Pending)
        else {
            return Ok(false);
        };
        command.result = completion.result;
        command.retry_count = completion.retry_count;
        command.error_message = completion.error_message.clone();
        command.executed_at = Some(completion.executed_at);
        Ok(true)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Command>> {
        let inner = self.inner.read();
        Ok(inner.commands.iter().rev().take(limit).cloned().collect())
    }
}

#[async_trait]
impl DeviceRegistry for MemoryStore {
    async fn resolve(&self, device_id: i64) -> Result<Option<DeviceTarget>> {
        Ok(self.inner.read().devices.get(&device_id).cloned())
    }

    async fn devices_for_account(&self, account_id: i64) -> Result<Vec<DeviceTarget>> {
        let mut devices: Vec<DeviceTarget> = self
            .inner
            .read()
            .devices
            .values()
            .filter(|d| d.account_id == Some(account_id))
            .cloned()
            .collect();
        devices.sort_by_key(|d| d.device_id);
        Ok(devices)
    }
}

#[async_trait]
impl StatusCache for MemoryStore {
    async fn get_status(&self, device_id: i64, coil_address: u16) -> Result<Option<DoStatus>> {
        Ok(self.status(device_id, coil_address))
    }

    async fn upsert_status(&self, status: &DoStatus) -> Result<()> {
        self.inner
            .write()
            .status
            .insert((status.device_id, status.coil_address), status.clone());
        Ok(())
    }
}

#[async_trait]
impl EventRecorder for MemoryStore {
    async fn record(&self, event: &AuditEvent) -> Result<()> {
        self.inner.write().events.push(event.clone());
        Ok(())
    }
}

#[async_trait]
impl AccountSource for MemoryStore {
    async fn active_accounts(&self) -> Result<Vec<AccountBalance>> {
        let mut accounts: Vec<AccountBalance> = self
            .inner
            .read()
            .accounts
            .values()
            .filter(|a| a.is_active)
            .cloned()
            .collect();
        accounts.sort_by_key(|a| a.account_id);
        Ok(accounts)
    }
}
