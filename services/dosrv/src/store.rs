//! Storage abstraction for the command queue and its collaborators
//!
//! Implementations:
//! - `SqliteStore`: production backend (sqlx + SQLite)
//! - `MemoryStore`: in-process backend for tests and dry runs

mod memory_impl;
mod sqlite_impl;

pub use memory_impl::MemoryStore;
pub use sqlite_impl::SqliteStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::Result;
use crate::model::{
    AccountBalance, AuditEvent, Command, CommandAction, CommandCompletion, DeviceTarget, DoStatus,
    NewCommand,
};

/// Durable command queue; the only shared mutable resource
#[async_trait]
pub trait CommandQueue: Send + Sync {
    /// Insert a PENDING command and return its id
    async fn enqueue(&self, command: NewCommand, requested_at: DateTime<Utc>) -> Result<i64>;

    /// PENDING commands, oldest first
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<Command>>;

    async fn get_command(&self, id: i64) -> Result<Option<Command>>;

    /// Whether a PENDING command for the same device, coil and action was
    /// requested at or after `since`
    async fn has_recent_pending(
        &self,
        device_id: i64,
        coil_address: u16,
        action: &CommandAction,
        since: DateTime<Utc>,
    ) -> Result<bool>;

    /// Move a PENDING command to its terminal state.
    ///
    /// Returns false when the row was no longer PENDING; terminal rows are
    /// never rewritten.
    async fn complete(&self, id: i64, completion: &CommandCompletion) -> Result<bool>;

    /// Most recent commands regardless of state, newest first
    async fn list_recent(&self, limit: usize) -> Result<Vec<Command>>;
}

/// Device addressing lookup
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn resolve(&self, device_id: i64) -> Result<Option<DeviceTarget>>;

    async fn devices_for_account(&self, account_id: i64) -> Result<Vec<DeviceTarget>>;
}

/// Last known output state per device coil
#[async_trait]
pub trait StatusCache: Send + Sync {
    async fn get_status(&self, device_id: i64, coil_address: u16) -> Result<Option<DoStatus>>;

    async fn upsert_status(&self, status: &DoStatus) -> Result<()>;
}

#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> Result<()>;
}

/// Balance snapshots consumed by the enforcement loop
#[async_trait]
pub trait AccountSource: Send + Sync {
    async fn active_accounts(&self) -> Result<Vec<AccountBalance>>;
}

/// Trait objects shared by the engine, dispatcher and enforcement loop
#[derive(Clone)]
pub struct StoreHandles {
    pub queue: Arc<dyn CommandQueue>,
    pub devices: Arc<dyn DeviceRegistry>,
    pub status: Arc<dyn StatusCache>,
    pub events: Arc<dyn EventRecorder>,
    pub accounts: Arc<dyn AccountSource>,
}

impl StoreHandles {
    /// All handles backed by one store
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: CommandQueue + DeviceRegistry + StatusCache + EventRecorder + AccountSource + 'static,
    {
        Self {
            queue: store.clone(),
            devices: store.clone(),
            status: store.clone(),
            events: store.clone(),
            accounts: store,
        }
    }
}

/// Fixed-width UTC text so lexical order equals time order
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// SQLite `datetime('now')` text, optionally with a fraction; always UTC
const SQLITE_DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

/// Accepts our own RFC 3339 text and the naive UTC text other producers write
pub(crate) fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    let text = text.trim();
    match DateTime::parse_from_rfc3339(text) {
        Ok(dt) => Ok(dt.with_timezone(&Utc)),
        Err(e) => SQLITE_DATETIME_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
            .map(|naive| naive.and_utc())
            .ok_or_else(|| {
                crate::error::DoSrvError::storage(format!("bad timestamp '{text}': {e}"))
            }),
    }
}
