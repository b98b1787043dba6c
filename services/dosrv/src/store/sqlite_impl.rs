//! SQLite store - command queue, device registry, status cache and audit log

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous},
    Row, SqlitePool,
};
use tracing::{debug, info, warn};

use super::{
    format_timestamp, parse_timestamp, AccountSource, CommandQueue, DeviceRegistry, EventRecorder,
    StatusCache,
};
use crate::error::{DoSrvError, Result};
use crate::model::{
    AccountBalance, AuditEvent, Command, CommandAction, CommandCompletion, DeviceTarget, DoStatus,
    EventLevel, ExecutionResult, NewCommand,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS devices (
        device_id INTEGER PRIMARY KEY,
        account_id INTEGER,
        host TEXT NOT NULL DEFAULT '',
        port INTEGER,
        unit_id INTEGER NOT NULL DEFAULT 1,
        write_register INTEGER,
        read_register INTEGER,
        status_bitmask INTEGER,
        status_input INTEGER,
        breaker_coil INTEGER,
        breaker_enabled INTEGER NOT NULL DEFAULT 0,
        is_active INTEGER NOT NULL DEFAULT 1
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS accounts (
        account_id INTEGER PRIMARY KEY,
        allocated_kwh REAL NOT NULL DEFAULT 0,
        used_kwh REAL NOT NULL DEFAULT 0,
        is_active INTEGER NOT NULL DEFAULT 1
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS do_commands (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id INTEGER NOT NULL,
        coil_address INTEGER NOT NULL,
        command TEXT NOT NULL,
        requested_by INTEGER,
        max_retries INTEGER NOT NULL DEFAULT 3,
        retry_count INTEGER NOT NULL DEFAULT 0,
        notes TEXT,
        execution_result TEXT NOT NULL DEFAULT 'PENDING',
        error_message TEXT,
        requested_at TEXT NOT NULL,
        executed_at TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_do_commands_pending
        ON do_commands (execution_result, requested_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS do_status (
        device_id INTEGER NOT NULL,
        coil_address INTEGER NOT NULL,
        state INTEGER,
        last_updated TEXT NOT NULL,
        update_source TEXT NOT NULL,
        PRIMARY KEY (device_id, coil_address)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS do_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id INTEGER NOT NULL,
        level TEXT NOT NULL,
        event_type TEXT NOT NULL,
        message TEXT NOT NULL,
        source TEXT NOT NULL,
        metadata TEXT NOT NULL,
        timestamp TEXT NOT NULL
    )
    "#,
];

const COMMAND_COLUMNS: &str = "id, device_id, coil_address, command, requested_by, max_retries, \
     retry_count, notes, execution_result, error_message, requested_at, executed_at";

const DEVICE_COLUMNS: &str = "device_id, account_id, host, port, unit_id, write_register, \
     read_register, status_bitmask, status_input, breaker_coil, breaker_enabled, is_active";

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) a database file and ensure the schema
    pub async fn connect(path: impl AsRef<Path>, max_connections: u32) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        info!("SQLite store opened: {}", path.display());
        Self::from_pool(pool).await
    }

    /// Single-connection in-memory database
    pub async fn in_memory() -> Result<Self> {
        let options: SqliteConnectOptions = "sqlite::memory:".parse()?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("dosrv schema ready");
        Ok(())
    }

    pub async fn upsert_device(&self, device: &DeviceTarget) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO devices (device_id, account_id, host, port, unit_id, write_register,
                                 read_register, status_bitmask, status_input, breaker_coil,
                                 breaker_enabled, is_active)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
                account_id = excluded.account_id,
                host = excluded.host,
                port = excluded.port,
                unit_id = excluded.unit_id,
                write_register = excluded.write_register,
                read_register = excluded.read_register,
                status_bitmask = excluded.status_bitmask,
                status_input = excluded.status_input,
                breaker_coil = excluded.breaker_coil,
                breaker_enabled = excluded.breaker_enabled,
                is_active = excluded.is_active
            "#,
        )
        .bind(device.device_id)
        .bind(device.account_id)
        .bind(&device.host)
        .bind(device.port.map(i64::from))
        .bind(i64::from(device.unit_id))
        .bind(device.write_register.map(i64::from))
        .bind(device.read_register.map(i64::from))
        .bind(device.status_bitmask.map(i64::from))
        .bind(device.status_input.map(i64::from))
        .bind(device.breaker_coil.map(i64::from))
        .bind(device.breaker_enabled)
        .bind(device.is_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_account(&self, account: &AccountBalance) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (account_id, allocated_kwh, used_kwh, is_active)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(account_id) DO UPDATE SET
                allocated_kwh = excluded.allocated_kwh,
                used_kwh = excluded.used_kwh,
                is_active = excluded.is_active
            "#,
        )
        .bind(account.account_id)
        .bind(account.allocated_kwh)
        .bind(account.used_kwh)
        .bind(account.is_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Audit events for a device, newest first
    pub async fn events_for_device(&self, device_id: i64, limit: usize) -> Result<Vec<AuditEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT device_id, level, event_type, message, source, metadata, timestamp
            FROM do_events
            WHERE device_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(device_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(hydrate_event).collect()
    }
}

impl SqliteStore {
    /// A PENDING row that cannot become a [`Command`] would otherwise block the
    /// queue forever; close it out as FAILED.
    async fn fail_malformed(&self, id: i64, err: &DoSrvError) -> Result<()> {
        let detail = match err {
            DoSrvError::Storage(msg) => msg.clone(),
            other => other.to_string(),
        };
        warn!("Command {} is malformed, marking FAILED: {}", id, detail);
        sqlx::query(
            r#"
            UPDATE do_commands
            SET execution_result = 'FAILED', error_message = ?, executed_at = ?
            WHERE id = ? AND execution_result = 'PENDING'
            "#,
        )
        .bind(format!("unexpected:{detail}"))
        .bind(format_timestamp(&Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn to_u16(value: i64, column: &str) -> Result<u16> {
    u16::try_from(value)
        .map_err(|_| DoSrvError::storage(format!("{column} out of range: {value}")))
}

fn to_opt_u16(value: Option<i64>, column: &str) -> Result<Option<u16>> {
    value.map(|v| to_u16(v, column)).transpose()
}

fn hydrate_command(row: SqliteRow) -> Result<Command> {
    let result_text: String = row.try_get("execution_result")?;
    let result = ExecutionResult::parse(&result_text)
        .ok_or_else(|| DoSrvError::storage(format!("unknown execution_result '{result_text}'")))?;
    let command_text: String = row.try_get("command")?;
    let requested_at: String = row.try_get("requested_at")?;
    let executed_at: Option<String> = row.try_get("executed_at")?;

    Ok(Command {
        id: row.try_get("id")?,
        device_id: row.try_get("device_id")?,
        coil_address: to_u16(row.try_get("coil_address")?, "coil_address")?,
        action: CommandAction::parse(&command_text),
        requested_by: row.try_get("requested_by")?,
        max_retries: row.try_get("max_retries")?,
        retry_count: row.try_get("retry_count")?,
        notes: row.try_get("notes")?,
        result,
        error_message: row.try_get("error_message")?,
        requested_at: parse_timestamp(&requested_at)?,
        executed_at: executed_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn hydrate_device(row: SqliteRow) -> Result<DeviceTarget> {
    let unit_id: i64 = row.try_get("unit_id")?;
    Ok(DeviceTarget {
        device_id: row.try_get("device_id")?,
        account_id: row.try_get("account_id")?,
        host: row.try_get("host")?,
        port: to_opt_u16(row.try_get("port")?, "port")?,
        unit_id: u8::try_from(unit_id)
            .map_err(|_| DoSrvError::storage(format!("unit_id out of range: {unit_id}")))?,
        write_register: to_opt_u16(row.try_get("write_register")?, "write_register")?,
        read_register: to_opt_u16(row.try_get("read_register")?, "read_register")?,
        status_bitmask: to_opt_u16(row.try_get("status_bitmask")?, "status_bitmask")?,
        status_input: to_opt_u16(row.try_get("status_input")?, "status_input")?,
        breaker_coil: to_opt_u16(row.try_get("breaker_coil")?, "breaker_coil")?,
        breaker_enabled: row.try_get("breaker_enabled")?,
        is_active: row.try_get("is_active")?,
    })
}

fn hydrate_event(row: SqliteRow) -> Result<AuditEvent> {
    let level: String = row.try_get("level")?;
    let metadata: String = row.try_get("metadata")?;
    let timestamp: String = row.try_get("timestamp")?;
    Ok(AuditEvent {
        device_id: row.try_get("device_id")?,
        level: if level == "ERROR" {
            EventLevel::Error
        } else {
            EventLevel::Info
        },
        event_type: row.try_get("event_type")?,
        message: row.try_get("message")?,
        source: row.try_get("source")?,
        metadata: serde_json::from_str(&metadata)?,
        timestamp: parse_timestamp(&timestamp)?,
    })
}

#[async_trait]
impl CommandQueue for SqliteStore {
    async fn enqueue(&self, command: NewCommand, requested_at: DateTime<Utc>) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO do_commands (device_id, coil_address, command, requested_by,
                                     max_retries, retry_count, notes, execution_result,
                                     requested_at)
            VALUES (?, ?, ?, ?, ?, 0, ?, 'PENDING', ?)
            "#,
        )
        .bind(command.device_id)
        .bind(i64::from(command.coil_address))
        .bind(command.action.as_str())
        .bind(command.requested_by)
        .bind(command.max_retries)
        .bind(&command.notes)
        .bind(format_timestamp(&requested_at))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<Command>> {
        let sql = format!(
            "SELECT {COMMAND_COLUMNS} FROM do_commands \
             WHERE execution_result = 'PENDING' \
             ORDER BY requested_at ASC, id ASC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut commands = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            match hydrate_command(row) {
                Ok(command) => commands.push(command),
                Err(e) => self.fail_malformed(id, &e).await?,
            }
        }
        Ok(commands)
    }

    async fn get_command(&self, id: i64) -> Result<Option<Command>> {
        let sql = format!("SELECT {COMMAND_COLUMNS} FROM do_commands WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(hydrate_command).transpose()
    }

    async fn has_recent_pending(
        &self,
        device_id: i64,
        coil_address: u16,
        action: &CommandAction,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT 1 FROM do_commands
            WHERE device_id = ? AND coil_address = ? AND command = ?
              AND execution_result = 'PENDING' AND requested_at >= ?
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .bind(i64::from(coil_address))
        .bind(action.as_str())
        .bind(format_timestamp(&since))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn complete(&self, id: i64, completion: &CommandCompletion) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE do_commands
            SET execution_result = ?, retry_count = ?, error_message = ?, executed_at = ?
            WHERE id = ? AND execution_result = 'PENDING'
            "#,
        )
        .bind(completion.result.as_str())
        .bind(completion.retry_count)
        .bind(&completion.error_message)
        .bind(format_timestamp(&completion.executed_at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Command>> {
        let sql = format!("SELECT {COMMAND_COLUMNS} FROM do_commands ORDER BY id DESC LIMIT ?");
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut commands = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            match hydrate_command(row) {
                Ok(command) => commands.push(command),
                Err(e) => warn!("Skipping unreadable command {}: {}", id, e),
            }
        }
        Ok(commands)
    }
}

#[async_trait]
impl DeviceRegistry for SqliteStore {
    async fn resolve(&self, device_id: i64) -> Result<Option<DeviceTarget>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE device_id = ?");
        let row = sqlx::query(&sql)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(hydrate_device).transpose()
    }

    async fn devices_for_account(&self, account_id: i64) -> Result<Vec<DeviceTarget>> {
        let sql = format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE account_id = ? ORDER BY device_id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(hydrate_device).collect()
    }
}

#[async_trait]
impl StatusCache for SqliteStore {
    async fn get_status(&self, device_id: i64, coil_address: u16) -> Result<Option<DoStatus>> {
        let row = sqlx::query(
            r#"
            SELECT device_id, coil_address, state, last_updated, update_source
            FROM do_status
            WHERE device_id = ? AND coil_address = ?
            "#,
        )
        .bind(device_id)
        .bind(i64::from(coil_address))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let last_updated: String = row.try_get("last_updated")?;
        Ok(Some(DoStatus {
            device_id: row.try_get("device_id")?,
            coil_address: to_u16(row.try_get("coil_address")?, "coil_address")?,
            state: row.try_get("state")?,
            last_updated: parse_timestamp(&last_updated)?,
            update_source: row.try_get("update_source")?,
        }))
    }

    async fn upsert_status(&self, status: &DoStatus) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO do_status (device_id, coil_address, state, last_updated, update_source)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(device_id, coil_address) DO UPDATE SET
                state = excluded.state,
                last_updated = excluded.last_updated,
                update_source = excluded.update_source
            "#,
        )
        .bind(status.device_id)
        .bind(i64::from(status.coil_address))
        .bind(status.state)
        .bind(format_timestamp(&status.last_updated))
        .bind(&status.update_source)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl EventRecorder for SqliteStore {
    async fn record(&self, event: &AuditEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO do_events (device_id, level, event_type, message, source, metadata, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.device_id)
        .bind(event.level.as_str())
        .bind(&event.event_type)
        .bind(&event.message)
        .bind(&event.source)
        .bind(serde_json::to_string(&event.metadata)?)
        .bind(format_timestamp(&event.timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AccountSource for SqliteStore {
    async fn active_accounts(&self) -> Result<Vec<AccountBalance>> {
        let rows = sqlx::query(
            r#"
            SELECT account_id, allocated_kwh, used_kwh, is_active
            FROM accounts
            WHERE is_active = 1
            ORDER BY account_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<AccountBalance> {
                Ok(AccountBalance {
                    account_id: row.try_get("account_id")?,
                    allocated_kwh: row.try_get("allocated_kwh")?,
                    used_kwh: row.try_get("used_kwh")?,
                    is_active: row.try_get("is_active")?,
                })
            })
            .collect()
    }
}
