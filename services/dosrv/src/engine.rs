//! Command execution engine
//!
//! Drives one queued command to a terminal state:
//!
//! ```text
//! PENDING ──(cache == desired)──────────────────────────────> SUCCESS (skipped)
//!    │
//!    └──> ATTEMPTING: FC06 write × max_retries ──> FC05 coil fallback
//!              │
//!              └──> read-back (FC03 & mask, else FC02) ──> SUCCESS | FAILED
//! ```
//!
//! SUCCESS always means a write was accepted and a read-back confirmed the
//! requested state. Every outcome is persisted with a status cache update and
//! an audit event.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, error, info, warn};
use voltage_protocols::modbus::{decode_do_status, encode_do_command, DO_ACTION_OFF, DO_ACTION_ON};
use voltage_protocols::LinkError;

use crate::clock::Clock;
use crate::config::DoSrvConfig;
use crate::error::Result;
use crate::model::{
    AuditEvent, Command, CommandAction, CommandCompletion, DeviceTarget, DoStatus, EventLevel,
    ExecutionResult, EVENT_DO_CONTROL, EVENT_DO_CONTROL_FAILED,
};
use crate::notes::Notes;
use crate::store::StoreHandles;
use crate::transport::{DigitalOutputLink, Endpoint, LinkConnector};

/// Execution parameters resolved from configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSettings {
    pub default_max_retries: u32,
    pub retry_delay: Duration,
    pub default_port: u16,
    pub write_register: u16,
    pub read_register: u16,
    pub status_bitmask: u16,
    pub status_input: u16,
    pub output_id: u8,
    pub discrete_input_fallback: bool,
}

impl ExecutionSettings {
    pub fn from_config(config: &DoSrvConfig) -> Self {
        let exec = &config.execution;
        Self {
            default_max_retries: exec.default_max_retries,
            retry_delay: Duration::from_millis(exec.retry_delay_ms),
            default_port: config.modbus.port,
            write_register: exec.write_register,
            read_register: exec.read_register,
            status_bitmask: exec.status_bitmask,
            status_input: exec.status_input,
            output_id: exec.output_id,
            discrete_input_fallback: exec.discrete_input_fallback,
        }
    }
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self::from_config(&DoSrvConfig::default())
    }
}

/// Which write produced a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Numbered(u32),
    Fallback,
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numbered(n) => write!(f, "{n}"),
            Self::Fallback => f.write_str("fallback"),
        }
    }
}

/// Why a command ended FAILED; `Display` is the persisted reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    MissingTarget,
    UnknownCommand(String),
    ConnectFailed(String),
    AttemptFailed { attempt: Attempt, detail: String },
    ReadbackMismatch,
    ReadbackMissing,
}

impl FailureReason {
    /// Transport failures are retried; everything else ends the command
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectFailed(_) | Self::AttemptFailed { .. })
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingTarget => f.write_str("missing_analyzer_ip"),
            Self::UnknownCommand(text) => write!(f, "unknown_command:{text}"),
            Self::ConnectFailed(host) => write!(f, "connect_failed:{host}"),
            Self::AttemptFailed { attempt, detail } => write!(f, "attempt_failed:{attempt}:{detail}"),
            Self::ReadbackMismatch => f.write_str("readback_mismatch"),
            Self::ReadbackMissing => f.write_str("readback_missing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Cached state already matched; no device I/O
    Skipped,
    Succeeded,
    Failed(FailureReason),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }

    pub fn result(&self) -> ExecutionResult {
        if self.is_success() {
            ExecutionResult::Success
        } else {
            ExecutionResult::Failed
        }
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            Self::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Summary of one execution
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub command_id: i64,
    pub outcome: Outcome,
    pub desired_state: Option<bool>,
    pub previous_state: Option<bool>,
    pub observed_state: Option<bool>,
    pub attempts: u32,
    pub fallback_used: bool,
    pub retry_count: i32,
    /// False when the row had already left PENDING
    pub persisted: bool,
}

#[derive(Debug, Clone, Copy)]
struct RegisterPlan {
    write_register: u16,
    read_register: u16,
    status_bitmask: u16,
    status_input: u16,
    coil: u16,
}

impl RegisterPlan {
    fn resolve(
        settings: &ExecutionSettings,
        target: &DeviceTarget,
        notes: &Notes,
        coil: u16,
    ) -> Self {
        Self {
            write_register: notes
                .register_override()
                .or(target.write_register)
                .unwrap_or(settings.write_register),
            read_register: target.read_register.unwrap_or(settings.read_register),
            status_bitmask: target.status_bitmask.unwrap_or(settings.status_bitmask),
            status_input: target.status_input.unwrap_or(settings.status_input),
            coil,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum WriteOp {
    /// FC06 command word
    Register { address: u16, value: u16 },
    /// FC05 fallback
    Coil { address: u16, value: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadbackSource {
    HoldingRegister,
    DiscreteInput,
}

impl ReadbackSource {
    fn as_str(self) -> &'static str {
        match self {
            Self::HoldingRegister => "holding_register",
            Self::DiscreteInput => "discrete_input",
        }
    }
}

#[derive(Debug, Default)]
struct Readback {
    raw: Option<u16>,
    state: Option<bool>,
    source: Option<ReadbackSource>,
}

#[derive(Debug, Default)]
struct WriteTrace {
    attempts: u32,
    fallback_used: bool,
    written: bool,
    last_failure: Option<FailureReason>,
}

impl WriteTrace {
    fn retry_count(&self) -> i32 {
        let retries = self.attempts.saturating_sub(1) + u32::from(self.fallback_used);
        i32::try_from(retries).unwrap_or(i32::MAX)
    }
}

/// Everything persisted for one command
struct Finish<'a> {
    command: &'a Command,
    notes: &'a Notes,
    outcome: Outcome,
    desired: Option<bool>,
    previous: Option<bool>,
    observed: Option<bool>,
    /// Whether the status cache should be written
    touch_cache: bool,
    plan: Option<RegisterPlan>,
    trace: WriteTrace,
    readback: Readback,
}

pub struct ExecutionEngine {
    stores: StoreHandles,
    connector: Arc<dyn LinkConnector>,
    clock: Arc<dyn Clock>,
    settings: ExecutionSettings,
}

impl ExecutionEngine {
    pub fn new(
        stores: StoreHandles,
        connector: Arc<dyn LinkConnector>,
        clock: Arc<dyn Clock>,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            stores,
            connector,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    /// Execute one PENDING command and persist the outcome.
    ///
    /// Device failures end in a FAILED report; `Err` means the store could
    /// not be read or the final status could not be written.
    pub async fn execute(&self, command: &Command) -> Result<ExecutionReport> {
        let notes = command.parsed_notes();
        info!(
            "Command {} received: device {} coil {} {} (source={})",
            command.id,
            command.device_id,
            command.coil_address,
            command.action,
            notes.source()
        );

        let target = match self.stores.devices.resolve(command.device_id).await? {
            Some(target) if target.has_host() => target,
            _ => {
                return self
                    .finish(Finish::without_io(command, &notes, FailureReason::MissingTarget))
                    .await;
            },
        };

        let previous = self.cached_state(command).await;
        let desired = match &command.action {
            CommandAction::On => true,
            CommandAction::Off => false,
            CommandAction::Toggle => previous.map_or(true, |on| !on),
            CommandAction::Unrecognized(text) => {
                let reason = FailureReason::UnknownCommand(text.clone());
                let mut finish = Finish::without_io(command, &notes, reason);
                finish.previous = previous;
                return self.finish(finish).await;
            },
        };
        let plan = RegisterPlan::resolve(&self.settings, &target, &notes, command.coil_address);

        if previous == Some(desired) {
            info!(
                "Command {} skipped: device {} coil {} already {}",
                command.id,
                command.device_id,
                command.coil_address,
                state_label(Some(desired))
            );
            return self
                .finish(Finish {
                    command,
                    notes: &notes,
                    outcome: Outcome::Skipped,
                    desired: Some(desired),
                    previous,
                    observed: Some(desired),
                    touch_cache: true,
                    plan: Some(plan),
                    trace: WriteTrace::default(),
                    readback: Readback::default(),
                })
                .await;
        }

        let endpoint = Endpoint::for_target(&target, self.settings.default_port);

        let mut link: Option<Box<dyn DigitalOutputLink>> = None;
        let trace = self
            .write_with_retry(command, &endpoint, &plan, desired, &mut link)
            .await;
        let readback = if trace.written {
            self.read_back(&endpoint, &plan, &mut link).await
        } else {
            Readback::default()
        };
        if let Some(mut open) = link.take() {
            open.close().await;
        }

        let outcome = match (trace.written, readback.state) {
            (true, Some(state)) if state == desired => Outcome::Succeeded,
            (true, Some(_)) => Outcome::Failed(FailureReason::ReadbackMismatch),
            (true, None) => Outcome::Failed(FailureReason::ReadbackMissing),
            (false, _) => Outcome::Failed(
                trace
                    .last_failure
                    .clone()
                    .unwrap_or_else(|| FailureReason::ConnectFailed(endpoint.host.clone())),
            ),
        };

        self.finish(Finish {
            command,
            notes: &notes,
            outcome,
            desired: Some(desired),
            previous,
            observed: readback.state,
            touch_cache: true,
            plan: Some(plan),
            trace,
            readback,
        })
        .await
    }

    async fn cached_state(&self, command: &Command) -> Option<bool> {
        match self
            .stores
            .status
            .get_status(command.device_id, command.coil_address)
            .await
        {
            Ok(status) => status.and_then(|s| s.state),
            Err(e) => {
                warn!(
                    "Status cache read failed for device {} coil {}: {}",
                    command.device_id, command.coil_address, e
                );
                None
            },
        }
    }

    /// Primary FC06 attempts, then one FC05 coil write
    async fn write_with_retry(
        &self,
        command: &Command,
        endpoint: &Endpoint,
        plan: &RegisterPlan,
        desired: bool,
        link: &mut Option<Box<dyn DigitalOutputLink>>,
    ) -> WriteTrace {
        let max_attempts = u32::try_from(command.max_retries)
            .ok()
            .filter(|n| *n > 0)
            .unwrap_or(self.settings.default_max_retries);
        let action = if desired { DO_ACTION_ON } else { DO_ACTION_OFF };
        let word = encode_do_command(self.settings.output_id, action);
        let mut trace = WriteTrace::default();

        for n in 1..=max_attempts {
            if n > 1 && !self.settings.retry_delay.is_zero() {
                tokio::time::sleep(self.settings.retry_delay).await;
            }
            trace.attempts = n;
            debug!(
                "Command {} attempt {}/{}: FC06 reg {} value {}",
                command.id, n, max_attempts, plan.write_register, word
            );

            match self
                .attempt_write(
                    endpoint,
                    link,
                    Attempt::Numbered(n),
                    WriteOp::Register {
                        address: plan.write_register,
                        value: word,
                    },
                )
                .await
            {
                Ok(()) => {
                    trace.written = true;
                    return trace;
                },
                Err(reason) => {
                    warn!("Command {} attempt {} failed: {}", command.id, n, reason);
                    trace.last_failure = Some(reason);
                },
            }
        }

        trace.fallback_used = true;
        info!(
            "Command {} primary write exhausted, falling back to coil {}",
            command.id, plan.coil
        );
        match self
            .attempt_write(
                endpoint,
                link,
                Attempt::Fallback,
                WriteOp::Coil {
                    address: plan.coil,
                    value: desired,
                },
            )
            .await
        {
            Ok(()) => trace.written = true,
            Err(reason) => {
                warn!("Command {} fallback failed: {}", command.id, reason);
                trace.last_failure = Some(reason);
            },
        }
        trace
    }

    /// Connect if needed, then run one write. Fatal I/O errors drop the link.
    async fn attempt_write(
        &self,
        endpoint: &Endpoint,
        link: &mut Option<Box<dyn DigitalOutputLink>>,
        attempt: Attempt,
        op: WriteOp,
    ) -> std::result::Result<(), FailureReason> {
        let open = self
            .ensure_link(endpoint, link)
            .await
            .map_err(|_| FailureReason::ConnectFailed(endpoint.host.clone()))?;
        let result = match op {
            WriteOp::Register { address, value } => open.write_register(address, value).await,
            WriteOp::Coil { address, value } => open.write_coil(address, value).await,
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                drop_if_fatal(link, &e).await;
                Err(FailureReason::AttemptFailed {
                    attempt,
                    detail: e.to_string(),
                })
            },
        }
    }

    async fn ensure_link<'a>(
        &self,
        endpoint: &Endpoint,
        link: &'a mut Option<Box<dyn DigitalOutputLink>>,
    ) -> std::result::Result<&'a mut Box<dyn DigitalOutputLink>, LinkError> {
        if link.as_ref().is_some_and(|l| !l.is_connected()) {
            if let Some(mut stale) = link.take() {
                stale.close().await;
            }
        }
        if link.is_none() {
            match self.connector.connect(endpoint).await {
                Ok(open) => *link = Some(open),
                Err(e) => {
                    warn!("Connect to {} failed: {}", endpoint, e);
                    return Err(e);
                },
            }
        }
        link.as_mut().ok_or(LinkError::NotConnected)
    }

    /// Status register through the bitmask, else the status discrete input
    async fn read_back(
        &self,
        endpoint: &Endpoint,
        plan: &RegisterPlan,
        link: &mut Option<Box<dyn DigitalOutputLink>>,
    ) -> Readback {
        let holding = match self.ensure_link(endpoint, link).await {
            Ok(open) => Some(open.read_holding_register(plan.read_register).await),
            Err(e) => {
                warn!("Read-back connect failed: {}", e);
                None
            },
        };
        match holding {
            Some(Ok(raw)) => {
                let state = decode_do_status(raw, plan.status_bitmask);
                debug!(
                    "Read-back reg {} = 0x{:04X} (mask 0x{:04X}) -> {}",
                    plan.read_register,
                    raw,
                    plan.status_bitmask,
                    state_label(Some(state))
                );
                return Readback {
                    raw: Some(raw),
                    state: Some(state),
                    source: Some(ReadbackSource::HoldingRegister),
                };
            },
            Some(Err(e)) => {
                warn!("Read-back of reg {} failed: {}", plan.read_register, e);
                drop_if_fatal(link, &e).await;
            },
            None => {},
        }

        if !self.settings.discrete_input_fallback {
            return Readback::default();
        }

        let open = match self.ensure_link(endpoint, link).await {
            Ok(open) => open,
            Err(_) => return Readback::default(),
        };
        match open.read_discrete_input(plan.status_input).await {
            Ok(state) => Readback {
                raw: None,
                state: Some(state),
                source: Some(ReadbackSource::DiscreteInput),
            },
            Err(e) => {
                warn!("Read-back of input {} failed: {}", plan.status_input, e);
                Readback::default()
            },
        }
    }

    /// Terminal write, cache update and audit event.
    ///
    /// The command row is written first; its error is returned only after the
    /// cache and event were attempted.
    async fn finish(&self, finish: Finish<'_>) -> Result<ExecutionReport> {
        let Finish {
            command,
            notes,
            outcome,
            desired,
            previous,
            observed,
            touch_cache,
            plan,
            trace,
            readback,
        } = finish;
        let now = self.clock.now();
        let retry_count = trace.retry_count();
        let completion = CommandCompletion {
            result: outcome.result(),
            retry_count,
            error_message: outcome.failure().map(ToString::to_string),
            executed_at: now,
        };

        let completed = self.stores.queue.complete(command.id, &completion).await;
        if let Ok(false) = completed {
            warn!(
                "Command {} was no longer PENDING; terminal state kept",
                command.id
            );
        }

        if touch_cache {
            let status = DoStatus {
                device_id: command.device_id,
                coil_address: command.coil_address,
                state: observed,
                last_updated: now,
                update_source: notes.source().to_string(),
            };
            if let Err(e) = self.stores.status.upsert_status(&status).await {
                warn!(
                    "Status cache write failed for device {} coil {}: {}",
                    command.device_id, command.coil_address, e
                );
            }
        }

        let label = state_label(desired);
        let (level, event_type, message) = match &outcome {
            Outcome::Failed(reason) => (
                EventLevel::Error,
                EVENT_DO_CONTROL_FAILED,
                format!("DO {label} failed: {reason}"),
            ),
            _ => (EventLevel::Info, EVENT_DO_CONTROL, format!("DO {label}")),
        };
        let metadata = json!({
            "command_id": command.id,
            "command": command.action.as_str(),
            "type": if notes.is_automatic() { "auto" } else { "manual" },
            "coil_address": command.coil_address,
            "notes": command.notes,
            "old_state": previous,
            "new_state": observed,
            "requested_state": desired,
            "write_register": plan.map(|p| p.write_register),
            "read_register": plan.map(|p| p.read_register),
            "status_bitmask": plan.map(|p| p.status_bitmask),
            "read_back": readback.raw,
            "read_back_source": readback.source.map(ReadbackSource::as_str),
            "attempts": trace.attempts,
            "fallback_used": trace.fallback_used,
            "skipped": outcome == Outcome::Skipped,
            "error": outcome.failure().map(ToString::to_string),
        });
        let event = AuditEvent {
            device_id: command.device_id,
            level,
            event_type: event_type.to_string(),
            message,
            source: notes.source().to_string(),
            metadata,
            timestamp: now,
        };
        if let Err(e) = self.stores.events.record(&event).await {
            warn!("Audit event for command {} not recorded: {}", command.id, e);
        }

        match &outcome {
            Outcome::Failed(reason) => error!(
                "Command {} FAILED: device {} coil {} {} ({})",
                command.id, command.device_id, command.coil_address, command.action, reason
            ),
            _ => info!(
                "Command {} SUCCESS: device {} coil {} {}",
                command.id, command.device_id, command.coil_address, label
            ),
        }

        let persisted = completed?;
        Ok(ExecutionReport {
            command_id: command.id,
            outcome,
            desired_state: desired,
            previous_state: previous,
            observed_state: observed,
            attempts: trace.attempts,
            fallback_used: trace.fallback_used,
            retry_count,
            persisted,
        })
    }
}

impl<'a> Finish<'a> {
    /// Failure decided before any device I/O; the cache is left alone
    fn without_io(command: &'a Command, notes: &'a Notes, reason: FailureReason) -> Self {
        Self {
            command,
            notes,
            outcome: Outcome::Failed(reason),
            desired: command.action.direct_state(),
            previous: None,
            observed: None,
            touch_cache: false,
            plan: None,
            trace: WriteTrace::default(),
            readback: Readback::default(),
        }
    }
}

async fn drop_if_fatal(link: &mut Option<Box<dyn DigitalOutputLink>>, err: &LinkError) {
    if err.is_connection_fatal() {
        if let Some(mut broken) = link.take() {
            broken.close().await;
        }
    }
}

fn state_label(state: Option<bool>) -> &'static str {
    match state {
        Some(true) => "ON",
        Some(false) => "OFF",
        None => "UNKNOWN",
    }
}
