//! Auto-enforcement loop
//!
//! Compares each active account's energy usage with its allocation and queues
//! breaker commands: OFF once usage reaches 100%, ON while below. Commands go
//! through the same queue as manual ones and are executed by the dispatcher.

use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::DoSrvConfig;
use crate::error::Result;
use crate::model::{AccountBalance, CommandAction, DeviceTarget, NewCommand};
use crate::notes::Notes;
use crate::store::{CommandQueue, StoreHandles};

pub const SOURCE_AUTO_LIMIT: &str = "auto_limit";
pub const SOURCE_AUTO_RESTORE: &str = "auto_restore";
pub const REASON_LIMIT: &str = "Units exceeded 100%";
pub const REASON_RESTORE: &str = "Recharge completed";

#[derive(Debug, Clone, PartialEq)]
pub struct EnforcementSettings {
    pub enabled: bool,
    pub duplicate_window: Duration,
    pub requested_by: i64,
    pub max_coil_address: u16,
    pub max_retries: i32,
    pub dry_run: bool,
}

impl EnforcementSettings {
    pub fn from_config(config: &DoSrvConfig) -> Self {
        let window = i64::try_from(config.enforcement.duplicate_window_secs).unwrap_or(i64::MAX);
        Self {
            enabled: config.enforcement.enabled,
            duplicate_window: Duration::try_seconds(window).unwrap_or(Duration::MAX),
            requested_by: config.enforcement.requested_by,
            max_coil_address: config.enforcement.max_coil_address,
            max_retries: i32::try_from(config.execution.default_max_retries).unwrap_or(i32::MAX),
            dry_run: config.worker.dry_run,
        }
    }
}

impl Default for EnforcementSettings {
    fn default() -> Self {
        Self::from_config(&DoSrvConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(i64),
    /// Same device, coil and command already pending within the window
    Suppressed,
}

/// Skips commands that duplicate a recent PENDING one
pub struct DuplicateSuppressor {
    queue: Arc<dyn CommandQueue>,
    clock: Arc<dyn Clock>,
    window: Duration,
}

impl DuplicateSuppressor {
    pub fn new(queue: Arc<dyn CommandQueue>, clock: Arc<dyn Clock>, window: Duration) -> Self {
        Self {
            queue,
            clock,
            window,
        }
    }

    /// A failed lookup allows the enqueue
    pub async fn should_enqueue(
        &self,
        device_id: i64,
        coil_address: u16,
        action: &CommandAction,
    ) -> bool {
        let since = self.clock.now() - self.window;
        match self
            .queue
            .has_recent_pending(device_id, coil_address, action, since)
            .await
        {
            Ok(duplicate) => !duplicate,
            Err(e) => {
                warn!(
                    "Duplicate check failed for device {} coil {}: {}",
                    device_id, coil_address, e
                );
                true
            },
        }
    }

    pub async fn enqueue_if_new(&self, command: NewCommand) -> Result<EnqueueOutcome> {
        if !self
            .should_enqueue(command.device_id, command.coil_address, &command.action)
            .await
        {
            return Ok(EnqueueOutcome::Suppressed);
        }
        let id = self.queue.enqueue(command, self.clock.now()).await?;
        Ok(EnqueueOutcome::Enqueued(id))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnforcementSummary {
    pub accounts_checked: usize,
    pub enqueued_off: usize,
    pub enqueued_on: usize,
    pub suppressed: usize,
    /// Decisions logged but not enqueued in dry-run mode
    pub planned: usize,
    pub failed_accounts: usize,
}

impl EnforcementSummary {
    pub fn enqueued(&self) -> usize {
        self.enqueued_off + self.enqueued_on
    }
}

pub struct EnforcementLoop {
    stores: StoreHandles,
    suppressor: DuplicateSuppressor,
    settings: EnforcementSettings,
}

impl EnforcementLoop {
    pub fn new(stores: StoreHandles, clock: Arc<dyn Clock>, settings: EnforcementSettings) -> Self {
        let suppressor =
            DuplicateSuppressor::new(stores.queue.clone(), clock, settings.duplicate_window);
        Self {
            stores,
            suppressor,
            settings,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    pub async fn run_cycle(&self) -> Result<EnforcementSummary> {
        let mut summary = EnforcementSummary::default();
        if !self.settings.enabled {
            return Ok(summary);
        }

        let accounts = self.stores.accounts.active_accounts().await?;
        for account in accounts.iter().filter(|a| a.is_active) {
            summary.accounts_checked += 1;
            if let Err(e) = self.enforce_account(account, &mut summary).await {
                summary.failed_accounts += 1;
                warn!("Enforcement for account {} failed: {}", account.account_id, e);
            }
        }

        if summary.enqueued() > 0 || summary.failed_accounts > 0 {
            info!(
                "Enforcement: {} accounts, {} OFF, {} ON, {} suppressed, {} failed",
                summary.accounts_checked,
                summary.enqueued_off,
                summary.enqueued_on,
                summary.suppressed,
                summary.failed_accounts
            );
        }
        Ok(summary)
    }

    async fn enforce_account(
        &self,
        account: &AccountBalance,
        summary: &mut EnforcementSummary,
    ) -> Result<()> {
        let ratio = account.usage_ratio();
        let (action, source, reason) = if ratio >= 1.0 {
            (CommandAction::Off, SOURCE_AUTO_LIMIT, REASON_LIMIT)
        } else {
            (CommandAction::On, SOURCE_AUTO_RESTORE, REASON_RESTORE)
        };
        debug!(
            "Account {} usage {:.1}% -> {}",
            account.account_id,
            ratio * 100.0,
            action
        );

        let devices = self
            .stores
            .devices
            .devices_for_account(account.account_id)
            .await?;
        for device in &devices {
            let Some(coil) = self.enforceable_coil(device) else {
                continue;
            };

            if self.settings.dry_run {
                info!(
                    "[dry-run] would enqueue {} for device {} coil {} (account {}, {:.1}%)",
                    action,
                    device.device_id,
                    coil,
                    account.account_id,
                    ratio * 100.0
                );
                summary.planned += 1;
                continue;
            }

            let notes = Notes::default().with("source", source).with("reason", reason);
            let command = NewCommand::new(device.device_id, coil, action.clone())
                .requested_by(self.settings.requested_by)
                .max_retries(self.settings.max_retries)
                .notes(notes.to_string());
            match self.suppressor.enqueue_if_new(command).await? {
                EnqueueOutcome::Enqueued(id) => {
                    info!(
                        "Enqueued {} command {} for device {} coil {} ({})",
                        action, id, device.device_id, coil, reason
                    );
                    match action {
                        CommandAction::Off => summary.enqueued_off += 1,
                        _ => summary.enqueued_on += 1,
                    }
                },
                EnqueueOutcome::Suppressed => {
                    debug!(
                        "{} for device {} coil {} already pending",
                        action, device.device_id, coil
                    );
                    summary.suppressed += 1;
                },
            }
        }
        Ok(())
    }

    fn enforceable_coil(&self, device: &DeviceTarget) -> Option<u16> {
        if !device.is_active || !device.breaker_enabled {
            return None;
        }
        let coil = device.breaker_coil.unwrap_or_else(|| {
            warn!("Device {} has no breaker coil, using coil 0", device.device_id);
            0
        });
        if coil > self.settings.max_coil_address {
            warn!(
                "Device {} breaker coil {} above {}, skipped",
                device.device_id, coil, self.settings.max_coil_address
            );
            return None;
        }
        Some(coil)
    }
}
