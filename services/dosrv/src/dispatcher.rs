//! Command dispatcher - polls the queue and feeds the execution engine
//!
//! One cycle runs the enforcement loop, then executes up to `batch_size`
//! PENDING commands oldest-first, one at a time. The loop sleeps the short
//! busy interval after a batch with work and the poll interval when idle.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::DoSrvConfig;
use crate::enforcement::{EnforcementLoop, EnforcementSummary};
use crate::engine::{ExecutionEngine, Outcome};
use crate::error::Result;
use crate::model::{Command, CommandCompletion, ExecutionResult};
use crate::store::StoreHandles;
use crate::transport::Endpoint;

#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherSettings {
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub busy_interval: Duration,
    pub dry_run: bool,
}

impl DispatcherSettings {
    pub fn from_config(config: &DoSrvConfig) -> Self {
        Self {
            batch_size: config.worker.batch_size,
            poll_interval: Duration::from_secs(config.worker.poll_interval_secs),
            busy_interval: Duration::from_secs(config.worker.busy_interval_secs),
            dry_run: config.worker.dry_run,
        }
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from_config(&DoSrvConfig::default())
    }
}

/// Result of one batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub fetched: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Commands that aborted and were marked `unexpected:<detail>`
    pub aborted: usize,
    /// Commands only listed in dry-run mode
    pub listed: usize,
}

impl BatchSummary {
    pub fn had_work(&self) -> bool {
        self.fetched > 0
    }
}

pub struct Dispatcher {
    stores: StoreHandles,
    engine: Arc<ExecutionEngine>,
    enforcement: Option<EnforcementLoop>,
    clock: Arc<dyn Clock>,
    settings: DispatcherSettings,
}

impl Dispatcher {
    pub fn new(
        stores: StoreHandles,
        engine: Arc<ExecutionEngine>,
        clock: Arc<dyn Clock>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            stores,
            engine,
            enforcement: None,
            clock,
            settings,
        }
    }

    pub fn with_enforcement(mut self, enforcement: EnforcementLoop) -> Self {
        self.enforcement = Some(enforcement);
        self
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    /// Execute up to `limit` PENDING commands sequentially.
    ///
    /// A command that errors or panics is marked FAILED and the batch goes on.
    pub async fn process_pending_commands(&self, limit: usize) -> Result<BatchSummary> {
        let commands = self.stores.queue.fetch_pending(limit).await?;
        let mut summary = BatchSummary {
            fetched: commands.len(),
            ..Default::default()
        };
        if commands.is_empty() {
            return Ok(summary);
        }
        debug!("Fetched {} pending commands", commands.len());

        if self.settings.dry_run {
            for command in &commands {
                self.list_command(command).await;
                summary.listed += 1;
            }
            return Ok(summary);
        }

        for command in commands {
            let command_id = command.id;
            let engine = Arc::clone(&self.engine);
            let handle = tokio::spawn(async move { engine.execute(&command).await });

            match handle.await {
                Ok(Ok(report)) => match report.outcome {
                    Outcome::Succeeded => summary.succeeded += 1,
                    Outcome::Skipped => summary.skipped += 1,
                    Outcome::Failed(_) => summary.failed += 1,
                },
                Ok(Err(e)) => {
                    error!("Command {} aborted: {}", command_id, e);
                    self.mark_unexpected(command_id, &e.to_string()).await;
                    summary.aborted += 1;
                },
                Err(join_err) => {
                    let detail = if join_err.is_panic() {
                        "panic during execution".to_string()
                    } else {
                        join_err.to_string()
                    };
                    error!("Command {} aborted: {}", command_id, detail);
                    self.mark_unexpected(command_id, &detail).await;
                    summary.aborted += 1;
                },
            }
        }

        info!(
            "Batch done: {} fetched, {} succeeded, {} skipped, {} failed, {} aborted",
            summary.fetched, summary.succeeded, summary.skipped, summary.failed, summary.aborted
        );
        Ok(summary)
    }

    /// Enforcement (when configured) followed by one batch
    pub async fn run_cycle(&self) -> Result<(Option<EnforcementSummary>, BatchSummary)> {
        let enforcement = match &self.enforcement {
            Some(enforcement) if enforcement.is_enabled() => match enforcement.run_cycle().await {
                Ok(summary) => Some(summary),
                Err(e) => {
                    warn!("Enforcement cycle failed: {}", e);
                    None
                },
            },
            _ => None,
        };
        let batch = self
            .process_pending_commands(self.settings.batch_size)
            .await?;
        Ok((enforcement, batch))
    }

    /// Pause before the next cycle: `busy_interval` while commands are
    /// draining, `poll_interval` after an empty, failed or dry-run batch
    pub fn next_delay(&self, batch: Option<&BatchSummary>) -> Duration {
        match batch {
            Some(batch) if batch.had_work() && !self.settings.dry_run => {
                self.settings.busy_interval
            },
            _ => self.settings.poll_interval,
        }
    }

    /// Poll until the token is cancelled; an in-flight batch always finishes
    pub async fn run(&self, token: CancellationToken) {
        info!(
            "Dispatcher started: batch {}, poll {:?}, busy {:?}{}",
            self.settings.batch_size,
            self.settings.poll_interval,
            self.settings.busy_interval,
            if self.settings.dry_run { ", dry-run" } else { "" }
        );

        while !token.is_cancelled() {
            let sleep_for = match self.run_cycle().await {
                Ok((_, batch)) => self.next_delay(Some(&batch)),
                Err(e) => {
                    error!("Dispatcher cycle error: {}", e);
                    self.next_delay(None)
                },
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {},
                _ = token.cancelled() => break,
            }
        }
        info!("Dispatcher stopped");
    }

    async fn list_command(&self, command: &Command) {
        let target = match self.stores.devices.resolve(command.device_id).await {
            Ok(Some(target)) => {
                Endpoint::for_target(&target, self.engine.settings().default_port).to_string()
            },
            Ok(None) => "unresolved".to_string(),
            Err(e) => format!("lookup failed: {e}"),
        };
        info!(
            "[dry-run] command {} device {} ({}) coil {} {} notes={:?}",
            command.id,
            command.device_id,
            target,
            command.coil_address,
            command.action,
            command.notes
        );
    }

    async fn mark_unexpected(&self, command_id: i64, detail: &str) {
        let completion = CommandCompletion {
            result: ExecutionResult::Failed,
            retry_count: 0,
            error_message: Some(format!("unexpected:{detail}")),
            executed_at: self.clock.now(),
        };
        if let Err(e) = self.stores.queue.complete(command_id, &completion).await {
            error!("Command {} could not be marked FAILED: {}", command_id, e);
        }
    }
}
