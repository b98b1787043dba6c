//! Digital Output Service (dosrv)
//!
//! Runs the breaker command worker and offers operator tools for queueing
//! commands, registering breaker devices and reading device registers.
//!
//! The `devices` and `accounts` tables are written by the `device` and
//! `account` commands here, or by the metering/billing services sharing the
//! database.

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use common::{init_logging, shutdown_token, ServiceArgs};
use dosrv::{
    clock::{Clock, SystemClock},
    config::DoSrvConfig,
    model::{AccountBalance, CommandAction, DeviceUpdate, NewCommand},
    notes::Notes,
    store::{CommandQueue, DeviceRegistry, SqliteStore, StatusCache, StoreHandles},
    transport::{Endpoint, ModbusTcpConnector},
    Dispatcher, DispatcherSettings, EnforcementLoop, EnforcementSettings, ExecutionEngine,
    ExecutionSettings,
};
use voltage_protocols::modbus::{constants::DEFAULT_UNIT_ID, decode_do_status, WordOrdering};

#[derive(Parser, Debug)]
#[command(name = "dosrv", version, about = "Digital output (breaker) control service")]
struct Cli {
    #[command(flatten)]
    service: ServiceArgs,

    /// List pending work and enforcement decisions without executing anything
    #[arg(long, global = true, env = "DOSRV_DRY_RUN")]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the worker loop (default)
    Run,
    /// Run enforcement and process one batch, then exit
    Once {
        /// Batch size override
        #[arg(long)]
        batch: Option<usize>,
    },
    /// Queue a breaker command
    Enqueue {
        #[arg(long)]
        device: i64,
        #[arg(long)]
        coil: u16,
        /// ON, OFF or TOGGLE
        #[arg(long)]
        action: String,
        #[arg(long)]
        requested_by: Option<i64>,
        #[arg(long, default_value_t = 3)]
        max_retries: i32,
        /// Raw notes text (`key=value;...`)
        #[arg(long)]
        notes: Option<String>,
        /// Write register override stored as `reg=`
        #[arg(long)]
        reg: Option<u16>,
        /// Origin tag stored as `source=`
        #[arg(long)]
        source: Option<String>,
    },
    /// Show recent commands
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show the cached output state of a device coil
    Status {
        #[arg(long)]
        device: i64,
        #[arg(long)]
        coil: u16,
    },
    /// Read a device's status register and print the decoded output bit
    Readback {
        #[arg(long)]
        device: i64,
        /// Status register override
        #[arg(long)]
        register: Option<u16>,
    },
    /// Register or update a breaker device
    Device {
        #[arg(long)]
        device: i64,
        /// Required the first time a device is registered
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        unit: Option<u8>,
        #[arg(long)]
        account: Option<i64>,
        #[arg(long)]
        coil: Option<u16>,
        /// Allow breaker control (true/false)
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long)]
        write_register: Option<u16>,
        #[arg(long)]
        read_register: Option<u16>,
        #[arg(long)]
        bitmask: Option<u16>,
        #[arg(long)]
        status_input: Option<u16>,
        /// Mark the device active/inactive (true/false)
        #[arg(long)]
        active: Option<bool>,
    },
    /// Set an account's energy allocation and usage
    Account {
        #[arg(long)]
        account: i64,
        #[arg(long)]
        allocated_kwh: f64,
        #[arg(long)]
        used_kwh: f64,
        #[arg(long)]
        inactive: bool,
    },
    /// Decode a float from holding registers using the ordering fallback
    ReadFloat {
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = 502)]
        port: u16,
        #[arg(long, default_value_t = DEFAULT_UNIT_ID)]
        unit: u8,
        #[arg(long)]
        address: u16,
        /// Read four registers as a double
        #[arg(long = "f64")]
        double: bool,
        /// Ordering priority, e.g. `--ordering ABCD --ordering CDAB`
        #[arg(long = "ordering")]
        orderings: Vec<String>,
    },
    /// Create the database schema and exit
    InitDb,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = DoSrvConfig::load(cli.service.config.as_deref())
        .context("Failed to load configuration")?;
    config.database.path = cli.service.get_db_path(&config.database.path);
    if cli.dry_run {
        config.worker.dry_run = true;
    }
    if cli.service.log_level.is_some() {
        config.logging.level = cli.service.parse_log_level().as_str().to_ascii_lowercase();
    }
    if cli.service.no_color {
        config.logging.ansi = false;
    }

    let _log_guard = init_logging(&config.service.name, &config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    info!("dosrv {} starting", env!("CARGO_PKG_VERSION"));
    let store = Arc::new(
        SqliteStore::connect(&config.database.path, config.database.max_connections)
            .await
            .with_context(|| format!("Failed to open database {}", config.database.path))?,
    );

    if cli.service.validate {
        info!("Configuration valid, database ready: {}", config.database.path);
        return Ok(());
    }

    match cli.command.unwrap_or(Cmd::Run) {
        Cmd::Run => run_worker(&config, store).await,
        Cmd::Once { batch } => run_once(&config, store, batch).await,
        Cmd::Enqueue {
            device,
            coil,
            action,
            requested_by,
            max_retries,
            notes,
            reg,
            source,
        } => {
            let action = CommandAction::parse(&action);
            if let CommandAction::Unrecognized(text) = &action {
                bail!("Unknown action '{text}', expected ON, OFF or TOGGLE");
            }
            let mut parsed = Notes::parse(notes.as_deref().unwrap_or_default());
            if let Some(reg) = reg {
                parsed = parsed.with("reg", reg.to_string());
            }
            if let Some(source) = source {
                parsed = parsed.with("source", source);
            }

            let mut command = NewCommand::new(device, coil, action).max_retries(max_retries);
            if let Some(user) = requested_by {
                command = command.requested_by(user);
            }
            if !parsed.is_empty() {
                command = command.notes(parsed.to_string());
            }
            let id = store.enqueue(command, SystemClock.now()).await?;
            println!("{id}");
            Ok(())
        },
        Cmd::List { limit } => {
            for command in store.list_recent(limit).await? {
                println!(
                    "{:>6}  device={} coil={} {:<6} {:<7} retries={} requested={} {}",
                    command.id,
                    command.device_id,
                    command.coil_address,
                    command.action,
                    command.result,
                    command.retry_count,
                    command.requested_at.format("%Y-%m-%d %H:%M:%S"),
                    command.error_message.unwrap_or_default()
                );
            }
            Ok(())
        },
        Cmd::Status { device, coil } => {
            match store.get_status(device, coil).await? {
                Some(status) => println!(
                    "device={} coil={} state={} updated={} source={}",
                    status.device_id,
                    status.coil_address,
                    match status.state {
                        Some(true) => "ON",
                        Some(false) => "OFF",
                        None => "UNKNOWN",
                    },
                    status.last_updated.to_rfc3339(),
                    status.update_source
                ),
                None => println!("device={device} coil={coil} state=UNKNOWN (no cache entry)"),
            }
            Ok(())
        },
        Cmd::Readback { device, register } => readback(&config, store, device, register).await,
        Cmd::Device {
            device,
            host,
            port,
            unit,
            account,
            coil,
            enabled,
            write_register,
            read_register,
            bitmask,
            status_input,
            active,
        } => {
            let update = DeviceUpdate {
                host,
                port,
                unit_id: unit,
                account_id: account,
                write_register,
                read_register,
                status_bitmask: bitmask,
                status_input,
                breaker_coil: coil,
                breaker_enabled: enabled,
                is_active: active,
            };
            let target = update.apply(device, store.resolve(device).await?)?;
            store.upsert_device(&target).await?;
            info!(
                "Device {} registered at {} coil={:?} breaker_enabled={}",
                target.device_id,
                target.host,
                target.breaker_coil,
                target.breaker_enabled
            );
            println!("{}", serde_json::to_string(&target)?);
            Ok(())
        },
        Cmd::Account {
            account,
            allocated_kwh,
            used_kwh,
            inactive,
        } => {
            let balance = AccountBalance {
                account_id: account,
                allocated_kwh,
                used_kwh,
                is_active: !inactive,
            };
            store.upsert_account(&balance).await?;
            println!(
                "account={} allocated={} used={} usage={:.1}% active={}",
                balance.account_id,
                balance.allocated_kwh,
                balance.used_kwh,
                balance.usage_ratio() * 100.0,
                balance.is_active
            );
            Ok(())
        },
        Cmd::ReadFloat {
            host,
            port,
            unit,
            address,
            double,
            orderings,
        } => read_float(&config, &host, port, unit, address, double, &orderings).await,
        Cmd::InitDb => {
            info!("Schema ready at {}", config.database.path);
            Ok(())
        },
    }
}

fn build_dispatcher(config: &DoSrvConfig, store: Arc<SqliteStore>) -> Dispatcher {
    let stores = StoreHandles::from_store(store);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let connector = Arc::new(ModbusTcpConnector::new(config.request_timeout()));
    let engine = Arc::new(ExecutionEngine::new(
        stores.clone(),
        connector,
        clock.clone(),
        ExecutionSettings::from_config(config),
    ));
    let enforcement = EnforcementLoop::new(
        stores.clone(),
        clock.clone(),
        EnforcementSettings::from_config(config),
    );
    Dispatcher::new(stores, engine, clock, DispatcherSettings::from_config(config))
        .with_enforcement(enforcement)
}

async fn run_worker(config: &DoSrvConfig, store: Arc<SqliteStore>) -> anyhow::Result<()> {
    let dispatcher = build_dispatcher(config, store);
    if config.worker.dry_run {
        warn!("Dry-run mode: no commands will be executed or enqueued");
    }
    let token = shutdown_token();
    dispatcher.run(token).await;
    Ok(())
}

async fn run_once(
    config: &DoSrvConfig,
    store: Arc<SqliteStore>,
    batch: Option<usize>,
) -> anyhow::Result<()> {
    let dispatcher = build_dispatcher(config, store);
    let (enforcement, summary) = match batch {
        Some(limit) => (None, dispatcher.process_pending_commands(limit).await?),
        None => dispatcher.run_cycle().await?,
    };
    if let Some(enforcement) = enforcement {
        println!(
            "enforcement: accounts={} off={} on={} suppressed={} planned={}",
            enforcement.accounts_checked,
            enforcement.enqueued_off,
            enforcement.enqueued_on,
            enforcement.suppressed,
            enforcement.planned
        );
    }
    println!(
        "batch: fetched={} succeeded={} skipped={} failed={} aborted={} listed={}",
        summary.fetched,
        summary.succeeded,
        summary.skipped,
        summary.failed,
        summary.aborted,
        summary.listed
    );
    Ok(())
}

async fn readback(
    config: &DoSrvConfig,
    store: Arc<SqliteStore>,
    device_id: i64,
    register: Option<u16>,
) -> anyhow::Result<()> {
    let Some(target) = store.resolve(device_id).await? else {
        bail!("Device {device_id} not found");
    };
    if !target.has_host() {
        bail!("Device {device_id} has no address");
    }
    let settings = ExecutionSettings::from_config(config);
    let register = register
        .or(target.read_register)
        .unwrap_or(settings.read_register);
    let bitmask = target.status_bitmask.unwrap_or(settings.status_bitmask);

    let connector = ModbusTcpConnector::new(config.request_timeout());
    let mut link = connector
        .open(&Endpoint::for_target(&target, settings.default_port))
        .await?;
    let result = link.read_holding_register(register).await;
    link.close().await;

    let raw = result?;
    println!(
        "device={} register={} raw=0x{:04X} mask=0x{:04X} state={}",
        device_id,
        register,
        raw,
        bitmask,
        if decode_do_status(raw, bitmask) { "ON" } else { "OFF" }
    );
    Ok(())
}

async fn read_float(
    config: &DoSrvConfig,
    host: &str,
    port: u16,
    unit: u8,
    address: u16,
    double: bool,
    orderings: &[String],
) -> anyhow::Result<()> {
    let orderings: Vec<WordOrdering> = if orderings.is_empty() {
        config.decode_orderings()?
    } else {
        orderings
            .iter()
            .map(|s| s.parse::<WordOrdering>())
            .collect::<Result<_, _>>()
            .map_err(|e| anyhow::anyhow!("{e}"))?
    };

    let connector = ModbusTcpConnector::new(config.request_timeout());
    let mut link = connector
        .open(&Endpoint {
            host: host.to_string(),
            port,
            unit_id: unit,
        })
        .await?;
    let value = if double {
        link.read_float64(address, &orderings)
            .await
            .map(|v| v.map(|f| f.to_string()))
    } else {
        link.read_float32(address, &orderings)
            .await
            .map(|v| v.map(|f| f.to_string()))
    };
    link.close().await;

    let text = value?.unwrap_or_else(|| "no plausible value".to_string());
    println!(
        "{} unit {} @ {} = {}",
        link.peer(),
        link.unit_id(),
        address,
        text
    );
    Ok(())
}
