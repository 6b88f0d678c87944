//! Command-line interface for relayd.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use relayd_commands::{CommandDispatcher, CommandService};
use relayd_core::config::env_vars;
use relayd_core::{CommandAction, RealtimeEvent, RelaydConfig};
use relayd_mqtt::{Connector, OneShotClient, ProxyConfig, RealtimeProxy, WsConnector};
use relayd_scheduler::{
    create_schedule, parse_timezone, preview_next_runs, set_schedule_enabled, ScheduleDraft,
    ScheduleRunner, SchedulerService,
};
use relayd_storage::{
    AuditLog, DeviceDirectory, DeviceRecord, RedbStore, RelaydStore, RunLedger, ScheduleRecord,
    ScheduleStore,
};

/// relayd - MQTT relay control and scheduling.
#[derive(Parser, Debug)]
#[command(name = "relayd")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Configuration file (TOML).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the realtime proxy and the scheduler until Ctrl-C.
    Serve,
    /// Switch a device on or off.
    Publish {
        device: String,
        /// ON or OFF.
        action: CommandAction,
        /// Relay channel, e.g. POWER2. Defaults to the registered channel.
        #[arg(long)]
        channel: Option<String>,
    },
    /// Print realtime events as JSON lines.
    Watch {
        /// Devices to watch; all devices when omitted.
        devices: Vec<String>,
    },
    /// Listen for device traffic and list what was seen.
    Discover {
        #[arg(long, default_value_t = 3000)]
        wait_ms: u64,
    },
    /// Read retained online/offline state.
    Lwt {
        #[arg(required = true)]
        devices: Vec<String>,
        #[arg(long, default_value_t = 600)]
        wait_ms: u64,
    },
    /// Device directory.
    Device {
        #[command(subcommand)]
        cmd: DeviceCommand,
    },
    /// Scheduled commands.
    Schedule {
        #[command(subcommand)]
        cmd: ScheduleCommand,
    },
    /// Recent command audit entries.
    History {
        #[arg(long)]
        device: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show upcoming occurrences of a cron expression.
    NextRuns {
        cron: String,
        #[arg(long, default_value = "UTC")]
        tz: String,
        #[arg(long, default_value_t = 5)]
        count: usize,
        /// Start instant (RFC 3339); now when omitted.
        #[arg(long)]
        from: Option<DateTime<Utc>>,
    },
}

#[derive(Subcommand, Debug)]
enum DeviceCommand {
    /// Register or update a device.
    Add {
        device_id: String,
        #[arg(long, default_value = "POWER")]
        channel: String,
        #[arg(long)]
        name: Option<String>,
    },
    List,
}

#[derive(Subcommand, Debug)]
enum ScheduleCommand {
    /// Create a schedule.
    Add {
        device: String,
        action: CommandAction,
        /// Cron expression, 5 to 7 fields.
        cron: String,
        #[arg(long, default_value = "UTC")]
        tz: String,
        #[arg(long)]
        start_at: Option<DateTime<Utc>>,
        #[arg(long)]
        end_at: Option<DateTime<Utc>>,
        /// Enforcement window in local time, e.g. 18:00-23:00.
        #[arg(long, requires = "every")]
        window: Option<String>,
        /// Re-send interval in minutes inside the window.
        #[arg(long, requires = "window")]
        every: Option<u16>,
        /// Create the schedule disabled.
        #[arg(long)]
        disabled: bool,
    },
    List,
    Enable {
        id: u64,
    },
    Disable {
        id: u64,
    },
    /// Recent runs of a schedule.
    Runs {
        id: u64,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = RelaydConfig::load(args.config.as_deref())?;

    match args.command {
        Command::Serve => run_server(config).await,
        Command::Publish {
            device,
            action,
            channel,
        } => publish(&config, &device, action, channel.as_deref()).await,
        Command::Watch { devices } => watch(&config, devices).await,
        Command::Discover { wait_ms } => discover(&config, wait_ms).await,
        Command::Lwt { devices, wait_ms } => lwt(&config, &devices, wait_ms).await,
        Command::Device { cmd } => run_device_cmd(&config, cmd).await,
        Command::Schedule { cmd } => run_schedule_cmd(&config, cmd).await,
        Command::History { device, limit } => history(&config, device.as_deref(), limit).await,
        Command::NextRuns {
            cron,
            tz,
            count,
            from,
        } => next_runs(&cron, &tz, count, from.unwrap_or_else(Utc::now)),
    }
}

fn init_logging(verbose: bool) {
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_directive = if verbose { "relayd=debug" } else { "relayd=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

    // Logs go to stderr; stdout carries command output.
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

fn open_store(config: &RelaydConfig) -> Result<Arc<RedbStore>> {
    let path = config.storage.database_path();
    let store = RedbStore::open(&path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    Ok(Arc::new(store))
}

fn connector(config: &RelaydConfig) -> Arc<dyn Connector> {
    Arc::new(WsConnector::new(config.broker.url.clone()))
}

fn one_shot(config: &RelaydConfig) -> OneShotClient {
    OneShotClient::from_broker_config(connector(config), &config.broker)
}

/// Shared proxy and scheduler until Ctrl-C.
async fn run_server(config: RelaydConfig) -> Result<()> {
    let store: Arc<dyn RelaydStore> = open_store(&config)?;
    let proxy = RealtimeProxy::start(connector(&config), ProxyConfig::from(&config.broker));
    let dispatcher = CommandDispatcher::new()
        .with_shared(Arc::new(proxy.clone()))
        .with_fallback(Arc::new(one_shot(&config)));

    let subscription = proxy.subscribe(
        Vec::<String>::new(),
        Arc::new(|event: &RealtimeEvent| {
            debug!(device_id = %event.device_id(), ts = %event.ts, "Realtime event");
        }),
        false,
    )?;

    let scheduler = if config.scheduler.enabled {
        let runner =
            ScheduleRunner::new(store, dispatcher).with_config(config.scheduler.clone().into());
        Some(SchedulerService::start(
            Arc::new(runner),
            Duration::from_millis(config.scheduler.tick_interval_ms),
        ))
    } else {
        info!("Scheduler disabled");
        None
    };

    info!(broker = %config.broker.url, "relayd running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    if let Some(scheduler) = scheduler {
        scheduler.stop().await;
    }
    subscription.unsubscribe();
    proxy.stop().await;
    Ok(())
}

async fn publish(
    config: &RelaydConfig,
    device: &str,
    action: CommandAction,
    channel: Option<&str>,
) -> Result<()> {
    let store = open_store(config)?;
    let dispatcher = CommandDispatcher::new().with_fallback(Arc::new(one_shot(config)));
    let service = CommandService::new(dispatcher, store);
    let envelope = service.send_on_channel(device, action, None, channel).await?;
    println!(
        "{} {} -> {} (request {})",
        envelope.device_id(),
        envelope.command_channel().unwrap_or("POWER"),
        envelope.action(),
        envelope.request_id()
    );
    Ok(())
}

async fn watch(config: &RelaydConfig, devices: Vec<String>) -> Result<()> {
    let proxy = RealtimeProxy::start(connector(config), ProxyConfig::from(&config.broker));
    let subscription = proxy.subscribe(
        devices,
        Arc::new(|event: &RealtimeEvent| match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(error = %e, "Cannot encode event"),
        }),
        true,
    )?;

    tokio::signal::ctrl_c().await?;
    subscription.unsubscribe();
    proxy.stop().await;
    Ok(())
}

async fn discover(config: &RelaydConfig, wait_ms: u64) -> Result<()> {
    let devices = one_shot(config)
        .scan_devices(Duration::from_millis(wait_ms))
        .await?;
    if devices.is_empty() {
        println!("No devices seen within {}ms", wait_ms);
        return Ok(());
    }
    println!("{}", serde_json::to_string_pretty(&devices)?);
    Ok(())
}

async fn lwt(config: &RelaydConfig, devices: &[String], wait_ms: u64) -> Result<()> {
    let snapshot = one_shot(config)
        .read_lwt_snapshot(devices, Duration::from_millis(wait_ms))
        .await?;
    for device in devices {
        let state = snapshot
            .get(device.trim())
            .map(|presence| presence.as_str())
            .unwrap_or("UNKNOWN");
        println!("{:<24} {}", device.trim(), state);
    }
    Ok(())
}

async fn run_device_cmd(config: &RelaydConfig, cmd: DeviceCommand) -> Result<()> {
    let store = open_store(config)?;
    match cmd {
        DeviceCommand::Add {
            device_id,
            channel,
            name,
        } => {
            let device_id = device_id.trim();
            if device_id.is_empty() {
                return Err(anyhow!("device id is required"));
            }
            let channel = relayd_mqtt::normalize_command_channel(Some(&channel));
            let mut device = DeviceRecord::new(device_id, channel);
            if let Some(name) = name {
                device = device.with_name(name);
            }
            store.upsert_device(device).await?;
            println!("Saved device {}", device_id);
        }
        DeviceCommand::List => {
            for device in store.list_devices().await? {
                println!(
                    "{:<24} {:<8} {}",
                    device.device_id,
                    device.effective_channel(),
                    device.name.as_deref().unwrap_or("")
                );
            }
        }
    }
    Ok(())
}

async fn run_schedule_cmd(config: &RelaydConfig, cmd: ScheduleCommand) -> Result<()> {
    let store = open_store(config)?;
    let now = Utc::now();
    match cmd {
        ScheduleCommand::Add {
            device,
            action,
            cron,
            tz,
            start_at,
            end_at,
            window,
            every,
            disabled,
        } => {
            let mut draft =
                ScheduleDraft::new(device, action, cron, tz).with_active_range(start_at, end_at);
            if let (Some(window), Some(every)) = (window, every) {
                let (start, end) = parse_window(&window)?;
                draft = draft.with_window(start, end, every);
            }
            draft.enabled = !disabled;
            let record = create_schedule(store.as_ref(), draft, now).await?;
            println!("Created schedule {}", record.id);
            print_schedule(&record);
        }
        ScheduleCommand::List => {
            for record in store.list_schedules().await? {
                print_schedule(&record);
            }
        }
        ScheduleCommand::Enable { id } => {
            let record = set_schedule_enabled(store.as_ref(), id, true, now).await?;
            print_schedule(&record);
        }
        ScheduleCommand::Disable { id } => {
            let record = set_schedule_enabled(store.as_ref(), id, false, now).await?;
            print_schedule(&record);
        }
        ScheduleCommand::Runs { id, limit } => {
            for run in store.list_runs(id, limit).await? {
                println!(
                    "{} {:<7} {} {}",
                    format_instant(run.planned_at),
                    run.status.as_str(),
                    run.request_id.as_deref().unwrap_or("-"),
                    run.error_message.as_deref().unwrap_or("")
                );
            }
        }
    }
    Ok(())
}

async fn history(config: &RelaydConfig, device: Option<&str>, limit: usize) -> Result<()> {
    let store = open_store(config)?;
    for entry in store.recent_commands(device, limit).await? {
        println!(
            "{} {:<24} {:<3} {:<17} {} {}",
            format_instant(entry.updated_at),
            entry.device_id,
            entry.action,
            entry.result.as_str(),
            entry.request_id,
            entry.error_message.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn next_runs(cron: &str, timezone: &str, count: usize, from: DateTime<Utc>) -> Result<()> {
    let tz = parse_timezone(timezone)?;
    for at in preview_next_runs(cron, timezone, from, count)? {
        println!(
            "{}  {}",
            format_instant(at),
            at.with_timezone(&tz).format("%Y-%m-%d %H:%M %Z")
        );
    }
    Ok(())
}

fn print_schedule(record: &ScheduleRecord) {
    let window = match (
        record.window_start_minute,
        record.window_end_minute,
        record.enforce_every_minute,
    ) {
        (Some(start), Some(end), Some(every)) => {
            format!(" window={}-{}/{}m", format_clock(start), format_clock(end), every)
        }
        _ => String::new(),
    };
    println!(
        "#{:<4} {:<24} {:<3} '{}' {} {} next={}{}",
        record.id,
        record.device_id,
        record.action,
        record.cron_expr,
        record.timezone,
        if record.enabled { "enabled" } else { "disabled" },
        format_instant(record.next_run_at),
        window
    );
}

fn format_instant(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn format_clock(minute: u16) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

/// Parse `HH:MM-HH:MM` into minutes of the day.
fn parse_window(window: &str) -> Result<(u16, u16)> {
    let (start, end) = window
        .split_once('-')
        .ok_or_else(|| anyhow!("window must look like HH:MM-HH:MM, got '{}'", window))?;
    Ok((parse_clock(start)?, parse_clock(end)?))
}

fn parse_clock(value: &str) -> Result<u16> {
    let value = value.trim();
    let parsed = value
        .split_once(':')
        .and_then(|(h, m)| Some((h.parse::<u16>().ok()?, m.parse::<u16>().ok()?)));
    match parsed {
        Some((hour, minute)) if hour < 24 && minute < 60 => Ok(hour * 60 + minute),
        _ => Err(anyhow!("invalid time of day '{}'", value)),
    }
}
