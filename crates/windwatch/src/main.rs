//! `windwatch` - CLI and service binary
//!
//! This binary runs the telemetry service and provides the administrative
//! commands around it: device and contact provisioning, one-shot pipeline
//! passes, acknowledgement redemption and status.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::fs::File;
use std::io::{self, BufReader};
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use tracing::error;

use windwatch::ack::AcknowledgementHandler;
use windwatch::aggregate::Aggregator;
use windwatch::cli::{
    AckCommand, AggregateCommand, AggregatesCommand, Cli, Command, ConfigCommand, ContactCommand,
    DeviceCommand, IngestCommand, ListCommand, OutputFormat, RunCommand,
};
use windwatch::daemon::{Daemon, IngestSource};
use windwatch::ingest::Ingestor;
use windwatch::model::{Device, Position, Thresholds};
use windwatch::notify::delivery::deliver_pending;
use windwatch::notify::LogDelivery;
use windwatch::{init_logging, retention, Config, Storage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbosity(), cli.log_format);

    // `config validate` reports load errors itself
    if let Command::Config(ConfigCommand::Validate { file }) = &cli.command {
        return handle_validate(file.clone().or_else(|| cli.config.clone()));
    }

    let config = Config::load_from(cli.config.clone()).context("failed to load configuration")?;

    match cli.command {
        Command::Run(cmd) => handle_run(config, &cmd).await,
        Command::Ingest(cmd) => handle_ingest(&config, &cmd),
        Command::Aggregate(cmd) => handle_aggregate(&config, &cmd),
        Command::Deliver(cmd) => handle_deliver(&config, cmd.limit).await,
        Command::Maintain(cmd) => handle_maintain(&config, cmd.json),
        Command::Ack(cmd) => handle_ack(&config, cmd),
        Command::Device(cmd) => handle_device(&config, cmd),
        Command::Contact(cmd) => handle_contact(&config, cmd),
        Command::Aggregates(cmd) => handle_aggregates(&config, &cmd),
        Command::Events(cmd) => handle_events(&config, &cmd),
        Command::History(cmd) => handle_history(&config, &cmd),
        Command::Status(cmd) => handle_status(&config, cmd.json),
        Command::Config(cmd) => handle_config(&config, cmd),
    }
}

fn open_storage(config: &Config) -> anyhow::Result<Storage> {
    Storage::open_with_timeout(config.database_path(), config.busy_timeout())
        .context("failed to open database")
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn handle_run(config: Config, cmd: &RunCommand) -> anyhow::Result<()> {
    let source = if cmd.no_ingest {
        IngestSource::Disabled
    } else if let Some(addr) = &cmd.listen {
        IngestSource::Tcp(addr.clone())
    } else {
        IngestSource::from_config(&config)
    };

    let daemon = Daemon::new(config, Arc::new(LogDelivery));
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for interrupt, running until killed");
            std::future::pending::<()>().await;
        }
    };
    daemon.run(source, shutdown).await?;
    Ok(())
}

fn handle_ingest(config: &Config, cmd: &IngestCommand) -> anyhow::Result<()> {
    let storage = open_storage(config)?;
    let ingestor = Ingestor::new(config.bucket_width());

    let counts = match &cmd.file {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            ingestor.ingest_lines(&storage, BufReader::new(file))?
        }
        None => ingestor.ingest_lines(&storage, io::stdin().lock())?,
    };

    if cmd.json {
        return print_json(&counts);
    }
    println!("Accepted:        {}", counts.accepted);
    println!("Rejected:        {}", counts.rejected());
    if counts.rejected() > 0 {
        println!("  unknown device {}", counts.unknown_device);
        println!("  malformed      {}", counts.malformed);
        println!("  out of range   {}", counts.out_of_range);
        println!("  duplicate      {}", counts.duplicate);
        println!("  late           {}", counts.late);
    }
    Ok(())
}

fn handle_aggregate(config: &Config, cmd: &AggregateCommand) -> anyhow::Result<()> {
    let storage = open_storage(config)?;
    let aggregator = Aggregator::from_config(config);
    let now = cmd.now.unwrap_or_else(Utc::now);

    let reports = match &cmd.device {
        Some(device_id) => vec![aggregator.run_pass(&storage, device_id, now)?],
        None => aggregator.run_all(&storage, now)?,
    };

    if cmd.json {
        return print_json(&reports);
    }
    if reports.is_empty() {
        println!("Nothing to aggregate.");
    }
    for report in &reports {
        if report.skipped_no_thresholds {
            println!("{}: skipped, no thresholds", report.device_id);
            continue;
        }
        println!(
            "{}: {} bucket(s), {} reading(s), {} late, {} notification(s)",
            report.device_id,
            report.buckets_written,
            report.readings_folded,
            report.late_discarded,
            report.notifications
        );
        if let Some(failure) = &report.failure {
            println!(
                "  failed at {} (attempt {}): {}",
                failure.interval_start, failure.attempts, failure.last_error
            );
        }
    }
    Ok(())
}

async fn handle_deliver(config: &Config, limit: usize) -> anyhow::Result<()> {
    let storage = open_storage(config)?.into_shared();
    let report = deliver_pending(
        &storage,
        &LogDelivery,
        config.notifications.delivery_max_attempts,
        limit,
    )
    .await?;
    println!(
        "Delivered {}, failed {}, abandoned {}",
        report.delivered, report.failed, report.abandoned
    );
    Ok(())
}

fn handle_maintain(config: &Config, json: bool) -> anyhow::Result<()> {
    let storage = open_storage(config)?;
    let report = retention::run_maintenance(
        &storage,
        config.raw_retention(),
        config.stale_window(),
        Utc::now(),
    )?;

    if json {
        return print_json(&report);
    }
    println!("Pruned processed readings: {}", report.processed_pruned);
    println!("Dropped unaggregated:      {}", report.unprocessed_dropped);
    println!("Stale windows closed:      {}", report.stale_windows_closed);
    Ok(())
}

fn handle_ack(config: &Config, cmd: AckCommand) -> anyhow::Result<()> {
    let storage = open_storage(config)?;
    let handler = AcknowledgementHandler::new();
    let now = Utc::now();

    let redemption = match (cmd.link, cmd.token, cmd.action) {
        (Some(link), _, _) => handler.redeem_link(&storage, &link, now)?,
        (None, Some(token), Some(action)) => handler.redeem(&storage, &token, action, now)?,
        _ => bail!("either a link or --token with --action is required"),
    };

    match redemption.snoozed_until {
        Some(until) => println!(
            "Notifications for {} snoozed until {}",
            redemption.device_id,
            until.to_rfc3339()
        ),
        None => println!("Alert for {} acknowledged", redemption.device_id),
    }
    Ok(())
}

fn handle_device(config: &Config, cmd: DeviceCommand) -> anyhow::Result<()> {
    let storage = open_storage(config)?;
    match cmd {
        DeviceCommand::Add {
            id,
            name,
            latitude,
            longitude,
        } => {
            let mut device = storage
                .device(&id)?
                .unwrap_or_else(|| Device::new(id.clone(), None));
            if name.is_some() {
                device.name = name;
            }
            if let (Some(lat), Some(lng)) = (latitude, longitude) {
                device.position = Some(
                    Position::new(lat, lng)
                        .with_context(|| format!("position {lat},{lng} is out of range"))?,
                );
            }
            device.active = true;
            storage.register_device(&device)?;
            println!("Registered {}", device.id);
        }
        DeviceCommand::List { all, format } => {
            let devices = storage.devices(!all)?;
            if format == OutputFormat::Json {
                return print_json(&devices);
            }
            println!("{:<20} {:<24} {:<8} {:>8} {:>8}", "ID", "NAME", "ACTIVE", "AMBER", "RED");
            for device in &devices {
                let thresholds = storage.thresholds(&device.id)?;
                println!(
                    "{:<20} {:<24} {:<8} {:>8} {:>8}",
                    device.id,
                    device.name.as_deref().unwrap_or("-"),
                    if device.active { "yes" } else { "no" },
                    thresholds.map_or_else(|| "-".to_string(), |t| t.amber.to_string()),
                    thresholds.map_or_else(|| "-".to_string(), |t| t.red.to_string()),
                );
            }
        }
        DeviceCommand::Show { id, format } => {
            let Some(device) = storage.device(&id)? else {
                bail!("device not found: {id}");
            };
            let thresholds = storage.thresholds(&id)?;
            let state = storage.alert_state(&id)?;
            let contacts = storage.contacts(&id)?;

            if format == OutputFormat::Json {
                return print_json(&serde_json::json!({
                    "device": device,
                    "thresholds": thresholds,
                    "alert_state": state,
                    "contacts": contacts,
                }));
            }
            println!("Device:     {} ({})", device.id, device.display_name());
            println!("Active:     {}", device.active);
            if let Some(position) = device.position {
                println!("Position:   {position}");
            }
            match thresholds {
                Some(t) => println!("Thresholds: amber {} m/s, red {} m/s", t.amber, t.red),
                None => println!("Thresholds: not set"),
            }
            if let Some(state) = state {
                println!("Level:      {}", state.level);
                println!("Evaluated:  up to {}", state.last_interval_end.to_rfc3339());
            }
            println!("Contacts:   {}", contacts.len());
        }
        DeviceCommand::Thresholds { id, amber, red } => {
            storage.set_thresholds(&id, Thresholds::new(amber, red)?)?;
            println!("Thresholds for {id}: amber {amber} m/s, red {red} m/s");
        }
        DeviceCommand::Deactivate { id } => {
            storage.deactivate_device(&id)?;
            println!("Deactivated {id}");
        }
    }
    Ok(())
}

fn handle_contact(config: &Config, cmd: ContactCommand) -> anyhow::Result<()> {
    let storage = open_storage(config)?;
    match cmd {
        ContactCommand::Add {
            device,
            addresses,
            name,
        } => {
            let contact = storage.add_contact(&device, name.as_deref(), &addresses)?;
            println!("Added contact {} to {}", contact.id, contact.device_id);
        }
        ContactCommand::List { device, format } => {
            let contacts = storage.contacts(&device)?;
            if format == OutputFormat::Json {
                return print_json(&contacts);
            }
            println!("{:<6} {:<24} ADDRESSES", "ID", "NAME");
            for contact in &contacts {
                println!(
                    "{:<6} {:<24} {}",
                    contact.id,
                    contact.name.as_deref().unwrap_or("-"),
                    contact.addresses.join(", ")
                );
            }
        }
    }
    Ok(())
}

fn handle_aggregates(config: &Config, cmd: &AggregatesCommand) -> anyhow::Result<()> {
    let storage = open_storage(config)?;
    let records = storage.aggregate_records(&cmd.device, cmd.since, cmd.until)?;
    if cmd.format == OutputFormat::Json {
        return print_json(&records);
    }

    println!(
        "{:<26} {:>6} {:>8} {:>8} {:>8} {:<6} {:>8}",
        "START", "N", "AVG", "MAX", "STDDEV", "ALERT", "DOWN(s)"
    );
    for record in &records {
        let alert = match (record.amber_alert, record.red_alert) {
            (_, true) => "red",
            (true, false) => "amber",
            (false, false) => "-",
        };
        println!(
            "{:<26} {:>6} {:>8.2} {:>8.2} {:>8.2} {:<6} {:>8}",
            record.interval_start.to_rfc3339(),
            record.sample_count,
            record.avg_wind_speed,
            record.max_wind_speed,
            record.stddev_wind_speed,
            alert,
            record.downtime_seconds
        );
    }
    Ok(())
}

fn handle_events(config: &Config, cmd: &ListCommand) -> anyhow::Result<()> {
    let storage = open_storage(config)?;
    let events = storage.events(cmd.device.as_deref(), cmd.limit)?;
    if cmd.format == OutputFormat::Json {
        return print_json(&events);
    }

    println!(
        "{:<6} {:<16} {:<8} {:<6} {:<26} {:<10} {:>8}",
        "ID", "DEVICE", "CONTACT", "LEVEL", "CREATED", "STATUS", "ATTEMPTS"
    );
    for event in &events {
        println!(
            "{:<6} {:<16} {:<8} {:<6} {:<26} {:<10} {:>8}",
            event.id,
            event.device_id,
            event.contact_id,
            event.level.to_string(),
            event.created_at.to_rfc3339(),
            event.delivery_status.as_str(),
            event.delivery_attempts
        );
    }
    Ok(())
}

fn handle_history(config: &Config, cmd: &ListCommand) -> anyhow::Result<()> {
    let storage = open_storage(config)?;
    let entries = storage.history(cmd.device.as_deref(), cmd.limit)?;
    if cmd.format == OutputFormat::Json {
        return print_json(&entries);
    }

    println!(
        "{:<26} {:<16} {:<8} {:<14} SNOOZED UNTIL",
        "RECORDED", "DEVICE", "CONTACT", "ACTION"
    );
    for entry in &entries {
        println!(
            "{:<26} {:<16} {:<8} {:<14} {}",
            entry.recorded_at.to_rfc3339(),
            entry.device_id,
            entry.contact_id,
            entry.action.as_str(),
            entry
                .snoozed_until
                .map_or_else(|| "-".to_string(), |t| t.to_rfc3339())
        );
    }
    Ok(())
}

fn handle_status(config: &Config, json: bool) -> anyhow::Result<()> {
    let storage = open_storage(config)?;
    let stats = storage.stats()?;
    let failures = storage.aggregation_failures()?;

    if json {
        return print_json(&serde_json::json!({
            "database_path": config.database_path(),
            "stats": stats,
            "aggregation_failures": failures,
        }));
    }

    println!("windwatch status");
    println!("----------------");
    println!("Database:              {}", config.database_path().display());
    println!("Database size:         {} bytes", stats.db_size_bytes);
    println!("Active devices:        {}", stats.active_devices);
    println!("Buffered readings:     {}", stats.pending_readings);
    println!("Aggregates:            {}", stats.aggregates);
    println!("Open downtime windows: {}", stats.open_downtime_windows);
    println!("Undelivered:           {}", stats.undelivered_notifications);
    println!("Abandoned deliveries:  {}", stats.abandoned_notifications);
    println!("Data loss events:      {}", stats.data_loss_events);
    if !failures.is_empty() {
        println!();
        println!("Aggregation failures:");
        for failure in &failures {
            println!(
                "  {} at {}: {} attempt(s){}, {}",
                failure.device_id,
                failure.interval_start.to_rfc3339(),
                failure.attempts,
                if failure.escalated { " (escalated)" } else { "" },
                failure.last_error
            );
        }
    }
    Ok(())
}

fn handle_validate(file: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = file.unwrap_or_else(Config::default_config_path);
    println!("Validating configuration: {}", path.display());
    match Config::load_from(Some(path)) {
        Ok(_) => {
            println!("Configuration is valid.");
            Ok(())
        }
        Err(e) => bail!("configuration error: {e}"),
    }
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                return print_json(config);
            }
            println!("Current Configuration");
            println!("=====================");
            println!();
            println!("[Storage]");
            println!("  Database path:        {}", config.database_path().display());
            println!("  Busy timeout (ms):    {}", config.storage.busy_timeout_ms);
            println!();
            println!("[Aggregation]");
            println!("  Bucket (minutes):     {}", config.aggregation.bucket_minutes);
            println!("  Tick (seconds):       {}", config.aggregation.tick_seconds);
            println!("  Escalate after:       {}", config.aggregation.escalate_after);
            println!("  Stale window (min):   {}", config.aggregation.stale_window_minutes);
            println!();
            println!("[Retention]");
            println!("  Raw retention (h):    {}", config.retention.raw_retention_hours);
            println!(
                "  Maintenance (min):    {}",
                config.retention.maintenance_interval_minutes
            );
            println!();
            println!("[Notifications]");
            println!("  Ack base URL:         {}", config.notifications.ack_base_url);
            println!("  Token expiry (h):     {}", config.notifications.token_expiry_hours);
            println!(
                "  Token actions:        {}",
                config
                    .notifications
                    .token_actions
                    .iter()
                    .map(|a| a.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            println!(
                "  Delivery attempts:    {}",
                config.notifications.delivery_max_attempts
            );
            println!();
            println!("[Ingest]");
            println!(
                "  Listen address:       {}",
                config.ingest.listen_addr.as_deref().unwrap_or("stdin")
            );
            println!("  Channel capacity:     {}", config.ingest.channel_capacity);
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => return handle_validate(file),
    }
    Ok(())
}
