//! Command-line interface for windwatch.
//!
//! This module provides the CLI structure for the `windwatch` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::logging::{LogFormat, Verbosity};

pub use commands::{
    AckCommand, AggregateCommand, AggregatesCommand, ConfigCommand, ContactCommand,
    DeliverCommand, DeviceCommand, IngestCommand, ListCommand, MaintainCommand, OutputFormat,
    RunCommand, StatusCommand,
};

/// windwatch - Wind-speed telemetry aggregation and safety alerting
///
/// Buffers anemometer readings, folds them into fixed intervals, tracks
/// red-level downtime, and notifies contacts when wind crosses a device's
/// amber or red threshold.
#[derive(Debug, Parser)]
#[command(name = "windwatch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Log line format
    #[arg(long, value_enum, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the service in the foreground until interrupted
    Run(RunCommand),

    /// Buffer JSON-lines packets from a file or stdin
    Ingest(IngestCommand),

    /// Run one aggregation pass
    Aggregate(AggregateCommand),

    /// Send pending notifications to the log
    Deliver(DeliverCommand),

    /// Prune the buffer and close stale downtime windows
    Maintain(MaintainCommand),

    /// Redeem an acknowledgement link or token
    Ack(AckCommand),

    /// Manage devices
    #[command(subcommand)]
    Device(DeviceCommand),

    /// Manage contacts
    #[command(subcommand)]
    Contact(ContactCommand),

    /// List a device's interval aggregates
    Aggregates(AggregatesCommand),

    /// List notification events
    Events(ListCommand),

    /// List redeemed tokens
    History(ListCommand),

    /// Show pipeline status
    Status(StatusCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> Verbosity {
        if self.quiet {
            Verbosity::Quiet
        } else {
            match self.verbose {
                0 => Verbosity::Normal,
                1 => Verbosity::Verbose,
                _ => Verbosity::Trace,
            }
        }
    }
}
