//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Subcommand, ValueEnum};

use crate::notify::TokenAction;

/// Run command arguments.
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Accept packets on this TCP address instead of stdin
    #[arg(short, long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// Read no packets; only aggregate, deliver and maintain
    #[arg(long, conflicts_with = "listen")]
    pub no_ingest: bool,
}

/// Ingest command arguments.
#[derive(Debug, Args)]
pub struct IngestCommand {
    /// JSON-lines file to read (stdin when omitted)
    pub file: Option<PathBuf>,

    /// Output counts as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Aggregate command arguments.
#[derive(Debug, Args)]
pub struct AggregateCommand {
    /// Only aggregate this device
    #[arg(short, long)]
    pub device: Option<String>,

    /// Close buckets as of this instant (RFC 3339) instead of now
    #[arg(long, value_parser = parse_instant)]
    pub now: Option<DateTime<Utc>>,

    /// Output reports as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Deliver command arguments.
#[derive(Debug, Args)]
pub struct DeliverCommand {
    /// Maximum number of notifications to send
    #[arg(short, long, default_value = "100")]
    pub limit: usize,
}

/// Maintain command arguments.
#[derive(Debug, Args)]
pub struct MaintainCommand {
    /// Output the report as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Ack command arguments.
#[derive(Debug, Args)]
pub struct AckCommand {
    /// Acknowledgement link as sent in a notification
    #[arg(required_unless_present = "token")]
    pub link: Option<String>,

    /// Raw token id, instead of a link
    #[arg(long, conflicts_with = "link", requires = "action")]
    pub token: Option<String>,

    /// Action to apply with --token (acknowledge, snooze_1h, snooze_today)
    #[arg(long)]
    pub action: Option<TokenAction>,
}

/// Device management commands.
#[derive(Debug, Subcommand)]
pub enum DeviceCommand {
    /// Register a device, or update its name and position
    Add {
        /// Device identifier as sent in packets
        id: String,

        /// Human-readable name
        #[arg(short, long)]
        name: Option<String>,

        /// Latitude in degrees
        #[arg(long, requires = "longitude", allow_hyphen_values = true)]
        latitude: Option<f64>,

        /// Longitude in degrees
        #[arg(long, requires = "latitude", allow_hyphen_values = true)]
        longitude: Option<f64>,
    },

    /// List devices
    List {
        /// Include inactive devices
        #[arg(short, long)]
        all: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Show one device with its thresholds, state and contacts
    Show {
        /// Device identifier
        id: String,

        /// Output format
        #[arg(short, long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Set amber and red thresholds in m/s
    Thresholds {
        /// Device identifier
        id: String,

        /// Amber threshold
        amber: f64,

        /// Red threshold, above amber
        red: f64,
    },

    /// Stop accepting packets from a device
    Deactivate {
        /// Device identifier
        id: String,
    },
}

/// Contact management commands.
#[derive(Debug, Subcommand)]
pub enum ContactCommand {
    /// Add a contact to a device
    Add {
        /// Device identifier
        device: String,

        /// Delivery addresses
        #[arg(required = true)]
        addresses: Vec<String>,

        /// Display name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// List a device's contacts
    List {
        /// Device identifier
        device: String,

        /// Output format
        #[arg(short, long, value_enum, default_value = "table")]
        format: OutputFormat,
    },
}

/// Aggregates command arguments.
#[derive(Debug, Args)]
pub struct AggregatesCommand {
    /// Device identifier
    pub device: String,

    /// First bucket start to include (RFC 3339)
    #[arg(long, value_parser = parse_instant)]
    pub since: Option<DateTime<Utc>>,

    /// Bucket start to stop before (RFC 3339)
    #[arg(long, value_parser = parse_instant)]
    pub until: Option<DateTime<Utc>>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments shared by the events and history listings.
#[derive(Debug, Args)]
pub struct ListCommand {
    /// Only this device
    #[arg(short, long)]
    pub device: Option<String>,

    /// Maximum number of rows
    #[arg(short, long, default_value = "20")]
    pub limit: usize,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,
}

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to config file to validate
        file: Option<PathBuf>,
    },
}

/// Output format for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Aligned columns
    Table,
    /// JSON array
    Json,
}

fn parse_instant(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("expected an RFC 3339 timestamp: {e}"))
}
