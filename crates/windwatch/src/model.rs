//! Core data types for windwatch.
//!
//! These mirror the persisted entities: devices and their thresholds and
//! contacts (written by the admin surface), readings in the ingestion buffer,
//! and the append-only interval aggregates.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::alert::AlertLevel;
use crate::error::{Error, Result};

/// `"lat,lng"` with optional whitespace around either number.
static POSITION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([-+]?\d{1,3}(?:\.\d+)?)\s*,\s*([-+]?\d{1,3}(?:\.\d+)?)\s*$")
        .expect("position pattern is valid")
});

/// A WGS84 position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Latitude in degrees, -90..=90.
    pub latitude: f64,
    /// Longitude in degrees, -180..=180.
    pub longitude: f64,
}

impl Position {
    /// Create a position, rejecting out-of-range coordinates.
    #[must_use]
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        let valid = (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude);
        valid.then_some(Self {
            latitude,
            longitude,
        })
    }
}

impl FromStr for Position {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let caps = POSITION_PATTERN
            .captures(s)
            .ok_or_else(|| format!("position '{s}' is not \"lat,lng\""))?;
        let lat: f64 = caps[1]
            .parse()
            .map_err(|_| format!("bad latitude in '{s}'"))?;
        let lng: f64 = caps[2]
            .parse()
            .map_err(|_| format!("bad longitude in '{s}'"))?;
        Self::new(lat, lng).ok_or_else(|| format!("position '{s}' is out of range"))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.latitude, self.longitude)
    }
}

/// A registered anemometer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Device identifier as sent in packets.
    pub id: String,
    /// Human-readable name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Free-form provisioning metadata.
    pub metadata: serde_json::Value,
    /// Last position reported by the device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// Inactive devices are rejected at ingest.
    pub active: bool,
}

impl Device {
    /// Create an active device with no metadata.
    #[must_use]
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
            position: None,
            active: true,
        }
    }

    /// Name for display, falling back to the id.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Per-device alert thresholds in m/s.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Amber threshold.
    pub amber: f64,
    /// Red threshold; strictly above amber.
    pub red: f64,
}

impl Thresholds {
    /// Create thresholds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidThresholds`] unless `0 < amber < red` and both are finite.
    pub fn new(amber: f64, red: f64) -> Result<Self> {
        if amber.is_finite() && red.is_finite() && amber > 0.0 && amber < red {
            Ok(Self { amber, red })
        } else {
            Err(Error::InvalidThresholds { amber, red })
        }
    }
}

/// Someone to notify about a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Identifier assigned by storage.
    pub id: i64,
    /// Device this contact watches.
    pub device_id: String,
    /// Display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Delivery addresses (email, phone, ...), opaque to this crate.
    pub addresses: Vec<String>,
}

/// A validated wind-speed reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Identifier assigned by storage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Reporting device.
    pub device_id: String,
    /// Measurement time.
    pub timestamp: DateTime<Utc>,
    /// Wind speed in m/s.
    pub wind_speed: f64,
    /// Position reported with the packet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// Set once folded into an aggregate.
    pub processed: bool,
}

/// Statistics for one closed bucket of one device. Immutable once written.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalAggregate {
    /// Identifier assigned by storage.
    pub id: Option<i64>,
    /// Device the bucket belongs to.
    pub device_id: String,
    /// Inclusive bucket start.
    pub interval_start: DateTime<Utc>,
    /// Exclusive bucket end.
    pub interval_end: DateTime<Utc>,
    /// Mean wind speed.
    pub avg_speed: f64,
    /// Maximum wind speed.
    pub max_speed: f64,
    /// Population standard deviation.
    pub stddev_speed: f64,
    /// Number of readings folded.
    pub sample_count: u32,
    /// Level from the alert evaluator.
    pub level: AlertLevel,
    /// Seconds credited at or above the red threshold.
    pub downtime_seconds: i64,
}

/// The shape aggregates take at the external boundary.
///
/// Carries the legacy amber/red flag pair instead of the level enum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    /// Device the bucket belongs to.
    pub device_id: String,
    /// Inclusive bucket start.
    pub interval_start: DateTime<Utc>,
    /// Exclusive bucket end.
    pub interval_end: DateTime<Utc>,
    /// Mean wind speed.
    pub avg_wind_speed: f64,
    /// Maximum wind speed.
    pub max_wind_speed: f64,
    /// Population standard deviation.
    pub stddev_wind_speed: f64,
    /// Number of readings folded.
    pub sample_count: u32,
    /// At or above amber.
    pub amber_alert: bool,
    /// At or above red.
    pub red_alert: bool,
    /// Seconds at or above red.
    pub downtime_seconds: i64,
}

impl From<&IntervalAggregate> for AggregateRecord {
    fn from(agg: &IntervalAggregate) -> Self {
        let (amber_alert, red_alert) = agg.level.flags();
        Self {
            device_id: agg.device_id.clone(),
            interval_start: agg.interval_start,
            interval_end: agg.interval_end,
            avg_wind_speed: agg.avg_speed,
            max_wind_speed: agg.max_speed,
            stddev_wind_speed: agg.stddev_speed,
            sample_count: agg.sample_count,
            amber_alert,
            red_alert,
            downtime_seconds: agg.downtime_seconds,
        }
    }
}
