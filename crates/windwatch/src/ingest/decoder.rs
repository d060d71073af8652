//! Packet decoding.
//!
//! A packet is one JSON object:
//!
//! ```json
//! {"deviceId": "ane-1", "timestamp": "2024-03-01T12:00:00Z", "windSpeed": 12.3, "position": "51.5,-0.12"}
//! ```
//!
//! Decoding is pure apart from the device lookup, which goes through
//! [`DeviceDirectory`].

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{Device, Position, Reading};

use super::IngestError;

/// Highest wind speed accepted, in m/s.
pub const MAX_WIND_SPEED: f64 = 150.0;

/// Resolves device ids for the decoder.
pub trait DeviceDirectory {
    /// Look up a device by id, active or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup itself fails.
    fn lookup(&self, device_id: &str) -> Result<Option<Device>>;
}

/// A raw telemetry packet as sent by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Packet {
    /// Reporting device.
    pub device_id: String,
    /// ISO-8601 measurement time.
    pub timestamp: String,
    /// Wind speed in m/s.
    pub wind_speed: f64,
    /// Optional `"lat,lng"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
}

impl Packet {
    /// Parse one JSON packet.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::MalformedPacket`] if the JSON does not match.
    pub fn parse(raw: &str) -> std::result::Result<Self, IngestError> {
        serde_json::from_str(raw.trim()).map_err(|e| IngestError::malformed(e.to_string()))
    }
}

/// Validate a packet into a reading.
///
/// Checks, in order: the device is known and active, the timestamp parses,
/// the wind speed is finite and within `[0, MAX_WIND_SPEED]`, the position
/// (if any) parses.
///
/// # Errors
///
/// Returns an [`IngestError`] (wrapped in [`crate::Error::Ingest`]) for a
/// rejected packet, or the directory's error if the lookup fails.
pub fn decode(packet: &Packet, directory: &impl DeviceDirectory) -> Result<Reading> {
    let active = directory
        .lookup(&packet.device_id)?
        .is_some_and(|device| device.active);
    if !active {
        return Err(IngestError::UnknownDevice {
            device_id: packet.device_id.clone(),
        }
        .into());
    }

    let timestamp = parse_timestamp(&packet.timestamp)?;

    let wind_speed = packet.wind_speed;
    if !wind_speed.is_finite() || !(0.0..=MAX_WIND_SPEED).contains(&wind_speed) {
        return Err(IngestError::OutOfRange {
            device_id: packet.device_id.clone(),
            wind_speed,
        }
        .into());
    }

    let position = packet
        .position
        .as_deref()
        .map(str::parse::<Position>)
        .transpose()
        .map_err(IngestError::malformed)?;

    Ok(Reading {
        id: None,
        device_id: packet.device_id.clone(),
        timestamp,
        wind_speed,
        position,
        processed: false,
    })
}

/// Parse an ISO-8601 timestamp. Values without an offset are taken as UTC.
///
/// # Errors
///
/// Returns [`IngestError::MalformedPacket`] if the value does not parse.
pub fn parse_timestamp(value: &str) -> std::result::Result<DateTime<Utc>, IngestError> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| IngestError::malformed(format!("bad timestamp '{value}'")))
}
