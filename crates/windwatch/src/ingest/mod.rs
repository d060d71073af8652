//! Ingestion: decode packets and append them to the buffer.
//!
//! Every rejection is counted and dropped; only storage failures surface as
//! errors to the caller.

pub mod decoder;

use std::io::BufRead;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::aggregate::bucket_start;
use crate::error::{Error, Result};
use crate::model::Reading;
use crate::storage::{aggregates, devices, readings, Storage};

pub use decoder::{decode, DeviceDirectory, Packet, MAX_WIND_SPEED};

/// Why a packet was dropped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngestError {
    /// The device is not registered or is inactive.
    #[error("unknown or inactive device: {device_id}")]
    UnknownDevice {
        /// Device id from the packet.
        device_id: String,
    },

    /// The packet could not be parsed.
    #[error("malformed packet: {message}")]
    MalformedPacket {
        /// Description of the problem.
        message: String,
    },

    /// The wind speed is not finite or outside the accepted range.
    #[error("wind speed {wind_speed} m/s out of range for device {device_id}")]
    OutOfRange {
        /// Device id from the packet.
        device_id: String,
        /// Rejected speed.
        wind_speed: f64,
    },

    /// A reading with the same device and timestamp was already buffered.
    #[error("duplicate reading for device {device_id} at {timestamp}")]
    Duplicate {
        /// Device id.
        device_id: String,
        /// Reading timestamp.
        timestamp: DateTime<Utc>,
    },

    /// The reading's bucket was already aggregated.
    #[error("late reading for device {device_id}: bucket {interval_start} is closed")]
    Late {
        /// Device id.
        device_id: String,
        /// Start of the closed bucket.
        interval_start: DateTime<Utc>,
    },
}

impl IngestError {
    /// Create a malformed-packet rejection.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedPacket {
            message: message.into(),
        }
    }
}

/// In-process ingest counters.
#[derive(Debug, Default)]
pub struct IngestStats {
    accepted: AtomicU64,
    unknown_device: AtomicU64,
    malformed: AtomicU64,
    out_of_range: AtomicU64,
    duplicate: AtomicU64,
    late: AtomicU64,
}

impl IngestStats {
    fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rejected(&self, err: &IngestError) {
        let counter = match err {
            IngestError::UnknownDevice { .. } => &self.unknown_device,
            IngestError::MalformedPacket { .. } => &self.malformed,
            IngestError::OutOfRange { .. } => &self.out_of_range,
            IngestError::Duplicate { .. } => &self.duplicate,
            IngestError::Late { .. } => &self.late,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of the counters.
    #[must_use]
    pub fn snapshot(&self) -> IngestCounts {
        IngestCounts {
            accepted: self.accepted.load(Ordering::Relaxed),
            unknown_device: self.unknown_device.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            out_of_range: self.out_of_range.load(Ordering::Relaxed),
            duplicate: self.duplicate.load(Ordering::Relaxed),
            late: self.late.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestCounts {
    /// Readings appended to the buffer.
    pub accepted: u64,
    /// Rejected: unknown or inactive device.
    pub unknown_device: u64,
    /// Rejected: unparseable packet.
    pub malformed: u64,
    /// Rejected: wind speed out of range.
    pub out_of_range: u64,
    /// Rejected: duplicate reading.
    pub duplicate: u64,
    /// Rejected: bucket already aggregated.
    pub late: u64,
}

impl IngestCounts {
    /// Total rejected packets.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.unknown_device + self.malformed + self.out_of_range + self.duplicate + self.late
    }
}

/// Appends decoded readings to the ingestion buffer.
#[derive(Debug)]
pub struct Ingestor {
    bucket_width: chrono::Duration,
    stats: IngestStats,
}

impl Ingestor {
    /// Create an ingestor for the given bucket width.
    #[must_use]
    pub fn new(bucket_width: chrono::Duration) -> Self {
        Self {
            bucket_width,
            stats: IngestStats::default(),
        }
    }

    /// Counters of this ingestor.
    #[must_use]
    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    /// Decode and append one JSON packet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Ingest`] for a dropped packet, or a storage error.
    pub fn ingest_line(&self, storage: &Storage, line: &str) -> Result<Reading> {
        let packet = match Packet::parse(line) {
            Ok(packet) => packet,
            Err(rejection) => return Err(self.rejected(rejection)),
        };
        self.ingest_packet(storage, &packet)
    }

    /// Decode and append one packet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Ingest`] for a dropped packet, or a storage error.
    pub fn ingest_packet(&self, storage: &Storage, packet: &Packet) -> Result<Reading> {
        let reading = match decode(packet, storage) {
            Ok(reading) => reading,
            Err(Error::Ingest(rejection)) => return Err(self.rejected(rejection)),
            Err(e) => return Err(e),
        };

        match storage.transaction(|conn| append(conn, &reading, self.bucket_width)) {
            Ok(()) => {
                self.stats.record_accepted();
                debug!(
                    device_id = %reading.device_id,
                    timestamp = %reading.timestamp,
                    wind_speed = reading.wind_speed,
                    "Accepted reading"
                );
                Ok(reading)
            }
            Err(Error::Ingest(rejection)) => Err(self.rejected(rejection)),
            Err(e) => Err(e),
        }
    }

    /// Ingest newline-delimited packets until EOF. Blank lines are skipped and
    /// rejected packets are counted, so only storage and I/O errors stop the loop.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the input or writing to storage fails.
    pub fn ingest_lines(&self, storage: &Storage, reader: impl BufRead) -> Result<IngestCounts> {
        let before = self.stats.snapshot();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match self.ingest_line(storage, &line) {
                Ok(_) | Err(Error::Ingest(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let after = self.stats.snapshot();
        let batch = IngestCounts {
            accepted: after.accepted - before.accepted,
            unknown_device: after.unknown_device - before.unknown_device,
            malformed: after.malformed - before.malformed,
            out_of_range: after.out_of_range - before.out_of_range,
            duplicate: after.duplicate - before.duplicate,
            late: after.late - before.late,
        };
        info!(
            accepted = batch.accepted,
            rejected = batch.rejected(),
            "Ingest batch complete"
        );
        Ok(batch)
    }

    fn rejected(&self, rejection: IngestError) -> Error {
        self.stats.record_rejected(&rejection);
        match &rejection {
            IngestError::UnknownDevice { .. } | IngestError::Late { .. } => {
                warn!(reason = %rejection, "Dropped packet");
            }
            _ => debug!(reason = %rejection, "Dropped packet"),
        }
        Error::Ingest(rejection)
    }
}

/// Append inside an open transaction: refuse closed buckets and duplicates,
/// refresh the device position.
fn append(
    conn: &rusqlite::Connection,
    reading: &Reading,
    bucket_width: chrono::Duration,
) -> Result<()> {
    let interval_start = bucket_start(reading.timestamp, bucket_width);
    if aggregates::aggregate_exists(conn, &reading.device_id, interval_start)? {
        return Err(IngestError::Late {
            device_id: reading.device_id.clone(),
            interval_start,
        }
        .into());
    }

    if !readings::insert_reading(conn, reading)? {
        return Err(IngestError::Duplicate {
            device_id: reading.device_id.clone(),
            timestamp: reading.timestamp,
        }
        .into());
    }

    if let Some(position) = reading.position {
        devices::update_position(conn, &reading.device_id, position)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertLevel;
    use crate::model::{Device, IntervalAggregate};
    use chrono::Duration;

    fn setup() -> (Storage, Ingestor) {
        let storage = Storage::open_in_memory().unwrap();
        storage.register_device(&Device::new("ane-1", None)).unwrap();
        (storage, Ingestor::new(Duration::minutes(10)))
    }

    fn line(ts: &str, speed: f64) -> String {
        format!(r#"{{"deviceId":"ane-1","timestamp":"{ts}","windSpeed":{speed}}}"#)
    }

    #[test]
    fn test_accepts_and_counts() {
        let (storage, ingestor) = setup();
        ingestor
            .ingest_line(&storage, &line("2024-03-01T12:00:00Z", 10.0))
            .unwrap();

        assert_eq!(ingestor.stats().snapshot().accepted, 1);
        assert_eq!(storage.stats().unwrap().pending_readings, 1);
    }

    #[test]
    fn test_duplicate_rejected() {
        let (storage, ingestor) = setup();
        let packet = line("2024-03-01T12:00:00Z", 10.0);
        ingestor.ingest_line(&storage, &packet).unwrap();

        let err = ingestor.ingest_line(&storage, &packet).unwrap_err();
        assert!(matches!(err, Error::Ingest(IngestError::Duplicate { .. })));
        assert_eq!(ingestor.stats().snapshot().duplicate, 1);
        assert_eq!(storage.stats().unwrap().pending_readings, 1);
    }

    #[test]
    fn test_late_rejected() {
        let (storage, ingestor) = setup();
        let start = bucket_start(
            decoder::parse_timestamp("2024-03-01T12:00:00Z").unwrap(),
            Duration::minutes(10),
        );
        aggregates::insert_aggregate(
            storage.connection(),
            &IntervalAggregate {
                id: None,
                device_id: "ane-1".to_string(),
                interval_start: start,
                interval_end: start + Duration::minutes(10),
                avg_speed: 1.0,
                max_speed: 1.0,
                stddev_speed: 0.0,
                sample_count: 1,
                level: AlertLevel::Normal,
                downtime_seconds: 0,
            },
        )
        .unwrap();

        let err = ingestor
            .ingest_line(&storage, &line("2024-03-01T12:05:00Z", 10.0))
            .unwrap_err();
        assert!(matches!(err, Error::Ingest(IngestError::Late { .. })));
        assert_eq!(ingestor.stats().snapshot().late, 1);
    }

    #[test]
    fn test_position_refreshes_device() {
        let (storage, ingestor) = setup();
        let packet = r#"{"deviceId":"ane-1","timestamp":"2024-03-01T12:00:00Z","windSpeed":3,"position":"1.5,2.5"}"#;
        ingestor.ingest_line(&storage, packet).unwrap();

        let device = storage.device("ane-1").unwrap().unwrap();
        assert_eq!(device.position.unwrap().to_string(), "1.5,2.5");
    }

    #[test]
    fn test_ingest_lines_survives_bad_packets() {
        let (storage, ingestor) = setup();
        let input = [
            line("2024-03-01T12:00:00Z", 10.0),
            String::new(),
            "garbage".to_string(),
            line("2024-03-01T12:01:00Z", 999.0),
            r#"{"deviceId":"ghost","timestamp":"2024-03-01T12:00:00Z","windSpeed":1}"#.to_string(),
            line("2024-03-01T12:00:00Z", 10.0),
            line("2024-03-01T12:02:00Z", 12.0),
        ]
        .join("\n");

        let counts = ingestor
            .ingest_lines(&storage, std::io::Cursor::new(input))
            .unwrap();
        assert_eq!(counts.accepted, 2);
        assert_eq!(counts.malformed, 1);
        assert_eq!(counts.out_of_range, 1);
        assert_eq!(counts.unknown_device, 1);
        assert_eq!(counts.duplicate, 1);
        assert_eq!(counts.rejected(), 4);
    }
}
