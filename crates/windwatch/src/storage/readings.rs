//! The ingestion buffer.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::error::Result;
use crate::model::{Position, Reading};

use super::{from_millis, to_millis};

const READING_COLUMNS: &str = "id, device_id, timestamp, wind_speed, latitude, longitude, processed";

/// Append a reading with `processed = false`.
///
/// Returns `false` when a reading with the same device and timestamp is
/// already buffered.
///
/// # Errors
///
/// Returns an error if the insert fails for any other reason.
pub fn insert_reading(conn: &Connection, reading: &Reading) -> Result<bool> {
    let (latitude, longitude) = reading
        .position
        .map_or((None, None), |p| (Some(p.latitude), Some(p.longitude)));

    let inserted = conn.execute(
        "INSERT INTO readings (device_id, timestamp, wind_speed, latitude, longitude, processed)
         VALUES (?1, ?2, ?3, ?4, ?5, 0)
         ON CONFLICT(device_id, timestamp) DO NOTHING",
        params![
            reading.device_id,
            to_millis(reading.timestamp),
            reading.wind_speed,
            latitude,
            longitude
        ],
    )?;
    Ok(inserted == 1)
}

/// Devices with at least one unprocessed reading.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn devices_with_pending(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT DISTINCT device_id FROM readings WHERE processed = 0 ORDER BY device_id")?;
    let ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(ids)
}

/// Timestamps of a device's unprocessed readings, oldest first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn pending_timestamps(conn: &Connection, device_id: &str) -> Result<Vec<DateTime<Utc>>> {
    let mut stmt = conn.prepare(
        "SELECT timestamp FROM readings WHERE device_id = ?1 AND processed = 0 ORDER BY timestamp",
    )?;
    let stamps = stmt
        .query_map([device_id], |row| row.get::<_, i64>(0))?
        .map(|ms| ms.map(from_millis))
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(stamps)
}

/// Unprocessed readings of a device in `[start, end)`, oldest first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn unprocessed_in_range(
    conn: &Connection,
    device_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<Reading>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {READING_COLUMNS} FROM readings
         WHERE device_id = ?1 AND processed = 0 AND timestamp >= ?2 AND timestamp < ?3
         ORDER BY timestamp"
    ))?;
    let readings = stmt
        .query_map(
            params![device_id, to_millis(start), to_millis(end)],
            row_to_reading,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(readings)
}

/// Mark readings as folded into an aggregate. Returns the number of rows changed.
///
/// # Errors
///
/// Returns an error if an update fails.
pub fn mark_processed(conn: &Connection, ids: &[i64]) -> Result<usize> {
    let mut stmt = conn.prepare("UPDATE readings SET processed = 1 WHERE id = ?1 AND processed = 0")?;
    let mut changed = 0;
    for id in ids {
        changed += stmt.execute([id])?;
    }
    Ok(changed)
}

/// Delete specific readings. Returns the number of rows deleted.
///
/// # Errors
///
/// Returns an error if a delete fails.
pub fn delete_readings(conn: &Connection, ids: &[i64]) -> Result<usize> {
    let mut stmt = conn.prepare("DELETE FROM readings WHERE id = ?1")?;
    let mut deleted = 0;
    for id in ids {
        deleted += stmt.execute([id])?;
    }
    Ok(deleted)
}

/// Delete readings that were folded into an aggregate.
///
/// # Errors
///
/// Returns an error if the delete fails.
pub fn prune_processed(conn: &Connection) -> Result<usize> {
    Ok(conn.execute("DELETE FROM readings WHERE processed = 1", [])?)
}

/// A device's share of a forced prune.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedReadings {
    /// Device whose readings were dropped.
    pub device_id: String,
    /// Number of readings dropped.
    pub count: i64,
    /// Oldest dropped timestamp.
    pub oldest: DateTime<Utc>,
    /// Newest dropped timestamp.
    pub newest: DateTime<Utc>,
}

/// Delete unprocessed readings older than `cutoff`, grouped per device.
///
/// # Errors
///
/// Returns an error if the query or delete fails.
pub fn force_prune_unprocessed(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<DroppedReadings>> {
    let cutoff = to_millis(cutoff);
    let mut stmt = conn.prepare(
        "SELECT device_id, COUNT(*), MIN(timestamp), MAX(timestamp) FROM readings
         WHERE processed = 0 AND timestamp < ?1
         GROUP BY device_id ORDER BY device_id",
    )?;
    let dropped = stmt
        .query_map([cutoff], |row| {
            Ok(DroppedReadings {
                device_id: row.get(0)?,
                count: row.get(1)?,
                oldest: from_millis(row.get(2)?),
                newest: from_millis(row.get(3)?),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if !dropped.is_empty() {
        conn.execute(
            "DELETE FROM readings WHERE processed = 0 AND timestamp < ?1",
            [cutoff],
        )?;
    }
    Ok(dropped)
}

fn row_to_reading(row: &Row<'_>) -> rusqlite::Result<Reading> {
    let latitude: Option<f64> = row.get(4)?;
    let longitude: Option<f64> = row.get(5)?;
    let position = match (latitude, longitude) {
        (Some(lat), Some(lng)) => Position::new(lat, lng),
        _ => None,
    };

    Ok(Reading {
        id: Some(row.get(0)?),
        device_id: row.get(1)?,
        timestamp: from_millis(row.get(2)?),
        wind_speed: row.get(3)?,
        position,
        processed: row.get(6)?,
    })
}
