//! Operational ledgers: failed aggregation buckets and forced prunes.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::error::Result;

use super::readings::DroppedReadings;
use super::{from_millis, to_millis, Storage};

/// Retry counter of a bucket whose aggregation transaction failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregationFailure {
    /// Device.
    pub device_id: String,
    /// Bucket start.
    pub interval_start: DateTime<Utc>,
    /// Consecutive failed attempts.
    pub attempts: u32,
    /// Error of the last attempt.
    pub last_error: String,
    /// Whether an operational alert was raised.
    pub escalated: bool,
}

/// A forced prune of unaggregated readings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataLossEvent {
    /// Device whose readings were dropped.
    pub device_id: String,
    /// Number of readings dropped.
    pub readings_dropped: i64,
    /// Oldest dropped timestamp.
    pub oldest_timestamp: DateTime<Utc>,
    /// Newest dropped timestamp.
    pub newest_timestamp: DateTime<Utc>,
}

/// Count one more failure of a bucket and return the updated row.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn record_failure(
    conn: &Connection,
    device_id: &str,
    interval_start: DateTime<Utc>,
    error: &str,
) -> Result<AggregationFailure> {
    let start = to_millis(interval_start);
    conn.execute(
        "INSERT INTO aggregation_failures (device_id, interval_start, attempts, last_error)
         VALUES (?1, ?2, 1, ?3)
         ON CONFLICT(device_id, interval_start) DO UPDATE SET
            attempts = attempts + 1,
            last_error = excluded.last_error,
            updated_at = datetime('now')",
        params![device_id, start, error],
    )?;

    let (attempts, escalated) = conn.query_row(
        "SELECT attempts, escalated FROM aggregation_failures
         WHERE device_id = ?1 AND interval_start = ?2",
        params![device_id, start],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(AggregationFailure {
        device_id: device_id.to_string(),
        interval_start,
        attempts,
        last_error: error.to_string(),
        escalated,
    })
}

/// Flag a failing bucket as escalated.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn mark_escalated(conn: &Connection, device_id: &str, interval_start: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE aggregation_failures SET escalated = 1 WHERE device_id = ?1 AND interval_start = ?2",
        params![device_id, to_millis(interval_start)],
    )?;
    Ok(())
}

/// Forget the failures of a bucket once it aggregated.
///
/// # Errors
///
/// Returns an error if the delete fails.
pub fn clear_failure(conn: &Connection, device_id: &str, interval_start: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "DELETE FROM aggregation_failures WHERE device_id = ?1 AND interval_start = ?2",
        params![device_id, to_millis(interval_start)],
    )?;
    Ok(())
}

/// Record a forced prune.
///
/// # Errors
///
/// Returns an error if the insert fails.
pub fn record_data_loss(conn: &Connection, dropped: &DroppedReadings) -> Result<()> {
    conn.execute(
        "INSERT INTO data_loss_events (device_id, readings_dropped, oldest_timestamp, newest_timestamp)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            dropped.device_id,
            dropped.count,
            to_millis(dropped.oldest),
            to_millis(dropped.newest)
        ],
    )?;
    Ok(())
}

impl Storage {
    /// Buckets currently failing to aggregate.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn aggregation_failures(&self) -> Result<Vec<AggregationFailure>> {
        let mut stmt = self.conn.prepare(
            "SELECT device_id, interval_start, attempts, last_error, escalated
             FROM aggregation_failures ORDER BY device_id, interval_start",
        )?;
        let failures = stmt
            .query_map([], |row| {
                Ok(AggregationFailure {
                    device_id: row.get(0)?,
                    interval_start: from_millis(row.get(1)?),
                    attempts: row.get(2)?,
                    last_error: row.get(3)?,
                    escalated: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(failures)
    }

    /// Recorded forced prunes, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn data_loss_events(&self) -> Result<Vec<DataLossEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT device_id, readings_dropped, oldest_timestamp, newest_timestamp
             FROM data_loss_events ORDER BY id DESC",
        )?;
        let events = stmt
            .query_map([], |row| {
                Ok(DataLossEvent {
                    device_id: row.get(0)?,
                    readings_dropped: row.get(1)?,
                    oldest_timestamp: from_millis(row.get(2)?),
                    newest_timestamp: from_millis(row.get(3)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }
}
