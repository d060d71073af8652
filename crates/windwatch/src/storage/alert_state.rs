//! Durable per-device alert state and open downtime windows.
//!
//! Both survive restarts so the state machine and the downtime tracker pick
//! up where the previous process stopped.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::alert::AlertLevel;
use crate::error::{Error, Result};

use super::{from_millis, to_millis, Storage};

/// The persisted state machine position of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceAlertState {
    /// Device id.
    pub device_id: String,
    /// Level of the last evaluated bucket.
    pub level: AlertLevel,
    /// Start of the ongoing amber-or-worse episode.
    pub amber_since: Option<DateTime<Utc>>,
    /// Start of the ongoing red episode.
    pub red_since: Option<DateTime<Utc>>,
    /// End of the last evaluated bucket.
    pub last_interval_end: DateTime<Utc>,
}

impl DeviceAlertState {
    /// Start of the ongoing episode at `level`, if one is open.
    #[must_use]
    pub fn episode_start(&self, level: AlertLevel) -> Option<DateTime<Utc>> {
        match level {
            AlertLevel::Normal => None,
            AlertLevel::Amber => self.amber_since,
            AlertLevel::Red => self.red_since,
        }
    }
}

/// An open downtime window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DowntimeWindow {
    /// When the device first reached red.
    pub started_at: DateTime<Utc>,
    /// Time up to which downtime has been credited to an aggregate.
    pub accrued_until: DateTime<Utc>,
}

/// Load the alert state of a device. `None` means no bucket was evaluated yet.
///
/// # Errors
///
/// Returns an error if the query fails or the stored level is unreadable.
pub fn get_alert_state(conn: &Connection, device_id: &str) -> Result<Option<DeviceAlertState>> {
    let row: Option<(String, Option<i64>, Option<i64>, i64)> = conn
        .query_row(
            "SELECT level, amber_since, red_since, last_interval_end
             FROM device_alert_state WHERE device_id = ?1",
            [device_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;

    row.map(|(level, amber_since, red_since, last_interval_end)| {
        let level = level
            .parse()
            .map_err(|e: String| Error::corrupt_row("device_alert_state", e))?;
        Ok(DeviceAlertState {
            device_id: device_id.to_string(),
            level,
            amber_since: amber_since.map(from_millis),
            red_since: red_since.map(from_millis),
            last_interval_end: from_millis(last_interval_end),
        })
    })
    .transpose()
}

/// Insert or replace the alert state of a device.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn put_alert_state(conn: &Connection, state: &DeviceAlertState) -> Result<()> {
    conn.execute(
        "INSERT INTO device_alert_state
            (device_id, level, amber_since, red_since, last_interval_end, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'))
         ON CONFLICT(device_id) DO UPDATE SET
            level = excluded.level,
            amber_since = excluded.amber_since,
            red_since = excluded.red_since,
            last_interval_end = excluded.last_interval_end,
            updated_at = excluded.updated_at",
        params![
            state.device_id,
            state.level.as_str(),
            state.amber_since.map(to_millis),
            state.red_since.map(to_millis),
            to_millis(state.last_interval_end),
        ],
    )?;
    Ok(())
}

/// Load the open downtime window of a device.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get_window(conn: &Connection, device_id: &str) -> Result<Option<DowntimeWindow>> {
    let row = conn
        .query_row(
            "SELECT started_at, accrued_until FROM downtime_windows WHERE device_id = ?1",
            [device_id],
            |row| {
                Ok(DowntimeWindow {
                    started_at: from_millis(row.get(0)?),
                    accrued_until: from_millis(row.get(1)?),
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Persist the window of a device: `Some` opens or advances it, `None` closes it.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn put_window(conn: &Connection, device_id: &str, window: Option<DowntimeWindow>) -> Result<()> {
    match window {
        Some(window) => {
            conn.execute(
                "INSERT INTO downtime_windows (device_id, started_at, accrued_until)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(device_id) DO UPDATE SET
                    started_at = excluded.started_at,
                    accrued_until = excluded.accrued_until",
                params![
                    device_id,
                    to_millis(window.started_at),
                    to_millis(window.accrued_until)
                ],
            )?;
        }
        None => {
            conn.execute("DELETE FROM downtime_windows WHERE device_id = ?1", [device_id])?;
        }
    }
    Ok(())
}

/// Close every window whose `accrued_until` is before `cutoff`.
///
/// Returns the closed windows with their device ids.
///
/// # Errors
///
/// Returns an error if the query or delete fails.
pub fn close_stale_windows(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<(String, DowntimeWindow)>> {
    let cutoff = to_millis(cutoff);
    let mut stmt = conn.prepare(
        "SELECT device_id, started_at, accrued_until FROM downtime_windows
         WHERE accrued_until < ?1 ORDER BY device_id",
    )?;
    let stale = stmt
        .query_map([cutoff], |row| {
            Ok((
                row.get::<_, String>(0)?,
                DowntimeWindow {
                    started_at: from_millis(row.get(1)?),
                    accrued_until: from_millis(row.get(2)?),
                },
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if !stale.is_empty() {
        conn.execute("DELETE FROM downtime_windows WHERE accrued_until < ?1", [cutoff])?;
    }
    Ok(stale)
}

impl Storage {
    /// Current alert state of a device.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn alert_state(&self, device_id: &str) -> Result<Option<DeviceAlertState>> {
        get_alert_state(&self.conn, device_id)
    }

    /// Open downtime window of a device.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn downtime_window(&self, device_id: &str) -> Result<Option<DowntimeWindow>> {
        get_window(&self.conn, device_id)
    }
}
