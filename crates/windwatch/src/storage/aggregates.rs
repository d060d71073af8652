//! The append-only historical ledger of interval aggregates.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::alert::AlertLevel;
use crate::error::{Error, Result};
use crate::model::{AggregateRecord, IntervalAggregate};

use super::{from_millis, to_millis, Storage};

const AGGREGATE_COLUMNS: &str = "id, device_id, interval_start, interval_end, avg_speed, \
     max_speed, stddev_speed, sample_count, alert_level, downtime_seconds";

/// Write one aggregate. Fails on a second write for the same bucket.
///
/// # Errors
///
/// Returns a constraint error if the bucket already has an aggregate.
pub fn insert_aggregate(conn: &Connection, agg: &IntervalAggregate) -> Result<i64> {
    let (amber_alert, red_alert) = agg.level.flags();
    conn.execute(
        "INSERT INTO interval_aggregates (
            device_id, interval_start, interval_end, avg_speed, max_speed, stddev_speed,
            sample_count, alert_level, amber_alert, red_alert, downtime_seconds
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            agg.device_id,
            to_millis(agg.interval_start),
            to_millis(agg.interval_end),
            agg.avg_speed,
            agg.max_speed,
            agg.stddev_speed,
            agg.sample_count,
            agg.level.as_str(),
            amber_alert,
            red_alert,
            agg.downtime_seconds,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Whether the bucket starting at `interval_start` already has an aggregate.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn aggregate_exists(
    conn: &Connection,
    device_id: &str,
    interval_start: DateTime<Utc>,
) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM interval_aggregates WHERE device_id = ?1 AND interval_start = ?2",
            params![device_id, to_millis(interval_start)],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Aggregates of a device whose bucket starts in `[from, to)`, oldest first.
///
/// # Errors
///
/// Returns an error if the query fails or a row is unreadable.
pub fn aggregates_in_range(
    conn: &Connection,
    device_id: &str,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> Result<Vec<IntervalAggregate>> {
    let from = from.map_or(i64::MIN, to_millis);
    let to = to.map_or(i64::MAX, to_millis);

    let mut stmt = conn.prepare(&format!(
        "SELECT {AGGREGATE_COLUMNS} FROM interval_aggregates
         WHERE device_id = ?1 AND interval_start >= ?2 AND interval_start < ?3
         ORDER BY interval_start"
    ))?;
    let rows = stmt.query_map(params![device_id, from, to], raw_aggregate)?;

    let mut aggregates = Vec::new();
    for row in rows {
        aggregates.push(row?.into_aggregate()?);
    }
    Ok(aggregates)
}

struct RawAggregate {
    agg: IntervalAggregate,
    level: String,
}

impl RawAggregate {
    fn into_aggregate(self) -> Result<IntervalAggregate> {
        let level: AlertLevel = self
            .level
            .parse()
            .map_err(|e: String| Error::corrupt_row("interval_aggregates", e))?;
        Ok(IntervalAggregate { level, ..self.agg })
    }
}

fn raw_aggregate(row: &Row<'_>) -> rusqlite::Result<RawAggregate> {
    Ok(RawAggregate {
        agg: IntervalAggregate {
            id: Some(row.get(0)?),
            device_id: row.get(1)?,
            interval_start: from_millis(row.get(2)?),
            interval_end: from_millis(row.get(3)?),
            avg_speed: row.get(4)?,
            max_speed: row.get(5)?,
            stddev_speed: row.get(6)?,
            sample_count: row.get(7)?,
            level: AlertLevel::Normal,
            downtime_seconds: row.get(9)?,
        },
        level: row.get(8)?,
    })
}

impl Storage {
    /// Aggregates of a device in a time range.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn aggregates(
        &self,
        device_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<IntervalAggregate>> {
        aggregates_in_range(&self.conn, device_id, from, to)
    }

    /// Aggregates in their external shape, with the amber/red flag pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn aggregate_records(
        &self,
        device_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<AggregateRecord>> {
        Ok(self
            .aggregates(device_id, from, to)?
            .iter()
            .map(AggregateRecord::from)
            .collect())
    }
}
