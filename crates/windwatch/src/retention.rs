//! Buffer retention and stale-window sweeps.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::storage::{alert_state, maintenance, readings, Storage};

/// What one maintenance pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Folded readings deleted.
    pub processed_pruned: usize,
    /// Unfolded readings deleted past the retention ceiling.
    pub unprocessed_dropped: i64,
    /// Downtime windows closed as stale.
    pub stale_windows_closed: usize,
}

/// Close downtime windows not credited since `now - stale_window`.
///
/// # Errors
///
/// Returns an error if the database operation fails.
pub fn sweep_stale_windows(
    storage: &Storage,
    stale_window: Duration,
    now: DateTime<Utc>,
) -> Result<usize> {
    let closed = storage.transaction(|conn| alert_state::close_stale_windows(conn, now - stale_window))?;
    for (device_id, window) in &closed {
        warn!(
            device_id,
            started_at = %window.started_at,
            accrued_until = %window.accrued_until,
            "Closed stale downtime window"
        );
    }
    Ok(closed.len())
}

/// Run one maintenance pass.
///
/// Folded readings are deleted. Unfolded readings older than `raw_retention`
/// are deleted too, but each such prune is recorded as a data-loss event and
/// logged at error level.
///
/// # Errors
///
/// Returns an error if the database operation fails.
pub fn run_maintenance(
    storage: &Storage,
    raw_retention: Duration,
    stale_window: Duration,
    now: DateTime<Utc>,
) -> Result<MaintenanceReport> {
    let (processed_pruned, dropped) = storage.transaction(|conn| {
        let pruned = readings::prune_processed(conn)?;
        let dropped = readings::force_prune_unprocessed(conn, now - raw_retention)?;
        for entry in &dropped {
            maintenance::record_data_loss(conn, entry)?;
        }
        Ok((pruned, dropped))
    })?;

    for entry in &dropped {
        error!(
            device_id = %entry.device_id,
            readings = entry.count,
            oldest = %entry.oldest,
            newest = %entry.newest,
            "Dropped unaggregated readings past retention"
        );
    }

    let report = MaintenanceReport {
        processed_pruned,
        unprocessed_dropped: dropped.iter().map(|d| d.count).sum(),
        stale_windows_closed: sweep_stale_windows(storage, stale_window, now)?,
    };
    debug!(?report, "Maintenance pass complete");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Reading;
    use crate::storage::alert_state::DowntimeWindow;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 3, 12, 0, 0).unwrap()
    }

    fn insert(storage: &Storage, age: Duration, processed: bool) {
        let reading = Reading {
            id: None,
            device_id: "ane-1".to_string(),
            timestamp: now() - age,
            wind_speed: 10.0,
            position: None,
            processed: false,
        };
        readings::insert_reading(storage.connection(), &reading).unwrap();
        if processed {
            storage
                .connection()
                .execute(
                    "UPDATE readings SET processed = 1 WHERE timestamp = ?1",
                    [reading.timestamp.timestamp_millis()],
                )
                .unwrap();
        }
    }

    #[test]
    fn test_prunes_processed_and_records_loss() {
        let storage = Storage::open_in_memory().unwrap();
        insert(&storage, Duration::hours(1), true);
        insert(&storage, Duration::hours(1) + Duration::minutes(1), false);
        insert(&storage, Duration::hours(50), false);
        insert(&storage, Duration::hours(49), false);

        let report =
            run_maintenance(&storage, Duration::hours(48), Duration::minutes(30), now()).unwrap();

        assert_eq!(report.processed_pruned, 1);
        assert_eq!(report.unprocessed_dropped, 2);
        assert_eq!(storage.stats().unwrap().pending_readings, 1);

        let losses = storage.data_loss_events().unwrap();
        assert_eq!(losses.len(), 1);
        assert_eq!(losses[0].readings_dropped, 2);
    }

    #[test]
    fn test_nothing_to_do_records_nothing() {
        let storage = Storage::open_in_memory().unwrap();
        insert(&storage, Duration::hours(1), false);

        let report =
            run_maintenance(&storage, Duration::hours(48), Duration::minutes(30), now()).unwrap();
        assert_eq!(report, MaintenanceReport::default());
        assert!(storage.data_loss_events().unwrap().is_empty());
    }

    #[test]
    fn test_sweep_stale_windows() {
        let storage = Storage::open_in_memory().unwrap();
        alert_state::put_window(
            storage.connection(),
            "ane-1",
            Some(DowntimeWindow {
                started_at: now() - Duration::hours(2),
                accrued_until: now() - Duration::hours(1),
            }),
        )
        .unwrap();
        alert_state::put_window(
            storage.connection(),
            "ane-2",
            Some(DowntimeWindow {
                started_at: now() - Duration::minutes(20),
                accrued_until: now() - Duration::minutes(10),
            }),
        )
        .unwrap();

        assert_eq!(
            sweep_stale_windows(&storage, Duration::minutes(30), now()).unwrap(),
            1
        );
        assert!(storage.downtime_window("ane-1").unwrap().is_none());
        assert!(storage.downtime_window("ane-2").unwrap().is_some());
    }
}
