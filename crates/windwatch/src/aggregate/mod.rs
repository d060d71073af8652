//! Interval aggregation.
//!
//! A pass for one device closes every bucket that has unprocessed readings
//! and whose end has passed, oldest first. Each bucket is its own IMMEDIATE
//! transaction carrying the aggregate, the processed marks, the alert state,
//! the downtime window and the notification outbox rows, so a failure rolls
//! all of them back and the bucket is retried on the next tick.

pub mod claims;
pub mod stats;

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::alert::{evaluate_with, AlertLevel};
use crate::config::Config;
use crate::downtime;
use crate::error::{Error, Result};
use crate::model::{Device, IntervalAggregate, Thresholds};
use crate::notify::Dispatcher;
use crate::storage::alert_state::{self, DeviceAlertState};
use crate::storage::maintenance::{self as ledger, AggregationFailure};
use crate::storage::{aggregates, devices, readings, Storage};

pub use claims::{DeviceClaim, DeviceClaims};

/// Start of the epoch-aligned bucket containing `ts`.
#[must_use]
pub fn bucket_start(ts: DateTime<Utc>, width: Duration) -> DateTime<Utc> {
    let width_ms = width.num_milliseconds().max(1);
    let start = ts.timestamp_millis().div_euclid(width_ms) * width_ms;
    DateTime::from_timestamp_millis(start).unwrap_or(ts)
}

/// What a pass did for one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Device aggregated.
    pub device_id: String,
    /// Aggregates written.
    pub buckets_written: usize,
    /// Readings folded into those aggregates.
    pub readings_folded: usize,
    /// Readings dropped because their bucket was already written.
    pub late_discarded: usize,
    /// Notification events queued.
    pub notifications: usize,
    /// Unused tokens revoked by ended episodes.
    pub tokens_revoked: usize,
    /// The device has no thresholds; nothing was done.
    pub skipped_no_thresholds: bool,
    /// Bucket that failed, stopping the pass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<AggregationFailure>,
}

/// Result of one bucket transaction.
#[derive(Debug, Clone, Copy, Default)]
struct BucketOutcome {
    written: bool,
    folded: usize,
    late: usize,
    notifications: usize,
    tokens_revoked: usize,
}

/// Folds unprocessed readings into interval aggregates.
#[derive(Debug, Clone)]
pub struct Aggregator {
    bucket_width: Duration,
    stale_window: Duration,
    escalate_after: u32,
    claims: DeviceClaims,
    dispatcher: Dispatcher,
}

impl Aggregator {
    /// Create an aggregator.
    #[must_use]
    pub fn new(
        bucket_width: Duration,
        stale_window: Duration,
        escalate_after: u32,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            bucket_width,
            stale_window,
            escalate_after,
            claims: DeviceClaims::new(),
            dispatcher,
        }
    }

    /// Create an aggregator from the configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.bucket_width(),
            config.stale_window(),
            config.aggregation.escalate_after,
            Dispatcher::from_config(config),
        )
    }

    /// Claims held by this aggregator. Clones share the same set.
    #[must_use]
    pub fn claims(&self) -> &DeviceClaims {
        &self.claims
    }

    /// Bucket width.
    #[must_use]
    pub fn bucket_width(&self) -> Duration {
        self.bucket_width
    }

    /// Run a pass for every device with pending readings.
    ///
    /// Devices claimed by a concurrent pass are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if listing devices fails or a pass hits a storage
    /// error outside a bucket transaction.
    pub fn run_all(&self, storage: &Storage, now: DateTime<Utc>) -> Result<Vec<PassReport>> {
        let mut reports = Vec::new();
        for device_id in readings::devices_with_pending(storage.connection())? {
            match self.run_pass(storage, &device_id, now) {
                Ok(report) => reports.push(report),
                Err(Error::AggregationInProgress { .. }) => {
                    debug!(device_id, "Aggregation already running, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(reports)
    }

    /// Run a pass for one device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AggregationInProgress`] if the device is claimed, or a
    /// storage error from outside a bucket transaction. A failing bucket is
    /// recorded in the report instead.
    pub fn run_pass(&self, storage: &Storage, device_id: &str, now: DateTime<Utc>) -> Result<PassReport> {
        let claim = self
            .claims
            .try_claim(device_id)
            .ok_or_else(|| Error::AggregationInProgress {
                device_id: device_id.to_string(),
            })?;
        self.run_claimed(storage, &claim, now)
    }

    /// Run a pass for a device already claimed through [`Aggregator::claims`].
    ///
    /// # Errors
    ///
    /// Returns a storage error from outside a bucket transaction.
    pub fn run_claimed(
        &self,
        storage: &Storage,
        claim: &DeviceClaim,
        now: DateTime<Utc>,
    ) -> Result<PassReport> {
        let device_id = claim.device_id();
        let mut report = PassReport {
            device_id: device_id.to_string(),
            ..PassReport::default()
        };

        let conn = storage.connection();
        let Some(device) = devices::get_device(conn, device_id)? else {
            warn!(device_id, "Pending readings for unregistered device");
            return Ok(report);
        };
        let Some(thresholds) = devices::get_thresholds(conn, device_id)? else {
            warn!(device_id, "Device has no thresholds, not aggregating");
            report.skipped_no_thresholds = true;
            return Ok(report);
        };

        for start in self.closed_buckets(conn, device_id, now)? {
            let result = storage.transaction(|tx| {
                self.aggregate_bucket(tx, &device, &thresholds, start, now)
            });
            match result {
                Ok(outcome) => {
                    ledger::clear_failure(conn, device_id, start)?;
                    if outcome.written {
                        report.buckets_written += 1;
                    }
                    report.readings_folded += outcome.folded;
                    report.late_discarded += outcome.late;
                    report.notifications += outcome.notifications;
                    report.tokens_revoked += outcome.tokens_revoked;
                }
                Err(e) => {
                    report.failure = Some(self.record_failure(storage, device_id, start, &e)?);
                    // later buckets depend on this one's state transition
                    break;
                }
            }
        }

        if report.buckets_written > 0 {
            info!(
                device_id,
                buckets = report.buckets_written,
                readings = report.readings_folded,
                notifications = report.notifications,
                "Aggregation pass complete"
            );
        }
        Ok(report)
    }

    /// Starts of buckets with pending readings whose end is at or before `now`.
    fn closed_buckets(
        &self,
        conn: &Connection,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let mut starts: Vec<DateTime<Utc>> = readings::pending_timestamps(conn, device_id)?
            .into_iter()
            .map(|ts| bucket_start(ts, self.bucket_width))
            .filter(|start| *start + self.bucket_width <= now)
            .collect();
        starts.dedup();
        Ok(starts)
    }

    fn aggregate_bucket(
        &self,
        conn: &Connection,
        device: &Device,
        thresholds: &Thresholds,
        start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<BucketOutcome> {
        let end = start + self.bucket_width;
        let batch = readings::unprocessed_in_range(conn, &device.id, start, end)?;
        let ids: Vec<i64> = batch.iter().filter_map(|r| r.id).collect();
        if batch.is_empty() {
            return Ok(BucketOutcome::default());
        }

        if aggregates::aggregate_exists(conn, &device.id, start)? {
            // slipped in between the ingest check and the aggregate write
            readings::delete_readings(conn, &ids)?;
            warn!(
                device_id = %device.id,
                interval_start = %start,
                discarded = ids.len(),
                "Discarded readings for an already aggregated bucket"
            );
            return Ok(BucketOutcome {
                late: ids.len(),
                ..BucketOutcome::default()
            });
        }

        let speeds: Vec<f64> = batch.iter().map(|r| r.wind_speed).collect();
        let summary = stats::summarize(&speeds)
            .ok_or_else(|| Error::internal("empty bucket reached summary"))?;
        let level = evaluate_with(summary.mean, summary.max, thresholds);

        let previous = alert_state::get_alert_state(conn, &device.id)?;
        let historical = previous
            .as_ref()
            .is_some_and(|state| start < state.last_interval_end);

        let accrual = if historical {
            downtime::accrue(None, &batch, thresholds.red, end, self.stale_window)
        } else {
            let window = alert_state::get_window(conn, &device.id)?;
            let accrual = downtime::accrue(window, &batch, thresholds.red, end, self.stale_window);
            if accrual.closed_stale {
                warn!(device_id = %device.id, "Closed stale downtime window");
            }
            alert_state::put_window(conn, &device.id, accrual.window)?;
            accrual
        };

        let mut aggregate = IntervalAggregate {
            id: None,
            device_id: device.id.clone(),
            interval_start: start,
            interval_end: end,
            avg_speed: summary.mean,
            max_speed: summary.max,
            stddev_speed: summary.stddev,
            sample_count: summary.count,
            level,
            downtime_seconds: accrual.seconds,
        };
        aggregate.id = Some(aggregates::insert_aggregate(conn, &aggregate)?);
        let folded = readings::mark_processed(conn, &ids)?;

        let mut outcome = BucketOutcome {
            written: true,
            folded,
            ..BucketOutcome::default()
        };

        if historical {
            debug!(
                device_id = %device.id,
                interval_start = %start,
                "Wrote out-of-order bucket without state transition"
            );
            return Ok(outcome);
        }

        if let Some(p) = previous
            .as_ref()
            .filter(|p| p.level.is_elevated() && start - p.last_interval_end > self.stale_window)
        {
            info!(
                device_id = %device.id,
                last_interval_end = %p.last_interval_end,
                interval_start = %start,
                "Data gap ended the open alert episode"
            );
        }
        let current = advance(
            previous.as_ref(),
            &device.id,
            level,
            start,
            end,
            self.stale_window,
        );
        alert_state::put_alert_state(conn, &current)?;
        if previous.as_ref().map(|p| p.level) != Some(level) {
            info!(
                device_id = %device.id,
                from = previous.as_ref().map_or("no_data", |p| p.level.as_str()),
                to = %level,
                "Alert level changed"
            );
        }

        let dispatched = self.dispatcher.on_evaluation(
            conn,
            device,
            previous.as_ref(),
            &current,
            &aggregate,
            now,
        )?;
        outcome.notifications = dispatched.events.len();
        outcome.tokens_revoked = dispatched.tokens_revoked;
        Ok(outcome)
    }

    fn record_failure(
        &self,
        storage: &Storage,
        device_id: &str,
        start: DateTime<Utc>,
        err: &Error,
    ) -> Result<AggregationFailure> {
        let conn = storage.connection();
        let mut failure = ledger::record_failure(conn, device_id, start, &err.to_string())?;

        if failure.attempts >= self.escalate_after && !failure.escalated {
            error!(
                device_id,
                interval_start = %start,
                attempts = failure.attempts,
                error = %err,
                "Aggregation keeps failing for bucket"
            );
            ledger::mark_escalated(conn, device_id, start)?;
            failure.escalated = true;
        } else {
            warn!(
                device_id,
                interval_start = %start,
                attempts = failure.attempts,
                error = %err,
                "Aggregation failed, will retry"
            );
        }
        Ok(failure)
    }
}

/// Next state of the alert state machine after evaluating `[start, end)`.
///
/// Episode starts are kept while the level stays at or above them and
/// cleared when it drops below. A previous state that ended more than
/// `max_gap` before `start` counts as no data, so every episode restarts.
#[must_use]
pub fn advance(
    previous: Option<&DeviceAlertState>,
    device_id: &str,
    level: AlertLevel,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    max_gap: Duration,
) -> DeviceAlertState {
    let previous = previous.filter(|p| start - p.last_interval_end <= max_gap);
    let since = |episode_level: AlertLevel| {
        (level >= episode_level).then(|| {
            previous
                .and_then(|p| p.episode_start(episode_level))
                .unwrap_or(start)
        })
    };

    DeviceAlertState {
        device_id: device_id.to_string(),
        level,
        amber_since: since(AlertLevel::Amber),
        red_since: since(AlertLevel::Red),
        last_interval_end: end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::Ingestor;
    use crate::notify::TokenAction;
    use chrono::TimeZone;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn aggregator() -> Aggregator {
        Aggregator::new(
            Duration::minutes(10),
            Duration::minutes(30),
            3,
            Dispatcher::new(
                "https://wind.example",
                Duration::hours(24),
                vec![TokenAction::Snooze1h, TokenAction::SnoozeToday],
            ),
        )
    }

    fn setup() -> (Storage, Ingestor) {
        let storage = Storage::open_in_memory().unwrap();
        storage.register_device(&Device::new("ane-1", None)).unwrap();
        storage
            .set_thresholds("ane-1", Thresholds::new(20.0, 30.0).unwrap())
            .unwrap();
        storage
            .add_contact("ane-1", None, &["ops@example.com".to_string()])
            .unwrap();
        (storage, Ingestor::new(Duration::minutes(10)))
    }

    fn ingest(storage: &Storage, ingestor: &Ingestor, minute: i64, speed: f64) {
        let ts = (base() + Duration::minutes(minute)).to_rfc3339();
        let line = format!(r#"{{"deviceId":"ane-1","timestamp":"{ts}","windSpeed":{speed}}}"#);
        ingestor.ingest_line(storage, &line).unwrap();
    }

    #[test]
    fn test_bucket_start_alignment() {
        let width = Duration::minutes(10);
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 17, 42).unwrap();
        assert_eq!(
            bucket_start(ts, width),
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 10, 0).unwrap()
        );
        assert_eq!(bucket_start(base(), width), base());

        let before_epoch = Utc.with_ymd_and_hms(1969, 12, 31, 23, 55, 0).unwrap();
        assert_eq!(
            bucket_start(before_epoch, width),
            Utc.with_ymd_and_hms(1969, 12, 31, 23, 50, 0).unwrap()
        );
    }

    #[test]
    fn test_open_bucket_not_closed() {
        let (storage, ingestor) = setup();
        ingest(&storage, &ingestor, 1, 10.0);

        let report = aggregator()
            .run_pass(&storage, "ane-1", base() + Duration::minutes(9))
            .unwrap();
        assert_eq!(report.buckets_written, 0);
        assert_eq!(storage.stats().unwrap().pending_readings, 1);
    }

    #[test]
    fn test_reference_bucket() {
        let (storage, ingestor) = setup();
        for (minute, speed) in [18.0, 19.0, 21.0, 32.0, 33.0, 19.0, 5.0].iter().enumerate() {
            ingest(&storage, &ingestor, i64::try_from(minute).unwrap(), *speed);
        }

        let report = aggregator()
            .run_pass(&storage, "ane-1", base() + Duration::minutes(10))
            .unwrap();
        assert_eq!(report.buckets_written, 1);
        assert_eq!(report.readings_folded, 7);
        assert_eq!(report.notifications, 1);

        let aggs = storage.aggregates("ane-1", None, None).unwrap();
        assert_eq!(aggs.len(), 1);
        assert!((aggs[0].avg_speed - 21.0).abs() < 1e-9);
        assert!((aggs[0].max_speed - 33.0).abs() < f64::EPSILON);
        assert_eq!(aggs[0].level, AlertLevel::Red);
        assert_eq!(aggs[0].downtime_seconds, 120);
        assert_eq!(storage.stats().unwrap().pending_readings, 0);

        let state = storage.alert_state("ane-1").unwrap().unwrap();
        assert_eq!(state.level, AlertLevel::Red);
        assert_eq!(state.red_since, Some(base()));
    }

    #[test]
    fn test_rerun_writes_nothing() {
        let (storage, ingestor) = setup();
        ingest(&storage, &ingestor, 1, 10.0);
        let agg = aggregator();
        let now = base() + Duration::minutes(10);

        agg.run_pass(&storage, "ane-1", now).unwrap();
        let again = agg.run_pass(&storage, "ane-1", now).unwrap();

        assert_eq!(again.buckets_written, 0);
        assert_eq!(storage.aggregates("ane-1", None, None).unwrap().len(), 1);
    }

    #[test]
    fn test_empty_buckets_not_emitted() {
        let (storage, ingestor) = setup();
        ingest(&storage, &ingestor, 1, 10.0);
        ingest(&storage, &ingestor, 31, 12.0);

        let report = aggregator()
            .run_pass(&storage, "ane-1", base() + Duration::minutes(40))
            .unwrap();
        assert_eq!(report.buckets_written, 2);

        let starts: Vec<_> = storage
            .aggregates("ane-1", None, None)
            .unwrap()
            .iter()
            .map(|a| a.interval_start)
            .collect();
        assert_eq!(starts, vec![base(), base() + Duration::minutes(30)]);
    }

    #[test]
    fn test_device_without_thresholds_skipped() {
        let storage = Storage::open_in_memory().unwrap();
        storage.register_device(&Device::new("ane-2", None)).unwrap();
        let ingestor = Ingestor::new(Duration::minutes(10));
        let line = format!(
            r#"{{"deviceId":"ane-2","timestamp":"{}","windSpeed":5}}"#,
            base().to_rfc3339()
        );
        ingestor.ingest_line(&storage, &line).unwrap();

        let report = aggregator()
            .run_pass(&storage, "ane-2", base() + Duration::hours(1))
            .unwrap();
        assert!(report.skipped_no_thresholds);
        assert_eq!(storage.stats().unwrap().pending_readings, 1);
    }

    #[test]
    fn test_claimed_device_is_refused() {
        let (storage, _) = setup();
        let agg = aggregator();
        let _claim = agg.claims().try_claim("ane-1").unwrap();

        let err = agg.run_pass(&storage, "ane-1", base()).unwrap_err();
        assert!(matches!(err, Error::AggregationInProgress { .. }));
    }

    #[test]
    fn test_out_of_order_bucket_does_not_drive_state() {
        let (storage, ingestor) = setup();
        let agg = aggregator();
        ingest(&storage, &ingestor, 21, 5.0);
        agg.run_pass(&storage, "ane-1", base() + Duration::minutes(30))
            .unwrap();

        // an older bucket that never had an aggregate still gets one
        ingest(&storage, &ingestor, 2, 35.0);
        let report = agg
            .run_pass(&storage, "ane-1", base() + Duration::minutes(31))
            .unwrap();
        assert_eq!(report.buckets_written, 1);
        assert_eq!(report.notifications, 0);

        let state = storage.alert_state("ane-1").unwrap().unwrap();
        assert_eq!(state.level, AlertLevel::Normal);
        assert_eq!(state.last_interval_end, base() + Duration::minutes(30));
        assert!(storage.downtime_window("ane-1").unwrap().is_none());
    }

    #[test]
    fn test_failure_is_recorded_and_escalated() {
        let (storage, ingestor) = setup();
        ingest(&storage, &ingestor, 1, 10.0);
        // a trigger makes every aggregate insert fail
        storage
            .connection()
            .execute_batch(
                "CREATE TRIGGER fail_agg BEFORE INSERT ON interval_aggregates
                 BEGIN SELECT RAISE(ABORT, 'disk on fire'); END;",
            )
            .unwrap();

        let agg = aggregator();
        let now = base() + Duration::minutes(10);
        for attempt in 1..=3 {
            let report = agg.run_pass(&storage, "ane-1", now).unwrap();
            let failure = report.failure.unwrap();
            assert_eq!(failure.attempts, attempt);
            assert_eq!(failure.escalated, attempt >= 3);
        }
        // rolled back: nothing processed, nothing written
        assert_eq!(storage.stats().unwrap().pending_readings, 1);
        assert_eq!(storage.stats().unwrap().escalated_failures, 1);

        storage
            .connection()
            .execute_batch("DROP TRIGGER fail_agg;")
            .unwrap();
        let report = agg.run_pass(&storage, "ane-1", now).unwrap();
        assert_eq!(report.buckets_written, 1);
        assert!(storage.aggregation_failures().unwrap().is_empty());
    }

    #[test]
    fn test_advance_episodes() {
        let t0 = base();
        let t1 = base() + Duration::minutes(10);
        let t2 = base() + Duration::minutes(20);
        let gap = Duration::minutes(30);

        let amber = advance(None, "ane-1", AlertLevel::Amber, t0, t1, gap);
        assert_eq!(amber.amber_since, Some(t0));
        assert_eq!(amber.red_since, None);

        let red = advance(Some(&amber), "ane-1", AlertLevel::Red, t1, t2, gap);
        assert_eq!(red.amber_since, Some(t0));
        assert_eq!(red.red_since, Some(t1));

        let t3 = t2 + Duration::minutes(10);
        let normal = advance(Some(&red), "ane-1", AlertLevel::Normal, t2, t3, gap);
        assert_eq!(normal.amber_since, None);
        assert_eq!(normal.red_since, None);
    }

    #[test]
    fn test_advance_restarts_episodes_after_gap() {
        let gap = Duration::minutes(30);
        let t0 = base();
        let red = advance(None, "ane-1", AlertLevel::Red, t0, t0 + Duration::minutes(10), gap);

        // a missing bucket inside the gap keeps the episode
        let t1 = t0 + Duration::minutes(30);
        let kept = advance(Some(&red), "ane-1", AlertLevel::Red, t1, t1 + Duration::minutes(10), gap);
        assert_eq!(kept.red_since, Some(t0));

        let t2 = t0 + Duration::days(3);
        let fresh = advance(Some(&red), "ane-1", AlertLevel::Amber, t2, t2 + Duration::minutes(10), gap);
        assert_eq!(fresh.amber_since, Some(t2));
        assert_eq!(fresh.red_since, None);
    }
}
