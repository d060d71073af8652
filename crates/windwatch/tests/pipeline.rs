//! End-to-end tests: packets in, aggregates, notifications and snoozes out.

use chrono::{DateTime, Duration, TimeZone, Utc};

use windwatch::notify::delivery::{deliver_pending, OutboundMessage, RecordingDelivery};
use windwatch::storage::notifications;
use windwatch::{
    AcknowledgementHandler, Aggregator, AlertLevel, Config, Device, Ingestor, Storage, Thresholds,
    TokenAction,
};

fn at(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minute)
}

struct Pipeline {
    storage: Storage,
    ingestor: Ingestor,
    aggregator: Aggregator,
}

impl Pipeline {
    /// Device `D` with amber 20 and red 30, and `contacts` contacts.
    fn new(contacts: usize) -> Self {
        let config = Config::default();
        let storage = Storage::open_in_memory().unwrap();
        storage.register_device(&Device::new("D", Some("Harbour mast".to_string()))).unwrap();
        storage.set_thresholds("D", Thresholds::new(20.0, 30.0).unwrap()).unwrap();
        for i in 0..contacts {
            storage
                .add_contact("D", Some(&format!("contact-{i}")), &[format!("c{i}@example.com")])
                .unwrap();
        }
        Self {
            storage,
            ingestor: Ingestor::new(config.bucket_width()),
            aggregator: Aggregator::from_config(&config),
        }
    }

    fn ingest(&self, minute: i64, speed: f64) {
        let line = format!(
            r#"{{"deviceId":"D","timestamp":"{}","windSpeed":{speed}}}"#,
            at(minute).to_rfc3339()
        );
        self.ingestor.ingest_line(&self.storage, &line).unwrap();
    }

    /// One reading per minute in `[from, to)`.
    fn ingest_steady(&self, from: i64, to: i64, speed: f64) {
        for minute in from..to {
            self.ingest(minute, speed);
        }
    }

    /// Run a pass at `now` and return the number of notifications queued.
    fn tick(&self, now: DateTime<Utc>) -> usize {
        self.aggregator
            .run_all(&self.storage, now)
            .unwrap()
            .iter()
            .map(|r| r.notifications)
            .sum()
    }

    fn message(&self, event_id: i64) -> OutboundMessage {
        let event = notifications::get_event(self.storage.connection(), event_id)
            .unwrap()
            .unwrap();
        serde_json::from_str(event.payload.as_deref().unwrap()).unwrap()
    }

    fn link(&self, event_id: i64, action: TokenAction) -> String {
        let message = self.message(event_id);
        message.variables["links"]
            .as_array()
            .unwrap()
            .iter()
            .find(|l| l["action"] == action.as_str())
            .and_then(|l| l["url"].as_str())
            .unwrap()
            .to_string()
    }

    fn snooze_rows(&self) -> i64 {
        self.storage
            .connection()
            .query_row("SELECT COUNT(*) FROM snoozes", [], |row| row.get(0))
            .unwrap()
    }
}

#[tokio::test]
async fn test_reference_bucket_end_to_end() {
    let pipeline = Pipeline::new(2);
    for (minute, speed) in [18.0, 19.0, 21.0, 32.0, 33.0, 19.0, 5.0].into_iter().enumerate() {
        pipeline.ingest(minute as i64, speed);
    }

    assert_eq!(pipeline.tick(at(10)), 2);

    let aggregates = pipeline.storage.aggregates("D", None, None).unwrap();
    assert_eq!(aggregates.len(), 1);
    let bucket = &aggregates[0];
    assert_eq!(bucket.sample_count, 7);
    assert!((bucket.avg_speed - 21.0).abs() < 1e-9);
    assert!((bucket.max_speed - 33.0).abs() < 1e-9);
    assert_eq!(bucket.level, AlertLevel::Red);
    assert_eq!(bucket.downtime_seconds, 120);

    let record = &pipeline.storage.aggregate_records("D", None, None).unwrap()[0];
    assert!(record.amber_alert && record.red_alert);

    let events = pipeline.storage.events(Some("D"), 10).unwrap();
    assert_eq!(events.len(), 2);
    for event in &events {
        let tokens = notifications::tokens_for_event(pipeline.storage.connection(), event.id).unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(pipeline.message(event.id).template, "wind_alert_red");
    }

    let shared = pipeline.storage.into_shared();
    let channel = RecordingDelivery::new();
    let report = deliver_pending(&shared, &channel, 5, 100).await.unwrap();
    assert_eq!(report.delivered, 2);

    let mut recipients: Vec<String> = channel
        .sent()
        .into_iter()
        .flat_map(|m| m.recipients)
        .collect();
    recipients.sort();
    assert_eq!(recipients, vec!["c0@example.com", "c1@example.com"]);
}

#[test]
fn test_three_elevated_buckets_notify_once() {
    let pipeline = Pipeline::new(1);

    let mut notified = 0;
    for bucket in 0..3 {
        pipeline.ingest_steady(bucket * 10, bucket * 10 + 10, 25.0);
        notified += pipeline.tick(at(bucket * 10 + 10));
    }

    assert_eq!(notified, 1);
    assert_eq!(pipeline.storage.aggregates("D", None, None).unwrap().len(), 3);
    assert_eq!(pipeline.storage.events(None, 10).unwrap().len(), 1);
}

#[test]
fn test_snooze_suppresses_then_expires() {
    let pipeline = Pipeline::new(1);
    pipeline.ingest_steady(0, 10, 25.0);
    assert_eq!(pipeline.tick(at(10)), 1);

    let event_id = pipeline.storage.events(None, 1).unwrap()[0].id;
    let link = pipeline.link(event_id, TokenAction::Snooze1h);
    let redemption = AcknowledgementHandler::new()
        .redeem_link(&pipeline.storage, &link, at(10))
        .unwrap();
    assert_eq!(redemption.snoozed_until, Some(at(70)));

    pipeline.ingest_steady(10, 80, 25.0);

    // 59 minutes after the snooze: five more elevated buckets, nothing sent
    assert_eq!(pipeline.tick(at(69)), 0);
    assert_eq!(pipeline.storage.aggregates("D", None, None).unwrap().len(), 6);

    // 61 minutes after: the snooze is over and the device is still elevated
    assert_eq!(pipeline.tick(at(71)), 1);
    assert_eq!(pipeline.storage.events(None, 10).unwrap().len(), 2);
}

#[test]
fn test_token_is_single_use() {
    let pipeline = Pipeline::new(1);
    pipeline.ingest_steady(0, 10, 35.0);
    pipeline.tick(at(10));

    let event_id = pipeline.storage.events(None, 1).unwrap()[0].id;
    let link = pipeline.link(event_id, TokenAction::SnoozeToday);
    let handler = AcknowledgementHandler::new();

    let first = handler.redeem_link(&pipeline.storage, &link, at(11)).unwrap();
    assert_eq!(first.action, TokenAction::SnoozeToday);
    assert_eq!(
        first.snoozed_until,
        Some(Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap())
    );

    let second = handler.redeem_link(&pipeline.storage, &link, at(12)).unwrap_err();
    assert!(second.is_token_rejected());
    assert_eq!(pipeline.snooze_rows(), 1);
    assert_eq!(pipeline.storage.history(None, 10).unwrap().len(), 1);
}

#[test]
fn test_episode_restarts_after_data_gap() {
    let pipeline = Pipeline::new(1);
    pipeline.ingest_steady(0, 10, 35.0);
    assert_eq!(pipeline.tick(at(10)), 1);
    let first_event = pipeline.storage.events(None, 1).unwrap()[0].id;

    // offline for three days, back at red
    let back = 3 * 24 * 60;
    pipeline.ingest_steady(back, back + 10, 35.0);
    assert_eq!(pipeline.tick(at(back + 10)), 1);

    let state = pipeline.storage.alert_state("D").unwrap().unwrap();
    assert_eq!(state.red_since, Some(at(back)));

    let old_tokens =
        notifications::tokens_for_event(pipeline.storage.connection(), first_event).unwrap();
    assert!(old_tokens.iter().all(|t| t.revoked_at.is_some()));
}

#[test]
fn test_downgrade_after_data_gap_notifies() {
    let pipeline = Pipeline::new(1);
    pipeline.ingest_steady(0, 10, 35.0);
    assert_eq!(pipeline.tick(at(10)), 1);

    pipeline.ingest_steady(120, 130, 25.0);
    assert_eq!(pipeline.tick(at(130)), 1);

    let event = &pipeline.storage.events(None, 1).unwrap()[0];
    assert_eq!(event.level, AlertLevel::Amber);
}

#[test]
fn test_rerun_is_idempotent() {
    let pipeline = Pipeline::new(1);
    pipeline.ingest_steady(0, 10, 12.0);

    pipeline.tick(at(10));
    let reports = pipeline.aggregator.run_all(&pipeline.storage, at(10)).unwrap();
    assert!(reports.is_empty());
    pipeline.tick(at(40));

    assert_eq!(pipeline.storage.aggregates("D", None, None).unwrap().len(), 1);
}

#[test]
fn test_late_packet_rejected_after_aggregation() {
    let pipeline = Pipeline::new(0);
    pipeline.ingest_steady(0, 5, 12.0);
    pipeline.tick(at(10));

    let line = format!(
        r#"{{"deviceId":"D","timestamp":"{}","windSpeed":12.0}}"#,
        at(7).to_rfc3339()
    );
    let err = pipeline
        .ingestor
        .ingest_line(&pipeline.storage, &line)
        .unwrap_err();
    assert!(err.is_ingest_rejection());
    assert_eq!(pipeline.ingestor.stats().snapshot().late, 1);
}

#[test]
fn test_downtime_adds_up_across_buckets() {
    let pipeline = Pipeline::new(0);
    pipeline.ingest_steady(0, 5, 10.0);
    pipeline.ingest_steady(5, 25, 35.0);
    pipeline.ingest_steady(25, 40, 10.0);

    for end in [10, 20, 30, 40] {
        pipeline.tick(at(end));
    }

    let aggregates = pipeline.storage.aggregates("D", None, None).unwrap();
    let per_bucket: Vec<i64> = aggregates.iter().map(|a| a.downtime_seconds).collect();
    assert_eq!(per_bucket, vec![300, 600, 300, 0]);
    assert_eq!(per_bucket.iter().sum::<i64>(), 20 * 60);
    assert!(pipeline.storage.downtime_window("D").unwrap().is_none());
}

#[test]
fn test_every_reading_counted_once() {
    let pipeline = Pipeline::new(0);
    let minutes = [0, 3, 9, 10, 11, 19, 20, 27, 29, 41];
    for (i, minute) in minutes.iter().enumerate() {
        pipeline.ingest(*minute, 5.0 + i as f64);
    }
    // duplicate
    let line = format!(
        r#"{{"deviceId":"D","timestamp":"{}","windSpeed":99.0}}"#,
        at(3).to_rfc3339()
    );
    assert!(pipeline.ingestor.ingest_line(&pipeline.storage, &line).is_err());

    pipeline.tick(at(30));
    pipeline.tick(at(50));

    let aggregates = pipeline.storage.aggregates("D", None, None).unwrap();
    let counted: u32 = aggregates.iter().map(|a| a.sample_count).sum();
    assert_eq!(counted as usize, minutes.len());
    assert_eq!(aggregates.len(), 4);
    assert_eq!(pipeline.storage.stats().unwrap().pending_readings, 0);
}
