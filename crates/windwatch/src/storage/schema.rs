//! `SQLite` schema definitions for windwatch.
//!
//! Instants that take part in range arithmetic (reading timestamps, bucket
//! bounds, expiries) are stored as INTEGER Unix milliseconds. Audit columns
//! use SQLite's `datetime('now')` text.

/// Registered devices.
pub const CREATE_DEVICES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS devices (
    id TEXT PRIMARY KEY,
    name TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    latitude REAL,
    longitude REAL,
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
)
";

/// Per-device amber/red thresholds.
pub const CREATE_THRESHOLDS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS thresholds (
    device_id TEXT PRIMARY KEY REFERENCES devices(id),
    amber REAL NOT NULL,
    red REAL NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
)
";

/// Notification contacts. `addresses` is a JSON array of strings.
pub const CREATE_CONTACTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS contacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id TEXT NOT NULL REFERENCES devices(id),
    name TEXT,
    addresses TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
)
";

/// The ingestion buffer. Exact duplicates are rejected by the unique key.
pub const CREATE_READINGS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS readings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    wind_speed REAL NOT NULL,
    latitude REAL,
    longitude REAL,
    processed INTEGER NOT NULL DEFAULT 0,
    received_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (device_id, timestamp)
)
";

/// Index for the aggregator's select of unprocessed readings.
pub const CREATE_READINGS_PENDING_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_readings_pending ON readings(device_id, processed, timestamp)
";

/// Append-only historical ledger. One row per non-empty bucket.
pub const CREATE_AGGREGATES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS interval_aggregates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id TEXT NOT NULL,
    interval_start INTEGER NOT NULL,
    interval_end INTEGER NOT NULL,
    avg_speed REAL NOT NULL,
    max_speed REAL NOT NULL,
    stddev_speed REAL NOT NULL,
    sample_count INTEGER NOT NULL,
    alert_level TEXT NOT NULL,
    amber_alert INTEGER NOT NULL,
    red_alert INTEGER NOT NULL,
    downtime_seconds INTEGER NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (device_id, interval_start)
)
";

/// Current level and episode starts per device. No row means no data yet.
pub const CREATE_ALERT_STATE_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS device_alert_state (
    device_id TEXT PRIMARY KEY,
    level TEXT NOT NULL,
    amber_since INTEGER,
    red_since INTEGER,
    last_interval_end INTEGER NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
)
";

/// Open downtime windows, at most one per device.
pub const CREATE_DOWNTIME_WINDOWS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS downtime_windows (
    device_id TEXT PRIMARY KEY,
    started_at INTEGER NOT NULL,
    accrued_until INTEGER NOT NULL
)
";

/// Notification outbox and event record.
pub const CREATE_NOTIFICATION_EVENTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS notification_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id TEXT NOT NULL,
    contact_id INTEGER NOT NULL,
    level TEXT NOT NULL,
    episode_started_at INTEGER NOT NULL,
    interval_start INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    delivery_status TEXT NOT NULL DEFAULT 'pending',
    delivery_attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    payload TEXT,
    delivered_at INTEGER,
    acknowledged_at INTEGER,
    resolved_at INTEGER
)
";

/// Lookup of the latest event per (device, contact, level, episode).
pub const CREATE_EVENTS_EPISODE_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_events_episode
    ON notification_events(device_id, contact_id, level, episode_started_at)
";

/// Delivery loop lookup.
pub const CREATE_EVENTS_STATUS_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_events_status ON notification_events(delivery_status)
";

/// Action tokens, keyed by the BLAKE3 hash of the token id.
pub const CREATE_ACTION_TOKENS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS action_tokens (
    token_hash TEXT PRIMARY KEY,
    event_id INTEGER NOT NULL REFERENCES notification_events(id),
    device_id TEXT NOT NULL,
    contact_id INTEGER NOT NULL,
    action TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    used_at INTEGER,
    revoked_at INTEGER
)
";

/// Snooze state; the primary key enforces one row per pair.
pub const CREATE_SNOOZES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS snoozes (
    device_id TEXT NOT NULL,
    contact_id INTEGER NOT NULL,
    snoozed_until INTEGER NOT NULL,
    action TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (device_id, contact_id)
)
";

/// Audit trail of redeemed tokens.
pub const CREATE_NOTIFICATION_HISTORY_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS notification_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id INTEGER NOT NULL,
    device_id TEXT NOT NULL,
    contact_id INTEGER NOT NULL,
    action TEXT NOT NULL,
    token_hash TEXT NOT NULL,
    snoozed_until INTEGER,
    recorded_at INTEGER NOT NULL
)
";

/// Retry ledger for buckets whose transaction failed.
pub const CREATE_AGGREGATION_FAILURES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS aggregation_failures (
    device_id TEXT NOT NULL,
    interval_start INTEGER NOT NULL,
    attempts INTEGER NOT NULL,
    last_error TEXT NOT NULL,
    escalated INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (device_id, interval_start)
)
";

/// Forced prunes of unaggregated readings.
pub const CREATE_DATA_LOSS_EVENTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS data_loss_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id TEXT NOT NULL,
    readings_dropped INTEGER NOT NULL,
    oldest_timestamp INTEGER NOT NULL,
    newest_timestamp INTEGER NOT NULL,
    recorded_at TEXT NOT NULL DEFAULT (datetime('now'))
)
";

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// All schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_DEVICES_TABLE,
    CREATE_THRESHOLDS_TABLE,
    CREATE_CONTACTS_TABLE,
    CREATE_READINGS_TABLE,
    CREATE_READINGS_PENDING_INDEX,
    CREATE_AGGREGATES_TABLE,
    CREATE_ALERT_STATE_TABLE,
    CREATE_DOWNTIME_WINDOWS_TABLE,
    CREATE_NOTIFICATION_EVENTS_TABLE,
    CREATE_EVENTS_EPISODE_INDEX,
    CREATE_EVENTS_STATUS_INDEX,
    CREATE_ACTION_TOKENS_TABLE,
    CREATE_SNOOZES_TABLE,
    CREATE_NOTIFICATION_HISTORY_TABLE,
    CREATE_AGGREGATION_FAILURES_TABLE,
    CREATE_DATA_LOSS_EVENTS_TABLE,
    CREATE_METADATA_TABLE,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_statements_not_empty() {
        assert!(!SCHEMA_STATEMENTS.is_empty());
        for stmt in SCHEMA_STATEMENTS {
            assert!(!stmt.trim().is_empty());
        }
    }

    #[test]
    fn test_readings_unique_per_device_timestamp() {
        assert!(CREATE_READINGS_TABLE.contains("UNIQUE (device_id, timestamp)"));
        assert!(CREATE_READINGS_TABLE.contains("processed INTEGER NOT NULL DEFAULT 0"));
    }

    #[test]
    fn test_aggregates_unique_per_bucket() {
        assert!(CREATE_AGGREGATES_TABLE.contains("UNIQUE (device_id, interval_start)"));
    }

    #[test]
    fn test_snooze_one_row_per_pair() {
        assert!(CREATE_SNOOZES_TABLE.contains("PRIMARY KEY (device_id, contact_id)"));
    }
}
