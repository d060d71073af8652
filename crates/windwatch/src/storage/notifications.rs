//! Notification events (the delivery outbox), action tokens, snoozes and
//! the redemption history.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::alert::AlertLevel;
use crate::error::{Error, Result};
use crate::notify::TokenAction;

use super::{from_millis, to_millis, Storage};

/// Where an event stands with the delivery collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Written, never attempted.
    Pending,
    /// Accepted by the delivery collaborator.
    Delivered,
    /// Last attempt failed; will be retried.
    Failed,
    /// Attempts exhausted.
    Abandoned,
}

impl DeliveryStatus {
    /// Stored name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(format!("unknown delivery status '{other}'")),
        }
    }
}

/// A dispatched notification for one contact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationEvent {
    /// Identifier assigned by storage.
    pub id: i64,
    /// Device that alerted.
    pub device_id: String,
    /// Contact notified.
    pub contact_id: i64,
    /// Level notified about.
    pub level: AlertLevel,
    /// Start of the episode this event belongs to.
    pub episode_started_at: DateTime<Utc>,
    /// Bucket whose evaluation produced the event.
    pub interval_start: DateTime<Utc>,
    /// When the event was written.
    pub created_at: DateTime<Utc>,
    /// Delivery progress.
    pub delivery_status: DeliveryStatus,
    /// Delivery attempts so far.
    pub delivery_attempts: u32,
    /// Error from the last failed attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Serialized outbound message; cleared after delivery.
    #[serde(skip)]
    pub payload: Option<String>,
    /// When delivery succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    /// When a contact acknowledged it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// When the device dropped below the event's level.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Fields of an event about to be written.
#[derive(Debug, Clone)]
pub struct NewEvent<'a> {
    /// Device that alerted.
    pub device_id: &'a str,
    /// Contact to notify.
    pub contact_id: i64,
    /// Level notified about.
    pub level: AlertLevel,
    /// Episode start.
    pub episode_started_at: DateTime<Utc>,
    /// Bucket that triggered it.
    pub interval_start: DateTime<Utc>,
    /// Write time.
    pub created_at: DateTime<Utc>,
}

/// A stored action token. The token id itself is never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    /// BLAKE3 hash of the token id.
    pub token_hash: String,
    /// Event the token was minted for.
    pub event_id: i64,
    /// Device of the event.
    pub device_id: String,
    /// Contact the token was sent to.
    pub contact_id: i64,
    /// Action the token was minted for.
    pub action: TokenAction,
    /// Mint time.
    pub created_at: DateTime<Utc>,
    /// Expiry.
    pub expires_at: DateTime<Utc>,
    /// Redemption time.
    pub used_at: Option<DateTime<Utc>>,
    /// Revocation time.
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Snooze state of one (device, contact) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snooze {
    /// Device.
    pub device_id: String,
    /// Contact.
    pub contact_id: i64,
    /// Notifications are suppressed until this instant.
    pub snoozed_until: DateTime<Utc>,
    /// Action that set the snooze.
    pub action: TokenAction,
    /// Last write.
    pub updated_at: DateTime<Utc>,
}

impl Snooze {
    /// Whether the snooze still suppresses at `now`.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.snoozed_until > now
    }
}

/// One redeemed token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    /// Identifier assigned by storage.
    pub id: i64,
    /// Event acted on.
    pub event_id: i64,
    /// Device.
    pub device_id: String,
    /// Contact.
    pub contact_id: i64,
    /// Action taken.
    pub action: TokenAction,
    /// Snooze written, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snoozed_until: Option<DateTime<Utc>>,
    /// Redemption time.
    pub recorded_at: DateTime<Utc>,
}

const EVENT_COLUMNS: &str = "id, device_id, contact_id, level, episode_started_at, \
     interval_start, created_at, delivery_status, delivery_attempts, last_error, payload, \
     delivered_at, acknowledged_at, resolved_at";

// === Events ===

/// Write a pending event. The payload is attached separately once tokens exist.
///
/// # Errors
///
/// Returns an error if the insert fails.
pub fn insert_event(conn: &Connection, event: &NewEvent<'_>) -> Result<i64> {
    conn.execute(
        "INSERT INTO notification_events
            (device_id, contact_id, level, episode_started_at, interval_start, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.device_id,
            event.contact_id,
            event.level.as_str(),
            to_millis(event.episode_started_at),
            to_millis(event.interval_start),
            to_millis(event.created_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Attach the serialized outbound message to an event.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn set_payload(conn: &Connection, event_id: i64, payload: &str) -> Result<()> {
    conn.execute(
        "UPDATE notification_events SET payload = ?1 WHERE id = ?2",
        params![payload, event_id],
    )?;
    Ok(())
}

/// Look up an event.
///
/// # Errors
///
/// Returns an error if the query fails or the row is unreadable.
pub fn get_event(conn: &Connection, event_id: i64) -> Result<Option<NotificationEvent>> {
    let raw = conn
        .query_row(
            &format!("SELECT {EVENT_COLUMNS} FROM notification_events WHERE id = ?1"),
            [event_id],
            raw_event,
        )
        .optional()?;
    raw.map(RawEvent::into_event).transpose()
}

/// The newest event for a contact at `level` or above, raised by a bucket
/// starting at or after `since`.
///
/// A red event inside an amber episode counts as notifying that episode.
///
/// # Errors
///
/// Returns an error if the query fails or the row is unreadable.
pub fn latest_event_since(
    conn: &Connection,
    device_id: &str,
    contact_id: i64,
    level: AlertLevel,
    since: DateTime<Utc>,
) -> Result<Option<NotificationEvent>> {
    let levels: Vec<&str> = AlertLevel::ALL
        .iter()
        .filter(|l| **l >= level)
        .map(AlertLevel::as_str)
        .collect();
    let placeholders = (0..levels.len())
        .map(|i| format!("?{}", i + 4))
        .collect::<Vec<_>>()
        .join(", ");

    let mut values: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(3 + levels.len());
    let since = to_millis(since);
    values.push(&device_id);
    values.push(&contact_id);
    values.push(&since);
    for level in &levels {
        values.push(level);
    }

    let raw = conn
        .query_row(
            &format!(
                "SELECT {EVENT_COLUMNS} FROM notification_events
                 WHERE device_id = ?1 AND contact_id = ?2 AND interval_start >= ?3
                   AND level IN ({placeholders})
                 ORDER BY created_at DESC, id DESC LIMIT 1"
            ),
            values.as_slice(),
            raw_event,
        )
        .optional()?;
    raw.map(RawEvent::into_event).transpose()
}

/// Events waiting for (another) delivery attempt, oldest first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn undelivered_events(conn: &Connection, limit: usize) -> Result<Vec<NotificationEvent>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLUMNS} FROM notification_events
         WHERE delivery_status IN ('pending', 'failed') AND payload IS NOT NULL
         ORDER BY id LIMIT ?1"
    ))?;
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let events = collect_events(stmt.query_map([limit], raw_event)?)?;
    Ok(events)
}

/// Record a successful delivery and drop the stored payload.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn record_delivered(conn: &Connection, event_id: i64, at: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE notification_events
         SET delivery_status = 'delivered', delivery_attempts = delivery_attempts + 1,
             delivered_at = ?1, last_error = NULL, payload = NULL
         WHERE id = ?2",
        params![to_millis(at), event_id],
    )?;
    Ok(())
}

/// Record a failed delivery attempt. Returns the resulting status:
/// [`DeliveryStatus::Abandoned`] once `max_attempts` is reached.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn record_delivery_failure(
    conn: &Connection,
    event_id: i64,
    error: &str,
    max_attempts: u32,
) -> Result<DeliveryStatus> {
    conn.execute(
        "UPDATE notification_events
         SET delivery_attempts = delivery_attempts + 1,
             last_error = ?1,
             delivery_status = CASE WHEN delivery_attempts + 1 >= ?2 THEN 'abandoned' ELSE 'failed' END
         WHERE id = ?3",
        params![error, max_attempts, event_id],
    )?;
    let status: String = conn.query_row(
        "SELECT delivery_status FROM notification_events WHERE id = ?1",
        [event_id],
        |row| row.get(0),
    )?;
    status
        .parse()
        .map_err(|e: String| Error::corrupt_row("notification_events", e))
}

/// Mark an event acknowledged. Keeps the first acknowledgement time.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn mark_acknowledged(conn: &Connection, event_id: i64, at: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE notification_events SET acknowledged_at = COALESCE(acknowledged_at, ?1) WHERE id = ?2",
        params![to_millis(at), event_id],
    )?;
    Ok(())
}

/// Resolve the events of an episode that just ended and revoke their unused
/// tokens. Returns the number of tokens revoked.
///
/// # Errors
///
/// Returns an error if an update fails.
pub fn resolve_episode(
    conn: &Connection,
    device_id: &str,
    level: AlertLevel,
    episode_started_at: DateTime<Utc>,
    at: DateTime<Utc>,
) -> Result<usize> {
    let at = to_millis(at);
    let episode = to_millis(episode_started_at);

    let revoked = conn.execute(
        "UPDATE action_tokens SET revoked_at = ?1
         WHERE used_at IS NULL AND revoked_at IS NULL AND event_id IN (
             SELECT id FROM notification_events
             WHERE device_id = ?2 AND level = ?3 AND episode_started_at = ?4
         )",
        params![at, device_id, level.as_str(), episode],
    )?;
    conn.execute(
        "UPDATE notification_events SET resolved_at = ?1
         WHERE device_id = ?2 AND level = ?3 AND episode_started_at = ?4 AND resolved_at IS NULL",
        params![at, device_id, level.as_str(), episode],
    )?;
    Ok(revoked)
}

// === Tokens ===

/// Store a minted token.
///
/// # Errors
///
/// Returns an error if the insert fails.
pub fn insert_token(conn: &Connection, token: &TokenRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO action_tokens
            (token_hash, event_id, device_id, contact_id, action, created_at, expires_at, used_at, revoked_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            token.token_hash,
            token.event_id,
            token.device_id,
            token.contact_id,
            token.action.as_str(),
            to_millis(token.created_at),
            to_millis(token.expires_at),
            token.used_at.map(to_millis),
            token.revoked_at.map(to_millis),
        ],
    )?;
    Ok(())
}

/// Look up a token by hash.
///
/// # Errors
///
/// Returns an error if the query fails or the row is unreadable.
pub fn get_token(conn: &Connection, token_hash: &str) -> Result<Option<TokenRecord>> {
    let raw = conn
        .query_row(
            "SELECT token_hash, event_id, device_id, contact_id, action, created_at, expires_at,
                    used_at, revoked_at
             FROM action_tokens WHERE token_hash = ?1",
            [token_hash],
            |row| {
                Ok((
                    TokenRecord {
                        token_hash: row.get(0)?,
                        event_id: row.get(1)?,
                        device_id: row.get(2)?,
                        contact_id: row.get(3)?,
                        action: TokenAction::Acknowledge,
                        created_at: from_millis(row.get(5)?),
                        expires_at: from_millis(row.get(6)?),
                        used_at: row.get::<_, Option<i64>>(7)?.map(from_millis),
                        revoked_at: row.get::<_, Option<i64>>(8)?.map(from_millis),
                    },
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;

    raw.map(|(record, action)| {
        let action = action
            .parse()
            .map_err(|e: String| Error::corrupt_row("action_tokens", e))?;
        Ok(TokenRecord { action, ..record })
    })
    .transpose()
}

/// Mark a token used. Returns `false` if it was already used or revoked.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn consume_token(conn: &Connection, token_hash: &str, at: DateTime<Utc>) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE action_tokens SET used_at = ?1
         WHERE token_hash = ?2 AND used_at IS NULL AND revoked_at IS NULL",
        params![to_millis(at), token_hash],
    )?;
    Ok(changed == 1)
}

/// Tokens minted for an event.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn tokens_for_event(conn: &Connection, event_id: i64) -> Result<Vec<TokenRecord>> {
    let mut stmt =
        conn.prepare("SELECT token_hash FROM action_tokens WHERE event_id = ?1 ORDER BY created_at")?;
    let hashes = stmt
        .query_map([event_id], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut tokens = Vec::with_capacity(hashes.len());
    for hash in hashes {
        if let Some(token) = get_token(conn, &hash)? {
            tokens.push(token);
        }
    }
    Ok(tokens)
}

// === Snoozes ===

/// Snooze row of a (device, contact) pair, active or not.
///
/// # Errors
///
/// Returns an error if the query fails or the row is unreadable.
pub fn get_snooze(conn: &Connection, device_id: &str, contact_id: i64) -> Result<Option<Snooze>> {
    let raw: Option<(i64, String, i64)> = conn
        .query_row(
            "SELECT snoozed_until, action, updated_at FROM snoozes
             WHERE device_id = ?1 AND contact_id = ?2",
            params![device_id, contact_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    raw.map(|(until, action, updated_at)| {
        Ok(Snooze {
            device_id: device_id.to_string(),
            contact_id,
            snoozed_until: from_millis(until),
            action: action
                .parse()
                .map_err(|e: String| Error::corrupt_row("snoozes", e))?,
            updated_at: from_millis(updated_at),
        })
    })
    .transpose()
}

/// Create or replace the snooze of a (device, contact) pair.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn upsert_snooze(conn: &Connection, snooze: &Snooze) -> Result<()> {
    conn.execute(
        "INSERT INTO snoozes (device_id, contact_id, snoozed_until, action, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(device_id, contact_id) DO UPDATE SET
            snoozed_until = excluded.snoozed_until,
            action = excluded.action,
            updated_at = excluded.updated_at",
        params![
            snooze.device_id,
            snooze.contact_id,
            to_millis(snooze.snoozed_until),
            snooze.action.as_str(),
            to_millis(snooze.updated_at),
        ],
    )?;
    Ok(())
}

// === History ===

/// Append a redemption to the audit trail.
///
/// # Errors
///
/// Returns an error if the insert fails.
pub fn insert_history(
    conn: &Connection,
    token: &TokenRecord,
    action: TokenAction,
    snoozed_until: Option<DateTime<Utc>>,
    at: DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO notification_history
            (event_id, device_id, contact_id, action, token_hash, snoozed_until, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            token.event_id,
            token.device_id,
            token.contact_id,
            action.as_str(),
            token.token_hash,
            snoozed_until.map(to_millis),
            to_millis(at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

struct RawEvent {
    event: NotificationEvent,
    level: String,
    status: String,
}

impl RawEvent {
    fn into_event(self) -> Result<NotificationEvent> {
        let level = self
            .level
            .parse()
            .map_err(|e: String| Error::corrupt_row("notification_events", e))?;
        let delivery_status = self
            .status
            .parse()
            .map_err(|e: String| Error::corrupt_row("notification_events", e))?;
        Ok(NotificationEvent {
            level,
            delivery_status,
            ..self.event
        })
    }
}

fn raw_event(row: &Row<'_>) -> rusqlite::Result<RawEvent> {
    Ok(RawEvent {
        event: NotificationEvent {
            id: row.get(0)?,
            device_id: row.get(1)?,
            contact_id: row.get(2)?,
            level: AlertLevel::Normal,
            episode_started_at: from_millis(row.get(4)?),
            interval_start: from_millis(row.get(5)?),
            created_at: from_millis(row.get(6)?),
            delivery_status: DeliveryStatus::Pending,
            delivery_attempts: row.get(8)?,
            last_error: row.get(9)?,
            payload: row.get(10)?,
            delivered_at: row.get::<_, Option<i64>>(11)?.map(from_millis),
            acknowledged_at: row.get::<_, Option<i64>>(12)?.map(from_millis),
            resolved_at: row.get::<_, Option<i64>>(13)?.map(from_millis),
        },
        level: row.get(3)?,
        status: row.get(7)?,
    })
}

fn collect_events(
    rows: impl Iterator<Item = rusqlite::Result<RawEvent>>,
) -> Result<Vec<NotificationEvent>> {
    let mut events = Vec::new();
    for row in rows {
        events.push(row?.into_event()?);
    }
    Ok(events)
}

impl Storage {
    /// Most recent notification events, optionally for one device.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn events(&self, device_id: Option<&str>, limit: usize) -> Result<Vec<NotificationEvent>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM notification_events
             WHERE ?1 IS NULL OR device_id = ?1
             ORDER BY id DESC LIMIT ?2"
        ))?;
        let events = collect_events(stmt.query_map(params![device_id, limit], raw_event)?)?;
        Ok(events)
    }

    /// Most recent redemptions, optionally for one device.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn history(&self, device_id: Option<&str>, limit: usize) -> Result<Vec<HistoryEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(
            "SELECT id, event_id, device_id, contact_id, action, snoozed_until, recorded_at
             FROM notification_history
             WHERE ?1 IS NULL OR device_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![device_id, limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<i64>>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, event_id, device_id, contact_id, action, snoozed_until, recorded_at) = row?;
            entries.push(HistoryEntry {
                id,
                event_id,
                device_id,
                contact_id,
                action: action
                    .parse()
                    .map_err(|e: String| Error::corrupt_row("notification_history", e))?,
                snoozed_until: snoozed_until.map(from_millis),
                recorded_at: from_millis(recorded_at),
            });
        }
        Ok(entries)
    }

    /// Snooze state of a (device, contact) pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn snooze(&self, device_id: &str, contact_id: i64) -> Result<Option<Snooze>> {
        get_snooze(&self.conn, device_id, contact_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, minute, 0).unwrap()
    }

    fn new_event(level: AlertLevel) -> NewEvent<'static> {
        NewEvent {
            device_id: "ane-1",
            contact_id: 1,
            level,
            episode_started_at: at(0),
            interval_start: at(0),
            created_at: at(10),
        }
    }

    fn token(event_id: i64, hash: &str, action: TokenAction) -> TokenRecord {
        TokenRecord {
            token_hash: hash.to_string(),
            event_id,
            device_id: "ane-1".to_string(),
            contact_id: 1,
            action,
            created_at: at(10),
            expires_at: at(10) + Duration::hours(24),
            used_at: None,
            revoked_at: None,
        }
    }

    #[test]
    fn test_event_lifecycle() {
        let storage = Storage::open_in_memory().unwrap();
        let conn = storage.connection();
        let id = insert_event(conn, &new_event(AlertLevel::Red)).unwrap();

        // no payload yet, so nothing to deliver
        assert!(undelivered_events(conn, 10).unwrap().is_empty());
        set_payload(conn, id, "{}").unwrap();
        assert_eq!(undelivered_events(conn, 10).unwrap().len(), 1);

        record_delivered(conn, id, at(11)).unwrap();
        let event = get_event(conn, id).unwrap().unwrap();
        assert_eq!(event.delivery_status, DeliveryStatus::Delivered);
        assert_eq!(event.delivery_attempts, 1);
        assert!(event.payload.is_none());
        assert!(undelivered_events(conn, 10).unwrap().is_empty());
    }

    #[test]
    fn test_delivery_failure_until_abandoned() {
        let storage = Storage::open_in_memory().unwrap();
        let conn = storage.connection();
        let id = insert_event(conn, &new_event(AlertLevel::Amber)).unwrap();
        set_payload(conn, id, "{}").unwrap();

        assert_eq!(
            record_delivery_failure(conn, id, "smtp down", 3).unwrap(),
            DeliveryStatus::Failed
        );
        assert_eq!(
            record_delivery_failure(conn, id, "smtp down", 3).unwrap(),
            DeliveryStatus::Failed
        );
        assert_eq!(
            record_delivery_failure(conn, id, "smtp down", 3).unwrap(),
            DeliveryStatus::Abandoned
        );

        let event = get_event(conn, id).unwrap().unwrap();
        assert_eq!(event.delivery_attempts, 3);
        assert_eq!(event.last_error.as_deref(), Some("smtp down"));
        assert!(undelivered_events(conn, 10).unwrap().is_empty());
    }

    #[test]
    fn test_latest_event_since() {
        let storage = Storage::open_in_memory().unwrap();
        let conn = storage.connection();
        insert_event(conn, &new_event(AlertLevel::Amber)).unwrap();
        let second = insert_event(
            conn,
            &NewEvent {
                created_at: at(40),
                ..new_event(AlertLevel::Amber)
            },
        )
        .unwrap();

        let latest = latest_event_since(conn, "ane-1", 1, AlertLevel::Amber, at(0))
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, second);
        assert!(latest_event_since(conn, "ane-1", 1, AlertLevel::Red, at(0))
            .unwrap()
            .is_none());
        assert!(latest_event_since(conn, "ane-1", 1, AlertLevel::Amber, at(10))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_red_event_covers_amber_episode() {
        let storage = Storage::open_in_memory().unwrap();
        let conn = storage.connection();
        let red = insert_event(conn, &new_event(AlertLevel::Red)).unwrap();

        let found = latest_event_since(conn, "ane-1", 1, AlertLevel::Amber, at(0))
            .unwrap()
            .unwrap();
        assert_eq!(found.id, red);
    }

    #[test]
    fn test_token_consumed_once() {
        let storage = Storage::open_in_memory().unwrap();
        let conn = storage.connection();
        let event_id = insert_event(conn, &new_event(AlertLevel::Red)).unwrap();
        insert_token(conn, &token(event_id, "h1", TokenAction::Snooze1h)).unwrap();

        assert!(consume_token(conn, "h1", at(15)).unwrap());
        assert!(!consume_token(conn, "h1", at(16)).unwrap());

        let stored = get_token(conn, "h1").unwrap().unwrap();
        assert_eq!(stored.used_at, Some(at(15)));
        assert_eq!(stored.action, TokenAction::Snooze1h);
        assert!(get_token(conn, "missing").unwrap().is_none());
    }

    #[test]
    fn test_resolve_episode_revokes_unused_tokens() {
        let storage = Storage::open_in_memory().unwrap();
        let conn = storage.connection();
        let event_id = insert_event(conn, &new_event(AlertLevel::Red)).unwrap();
        insert_token(conn, &token(event_id, "used", TokenAction::Snooze1h)).unwrap();
        insert_token(conn, &token(event_id, "unused", TokenAction::SnoozeToday)).unwrap();
        consume_token(conn, "used", at(12)).unwrap();

        let revoked = resolve_episode(conn, "ane-1", AlertLevel::Red, at(0), at(20)).unwrap();
        assert_eq!(revoked, 1);
        assert!(get_token(conn, "unused").unwrap().unwrap().revoked_at.is_some());
        assert!(get_token(conn, "used").unwrap().unwrap().revoked_at.is_none());
        assert_eq!(
            get_event(conn, event_id).unwrap().unwrap().resolved_at,
            Some(at(20))
        );
        assert!(!consume_token(conn, "unused", at(21)).unwrap());
        assert_eq!(tokens_for_event(conn, event_id).unwrap().len(), 2);
    }

    #[test]
    fn test_snooze_single_row_per_pair() {
        let storage = Storage::open_in_memory().unwrap();
        let conn = storage.connection();
        let mut snooze = Snooze {
            device_id: "ane-1".to_string(),
            contact_id: 1,
            snoozed_until: at(10) + Duration::hours(1),
            action: TokenAction::Snooze1h,
            updated_at: at(10),
        };
        upsert_snooze(conn, &snooze).unwrap();
        snooze.snoozed_until = at(20) + Duration::hours(1);
        snooze.updated_at = at(20);
        upsert_snooze(conn, &snooze).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM snoozes", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let stored = storage.snooze("ane-1", 1).unwrap().unwrap();
        assert_eq!(stored, snooze);
        assert!(stored.is_active(at(59)));
        assert!(!stored.is_active(at(20) + Duration::hours(1)));
    }

    #[test]
    fn test_history_and_events_listing() {
        let storage = Storage::open_in_memory().unwrap();
        let conn = storage.connection();
        let event_id = insert_event(conn, &new_event(AlertLevel::Red)).unwrap();
        let record = token(event_id, "h1", TokenAction::Snooze1h);
        insert_token(conn, &record).unwrap();
        insert_history(
            conn,
            &record,
            TokenAction::Snooze1h,
            Some(at(15) + Duration::hours(1)),
            at(15),
        )
        .unwrap();

        let history = storage.history(Some("ane-1"), 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, TokenAction::Snooze1h);
        assert!(storage.history(Some("ane-2"), 10).unwrap().is_empty());
        assert_eq!(storage.history(None, 10).unwrap().len(), 1);
        assert_eq!(storage.events(None, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_mark_acknowledged_keeps_first() {
        let storage = Storage::open_in_memory().unwrap();
        let conn = storage.connection();
        let id = insert_event(conn, &new_event(AlertLevel::Amber)).unwrap();
        mark_acknowledged(conn, id, at(12)).unwrap();
        mark_acknowledged(conn, id, at(14)).unwrap();

        assert_eq!(
            get_event(conn, id).unwrap().unwrap().acknowledged_at,
            Some(at(12))
        );
    }
}
