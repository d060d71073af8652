//! Token redemption.
//!
//! Every failure is reported to the caller as [`Error::TokenRejected`]; the
//! actual reason only goes to the log.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::notify::token::{self, TokenAction};
use crate::storage::notifications::{self, Snooze, TokenRecord};
use crate::storage::Storage;

/// A successful redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Redemption {
    /// Event acted on.
    pub event_id: i64,
    /// Device of the event.
    pub device_id: String,
    /// Contact that redeemed.
    pub contact_id: i64,
    /// Action applied.
    pub action: TokenAction,
    /// Snooze written, if the action snoozes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snoozed_until: Option<DateTime<Utc>>,
}

/// Redeems action tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcknowledgementHandler;

impl AcknowledgementHandler {
    /// Create a handler.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Redeem a token for `action` at `now`.
    ///
    /// The token is consumed, the snooze (if any) upserted and the history
    /// row appended in one IMMEDIATE transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TokenRejected`] if the token is unknown, used,
    /// revoked, expired, or minted for a different snooze action. Returns a
    /// database error if storage fails.
    pub fn redeem(
        &self,
        storage: &Storage,
        token_id: &str,
        action: TokenAction,
        now: DateTime<Utc>,
    ) -> Result<Redemption> {
        let token_hash = token::hash_token(token_id);
        storage.transaction(|conn| redeem_in(conn, &token_hash, action, now))
    }

    /// Redeem the token in an acknowledgement link.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAckLink`] for an unparseable link, otherwise
    /// as [`AcknowledgementHandler::redeem`].
    pub fn redeem_link(&self, storage: &Storage, link: &str, now: DateTime<Utc>) -> Result<Redemption> {
        let (token_id, action) = token::parse_ack_link(link)?;
        self.redeem(storage, &token_id, action, now)
    }
}

fn redeem_in(
    conn: &Connection,
    token_hash: &str,
    action: TokenAction,
    now: DateTime<Utc>,
) -> Result<Redemption> {
    let Some(record) = notifications::get_token(conn, token_hash)? else {
        return Err(reject(token_hash, "unknown token"));
    };
    check(&record, action, now).map_err(|reason| reject(token_hash, reason))?;

    if !notifications::consume_token(conn, token_hash, now)? {
        return Err(reject(token_hash, "token consumed concurrently"));
    }

    let snoozed_until = action.snooze_until(now);
    if let Some(until) = snoozed_until {
        notifications::upsert_snooze(
            conn,
            &Snooze {
                device_id: record.device_id.clone(),
                contact_id: record.contact_id,
                snoozed_until: until,
                action,
                updated_at: now,
            },
        )?;
    }
    notifications::mark_acknowledged(conn, record.event_id, now)?;
    notifications::insert_history(conn, &record, action, snoozed_until, now)?;

    info!(
        device_id = %record.device_id,
        contact_id = record.contact_id,
        event_id = record.event_id,
        action = %action,
        "Redeemed action token"
    );
    Ok(Redemption {
        event_id: record.event_id,
        device_id: record.device_id,
        contact_id: record.contact_id,
        action,
        snoozed_until,
    })
}

fn check(record: &TokenRecord, action: TokenAction, now: DateTime<Utc>) -> std::result::Result<(), &'static str> {
    if record.used_at.is_some() {
        return Err("token already used");
    }
    if record.revoked_at.is_some() {
        return Err("token revoked");
    }
    if record.expires_at <= now {
        return Err("token expired");
    }
    if action != TokenAction::Acknowledge && action != record.action {
        return Err("action does not match token");
    }
    Ok(())
}

fn reject(token_hash: &str, reason: &str) -> Error {
    // only a prefix of the hash, enough to correlate
    warn!(token = &token_hash[..token_hash.len().min(12)], reason, "Rejected action token");
    Error::TokenRejected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertLevel;
    use crate::storage::notifications::NewEvent;
    use chrono::{Duration, TimeZone};

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minute)
    }

    /// Store one event with a snooze_1h token and return the token id.
    fn setup() -> (Storage, String) {
        let storage = Storage::open_in_memory().unwrap();
        let conn = storage.connection();
        let event_id = notifications::insert_event(
            conn,
            &NewEvent {
                device_id: "ane-1",
                contact_id: 1,
                level: AlertLevel::Red,
                episode_started_at: at(0),
                interval_start: at(0),
                created_at: at(10),
            },
        )
        .unwrap();
        let minted = token::mint();
        notifications::insert_token(
            conn,
            &TokenRecord {
                token_hash: minted.hash,
                event_id,
                device_id: "ane-1".to_string(),
                contact_id: 1,
                action: TokenAction::Snooze1h,
                created_at: at(10),
                expires_at: at(10) + Duration::hours(24),
                used_at: None,
                revoked_at: None,
            },
        )
        .unwrap();
        (storage, minted.id)
    }

    #[test]
    fn test_redeem_snooze() {
        let (storage, token_id) = setup();
        let redemption = AcknowledgementHandler::new()
            .redeem(&storage, &token_id, TokenAction::Snooze1h, at(15))
            .unwrap();

        assert_eq!(redemption.snoozed_until, Some(at(75)));
        let snooze = storage.snooze("ane-1", 1).unwrap().unwrap();
        assert_eq!(snooze.snoozed_until, at(75));
        assert_eq!(storage.history(None, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_second_redemption_rejected_without_reapplying() {
        let (storage, token_id) = setup();
        let handler = AcknowledgementHandler::new();
        handler
            .redeem(&storage, &token_id, TokenAction::Snooze1h, at(15))
            .unwrap();

        let err = handler
            .redeem(&storage, &token_id, TokenAction::Snooze1h, at(30))
            .unwrap_err();
        assert!(err.is_token_rejected());
        assert_eq!(storage.snooze("ane-1", 1).unwrap().unwrap().snoozed_until, at(75));
        assert_eq!(storage.history(None, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_uniform_rejections() {
        let (storage, token_id) = setup();
        let handler = AcknowledgementHandler::new();

        let unknown = handler
            .redeem(&storage, "not-a-token", TokenAction::Snooze1h, at(15))
            .unwrap_err();
        let expired = handler
            .redeem(&storage, &token_id, TokenAction::Snooze1h, at(10) + Duration::hours(25))
            .unwrap_err();
        let mismatched = handler
            .redeem(&storage, &token_id, TokenAction::SnoozeToday, at(15))
            .unwrap_err();

        for err in [unknown, expired, mismatched] {
            assert!(err.is_token_rejected());
            assert_eq!(err.to_string(), crate::error::TOKEN_REJECTED_MESSAGE);
        }
        assert!(storage.snooze("ane-1", 1).unwrap().is_none());
    }

    #[test]
    fn test_revoked_token_rejected() {
        let (storage, token_id) = setup();
        notifications::resolve_episode(storage.connection(), "ane-1", AlertLevel::Red, at(0), at(20))
            .unwrap();

        let err = AcknowledgementHandler::new()
            .redeem(&storage, &token_id, TokenAction::Snooze1h, at(25))
            .unwrap_err();
        assert!(err.is_token_rejected());
    }

    #[test]
    fn test_acknowledge_on_snooze_token() {
        let (storage, token_id) = setup();
        let redemption = AcknowledgementHandler::new()
            .redeem(&storage, &token_id, TokenAction::Acknowledge, at(15))
            .unwrap();

        assert_eq!(redemption.snoozed_until, None);
        assert!(storage.snooze("ane-1", 1).unwrap().is_none());
        let event = notifications::get_event(storage.connection(), redemption.event_id)
            .unwrap()
            .unwrap();
        assert_eq!(event.acknowledged_at, Some(at(15)));
    }

    #[test]
    fn test_redeem_link() {
        let (storage, token_id) = setup();
        let link = token::ack_link("https://wind.example", &token_id, TokenAction::Snooze1h);
        let handler = AcknowledgementHandler::new();

        assert!(handler.redeem_link(&storage, &link, at(15)).is_ok());
        assert!(matches!(
            handler.redeem_link(&storage, "https://wind.example/nope", at(15)),
            Err(Error::InvalidAckLink { .. })
        ));
    }
}
