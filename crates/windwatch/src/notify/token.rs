//! Action tokens and acknowledgement links.
//!
//! A token id is a random UUIDv4 that only ever leaves the process inside a
//! link. Storage keeps its BLAKE3 hash, so a database dump cannot be used to
//! forge a redemption.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Days, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// `/ack/{tokenId}?...action={action}...`
static ACK_LINK_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/ack/([0-9A-Za-z-]+)\?(?:[^#]*&)?action=([a-z0-9_]+)")
        .expect("ack link pattern is valid")
});

/// What a contact can do with a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenAction {
    /// Mark the notification seen. Writes no snooze.
    #[serde(rename = "acknowledge")]
    Acknowledge,
    /// Suppress notifications for an hour.
    #[serde(rename = "snooze_1h")]
    Snooze1h,
    /// Suppress notifications until the next UTC midnight.
    #[serde(rename = "snooze_today")]
    SnoozeToday,
}

impl TokenAction {
    /// All actions.
    pub const ALL: [TokenAction; 3] = [Self::Acknowledge, Self::Snooze1h, Self::SnoozeToday];

    /// Name used in links and storage.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acknowledge => "acknowledge",
            Self::Snooze1h => "snooze_1h",
            Self::SnoozeToday => "snooze_today",
        }
    }

    /// When a snooze set by this action at `now` ends. `None` for actions
    /// that do not snooze.
    #[must_use]
    pub fn snooze_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Acknowledge => None,
            Self::Snooze1h => Some(now + Duration::hours(1)),
            Self::SnoozeToday => now
                .date_naive()
                .checked_add_days(Days::new(1))
                .and_then(|day| day.and_hms_opt(0, 0, 0))
                .map(|midnight| midnight.and_utc()),
        }
    }
}

impl fmt::Display for TokenAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| format!("unknown action '{s}'"))
    }
}

/// A freshly minted token. The id is returned once and never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintedToken {
    /// The token id, embedded in the link.
    pub id: String,
    /// Hash of the id, stored as the key.
    pub hash: String,
}

/// Mint a new random token.
#[must_use]
pub fn mint() -> MintedToken {
    let id = Uuid::new_v4().to_string();
    let hash = hash_token(&id);
    MintedToken { id, hash }
}

/// Hash a token id for storage lookup.
#[must_use]
pub fn hash_token(token_id: &str) -> String {
    blake3::hash(token_id.as_bytes()).to_hex().to_string()
}

/// Build the acknowledgement link for a token.
#[must_use]
pub fn ack_link(base_url: &str, token_id: &str, action: TokenAction) -> String {
    format!(
        "{}/ack/{token_id}?action={action}",
        base_url.trim_end_matches('/')
    )
}

/// Extract the token id and action from an acknowledgement link.
///
/// Accepts a full URL or just the `/ack/...` path.
///
/// # Errors
///
/// Returns [`Error::InvalidAckLink`] if the link has the wrong shape or names
/// an unknown action.
pub fn parse_ack_link(link: &str) -> Result<(String, TokenAction)> {
    let caps = ACK_LINK_PATTERN
        .captures(link.trim())
        .ok_or_else(|| Error::invalid_ack_link("expected /ack/{token}?action={action}"))?;
    let action = caps[2].parse().map_err(Error::invalid_ack_link)?;
    Ok((caps[1].to_string(), action))
}
