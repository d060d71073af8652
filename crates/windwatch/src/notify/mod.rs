//! Notification dispatch.
//!
//! The dispatcher runs inside the aggregation transaction. It decides, per
//! contact, whether an evaluation warrants a notification; if so it writes
//! the event, mints the action tokens and stores the outbound message on the
//! event for [`delivery`] to pick up after commit.
//!
//! Dedup rule for a contact and an elevated level `L`:
//!
//! - an active snooze suppresses;
//! - otherwise notify if no event at `L` or above exists in the current
//!   `L` episode;
//! - otherwise notify again only if a snooze written after that event has
//!   since expired.

pub mod delivery;
pub mod token;

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::alert::AlertLevel;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{Contact, Device, IntervalAggregate};
use crate::storage::alert_state::DeviceAlertState;
use crate::storage::devices;
use crate::storage::notifications::{self, NewEvent, TokenRecord};

pub use delivery::{DeliveryChannel, DeliveryError, LogDelivery, OutboundMessage, RecordingDelivery};
pub use token::TokenAction;

/// Template name for a level.
#[must_use]
pub fn template_for(level: AlertLevel) -> &'static str {
    match level {
        AlertLevel::Red => "wind_alert_red",
        AlertLevel::Amber | AlertLevel::Normal => "wind_alert_amber",
    }
}

/// Per-contact decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Send a notification.
    Notify,
    /// An active snooze suppresses it.
    Snoozed,
    /// The episode was already notified.
    AlreadyNotified,
}

/// What one evaluation produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Events written, one per notified contact.
    pub events: Vec<i64>,
    /// Contacts suppressed by a snooze.
    pub snoozed: usize,
    /// Contacts already notified in this episode.
    pub deduplicated: usize,
    /// Unused tokens revoked because an episode ended.
    pub tokens_revoked: usize,
}

/// Decides on and records notifications.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    ack_base_url: String,
    token_expiry: Duration,
    token_actions: Vec<TokenAction>,
}

impl Dispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub fn new(
        ack_base_url: impl Into<String>,
        token_expiry: Duration,
        token_actions: Vec<TokenAction>,
    ) -> Self {
        Self {
            ack_base_url: ack_base_url.into(),
            token_expiry,
            token_actions,
        }
    }

    /// Create a dispatcher from the notification settings.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.notifications.ack_base_url.clone(),
            config.token_expiry(),
            config.notifications.token_actions.clone(),
        )
    }

    /// React to one evaluated bucket.
    ///
    /// `previous` is the state before the bucket, `current` after it. Ended
    /// episodes are resolved first; then, unless the level went down, each
    /// contact is considered for a notification.
    ///
    /// # Errors
    ///
    /// Returns an error if a database operation fails.
    pub fn on_evaluation(
        &self,
        conn: &Connection,
        device: &Device,
        previous: Option<&DeviceAlertState>,
        current: &DeviceAlertState,
        aggregate: &IntervalAggregate,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        let mut outcome = DispatchOutcome::default();

        if let Some(previous) = previous {
            for level in [AlertLevel::Red, AlertLevel::Amber] {
                let Some(started) = previous.episode_start(level) else {
                    continue;
                };
                if current.episode_start(level) == Some(started) {
                    continue;
                }
                let revoked =
                    notifications::resolve_episode(conn, &device.id, level, started, now)?;
                info!(
                    device_id = %device.id,
                    level = %level,
                    episode_started_at = %started,
                    tokens_revoked = revoked,
                    "Alert episode ended"
                );
                outcome.tokens_revoked += revoked;
            }
        }

        let level = current.level;
        // a downgrade inside a running episode of the lower level is not news
        let went_down = previous.is_some_and(|p| {
            level < p.level && current.episode_start(level) == p.episode_start(level)
        });
        if !level.is_elevated() || went_down {
            return Ok(outcome);
        }
        let episode = current.episode_start(level).ok_or_else(|| {
            Error::internal(format!("{} is {level} without an episode start", device.id))
        })?;

        for contact in devices::contacts_for_device(conn, &device.id)? {
            match decide(conn, &device.id, contact.id, level, episode, now)? {
                Decision::Notify => {
                    let event_id =
                        self.notify(conn, device, &contact, level, episode, aggregate, now)?;
                    outcome.events.push(event_id);
                }
                Decision::Snoozed => {
                    debug!(device_id = %device.id, contact_id = contact.id, "Notification snoozed");
                    outcome.snoozed += 1;
                }
                Decision::AlreadyNotified => outcome.deduplicated += 1,
            }
        }
        Ok(outcome)
    }

    /// Write the event, its tokens and its outbound message.
    #[allow(clippy::too_many_arguments)]
    fn notify(
        &self,
        conn: &Connection,
        device: &Device,
        contact: &Contact,
        level: AlertLevel,
        episode: DateTime<Utc>,
        aggregate: &IntervalAggregate,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let event_id = notifications::insert_event(
            conn,
            &NewEvent {
                device_id: &device.id,
                contact_id: contact.id,
                level,
                episode_started_at: episode,
                interval_start: aggregate.interval_start,
                created_at: now,
            },
        )?;

        let mut links = Vec::with_capacity(self.token_actions.len());
        for action in &self.token_actions {
            let minted = token::mint();
            notifications::insert_token(
                conn,
                &TokenRecord {
                    token_hash: minted.hash,
                    event_id,
                    device_id: device.id.clone(),
                    contact_id: contact.id,
                    action: *action,
                    created_at: now,
                    expires_at: now + self.token_expiry,
                    used_at: None,
                    revoked_at: None,
                },
            )?;
            links.push(json!({
                "action": action.as_str(),
                "url": token::ack_link(&self.ack_base_url, &minted.id, *action),
            }));
        }

        let message = OutboundMessage {
            recipients: contact.addresses.clone(),
            template: template_for(level).to_string(),
            variables: message_variables(device, contact, level, episode, aggregate, links),
        };
        notifications::set_payload(conn, event_id, &serde_json::to_string(&message)?)?;

        info!(
            device_id = %device.id,
            contact_id = contact.id,
            level = %level,
            event_id,
            "Queued notification"
        );
        Ok(event_id)
    }
}

/// Apply the dedup rule for one contact.
///
/// # Errors
///
/// Returns an error if a database operation fails.
pub fn decide(
    conn: &Connection,
    device_id: &str,
    contact_id: i64,
    level: AlertLevel,
    episode: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Decision> {
    let snooze = notifications::get_snooze(conn, device_id, contact_id)?;
    if snooze.as_ref().is_some_and(|s| s.is_active(now)) {
        return Ok(Decision::Snoozed);
    }

    let Some(last) = notifications::latest_event_since(conn, device_id, contact_id, level, episode)?
    else {
        return Ok(Decision::Notify);
    };

    let snooze_lapsed = snooze.is_some_and(|s| s.snoozed_until > last.created_at);
    Ok(if snooze_lapsed {
        Decision::Notify
    } else {
        Decision::AlreadyNotified
    })
}

fn message_variables(
    device: &Device,
    contact: &Contact,
    level: AlertLevel,
    episode: DateTime<Utc>,
    aggregate: &IntervalAggregate,
    links: Vec<Value>,
) -> Map<String, Value> {
    let mut variables = Map::new();
    variables.insert("device_id".into(), json!(device.id));
    variables.insert("device_name".into(), json!(device.display_name()));
    variables.insert("contact_name".into(), json!(contact.name));
    variables.insert("level".into(), json!(level.as_str()));
    variables.insert("avg_wind_speed".into(), json!(aggregate.avg_speed));
    variables.insert("max_wind_speed".into(), json!(aggregate.max_speed));
    variables.insert("interval_start".into(), json!(aggregate.interval_start.to_rfc3339()));
    variables.insert("interval_end".into(), json!(aggregate.interval_end.to_rfc3339()));
    variables.insert("episode_started_at".into(), json!(episode.to_rfc3339()));
    if let Some(position) = device.position {
        variables.insert("position".into(), json!(position.to_string()));
    }
    variables.insert("links".into(), Value::Array(links));
    variables
}
