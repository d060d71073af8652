//! Hand-off to the delivery collaborator.
//!
//! Events are written to the outbox inside the aggregation transaction; this
//! module drains it after commit. Each event is its own retry unit: a failure
//! marks that event `failed` and leaves the rest of the batch alone.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::storage::notifications::{self, DeliveryStatus};
use crate::storage::{self, SharedStorage, Storage};

/// Failure reported by a delivery channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The channel refused the message; retrying will not help.
    #[error("delivery rejected: {message}")]
    Rejected {
        /// Reason given by the channel.
        message: String,
    },

    /// The channel is unreachable right now.
    #[error("delivery channel unavailable: {message}")]
    Unavailable {
        /// Reason given by the channel.
        message: String,
    },
}

/// A message for the delivery collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Delivery addresses.
    pub recipients: Vec<String>,
    /// Template name, e.g. `wind_alert_red`.
    pub template: String,
    /// Template variables.
    pub variables: serde_json::Map<String, serde_json::Value>,
}

/// The outbound delivery seam.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Deliver one message.
    async fn send(&self, message: &OutboundMessage) -> std::result::Result<(), DeliveryError>;
}

/// Channel that writes messages to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDelivery;

#[async_trait]
impl DeliveryChannel for LogDelivery {
    async fn send(&self, message: &OutboundMessage) -> std::result::Result<(), DeliveryError> {
        info!(
            template = %message.template,
            recipients = ?message.recipients,
            variables = %serde_json::Value::Object(message.variables.clone()),
            "Notification"
        );
        Ok(())
    }
}

/// Channel that keeps messages in memory and can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingDelivery {
    sent: Mutex<Vec<OutboundMessage>>,
    failing: Mutex<Option<DeliveryError>>,
}

impl RecordingDelivery {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every send with `error` until cleared with `None`.
    pub fn fail_with(&self, error: Option<DeliveryError>) {
        *self.failing.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = error;
    }

    /// Messages delivered so far.
    #[must_use]
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl DeliveryChannel for RecordingDelivery {
    async fn send(&self, message: &OutboundMessage) -> std::result::Result<(), DeliveryError> {
        let failing = self
            .failing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(error) = failing {
            return Err(error);
        }
        self.sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(message.clone());
        Ok(())
    }
}

/// An outbox entry ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingDelivery {
    /// Event id.
    pub event_id: i64,
    /// Message to send.
    pub message: OutboundMessage,
}

/// Outcome counts of one outbox drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Accepted by the channel.
    pub delivered: usize,
    /// Failed, will be retried.
    pub failed: usize,
    /// Failed for the last time.
    pub abandoned: usize,
}

/// Load up to `limit` undelivered events.
///
/// An event whose stored payload no longer parses is abandoned on the spot.
///
/// # Errors
///
/// Returns an error if the database operation fails.
pub fn load_outbox(storage: &Storage, limit: usize) -> Result<Vec<PendingDelivery>> {
    let conn = storage.connection();
    let mut pending = Vec::new();

    for event in notifications::undelivered_events(conn, limit)? {
        let Some(payload) = event.payload.as_deref() else {
            continue;
        };
        match serde_json::from_str::<OutboundMessage>(payload) {
            Ok(message) => pending.push(PendingDelivery {
                event_id: event.id,
                message,
            }),
            Err(e) => {
                error!(event_id = event.id, error = %e, "Unreadable notification payload");
                notifications::record_delivery_failure(conn, event.id, &e.to_string(), 0)?;
            }
        }
    }
    Ok(pending)
}

/// Record the result of one delivery attempt.
///
/// # Errors
///
/// Returns an error if the database operation fails.
pub fn record_outcome(
    storage: &Storage,
    event_id: i64,
    outcome: &std::result::Result<(), DeliveryError>,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> Result<DeliveryStatus> {
    let conn = storage.connection();
    match outcome {
        Ok(()) => {
            notifications::record_delivered(conn, event_id, now)?;
            debug!(event_id, "Delivered notification");
            Ok(DeliveryStatus::Delivered)
        }
        Err(e) => {
            // a rejection will not succeed on retry
            let max_attempts = match e {
                DeliveryError::Rejected { .. } => 0,
                DeliveryError::Unavailable { .. } => max_attempts,
            };
            let status =
                notifications::record_delivery_failure(conn, event_id, &e.to_string(), max_attempts)?;
            if status == DeliveryStatus::Abandoned {
                error!(event_id, error = %e, "Abandoned notification delivery");
            } else {
                warn!(event_id, error = %e, "Notification delivery failed, will retry");
            }
            Ok(status)
        }
    }
}

/// Drain the outbox once through `channel`.
///
/// The storage lock is only held between sends, never across one.
///
/// # Errors
///
/// Returns an error if the database operation fails. Channel failures are
/// recorded on the events, not returned.
pub async fn deliver_pending(
    storage: &SharedStorage,
    channel: &dyn DeliveryChannel,
    max_attempts: u32,
    limit: usize,
) -> Result<DeliveryReport> {
    let pending = {
        let guard = storage::lock(storage)?;
        load_outbox(&guard, limit)?
    };

    let mut report = DeliveryReport::default();
    for item in pending {
        let outcome = channel.send(&item.message).await;
        let status = {
            let guard = storage::lock(storage)?;
            record_outcome(&guard, item.event_id, &outcome, max_attempts, Utc::now())?
        };
        match status {
            DeliveryStatus::Delivered => report.delivered += 1,
            DeliveryStatus::Abandoned => report.abandoned += 1,
            DeliveryStatus::Failed | DeliveryStatus::Pending => report.failed += 1,
        }
    }

    if report != DeliveryReport::default() {
        info!(
            delivered = report.delivered,
            failed = report.failed,
            abandoned = report.abandoned,
            "Delivery pass complete"
        );
    }
    Ok(report)
}
