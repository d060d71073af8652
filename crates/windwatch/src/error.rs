//! Error types for windwatch.
//!
//! This module defines the crate-wide error type. Ingest rejections and
//! delivery failures have their own enums (`IngestError`, `DeliveryError`)
//! because callers branch on them; both convert into [`Error`].

use std::path::PathBuf;
use thiserror::Error;

use crate::ingest::IngestError;
use crate::notify::DeliveryError;

/// The message shown for every rejected acknowledgement link.
///
/// Deliberately identical for unknown, used, revoked and expired tokens.
pub const TOKEN_REJECTED_MESSAGE: &str = "this link is invalid or has expired";

/// The main error type for windwatch operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Storage Errors ===
    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    /// A stored value could not be interpreted.
    #[error("corrupt row in {table}: {message}")]
    CorruptRow {
        /// Table the row came from.
        table: &'static str,
        /// Description of the problem.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Device Errors ===
    /// The referenced device does not exist.
    #[error("device not found: {device_id}")]
    DeviceNotFound {
        /// The device id that was looked up.
        device_id: String,
    },

    /// Amber/red thresholds are not usable.
    #[error("invalid thresholds: amber {amber} m/s, red {red} m/s")]
    InvalidThresholds {
        /// Amber threshold in m/s.
        amber: f64,
        /// Red threshold in m/s.
        red: f64,
    },

    // === Pipeline Errors ===
    /// A packet was rejected at ingest.
    #[error(transparent)]
    Ingest(#[from] IngestError),

    /// Another aggregation pass holds the device.
    #[error("aggregation already in progress for device {device_id}")]
    AggregationInProgress {
        /// The claimed device.
        device_id: String,
    },

    /// An acknowledgement token was not redeemable.
    #[error("{}", TOKEN_REJECTED_MESSAGE)]
    TokenRejected,

    /// An acknowledgement link could not be parsed.
    #[error("invalid acknowledgement link: {message}")]
    InvalidAckLink {
        /// Description of the problem.
        message: String,
    },

    /// Handing a message to the delivery collaborator failed.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for windwatch operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a corrupt-row error.
    #[must_use]
    pub fn corrupt_row(table: &'static str, message: impl Into<String>) -> Self {
        Self::CorruptRow {
            table,
            message: message.into(),
        }
    }

    /// Create an invalid acknowledgement link error.
    #[must_use]
    pub fn invalid_ack_link(message: impl Into<String>) -> Self {
        Self::InvalidAckLink {
            message: message.into(),
        }
    }

    /// Check if this error is the uniform token rejection.
    #[must_use]
    pub fn is_token_rejected(&self) -> bool {
        matches!(self, Self::TokenRejected)
    }

    /// Check if this error is a per-packet ingest rejection.
    #[must_use]
    pub fn is_ingest_rejection(&self) -> bool {
        matches!(self, Self::Ingest(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_rejected_is_uniform() {
        let err = Error::TokenRejected;
        assert_eq!(err.to_string(), TOKEN_REJECTED_MESSAGE);
        assert!(err.is_token_rejected());
        assert!(!Error::internal("x").is_token_rejected());
    }

    #[test]
    fn test_internal_error() {
        let err = Error::internal("something went wrong");
        assert_eq!(err.to_string(), "internal error: something went wrong");
    }

    #[test]
    fn test_ingest_error_is_transparent() {
        let err: Error = IngestError::UnknownDevice {
            device_id: "ane-9".to_string(),
        }
        .into();
        assert!(err.is_ingest_rejection());
        assert!(err.to_string().contains("ane-9"));
    }

    #[test]
    fn test_device_not_found_display() {
        let err = Error::DeviceNotFound {
            device_id: "ane-1".to_string(),
        };
        assert_eq!(err.to_string(), "device not found: ane-1");
    }

    #[test]
    fn test_invalid_thresholds_display() {
        let err = Error::InvalidThresholds {
            amber: 30.0,
            red: 20.0,
        };
        let msg = err.to_string();
        assert!(msg.contains("amber 30"));
        assert!(msg.contains("red 20"));
    }

    #[test]
    fn test_corrupt_row_display() {
        let err = Error::corrupt_row("readings", "bad level 'purple'");
        let msg = err.to_string();
        assert!(msg.contains("readings"));
        assert!(msg.contains("purple"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_rusqlite_error() {
        let result = rusqlite::Connection::open_with_flags(
            "/nonexistent/path/db.sqlite",
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        );
        if let Err(sqlite_err) = result {
            let err: Error = sqlite_err.into();
            assert!(matches!(err, Error::DatabaseQuery(_)));
        }
    }

    #[test]
    fn test_from_json_error() {
        let json_result: std::result::Result<i32, serde_json::Error> =
            serde_json::from_str("not valid json");
        if let Err(json_err) = json_result {
            let err: Error = json_err.into();
            assert!(matches!(err, Error::Json(_)));
        }
    }

    #[test]
    fn test_aggregation_in_progress_display() {
        let err = Error::AggregationInProgress {
            device_id: "ane-3".to_string(),
        };
        assert!(err.to_string().contains("ane-3"));
    }

    #[test]
    fn test_config_validation_error_display() {
        let err = Error::ConfigValidation {
            message: "bucket_minutes must be greater than 0".to_string(),
        };
        assert!(err.to_string().contains("bucket_minutes"));
    }
}
