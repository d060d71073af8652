//! `windwatch` - Wind-speed telemetry aggregation and safety alerting
//!
//! This library buffers anemometer readings, folds them into fixed-width
//! interval aggregates, tracks time spent at red level, and notifies the
//! contacts of a device when wind crosses its amber or red threshold.
//! Contacts answer through single-use action tokens that snooze further
//! notifications.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod ack;
pub mod aggregate;
pub mod alert;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod downtime;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod notify;
pub mod retention;
pub mod storage;

pub use ack::{AcknowledgementHandler, Redemption};
pub use aggregate::{Aggregator, PassReport};
pub use alert::AlertLevel;
pub use config::Config;
pub use daemon::{Daemon, IngestSource};
pub use error::{Error, Result};
pub use ingest::{IngestCounts, Ingestor};
pub use logging::init_logging;
pub use model::{Contact, Device, IntervalAggregate, Position, Reading, Thresholds};
pub use notify::{DeliveryChannel, Dispatcher, TokenAction};
pub use storage::{Storage, StorageStats};
