//! Storage layer for windwatch.
//!
//! `SQLite` is the persistence collaborator for every entity in the pipeline.
//! [`Storage`] owns one connection and exposes the admin-facing reads and
//! writes as methods; the pipeline stages work through the row-level
//! functions in the submodules, inside [`Storage::transaction`], so that each
//! retry unit commits or rolls back as a whole.

pub mod aggregates;
pub mod alert_state;
pub mod devices;
pub mod maintenance;
pub mod migrations;
pub mod notifications;
pub mod readings;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// A storage handle shared between tasks of the daemon.
pub type SharedStorage = Arc<Mutex<Storage>>;

/// Storage engine for the telemetry pipeline.
#[derive(Debug)]
pub struct Storage {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Connection,
}

impl Storage {
    /// Open or create a storage database at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist
    /// and brings the schema up to date.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_timeout(path, Duration::from_secs(5))
    }

    /// Open a storage database, waiting up to `busy_timeout` on locks held by
    /// other connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open_with_timeout(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening database at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        // WAL lets the ingest writer, aggregation workers and delivery loop
        // each hold their own connection.
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;
        conn.busy_timeout(busy_timeout)?;

        migrations::initialize_schema(&conn)?;

        info!("Database opened at {}", path.display());
        Ok(Self { path, conn })
    }

    /// Create an in-memory storage instance for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        migrations::initialize_schema(&conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn,
        })
    }

    /// Wrap this storage for sharing between tasks.
    #[must_use]
    pub fn into_shared(self) -> SharedStorage {
        Arc::new(Mutex::new(self))
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Borrow the underlying connection for row-level reads.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` inside an IMMEDIATE transaction.
    ///
    /// The write lock is taken up front, so concurrent read-check-write
    /// sequences on other connections serialize behind it. Any error returned
    /// by `f` rolls the whole transaction back.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`, or a database error from begin/commit.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Get database statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn stats(&self) -> Result<StorageStats> {
        let count = |sql: &str| -> Result<i64> {
            Ok(self.conn.query_row(sql, [], |row| row.get(0))?)
        };

        let db_size_bytes = if self.path.to_string_lossy() == ":memory:" {
            0
        } else {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        };

        Ok(StorageStats {
            active_devices: count("SELECT COUNT(*) FROM devices WHERE active = 1")?,
            pending_readings: count("SELECT COUNT(*) FROM readings WHERE processed = 0")?,
            aggregates: count("SELECT COUNT(*) FROM interval_aggregates")?,
            open_downtime_windows: count("SELECT COUNT(*) FROM downtime_windows")?,
            undelivered_notifications: count(
                "SELECT COUNT(*) FROM notification_events WHERE delivery_status IN ('pending', 'failed')",
            )?,
            abandoned_notifications: count(
                "SELECT COUNT(*) FROM notification_events WHERE delivery_status = 'abandoned'",
            )?,
            escalated_failures: count(
                "SELECT COUNT(*) FROM aggregation_failures WHERE escalated = 1",
            )?,
            data_loss_events: count("SELECT COUNT(*) FROM data_loss_events")?,
            db_size_bytes,
        })
    }
}

/// Statistics about the storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    /// Devices accepting packets.
    pub active_devices: i64,
    /// Readings waiting for aggregation.
    pub pending_readings: i64,
    /// Aggregates in the historical ledger.
    pub aggregates: i64,
    /// Devices currently in a downtime window.
    pub open_downtime_windows: i64,
    /// Notifications not yet handed to the delivery collaborator.
    pub undelivered_notifications: i64,
    /// Notifications that exhausted their delivery attempts.
    pub abandoned_notifications: i64,
    /// Buckets that raised an operational alert.
    pub escalated_failures: i64,
    /// Forced prunes of unaggregated readings.
    pub data_loss_events: i64,
    /// Size of the database file in bytes.
    pub db_size_bytes: u64,
}

/// Lock a shared storage handle.
///
/// # Errors
///
/// Returns an internal error if a previous holder panicked.
pub fn lock(storage: &SharedStorage) -> Result<MutexGuard<'_, Storage>> {
    storage
        .lock()
        .map_err(|_| Error::internal("storage mutex poisoned"))
}

/// Convert an instant to the stored millisecond representation.
#[must_use]
pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Convert a stored millisecond value back to an instant.
#[must_use]
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_storage() -> Storage {
        Storage::open_in_memory().expect("failed to create test storage")
    }

    #[test]
    fn test_open_in_memory() {
        let storage = create_test_storage();
        assert_eq!(storage.path().to_string_lossy(), ":memory:");
    }

    #[test]
    fn test_stats_empty() {
        let stats = create_test_storage().stats().unwrap();

        assert_eq!(stats.active_devices, 0);
        assert_eq!(stats.pending_readings, 0);
        assert_eq!(stats.aggregates, 0);
        assert_eq!(stats.db_size_bytes, 0);
    }

    #[test]
    fn test_transaction_commits() {
        let storage = create_test_storage();
        storage
            .transaction(|conn| {
                conn.execute("INSERT INTO metadata (key, value) VALUES ('k', 'v')", [])?;
                Ok(())
            })
            .unwrap();

        let value: String = storage
            .connection()
            .query_row("SELECT value FROM metadata WHERE key = 'k'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(value, "v");
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let storage = create_test_storage();
        let result: Result<()> = storage.transaction(|conn| {
            conn.execute("INSERT INTO metadata (key, value) VALUES ('k', 'v')", [])?;
            Err(Error::internal("boom"))
        });
        assert!(result.is_err());

        let count: i64 = storage
            .connection()
            .query_row("SELECT COUNT(*) FROM metadata WHERE key = 'k'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_millis_round_trip() {
        let ts = DateTime::parse_from_rfc3339("2024-03-01T12:34:56.789Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(from_millis(to_millis(ts)), ts);
    }

    #[test]
    fn test_open_file_based_creates_parent_dirs() {
        let dir = std::env::temp_dir().join(format!("windwatch_test_{}", std::process::id()));
        let db_path = dir.join("nested").join("windwatch.db");
        let _ = std::fs::remove_dir_all(&dir);

        let storage = Storage::open(&db_path).unwrap();
        assert_eq!(storage.path(), db_path);
        assert!(db_path.exists());
        assert!(storage.stats().unwrap().db_size_bytes > 0);

        drop(storage);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_shared_lock() {
        let shared = create_test_storage().into_shared();
        let guard = lock(&shared).unwrap();
        assert_eq!(guard.stats().unwrap().aggregates, 0);
    }
}
