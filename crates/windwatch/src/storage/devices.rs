//! Devices, thresholds and contacts.
//!
//! These rows are owned by the admin surface. The pipeline only reads them,
//! except for the last-known position refreshed at ingest.

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

use crate::error::{Error, Result};
use crate::ingest::decoder::DeviceDirectory;
use crate::model::{Contact, Device, Position, Thresholds};

use super::Storage;

const DEVICE_COLUMNS: &str = "id, name, metadata, latitude, longitude, active";

/// Look up one device.
///
/// # Errors
///
/// Returns an error if the query fails or the row is unreadable.
pub fn get_device(conn: &Connection, device_id: &str) -> Result<Option<Device>> {
    let row = conn
        .query_row(
            &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1"),
            [device_id],
            raw_device,
        )
        .optional()?;
    row.map(RawDevice::into_device).transpose()
}

/// Fail with [`Error::DeviceNotFound`] unless the device exists.
///
/// # Errors
///
/// Returns [`Error::DeviceNotFound`] or a database error.
pub fn require_device(conn: &Connection, device_id: &str) -> Result<Device> {
    get_device(conn, device_id)?.ok_or_else(|| Error::DeviceNotFound {
        device_id: device_id.to_string(),
    })
}

/// List devices ordered by id.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list_devices(conn: &Connection, active_only: bool) -> Result<Vec<Device>> {
    let sql = if active_only {
        format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE active = 1 ORDER BY id")
    } else {
        format!("SELECT {DEVICE_COLUMNS} FROM devices ORDER BY id")
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], raw_device)?;

    let mut devices = Vec::new();
    for row in rows {
        devices.push(row?.into_device()?);
    }
    Ok(devices)
}

/// Refresh the last known position of a device.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn update_position(conn: &Connection, device_id: &str, position: Position) -> Result<()> {
    conn.execute(
        "UPDATE devices SET latitude = ?1, longitude = ?2 WHERE id = ?3",
        params![position.latitude, position.longitude, device_id],
    )?;
    Ok(())
}

/// Get the thresholds of a device, if any are set.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get_thresholds(conn: &Connection, device_id: &str) -> Result<Option<Thresholds>> {
    let row: Option<(f64, f64)> = conn
        .query_row(
            "SELECT amber, red FROM thresholds WHERE device_id = ?1",
            [device_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    row.map(|(amber, red)| {
        Thresholds::new(amber, red)
            .map_err(|e| Error::corrupt_row("thresholds", format!("{device_id}: {e}")))
    })
    .transpose()
}

/// Contacts watching a device, in insertion order.
///
/// # Errors
///
/// Returns an error if the query fails or a row is unreadable.
pub fn contacts_for_device(conn: &Connection, device_id: &str) -> Result<Vec<Contact>> {
    let mut stmt = conn.prepare(
        "SELECT id, device_id, name, addresses FROM contacts WHERE device_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map([device_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut contacts = Vec::new();
    for row in rows {
        let (id, device_id, name, addresses) = row?;
        let addresses: Vec<String> = serde_json::from_str(&addresses)
            .map_err(|e| Error::corrupt_row("contacts", format!("contact {id}: {e}")))?;
        contacts.push(Contact {
            id,
            device_id,
            name,
            addresses,
        });
    }
    Ok(contacts)
}

struct RawDevice {
    id: String,
    name: Option<String>,
    metadata: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    active: bool,
}

impl RawDevice {
    fn into_device(self) -> Result<Device> {
        let metadata = serde_json::from_str(&self.metadata)
            .map_err(|e| Error::corrupt_row("devices", format!("{}: {e}", self.id)))?;
        let position = match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) => Position::new(lat, lng),
            _ => None,
        };
        Ok(Device {
            id: self.id,
            name: self.name,
            metadata,
            position,
            active: self.active,
        })
    }
}

fn raw_device(row: &Row<'_>) -> rusqlite::Result<RawDevice> {
    Ok(RawDevice {
        id: row.get(0)?,
        name: row.get(1)?,
        metadata: row.get(2)?,
        latitude: row.get(3)?,
        longitude: row.get(4)?,
        active: row.get(5)?,
    })
}

impl Storage {
    /// Register a device, or update the name and metadata of an existing one
    /// and reactivate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn register_device(&self, device: &Device) -> Result<()> {
        let metadata = serde_json::to_string(&device.metadata)?;
        let (latitude, longitude) = device
            .position
            .map_or((None, None), |p| (Some(p.latitude), Some(p.longitude)));

        self.conn.execute(
            "INSERT INTO devices (id, name, metadata, latitude, longitude, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                metadata = excluded.metadata,
                latitude = COALESCE(excluded.latitude, devices.latitude),
                longitude = COALESCE(excluded.longitude, devices.longitude),
                active = excluded.active",
            params![
                device.id,
                device.name,
                metadata,
                latitude,
                longitude,
                device.active
            ],
        )?;

        info!(device_id = %device.id, "Registered device");
        Ok(())
    }

    /// Get a device by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn device(&self, device_id: &str) -> Result<Option<Device>> {
        get_device(&self.conn, device_id)
    }

    /// List registered devices.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn devices(&self, active_only: bool) -> Result<Vec<Device>> {
        list_devices(&self.conn, active_only)
    }

    /// Deactivate a device. Its packets are rejected from now on; history is kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceNotFound`] if the device does not exist.
    pub fn deactivate_device(&self, device_id: &str) -> Result<()> {
        let changed = self
            .conn
            .execute("UPDATE devices SET active = 0 WHERE id = ?1", [device_id])?;
        if changed == 0 {
            return Err(Error::DeviceNotFound {
                device_id: device_id.to_string(),
            });
        }
        info!(device_id, "Deactivated device");
        Ok(())
    }

    /// Set the thresholds of a device. Takes effect on the next evaluation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceNotFound`] if the device does not exist.
    pub fn set_thresholds(&self, device_id: &str, thresholds: Thresholds) -> Result<()> {
        require_device(&self.conn, device_id)?;
        self.conn.execute(
            "INSERT INTO thresholds (device_id, amber, red, updated_at)
             VALUES (?1, ?2, ?3, datetime('now'))
             ON CONFLICT(device_id) DO UPDATE SET
                amber = excluded.amber,
                red = excluded.red,
                updated_at = excluded.updated_at",
            params![device_id, thresholds.amber, thresholds.red],
        )?;
        info!(
            device_id,
            amber = thresholds.amber,
            red = thresholds.red,
            "Updated thresholds"
        );
        Ok(())
    }

    /// Get the thresholds of a device.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn thresholds(&self, device_id: &str) -> Result<Option<Thresholds>> {
        get_thresholds(&self.conn, device_id)
    }

    /// Add a notification contact for a device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceNotFound`] if the device does not exist.
    pub fn add_contact(
        &self,
        device_id: &str,
        name: Option<&str>,
        addresses: &[String],
    ) -> Result<Contact> {
        require_device(&self.conn, device_id)?;
        let encoded = serde_json::to_string(addresses)?;
        self.conn.execute(
            "INSERT INTO contacts (device_id, name, addresses) VALUES (?1, ?2, ?3)",
            params![device_id, name, encoded],
        )?;
        let id = self.conn.last_insert_rowid();

        info!(device_id, contact_id = id, "Added contact");
        Ok(Contact {
            id,
            device_id: device_id.to_string(),
            name: name.map(str::to_string),
            addresses: addresses.to_vec(),
        })
    }

    /// Contacts watching a device.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn contacts(&self, device_id: &str) -> Result<Vec<Contact>> {
        contacts_for_device(&self.conn, device_id)
    }
}

impl DeviceDirectory for Storage {
    fn lookup(&self, device_id: &str) -> Result<Option<Device>> {
        get_device(&self.conn, device_id)
    }
}
