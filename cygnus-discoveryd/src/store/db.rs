use std::path::Path;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, params, OptionalExtension};
use shared::types::{DeviceDescriptor, DeviceRecord, DeviceStatus};

const SELECT_COLUMNS: &str = "SELECT identity_key, name, hostname, ip, port, model,
        firmware_version, device_id, memory_usage, services,
        display_name, status, first_seen, last_seen
 FROM devices";

pub struct DeviceDb {
    conn: Connection,
}

impl DeviceDb {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                identity_key     TEXT PRIMARY KEY,
                name             TEXT NOT NULL,
                hostname         TEXT NOT NULL,
                ip               TEXT,
                port             INTEGER NOT NULL,
                model            TEXT NOT NULL,
                firmware_version TEXT NOT NULL,
                device_id        TEXT NOT NULL,
                memory_usage     TEXT NOT NULL,
                services         TEXT NOT NULL,
                display_name     TEXT,
                status           TEXT NOT NULL DEFAULT 'online',
                first_seen       TEXT NOT NULL,
                last_seen        TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_devices_name ON devices(name);
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    /// Insert or refresh the record for a descriptor's identity key.
    /// Returns true if stored data changed.
    ///
    /// `first_seen` is only written by the insert branch and `display_name`
    /// is never written here.
    pub fn upsert_device(&self, desc: &DeviceDescriptor, now: DateTime<Utc>) -> Result<bool> {
        let identity_key = match desc.identity_key.as_deref() {
            Some(key) if !key.is_empty() => key,
            _ => anyhow::bail!("Device {} has no identity key", desc.name),
        };

        let existing = self.get_device(identity_key)?;
        let changed = match &existing {
            Some(old) => device_data_changed(old, desc),
            None => true,
        };

        let services_json = serde_json::to_string(&desc.services)
            .context("Failed to serialize services")?;
        let first_seen = desc.last_seen.min(now);

        self.conn.execute(
            r#"
            INSERT INTO devices (
                identity_key, name, hostname, ip, port, model, firmware_version,
                device_id, memory_usage, services, status, first_seen, last_seen
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(identity_key) DO UPDATE SET
                name = excluded.name,
                hostname = excluded.hostname,
                ip = excluded.ip,
                port = excluded.port,
                model = excluded.model,
                firmware_version = excluded.firmware_version,
                device_id = excluded.device_id,
                memory_usage = excluded.memory_usage,
                services = excluded.services,
                status = excluded.status,
                last_seen = MAX(devices.last_seen, excluded.last_seen)
            "#,
            params![
                identity_key,
                &desc.name,
                &desc.hostname,
                &desc.ip,
                desc.port,
                &desc.model,
                &desc.firmware_version,
                &desc.device_id,
                &desc.memory_usage,
                &services_json,
                DeviceStatus::Online.as_str(),
                format_ts(first_seen),
                format_ts(desc.last_seen),
            ],
        )
        .with_context(|| format!("Failed to upsert device {}", identity_key))?;

        Ok(changed)
    }

    /// Flip online records not seen since `cutoff` to offline
    pub fn mark_offline(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let count = self.conn.execute(
            "UPDATE devices SET status = ?2 WHERE last_seen < ?1 AND status = ?3",
            params![
                format_ts(cutoff),
                DeviceStatus::Offline.as_str(),
                DeviceStatus::Online.as_str(),
            ],
        )
        .context("Failed to mark offline devices")?;

        Ok(count as u64)
    }

    /// Get all devices, ordered by hostname. Rows that fail to decode are
    /// logged and skipped.
    pub fn get_all_devices(&self) -> Result<Vec<DeviceRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} ORDER BY hostname, identity_key", SELECT_COLUMNS))
            .context("Failed to prepare query")?;

        let rows = stmt
            .query_map([], |row| Self::row_to_record(row))
            .context("Failed to query devices")?;

        let mut devices = Vec::new();
        for row in rows {
            match row {
                Ok(record) => devices.push(record),
                Err(e) => tracing::warn!("Skipping unreadable device row: {}", e),
            }
        }

        Ok(devices)
    }

    pub fn get_device(&self, identity_key: &str) -> Result<Option<DeviceRecord>> {
        let result = self
            .conn
            .query_row(
                &format!("{} WHERE identity_key = ?1", SELECT_COLUMNS),
                params![identity_key],
                |row| Self::row_to_record(row),
            )
            .optional()
            .context("Failed to query device")?;

        Ok(result)
    }

    /// Set the user-assigned name. Returns false if the device is unknown.
    pub fn rename_device(&self, identity_key: &str, display_name: &str) -> Result<bool> {
        let count = self.conn.execute(
            "UPDATE devices SET display_name = ?1 WHERE identity_key = ?2",
            params![display_name, identity_key],
        )
        .context("Failed to rename device")?;

        Ok(count > 0)
    }

    /// Returns false if the device is unknown.
    pub fn delete_device(&self, identity_key: &str) -> Result<bool> {
        let count = self.conn.execute(
            "DELETE FROM devices WHERE identity_key = ?1",
            params![identity_key],
        )
        .context("Failed to delete device")?;

        Ok(count > 0)
    }

    #[cfg(test)]
    pub(crate) fn conn_for_test(&self) -> &Connection {
        &self.conn
    }

    fn row_to_record(row: &rusqlite::Row) -> Result<DeviceRecord, rusqlite::Error> {
        let services_json: String = row.get(9)?;
        let status_str: String = row.get(11)?;
        let first_seen_str: String = row.get(12)?;
        let last_seen_str: String = row.get(13)?;

        let services = serde_json::from_str(&services_json)
            .map_err(|e| conversion_error(9, e))?;

        let status = DeviceStatus::parse(&status_str)
            .ok_or_else(|| conversion_error(11, format!("unknown status {:?}", status_str)))?;

        Ok(DeviceRecord {
            identity_key: row.get(0)?,
            name: row.get(1)?,
            hostname: row.get(2)?,
            ip: row.get(3)?,
            port: row.get::<_, u16>(4)?,
            model: row.get(5)?,
            firmware_version: row.get(6)?,
            device_id: row.get(7)?,
            memory_usage: row.get(8)?,
            services,
            display_name: row.get(10)?,
            status,
            first_seen: parse_ts(12, &first_seen_str)?,
            last_seen: parse_ts(13, &last_seen_str)?,
        })
    }
}

/// Fixed-width UTC timestamps so SQL string comparison orders them correctly
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(column: usize, value: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| conversion_error(column, e))
}

fn conversion_error(
    column: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, err.into())
}

fn device_data_changed(old: &DeviceRecord, new: &DeviceDescriptor) -> bool {
    old.name != new.name
        || old.hostname != new.hostname
        || old.ip != new.ip
        || old.port != new.port
        || old.model != new.model
        || old.firmware_version != new.firmware_version
        || old.device_id != new.device_id
        || old.memory_usage != new.memory_usage
        || old.services != new.services
        || old.status != DeviceStatus::Online
}
