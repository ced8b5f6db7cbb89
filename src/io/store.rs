//! SQLite persistence for device state and the activity log
//!
//! Thread-safe via internal Mutex (SQLite Connection is not Sync).
//! Timestamps are stored as Unix epoch milliseconds.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE logs (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     timestamp_ms INTEGER NOT NULL,
//!     device_mac TEXT NOT NULL,
//!     device_name TEXT NOT NULL,
//!     event TEXT NOT NULL,
//!     direction TEXT,
//!     from_ap TEXT,
//!     to_ap TEXT,
//!     gate_opened INTEGER NOT NULL DEFAULT 0,
//!     message TEXT NOT NULL
//! );
//! CREATE TABLE device_states (
//!     mac TEXT PRIMARY KEY,
//!     current_ap TEXT,
//!     last_seen_ms INTEGER,
//!     is_connected INTEGER NOT NULL DEFAULT 0,
//!     last_gate_trigger_ms INTEGER
//! );
//! ```

use crate::domain::events::LogEntry;
use crate::domain::types::{DeviceState, MacAddress};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

/// Persisted presence of one device, restored when monitoring starts
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredDeviceState {
    pub current_ap: Option<MacAddress>,
    pub last_seen: Option<DateTime<Utc>>,
    pub is_connected: bool,
    pub last_gate_trigger: Option<DateTime<Utc>>,
}

impl StoredDeviceState {
    /// Rebuild a registry entry for `mac`
    pub fn into_device_state(self, mac: MacAddress, name: &str) -> DeviceState {
        let mut state = DeviceState::new(mac, name);
        if self.is_connected {
            state.current_ap = self.current_ap;
        }
        state.last_seen = self.last_seen;
        state.last_gate_trigger = self.last_gate_trigger;
        state
    }
}

/// Durable storage behind the monitor
pub trait PresenceStore: Send + Sync {
    fn load_device_state(&self, mac: &MacAddress) -> Result<Option<StoredDeviceState>>;

    /// Upsert presence fields; leaves `last_gate_trigger` untouched
    fn save_device_state(&self, state: &DeviceState) -> Result<()>;

    fn record_gate_trigger(&self, mac: &MacAddress, at: DateTime<Utc>) -> Result<()>;

    /// Append a log entry, returning its id
    fn append_log(&self, entry: &LogEntry) -> Result<i64>;

    /// Newest first
    fn recent_logs(&self, limit: usize, offset: usize) -> Result<Vec<LogEntry>>;

    fn logs_for_device(&self, mac: &str, limit: usize) -> Result<Vec<LogEntry>>;

    /// Delete entries strictly older than `cutoff`, returning the count removed
    fn delete_logs_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_ms(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::from_timestamp_millis)
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

const LOG_COLUMNS: &str = "id, timestamp_ms, device_mac, device_name, event, direction, \
                           from_ap, to_ap, gate_opened, message";

impl SqliteStore {
    /// Open (or create) a file-based database
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {}", path))?;

        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory database (for testing)
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to create in-memory SQLite database")?;

        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp_ms INTEGER NOT NULL,
                device_mac TEXT NOT NULL,
                device_name TEXT NOT NULL,
                event TEXT NOT NULL,
                direction TEXT,
                from_ap TEXT,
                to_ap TEXT,
                gate_opened INTEGER NOT NULL DEFAULT 0,
                message TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp_ms);
            CREATE INDEX IF NOT EXISTS idx_logs_device_mac ON logs(device_mac);
            CREATE INDEX IF NOT EXISTS idx_logs_event ON logs(event);

            CREATE TABLE IF NOT EXISTS device_states (
                mac TEXT PRIMARY KEY,
                current_ap TEXT,
                last_seen_ms INTEGER,
                is_connected INTEGER NOT NULL DEFAULT 0,
                last_gate_trigger_ms INTEGER
            );",
        )
        .context("Failed to initialize schema")?;

        Ok(())
    }

    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<LogEntry> {
        let timestamp_ms: i64 = row.get(1)?;
        let event: String = row.get(4)?;
        let direction: Option<String> = row.get(5)?;

        Ok(LogEntry {
            id: Some(row.get(0)?),
            timestamp: DateTime::from_timestamp_millis(timestamp_ms)
                .ok_or_else(|| conversion_error(1, format!("bad timestamp {timestamp_ms}")))?,
            device_mac: row.get(2)?,
            device_name: row.get(3)?,
            event: event.parse().map_err(|e| conversion_error(4, e))?,
            direction: direction
                .map(|d| d.parse())
                .transpose()
                .map_err(|e| conversion_error(5, e))?,
            from_ap: row.get(6)?,
            to_ap: row.get(7)?,
            gate_opened: row.get(8)?,
            message: row.get(9)?,
        })
    }
}

impl PresenceStore for SqliteStore {
    fn load_device_state(&self, mac: &MacAddress) -> Result<Option<StoredDeviceState>> {
        let conn = self.conn.lock();
        let state = conn
            .query_row(
                "SELECT current_ap, last_seen_ms, is_connected, last_gate_trigger_ms
                 FROM device_states WHERE mac = ?1",
                [mac.as_str()],
                |row| {
                    let current_ap: Option<String> = row.get(0)?;
                    Ok(StoredDeviceState {
                        current_ap: current_ap
                            .filter(|ap| !ap.is_empty())
                            .map(|ap| MacAddress::new(&ap)),
                        last_seen: from_ms(row.get(1)?),
                        is_connected: row.get(2)?,
                        last_gate_trigger: from_ms(row.get(3)?),
                    })
                },
            )
            .optional()?;

        Ok(state)
    }

    fn save_device_state(&self, state: &DeviceState) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO device_states (mac, current_ap, last_seen_ms, is_connected)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(mac) DO UPDATE SET
                current_ap = excluded.current_ap,
                last_seen_ms = excluded.last_seen_ms,
                is_connected = excluded.is_connected",
            params![
                state.mac.as_str(),
                state.current_ap.as_ref().map(|ap| ap.as_str()),
                state.last_seen.map(to_ms),
                state.is_connected(),
            ],
        )?;

        Ok(())
    }

    fn record_gate_trigger(&self, mac: &MacAddress, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO device_states (mac, last_gate_trigger_ms)
             VALUES (?1, ?2)
             ON CONFLICT(mac) DO UPDATE SET
                last_gate_trigger_ms = MAX(COALESCE(last_gate_trigger_ms, 0), excluded.last_gate_trigger_ms)",
            params![mac.as_str(), to_ms(at)],
        )?;

        Ok(())
    }

    fn append_log(&self, entry: &LogEntry) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO logs (timestamp_ms, device_mac, device_name, event, direction,
                               from_ap, to_ap, gate_opened, message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                to_ms(entry.timestamp),
                entry.device_mac,
                entry.device_name,
                entry.event.as_str(),
                entry.direction.map(|d| d.as_str()),
                entry.from_ap,
                entry.to_ap,
                entry.gate_opened,
                entry.message,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    fn recent_logs(&self, limit: usize, offset: usize) -> Result<Vec<LogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {LOG_COLUMNS} FROM logs
             ORDER BY timestamp_ms DESC, id DESC
             LIMIT ?1 OFFSET ?2"
        ))?;

        let entries = stmt
            .query_map(params![limit as i64, offset as i64], Self::row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    fn logs_for_device(&self, mac: &str, limit: usize) -> Result<Vec<LogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {LOG_COLUMNS} FROM logs
             WHERE device_mac = ?1
             ORDER BY timestamp_ms DESC, id DESC
             LIMIT ?2"
        ))?;

        let entries = stmt
            .query_map(params![mac, limit as i64], Self::row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    fn delete_logs_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM logs WHERE timestamp_ms < ?1", [to_ms(cutoff)])?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Direction, EventKind};
    use chrono::{Duration, TimeZone};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn phone() -> MacAddress {
        MacAddress::new("aa:bb:cc:dd:ee:01")
    }

    #[test]
    fn test_unknown_device_has_no_state() {
        let store = SqliteStore::new_in_memory().unwrap();
        assert_eq!(store.load_device_state(&phone()).unwrap(), None);
    }

    #[test]
    fn test_device_state_upsert_keeps_trigger_time() {
        let store = SqliteStore::new_in_memory().unwrap();
        let mut state = DeviceState::new(phone(), "phone");
        state.current_ap = Some(MacAddress::new("GATE-MAC"));
        state.last_seen = Some(ts(0));

        store.save_device_state(&state).unwrap();
        store.record_gate_trigger(&phone(), ts(1)).unwrap();

        // Disconnect afterwards must not clear the trigger time
        state.current_ap = None;
        state.last_seen = Some(ts(60));
        store.save_device_state(&state).unwrap();

        let stored = store.load_device_state(&phone()).unwrap().unwrap();
        assert!(!stored.is_connected);
        assert_eq!(stored.current_ap, None);
        assert_eq!(stored.last_seen, Some(ts(60)));
        assert_eq!(stored.last_gate_trigger, Some(ts(1)));
    }

    #[test]
    fn test_record_gate_trigger_never_moves_backwards() {
        let store = SqliteStore::new_in_memory().unwrap();
        store.record_gate_trigger(&phone(), ts(100)).unwrap();
        store.record_gate_trigger(&phone(), ts(50)).unwrap();

        let stored = store.load_device_state(&phone()).unwrap().unwrap();
        assert_eq!(stored.last_gate_trigger, Some(ts(100)));
    }

    #[test]
    fn test_stored_state_rebuilds_registry_entry() {
        let stored = StoredDeviceState {
            current_ap: Some(MacAddress::new("GATE-MAC")),
            last_seen: Some(ts(0)),
            is_connected: true,
            last_gate_trigger: Some(ts(-30)),
        };
        let state = stored.into_device_state(phone(), "phone");
        assert_eq!(state.current_ap, Some(MacAddress::new("GATE-MAC")));
        assert_eq!(state.last_gate_trigger, Some(ts(-30)));
        assert_eq!(state.name, "phone");
    }

    #[test]
    fn test_logs_are_newest_first_and_paginated() {
        let store = SqliteStore::new_in_memory().unwrap();
        for i in 0..5 {
            let entry = LogEntry::new(ts(i), &phone(), "phone", EventKind::Connected, "connected")
                .with_direction(Direction::Arriving);
            store.append_log(&entry).unwrap();
        }

        let page = store.recent_logs(2, 0).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].timestamp, ts(4));
        assert_eq!(page[1].timestamp, ts(3));
        assert_eq!(page[0].direction, Some(Direction::Arriving));

        let page = store.recent_logs(10, 3).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[1].timestamp, ts(0));
    }

    #[test]
    fn test_logs_for_device_filters_by_mac() {
        let store = SqliteStore::new_in_memory().unwrap();
        let other = MacAddress::new("aa:bb:cc:dd:ee:02");
        store
            .append_log(&LogEntry::new(ts(0), &phone(), "phone", EventKind::Roamed, "roamed"))
            .unwrap();
        store
            .append_log(&LogEntry::new(ts(1), &other, "watch", EventKind::Disconnected, "gone"))
            .unwrap();

        let logs = store.logs_for_device(phone().as_str(), 10).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].event, EventKind::Roamed);
        assert_eq!(logs[0].direction, None);
    }

    #[test]
    fn test_delete_logs_older_than_cutoff() {
        let store = SqliteStore::new_in_memory().unwrap();
        let now = ts(0);
        for age_days in [40, 31, 29, 1] {
            let entry = LogEntry::new(
                now - Duration::days(age_days),
                &phone(),
                "phone",
                EventKind::Connected,
                "connected",
            );
            store.append_log(&entry).unwrap();
        }

        let deleted = store.delete_logs_older_than(now - Duration::days(30)).unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.recent_logs(10, 0).unwrap().len(), 2);
    }

    #[test]
    fn test_file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gate.db");
        let path = path.to_str().unwrap();

        {
            let store = SqliteStore::new(path).unwrap();
            store.record_gate_trigger(&phone(), ts(5)).unwrap();
        }

        let store = SqliteStore::new(path).unwrap();
        let stored = store.load_device_state(&phone()).unwrap().unwrap();
        assert_eq!(stored.last_gate_trigger, Some(ts(5)));
    }
}
