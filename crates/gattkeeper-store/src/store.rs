//! The SQLite store.
//!
//! `Store` persists the three things the core delegates to disk: per-pair
//! historical characteristic data, the intent of each device's last
//! disconnect, and application-assigned device names. It implements the
//! core's [`HistoricalStore`] capability.
//!
//! # Concurrency
//!
//! The connection sits behind a `Mutex`; the core only calls in from a
//! blocking-task executor, so lock hold times are short and never touch
//! the update worker. WAL mode keeps concurrent readers unblocked.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

use gattkeeper_core::{HistoricalCursor, HistoricalDatum, HistoricalResult, HistoricalStore};
use gattkeeper_types::{ChangeIntent, MacAddr};

use crate::error::{Error, Result};
use crate::schema;

/// How many rows a cursor fetches per page.
const CURSOR_PAGE_SIZE: usize = 256;

/// SQLite-backed persistence for gattkeeper.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create a database at the given path, creating parent
    /// directories as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        schema::init(&conn)?;
        info!("opened store at {}", path.display());
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// An in-memory store, for tests and ephemeral use.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init(&conn)?;
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::Poisoned)
    }

    fn now_ms() -> i64 {
        (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
    }

    fn upsert_device(conn: &Connection, mac: MacAddr) -> Result<()> {
        conn.execute(
            "INSERT INTO devices (mac, updated_at) VALUES (?1, ?2)
             ON CONFLICT (mac) DO NOTHING",
            params![mac.to_string(), Self::now_ms()],
        )?;
        Ok(())
    }

    fn add_impl(&self, mac: MacAddr, char_uuid: Uuid, datum: HistoricalDatum) -> Result<()> {
        let conn = self.lock()?;
        let table = schema::historical_table_name(mac, char_uuid);
        schema::ensure_historical_table(&conn, &table)?;
        conn.execute(
            &format!("INSERT INTO {table} (epoch_ms, data) VALUES (?1, ?2)"),
            params![datum.epoch_ms, datum.data],
        )?;
        Ok(())
    }

    fn add_bulk_impl(
        &self,
        mac: MacAddr,
        char_uuid: Uuid,
        data: &mut dyn Iterator<Item = HistoricalDatum>,
    ) -> Result<usize> {
        let mut conn = self.lock()?;
        let table = schema::historical_table_name(mac, char_uuid);
        schema::ensure_historical_table(&conn, &table)?;

        let tx = conn.transaction()?;
        let mut count = 0usize;
        {
            let mut stmt =
                tx.prepare(&format!("INSERT INTO {table} (epoch_ms, data) VALUES (?1, ?2)"))?;
            for datum in data {
                stmt.execute(params![datum.epoch_ms, datum.data])?;
                count += 1;
            }
        }
        tx.commit()?;
        debug!(%mac, %char_uuid, count, "bulk-inserted historical data");
        Ok(count)
    }

    fn count_impl(&self, mac: MacAddr, char_uuid: Uuid) -> Result<usize> {
        let conn = self.lock()?;
        let table = schema::historical_table_name(mac, char_uuid);
        if !schema::historical_table_exists(&conn, &table)? {
            return Ok(0);
        }
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn has_data_impl(&self, mac: MacAddr, char_uuid: Option<Uuid>) -> Result<bool> {
        match char_uuid {
            Some(uuid) => Ok(self.count_impl(mac, uuid)? > 0),
            None => {
                let conn = self.lock()?;
                let mut mac_hex = String::with_capacity(12);
                for b in mac.octets() {
                    mac_hex.push_str(&format!("{b:02x}"));
                }
                let prefix = format!("hist_{mac_hex}_%");
                let tables: Vec<String> = {
                    let mut stmt = conn.prepare(
                        "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE ?1",
                    )?;
                    let rows = stmt.query_map([prefix], |row| row.get::<_, String>(0))?;
                    rows.collect::<std::result::Result<_, _>>()?
                };
                for table in tables {
                    let count: i64 = conn.query_row(
                        &format!("SELECT COUNT(*) FROM {table}"),
                        [],
                        |row| row.get(0),
                    )?;
                    if count > 0 {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    fn clear_impl(&self, mac: MacAddr, char_uuid: Uuid) -> Result<()> {
        let conn = self.lock()?;
        let table = schema::historical_table_name(mac, char_uuid);
        if schema::historical_table_exists(&conn, &table)? {
            conn.execute(&format!("DELETE FROM {table}"), [])?;
        }
        Ok(())
    }

    fn set_intent_impl(&self, mac: MacAddr, intent: ChangeIntent) -> Result<()> {
        let conn = self.lock()?;
        Self::upsert_device(&conn, mac)?;
        conn.execute(
            "UPDATE devices SET last_disconnect_intent = ?1, updated_at = ?2 WHERE mac = ?3",
            params![intent.to_code(), Self::now_ms(), mac.to_string()],
        )?;
        Ok(())
    }

    fn intent_impl(&self, mac: MacAddr) -> Result<Option<ChangeIntent>> {
        let conn = self.lock()?;
        let code: Option<i64> = conn
            .query_row(
                "SELECT last_disconnect_intent FROM devices WHERE mac = ?1",
                [mac.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(code.map(ChangeIntent::from_code))
    }

    fn set_name_impl(&self, mac: MacAddr, name: Option<&str>) -> Result<()> {
        let conn = self.lock()?;
        Self::upsert_device(&conn, mac)?;
        conn.execute(
            "UPDATE devices SET override_name = ?1, updated_at = ?2 WHERE mac = ?3",
            params![name, Self::now_ms(), mac.to_string()],
        )?;
        Ok(())
    }

    fn name_impl(&self, mac: MacAddr) -> Result<Option<String>> {
        let conn = self.lock()?;
        let name: Option<Option<String>> = conn
            .query_row(
                "SELECT override_name FROM devices WHERE mac = ?1",
                [mac.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name.flatten())
    }
}

impl HistoricalStore for Store {
    fn add(&self, mac: MacAddr, char_uuid: Uuid, datum: HistoricalDatum) -> HistoricalResult<()> {
        self.add_impl(mac, char_uuid, datum).map_err(Into::into)
    }

    fn add_bulk(
        &self,
        mac: MacAddr,
        char_uuid: Uuid,
        data: &mut dyn Iterator<Item = HistoricalDatum>,
    ) -> HistoricalResult<usize> {
        self.add_bulk_impl(mac, char_uuid, data).map_err(Into::into)
    }

    fn count(&self, mac: MacAddr, char_uuid: Uuid) -> HistoricalResult<usize> {
        self.count_impl(mac, char_uuid).map_err(Into::into)
    }

    fn has_data(&self, mac: MacAddr, char_uuid: Option<Uuid>) -> HistoricalResult<bool> {
        self.has_data_impl(mac, char_uuid).map_err(Into::into)
    }

    fn cursor(
        &self,
        mac: MacAddr,
        char_uuid: Uuid,
    ) -> HistoricalResult<Box<dyn HistoricalCursor>> {
        Ok(Box::new(SqliteCursor {
            conn: self.conn.clone(),
            table: schema::historical_table_name(mac, char_uuid),
            last_id: 0,
            page: VecDeque::new(),
            current: None,
            exhausted: false,
        }))
    }

    fn clear(&self, mac: MacAddr, char_uuid: Uuid) -> HistoricalResult<()> {
        self.clear_impl(mac, char_uuid).map_err(Into::into)
    }

    fn set_last_disconnect_intent(
        &self,
        mac: MacAddr,
        intent: ChangeIntent,
    ) -> HistoricalResult<()> {
        self.set_intent_impl(mac, intent).map_err(Into::into)
    }

    fn last_disconnect_intent(&self, mac: MacAddr) -> HistoricalResult<Option<ChangeIntent>> {
        self.intent_impl(mac).map_err(Into::into)
    }

    fn set_name_override(&self, mac: MacAddr, name: Option<&str>) -> HistoricalResult<()> {
        self.set_name_impl(mac, name).map_err(Into::into)
    }

    fn name_override(&self, mac: MacAddr) -> HistoricalResult<Option<String>> {
        self.name_impl(mac).map_err(Into::into)
    }

    fn table_name(&self, mac: MacAddr, char_uuid: Uuid) -> String {
        schema::historical_table_name(mac, char_uuid)
    }
}

/// Paged cursor over one pair's table: fetches [`CURSOR_PAGE_SIZE`] rows
/// at a time so arbitrarily large tables never materialise at once.
struct SqliteCursor {
    conn: Arc<Mutex<Connection>>,
    table: String,
    last_id: i64,
    page: VecDeque<(i64, HistoricalDatum)>,
    current: Option<HistoricalDatum>,
    exhausted: bool,
}

impl SqliteCursor {
    fn refill(&mut self) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| Error::Poisoned)?;
        if !schema::historical_table_exists(&conn, &self.table)? {
            self.exhausted = true;
            return Ok(());
        }
        let mut stmt = conn.prepare(&format!(
            "SELECT id, epoch_ms, data FROM {} WHERE id > ?1 ORDER BY id LIMIT ?2",
            self.table
        ))?;
        let rows = stmt.query_map(params![self.last_id, CURSOR_PAGE_SIZE as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                HistoricalDatum {
                    epoch_ms: row.get(1)?,
                    data: row.get(2)?,
                },
            ))
        })?;
        for row in rows {
            self.page.push_back(row?);
        }
        if self.page.is_empty() {
            self.exhausted = true;
        }
        Ok(())
    }
}

impl HistoricalCursor for SqliteCursor {
    fn move_next(&mut self) -> HistoricalResult<bool> {
        if self.page.is_empty() && !self.exhausted {
            self.refill().map_err(gattkeeper_core::HistoricalError::from)?;
        }
        match self.page.pop_front() {
            Some((id, datum)) => {
                self.last_id = id;
                self.current = Some(datum);
                Ok(true)
            }
            None => {
                self.current = None;
                Ok(false)
            }
        }
    }

    fn value(&self) -> Option<&HistoricalDatum> {
        self.current.as_ref()
    }

    fn close(self: Box<Self>) {
        // Connection is shared; dropping the cursor releases its pages.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac() -> MacAddr {
        MacAddr::new([0xAA, 0xBB, 0xCC, 0, 1, 2])
    }

    fn ch() -> Uuid {
        Uuid::from_u128(0xF00D)
    }

    #[test]
    fn test_add_and_count() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.count(mac(), ch()).unwrap(), 0);
        store
            .add(mac(), ch(), HistoricalDatum::new(1_000, vec![1]))
            .unwrap();
        store
            .add(mac(), ch(), HistoricalDatum::new(2_000, vec![2]))
            .unwrap();
        assert_eq!(store.count(mac(), ch()).unwrap(), 2);
        assert!(store.has_data(mac(), Some(ch())).unwrap());
        assert!(store.has_data(mac(), None).unwrap());
        assert!(!store.has_data(mac(), Some(Uuid::from_u128(0xBEEF))).unwrap());
    }

    #[test]
    fn test_bulk_add_consumes_iterator() {
        let store = Store::open_in_memory().unwrap();
        let mut data = (0..1000).map(|i| HistoricalDatum::new(i, vec![i as u8]));
        let written = store.add_bulk(mac(), ch(), &mut data).unwrap();
        assert_eq!(written, 1000);
        assert_eq!(store.count(mac(), ch()).unwrap(), 1000);
    }

    #[test]
    fn test_cursor_traverses_in_order_across_pages() {
        let store = Store::open_in_memory().unwrap();
        let mut data = (0..600).map(|i| HistoricalDatum::new(i, vec![]));
        store.add_bulk(mac(), ch(), &mut data).unwrap();

        let mut cursor = store.cursor(mac(), ch()).unwrap();
        let mut seen = Vec::new();
        while cursor.move_next().unwrap() {
            seen.push(cursor.value().unwrap().epoch_ms);
        }
        assert_eq!(seen.len(), 600);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        cursor.close();
    }

    #[test]
    fn test_cursor_on_missing_table_is_empty() {
        let store = Store::open_in_memory().unwrap();
        let mut cursor = store.cursor(mac(), ch()).unwrap();
        assert!(!cursor.move_next().unwrap());
        assert!(cursor.value().is_none());
    }

    #[test]
    fn test_disconnect_intent_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.last_disconnect_intent(mac()).unwrap(), None);
        store
            .set_last_disconnect_intent(mac(), ChangeIntent::Unintentional)
            .unwrap();
        assert_eq!(
            store.last_disconnect_intent(mac()).unwrap(),
            Some(ChangeIntent::Unintentional)
        );
        store
            .set_last_disconnect_intent(mac(), ChangeIntent::Intentional)
            .unwrap();
        assert_eq!(
            store.last_disconnect_intent(mac()).unwrap(),
            Some(ChangeIntent::Intentional)
        );
    }

    #[test]
    fn test_name_override_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.name_override(mac()).unwrap(), None);
        store.set_name_override(mac(), Some("lab sensor")).unwrap();
        assert_eq!(
            store.name_override(mac()).unwrap(),
            Some("lab sensor".to_string())
        );
        store.set_name_override(mac(), None).unwrap();
        assert_eq!(store.name_override(mac()).unwrap(), None);
    }

    #[test]
    fn test_clear() {
        let store = Store::open_in_memory().unwrap();
        store
            .add(mac(), ch(), HistoricalDatum::new(1, vec![1]))
            .unwrap();
        store.clear(mac(), ch()).unwrap();
        assert_eq!(store.count(mac(), ch()).unwrap(), 0);
    }

    #[test]
    fn test_pairs_are_isolated() {
        let store = Store::open_in_memory().unwrap();
        let other = Uuid::from_u128(0xBEEF);
        store
            .add(mac(), ch(), HistoricalDatum::new(1, vec![1]))
            .unwrap();
        assert_eq!(store.count(mac(), other).unwrap(), 0);
        assert_ne!(
            store.table_name(mac(), ch()),
            store.table_name(mac(), other)
        );
    }
}
