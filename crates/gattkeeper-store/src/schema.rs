//! Database schema management.

use rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use gattkeeper_types::MacAddr;

use crate::error::Result;

/// Current schema version, recorded in `user_version`.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialise pragmas and the fixed tables.
///
/// Historical-data tables are created lazily per `(mac, char_uuid)` pair;
/// see [`historical_table_name`] and [`ensure_historical_table`].
pub fn init(conn: &Connection) -> Result<()> {
    // WAL keeps readers unblocked while the update path writes.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS devices (
            mac TEXT PRIMARY KEY,
            override_name TEXT,
            last_disconnect_intent INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL DEFAULT 0
        );",
    )?;

    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    debug!("schema initialised at version {SCHEMA_VERSION}");
    Ok(())
}

/// The table backing one `(mac, char_uuid)` pair.
///
/// MAC colons and UUID hyphens are dropped so the name stays a plain
/// identifier: `hist_<12 hex>_<32 hex>`.
pub fn historical_table_name(mac: MacAddr, char_uuid: Uuid) -> String {
    let mut mac_hex = String::with_capacity(12);
    for b in mac.octets() {
        mac_hex.push_str(&format!("{b:02x}"));
    }
    format!("hist_{}_{}", mac_hex, char_uuid.simple())
}

/// Create the pair's table when missing.
pub fn ensure_historical_table(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            epoch_ms INTEGER NOT NULL,
            data BLOB NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_{table}_epoch ON {table} (epoch_ms);"
    ))?;
    Ok(())
}

/// Whether the pair's table exists.
pub fn historical_table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        init(&conn).unwrap();
    }

    #[test]
    fn test_table_name_is_plain_identifier() {
        let mac = MacAddr::new([0xAA, 0xBB, 0xCC, 0x00, 0x01, 0x02]);
        let uuid = Uuid::from_u128(0xF00D);
        let name = historical_table_name(mac, uuid);
        assert!(name.starts_with("hist_aabbcc000102_"));
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }

    #[test]
    fn test_ensure_and_exists() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        let mac = MacAddr::new([1, 2, 3, 4, 5, 6]);
        let table = historical_table_name(mac, Uuid::from_u128(0x1));
        assert!(!historical_table_exists(&conn, &table).unwrap());
        ensure_historical_table(&conn, &table).unwrap();
        assert!(historical_table_exists(&conn, &table).unwrap());
    }
}
