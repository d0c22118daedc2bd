//! The historical-data persistence capability.
//!
//! The core does not persist anything itself: a [`HistoricalStore`]
//! implementation (see the `gattkeeper-store` crate) is plugged into the
//! manager. The trait is synchronous; the core always calls it from a
//! blocking-task executor, never from the update worker.
//!
//! Bulk traversal goes through a [`HistoricalCursor`] so large data sets
//! are never materialised in one allocation; bulk insertion accepts an
//! iterator for the same reason.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use gattkeeper_types::{ChangeIntent, MacAddr};

/// One historical value of one characteristic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalDatum {
    /// Capture time, milliseconds since the Unix epoch.
    pub epoch_ms: i64,
    /// The raw characteristic value.
    pub data: Vec<u8>,
}

impl HistoricalDatum {
    pub fn new(epoch_ms: i64, data: Vec<u8>) -> Self {
        HistoricalDatum { epoch_ms, data }
    }
}

/// Failure in the historical store.
#[derive(Debug, Error)]
#[error("historical store: {0}")]
pub struct HistoricalError(pub String);

/// Result alias for store operations.
pub type HistoricalResult<T> = std::result::Result<T, HistoricalError>;

/// Forward-only traversal over stored data for one `(device, char)` pair.
pub trait HistoricalCursor: Send {
    /// Advance to the next entry. Returns false when exhausted.
    fn move_next(&mut self) -> HistoricalResult<bool>;

    /// The entry the cursor is positioned on, after a successful
    /// [`move_next`](Self::move_next).
    fn value(&self) -> Option<&HistoricalDatum>;

    /// Release underlying resources. Dropping the cursor must have the
    /// same effect.
    fn close(self: Box<Self>);
}

/// Persistence for historical characteristic data and the per-device disk
/// flags.
///
/// Keys are `(mac, char_uuid)`; the store decides the physical layout and
/// exposes it through [`table_name`](Self::table_name) for diagnostics.
pub trait HistoricalStore: Send + Sync + 'static {
    /// Append one entry.
    fn add(&self, mac: MacAddr, char_uuid: Uuid, datum: HistoricalDatum) -> HistoricalResult<()>;

    /// Append many entries; implementations batch these in one write
    /// transaction. Returns the number of entries written.
    fn add_bulk(
        &self,
        mac: MacAddr,
        char_uuid: Uuid,
        data: &mut dyn Iterator<Item = HistoricalDatum>,
    ) -> HistoricalResult<usize>;

    /// Number of entries stored for the pair.
    fn count(&self, mac: MacAddr, char_uuid: Uuid) -> HistoricalResult<usize>;

    /// Whether any entries exist for the device, optionally narrowed to
    /// one characteristic.
    fn has_data(&self, mac: MacAddr, char_uuid: Option<Uuid>) -> HistoricalResult<bool>;

    /// Open a cursor over the pair's entries in capture order.
    fn cursor(&self, mac: MacAddr, char_uuid: Uuid) -> HistoricalResult<Box<dyn HistoricalCursor>>;

    /// Delete all entries for the pair.
    fn clear(&self, mac: MacAddr, char_uuid: Uuid) -> HistoricalResult<()>;

    /// Record the intent of the device's last transition into the
    /// disconnected state.
    fn set_last_disconnect_intent(
        &self,
        mac: MacAddr,
        intent: ChangeIntent,
    ) -> HistoricalResult<()>;

    /// The last recorded disconnect intent, if any.
    fn last_disconnect_intent(&self, mac: MacAddr) -> HistoricalResult<Option<ChangeIntent>>;

    /// Persist or clear the application-assigned device name.
    fn set_name_override(&self, mac: MacAddr, name: Option<&str>) -> HistoricalResult<()>;

    /// The persisted application-assigned name, if any.
    fn name_override(&self, mac: MacAddr) -> HistoricalResult<Option<String>>;

    /// The physical table (or namespace) name backing the pair.
    fn table_name(&self, mac: MacAddr, char_uuid: Uuid) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datum_roundtrip() {
        let datum = HistoricalDatum::new(1_700_000_000_000, vec![1, 2, 3]);
        let json = serde_json::to_string(&datum).unwrap();
        let back: HistoricalDatum = serde_json::from_str(&json).unwrap();
        assert_eq!(back, datum);
    }
}
