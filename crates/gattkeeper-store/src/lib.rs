//! SQLite persistence for gattkeeper.
//!
//! This crate implements the core's
//! [`HistoricalStore`](gattkeeper_core::HistoricalStore) capability over
//! SQLite (WAL mode, bundled):
//!
//! - **Historical characteristic data**: one table per `(mac, char_uuid)`
//!   pair, batched inserts, paged cursor traversal
//! - **Last disconnect intent**: persisted per device for
//!   `manage_last_disconnect_on_disk`
//! - **Name overrides**: persisted per device for
//!   `save_name_changes_to_disk`
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gattkeeper_core::{BleManager, ManagerConfig};
//! use gattkeeper_store::Store;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(Store::open("gattkeeper.db")?);
//! let manager = BleManager::with_store(ManagerConfig::default(), store);
//! # let _ = manager;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod schema;
pub mod store;

pub use error::{Error, Result};
pub use store::Store;
