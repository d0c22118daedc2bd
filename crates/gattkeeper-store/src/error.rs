//! Error types for gattkeeper-store.

use thiserror::Error;

/// Errors from the SQLite store.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// SQLite error.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem error creating the database location.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The store's lock was poisoned by a panicking thread.
    #[error("store lock poisoned")]
    Poisoned,
}

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for gattkeeper_core::HistoricalError {
    fn from(e: Error) -> Self {
        gattkeeper_core::HistoricalError(e.to_string())
    }
}
