//! Error types for gattkeeper-core.
//!
//! Note that GATT operations themselves do not surface errors through
//! `Result`: they terminate as events carrying a typed status (see
//! [`crate::events`]). The errors here cover the library surface around the
//! scheduler: construction, configuration, and the historical store.

use thiserror::Error;

use gattkeeper_types::MacAddr;

use crate::historical::HistoricalError;

/// Errors returned by the library surface.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth backend error.
    #[cfg(feature = "btleplug-backend")]
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The manager's update worker has shut down.
    #[error("manager is shut down")]
    ShutDown,

    /// No device with the given address is known to the manager.
    #[error("unknown device: {0}")]
    UnknownDevice(MacAddr),

    /// No historical store was configured.
    #[error("no historical store configured")]
    NoHistoricalStore,

    /// Historical store failure.
    #[error(transparent)]
    Historical(#[from] HistoricalError),

    /// A configuration value failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
