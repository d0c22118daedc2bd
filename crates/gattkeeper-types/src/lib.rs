//! Platform-agnostic value types for the gattkeeper BLE central library.
//!
//! This crate provides the shared vocabulary used across the gattkeeper
//! workspace: device addresses, the per-device state bitmask, GATT value
//! types, and the failure taxonomy. It has no BLE or async dependency and
//! can be used by persistence layers and applications alike.
//!
//! # Example
//!
//! ```
//! use gattkeeper_types::{DeviceState, MacAddr, StateMask};
//!
//! let mac: MacAddr = "AA:BB:CC:00:01:02".parse().unwrap();
//! assert_eq!(mac.to_string(), "AA:BB:CC:00:01:02");
//!
//! let mask = StateMask::EMPTY
//!     .with(DeviceState::BleConnected)
//!     .with(DeviceState::ServicesDiscovered);
//! assert!(mask.contains(DeviceState::BleConnected));
//! ```

pub mod error;
pub mod gatt;
pub mod mac;
pub mod state;

pub use error::{BondStatus, FailureKind, ParseError, RwStatus};
pub use gatt::{
    BondState, CharProps, CharTarget, ConnectionPriority, GattCharacteristic, GattDescriptor,
    GattService, GattStatus, GattWriteType, NotifyState, PhyOption, PhyOptions,
};
pub use mac::MacAddr;
pub use state::{ChangeIntent, DeviceState, StateMask};

/// Fixed per-PDU overhead of a GATT write: opcode (1 byte) plus handle
/// (2 bytes). Effective write payload is `mtu - GATT_WRITE_MTU_OVERHEAD`.
pub const GATT_WRITE_MTU_OVERHEAD: u16 = 3;

/// Default ATT MTU before negotiation.
pub const DEFAULT_MTU: u16 = 23;
