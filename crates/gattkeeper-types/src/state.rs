//! The per-device state bitmask.
//!
//! A device is described by a set of simultaneously-held state bits rather
//! than a single enum value: a device can be `BleConnected`, `Bonded` and
//! `Initialized` all at once. [`StateMask`] holds the set; [`DeviceState`]
//! names the bits.

use std::fmt;
use std::ops::{BitAnd, BitOr};

use serde::{Deserialize, Serialize};

/// One bit of the device state mask.
///
/// The discriminant is the bit position, so `1 << (state as u32)` is the
/// mask bit. `ConnectingOverall` is a composite bit: it is set exactly when
/// any of its constituents is set (see [`StateMask::recompute_composites`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum DeviceState {
    Undiscovered = 0,
    Advertising = 1,
    Discovered = 2,
    BleConnecting = 3,
    BleConnected = 4,
    DiscoveringServices = 5,
    ServicesDiscovered = 6,
    Bonding = 7,
    Bonded = 8,
    Unbonded = 9,
    Authenticating = 10,
    Authenticated = 11,
    Initializing = 12,
    Initialized = 13,
    PerformingOta = 14,
    ReconnectingShortTerm = 15,
    ReconnectingLongTerm = 16,
    BleDisconnected = 17,
    ConnectingOverall = 18,
}

impl DeviceState {
    /// All states, in bit order.
    pub const ALL: [DeviceState; 19] = [
        DeviceState::Undiscovered,
        DeviceState::Advertising,
        DeviceState::Discovered,
        DeviceState::BleConnecting,
        DeviceState::BleConnected,
        DeviceState::DiscoveringServices,
        DeviceState::ServicesDiscovered,
        DeviceState::Bonding,
        DeviceState::Bonded,
        DeviceState::Unbonded,
        DeviceState::Authenticating,
        DeviceState::Authenticated,
        DeviceState::Initializing,
        DeviceState::Initialized,
        DeviceState::PerformingOta,
        DeviceState::ReconnectingShortTerm,
        DeviceState::ReconnectingLongTerm,
        DeviceState::BleDisconnected,
        DeviceState::ConnectingOverall,
    ];

    /// The mask bit for this state.
    pub const fn bit(self) -> u32 {
        1 << (self as u32)
    }

    /// The constituents of the `ConnectingOverall` composite.
    pub const fn connecting_overall_constituents() -> StateMask {
        StateMask(
            DeviceState::BleConnecting.bit()
                | DeviceState::DiscoveringServices.bit()
                | DeviceState::Authenticating.bit()
                | DeviceState::Initializing.bit()
                | DeviceState::ReconnectingShortTerm.bit(),
        )
    }

    fn name(self) -> &'static str {
        match self {
            DeviceState::Undiscovered => "UNDISCOVERED",
            DeviceState::Advertising => "ADVERTISING",
            DeviceState::Discovered => "DISCOVERED",
            DeviceState::BleConnecting => "BLE_CONNECTING",
            DeviceState::BleConnected => "BLE_CONNECTED",
            DeviceState::DiscoveringServices => "DISCOVERING_SERVICES",
            DeviceState::ServicesDiscovered => "SERVICES_DISCOVERED",
            DeviceState::Bonding => "BONDING",
            DeviceState::Bonded => "BONDED",
            DeviceState::Unbonded => "UNBONDED",
            DeviceState::Authenticating => "AUTHENTICATING",
            DeviceState::Authenticated => "AUTHENTICATED",
            DeviceState::Initializing => "INITIALIZING",
            DeviceState::Initialized => "INITIALIZED",
            DeviceState::PerformingOta => "PERFORMING_OTA",
            DeviceState::ReconnectingShortTerm => "RECONNECTING_SHORT_TERM",
            DeviceState::ReconnectingLongTerm => "RECONNECTING_LONG_TERM",
            DeviceState::BleDisconnected => "BLE_DISCONNECTED",
            DeviceState::ConnectingOverall => "CONNECTING_OVERALL",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of [`DeviceState`] bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateMask(pub u32);

impl StateMask {
    /// The empty mask.
    pub const EMPTY: StateMask = StateMask(0);

    /// Build a mask from a slice of states.
    pub fn of(states: &[DeviceState]) -> Self {
        let mut mask = 0;
        for s in states {
            mask |= s.bit();
        }
        StateMask(mask)
    }

    /// Whether the given state bit is set.
    pub fn contains(self, state: DeviceState) -> bool {
        self.0 & state.bit() != 0
    }

    /// Whether any bit of `other` is set in `self`.
    pub fn intersects(self, other: StateMask) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether every bit of `other` is set in `self`.
    pub fn contains_all(self, other: StateMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// This mask with `state` set.
    #[must_use]
    pub fn with(self, state: DeviceState) -> Self {
        StateMask(self.0 | state.bit())
    }

    /// This mask with `state` cleared.
    #[must_use]
    pub fn without(self, state: DeviceState) -> Self {
        StateMask(self.0 & !state.bit())
    }

    /// Recompute the `ConnectingOverall` composite bit from its
    /// constituents. Call after any direct bit manipulation.
    #[must_use]
    pub fn recompute_composites(self) -> Self {
        if self.intersects(DeviceState::connecting_overall_constituents()) {
            self.with(DeviceState::ConnectingOverall)
        } else {
            self.without(DeviceState::ConnectingOverall)
        }
    }

    /// The states set in this mask, in bit order.
    pub fn states(self) -> Vec<DeviceState> {
        DeviceState::ALL
            .iter()
            .copied()
            .filter(|s| self.contains(*s))
            .collect()
    }

    /// Bits set in `self` but not in `prev`.
    #[must_use]
    pub fn entered_since(self, prev: StateMask) -> StateMask {
        StateMask(self.0 & !prev.0)
    }

    /// Bits set in `prev` but not in `self`.
    #[must_use]
    pub fn exited_since(self, prev: StateMask) -> StateMask {
        StateMask(prev.0 & !self.0)
    }
}

impl BitOr for StateMask {
    type Output = StateMask;
    fn bitor(self, rhs: StateMask) -> StateMask {
        StateMask(self.0 | rhs.0)
    }
}

impl BitAnd for StateMask {
    type Output = StateMask;
    fn bitand(self, rhs: StateMask) -> StateMask {
        StateMask(self.0 & rhs.0)
    }
}

impl From<DeviceState> for StateMask {
    fn from(state: DeviceState) -> Self {
        StateMask(state.bit())
    }
}

impl fmt::Display for StateMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        let mut first = true;
        for state in self.states() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{state}")?;
            first = false;
        }
        write!(f, "]")
    }
}

/// Whether a transition into `BleDisconnected` was asked for by the
/// application or inflicted by the remote side, the radio, or the OS.
///
/// `Null` is the persisted placeholder for "never seen a disconnect".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeIntent {
    Intentional,
    Unintentional,
    Null,
}

impl ChangeIntent {
    /// Stable integer encoding used by persistence layers.
    pub fn to_code(self) -> i64 {
        match self {
            ChangeIntent::Intentional => 1,
            ChangeIntent::Unintentional => 2,
            ChangeIntent::Null => 0,
        }
    }

    /// Inverse of [`to_code`](Self::to_code); unknown codes decode as `Null`.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => ChangeIntent::Intentional,
            2 => ChangeIntent::Unintentional,
            _ => ChangeIntent::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_are_distinct() {
        let mut seen = 0u32;
        for s in DeviceState::ALL {
            assert_eq!(seen & s.bit(), 0, "duplicate bit for {s}");
            seen |= s.bit();
        }
    }

    #[test]
    fn test_with_without() {
        let mask = StateMask::EMPTY
            .with(DeviceState::Discovered)
            .with(DeviceState::BleConnected);
        assert!(mask.contains(DeviceState::Discovered));
        assert!(mask.contains(DeviceState::BleConnected));
        let mask = mask.without(DeviceState::Discovered);
        assert!(!mask.contains(DeviceState::Discovered));
        assert!(mask.contains(DeviceState::BleConnected));
    }

    #[test]
    fn test_connecting_overall_recompute() {
        let mask = StateMask::EMPTY
            .with(DeviceState::BleConnecting)
            .recompute_composites();
        assert!(mask.contains(DeviceState::ConnectingOverall));

        let mask = mask
            .without(DeviceState::BleConnecting)
            .with(DeviceState::BleConnected)
            .recompute_composites();
        assert!(!mask.contains(DeviceState::ConnectingOverall));
    }

    #[test]
    fn test_connecting_overall_tracks_every_constituent() {
        for s in [
            DeviceState::BleConnecting,
            DeviceState::DiscoveringServices,
            DeviceState::Authenticating,
            DeviceState::Initializing,
            DeviceState::ReconnectingShortTerm,
        ] {
            let mask = StateMask::EMPTY.with(s).recompute_composites();
            assert!(mask.contains(DeviceState::ConnectingOverall), "{s}");
        }
        // Reconnecting long-term is deliberately not a constituent.
        let mask = StateMask::EMPTY
            .with(DeviceState::ReconnectingLongTerm)
            .recompute_composites();
        assert!(!mask.contains(DeviceState::ConnectingOverall));
    }

    #[test]
    fn test_entered_exited() {
        let prev = StateMask::of(&[DeviceState::BleConnecting]);
        let next = StateMask::of(&[DeviceState::BleConnected]);
        assert!(next.entered_since(prev).contains(DeviceState::BleConnected));
        assert!(next.exited_since(prev).contains(DeviceState::BleConnecting));
        assert!(!next.entered_since(prev).contains(DeviceState::BleConnecting));
    }

    #[test]
    fn test_display() {
        let mask = StateMask::of(&[DeviceState::Discovered, DeviceState::BleConnected]);
        assert_eq!(mask.to_string(), "[DISCOVERED, BLE_CONNECTED]");
    }

    #[test]
    fn test_change_intent_codes() {
        for intent in [
            ChangeIntent::Intentional,
            ChangeIntent::Unintentional,
            ChangeIntent::Null,
        ] {
            assert_eq!(ChangeIntent::from_code(intent.to_code()), intent);
        }
        assert_eq!(ChangeIntent::from_code(99), ChangeIntent::Null);
    }
}
