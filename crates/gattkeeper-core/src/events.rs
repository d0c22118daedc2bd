//! The events the core publishes to the application.
//!
//! Events are immutable value objects: they carry every field the
//! application may need, with no handles back into live device state that
//! could mutate between dispatch and receipt. All of them serialize for
//! logging and IPC.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use gattkeeper_types::{
    BondState, BondStatus, ChangeIntent, DeviceState, FailureKind, GattStatus, MacAddr, RwStatus,
    StateMask,
};

/// Device discovery lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryLifecycle {
    /// First sighting of this device.
    Discovered,
    /// Seen again after having been discovered before.
    Rediscovered,
    /// Explicitly forgotten.
    Undiscovered,
}

/// A device appeared in (or was removed from) the discovery set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryEvent {
    pub device: MacAddr,
    pub name: Option<String>,
    pub lifecycle: DiscoveryLifecycle,
    pub rssi: Option<i16>,
}

/// The device state mask changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub device: MacAddr,
    pub prev_mask: StateMask,
    pub new_mask: StateMask,
    pub intent: ChangeIntent,
}

impl StateChangeEvent {
    /// Whether this transition entered the given state.
    pub fn did_enter(&self, state: DeviceState) -> bool {
        !self.prev_mask.contains(state) && self.new_mask.contains(state)
    }

    /// Whether this transition exited the given state.
    pub fn did_exit(&self, state: DeviceState) -> bool {
        self.prev_mask.contains(state) && !self.new_mask.contains(state)
    }
}

/// What a [`ReadWriteEvent`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum RwOp {
    Read,
    Write,
    Notification,
    Indication,
    /// A synthetic read issued because no native notification arrived
    /// within the forced-read window.
    PseudoNotification,
    EnablingNotification,
    DisablingNotification,
    Rssi,
    Mtu,
    ConnectionPriority,
    PhyOptions,
    ReliableWriteBegin,
    ReliableWriteExecute,
    ReliableWriteAbort,
}

/// Outcome of a read/write-shaped operation.
///
/// `time_total` measures from submission to terminal state; `time_ota` is
/// the share spent while the device was performing an OTA transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadWriteEvent {
    pub device: MacAddr,
    pub service_uuid: Option<Uuid>,
    pub char_uuid: Option<Uuid>,
    pub descriptor_uuid: Option<Uuid>,
    pub op: RwOp,
    pub status: RwStatus,
    pub gatt_status: Option<GattStatus>,
    pub data: Option<Vec<u8>>,
    pub rssi: Option<i16>,
    pub mtu: Option<u16>,
    pub time_total: Duration,
    pub time_ota: Duration,
}

impl ReadWriteEvent {
    /// The synchronously returned placeholder for an accepted call. The
    /// real outcome follows asynchronously; see [`is_null`](Self::is_null).
    pub(crate) fn null(device: MacAddr, op: RwOp) -> Self {
        ReadWriteEvent {
            device,
            service_uuid: None,
            char_uuid: None,
            descriptor_uuid: None,
            op,
            status: RwStatus::Null,
            gatt_status: None,
            data: None,
            rssi: None,
            mtu: None,
            time_total: Duration::ZERO,
            time_ota: Duration::ZERO,
        }
    }

    /// An immediate gate failure. No asynchronous event will follow.
    pub(crate) fn gate_failure(device: MacAddr, op: RwOp, status: RwStatus) -> Self {
        ReadWriteEvent {
            status,
            ..ReadWriteEvent::null(device, op)
        }
    }

    /// Whether this is the placeholder returned for an accepted call (the
    /// actual outcome arrives as a later asynchronous event).
    pub fn is_null(&self) -> bool {
        self.status == RwStatus::Null
    }

    pub fn was_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Outcome of a connect attempt, or the accepted-call placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConnectOutcome {
    /// Placeholder: the connect was accepted and is in flight.
    Null,
    /// The device reached its final connected state.
    Connected,
    /// The device was already in its final connected state.
    AlreadyConnected,
    /// The attempt (including any silent retries) failed.
    Failed(ConnectFailEvent),
}

/// A connect call's synchronous or asynchronous outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectEvent {
    pub device: MacAddr,
    pub outcome: ConnectOutcome,
}

impl ConnectEvent {
    pub fn is_null(&self) -> bool {
        matches!(self.outcome, ConnectOutcome::Null)
    }

    pub fn was_success(&self) -> bool {
        matches!(
            self.outcome,
            ConnectOutcome::Connected | ConnectOutcome::AlreadyConnected
        )
    }
}

/// Typed description of a failed connect attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectFailEvent {
    pub device: MacAddr,
    pub status: FailureKind,
    pub gatt_status: Option<GattStatus>,
    /// How long the attempt ran before failing.
    pub timing: Duration,
    /// The highest state the attempt reached before failing.
    pub highest_state_reached: DeviceState,
    pub bond_failure_reason: Option<GattStatus>,
    pub auto_connect_used: bool,
    /// Why the auth/init transaction failed, when that was the cause.
    pub txn_failure_reason: Option<FailureKind>,
    /// 1-based attempt number within the current window.
    pub attempt: u32,
}

/// Bond state progress or outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BondEvent {
    pub device: MacAddr,
    pub state: BondState,
    pub status: BondStatus,
    pub failure_reason: Option<GattStatus>,
}

impl BondEvent {
    pub fn is_null(&self) -> bool {
        self.status == BondStatus::Null
    }
}

/// Kind of a pushed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Notification,
    Indication,
    /// Synthesized by the forced-read fallback, not pushed by the remote.
    PseudoNotification,
}

/// A characteristic value arrived outside a read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub device: MacAddr,
    pub service_uuid: Option<Uuid>,
    pub char_uuid: Uuid,
    pub kind: NotificationKind,
    pub data: Vec<u8>,
}

/// Outcome of a background historical-data load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalDataLoadEvent {
    pub device: MacAddr,
    pub char_uuid: Option<Uuid>,
    pub loaded: bool,
    /// Number of entries now available, when the load succeeded.
    pub count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use gattkeeper_types::DeviceState;

    fn mac() -> MacAddr {
        MacAddr::new([0xAA, 0xBB, 0xCC, 0, 1, 2])
    }

    #[test]
    fn test_null_event() {
        let ev = ReadWriteEvent::null(mac(), RwOp::Read);
        assert!(ev.is_null());
        assert!(!ev.was_success());
    }

    #[test]
    fn test_gate_failure_is_not_null() {
        let ev = ReadWriteEvent::gate_failure(mac(), RwOp::Write, RwStatus::NotConnected);
        assert!(!ev.is_null());
        assert_eq!(ev.status, RwStatus::NotConnected);
    }

    #[test]
    fn test_state_change_enter_exit() {
        let ev = StateChangeEvent {
            device: mac(),
            prev_mask: StateMask::of(&[DeviceState::BleConnecting]),
            new_mask: StateMask::of(&[DeviceState::BleConnected]),
            intent: ChangeIntent::Intentional,
        };
        assert!(ev.did_enter(DeviceState::BleConnected));
        assert!(ev.did_exit(DeviceState::BleConnecting));
        assert!(!ev.did_enter(DeviceState::BleConnecting));
    }

    #[test]
    fn test_connect_event_helpers() {
        let ev = ConnectEvent {
            device: mac(),
            outcome: ConnectOutcome::Null,
        };
        assert!(ev.is_null());
        assert!(!ev.was_success());

        let ev = ConnectEvent {
            device: mac(),
            outcome: ConnectOutcome::Connected,
        };
        assert!(ev.was_success());
    }

    #[test]
    fn test_events_serialize() {
        let ev = NotificationEvent {
            device: mac(),
            service_uuid: None,
            char_uuid: Uuid::from_u128(0xFF00),
            kind: NotificationKind::PseudoNotification,
            data: vec![1, 2, 3],
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("pseudo_notification"));
    }
}
