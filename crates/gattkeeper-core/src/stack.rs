//! The narrow contract to the native BLE transport.
//!
//! [`BleStack`] is the only coupling between the core and the operating
//! system. Every call is fire-and-forget: the implementation performs the
//! native operation on whatever thread it likes and reports the outcome by
//! sending a [`StackEvent`] through the sender it was constructed with.
//! Events land in the update worker's mailbox and are drained at the next
//! tick; they are never processed inline on the caller's thread.

use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use gattkeeper_types::{
    BondState, CharTarget, ConnectionPriority, GattService, GattStatus, GattWriteType, MacAddr,
    PhyOptions,
};

/// Sender half of the stack-callback mailbox.
pub type StackEventSender = mpsc::UnboundedSender<StackEvent>;

/// Parameters for starting a scan.
#[derive(Debug, Clone, Default)]
pub struct ScanParams {
    /// Restrict results to devices advertising one of these services.
    /// Empty means unfiltered.
    pub services: Vec<Uuid>,
    /// Stop automatically after this long. `None` scans until stopped.
    pub duration: Option<Duration>,
}

impl ScanParams {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn service(mut self, uuid: Uuid) -> Self {
        self.services.push(uuid);
        self
    }

    #[must_use]
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// Capabilities a backend may or may not offer.
///
/// The core checks these synchronously before issuing a call so that
/// unsupported operations are refused at the gate instead of producing a
/// dangling native request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackOp {
    PowerControl,
    Bond,
    Mtu,
    ConnectionPriority,
    Phy,
    ReliableWrite,
    CrashResolver,
    Rssi,
}

/// A callback from the native stack, posted to the update worker.
#[derive(Debug, Clone)]
pub enum StackEvent {
    /// The adapter turned on or off.
    AdapterState { on: bool },
    /// An advertisement was received.
    ///
    /// Backends that expose raw advertisement bytes set `record`; others
    /// provide the parsed fields and leave it `None`.
    Advertisement {
        mac: MacAddr,
        rssi: Option<i16>,
        local_name: Option<String>,
        record: Option<Vec<u8>>,
        services: Vec<Uuid>,
        manufacturer: Option<(u16, Vec<u8>)>,
        tx_power: Option<i8>,
    },
    Connected {
        mac: MacAddr,
    },
    ConnectFailed {
        mac: MacAddr,
        status: GattStatus,
    },
    Disconnected {
        mac: MacAddr,
        status: GattStatus,
    },
    ServicesDiscovered {
        mac: MacAddr,
        services: Vec<GattService>,
    },
    ServiceDiscoveryFailed {
        mac: MacAddr,
        status: GattStatus,
    },
    CharacteristicRead {
        mac: MacAddr,
        target: CharTarget,
        value: Vec<u8>,
        status: GattStatus,
    },
    CharacteristicWritten {
        mac: MacAddr,
        target: CharTarget,
        status: GattStatus,
    },
    DescriptorRead {
        mac: MacAddr,
        target: CharTarget,
        value: Vec<u8>,
        status: GattStatus,
    },
    DescriptorWritten {
        mac: MacAddr,
        target: CharTarget,
        status: GattStatus,
    },
    NotifyStateChanged {
        mac: MacAddr,
        target: CharTarget,
        enabled: bool,
        status: GattStatus,
    },
    /// An unsolicited value push from the remote.
    Notification {
        mac: MacAddr,
        target: CharTarget,
        value: Vec<u8>,
        is_indication: bool,
    },
    RssiRead {
        mac: MacAddr,
        rssi: i16,
        status: GattStatus,
    },
    MtuChanged {
        mac: MacAddr,
        mtu: u16,
        status: GattStatus,
    },
    ConnectionPriorityChanged {
        mac: MacAddr,
        priority: ConnectionPriority,
        status: GattStatus,
    },
    PhyUpdated {
        mac: MacAddr,
        phys: PhyOptions,
        status: GattStatus,
    },
    PhyRead {
        mac: MacAddr,
        phys: PhyOptions,
        status: GattStatus,
    },
    ReliableWriteCompleted {
        mac: MacAddr,
        status: GattStatus,
    },
    BondStateChanged {
        mac: MacAddr,
        state: BondState,
        failure: Option<GattStatus>,
    },
    /// The crash-resolver flush finished.
    CrashResolverFlushed,
}

/// The native BLE transport, as the core consumes it.
///
/// Implementations must be cheap to call: every method returns immediately
/// and reports through the event sender. The core guarantees it never
/// issues a second operation of the same class before the first resolved
/// (the scheduler serialises everything), so implementations do not need
/// their own queues.
pub trait BleStack: Send + 'static {
    /// Current adapter power state.
    fn is_powered(&self) -> bool;

    /// Request an adapter power change; resolves via
    /// [`StackEvent::AdapterState`].
    fn set_power(&mut self, on: bool);

    /// Whether the backend offers the given capability.
    fn supports(&self, op: StackOp) -> bool;

    /// Start scanning. Idempotent.
    fn start_scan(&mut self, params: &ScanParams);

    /// Stop scanning. Idempotent.
    fn stop_scan(&mut self);

    fn connect(&mut self, mac: MacAddr, auto_connect: bool);
    fn disconnect(&mut self, mac: MacAddr);
    fn discover_services(&mut self, mac: MacAddr);

    /// Drop the cached GATT database for the device, if the platform keeps
    /// one. A fresh `discover_services` follows.
    fn refresh_gatt_database(&mut self, mac: MacAddr);

    fn read_characteristic(&mut self, mac: MacAddr, target: &CharTarget);
    fn write_characteristic(
        &mut self,
        mac: MacAddr,
        target: &CharTarget,
        value: &[u8],
        write_type: GattWriteType,
    );
    fn read_descriptor(&mut self, mac: MacAddr, target: &CharTarget);
    fn write_descriptor(&mut self, mac: MacAddr, target: &CharTarget, value: &[u8]);
    fn set_notify(&mut self, mac: MacAddr, target: &CharTarget, enabled: bool);

    fn read_rssi(&mut self, mac: MacAddr);
    fn request_mtu(&mut self, mac: MacAddr, mtu: u16);
    fn request_connection_priority(&mut self, mac: MacAddr, priority: ConnectionPriority);
    fn set_phy(&mut self, mac: MacAddr, phys: PhyOptions);
    fn read_phy(&mut self, mac: MacAddr);

    fn begin_reliable_write(&mut self, mac: MacAddr);
    fn execute_reliable_write(&mut self, mac: MacAddr);
    fn abort_reliable_write(&mut self, mac: MacAddr);

    fn create_bond(&mut self, mac: MacAddr);
    fn remove_bond(&mut self, mac: MacAddr);

    /// Force-flush a wedged native stack; resolves via
    /// [`StackEvent::CrashResolverFlushed`].
    fn force_crash_resolver_flush(&mut self);

    /// Whether a crash-resolver recovery is currently running.
    fn is_crash_recovery_in_progress(&self) -> bool {
        false
    }
}
