//! The per-device aggregate.
//!
//! A [`Device`] is pure bookkeeping owned by the engine: the state mask,
//! scan and signal data, the discovered GATT database, per-characteristic
//! notification state, the reliable-write session, reconnect bookkeeping,
//! and the device's listener stacks. It issues no native calls itself;
//! tasks do that, and the engine writes the outcomes back here.

use std::collections::{HashMap, VecDeque};

use tokio::time::Instant;
use uuid::Uuid;

use gattkeeper_types::{
    gatt::resolve_target, BondState, CharTarget, ConnectionPriority, DeviceState,
    GattCharacteristic, GattService, MacAddr, NotifyState, PhyOptions, StateMask, DEFAULT_MTU,
};

use crate::config::{DeviceConfig, ManagerConfig};
use crate::listener::DeviceListeners;
use crate::metrics::RoundTripTimes;
use crate::reconnect::ReconnectState;
use crate::scan::ScanRecord;
use crate::transaction::TxnId;

/// State of the device's reliable-write session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReliableWriteState {
    None,
    /// Session open; writes are staged in the buffer until execute/abort.
    Open {
        buffer: Vec<(CharTarget, Vec<u8>)>,
    },
    /// Execute in progress; staged writes are being flushed in order.
    Committing {
        remaining: VecDeque<(CharTarget, Vec<u8>)>,
    },
}

impl ReliableWriteState {
    pub(crate) fn in_session(&self) -> bool {
        !matches!(self, ReliableWriteState::None)
    }
}

/// Everything the engine tracks about one device.
#[derive(Debug)]
pub(crate) struct Device {
    pub mac: MacAddr,
    /// Name from the most recent advertisement or connection.
    pub native_name: Option<String>,
    /// Application-assigned name; wins over the native one.
    pub name_override: Option<String>,
    pub mask: StateMask,
    pub last_discovered: Option<Instant>,
    pub scan_record: Option<ScanRecord>,
    pub rssi: Option<i16>,
    pub round_trips: RoundTripTimes,
    pub mtu: u16,
    pub connection_priority: ConnectionPriority,
    pub phy: PhyOptions,
    pub bond_state: BondState,
    /// Discovered GATT database; empty until discovery completes.
    pub services: Vec<GattService>,
    pub notify_states: HashMap<CharTarget, NotifyState>,
    /// Forced-read deadlines for freshly enabled notifications.
    pub pseudo_notify_deadlines: HashMap<CharTarget, Instant>,
    pub reliable_write: ReliableWriteState,
    /// Latest value per characteristic, from reads, writes and
    /// notifications.
    pub cached_values: HashMap<Uuid, Vec<u8>>,
    pub reconnect: ReconnectState,
    pub config: DeviceConfig,
    /// Highest rung the current connect attempt has reached.
    pub highest_state_this_attempt: DeviceState,
    /// When the current connect attempt started.
    pub attempt_started: Option<Instant>,
    /// Pending GATT refresh: rediscover services at this instant.
    pub gatt_refresh_at: Option<Instant>,
    /// Running transactions gating this device, by kind.
    pub auth_txn: Option<TxnId>,
    pub init_txn: Option<TxnId>,
    pub ota_txn: Option<TxnId>,
    pub listeners: DeviceListeners,
}

impl Device {
    pub(crate) fn new(mac: MacAddr, config: &ManagerConfig) -> Self {
        Device {
            mac,
            native_name: None,
            name_override: None,
            mask: StateMask::of(&[
                DeviceState::Undiscovered,
                DeviceState::BleDisconnected,
                DeviceState::Unbonded,
            ]),
            last_discovered: None,
            scan_record: None,
            rssi: None,
            round_trips: RoundTripTimes::new(
                config.n_for_average_running_read_time,
                config.n_for_average_running_write_time,
            ),
            mtu: DEFAULT_MTU,
            connection_priority: ConnectionPriority::default(),
            phy: PhyOptions::default(),
            bond_state: BondState::None,
            services: Vec::new(),
            notify_states: HashMap::new(),
            pseudo_notify_deadlines: HashMap::new(),
            reliable_write: ReliableWriteState::None,
            cached_values: HashMap::new(),
            reconnect: ReconnectState::default(),
            config: DeviceConfig::default(),
            highest_state_this_attempt: DeviceState::BleDisconnected,
            attempt_started: None,
            gatt_refresh_at: None,
            auth_txn: None,
            init_txn: None,
            ota_txn: None,
            listeners: DeviceListeners::new(),
        }
    }

    /// The effective name: override first, then the native name.
    pub(crate) fn name(&self) -> Option<&str> {
        self.name_override
            .as_deref()
            .or(self.native_name.as_deref())
    }

    pub(crate) fn is(&self, state: DeviceState) -> bool {
        self.mask.contains(state)
    }

    /// Largest write payload that fits one PDU at the negotiated MTU.
    pub(crate) fn effective_write_payload(&self, overhead: u16) -> usize {
        usize::from(self.mtu.saturating_sub(overhead))
    }

    /// Resolve a target against the discovered database.
    pub(crate) fn resolve(
        &self,
        target: &CharTarget,
    ) -> Option<(&GattService, &GattCharacteristic)> {
        resolve_target(&self.services, target)
    }

    pub(crate) fn notify_state(&self, target: &CharTarget) -> NotifyState {
        self.notify_states
            .get(target)
            .copied()
            .unwrap_or(NotifyState::Disabled)
    }

    /// Record that a connect attempt is starting now.
    pub(crate) fn begin_attempt(&mut self, now: Instant) {
        self.attempt_started = Some(now);
        self.highest_state_this_attempt = DeviceState::BleConnecting;
    }

    /// Track the highest rung of the connect ladder the attempt has
    /// reached. States outside the ladder are ignored.
    pub(crate) fn reached(&mut self, state: DeviceState) {
        fn rung(state: DeviceState) -> u8 {
            match state {
                DeviceState::BleConnecting => 1,
                DeviceState::BleConnected => 2,
                DeviceState::DiscoveringServices => 3,
                DeviceState::ServicesDiscovered => 4,
                DeviceState::Bonding => 5,
                DeviceState::Bonded => 6,
                DeviceState::Authenticating => 7,
                DeviceState::Authenticated => 8,
                DeviceState::Initializing => 9,
                DeviceState::Initialized => 10,
                _ => 0,
            }
        }
        if rung(state) > rung(self.highest_state_this_attempt) {
            self.highest_state_this_attempt = state;
        }
    }

    /// Drop all connection-scoped state. Called on any transition into
    /// the disconnected state.
    pub(crate) fn clear_connection_state(&mut self) {
        self.notify_states.clear();
        self.pseudo_notify_deadlines.clear();
        self.reliable_write = ReliableWriteState::None;
        self.gatt_refresh_at = None;
        self.mtu = DEFAULT_MTU;
        self.connection_priority = ConnectionPriority::default();
        self.auth_txn = None;
        self.init_txn = None;
        self.ota_txn = None;
    }

    /// Record a scan sighting. Returns true when this is the first one
    /// since creation or undiscovery.
    pub(crate) fn record_sighting(
        &mut self,
        now: Instant,
        rssi: Option<i16>,
        name: Option<String>,
        record: Option<ScanRecord>,
    ) -> bool {
        let first = self.is(DeviceState::Undiscovered);
        self.last_discovered = Some(now);
        if let Some(rssi) = rssi {
            self.rssi = Some(rssi);
        }
        if let Some(name) = name {
            self.native_name = Some(name);
        }
        if let Some(record) = record {
            self.scan_record = Some(record);
        }
        first
    }

    /// TX power for distance estimation: the scan record's, then the
    /// configured fallback.
    pub(crate) fn tx_power_or(&self, fallback: i16) -> i16 {
        self.scan_record
            .as_ref()
            .and_then(|r| r.tx_power)
            .map(i16::from)
            .unwrap_or(fallback)
    }

    /// Debug rendering of the current mask.
    pub(crate) fn print_state(&self) -> String {
        self.mask.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::new(
            MacAddr::new([0xAA, 0xBB, 0xCC, 0, 1, 2]),
            &ManagerConfig::default(),
        )
    }

    #[test]
    fn test_initial_state() {
        let d = device();
        assert!(d.is(DeviceState::Undiscovered));
        assert!(d.is(DeviceState::BleDisconnected));
        assert!(d.is(DeviceState::Unbonded));
        assert!(!d.is(DeviceState::BleConnected));
        assert_eq!(d.mtu, DEFAULT_MTU);
    }

    #[test]
    fn test_name_override_wins() {
        let mut d = device();
        assert_eq!(d.name(), None);
        d.native_name = Some("native".into());
        assert_eq!(d.name(), Some("native"));
        d.name_override = Some("mine".into());
        assert_eq!(d.name(), Some("mine"));
    }

    #[test]
    fn test_effective_write_payload() {
        let mut d = device();
        assert_eq!(d.effective_write_payload(3), 20);
        d.mtu = 185;
        assert_eq!(d.effective_write_payload(3), 182);
        d.mtu = 2;
        assert_eq!(d.effective_write_payload(3), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_sighting_detection() {
        let mut d = device();
        assert!(d.record_sighting(Instant::now(), Some(-60), None, None));
        // Still marked undiscovered until the engine flips the bit; the
        // second sighting is only "first" if the bit is still set.
        d.mask = d.mask.without(DeviceState::Undiscovered);
        assert!(!d.record_sighting(Instant::now(), Some(-61), None, None));
        assert_eq!(d.rssi, Some(-61));
    }

    #[test]
    fn test_clear_connection_state() {
        let mut d = device();
        d.mtu = 100;
        d.notify_states.insert(
            CharTarget::characteristic(Uuid::from_u128(1)),
            NotifyState::Enabled,
        );
        d.reliable_write = ReliableWriteState::Open { buffer: vec![] };
        d.clear_connection_state();
        assert_eq!(d.mtu, DEFAULT_MTU);
        assert!(d.notify_states.is_empty());
        assert_eq!(d.reliable_write, ReliableWriteState::None);
    }

    #[test]
    fn test_tx_power_fallback() {
        let mut d = device();
        assert_eq!(d.tx_power_or(4), 4);
        d.scan_record = Some(ScanRecord {
            tx_power: Some(-8),
            ..Default::default()
        });
        assert_eq!(d.tx_power_or(4), -8);
    }

    #[test]
    fn test_reached_tracks_highest() {
        let mut d = device();
        d.begin_attempt(Instant::now());
        d.reached(DeviceState::BleConnected);
        d.reached(DeviceState::DiscoveringServices);
        d.reached(DeviceState::BleConnected);
        assert_eq!(d.highest_state_this_attempt, DeviceState::DiscoveringServices);
    }
}
