//! Mock transport for testing without BLE hardware.
//!
//! [`MockStack`] implements [`BleStack`] against an in-memory world of
//! peripherals. By default every call is answered immediately (the
//! response still travels through the mailbox, so it is observed at the
//! next tick). Tests drive failure injection, silence (no callback at
//! all, for timeout paths), advertisement and notification injection, and
//! inspect the exact native calls that were issued through the paired
//! [`MockController`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};

use uuid::Uuid;

use gattkeeper_types::{
    BondState, CharProps, CharTarget, ConnectionPriority, GattCharacteristic, GattService,
    GattStatus, GattWriteType, MacAddr, PhyOptions,
};

use crate::stack::{BleStack, ScanParams, StackEvent, StackEventSender, StackOp};

/// One simulated remote device.
#[derive(Debug, Clone, Default)]
pub struct MockPeripheral {
    pub services: Vec<GattService>,
    pub values: HashMap<Uuid, Vec<u8>>,
    pub rssi: i16,
    pub connected: bool,
    pub bonded: bool,
}

impl MockPeripheral {
    /// A peripheral with one service whose characteristics all support
    /// read, write, and notify.
    pub fn with_service(service_uuid: Uuid, char_uuids: &[Uuid]) -> Self {
        let characteristics = char_uuids
            .iter()
            .map(|&uuid| GattCharacteristic {
                uuid,
                properties: CharProps::new(
                    CharProps::READ | CharProps::WRITE | CharProps::NOTIFY,
                ),
                descriptors: Vec::new(),
            })
            .collect();
        MockPeripheral {
            services: vec![GattService {
                uuid: service_uuid,
                characteristics,
            }],
            rssi: -60,
            ..Default::default()
        }
    }
}

/// A native call the core issued, for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    SetPower(bool),
    StartScan,
    StopScan,
    Connect { mac: MacAddr, auto_connect: bool },
    Disconnect(MacAddr),
    DiscoverServices(MacAddr),
    RefreshGatt(MacAddr),
    Read { mac: MacAddr, char_uuid: Uuid },
    Write { mac: MacAddr, char_uuid: Uuid, value: Vec<u8> },
    ReadDescriptor { mac: MacAddr, char_uuid: Uuid },
    WriteDescriptor { mac: MacAddr, char_uuid: Uuid },
    SetNotify { mac: MacAddr, char_uuid: Uuid, enabled: bool },
    ReadRssi(MacAddr),
    RequestMtu { mac: MacAddr, mtu: u16 },
    RequestConnectionPriority(MacAddr),
    SetPhy(MacAddr),
    ReadPhy(MacAddr),
    BeginReliableWrite(MacAddr),
    ExecuteReliableWrite(MacAddr),
    AbortReliableWrite(MacAddr),
    CreateBond(MacAddr),
    RemoveBond(MacAddr),
    CrashResolverFlush,
}

/// Which call classes can be muted (issued but never answered).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Connect,
    Disconnect,
    DiscoverServices,
    Read,
    Write,
    Notify,
}

#[derive(Default)]
struct Shared {
    powered: bool,
    peripherals: HashMap<MacAddr, MockPeripheral>,
    calls: Vec<MockCall>,
    muted: HashSet<MockOp>,
    connect_failures: HashMap<MacAddr, GattStatus>,
    next_read_failures: HashMap<Uuid, VecDeque<GattStatus>>,
    next_write_failures: HashMap<Uuid, VecDeque<GattStatus>>,
    crash_recovery_in_progress: bool,
}

/// Test-side handle: injects world changes and inspects issued calls.
#[derive(Clone)]
pub struct MockController {
    shared: Arc<Mutex<Shared>>,
    tx: Arc<OnceLock<StackEventSender>>,
}

impl MockController {
    fn send(&self, event: StackEvent) {
        if let Some(tx) = self.tx.get() {
            let _ = tx.send(event);
        }
    }

    pub fn add_peripheral(&self, mac: MacAddr, peripheral: MockPeripheral) {
        self.shared.lock().unwrap().peripherals.insert(mac, peripheral);
    }

    /// Inject an advertisement sighting.
    pub fn advertise(&self, mac: MacAddr, rssi: i16, record: Vec<u8>) {
        self.send(StackEvent::Advertisement {
            mac,
            rssi: Some(rssi),
            local_name: None,
            record: Some(record),
            services: Vec::new(),
            manufacturer: None,
            tx_power: None,
        });
    }

    /// Inject an advertisement with pre-parsed fields.
    pub fn advertise_parsed(&self, mac: MacAddr, rssi: i16, name: Option<&str>, services: Vec<Uuid>) {
        self.send(StackEvent::Advertisement {
            mac,
            rssi: Some(rssi),
            local_name: name.map(String::from),
            record: None,
            services,
            manufacturer: None,
            tx_power: None,
        });
    }

    /// Flip adapter power and report it.
    pub fn set_powered(&self, on: bool) {
        self.shared.lock().unwrap().powered = on;
        self.send(StackEvent::AdapterState { on });
    }

    /// Stop answering calls of this class.
    pub fn mute(&self, op: MockOp) {
        self.shared.lock().unwrap().muted.insert(op);
    }

    pub fn unmute(&self, op: MockOp) {
        self.shared.lock().unwrap().muted.remove(&op);
    }

    /// Make connects to this device fail with the status.
    pub fn fail_connect(&self, mac: MacAddr, status: GattStatus) {
        self.shared.lock().unwrap().connect_failures.insert(mac, status);
    }

    pub fn clear_connect_failure(&self, mac: MacAddr) {
        self.shared.lock().unwrap().connect_failures.remove(&mac);
    }

    /// Queue a one-shot failure for the next read of the characteristic.
    pub fn fail_next_read(&self, char_uuid: Uuid, status: GattStatus) {
        self.shared
            .lock()
            .unwrap()
            .next_read_failures
            .entry(char_uuid)
            .or_default()
            .push_back(status);
    }

    /// Queue a one-shot failure for the next write of the characteristic.
    pub fn fail_next_write(&self, char_uuid: Uuid, status: GattStatus) {
        self.shared
            .lock()
            .unwrap()
            .next_write_failures
            .entry(char_uuid)
            .or_default()
            .push_back(status);
    }

    /// Push a notification from the remote.
    pub fn push_notification(&self, mac: MacAddr, char_uuid: Uuid, value: Vec<u8>) {
        self.send(StackEvent::Notification {
            mac,
            target: CharTarget::characteristic(char_uuid),
            value,
            is_indication: false,
        });
    }

    /// Drop an established connection from the remote side.
    pub fn drop_connection(&self, mac: MacAddr, status: GattStatus) {
        if let Some(p) = self.shared.lock().unwrap().peripherals.get_mut(&mac) {
            p.connected = false;
        }
        self.send(StackEvent::Disconnected { mac, status });
    }

    /// Answer a muted connect by hand.
    pub fn complete_connect(&self, mac: MacAddr) {
        if let Some(p) = self.shared.lock().unwrap().peripherals.get_mut(&mac) {
            p.connected = true;
        }
        self.send(StackEvent::Connected { mac });
    }

    /// Answer a muted read by hand.
    pub fn complete_read(&self, mac: MacAddr, char_uuid: Uuid, value: Vec<u8>) {
        self.send(StackEvent::CharacteristicRead {
            mac,
            target: CharTarget::characteristic(char_uuid),
            value,
            status: GattStatus::SUCCESS,
        });
    }

    /// Answer a muted write by hand.
    pub fn complete_write(&self, mac: MacAddr, char_uuid: Uuid) {
        self.send(StackEvent::CharacteristicWritten {
            mac,
            target: CharTarget::characteristic(char_uuid),
            status: GattStatus::SUCCESS,
        });
    }

    /// Mark the crash resolver as wedged (or not).
    pub fn set_crash_recovery_in_progress(&self, in_progress: bool) {
        self.shared.lock().unwrap().crash_recovery_in_progress = in_progress;
    }

    /// Snapshot of every native call issued so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.shared.lock().unwrap().calls.clone()
    }

    /// Number of calls matching the predicate.
    pub fn call_count(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.shared.lock().unwrap().calls.iter().filter(|c| pred(c)).count()
    }
}

/// The mock transport itself. Construct through [`MockStack::factory`].
pub struct MockStack {
    tx: StackEventSender,
    shared: Arc<Mutex<Shared>>,
}

impl MockStack {
    /// Build the factory to hand to
    /// [`BleManager::with_stack`](crate::BleManager::with_stack), plus the
    /// controller for the test side.
    pub fn factory() -> (
        impl FnOnce(StackEventSender) -> Box<dyn BleStack>,
        MockController,
    ) {
        let shared = Arc::new(Mutex::new(Shared {
            powered: true,
            ..Default::default()
        }));
        let slot: Arc<OnceLock<StackEventSender>> = Arc::new(OnceLock::new());
        let controller = MockController {
            shared: shared.clone(),
            tx: slot.clone(),
        };
        let factory = move |tx: StackEventSender| {
            let _ = slot.set(tx.clone());
            Box::new(MockStack { tx, shared }) as Box<dyn BleStack>
        };
        (factory, controller)
    }

    fn send(&self, event: StackEvent) {
        let _ = self.tx.send(event);
    }

    fn record(&self, call: MockCall) {
        self.shared.lock().unwrap().calls.push(call);
    }

    fn muted(&self, op: MockOp) -> bool {
        self.shared.lock().unwrap().muted.contains(&op)
    }
}

impl BleStack for MockStack {
    fn is_powered(&self) -> bool {
        self.shared.lock().unwrap().powered
    }

    fn set_power(&mut self, on: bool) {
        self.record(MockCall::SetPower(on));
        self.shared.lock().unwrap().powered = on;
        self.send(StackEvent::AdapterState { on });
    }

    fn supports(&self, _op: StackOp) -> bool {
        true
    }

    fn start_scan(&mut self, _params: &ScanParams) {
        self.record(MockCall::StartScan);
    }

    fn stop_scan(&mut self) {
        self.record(MockCall::StopScan);
    }

    fn connect(&mut self, mac: MacAddr, auto_connect: bool) {
        self.record(MockCall::Connect { mac, auto_connect });
        if self.muted(MockOp::Connect) {
            return;
        }
        let outcome = {
            let mut shared = self.shared.lock().unwrap();
            if let Some(status) = shared.connect_failures.get(&mac).copied() {
                Err(status)
            } else if let Some(p) = shared.peripherals.get_mut(&mac) {
                p.connected = true;
                Ok(())
            } else {
                Err(GattStatus::FAILURE)
            }
        };
        match outcome {
            Ok(()) => self.send(StackEvent::Connected { mac }),
            Err(status) => self.send(StackEvent::ConnectFailed { mac, status }),
        }
    }

    fn disconnect(&mut self, mac: MacAddr) {
        self.record(MockCall::Disconnect(mac));
        if self.muted(MockOp::Disconnect) {
            return;
        }
        let was_connected = {
            let mut shared = self.shared.lock().unwrap();
            match shared.peripherals.get_mut(&mac) {
                Some(p) if p.connected => {
                    p.connected = false;
                    true
                }
                _ => false,
            }
        };
        if was_connected {
            self.send(StackEvent::Disconnected {
                mac,
                status: GattStatus::SUCCESS,
            });
        }
    }

    fn discover_services(&mut self, mac: MacAddr) {
        self.record(MockCall::DiscoverServices(mac));
        if self.muted(MockOp::DiscoverServices) {
            return;
        }
        let services = self
            .shared
            .lock()
            .unwrap()
            .peripherals
            .get(&mac)
            .map(|p| p.services.clone());
        match services {
            Some(services) => self.send(StackEvent::ServicesDiscovered { mac, services }),
            None => self.send(StackEvent::ServiceDiscoveryFailed {
                mac,
                status: GattStatus::FAILURE,
            }),
        }
    }

    fn refresh_gatt_database(&mut self, mac: MacAddr) {
        self.record(MockCall::RefreshGatt(mac));
    }

    fn read_characteristic(&mut self, mac: MacAddr, target: &CharTarget) {
        self.record(MockCall::Read {
            mac,
            char_uuid: target.char_uuid,
        });
        if self.muted(MockOp::Read) {
            return;
        }
        let (value, status) = {
            let mut shared = self.shared.lock().unwrap();
            let injected = shared
                .next_read_failures
                .get_mut(&target.char_uuid)
                .and_then(|q| q.pop_front());
            match injected {
                Some(status) => (Vec::new(), status),
                None => {
                    let value = shared
                        .peripherals
                        .get(&mac)
                        .and_then(|p| p.values.get(&target.char_uuid).cloned())
                        .unwrap_or_default();
                    (value, GattStatus::SUCCESS)
                }
            }
        };
        self.send(StackEvent::CharacteristicRead {
            mac,
            target: *target,
            value,
            status,
        });
    }

    fn write_characteristic(
        &mut self,
        mac: MacAddr,
        target: &CharTarget,
        value: &[u8],
        _write_type: GattWriteType,
    ) {
        self.record(MockCall::Write {
            mac,
            char_uuid: target.char_uuid,
            value: value.to_vec(),
        });
        if self.muted(MockOp::Write) {
            return;
        }
        let status = {
            let mut shared = self.shared.lock().unwrap();
            let injected = shared
                .next_write_failures
                .get_mut(&target.char_uuid)
                .and_then(|q| q.pop_front());
            match injected {
                Some(status) => status,
                None => {
                    if let Some(p) = shared.peripherals.get_mut(&mac) {
                        p.values.insert(target.char_uuid, value.to_vec());
                    }
                    GattStatus::SUCCESS
                }
            }
        };
        self.send(StackEvent::CharacteristicWritten {
            mac,
            target: *target,
            status,
        });
    }

    fn read_descriptor(&mut self, mac: MacAddr, target: &CharTarget) {
        self.record(MockCall::ReadDescriptor {
            mac,
            char_uuid: target.char_uuid,
        });
        self.send(StackEvent::DescriptorRead {
            mac,
            target: *target,
            value: Vec::new(),
            status: GattStatus::SUCCESS,
        });
    }

    fn write_descriptor(&mut self, mac: MacAddr, target: &CharTarget, _value: &[u8]) {
        self.record(MockCall::WriteDescriptor {
            mac,
            char_uuid: target.char_uuid,
        });
        self.send(StackEvent::DescriptorWritten {
            mac,
            target: *target,
            status: GattStatus::SUCCESS,
        });
    }

    fn set_notify(&mut self, mac: MacAddr, target: &CharTarget, enabled: bool) {
        self.record(MockCall::SetNotify {
            mac,
            char_uuid: target.char_uuid,
            enabled,
        });
        if self.muted(MockOp::Notify) {
            return;
        }
        self.send(StackEvent::NotifyStateChanged {
            mac,
            target: *target,
            enabled,
            status: GattStatus::SUCCESS,
        });
    }

    fn read_rssi(&mut self, mac: MacAddr) {
        self.record(MockCall::ReadRssi(mac));
        let rssi = self
            .shared
            .lock()
            .unwrap()
            .peripherals
            .get(&mac)
            .map(|p| p.rssi)
            .unwrap_or(-127);
        self.send(StackEvent::RssiRead {
            mac,
            rssi,
            status: GattStatus::SUCCESS,
        });
    }

    fn request_mtu(&mut self, mac: MacAddr, mtu: u16) {
        self.record(MockCall::RequestMtu { mac, mtu });
        self.send(StackEvent::MtuChanged {
            mac,
            mtu,
            status: GattStatus::SUCCESS,
        });
    }

    fn request_connection_priority(&mut self, mac: MacAddr, priority: ConnectionPriority) {
        self.record(MockCall::RequestConnectionPriority(mac));
        self.send(StackEvent::ConnectionPriorityChanged {
            mac,
            priority,
            status: GattStatus::SUCCESS,
        });
    }

    fn set_phy(&mut self, mac: MacAddr, phys: PhyOptions) {
        self.record(MockCall::SetPhy(mac));
        self.send(StackEvent::PhyUpdated {
            mac,
            phys,
            status: GattStatus::SUCCESS,
        });
    }

    fn read_phy(&mut self, mac: MacAddr) {
        self.record(MockCall::ReadPhy(mac));
        self.send(StackEvent::PhyRead {
            mac,
            phys: PhyOptions::default(),
            status: GattStatus::SUCCESS,
        });
    }

    fn begin_reliable_write(&mut self, mac: MacAddr) {
        self.record(MockCall::BeginReliableWrite(mac));
    }

    fn execute_reliable_write(&mut self, mac: MacAddr) {
        self.record(MockCall::ExecuteReliableWrite(mac));
        self.send(StackEvent::ReliableWriteCompleted {
            mac,
            status: GattStatus::SUCCESS,
        });
    }

    fn abort_reliable_write(&mut self, mac: MacAddr) {
        self.record(MockCall::AbortReliableWrite(mac));
    }

    fn create_bond(&mut self, mac: MacAddr) {
        self.record(MockCall::CreateBond(mac));
        let known = {
            let mut shared = self.shared.lock().unwrap();
            match shared.peripherals.get_mut(&mac) {
                Some(p) => {
                    p.bonded = true;
                    true
                }
                None => false,
            }
        };
        if known {
            self.send(StackEvent::BondStateChanged {
                mac,
                state: BondState::Bonded,
                failure: None,
            });
        } else {
            self.send(StackEvent::BondStateChanged {
                mac,
                state: BondState::None,
                failure: Some(GattStatus::FAILURE),
            });
        }
    }

    fn remove_bond(&mut self, mac: MacAddr) {
        self.record(MockCall::RemoveBond(mac));
        if let Some(p) = self.shared.lock().unwrap().peripherals.get_mut(&mac) {
            p.bonded = false;
        }
        self.send(StackEvent::BondStateChanged {
            mac,
            state: BondState::None,
            failure: None,
        });
    }

    fn force_crash_resolver_flush(&mut self) {
        self.record(MockCall::CrashResolverFlush);
        self.shared.lock().unwrap().crash_recovery_in_progress = false;
        self.send(StackEvent::CrashResolverFlushed);
    }

    fn is_crash_recovery_in_progress(&self) -> bool {
        self.shared.lock().unwrap().crash_recovery_in_progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_factory_wires_controller_and_stack() {
        let (factory, controller) = MockStack::factory();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut stack = factory(tx);

        let mac = MacAddr::new([1, 2, 3, 4, 5, 6]);
        controller.add_peripheral(mac, MockPeripheral::with_service(Uuid::from_u128(0x100), &[]));
        stack.connect(mac, false);

        assert!(matches!(rx.try_recv(), Ok(StackEvent::Connected { .. })));
        assert_eq!(
            controller.call_count(|c| matches!(c, MockCall::Connect { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_muted_calls_are_recorded_but_unanswered() {
        let (factory, controller) = MockStack::factory();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut stack = factory(tx);
        controller.mute(MockOp::Connect);

        let mac = MacAddr::new([1, 2, 3, 4, 5, 6]);
        stack.connect(mac, true);
        assert!(rx.try_recv().is_err());
        assert_eq!(
            controller.call_count(|c| matches!(c, MockCall::Connect { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_one_shot_read_failure() {
        let (factory, controller) = MockStack::factory();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut stack = factory(tx);

        let mac = MacAddr::new([1, 2, 3, 4, 5, 6]);
        let char_uuid = Uuid::from_u128(0x1);
        controller.add_peripheral(mac, MockPeripheral::with_service(Uuid::from_u128(0x100), &[char_uuid]));
        controller.fail_next_read(char_uuid, GattStatus::ERROR_133);

        let target = CharTarget::characteristic(char_uuid);
        stack.read_characteristic(mac, &target);
        match rx.try_recv() {
            Ok(StackEvent::CharacteristicRead { status, .. }) => {
                assert_eq!(status, GattStatus::ERROR_133)
            }
            other => panic!("unexpected: {other:?}"),
        }

        stack.read_characteristic(mac, &target);
        match rx.try_recv() {
            Ok(StackEvent::CharacteristicRead { status, .. }) => {
                assert!(status.is_success())
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
