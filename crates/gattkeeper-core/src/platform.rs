//! btleplug-backed transport.
//!
//! [`BtleplugStack`] adapts the cross-platform btleplug stack to the
//! [`BleStack`] contract. btleplug exposes scanning, connection, service
//! discovery, reads/writes/notifications and descriptors; it offers no
//! cross-platform bonding, MTU, PHY, connection-priority or
//! reliable-write surface, so [`supports`](BleStack::supports) reports
//! those capabilities absent and the core refuses them at the gate.
//!
//! Every trait call spawns a short task that performs the async btleplug
//! operation and reports through the event sender; a bridge task converts
//! the adapter's event stream (discoveries, disconnects, power changes)
//! into [`StackEvent`]s.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Descriptor,
    Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use gattkeeper_types::{
    BondState, CharProps, CharTarget, ConnectionPriority, GattCharacteristic, GattDescriptor,
    GattService, GattStatus, GattWriteType, MacAddr, PhyOptions,
};

use crate::stack::{BleStack, ScanParams, StackEvent, StackEventSender, StackOp};

struct Inner {
    adapter: Mutex<Option<Adapter>>,
    peripherals: Mutex<HashMap<MacAddr, Peripheral>>,
}

/// The default transport over btleplug.
pub struct BtleplugStack {
    tx: StackEventSender,
    inner: Arc<Inner>,
}

impl BtleplugStack {
    /// Initialise the backend. The adapter is acquired asynchronously; an
    /// [`StackEvent::AdapterState`] reports when it is usable.
    pub fn new(tx: StackEventSender) -> Self {
        let inner = Arc::new(Inner {
            adapter: Mutex::new(None),
            peripherals: Mutex::new(HashMap::new()),
        });

        let init_inner = inner.clone();
        let init_tx = tx.clone();
        tokio::spawn(async move {
            let manager = match Manager::new().await {
                Ok(m) => m,
                Err(e) => {
                    warn!("no bluetooth manager available: {e}");
                    let _ = init_tx.send(StackEvent::AdapterState { on: false });
                    return;
                }
            };
            let adapter = match manager.adapters().await {
                Ok(adapters) => adapters.into_iter().next(),
                Err(e) => {
                    warn!("failed to enumerate adapters: {e}");
                    None
                }
            };
            let Some(adapter) = adapter else {
                let _ = init_tx.send(StackEvent::AdapterState { on: false });
                return;
            };
            info!("bluetooth adapter acquired");

            let events = adapter.events().await;
            *init_inner.adapter.lock().await = Some(adapter);
            let _ = init_tx.send(StackEvent::AdapterState { on: true });

            let Ok(mut events) = events else {
                warn!("adapter event stream unavailable");
                return;
            };
            while let Some(event) = events.next().await {
                bridge_event(&init_inner, &init_tx, event).await;
            }
            debug!("adapter event stream ended");
        });

        BtleplugStack { tx, inner }
    }

    fn spawn<F>(&self, f: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(f);
    }
}

fn mac_of(peripheral: &Peripheral) -> Option<MacAddr> {
    MacAddr::from_str(&peripheral.address().to_string()).ok()
}

async fn peripheral_for(inner: &Inner, mac: MacAddr) -> Option<Peripheral> {
    if let Some(p) = inner.peripherals.lock().await.get(&mac) {
        return Some(p.clone());
    }
    let adapter = inner.adapter.lock().await.clone()?;
    let peripherals = adapter.peripherals().await.ok()?;
    for p in peripherals {
        if mac_of(&p) == Some(mac) {
            inner.peripherals.lock().await.insert(mac, p.clone());
            return Some(p);
        }
    }
    None
}

async fn advertise_from(inner: &Inner, tx: &StackEventSender, peripheral: Peripheral) {
    let Some(mac) = mac_of(&peripheral) else {
        return;
    };
    let props = match peripheral.properties().await {
        Ok(Some(props)) => props,
        _ => return,
    };
    inner.peripherals.lock().await.insert(mac, peripheral);
    let manufacturer = props
        .manufacturer_data
        .iter()
        .next()
        .map(|(id, data)| (*id, data.clone()));
    let _ = tx.send(StackEvent::Advertisement {
        mac,
        rssi: props.rssi,
        local_name: props.local_name,
        record: None,
        services: props.services,
        manufacturer,
        tx_power: props.tx_power_level.map(|p| p as i8),
    });
}

async fn bridge_event(inner: &Inner, tx: &StackEventSender, event: CentralEvent) {
    match event {
        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
            let adapter = inner.adapter.lock().await.clone();
            if let Some(adapter) = adapter {
                if let Ok(peripheral) = adapter.peripheral(&id).await {
                    advertise_from(inner, tx, peripheral).await;
                }
            }
        }
        CentralEvent::DeviceDisconnected(id) => {
            let adapter = inner.adapter.lock().await.clone();
            if let Some(adapter) = adapter {
                if let Ok(peripheral) = adapter.peripheral(&id).await {
                    if let Some(mac) = mac_of(&peripheral) {
                        let _ = tx.send(StackEvent::Disconnected {
                            mac,
                            status: GattStatus::SUCCESS,
                        });
                    }
                }
            }
        }
        CentralEvent::StateUpdate(state) => {
            let on = matches!(state, CentralState::PoweredOn);
            let _ = tx.send(StackEvent::AdapterState { on });
        }
        _ => {}
    }
}

fn find_characteristic(peripheral: &Peripheral, target: &CharTarget) -> Option<Characteristic> {
    peripheral
        .services()
        .into_iter()
        .filter(|s| target.service_uuid.map_or(true, |uuid| s.uuid == uuid))
        .flat_map(|s| s.characteristics.into_iter())
        .find(|c| c.uuid == target.char_uuid)
}

fn find_descriptor(peripheral: &Peripheral, target: &CharTarget) -> Option<Descriptor> {
    let descriptor_uuid = target.descriptor_uuid?;
    find_characteristic(peripheral, target)?
        .descriptors
        .into_iter()
        .find(|d| d.uuid == descriptor_uuid)
}

fn to_gatt_services(peripheral: &Peripheral) -> Vec<GattService> {
    peripheral
        .services()
        .into_iter()
        .map(|s| GattService {
            uuid: s.uuid,
            characteristics: s
                .characteristics
                .into_iter()
                .map(|c| {
                    let mut bits = 0u8;
                    if c.properties.contains(CharPropFlags::READ) {
                        bits |= CharProps::READ;
                    }
                    if c.properties.contains(CharPropFlags::WRITE) {
                        bits |= CharProps::WRITE;
                    }
                    if c.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
                        bits |= CharProps::WRITE_WITHOUT_RESPONSE;
                    }
                    if c.properties.contains(CharPropFlags::NOTIFY) {
                        bits |= CharProps::NOTIFY;
                    }
                    if c.properties.contains(CharPropFlags::INDICATE) {
                        bits |= CharProps::INDICATE;
                    }
                    if c
                        .properties
                        .contains(CharPropFlags::AUTHENTICATED_SIGNED_WRITES)
                    {
                        bits |= CharProps::SIGNED_WRITE;
                    }
                    if c.properties.contains(CharPropFlags::BROADCAST) {
                        bits |= CharProps::BROADCAST;
                    }
                    GattCharacteristic {
                        uuid: c.uuid,
                        properties: CharProps::new(bits),
                        descriptors: c
                            .descriptors
                            .into_iter()
                            .map(|d| GattDescriptor { uuid: d.uuid })
                            .collect(),
                    }
                })
                .collect(),
        })
        .collect()
}

/// Forward the peripheral's notification stream until it ends.
async fn pump_notifications(peripheral: Peripheral, mac: MacAddr, tx: StackEventSender) {
    let mut stream = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%mac, "notification stream unavailable: {e}");
            return;
        }
    };
    while let Some(notification) = stream.next().await {
        let _ = tx.send(StackEvent::Notification {
            mac,
            target: CharTarget::characteristic(notification.uuid),
            value: notification.value,
            is_indication: false,
        });
    }
    debug!(%mac, "notification stream ended");
}

impl BleStack for BtleplugStack {
    fn is_powered(&self) -> bool {
        // btleplug offers no synchronous power query; the bridge task
        // reports the real state as soon as the adapter is acquired.
        true
    }

    fn set_power(&mut self, on: bool) {
        warn!(on, "adapter power control is not available on this backend");
    }

    fn supports(&self, op: StackOp) -> bool {
        matches!(op, StackOp::Rssi)
    }

    fn start_scan(&mut self, params: &ScanParams) {
        let inner = self.inner.clone();
        let filter = ScanFilter {
            services: params.services.clone(),
        };
        self.spawn(async move {
            let adapter = inner.adapter.lock().await.clone();
            if let Some(adapter) = adapter {
                if let Err(e) = adapter.start_scan(filter).await {
                    warn!("start_scan failed: {e}");
                }
            }
        });
    }

    fn stop_scan(&mut self) {
        let inner = self.inner.clone();
        self.spawn(async move {
            let adapter = inner.adapter.lock().await.clone();
            if let Some(adapter) = adapter {
                if let Err(e) = adapter.stop_scan().await {
                    debug!("stop_scan failed: {e}");
                }
            }
        });
    }

    fn connect(&mut self, mac: MacAddr, auto_connect: bool) {
        // btleplug has no auto-connect mode; the flag is accepted and
        // ignored so retry heuristics stay uniform across backends.
        let _ = auto_connect;
        let inner = self.inner.clone();
        let tx = self.tx.clone();
        self.spawn(async move {
            let Some(peripheral) = peripheral_for(&inner, mac).await else {
                let _ = tx.send(StackEvent::ConnectFailed {
                    mac,
                    status: GattStatus::FAILURE,
                });
                return;
            };
            match peripheral.connect().await {
                Ok(()) => {
                    tokio::spawn(pump_notifications(peripheral.clone(), mac, tx.clone()));
                    let _ = tx.send(StackEvent::Connected { mac });
                }
                Err(e) => {
                    debug!(%mac, "connect failed: {e}");
                    let _ = tx.send(StackEvent::ConnectFailed {
                        mac,
                        status: GattStatus::FAILURE,
                    });
                }
            }
        });
    }

    fn disconnect(&mut self, mac: MacAddr) {
        let inner = self.inner.clone();
        let tx = self.tx.clone();
        self.spawn(async move {
            if let Some(peripheral) = peripheral_for(&inner, mac).await {
                if let Err(e) = peripheral.disconnect().await {
                    debug!(%mac, "disconnect failed: {e}");
                    // The bridge never sees a disconnect event in this
                    // case; report it so the task resolves.
                    let _ = tx.send(StackEvent::Disconnected {
                        mac,
                        status: GattStatus::FAILURE,
                    });
                }
            }
        });
    }

    fn discover_services(&mut self, mac: MacAddr) {
        let inner = self.inner.clone();
        let tx = self.tx.clone();
        self.spawn(async move {
            let Some(peripheral) = peripheral_for(&inner, mac).await else {
                let _ = tx.send(StackEvent::ServiceDiscoveryFailed {
                    mac,
                    status: GattStatus::FAILURE,
                });
                return;
            };
            match peripheral.discover_services().await {
                Ok(()) => {
                    let services = to_gatt_services(&peripheral);
                    let _ = tx.send(StackEvent::ServicesDiscovered { mac, services });
                }
                Err(e) => {
                    debug!(%mac, "service discovery failed: {e}");
                    let _ = tx.send(StackEvent::ServiceDiscoveryFailed {
                        mac,
                        status: GattStatus::FAILURE,
                    });
                }
            }
        });
    }

    fn refresh_gatt_database(&mut self, _mac: MacAddr) {
        // btleplug keeps no refreshable cache; the follow-up discovery
        // re-reads the database.
    }

    fn read_characteristic(&mut self, mac: MacAddr, target: &CharTarget) {
        let inner = self.inner.clone();
        let tx = self.tx.clone();
        let target = *target;
        self.spawn(async move {
            let result = async {
                let peripheral = peripheral_for(&inner, mac).await?;
                let characteristic = find_characteristic(&peripheral, &target)?;
                peripheral.read(&characteristic).await.ok()
            }
            .await;
            match result {
                Some(value) => {
                    let _ = tx.send(StackEvent::CharacteristicRead {
                        mac,
                        target,
                        value,
                        status: GattStatus::SUCCESS,
                    });
                }
                None => {
                    let _ = tx.send(StackEvent::CharacteristicRead {
                        mac,
                        target,
                        value: Vec::new(),
                        status: GattStatus::FAILURE,
                    });
                }
            }
        });
    }

    fn write_characteristic(
        &mut self,
        mac: MacAddr,
        target: &CharTarget,
        value: &[u8],
        write_type: GattWriteType,
    ) {
        let inner = self.inner.clone();
        let tx = self.tx.clone();
        let target = *target;
        let value = value.to_vec();
        let write_type = match write_type {
            GattWriteType::WithResponse => WriteType::WithResponse,
            // Signed writes are not exposed; a command write is the
            // closest the backend offers.
            GattWriteType::WithoutResponse | GattWriteType::Signed => WriteType::WithoutResponse,
        };
        self.spawn(async move {
            let ok = async {
                let peripheral = peripheral_for(&inner, mac).await?;
                let characteristic = find_characteristic(&peripheral, &target)?;
                peripheral
                    .write(&characteristic, &value, write_type)
                    .await
                    .ok()
            }
            .await
            .is_some();
            let _ = tx.send(StackEvent::CharacteristicWritten {
                mac,
                target,
                status: if ok {
                    GattStatus::SUCCESS
                } else {
                    GattStatus::FAILURE
                },
            });
        });
    }

    fn read_descriptor(&mut self, mac: MacAddr, target: &CharTarget) {
        let inner = self.inner.clone();
        let tx = self.tx.clone();
        let target = *target;
        self.spawn(async move {
            let result = async {
                let peripheral = peripheral_for(&inner, mac).await?;
                let descriptor = find_descriptor(&peripheral, &target)?;
                peripheral.read_descriptor(&descriptor).await.ok()
            }
            .await;
            match result {
                Some(value) => {
                    let _ = tx.send(StackEvent::DescriptorRead {
                        mac,
                        target,
                        value,
                        status: GattStatus::SUCCESS,
                    });
                }
                None => {
                    let _ = tx.send(StackEvent::DescriptorRead {
                        mac,
                        target,
                        value: Vec::new(),
                        status: GattStatus::FAILURE,
                    });
                }
            }
        });
    }

    fn write_descriptor(&mut self, mac: MacAddr, target: &CharTarget, value: &[u8]) {
        let inner = self.inner.clone();
        let tx = self.tx.clone();
        let target = *target;
        let value = value.to_vec();
        self.spawn(async move {
            let ok = async {
                let peripheral = peripheral_for(&inner, mac).await?;
                let descriptor = find_descriptor(&peripheral, &target)?;
                peripheral.write_descriptor(&descriptor, &value).await.ok()
            }
            .await
            .is_some();
            let _ = tx.send(StackEvent::DescriptorWritten {
                mac,
                target,
                status: if ok {
                    GattStatus::SUCCESS
                } else {
                    GattStatus::FAILURE
                },
            });
        });
    }

    fn set_notify(&mut self, mac: MacAddr, target: &CharTarget, enabled: bool) {
        let inner = self.inner.clone();
        let tx = self.tx.clone();
        let target = *target;
        self.spawn(async move {
            let ok = async {
                let peripheral = peripheral_for(&inner, mac).await?;
                let characteristic = find_characteristic(&peripheral, &target)?;
                if enabled {
                    peripheral.subscribe(&characteristic).await.ok()
                } else {
                    peripheral.unsubscribe(&characteristic).await.ok()
                }
            }
            .await
            .is_some();
            let _ = tx.send(StackEvent::NotifyStateChanged {
                mac,
                target,
                enabled,
                status: if ok {
                    GattStatus::SUCCESS
                } else {
                    GattStatus::FAILURE
                },
            });
        });
    }

    fn read_rssi(&mut self, mac: MacAddr) {
        let inner = self.inner.clone();
        let tx = self.tx.clone();
        self.spawn(async move {
            let rssi = async {
                let peripheral = peripheral_for(&inner, mac).await?;
                peripheral.properties().await.ok().flatten()?.rssi
            }
            .await;
            match rssi {
                Some(rssi) => {
                    let _ = tx.send(StackEvent::RssiRead {
                        mac,
                        rssi,
                        status: GattStatus::SUCCESS,
                    });
                }
                None => {
                    let _ = tx.send(StackEvent::RssiRead {
                        mac,
                        rssi: 0,
                        status: GattStatus::FAILURE,
                    });
                }
            }
        });
    }

    fn request_mtu(&mut self, mac: MacAddr, _mtu: u16) {
        let _ = self.tx.send(StackEvent::MtuChanged {
            mac,
            mtu: 0,
            status: GattStatus::FAILURE,
        });
    }

    fn request_connection_priority(&mut self, mac: MacAddr, priority: ConnectionPriority) {
        let _ = self.tx.send(StackEvent::ConnectionPriorityChanged {
            mac,
            priority,
            status: GattStatus::FAILURE,
        });
    }

    fn set_phy(&mut self, mac: MacAddr, phys: PhyOptions) {
        let _ = self.tx.send(StackEvent::PhyUpdated {
            mac,
            phys,
            status: GattStatus::FAILURE,
        });
    }

    fn read_phy(&mut self, mac: MacAddr) {
        let _ = self.tx.send(StackEvent::PhyRead {
            mac,
            phys: PhyOptions::default(),
            status: GattStatus::FAILURE,
        });
    }

    fn begin_reliable_write(&mut self, _mac: MacAddr) {}

    fn execute_reliable_write(&mut self, mac: MacAddr) {
        let _ = self.tx.send(StackEvent::ReliableWriteCompleted {
            mac,
            status: GattStatus::FAILURE,
        });
    }

    fn abort_reliable_write(&mut self, _mac: MacAddr) {}

    fn create_bond(&mut self, mac: MacAddr) {
        let _ = self.tx.send(StackEvent::BondStateChanged {
            mac,
            state: BondState::None,
            failure: Some(GattStatus::FAILURE),
        });
    }

    fn remove_bond(&mut self, mac: MacAddr) {
        let _ = self.tx.send(StackEvent::BondStateChanged {
            mac,
            state: BondState::None,
            failure: None,
        });
    }

    fn force_crash_resolver_flush(&mut self) {
        // Nothing to flush on this backend; report completion so the
        // resolver task resolves.
        let _ = self.tx.send(StackEvent::CrashResolverFlushed);
    }
}
