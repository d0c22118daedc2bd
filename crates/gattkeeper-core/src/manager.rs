//! The application-facing manager.
//!
//! [`BleManager`] is a cheap-to-clone handle over the update worker. Every
//! method posts work to the worker and, where the call "does something",
//! returns the synchronous gate event: a null event (`is_null() == true`)
//! means the call passed the gate and exactly one asynchronous event will
//! follow on the corresponding listener; a non-null event is itself the
//! final outcome and nothing follows.
//!
//! Only one manager should exist per process: the native adapter is a
//! process-global resource.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use gattkeeper_types::{
    BondState, ChangeIntent, CharTarget, ConnectionPriority, DeviceState, GattWriteType, MacAddr,
    PhyOptions, RwStatus, StateMask,
};

use crate::config::{DeviceConfig, ManagerConfig};
use crate::dispatch::Dispatcher;
use crate::engine::{Command, Engine};
use crate::error::{Error, Result};
use crate::events::{
    BondEvent, ConnectEvent, ConnectFailEvent, ConnectOutcome, DiscoveryEvent,
    HistoricalDataLoadEvent, NotificationEvent, ReadWriteEvent, RwOp, StateChangeEvent,
};
use crate::historical::{HistoricalCursor, HistoricalDatum, HistoricalStore};
use crate::listener::{EventListener, ListenerId};
use crate::scan::estimate_distance;
use crate::stack::{BleStack, ScanParams, StackEventSender};
use crate::task::{TaskKind, TaskPayload};
use crate::transaction::{GattTransaction, OtaWriteTransaction, TxnKind};
use crate::update_loop;

/// Immutable snapshot of one device's public state.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub mac: MacAddr,
    pub name: Option<String>,
    pub state_mask: StateMask,
    pub rssi: Option<i16>,
    pub mtu: u16,
    /// Largest single-PDU write payload at the negotiated MTU.
    pub effective_write_payload: usize,
    pub bond_state: BondState,
    pub connection_priority: ConnectionPriority,
    pub phy: PhyOptions,
    pub average_read_time: Option<Duration>,
    pub average_write_time: Option<Duration>,
    /// Log-distance estimate from the last RSSI sample, when one exists.
    pub estimated_distance_m: Option<f64>,
    pub advertised_services: Vec<Uuid>,
    pub manufacturer_id: Option<u16>,
}

struct Inner {
    cmd_tx: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    config: ManagerConfig,
    store: Option<Arc<dyn HistoricalStore>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle to the BLE central core.
#[derive(Clone)]
pub struct BleManager {
    inner: Arc<Inner>,
}

impl BleManager {
    /// Create a manager over the default btleplug backend.
    ///
    /// Must be called from within a tokio runtime: the update worker and
    /// the backend's bridge tasks are spawned immediately.
    #[cfg(feature = "btleplug-backend")]
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_stack(config, |tx| {
            Box::new(crate::platform::BtleplugStack::new(tx))
        })
    }

    /// Create a manager over the default backend with a historical store.
    #[cfg(feature = "btleplug-backend")]
    pub fn with_store(config: ManagerConfig, store: Arc<dyn HistoricalStore>) -> Self {
        Self::with_stack_and_store(config, Some(store), |tx| {
            Box::new(crate::platform::BtleplugStack::new(tx))
        })
    }

    /// Create a manager over a caller-provided transport.
    ///
    /// The factory receives the sender the transport must report its
    /// callbacks through.
    pub fn with_stack(
        config: ManagerConfig,
        make: impl FnOnce(StackEventSender) -> Box<dyn BleStack>,
    ) -> Self {
        Self::with_stack_and_store(config, None, make)
    }

    /// Create a manager over a caller-provided transport and store.
    pub fn with_stack_and_store(
        config: ManagerConfig,
        store: Option<Arc<dyn HistoricalStore>>,
        make: impl FnOnce(StackEventSender) -> Box<dyn BleStack>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (stack_tx, mut stack_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        // Bridge raw stack events into the command mailbox.
        {
            let cmd_tx = cmd_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        ev = stack_rx.recv() => match ev {
                            Some(ev) => {
                                if cmd_tx.send(Command::Stack(ev)).is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }
            });
        }

        let stack = make(stack_tx);
        let dispatcher = Dispatcher::new(config.post_callbacks_to_main_thread, cancel.clone());
        let engine = Engine::new(
            config.clone(),
            stack,
            store.clone(),
            cmd_tx.clone(),
            dispatcher,
        );
        tokio::spawn(update_loop::run(engine, cmd_rx, cancel.clone()));

        BleManager {
            inner: Arc::new(Inner {
                cmd_tx,
                cancel,
                config,
                store,
            }),
        }
    }

    /// The configuration this manager was built with.
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Stop the update worker, cancelling all pending work.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    async fn with_engine<T, F>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&mut Engine) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.inner
            .cmd_tx
            .send(Command::Post(Box::new(move |engine| {
                let _ = tx.send(f(engine));
            })))
            .ok()?;
        rx.await.ok()
    }

    // ==================== Discovery ====================

    /// Start scanning. Returns false when a scan is already running.
    pub async fn start_scan(&self, params: ScanParams) -> bool {
        self.with_engine(move |e| e.op_start_scan(params))
            .await
            .unwrap_or(false)
    }

    /// Stop any running or queued scan.
    pub async fn stop_scan(&self) {
        let _ = self.with_engine(|e| e.op_stop_scan()).await;
    }

    /// Create (or keep) a device entry without connecting.
    pub async fn register_device(&self, mac: MacAddr) {
        let _ = self.with_engine(move |e| e.ensure_device(mac)).await;
    }

    /// Forget a device: cancel its tasks and drop its entry.
    pub async fn undiscover(&self, mac: MacAddr) -> bool {
        self.with_engine(move |e| e.op_undiscover(mac))
            .await
            .unwrap_or(false)
    }

    // ==================== Connection ====================

    /// Connect and run the full ladder up to `Initialized`.
    pub async fn connect(&self, mac: MacAddr) -> ConnectEvent {
        self.connect_inner(mac, None).await
    }

    /// Connect with per-device configuration (auth/init transactions,
    /// reconnect policy).
    pub async fn connect_with_config(&self, mac: MacAddr, config: DeviceConfig) -> ConnectEvent {
        self.connect_inner(mac, Some(config)).await
    }

    async fn connect_inner(&self, mac: MacAddr, config: Option<DeviceConfig>) -> ConnectEvent {
        self.with_engine(move |e| e.op_connect(mac, config))
            .await
            .unwrap_or_else(|| shutdown_connect_event(mac))
    }

    /// Disconnect, cancelling every pending operation for the device.
    /// Returns false when there was nothing to disconnect.
    pub async fn disconnect(&self, mac: MacAddr) -> bool {
        self.with_engine(move |e| e.op_disconnect(mac))
            .await
            .unwrap_or(false)
    }

    // ==================== GATT operations ====================

    pub async fn read(&self, mac: MacAddr, target: CharTarget) -> ReadWriteEvent {
        self.with_engine(move |e| e.op_read(mac, target))
            .await
            .unwrap_or_else(|| shutdown_rw_event(mac, RwOp::Read))
    }

    /// Write with the default (acknowledged) write type.
    pub async fn write(&self, mac: MacAddr, target: CharTarget, value: Vec<u8>) -> ReadWriteEvent {
        self.write_with_type(mac, target, value, GattWriteType::WithResponse)
            .await
    }

    pub async fn write_with_type(
        &self,
        mac: MacAddr,
        target: CharTarget,
        value: Vec<u8>,
        write_type: GattWriteType,
    ) -> ReadWriteEvent {
        self.with_engine(move |e| e.op_write(mac, target, value, write_type))
            .await
            .unwrap_or_else(|| shutdown_rw_event(mac, RwOp::Write))
    }

    pub async fn enable_notify(&self, mac: MacAddr, target: CharTarget) -> ReadWriteEvent {
        self.with_engine(move |e| e.op_notify(mac, target, true, None))
            .await
            .unwrap_or_else(|| shutdown_rw_event(mac, RwOp::EnablingNotification))
    }

    /// Enable notifications and, if none arrives within the window, read
    /// the characteristic and surface the value as a pseudo-notification.
    pub async fn enable_notify_with_forced_read(
        &self,
        mac: MacAddr,
        target: CharTarget,
        force_read_timeout: Duration,
    ) -> ReadWriteEvent {
        self.with_engine(move |e| e.op_notify(mac, target, true, Some(force_read_timeout)))
            .await
            .unwrap_or_else(|| shutdown_rw_event(mac, RwOp::EnablingNotification))
    }

    pub async fn disable_notify(&self, mac: MacAddr, target: CharTarget) -> ReadWriteEvent {
        self.with_engine(move |e| e.op_notify(mac, target, false, None))
            .await
            .unwrap_or_else(|| shutdown_rw_event(mac, RwOp::DisablingNotification))
    }

    pub async fn read_descriptor(&self, mac: MacAddr, target: CharTarget) -> ReadWriteEvent {
        self.with_engine(move |e| e.op_descriptor_read(mac, target))
            .await
            .unwrap_or_else(|| shutdown_rw_event(mac, RwOp::Read))
    }

    pub async fn write_descriptor(
        &self,
        mac: MacAddr,
        target: CharTarget,
        value: Vec<u8>,
    ) -> ReadWriteEvent {
        self.with_engine(move |e| e.op_descriptor_write(mac, target, value))
            .await
            .unwrap_or_else(|| shutdown_rw_event(mac, RwOp::Write))
    }

    pub async fn read_rssi(&self, mac: MacAddr) -> ReadWriteEvent {
        self.with_engine(move |e| {
            e.op_stack_param(
                mac,
                TaskKind::ReadRssi,
                TaskPayload::None,
                RwOp::Rssi,
                crate::stack::StackOp::Rssi,
            )
        })
        .await
        .unwrap_or_else(|| shutdown_rw_event(mac, RwOp::Rssi))
    }

    pub async fn set_mtu(&self, mac: MacAddr, mtu: u16) -> ReadWriteEvent {
        self.with_engine(move |e| {
            e.op_stack_param(
                mac,
                TaskKind::SetMtu,
                TaskPayload::Mtu { mtu },
                RwOp::Mtu,
                crate::stack::StackOp::Mtu,
            )
        })
        .await
        .unwrap_or_else(|| shutdown_rw_event(mac, RwOp::Mtu))
    }

    pub async fn set_connection_priority(
        &self,
        mac: MacAddr,
        priority: ConnectionPriority,
    ) -> ReadWriteEvent {
        self.with_engine(move |e| {
            e.op_stack_param(
                mac,
                TaskKind::SetConnectionPriority,
                TaskPayload::Priority { priority },
                RwOp::ConnectionPriority,
                crate::stack::StackOp::ConnectionPriority,
            )
        })
        .await
        .unwrap_or_else(|| shutdown_rw_event(mac, RwOp::ConnectionPriority))
    }

    pub async fn set_phy(&self, mac: MacAddr, phys: PhyOptions) -> ReadWriteEvent {
        self.with_engine(move |e| {
            e.op_stack_param(
                mac,
                TaskKind::SetPhy,
                TaskPayload::PhySet { phys },
                RwOp::PhyOptions,
                crate::stack::StackOp::Phy,
            )
        })
        .await
        .unwrap_or_else(|| shutdown_rw_event(mac, RwOp::PhyOptions))
    }

    pub async fn read_phy(&self, mac: MacAddr) -> ReadWriteEvent {
        self.with_engine(move |e| {
            e.op_stack_param(
                mac,
                TaskKind::ReadPhy,
                TaskPayload::None,
                RwOp::PhyOptions,
                crate::stack::StackOp::Phy,
            )
        })
        .await
        .unwrap_or_else(|| shutdown_rw_event(mac, RwOp::PhyOptions))
    }

    // ==================== Reliable writes ====================

    /// Open a reliable-write session. Subsequent writes are staged until
    /// [`execute_reliable_write`](Self::execute_reliable_write) or
    /// [`abort_reliable_write`](Self::abort_reliable_write).
    pub async fn begin_reliable_write(&self, mac: MacAddr) -> ReadWriteEvent {
        self.with_engine(move |e| e.op_reliable_write(mac, TaskKind::ReliableWriteBegin))
            .await
            .unwrap_or_else(|| shutdown_rw_event(mac, RwOp::ReliableWriteBegin))
    }

    pub async fn execute_reliable_write(&self, mac: MacAddr) -> ReadWriteEvent {
        self.with_engine(move |e| e.op_reliable_write(mac, TaskKind::ReliableWriteExecute))
            .await
            .unwrap_or_else(|| shutdown_rw_event(mac, RwOp::ReliableWriteExecute))
    }

    pub async fn abort_reliable_write(&self, mac: MacAddr) -> ReadWriteEvent {
        self.with_engine(move |e| e.op_reliable_write(mac, TaskKind::ReliableWriteAbort))
            .await
            .unwrap_or_else(|| shutdown_rw_event(mac, RwOp::ReliableWriteAbort))
    }

    // ==================== Bonding ====================

    pub async fn bond(&self, mac: MacAddr) -> BondEvent {
        self.with_engine(move |e| e.op_bond(mac))
            .await
            .unwrap_or_else(|| shutdown_bond_event(mac))
    }

    pub async fn unbond(&self, mac: MacAddr) -> BondEvent {
        self.with_engine(move |e| e.op_unbond(mac))
            .await
            .unwrap_or_else(|| shutdown_bond_event(mac))
    }

    // ==================== Transactions ====================

    /// Run an OTA transfer: the payloads are written to the target in
    /// order while the device holds `PerformingOta`.
    pub async fn perform_ota(
        &self,
        mac: MacAddr,
        target: CharTarget,
        payloads: Vec<Vec<u8>>,
    ) -> ReadWriteEvent {
        self.with_engine(move |e| {
            e.op_perform_transaction(
                mac,
                TxnKind::Ota,
                Box::new(OtaWriteTransaction::new(target, payloads)),
            )
        })
        .await
        .unwrap_or_else(|| shutdown_rw_event(mac, RwOp::Write))
    }

    /// Run an application-defined transaction.
    pub async fn perform_transaction(
        &self,
        mac: MacAddr,
        body: Box<dyn GattTransaction>,
    ) -> ReadWriteEvent {
        self.with_engine(move |e| e.op_perform_transaction(mac, TxnKind::UserCustom, body))
            .await
            .unwrap_or_else(|| shutdown_rw_event(mac, RwOp::Write))
    }

    // ==================== Adapter ====================

    pub async fn turn_ble_on(&self) {
        let _ = self.with_engine(|e| e.op_turn_ble(true, false)).await;
    }

    pub async fn turn_ble_off(&self) {
        let _ = self.with_engine(|e| e.op_turn_ble(false, false)).await;
    }

    /// Whether the adapter is currently powered.
    pub async fn is_ble_on(&self) -> bool {
        self.with_engine(|e| e.is_ble_on()).await.unwrap_or(false)
    }

    /// Recover a wedged native stack: flush the crash resolver, then
    /// power-cycle the adapter.
    pub async fn reset(&self) {
        let _ = self.with_engine(|e| e.op_reset()).await;
    }

    /// Run the crash-resolver flush alone.
    pub async fn resolve_stack_crashes(&self) {
        let _ = self.with_engine(|e| e.op_resolve_crashes()).await;
    }

    // ==================== Device state ====================

    /// Rediscover the device's GATT database after the configured pause.
    pub async fn refresh_gatt_database(&self, mac: MacAddr) {
        let _ = self.with_engine(move |e| e.op_refresh_gatt(mac)).await;
    }

    /// Assign a display name; persisted when configured.
    pub async fn set_name(&self, mac: MacAddr, name: &str) {
        let name = name.to_string();
        let _ = self
            .with_engine(move |e| e.op_set_name(mac, Some(name)))
            .await;
    }

    /// Remove the assigned display name.
    pub async fn clear_name(&self, mac: MacAddr) {
        let _ = self.with_engine(move |e| e.op_set_name(mac, None)).await;
    }

    /// The device's current state mask.
    pub async fn state_mask(&self, mac: MacAddr) -> Option<StateMask> {
        self.with_engine(move |e| e.device(mac).map(|d| d.mask))
            .await
            .flatten()
    }

    /// Whether the device currently holds the given state.
    pub async fn is(&self, mac: MacAddr, state: DeviceState) -> bool {
        self.state_mask(mac)
            .await
            .map(|m| m.contains(state))
            .unwrap_or(false)
    }

    /// Debug rendering of the device's state mask.
    pub async fn print_state(&self, mac: MacAddr) -> Option<String> {
        self.with_engine(move |e| e.device(mac).map(|d| d.print_state()))
            .await
            .flatten()
    }

    /// Immutable snapshot of the device's public state.
    pub async fn device_snapshot(&self, mac: MacAddr) -> Option<DeviceSnapshot> {
        let default_tx_power = self.inner.config.default_tx_power;
        let mtu_overhead = self.inner.config.gatt_write_mtu_overhead;
        self.with_engine(move |e| {
            e.device(mac).map(|d| DeviceSnapshot {
                mac,
                name: d.name().map(String::from),
                state_mask: d.mask,
                rssi: d.rssi,
                mtu: d.mtu,
                effective_write_payload: d.effective_write_payload(mtu_overhead),
                bond_state: d.bond_state,
                connection_priority: d.connection_priority,
                phy: d.phy,
                average_read_time: d.round_trips.read.average(),
                average_write_time: d.round_trips.write.average(),
                estimated_distance_m: d
                    .rssi
                    .map(|rssi| estimate_distance(rssi, d.tx_power_or(default_tx_power))),
                advertised_services: d
                    .scan_record
                    .as_ref()
                    .map(|r| r.services.clone())
                    .unwrap_or_default(),
                manufacturer_id: d.scan_record.as_ref().and_then(|r| r.manufacturer_id),
            })
        })
        .await
        .flatten()
    }

    // ==================== Historical data ====================

    fn store(&self) -> Result<Arc<dyn HistoricalStore>> {
        self.inner.store.clone().ok_or(Error::NoHistoricalStore)
    }

    /// Append one historical entry for `(mac, char_uuid)`.
    pub async fn add_historical_data(
        &self,
        mac: MacAddr,
        char_uuid: Uuid,
        datum: HistoricalDatum,
    ) -> Result<()> {
        let store = self.store()?;
        tokio::task::spawn_blocking(move || store.add(mac, char_uuid, datum))
            .await
            .map_err(|_| Error::ShutDown)??;
        Ok(())
    }

    /// Append many entries in one batch; the iterator is consumed on the
    /// blocking executor, never materialised whole.
    pub async fn add_historical_data_bulk<I>(
        &self,
        mac: MacAddr,
        char_uuid: Uuid,
        data: I,
    ) -> Result<usize>
    where
        I: IntoIterator<Item = HistoricalDatum> + Send + 'static,
        I::IntoIter: Send,
    {
        let store = self.store()?;
        let count = tokio::task::spawn_blocking(move || {
            let mut iter = data.into_iter();
            store.add_bulk(mac, char_uuid, &mut iter)
        })
        .await
        .map_err(|_| Error::ShutDown)??;
        Ok(count)
    }

    /// Number of stored entries for the pair.
    pub async fn historical_data_count(&self, mac: MacAddr, char_uuid: Uuid) -> Result<usize> {
        let store = self.store()?;
        let count = tokio::task::spawn_blocking(move || store.count(mac, char_uuid))
            .await
            .map_err(|_| Error::ShutDown)??;
        Ok(count)
    }

    /// Whether any historical data exists for the device.
    pub async fn has_historical_data(&self, mac: MacAddr, char_uuid: Option<Uuid>) -> Result<bool> {
        let store = self.store()?;
        let has = tokio::task::spawn_blocking(move || store.has_data(mac, char_uuid))
            .await
            .map_err(|_| Error::ShutDown)??;
        Ok(has)
    }

    /// Open a cursor over the pair's stored entries.
    pub async fn historical_cursor(
        &self,
        mac: MacAddr,
        char_uuid: Uuid,
    ) -> Result<Box<dyn HistoricalCursor>> {
        let store = self.store()?;
        let cursor = tokio::task::spawn_blocking(move || store.cursor(mac, char_uuid))
            .await
            .map_err(|_| Error::ShutDown)??;
        Ok(cursor)
    }

    /// Load historical data in the background; completion arrives as a
    /// [`HistoricalDataLoadEvent`] on the historical listeners.
    pub async fn load_historical_data(&self, mac: MacAddr, char_uuid: Option<Uuid>) {
        let _ = self
            .with_engine(move |e| e.op_load_historical(mac, char_uuid))
            .await;
    }

    /// The last persisted disconnect intent for the device.
    pub async fn last_disconnect_intent(&self, mac: MacAddr) -> Result<Option<ChangeIntent>> {
        let store = self.store()?;
        let intent = tokio::task::spawn_blocking(move || store.last_disconnect_intent(mac))
            .await
            .map_err(|_| Error::ShutDown)??;
        Ok(intent)
    }
}

fn shutdown_rw_event(mac: MacAddr, op: RwOp) -> ReadWriteEvent {
    ReadWriteEvent::gate_failure(mac, op, RwStatus::NotConnected)
}

fn shutdown_bond_event(mac: MacAddr) -> BondEvent {
    BondEvent {
        device: mac,
        state: BondState::None,
        status: gattkeeper_types::BondStatus::Cancelled,
        failure_reason: None,
    }
}

fn shutdown_connect_event(mac: MacAddr) -> ConnectEvent {
    ConnectEvent {
        device: mac,
        outcome: ConnectOutcome::Failed(ConnectFailEvent {
            device: mac,
            status: gattkeeper_types::FailureKind::NotConnected,
            gatt_status: None,
            timing: Duration::ZERO,
            highest_state_reached: DeviceState::BleDisconnected,
            bond_failure_reason: None,
            auto_connect_used: false,
            txn_failure_reason: None,
            attempt: 0,
        }),
    }
}

// Listener registration methods. Each slot is a LIFO stack with
// push/pop/set semantics; events are delivered only to the head.

macro_rules! device_listener_slot {
    ($slot:ident, $event:ty, $set:ident, $push:ident, $pop:ident, $pop_specific:ident) => {
        impl BleManager {
            /// Clear the slot's stack and install this listener.
            pub async fn $set(&self, mac: MacAddr, listener: EventListener<$event>) -> bool {
                self.with_engine(move |e| match e.device_mut(mac) {
                    Some(d) => {
                        d.listeners.$slot.set(listener);
                        true
                    }
                    None => false,
                })
                .await
                .unwrap_or(false)
            }

            /// Push a listener; it receives events until popped.
            pub async fn $push(&self, mac: MacAddr, listener: EventListener<$event>) -> bool {
                self.with_engine(move |e| match e.device_mut(mac) {
                    Some(d) => {
                        d.listeners.$slot.push(listener);
                        true
                    }
                    None => false,
                })
                .await
                .unwrap_or(false)
            }

            /// Pop the head listener; the previous one resumes.
            pub async fn $pop(&self, mac: MacAddr) -> bool {
                self.with_engine(move |e| {
                    e.device_mut(mac)
                        .map(|d| d.listeners.$slot.pop())
                        .unwrap_or(false)
                })
                .await
                .unwrap_or(false)
            }

            /// Remove the identified listener wherever it sits.
            pub async fn $pop_specific(&self, mac: MacAddr, id: ListenerId) -> bool {
                self.with_engine(move |e| {
                    e.device_mut(mac)
                        .map(|d| d.listeners.$slot.pop_specific(id))
                        .unwrap_or(false)
                })
                .await
                .unwrap_or(false)
            }
        }
    };
}

device_listener_slot!(
    state,
    StateChangeEvent,
    set_listener_state,
    push_listener_state,
    pop_listener_state,
    pop_listener_state_specific
);
device_listener_slot!(
    connect,
    ConnectEvent,
    set_listener_connect,
    push_listener_connect,
    pop_listener_connect,
    pop_listener_connect_specific
);
device_listener_slot!(
    reconnect,
    ConnectFailEvent,
    set_listener_reconnect,
    push_listener_reconnect,
    pop_listener_reconnect,
    pop_listener_reconnect_specific
);
device_listener_slot!(
    read_write,
    ReadWriteEvent,
    set_listener_read_write,
    push_listener_read_write,
    pop_listener_read_write,
    pop_listener_read_write_specific
);
device_listener_slot!(
    notification,
    NotificationEvent,
    set_listener_notification,
    push_listener_notification,
    pop_listener_notification,
    pop_listener_notification_specific
);
device_listener_slot!(
    bond,
    BondEvent,
    set_listener_bond,
    push_listener_bond,
    pop_listener_bond,
    pop_listener_bond_specific
);
device_listener_slot!(
    historical,
    HistoricalDataLoadEvent,
    set_listener_historical_data_load,
    push_listener_historical_data_load,
    pop_listener_historical_data_load,
    pop_listener_historical_data_load_specific
);

macro_rules! manager_listener_slot {
    ($slot:ident, $event:ty, $set:ident, $push:ident, $pop:ident) => {
        impl BleManager {
            /// Manager-level analogue: sees this event for every device.
            pub async fn $set(&self, listener: EventListener<$event>) {
                let _ = self
                    .with_engine(move |e| e.manager_listeners.$slot.set(listener))
                    .await;
            }

            pub async fn $push(&self, listener: EventListener<$event>) {
                let _ = self
                    .with_engine(move |e| e.manager_listeners.$slot.push(listener))
                    .await;
            }

            pub async fn $pop(&self) -> bool {
                self.with_engine(|e| e.manager_listeners.$slot.pop())
                    .await
                    .unwrap_or(false)
            }
        }
    };
}

manager_listener_slot!(
    discovery,
    DiscoveryEvent,
    set_manager_listener_discovery,
    push_manager_listener_discovery,
    pop_manager_listener_discovery
);
manager_listener_slot!(
    state,
    StateChangeEvent,
    set_manager_listener_state,
    push_manager_listener_state,
    pop_manager_listener_state
);
manager_listener_slot!(
    connect,
    ConnectEvent,
    set_manager_listener_connect,
    push_manager_listener_connect,
    pop_manager_listener_connect
);
manager_listener_slot!(
    reconnect,
    ConnectFailEvent,
    set_manager_listener_reconnect,
    push_manager_listener_reconnect,
    pop_manager_listener_reconnect
);
manager_listener_slot!(
    read_write,
    ReadWriteEvent,
    set_manager_listener_read_write,
    push_manager_listener_read_write,
    pop_manager_listener_read_write
);
manager_listener_slot!(
    notification,
    NotificationEvent,
    set_manager_listener_notification,
    push_manager_listener_notification,
    pop_manager_listener_notification
);
manager_listener_slot!(
    bond,
    BondEvent,
    set_manager_listener_bond,
    push_manager_listener_bond,
    pop_manager_listener_bond
);
manager_listener_slot!(
    historical,
    HistoricalDataLoadEvent,
    set_manager_listener_historical_data_load,
    push_manager_listener_historical_data_load,
    pop_manager_listener_historical_data_load
);
