//! The engine: single-owner state behind the update loop.
//!
//! Everything mutable lives here, owned by the update worker: the device
//! table, the task queue, running transactions, and the listener stacks.
//! Native callbacks and application commands arrive through one mailbox
//! and are applied between ticks; nothing else touches this state.
//!
//! The flow per tick: expire deadlines, pulse reconnect/forced-read/GATT
//! refresh timers, pump transactions, poll the executing task, then fill
//! the executor slot from the queue. Events produced along the way are
//! buffered in the outbox and flushed to listeners at the end of the tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gattkeeper_types::{
    BondState, BondStatus, ChangeIntent, CharTarget, ConnectionPriority, DeviceState, FailureKind,
    GattStatus, GattWriteType, MacAddr, NotifyState, PhyOptions, RwStatus,
};

use crate::clock::Clock;
use crate::config::{DeviceConfig, ManagerConfig};
use crate::device::{Device, ReliableWriteState};
use crate::dispatch::Dispatcher;
use crate::events::{
    BondEvent, ConnectEvent, ConnectFailEvent, ConnectOutcome, DiscoveryEvent, DiscoveryLifecycle,
    HistoricalDataLoadEvent, NotificationEvent, NotificationKind, ReadWriteEvent, RwOp,
    StateChangeEvent,
};
use crate::historical::HistoricalStore;
use crate::listener::ManagerListeners;
use crate::queue::{Preconds, TaskQueue};
use crate::reconnect::{decide, ReconnectPhase, RetryDecision};
use crate::scan::{parse_scan_record, ScanRecord};
use crate::stack::{BleStack, ScanParams, StackEvent, StackOp};
use crate::task::{Task, TaskKind, TaskPayload, TaskPriority, TaskState};
use crate::transaction::{ActiveTxn, GattTransaction, TxnCtx, TxnId, TxnKind, TxnOp};

/// A unit of work for the update worker.
pub(crate) enum Command {
    /// A native stack callback.
    Stack(StackEvent),
    /// A closure to run on the worker (the run-or-post path).
    Post(Box<dyn FnOnce(&mut Engine) + Send>),
}

/// An event waiting to be flushed to listeners at the end of the tick.
#[derive(Debug)]
pub(crate) enum Emitted {
    State(StateChangeEvent),
    Discovery(DiscoveryEvent),
    Connect(ConnectEvent),
    ConnectFail(ConnectFailEvent),
    ReadWrite(ReadWriteEvent),
    Notification(NotificationEvent),
    Bond(BondEvent),
    Historical(HistoricalDataLoadEvent),
}

pub(crate) struct Engine {
    pub(crate) config: ManagerConfig,
    stack: Box<dyn BleStack>,
    devices: HashMap<MacAddr, Device>,
    queue: TaskQueue,
    txns: HashMap<TxnId, ActiveTxn>,
    next_txn_id: u64,
    pub(crate) manager_listeners: ManagerListeners,
    outbox: Vec<Emitted>,
    dispatcher: Dispatcher,
    store: Option<Arc<dyn HistoricalStore>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    pub(crate) clock: Clock,
    ble_on: bool,
}

impl Engine {
    pub(crate) fn new(
        config: ManagerConfig,
        stack: Box<dyn BleStack>,
        store: Option<Arc<dyn HistoricalStore>>,
        cmd_tx: mpsc::UnboundedSender<Command>,
        dispatcher: Dispatcher,
    ) -> Self {
        let ble_on = stack.is_powered();
        Engine {
            config,
            stack,
            devices: HashMap::new(),
            queue: TaskQueue::new(),
            txns: HashMap::new(),
            next_txn_id: 1,
            manager_listeners: ManagerListeners::new(),
            outbox: Vec::new(),
            dispatcher,
            store,
            cmd_tx,
            clock: Clock::new(),
            ble_on,
        }
    }

    pub(crate) fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Stack(event) => self.on_stack_event(event),
            Command::Post(job) => job(self),
        }
    }

    // ==================== Tick ====================

    pub(crate) fn tick(&mut self, now: Instant, dt: Duration) {
        self.check_current_deadline(now);
        self.expire_queued(now);
        self.pulse_reconnects(now);
        self.pulse_devices(now);
        self.pulse_txns(dt);
        self.update_current(now);
        self.fill_executor(now);
    }

    fn preconds(&self) -> Preconds {
        Preconds {
            ble_on: self.ble_on,
            connected: self
                .devices
                .values()
                .filter(|d| d.is(DeviceState::BleConnected))
                .map(|d| d.mac)
                .collect(),
        }
    }

    fn fill_executor(&mut self, now: Instant) {
        loop {
            if self.queue.has_current() {
                break;
            }
            let preconds = self.preconds();
            let Some(task) = self.queue.take_next_ready(&preconds) else {
                break;
            };
            self.start_task(task, now);
        }
    }

    fn check_current_deadline(&mut self, now: Instant) {
        let expired = self
            .queue
            .current()
            .map(|t| t.past_deadline(now))
            .unwrap_or(false);
        if expired {
            let mut task = self.queue.take_current().expect("checked above");
            task.mark(TaskState::TimedOut);
            debug!(kind = ?task.kind, device = ?task.device, "executing task timed out");
            self.conclude(task, now, ConcludeHow::Timeout);
        }
    }

    fn expire_queued(&mut self, now: Instant) {
        for task in self.queue.collect_timed_out(now) {
            debug!(kind = ?task.kind, device = ?task.device, "queued task timed out");
            self.conclude(task, now, ConcludeHow::Timeout);
        }
    }

    fn pulse_reconnects(&mut self, now: Instant) {
        let due: Vec<(MacAddr, bool)> = self
            .devices
            .values()
            .filter(|d| {
                d.reconnect.phase.is_some()
                    && !d.reconnect.pending_connect
                    && d.reconnect.next_attempt_at.map(|t| t <= now).unwrap_or(false)
            })
            .map(|d| (d.mac, d.reconnect.auto_connect))
            .collect();

        for (mac, auto_connect) in due {
            if let Some(device) = self.devices.get_mut(&mac) {
                device.reconnect.next_attempt_at = None;
                device.reconnect.pending_connect = true;
                device.reconnect.attempt += 1;
                device.begin_attempt(now);
                debug!(
                    %mac,
                    auto_connect,
                    attempt = device.reconnect.attempt,
                    substep_retries = device.reconnect.substep_retries,
                    last_failure = ?device.reconnect.last_failure,
                    "reconnect attempt due"
                );
            }
            let task = self.new_task(
                TaskKind::Connect,
                Some(mac),
                TaskPriority::Medium,
                TaskPayload::Connect { auto_connect },
                now,
            );
            self.admit(task, now);
        }
    }

    fn pulse_devices(&mut self, now: Instant) {
        // Forced reads for notifications that never arrived.
        let mut pseudo_reads = Vec::new();
        let mut refreshes = Vec::new();
        for device in self.devices.values_mut() {
            let due: Vec<CharTarget> = device
                .pseudo_notify_deadlines
                .iter()
                .filter(|(_, at)| **at <= now)
                .map(|(t, _)| *t)
                .collect();
            for target in due {
                device.pseudo_notify_deadlines.remove(&target);
                if device.is(DeviceState::BleConnected)
                    && device.notify_state(&target) == NotifyState::Enabled
                {
                    pseudo_reads.push((device.mac, target));
                }
            }
            if device.gatt_refresh_at.map(|at| at <= now).unwrap_or(false) {
                device.gatt_refresh_at = None;
                if device.is(DeviceState::BleConnected) {
                    refreshes.push(device.mac);
                }
            }
        }

        for (mac, target) in pseudo_reads {
            debug!(%mac, %target, "no notification arrived in time, issuing forced read");
            let task = self.new_task(
                TaskKind::Read,
                Some(mac),
                TaskPriority::High,
                TaskPayload::Read {
                    target,
                    pseudo_notification: true,
                },
                now,
            );
            self.admit(task, now);
        }

        for mac in refreshes {
            info!(%mac, "refreshing gatt database");
            self.stack.refresh_gatt_database(mac);
            if let Some(device) = self.devices.get_mut(&mac) {
                device.services.clear();
            }
            self.set_states(
                mac,
                &[],
                &[DeviceState::ServicesDiscovered],
                ChangeIntent::Intentional,
            );
            let task = self.new_task(
                TaskKind::DiscoverServices,
                Some(mac),
                TaskPriority::High,
                TaskPayload::None,
                now,
            );
            self.admit(task, now);
        }
    }

    fn pulse_txns(&mut self, dt: Duration) {
        let ids: Vec<TxnId> = self.txns.keys().copied().collect();
        for id in ids {
            let mut ops = Vec::new();
            let mut verdict = None;
            if let Some(txn) = self.txns.get_mut(&id) {
                let mut ctx = TxnCtx::new(txn.device, &mut ops, &mut verdict);
                txn.body.on_update(&mut ctx, dt);
            } else {
                continue;
            }
            self.apply_txn_callback(id, ops, verdict);
        }
    }

    /// Poll the executing task: scans watch their duration, the crash
    /// resolver watches the recovery flag.
    fn update_current(&mut self, now: Instant) {
        enum Action {
            None,
            ScanDone,
            CrashDone,
        }
        let action = match self.queue.current() {
            Some(task) => match (&task.kind, &task.payload) {
                (TaskKind::Scan, TaskPayload::Scan { params, started_at }) => {
                    match (params.duration, started_at) {
                        (Some(d), Some(at)) if now.saturating_duration_since(*at) >= d => {
                            Action::ScanDone
                        }
                        _ => Action::None,
                    }
                }
                (TaskKind::CrashResolver, TaskPayload::CrashResolver { started: true, .. }) => {
                    if !self.stack.is_crash_recovery_in_progress() {
                        Action::CrashDone
                    } else {
                        Action::None
                    }
                }
                _ => Action::None,
            },
            None => Action::None,
        };

        match action {
            Action::None => {}
            Action::ScanDone => {
                let mut task = self.queue.take_current().expect("scan is current");
                self.stack.stop_scan();
                task.mark(TaskState::Succeeded);
                self.conclude(task, now, ConcludeHow::Silent);
            }
            Action::CrashDone => {
                let mut task = self.queue.take_current().expect("resolver is current");
                task.mark(TaskState::Succeeded);
                info!("crash resolver flush complete");
                self.conclude(task, now, ConcludeHow::Silent);
            }
        }
    }

    // ==================== Task admission & execution ====================

    fn new_task(
        &mut self,
        kind: TaskKind,
        device: Option<MacAddr>,
        priority: TaskPriority,
        payload: TaskPayload,
        now: Instant,
    ) -> Task {
        let id = self.queue.alloc_id();
        Task::new(id, kind, device, priority, payload, &self.config, now)
    }

    /// Admit a task: sweep, maybe preempt, and try to start work this
    /// tick.
    fn admit(&mut self, task: Task, now: Instant) {
        let swept_by_off = task.kind == TaskKind::TurnBleOff;
        let outcome = self.queue.admit(task);
        for cancelled in outcome.cancelled {
            let how = if swept_by_off {
                ConcludeHow::BleOff
            } else {
                ConcludeHow::Disconnected
            };
            self.conclude(cancelled, now, how);
        }
        if outcome.preempt {
            let mut current = self.queue.take_current().expect("preempt implies current");
            if current.requeues_after_interrupt() {
                debug!(kind = ?current.kind, "interrupting and requeueing");
                if current.kind == TaskKind::Scan {
                    self.stack.stop_scan();
                    if let TaskPayload::Scan { started_at, .. } = &mut current.payload {
                        *started_at = None;
                    }
                }
                self.queue.requeue_preserving_seq(current);
            } else {
                debug!(kind = ?current.kind, device = ?current.device, "interrupting");
                current.mark(TaskState::Interrupted);
                self.conclude(current, now, ConcludeHow::Interrupted);
            }
        }
        self.fill_executor(now);
    }

    /// Move a task into the executor slot and issue its native call, or
    /// conclude it immediately when there is nothing to do.
    fn start_task(&mut self, mut task: Task, now: Instant) {
        task.state = TaskState::Armed;
        let mac = task.device;

        // Device-scoped tasks whose device vanished resolve as no-ops.
        if let Some(mac) = mac {
            if !self.devices.contains_key(&mac) && task.kind != TaskKind::Connect {
                task.mark(TaskState::NoOp);
                self.conclude(task, now, ConcludeHow::Silent);
                return;
            }
        }

        match task.kind {
            TaskKind::Connect => self.exec_connect(task, now),
            TaskKind::Disconnect => self.exec_disconnect(task, now),
            TaskKind::DiscoverServices => self.exec_discover(task, now),
            TaskKind::Read => self.exec_read(task, now),
            TaskKind::Write => self.exec_write(task, now),
            TaskKind::Notify => self.exec_notify(task, now),
            TaskKind::ReadDescriptor | TaskKind::WriteDescriptor => {
                self.exec_descriptor(task, now)
            }
            TaskKind::ReadRssi => self.exec_simple(task, now, |stack, mac| stack.read_rssi(mac)),
            TaskKind::SetMtu => {
                let mtu = match &task.payload {
                    TaskPayload::Mtu { mtu } => *mtu,
                    _ => 0,
                };
                self.exec_simple(task, now, move |stack, mac| stack.request_mtu(mac, mtu))
            }
            TaskKind::SetConnectionPriority => {
                let priority = match &task.payload {
                    TaskPayload::Priority { priority } => *priority,
                    _ => ConnectionPriority::Balanced,
                };
                self.exec_simple(task, now, move |stack, mac| {
                    stack.request_connection_priority(mac, priority)
                })
            }
            TaskKind::SetPhy => {
                let phys = match &task.payload {
                    TaskPayload::PhySet { phys } => *phys,
                    _ => PhyOptions::default(),
                };
                self.exec_simple(task, now, move |stack, mac| stack.set_phy(mac, phys))
            }
            TaskKind::ReadPhy => self.exec_simple(task, now, |stack, mac| stack.read_phy(mac)),
            TaskKind::ReliableWriteBegin
            | TaskKind::ReliableWriteExecute
            | TaskKind::ReliableWriteAbort => self.exec_reliable_write(task, now),
            TaskKind::Bond => self.exec_bond(task, now),
            TaskKind::Unbond => self.exec_unbond(task, now),
            TaskKind::Scan => self.exec_scan(task, now),
            TaskKind::TurnBleOn | TaskKind::TurnBleOff => self.exec_turn_ble(task, now),
            TaskKind::CrashResolver => self.exec_crash_resolver(task, now),
            TaskKind::TxnAuth | TaskKind::TxnInit | TaskKind::TxnOta | TaskKind::UserTxn => {
                self.exec_txn_start(task, now)
            }
        }
    }

    fn execute(&mut self, mut task: Task, now: Instant) {
        task.state = TaskState::Executing;
        task.executing_since = Some(now);
        self.queue.set_current(task);
    }

    fn exec_connect(&mut self, task: Task, now: Instant) {
        let mac = task.device.expect("connect has a device");
        let device = self
            .devices
            .entry(mac)
            .or_insert_with(|| Device::new(mac, &self.config));
        if device.is(DeviceState::BleConnected) {
            let mut task = task;
            task.mark(TaskState::Redundant);
            self.conclude(task, now, ConcludeHow::Silent);
            return;
        }
        if device.attempt_started.is_none() {
            device.begin_attempt(now);
        }
        device.reconnect.pending_connect = true;
        let auto_connect = match &task.payload {
            TaskPayload::Connect { auto_connect } => *auto_connect,
            _ => false,
        };
        self.set_states(
            mac,
            &[DeviceState::BleConnecting],
            &[DeviceState::BleDisconnected],
            ChangeIntent::Intentional,
        );
        self.stack.connect(mac, auto_connect);
        self.execute(task, now);
    }

    fn exec_disconnect(&mut self, task: Task, now: Instant) {
        let mac = task.device.expect("disconnect has a device");

        // A disconnect clears the device's whole pending pipeline, even
        // tasks admitted after it.
        let casualties = self.queue.cancel_matching(TaskState::SoftlyCancelled, |t| {
            t.device == Some(mac)
                && t.id != task.id
                && (t.requires_connection() || t.kind == TaskKind::Connect)
        });
        for c in casualties {
            self.conclude(c, now, ConcludeHow::Disconnected);
        }
        self.abandon_device_txns(mac);

        let connected = self
            .devices
            .get(&mac)
            .map(|d| d.is(DeviceState::BleConnected))
            .unwrap_or(false);
        if !connected {
            let mut task = task;
            task.mark(TaskState::NoOp);
            self.finish_local_disconnect(mac, ChangeIntent::Intentional);
            self.conclude(task, now, ConcludeHow::Silent);
            return;
        }
        self.stack.disconnect(mac);
        self.execute(task, now);
    }

    fn exec_discover(&mut self, task: Task, now: Instant) {
        let mac = task.device.expect("discover has a device");
        self.set_states(
            mac,
            &[DeviceState::DiscoveringServices],
            &[],
            ChangeIntent::Intentional,
        );
        self.stack.discover_services(mac);
        self.execute(task, now);
    }

    fn exec_read(&mut self, mut task: Task, now: Instant) {
        let mac = task.device.expect("read has a device");
        let target = match &task.payload {
            TaskPayload::Read { target, .. } => *target,
            _ => unreachable!("read payload"),
        };
        let resolvable = {
            let device = self.devices.get(&mac).expect("checked in start_task");
            device.resolve(&target).is_some()
        };
        if !resolvable {
            task.mark(TaskState::Failed);
            self.conclude(task, now, ConcludeHow::Status(RwStatus::NoMatchingTarget));
            return;
        }
        self.stack.read_characteristic(mac, &target);
        self.execute(task, now);
    }

    fn exec_write(&mut self, mut task: Task, now: Instant) {
        let mac = task.device.expect("write has a device");
        let (target, value, write_type) = match &task.payload {
            TaskPayload::Write {
                target,
                value,
                write_type,
            } => (*target, value.clone(), *write_type),
            _ => unreachable!("write payload"),
        };
        let gate = {
            let device = self.devices.get(&mac).expect("checked in start_task");
            match device.resolve(&target) {
                None => Some(RwStatus::NoMatchingTarget),
                Some((_, ch)) if !ch.properties.supports_write_type(write_type) => {
                    Some(RwStatus::OperationNotSupported)
                }
                Some(_) => None,
            }
        };
        if let Some(status) = gate {
            task.mark(TaskState::Failed);
            self.conclude(task, now, ConcludeHow::Status(status));
            return;
        }

        // Writes during an open reliable-write session are staged locally
        // until execute or abort.
        let staged = {
            let device = self.devices.get_mut(&mac).expect("checked in start_task");
            if let ReliableWriteState::Open { buffer } = &mut device.reliable_write {
                buffer.push((target, value.clone()));
                true
            } else {
                false
            }
        };
        if staged {
            task.mark(TaskState::Succeeded);
            self.conclude(
                task,
                now,
                ConcludeHow::Value {
                    status: RwStatus::Success,
                    data: Some(value),
                    rssi: None,
                    mtu: None,
                    gatt_status: None,
                },
            );
            return;
        }

        self.stack.write_characteristic(mac, &target, &value, write_type);
        self.execute(task, now);
    }

    fn exec_notify(&mut self, mut task: Task, now: Instant) {
        let mac = task.device.expect("notify has a device");
        let (target, enable) = match &task.payload {
            TaskPayload::Notify { target, enable, .. } => (*target, *enable),
            _ => unreachable!("notify payload"),
        };
        let gate = {
            let device = self.devices.get(&mac).expect("checked in start_task");
            match device.resolve(&target) {
                None => Some(RwStatus::NoMatchingTarget),
                Some((_, ch)) if enable && !ch.properties.can_notify() => {
                    Some(RwStatus::OperationNotSupported)
                }
                Some(_) => None,
            }
        };
        if let Some(status) = gate {
            task.mark(TaskState::Failed);
            self.conclude(task, now, ConcludeHow::Status(status));
            return;
        }

        let redundant = {
            let device = self.devices.get(&mac).expect("checked in start_task");
            let current = device.notify_state(&target);
            (enable && current == NotifyState::Enabled)
                || (!enable && current == NotifyState::Disabled)
        };
        if redundant {
            task.mark(TaskState::Redundant);
            self.conclude(task, now, ConcludeHow::Status(RwStatus::Success));
            return;
        }

        if let Some(device) = self.devices.get_mut(&mac) {
            device.notify_states.insert(
                target,
                if enable {
                    NotifyState::Enabling
                } else {
                    NotifyState::Disabling
                },
            );
        }
        self.stack.set_notify(mac, &target, enable);
        self.execute(task, now);
    }

    fn exec_descriptor(&mut self, mut task: Task, now: Instant) {
        let mac = task.device.expect("descriptor op has a device");
        let target = match &task.payload {
            TaskPayload::DescriptorRead { target } => *target,
            TaskPayload::DescriptorWrite { target, .. } => *target,
            _ => unreachable!("descriptor payload"),
        };
        let has_descriptor = {
            let device = self.devices.get(&mac).expect("checked in start_task");
            device
                .resolve(&target.without_descriptor())
                .map(|(_, ch)| {
                    target
                        .descriptor_uuid
                        .map(|d| ch.descriptors.iter().any(|x| x.uuid == d))
                        .unwrap_or(false)
                })
                .unwrap_or(false)
        };
        if !has_descriptor {
            task.mark(TaskState::Failed);
            self.conclude(task, now, ConcludeHow::Status(RwStatus::NoMatchingTarget));
            return;
        }
        match &task.payload {
            TaskPayload::DescriptorRead { .. } => self.stack.read_descriptor(mac, &target),
            TaskPayload::DescriptorWrite { value, .. } => {
                let value = value.clone();
                self.stack.write_descriptor(mac, &target, &value)
            }
            _ => unreachable!(),
        }
        self.execute(task, now);
    }

    fn exec_simple(
        &mut self,
        task: Task,
        now: Instant,
        issue: impl FnOnce(&mut dyn BleStack, MacAddr),
    ) {
        let mac = task.device.expect("device-scoped task");
        issue(self.stack.as_mut(), mac);
        self.execute(task, now);
    }

    fn exec_reliable_write(&mut self, mut task: Task, now: Instant) {
        let mac = task.device.expect("reliable write has a device");
        let device = self.devices.get_mut(&mac).expect("checked in start_task");
        match task.kind {
            TaskKind::ReliableWriteBegin => {
                if device.reliable_write.in_session() {
                    task.mark(TaskState::Failed);
                    self.conclude(task, now, ConcludeHow::Status(RwStatus::Busy));
                    return;
                }
                self.stack.begin_reliable_write(mac);
                device.reliable_write = ReliableWriteState::Open { buffer: Vec::new() };
                task.mark(TaskState::Succeeded);
                self.conclude(task, now, ConcludeHow::Status(RwStatus::Success));
            }
            TaskKind::ReliableWriteAbort => {
                if !device.reliable_write.in_session() {
                    task.mark(TaskState::NoOp);
                    self.conclude(task, now, ConcludeHow::Status(RwStatus::Success));
                    return;
                }
                device.reliable_write = ReliableWriteState::None;
                self.stack.abort_reliable_write(mac);
                task.mark(TaskState::Succeeded);
                self.conclude(task, now, ConcludeHow::Status(RwStatus::Success));
            }
            TaskKind::ReliableWriteExecute => {
                let buffer = match &mut device.reliable_write {
                    ReliableWriteState::Open { buffer } => std::mem::take(buffer),
                    _ => {
                        task.mark(TaskState::Failed);
                        self.conclude(task, now, ConcludeHow::Status(RwStatus::Busy));
                        return;
                    }
                };
                let mut remaining: std::collections::VecDeque<_> = buffer.into();
                match remaining.pop_front() {
                    Some((target, value)) => {
                        device.reliable_write = ReliableWriteState::Committing { remaining };
                        self.stack.write_characteristic(
                            mac,
                            &target,
                            &value,
                            GattWriteType::WithResponse,
                        );
                    }
                    None => {
                        device.reliable_write =
                            ReliableWriteState::Committing {
                                remaining: Default::default(),
                            };
                        self.stack.execute_reliable_write(mac);
                    }
                }
                self.execute(task, now);
            }
            _ => unreachable!(),
        }
    }

    fn exec_bond(&mut self, mut task: Task, now: Instant) {
        let mac = task.device.expect("bond has a device");
        let device = self.devices.get_mut(&mac).expect("checked in start_task");
        if device.bond_state == BondState::Bonded {
            task.mark(TaskState::Redundant);
            self.conclude(task, now, ConcludeHow::BondStatus(BondStatus::Redundant));
            return;
        }
        device.bond_state = BondState::Bonding;
        self.set_states(mac, &[DeviceState::Bonding], &[], ChangeIntent::Intentional);
        self.stack.create_bond(mac);
        self.execute(task, now);
    }

    fn exec_unbond(&mut self, mut task: Task, now: Instant) {
        let mac = task.device.expect("unbond has a device");
        let device = self.devices.get_mut(&mac).expect("checked in start_task");
        if device.bond_state == BondState::None {
            task.mark(TaskState::Redundant);
            self.conclude(task, now, ConcludeHow::BondStatus(BondStatus::Redundant));
            return;
        }
        self.stack.remove_bond(mac);
        self.execute(task, now);
    }

    fn exec_scan(&mut self, mut task: Task, now: Instant) {
        let params = match &mut task.payload {
            TaskPayload::Scan { params, started_at } => {
                *started_at = Some(now);
                params.clone()
            }
            _ => unreachable!("scan payload"),
        };
        self.stack.start_scan(&params);
        self.execute(task, now);
    }

    fn exec_turn_ble(&mut self, mut task: Task, now: Instant) {
        let target_on = task.kind == TaskKind::TurnBleOn;
        if self.ble_on == target_on {
            task.mark(TaskState::Redundant);
            self.conclude(task, now, ConcludeHow::Silent);
            return;
        }
        self.stack.set_power(target_on);
        self.execute(task, now);
    }

    fn exec_crash_resolver(&mut self, mut task: Task, now: Instant) {
        if self.stack.is_crash_recovery_in_progress() {
            // Do not spin behind an already-running recovery: it almost
            // never finishes, and the task would just sit until timeout.
            warn!("crash resolver recovery already in progress");
            task.mark(TaskState::Failed);
            self.conclude(task, now, ConcludeHow::Silent);
            return;
        }
        self.stack.force_crash_resolver_flush();
        if let TaskPayload::CrashResolver { started, .. } = &mut task.payload {
            *started = true;
        }
        self.execute(task, now);
    }

    fn exec_txn_start(&mut self, mut task: Task, now: Instant) {
        let mac = task.device.expect("txn start has a device");
        let txn_id = match &task.payload {
            TaskPayload::Txn { txn_id } => *txn_id,
            _ => unreachable!("txn payload"),
        };
        if !self.txns.contains_key(&txn_id) {
            task.mark(TaskState::NoOp);
            self.conclude(task, now, ConcludeHow::Silent);
            return;
        }
        match task.kind {
            TaskKind::TxnAuth => self.set_states(
                mac,
                &[DeviceState::Authenticating],
                &[],
                ChangeIntent::Intentional,
            ),
            TaskKind::TxnInit => self.set_states(
                mac,
                &[DeviceState::Initializing],
                &[],
                ChangeIntent::Intentional,
            ),
            TaskKind::TxnOta => {
                self.set_states(
                    mac,
                    &[DeviceState::PerformingOta],
                    &[],
                    ChangeIntent::Intentional,
                );
                if self.config.auto_scan_during_ota
                    && !self.queue.any_queued(|t| t.kind == TaskKind::Scan)
                    && self
                        .queue
                        .current()
                        .map(|t| t.kind != TaskKind::Scan)
                        .unwrap_or(true)
                {
                    let scan = self.new_task(
                        TaskKind::Scan,
                        None,
                        TaskPriority::Trivial,
                        TaskPayload::Scan {
                            params: ScanParams::default(),
                            started_at: None,
                        },
                        now,
                    );
                    self.admit(scan, now);
                }
            }
            _ => {}
        }
        task.mark(TaskState::Succeeded);
        self.conclude(task, now, ConcludeHow::Silent);
        self.run_txn_start(txn_id);
    }

    // ==================== Conclusion ====================

    /// Build the outcome event for a finished task, advance the state
    /// machine, feed transactions and the reconnect controller.
    fn conclude(&mut self, task: Task, now: Instant, how: ConcludeHow) {
        debug_assert!(task.state.is_terminal());
        let rw_event = self.outcome_event(&task, now, &how);

        // Feed the device state machine before dispatching.
        self.advance_after(&task, now, &how);

        if let ConcludeHow::BondStatus(status) = &how {
            if let Some(ev) = self.bond_event_for(&task, *status) {
                self.emit(Emitted::Bond(ev));
            }
        }

        if let Some(event) = rw_event {
            if let Some(txn_id) = task.txn {
                self.txn_on_result(txn_id, task.id, &event);
            }
            self.emit(Emitted::ReadWrite(event));
        } else if let Some(txn_id) = task.txn {
            // Bound task with no read/write-shaped outcome (cancelled
            // connect etc): report a failure so the body can react.
            let event = ReadWriteEvent::gate_failure(
                task.device.unwrap_or(MacAddr::ZERO),
                RwOp::Write,
                RwStatus::CancelledFromDisconnect,
            );
            self.txn_on_result(txn_id, task.id, &event);
        }
    }

    /// The read/write-shaped event for this task, when its kind has one.
    fn outcome_event(&mut self, task: &Task, now: Instant, how: &ConcludeHow) -> Option<ReadWriteEvent> {
        let mac = task.device?;
        let op = match (&task.kind, &task.payload) {
            (TaskKind::Read, TaskPayload::Read { pseudo_notification: true, .. }) => {
                RwOp::PseudoNotification
            }
            (TaskKind::Read, _) => RwOp::Read,
            (TaskKind::Write, _) => RwOp::Write,
            (TaskKind::Notify, TaskPayload::Notify { enable: true, .. }) => {
                RwOp::EnablingNotification
            }
            (TaskKind::Notify, _) => RwOp::DisablingNotification,
            (TaskKind::ReadDescriptor, _) => RwOp::Read,
            (TaskKind::WriteDescriptor, _) => RwOp::Write,
            (TaskKind::ReadRssi, _) => RwOp::Rssi,
            (TaskKind::SetMtu, _) => RwOp::Mtu,
            (TaskKind::SetConnectionPriority, _) => RwOp::ConnectionPriority,
            (TaskKind::SetPhy | TaskKind::ReadPhy, _) => RwOp::PhyOptions,
            (TaskKind::ReliableWriteBegin, _) => RwOp::ReliableWriteBegin,
            (TaskKind::ReliableWriteExecute, _) => RwOp::ReliableWriteExecute,
            (TaskKind::ReliableWriteAbort, _) => RwOp::ReliableWriteAbort,
            _ => return None,
        };

        let status = match (&task.state, how) {
            (_, ConcludeHow::Status(status)) => *status,
            (_, ConcludeHow::Value { status, .. }) => *status,
            (TaskState::TimedOut, _) => RwStatus::TimedOut,
            (TaskState::Cancelled, ConcludeHow::BleOff) => RwStatus::CancelledFromBleTurningOff,
            (TaskState::SoftlyCancelled | TaskState::Cancelled | TaskState::Interrupted, _) => {
                match how {
                    ConcludeHow::BleOff => RwStatus::CancelledFromBleTurningOff,
                    _ => RwStatus::CancelledFromDisconnect,
                }
            }
            (TaskState::Succeeded | TaskState::Redundant | TaskState::NoOp, _) => RwStatus::Success,
            (TaskState::Failed, _) => RwStatus::RemoteGattFailure,
            _ => RwStatus::RemoteGattFailure,
        };

        let (service_uuid, char_uuid, descriptor_uuid) = self.event_target(task);
        let (data, rssi, mtu, gatt_status) = match how {
            ConcludeHow::Value {
                data,
                rssi,
                mtu,
                gatt_status,
                ..
            } => (data.clone(), *rssi, *mtu, *gatt_status),
            ConcludeHow::Gatt(status) => (None, None, None, Some(*status)),
            _ => (None, None, None, None),
        };

        let time_total = task.time_total(now);
        let in_ota = self
            .devices
            .get(&mac)
            .map(|d| d.is(DeviceState::PerformingOta))
            .unwrap_or(false);
        let time_ota = if in_ota {
            task.time_executing(now)
        } else {
            Duration::ZERO
        };

        Some(ReadWriteEvent {
            device: mac,
            service_uuid,
            char_uuid,
            descriptor_uuid,
            op,
            status,
            gatt_status,
            data,
            rssi,
            mtu,
            time_total,
            time_ota,
        })
    }

    fn event_target(&self, task: &Task) -> (Option<Uuid>, Option<Uuid>, Option<Uuid>) {
        let target = match &task.payload {
            TaskPayload::Read { target, .. } => Some(*target),
            TaskPayload::Write { target, .. } => Some(*target),
            TaskPayload::Notify { target, .. } => Some(*target),
            TaskPayload::DescriptorRead { target } => Some(*target),
            TaskPayload::DescriptorWrite { target, .. } => Some(*target),
            _ => None,
        };
        match target {
            Some(t) => {
                let service = t.service_uuid.or_else(|| {
                    task.device
                        .and_then(|mac| self.devices.get(&mac))
                        .and_then(|d| d.resolve(&t.without_descriptor()))
                        .map(|(s, _)| s.uuid)
                });
                (service, Some(t.char_uuid), t.descriptor_uuid)
            }
            None => (None, None, None),
        }
    }

    /// Kind-specific state machine and controller consequences of a
    /// terminal task.
    fn advance_after(&mut self, task: &Task, now: Instant, how: &ConcludeHow) {
        let mac = task.device;
        match task.kind {
            TaskKind::Connect => {
                let Some(mac) = mac else { return };
                if let Some(device) = self.devices.get_mut(&mac) {
                    device.reconnect.pending_connect = false;
                }
                match task.state {
                    TaskState::Succeeded | TaskState::Redundant => {}
                    TaskState::TimedOut => {
                        self.connect_attempt_failed(mac, FailureKind::TimedOut, None, None, now)
                    }
                    TaskState::Failed => {
                        let gatt = match how {
                            ConcludeHow::Gatt(status) => Some(*status),
                            _ => None,
                        };
                        self.connect_attempt_failed(
                            mac,
                            FailureKind::RemoteGattFailure,
                            gatt,
                            None,
                            now,
                        )
                    }
                    TaskState::Cancelled | TaskState::SoftlyCancelled | TaskState::Interrupted => {
                        // Swept by a disconnect or adapter-off; those paths
                        // already settled the device state.
                    }
                    _ => {}
                }
            }
            TaskKind::DiscoverServices => match task.state {
                TaskState::Succeeded => {}
                TaskState::TimedOut | TaskState::Failed => {
                    if let Some(mac) = mac {
                        let gatt = match how {
                            ConcludeHow::Gatt(status) => Some(*status),
                            _ => None,
                        };
                        self.connect_attempt_failed(
                            mac,
                            FailureKind::DiscoveringResourcesFailed,
                            gatt,
                            None,
                            now,
                        );
                    }
                }
                _ => {}
            },
            TaskKind::Read | TaskKind::Write => {
                if task.state == TaskState::Succeeded {
                    if let Some(mac) = mac {
                        self.record_round_trip(mac, task, now);
                        if let ConcludeHow::Value {
                            data: Some(data), ..
                        } = how
                        {
                            if let Some(char_uuid) = task_char_uuid(task) {
                                if let Some(device) = self.devices.get_mut(&mac) {
                                    device.cached_values.insert(char_uuid, data.clone());
                                }
                            }
                        }
                    }
                }
            }
            TaskKind::Disconnect => match task.state {
                TaskState::Succeeded | TaskState::TimedOut => {
                    if let Some(mac) = mac {
                        self.finish_local_disconnect(mac, ChangeIntent::Intentional);
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }

    fn record_round_trip(&mut self, mac: MacAddr, task: &Task, now: Instant) {
        let in_ota = self
            .devices
            .get(&mac)
            .map(|d| d.is(DeviceState::PerformingOta))
            .unwrap_or(false);
        if in_ota && !self.config.include_ota_read_write_times_in_average {
            return;
        }
        let elapsed = task.time_executing(now);
        if let Some(device) = self.devices.get_mut(&mac) {
            match task.kind {
                TaskKind::Read => device.round_trips.read.record(elapsed),
                TaskKind::Write => device.round_trips.write.record(elapsed),
                _ => {}
            }
        }
    }

    // ==================== State transitions ====================

    /// Apply a masked transition and emit the state-change event. The
    /// composite bit is recomputed; entering the disconnected state
    /// persists the intent when configured.
    pub(crate) fn set_states(
        &mut self,
        mac: MacAddr,
        set: &[DeviceState],
        clear: &[DeviceState],
        intent: ChangeIntent,
    ) {
        let (prev, new_mask, persist) = {
            let Some(device) = self.devices.get_mut(&mac) else {
                return;
            };
            let prev = device.mask;
            let mut mask = prev;
            for s in clear {
                mask = mask.without(*s);
            }
            for s in set {
                mask = mask.with(*s);
            }
            mask = mask.recompute_composites();
            if mask == prev {
                return;
            }
            device.mask = mask;
            for s in set {
                device.reached(*s);
            }
            let entered_disconnected =
                !prev.contains(DeviceState::BleDisconnected) && mask.contains(DeviceState::BleDisconnected);
            let persist =
                entered_disconnected && device.config.effective_manage_last_disconnect(&self.config);
            (prev, mask, persist)
        };
        debug!(%mac, from = %prev, to = %new_mask, "state transition");
        self.emit(Emitted::State(StateChangeEvent {
            device: mac,
            prev_mask: prev,
            new_mask,
            intent,
        }));
        if persist {
            self.persist_disconnect_intent(mac, intent);
        }
    }

    fn persist_disconnect_intent(&self, mac: MacAddr, intent: ChangeIntent) {
        let Some(store) = self.store.clone() else {
            return;
        };
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.set_last_disconnect_intent(mac, intent) {
                warn!(%mac, "failed to persist disconnect intent: {e}");
            }
        });
    }

    /// The local half of a disconnect: drop connection-scoped state and
    /// settle the mask. Safe to call when already disconnected.
    fn finish_local_disconnect(&mut self, mac: MacAddr, intent: ChangeIntent) {
        if let Some(device) = self.devices.get_mut(&mac) {
            device.clear_connection_state();
            device.attempt_started = None;
            if intent == ChangeIntent::Intentional {
                device.reconnect.reset();
            }
        }
        self.set_states(
            mac,
            &[DeviceState::BleDisconnected],
            &[
                DeviceState::BleConnecting,
                DeviceState::BleConnected,
                DeviceState::DiscoveringServices,
                DeviceState::ServicesDiscovered,
                DeviceState::Authenticating,
                DeviceState::Authenticated,
                DeviceState::Initializing,
                DeviceState::Initialized,
                DeviceState::PerformingOta,
                DeviceState::ReconnectingShortTerm,
                DeviceState::ReconnectingLongTerm,
            ],
            intent,
        );
    }

    // ==================== Connect ladder ====================

    /// A rung of the connect ladder failed. Consult the reconnect
    /// controller and either schedule another attempt or surface the
    /// failure.
    fn connect_attempt_failed(
        &mut self,
        mac: MacAddr,
        failure: FailureKind,
        gatt: Option<GattStatus>,
        txn_reason: Option<FailureKind>,
        now: Instant,
    ) {
        let Some(device) = self.devices.get_mut(&mac) else {
            return;
        };

        let fail = ConnectFailEvent {
            device: mac,
            status: failure,
            gatt_status: gatt,
            timing: device
                .attempt_started
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or(Duration::ZERO),
            highest_state_reached: device.highest_state_this_attempt,
            bond_failure_reason: if failure == FailureKind::BondFailed {
                gatt
            } else {
                None
            },
            auto_connect_used: device.reconnect.auto_connect,
            txn_failure_reason: txn_reason,
            attempt: device.reconnect.attempt.max(1),
        };

        if device.reconnect.phase.is_none() {
            device.reconnect.open_window(ReconnectPhase::ShortTerm, now);
        }
        device.reconnect.pending_connect = false;
        device.reconnect.last_failure = Some(failure);
        // Sub-step failures (past the raw connect) count separately from
        // whole-attempt failures.
        if matches!(
            failure,
            FailureKind::DiscoveringResourcesFailed
                | FailureKind::BondFailed
                | FailureKind::AuthenticationFailed
                | FailureKind::InitializationFailed
        ) {
            device.reconnect.substep_retries += 1;
        }

        // Abandon whatever the attempt had in flight.
        let was_connected = device.is(DeviceState::BleConnected);
        let policy = device.config.effective_reconnect(&self.config).clone();
        let decision = decide(&policy, &device.reconnect, &fail, now);
        debug!(%mac, ?failure, ?decision, "connect attempt failed");

        self.abandon_device_txns(mac);
        if was_connected {
            // Results of the dying connection are ignored from here on.
            self.stack.disconnect(mac);
        }

        let Some(device) = self.devices.get_mut(&mac) else {
            return;
        };
        device.clear_connection_state();

        match decision {
            RetryDecision::RetryNow { auto_connect } => {
                device.reconnect.flipped_once = true;
                device.reconnect.auto_connect = auto_connect;
                device.reconnect.next_attempt_at = Some(now);
                // Stay visibly "connecting" across the silent retry.
                self.set_states(
                    mac,
                    &[DeviceState::BleConnecting],
                    &[
                        DeviceState::BleConnected,
                        DeviceState::DiscoveringServices,
                        DeviceState::ServicesDiscovered,
                        DeviceState::Authenticating,
                        DeviceState::Authenticated,
                        DeviceState::Initializing,
                    ],
                    ChangeIntent::Unintentional,
                );
            }
            RetryDecision::RetryAfter(delay) => {
                device.reconnect.next_attempt_at = Some(now + delay);
                let in_reconnect_window = device.is(DeviceState::ReconnectingShortTerm)
                    || device.is(DeviceState::ReconnectingLongTerm);
                if in_reconnect_window {
                    // Window states already presented; keep them.
                } else {
                    self.set_states(
                        mac,
                        &[DeviceState::BleConnecting],
                        &[
                            DeviceState::BleConnected,
                            DeviceState::DiscoveringServices,
                            DeviceState::ServicesDiscovered,
                            DeviceState::Authenticating,
                            DeviceState::Authenticated,
                            DeviceState::Initializing,
                        ],
                        ChangeIntent::Unintentional,
                    );
                }
            }
            RetryDecision::EnterLongTerm(delay) => {
                device.reconnect.open_window(ReconnectPhase::LongTerm, now);
                device.reconnect.next_attempt_at = Some(now + delay);
                self.set_states(
                    mac,
                    &[DeviceState::ReconnectingLongTerm, DeviceState::BleDisconnected],
                    &[
                        DeviceState::ReconnectingShortTerm,
                        DeviceState::BleConnecting,
                        DeviceState::BleConnected,
                        DeviceState::DiscoveringServices,
                        DeviceState::ServicesDiscovered,
                        DeviceState::Authenticating,
                        DeviceState::Authenticated,
                        DeviceState::Initializing,
                    ],
                    ChangeIntent::Unintentional,
                );
            }
            RetryDecision::GiveUp => {
                info!(%mac, ?failure, "connect attempt abandoned");
                if let Some(device) = self.devices.get_mut(&mac) {
                    device.reconnect.reset();
                }
                self.finish_local_disconnect(mac, ChangeIntent::Unintentional);
                self.emit(Emitted::ConnectFail(fail.clone()));
                self.emit(Emitted::Connect(ConnectEvent {
                    device: mac,
                    outcome: ConnectOutcome::Failed(fail),
                }));
            }
        }
    }

    /// The whole ladder succeeded: the device is initialized.
    fn connect_attempt_succeeded(&mut self, mac: MacAddr) {
        if let Some(device) = self.devices.get_mut(&mac) {
            device.reconnect.reset();
            device.attempt_started = None;
        }
        self.set_states(
            mac,
            &[DeviceState::Initialized],
            &[
                DeviceState::Initializing,
                DeviceState::ReconnectingShortTerm,
                DeviceState::ReconnectingLongTerm,
            ],
            ChangeIntent::Intentional,
        );
        self.emit(Emitted::Connect(ConnectEvent {
            device: mac,
            outcome: ConnectOutcome::Connected,
        }));
    }

    /// After service discovery: authentication, then initialization, then
    /// done — skipping whichever transactions are not configured. A
    /// rediscovery on an already-initialized device (GATT refresh) does
    /// not re-run the ladder.
    fn composer_advance(&mut self, mac: MacAddr, now: Instant) {
        let (auth, init) = match self.devices.get(&mac) {
            Some(d) if d.is(DeviceState::Initialized) => return,
            Some(d) => (
                d.config.auth_factory.clone(),
                d.config.init_factory.clone(),
            ),
            None => return,
        };
        let authenticated = self
            .devices
            .get(&mac)
            .map(|d| d.is(DeviceState::Authenticated))
            .unwrap_or(false);

        if let (Some(factory), false) = (auth, authenticated) {
            let body = factory();
            self.start_transaction(mac, TxnKind::Auth, body, now);
        } else if let Some(factory) = init {
            let body = factory();
            self.start_transaction(mac, TxnKind::Init, body, now);
        } else {
            self.connect_attempt_succeeded(mac);
        }
    }

    // ==================== Transactions ====================

    pub(crate) fn start_transaction(
        &mut self,
        mac: MacAddr,
        kind: TxnKind,
        body: Box<dyn GattTransaction>,
        now: Instant,
    ) -> TxnId {
        let id = TxnId(self.next_txn_id);
        self.next_txn_id += 1;
        self.txns.insert(
            id,
            ActiveTxn {
                id,
                kind,
                device: mac,
                body,
                pending: Default::default(),
                verdict: None,
            },
        );
        if let Some(device) = self.devices.get_mut(&mac) {
            match kind {
                TxnKind::Auth => device.auth_txn = Some(id),
                TxnKind::Init => device.init_txn = Some(id),
                TxnKind::Ota => device.ota_txn = Some(id),
                TxnKind::UserCustom => {}
            }
        }
        let task_kind = match kind {
            TxnKind::Auth => TaskKind::TxnAuth,
            TxnKind::Init => TaskKind::TxnInit,
            TxnKind::Ota => TaskKind::TxnOta,
            TxnKind::UserCustom => TaskKind::UserTxn,
        };
        let task = self.new_task(
            task_kind,
            Some(mac),
            TaskPriority::High,
            TaskPayload::Txn { txn_id: id },
            now,
        );
        self.admit(task, now);
        id
    }

    fn run_txn_start(&mut self, id: TxnId) {
        let mut ops = Vec::new();
        let mut verdict = None;
        if let Some(txn) = self.txns.get_mut(&id) {
            let mut ctx = TxnCtx::new(txn.device, &mut ops, &mut verdict);
            txn.body.on_start(&mut ctx);
        } else {
            return;
        }
        self.apply_txn_callback(id, ops, verdict);
    }

    fn txn_on_result(&mut self, id: TxnId, task_id: crate::task::TaskId, event: &ReadWriteEvent) {
        let mut ops = Vec::new();
        let mut verdict = None;
        if let Some(txn) = self.txns.get_mut(&id) {
            txn.pending.remove(&task_id);
            let mut ctx = TxnCtx::new(txn.device, &mut ops, &mut verdict);
            txn.body.on_result(&mut ctx, event);
        } else {
            return;
        }
        self.apply_txn_callback(id, ops, verdict);
    }

    fn apply_txn_callback(&mut self, id: TxnId, ops: Vec<TxnOp>, verdict: Option<bool>) {
        let now = self.clock.now();
        let mac = match self.txns.get(&id) {
            Some(txn) => txn.device,
            None => return,
        };
        for op in ops {
            let (kind, payload) = match op {
                TxnOp::Read(target) => (
                    TaskKind::Read,
                    TaskPayload::Read {
                        target,
                        pseudo_notification: false,
                    },
                ),
                TxnOp::Write(target, value, write_type) => (
                    TaskKind::Write,
                    TaskPayload::Write {
                        target,
                        value,
                        write_type,
                    },
                ),
                TxnOp::Notify(target, enable) => (
                    TaskKind::Notify,
                    TaskPayload::Notify {
                        target,
                        enable,
                        force_read_timeout: None,
                    },
                ),
            };
            let task = self
                .new_task(kind, Some(mac), TaskPriority::High, payload, now)
                .bound_to(id);
            if let Some(txn) = self.txns.get_mut(&id) {
                txn.pending.insert(task.id);
            }
            self.admit(task, now);
        }
        if let Some(success) = verdict {
            self.finalize_txn(id, success, now);
        }
    }

    fn finalize_txn(&mut self, id: TxnId, success: bool, now: Instant) {
        let Some(txn) = self.txns.remove(&id) else {
            return;
        };
        let mac = txn.device;
        if let Some(device) = self.devices.get_mut(&mac) {
            match txn.kind {
                TxnKind::Auth => device.auth_txn = None,
                TxnKind::Init => device.init_txn = None,
                TxnKind::Ota => device.ota_txn = None,
                TxnKind::UserCustom => {}
            }
        }
        info!(%mac, kind = ?txn.kind, success, "transaction finished");
        match (txn.kind, success) {
            (TxnKind::Auth, true) => {
                self.set_states(
                    mac,
                    &[DeviceState::Authenticated],
                    &[DeviceState::Authenticating],
                    ChangeIntent::Intentional,
                );
                self.composer_advance(mac, now);
            }
            (TxnKind::Auth, false) => {
                self.set_states(
                    mac,
                    &[],
                    &[DeviceState::Authenticating],
                    ChangeIntent::Unintentional,
                );
                self.connect_attempt_failed(
                    mac,
                    FailureKind::AuthenticationFailed,
                    None,
                    Some(FailureKind::AuthenticationFailed),
                    now,
                );
            }
            (TxnKind::Init, true) => {
                self.connect_attempt_succeeded(mac);
            }
            (TxnKind::Init, false) => {
                self.set_states(
                    mac,
                    &[],
                    &[DeviceState::Initializing],
                    ChangeIntent::Unintentional,
                );
                self.connect_attempt_failed(
                    mac,
                    FailureKind::InitializationFailed,
                    None,
                    Some(FailureKind::InitializationFailed),
                    now,
                );
            }
            (TxnKind::Ota, success) => {
                self.set_states(
                    mac,
                    &[],
                    &[DeviceState::PerformingOta],
                    ChangeIntent::Intentional,
                );
                if success && self.config.clear_gatt_on_ota_success {
                    if let Some(device) = self.devices.get_mut(&mac) {
                        device.gatt_refresh_at =
                            Some(now + self.config.default_gatt_refresh_delay);
                    }
                }
            }
            (TxnKind::UserCustom, _) => {}
        }
    }

    /// Drop all transactions for the device without running their failure
    /// cascade (disconnect and adapter-off paths settle state themselves).
    fn abandon_device_txns(&mut self, mac: MacAddr) {
        let ids: Vec<TxnId> = self
            .txns
            .values()
            .filter(|t| t.device == mac)
            .map(|t| t.id)
            .collect();
        for id in ids {
            self.txns.remove(&id);
        }
        if let Some(device) = self.devices.get_mut(&mac) {
            device.auth_txn = None;
            device.init_txn = None;
            device.ota_txn = None;
        }
    }

    // ==================== Stack events ====================

    fn on_stack_event(&mut self, event: StackEvent) {
        let now = self.clock.now();
        match event {
            StackEvent::AdapterState { on } => self.on_adapter_state(on, now),
            StackEvent::Advertisement {
                mac,
                rssi,
                local_name,
                record,
                services,
                manufacturer,
                tx_power,
            } => self.on_advertisement(mac, rssi, local_name, record, services, manufacturer, tx_power, now),
            StackEvent::Connected { mac } => {
                if let Some(mut task) = self.take_current_if(TaskKind::Connect, mac) {
                    task.mark(TaskState::Succeeded);
                    self.set_states(
                        mac,
                        &[DeviceState::BleConnected],
                        &[DeviceState::BleConnecting, DeviceState::BleDisconnected],
                        ChangeIntent::Intentional,
                    );
                    self.conclude(task, now, ConcludeHow::Silent);
                    let discover = self.new_task(
                        TaskKind::DiscoverServices,
                        Some(mac),
                        TaskPriority::High,
                        TaskPayload::None,
                        now,
                    );
                    self.admit(discover, now);
                }
            }
            StackEvent::ConnectFailed { mac, status } => {
                if let Some(mut task) = self.take_current_if(TaskKind::Connect, mac) {
                    task.mark(TaskState::Failed);
                    self.conclude(task, now, ConcludeHow::Gatt(status));
                }
            }
            StackEvent::Disconnected { mac, status } => self.on_disconnected(mac, status, now),
            StackEvent::ServicesDiscovered { mac, services } => {
                if let Some(mut task) = self.take_current_if(TaskKind::DiscoverServices, mac) {
                    if let Some(device) = self.devices.get_mut(&mac) {
                        device.services = services;
                    }
                    task.mark(TaskState::Succeeded);
                    self.set_states(
                        mac,
                        &[DeviceState::ServicesDiscovered],
                        &[DeviceState::DiscoveringServices],
                        ChangeIntent::Intentional,
                    );
                    self.conclude(task, now, ConcludeHow::Silent);
                    self.composer_advance(mac, now);
                }
            }
            StackEvent::ServiceDiscoveryFailed { mac, status } => {
                if let Some(mut task) = self.take_current_if(TaskKind::DiscoverServices, mac) {
                    task.mark(TaskState::Failed);
                    self.conclude(task, now, ConcludeHow::Gatt(status));
                }
            }
            StackEvent::CharacteristicRead {
                mac,
                target,
                value,
                status,
            } => self.on_char_read(mac, target, value, status, now),
            StackEvent::CharacteristicWritten {
                mac,
                target,
                status,
            } => self.on_char_written(mac, target, status, now),
            StackEvent::DescriptorRead {
                mac,
                value,
                status,
                ..
            } => {
                if let Some(mut task) = self.take_current_if(TaskKind::ReadDescriptor, mac) {
                    if status.is_success() {
                        task.mark(TaskState::Succeeded);
                        self.conclude(
                            task,
                            now,
                            ConcludeHow::Value {
                                status: RwStatus::Success,
                                data: Some(value),
                                rssi: None,
                                mtu: None,
                                gatt_status: Some(status),
                            },
                        );
                    } else {
                        task.mark(TaskState::Failed);
                        self.conclude(task, now, ConcludeHow::Gatt(status));
                    }
                }
            }
            StackEvent::DescriptorWritten { mac, status, .. } => {
                if let Some(mut task) = self.take_current_if(TaskKind::WriteDescriptor, mac) {
                    if status.is_success() {
                        task.mark(TaskState::Succeeded);
                        self.conclude(task, now, ConcludeHow::Status(RwStatus::Success));
                    } else {
                        task.mark(TaskState::Failed);
                        self.conclude(task, now, ConcludeHow::Gatt(status));
                    }
                }
            }
            StackEvent::NotifyStateChanged {
                mac,
                target,
                enabled,
                status,
            } => self.on_notify_state_changed(mac, target, enabled, status, now),
            StackEvent::Notification {
                mac,
                target,
                value,
                is_indication,
            } => self.on_notification(mac, target, value, is_indication),
            StackEvent::RssiRead { mac, rssi, status } => {
                if let Some(mut task) = self.take_current_if(TaskKind::ReadRssi, mac) {
                    if status.is_success() {
                        if let Some(device) = self.devices.get_mut(&mac) {
                            device.rssi = Some(rssi);
                        }
                        task.mark(TaskState::Succeeded);
                        self.conclude(
                            task,
                            now,
                            ConcludeHow::Value {
                                status: RwStatus::Success,
                                data: None,
                                rssi: Some(rssi),
                                mtu: None,
                                gatt_status: Some(status),
                            },
                        );
                    } else {
                        task.mark(TaskState::Failed);
                        self.conclude(task, now, ConcludeHow::Gatt(status));
                    }
                }
            }
            StackEvent::MtuChanged { mac, mtu, status } => {
                if let Some(mut task) = self.take_current_if(TaskKind::SetMtu, mac) {
                    if status.is_success() {
                        if let Some(device) = self.devices.get_mut(&mac) {
                            device.mtu = mtu;
                        }
                        task.mark(TaskState::Succeeded);
                        self.conclude(
                            task,
                            now,
                            ConcludeHow::Value {
                                status: RwStatus::Success,
                                data: None,
                                rssi: None,
                                mtu: Some(mtu),
                                gatt_status: Some(status),
                            },
                        );
                    } else {
                        task.mark(TaskState::Failed);
                        self.conclude(task, now, ConcludeHow::Gatt(status));
                    }
                } else if status.is_success() {
                    // Some platforms renegotiate spontaneously.
                    if let Some(device) = self.devices.get_mut(&mac) {
                        device.mtu = mtu;
                    }
                }
            }
            StackEvent::ConnectionPriorityChanged {
                mac,
                priority,
                status,
            } => {
                if let Some(mut task) = self.take_current_if(TaskKind::SetConnectionPriority, mac)
                {
                    if status.is_success() {
                        if let Some(device) = self.devices.get_mut(&mac) {
                            device.connection_priority = priority;
                        }
                        task.mark(TaskState::Succeeded);
                        self.conclude(task, now, ConcludeHow::Status(RwStatus::Success));
                    } else {
                        task.mark(TaskState::Failed);
                        self.conclude(task, now, ConcludeHow::Gatt(status));
                    }
                }
            }
            StackEvent::PhyUpdated { mac, phys, status }
            | StackEvent::PhyRead { mac, phys, status } => {
                let task = self
                    .take_current_if(TaskKind::SetPhy, mac)
                    .or_else(|| self.take_current_if(TaskKind::ReadPhy, mac));
                if let Some(mut task) = task {
                    if status.is_success() {
                        if let Some(device) = self.devices.get_mut(&mac) {
                            device.phy = phys;
                        }
                        task.mark(TaskState::Succeeded);
                        self.conclude(task, now, ConcludeHow::Status(RwStatus::Success));
                    } else {
                        task.mark(TaskState::Failed);
                        self.conclude(task, now, ConcludeHow::Gatt(status));
                    }
                }
            }
            StackEvent::ReliableWriteCompleted { mac, status } => {
                if let Some(mut task) = self.take_current_if(TaskKind::ReliableWriteExecute, mac) {
                    if let Some(device) = self.devices.get_mut(&mac) {
                        device.reliable_write = ReliableWriteState::None;
                    }
                    if status.is_success() {
                        task.mark(TaskState::Succeeded);
                        self.conclude(task, now, ConcludeHow::Status(RwStatus::Success));
                    } else {
                        task.mark(TaskState::Failed);
                        self.conclude(task, now, ConcludeHow::Gatt(status));
                    }
                }
            }
            StackEvent::BondStateChanged {
                mac,
                state,
                failure,
            } => self.on_bond_state_changed(mac, state, failure, now),
            StackEvent::CrashResolverFlushed => {
                if let Some(task) = self.queue.current() {
                    if task.kind == TaskKind::CrashResolver {
                        let mut task = self.queue.take_current().expect("checked");
                        task.mark(TaskState::Succeeded);
                        info!("crash resolver flush complete");
                        self.conclude(task, now, ConcludeHow::Silent);
                    }
                }
            }
        }
        self.fill_executor(now);
    }

    fn on_adapter_state(&mut self, on: bool, now: Instant) {
        if self.ble_on == on {
            return;
        }
        self.ble_on = on;
        info!(on, "adapter power state changed");

        // Settle the power task that asked for this, if any.
        let expect = if on {
            TaskKind::TurnBleOn
        } else {
            TaskKind::TurnBleOff
        };
        if let Some(task) = self.queue.current() {
            if task.kind == expect {
                let mut task = self.queue.take_current().expect("checked");
                task.mark(TaskState::Succeeded);
                self.conclude(task, now, ConcludeHow::Silent);
            }
        }

        if on {
            return;
        }

        // Adapter went dark: everything needing the radio dies now.
        if let Some(task) = self.queue.current() {
            if task.requires_ble_on() {
                let mut task = self.queue.take_current().expect("checked");
                task.mark(TaskState::Cancelled);
                self.conclude(task, now, ConcludeHow::BleOff);
            }
        }
        for task in self
            .queue
            .cancel_matching(TaskState::Cancelled, |t| t.requires_ble_on())
        {
            self.conclude(task, now, ConcludeHow::BleOff);
        }

        let macs: Vec<MacAddr> = self.devices.keys().copied().collect();
        for mac in macs {
            self.abandon_device_txns(mac);
            let was_down = self
                .devices
                .get(&mac)
                .map(|d| d.is(DeviceState::BleDisconnected) && d.reconnect.phase.is_none())
                .unwrap_or(true);
            if !was_down {
                if let Some(device) = self.devices.get_mut(&mac) {
                    // No reconnecting against a dead radio.
                    device.reconnect.reset();
                }
                self.finish_local_disconnect(mac, ChangeIntent::Unintentional);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_advertisement(
        &mut self,
        mac: MacAddr,
        rssi: Option<i16>,
        local_name: Option<String>,
        record: Option<Vec<u8>>,
        services: Vec<Uuid>,
        manufacturer: Option<(u16, Vec<u8>)>,
        tx_power: Option<i8>,
        now: Instant,
    ) {
        let parsed: Option<ScanRecord> = match record {
            Some(raw) => match parse_scan_record(&raw) {
                Ok(rec) => Some(rec),
                Err(e) => {
                    debug!(%mac, "undecodable scan record: {e}");
                    None
                }
            },
            None => Some(ScanRecord::from_parts(
                local_name.clone(),
                services,
                manufacturer,
                tx_power,
            )),
        };
        let name = local_name.or_else(|| parsed.as_ref().and_then(|r| r.local_name.clone()));

        let device = self
            .devices
            .entry(mac)
            .or_insert_with(|| Device::new(mac, &self.config));
        let first = device.record_sighting(now, rssi, name.clone(), parsed);
        let lifecycle = if first {
            DiscoveryLifecycle::Discovered
        } else {
            DiscoveryLifecycle::Rediscovered
        };
        if first {
            self.set_states(
                mac,
                &[DeviceState::Discovered, DeviceState::Advertising],
                &[DeviceState::Undiscovered],
                ChangeIntent::Intentional,
            );
        }
        self.emit(Emitted::Discovery(DiscoveryEvent {
            device: mac,
            name,
            lifecycle,
            rssi,
        }));
    }

    fn on_disconnected(&mut self, mac: MacAddr, status: GattStatus, now: Instant) {
        // An explicit disconnect resolving.
        if let Some(mut task) = self.take_current_if(TaskKind::Disconnect, mac) {
            task.mark(TaskState::Succeeded);
            self.conclude(task, now, ConcludeHow::Silent);
            return;
        }

        let Some(device) = self.devices.get(&mac) else {
            return;
        };

        // A connect attempt dying mid-flight.
        if device.is(DeviceState::ConnectingOverall) && !device.is(DeviceState::BleConnected) {
            if let Some(mut task) = self.take_current_if(TaskKind::Connect, mac) {
                task.mark(TaskState::Failed);
                self.conclude(task, now, ConcludeHow::Gatt(status));
            } else {
                self.connect_attempt_failed(
                    mac,
                    FailureKind::RogueDisconnect,
                    Some(status),
                    None,
                    now,
                );
            }
            return;
        }

        if !device.is(DeviceState::BleConnected) {
            return;
        }

        // Rogue disconnect of an established connection.
        warn!(%mac, %status, "unexpected disconnect");
        if let Some(task) = self.queue.current() {
            if task.device == Some(mac) && task.requires_connection() {
                let mut task = self.queue.take_current().expect("checked");
                task.mark(TaskState::Interrupted);
                self.conclude(task, now, ConcludeHow::Disconnected);
            }
        }
        for task in self.queue.cancel_matching(TaskState::SoftlyCancelled, |t| {
            t.device == Some(mac) && t.requires_connection()
        }) {
            self.conclude(task, now, ConcludeHow::Disconnected);
        }
        self.abandon_device_txns(mac);

        let policy = self
            .devices
            .get(&mac)
            .map(|d| d.config.effective_reconnect(&self.config).clone())
            .unwrap_or_else(|| self.config.reconnect.clone());

        let eligible = {
            let device = self.devices.get(&mac).expect("checked above");
            device.is(DeviceState::ConnectingOverall) || device.is(DeviceState::Initialized)
        };

        if eligible && policy.short_term_timeout > Duration::ZERO {
            if let Some(device) = self.devices.get_mut(&mac) {
                device.clear_connection_state();
                device.reconnect.reset();
                device.reconnect.open_window(ReconnectPhase::ShortTerm, now);
                device.reconnect.next_attempt_at = Some(now);
            }
            self.set_states(
                mac,
                &[DeviceState::BleDisconnected, DeviceState::ReconnectingShortTerm],
                &[
                    DeviceState::BleConnecting,
                    DeviceState::BleConnected,
                    DeviceState::DiscoveringServices,
                    DeviceState::ServicesDiscovered,
                    DeviceState::Authenticating,
                    DeviceState::Authenticated,
                    DeviceState::Initializing,
                    DeviceState::Initialized,
                    DeviceState::PerformingOta,
                ],
                ChangeIntent::Unintentional,
            );
        } else {
            self.finish_local_disconnect(mac, ChangeIntent::Unintentional);
            let fail = ConnectFailEvent {
                device: mac,
                status: FailureKind::RogueDisconnect,
                gatt_status: Some(status),
                timing: Duration::ZERO,
                highest_state_reached: DeviceState::Initialized,
                bond_failure_reason: None,
                auto_connect_used: false,
                txn_failure_reason: None,
                attempt: 1,
            };
            self.emit(Emitted::ConnectFail(fail));
        }
    }

    fn on_char_read(
        &mut self,
        mac: MacAddr,
        target: CharTarget,
        value: Vec<u8>,
        status: GattStatus,
        now: Instant,
    ) {
        let matches = self
            .queue
            .current()
            .map(|t| t.kind == TaskKind::Read && t.device == Some(mac))
            .unwrap_or(false);
        if !matches {
            return;
        }

        if !status.is_success() {
            // One silent retry for the spurious catch-all failure.
            let retry = status.is_retryable()
                && !self
                    .queue
                    .current()
                    .map(|t| t.retried_internally)
                    .unwrap_or(true);
            if retry {
                debug!(%mac, %status, "retrying read after transient failure");
                if let Some(task) = self.queue.current_mut() {
                    task.retried_internally = true;
                }
                self.stack.read_characteristic(mac, &target);
                return;
            }
            let mut task = self.queue.take_current().expect("checked");
            task.mark(TaskState::Failed);
            self.conclude(task, now, ConcludeHow::Gatt(status));
            return;
        }

        let mut task = self.queue.take_current().expect("checked");
        task.mark(TaskState::Succeeded);
        let pseudo = matches!(
            task.payload,
            TaskPayload::Read {
                pseudo_notification: true,
                ..
            }
        );
        if pseudo {
            let service_uuid = self
                .devices
                .get(&mac)
                .and_then(|d| d.resolve(&target))
                .map(|(s, _)| s.uuid);
            self.emit(Emitted::Notification(NotificationEvent {
                device: mac,
                service_uuid,
                char_uuid: target.char_uuid,
                kind: NotificationKind::PseudoNotification,
                data: value.clone(),
            }));
        }
        self.conclude(
            task,
            now,
            ConcludeHow::Value {
                status: RwStatus::Success,
                data: Some(value),
                rssi: None,
                mtu: None,
                gatt_status: Some(status),
            },
        );
    }

    fn on_char_written(
        &mut self,
        mac: MacAddr,
        target: CharTarget,
        status: GattStatus,
        now: Instant,
    ) {
        // A reliable-write commit pumps its staged writes through here.
        let is_rw_execute = self
            .queue
            .current()
            .map(|t| t.kind == TaskKind::ReliableWriteExecute && t.device == Some(mac))
            .unwrap_or(false);
        if is_rw_execute {
            if !status.is_success() {
                let mut task = self.queue.take_current().expect("checked");
                if let Some(device) = self.devices.get_mut(&mac) {
                    device.reliable_write = ReliableWriteState::None;
                }
                self.stack.abort_reliable_write(mac);
                task.mark(TaskState::Failed);
                self.conclude(task, now, ConcludeHow::Gatt(status));
                return;
            }
            let next = match self.devices.get_mut(&mac) {
                Some(device) => match &mut device.reliable_write {
                    ReliableWriteState::Committing { remaining } => remaining.pop_front(),
                    _ => None,
                },
                None => None,
            };
            match next {
                Some((target, value)) => {
                    self.stack
                        .write_characteristic(mac, &target, &value, GattWriteType::WithResponse)
                }
                None => self.stack.execute_reliable_write(mac),
            }
            return;
        }

        let matches = self
            .queue
            .current()
            .map(|t| t.kind == TaskKind::Write && t.device == Some(mac))
            .unwrap_or(false);
        if !matches {
            return;
        }

        if !status.is_success() {
            let retry = status.is_retryable()
                && !self
                    .queue
                    .current()
                    .map(|t| t.retried_internally)
                    .unwrap_or(true);
            if retry {
                debug!(%mac, %status, "retrying write after transient failure");
                let reissue = match self.queue.current_mut() {
                    Some(task) => {
                        task.retried_internally = true;
                        match &task.payload {
                            TaskPayload::Write {
                                target,
                                value,
                                write_type,
                            } => Some((*target, value.clone(), *write_type)),
                            _ => None,
                        }
                    }
                    None => None,
                };
                if let Some((target, value, write_type)) = reissue {
                    self.stack
                        .write_characteristic(mac, &target, &value, write_type);
                    return;
                }
            }
            let mut task = self.queue.take_current().expect("checked");
            task.mark(TaskState::Failed);
            self.conclude(task, now, ConcludeHow::Gatt(status));
            return;
        }

        let mut task = self.queue.take_current().expect("checked");
        task.mark(TaskState::Succeeded);
        let written = match &task.payload {
            TaskPayload::Write { value, .. } => Some(value.clone()),
            _ => None,
        };
        let _ = target;
        self.conclude(
            task,
            now,
            ConcludeHow::Value {
                status: RwStatus::Success,
                data: written,
                rssi: None,
                mtu: None,
                gatt_status: Some(status),
            },
        );
    }

    fn on_notify_state_changed(
        &mut self,
        mac: MacAddr,
        target: CharTarget,
        enabled: bool,
        status: GattStatus,
        now: Instant,
    ) {
        let matches = self
            .queue
            .current()
            .map(|t| t.kind == TaskKind::Notify && t.device == Some(mac))
            .unwrap_or(false);
        if !matches {
            return;
        }
        let mut task = self.queue.take_current().expect("checked");
        let force_read = match &task.payload {
            TaskPayload::Notify {
                force_read_timeout, ..
            } => *force_read_timeout,
            _ => None,
        };

        if status.is_success() {
            if let Some(device) = self.devices.get_mut(&mac) {
                device.notify_states.insert(
                    target,
                    if enabled {
                        NotifyState::Enabled
                    } else {
                        NotifyState::Disabled
                    },
                );
                if enabled {
                    if let Some(timeout) = force_read {
                        device
                            .pseudo_notify_deadlines
                            .insert(target, now + timeout);
                    }
                }
            }
            task.mark(TaskState::Succeeded);
            self.conclude(task, now, ConcludeHow::Status(RwStatus::Success));
        } else {
            if let Some(device) = self.devices.get_mut(&mac) {
                // Revert to the settled state the toggle started from.
                device.notify_states.insert(
                    target,
                    if enabled {
                        NotifyState::Disabled
                    } else {
                        NotifyState::Enabled
                    },
                );
            }
            task.mark(TaskState::Failed);
            self.conclude(
                task,
                now,
                ConcludeHow::Status(RwStatus::FailedToToggleNotification),
            );
        }
    }

    fn on_notification(
        &mut self,
        mac: MacAddr,
        target: CharTarget,
        value: Vec<u8>,
        is_indication: bool,
    ) {
        let Some(device) = self.devices.get_mut(&mac) else {
            return;
        };
        device.cached_values.insert(target.char_uuid, value.clone());
        // A real push satisfies any pending forced-read window.
        let pending: Vec<CharTarget> = device
            .pseudo_notify_deadlines
            .keys()
            .filter(|t| t.char_uuid == target.char_uuid)
            .copied()
            .collect();
        for t in pending {
            device.pseudo_notify_deadlines.remove(&t);
        }
        let service_uuid = device.resolve(&target).map(|(s, _)| s.uuid);
        self.emit(Emitted::Notification(NotificationEvent {
            device: mac,
            service_uuid,
            char_uuid: target.char_uuid,
            kind: if is_indication {
                NotificationKind::Indication
            } else {
                NotificationKind::Notification
            },
            data: value,
        }));
    }

    fn on_bond_state_changed(
        &mut self,
        mac: MacAddr,
        state: BondState,
        failure: Option<GattStatus>,
        now: Instant,
    ) {
        if let Some(device) = self.devices.get_mut(&mac) {
            device.bond_state = state;
        }
        match state {
            BondState::Bonded => {
                self.set_states(
                    mac,
                    &[DeviceState::Bonded],
                    &[DeviceState::Bonding, DeviceState::Unbonded],
                    ChangeIntent::Intentional,
                );
            }
            BondState::None => {
                self.set_states(
                    mac,
                    &[DeviceState::Unbonded],
                    &[DeviceState::Bonding, DeviceState::Bonded],
                    ChangeIntent::Intentional,
                );
            }
            BondState::Bonding => {}
        }

        let current_kind = self.queue.current().map(|t| (t.kind, t.device));
        match current_kind {
            Some((TaskKind::Bond, Some(dev))) if dev == mac && state != BondState::Bonding => {
                let mut task = self.queue.take_current().expect("checked");
                if state == BondState::Bonded {
                    task.mark(TaskState::Succeeded);
                    self.conclude(task, now, ConcludeHow::BondStatus(BondStatus::Success));
                } else {
                    task.mark(TaskState::Failed);
                    self.emit_bond_failure(mac, failure);
                    self.conclude_silent_bond(task, now);
                }
            }
            Some((TaskKind::Unbond, Some(dev))) if dev == mac && state == BondState::None => {
                let mut task = self.queue.take_current().expect("checked");
                task.mark(TaskState::Succeeded);
                self.conclude(task, now, ConcludeHow::BondStatus(BondStatus::Success));
            }
            _ => {
                // Unsolicited change (OS settings, remote): surface it.
                self.emit(Emitted::Bond(BondEvent {
                    device: mac,
                    state,
                    status: if failure.is_some() {
                        BondStatus::Failed
                    } else {
                        BondStatus::Success
                    },
                    failure_reason: failure,
                }));
            }
        }
    }

    fn emit_bond_failure(&mut self, mac: MacAddr, failure: Option<GattStatus>) {
        self.emit(Emitted::Bond(BondEvent {
            device: mac,
            state: BondState::None,
            status: BondStatus::Failed,
            failure_reason: failure,
        }));
    }

    fn conclude_silent_bond(&mut self, task: Task, now: Instant) {
        // Bond event already emitted with the failure detail.
        self.conclude(task, now, ConcludeHow::Silent);
    }

    fn take_current_if(&mut self, kind: TaskKind, mac: MacAddr) -> Option<Task> {
        let matches = self
            .queue
            .current()
            .map(|t| t.kind == kind && t.device == Some(mac))
            .unwrap_or(false);
        if matches {
            self.queue.take_current()
        } else {
            None
        }
    }

    // ==================== Emission ====================

    pub(crate) fn emit(&mut self, event: Emitted) {
        self.outbox.push(event);
    }

    /// Flush the outbox: resolve head listeners now, deliver via the
    /// dispatcher. Delivery order matches commit order.
    pub(crate) fn flush_events(&mut self) {
        let events = std::mem::take(&mut self.outbox);
        for event in events {
            match event {
                Emitted::State(ev) => {
                    let mac = ev.device;
                    let device_tx = self
                        .devices
                        .get_mut(&mac)
                        .and_then(|d| d.listeners.state.head_sender());
                    let mgr_tx = self.manager_listeners.state.head_sender();
                    deliver(&self.dispatcher, device_tx, mgr_tx, ev);
                }
                Emitted::Discovery(ev) => {
                    let mgr_tx = self.manager_listeners.discovery.head_sender();
                    deliver(&self.dispatcher, None, mgr_tx, ev);
                }
                Emitted::Connect(ev) => {
                    let mac = ev.device;
                    let device_tx = self
                        .devices
                        .get_mut(&mac)
                        .and_then(|d| d.listeners.connect.head_sender());
                    let mgr_tx = self.manager_listeners.connect.head_sender();
                    deliver(&self.dispatcher, device_tx, mgr_tx, ev);
                }
                Emitted::ConnectFail(ev) => {
                    let mac = ev.device;
                    let device_tx = self
                        .devices
                        .get_mut(&mac)
                        .and_then(|d| d.listeners.reconnect.head_sender());
                    let mgr_tx = self.manager_listeners.reconnect.head_sender();
                    deliver(&self.dispatcher, device_tx, mgr_tx, ev);
                }
                Emitted::ReadWrite(ev) => {
                    let mac = ev.device;
                    let device_tx = self
                        .devices
                        .get_mut(&mac)
                        .and_then(|d| d.listeners.read_write.head_sender());
                    let mgr_tx = self.manager_listeners.read_write.head_sender();
                    deliver(&self.dispatcher, device_tx, mgr_tx, ev);
                }
                Emitted::Notification(ev) => {
                    let mac = ev.device;
                    let device_tx = self
                        .devices
                        .get_mut(&mac)
                        .and_then(|d| d.listeners.notification.head_sender());
                    let mgr_tx = self.manager_listeners.notification.head_sender();
                    deliver(&self.dispatcher, device_tx, mgr_tx, ev);
                }
                Emitted::Bond(ev) => {
                    let mac = ev.device;
                    let device_tx = self
                        .devices
                        .get_mut(&mac)
                        .and_then(|d| d.listeners.bond.head_sender());
                    let mgr_tx = self.manager_listeners.bond.head_sender();
                    deliver(&self.dispatcher, device_tx, mgr_tx, ev);
                }
                Emitted::Historical(ev) => {
                    let mac = ev.device;
                    let device_tx = self
                        .devices
                        .get_mut(&mac)
                        .and_then(|d| d.listeners.historical.head_sender());
                    let mgr_tx = self.manager_listeners.historical.head_sender();
                    deliver(&self.dispatcher, device_tx, mgr_tx, ev);
                }
            }
        }
    }

    // ==================== Gate operations (called via Post) ====================

    pub(crate) fn ensure_device(&mut self, mac: MacAddr) {
        self.devices
            .entry(mac)
            .or_insert_with(|| Device::new(mac, &self.config));
    }

    pub(crate) fn device_mut(&mut self, mac: MacAddr) -> Option<&mut Device> {
        self.devices.get_mut(&mac)
    }

    pub(crate) fn device(&self, mac: MacAddr) -> Option<&Device> {
        self.devices.get(&mac)
    }

    pub(crate) fn is_ble_on(&self) -> bool {
        self.ble_on
    }

    pub(crate) fn op_connect(&mut self, mac: MacAddr, config: Option<DeviceConfig>) -> ConnectEvent {
        let now = self.clock.now();
        self.ensure_device(mac);
        if let Some(config) = config {
            if let Some(device) = self.devices.get_mut(&mac) {
                device.config = config;
            }
        }
        let device = self.devices.get_mut(&mac).expect("just ensured");
        if device.is(DeviceState::Initialized) {
            let ev = ConnectEvent {
                device: mac,
                outcome: ConnectOutcome::AlreadyConnected,
            };
            self.emit(Emitted::Connect(ev.clone()));
            return ev;
        }
        if device.is(DeviceState::ConnectingOverall) || device.reconnect.phase.is_some() {
            // An attempt is already running; its outcome will arrive.
            return ConnectEvent {
                device: mac,
                outcome: ConnectOutcome::Null,
            };
        }
        device.reconnect.reset();
        device.reconnect.open_window(ReconnectPhase::ShortTerm, now);
        device.reconnect.attempt = 1;
        device.begin_attempt(now);
        device.reconnect.pending_connect = true;
        let task = self
            .new_task(
                TaskKind::Connect,
                Some(mac),
                TaskPriority::Medium,
                TaskPayload::Connect {
                    auto_connect: false,
                },
                now,
            )
            .explicit();
        self.admit(task, now);
        ConnectEvent {
            device: mac,
            outcome: ConnectOutcome::Null,
        }
    }

    pub(crate) fn op_disconnect(&mut self, mac: MacAddr) -> bool {
        let now = self.clock.now();
        let Some(device) = self.devices.get_mut(&mac) else {
            return false;
        };
        let idle = device.is(DeviceState::BleDisconnected)
            && !device.is(DeviceState::ConnectingOverall)
            && device.reconnect.phase.is_none();
        if idle {
            return false;
        }
        // Leaving a reconnect window on purpose.
        device.reconnect.reset();
        let task = self
            .new_task(
                TaskKind::Disconnect,
                Some(mac),
                TaskPriority::Critical,
                TaskPayload::None,
                now,
            )
            .explicit();
        self.admit(task, now);
        true
    }

    fn gate_connected(&mut self, mac: MacAddr, op: RwOp) -> Option<ReadWriteEvent> {
        if !self.ble_on {
            let ev = ReadWriteEvent::gate_failure(mac, op, RwStatus::NotConnected);
            self.emit(Emitted::ReadWrite(ev.clone()));
            return Some(ev);
        }
        let connected = self
            .devices
            .get(&mac)
            .map(|d| d.is(DeviceState::BleConnected))
            .unwrap_or(false);
        if !connected {
            let ev = ReadWriteEvent::gate_failure(mac, op, RwStatus::NotConnected);
            self.emit(Emitted::ReadWrite(ev.clone()));
            return Some(ev);
        }
        None
    }

    fn gate_target(
        &mut self,
        mac: MacAddr,
        target: &CharTarget,
        op: RwOp,
        check: impl Fn(&gattkeeper_types::GattCharacteristic) -> Option<RwStatus>,
    ) -> Option<ReadWriteEvent> {
        let status = match self.devices.get(&mac).and_then(|d| d.resolve(target)) {
            None => Some(RwStatus::NoMatchingTarget),
            Some((_, ch)) => check(ch),
        };
        status.map(|status| {
            let ev = ReadWriteEvent::gate_failure(mac, op, status);
            self.emit(Emitted::ReadWrite(ev.clone()));
            ev
        })
    }

    pub(crate) fn op_read(&mut self, mac: MacAddr, target: CharTarget) -> ReadWriteEvent {
        let now = self.clock.now();
        if let Some(ev) = self.gate_connected(mac, RwOp::Read) {
            return ev;
        }
        if let Some(ev) = self.gate_target(mac, &target, RwOp::Read, |ch| {
            if ch.properties.can_read() {
                None
            } else {
                Some(RwStatus::OperationNotSupported)
            }
        }) {
            return ev;
        }
        let task = self
            .new_task(
                TaskKind::Read,
                Some(mac),
                TaskPriority::Medium,
                TaskPayload::Read {
                    target,
                    pseudo_notification: false,
                },
                now,
            )
            .explicit();
        self.admit(task, now);
        ReadWriteEvent::null(mac, RwOp::Read)
    }

    pub(crate) fn op_write(
        &mut self,
        mac: MacAddr,
        target: CharTarget,
        value: Vec<u8>,
        write_type: GattWriteType,
    ) -> ReadWriteEvent {
        let now = self.clock.now();
        if let Some(ev) = self.gate_connected(mac, RwOp::Write) {
            return ev;
        }
        if let Some(ev) = self.gate_target(mac, &target, RwOp::Write, |ch| {
            if ch.properties.supports_write_type(write_type) {
                None
            } else {
                Some(RwStatus::OperationNotSupported)
            }
        }) {
            return ev;
        }
        let task = self
            .new_task(
                TaskKind::Write,
                Some(mac),
                TaskPriority::Medium,
                TaskPayload::Write {
                    target,
                    value,
                    write_type,
                },
                now,
            )
            .explicit();
        self.admit(task, now);
        ReadWriteEvent::null(mac, RwOp::Write)
    }

    pub(crate) fn op_notify(
        &mut self,
        mac: MacAddr,
        target: CharTarget,
        enable: bool,
        force_read_timeout: Option<Duration>,
    ) -> ReadWriteEvent {
        let now = self.clock.now();
        let op = if enable {
            RwOp::EnablingNotification
        } else {
            RwOp::DisablingNotification
        };
        if let Some(ev) = self.gate_connected(mac, op) {
            return ev;
        }
        if let Some(ev) = self.gate_target(mac, &target, op, |ch| {
            if !enable || ch.properties.can_notify() {
                None
            } else {
                Some(RwStatus::OperationNotSupported)
            }
        }) {
            return ev;
        }
        let task = self
            .new_task(
                TaskKind::Notify,
                Some(mac),
                TaskPriority::Medium,
                TaskPayload::Notify {
                    target,
                    enable,
                    force_read_timeout,
                },
                now,
            )
            .explicit();
        self.admit(task, now);
        ReadWriteEvent::null(mac, op)
    }

    pub(crate) fn op_descriptor_read(&mut self, mac: MacAddr, target: CharTarget) -> ReadWriteEvent {
        let now = self.clock.now();
        if let Some(ev) = self.gate_connected(mac, RwOp::Read) {
            return ev;
        }
        if target.descriptor_uuid.is_none() {
            let ev = ReadWriteEvent::gate_failure(mac, RwOp::Read, RwStatus::NullCharacteristic);
            self.emit(Emitted::ReadWrite(ev.clone()));
            return ev;
        }
        let task = self
            .new_task(
                TaskKind::ReadDescriptor,
                Some(mac),
                TaskPriority::Medium,
                TaskPayload::DescriptorRead { target },
                now,
            )
            .explicit();
        self.admit(task, now);
        ReadWriteEvent::null(mac, RwOp::Read)
    }

    pub(crate) fn op_descriptor_write(
        &mut self,
        mac: MacAddr,
        target: CharTarget,
        value: Vec<u8>,
    ) -> ReadWriteEvent {
        let now = self.clock.now();
        if let Some(ev) = self.gate_connected(mac, RwOp::Write) {
            return ev;
        }
        if target.descriptor_uuid.is_none() {
            let ev = ReadWriteEvent::gate_failure(mac, RwOp::Write, RwStatus::NullCharacteristic);
            self.emit(Emitted::ReadWrite(ev.clone()));
            return ev;
        }
        let task = self
            .new_task(
                TaskKind::WriteDescriptor,
                Some(mac),
                TaskPriority::Medium,
                TaskPayload::DescriptorWrite { target, value },
                now,
            )
            .explicit();
        self.admit(task, now);
        ReadWriteEvent::null(mac, RwOp::Write)
    }

    pub(crate) fn op_stack_param(
        &mut self,
        mac: MacAddr,
        kind: TaskKind,
        payload: TaskPayload,
        op: RwOp,
        required: StackOp,
    ) -> ReadWriteEvent {
        let now = self.clock.now();
        if !self.stack.supports(required) {
            let ev = ReadWriteEvent::gate_failure(mac, op, RwStatus::OperationNotSupported);
            self.emit(Emitted::ReadWrite(ev.clone()));
            return ev;
        }
        if let Some(ev) = self.gate_connected(mac, op) {
            return ev;
        }
        let task = self
            .new_task(kind, Some(mac), TaskPriority::Medium, payload, now)
            .explicit();
        self.admit(task, now);
        ReadWriteEvent::null(mac, op)
    }

    pub(crate) fn op_reliable_write(&mut self, mac: MacAddr, kind: TaskKind) -> ReadWriteEvent {
        let op = match kind {
            TaskKind::ReliableWriteBegin => RwOp::ReliableWriteBegin,
            TaskKind::ReliableWriteExecute => RwOp::ReliableWriteExecute,
            _ => RwOp::ReliableWriteAbort,
        };
        self.op_stack_param(mac, kind, TaskPayload::None, op, StackOp::ReliableWrite)
    }

    pub(crate) fn op_bond(&mut self, mac: MacAddr) -> BondEvent {
        let now = self.clock.now();
        if !self.stack.supports(StackOp::Bond) {
            let ev = BondEvent {
                device: mac,
                state: BondState::None,
                status: BondStatus::Failed,
                failure_reason: None,
            };
            self.emit(Emitted::Bond(ev.clone()));
            return ev;
        }
        self.ensure_device(mac);
        let task = self
            .new_task(
                TaskKind::Bond,
                Some(mac),
                TaskPriority::ForExplicitBondingOnly,
                TaskPayload::None,
                now,
            )
            .explicit();
        self.admit(task, now);
        BondEvent {
            device: mac,
            state: self
                .devices
                .get(&mac)
                .map(|d| d.bond_state)
                .unwrap_or(BondState::None),
            status: BondStatus::Null,
            failure_reason: None,
        }
    }

    pub(crate) fn op_unbond(&mut self, mac: MacAddr) -> BondEvent {
        let now = self.clock.now();
        self.ensure_device(mac);
        let task = self
            .new_task(
                TaskKind::Unbond,
                Some(mac),
                TaskPriority::ForExplicitBondingOnly,
                TaskPayload::None,
                now,
            )
            .explicit();
        self.admit(task, now);
        BondEvent {
            device: mac,
            state: self
                .devices
                .get(&mac)
                .map(|d| d.bond_state)
                .unwrap_or(BondState::None),
            status: BondStatus::Null,
            failure_reason: None,
        }
    }

    pub(crate) fn op_perform_transaction(
        &mut self,
        mac: MacAddr,
        kind: TxnKind,
        body: Box<dyn GattTransaction>,
    ) -> ReadWriteEvent {
        let now = self.clock.now();
        let op = RwOp::Write;
        let device = match self.devices.get(&mac) {
            Some(d) => d,
            None => {
                let ev = ReadWriteEvent::gate_failure(mac, op, RwStatus::NotConnected);
                self.emit(Emitted::ReadWrite(ev.clone()));
                return ev;
            }
        };
        if kind == TxnKind::Ota {
            if !device.is(DeviceState::Initialized) {
                let ev = ReadWriteEvent::gate_failure(mac, op, RwStatus::NotConnected);
                self.emit(Emitted::ReadWrite(ev.clone()));
                return ev;
            }
            if device.ota_txn.is_some() {
                let ev = ReadWriteEvent::gate_failure(mac, op, RwStatus::Busy);
                self.emit(Emitted::ReadWrite(ev.clone()));
                return ev;
            }
        } else if !device.is(DeviceState::BleConnected) {
            let ev = ReadWriteEvent::gate_failure(mac, op, RwStatus::NotConnected);
            self.emit(Emitted::ReadWrite(ev.clone()));
            return ev;
        }
        self.start_transaction(mac, kind, body, now);
        ReadWriteEvent::null(mac, op)
    }

    pub(crate) fn op_start_scan(&mut self, params: ScanParams) -> bool {
        let now = self.clock.now();
        let scanning = self.queue.any_queued(|t| t.kind == TaskKind::Scan)
            || self
                .queue
                .current()
                .map(|t| t.kind == TaskKind::Scan)
                .unwrap_or(false);
        if scanning {
            return false;
        }
        let task = self
            .new_task(
                TaskKind::Scan,
                None,
                TaskPriority::Trivial,
                TaskPayload::Scan {
                    params,
                    started_at: None,
                },
                now,
            )
            .explicit();
        self.admit(task, now);
        true
    }

    pub(crate) fn op_stop_scan(&mut self) {
        let now = self.clock.now();
        for task in self
            .queue
            .cancel_matching(TaskState::Cancelled, |t| t.kind == TaskKind::Scan)
        {
            self.conclude(task, now, ConcludeHow::Silent);
        }
        let is_scan = self
            .queue
            .current()
            .map(|t| t.kind == TaskKind::Scan)
            .unwrap_or(false);
        if is_scan {
            let mut task = self.queue.take_current().expect("checked");
            self.stack.stop_scan();
            task.mark(TaskState::Succeeded);
            self.conclude(task, now, ConcludeHow::Silent);
        }
        self.fill_executor(now);
    }

    pub(crate) fn op_turn_ble(&mut self, on: bool, implicit: bool) {
        let now = self.clock.now();
        let (kind, priority) = if on {
            (TaskKind::TurnBleOn, TaskPriority::High)
        } else {
            (TaskKind::TurnBleOff, TaskPriority::Critical)
        };
        let task = self.new_task(
            kind,
            None,
            priority,
            TaskPayload::TurnBle { implicit },
            now,
        );
        let task = if implicit { task } else { task.explicit() };
        self.admit(task, now);
    }

    /// Recover a wedged native stack: resolver flush between an adapter
    /// power cycle.
    pub(crate) fn op_reset(&mut self) {
        let now = self.clock.now();
        let resolver = self
            .new_task(
                TaskKind::CrashResolver,
                None,
                TaskPriority::Critical,
                TaskPayload::CrashResolver {
                    part_of_reset: true,
                    started: false,
                },
                now,
            )
            .explicit();
        self.admit(resolver, now);
        self.op_turn_ble(false, false);
        self.op_turn_ble(true, false);
    }

    pub(crate) fn op_resolve_crashes(&mut self) {
        let now = self.clock.now();
        let task = self
            .new_task(
                TaskKind::CrashResolver,
                None,
                TaskPriority::Critical,
                TaskPayload::CrashResolver {
                    part_of_reset: false,
                    started: false,
                },
                now,
            )
            .explicit();
        self.admit(task, now);
    }

    pub(crate) fn op_undiscover(&mut self, mac: MacAddr) -> bool {
        let now = self.clock.now();
        if !self.devices.contains_key(&mac) {
            return false;
        }
        for task in self
            .queue
            .cancel_matching(TaskState::Cancelled, |t| t.device == Some(mac))
        {
            self.conclude(task, now, ConcludeHow::Silent);
        }
        self.abandon_device_txns(mac);
        let name = self.devices.get(&mac).and_then(|d| d.name().map(String::from));
        self.devices.remove(&mac);
        self.emit(Emitted::Discovery(DiscoveryEvent {
            device: mac,
            name,
            lifecycle: DiscoveryLifecycle::Undiscovered,
            rssi: None,
        }));
        true
    }

    pub(crate) fn op_refresh_gatt(&mut self, mac: MacAddr) {
        let now = self.clock.now();
        if let Some(device) = self.devices.get_mut(&mac) {
            if device.is(DeviceState::BleConnected) {
                device.gatt_refresh_at = Some(now + self.config.default_gatt_refresh_delay);
            }
        }
    }

    pub(crate) fn op_set_name(&mut self, mac: MacAddr, name: Option<String>) {
        self.ensure_device(mac);
        let save = {
            let device = self.devices.get_mut(&mac).expect("just ensured");
            device.name_override = name.clone();
            device.config.effective_save_names(&self.config)
        };
        if save {
            if let Some(store) = self.store.clone() {
                tokio::task::spawn_blocking(move || {
                    if let Err(e) = store.set_name_override(mac, name.as_deref()) {
                        warn!(%mac, "failed to persist name override: {e}");
                    }
                });
            }
        }
    }

    pub(crate) fn op_load_historical(&mut self, mac: MacAddr, char_uuid: Option<Uuid>) {
        let Some(store) = self.store.clone() else {
            self.emit(Emitted::Historical(HistoricalDataLoadEvent {
                device: mac,
                char_uuid,
                loaded: false,
                count: 0,
            }));
            return;
        };
        let cmd_tx = self.cmd_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = match char_uuid {
                Some(uuid) => store.count(mac, uuid),
                None => store.has_data(mac, None).map(|b| usize::from(b)),
            };
            let (loaded, count) = match result {
                Ok(count) => (true, count),
                Err(e) => {
                    warn!(%mac, "historical load failed: {e}");
                    (false, 0)
                }
            };
            let _ = cmd_tx.send(Command::Post(Box::new(move |engine: &mut Engine| {
                engine.emit(Emitted::Historical(HistoricalDataLoadEvent {
                    device: mac,
                    char_uuid,
                    loaded,
                    count,
                }));
            })));
        });
    }

    /// Cancel everything and drop listener stacks. Called once at
    /// shutdown.
    pub(crate) fn shutdown(&mut self) {
        let now = self.clock.now();
        info!(pending = self.queue.queued_len(), "engine shutting down");
        self.stack.stop_scan();
        if let Some(mut task) = self.queue.take_current() {
            task.mark(TaskState::Cancelled);
            self.conclude(task, now, ConcludeHow::Silent);
        }
        for task in self.queue.cancel_matching(TaskState::Cancelled, |_| true) {
            self.conclude(task, now, ConcludeHow::Silent);
        }
        let macs: Vec<MacAddr> = self.devices.keys().copied().collect();
        for mac in macs {
            let connected = self
                .devices
                .get(&mac)
                .map(|d| d.is(DeviceState::BleConnected))
                .unwrap_or(false);
            if connected {
                self.stack.disconnect(mac);
                self.finish_local_disconnect(mac, ChangeIntent::Intentional);
            }
        }
        self.flush_events();
    }
}

/// How a task reached its terminal state, carrying outcome detail for the
/// event.
pub(crate) enum ConcludeHow {
    /// No read/write-shaped payload beyond the state itself.
    Silent,
    /// Terminal with an explicit event status.
    Status(RwStatus),
    /// Terminal with value payload.
    Value {
        status: RwStatus,
        data: Option<Vec<u8>>,
        rssi: Option<i16>,
        mtu: Option<u16>,
        gatt_status: Option<GattStatus>,
    },
    /// Failed with a native status.
    Gatt(GattStatus),
    /// Swept because its device disconnected.
    Disconnected,
    /// Swept because the adapter turned off.
    BleOff,
    /// Preempted.
    Interrupted,
    /// Deadline elapsed.
    Timeout,
    /// Bond-shaped outcome.
    BondStatus(BondStatus),
}

impl Engine {
    /// Bond events are built here rather than in `outcome_event` because
    /// they are not read/write-shaped.
    fn bond_event_for(&self, task: &Task, status: BondStatus) -> Option<BondEvent> {
        let mac = task.device?;
        let state = self
            .devices
            .get(&mac)
            .map(|d| d.bond_state)
            .unwrap_or(BondState::None);
        Some(BondEvent {
            device: mac,
            state,
            status,
            failure_reason: None,
        })
    }
}

fn task_char_uuid(task: &Task) -> Option<Uuid> {
    match &task.payload {
        TaskPayload::Read { target, .. } => Some(target.char_uuid),
        TaskPayload::Write { target, .. } => Some(target.char_uuid),
        _ => None,
    }
}

fn deliver<E: Clone + Send + 'static>(
    dispatcher: &Dispatcher,
    device_tx: Option<mpsc::UnboundedSender<E>>,
    mgr_tx: Option<mpsc::UnboundedSender<E>>,
    event: E,
) {
    if let Some(tx) = device_tx {
        let ev = event.clone();
        dispatcher.run(move || {
            let _ = tx.send(ev);
        });
    }
    if let Some(tx) = mgr_tx {
        dispatcher.run(move || {
            let _ = tx.send(event);
        });
    }
}
