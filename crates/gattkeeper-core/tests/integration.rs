//! End-to-end scenarios against the mock transport.
//!
//! All tests run under paused time: the 50 ms update tick and every
//! deadline advance deterministically, so a "12 second" timeout test
//! finishes in milliseconds of wall clock.

use std::time::Duration;

use uuid::Uuid;

use gattkeeper_core::{
    listener, BleManager, ConnectOutcome, DeviceConfig, DiscoveryLifecycle, ManagerConfig,
    MockCall, MockController, MockOp, MockPeripheral, MockStack, NotificationKind,
    ReconnectPolicy, RwOp,
};
use gattkeeper_types::{
    BondStatus, ChangeIntent, CharTarget, DeviceState, GattStatus, MacAddr, RwStatus,
};

const SVC: Uuid = Uuid::from_u128(0x0000FF00_0000_1000_8000_00805F9B34FB);
const CH: Uuid = Uuid::from_u128(0x0000FF01_0000_1000_8000_00805F9B34FB);

fn mac() -> MacAddr {
    "AA:BB:CC:00:01:02".parse().unwrap()
}

fn target() -> CharTarget {
    CharTarget::characteristic(CH)
}

fn peripheral() -> MockPeripheral {
    MockPeripheral::with_service(SVC, &[CH])
}

fn test_config() -> ManagerConfig {
    ManagerConfig::default()
        .post_callbacks_to_main_thread(false)
        .reconnect_policy(ReconnectPolicy::default().jitter(false))
}

fn setup() -> (BleManager, MockController) {
    let (factory, controller) = MockStack::factory();
    let manager = BleManager::with_stack(test_config(), factory);
    (manager, controller)
}

fn setup_with(config: ManagerConfig) -> (BleManager, MockController) {
    let (factory, controller) = MockStack::factory();
    let manager = BleManager::with_stack(config, factory);
    (manager, controller)
}

async fn recv<E>(stream: &mut gattkeeper_core::EventStream<E>) -> Option<E> {
    tokio::time::timeout(Duration::from_secs(120), stream.recv())
        .await
        .ok()
        .flatten()
}

async fn wait_until_state(manager: &BleManager, mac: MacAddr, state: DeviceState) {
    for _ in 0..400 {
        if manager.is(mac, state).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "device never reached {state}; currently {:?}",
        manager.print_state(mac).await
    );
}

async fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..800 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never met: {what}");
}

async fn connect_initialized(manager: &BleManager, controller: &MockController, mac: MacAddr) {
    controller.add_peripheral(mac, peripheral());
    let gate = manager.connect(mac).await;
    assert!(gate.is_null(), "connect should pass the gate");
    wait_until_state(manager, mac, DeviceState::Initialized).await;
}

// ==================== S1: happy connect ====================

#[tokio::test(start_paused = true)]
async fn test_happy_connect_walks_the_state_ladder() {
    let (manager, controller) = setup();
    let mac = mac();
    controller.add_peripheral(mac, peripheral());

    let (state_listener, mut states) = listener();
    let (connect_listener, mut connects) = listener();
    let (discovery_listener, mut discoveries) = listener();
    manager.set_manager_listener_state(state_listener).await;
    manager.set_manager_listener_connect(connect_listener).await;
    manager
        .set_manager_listener_discovery(discovery_listener)
        .await;

    // Advertisement first: flags, 16-bit service 0xFF00.
    controller.advertise(mac, -60, vec![0x02, 0x01, 0x06, 0x03, 0x03, 0x00, 0xFF]);
    let discovery = recv(&mut discoveries).await.expect("discovery event");
    assert_eq!(discovery.lifecycle, DiscoveryLifecycle::Discovered);
    assert_eq!(discovery.rssi, Some(-60));

    let gate = manager.connect(mac).await;
    assert!(gate.is_null());

    let ladder = [
        DeviceState::BleConnecting,
        DeviceState::BleConnected,
        DeviceState::DiscoveringServices,
        DeviceState::ServicesDiscovered,
        DeviceState::Initialized,
    ];
    let mut entered = Vec::new();
    while entered.len() < ladder.len() {
        let ev = recv(&mut states).await.expect("state event");
        for s in ladder {
            if ev.did_enter(s) {
                entered.push(s);
            }
        }
    }
    assert_eq!(entered, ladder);

    let ev = recv(&mut connects).await.expect("connect event");
    assert!(ev.was_success());

    // State coherence once initialized.
    let mask = manager.state_mask(mac).await.unwrap();
    assert!(mask.contains(DeviceState::Initialized));
    assert!(mask.contains(DeviceState::ServicesDiscovered));
    assert!(mask.contains(DeviceState::BleConnected));
    assert!(!mask.contains(DeviceState::ConnectingOverall));
}

#[tokio::test(start_paused = true)]
async fn test_connect_when_initialized_is_already_connected() {
    let (manager, controller) = setup();
    let mac = mac();
    connect_initialized(&manager, &controller, mac).await;

    let ev = manager.connect(mac).await;
    assert!(!ev.is_null());
    assert_eq!(ev.outcome, ConnectOutcome::AlreadyConnected);
}

// ==================== S2: preemption by disconnect ====================

#[tokio::test(start_paused = true)]
async fn test_disconnect_preempts_executing_read() {
    let (manager, controller) = setup();
    let mac = mac();
    connect_initialized(&manager, &controller, mac).await;

    let (rw_listener, mut rws) = listener();
    let (state_listener, mut states) = listener();
    manager.set_manager_listener_read_write(rw_listener).await;
    manager.set_manager_listener_state(state_listener).await;

    controller.mute(MockOp::Read);
    let gate = manager.read(mac, target()).await;
    assert!(gate.is_null());
    let c = controller.clone();
    wait_for(
        move || c.call_count(|call| matches!(call, MockCall::Read { .. })) == 1,
        "read issued",
    )
    .await;

    assert!(manager.disconnect(mac).await);

    let ev = recv(&mut rws).await.expect("read outcome");
    assert_eq!(ev.op, RwOp::Read);
    assert_eq!(ev.status, RwStatus::CancelledFromDisconnect);

    loop {
        let ev = recv(&mut states).await.expect("state event");
        if ev.did_enter(DeviceState::BleDisconnected) {
            assert_eq!(ev.intent, ChangeIntent::Intentional);
            break;
        }
    }

    // Cancellation closure: nothing else arrives for the device.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(rws.try_recv().is_none());
}

// ==================== S3: timeout + flipped retry ====================

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_retries_once_with_flipped_auto_connect() {
    let (manager, controller) = setup();
    let mac = mac();
    controller.add_peripheral(mac, peripheral());
    controller.mute(MockOp::Connect);

    let (connect_listener, mut connects) = listener();
    let (fail_listener, mut fails) = listener();
    manager.set_manager_listener_connect(connect_listener).await;
    manager.set_manager_listener_reconnect(fail_listener).await;

    let gate = manager.connect(mac).await;
    assert!(gate.is_null());
    let c = controller.clone();
    wait_for(
        move || c.call_count(|call| matches!(call, MockCall::Connect { .. })) == 1,
        "first connect issued",
    )
    .await;

    // No callback for longer than the connect deadline.
    tokio::time::sleep(Duration::from_secs(11)).await;

    let c = controller.clone();
    wait_for(
        move || c.call_count(|call| matches!(call, MockCall::Connect { .. })) == 2,
        "flipped retry issued",
    )
    .await;
    let connects_made: Vec<bool> = controller
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            MockCall::Connect { auto_connect, .. } => Some(auto_connect),
            _ => None,
        })
        .collect();
    assert_eq!(connects_made, vec![false, true]);

    // The retry succeeds; the user sees a single success event.
    controller.unmute(MockOp::Connect);
    controller.complete_connect(mac);
    let ev = recv(&mut connects).await.expect("connect outcome");
    assert!(ev.was_success());
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(connects.try_recv().is_none());
    assert!(fails.try_recv().is_none(), "silent retry must not surface");
}

// ==================== S4: OTA ====================

#[tokio::test(start_paused = true)]
async fn test_ota_writes_in_order_while_performing_ota() {
    let (manager, controller) = setup();
    let mac = mac();
    connect_initialized(&manager, &controller, mac).await;

    let (rw_listener, mut rws) = listener();
    let (state_listener, mut states) = listener();
    manager.set_manager_listener_read_write(rw_listener).await;
    manager.set_manager_listener_state(state_listener).await;

    let gate = manager
        .perform_ota(mac, target(), vec![vec![0xC0, 0xFF, 0xEE], vec![0x01, 0x02]])
        .await;
    assert!(gate.is_null());

    loop {
        let ev = recv(&mut states).await.expect("state event");
        if ev.did_enter(DeviceState::PerformingOta) {
            break;
        }
    }

    let first = recv(&mut rws).await.expect("first ota write");
    assert_eq!(first.op, RwOp::Write);
    assert!(first.was_success());
    assert_eq!(first.data.as_deref(), Some(&[0xC0, 0xFF, 0xEE][..]));

    let second = recv(&mut rws).await.expect("second ota write");
    assert!(second.was_success());
    assert_eq!(second.data.as_deref(), Some(&[0x01, 0x02][..]));

    loop {
        let ev = recv(&mut states).await.expect("state event");
        if ev.did_exit(DeviceState::PerformingOta) {
            break;
        }
    }
    assert!(manager.is(mac, DeviceState::Initialized).await);
}

// ==================== S5: forced read ====================

#[tokio::test(start_paused = true)]
async fn test_notify_enable_with_forced_read_synthesizes_pseudo_notification() {
    let (manager, controller) = setup();
    let mac = mac();
    let mut p = peripheral();
    p.values.insert(CH, vec![7, 7]);
    controller.add_peripheral(mac, p);
    let gate = manager.connect(mac).await;
    assert!(gate.is_null());
    wait_until_state(&manager, mac, DeviceState::Initialized).await;

    let (rw_listener, mut rws) = listener();
    let (notif_listener, mut notifications) = listener();
    manager.set_manager_listener_read_write(rw_listener).await;
    manager
        .set_manager_listener_notification(notif_listener)
        .await;

    let gate = manager
        .enable_notify_with_forced_read(mac, target(), Duration::from_millis(500))
        .await;
    assert!(gate.is_null());

    let enabled = recv(&mut rws).await.expect("enable outcome");
    assert_eq!(enabled.op, RwOp::EnablingNotification);
    assert!(enabled.was_success());

    // Nothing pushed within the window: a synthetic read carries the
    // value as a pseudo-notification.
    let pushed = recv(&mut notifications).await.expect("pseudo notification");
    assert_eq!(pushed.kind, NotificationKind::PseudoNotification);
    assert_eq!(pushed.data, vec![7, 7]);
    assert_eq!(pushed.char_uuid, CH);
}

#[tokio::test(start_paused = true)]
async fn test_real_notification_suppresses_forced_read() {
    let (manager, controller) = setup();
    let mac = mac();
    connect_initialized(&manager, &controller, mac).await;

    let (notif_listener, mut notifications) = listener();
    manager
        .set_manager_listener_notification(notif_listener)
        .await;

    let gate = manager
        .enable_notify_with_forced_read(mac, target(), Duration::from_millis(500))
        .await;
    assert!(gate.is_null());

    // The remote pushes before the window closes.
    tokio::time::sleep(Duration::from_millis(200)).await;
    controller.push_notification(mac, CH, vec![1, 2, 3]);

    let pushed = recv(&mut notifications).await.expect("notification");
    assert_eq!(pushed.kind, NotificationKind::Notification);
    assert_eq!(pushed.data, vec![1, 2, 3]);

    // Past the window: no synthetic read was issued.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
        controller.call_count(|call| matches!(call, MockCall::Read { .. })),
        0
    );
    assert!(notifications.try_recv().is_none());
}

// ==================== S6: adapter off mid-operation ====================

#[tokio::test(start_paused = true)]
async fn test_ble_off_cancels_inflight_write() {
    let (manager, controller) = setup();
    let mac = mac();
    connect_initialized(&manager, &controller, mac).await;

    let (rw_listener, mut rws) = listener();
    let (state_listener, mut states) = listener();
    manager.set_manager_listener_read_write(rw_listener).await;
    manager.set_manager_listener_state(state_listener).await;

    controller.mute(MockOp::Write);
    let gate = manager.write(mac, target(), vec![9]).await;
    assert!(gate.is_null());
    let c = controller.clone();
    wait_for(
        move || c.call_count(|call| matches!(call, MockCall::Write { .. })) == 1,
        "write issued",
    )
    .await;

    controller.set_powered(false);

    let ev = recv(&mut rws).await.expect("write outcome");
    assert_eq!(ev.op, RwOp::Write);
    assert_eq!(ev.status, RwStatus::CancelledFromBleTurningOff);

    loop {
        let ev = recv(&mut states).await.expect("state event");
        if ev.did_enter(DeviceState::BleDisconnected) {
            assert_eq!(ev.intent, ChangeIntent::Unintentional);
            break;
        }
    }

    // Nothing further runs for the device: the next call fails at the
    // gate, synchronously.
    let ev = manager.read(mac, target()).await;
    assert!(!ev.is_null());
    assert_eq!(ev.status, RwStatus::NotConnected);
}

// ==================== Scheduler properties ====================

#[tokio::test(start_paused = true)]
async fn test_read_timeout_emits_timed_out_once() {
    let (manager, controller) = setup();
    let mac = mac();
    connect_initialized(&manager, &controller, mac).await;

    let (rw_listener, mut rws) = listener();
    manager.set_manager_listener_read_write(rw_listener).await;

    controller.mute(MockOp::Read);
    let gate = manager.read(mac, target()).await;
    assert!(gate.is_null());

    tokio::time::sleep(Duration::from_secs(13)).await;

    let ev = recv(&mut rws).await.expect("read outcome");
    assert_eq!(ev.status, RwStatus::TimedOut);
    assert!(ev.time_total >= Duration::from_secs(12));

    // Terminal exactness: exactly one event for the task.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(rws.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_bond_when_bonded_is_redundant_without_native_call() {
    let (manager, controller) = setup();
    let mac = mac();
    controller.add_peripheral(mac, peripheral());

    let (bond_listener, mut bonds) = listener();
    manager.set_manager_listener_bond(bond_listener).await;

    let gate = manager.bond(mac).await;
    assert!(gate.is_null());
    let ev = recv(&mut bonds).await.expect("bond outcome");
    assert_eq!(ev.status, BondStatus::Success);
    assert_eq!(
        controller.call_count(|call| matches!(call, MockCall::CreateBond(_))),
        1
    );

    let gate = manager.bond(mac).await;
    assert!(gate.is_null());
    let ev = recv(&mut bonds).await.expect("redundant bond outcome");
    assert_eq!(ev.status, BondStatus::Redundant);
    assert_eq!(
        controller.call_count(|call| matches!(call, MockCall::CreateBond(_))),
        1,
        "no second native bond request"
    );
}

#[tokio::test(start_paused = true)]
async fn test_scan_yields_to_gatt_work_and_resumes() {
    let (manager, controller) = setup();
    let mac = mac();
    connect_initialized(&manager, &controller, mac).await;

    assert!(manager.start_scan(Default::default()).await);
    let c = controller.clone();
    wait_for(
        move || c.call_count(|call| matches!(call, MockCall::StartScan)) == 1,
        "scan running",
    )
    .await;

    let gate = manager.read(mac, target()).await;
    assert!(gate.is_null());

    // The read preempts the scan; the scan restarts afterwards.
    let c = controller.clone();
    wait_for(
        move || c.call_count(|call| matches!(call, MockCall::StartScan)) == 2,
        "scan resumed",
    )
    .await;
    let calls = controller.calls();
    let stop_idx = calls
        .iter()
        .position(|call| matches!(call, MockCall::StopScan))
        .expect("scan paused");
    let read_idx = calls
        .iter()
        .position(|call| matches!(call, MockCall::Read { .. }))
        .expect("read issued");
    assert!(stop_idx < read_idx, "scan paused before the read ran");

    manager.stop_scan().await;
}

#[tokio::test(start_paused = true)]
async fn test_transient_native_failure_is_retried_once_internally() {
    let (manager, controller) = setup();
    let mac = mac();
    connect_initialized(&manager, &controller, mac).await;

    let (rw_listener, mut rws) = listener();
    manager.set_manager_listener_read_write(rw_listener).await;

    controller.fail_next_read(CH, GattStatus::ERROR_133);
    let gate = manager.read(mac, target()).await;
    assert!(gate.is_null());

    let ev = recv(&mut rws).await.expect("read outcome");
    assert!(ev.was_success(), "spurious 133 retried internally");
    assert_eq!(
        controller.call_count(|call| matches!(call, MockCall::Read { .. })),
        2
    );
}

#[tokio::test(start_paused = true)]
async fn test_rogue_disconnect_reconnects_silently() {
    let (manager, controller) = setup();
    let mac = mac();
    connect_initialized(&manager, &controller, mac).await;

    let (fail_listener, mut fails) = listener();
    let (connect_listener, mut connects) = listener();
    manager.set_manager_listener_reconnect(fail_listener).await;
    manager.set_manager_listener_connect(connect_listener).await;

    controller.drop_connection(mac, GattStatus::ERROR_133);
    wait_until_state(&manager, mac, DeviceState::ReconnectingShortTerm).await;

    // The silent retry re-runs the whole ladder back to initialized.
    wait_until_state(&manager, mac, DeviceState::Initialized).await;
    let ev = recv(&mut connects).await.expect("reconnect outcome");
    assert!(ev.was_success());
    assert!(fails.try_recv().is_none(), "short-term window is silent");
}

#[tokio::test(start_paused = true)]
async fn test_long_term_reconnect_surfaces_exactly_one_failure() {
    let config = ManagerConfig::default()
        .post_callbacks_to_main_thread(false)
        .reconnect_policy(
            ReconnectPolicy::default()
                .jitter(false)
                .short_term_timeout(Duration::from_secs(1))
                .long_term_timeout(Duration::from_secs(3)),
        );
    let (manager, controller) = setup_with(config);
    let mac = mac();
    connect_initialized(&manager, &controller, mac).await;

    let (fail_listener, mut fails) = listener();
    let (state_listener, mut states) = listener();
    manager.set_manager_listener_reconnect(fail_listener).await;
    manager.set_manager_listener_state(state_listener).await;

    // Every reconnect attempt fails fast from here on.
    controller.fail_connect(mac, GattStatus::FAILURE);
    controller.drop_connection(mac, GattStatus::ERROR_133);

    let mut saw_short = false;
    let mut saw_long = false;
    loop {
        let ev = recv(&mut states).await.expect("state event");
        saw_short |= ev.did_enter(DeviceState::ReconnectingShortTerm);
        saw_long |= ev.did_enter(DeviceState::ReconnectingLongTerm);
        if saw_long && ev.did_exit(DeviceState::ReconnectingLongTerm) {
            break;
        }
    }
    assert!(saw_short);
    assert!(saw_long);

    // Exactly one terminal failure over the whole episode.
    let terminal = recv(&mut fails).await.expect("terminal failure");
    assert_eq!(terminal.device, mac);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(fails.try_recv().is_none());

    let mask = manager.state_mask(mac).await.unwrap();
    assert!(mask.contains(DeviceState::BleDisconnected));
    assert!(!mask.contains(DeviceState::ReconnectingLongTerm));
    assert!(!mask.contains(DeviceState::ReconnectingShortTerm));
}

// ==================== Auth/Init transactions ====================

#[tokio::test(start_paused = true)]
async fn test_auth_and_init_gate_initialized() {
    use gattkeeper_core::{GattTransaction, ReadWriteEvent, TxnCtx};

    struct WriteOnce {
        payload: Vec<u8>,
    }

    impl GattTransaction for WriteOnce {
        fn on_start(&mut self, ctx: &mut TxnCtx<'_>) {
            ctx.write(CharTarget::characteristic(CH), self.payload.clone());
        }

        fn on_result(&mut self, ctx: &mut TxnCtx<'_>, event: &ReadWriteEvent) {
            if event.was_success() {
                ctx.succeed();
            } else {
                ctx.fail();
            }
        }
    }

    let (manager, controller) = setup();
    let mac = mac();
    controller.add_peripheral(mac, peripheral());

    let (state_listener, mut states) = listener();
    manager.set_manager_listener_state(state_listener).await;

    let config = DeviceConfig::new()
        .auth_transaction(|| Box::new(WriteOnce { payload: vec![0xA0] }))
        .init_transaction(|| Box::new(WriteOnce { payload: vec![0xB0] }));
    let gate = manager.connect_with_config(mac, config).await;
    assert!(gate.is_null());

    let ladder = [
        DeviceState::Authenticating,
        DeviceState::Authenticated,
        DeviceState::Initializing,
        DeviceState::Initialized,
    ];
    let mut entered = Vec::new();
    while entered.len() < ladder.len() {
        let ev = recv(&mut states).await.expect("state event");
        for s in ladder {
            if ev.did_enter(s) {
                entered.push(s);
            }
        }
    }
    assert_eq!(entered, ladder);

    // Both transaction writes reached the wire, in order.
    let writes: Vec<Vec<u8>> = controller
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            MockCall::Write { value, .. } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(writes, vec![vec![0xA0], vec![0xB0]]);
}

// ==================== Reliable writes ====================

#[tokio::test(start_paused = true)]
async fn test_reliable_write_stages_until_execute() {
    let (manager, controller) = setup();
    let mac = mac();
    connect_initialized(&manager, &controller, mac).await;

    let gate = manager.begin_reliable_write(mac).await;
    assert!(gate.is_null());

    // Writes during the session are staged, not sent.
    let gate = manager.write(mac, target(), vec![1]).await;
    assert!(gate.is_null());
    let gate = manager.write(mac, target(), vec![2]).await;
    assert!(gate.is_null());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        controller.call_count(|call| matches!(call, MockCall::Write { .. })),
        0
    );

    let (rw_listener, mut rws) = listener();
    manager.set_manager_listener_read_write(rw_listener).await;

    let gate = manager.execute_reliable_write(mac).await;
    assert!(gate.is_null());

    let ev = recv(&mut rws).await.expect("execute outcome");
    assert_eq!(ev.op, RwOp::ReliableWriteExecute);
    assert!(ev.was_success());

    let staged: Vec<Vec<u8>> = controller
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            MockCall::Write { value, .. } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(staged, vec![vec![1], vec![2]]);
    assert_eq!(
        controller.call_count(|call| matches!(call, MockCall::ExecuteReliableWrite(_))),
        1
    );
}

// ==================== Gate failures ====================

#[tokio::test(start_paused = true)]
async fn test_gate_failures_are_synchronous_and_final() {
    let (manager, controller) = setup();
    let mac = mac();

    // Unknown device.
    let ev = manager.read(mac, target()).await;
    assert!(!ev.is_null());
    assert_eq!(ev.status, RwStatus::NotConnected);

    connect_initialized(&manager, &controller, mac).await;

    // Unknown characteristic.
    let bogus = CharTarget::characteristic(Uuid::from_u128(0xDEAD));
    let ev = manager.read(mac, bogus).await;
    assert!(!ev.is_null());
    assert_eq!(ev.status, RwStatus::NoMatchingTarget);
}

// ==================== Listener stacks ====================

#[tokio::test(start_paused = true)]
async fn test_device_listener_stack_is_lifo() {
    let (manager, controller) = setup();
    let mac = mac();
    connect_initialized(&manager, &controller, mac).await;

    let (bottom, mut bottom_rx) = listener();
    let (top, mut top_rx) = listener();
    assert!(manager.push_listener_read_write(mac, bottom).await);
    assert!(manager.push_listener_read_write(mac, top).await);

    let gate = manager.read(mac, target()).await;
    assert!(gate.is_null());
    let ev = recv(&mut top_rx).await.expect("top sees the event");
    assert_eq!(ev.op, RwOp::Read);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(bottom_rx.try_recv().is_none(), "events go to the head only");

    assert!(manager.pop_listener_read_write(mac).await);
    let gate = manager.read(mac, target()).await;
    assert!(gate.is_null());
    let ev = recv(&mut bottom_rx).await.expect("bottom resumes after pop");
    assert!(ev.was_success());
}

// ==================== Undiscover ====================

#[tokio::test(start_paused = true)]
async fn test_undiscover_forgets_the_device() {
    let (manager, controller) = setup();
    let mac = mac();
    controller.add_peripheral(mac, peripheral());
    controller.advertise_parsed(mac, -55, Some("thing"), vec![SVC]);

    let (discovery_listener, mut discoveries) = listener();
    manager
        .set_manager_listener_discovery(discovery_listener)
        .await;

    let c = manager.clone();
    wait_for_async(move || {
        let c = c.clone();
        async move { c.state_mask(mac).await.is_some() }
    })
    .await;

    assert!(manager.undiscover(mac).await);
    let ev = recv(&mut discoveries).await.expect("undiscovery event");
    assert_eq!(ev.lifecycle, DiscoveryLifecycle::Undiscovered);
    assert!(manager.state_mask(mac).await.is_none());
    assert!(!manager.undiscover(mac).await);
}

async fn wait_for_async<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("async condition never met");
}
