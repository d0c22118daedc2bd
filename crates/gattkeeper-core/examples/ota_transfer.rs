//! OTA transfer against the mock transport: runs without hardware.
//!
//! Shows the OTA configuration preset, the transaction gate, and the
//! state bits an application can watch during a transfer.
//!
//! Run with: `cargo run --example ota_transfer`

use gattkeeper_core::{
    listener, BleManager, ManagerConfig, MockPeripheral, MockStack,
};
use gattkeeper_types::{CharTarget, DeviceState, MacAddr};
use uuid::Uuid;

const SVC: Uuid = Uuid::from_u128(0x0000FF00_0000_1000_8000_00805F9B34FB);
const FW_CHAR: Uuid = Uuid::from_u128(0x0000FF02_0000_1000_8000_00805F9B34FB);

#[tokio::main]
async fn main() {
    let (factory, controller) = MockStack::factory();
    let manager = BleManager::with_stack(ManagerConfig::ota_defaults(), factory);

    let mac: MacAddr = "AA:BB:CC:00:01:02".parse().unwrap();
    controller.add_peripheral(mac, MockPeripheral::with_service(SVC, &[FW_CHAR]));

    let (state_listener, mut states) = listener();
    let (rw_listener, mut writes) = listener();
    manager.set_manager_listener_state(state_listener).await;
    manager.set_manager_listener_read_write(rw_listener).await;

    assert!(manager.connect(mac).await.is_null());
    while let Some(change) = states.recv().await {
        if change.did_enter(DeviceState::Initialized) {
            break;
        }
    }
    println!("initialized, starting transfer");

    let firmware: Vec<Vec<u8>> = (0u8..8).map(|chunk| vec![chunk; 20]).collect();
    let total = firmware.len();
    let gate = manager
        .perform_ota(mac, CharTarget::characteristic(FW_CHAR), firmware)
        .await;
    assert!(gate.is_null(), "ota refused: {:?}", gate.status);

    let mut written = 0usize;
    while written < total {
        match writes.recv().await {
            Some(outcome) if outcome.was_success() => {
                written += 1;
                println!("chunk {written}/{total} ({:?} in ota window)", outcome.time_ota);
            }
            Some(outcome) => {
                println!("transfer failed: {:?}", outcome.status);
                break;
            }
            None => break,
        }
    }

    while let Some(change) = states.recv().await {
        if change.did_exit(DeviceState::PerformingOta) {
            println!("transfer complete, device back to {}", change.new_mask);
            break;
        }
    }

    manager.shutdown();
}
