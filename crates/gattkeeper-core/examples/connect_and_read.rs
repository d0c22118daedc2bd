//! Connect to a device by MAC address and read one characteristic.
//!
//! Run with: `cargo run --example connect_and_read -- AA:BB:CC:00:01:02 <char-uuid>`

use gattkeeper_core::{listener, BleManager, ManagerConfig};
use gattkeeper_types::{CharTarget, DeviceState, MacAddr};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let mac: MacAddr = args.next().expect("usage: connect_and_read MAC CHAR_UUID").parse()?;
    let char_uuid: Uuid = args.next().expect("missing characteristic uuid").parse()?;

    let manager = BleManager::new(ManagerConfig::default());

    let (state_listener, mut states) = listener();
    let (rw_listener, mut reads) = listener();
    manager.set_manager_listener_state(state_listener).await;
    manager.set_manager_listener_read_write(rw_listener).await;

    let gate = manager.connect(mac).await;
    if !gate.is_null() {
        println!("connect refused at the gate: {gate:?}");
        return Ok(());
    }

    // Wait for the ladder to finish.
    while let Some(change) = states.recv().await {
        println!("state: {} -> {}", change.prev_mask, change.new_mask);
        if change.did_enter(DeviceState::Initialized) {
            break;
        }
        if change.did_enter(DeviceState::BleDisconnected) {
            println!("connection failed");
            return Ok(());
        }
    }

    let gate = manager.read(mac, CharTarget::characteristic(char_uuid)).await;
    if gate.is_null() {
        if let Some(outcome) = reads.recv().await {
            println!("read {:?}: {:?}", outcome.status, outcome.data);
        }
    } else {
        println!("read refused: {:?}", gate.status);
    }

    manager.disconnect(mac).await;
    manager.shutdown();
    Ok(())
}
