//! Scan for nearby BLE devices and print discoveries.
//!
//! Run with: `cargo run --example scan_devices`

use std::time::Duration;

use gattkeeper_core::{listener, BleManager, ManagerConfig, ScanParams};

#[tokio::main]
async fn main() {
    let manager = BleManager::new(ManagerConfig::default());

    let (discovery_listener, mut discoveries) = listener();
    manager
        .set_manager_listener_discovery(discovery_listener)
        .await;

    println!("Scanning for 10 seconds...");
    manager
        .start_scan(ScanParams::new().duration(Duration::from_secs(10)))
        .await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(11);
    loop {
        let event = tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            ev = discoveries.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };
        println!(
            "{:?} {} rssi={:?} name={:?}",
            event.lifecycle, event.device, event.rssi, event.name
        );
    }

    manager.stop_scan().await;
    manager.shutdown();
}
