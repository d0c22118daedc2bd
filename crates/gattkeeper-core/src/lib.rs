//! Serialised, observable BLE central-role core.
//!
//! gattkeeper sits between an application and the operating system's BLE
//! stack and turns the OS's callback-driven, concurrency-hostile GATT API
//! into a disciplined system: every operation (connect, discover, bond,
//! read, write, notify, MTU/PHY/priority, reliable writes, OTA) is a task
//! on one global priority queue, executed one at a time by a single
//! update worker that owns all state. Outcomes are published as immutable
//! events through per-slot LIFO listener stacks.
//!
//! # Features
//!
//! - **Serialised scheduler**: one executing task at a time, priority
//!   ordering with preemption, per-task deadlines, cancellation relations
//!   between task kinds
//! - **Per-device state machine**: a state bitmask (`BLE_CONNECTING`,
//!   `DISCOVERING_SERVICES`, `AUTHENTICATING`, `INITIALIZED`, ...) driven
//!   only by task outcomes and stack events
//! - **Transactions**: auth/init transactions gate `INITIALIZED`; OTA
//!   transfers run as a transaction holding `PERFORMING_OTA`
//! - **Reconnect control**: silent short-term retry window, slow
//!   long-term window with a single terminal failure, one-shot
//!   flipped-auto-connect retry after timeouts
//! - **Listener stacks**: push/pop listener composition per event slot,
//!   head-only delivery, optional posted dispatch
//! - **Pluggable transport**: a narrow [`BleStack`] trait; btleplug
//!   backend included (feature `btleplug-backend`, on by default), plus a
//!   scriptable [`MockStack`] for tests
//! - **Persistence capability**: historical characteristic data, last
//!   disconnect intents and name overrides behind the
//!   [`HistoricalStore`] trait (implemented by `gattkeeper-store`)
//!
//! # Quick start
//!
//! ```no_run
//! use gattkeeper_core::{listener, BleManager, ManagerConfig};
//! use gattkeeper_types::MacAddr;
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = BleManager::new(ManagerConfig::default());
//!
//!     let (state_listener, mut states) = listener();
//!     manager.set_manager_listener_state(state_listener).await;
//!
//!     let mac: MacAddr = "AA:BB:CC:00:01:02".parse().unwrap();
//!     let gate = manager.connect(mac).await;
//!     assert!(gate.is_null(), "accepted; outcome arrives as an event");
//!
//!     while let Some(change) = states.recv().await {
//!         println!("{} -> {}", change.prev_mask, change.new_mask);
//!     }
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod historical;
pub mod listener;
pub mod manager;
pub mod metrics;
pub mod mock;
pub mod reconnect;
pub mod scan;
pub mod stack;
pub mod transaction;

mod device;
mod dispatch;
mod engine;
mod queue;
mod task;
mod update_loop;

#[cfg(feature = "btleplug-backend")]
pub mod platform;

pub use config::{DeviceConfig, ManagerConfig, TaskTimeouts, TxnFactory};
pub use error::{Error, Result};
pub use events::{
    BondEvent, ConnectEvent, ConnectFailEvent, ConnectOutcome, DiscoveryEvent, DiscoveryLifecycle,
    HistoricalDataLoadEvent, NotificationEvent, NotificationKind, ReadWriteEvent, RwOp,
    StateChangeEvent,
};
pub use historical::{
    HistoricalCursor, HistoricalDatum, HistoricalError, HistoricalResult, HistoricalStore,
};
pub use listener::{listener, EventListener, EventStream, ListenerId};
pub use manager::{BleManager, DeviceSnapshot};
pub use metrics::{RoundTripTimes, RunningAverage};
pub use mock::{MockCall, MockController, MockOp, MockPeripheral, MockStack};
pub use reconnect::{ReconnectPhase, ReconnectPolicy};
pub use scan::{estimate_distance, parse_scan_record, ScanRecord};
pub use stack::{BleStack, ScanParams, StackEvent, StackEventSender, StackOp};
pub use task::{TaskKind, TaskPriority, TaskState};
pub use transaction::{GattTransaction, OtaWriteTransaction, TxnCtx, TxnKind};

#[cfg(feature = "btleplug-backend")]
pub use platform::BtleplugStack;

// Re-export the shared types crate for convenience.
pub use gattkeeper_types as types;
