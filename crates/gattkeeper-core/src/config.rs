//! Manager and per-device configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::reconnect::ReconnectPolicy;
use crate::task::TaskKind;
use crate::transaction::GattTransaction;

use gattkeeper_types::GATT_WRITE_MTU_OVERHEAD;

/// Factory producing a fresh transaction for each connect attempt.
pub type TxnFactory = Arc<dyn Fn() -> Box<dyn GattTransaction> + Send + Sync>;

/// Per-kind task deadlines.
///
/// A task that has not reached a terminal state when its deadline elapses
/// is timed out, whether it is still queued or already executing.
#[derive(Debug, Clone)]
pub struct TaskTimeouts {
    /// Deadline for connect tasks.
    pub connect: Duration,
    /// Deadline for bond/unbond tasks.
    pub bond: Duration,
    /// Deadline for service discovery.
    pub discover_services: Duration,
    /// Deadline for everything else.
    pub default: Duration,
}

impl Default for TaskTimeouts {
    fn default() -> Self {
        TaskTimeouts {
            connect: Duration::from_secs(10),
            bond: Duration::from_secs(15),
            discover_services: Duration::from_secs(10),
            default: Duration::from_millis(12_500),
        }
    }
}

impl TaskTimeouts {
    /// The deadline for a task of the given kind.
    pub fn for_kind(&self, kind: TaskKind) -> Duration {
        match kind {
            TaskKind::Connect => self.connect,
            TaskKind::Bond | TaskKind::Unbond => self.bond,
            TaskKind::DiscoverServices => self.discover_services,
            // Scans run until stopped or until their own duration elapses.
            TaskKind::Scan => Duration::from_secs(60 * 60 * 24),
            _ => self.default,
        }
    }
}

/// Global manager configuration.
///
/// Builder-style setters return `self` so configurations read as a chain:
///
/// ```
/// use std::time::Duration;
/// use gattkeeper_core::ManagerConfig;
///
/// let config = ManagerConfig::default()
///     .auto_update_rate(Duration::from_millis(20))
///     .post_callbacks_to_main_thread(false);
/// assert_eq!(config.auto_update_rate, Duration::from_millis(20));
/// ```
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Scheduler tick period.
    pub auto_update_rate: Duration,
    /// Window size for the running read round-trip average.
    pub n_for_average_running_read_time: usize,
    /// Window size for the running write round-trip average.
    pub n_for_average_running_write_time: usize,
    /// Fallback advertised TX power (dBm) for distance estimation when a
    /// scan record carries none.
    pub default_tx_power: i16,
    /// Persist the intent of every transition into the disconnected state.
    pub manage_last_disconnect_on_disk: bool,
    /// Persist application-assigned device names.
    pub save_name_changes_to_disk: bool,
    /// Refresh the GATT database after a successful OTA transaction.
    pub clear_gatt_on_ota_success: bool,
    /// Deliver events through the posted dispatcher instead of inline on
    /// the update worker.
    pub post_callbacks_to_main_thread: bool,
    /// Keep a scan running while an OTA transaction is in progress.
    pub auto_scan_during_ota: bool,
    /// Include round-trips performed during OTA in the running averages.
    pub include_ota_read_write_times_in_average: bool,
    /// Fixed per-PDU write overhead; effective payload is `mtu - overhead`.
    pub gatt_write_mtu_overhead: u16,
    /// Pause between closing and re-discovering the GATT database on
    /// refresh.
    pub default_gatt_refresh_delay: Duration,
    /// Per-kind task deadlines.
    pub task_timeouts: TaskTimeouts,
    /// Default reconnect policy; overridable per device.
    pub reconnect: ReconnectPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            auto_update_rate: Duration::from_millis(50),
            n_for_average_running_read_time: 10,
            n_for_average_running_write_time: 10,
            default_tx_power: 4,
            manage_last_disconnect_on_disk: true,
            save_name_changes_to_disk: true,
            clear_gatt_on_ota_success: false,
            post_callbacks_to_main_thread: true,
            auto_scan_during_ota: false,
            include_ota_read_write_times_in_average: false,
            gatt_write_mtu_overhead: GATT_WRITE_MTU_OVERHEAD,
            default_gatt_refresh_delay: Duration::from_millis(500),
            task_timeouts: TaskTimeouts::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ManagerConfig {
    /// Preset tuned for OTA throughput: a 1 ms tick, no main-thread
    /// posting, GATT refresh after success, and a scan kept alive during
    /// the transfer.
    pub fn ota_defaults() -> Self {
        ManagerConfig {
            auto_update_rate: Duration::from_millis(1),
            post_callbacks_to_main_thread: false,
            clear_gatt_on_ota_success: true,
            auto_scan_during_ota: true,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn auto_update_rate(mut self, rate: Duration) -> Self {
        self.auto_update_rate = rate;
        self
    }

    #[must_use]
    pub fn read_time_average_window(mut self, n: usize) -> Self {
        self.n_for_average_running_read_time = n;
        self
    }

    #[must_use]
    pub fn write_time_average_window(mut self, n: usize) -> Self {
        self.n_for_average_running_write_time = n;
        self
    }

    #[must_use]
    pub fn default_tx_power(mut self, dbm: i16) -> Self {
        self.default_tx_power = dbm;
        self
    }

    /// Silent retry window after a transient disconnect.
    #[must_use]
    pub fn reconnect_short_term_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect.short_term_timeout = timeout;
        self
    }

    /// Slow retry window; expires with a single terminal failure.
    #[must_use]
    pub fn reconnect_long_term_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect.long_term_timeout = timeout;
        self
    }

    #[must_use]
    pub fn manage_last_disconnect_on_disk(mut self, enabled: bool) -> Self {
        self.manage_last_disconnect_on_disk = enabled;
        self
    }

    #[must_use]
    pub fn save_name_changes_to_disk(mut self, enabled: bool) -> Self {
        self.save_name_changes_to_disk = enabled;
        self
    }

    #[must_use]
    pub fn clear_gatt_on_ota_success(mut self, enabled: bool) -> Self {
        self.clear_gatt_on_ota_success = enabled;
        self
    }

    #[must_use]
    pub fn post_callbacks_to_main_thread(mut self, enabled: bool) -> Self {
        self.post_callbacks_to_main_thread = enabled;
        self
    }

    #[must_use]
    pub fn auto_scan_during_ota(mut self, enabled: bool) -> Self {
        self.auto_scan_during_ota = enabled;
        self
    }

    #[must_use]
    pub fn include_ota_read_write_times_in_average(mut self, enabled: bool) -> Self {
        self.include_ota_read_write_times_in_average = enabled;
        self
    }

    #[must_use]
    pub fn default_gatt_refresh_delay(mut self, delay: Duration) -> Self {
        self.default_gatt_refresh_delay = delay;
        self
    }

    #[must_use]
    pub fn task_timeouts(mut self, timeouts: TaskTimeouts) -> Self {
        self.task_timeouts = timeouts;
        self
    }

    #[must_use]
    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

/// Per-device configuration overrides.
///
/// Every `Option` field falls back to the manager-wide value when `None`.
/// The transaction factories are per-device only: a device with no auth
/// factory goes straight from services-discovered to initializing (or to
/// initialized, with no init factory either).
#[derive(Clone, Default)]
pub struct DeviceConfig {
    /// Override for the reconnect policy.
    pub reconnect: Option<ReconnectPolicy>,
    /// Override for [`ManagerConfig::manage_last_disconnect_on_disk`].
    pub manage_last_disconnect_on_disk: Option<bool>,
    /// Override for [`ManagerConfig::save_name_changes_to_disk`].
    pub save_name_changes_to_disk: Option<bool>,
    /// Authentication transaction run after service discovery.
    pub auth_factory: Option<TxnFactory>,
    /// Initialization transaction run after authentication.
    pub init_factory: Option<TxnFactory>,
}

impl DeviceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    #[must_use]
    pub fn auth_transaction<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn GattTransaction> + Send + Sync + 'static,
    {
        self.auth_factory = Some(Arc::new(factory));
        self
    }

    #[must_use]
    pub fn init_transaction<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn GattTransaction> + Send + Sync + 'static,
    {
        self.init_factory = Some(Arc::new(factory));
        self
    }

    /// The effective reconnect policy for this device.
    pub fn effective_reconnect<'a>(&'a self, manager: &'a ManagerConfig) -> &'a ReconnectPolicy {
        self.reconnect.as_ref().unwrap_or(&manager.reconnect)
    }

    /// Effective disk flag for disconnect intents.
    pub fn effective_manage_last_disconnect(&self, manager: &ManagerConfig) -> bool {
        self.manage_last_disconnect_on_disk
            .unwrap_or(manager.manage_last_disconnect_on_disk)
    }

    /// Effective disk flag for name changes.
    pub fn effective_save_names(&self, manager: &ManagerConfig) -> bool {
        self.save_name_changes_to_disk
            .unwrap_or(manager.save_name_changes_to_disk)
    }
}

impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("reconnect", &self.reconnect)
            .field(
                "manage_last_disconnect_on_disk",
                &self.manage_last_disconnect_on_disk,
            )
            .field("save_name_changes_to_disk", &self.save_name_changes_to_disk)
            .field("auth_factory", &self.auth_factory.is_some())
            .field("init_factory", &self.init_factory.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.auto_update_rate, Duration::from_millis(50));
        assert_eq!(config.gatt_write_mtu_overhead, 3);
        assert!(config.post_callbacks_to_main_thread);
        assert!(!config.auto_scan_during_ota);
    }

    #[test]
    fn test_ota_defaults() {
        let config = ManagerConfig::ota_defaults();
        assert_eq!(config.auto_update_rate, Duration::from_millis(1));
        assert!(!config.post_callbacks_to_main_thread);
        assert!(config.clear_gatt_on_ota_success);
        assert!(config.auto_scan_during_ota);
    }

    #[test]
    fn test_task_timeout_lookup() {
        let timeouts = TaskTimeouts::default();
        assert_eq!(timeouts.for_kind(TaskKind::Connect), timeouts.connect);
        assert_eq!(timeouts.for_kind(TaskKind::Read), timeouts.default);
        assert!(timeouts.for_kind(TaskKind::Scan) > Duration::from_secs(3600));
    }

    #[test]
    fn test_device_overrides_fall_back() {
        let manager = ManagerConfig::default();
        let device = DeviceConfig::new();
        assert!(device.effective_manage_last_disconnect(&manager));
        let device = DeviceConfig {
            manage_last_disconnect_on_disk: Some(false),
            ..Default::default()
        };
        assert!(!device.effective_manage_last_disconnect(&manager));
    }
}
