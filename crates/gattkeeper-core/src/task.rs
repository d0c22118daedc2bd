//! The unit of scheduled work.
//!
//! Every GATT interaction is a [`Task`]: one aggregate struct with a
//! [`TaskKind`] discriminant and a per-kind payload, rather than a type
//! hierarchy. The scheduler owns tasks by value; they refer to their
//! device by address, never by handle.

use std::time::Duration;

use tokio::time::Instant;

use gattkeeper_types::{CharTarget, ConnectionPriority, GattWriteType, MacAddr, PhyOptions};

use crate::config::ManagerConfig;
use crate::stack::ScanParams;
use crate::transaction::TxnId;

/// Scheduler-wide unique task identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) u64);

/// Priority band. Ordering is significant: later variants outrank earlier
/// ones. `ForExplicitBondingOnly` sits above `Critical` so an explicit
/// user-requested bond is never starved by internal recovery work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    Trivial,
    Low,
    Medium,
    High,
    Critical,
    ForExplicitBondingOnly,
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    /// Selected for execution this tick; becomes `Executing` when the
    /// native call is issued.
    Armed,
    Executing,
    Succeeded,
    Failed,
    TimedOut,
    /// Removed by a conflicting task for a different device.
    Cancelled,
    /// Removed by a conflicting task for the same device.
    SoftlyCancelled,
    /// Nothing to do; the operation was moot when it reached the executor.
    NoOp,
    /// The requested effect was already in place; no native call issued.
    Redundant,
    /// Preempted by a higher-priority task.
    Interrupted,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Queued | TaskState::Armed | TaskState::Executing)
    }
}

/// What a task does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    TurnBleOn,
    TurnBleOff,
    Scan,
    Connect,
    Disconnect,
    DiscoverServices,
    Bond,
    Unbond,
    Read,
    Write,
    Notify,
    ReadDescriptor,
    WriteDescriptor,
    ReadRssi,
    SetMtu,
    SetConnectionPriority,
    SetPhy,
    ReadPhy,
    ReliableWriteBegin,
    ReliableWriteExecute,
    ReliableWriteAbort,
    CrashResolver,
    TxnAuth,
    TxnInit,
    TxnOta,
    UserTxn,
}

impl TaskKind {
    /// Kinds that operate on an established connection.
    pub fn requires_connection(self) -> bool {
        matches!(
            self,
            TaskKind::DiscoverServices
                | TaskKind::Read
                | TaskKind::Write
                | TaskKind::Notify
                | TaskKind::ReadDescriptor
                | TaskKind::WriteDescriptor
                | TaskKind::ReadRssi
                | TaskKind::SetMtu
                | TaskKind::SetConnectionPriority
                | TaskKind::SetPhy
                | TaskKind::ReadPhy
                | TaskKind::ReliableWriteBegin
                | TaskKind::ReliableWriteExecute
                | TaskKind::ReliableWriteAbort
        )
    }

    /// Kinds that need the adapter powered. Only adapter power control
    /// itself is exempt.
    pub fn requires_ble_on(self) -> bool {
        !matches!(self, TaskKind::TurnBleOn | TaskKind::TurnBleOff)
    }

    /// Whether this kind is a transaction-start marker.
    pub fn is_txn_start(self) -> bool {
        matches!(
            self,
            TaskKind::TxnAuth | TaskKind::TxnInit | TaskKind::TxnOta | TaskKind::UserTxn
        )
    }
}

/// Per-kind payload.
#[derive(Debug, Clone)]
pub(crate) enum TaskPayload {
    None,
    TurnBle {
        implicit: bool,
    },
    Scan {
        params: ScanParams,
        started_at: Option<Instant>,
    },
    Connect {
        auto_connect: bool,
    },
    Read {
        target: CharTarget,
        /// Set when this read stands in for a notification that never
        /// arrived within the forced-read window.
        pseudo_notification: bool,
    },
    Write {
        target: CharTarget,
        value: Vec<u8>,
        write_type: GattWriteType,
    },
    Notify {
        target: CharTarget,
        enable: bool,
        force_read_timeout: Option<Duration>,
    },
    DescriptorRead {
        target: CharTarget,
    },
    DescriptorWrite {
        target: CharTarget,
        value: Vec<u8>,
    },
    Mtu {
        mtu: u16,
    },
    Priority {
        priority: ConnectionPriority,
    },
    PhySet {
        phys: PhyOptions,
    },
    Txn {
        txn_id: TxnId,
    },
    CrashResolver {
        part_of_reset: bool,
        started: bool,
    },
}

/// One schedulable unit of work.
#[derive(Debug)]
pub(crate) struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub device: Option<MacAddr>,
    pub priority: TaskPriority,
    pub state: TaskState,
    pub payload: TaskPayload,
    /// Deadline measured from `created_at`, whether queued or executing.
    pub timeout: Duration,
    /// User-requested, as opposed to internal. Breaks FIFO ties.
    pub explicit: bool,
    /// Transaction this task is bound to, if any. Bound tasks refuse
    /// cancellation by anything short of a disconnect or adapter-off.
    pub txn: Option<TxnId>,
    /// Enqueue sequence; preserved across an interrupt-requeue so the task
    /// keeps its place within its priority band.
    pub seq: u64,
    pub created_at: Instant,
    pub executing_since: Option<Instant>,
    /// The one-shot internal retry for transient native failures was
    /// already spent.
    pub retried_internally: bool,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        kind: TaskKind,
        device: Option<MacAddr>,
        priority: TaskPriority,
        payload: TaskPayload,
        config: &ManagerConfig,
        now: Instant,
    ) -> Self {
        Task {
            id,
            kind,
            device,
            priority,
            state: TaskState::Queued,
            payload,
            timeout: config.task_timeouts.for_kind(kind),
            explicit: false,
            txn: None,
            seq: 0,
            created_at: now,
            executing_since: None,
            retried_internally: false,
        }
    }

    #[must_use]
    pub(crate) fn explicit(mut self) -> Self {
        self.explicit = true;
        self
    }

    #[must_use]
    pub(crate) fn bound_to(mut self, txn: TxnId) -> Self {
        self.txn = Some(txn);
        self
    }

    #[must_use]
    pub(crate) fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub(crate) fn requires_connection(&self) -> bool {
        self.kind.requires_connection()
    }

    pub(crate) fn requires_ble_on(&self) -> bool {
        self.kind.requires_ble_on()
    }

    /// Whether the deadline has elapsed.
    pub(crate) fn past_deadline(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.timeout
    }

    /// Move to a terminal state. Idempotent: the first terminal state
    /// sticks.
    pub(crate) fn mark(&mut self, state: TaskState) {
        debug_assert!(state.is_terminal());
        if !self.state.is_terminal() {
            self.state = state;
        }
    }

    /// Total time from submission until `now`.
    pub(crate) fn time_total(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Time spent executing until `now`.
    pub(crate) fn time_executing(&self, now: Instant) -> Duration {
        self.executing_since
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(Duration::ZERO)
    }

    /// Whether an enqueued `other` cancels this task out of the queue.
    pub(crate) fn is_cancellable_by(&self, other: &Task) -> bool {
        let same_device = match (self.device, other.device) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };

        // Adapter-off sweeps everything that needs the radio, with one
        // exemption: a crash resolver that is part of a reset survives an
        // explicit off (the reset sequence owns it).
        if other.kind == TaskKind::TurnBleOff {
            let off_implicit = matches!(other.payload, TaskPayload::TurnBle { implicit: true });
            if let TaskPayload::CrashResolver { part_of_reset, .. } = self.payload {
                return off_implicit || !part_of_reset;
            }
            return self.requires_ble_on();
        }

        // Transaction-bound tasks refuse cancellation by peer user
        // operations; only a disconnect for their device gets through.
        if self.txn.is_some() {
            return other.kind == TaskKind::Disconnect && same_device;
        }

        match other.kind {
            // A fresh connect supersedes a queued disconnect.
            TaskKind::Connect => self.kind == TaskKind::Disconnect && same_device,
            // A disconnect clears the device's pending pipeline. Bonding
            // is deliberately left alone: it does not need a connection.
            TaskKind::Disconnect => {
                same_device
                    && matches!(
                        self.kind,
                        TaskKind::Connect
                            | TaskKind::DiscoverServices
                            | TaskKind::Read
                            | TaskKind::Write
                            | TaskKind::Notify
                            | TaskKind::ReadDescriptor
                            | TaskKind::WriteDescriptor
                            | TaskKind::ReadRssi
                            | TaskKind::SetMtu
                            | TaskKind::SetConnectionPriority
                            | TaskKind::SetPhy
                            | TaskKind::ReadPhy
                            | TaskKind::ReliableWriteBegin
                            | TaskKind::ReliableWriteExecute
                            | TaskKind::ReliableWriteAbort
                            | TaskKind::TxnAuth
                            | TaskKind::TxnInit
                            | TaskKind::TxnOta
                            | TaskKind::UserTxn
                    )
            }
            _ => false,
        }
    }

    /// Whether `other`, being enqueued at strictly higher priority, may
    /// preempt this task mid-execution.
    pub(crate) fn is_interruptible_by(&self, other: &Task) -> bool {
        match self.kind {
            // A scan yields to anything that outranks it.
            TaskKind::Scan => true,
            // In-flight GATT operations yield only to critical work
            // (disconnects, adapter-off, crash recovery).
            TaskKind::Read
            | TaskKind::Write
            | TaskKind::Notify
            | TaskKind::ReadDescriptor
            | TaskKind::WriteDescriptor
            | TaskKind::ReadRssi => other.priority >= TaskPriority::Critical,
            _ => false,
        }
    }

    /// Whether the task re-enters the queue (keeping its place) after an
    /// interrupt, rather than terminating.
    pub(crate) fn requeues_after_interrupt(&self) -> bool {
        self.kind == TaskKind::Scan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(last: u8) -> MacAddr {
        MacAddr::new([0xAA, 0xBB, 0xCC, 0, 0, last])
    }

    fn task(kind: TaskKind, device: Option<MacAddr>, priority: TaskPriority) -> Task {
        let config = ManagerConfig::default();
        Task::new(
            TaskId(1),
            kind,
            device,
            priority,
            TaskPayload::None,
            &config,
            Instant::now(),
        )
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::ForExplicitBondingOnly > TaskPriority::Critical);
        assert!(TaskPriority::Low > TaskPriority::Trivial);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_cancels_queued_disconnect_same_device_only() {
        let disconnect = task(TaskKind::Disconnect, Some(mac(1)), TaskPriority::Critical);
        let connect_same = task(TaskKind::Connect, Some(mac(1)), TaskPriority::Medium);
        let connect_other = task(TaskKind::Connect, Some(mac(2)), TaskPriority::Medium);
        assert!(disconnect.is_cancellable_by(&connect_same));
        assert!(!disconnect.is_cancellable_by(&connect_other));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_sweeps_device_pipeline() {
        let read = task(TaskKind::Read, Some(mac(1)), TaskPriority::Medium);
        let bond = task(TaskKind::Bond, Some(mac(1)), TaskPriority::ForExplicitBondingOnly);
        let disconnect = task(TaskKind::Disconnect, Some(mac(1)), TaskPriority::Critical);
        assert!(read.is_cancellable_by(&disconnect));
        assert!(!bond.is_cancellable_by(&disconnect));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ble_off_sweeps_almost_everything() {
        let off = {
            let mut t = task(TaskKind::TurnBleOff, None, TaskPriority::Critical);
            t.payload = TaskPayload::TurnBle { implicit: false };
            t
        };
        let read = task(TaskKind::Read, Some(mac(1)), TaskPriority::Medium);
        let on = task(TaskKind::TurnBleOn, None, TaskPriority::Critical);
        assert!(read.is_cancellable_by(&off));
        assert!(!on.is_cancellable_by(&off));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_crash_resolver_survives_explicit_off() {
        let mut resolver = task(TaskKind::CrashResolver, None, TaskPriority::Critical);
        resolver.payload = TaskPayload::CrashResolver {
            part_of_reset: true,
            started: false,
        };
        let explicit_off = {
            let mut t = task(TaskKind::TurnBleOff, None, TaskPriority::Critical);
            t.payload = TaskPayload::TurnBle { implicit: false };
            t
        };
        let implicit_off = {
            let mut t = task(TaskKind::TurnBleOff, None, TaskPriority::Critical);
            t.payload = TaskPayload::TurnBle { implicit: true };
            t
        };
        assert!(!resolver.is_cancellable_by(&explicit_off));
        assert!(resolver.is_cancellable_by(&implicit_off));

        let mut standalone = task(TaskKind::CrashResolver, None, TaskPriority::Critical);
        standalone.payload = TaskPayload::CrashResolver {
            part_of_reset: false,
            started: false,
        };
        assert!(standalone.is_cancellable_by(&explicit_off));
    }

    #[tokio::test(start_paused = true)]
    async fn test_txn_bound_tasks_refuse_peer_cancellation() {
        let bound = task(TaskKind::Write, Some(mac(1)), TaskPriority::High).bound_to(TxnId(1));
        let user_write = task(TaskKind::Write, Some(mac(1)), TaskPriority::Medium);
        let disconnect = task(TaskKind::Disconnect, Some(mac(1)), TaskPriority::Critical);
        assert!(!bound.is_cancellable_by(&user_write));
        assert!(bound.is_cancellable_by(&disconnect));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interruptibility() {
        let read = task(TaskKind::Read, Some(mac(1)), TaskPriority::Low);
        let disconnect = task(TaskKind::Disconnect, Some(mac(1)), TaskPriority::Critical);
        let high_write = task(TaskKind::Write, Some(mac(1)), TaskPriority::High);
        assert!(read.is_interruptible_by(&disconnect));
        assert!(!read.is_interruptible_by(&high_write));

        let scan = task(TaskKind::Scan, None, TaskPriority::Trivial);
        assert!(scan.is_interruptible_by(&high_write));
        assert!(scan.requeues_after_interrupt());
        assert!(!read.requeues_after_interrupt());
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_marking_is_idempotent() {
        let mut t = task(TaskKind::Read, Some(mac(1)), TaskPriority::Medium);
        t.mark(TaskState::Succeeded);
        t.mark(TaskState::Failed);
        assert_eq!(t.state, TaskState::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let mut t = task(TaskKind::Read, Some(mac(1)), TaskPriority::Medium);
        t.timeout = Duration::from_secs(1);
        let now = t.created_at;
        assert!(!t.past_deadline(now + Duration::from_millis(999)));
        assert!(t.past_deadline(now + Duration::from_millis(1001)));
    }

    #[test]
    fn test_preconditions() {
        assert!(TaskKind::Read.requires_connection());
        assert!(!TaskKind::Connect.requires_connection());
        assert!(!TaskKind::Bond.requires_connection());
        assert!(TaskKind::CrashResolver.requires_ble_on());
        assert!(!TaskKind::TurnBleOn.requires_ble_on());
    }
}
