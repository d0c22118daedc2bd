//! The global task queue.
//!
//! One queue serialises every operation in the system. Ordering is
//! priority-descending, then explicit-before-implicit, then FIFO by
//! enqueue sequence. At most one task occupies the executor slot; the
//! engine asks the queue for the next ready task whenever the slot is
//! free. A task whose preconditions (adapter on, device connected) do not
//! hold is skipped, not removed: it stays in place until the preconditions
//! are met or its deadline elapses.

use std::cmp::Reverse;
use std::collections::{HashSet, VecDeque};

use tokio::time::Instant;

use gattkeeper_types::MacAddr;

use crate::task::{Task, TaskId, TaskState};

/// Snapshot of the preconditions evaluated when picking the next task.
#[derive(Debug, Default)]
pub(crate) struct Preconds {
    pub ble_on: bool,
    pub connected: HashSet<MacAddr>,
}

impl Preconds {
    fn satisfied_by(&self, task: &Task) -> bool {
        if task.requires_ble_on() && !self.ble_on {
            return false;
        }
        if task.requires_connection() {
            match task.device {
                Some(mac) => self.connected.contains(&mac),
                None => false,
            }
        } else {
            true
        }
    }
}

/// Result of admitting a task.
#[derive(Debug)]
pub(crate) struct AdmitOutcome {
    /// Queued tasks removed by the cancellation sweep, already marked
    /// `Cancelled` or `SoftlyCancelled`.
    pub cancelled: Vec<Task>,
    /// The currently executing task should be interrupted in favour of
    /// the admitted one.
    pub preempt: bool,
}

#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    items: VecDeque<Task>,
    current: Option<Task>,
    next_seq: u64,
    next_id: u64,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        TaskQueue {
            items: VecDeque::new(),
            current: None,
            next_seq: 1,
            next_id: 1,
        }
    }

    pub(crate) fn alloc_id(&mut self) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Scheduling key: smaller runs earlier.
    fn key(task: &Task) -> (Reverse<crate::task::TaskPriority>, Reverse<bool>, u64) {
        (Reverse(task.priority), Reverse(task.explicit), task.seq)
    }

    fn insert_ordered(&mut self, task: Task) {
        let key = Self::key(&task);
        let pos = self
            .items
            .iter()
            .position(|t| Self::key(t) > key)
            .unwrap_or(self.items.len());
        self.items.insert(pos, task);
    }

    /// Admit a new task: run the cancellation sweep, decide preemption,
    /// and insert in order.
    pub(crate) fn admit(&mut self, mut task: Task) -> AdmitOutcome {
        task.seq = self.next_seq;
        self.next_seq += 1;

        // Cancellation on enqueue: same-device casualties are soft.
        let mut cancelled = Vec::new();
        let mut kept = VecDeque::with_capacity(self.items.len());
        for mut queued in self.items.drain(..) {
            if queued.is_cancellable_by(&task) {
                let soft = match (queued.device, task.device) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                };
                queued.mark(if soft {
                    TaskState::SoftlyCancelled
                } else {
                    TaskState::Cancelled
                });
                cancelled.push(queued);
            } else {
                kept.push_back(queued);
            }
        }
        self.items = kept;

        let preempt = match &self.current {
            Some(current) => {
                task.priority > current.priority && current.is_interruptible_by(&task)
            }
            None => false,
        };

        self.insert_ordered(task);
        AdmitOutcome { cancelled, preempt }
    }

    /// Re-insert an interrupted task, keeping its original sequence so it
    /// lands at the head of its priority band.
    pub(crate) fn requeue_preserving_seq(&mut self, mut task: Task) {
        task.state = TaskState::Queued;
        task.executing_since = None;
        self.insert_ordered(task);
    }

    /// Remove and return the first queued task whose preconditions hold.
    pub(crate) fn take_next_ready(&mut self, preconds: &Preconds) -> Option<Task> {
        let pos = self.items.iter().position(|t| preconds.satisfied_by(t))?;
        self.items.remove(pos)
    }

    /// Remove queued tasks whose deadline has elapsed, marked `TimedOut`.
    pub(crate) fn collect_timed_out(&mut self, now: Instant) -> Vec<Task> {
        let mut out = Vec::new();
        let mut kept = VecDeque::with_capacity(self.items.len());
        for mut task in self.items.drain(..) {
            if task.past_deadline(now) {
                task.mark(TaskState::TimedOut);
                out.push(task);
            } else {
                kept.push_back(task);
            }
        }
        self.items = kept;
        out
    }

    /// Remove queued tasks matching the predicate, marked with `state`.
    pub(crate) fn cancel_matching(
        &mut self,
        state: TaskState,
        pred: impl Fn(&Task) -> bool,
    ) -> Vec<Task> {
        let mut out = Vec::new();
        let mut kept = VecDeque::with_capacity(self.items.len());
        for mut task in self.items.drain(..) {
            if pred(&task) {
                task.mark(state);
                out.push(task);
            } else {
                kept.push_back(task);
            }
        }
        self.items = kept;
        out
    }

    pub(crate) fn has_current(&self) -> bool {
        self.current.is_some()
    }

    pub(crate) fn current(&self) -> Option<&Task> {
        self.current.as_ref()
    }

    pub(crate) fn current_mut(&mut self) -> Option<&mut Task> {
        self.current.as_mut()
    }

    pub(crate) fn take_current(&mut self) -> Option<Task> {
        self.current.take()
    }

    pub(crate) fn set_current(&mut self, task: Task) {
        debug_assert!(self.current.is_none(), "executor slot already occupied");
        self.current = Some(task);
    }

    /// Whether any queued (not executing) task matches.
    pub(crate) fn any_queued(&self, pred: impl Fn(&Task) -> bool) -> bool {
        self.items.iter().any(pred)
    }

    pub(crate) fn queued_len(&self) -> usize {
        self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::task::{TaskKind, TaskPayload, TaskPriority};
    use crate::transaction::TxnId;

    fn mac(last: u8) -> MacAddr {
        MacAddr::new([0, 0, 0, 0, 0, last])
    }

    struct Fixture {
        queue: TaskQueue,
        config: ManagerConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                queue: TaskQueue::new(),
                config: ManagerConfig::default(),
            }
        }

        fn task(
            &mut self,
            kind: TaskKind,
            device: Option<MacAddr>,
            priority: TaskPriority,
        ) -> Task {
            let id = self.queue.alloc_id();
            Task::new(
                id,
                kind,
                device,
                priority,
                TaskPayload::None,
                &self.config,
                Instant::now(),
            )
        }
    }

    fn all_preconds(macs: &[MacAddr]) -> Preconds {
        Preconds {
            ble_on: true,
            connected: macs.iter().copied().collect(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_before_fifo() {
        let mut f = Fixture::new();
        let low = f.task(TaskKind::Read, Some(mac(1)), TaskPriority::Low);
        let high = f.task(TaskKind::Read, Some(mac(1)), TaskPriority::High);
        let low_id = low.id;
        let high_id = high.id;
        f.queue.admit(low);
        f.queue.admit(high);

        let preconds = all_preconds(&[mac(1)]);
        assert_eq!(f.queue.take_next_ready(&preconds).unwrap().id, high_id);
        assert_eq!(f.queue.take_next_ready(&preconds).unwrap().id, low_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_within_priority() {
        let mut f = Fixture::new();
        let first = f.task(TaskKind::Read, Some(mac(1)), TaskPriority::Medium);
        let second = f.task(TaskKind::Read, Some(mac(1)), TaskPriority::Medium);
        let first_id = first.id;
        f.queue.admit(first);
        f.queue.admit(second);

        let preconds = all_preconds(&[mac(1)]);
        assert_eq!(f.queue.take_next_ready(&preconds).unwrap().id, first_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_outranks_implicit_at_same_priority() {
        let mut f = Fixture::new();
        let implicit = f.task(TaskKind::Read, Some(mac(1)), TaskPriority::Medium);
        let explicit = f
            .task(TaskKind::Write, Some(mac(1)), TaskPriority::Medium)
            .explicit();
        let explicit_id = explicit.id;
        f.queue.admit(implicit);
        f.queue.admit(explicit);

        let preconds = all_preconds(&[mac(1)]);
        assert_eq!(f.queue.take_next_ready(&preconds).unwrap().id, explicit_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unready_task_skipped_not_removed() {
        let mut f = Fixture::new();
        let read = f.task(TaskKind::Read, Some(mac(1)), TaskPriority::High);
        let bond = f.task(TaskKind::Bond, Some(mac(1)), TaskPriority::Low);
        let read_id = read.id;
        let bond_id = bond.id;
        f.queue.admit(read);
        f.queue.admit(bond);

        // Device not connected: the read is skipped, the bond runs.
        let preconds = all_preconds(&[]);
        assert_eq!(f.queue.take_next_ready(&preconds).unwrap().id, bond_id);
        assert_eq!(f.queue.queued_len(), 1);

        // Once connected the read becomes eligible.
        let preconds = all_preconds(&[mac(1)]);
        assert_eq!(f.queue.take_next_ready(&preconds).unwrap().id, read_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_cancels_queued_disconnect_softly() {
        let mut f = Fixture::new();
        let disconnect = f.task(TaskKind::Disconnect, Some(mac(1)), TaskPriority::Critical);
        f.queue.admit(disconnect);

        let connect = f.task(TaskKind::Connect, Some(mac(1)), TaskPriority::Medium);
        let outcome = f.queue.admit(connect);
        assert_eq!(outcome.cancelled.len(), 1);
        assert_eq!(outcome.cancelled[0].state, TaskState::SoftlyCancelled);
        assert_eq!(f.queue.queued_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cross_device_cancellation_is_hard() {
        let mut f = Fixture::new();
        let read = f.task(TaskKind::Read, Some(mac(1)), TaskPriority::Medium);
        f.queue.admit(read);

        let mut off = f.task(TaskKind::TurnBleOff, None, TaskPriority::Critical);
        off.payload = TaskPayload::TurnBle { implicit: false };
        let outcome = f.queue.admit(off);
        assert_eq!(outcome.cancelled.len(), 1);
        assert_eq!(outcome.cancelled[0].state, TaskState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preemption_flag() {
        let mut f = Fixture::new();
        let mut read = f.task(TaskKind::Read, Some(mac(1)), TaskPriority::Low);
        read.state = TaskState::Executing;
        f.queue.set_current(read);

        // Higher priority but not interrupting: no preempt.
        let write = f.task(TaskKind::Write, Some(mac(1)), TaskPriority::High);
        assert!(!f.queue.admit(write).preempt);

        // Critical disconnect interrupts the executing read.
        let disconnect = f.task(TaskKind::Disconnect, Some(mac(1)), TaskPriority::Critical);
        assert!(f.queue.admit(disconnect).preempt);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_keeps_band_position() {
        let mut f = Fixture::new();
        let first = f.task(TaskKind::Scan, None, TaskPriority::Medium);
        let first_id = first.id;
        let outcome = f.queue.admit(first);
        assert!(outcome.cancelled.is_empty());
        let mut first = f
            .queue
            .take_next_ready(&all_preconds(&[]))
            .expect("scan ready");
        assert_eq!(first.id, first_id);
        first.state = TaskState::Executing;

        let second = f.task(TaskKind::Read, Some(mac(1)), TaskPriority::Medium);
        f.queue.admit(second);

        // The interrupted scan keeps its earlier sequence and goes back in
        // front of the later read.
        f.queue.requeue_preserving_seq(first);
        assert_eq!(
            f.queue.take_next_ready(&all_preconds(&[])).unwrap().id,
            first_id
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_collection() {
        let mut f = Fixture::new();
        let task = f
            .task(TaskKind::Read, Some(mac(1)), TaskPriority::Medium)
            .with_timeout(std::time::Duration::from_secs(1));
        let created = task.created_at;
        f.queue.admit(task);

        assert!(f
            .queue
            .collect_timed_out(created + std::time::Duration::from_millis(500))
            .is_empty());
        let out = f
            .queue
            .collect_timed_out(created + std::time::Duration::from_millis(1500));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].state, TaskState::TimedOut);
        assert_eq!(f.queue.queued_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_txn_bound_survives_user_sweep() {
        let mut f = Fixture::new();
        let bound = f
            .task(TaskKind::Write, Some(mac(1)), TaskPriority::High)
            .bound_to(TxnId(7));
        f.queue.admit(bound);

        let user_read = f.task(TaskKind::Read, Some(mac(1)), TaskPriority::Medium).explicit();
        let outcome = f.queue.admit(user_read);
        assert!(outcome.cancelled.is_empty());
        assert_eq!(f.queue.queued_len(), 2);
    }
}
