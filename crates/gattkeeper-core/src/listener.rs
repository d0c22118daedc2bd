//! LIFO listener stacks.
//!
//! Each event slot is a stack of listeners: pushing adds a listener on
//! top, popping removes it, and events go only to the top. A UI screen can
//! push its own listener on entry and pop it on exit without disturbing
//! whatever was listening underneath. `set` clears the stack and pushes.
//!
//! Listeners are identity-compared by their [`ListenerId`] for targeted
//! removal.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::events::{
    BondEvent, ConnectEvent, ConnectFailEvent, DiscoveryEvent, HistoricalDataLoadEvent,
    NotificationEvent, ReadWriteEvent, StateChangeEvent,
};

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// The registration half of a listener: hand this to the manager.
#[derive(Debug)]
pub struct EventListener<E> {
    id: ListenerId,
    tx: mpsc::UnboundedSender<E>,
}

impl<E> EventListener<E> {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<E> {
        self.tx.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The receiving half of a listener.
#[derive(Debug)]
pub struct EventStream<E> {
    rx: mpsc::UnboundedReceiver<E>,
}

impl<E> EventStream<E> {
    /// Wait for the next event. `None` after the listener was dropped by
    /// the manager (shutdown).
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}

/// Create a listener and its event stream.
pub fn listener<E>() -> (EventListener<E>, EventStream<E>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
    (EventListener { id, tx }, EventStream { rx })
}

/// One LIFO stack of listeners for a single event type.
#[derive(Debug)]
pub(crate) struct ListenerStack<E> {
    entries: Vec<EventListener<E>>,
}

impl<E> Default for ListenerStack<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> ListenerStack<E> {
    pub(crate) fn new() -> Self {
        ListenerStack {
            entries: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, listener: EventListener<E>) {
        self.entries.push(listener);
    }

    /// Remove and drop the top listener. Returns false on an empty stack.
    pub(crate) fn pop(&mut self) -> bool {
        self.entries.pop().is_some()
    }

    /// Remove the specific listener wherever it sits in the stack.
    pub(crate) fn pop_specific(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id() != id);
        self.entries.len() != before
    }

    /// Clear the stack and push one listener.
    pub(crate) fn set(&mut self, listener: EventListener<E>) {
        self.entries.clear();
        self.entries.push(listener);
    }

    /// The top live listener's sender, pruning listeners whose streams
    /// were dropped.
    pub(crate) fn head_sender(&mut self) -> Option<mpsc::UnboundedSender<E>> {
        while let Some(top) = self.entries.last() {
            if top.is_closed() {
                self.entries.pop();
            } else {
                return Some(top.sender());
            }
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// The per-device listener slots.
#[derive(Debug, Default)]
pub(crate) struct DeviceListeners {
    pub state: ListenerStack<StateChangeEvent>,
    pub connect: ListenerStack<ConnectEvent>,
    pub reconnect: ListenerStack<ConnectFailEvent>,
    pub read_write: ListenerStack<ReadWriteEvent>,
    pub notification: ListenerStack<NotificationEvent>,
    pub bond: ListenerStack<BondEvent>,
    pub historical: ListenerStack<HistoricalDataLoadEvent>,
}

impl DeviceListeners {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

/// Manager-level listener slots: these see the corresponding events for
/// every device, plus discovery which has no per-device analogue.
#[derive(Debug, Default)]
pub(crate) struct ManagerListeners {
    pub discovery: ListenerStack<DiscoveryEvent>,
    pub state: ListenerStack<StateChangeEvent>,
    pub connect: ListenerStack<ConnectEvent>,
    pub reconnect: ListenerStack<ConnectFailEvent>,
    pub read_write: ListenerStack<ReadWriteEvent>,
    pub notification: ListenerStack<NotificationEvent>,
    pub bond: ListenerStack<BondEvent>,
    pub historical: ListenerStack<HistoricalDataLoadEvent>,
}

impl ManagerListeners {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_go_to_head_only() {
        let mut stack = ListenerStack::new();
        let (bottom, mut bottom_rx) = listener::<u32>();
        let (top, mut top_rx) = listener::<u32>();
        stack.push(bottom);
        stack.push(top);

        stack.head_sender().unwrap().send(7).unwrap();
        assert_eq!(top_rx.try_recv(), Some(7));
        assert_eq!(bottom_rx.try_recv(), None);
    }

    #[tokio::test]
    async fn test_pop_restores_previous() {
        let mut stack = ListenerStack::new();
        let (bottom, mut bottom_rx) = listener::<u32>();
        let (top, _top_rx) = listener::<u32>();
        stack.push(bottom);
        stack.push(top);

        assert!(stack.pop());
        stack.head_sender().unwrap().send(1).unwrap();
        assert_eq!(bottom_rx.try_recv(), Some(1));
    }

    #[tokio::test]
    async fn test_set_clears() {
        let mut stack = ListenerStack::new();
        let (a, _a_rx) = listener::<u32>();
        let (b, _b_rx) = listener::<u32>();
        let (c, mut c_rx) = listener::<u32>();
        stack.push(a);
        stack.push(b);
        stack.set(c);
        assert_eq!(stack.len(), 1);
        stack.head_sender().unwrap().send(3).unwrap();
        assert_eq!(c_rx.try_recv(), Some(3));
    }

    #[tokio::test]
    async fn test_pop_specific_by_identity() {
        let mut stack = ListenerStack::new();
        let (a, mut a_rx) = listener::<u32>();
        let (b, _b_rx) = listener::<u32>();
        let b_id = b.id();
        stack.push(a);
        stack.push(b);

        assert!(stack.pop_specific(b_id));
        assert!(!stack.pop_specific(b_id));
        stack.head_sender().unwrap().send(9).unwrap();
        assert_eq!(a_rx.try_recv(), Some(9));
    }

    #[tokio::test]
    async fn test_dead_head_is_pruned() {
        let mut stack = ListenerStack::new();
        let (a, mut a_rx) = listener::<u32>();
        let (b, b_rx) = listener::<u32>();
        stack.push(a);
        stack.push(b);
        drop(b_rx);

        stack.head_sender().unwrap().send(5).unwrap();
        assert_eq!(a_rx.try_recv(), Some(5));
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn test_empty_stack() {
        let mut stack = ListenerStack::<u32>::new();
        assert!(stack.head_sender().is_none());
        assert!(!stack.pop());
    }
}
