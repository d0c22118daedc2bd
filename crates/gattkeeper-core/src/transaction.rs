//! Transactions: ordered groups of GATT operations that gate device state.
//!
//! An authentication transaction runs after service discovery and holds
//! the device in `Authenticating`; only its success allows initialization
//! to start, and only initialization's success sets `Initialized`. OTA
//! transactions run on an initialized device and hold `PerformingOta`.
//!
//! A transaction is application code driving library operations: the
//! engine calls [`GattTransaction::on_start`], the transaction queues
//! reads/writes through its [`TxnCtx`], and each outcome comes back via
//! [`GattTransaction::on_result`] until the transaction calls `succeed` or
//! `fail`. Operations queued through the context run at elevated priority
//! and refuse cancellation by unrelated user operations.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::time::Duration;

use gattkeeper_types::{CharTarget, GattWriteType, MacAddr};

use crate::events::ReadWriteEvent;
use crate::task::TaskId;

/// Identity of a running transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxnId(pub(crate) u64);

/// What a transaction gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnKind {
    /// Gates `Authenticating`/`Authenticated`.
    Auth,
    /// Gates `Initializing`/`Initialized`.
    Init,
    /// Gates `PerformingOta`.
    Ota,
    /// Application-defined; no state gating beyond task binding.
    UserCustom,
}

/// An operation queued by a transaction, to be turned into a bound task.
#[derive(Debug, Clone)]
pub(crate) enum TxnOp {
    Read(CharTarget),
    Write(CharTarget, Vec<u8>, GattWriteType),
    Notify(CharTarget, bool),
}

/// The transaction's handle into the engine while one of its callbacks
/// runs. Queued operations and the success/fail verdict are collected here
/// and applied when the callback returns.
pub struct TxnCtx<'a> {
    device: MacAddr,
    ops: &'a mut Vec<TxnOp>,
    verdict: &'a mut Option<bool>,
}

impl<'a> TxnCtx<'a> {
    pub(crate) fn new(
        device: MacAddr,
        ops: &'a mut Vec<TxnOp>,
        verdict: &'a mut Option<bool>,
    ) -> Self {
        TxnCtx {
            device,
            ops,
            verdict,
        }
    }

    /// The device this transaction runs against.
    pub fn device(&self) -> MacAddr {
        self.device
    }

    /// Queue a read of the target.
    pub fn read(&mut self, target: CharTarget) {
        self.ops.push(TxnOp::Read(target));
    }

    /// Queue a write with the default write type.
    pub fn write(&mut self, target: CharTarget, value: Vec<u8>) {
        self.ops
            .push(TxnOp::Write(target, value, GattWriteType::WithResponse));
    }

    /// Queue a write with an explicit write type.
    pub fn write_with_type(
        &mut self,
        target: CharTarget,
        value: Vec<u8>,
        write_type: GattWriteType,
    ) {
        self.ops.push(TxnOp::Write(target, value, write_type));
    }

    /// Queue enabling notifications on the target.
    pub fn enable_notify(&mut self, target: CharTarget) {
        self.ops.push(TxnOp::Notify(target, true));
    }

    /// Queue disabling notifications on the target.
    pub fn disable_notify(&mut self, target: CharTarget) {
        self.ops.push(TxnOp::Notify(target, false));
    }

    /// End the transaction successfully.
    pub fn succeed(&mut self) {
        self.verdict.get_or_insert(true);
    }

    /// End the transaction in failure.
    pub fn fail(&mut self) {
        self.verdict.get_or_insert(false);
    }
}

/// Application-defined transaction body.
///
/// Implementations must eventually call `ctx.succeed()` or `ctx.fail()`;
/// until then the containing state bit stays set. Outstanding operations
/// that fail do not end the transaction implicitly: the body decides in
/// `on_result`.
pub trait GattTransaction: Send {
    /// Called once when the transaction starts.
    fn on_start(&mut self, ctx: &mut TxnCtx<'_>);

    /// Called with the outcome of every operation this transaction queued.
    fn on_result(&mut self, ctx: &mut TxnCtx<'_>, event: &ReadWriteEvent) {
        let _ = (ctx, event);
    }

    /// Called every tick while the transaction is running.
    fn on_update(&mut self, ctx: &mut TxnCtx<'_>, dt: Duration) {
        let _ = (ctx, dt);
    }
}

/// Engine-side record of a running transaction.
pub(crate) struct ActiveTxn {
    pub id: TxnId,
    pub kind: TxnKind,
    pub device: MacAddr,
    pub body: Box<dyn GattTransaction>,
    /// Tasks queued by this transaction that have not reached a terminal
    /// state yet.
    pub pending: HashSet<TaskId>,
    /// Set when the body called succeed/fail; the engine finalises at a
    /// safe point in the tick.
    pub verdict: Option<bool>,
}

impl std::fmt::Debug for ActiveTxn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveTxn")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("device", &self.device)
            .field("pending", &self.pending.len())
            .field("verdict", &self.verdict)
            .finish()
    }
}

/// Built-in OTA transaction: writes a queue of payloads to one target, in
/// order, failing fast on the first unsuccessful write.
pub struct OtaWriteTransaction {
    target: CharTarget,
    write_type: GattWriteType,
    queue: VecDeque<Vec<u8>>,
}

impl OtaWriteTransaction {
    pub fn new(target: CharTarget, payloads: Vec<Vec<u8>>) -> Self {
        OtaWriteTransaction {
            target,
            write_type: GattWriteType::WithResponse,
            queue: payloads.into(),
        }
    }

    #[must_use]
    pub fn write_type(mut self, write_type: GattWriteType) -> Self {
        self.write_type = write_type;
        self
    }

    fn write_next(&mut self, ctx: &mut TxnCtx<'_>) {
        match self.queue.pop_front() {
            Some(payload) => ctx.write_with_type(self.target, payload, self.write_type),
            None => ctx.succeed(),
        }
    }
}

impl GattTransaction for OtaWriteTransaction {
    fn on_start(&mut self, ctx: &mut TxnCtx<'_>) {
        self.write_next(ctx);
    }

    fn on_result(&mut self, ctx: &mut TxnCtx<'_>, event: &ReadWriteEvent) {
        if event.was_success() {
            self.write_next(ctx);
        } else {
            ctx.fail();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gattkeeper_types::RwStatus;
    use uuid::Uuid;

    fn mac() -> MacAddr {
        MacAddr::new([0xAA, 0xBB, 0xCC, 0, 1, 2])
    }

    fn target() -> CharTarget {
        CharTarget::characteristic(Uuid::from_u128(0xF00D))
    }

    fn rw_event(status: RwStatus) -> ReadWriteEvent {
        ReadWriteEvent {
            status,
            ..ReadWriteEvent::null(mac(), crate::events::RwOp::Write)
        }
    }

    #[test]
    fn test_ota_writes_in_order_then_succeeds() {
        let mut txn = OtaWriteTransaction::new(target(), vec![vec![0xC0, 0xFF, 0xEE], vec![1, 2]]);
        let mut ops = Vec::new();
        let mut verdict = None;

        let mut ctx = TxnCtx::new(mac(), &mut ops, &mut verdict);
        txn.on_start(&mut ctx);
        assert_eq!(ops.len(), 1);
        assert!(verdict.is_none());
        match &ops[0] {
            TxnOp::Write(_, value, _) => assert_eq!(value, &vec![0xC0, 0xFF, 0xEE]),
            other => panic!("expected write, got {other:?}"),
        }

        let mut ctx = TxnCtx::new(mac(), &mut ops, &mut verdict);
        txn.on_result(&mut ctx, &rw_event(RwStatus::Success));
        assert_eq!(ops.len(), 2);
        assert!(verdict.is_none());

        let mut ctx = TxnCtx::new(mac(), &mut ops, &mut verdict);
        txn.on_result(&mut ctx, &rw_event(RwStatus::Success));
        assert_eq!(ops.len(), 2);
        assert_eq!(verdict, Some(true));
    }

    #[test]
    fn test_ota_fails_fast() {
        let mut txn = OtaWriteTransaction::new(target(), vec![vec![1], vec![2]]);
        let mut ops = Vec::new();
        let mut verdict = None;

        let mut ctx = TxnCtx::new(mac(), &mut ops, &mut verdict);
        txn.on_start(&mut ctx);
        let mut ctx = TxnCtx::new(mac(), &mut ops, &mut verdict);
        txn.on_result(&mut ctx, &rw_event(RwStatus::RemoteGattFailure));
        assert_eq!(verdict, Some(false));
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn test_empty_ota_succeeds_immediately() {
        let mut txn = OtaWriteTransaction::new(target(), vec![]);
        let mut ops = Vec::new();
        let mut verdict = None;
        let mut ctx = TxnCtx::new(mac(), &mut ops, &mut verdict);
        txn.on_start(&mut ctx);
        assert!(ops.is_empty());
        assert_eq!(verdict, Some(true));
    }

    #[test]
    fn test_first_verdict_sticks() {
        let mut ops = Vec::new();
        let mut verdict = None;
        let mut ctx = TxnCtx::new(mac(), &mut ops, &mut verdict);
        ctx.succeed();
        ctx.fail();
        assert_eq!(verdict, Some(true));
    }
}
