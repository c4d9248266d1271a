//! Deferred values with a settled-once contract.
//!
//! A [`Future`] is a handle to a shared cell holding the future's status,
//! its eventual value or error, and a list of weak back-references to the
//! dependents chained onto it. Completing a cell transitions it exactly
//! once, steals the chained list under the lock, and propagates to each
//! dependent outside the lock in reverse order of attachment.

mod block;
mod cancellable;
mod delayed;
mod infinite;
mod promise;
mod set;

pub use block::BlockKind;
pub use cancellable::Cancellable;
pub use delayed::Delayed;
pub use promise::{CancelToken, Promise};

pub(crate) use block::BlockState;
pub(crate) use delayed::DelayedState;
pub(crate) use promise::PromiseState;
pub(crate) use set::{SetPolicy, SetState};

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::{Error, Result, Value};

/// The lifecycle phase of a future.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Status {
    Pending,
    Resolved,
    Rejected,
}

/// The settled outcome of a future.
pub type Outcome = std::result::Result<Value, Error>;

/// A weak back-reference to a dependent future.
///
/// `key` records the dependent's identity at attachment so that a discard
/// can find the node after the dependent has already been released.
struct ChainedNode {
    target: Weak<FutureCell>,
    key: usize,
    awaiting: bool,
}

struct State {
    outcome: Option<Outcome>,
    chained: Vec<ChainedNode>,
}

pub(crate) struct FutureCell {
    state: Mutex<State>,
    pub(crate) variant: Variant,
}

/// Closed set of future kinds; `propagate` and `discard` dispatch on it.
pub(crate) enum Variant {
    /// Settled at construction; immutable.
    Static,
    Promise(PromiseState),
    Cancellable,
    Block(Box<BlockState>),
    Set(SetState),
    Delayed(DelayedState),
    /// Never settles; propagation is unreachable and discard is a no-op.
    Infinite,
    Fiber(Box<crate::fiber::FiberState>),
    Aio(crate::aio::AioState),
    Timeout(crate::timeout::TimeoutState),
    UnixSignal(crate::unix_signal::SignalState),
    Watch(crate::watch::WatchState),
    ChannelReceiver(crate::channel::ReceiverState),
    SemaphoreWaiter(crate::semaphore::WaiterState),
}

impl Variant {
    /// Variant-specific reaction to a completed parent. Returns whether the
    /// propagation was handled; otherwise the cell completes from `completed`.
    fn propagate(&self, cell: &Arc<FutureCell>, completed: &Arc<FutureCell>) -> bool {
        match self {
            Variant::Block(state) => block::propagate(state, cell, completed),
            Variant::Set(state) => set::propagate(state, cell, completed),
            Variant::Delayed(state) => delayed::propagate(state),
            Variant::Fiber(state) => crate::fiber::propagate(state, cell),
            Variant::Infinite => {
                debug_assert!(false, "infinite future received a propagation");
                true
            }
            _ => false,
        }
    }

    /// Invoked when the last awaiting dependent has been discarded.
    fn discard(&self, cell: &FutureCell) {
        match self {
            Variant::Promise(state) => state.discard(),
            Variant::Watch(state) => state.discard(),
            Variant::SemaphoreWaiter(state) => state.discard(cell),
            _ => {}
        }
    }
}

impl FutureCell {
    pub(crate) fn new(variant: Variant) -> Arc<FutureCell> {
        Arc::new(FutureCell {
            state: Mutex::new(State {
                outcome: None,
                chained: Vec::new(),
            }),
            variant,
        })
    }

    fn new_settled(variant: Variant, outcome: Outcome) -> Arc<FutureCell> {
        Arc::new(FutureCell {
            state: Mutex::new(State {
                outcome: Some(outcome),
                chained: Vec::new(),
            }),
            variant,
        })
    }

    pub(crate) fn status(&self) -> Status {
        match &self.state.lock().outcome {
            None => Status::Pending,
            Some(Ok(_)) => Status::Resolved,
            Some(Err(_)) => Status::Rejected,
        }
    }

    /// The settled outcome, or `Err(Pending)` before settlement.
    pub(crate) fn result(&self) -> Outcome {
        match &self.state.lock().outcome {
            None => Err(Error::Pending),
            Some(outcome) => outcome.clone(),
        }
    }

    pub(crate) fn try_result(&self) -> Option<Outcome> {
        self.state.lock().outcome.clone()
    }

    /// Identity key used by the chained-list bookkeeping.
    fn key(&self) -> usize {
        self as *const FutureCell as usize
    }
}

/// Transitions the cell to a terminal state and notifies dependents.
///
/// Completing an already-settled cell is a no-op: racing set members and
/// late source callbacks rely on that.
pub(crate) fn complete(cell: &Arc<FutureCell>, outcome: Outcome) {
    let drained = {
        let mut state = cell.state.lock();
        if state.outcome.is_some() {
            return;
        }
        state.outcome = Some(outcome);
        std::mem::take(&mut state.chained)
    };

    // Reverse order of attachment, with the lock released so dependents may
    // call back into this future freely.
    for node in drained.into_iter().rev() {
        if let Some(dependent) = node.target.upgrade() {
            propagate(&dependent, cell);
        }
    }
}

/// Completes `cell` from another settled future.
pub(crate) fn complete_from(cell: &Arc<FutureCell>, completed: &FutureCell) {
    complete(cell, completed.result());
}

/// Delivers `completed`'s settlement to a dependent.
pub(crate) fn propagate(dependent: &Arc<FutureCell>, completed: &Arc<FutureCell>) {
    if !dependent.variant.propagate(dependent, completed) {
        complete_from(dependent, completed);
    }
}

/// Chains `dependent` onto `parent`: it receives exactly one propagation
/// once `parent` settles, or immediately if it already has.
pub(crate) fn chain(parent: &Arc<FutureCell>, dependent: &Arc<FutureCell>) {
    {
        let mut state = parent.state.lock();
        if state.outcome.is_none() {
            state.chained.push(ChainedNode {
                target: Arc::downgrade(dependent),
                key: dependent.key(),
                awaiting: true,
            });
            return;
        }
    }
    propagate(dependent, parent);
}

/// Removes the dependent identified by `key` from `parent`'s chained list.
///
/// If it was still awaiting and no other awaiting dependents remain, the
/// variant's discard hook runs, possibly cancelling in-flight work.
pub(crate) fn discard(parent: &FutureCell, key: usize) {
    let mut matched = false;
    let mut has_awaiting = false;
    {
        let mut state = parent.state.lock();
        state.chained.retain(|node| {
            if node.key == key {
                if node.awaiting {
                    matched = true;
                }
                false
            } else {
                has_awaiting |= node.awaiting;
                true
            }
        });
    }
    if matched && !has_awaiting {
        parent.variant.discard(parent);
    }
}

impl Drop for FutureCell {
    fn drop(&mut self) {
        match &self.variant {
            Variant::Block(state) => block::finalize(state, self.key()),
            Variant::Timeout(state) => state.finalize(),
            Variant::Watch(state) => state.finalize(),
            Variant::Fiber(state) => crate::fiber::finalize(state),
            _ => {}
        }
    }
}

/// A handle to a deferred value.
///
/// Handles are cheap clones of the same underlying cell. When the last
/// handle to an unsettled dependent goes away, the dependent is discarded
/// from its parent, which may propagate cancellation to in-flight work.
#[derive(Clone)]
pub struct Future {
    pub(crate) cell: Arc<FutureCell>,
}

impl Future {
    pub(crate) fn from_cell(cell: Arc<FutureCell>) -> Future {
        Future { cell }
    }

    /// A future resolved with `value` from construction.
    pub fn resolved(value: impl Into<Value>) -> Future {
        Future::from_cell(FutureCell::new_settled(Variant::Static, Ok(value.into())))
    }

    /// A future rejected with `error` from construction.
    pub fn rejected(error: Error) -> Future {
        Future::from_cell(FutureCell::new_settled(Variant::Static, Err(error)))
    }

    /// A future rejected with an [`Error::Io`] derived from `errno`.
    pub fn for_errno(errno: i32) -> Future {
        Future::rejected(Error::from_errno(errno))
    }

    /// A future that never settles.
    pub fn infinite() -> Future {
        Future::from_cell(FutureCell::new(Variant::Infinite))
    }

    pub fn status(&self) -> Status {
        self.cell.status()
    }

    pub fn is_pending(&self) -> bool {
        self.status() == Status::Pending
    }

    pub fn is_resolved(&self) -> bool {
        self.status() == Status::Resolved
    }

    pub fn is_rejected(&self) -> bool {
        self.status() == Status::Rejected
    }

    /// The settled value or error; `Err(Pending)` before settlement.
    pub fn result(&self) -> Result<Value> {
        self.cell.result()
    }

    /// Calls `callback` with the resolved value once `self` resolves.
    /// A rejection bypasses the callback and propagates verbatim.
    pub fn then<F>(self, callback: F) -> Future
    where
        F: FnMut(Outcome) -> Option<Future> + Send + 'static,
    {
        block::new(self, BlockKind::THEN, callback)
    }

    /// Calls `callback` with the error once `self` rejects.
    pub fn catch<F>(self, callback: F) -> Future
    where
        F: FnMut(Outcome) -> Option<Future> + Send + 'static,
    {
        block::new(self, BlockKind::CATCH, callback)
    }

    /// Calls `callback` once `self` settles either way.
    pub fn finally<F>(self, callback: F) -> Future
    where
        F: FnMut(Outcome) -> Option<Future> + Send + 'static,
    {
        block::new(self, BlockKind::FINALLY, callback)
    }

    /// Like [`Future::then`], re-invoking `callback` each time the future it
    /// returned resolves, allowing unbounded processing loops.
    pub fn then_loop<F>(self, callback: F) -> Future
    where
        F: FnMut(Outcome) -> Option<Future> + Send + 'static,
    {
        block::new(self, BlockKind::THEN.looped(), callback)
    }

    /// Like [`Future::catch`], re-invoking `callback` on repeated rejections.
    pub fn catch_loop<F>(self, callback: F) -> Future
    where
        F: FnMut(Outcome) -> Option<Future> + Send + 'static,
    {
        block::new(self, BlockKind::CATCH.looped(), callback)
    }

    /// Like [`Future::finally`], re-invoking `callback` on every settlement.
    pub fn finally_loop<F>(self, callback: F) -> Future
    where
        F: FnMut(Outcome) -> Option<Future> + Send + 'static,
    {
        block::new(self, BlockKind::FINALLY.looped(), callback)
    }

    /// Resolves with `true` once every child resolves; rejects with
    /// [`Error::TooManyFailures`] once all children have settled if any
    /// rejected.
    pub fn all(futures: impl IntoIterator<Item = Future>) -> Future {
        set::new(futures, SetPolicy::all())
    }

    /// Mirrors the first child that resolves; rejects with
    /// [`Error::TooManyFailures`] only when no child can resolve anymore.
    pub fn any(futures: impl IntoIterator<Item = Future>) -> Future {
        set::new(futures, SetPolicy::any())
    }

    /// Resolves with `true` when every child resolves, or mirrors the first
    /// rejection immediately.
    pub fn all_race(futures: impl IntoIterator<Item = Future>) -> Future {
        set::new(futures, SetPolicy::all_race())
    }

    /// Mirrors the first child to settle, either way.
    pub fn first(futures: impl IntoIterator<Item = Future>) -> Future {
        set::new(futures, SetPolicy::first())
    }

    /// Keeps `self` alive until it settles even with no observer attached.
    pub fn disown(self) {
        let holder: Arc<Mutex<Option<Future>>> = Arc::new(Mutex::new(None));
        let holder_in_cb = Arc::clone(&holder);
        let kept = self.finally(move |_| {
            holder_in_cb.lock().take();
            None
        });
        let settled = !kept.is_pending();
        *holder.lock() = Some(kept);
        if settled {
            holder.lock().take();
        }
    }

    /// Suspends the calling fiber until `self` settles and returns the
    /// outcome. Must be called from a fiber.
    pub fn await_value(self) -> Result<Value> {
        crate::fiber::await_future(&self)
    }

    fn await_checked(self, expected: &'static str) -> Result<Value> {
        let value = self.await_value()?;
        if value.type_name() != expected {
            return Err(Error::TypeMismatch {
                expected,
                found: value.type_name(),
            });
        }
        Ok(value)
    }

    pub fn await_boolean(self) -> Result<bool> {
        Ok(self.await_checked("bool")?.as_bool().unwrap_or_default())
    }

    pub fn await_int(self) -> Result<i32> {
        Ok(self.await_checked("int")?.as_int().unwrap_or_default())
    }

    pub fn await_uint(self) -> Result<u32> {
        Ok(self.await_checked("uint")?.as_uint().unwrap_or_default())
    }

    pub fn await_int64(self) -> Result<i64> {
        Ok(self.await_checked("int64")?.as_int64().unwrap_or_default())
    }

    pub fn await_uint64(self) -> Result<u64> {
        Ok(self.await_checked("uint64")?.as_uint64().unwrap_or_default())
    }

    pub fn await_float(self) -> Result<f32> {
        Ok(self.await_checked("float")?.as_float().unwrap_or_default())
    }

    pub fn await_double(self) -> Result<f64> {
        Ok(self.await_checked("double")?.as_double().unwrap_or_default())
    }

    pub fn await_string(self) -> Result<String> {
        Ok(self
            .await_checked("string")?
            .as_str()
            .unwrap_or_default()
            .to_owned())
    }

    pub fn await_fd(self) -> Result<std::os::fd::OwnedFd> {
        let value = self.await_checked("fd")?;
        let fd = value.as_fd().and_then(|fd| fd.steal());
        fd.ok_or(Error::TypeNotSupported("fd already taken"))
    }

    pub fn await_boxed<T: std::any::Any + Send + Sync>(self) -> Result<Arc<T>> {
        let value = self.await_checked("boxed")?;
        value
            .downcast::<T>()
            .ok_or(Error::TypeNotSupported("boxed payload of a different type"))
    }

    /// Downgrades to a weak handle.
    pub fn downgrade(&self) -> WeakFuture {
        WeakFuture {
            target: Mutex::new(Arc::downgrade(&self.cell)),
        }
    }

}

impl std::fmt::Debug for Future {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Future")
            .field("status", &self.status())
            .finish()
    }
}

/// A weak handle to a future.
///
/// `get` promotes to a full handle iff the future is still alive; the
/// promotion is race-free against a concurrent release of the last full
/// handle (one of the two loses, and finalization runs exactly once).
pub struct WeakFuture {
    target: Mutex<Weak<FutureCell>>,
}

impl Default for WeakFuture {
    fn default() -> Self {
        WeakFuture::empty()
    }
}

impl WeakFuture {
    /// A weak handle pointing at nothing.
    pub fn empty() -> WeakFuture {
        WeakFuture {
            target: Mutex::new(Weak::new()),
        }
    }

    pub fn new(future: &Future) -> WeakFuture {
        future.downgrade()
    }

    /// Attempts to promote to a full handle.
    pub fn get(&self) -> Option<Future> {
        self.target.lock().upgrade().map(Future::from_cell)
    }

    /// Retargets the weak handle.
    pub fn set(&self, future: Option<&Future>) {
        *self.target.lock() = match future {
            Some(f) => Arc::downgrade(&f.cell),
            None => Weak::new(),
        };
    }

    /// Drops the target, equivalent to `set(None)`.
    pub fn clear(&self) {
        self.set(None);
    }
}

/// Convenience alias used by block callbacks and fiber entry points.
pub(crate) fn kind_matches(kind: BlockKind, status: Status) -> bool {
    match status {
        Status::Resolved => kind.then(),
        Status::Rejected => kind.catch(),
        Status::Pending => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_futures_are_settled() {
        let f = Future::resolved(42i32);
        assert_eq!(f.status(), Status::Resolved);
        assert_eq!(f.result().unwrap().as_int(), Some(42));

        let f = Future::rejected(Error::Cancelled);
        assert_eq!(f.status(), Status::Rejected);
        assert_eq!(f.result().unwrap_err(), Error::Cancelled);
    }

    #[test]
    fn pending_result_reports_pending() {
        let p = Promise::new();
        assert_eq!(p.future().result().unwrap_err(), Error::Pending);
    }

    #[test]
    fn chain_propagates_exactly_once() {
        let parent = Promise::new();
        let child = FutureCell::new(Variant::Cancellable);
        chain(&parent.future().cell, &child);
        assert_eq!(child.status(), Status::Pending);

        parent.resolve_int(7);
        assert_eq!(child.status(), Status::Resolved);
        assert_eq!(child.result().unwrap().as_int(), Some(7));

        // A second completion of the parent is impossible, but completing
        // the child again must be a no-op.
        complete(&child, Err(Error::Cancelled));
        assert_eq!(child.result().unwrap().as_int(), Some(7));
    }

    #[test]
    fn chain_to_settled_parent_propagates_immediately() {
        let parent = Future::resolved(true);
        let child = FutureCell::new(Variant::Cancellable);
        chain(&parent.cell, &child);
        assert_eq!(child.status(), Status::Resolved);
    }

    #[test]
    fn propagation_order_is_reverse_attachment() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let parent = Promise::new();
        let mut tails = Vec::new();
        for tag in ["a", "b", "c"] {
            let order = Arc::clone(&order);
            tails.push(parent.future().finally(move |_| {
                order.lock().push(tag);
                None
            }));
        }
        parent.resolve_bool(true);
        assert_eq!(*order.lock(), vec!["c", "b", "a"]);
    }

    #[test]
    fn released_dependent_is_skipped() {
        let parent = Promise::new();
        let child = parent.future().finally(|_| None);
        drop(child);
        // Completing must not crash and must not observe the dead node.
        parent.resolve_bool(true);
        assert!(parent.future().is_resolved());
    }

    #[test]
    fn weak_future_promotes_while_alive() {
        let f = Future::resolved(1i32);
        let weak = f.downgrade();
        assert!(weak.get().is_some());
        drop(f);
        assert!(weak.get().is_none());
        weak.clear();
        assert!(weak.get().is_none());
    }

    #[test]
    fn disown_settled_future_does_not_leak() {
        let f = Future::resolved(1i32);
        let weak = f.downgrade();
        f.disown();
        assert!(weak.get().is_none());
    }
}
