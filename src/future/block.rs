//! Callback blocks: `then`, `catch`, `finally` and their loop variants.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{chain, complete_from, discard, kind_matches, Future, FutureCell, Outcome, Variant};
use crate::scheduler::Scheduler;

/// Which settlements of the parent invoke the callback.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlockKind {
    then: bool,
    catch: bool,
    loops: bool,
}

impl BlockKind {
    pub const THEN: BlockKind = BlockKind {
        then: true,
        catch: false,
        loops: false,
    };
    pub const CATCH: BlockKind = BlockKind {
        then: false,
        catch: true,
        loops: false,
    };
    pub const FINALLY: BlockKind = BlockKind {
        then: true,
        catch: true,
        loops: false,
    };

    /// The loop variant re-invokes the callback each time a future returned
    /// from it settles.
    pub const fn looped(mut self) -> BlockKind {
        self.loops = true;
        self
    }

    pub(crate) fn then(&self) -> bool {
        self.then
    }

    pub(crate) fn catch(&self) -> bool {
        self.catch
    }
}

type Callback = Box<dyn FnMut(Outcome) -> Option<Future> + Send>;

pub(crate) struct BlockState {
    kind: BlockKind,
    /// Scheduler the callback runs on; captured at construction.
    scheduler: Option<Scheduler>,
    inner: Mutex<BlockInner>,
}

struct BlockInner {
    /// Latched after the first matching settlement so that the secondary
    /// propagation (from a future returned by the callback) completes the
    /// block instead of re-running the callback. Loop kinds re-arm.
    handled: bool,
    /// Strong reference to whatever the block currently waits on.
    awaiting: Option<Future>,
    callback: Option<Callback>,
}

pub(crate) fn new<F>(parent: Future, kind: BlockKind, callback: F) -> Future
where
    F: FnMut(Outcome) -> Option<Future> + Send + 'static,
{
    let cell = FutureCell::new(Variant::Block(Box::new(BlockState {
        kind,
        scheduler: Scheduler::thread_default(),
        inner: Mutex::new(BlockInner {
            handled: false,
            awaiting: Some(parent.clone()),
            callback: Some(Box::new(callback)),
        }),
    })));
    chain(&parent.cell, &cell);
    Future::from_cell(cell)
}

/// Reaction to a settled parent (or to a settled callback-returned future).
pub(crate) fn propagate(
    state: &BlockState,
    cell: &Arc<FutureCell>,
    completed: &Arc<FutureCell>,
) -> bool {
    let (do_callback, awaiting) = {
        let mut inner = state.inner.lock();
        let do_callback = if !inner.handled {
            inner.handled = true;
            true
        } else {
            state.kind.loops
        };
        (do_callback, inner.awaiting.take())
    };
    drop(awaiting);

    if !(do_callback && kind_matches(state.kind, completed.status())) {
        return false;
    }

    match &state.scheduler {
        Some(scheduler) if !scheduler.is_thread_default() => {
            // Run the callback over on the block's scheduler; completion of
            // the block happens from there.
            let cell = Arc::clone(cell);
            let completed = Arc::clone(completed);
            scheduler.push_work(crate::scheduler::WorkItem::new(move || {
                let state = match &cell.variant {
                    Variant::Block(state) => state,
                    _ => unreachable!("block work item on a non-block future"),
                };
                if !run_callback(state, &cell, &completed) {
                    complete_from(&cell, &completed);
                }
            }));
            true
        }
        _ => run_callback(state, cell, completed),
    }
}

/// Runs the user callback; returns whether the settlement was handled
/// (i.e. the block chained itself to a new future).
fn run_callback(state: &BlockState, cell: &Arc<FutureCell>, completed: &Arc<FutureCell>) -> bool {
    let callback = state.inner.lock().callback.take();
    let mut callback = match callback {
        Some(cb) => cb,
        // Another settlement is mid-callback; treat as handled.
        None => return true,
    };

    let next = callback(completed.result());
    state.inner.lock().callback = Some(callback);

    match next {
        Some(next) => {
            state.inner.lock().awaiting = Some(next.clone());
            chain(&next.cell, cell);
            true
        }
        None => false,
    }
}

/// Runs when the block cell is dropped: a still-pending block withdraws
/// from its parent, which may cascade a cancellation.
pub(crate) fn finalize(state: &BlockState, key: usize) {
    let awaiting = state.inner.lock().awaiting.take();
    if let Some(parent) = awaiting {
        discard(&parent.cell, key);
    }
}
