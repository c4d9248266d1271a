//! Stackful cooperative fibers.
//!
//! A fiber is a future that resolves with its entry function's result. It
//! runs on a private stack owned by the fiber scheduler that registered it
//! and may [`await`](crate::future::Future::await_value) other futures: the
//! fiber chains itself onto the awaited future, parks on the waiting list
//! and switches back to the scheduler; settlement re-queues it on the same
//! scheduler, on the same OS thread. Fibers never migrate.

mod context;
pub(crate) mod stack;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};

use crate::future::{chain, complete, Future, FutureCell, Variant};
use crate::mainloop::{Dispatch, MainContext, Prepare, Source, SourceHandle, PRIORITY_DEFAULT};
use crate::{Error, Result, Value};

use context::FiberContext;
use stack::{Stack, StackPool};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum FiberStatus {
    /// Created but not yet registered with a scheduler.
    New,
    /// Queued (or about to be queued) for execution.
    Ready,
    /// Parked until an awaited future settles.
    Waiting,
    /// Entry function returned; the stack can be recycled.
    Exited,
}

type Entry = Box<dyn FnOnce() -> Option<Future> + Send>;

pub(crate) struct FiberState {
    inner: Mutex<FiberInner>,
}

struct FiberInner {
    status: FiberStatus,
    /// Currently executing on its own stack (between swap-in and swap-out).
    active: bool,
    scheduler: Weak<FiberSchedulerShared>,
    entry: Option<Entry>,
    context: Option<FiberContext>,
    stack: Option<Stack>,
    stack_size: usize,
}

/// Creates the fiber future; it starts running once a scheduler registers it.
pub(crate) fn new_fiber<F>(stack_size: usize, entry: F) -> Future
where
    F: FnOnce() -> Option<Future> + Send + 'static,
{
    Future::from_cell(FutureCell::new(Variant::Fiber(Box::new(FiberState {
        inner: Mutex::new(FiberInner {
            status: FiberStatus::New,
            active: false,
            scheduler: Weak::new(),
            entry: Some(Box::new(entry)),
            context: None,
            stack: None,
            stack_size,
        }),
    }))))
}

fn fiber_state(cell: &FutureCell) -> &FiberState {
    match &cell.variant {
        Variant::Fiber(state) => state,
        _ => unreachable!("fiber operation on a non-fiber future"),
    }
}

/// Reaction to a settled future the fiber chained itself onto.
///
/// While the fiber is alive this re-queues it; after exit the chained
/// future is the one returned from the entry function, and the fiber future
/// completes from it (by returning unhandled).
pub(crate) fn propagate(state: &FiberState, cell: &Arc<FutureCell>) -> bool {
    let scheduler = {
        let inner = state.inner.lock();
        if inner.status == FiberStatus::Exited {
            return false;
        }
        inner.scheduler.upgrade()
    };
    if let Some(scheduler) = scheduler {
        scheduler.make_ready(cell);
    }
    true
}

/// Runs when the fiber cell drops: recycle the stack if one is attached.
pub(crate) fn finalize(state: &FiberState) {
    let mut inner = state.inner.lock();
    debug_assert!(!inner.active, "fiber dropped while executing");
    if let Some(stack) = inner.stack.take() {
        if let Some(scheduler) = inner.scheduler.upgrade() {
            scheduler.pool.lock().release(stack);
        }
    }
}

thread_local! {
    /// The fiber executing on this thread, if any.
    static CURRENT_FIBER: RefCell<Option<Arc<FutureCell>>> = const { RefCell::new(None) };
    /// Where a yielding fiber switches back to.
    static CALLER_UCP: Cell<*mut libc::ucontext_t> = const { Cell::new(std::ptr::null_mut()) };
}

/// Suspends the calling fiber until `future` settles.
pub(crate) fn await_future(future: &Future) -> Result<Value> {
    loop {
        if let Some(outcome) = future.cell.try_result() {
            return outcome;
        }

        let current = CURRENT_FIBER
            .with(|current| current.borrow().clone())
            .expect("await_* may only be called from a fiber");

        {
            let state = fiber_state(&current);
            state.inner.lock().status = FiberStatus::Waiting;
        }
        chain(&future.cell, &current);

        yield_current(&current);
    }
}

/// Switches from the running fiber back to its scheduler.
fn yield_current(cell: &Arc<FutureCell>) {
    let fiber_ucp = {
        let state = fiber_state(cell);
        let inner = state.inner.lock();
        inner
            .context
            .as_ref()
            .expect("yield from an uninitialized fiber")
            .ucp()
    };
    let caller = CALLER_UCP.with(|caller| caller.get());
    debug_assert!(!caller.is_null());
    unsafe { context::switch(fiber_ucp, caller) };
}

extern "C" fn fiber_trampoline(hi: u32, lo: u32) {
    let cell_ptr = context::join_args(hi, lo) as *const FutureCell;
    // The scheduler's ready reference keeps the cell alive while we run.
    let cell = unsafe { ManuallyDropArc::from_ptr(cell_ptr) };

    let entry = {
        let state = fiber_state(&cell);
        state.inner.lock().entry.take()
    };

    let result = match entry {
        Some(entry) => {
            // Unwinding across a context switch is undefined; a panicking
            // fiber takes the process down.
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry)) {
                Ok(result) => result,
                Err(_) => {
                    eprintln!("fiber entry panicked; aborting");
                    std::process::abort();
                }
            }
        }
        None => None,
    };

    {
        let state = fiber_state(&cell);
        state.inner.lock().status = FiberStatus::Exited;
    }

    match result {
        // The fiber future settles from the returned future, now or when
        // it completes.
        Some(returned) => chain(&returned.cell, &cell),
        None => complete(&cell, Err(Error::RoutineCompleted)),
    }

    drop(cell);
    // Back to the scheduler for good; this frame is never resumed.
    let caller = CALLER_UCP.with(|caller| caller.get());
    let mut dead: libc::ucontext_t = unsafe { std::mem::zeroed() };
    unsafe { context::switch(&mut dead, caller) };
    unreachable!("exited fiber resumed");
}

/// A borrowed `Arc` reconstructed from a raw pointer without taking a
/// reference count; dropping it does not decrement.
struct ManuallyDropArc(std::mem::ManuallyDrop<Arc<FutureCell>>);

impl ManuallyDropArc {
    unsafe fn from_ptr(ptr: *const FutureCell) -> ManuallyDropArc {
        ManuallyDropArc(std::mem::ManuallyDrop::new(Arc::from_raw(ptr)))
    }
}

impl std::ops::Deref for ManuallyDropArc {
    type Target = Arc<FutureCell>;

    fn deref(&self) -> &Arc<FutureCell> {
        &self.0
    }
}

/// Per-scheduler fiber dispatcher, itself a loop source.
#[derive(Clone)]
pub(crate) struct FiberScheduler {
    shared: Arc<FiberSchedulerShared>,
}

pub(crate) struct FiberSchedulerShared {
    queues: Mutex<FiberQueues>,
    /// Held across fiber execution so that recursive loop iteration from
    /// inside a fiber re-enters safely on the same thread.
    rec: ReentrantMutex<()>,
    context: Mutex<Option<MainContext>>,
    pool: Mutex<StackPool>,
    caller: FiberContext,
    handle: Mutex<Option<SourceHandle>>,
}

#[derive(Default)]
struct FiberQueues {
    ready: VecDeque<Arc<FutureCell>>,
    waiting: Vec<Arc<FutureCell>>,
    /// Set while the dispatcher is switching fibers. A loop iteration run
    /// recursively from inside a fiber must not re-enter the dispatcher:
    /// the saved caller context is single-use.
    running: bool,
}

impl FiberScheduler {
    pub(crate) fn new() -> FiberScheduler {
        FiberScheduler {
            shared: Arc::new(FiberSchedulerShared {
                queues: Mutex::new(FiberQueues::default()),
                rec: ReentrantMutex::new(()),
                context: Mutex::new(None),
                pool: Mutex::new(StackPool::with_defaults()),
                caller: FiberContext::empty(),
                handle: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn attach_to(&self, context: &MainContext) {
        *self.shared.context.lock() = Some(context.clone());
        let handle = context.attach(
            PRIORITY_DEFAULT,
            Box::new(FiberSource {
                shared: Arc::downgrade(&self.shared),
            }),
        );
        *self.shared.handle.lock() = Some(handle);
    }

    /// Registers a fiber future with this scheduler and queues it to run.
    /// A fiber, once registered, never moves to another scheduler.
    pub(crate) fn register(&self, fiber: Future) {
        {
            let state = fiber_state(&fiber.cell);
            let mut inner = state.inner.lock();
            assert!(
                inner.status == FiberStatus::New,
                "fiber already registered with a scheduler"
            );
            inner.scheduler = Arc::downgrade(&self.shared);

            let stack = self.shared.pool.lock().acquire(inner.stack_size);
            let ctx = FiberContext::empty();
            ctx.init(
                &stack,
                fiber_trampoline,
                Arc::as_ptr(&fiber.cell) as usize,
            );
            inner.stack = Some(stack);
            inner.context = Some(ctx);
            inner.status = FiberStatus::Ready;
        }

        self.shared.queues.lock().ready.push_back(fiber.cell.clone());
        self.shared.wakeup();
    }
}

impl FiberSchedulerShared {
    fn wakeup(&self) {
        if let Some(context) = self.context.lock().as_ref() {
            context.wakeup();
        }
    }

    /// Marks a fiber runnable again. Lock order: queues, then fiber inner.
    fn make_ready(&self, cell: &Arc<FutureCell>) {
        {
            let mut queues = self.queues.lock();
            let state = fiber_state(cell);
            let mut inner = state.inner.lock();
            let was = inner.status;
            inner.status = FiberStatus::Ready;
            if was == FiberStatus::Waiting && !inner.active {
                queues.waiting.retain(|f| !Arc::ptr_eq(f, cell));
                queues.ready.push_back(Arc::clone(cell));
            }
            // An active fiber racing through an await is re-queued by the
            // dispatcher once it switches out.
        }
        self.wakeup();
    }

    fn dispatch_fibers(&self) {
        let _guard = self.rec.lock();

        {
            let mut queues = self.queues.lock();
            if queues.running {
                return;
            }
            queues.running = true;
        }

        loop {
            let fiber = match self.queues.lock().ready.pop_front() {
                Some(fiber) => fiber,
                None => break,
            };

            let fiber_ucp = {
                let state = fiber_state(&fiber);
                let mut inner = state.inner.lock();
                inner.active = true;
                inner
                    .context
                    .as_ref()
                    .expect("registered fiber lacks a context")
                    .ucp()
            };

            let previous_fiber =
                CURRENT_FIBER.with(|current| current.replace(Some(Arc::clone(&fiber))));
            let previous_caller = CALLER_UCP.with(|caller| caller.replace(self.caller.ucp()));

            unsafe { context::switch(self.caller.ucp(), fiber_ucp) };

            CURRENT_FIBER.with(|current| *current.borrow_mut() = previous_fiber);
            CALLER_UCP.with(|caller| caller.set(previous_caller));

            let released = {
                let mut queues = self.queues.lock();
                let state = fiber_state(&fiber);
                let mut inner = state.inner.lock();
                inner.active = false;
                match inner.status {
                    FiberStatus::Exited => inner.stack.take(),
                    FiberStatus::Waiting => {
                        queues.waiting.push(Arc::clone(&fiber));
                        None
                    }
                    FiberStatus::Ready => {
                        queues.ready.push_back(Arc::clone(&fiber));
                        None
                    }
                    FiberStatus::New => unreachable!("dispatched an unregistered fiber"),
                }
            };
            if let Some(stack) = released {
                self.pool.lock().release(stack);
            }
        }

        self.queues.lock().running = false;
    }
}

struct FiberSource {
    shared: Weak<FiberSchedulerShared>,
}

impl Source for FiberSource {
    fn prepare(&self) -> Prepare {
        match self.shared.upgrade() {
            Some(shared) => {
                let queues = shared.queues.lock();
                if !queues.running && !queues.ready.is_empty() {
                    Prepare::ready()
                } else {
                    Prepare::wait()
                }
            }
            _ => Prepare::wait(),
        }
    }

    fn dispatch(&self) -> Dispatch {
        match self.shared.upgrade() {
            Some(shared) => {
                shared.dispatch_fibers();
                Dispatch::Continue
            }
            None => Dispatch::Remove,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::Promise;
    use crate::mainloop::MainContext;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fixture() -> (MainContext, FiberScheduler) {
        let context = MainContext::new();
        let fibers = FiberScheduler::new();
        fibers.attach_to(&context);
        (context, fibers)
    }

    #[test]
    fn fiber_resolves_with_returned_future() {
        let (context, fibers) = fixture();
        let fiber = new_fiber(0, || Some(Future::resolved(42i32)));
        fibers.register(fiber.clone());

        while fiber.is_pending() {
            context.iteration(true);
        }
        assert_eq!(fiber.result().unwrap().as_int(), Some(42));
    }

    #[test]
    fn fiber_without_result_rejects() {
        let (context, fibers) = fixture();
        let fiber = new_fiber(0, || None);
        fibers.register(fiber.clone());

        while fiber.is_pending() {
            context.iteration(true);
        }
        assert_eq!(fiber.result().unwrap_err(), Error::RoutineCompleted);
    }

    #[test]
    fn fiber_awaits_settled_future_without_suspending() {
        let (context, fibers) = fixture();
        let fiber = new_fiber(0, || {
            let value = Future::resolved(5i32).await_int().unwrap();
            Some(Future::resolved(value * 2))
        });
        fibers.register(fiber.clone());

        context.iteration(false);
        // A fiber that never awaits a pending future completes within one
        // dispatch of its scheduler.
        assert_eq!(fiber.result().unwrap().as_int(), Some(10));
    }

    #[test]
    fn fiber_suspends_until_future_settles() {
        let (context, fibers) = fixture();
        let promise = Promise::new();
        let observed = Arc::new(AtomicUsize::new(0));

        let fut = promise.future();
        let observed2 = Arc::clone(&observed);
        let fiber = new_fiber(0, move || {
            let value = fut.await_int().unwrap();
            observed2.store(value as usize, Ordering::SeqCst);
            Some(Future::resolved(true))
        });
        fibers.register(fiber.clone());

        context.iteration(false);
        assert!(fiber.is_pending());
        assert_eq!(observed.load(Ordering::SeqCst), 0);

        promise.resolve_int(7);
        while fiber.is_pending() {
            context.iteration(true);
        }
        assert_eq!(observed.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn fibers_interleave_cooperatively() {
        let (context, fibers) = fixture();
        let ping = Promise::new();
        let pong = Promise::new();

        let ping_fut = ping.future();
        let first = new_fiber(0, move || {
            let v = ping_fut.await_int().unwrap();
            Some(Future::resolved(v + 1))
        });
        let pong_fut = pong.future();
        let second = new_fiber(0, move || {
            let v = pong_fut.await_int().unwrap();
            Some(Future::resolved(v + 2))
        });
        fibers.register(first.clone());
        fibers.register(second.clone());

        context.iteration(false);
        assert!(first.is_pending() && second.is_pending());

        pong.resolve_int(10);
        while second.is_pending() {
            context.iteration(true);
        }
        assert_eq!(second.result().unwrap().as_int(), Some(12));
        assert!(first.is_pending());

        ping.resolve_int(1);
        while first.is_pending() {
            context.iteration(true);
        }
        assert_eq!(first.result().unwrap().as_int(), Some(2));
    }

    #[test]
    fn stacks_are_recycled_between_fibers() {
        let (context, fibers) = fixture();
        for round in 0..32 {
            let fiber = new_fiber(0, move || Some(Future::resolved(round as i32)));
            fibers.register(fiber.clone());
            while fiber.is_pending() {
                context.iteration(true);
            }
        }
    }
}
