//! Executors for work items and fibers.
//!
//! Every scheduler runs work items and fibers on one or more OS threads and
//! owns the event-loop context (and, when available, the AIO context) for
//! those threads. Futures capture the *thread-default* scheduler so that
//! callbacks and I/O primitives land back on the loop that created them.

mod main;
mod pool;
pub(crate) mod steal;
pub(crate) mod work_queue;

pub use main::MainScheduler;
pub use pool::ThreadPoolScheduler;

use std::cell::RefCell;
use std::sync::{Arc, OnceLock};

use crate::aio::AioContext;
use crate::future::Future;
use crate::mainloop::MainContext;

/// A unit of work queued on a scheduler. Work items run to completion
/// without suspending; only fibers may await.
pub(crate) struct WorkItem(Box<dyn FnOnce() + Send>);

impl WorkItem {
    pub(crate) fn new(func: impl FnOnce() + Send + 'static) -> WorkItem {
        WorkItem(Box::new(func))
    }

    pub(crate) fn invoke(self) {
        (self.0)()
    }
}

pub(crate) trait SchedulerImpl: Send + Sync {
    fn push(&self, item: WorkItem);
    fn spawn(&self, fiber: Future);
    fn main_context(&self) -> MainContext;
    fn aio_context(&self) -> Option<AioContext>;
}

/// A handle to an executor.
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) inner: Arc<dyn SchedulerImpl>,
}

impl Scheduler {
    /// Queues a non-suspending work item.
    pub fn push(&self, func: impl FnOnce() + Send + 'static) {
        self.inner.push(WorkItem::new(func));
    }

    pub(crate) fn push_work(&self, item: WorkItem) {
        self.inner.push(item);
    }

    /// Spawns a fiber with the default stack size. The returned future
    /// settles with the fiber's result.
    pub fn spawn<F>(&self, entry: F) -> Future
    where
        F: FnOnce() -> Option<Future> + Send + 'static,
    {
        self.spawn_with_stack_size(0, entry)
    }

    /// Spawns a fiber with a specific stack size (0 picks the default).
    pub fn spawn_with_stack_size<F>(&self, stack_size: usize, entry: F) -> Future
    where
        F: FnOnce() -> Option<Future> + Send + 'static,
    {
        let fiber = crate::fiber::new_fiber(stack_size, entry);
        self.inner.spawn(fiber.clone());
        fiber
    }

    /// The event-loop context work for this scheduler dispatches on.
    pub fn main_context(&self) -> MainContext {
        self.inner.main_context()
    }

    pub(crate) fn aio_context(&self) -> Option<AioContext> {
        self.inner.aio_context()
    }

    /// The scheduler registered for the calling thread, if any.
    pub fn thread_default() -> Option<Scheduler> {
        STORAGE.with(|storage| storage.borrow().scheduler.clone())
    }

    /// The process-wide default scheduler installed by [`crate::init`].
    pub fn get_default() -> Option<Scheduler> {
        DEFAULT.get().cloned()
    }

    /// Installs the process-wide default scheduler; first caller wins.
    pub fn set_default(scheduler: Scheduler) {
        let _ = DEFAULT.set(scheduler);
    }

    /// The process-wide shared thread pool, created on first use.
    pub fn default_thread_pool() -> Scheduler {
        DEFAULT_POOL
            .get_or_init(|| ThreadPoolScheduler::new().into_scheduler())
            .clone()
    }

    pub(crate) fn is_thread_default(&self) -> bool {
        match Scheduler::thread_default() {
            // Compare allocation addresses; vtable pointers for the same
            // type may differ between codegen units.
            Some(current) => std::ptr::eq(
                Arc::as_ptr(&current.inner) as *const (),
                Arc::as_ptr(&self.inner) as *const (),
            ),
            None => false,
        }
    }
}

static DEFAULT: OnceLock<Scheduler> = OnceLock::new();
static DEFAULT_POOL: OnceLock<Scheduler> = OnceLock::new();

/// Per-thread scheduler bookkeeping, mirroring the thread-default lookup
/// that I/O primitives rely on when called without an explicit context.
pub(crate) struct ThreadStorage {
    pub(crate) scheduler: Option<Scheduler>,
    pub(crate) aio: Option<AioContext>,
    pub(crate) worker: Option<Arc<pool::WorkerInner>>,
}

thread_local! {
    static STORAGE: RefCell<ThreadStorage> = RefCell::new(ThreadStorage {
        scheduler: None,
        aio: None,
        worker: None,
    });
}

pub(crate) fn with_storage<R>(f: impl FnOnce(&mut ThreadStorage) -> R) -> R {
    STORAGE.with(|storage| f(&mut storage.borrow_mut()))
}

/// Sets the calling thread's default scheduler if none is present.
pub(crate) fn adopt_thread_default(scheduler: &Scheduler) {
    with_storage(|storage| {
        if storage.scheduler.is_none() {
            storage.scheduler = Some(scheduler.clone());
        }
    });
}

/// AIO context for the calling thread: the thread's own context when it is
/// a scheduler thread, the thread-default scheduler's otherwise, falling
/// back to the process default scheduler.
pub(crate) fn current_aio_context() -> Option<AioContext> {
    if let Some(aio) = with_storage(|storage| storage.aio.clone()) {
        return Some(aio);
    }
    if let Some(scheduler) = Scheduler::thread_default() {
        if let Some(aio) = scheduler.aio_context() {
            return Some(aio);
        }
    }
    Scheduler::get_default().and_then(|scheduler| scheduler.aio_context())
}

/// Main context for timers and watches created on the calling thread.
pub(crate) fn current_main_context() -> Option<MainContext> {
    if let Some(scheduler) = Scheduler::thread_default() {
        return Some(scheduler.main_context());
    }
    Scheduler::get_default().map(|scheduler| scheduler.main_context())
}
