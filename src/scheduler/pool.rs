//! Thread-pool scheduler: a global queue, N workers, per-worker
//! work-stealing deques and peer stealing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, warn};

use super::steal::StealQueue;
use super::work_queue::WorkQueue;
use super::{SchedulerImpl, WorkItem};
use crate::aio::AioContext;
use crate::fiber::FiberScheduler;
use crate::future::Future;
use crate::mainloop::{
    Dispatch, MainContext, MainLoop, Prepare, Source, PRIORITY_DEFAULT, PRIORITY_DEFAULT_IDLE,
    PRIORITY_URGENT,
};
use crate::Scheduler;

const MAX_WORKERS: usize = 32;
/// Work items drained from the local deque per dispatch.
const LOCAL_BATCH: usize = 32;

/// Dispatches work items and fibers onto per-thread sub-schedulers.
///
/// Work pushed from outside the pool lands on a global queue and wakes a
/// single worker; work pushed from a worker goes to that worker's deque,
/// where peers may steal it once they run dry. Fibers are pinned to the
/// worker chosen at spawn (round robin) and never migrate.
#[derive(Clone)]
pub struct ThreadPoolScheduler {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    global: Arc<WorkQueue>,
    set: Arc<WorkerSet>,
    workers: Mutex<Vec<Worker>>,
    rrobin: AtomicUsize,
}

impl ThreadPoolScheduler {
    /// Spins up `max(1, num_cpus / 2)` workers (capped at 32). A worker
    /// that fails to create its AIO context is dropped.
    pub fn new() -> ThreadPoolScheduler {
        let n_workers = (num_cpus::get() / 2).clamp(1, MAX_WORKERS);

        let global = WorkQueue::new();
        let set = Arc::new(WorkerSet {
            workers: RwLock::new(Vec::new()),
        });

        let mut workers = Vec::with_capacity(n_workers);
        for _ in 0..n_workers {
            match Worker::start(Arc::clone(&global), Arc::clone(&set)) {
                Some(worker) => workers.push(worker),
                None => {
                    warn!("thread pool worker failed to start");
                    break;
                }
            }
        }
        assert!(!workers.is_empty(), "no thread pool worker could start");
        debug!(workers = workers.len(), "thread pool ready");

        ThreadPoolScheduler {
            inner: Arc::new(PoolInner {
                global,
                set,
                workers: Mutex::new(workers),
                rrobin: AtomicUsize::new(0),
            }),
        }
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler {
            inner: self.inner.clone() as Arc<dyn SchedulerImpl>,
        }
    }

    pub(crate) fn into_scheduler(self) -> Scheduler {
        self.scheduler()
    }
}

impl Default for ThreadPoolScheduler {
    fn default() -> Self {
        ThreadPoolScheduler::new()
    }
}

impl SchedulerImpl for PoolInner {
    fn push(&self, item: WorkItem) {
        // Items created on a pooled thread stay on that worker's deque;
        // everything else funnels through the global queue.
        match super::with_storage(|storage| storage.worker.clone()) {
            Some(worker) => worker.push_local(item),
            None => self.global.push(item),
        }
    }

    fn spawn(&self, fiber: Future) {
        let workers = self.workers.lock();
        let index = self.rrobin.fetch_add(1, Ordering::Relaxed) % workers.len();
        workers[index].inner.fibers.register(fiber);
    }

    fn main_context(&self) -> MainContext {
        if let Some(worker) = super::with_storage(|storage| storage.worker.clone()) {
            return worker.context.clone();
        }
        if let Some(default) = Scheduler::get_default() {
            let default_ptr = Arc::as_ptr(&default.inner) as *const ();
            if !std::ptr::eq(default_ptr, self as *const PoolInner as *const ()) {
                return default.main_context();
            }
        }
        self.workers.lock()[0].inner.context.clone()
    }

    fn aio_context(&self) -> Option<AioContext> {
        if let Some(worker) = super::with_storage(|storage| storage.worker.clone()) {
            return worker.aio.get().cloned();
        }
        Scheduler::get_default().and_then(|default| default.aio_context())
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        for worker in self.workers.get_mut().drain(..) {
            worker.stop_and_join();
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WorkerStatus {
    Initial,
    Running,
    Stopping,
    Finished,
    Failed,
}

pub(crate) struct WorkerInner {
    context: MainContext,
    main_loop: MainLoop,
    deque: StealQueue<WorkItem>,
    fibers: FiberScheduler,
    aio: OnceLock<AioContext>,
    set: Arc<WorkerSet>,
    global: Arc<WorkQueue>,
    thread_id: OnceLock<std::thread::ThreadId>,
    status: Mutex<WorkerStatus>,
    cond: Condvar,
}

impl WorkerInner {
    fn push_local(&self, item: WorkItem) {
        let on_own_thread = self.thread_id.get() == Some(&std::thread::current().id())
            && *self.status.lock() == WorkerStatus::Running;
        if on_own_thread {
            self.deque.push(item);
        } else {
            // Completion work pushed from a foreign thread delays further
            // future processing, so it preempts everything on the target.
            self.context
                .invoke(PRIORITY_URGENT, move || item.invoke());
        }
    }

    fn set_status(&self, status: WorkerStatus) {
        *self.status.lock() = status;
        self.cond.notify_all();
    }
}

impl SchedulerImpl for WorkerInner {
    fn push(&self, item: WorkItem) {
        self.push_local(item);
    }

    fn spawn(&self, fiber: Future) {
        self.fibers.register(fiber);
    }

    fn main_context(&self) -> MainContext {
        self.context.clone()
    }

    fn aio_context(&self) -> Option<AioContext> {
        self.aio.get().cloned()
    }
}

struct Worker {
    inner: Arc<WorkerInner>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn start(global: Arc<WorkQueue>, set: Arc<WorkerSet>) -> Option<Worker> {
        let context = MainContext::new();
        let inner = Arc::new(WorkerInner {
            main_loop: MainLoop::new(context.clone()),
            context,
            deque: StealQueue::new(256),
            fibers: FiberScheduler::new(),
            aio: OnceLock::new(),
            set,
            global,
            thread_id: OnceLock::new(),
            status: Mutex::new(WorkerStatus::Initial),
            cond: Condvar::new(),
        });

        let thread_inner = Arc::clone(&inner);
        let thread = std::thread::Builder::new()
            .name("weft-pool-worker".into())
            .spawn(move || worker_main(thread_inner))
            .ok()?;

        {
            let mut status = inner.status.lock();
            while *status == WorkerStatus::Initial {
                inner.cond.wait(&mut status);
            }
            if *status == WorkerStatus::Failed {
                drop(status);
                let _ = thread.join();
                return None;
            }
        }

        Some(Worker {
            inner,
            thread: Some(thread),
        })
    }

    fn stop_and_join(mut self) {
        let inner = Arc::clone(&self.inner);
        self.inner.context.invoke(PRIORITY_URGENT, move || {
            inner.set_status(WorkerStatus::Stopping);
            inner.main_loop.quit();
            // Flush whatever is left on the local deque.
            while let Some(item) = inner.deque.pop() {
                item.invoke();
            }
        });
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn worker_main(inner: Arc<WorkerInner>) {
    let _ = inner.thread_id.set(std::thread::current().id());

    let aio = match AioContext::create(&inner.context) {
        Some(aio) => aio,
        None => {
            inner.set_status(WorkerStatus::Failed);
            return;
        }
    };
    let _ = inner.aio.set(aio.clone());

    let local_handle = inner.context.attach(
        PRIORITY_DEFAULT,
        Box::new(LocalSource {
            worker: Arc::downgrade(&inner),
        }),
    );
    // Slightly higher priority than the global-queue completions arriving
    // as idle items, but below the local deque: steal from peers before
    // pulling new global work, after exhausting our own.
    let steal_handle = inner.context.attach(
        PRIORITY_DEFAULT_IDLE - 1,
        Box::new(StealSource {
            worker: Arc::downgrade(&inner),
        }),
    );
    inner.fibers.attach_to(&inner.context);

    let scheduler = Scheduler {
        inner: Arc::clone(&inner) as Arc<dyn SchedulerImpl>,
    };
    super::with_storage(|storage| {
        storage.scheduler = Some(scheduler.clone());
        storage.aio = Some(aio);
        storage.worker = Some(Arc::clone(&inner));
    });

    inner.set.add(Arc::clone(&inner));

    // Pull from the global queue until shutdown.
    let global_loop = inner.global.run();

    inner.set_status(WorkerStatus::Running);
    debug!("worker running");

    inner.main_loop.run();

    drop(global_loop);
    while inner.context.iteration(false) {}

    inner.set.remove(&inner);
    local_handle.destroy();
    steal_handle.destroy();

    super::with_storage(|storage| {
        storage.scheduler = None;
        storage.aio = None;
        storage.worker = None;
    });
    inner.set_status(WorkerStatus::Finished);
    debug!("worker finished");
}

/// Drains the worker's own deque in bounded batches.
struct LocalSource {
    worker: Weak<WorkerInner>,
}

impl Source for LocalSource {
    fn prepare(&self) -> Prepare {
        match self.worker.upgrade() {
            Some(worker) if !worker.deque.is_empty() => Prepare::ready(),
            _ => Prepare::wait(),
        }
    }

    fn dispatch(&self) -> Dispatch {
        let worker = match self.worker.upgrade() {
            Some(worker) => worker,
            None => return Dispatch::Remove,
        };
        for _ in 0..LOCAL_BATCH {
            match worker.deque.pop() {
                Some(item) => item.invoke(),
                None => break,
            }
        }
        Dispatch::Continue
    }
}

/// Opportunistically steals one item from a peer per dispatch.
struct StealSource {
    worker: Weak<WorkerInner>,
}

impl Source for StealSource {
    fn check(&self) -> bool {
        self.worker
            .upgrade()
            .map_or(false, |worker| worker.set.peers_have_work(&worker))
    }

    fn dispatch(&self) -> Dispatch {
        match self.worker.upgrade() {
            Some(worker) => {
                worker.set.steal_for(&worker);
                Dispatch::Continue
            }
            None => Dispatch::Remove,
        }
    }
}

pub(crate) struct WorkerSet {
    workers: RwLock<Vec<Arc<WorkerInner>>>,
}

impl WorkerSet {
    fn add(&self, worker: Arc<WorkerInner>) {
        self.workers.write().push(worker);
    }

    fn remove(&self, worker: &Arc<WorkerInner>) {
        self.workers.write().retain(|w| !Arc::ptr_eq(w, worker));
    }

    /// Whether any peer of `thief` has stealable items.
    fn peers_have_work(&self, thief: &Arc<WorkerInner>) -> bool {
        self.workers
            .read()
            .iter()
            .any(|peer| !Arc::ptr_eq(peer, thief) && !peer.deque.is_empty())
    }

    /// Steals one item on behalf of `thief`, scanning peers starting at the
    /// next worker in the set and wrapping around.
    fn steal_for(&self, thief: &Arc<WorkerInner>) -> bool {
        let workers = self.workers.read();
        if workers.len() < 2 {
            return false;
        }
        let position = workers
            .iter()
            .position(|w| Arc::ptr_eq(w, thief))
            .unwrap_or(0);
        for offset in 1..workers.len() {
            let peer = &workers[(position + offset) % workers.len()];
            if Arc::ptr_eq(peer, thief) {
                continue;
            }
            if let Some(item) = peer.deque.steal() {
                item.invoke();
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_for(cond: impl Fn() -> bool) {
        let start = Instant::now();
        while !cond() {
            assert!(start.elapsed() < Duration::from_secs(10), "timed out");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn pushes_from_outside_run_on_some_worker() {
        let pool = ThreadPoolScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let hits = Arc::clone(&hits);
            pool.scheduler().push(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        wait_for(|| hits.load(Ordering::SeqCst) == 100);
    }

    #[test]
    fn worker_items_fan_out_into_local_deques() {
        let pool = ThreadPoolScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let scheduler = pool.scheduler();
        let inner_scheduler = scheduler.clone();
        let hits_outer = Arc::clone(&hits);
        scheduler.push(move || {
            // Runs on a worker: these land on its deque and may be stolen.
            for _ in 0..256 {
                let hits = Arc::clone(&hits_outer);
                inner_scheduler.push(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                });
            }
        });
        wait_for(|| hits.load(Ordering::SeqCst) == 256);
    }

    #[test]
    fn pool_shuts_down_cleanly() {
        let pool = ThreadPoolScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let hits = Arc::clone(&hits);
            pool.scheduler().push(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        wait_for(|| hits.load(Ordering::SeqCst) == 10);
        drop(pool);
    }
}
