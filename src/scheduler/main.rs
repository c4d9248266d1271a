//! Single-threaded scheduler integrated with the host loop.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{SchedulerImpl, WorkItem};
use crate::aio::AioContext;
use crate::fiber::FiberScheduler;
use crate::future::Future;
use crate::mainloop::{Dispatch, MainContext, Prepare, Source, PRIORITY_HIGH};
use crate::{Result, Scheduler, Value};

/// A cooperative scheduler draining a FIFO of work items inside a loop
/// iteration, at a priority high enough to preempt ordinary sources.
#[derive(Clone)]
pub struct MainScheduler {
    inner: Arc<MainSchedulerInner>,
}

struct MainSchedulerInner {
    context: MainContext,
    queue: Mutex<MainQueue>,
    aio: Option<AioContext>,
    fibers: FiberScheduler,
}

#[derive(Default)]
struct MainQueue {
    items: VecDeque<WorkItem>,
    running: bool,
}

struct MainSchedulerSource {
    inner: Weak<MainSchedulerInner>,
}

impl Source for MainSchedulerSource {
    fn prepare(&self) -> Prepare {
        match self.inner.upgrade() {
            Some(inner) if !inner.queue.lock().items.is_empty() => Prepare::ready(),
            _ => Prepare::wait(),
        }
    }

    fn dispatch(&self) -> Dispatch {
        let inner = match self.inner.upgrade() {
            Some(inner) => inner,
            None => return Dispatch::Remove,
        };

        let items = {
            let mut queue = inner.queue.lock();
            queue.running = true;
            std::mem::take(&mut queue.items)
        };

        for item in items {
            item.invoke();
        }

        inner.queue.lock().running = false;
        Dispatch::Continue
    }
}

impl SchedulerImpl for MainSchedulerInner {
    fn push(&self, item: WorkItem) {
        let wakeup = {
            let mut queue = self.queue.lock();
            queue.items.push_back(item);
            !queue.running
        };
        if wakeup {
            self.context.wakeup();
        }
    }

    fn spawn(&self, fiber: Future) {
        self.fibers.register(fiber);
    }

    fn main_context(&self) -> MainContext {
        self.context.clone()
    }

    fn aio_context(&self) -> Option<AioContext> {
        self.aio.clone()
    }
}

impl MainScheduler {
    /// Creates a scheduler on a fresh loop context and registers it as the
    /// calling thread's default scheduler if the slot is free.
    pub fn new() -> MainScheduler {
        MainScheduler::with_context(MainContext::new())
    }

    /// Creates a scheduler wired into an existing loop context.
    pub fn with_context(context: MainContext) -> MainScheduler {
        let fibers = FiberScheduler::new();
        fibers.attach_to(&context);
        let aio = AioContext::create(&context);

        let inner = Arc::new(MainSchedulerInner {
            context: context.clone(),
            queue: Mutex::new(MainQueue::default()),
            aio,
            fibers,
        });

        context.attach(
            PRIORITY_HIGH,
            Box::new(MainSchedulerSource {
                inner: Arc::downgrade(&inner),
            }),
        );

        let scheduler = MainScheduler { inner };
        super::adopt_thread_default(&scheduler.scheduler());
        super::with_storage(|storage| {
            if storage.aio.is_none() {
                storage.aio = scheduler.inner.aio.clone();
            }
        });
        scheduler
    }

    /// A generic handle to this scheduler.
    pub fn scheduler(&self) -> Scheduler {
        Scheduler {
            inner: self.inner.clone() as Arc<dyn SchedulerImpl>,
        }
    }

    pub fn context(&self) -> MainContext {
        self.inner.context.clone()
    }

    /// Iterates this scheduler's loop until `future` settles and returns
    /// its outcome. Must be called on the thread owning the scheduler.
    pub fn run_until_settled(&self, future: &Future) -> Result<Value> {
        let context = self.inner.context.clone();
        // Wake the loop even when the settlement arrives from another
        // thread with no chained work of its own.
        let waker = future.clone().finally(move |_| {
            context.wakeup();
            None
        });
        while waker.is_pending() {
            self.inner.context.iteration(true);
        }
        future.result()
    }
}

impl Default for MainScheduler {
    fn default() -> Self {
        MainScheduler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn push_runs_in_fifo_order() {
        let scheduler = MainScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = Arc::clone(&order);
            scheduler.scheduler().push(move || order.lock().push(i));
        }
        scheduler.context().iteration(false);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn items_pushed_during_dispatch_run_next_iteration() {
        let scheduler = MainScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.scheduler();
        let hits2 = Arc::clone(&hits);
        let handle2 = handle.clone();
        handle.push(move || {
            let hits3 = Arc::clone(&hits2);
            handle2.push(move || {
                hits3.fetch_add(1, Ordering::SeqCst);
            });
        });
        scheduler.context().iteration(false);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        scheduler.context().iteration(false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cross_thread_push_wakes_the_loop() {
        let scheduler = MainScheduler::new();
        let handle = scheduler.scheduler();
        let flag = Arc::new(AtomicUsize::new(0));
        let flag2 = Arc::clone(&flag);
        let t = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            handle.push(move || {
                flag2.fetch_add(1, Ordering::SeqCst);
            });
        });
        let start = std::time::Instant::now();
        while flag.load(Ordering::SeqCst) == 0 {
            scheduler.context().iteration(true);
            assert!(start.elapsed() < std::time::Duration::from_secs(5));
        }
        t.join().unwrap();
    }
}
