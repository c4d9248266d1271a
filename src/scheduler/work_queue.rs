//! Global work queue shared by the thread-pool workers.
//!
//! Pushes post a semaphore; each worker runs a loop future chained on
//! semaphore waits, so a single post wakes a single worker rather than
//! the whole pool.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::WorkItem;
use crate::future::Future;
use crate::semaphore::Semaphore;

pub(crate) struct WorkQueue {
    items: Mutex<VecDeque<WorkItem>>,
    semaphore: Semaphore,
}

impl WorkQueue {
    pub(crate) fn new() -> Arc<WorkQueue> {
        Arc::new(WorkQueue {
            items: Mutex::new(VecDeque::new()),
            semaphore: Semaphore::new(),
        })
    }

    pub(crate) fn push(&self, item: WorkItem) {
        self.items.lock().push_back(item);
        self.semaphore.post(1);
    }

    pub(crate) fn try_pop(&self) -> Option<WorkItem> {
        self.items.lock().pop_front()
    }

    /// Returns a future that drains the queue for as long as it is held:
    /// each semaphore grant pops and invokes at most one item. Dropping the
    /// future withdraws the pending wait.
    pub(crate) fn run(self: &Arc<WorkQueue>) -> Future {
        let queue = Arc::clone(self);
        self.semaphore.wait().then_loop(move |_| {
            if let Some(item) = queue.try_pop() {
                item.invoke();
            }
            Some(queue.semaphore.wait())
        })
    }
}
