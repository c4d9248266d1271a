//! Lock-free Chase–Lev work-stealing deque.
//!
//! Single producer: the owning worker pushes and pops at the bottom (LIFO).
//! Multiple consumers: peers steal from the top (FIFO). The owner may grow
//! the backing array; retired arrays are kept on a garbage list until the
//! deque drops because a stealer may still be reading from them.
//!
//! Orderings follow "Correct and Efficient Work-Stealing for Weak Memory
//! Models" (Lê et al., PPoPP '13).

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicI64, AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

struct Slots<T> {
    cap: i64,
    mask: i64,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

impl<T> Slots<T> {
    fn alloc(cap: i64) -> *mut Slots<T> {
        debug_assert!(cap > 0 && (cap & (cap - 1)) == 0);
        let slots = (0..cap)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::into_raw(Box::new(Slots {
            cap,
            mask: cap - 1,
            slots,
        }))
    }

    /// Stores `item` at logical index `i`. Owner only.
    unsafe fn put(&self, i: i64, item: T) {
        let slot = &self.slots[(i & self.mask) as usize];
        (*slot.get()).write(item);
    }

    /// Bitwise copy of the item at logical index `i`. The caller owns the
    /// value only after winning the corresponding index via CAS; a loser
    /// must `mem::forget` the copy.
    unsafe fn take(&self, i: i64) -> T {
        let slot = &self.slots[(i & self.mask) as usize];
        (*slot.get()).as_ptr().read()
    }
}

pub(crate) struct StealQueue<T> {
    top: CachePadded<AtomicI64>,
    bottom: CachePadded<AtomicI64>,
    array: AtomicPtr<Slots<T>>,
    garbage: Mutex<Vec<*mut Slots<T>>>,
}

unsafe impl<T: Send> Send for StealQueue<T> {}
unsafe impl<T: Send> Sync for StealQueue<T> {}

impl<T> StealQueue<T> {
    pub(crate) fn new(capacity: i64) -> StealQueue<T> {
        assert!(
            capacity > 0 && (capacity & (capacity - 1)) == 0,
            "capacity must be a power of two"
        );
        StealQueue {
            top: CachePadded::new(AtomicI64::new(0)),
            bottom: CachePadded::new(AtomicI64::new(0)),
            array: AtomicPtr::new(Slots::alloc(capacity)),
            garbage: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Relaxed);
        b <= t
    }

    pub(crate) fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Relaxed);
        if b > t {
            (b - t) as usize
        } else {
            0
        }
    }

    /// Appends an item at the bottom. Owner thread only.
    pub(crate) fn push(&self, item: T) {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        let mut a = self.array.load(Ordering::Relaxed);

        unsafe {
            if (*a).cap - 1 < b - t {
                a = self.grow(a, b, t);
            }
            (*a).put(b, item);
        }
        fence(Ordering::Release);
        self.bottom.store(b + 1, Ordering::Relaxed);
    }

    /// Removes the most recently pushed item. Owner thread only.
    pub(crate) fn pop(&self) -> Option<T> {
        let b = self.bottom.load(Ordering::Relaxed) - 1;
        let a = self.array.load(Ordering::Relaxed);
        self.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        if t <= b {
            let item = unsafe { (*a).take(b) };
            if t == b {
                // Exactly one element, contended with stealers.
                let won = self
                    .top
                    .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok();
                self.bottom.store(b + 1, Ordering::Relaxed);
                if !won {
                    std::mem::forget(item);
                    return None;
                }
            }
            Some(item)
        } else {
            self.bottom.store(b + 1, Ordering::Relaxed);
            None
        }
    }

    /// Takes the oldest item. Any thread other than the owner.
    pub(crate) fn steal(&self) -> Option<T> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);

        if t < b {
            let a = self.array.load(Ordering::Acquire);
            let item = unsafe { (*a).take(t) };
            if self
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return Some(item);
            }
            std::mem::forget(item);
        }
        None
    }

    /// Doubles the backing array, retiring the old one onto the garbage
    /// list; stealers may still be reading from it.
    unsafe fn grow(&self, old: *mut Slots<T>, b: i64, t: i64) -> *mut Slots<T> {
        let fresh = Slots::<T>::alloc((*old).cap * 2);
        for i in t..b {
            let item = (*old).take(i);
            (*fresh).put(i, item);
        }
        self.array.store(fresh, Ordering::Release);
        self.garbage.lock().push(old);
        fresh
    }
}

impl<T> Drop for StealQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
        unsafe {
            drop(Box::from_raw(self.array.load(Ordering::Relaxed)));
            for a in self.garbage.get_mut().drain(..) {
                drop(Box::from_raw(a));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn owner_pops_lifo() {
        let q = StealQueue::new(4);
        for i in 0..3 {
            q.push(i);
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(0));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn stealers_take_fifo() {
        let q = StealQueue::new(4);
        for i in 0..3 {
            q.push(i);
        }
        assert_eq!(q.steal(), Some(0));
        assert_eq!(q.steal(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.steal(), None);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let q = StealQueue::new(2);
        for i in 0..100 {
            q.push(i);
        }
        for i in 0..100 {
            assert_eq!(q.steal(), Some(i));
        }
    }

    #[test]
    fn drop_releases_unconsumed_items() {
        let q = StealQueue::new(2);
        for _ in 0..10 {
            q.push(String::from("item"));
        }
        drop(q);
    }

    // Every marker is delivered exactly once, whether popped by the owner
    // or stolen by a peer, at N = 100_000 with 8 stealers.
    #[test]
    fn no_item_is_lost_or_duplicated() {
        const N: usize = 100_000;
        const STEALERS: usize = 8;

        let q = Arc::new(StealQueue::new(256));
        let done = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for _ in 0..STEALERS {
            let q = Arc::clone(&q);
            let done = Arc::clone(&done);
            handles.push(std::thread::spawn(move || {
                let mut got = Vec::new();
                loop {
                    match q.steal() {
                        Some(v) => got.push(v),
                        None if done.load(Ordering::Acquire) && q.is_empty() => break,
                        None => std::hint::spin_loop(),
                    }
                }
                got
            }));
        }

        let mut own = Vec::new();
        for i in 0..N {
            q.push(i);
            if i % 3 == 0 {
                if let Some(v) = q.pop() {
                    own.push(v);
                }
            }
        }
        while let Some(v) = q.pop() {
            own.push(v);
        }
        done.store(true, Ordering::Release);

        let mut seen: HashSet<usize> = own.into_iter().collect();
        let mut total = seen.len();
        for handle in handles {
            for v in handle.join().unwrap() {
                total += 1;
                assert!(seen.insert(v), "marker {v} delivered twice");
            }
        }
        assert_eq!(total, N, "markers lost");
    }
}
