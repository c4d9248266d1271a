//! Weak-handle promotion racing against release of the last full handle:
//! the payload is finalized exactly once per future no matter how many
//! concurrent promoters win or lose.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use weft::{Future, Value, WeakFuture};

struct Canary(Arc<AtomicUsize>);

impl Drop for Canary {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn promotion_race_finalizes_exactly_once() {
    const OBJECTS: usize = 10_000;
    const GETTERS: usize = 8;

    let finalized = Arc::new(AtomicUsize::new(0));

    let futures: Vec<Future> = (0..OBJECTS)
        .map(|_| Future::resolved(Value::boxed(Canary(Arc::clone(&finalized)))))
        .collect();
    let weaks: Arc<Vec<WeakFuture>> = Arc::new(futures.iter().map(|f| f.downgrade()).collect());

    let stop = Arc::new(AtomicBool::new(false));
    let mut getters = Vec::new();
    for _ in 0..GETTERS {
        let weaks = Arc::clone(&weaks);
        let stop = Arc::clone(&stop);
        getters.push(std::thread::spawn(move || {
            let mut promotions = 0usize;
            while !stop.load(Ordering::Acquire) {
                for weak in weaks.iter() {
                    // Either promotion succeeds and extends liveness, or the
                    // future is already gone and we observe nothing.
                    if let Some(full) = weak.get() {
                        assert!(full.is_resolved());
                        promotions += 1;
                        drop(full);
                    }
                }
            }
            promotions
        }));
    }

    // Release the last owned handle of every future while getters promote.
    for future in futures {
        drop(future);
    }
    stop.store(true, Ordering::Release);
    for getter in getters {
        getter.join().unwrap();
    }

    assert_eq!(finalized.load(Ordering::SeqCst), OBJECTS);
    assert!(weaks.iter().all(|w| w.get().is_none()));
}

#[test]
fn weak_retargeting() {
    let a = Future::resolved(1i32);
    let b = Future::resolved(2i32);
    let weak = a.downgrade();

    assert_eq!(weak.get().unwrap().result().unwrap().as_int(), Some(1));
    weak.set(Some(&b));
    assert_eq!(weak.get().unwrap().result().unwrap().as_int(), Some(2));

    drop(b);
    assert!(weak.get().is_none());
    weak.clear();
    assert!(weak.get().is_none());
    drop(a);
}
