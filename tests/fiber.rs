//! Fibers awaiting futures, including the timeout/signal race.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serial_test::serial;
use weft::{unix_signal, Error, Future, MainScheduler, Promise, Timeout};

#[test]
fn fiber_awaits_chain_of_futures() {
    let scheduler = MainScheduler::new();
    let promise = Promise::new();

    let input = promise.future();
    let fiber = scheduler.scheduler().spawn(move || {
        let a = input.await_int().unwrap();
        let b = Future::resolved(a * 2).await_int().unwrap();
        Some(Future::resolved(b + 1))
    });

    scheduler.context().iteration(false);
    assert!(fiber.is_pending());

    promise.resolve_int(10);
    let result = scheduler.run_until_settled(&fiber);
    assert_eq!(result.unwrap().as_int(), Some(21));
}

#[test]
fn fiber_completes_within_one_dispatch_when_never_suspending() {
    let scheduler = MainScheduler::new();
    let ran = Arc::new(AtomicUsize::new(0));
    let ran2 = Arc::clone(&ran);
    let fiber = scheduler.scheduler().spawn(move || {
        ran2.fetch_add(1, Ordering::SeqCst);
        Some(Future::resolved(true))
    });

    scheduler.context().iteration(false);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert!(fiber.is_resolved());
}

#[test]
#[serial(signals)]
fn fiber_timeout_fires_without_signal() {
    let scheduler = MainScheduler::new();

    let fiber = scheduler.scheduler().spawn(|| {
        let first = Future::first([
            Timeout::msec(100).future(),
            unix_signal(libc::SIGUSR1),
        ]);
        match first.await_value() {
            Ok(value) => Some(Future::resolved(value)),
            Err(err) => Some(Future::rejected(err)),
        }
    });

    let start = Instant::now();
    let result = scheduler.run_until_settled(&fiber);
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(result.unwrap_err(), Error::TimedOut);
}

#[test]
#[serial(signals)]
fn fiber_signal_beats_timeout() {
    let scheduler = MainScheduler::new();

    let fiber = scheduler.scheduler().spawn(|| {
        let first = Future::first([
            Timeout::msec(5000).future(),
            unix_signal(libc::SIGUSR1),
        ]);
        match first.await_value() {
            Ok(value) => Some(Future::resolved(value)),
            Err(err) => Some(Future::rejected(err)),
        }
    });

    let sender = std::thread::spawn(|| {
        std::thread::sleep(Duration::from_millis(50));
        unsafe {
            libc::kill(libc::getpid(), libc::SIGUSR1);
        }
    });

    let start = Instant::now();
    let result = scheduler.run_until_settled(&fiber);
    assert!(start.elapsed() < Duration::from_millis(5000));
    assert_eq!(result.unwrap().as_int(), Some(libc::SIGUSR1));
    sender.join().unwrap();

    // The losing timeout was released with the set; iterating well past its
    // deadline must not disturb anything.
    let guard = Timeout::msec(30).future();
    let _ = scheduler.run_until_settled(&guard);
}

#[test]
fn many_fibers_share_one_scheduler() {
    let scheduler = MainScheduler::new();
    let mut fibers = Vec::new();
    for i in 0..64 {
        fibers.push(scheduler.scheduler().spawn(move || {
            let t = Timeout::msec(5 + (i % 7)).future();
            let _ = t.await_value();
            Some(Future::resolved(i as i32))
        }));
    }

    let all = Future::all(fibers.clone());
    let result = scheduler.run_until_settled(&all);
    assert_eq!(result.unwrap().as_bool(), Some(true));
    for (i, fiber) in fibers.iter().enumerate() {
        assert_eq!(fiber.result().unwrap().as_int(), Some(i as i32));
    }
}
