//! Deferred values, stackful fibers and asynchronous I/O on a pluggable
//! scheduler core.
//!
//! The runtime is built from four tightly interacting pieces:
//!
//! - a future algebra: [`Promise`], [`Cancellable`], combinators
//!   ([`Future::all`], [`Future::any`], [`Future::all_race`],
//!   [`Future::first`]) and block chaining ([`Future::then`],
//!   [`Future::catch`], [`Future::finally`] and their loop variants) with
//!   propagation and discard/cancellation semantics;
//! - schedulers: a loop-integrated [`MainScheduler`] and a
//!   [`ThreadPoolScheduler`] with a global queue and per-worker
//!   work-stealing deques;
//! - stackful fibers: cooperative tasks spawned with [`spawn`] that may
//!   `await_*` futures without blocking their OS thread, pinned to the
//!   scheduler that spawned them;
//! - asynchronous I/O ([`aio::read`], [`aio::write`]) on an io_uring ring
//!   when the kernel provides one, or a synchronous worker pool otherwise,
//!   plus the [`Semaphore`], [`Timeout`], [`unix_signal`] and [`watch`]
//!   primitives built on the same loops.
//!
//! ```no_run
//! weft::init();
//! let scheduler = weft::MainScheduler::new();
//! let fiber = scheduler.scheduler().spawn(|| {
//!     let n = weft::Timeout::msec(10).future().await_value();
//!     assert!(n.is_err());
//!     Some(weft::Future::resolved(true))
//! });
//! scheduler.run_until_settled(&fiber).unwrap();
//! ```

pub mod aio;
mod channel;
mod error;
mod fiber;
pub mod future;
pub mod mainloop;
mod scheduler;
mod semaphore;
mod timeout;
mod unix_signal;
mod value;
mod watch;

pub use aio::Buffer;
pub use channel::Channel;
pub use error::{Error, Result};
pub use future::{Cancellable, CancelToken, Delayed, Future, Promise, Status, WeakFuture};
pub use mainloop::{MainContext, MainLoop};
pub use scheduler::{MainScheduler, Scheduler, ThreadPoolScheduler};
pub use semaphore::Semaphore;
pub use timeout::Timeout;
pub use unix_signal::unix_signal;
pub use value::{FdValue, Value};
pub use watch::{watch, WATCH_ERR, WATCH_HUP, WATCH_IN, WATCH_OUT};

/// Installs the process-wide default scheduler (a [`MainScheduler`] for the
/// calling thread) unless one is already set, and returns it.
///
/// Programs that drive their own schedulers may skip this and construct
/// [`MainScheduler`] or [`ThreadPoolScheduler`] directly.
pub fn init() -> Scheduler {
    if let Some(existing) = Scheduler::get_default() {
        return existing;
    }
    let scheduler = MainScheduler::new().scheduler();
    Scheduler::set_default(scheduler.clone());
    scheduler
}

/// Spawns a fiber on the calling thread's scheduler (or the process
/// default), returning the future of its result.
pub fn spawn<F>(entry: F) -> Future
where
    F: FnOnce() -> Option<Future> + Send + 'static,
{
    let scheduler = Scheduler::thread_default()
        .or_else(Scheduler::get_default)
        .expect("spawn requires a scheduler; call weft::init() first");
    scheduler.spawn(entry)
}
