//! Deadline futures driven by the loop's monotonic timer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::future::{complete, Future, FutureCell, Variant};
use crate::mainloop::{Dispatch, Source, SourceHandle, PRIORITY_DEFAULT};
use crate::Error;

pub(crate) struct TimeoutState {
    source: Mutex<Option<SourceHandle>>,
}

impl TimeoutState {
    /// The future owns the timer source; releasing the future destroys it
    /// so the callback cannot fire afterwards.
    pub(crate) fn finalize(&self) {
        if let Some(handle) = self.source.lock().take() {
            handle.destroy();
        }
    }
}

/// The timer source only holds a weak back-reference to the future, so a
/// released timeout silently stops firing.
struct TimeoutSource {
    target: std::sync::Weak<FutureCell>,
}

impl Source for TimeoutSource {
    fn dispatch(&self) -> Dispatch {
        if let Some(cell) = self.target.upgrade() {
            complete(&cell, Err(Error::TimedOut));
            if let Variant::Timeout(state) = &cell.variant {
                state.source.lock().take();
            }
        }
        Dispatch::Remove
    }
}

/// A future that rejects with [`Error::TimedOut`] at a deadline.
#[derive(Clone)]
pub struct Timeout {
    future: Future,
}

impl Timeout {
    /// A timeout firing at an absolute monotonic deadline, attached to the
    /// calling thread's scheduler loop.
    ///
    /// # Panics
    ///
    /// Panics if no scheduler exists for the calling thread or process.
    pub fn deadline(deadline: Instant) -> Timeout {
        let cell = FutureCell::new(Variant::Timeout(TimeoutState {
            source: Mutex::new(None),
        }));

        let context = crate::scheduler::current_main_context()
            .expect("timeout requires a scheduler on this thread or a process default");
        let handle = context.attach(
            PRIORITY_DEFAULT,
            Box::new(TimeoutSource {
                target: Arc::downgrade(&cell),
            }),
        );
        handle.set_ready_time(Some(deadline));

        if let Variant::Timeout(state) = &cell.variant {
            *state.source.lock() = Some(handle);
        }

        Timeout {
            future: Future::from_cell(cell),
        }
    }

    pub fn seconds(seconds: u64) -> Timeout {
        Timeout::deadline(Instant::now() + Duration::from_secs(seconds))
    }

    pub fn msec(msec: u64) -> Timeout {
        Timeout::deadline(Instant::now() + Duration::from_millis(msec))
    }

    pub fn usec(usec: u64) -> Timeout {
        Timeout::deadline(Instant::now() + Duration::from_micros(usec))
    }

    pub fn future(&self) -> Future {
        self.future.clone()
    }

    /// Moves the deadline of a timeout that has not fired yet.
    pub fn postpone_until(&self, deadline: Instant) {
        if let Variant::Timeout(state) = &self.future.cell.variant {
            if let Some(handle) = state.source.lock().as_ref() {
                handle.set_ready_time(Some(deadline));
            }
        }
    }
}

impl From<Timeout> for Future {
    fn from(timeout: Timeout) -> Future {
        timeout.future()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::Status;
    use crate::scheduler::MainScheduler;

    #[test]
    fn fires_at_the_deadline() {
        let scheduler = MainScheduler::new();
        let timeout = Timeout::msec(30);
        assert_eq!(timeout.future().status(), Status::Pending);

        let start = Instant::now();
        let result = scheduler.run_until_settled(&timeout.future());
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(result.unwrap_err(), Error::TimedOut);
    }

    #[test]
    fn postpone_moves_the_deadline() {
        let scheduler = MainScheduler::new();
        let timeout = Timeout::msec(10);
        timeout.postpone_until(Instant::now() + Duration::from_millis(60));

        let start = Instant::now();
        let result = scheduler.run_until_settled(&timeout.future());
        assert!(start.elapsed() >= Duration::from_millis(55));
        assert_eq!(result.unwrap_err(), Error::TimedOut);
    }

    #[test]
    fn released_timeout_stops_its_source() {
        let scheduler = MainScheduler::new();
        let timeout = Timeout::msec(10);
        drop(timeout);
        // The destroyed source must not fire; iterate past the deadline.
        let guard = Timeout::msec(40);
        let _ = scheduler.run_until_settled(&guard.future());
    }
}
