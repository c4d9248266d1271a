//! One-shot descriptor readiness futures.

use std::os::fd::RawFd;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::future::{complete, Future, FutureCell, Variant};
use crate::mainloop::{Dispatch, FdWatch, Source, SourceHandle, PRIORITY_DEFAULT};
use crate::Value;

/// Readable data available.
pub const WATCH_IN: u32 = libc::POLLIN as u16 as u32;
/// Writable without blocking.
pub const WATCH_OUT: u32 = libc::POLLOUT as u16 as u32;
/// Error condition; always reported.
pub const WATCH_ERR: u32 = libc::POLLERR as u16 as u32;
/// Hang-up; always reported.
pub const WATCH_HUP: u32 = libc::POLLHUP as u16 as u32;

pub(crate) struct WatchState {
    source: Mutex<Option<SourceHandle>>,
}

impl WatchState {
    fn destroy_source(&self) {
        if let Some(handle) = self.source.lock().take() {
            handle.destroy();
        }
    }

    /// Discard hook: nobody awaits the readiness anymore.
    pub(crate) fn discard(&self) {
        self.destroy_source();
    }

    pub(crate) fn finalize(&self) {
        self.destroy_source();
    }
}

struct WatchSource {
    target: Weak<FutureCell>,
    fd_watch: Arc<OnceLock<Arc<FdWatch>>>,
}

impl Source for WatchSource {
    fn check(&self) -> bool {
        self.fd_watch
            .get()
            .map_or(false, |watch| watch.revents() != 0)
    }

    fn dispatch(&self) -> Dispatch {
        let revents = self.fd_watch.get().map_or(0, |watch| watch.revents());
        if let Some(cell) = self.target.upgrade() {
            complete(&cell, Ok(Value::Int(revents as i32)));
            if let Variant::Watch(state) = &cell.variant {
                state.source.lock().take();
            }
        }
        Dispatch::Remove
    }
}

/// A future resolving with the ready events bitset once `fd` becomes ready
/// for any of the requested `events` (hang-up and error are always
/// reported). Attached to the calling thread's scheduler loop.
///
/// # Panics
///
/// Panics if no scheduler exists for the calling thread or process.
pub fn watch(fd: RawFd, events: u32) -> Future {
    let cell = FutureCell::new(Variant::Watch(WatchState {
        source: Mutex::new(None),
    }));

    let context = crate::scheduler::current_main_context()
        .expect("watch requires a scheduler on this thread or a process default");

    let fd_watch = Arc::new(OnceLock::new());
    let handle = context.attach(
        PRIORITY_DEFAULT,
        Box::new(WatchSource {
            target: Arc::downgrade(&cell),
            fd_watch: Arc::clone(&fd_watch),
        }),
    );
    let _ = fd_watch.set(handle.add_fd(fd, events));

    if let Variant::Watch(state) = &cell.variant {
        *state.source.lock() = Some(handle);
    }

    Future::from_cell(cell)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::MainScheduler;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn resolves_when_readable() {
        let scheduler = MainScheduler::new();
        let (read_end, write_end) = pipe();

        let future = watch(read_end.as_raw_fd(), WATCH_IN);
        assert!(future.is_pending());

        let payload = [7u8];
        unsafe {
            libc::write(
                write_end.as_raw_fd(),
                payload.as_ptr() as *const libc::c_void,
                1,
            );
        }

        let revents = scheduler.run_until_settled(&future).unwrap();
        assert_ne!(revents.as_int().unwrap() as u32 & WATCH_IN, 0);
    }

    #[test]
    fn reports_hangup() {
        let scheduler = MainScheduler::new();
        let (read_end, write_end) = pipe();

        let future = watch(read_end.as_raw_fd(), WATCH_IN);
        drop(write_end);

        let revents = scheduler.run_until_settled(&future).unwrap();
        assert_ne!(revents.as_int().unwrap() as u32 & WATCH_HUP, 0);
    }

    #[test]
    fn discard_destroys_the_source() {
        let scheduler = MainScheduler::new();
        let (read_end, _write_end) = pipe();

        let future = watch(read_end.as_raw_fd(), WATCH_IN);
        let block = future.clone().then(|_| None);
        drop(block);
        drop(future);

        // The destroyed source must no longer poll the descriptor.
        scheduler.context().iteration(false);
    }
}
