//! Futures resolved by unix signal delivery.
//!
//! A process-wide handler forwards each delivery down a self-pipe; a lazy
//! dispatcher thread reads the pipe and completes every future registered
//! for that signal with the signal number. Registration is restricted to
//! the forwardable set (HUP, INT, TERM, USR1, USR2, WINCH).

use std::collections::HashSet;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::future::{complete, Future, FutureCell, Variant};
use crate::Value;

pub(crate) struct SignalState {
    pub(crate) signum: i32,
}

const ALLOWED: [i32; 6] = [
    libc::SIGHUP,
    libc::SIGINT,
    libc::SIGTERM,
    libc::SIGUSR1,
    libc::SIGUSR2,
    libc::SIGWINCH,
];

/// Write end of the self-pipe, reachable from the signal handler.
static PIPE_WR: AtomicI32 = AtomicI32::new(-1);

extern "C" fn forward_signal(signum: libc::c_int) {
    let fd = PIPE_WR.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signum as u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

struct SignalHub {
    registered: Mutex<Vec<(i32, Weak<FutureCell>)>>,
    installed: Mutex<HashSet<i32>>,
}

impl SignalHub {
    fn get() -> &'static SignalHub {
        static HUB: OnceLock<SignalHub> = OnceLock::new();
        HUB.get_or_init(|| {
            let mut fds = [0 as RawFd; 2];
            let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
            assert!(rc == 0, "pipe: {}", std::io::Error::last_os_error());
            unsafe {
                libc::fcntl(fds[1], libc::F_SETFD, libc::FD_CLOEXEC);
                libc::fcntl(fds[0], libc::F_SETFD, libc::FD_CLOEXEC);
            }
            PIPE_WR.store(fds[1], Ordering::Release);

            let read_fd = fds[0];
            std::thread::Builder::new()
                .name("weft-signal".into())
                .spawn(move || signal_dispatcher(read_fd))
                .expect("failed to spawn signal dispatcher thread");

            SignalHub {
                registered: Mutex::new(Vec::new()),
                installed: Mutex::new(HashSet::new()),
            }
        })
    }

    fn install(&self, signum: i32) {
        let mut installed = self.installed.lock();
        if !installed.insert(signum) {
            return;
        }
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = forward_signal as extern "C" fn(libc::c_int) as usize;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signum, &action, std::ptr::null_mut());
        }
    }

    fn register(&self, signum: i32, target: Weak<FutureCell>) {
        self.install(signum);
        let mut registered = self.registered.lock();
        registered.retain(|(_, w)| w.strong_count() > 0);
        registered.push((signum, target));
    }

    fn fire(&self, signum: i32) {
        let targets: Vec<Arc<FutureCell>> = {
            let mut registered = self.registered.lock();
            let mut targets = Vec::new();
            registered.retain(|(num, weak)| {
                if *num == signum {
                    if let Some(cell) = weak.upgrade() {
                        targets.push(cell);
                    }
                    false
                } else {
                    weak.strong_count() > 0
                }
            });
            targets
        };

        for cell in targets {
            let signum = match &cell.variant {
                Variant::UnixSignal(state) => state.signum,
                _ => continue,
            };
            complete(&cell, Ok(Value::Int(signum)));
        }
    }
}

fn signal_dispatcher(read_fd: RawFd) {
    loop {
        let mut byte: u8 = 0;
        let n = unsafe { libc::read(read_fd, &mut byte as *mut u8 as *mut libc::c_void, 1) };
        if n == 1 {
            SignalHub::get().fire(byte as i32);
        } else if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return;
            }
        }
    }
}

/// A future resolving with `signum` when that signal is delivered to the
/// process.
///
/// # Panics
///
/// Panics if `signum` is outside the supported set.
pub fn unix_signal(signum: i32) -> Future {
    assert!(
        ALLOWED.contains(&signum),
        "unsupported signal number {signum}"
    );

    let cell = FutureCell::new(Variant::UnixSignal(SignalState { signum }));
    SignalHub::get().register(signum, Arc::downgrade(&cell));
    Future::from_cell(cell)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::Status;
    use serial_test::serial;
    use std::time::{Duration, Instant};

    #[test]
    #[serial(signals)]
    fn resolves_with_the_signal_number() {
        let future = unix_signal(libc::SIGUSR2);
        assert_eq!(future.status(), Status::Pending);

        unsafe { libc::raise(libc::SIGUSR2) };

        let start = Instant::now();
        while future.is_pending() {
            assert!(start.elapsed() < Duration::from_secs(5), "signal lost");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(future.result().unwrap().as_int(), Some(libc::SIGUSR2));
    }

    #[test]
    #[serial(signals)]
    fn each_registration_fires_once() {
        let first = unix_signal(libc::SIGUSR2);
        let second = unix_signal(libc::SIGUSR2);

        unsafe { libc::raise(libc::SIGUSR2) };
        let start = Instant::now();
        while first.is_pending() || second.is_pending() {
            assert!(start.elapsed() < Duration::from_secs(5), "signal lost");
            std::thread::sleep(Duration::from_millis(1));
        }

        // Registrations are one-shot; a second delivery has no futures left
        // unless re-registered.
        let third = unix_signal(libc::SIGUSR2);
        unsafe { libc::raise(libc::SIGUSR2) };
        let start = Instant::now();
        while third.is_pending() {
            assert!(start.elapsed() < Duration::from_secs(5), "signal lost");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    #[should_panic(expected = "unsupported signal")]
    fn rejects_unsupported_signals() {
        let _ = unix_signal(libc::SIGKILL);
    }
}
