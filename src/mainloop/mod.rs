//! Poll-based event multiplexer.
//!
//! Schedulers, AIO contexts, fiber schedulers, timeouts and watches are all
//! *sources* attached to a [`MainContext`]: an iteration prepares every
//! source (collecting the poll timeout), polls the registered descriptors,
//! then dispatches the sources that became ready, in priority order.
//! Iterating a context is single-threaded by construction (one scheduler
//! thread drives one context), but attaching sources, destroying them and
//! waking the loop are safe from any thread.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Runs before other default-priority sources; used for scheduler queues.
pub const PRIORITY_HIGH: i32 = -100;
/// Default source priority.
pub const PRIORITY_DEFAULT: i32 = 0;
/// Runs when nothing at default priority is ready.
pub const PRIORITY_DEFAULT_IDLE: i32 = 200;
/// Cross-thread work items preempt everything else on the target loop.
pub const PRIORITY_URGENT: i32 = i32::MIN;

/// What a source asks the loop to do after dispatch.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Dispatch {
    Continue,
    Remove,
}

/// Outcome of a source's prepare hook.
#[derive(Clone, Copy, Default)]
pub struct Prepare {
    /// Upper bound on how long the loop may sleep, if any.
    pub timeout: Option<Duration>,
    /// The source is already ready and the poll must not block.
    pub ready: bool,
}

impl Prepare {
    pub fn ready() -> Prepare {
        Prepare {
            timeout: None,
            ready: true,
        }
    }

    pub fn wait() -> Prepare {
        Prepare::default()
    }
}

/// An event source attached to a [`MainContext`].
///
/// Hooks are invoked only from the thread iterating the context; the loop
/// holds no locks while calling them, so hooks may attach further sources
/// or wake other contexts freely.
pub trait Source: Send + Sync {
    fn prepare(&self) -> Prepare {
        Prepare::wait()
    }

    fn check(&self) -> bool {
        false
    }

    fn dispatch(&self) -> Dispatch;
}

/// A descriptor registered by a source, with the revents of the last poll.
pub struct FdWatch {
    fd: RawFd,
    events: AtomicU32,
    revents: AtomicU32,
}

impl FdWatch {
    /// Events observed by the most recent poll.
    pub fn revents(&self) -> u32 {
        self.revents.load(Ordering::Acquire)
    }

    /// Changes the event mask; zero suspends polling of the descriptor.
    pub fn set_events(&self, events: u32) {
        self.events.store(events, Ordering::Release);
    }
}

struct SourceEntry {
    id: u64,
    priority: i32,
    destroyed: AtomicBool,
    ready_time: Mutex<Option<Instant>>,
    fds: Mutex<Vec<Arc<FdWatch>>>,
    source: Box<dyn Source>,
}

/// Owner handle for an attached source.
///
/// Dropping the handle does not destroy the source; call
/// [`SourceHandle::destroy`] to remove it from its context.
#[derive(Clone)]
pub struct SourceHandle {
    entry: Arc<SourceEntry>,
    ctx: Weak<ContextInner>,
}

impl SourceHandle {
    /// Registers a descriptor to poll while the source is attached.
    pub fn add_fd(&self, fd: RawFd, events: u32) -> Arc<FdWatch> {
        let watch = Arc::new(FdWatch {
            fd,
            events: AtomicU32::new(events),
            revents: AtomicU32::new(0),
        });
        self.entry.fds.lock().push(Arc::clone(&watch));
        self.wakeup();
        watch
    }

    /// Sets the monotonic time at which the source becomes ready.
    pub fn set_ready_time(&self, ready_time: Option<Instant>) {
        *self.entry.ready_time.lock() = ready_time;
        self.wakeup();
    }

    /// Removes the source from its context.
    pub fn destroy(&self) {
        self.entry.destroyed.store(true, Ordering::Release);
        self.wakeup();
    }

    pub fn is_destroyed(&self) -> bool {
        self.entry.destroyed.load(Ordering::Acquire)
    }

    fn wakeup(&self) {
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.wakeup();
        }
    }
}

struct ContextInner {
    sources: Mutex<Vec<Arc<SourceEntry>>>,
    next_id: AtomicU64,
    wakeup_fd: OwnedFd,
}

impl ContextInner {
    fn wakeup(&self) {
        let one: u64 = 1;
        // A full eventfd counter already guarantees a pending wakeup.
        unsafe {
            libc::write(
                self.wakeup_fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }

    fn drain_wakeup(&self) {
        let mut buf: u64 = 0;
        unsafe {
            libc::read(
                self.wakeup_fd.as_raw_fd(),
                &mut buf as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

/// A multiplexer context driving a set of sources.
#[derive(Clone)]
pub struct MainContext {
    inner: Arc<ContextInner>,
}

impl Default for MainContext {
    fn default() -> Self {
        MainContext::new()
    }
}

impl MainContext {
    pub fn new() -> MainContext {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        assert!(fd >= 0, "eventfd: {}", std::io::Error::last_os_error());
        MainContext {
            inner: Arc::new(ContextInner {
                sources: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                wakeup_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            }),
        }
    }

    /// Attaches a source at the given priority (lower runs first).
    pub fn attach(&self, priority: i32, source: Box<dyn Source>) -> SourceHandle {
        let entry = Arc::new(SourceEntry {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            priority,
            destroyed: AtomicBool::new(false),
            ready_time: Mutex::new(None),
            fds: Mutex::new(Vec::new()),
            source,
        });
        {
            let mut sources = self.inner.sources.lock();
            sources.push(Arc::clone(&entry));
            sources.sort_by_key(|s| (s.priority, s.id));
        }
        self.inner.wakeup();
        SourceHandle {
            entry,
            ctx: Arc::downgrade(&self.inner),
        }
    }

    /// Schedules a one-shot callback on the loop at the given priority.
    pub fn invoke(&self, priority: i32, func: impl FnOnce() + Send + 'static) {
        struct OneShot {
            func: Mutex<Option<Box<dyn FnOnce() + Send>>>,
        }

        impl Source for OneShot {
            fn prepare(&self) -> Prepare {
                Prepare::ready()
            }

            fn dispatch(&self) -> Dispatch {
                if let Some(func) = self.func.lock().take() {
                    func();
                }
                Dispatch::Remove
            }
        }

        self.attach(
            priority,
            Box::new(OneShot {
                func: Mutex::new(Some(Box::new(func))),
            }),
        );
    }

    /// Interrupts a blocking poll on this context.
    pub fn wakeup(&self) {
        self.inner.wakeup();
    }

    /// Runs one loop iteration; returns whether any source dispatched.
    pub fn iteration(&self, may_block: bool) -> bool {
        let sources: Vec<Arc<SourceEntry>> = self.inner.sources.lock().clone();

        let now = Instant::now();
        let mut timeout = Timeout::infinite();
        let mut prepared = Vec::with_capacity(sources.len());

        for entry in &sources {
            if entry.destroyed.load(Ordering::Acquire) {
                prepared.push(false);
                continue;
            }
            let prep = entry.source.prepare();
            let mut ready = prep.ready;
            if let Some(t) = prep.timeout {
                timeout.merge(t);
            }
            if let Some(ready_time) = *entry.ready_time.lock() {
                if ready_time <= now {
                    ready = true;
                } else {
                    timeout.merge(ready_time - now);
                }
            }
            prepared.push(ready);
        }

        let any_ready = prepared.iter().any(|r| *r);

        // Gather descriptors, wakeup fd first.
        let mut pollfds = vec![libc::pollfd {
            fd: self.inner.wakeup_fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        let mut watches: Vec<Arc<FdWatch>> = Vec::new();
        for entry in &sources {
            if entry.destroyed.load(Ordering::Acquire) {
                continue;
            }
            for watch in entry.fds.lock().iter() {
                let events = watch.events.load(Ordering::Acquire);
                if events == 0 {
                    continue;
                }
                watch.revents.store(0, Ordering::Release);
                pollfds.push(libc::pollfd {
                    fd: watch.fd,
                    events: events as u16 as i16,
                    revents: 0,
                });
                watches.push(Arc::clone(watch));
            }
        }

        let timeout_ms = if any_ready || !may_block {
            0
        } else {
            timeout.as_poll_ms()
        };

        let rc = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                panic!("poll: {err}");
            }
        }

        if pollfds[0].revents & libc::POLLIN != 0 {
            self.inner.drain_wakeup();
        }
        for (i, watch) in watches.iter().enumerate() {
            watch
                .revents
                .store(pollfds[i + 1].revents as u16 as u32, Ordering::Release);
        }

        // Dispatch in priority order.
        let now = Instant::now();
        let mut dispatched = false;
        for (entry, was_ready) in sources.iter().zip(prepared) {
            if entry.destroyed.load(Ordering::Acquire) {
                continue;
            }
            let ready_time = *entry.ready_time.lock();
            let timer_fired = ready_time.map_or(false, |t| t <= now);
            if was_ready || timer_fired || entry.source.check() {
                dispatched = true;
                if entry.source.dispatch() == Dispatch::Remove {
                    entry.destroyed.store(true, Ordering::Release);
                }
            }
        }

        // Sweep destroyed entries.
        self.inner
            .sources
            .lock()
            .retain(|entry| !entry.destroyed.load(Ordering::Acquire));

        dispatched
    }
}

struct Timeout(Option<Duration>);

impl Timeout {
    fn infinite() -> Timeout {
        Timeout(None)
    }

    fn merge(&mut self, d: Duration) {
        match self.0 {
            Some(cur) if cur <= d => {}
            _ => self.0 = Some(d),
        }
    }

    fn as_poll_ms(&self) -> i32 {
        match self.0 {
            None => -1,
            Some(d) => {
                // Round up so timers never fire early.
                let mut ms = d.as_millis();
                if Duration::from_millis(ms as u64) < d {
                    ms += 1;
                }
                ms.min(i32::MAX as u128) as i32
            }
        }
    }
}

/// Runs a [`MainContext`] until asked to quit.
#[derive(Clone)]
pub struct MainLoop {
    context: MainContext,
    quit: Arc<AtomicBool>,
}

impl MainLoop {
    pub fn new(context: MainContext) -> MainLoop {
        MainLoop {
            context,
            quit: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn context(&self) -> &MainContext {
        &self.context
    }

    /// Iterates the context until [`MainLoop::quit`] is called.
    pub fn run(&self) {
        self.quit.store(false, Ordering::Release);
        while !self.quit.load(Ordering::Acquire) {
            self.context.iteration(true);
        }
    }

    /// Stops the loop; safe from any thread, including source dispatch.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        self.context.wakeup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn invoke_runs_once() {
        let ctx = MainContext::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        ctx.invoke(PRIORITY_DEFAULT, move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(ctx.iteration(false));
        assert!(!ctx.iteration(false));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn priority_orders_dispatch() {
        let ctx = MainContext::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (priority, tag) in [(PRIORITY_DEFAULT_IDLE, "idle"), (PRIORITY_HIGH, "high")] {
            let order = Arc::clone(&order);
            ctx.invoke(priority, move || order.lock().push(tag));
        }
        ctx.iteration(false);
        assert_eq!(*order.lock(), vec!["high", "idle"]);
    }

    #[test]
    fn ready_time_fires_after_deadline() {
        struct Timer {
            fired: Arc<AtomicUsize>,
        }
        impl Source for Timer {
            fn dispatch(&self) -> Dispatch {
                self.fired.fetch_add(1, Ordering::SeqCst);
                Dispatch::Remove
            }
        }

        let ctx = MainContext::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = ctx.attach(
            PRIORITY_DEFAULT,
            Box::new(Timer {
                fired: Arc::clone(&fired),
            }),
        );
        handle.set_ready_time(Some(Instant::now() + Duration::from_millis(20)));

        let start = Instant::now();
        while fired.load(Ordering::SeqCst) == 0 {
            ctx.iteration(true);
            assert!(start.elapsed() < Duration::from_secs(5));
        }
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wakeup_interrupts_poll() {
        let ctx = MainContext::new();
        let remote = ctx.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            remote.invoke(PRIORITY_DEFAULT, || {});
        });
        let start = Instant::now();
        // Blocks until the cross-thread invoke arrives.
        while !ctx.iteration(true) {
            assert!(start.elapsed() < Duration::from_secs(5));
        }
        t.join().unwrap();
    }
}
