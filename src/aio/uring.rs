//! Ring AIO backend over the raw `io_uring` syscall ABI.
//!
//! Each context owns one ring sized for 32 in-flight operations, an eventfd
//! registered with the kernel so completions wake the owning loop, and a
//! queue of futures for which no submission slot was available. The loop's
//! prepare hook flushes the queue and submits; dispatch drains completion
//! entries in bounded batches.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use slab::Slab;
use tracing::trace;

use super::{complete_aio, AioOp, AioState};
use crate::future::{FutureCell, Variant};
use crate::mainloop::{Dispatch, FdWatch, MainContext, Prepare, Source, PRIORITY_DEFAULT};

pub(crate) const DEFAULT_RING_SIZE: u32 = 32;

/// Completions handled per dispatch batch.
const CQE_BATCH: usize = 32;

const IORING_OFF_SQ_RING: i64 = 0;
const IORING_OFF_CQ_RING: i64 = 0x0800_0000;
const IORING_OFF_SQES: i64 = 0x1000_0000;

const IORING_FEAT_SINGLE_MMAP: u32 = 1;
const IORING_REGISTER_EVENTFD: u32 = 4;

const IORING_OP_READ: u8 = 22;
const IORING_OP_WRITE: u8 = 23;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct SqringOffsets {
    head: u32,
    tail: u32,
    ring_mask: u32,
    ring_entries: u32,
    flags: u32,
    dropped: u32,
    array: u32,
    resv1: u32,
    user_addr: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CqringOffsets {
    head: u32,
    tail: u32,
    ring_mask: u32,
    ring_entries: u32,
    overflow: u32,
    cqes: u32,
    flags: u32,
    resv1: u32,
    user_addr: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct IoUringParams {
    sq_entries: u32,
    cq_entries: u32,
    flags: u32,
    sq_thread_cpu: u32,
    sq_thread_idle: u32,
    features: u32,
    wq_fd: u32,
    resv: [u32; 3],
    sq_off: SqringOffsets,
    cq_off: CqringOffsets,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Sqe {
    opcode: u8,
    flags: u8,
    ioprio: u16,
    fd: i32,
    off: u64,
    addr: u64,
    len: u32,
    rw_flags: u32,
    user_data: u64,
    buf_index: u16,
    personality: u16,
    splice_fd_in: i32,
    addr3: u64,
    _pad2: u64,
}

impl Default for Sqe {
    fn default() -> Sqe {
        unsafe { std::mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Cqe {
    user_data: u64,
    res: i32,
    flags: u32,
}

struct MmapRegion {
    ptr: *mut u8,
    len: usize,
}

impl MmapRegion {
    fn map(fd: RawFd, len: usize, offset: i64) -> io::Result<MmapRegion> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(MmapRegion {
            ptr: ptr as *mut u8,
            len,
        })
    }

    unsafe fn at<T>(&self, offset: u32) -> *mut T {
        self.ptr.add(offset as usize) as *mut T
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// The mapped submission/completion rings plus the owner-side cursors.
/// Owned by one thread for submission; foreign threads never touch it.
pub(crate) struct RawRing {
    fd: OwnedFd,
    _sq_ring: MmapRegion,
    _cq_ring: Option<MmapRegion>,
    _sqes_map: MmapRegion,

    sq_khead: *const AtomicU32,
    sq_ktail: *const AtomicU32,
    sq_mask: u32,
    sq_entries: u32,
    sq_array: *mut u32,
    sqes: *mut Sqe,

    cq_khead: *const AtomicU32,
    cq_ktail: *const AtomicU32,
    cq_mask: u32,
    cqes: *const Cqe,

    /// Pushed but not yet passed to `io_uring_enter`.
    pending: u32,
}

unsafe impl Send for RawRing {}

impl RawRing {
    pub(crate) fn new(entries: u32) -> io::Result<RawRing> {
        // No optional setup flags: the loop sleeps in poll() on the
        // registered eventfd and must always be interruptible by a
        // completion, whichever context posts it.
        let mut params = IoUringParams::default();

        let fd = unsafe {
            libc::syscall(
                libc::SYS_io_uring_setup,
                entries as libc::c_long,
                &mut params as *mut IoUringParams,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd as RawFd) };

        let sq_len = params.sq_off.array as usize + params.sq_entries as usize * 4;
        let cq_len =
            params.cq_off.cqes as usize + params.cq_entries as usize * std::mem::size_of::<Cqe>();
        let single_mmap = params.features & IORING_FEAT_SINGLE_MMAP != 0;

        let sq_ring = MmapRegion::map(
            fd.as_raw_fd(),
            if single_mmap {
                sq_len.max(cq_len)
            } else {
                sq_len
            },
            IORING_OFF_SQ_RING,
        )?;
        let cq_ring = if single_mmap {
            None
        } else {
            Some(MmapRegion::map(fd.as_raw_fd(), cq_len, IORING_OFF_CQ_RING)?)
        };
        let sqes_map = MmapRegion::map(
            fd.as_raw_fd(),
            params.sq_entries as usize * std::mem::size_of::<Sqe>(),
            IORING_OFF_SQES,
        )?;

        let cq_base = cq_ring.as_ref().unwrap_or(&sq_ring);

        let ring = unsafe {
            RawRing {
                sq_khead: sq_ring.at(params.sq_off.head),
                sq_ktail: sq_ring.at(params.sq_off.tail),
                sq_mask: *sq_ring.at::<u32>(params.sq_off.ring_mask),
                sq_entries: params.sq_entries,
                sq_array: sq_ring.at(params.sq_off.array),
                sqes: sqes_map.at(0),

                cq_khead: cq_base.at(params.cq_off.head),
                cq_ktail: cq_base.at(params.cq_off.tail),
                cq_mask: *cq_base.at::<u32>(params.cq_off.ring_mask),
                cqes: cq_base.at(params.cq_off.cqes),

                fd,
                _sq_ring: sq_ring,
                _cq_ring: cq_ring,
                _sqes_map: sqes_map,
                pending: 0,
            }
        };
        Ok(ring)
    }

    fn register_eventfd(&self, eventfd: RawFd) -> io::Result<()> {
        let rc = unsafe {
            libc::syscall(
                libc::SYS_io_uring_register,
                self.fd.as_raw_fd() as libc::c_long,
                IORING_REGISTER_EVENTFD as libc::c_long,
                &eventfd as *const RawFd,
                1 as libc::c_long,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Writes one entry into the submission queue; false when full.
    fn push_sqe(&mut self, sqe: Sqe) -> bool {
        let head = unsafe { (*self.sq_khead).load(Ordering::Acquire) };
        let tail = unsafe { (*self.sq_ktail).load(Ordering::Relaxed) };
        if tail.wrapping_sub(head) >= self.sq_entries {
            return false;
        }
        let index = tail & self.sq_mask;
        unsafe {
            *self.sqes.add(index as usize) = sqe;
            *self.sq_array.add(index as usize) = index;
            (*self.sq_ktail).store(tail.wrapping_add(1), Ordering::Release);
        }
        self.pending += 1;
        true
    }

    /// Submits everything pushed since the last call.
    fn submit(&mut self) -> io::Result<u32> {
        if self.pending == 0 {
            return Ok(0);
        }
        loop {
            let rc = unsafe {
                libc::syscall(
                    libc::SYS_io_uring_enter,
                    self.fd.as_raw_fd() as libc::c_long,
                    self.pending as libc::c_long,
                    0 as libc::c_long,
                    0 as libc::c_long,
                    std::ptr::null::<libc::c_void>(),
                    0 as libc::c_long,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }
            let submitted = rc as u32;
            self.pending -= submitted.min(self.pending);
            return Ok(submitted);
        }
    }

    fn cq_ready(&self) -> u32 {
        let head = unsafe { (*self.cq_khead).load(Ordering::Relaxed) };
        let tail = unsafe { (*self.cq_ktail).load(Ordering::Acquire) };
        tail.wrapping_sub(head)
    }

    fn pop_cqe(&mut self) -> Option<Cqe> {
        let head = unsafe { (*self.cq_khead).load(Ordering::Relaxed) };
        let tail = unsafe { (*self.cq_ktail).load(Ordering::Acquire) };
        if head == tail {
            return None;
        }
        let cqe = unsafe { *self.cqes.add((head & self.cq_mask) as usize) };
        unsafe { (*self.cq_khead).store(head.wrapping_add(1), Ordering::Release) };
        Some(cqe)
    }
}

/// Whether the running kernel is recent enough for the ring backend.
/// Older kernels have io_uring quirks that are hard to probe for, so
/// anything before 6.1 falls back to the thread pool.
pub(crate) fn kernel_supported() -> bool {
    static SUPPORTED: OnceLock<bool> = OnceLock::new();
    *SUPPORTED.get_or_init(|| {
        let mut utsname: libc::utsname = unsafe { std::mem::zeroed() };
        if unsafe { libc::uname(&mut utsname) } != 0 {
            return false;
        }
        let release = unsafe { std::ffi::CStr::from_ptr(utsname.release.as_ptr()) };
        let release = release.to_string_lossy();
        let mut parts = release.split('.');
        let major: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let minor: u32 = parts
            .next()
            .and_then(|s| s.chars().take_while(|c| c.is_ascii_digit()).collect::<String>().parse().ok())
            .unwrap_or(0);
        major > 6 || (major == 6 && minor >= 1)
    })
}

pub(crate) struct UringContext {
    ring: Mutex<RawRing>,
    eventfd: OwnedFd,
    /// Futures with no submission slot yet, in arrival order.
    queued: Mutex<VecDeque<Arc<FutureCell>>>,
    /// In-flight futures keyed by the sqe's `user_data`.
    inflight: Mutex<Slab<Arc<FutureCell>>>,
    context: MainContext,
    watch: OnceLock<Arc<FdWatch>>,
}

impl UringContext {
    pub(crate) fn create(context: &MainContext) -> Option<Arc<UringContext>> {
        let ring = RawRing::new(DEFAULT_RING_SIZE).ok()?;

        let eventfd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if eventfd < 0 {
            return None;
        }
        let eventfd = unsafe { OwnedFd::from_raw_fd(eventfd) };
        ring.register_eventfd(eventfd.as_raw_fd()).ok()?;

        let ctx = Arc::new(UringContext {
            ring: Mutex::new(ring),
            eventfd,
            queued: Mutex::new(VecDeque::new()),
            inflight: Mutex::new(Slab::new()),
            context: context.clone(),
            watch: OnceLock::new(),
        });

        let handle = context.attach(
            PRIORITY_DEFAULT,
            Box::new(UringSource {
                ctx: Arc::downgrade(&ctx),
            }),
        );
        let watch = handle.add_fd(ctx.eventfd.as_raw_fd(), libc::POLLIN as u16 as u32);
        let _ = ctx.watch.set(watch);

        Some(ctx)
    }

    fn build_sqe(state: &AioState, user_data: u64) -> Sqe {
        Sqe {
            opcode: match state.op {
                AioOp::Read => IORING_OP_READ,
                AioOp::Write => IORING_OP_WRITE,
            },
            fd: state.fd,
            off: if state.offset < 0 {
                u64::MAX
            } else {
                state.offset as u64
            },
            addr: state.buffer.ptr() as u64,
            len: state.count as u32,
            user_data,
            ..Default::default()
        }
    }

    fn aio_state(cell: &FutureCell) -> &AioState {
        match &cell.variant {
            Variant::Aio(state) => state,
            _ => unreachable!("uring submission for a non-AIO future"),
        }
    }

    /// Accepts an AIO future for this context. Same-thread submissions try
    /// the ring directly; anything else is queued for the owner and the
    /// owner's loop is woken.
    pub(crate) fn queue(self: &Arc<UringContext>, cell: Arc<FutureCell>) {
        let same_thread = crate::scheduler::with_storage(|storage| {
            storage.aio.as_ref().map_or(false, |ctx| ctx.is_uring(self))
        });

        if same_thread {
            let queued_empty = self.queued.lock().is_empty();
            if queued_empty {
                let mut ring = self.ring.lock();
                let key = self.inflight.lock().insert(Arc::clone(&cell)) as u64;
                let sqe = UringContext::build_sqe(UringContext::aio_state(&cell), key);
                if ring.push_sqe(sqe) {
                    return;
                }
                self.inflight.lock().remove(key as usize);
            }
        }

        self.queued.lock().push_back(cell);
        if !same_thread {
            self.context.wakeup();
        }
    }

    /// Moves queued futures into the ring and submits. Called from the
    /// owner's prepare hook.
    fn flush(&self) -> bool {
        let mut ring = self.ring.lock();
        {
            let mut queued = self.queued.lock();
            while let Some(cell) = queued.pop_front() {
                let key = self.inflight.lock().insert(Arc::clone(&cell)) as u64;
                let sqe = UringContext::build_sqe(UringContext::aio_state(&cell), key);
                if !ring.push_sqe(sqe) {
                    // Ring full; wait for completions to free slots.
                    self.inflight.lock().remove(key as usize);
                    queued.push_front(cell);
                    break;
                }
            }
        }
        if let Err(err) = ring.submit() {
            trace!(?err, "io_uring submit failed");
        }
        ring.cq_ready() > 0
    }

    fn drain_eventfd(&self) {
        let mut counter: u64 = 0;
        unsafe {
            libc::read(
                self.eventfd.as_raw_fd(),
                &mut counter as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

impl super::AioContext {
    pub(crate) fn is_uring(&self, ctx: &Arc<UringContext>) -> bool {
        match &self.kind {
            super::AioContextKind::Uring(own) => Arc::ptr_eq(own, ctx),
            _ => false,
        }
    }
}

struct UringSource {
    ctx: Weak<UringContext>,
}

impl Source for UringSource {
    fn prepare(&self) -> Prepare {
        match self.ctx.upgrade() {
            Some(ctx) => Prepare {
                timeout: None,
                ready: ctx.flush(),
            },
            None => Prepare::wait(),
        }
    }

    fn check(&self) -> bool {
        let ctx = match self.ctx.upgrade() {
            Some(ctx) => ctx,
            None => return false,
        };
        if let Some(watch) = ctx.watch.get() {
            if watch.revents() & libc::POLLIN as u16 as u32 != 0 {
                return true;
            }
        }
        let ready = ctx.ring.lock().cq_ready() > 0;
        ready
    }

    fn dispatch(&self) -> Dispatch {
        let ctx = match self.ctx.upgrade() {
            Some(ctx) => ctx,
            None => return Dispatch::Remove,
        };
        ctx.drain_eventfd();

        loop {
            let mut batch = Vec::with_capacity(CQE_BATCH);
            {
                let mut ring = ctx.ring.lock();
                while batch.len() < CQE_BATCH {
                    match ring.pop_cqe() {
                        Some(cqe) => batch.push(cqe),
                        None => break,
                    }
                }
            }
            let full_batch = batch.len() == CQE_BATCH;

            for cqe in batch {
                let cell = ctx.inflight.lock().try_remove(cqe.user_data as usize);
                if let Some(cell) = cell {
                    let res = cqe.res as i64;
                    complete_aio(&cell, res, if res < 0 { -cqe.res } else { 0 });
                }
            }

            if !full_batch {
                break;
            }
        }

        Dispatch::Continue
    }
}
