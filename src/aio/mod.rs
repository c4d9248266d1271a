//! Asynchronous file I/O.
//!
//! Two interchangeable backends selected once per process: a submission/
//! completion ring (io_uring, preferred on Linux 6.1+) and a pool of worker
//! threads performing synchronous positioned syscalls. Both resolve the
//! same AIO future contract: a signed byte count on success, an
//! [`Error::Io`](crate::Error::Io) carrying the kernel errno on failure.
//!
//! Every scheduler thread owns at most one [`AioContext`], a loop source
//! driving submissions and completions for that thread. Submissions from a
//! thread that does not own the context are queued under its lock and the
//! owning loop is woken. The scheduler owning a context must outlive every
//! submission made against it.

pub(crate) mod pool;
#[cfg(target_os = "linux")]
pub(crate) mod uring;

use std::cell::UnsafeCell;
use std::os::fd::RawFd;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::debug;

use crate::future::{complete, Future, FutureCell, Variant};
use crate::mainloop::MainContext;
use crate::{Error, Value};

/// A shared byte buffer for in-flight I/O.
///
/// Clones refer to the same storage. While an operation against the buffer
/// is in flight its contents are unspecified; inspect it only after the
/// operation's future has settled.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

struct BufferInner {
    data: UnsafeCell<Box<[u8]>>,
}

unsafe impl Send for BufferInner {}
unsafe impl Sync for BufferInner {}

impl Buffer {
    /// A zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Buffer {
        Buffer::from_vec(vec![0; len])
    }

    pub fn from_vec(data: Vec<u8>) -> Buffer {
        Buffer {
            inner: Arc::new(BufferInner {
                data: UnsafeCell::new(data.into_boxed_slice()),
            }),
        }
    }

    pub fn len(&self) -> usize {
        unsafe { (&*self.inner.data.get()).len() }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn ptr(&self) -> *mut u8 {
        unsafe { (*self.inner.data.get()).as_mut_ptr() }
    }

    /// Read access to the buffer contents. Only meaningful while no
    /// operation is in flight.
    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(unsafe { &*self.inner.data.get() })
    }

    /// Write access to the buffer contents. Only meaningful while no
    /// operation is in flight.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(unsafe { &mut *self.inner.data.get() })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum AioOp {
    Read,
    Write,
}

/// Payload of an AIO future: the operation and its operands, plus the slot
/// the fallback backend parks its result in until the owning loop runs.
pub(crate) struct AioState {
    pub(crate) op: AioOp,
    pub(crate) fd: RawFd,
    pub(crate) buffer: Buffer,
    pub(crate) count: usize,
    pub(crate) offset: i64,
    pub(crate) pool_result: Mutex<Option<(i64, i32)>>,
}

pub(crate) fn complete_aio(cell: &Arc<FutureCell>, res: i64, errno: i32) {
    if res < 0 {
        complete(cell, Err(Error::from_errno(errno)));
    } else {
        complete(cell, Ok(Value::Int64(res)));
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Backend {
    #[cfg(target_os = "linux")]
    Uring,
    Pool,
}

fn default_backend() -> Backend {
    static BACKEND: OnceLock<Backend> = OnceLock::new();
    *BACKEND.get_or_init(|| {
        #[cfg(target_os = "linux")]
        {
            if uring::kernel_supported() && uring::RawRing::new(uring::DEFAULT_RING_SIZE).is_ok() {
                debug!("using io_uring AIO backend");
                return Backend::Uring;
            }
        }
        debug!("using thread-pool AIO backend");
        Backend::Pool
    })
}

/// Whether the process-wide backend is the ring backend. The semaphore uses
/// this to decide between its eventfd and fallback implementations.
pub(crate) fn backend_is_uring() -> bool {
    #[cfg(target_os = "linux")]
    {
        return default_backend() == Backend::Uring;
    }
    #[allow(unreachable_code)]
    false
}

#[derive(Clone)]
enum AioContextKind {
    #[cfg(target_os = "linux")]
    Uring(Arc<uring::UringContext>),
    Pool(Arc<pool::PoolContext>),
}

/// The per-scheduler I/O source.
#[derive(Clone)]
pub struct AioContext {
    kind: AioContextKind,
}

impl AioContext {
    /// Creates a context for the process-wide backend and attaches its
    /// source to `context`. Returns `None` when the ring backend cannot
    /// create a ring for this thread; callers treat that as fatal for the
    /// thread (a pool worker fails its startup).
    pub(crate) fn create(context: &MainContext) -> Option<AioContext> {
        match default_backend() {
            #[cfg(target_os = "linux")]
            Backend::Uring => {
                let ctx = uring::UringContext::create(context)?;
                Some(AioContext {
                    kind: AioContextKind::Uring(ctx),
                })
            }
            Backend::Pool => Some(AioContext {
                kind: AioContextKind::Pool(pool::PoolContext::create(context)),
            }),
        }
    }

    fn queue(&self, cell: Arc<FutureCell>) {
        match &self.kind {
            #[cfg(target_os = "linux")]
            AioContextKind::Uring(ctx) => ctx.queue(cell),
            AioContextKind::Pool(ctx) => ctx.queue(cell),
        }
    }

}

fn submit(context: Option<&AioContext>, state: AioState) -> Future {
    let context = match context {
        Some(context) => context.clone(),
        None => crate::scheduler::current_aio_context()
            .expect("no AIO context; create a scheduler on this thread first"),
    };
    assert!(
        state.count <= state.buffer.len(),
        "I/O count exceeds the buffer length"
    );
    let cell = FutureCell::new(Variant::Aio(state));
    context.queue(Arc::clone(&cell));
    Future::from_cell(cell)
}

/// Asynchronous `pread`: resolves with the byte count read into `buffer`.
/// An `offset` of -1 reads at the descriptor's current position.
pub fn read(
    context: Option<&AioContext>,
    fd: RawFd,
    buffer: Buffer,
    count: usize,
    offset: i64,
) -> Future {
    submit(
        context,
        AioState {
            op: AioOp::Read,
            fd,
            buffer,
            count,
            offset,
            pool_result: Mutex::new(None),
        },
    )
}

/// Asynchronous `pwrite`: resolves with the byte count written from
/// `buffer`. An `offset` of -1 writes at the descriptor's current position.
pub fn write(
    context: Option<&AioContext>,
    fd: RawFd,
    buffer: Buffer,
    count: usize,
    offset: i64,
) -> Future {
    submit(
        context,
        AioState {
            op: AioOp::Write,
            fd,
            buffer,
            count,
            offset,
            pool_result: Mutex::new(None),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_round_trip() {
        let buf = Buffer::from_vec(vec![1, 2, 3]);
        assert_eq!(buf.len(), 3);
        buf.with_mut(|data| data[0] = 9);
        assert_eq!(buf.with(|data| data[0]), 9);
        let alias = buf.clone();
        assert_eq!(alias.with(|data| data.to_vec()), vec![9, 2, 3]);
    }
}
