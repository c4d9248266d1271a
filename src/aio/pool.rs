//! Thread-pool AIO backend: synchronous positioned syscalls on a shared
//! pool of worker threads. The fallback never blocks the calling thread;
//! workers push completed futures onto the owning context and wake its
//! loop, whose dispatch resolves them.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use super::{complete_aio, AioOp, AioState};
use crate::future::{FutureCell, Variant};
use crate::mainloop::{Dispatch, MainContext, Prepare, Source, PRIORITY_DEFAULT};

const N_IO_WORKERS: usize = 8;

struct Job {
    cell: Arc<FutureCell>,
    ctx: Arc<PoolContext>,
}

fn job_sender() -> &'static flume::Sender<Job> {
    static SENDER: OnceLock<flume::Sender<Job>> = OnceLock::new();
    SENDER.get_or_init(|| {
        let (tx, rx) = flume::unbounded::<Job>();
        for _ in 0..N_IO_WORKERS {
            let rx = rx.clone();
            std::thread::Builder::new()
                .name("weft-aio-worker".into())
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        run_job(job);
                    }
                })
                .expect("failed to spawn AIO worker thread");
        }
        tx
    })
}

fn run_job(job: Job) {
    let state = match &job.cell.variant {
        Variant::Aio(state) => state,
        _ => unreachable!("AIO job for a non-AIO future"),
    };

    let res = unsafe {
        match (state.op, state.offset >= 0) {
            (AioOp::Read, true) => libc::pread(
                state.fd,
                state.buffer.ptr() as *mut libc::c_void,
                state.count,
                state.offset,
            ),
            (AioOp::Read, false) => libc::read(
                state.fd,
                state.buffer.ptr() as *mut libc::c_void,
                state.count,
            ),
            (AioOp::Write, true) => libc::pwrite(
                state.fd,
                state.buffer.ptr() as *const libc::c_void,
                state.count,
                state.offset,
            ),
            (AioOp::Write, false) => libc::write(
                state.fd,
                state.buffer.ptr() as *const libc::c_void,
                state.count,
            ),
        }
    };
    let errno = if res < 0 {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
    } else {
        0
    };
    *state.pool_result.lock() = Some((res as i64, errno));

    job.ctx.completed.lock().push_back(Arc::clone(&job.cell));
    job.ctx.context.wakeup();
}

pub(crate) struct PoolContext {
    completed: Mutex<VecDeque<Arc<FutureCell>>>,
    context: MainContext,
}

impl PoolContext {
    pub(crate) fn create(context: &MainContext) -> Arc<PoolContext> {
        let ctx = Arc::new(PoolContext {
            completed: Mutex::new(VecDeque::new()),
            context: context.clone(),
        });
        context.attach(
            PRIORITY_DEFAULT,
            Box::new(PoolSource {
                ctx: Arc::downgrade(&ctx),
            }),
        );
        ctx
    }

    pub(crate) fn queue(self: &Arc<PoolContext>, cell: Arc<FutureCell>) {
        let job = Job {
            cell,
            ctx: Arc::clone(self),
        };
        job_sender()
            .send(job)
            .expect("AIO worker pool is unavailable");
    }
}

struct PoolSource {
    ctx: Weak<PoolContext>,
}

impl Source for PoolSource {
    fn prepare(&self) -> Prepare {
        match self.ctx.upgrade() {
            Some(ctx) if !ctx.completed.lock().is_empty() => Prepare::ready(),
            _ => Prepare::wait(),
        }
    }

    fn check(&self) -> bool {
        self.ctx
            .upgrade()
            .map_or(false, |ctx| !ctx.completed.lock().is_empty())
    }

    fn dispatch(&self) -> Dispatch {
        let ctx = match self.ctx.upgrade() {
            Some(ctx) => ctx,
            None => return Dispatch::Remove,
        };
        let completed = std::mem::take(&mut *ctx.completed.lock());
        for cell in completed {
            let result = match &cell.variant {
                Variant::Aio(state) => state.pool_result.lock().take(),
                _ => None,
            };
            if let Some((res, errno)) = result {
                complete_aio(&cell, res, errno);
            }
        }
        Dispatch::Continue
    }
}
