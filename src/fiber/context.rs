//! Machine-context switching via `ucontext`.
//!
//! `makecontext` only passes `int` arguments, so a pointer is split into
//! two 32-bit halves and reassembled inside the trampoline.

use std::cell::UnsafeCell;

use super::stack::Stack;

/// Storage for a saved register file and stack pointer.
///
/// The box keeps the `ucontext_t` at a stable address regardless of any
/// alignment the allocator of the surrounding structure would guarantee.
pub(crate) struct FiberContext {
    ctx: Box<UnsafeCell<libc::ucontext_t>>,
}

// Only the thread driving the owning fiber scheduler ever touches the
// context, and never concurrently with a switch.
unsafe impl Send for FiberContext {}
unsafe impl Sync for FiberContext {}

pub(crate) type StartFn = extern "C" fn(u32, u32);

impl FiberContext {
    pub(crate) fn empty() -> FiberContext {
        FiberContext {
            ctx: Box::new(UnsafeCell::new(unsafe { std::mem::zeroed() })),
        }
    }

    pub(crate) fn ucp(&self) -> *mut libc::ucontext_t {
        self.ctx.get()
    }

    /// Prepares the context to enter `start(hi, lo)` on `stack`.
    pub(crate) fn init(&self, stack: &Stack, start: StartFn, arg: usize) {
        unsafe {
            let ucp = self.ctx.get();
            libc::getcontext(ucp);
            (*ucp).uc_stack.ss_sp = stack.usable_ptr() as *mut libc::c_void;
            (*ucp).uc_stack.ss_size = stack.size();
            (*ucp).uc_link = std::ptr::null_mut();

            let hi = ((arg as u64) >> 32) as libc::c_int;
            let lo = (arg as u64 & 0xFFFF_FFFF) as libc::c_int;
            let start: extern "C" fn() = std::mem::transmute(start);
            libc::makecontext(ucp, start, 2, hi, lo);
        }
    }
}

/// Splices two halves back into a pointer-sized value.
pub(crate) fn join_args(hi: u32, lo: u32) -> usize {
    (((hi as u64) << 32) | lo as u64) as usize
}

/// Saves the current context into `from` and activates `to`.
///
/// # Safety
///
/// Both contexts must be initialized, `to` must not be executing, and the
/// call must happen on the thread that owns both stacks.
pub(crate) unsafe fn switch(from: *mut libc::ucontext_t, to: *mut libc::ucontext_t) {
    libc::swapcontext(from, to);
}
