//! Guarded, page-aligned fiber stacks with pooled reuse.

use std::ptr;
use std::sync::OnceLock;

/// Default usable stack size; small enough to pool freely, large enough for
/// formatting and recursion-light workloads.
pub(crate) const DEFAULT_STACK_SIZE: usize = 128 * 1024;

const DEFAULT_MIN_POOL: usize = 4;
const DEFAULT_MAX_POOL: usize = 16;

pub(crate) fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

/// A separately mapped stack of `size + page_size` bytes with a guard page
/// at the growth end (the low end on downward-growing architectures).
pub(crate) struct Stack {
    base: *mut u8,
    usable: *mut u8,
    size: usize,
    map_len: usize,
}

unsafe impl Send for Stack {}

impl Stack {
    pub(crate) fn new(size: usize) -> Stack {
        let page = page_size();
        let mut size = if size == 0 { DEFAULT_STACK_SIZE } else { size };
        if size & (page - 1) != 0 {
            size = (size + page) & !(page - 1);
        }

        let map_len = size + page;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            // Stack allocation failure is unrecoverable.
            panic!(
                "failed to allocate fiber stack: {}",
                std::io::Error::last_os_error()
            );
        }
        let base = base as *mut u8;

        // The stack grows down, so the guard page sits at the low end.
        let rc = unsafe { libc::mprotect(base as *mut libc::c_void, page, libc::PROT_NONE) };
        if rc != 0 {
            panic!(
                "failed to protect stack guard page: {}",
                std::io::Error::last_os_error()
            );
        }

        Stack {
            base,
            usable: unsafe { base.add(page) },
            size,
            map_len,
        }
    }

    pub(crate) fn usable_ptr(&self) -> *mut u8 {
        self.usable
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Advises the kernel the pages are no longer needed.
    pub(crate) fn mark_unused(&self) {
        unsafe {
            libc::madvise(
                self.usable as *mut libc::c_void,
                self.size,
                libc::MADV_DONTNEED,
            );
        }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.map_len);
        }
    }
}

/// Keeps `min..=max` stacks of the pool's size around for reuse.
pub(crate) struct StackPool {
    stacks: Vec<Stack>,
    stack_size: usize,
    max_pool: usize,
}

impl StackPool {
    pub(crate) fn new(stack_size: usize, min_pool: usize, max_pool: usize) -> StackPool {
        let stack_size = if stack_size == 0 {
            DEFAULT_STACK_SIZE
        } else {
            stack_size
        };
        let mut pool = StackPool {
            stacks: Vec::new(),
            stack_size,
            max_pool,
        };
        for _ in 0..min_pool {
            pool.stacks.push(Stack::new(stack_size));
        }
        pool
    }

    pub(crate) fn with_defaults() -> StackPool {
        StackPool::new(0, DEFAULT_MIN_POOL, DEFAULT_MAX_POOL)
    }

    /// Takes a pooled stack, or maps a new one on miss. Requests for a
    /// non-default size bypass the pool.
    pub(crate) fn acquire(&mut self, size: usize) -> Stack {
        if size == 0 || size == self.stack_size {
            if let Some(stack) = self.stacks.pop() {
                return stack;
            }
            return Stack::new(self.stack_size);
        }
        Stack::new(size)
    }

    /// Returns a stack; dropped outright when over capacity or odd-sized.
    pub(crate) fn release(&mut self, stack: Stack) {
        if stack.size() == self.stack_size && self.stacks.len() < self.max_pool {
            stack.mark_unused();
            self.stacks.push(stack);
        }
    }
}
