//! Fiber stack allocation.
//!
//! Stacks are anonymous private mappings rounded up to a whole number of
//! pages, with one extra inaccessible page at the low end so that an
//! overflow faults instead of silently corrupting the neighbouring
//! allocation.

#![cfg(unix)]

use std::ptr;
use std::sync::OnceLock;

fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

pub(crate) struct Stack {
    base: *mut u8,
    mapped: usize,
}

unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Maps a stack of at least `size` usable bytes plus a guard page.
    ///
    /// # Panics
    ///
    /// Panics if the mapping cannot be established; a runtime that cannot
    /// allocate a fiber stack cannot make progress.
    pub(crate) fn new(size: usize) -> Stack {
        let page = page_size();
        let size = (size.max(page) + page - 1) / page * page;
        let mapped = size + page;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        assert!(base != libc::MAP_FAILED, "mmap of fiber stack failed");
        let rc = unsafe { libc::mprotect(base, page, libc::PROT_NONE) };
        assert_eq!(rc, 0, "mprotect of fiber guard page failed");
        Stack {
            base: base as *mut u8,
            mapped,
        }
    }

    /// Highest address of the usable region; stacks grow down from here.
    pub(crate) fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.mapped) }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.mapped);
        }
    }
}
