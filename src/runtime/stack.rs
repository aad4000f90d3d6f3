//! Coroutine stack memory.

use std::{ffi, io, ptr};

/// Number of `PROT_NONE` pages below the usable region.
const GUARD_PAGES: usize = 1;

/// A private, mmap-allocated coroutine stack.
///
/// Demand paging ensures physical memory is committed only as the stack
/// grows. A guard page below the usable region turns overflow into a fault
/// instead of silent corruption.
#[derive(Debug)]
pub(super) struct Stack {
    pointer: *mut u8,
    length: usize,
}

impl Stack {
    /// Allocates a stack with at least `size` usable bytes, rounded up to
    /// whole pages (minimum one page).
    pub(super) fn new(size: usize) -> io::Result<Self> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };

        let usable_pages = size.div_ceil(page_size).max(1);
        let length = (GUARD_PAGES + usable_pages) * page_size;

        // kernel hands out an unused block of virtual memory
        let pointer = unsafe {
            libc::mmap(
                ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if pointer == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // if guarding goes wrong the mapping is cleaned up in Stack's drop
        let stack = Stack {
            pointer: pointer as *mut u8,
            length,
        };

        // lowest addresses, since the stack grows downward
        let result = unsafe { libc::mprotect(pointer, GUARD_PAGES * page_size, libc::PROT_NONE) };
        if result == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(stack)
    }

    /// Upper end of the mapping; the initial stack pointer is carved from here.
    pub(super) fn base(&self) -> *mut u8 {
        // safety: part of the same allocation, can't overflow
        unsafe { self.pointer.add(self.length) }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let result = unsafe { libc::munmap(self.pointer as *mut ffi::c_void, self.length) };
        assert_eq!(result, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_and_writes() {
        let stack = Stack::new(4096).unwrap();
        unsafe {
            let pointer = stack.base().sub(1);
            pointer.write(123);
            assert_eq!(pointer.read(), 123);
        }
    }

    #[test]
    fn rounds_up_to_whole_pages() {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };

        let stack = Stack::new(1).unwrap();

        assert_eq!(stack.length % page_size, 0);
        assert_eq!(stack.length, (GUARD_PAGES + 1) * page_size);
    }

    #[test]
    fn zero_size_still_gets_a_page() {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };

        let stack = Stack::new(0).unwrap();

        assert!(stack.length >= (GUARD_PAGES + 1) * page_size);
    }

    #[test]
    #[ignore = "aborts process"] // TODO: test with fork()
    fn overflow() {
        let stack = Stack::new(4096).unwrap();
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        unsafe {
            let pointer = stack.base().sub(page_size + 1);
            pointer.write(123);
        }
    }
}
