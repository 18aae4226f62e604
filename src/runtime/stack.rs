//! Owned stack memory for execution contexts.

use std::{ffi, fmt, io, ptr};

use crate::Error;

/// Memory region that a context executes on, exclusively owned by that context.
///
/// Demand paging ensures that physical memory is allocated only as necessary, during a page fault.
/// The stack is protected from overflow using a guard page.
pub struct Stack {
    pointer: *mut u8,
    length: usize,
    guard: usize,
}

impl Stack {
    /// Allocates a stack with at least [size] usable bytes, rounded up to whole pages.
    pub fn new(size: usize) -> crate::Result<Self> {
        if size == 0 {
            return Err(Error::InvalidParameter("stack size must be positive"));
        }

        let page_size = page_size();
        let usable_pages = size.div_ceil(page_size);
        let stack = Stack::with_pages(1, usable_pages, page_size)?;
        Ok(stack)
    }

    fn with_pages(guard_pages: usize, usable_pages: usize, page_size: usize) -> io::Result<Self> {
        let guard = guard_pages * page_size;
        let length = usable_pages
            .checked_mul(page_size)
            .and_then(|usable| usable.checked_add(guard))
            .ok_or(io::ErrorKind::OutOfMemory)?;

        // kernel allocates an unused block of virtual memory
        let pointer = unsafe {
            libc::mmap(
                ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if pointer == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // if guarding memory goes wrong then mmap gets cleaned up in Stack's drop
        let stack = Stack {
            pointer: pointer as *mut u8,
            length,
            guard,
        };

        // located at the lowest addresses since the stack grows downward
        let result = unsafe { libc::mprotect(pointer, guard, libc::PROT_NONE) };
        if result == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(stack)
    }

    /// Number of usable bytes, excluding the guard page.
    pub fn len(&self) -> usize {
        self.length - self.guard
    }

    /// Upper address of the stack memory, stack addresses grow downwards.
    pub(super) fn base(&self) -> *mut u8 {
        // safety: part of same allocation, can't overflow
        unsafe { self.pointer.add(self.length) }
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("base", &self.base())
            .field("len", &self.len())
            .finish()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let result = unsafe { libc::munmap(self.pointer as *mut ffi::c_void, self.length) };
        assert_eq!(result, 0);
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_and_writes() {
        let stack = Stack::new(1).unwrap();
        unsafe {
            let pointer = stack.base().sub(1);
            pointer.write(123);
            assert_eq!(pointer.read(), 123);
        }
    }

    #[test]
    fn rounds_up_to_whole_pages() {
        let stack = Stack::new(page_size() + 1).unwrap();

        assert_eq!(stack.len(), 2 * page_size());
    }

    #[test]
    fn base_is_aligned() {
        let stack = Stack::new(10_000).unwrap();

        assert_eq!(stack.base() as usize % 16, 0);
    }

    #[test]
    fn rejects_empty_stack() {
        let result = Stack::new(0);

        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn reports_exhausted_address_space() {
        let result = Stack::new(usize::MAX / 2);

        assert!(matches!(result, Err(Error::ResourceExhausted(_))));
    }

    #[test]
    #[ignore = "aborts process"]
    fn overflow() {
        let stack = Stack::new(1).unwrap();
        unsafe {
            let pointer = stack.base().sub(page_size() + 1);
            pointer.write(123);
        }
    }
}
