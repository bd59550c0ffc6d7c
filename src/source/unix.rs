use core::ptr::{self, NonNull};

use super::MemorySource;
use crate::Init;

/// A [`MemorySource`] backed by anonymous `mmap` mappings.
///
/// Reservations are mapped `PROT_NONE` and become accessible as they are
/// committed.
#[derive(Debug, Clone, Copy)]
pub struct MmapSource {
    prot: libc::c_int,
}

impl Init for MmapSource {
    const INIT: Self = Self::new();
}

impl Default for MmapSource {
    fn default() -> Self {
        Self::INIT
    }
}

impl MmapSource {
    /// Committed memory is readable and writable.
    pub const fn new() -> Self {
        Self {
            prot: libc::PROT_READ | libc::PROT_WRITE,
        }
    }

    /// Committed memory is also executable, for heaps holding generated
    /// machine code. Some platforms refuse writable and executable mappings.
    pub const fn executable() -> Self {
        Self {
            prot: libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        }
    }
}

/// The system's memory page size.
#[inline]
fn page_size() -> usize {
    // Safety: `sysconf` has no preconditions
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size > 0 && (page_size as usize).is_power_of_two() {
        page_size as usize
    } else {
        // Such a page size is quite unusual.
        4096
    }
}

unsafe impl MemorySource for MmapSource {
    unsafe fn reserve(&mut self, size: usize) -> Option<NonNull<u8>> {
        let ptr = libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            log::debug!("mmap({}) failed", size);
            return None;
        }

        NonNull::new(ptr as *mut u8)
    }

    unsafe fn commit(&mut self, start: NonNull<u8>, len: usize) -> bool {
        if len == 0 {
            return true;
        }
        let result = libc::mprotect(start.as_ptr() as *mut libc::c_void, len, self.prot);
        if result != 0 {
            log::debug!("mprotect({:p}, {}) failed", start, len);
        }
        result == 0
    }

    unsafe fn release(&mut self, start: NonNull<u8>, size: usize) {
        let result = libc::munmap(start.as_ptr() as *mut libc::c_void, size);
        debug_assert_eq!(result, 0);
    }

    #[inline]
    fn page_size(&self) -> usize {
        page_size()
    }
}
