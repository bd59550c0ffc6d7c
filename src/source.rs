//! Providers of reserved and committed address ranges
use core::{alloc::Layout, fmt, ptr::NonNull};

use crate::Init;

/// The virtual-memory services a [`CodeHeap`](crate::CodeHeap) consumes.
///
/// A heap reserves its whole address range up front and commits it
/// piecewise as it grows. Reserved-but-uncommitted memory is never touched.
///
/// # Safety
///
/// Implementations must uphold the following:
///
///  - A range returned by `reserve` is aligned to `page_size()` bytes and
///    does not overlap any other live reservation.
///  - Once `commit` returns `true` for a range, the range stays readable and
///    writable until it is released.
///  - `page_size` returns the same power of two for the source's lifetime.
///
pub unsafe trait MemorySource {
    /// Reserve `size` bytes of address space without committing any of it.
    /// `size` is a multiple of `page_size()`.
    ///
    /// Returns `None` if the address space could not be reserved.
    ///
    /// # Safety
    ///
    /// `size` must not be zero.
    unsafe fn reserve(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// Commit `len` bytes starting at `start`, making them readable and
    /// writable. Returns `false` on failure, in which case the range stays
    /// uncommitted.
    ///
    /// # Safety
    ///
    /// `start..start + len` must be page-aligned and lie inside a live
    /// reservation made by `self`.
    unsafe fn commit(&mut self, start: NonNull<u8>, len: usize) -> bool;

    /// Give back a whole reservation.
    ///
    /// # Safety
    ///
    /// `start` and `size` must describe a live reservation made by `self`.
    /// Nothing in the range may be accessed afterwards.
    unsafe fn release(&mut self, start: NonNull<u8>, size: usize);

    /// The commit granularity in bytes.
    fn page_size(&self) -> usize;
}

/// Wraps a [`core::alloc::GlobalAlloc`] so that it can be used as a
/// [`MemorySource`].
///
/// A reservation is a single allocation aligned to `PAGE_SIZE` bytes;
/// committing is pure bookkeeping. `PAGE_SIZE` must be a power of two.
#[derive(Default)]
pub struct GlobalAllocSource<T, const PAGE_SIZE: usize>(pub T);

impl<T: Init, const PAGE_SIZE: usize> Init for GlobalAllocSource<T, PAGE_SIZE> {
    const INIT: Self = Self(Init::INIT);
}

impl<T, const PAGE_SIZE: usize> fmt::Debug for GlobalAllocSource<T, PAGE_SIZE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalAllocSource")
            .field("page_size", &PAGE_SIZE)
            .finish()
    }
}

impl<T, const PAGE_SIZE: usize> GlobalAllocSource<T, PAGE_SIZE> {
    const PAGE_SIZE_IS_VALID: () = {
        if !PAGE_SIZE.is_power_of_two() {
            panic!("`PAGE_SIZE` must be a power of two");
        }
    };
}

unsafe impl<T: core::alloc::GlobalAlloc, const PAGE_SIZE: usize> MemorySource
    for GlobalAllocSource<T, PAGE_SIZE>
{
    #[inline]
    unsafe fn reserve(&mut self, size: usize) -> Option<NonNull<u8>> {
        let () = Self::PAGE_SIZE_IS_VALID;
        let layout = Layout::from_size_align(size, PAGE_SIZE).ok()?;
        NonNull::new(self.0.alloc(layout))
    }

    #[inline]
    unsafe fn commit(&mut self, _start: NonNull<u8>, _len: usize) -> bool {
        true
    }

    #[inline]
    unsafe fn release(&mut self, start: NonNull<u8>, size: usize) {
        // Safety: This layout was accepted by `reserve`
        let layout = Layout::from_size_align_unchecked(size, PAGE_SIZE);
        self.0.dealloc(start.as_ptr(), layout);
    }

    #[inline]
    fn page_size(&self) -> usize {
        PAGE_SIZE
    }
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use self::unix::MmapSource;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// The memory source used by [`CodeHeap::with_default_source`](crate::CodeHeap::with_default_source).
        pub type DefaultSource = MmapSource;
    } else if #[cfg(feature = "std")] {
        /// The memory source used by [`CodeHeap::with_default_source`](crate::CodeHeap::with_default_source).
        pub type DefaultSource = GlobalAllocSource<std::alloc::System, 4096>;
    }
}
