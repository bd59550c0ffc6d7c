//! A code heap shared between threads
use core::{
    fmt, ops,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{heap::CodeHeap, segmap::SegmentMap, source::MemorySource};

/// A [`CodeHeap`] behind a mutex, with address lookups that bypass it.
///
/// Mutations go through [`Self::lock`]. [`Self::find_block_start`] and
/// [`Self::contains`] never block, so they are usable from contexts such as
/// stack walkers that cannot wait for the lock.
///
/// # Examples
///
/// ```
/// use codeheap::{CodeHeap, HeapConfig, LockedCodeHeap};
///
/// let heap = CodeHeap::with_default_source(1 << 20, 1 << 16, HeapConfig::default()).unwrap();
/// let heap = LockedCodeHeap::new(heap);
///
/// let ptr = heap.lock().allocate(100).unwrap();
/// let inner = unsafe { ptr.as_ptr().add(50) };
/// assert_eq!(heap.find_block_start(inner), Some(ptr));
///
/// unsafe { heap.lock().deallocate(ptr) };
/// assert_eq!(heap.lock().find_start(inner), None);
/// ```
pub struct LockedCodeHeap<S: MemorySource> {
    view: SegmapView,
    heap: Mutex<CodeHeap<S>>,
}

/// The parts of a heap needed to resolve addresses without its lock.
struct SegmapView {
    memory_low: usize,
    segmap_low: NonNull<u8>,
    log2_segment_size: u32,
    /// Published when a [`LockGuard`] is released. It only ever grows.
    committed_segments: AtomicUsize,
}

// Safety: `segmap_low` points to memory owned by the heap this view was made
//         for, which outlives the view. It is only accessed through atomics.
unsafe impl Send for SegmapView {}
unsafe impl Sync for SegmapView {}

impl<S: MemorySource> LockedCodeHeap<S> {
    pub fn new(heap: CodeHeap<S>) -> Self {
        let (memory_low, segmap_low, log2_segment_size) = heap.segmap_parts();
        Self {
            view: SegmapView {
                memory_low,
                segmap_low,
                log2_segment_size,
                committed_segments: AtomicUsize::new(heap.committed_segments()),
            },
            heap: Mutex::new(heap),
        }
    }

    /// Acquire exclusive access to the heap.
    ///
    /// A poisoned lock is recovered.
    pub fn lock(&self) -> LockGuard<'_, S> {
        LockGuard {
            view: &self.view,
            guard: self.heap.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    pub fn into_inner(self) -> CodeHeap<S> {
        self.heap.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check whether `addr` lies in the committed block storage, as of the
    /// last release of the lock.
    pub fn contains(&self, addr: *const u8) -> bool {
        let committed_segments = self.view.committed_segments.load(Ordering::Acquire);
        self.view.segment_for(addr, committed_segments).is_some()
    }

    /// Find the start of the allocated space of the block containing `addr`
    /// without taking the lock.
    ///
    /// Unlike [`CodeHeap::find_start`], this does not tell used and free
    /// blocks apart, and the result may be stale by the time it is returned
    /// if another thread holds the lock. It is exact for blocks that stay
    /// allocated for the duration of the call.
    pub fn find_block_start(&self, addr: *const u8) -> Option<NonNull<u8>> {
        self.view.find_block_start(addr)
    }
}

impl SegmapView {
    #[inline]
    fn segment_for(&self, addr: *const u8, committed_segments: usize) -> Option<usize> {
        let offset = (addr as usize).checked_sub(self.memory_low)?;
        let index = offset >> self.log2_segment_size;
        if index < committed_segments {
            Some(index)
        } else {
            None
        }
    }

    fn find_block_start(&self, addr: *const u8) -> Option<NonNull<u8>> {
        let committed_segments = self.committed_segments.load(Ordering::Acquire);
        let index = self.segment_for(addr, committed_segments)?;

        // Safety: The first `committed_segments` entries have been
        //         initialized and published by a `LockGuard`
        let map = unsafe { SegmentMap::from_raw(self.segmap_low, committed_segments) };
        let start = map.find_block_start(index)?;
        let hdr = self.memory_low + (start << self.log2_segment_size);
        NonNull::new((hdr + crate::HEADER_SIZE) as *mut u8)
    }
}

impl<S: MemorySource + fmt::Debug> fmt::Debug for LockedCodeHeap<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.heap.try_lock() {
            Ok(heap) => f.debug_tuple("LockedCodeHeap").field(&*heap).finish(),
            Err(_) => f.write_str("LockedCodeHeap(<locked>)"),
        }
    }
}

/// Exclusive access to a [`LockedCodeHeap`]'s heap. Growth becomes visible
/// to lock-free lookups when the guard is dropped.
pub struct LockGuard<'a, S: MemorySource> {
    view: &'a SegmapView,
    guard: MutexGuard<'a, CodeHeap<S>>,
}

impl<S: MemorySource> ops::Deref for LockGuard<'_, S> {
    type Target = CodeHeap<S>;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<S: MemorySource> ops::DerefMut for LockGuard<'_, S> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl<S: MemorySource> Drop for LockGuard<'_, S> {
    #[inline]
    fn drop(&mut self) {
        self.view
            .committed_segments
            .store(self.guard.committed_segments(), Ordering::Release);
    }
}
