//! The code heap allocator
use core::{fmt, ptr::NonNull};

use crate::{
    block::{Block, BlockHdr, HEADER_SIZE},
    config::HeapConfig,
    segmap::SegmentMap,
    segment::Segments,
    source::MemorySource,
    space::VirtualSpace,
    utils::{align_up, checked_align_up},
};

mod defrag;
mod freelist;
mod verify;

pub use self::freelist::FreeBlocks;

/// The byte pattern written over the bodies of free blocks when
/// [`HeapConfig::zap_free_blocks`] is set.
pub const ZAP_FREE: u8 = 0xcc;

#[doc = svgbobdoc::transform!(
/// A heap of variable-length, segment-aligned blocks for generated code.
///
/// # Memory Layout
///
/// <center>
/// ```svgbob
///   low_boundary                      next_segment          high       high_boundary
///   |                                      |                  |              |
///   v                                      v                  v              v
///   +--------+--------+------+--------+----+------------------+- - - - - - - +
///   |  used  |  free  | used |  free  |used|    bump region   : uncommitted  :
///   +--------+--------+------+--------+----+------------------+- - - - - - - +
///             ^    |          ^
///   freelist -'    '----------'
/// ```
/// </center>
///
/// Blocks are carved from the bump region in address order and never given
/// back to it. Freed blocks go to an address-ordered free list whose
/// physically adjacent entries are always merged. A byte-per-segment map
/// (see `SegmentMap`) lets [`Self::find_block_for`] resolve any interior
/// address to its block in a bounded number of steps.
///
/// # Locking
///
/// Methods taking `&mut self` must be serialized by the caller. Lookups take
/// `&self`; [`LockedCodeHeap`](crate::LockedCodeHeap) additionally offers
/// lookups that bypass the lock entirely.
)]
#[derive(Debug)]
pub struct CodeHeap<S: MemorySource> {
    source: S,
    config: HeapConfig,
    memory: VirtualSpace,
    segmap: VirtualSpace,
    segments: Segments,
    committed_segments: usize,
    reserved_segments: usize,
    /// The high-water mark of carved segments.
    next_segment: usize,
    freelist: Option<NonNull<BlockHdr>>,
    /// A segment of the free block the last insertion started from. It may
    /// have been merged away or reallocated since.
    last_insert_point: Option<usize>,
    freelist_length: usize,
    freelist_segments: usize,
    blob_count: usize,
    fragmentation_count: usize,
    max_allocated_capacity: usize,
}

// Safety: All block headers referenced by a `CodeHeap` live in memory
//         owned by that `CodeHeap`. Shared access only reads them, and the
//         segment map is only accessed through atomics.
unsafe impl<S: MemorySource + Send> Send for CodeHeap<S> {}
unsafe impl<S: MemorySource + Sync> Sync for CodeHeap<S> {}

/// The error type for [`CodeHeap::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveError {
    /// The parameters are unusable.
    InvalidConfig(&'static str),
    /// The memory source could not reserve the address space.
    ReserveFailed,
    /// The memory source could not commit the initial capacity.
    CommitFailed,
}

impl fmt::Display for ReserveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(reason) => write!(f, "invalid code heap configuration: {}", reason),
            Self::ReserveFailed => f.write_str("could not reserve address space"),
            Self::CommitFailed => f.write_str("could not commit the initial capacity"),
        }
    }
}

/// The error type for [`CodeHeap::expand_by`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpandError {
    /// The growth does not fit in the remaining reservation.
    ExceedsReservation,
    /// The memory source could not commit more memory.
    CommitFailed,
}

impl fmt::Display for ExpandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExceedsReservation => f.write_str("code heap reservation exhausted"),
            Self::CommitFailed => f.write_str("could not commit code heap memory"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ReserveError {}

#[cfg(feature = "std")]
impl std::error::Error for ExpandError {}

cfg_if::cfg_if! {
    if #[cfg(any(unix, feature = "std"))] {
        impl CodeHeap<crate::DefaultSource> {
            /// Reserve a heap using the platform's default memory source.
            pub fn with_default_source(
                reserved_size: usize,
                committed_size: usize,
                config: HeapConfig,
            ) -> Result<Self, ReserveError> {
                Self::reserve(crate::Init::INIT, reserved_size, committed_size, config)
            }
        }
    }
}

impl<S: MemorySource> CodeHeap<S> {
    /// Reserve `reserved_size` bytes of block storage through `source` and
    /// commit the first `committed_size` bytes of it. Both are rounded up to
    /// the source's page size.
    ///
    /// The segment map is reserved for the whole reservation at once, so
    /// growing the heap never moves it.
    pub fn reserve(
        mut source: S,
        reserved_size: usize,
        committed_size: usize,
        config: HeapConfig,
    ) -> Result<Self, ReserveError> {
        config.validate().map_err(ReserveError::InvalidConfig)?;

        let page_size = source.page_size();
        if config.segment_size > page_size {
            return Err(ReserveError::InvalidConfig(
                "segment_size must not exceed the page size",
            ));
        }
        if reserved_size == 0 {
            return Err(ReserveError::InvalidConfig("reserved size must not be zero"));
        }
        if committed_size > reserved_size {
            return Err(ReserveError::InvalidConfig(
                "committed size must not exceed the reserved size",
            ));
        }
        let reserved_size = checked_align_up(reserved_size, page_size)
            .ok_or(ReserveError::InvalidConfig("reserved size is too large"))?;
        let committed_size = align_up(committed_size, page_size);

        let memory = VirtualSpace::reserve(&mut source, reserved_size, committed_size)?;
        let segments = Segments::new(memory.low(), config.segment_size);
        let reserved_segments = segments.size_to_segments(reserved_size);
        let committed_segments = segments.size_to_segments(committed_size);

        let segmap = match VirtualSpace::reserve(
            &mut source,
            align_up(reserved_segments, page_size),
            align_up(committed_segments, page_size),
        ) {
            Ok(segmap) => segmap,
            Err(e) => {
                // Safety: `memory` was reserved from `source` just now
                unsafe { memory.release(&mut source) };
                return Err(e);
            }
        };

        let this = Self {
            source,
            config,
            memory,
            segmap,
            segments,
            committed_segments,
            reserved_segments,
            next_segment: 0,
            freelist: None,
            last_insert_point: None,
            freelist_length: 0,
            freelist_segments: 0,
            blob_count: 0,
            fragmentation_count: 0,
            max_allocated_capacity: 0,
        };
        this.segmap().mark_range_as_free(0, committed_segments);

        log::debug!(
            "reserved code heap at {:p}: {} bytes reserved, {} committed, {}-byte segments",
            this.memory.low(),
            reserved_size,
            committed_size,
            config.segment_size
        );
        Ok(this)
    }

    /// Commit at least `size` more bytes, rounded up to the page size.
    ///
    /// On failure, the heap's capacity is unchanged.
    pub fn expand_by(&mut self, size: usize) -> Result<(), ExpandError> {
        let page_size = self.source.page_size();
        let committed = self.memory.committed_size();
        let new_committed = committed
            .checked_add(size)
            .and_then(|x| checked_align_up(x, page_size))
            .ok_or(ExpandError::ExceedsReservation)?;
        let dm = new_committed - committed;
        if dm == 0 {
            return Ok(());
        }
        if dm > self.memory.uncommitted() {
            return Err(ExpandError::ExceedsReservation);
        }

        // Grow the segment map first so that a failure leaves the block
        // storage and the segment count untouched. The map may already be
        // ahead of the block storage if an earlier attempt failed halfway.
        let new_committed_segments = self.segments.size_to_segments(new_committed);
        let ds = align_up(new_committed_segments, page_size)
            .saturating_sub(self.segmap.committed_size());
        if !self.segmap.expand_by(&mut self.source, ds) {
            return Err(ExpandError::CommitFailed);
        }
        if !self.memory.expand_by(&mut self.source, dm) {
            return Err(ExpandError::CommitFailed);
        }

        let old_committed_segments = self.committed_segments;
        self.committed_segments = new_committed_segments;
        self.segmap()
            .mark_range_as_free(old_committed_segments, new_committed_segments);

        log::debug!(
            "expanded code heap at {:p} by {} bytes to {}",
            self.memory.low(),
            dm,
            self.memory.committed_size()
        );
        Ok(())
    }

    /// Attempt to allocate a block with at least `size` bytes of allocated
    /// space.
    ///
    /// Returns the start of the allocated space on success. `None` means
    /// the committed capacity is exhausted; the caller may
    /// [`expand_by`](Self::expand_by) and retry.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let size = size.checked_add(HEADER_SIZE)?;
        let number_of_segments = checked_align_up(size, self.segments.segment_size())?
            >> self.segments.log2_segment_size();
        let number_of_segments = number_of_segments.max(self.config.min_block_segments);

        // First check if we can satisfy the request from the free list
        let block = if let Some(block) = self.search_freelist(number_of_segments) {
            block
        } else if number_of_segments <= self.committed_segments - self.next_segment {
            let beg = self.next_segment;
            self.mark_segmap_as_used(beg, beg + number_of_segments, false);
            let block = self.block_at(beg);
            // Safety: `block` is the first segment of untouched, committed
            //         memory owned by `self`
            unsafe {
                block.as_ptr().write(BlockHdr::Used {
                    length: number_of_segments,
                })
            };
            self.next_segment += number_of_segments;
            block
        } else {
            log::trace!("allocate({}): out of committed capacity", size - HEADER_SIZE);
            return None;
        };

        self.blob_count += 1;
        self.max_allocated_capacity = self.max_allocated_capacity.max(self.allocated_capacity());

        let ptr = BlockHdr::allocated_space(block);
        log::trace!(
            "allocate({}) = {:p} ({} segments)",
            size - HEADER_SIZE,
            ptr,
            number_of_segments
        );
        Some(ptr)
    }

    /// Deallocate a previously allocated block.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`Self::allocate`] on `self` and not
    /// deallocated since.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        debug_assert_eq!(
            self.find_start(ptr.as_ptr()),
            Some(ptr),
            "illegal deallocation"
        );
        let block = BlockHdr::from_allocated_space(ptr);
        log::trace!("deallocate({:p}) ({} segments)", ptr, block.as_ref().length());

        self.add_to_freelist(block);
        self.blob_count -= 1;
    }

    /// Shrink a previously allocated block to `used_size` bytes of
    /// allocated space, freeing the unused tail.
    ///
    /// Nothing happens if the tail would be shorter than the minimum block
    /// length.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`Self::allocate`] on `self` and not
    /// deallocated since. `used_size` must not exceed the size of the
    /// block's allocated space. Nothing past `used_size` may be accessed
    /// afterwards.
    pub unsafe fn deallocate_tail(&mut self, ptr: NonNull<u8>, used_size: usize) {
        debug_assert_eq!(
            self.find_start(ptr.as_ptr()),
            Some(ptr),
            "illegal deallocation"
        );
        let block = BlockHdr::from_allocated_space(ptr);

        let actual_segments = block.as_ref().length();
        let used_segments = self
            .segments
            .size_to_segments(used_size + HEADER_SIZE)
            .max(self.config.min_block_segments);
        debug_assert!(
            used_segments <= actual_segments,
            "used size exceeds the block"
        );

        if used_segments >= actual_segments
            || actual_segments - used_segments < self.config.min_block_segments
        {
            return;
        }

        log::trace!(
            "deallocate_tail({:p}, {}): {} -> {} segments",
            ptr,
            used_size,
            actual_segments,
            used_segments
        );
        let tail = self.split_block(block, used_segments);
        self.add_to_freelist(tail);
    }

    /// Split `block` into two blocks at `split_at` segments from its start
    /// and return the second one, which is marked used. The first one
    /// retains its state.
    ///
    /// # Safety
    ///
    /// `block` must be a block of `self`. Both parts must be at least
    /// `min_block_segments` long.
    pub(crate) unsafe fn split_block(
        &mut self,
        mut block: NonNull<BlockHdr>,
        split_at: usize,
    ) -> NonNull<BlockHdr> {
        let length = block.as_ref().length();
        debug_assert!(
            split_at >= self.config.min_block_segments
                && split_at + self.config.min_block_segments <= length,
            "split position {} out of range for a {}-segment block",
            split_at,
            length
        );

        let split_segment = self.segment_for_block(block) + split_at;
        let new_length = length - split_at;
        let new_block = self.block_at(split_segment);
        new_block.as_ptr().write(BlockHdr::Used { length: new_length });
        self.mark_segmap_as_used(split_segment, split_segment + new_length, false);
        block.as_mut().set_length(split_at);
        new_block
    }

    /// Update the segment map for a new block or a free block join. Joins
    /// are counted and trigger a defragmentation pass now and then.
    fn mark_segmap_as_used(&mut self, beg: usize, end: usize, is_join: bool) {
        self.segmap().mark_range_as_used(beg, end, is_join);

        if is_join && beg > 0 {
            self.fragmentation_count += 1;
            if self.fragmentation_count >= self.config.fragmentation_limit {
                self.defrag_segmap(true);
            }
        }
    }

    /// Overwrite `beg..end` except for its first `skip` bytes with
    /// [`ZAP_FREE`] if zapping is enabled.
    fn invalidate(&mut self, beg: usize, end: usize, skip: usize) {
        if !self.config.zap_free_blocks {
            return;
        }
        let start = self.segments.address_for(beg) + skip;
        let len = self.segments.segments_to_size(end - beg) - skip;
        // Safety: `beg..end` is part of a free block owned by `self`
        unsafe { (start as *mut u8).write_bytes(ZAP_FREE, len) };
    }

    #[inline]
    pub(crate) fn segmap(&self) -> SegmentMap<'_> {
        // Safety: The first `committed_segments` bytes of `segmap` are
        //         committed and initialized
        unsafe { SegmentMap::from_raw(self.segmap.low(), self.committed_segments) }
    }

    /// The addresses needed to read the segment map without `self`.
    #[cfg(feature = "std")]
    pub(crate) fn segmap_parts(&self) -> (usize, NonNull<u8>, u32) {
        (
            self.segments.low(),
            self.segmap.low(),
            self.segments.log2_segment_size(),
        )
    }

    #[inline]
    fn block_at(&self, index: usize) -> NonNull<BlockHdr> {
        debug_assert!(index < self.committed_segments);
        // Safety: Segment addresses are never null
        unsafe { NonNull::new_unchecked(self.segments.address_for(index) as *mut BlockHdr) }
    }

    #[inline]
    fn segment_for_block(&self, block: NonNull<BlockHdr>) -> usize {
        self.segments.segment_for(block.as_ptr() as usize)
    }

    /// The physically following block, or `None` if `block` is the last
    /// carved block.
    ///
    /// # Safety
    ///
    /// `block` must be a block of `self`.
    #[inline]
    unsafe fn following_block(&self, block: NonNull<BlockHdr>) -> Option<NonNull<BlockHdr>> {
        let index = self.segment_for_block(block) + block.as_ref().length();
        if index < self.next_segment {
            Some(self.block_at(index))
        } else {
            None
        }
    }

    /// Check whether `addr` lies in the committed block storage.
    #[inline]
    pub fn contains(&self, addr: *const u8) -> bool {
        let addr = addr as usize;
        self.segments.low() <= addr && addr < self.memory.high()
    }

    /// Find the block, used or free, containing `addr`.
    ///
    /// Returns `None` if `addr` is outside the heap or in a segment that
    /// has never been allocated.
    pub fn find_block_for(&self, addr: *const u8) -> Option<Block> {
        if !self.contains(addr) {
            return None;
        }
        let index = self.segments.segment_for(addr as usize);
        let start = self.segmap().find_block_start(index)?;
        // Safety: The segment map only leads to block headers
        Some(unsafe { Block::read(self.block_at(start), self.segment_size()) })
    }

    /// Find the start of the allocated space of the live block containing
    /// `addr`.
    ///
    /// Returns `None` if `addr` is not inside a used block.
    pub fn find_start(&self, addr: *const u8) -> Option<NonNull<u8>> {
        self.find_block_for(addr)
            .filter(|block| !block.is_free())
            .map(|block| block.allocated_space())
    }

    /// Iterate over every carved block in address order.
    pub fn blocks(&self) -> Blocks<'_, S> {
        Blocks {
            heap: self,
            next: 0,
        }
    }

    /// Iterate over the live blocks in address order.
    pub fn used_blocks(&self) -> impl Iterator<Item = Block> + '_ {
        self.blocks().filter(|block| !block.is_free())
    }

    /// The first carved block.
    pub fn first_block(&self) -> Option<Block> {
        self.blocks().next()
    }

    /// The block physically following `block`.
    ///
    /// `block` must have been obtained from `self` with no mutation since.
    pub fn next_block(&self, block: &Block) -> Option<Block> {
        self.blocks_after(block).next()
    }

    /// The first live block.
    pub fn first_used(&self) -> Option<Block> {
        self.used_blocks().next()
    }

    /// The first live block after `block`.
    ///
    /// `block` must have been obtained from `self` with no mutation since.
    pub fn next_used(&self, block: &Block) -> Option<Block> {
        self.blocks_after(block).find(|block| !block.is_free())
    }

    fn blocks_after(&self, block: &Block) -> Blocks<'_, S> {
        debug_assert!(self.contains(block.start().as_ptr()));
        Blocks {
            heap: self,
            next: self.segments.segment_for(block.start().as_ptr() as usize) + block.segments(),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    #[inline]
    pub fn segment_size(&self) -> usize {
        self.segments.segment_size()
    }

    /// The first byte of the block storage.
    #[inline]
    pub fn low_boundary(&self) -> *const u8 {
        self.memory.low().as_ptr()
    }

    /// The end of the committed block storage.
    #[inline]
    pub fn high(&self) -> *const u8 {
        self.memory.high() as *const u8
    }

    /// The end of the reserved block storage.
    #[inline]
    pub fn high_boundary(&self) -> *const u8 {
        self.memory.high_boundary() as *const u8
    }

    /// The committed size in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.memory.committed_size()
    }

    /// The reserved size in bytes.
    #[inline]
    pub fn max_capacity(&self) -> usize {
        self.memory.reserved_size()
    }

    #[inline]
    pub fn committed_segments(&self) -> usize {
        self.committed_segments
    }

    #[inline]
    pub fn reserved_segments(&self) -> usize {
        self.reserved_segments
    }

    /// The number of segments ever carved from the bump region.
    #[inline]
    pub fn next_segment(&self) -> usize {
        self.next_segment
    }

    /// The number of segments in live blocks.
    #[inline]
    pub fn allocated_segments(&self) -> usize {
        self.next_segment - self.freelist_segments
    }

    /// The size of all live blocks in bytes.
    #[inline]
    pub fn allocated_capacity(&self) -> usize {
        self.segments.segments_to_size(self.allocated_segments())
    }

    /// The size of all free blocks in bytes.
    #[inline]
    pub fn allocated_in_freelists(&self) -> usize {
        self.segments.segments_to_size(self.freelist_segments)
    }

    #[inline]
    pub fn unallocated_capacity(&self) -> usize {
        self.max_capacity() - self.allocated_capacity()
    }

    /// The size of the reservation that has never been carved.
    #[inline]
    pub fn heap_unallocated_capacity(&self) -> usize {
        self.segments
            .segments_to_size(self.reserved_segments - self.next_segment)
    }

    /// The high-water mark of [`Self::allocated_capacity`].
    #[inline]
    pub fn max_allocated_capacity(&self) -> usize {
        self.max_allocated_capacity
    }

    #[inline]
    pub fn freelist_length(&self) -> usize {
        self.freelist_length
    }

    /// The total length of the free blocks in segments.
    #[inline]
    pub fn freelist_segments(&self) -> usize {
        self.freelist_segments
    }

    /// The number of live blocks.
    #[inline]
    pub fn blob_count(&self) -> usize {
        self.blob_count
    }

    /// The number of free block joins since the last defragmentation.
    #[inline]
    pub fn fragmentation_count(&self) -> usize {
        self.fragmentation_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blob_count == 0
    }
}

impl<S: MemorySource> Drop for CodeHeap<S> {
    fn drop(&mut self) {
        // Safety: Both spaces were reserved from `source`. Nothing borrows
        //         from `self` anymore.
        unsafe {
            self.segmap.release(&mut self.source);
            self.memory.release(&mut self.source);
        }
    }
}

/// An iterator over the carved blocks of a [`CodeHeap`].
#[derive(Debug)]
pub struct Blocks<'a, S: MemorySource> {
    heap: &'a CodeHeap<S>,
    next: usize,
}

impl<S: MemorySource> Iterator for Blocks<'_, S> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        if self.next >= self.heap.next_segment {
            return None;
        }
        // Safety: `next` is always the start of a carved block
        let block = unsafe { Block::read(self.heap.block_at(self.next), self.heap.segment_size()) };
        self.next += block.segments();
        Some(block)
    }
}

#[cfg(test)]
mod tests;
