//! In-place block headers
use core::{mem, ptr::NonNull};

/// The header stored at the first segment of every carved block.
///
/// The allocated space of a used block immediately follows the header.
// The alignment rounds the header up to a power of two so that the allocated
// space is as aligned as the header itself.
#[cfg_attr(target_pointer_width = "16", repr(align(8)))]
#[cfg_attr(target_pointer_width = "32", repr(align(16)))]
#[cfg_attr(target_pointer_width = "64", repr(align(32)))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockHdr {
    /// A block handed out by `CodeHeap::allocate`.
    Used {
        /// The number of segments occupied by the block, including the header.
        length: usize,
    },
    /// A block on the free list.
    Free {
        length: usize,
        /// The next free block in address order.
        link: Option<NonNull<BlockHdr>>,
    },
}

/// The size of [`BlockHdr`]. This is the smallest permitted segment size.
pub const HEADER_SIZE: usize = mem::size_of::<BlockHdr>();

impl BlockHdr {
    #[inline]
    pub fn length(&self) -> usize {
        match *self {
            BlockHdr::Used { length } | BlockHdr::Free { length, .. } => length,
        }
    }

    #[inline]
    pub fn set_length(&mut self, new_length: usize) {
        debug_assert!(new_length >= 1);
        match self {
            BlockHdr::Used { length } | BlockHdr::Free { length, .. } => *length = new_length,
        }
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        matches!(self, BlockHdr::Free { .. })
    }

    /// The next free block. `None` for a used block.
    #[inline]
    pub fn link(&self) -> Option<NonNull<BlockHdr>> {
        match *self {
            BlockHdr::Free { link, .. } => link,
            BlockHdr::Used { .. } => None,
        }
    }

    #[inline]
    pub fn set_link(&mut self, new_link: Option<NonNull<BlockHdr>>) {
        match self {
            BlockHdr::Free { link, .. } => *link = new_link,
            BlockHdr::Used { .. } => debug_assert!(false, "linking a used block"),
        }
    }

    #[inline]
    pub fn set_used(&mut self) {
        *self = BlockHdr::Used {
            length: self.length(),
        };
    }

    #[inline]
    pub fn set_free(&mut self, link: Option<NonNull<BlockHdr>>) {
        *self = BlockHdr::Free {
            length: self.length(),
            link,
        };
    }

    /// The address of the first byte past the header.
    #[inline]
    pub fn allocated_space(block: NonNull<BlockHdr>) -> NonNull<u8> {
        // Safety: `block` is followed by at least one byte of the same block
        //         because segments are at least `HEADER_SIZE` bytes long
        unsafe { NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(HEADER_SIZE)) }
    }

    /// The header of the block whose allocated space starts at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`Self::allocated_space`].
    #[inline]
    pub unsafe fn from_allocated_space(ptr: NonNull<u8>) -> NonNull<BlockHdr> {
        NonNull::new_unchecked(ptr.as_ptr().sub(HEADER_SIZE)).cast()
    }
}

/// Information about a carved block, as observed at the time of the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub(crate) hdr: NonNull<BlockHdr>,
    pub(crate) length: usize,
    pub(crate) segment_size: usize,
    pub(crate) free: bool,
}

impl Block {
    /// Take a snapshot of the block at `hdr`.
    ///
    /// # Safety
    ///
    /// `hdr` must point to a valid block header.
    #[inline]
    pub(crate) unsafe fn read(hdr: NonNull<BlockHdr>, segment_size: usize) -> Self {
        let h = hdr.as_ref();
        Self {
            hdr,
            length: h.length(),
            segment_size,
            free: h.is_free(),
        }
    }

    /// The address of the block's first segment (its header).
    #[inline]
    pub fn start(&self) -> NonNull<u8> {
        self.hdr.cast()
    }

    /// The address of the first byte past the header.
    #[inline]
    pub fn allocated_space(&self) -> NonNull<u8> {
        BlockHdr::allocated_space(self.hdr)
    }

    /// The number of segments occupied by the block.
    #[inline]
    pub fn segments(&self) -> usize {
        self.length
    }

    /// The size of the block in bytes, including the header.
    #[inline]
    pub fn size(&self) -> usize {
        self.length * self.segment_size
    }

    /// The number of bytes available past the header.
    #[inline]
    pub fn allocated_size(&self) -> usize {
        self.size() - HEADER_SIZE
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.free
    }

    /// Check whether `addr` lies inside this block.
    #[inline]
    pub fn contains(&self, addr: *const u8) -> bool {
        let start = self.start().as_ptr() as usize;
        (start..start + self.size()).contains(&(addr as usize))
    }
}
