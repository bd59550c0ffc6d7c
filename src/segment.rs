//! Conversion between byte addresses and segment indices
use core::ptr::NonNull;

/// Maps byte offsets inside a heap's block storage to segment indices and
/// back. The segment size is a power of two, so every conversion is a shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Segments {
    low: usize,
    log2_segment_size: u32,
}

impl Segments {
    /// `low` is the address of segment 0.
    #[inline]
    pub fn new(low: NonNull<u8>, segment_size: usize) -> Self {
        debug_assert!(segment_size.is_power_of_two());
        debug_assert_eq!(low.as_ptr() as usize % segment_size, 0);
        Self {
            low: low.as_ptr() as usize,
            log2_segment_size: segment_size.trailing_zeros(),
        }
    }

    #[inline]
    pub fn segment_size(&self) -> usize {
        1 << self.log2_segment_size
    }

    #[inline]
    pub fn log2_segment_size(&self) -> u32 {
        self.log2_segment_size
    }

    #[inline]
    pub fn low(&self) -> usize {
        self.low
    }

    /// The index of the segment containing `addr`.
    ///
    /// `addr` must not be below `low`. Callers check `contains` first.
    #[inline]
    pub fn segment_for(&self, addr: usize) -> usize {
        debug_assert!(addr >= self.low);
        (addr - self.low) >> self.log2_segment_size
    }

    /// The address of the first byte of segment `index`.
    #[inline]
    pub fn address_for(&self, index: usize) -> usize {
        self.low + (index << self.log2_segment_size)
    }

    /// The number of whole segments needed to hold `size` bytes.
    #[inline]
    pub fn size_to_segments(&self, size: usize) -> usize {
        (size + (self.segment_size() - 1)) >> self.log2_segment_size
    }

    #[inline]
    pub fn segments_to_size(&self, segments: usize) -> usize {
        segments << self.log2_segment_size
    }
}
