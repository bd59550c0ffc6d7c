//! Heap tuning parameters
use crate::block::HEADER_SIZE;

/// Provides a constant default value, so that heaps and memory sources can
/// be configured in `const` contexts.
pub trait Init {
    /// `Self`'s default value.
    const INIT: Self;
}

#[cfg(any(test, feature = "std"))]
#[cfg_attr(feature = "doc_cfg", doc(cfg(feature = "std")))]
impl Init for std::alloc::System {
    const INIT: Self = Self;
}

/// The parameters of a [`CodeHeap`](crate::CodeHeap).
///
/// # Examples
///
/// ```
/// use codeheap::{HeapConfig, Init};
///
/// let config = HeapConfig::INIT
///     .with_segment_size(128)
///     .with_min_block_segments(4);
/// assert!(config.validate().is_ok());
/// assert!(HeapConfig::INIT.with_segment_size(100).validate().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// The allocation granule in bytes. Must be a power of two, at least
    /// [`HEADER_SIZE`] and at most the memory source's page size.
    pub segment_size: usize,
    /// The smallest block in segments. Free blocks smaller than this are
    /// never split off.
    pub min_block_segments: usize,
    /// The number of cheap segment map joins tolerated before the whole map
    /// is defragmented.
    pub fragmentation_limit: usize,
    /// The free list length above which insertions start scanning from the
    /// previous insertion point.
    pub freelist_limit: usize,
    /// Fill the bodies of freed blocks with [`ZAP_FREE`](crate::ZAP_FREE).
    pub zap_free_blocks: bool,
}

impl Init for HeapConfig {
    const INIT: Self = Self {
        segment_size: 64,
        min_block_segments: 1,
        fragmentation_limit: 10000,
        freelist_limit: 100,
        zap_free_blocks: cfg!(debug_assertions),
    };
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::INIT
    }
}

impl HeapConfig {
    pub const fn with_segment_size(self, segment_size: usize) -> Self {
        Self {
            segment_size,
            ..self
        }
    }

    pub const fn with_min_block_segments(self, min_block_segments: usize) -> Self {
        Self {
            min_block_segments,
            ..self
        }
    }

    pub const fn with_fragmentation_limit(self, fragmentation_limit: usize) -> Self {
        Self {
            fragmentation_limit,
            ..self
        }
    }

    pub const fn with_freelist_limit(self, freelist_limit: usize) -> Self {
        Self {
            freelist_limit,
            ..self
        }
    }

    pub const fn with_zap_free_blocks(self, zap_free_blocks: bool) -> Self {
        Self {
            zap_free_blocks,
            ..self
        }
    }

    /// Check the parameters that do not depend on the memory source.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.segment_size.is_power_of_two() {
            return Err("segment_size must be a power of two");
        }
        if self.segment_size < HEADER_SIZE {
            return Err("segment_size is too small to hold a block header");
        }
        if self.min_block_segments == 0 {
            return Err("min_block_segments must not be zero");
        }
        Ok(())
    }
}
