//! The segment map: one byte per segment, leading back to a block's start
use core::{
    ptr::NonNull,
    slice,
    sync::atomic::{AtomicU8, Ordering},
};

use crate::utils::div_ceil;

/// Marks a segment that has never been carved into a block.
pub(crate) const FREE_SENTINEL: u8 = 0xff;

/// The largest hop distance an entry can encode.
pub(crate) const MAX_HOP: u8 = FREE_SENTINEL - 1;

#[doc = svgbobdoc::transform!(
/// A view of the segment map covering the committed segments.
///
/// # Encoding
///
/// <center>
/// ```svgbob
///              block A (3 segments)     block B (258 segments)
///            ,----+----+----,----+----+----+-- ... --+-----+----+----+----,----+----,
///   segmap = |  0 |  1 |  2 |  0 |  1 |  2 |   ...   | 254 |  1 |  2 |  3 | FF | FF |
///            '----+----+----'----+----+----+-- ... --+-----+----+----+----'----+----'
///              ^         |    ^                        | ^      |           untouched
///              '---------'    '------------------------' '------'           segments
/// ```
/// </center>
///
///  - `0` marks the first segment of a block, used or free.
///  - `1..=254` is the distance to hop back to get closer to the start.
///  - [`FREE_SENTINEL`] marks a segment that is not part of any block.
///
/// Entries are only ever read or written one byte at a time through
/// [`AtomicU8`] so that lookups can run without holding the heap's lock.
)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct SegmentMap<'a> {
    entries: &'a [AtomicU8],
}

impl<'a> SegmentMap<'a> {
    /// Construct a view of `len` entries starting at `low`.
    ///
    /// # Safety
    ///
    /// `low..low + len` must be committed memory that stays valid for `'a`.
    /// Every byte must have been written through [`Self::mark_range_as_free`]
    /// or [`Self::mark_range_as_used`] before it is read.
    #[inline]
    pub unsafe fn from_raw(low: NonNull<u8>, len: usize) -> Self {
        Self {
            // `AtomicU8` has the same in-memory representation as `u8`
            entries: slice::from_raw_parts(low.as_ptr() as *const AtomicU8, len),
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn get(&self, index: usize) -> u8 {
        self.entries[index].load(Ordering::Relaxed)
    }

    #[inline]
    fn set(&self, index: usize, value: u8) {
        self.entries[index].store(value, Ordering::Relaxed);
    }

    /// Whether segment `index` has never been carved into a block.
    #[inline]
    pub fn is_unused(&self, index: usize) -> bool {
        self.get(index) == FREE_SENTINEL
    }

    /// Mark `beg..end` as not belonging to any block.
    pub fn mark_range_as_free(&self, beg: usize, end: usize) {
        debug_assert!(beg <= end && end <= self.len());
        for entry in &self.entries[beg..end] {
            entry.store(FREE_SENTINEL, Ordering::Relaxed);
        }
    }

    /// Mark `beg..end` as the segments of one block.
    ///
    /// With `is_join == false`, `beg` is the block's first segment and the
    /// whole range gets the canonical pattern `0, 1, 2, …, 254, 1, 2, …`.
    ///
    /// With `is_join == true`, `beg` is the first segment of a free block
    /// that has just been absorbed by its left neighbour, whose range is
    /// already consistent. Only the entry at `beg` is patched, which can
    /// cost up to one extra hop for lookups inside the absorbed range.
    pub fn mark_range_as_used(&self, beg: usize, end: usize, is_join: bool) {
        debug_assert!(beg < end && end <= self.len(), "{}..{}", beg, end);

        if is_join && beg > 0 {
            debug_assert_eq!(self.get(beg), 0, "join must start at a block start");

            // Extend the left neighbour's last hop if it still fits.
            let prev = self.get(beg - 1);
            debug_assert!(prev < FREE_SENTINEL);
            self.set(beg, if prev < MAX_HOP { prev + 1 } else { 1 });
            return;
        }

        self.set(beg, 0);
        let mut hop = 0;
        for entry in &self.entries[beg + 1..end] {
            hop = if hop == MAX_HOP { 1 } else { hop + 1 };
            entry.store(hop, Ordering::Relaxed);
        }
    }

    /// Follow the hops from segment `index` back to a block's first segment.
    ///
    /// Returns `None` if `index` does not belong to any block.
    #[inline]
    pub fn find_block_start(&self, mut index: usize) -> Option<usize> {
        let mut hop = self.get(index);
        if hop == FREE_SENTINEL {
            return None;
        }
        while hop > 0 {
            // A concurrent reader might observe a torn-down chain; never
            // step outside the map.
            index = index.checked_sub(hop as usize)?;
            hop = self.get(index);
            if hop == FREE_SENTINEL {
                return None;
            }
        }
        Some(index)
    }

    /// The number of hops needed to reach the start of the block spanning
    /// `beg..end`, starting at its last segment.
    pub fn hops(&self, beg: usize, end: usize) -> usize {
        debug_assert!(beg < end && end <= self.len());
        let mut nhops = 0;
        let mut index = end - 1;
        loop {
            let hop = self.get(index);
            debug_assert!(hop < FREE_SENTINEL);
            if hop == 0 {
                break;
            }
            index -= hop as usize;
            nhops += 1;
        }
        debug_assert_eq!(index, beg, "hop chain escaped its block");
        nhops
    }

    /// The number of hops in excess of what the canonical pattern needs for
    /// the block spanning `beg..end`.
    pub fn extra_hops(&self, beg: usize, end: usize) -> usize {
        let expected = optimal_hops(end - beg);
        self.hops(beg, end).saturating_sub(expected)
    }
}

/// `ceil((length - 1) / 254)`, the number of hops from the last segment of a
/// `length`-segment block to its start under the canonical pattern.
#[inline]
pub(crate) fn optimal_hops(length: usize) -> usize {
    debug_assert!(length >= 1);
    div_ceil(length - 1, MAX_HOP as usize)
}
