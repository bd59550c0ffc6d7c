//! Consistency checks
use core::{ptr::NonNull, slice};

use super::{CodeHeap, ZAP_FREE};
use crate::{
    block::{BlockHdr, HEADER_SIZE},
    segmap::FREE_SENTINEL,
    source::MemorySource,
};

impl<S: MemorySource> CodeHeap<S> {
    /// Check the heap's internal consistency.
    ///
    /// This walks the free list, every carved block and every committed
    /// segment map entry, so it is linear in the size of the heap.
    pub fn verify(&self) -> Result<(), &'static str> {
        let map = self.segmap();

        // The free list
        let mut len = 0;
        let mut count = 0;
        let mut prev: Option<NonNull<BlockHdr>> = None;
        let mut cur = self.freelist;
        while let Some(b) = cur {
            // Safety: Free list entries are valid headers
            let hdr = unsafe { *b.as_ref() };
            if !hdr.is_free() {
                return Err("used block on the free list");
            }
            if prev.map_or(false, |p| p >= b) {
                return Err("free list is not ordered by address");
            }
            if !self.contains(b.as_ptr() as *const u8) {
                return Err("free block outside the heap");
            }
            // Safety: `b` is a block of `self`
            if hdr.link().is_some() && unsafe { self.following_block(b) } == hdr.link() {
                return Err("adjacent free blocks were not merged");
            }
            if self.config.zap_free_blocks {
                let body = unsafe {
                    slice::from_raw_parts(
                        BlockHdr::allocated_space(b).as_ptr(),
                        self.segments.segments_to_size(hdr.length()) - HEADER_SIZE,
                    )
                };
                if body.iter().any(|&x| x != ZAP_FREE) {
                    return Err("free block was written to");
                }
            }
            len += hdr.length();
            count += 1;
            prev = Some(b);
            cur = hdr.link();
        }
        if len != self.freelist_segments {
            return Err("free list segment count mismatch");
        }
        if count != self.freelist_length {
            return Err("free list length mismatch");
        }

        // The carved blocks and their segment map entries
        let mut nseg = 0;
        let mut free_blocks = 0;
        let mut used_blocks = 0;
        let mut extra_hops = 0;
        for block in self.blocks() {
            let beg = nseg;
            let end = beg + block.segments();
            if end > self.next_segment {
                return Err("block extends past the carved region");
            }
            if map.get(beg) != 0 {
                return Err("block start is not marked as such");
            }
            if (beg..end).any(|i| map.get(i) == FREE_SENTINEL) {
                return Err("carved segment is marked as unused");
            }
            if map.find_block_start(end - 1) != Some(beg) {
                return Err("segment map does not lead back to the block start");
            }
            extra_hops += map.extra_hops(beg, end);
            if block.is_free() {
                free_blocks += 1;
            } else {
                used_blocks += 1;
            }
            nseg = end;
        }
        if nseg != self.next_segment {
            return Err("carved blocks do not cover the carved region");
        }
        if free_blocks != self.freelist_length {
            return Err("free block missing from the free list");
        }
        if used_blocks != self.blob_count {
            return Err("live block count mismatch");
        }
        if (self.next_segment..self.committed_segments).any(|i| !map.is_unused(i)) {
            return Err("uncarved segment is marked as used");
        }

        // Lookups stay fast only as long as the joins are undone now and
        // then. These bounds are heuristic.
        if extra_hops > self.fragmentation_count {
            log::warn!(
                "{} extra segment map hops after {} joins",
                extra_hops,
                self.fragmentation_count
            );
        }
        if extra_hops >= 16 + 2 * count {
            log::warn!(
                "{} extra segment map hops for {} free blocks",
                extra_hops,
                count
            );
        }

        Ok(())
    }
}
