//! Segment map defragmentation
use super::CodeHeap;
use crate::source::MemorySource;

impl<S: MemorySource> CodeHeap<S> {
    /// The total number of lookup hops over the canonical pattern, summed
    /// over the last segments of all carved blocks.
    pub fn extra_hops(&self) -> usize {
        let map = self.segmap();
        self.blocks()
            .map(|block| {
                let beg = self.segments.segment_for(block.start().as_ptr() as usize);
                map.extra_hops(beg, beg + block.segments())
            })
            .sum()
    }

    /// Walk every carved block and count the extra hops its segment map
    /// entries cost. With `repair`, rewrite each block that has any with
    /// the canonical pattern and reset [`Self::fragmentation_count`].
    ///
    /// Returns the number of extra hops found.
    pub fn defrag_segmap(&mut self, repair: bool) -> usize {
        let map = self.segmap();
        let mut extra_hops = 0;
        let mut blocks = 0;
        let mut repaired = 0;
        let mut index = 0;
        while index < self.next_segment {
            // Safety: `index` is always the start of a carved block
            let length = unsafe { self.block_at(index).as_ref().length() };
            let end = index + length;
            let extra = map.extra_hops(index, end);
            if extra > 0 {
                extra_hops += extra;
                if repair {
                    map.mark_range_as_used(index, end, false);
                    repaired += 1;
                }
            }
            blocks += 1;
            index = end;
        }

        if repair {
            self.fragmentation_count = 0;
        }

        log::debug!(
            "defrag_segmap({}): {} extra hops in {} blocks, {} rewritten",
            repair,
            extra_hops,
            blocks,
            repaired
        );
        extra_hops
    }
}
