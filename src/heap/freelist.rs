//! The address-ordered free list
use core::ptr::NonNull;

use super::CodeHeap;
use crate::{
    block::{Block, BlockHdr, HEADER_SIZE},
    source::MemorySource,
};

impl<S: MemorySource> CodeHeap<S> {
    /// Put `block` on the free list, merging it with its physical
    /// neighbours where they are free.
    ///
    /// # Safety
    ///
    /// `block` must be a used block of `self`.
    pub(super) unsafe fn add_to_freelist(&mut self, mut block: NonNull<BlockHdr>) {
        debug_assert!(!block.as_ref().is_free());

        let beg = self.segment_for_block(block);
        let length = block.as_ref().length();
        self.freelist_length += 1;
        self.freelist_segments += length;
        block.as_mut().set_free(None);
        self.invalidate(beg, beg + length, HEADER_SIZE);

        let head = match self.freelist {
            Some(head) => head,
            None => {
                self.freelist = Some(block);
                return;
            }
        };

        if block < head {
            // Insert at the head
            block.as_mut().set_link(Some(head));
            self.freelist = Some(block);
            self.merge_right(block);
            return;
        }

        // Scanning a long list from the head is slow. Blocks tend to be
        // freed near each other, so start from the previous insertion point
        // if it is still a free block below `block`.
        let mut prev = head;
        if self.freelist_length > self.config.freelist_limit {
            if let Some(start) = self
                .last_insert_point
                .and_then(|point| self.segmap().find_block_start(point))
            {
                let candidate = self.block_at(start);
                if candidate.as_ref().is_free() && candidate < block {
                    prev = candidate;
                }
            }
        }

        let mut cur = prev.as_ref().link();
        while let Some(c) = cur {
            if c >= block {
                break;
            }
            prev = c;
            cur = c.as_ref().link();
        }

        self.insert_after(prev, block);
        self.last_insert_point = Some(self.segment_for_block(prev));
    }

    /// Link `block` after `prev` and merge the three blocks as far as
    /// possible.
    unsafe fn insert_after(&mut self, mut prev: NonNull<BlockHdr>, mut block: NonNull<BlockHdr>) {
        debug_assert!(prev < block);
        block.as_mut().set_link(prev.as_ref().link());
        prev.as_mut().set_link(Some(block));

        self.merge_right(block);
        self.merge_right(prev);
    }

    /// Absorb the free block following `block` if it is also `block`'s
    /// successor on the free list. Returns `true` if a merge took place.
    unsafe fn merge_right(&mut self, mut block: NonNull<BlockHdr>) -> bool {
        let next = match block.as_ref().link() {
            Some(next) if Some(next) == self.following_block(block) => next,
            _ => return false,
        };

        let next_hdr = *next.as_ptr();
        let new_length = block.as_ref().length() + next_hdr.length();
        block.as_mut().set_length(new_length);
        block.as_mut().set_link(next_hdr.link());
        self.freelist_length -= 1;

        let follower = self.segment_for_block(next);
        let end = self.segment_for_block(block) + new_length;
        self.mark_segmap_as_used(follower, end, true);

        // The absorbed header is now part of `block`'s body
        self.invalidate(follower, follower + 1, 0);
        true
    }

    /// Find the smallest free block holding at least `length` segments,
    /// take it (or its tail) off the free list and mark it used.
    pub(super) fn search_freelist(&mut self, length: usize) -> Option<NonNull<BlockHdr>> {
        let length = length.max(self.config.min_block_segments);

        // (predecessor, block, block length)
        let mut best: Option<(Option<NonNull<BlockHdr>>, NonNull<BlockHdr>, usize)> = None;
        let mut prev = None;
        let mut cur = self.freelist;
        while let Some(c) = cur {
            // Safety: Free list entries are valid headers
            let (cur_length, next) = unsafe { (c.as_ref().length(), c.as_ref().link()) };
            if cur_length == length {
                best = Some((prev, c, cur_length));
                break;
            }
            if cur_length > length && best.map_or(true, |(_, _, best_length)| cur_length < best_length) {
                best = Some((prev, c, cur_length));
            }
            prev = Some(c);
            cur = next;
        }

        let (found_prev, found, found_length) = best?;

        // Safety: `found` and `found_prev` are free list entries
        let mut block = unsafe {
            if found_length - length < self.config.min_block_segments {
                // The remainder would be too small; take the whole block
                let next = found.as_ref().link();
                match found_prev {
                    Some(mut p) => p.as_mut().set_link(next),
                    None => self.freelist = next,
                }
                self.freelist_length -= 1;
                self.freelist_segments -= found_length;
                found
            } else {
                // Leave the head on the free list so that no links change
                self.freelist_segments -= length;
                self.split_block(found, found_length - length)
            }
        };

        // Safety: `block` is off the free list and owned by `self`
        unsafe { block.as_mut().set_used() };
        Some(block)
    }

    /// Iterate over the free blocks in address order.
    pub fn free_blocks(&self) -> FreeBlocks<'_, S> {
        FreeBlocks {
            heap: self,
            cur: self.freelist,
        }
    }
}

/// An iterator over the free list of a [`CodeHeap`].
#[derive(Debug)]
pub struct FreeBlocks<'a, S: MemorySource> {
    heap: &'a CodeHeap<S>,
    cur: Option<NonNull<BlockHdr>>,
}

impl<S: MemorySource> Iterator for FreeBlocks<'_, S> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let cur = self.cur?;
        // Safety: Free list entries are valid headers
        let block = unsafe { Block::read(cur, self.heap.segment_size()) };
        self.cur = unsafe { cur.as_ref().link() };
        Some(block)
    }
}
