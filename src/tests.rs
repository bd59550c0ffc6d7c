extern crate std;

use std::{collections::BTreeMap, ops::Range};

/// A byte-granular model of which parts of a heap are live.
///
/// Each map entry marks the start of a run of bytes in the same state; the
/// run lasts until the next entry.
pub struct ShadowHeap {
    runs: BTreeMap<usize, Region>,
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Region {
    /// Never carved into a block
    Uncarved,
    Free,
    Used,
}

impl ShadowHeap {
    pub fn new() -> Self {
        Self {
            runs: Some((0, Region::Uncarved)).into_iter().collect(),
        }
    }

    /// The state of the byte at `addr`.
    pub fn region_at(&self, addr: usize) -> Region {
        *self.runs.range(..=addr).next_back().unwrap().1
    }

    /// Change the state of `range`, which must be uniformly `from`.
    pub fn convert(&mut self, range: Range<usize>, from: Region, to: Region) {
        if range.is_empty() || from == to {
            return;
        }
        log::trace!("shadow: {:?} {:?} -> {:?}", range, from, to);

        let (&run_start, &run_region) = self.runs.range(..range.end).next_back().unwrap();
        assert!(
            run_start <= range.start,
            "{:?} straddles a state change at 0x{:x}",
            range,
            run_start
        );
        assert_eq!(run_region, from, "{:?} is in an unexpected state", range);

        let after = self.runs.get(&range.end).copied();
        if after.is_none() {
            self.runs.insert(range.end, from);
        }
        self.runs.insert(range.start, to);

        // Drop entries that no longer mark a state change
        if let Some((_, &before)) = self.runs.range(..range.start).next_back() {
            if before == to {
                self.runs.remove(&range.start);
            }
        }
        if self.runs.get(&range.end) == Some(&to) {
            self.runs.remove(&range.end);
        }
    }

    /// Record the allocation of `range`, carving it first if needed.
    pub fn allocate(&mut self, range: Range<usize>) {
        let from = self.region_at(range.start);
        assert_ne!(from, Region::Used, "{:?} overlaps a live block", range);
        self.convert(range, from, Region::Used);
    }

    pub fn deallocate(&mut self, range: Range<usize>) {
        self.convert(range, Region::Used, Region::Free);
    }
}

#[test]
fn shadow_heap_coalesces() {
    let mut sa = ShadowHeap::new();
    sa.allocate(0..64);
    sa.allocate(64..128);
    assert_eq!(sa.region_at(100), Region::Used);
    assert_eq!(sa.region_at(128), Region::Uncarved);

    sa.deallocate(0..64);
    sa.deallocate(64..128);
    assert_eq!(sa.runs.len(), 2);
    assert_eq!(sa.region_at(0), Region::Free);

    sa.allocate(32..96);
    assert_eq!(sa.region_at(31), Region::Free);
    assert_eq!(sa.region_at(95), Region::Used);
    assert_eq!(sa.region_at(96), Region::Free);
}
