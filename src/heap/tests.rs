extern crate std;

use quickcheck_macros::quickcheck;
use std::{alloc::System, cell::Cell, ops::Range, prelude::v1::*};

use super::*;
use crate::{
    source::GlobalAllocSource,
    tests::{Region, ShadowHeap},
    Init,
};

type TestSource = GlobalAllocSource<System, 4096>;
type TestHeap = CodeHeap<TestSource>;

fn config() -> HeapConfig {
    HeapConfig::INIT.with_zap_free_blocks(true)
}

fn new_heap(reserved: usize, committed: usize, config: HeapConfig) -> TestHeap {
    let _ = env_logger::builder().is_test(true).try_init();
    CodeHeap::reserve(Init::INIT, reserved, committed, config).unwrap()
}

/// The request size that results in a block of exactly `segments` segments.
fn request_for(heap: &TestHeap, segments: usize) -> usize {
    segments * heap.segment_size() - HEADER_SIZE
}

fn span(block: &Block) -> Range<usize> {
    let start = block.start().as_ptr() as usize;
    start..start + block.size()
}

#[test]
fn reserve_rounds_to_pages() {
    let heap = new_heap(10_000, 5_000, config());
    assert_eq!(heap.max_capacity(), 12288);
    assert_eq!(heap.capacity(), 8192);
    assert_eq!(heap.committed_segments(), 8192 / 64);
    assert_eq!(heap.reserved_segments(), 12288 / 64);
    assert_eq!(heap.next_segment(), 0);
    assert_eq!(heap.allocated_capacity(), 0);
    assert!(heap.is_empty());
    assert_eq!(heap.high() as usize - heap.low_boundary() as usize, 8192);
    assert_eq!(heap.high_boundary() as usize - heap.low_boundary() as usize, 12288);
    heap.verify().unwrap();
}

#[test]
fn reserve_rejects_bad_parameters() {
    let reserve = |reserved, committed, config| {
        TestHeap::reserve(Init::INIT, reserved, committed, config).map(drop)
    };
    assert!(matches!(
        reserve(65536, 4096, config().with_segment_size(48)),
        Err(ReserveError::InvalidConfig(_))
    ));
    assert!(matches!(
        reserve(65536, 4096, config().with_segment_size(8192)),
        Err(ReserveError::InvalidConfig(_))
    ));
    assert!(matches!(
        reserve(4096, 8192, config()),
        Err(ReserveError::InvalidConfig(_))
    ));
    assert!(matches!(
        reserve(0, 0, config()),
        Err(ReserveError::InvalidConfig(_))
    ));
    assert!(reserve(4096, 0, config()).is_ok());
}

#[test]
fn allocate_accounts_whole_segments() {
    let mut heap = new_heap(1 << 20, 64 << 10, config().with_segment_size(512));
    let before = heap.allocated_capacity();

    let ptr = heap.allocate(1000).unwrap();

    let segments = (1000 + HEADER_SIZE + 511) / 512;
    assert_eq!(heap.allocated_capacity() - before, segments * 512);
    assert_eq!(heap.max_allocated_capacity(), heap.allocated_capacity());
    assert_eq!(heap.blob_count(), 1);
    assert_eq!(heap.find_start(ptr.as_ptr()), Some(ptr));

    let block = heap.find_block_for(unsafe { ptr.as_ptr().add(999) }).unwrap();
    assert_eq!(block.allocated_space(), ptr);
    assert_eq!(block.segments(), segments);
    assert!(!block.is_free());
    heap.verify().unwrap();
}

#[test]
fn adjacent_frees_merge() {
    for &reverse in &[false, true] {
        let mut heap = new_heap(65536, 16384, config());
        let a = heap.allocate(request_for(&heap, 2)).unwrap();
        let b = heap.allocate(request_for(&heap, 2)).unwrap();
        let _c = heap.allocate(request_for(&heap, 1)).unwrap();

        unsafe {
            if reverse {
                heap.deallocate(b);
                heap.deallocate(a);
            } else {
                heap.deallocate(a);
                heap.deallocate(b);
            }
        }

        assert_eq!(heap.freelist_length(), 1);
        assert_eq!(heap.freelist_segments(), 4);
        let free: Vec<_> = heap.free_blocks().collect();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].segments(), 4);
        assert_eq!(free[0].allocated_space(), a);
        assert_eq!(heap.find_block_for(b.as_ptr()), Some(free[0]));
        assert_eq!(heap.find_start(b.as_ptr()), None);
        heap.verify().unwrap();
    }
}

#[test]
fn allocation_beyond_reservation_fails() {
    let mut heap = new_heap(65536, 65536, config());
    assert_eq!(heap.freelist_length(), 0);
    let request = heap.heap_unallocated_capacity();
    assert_eq!(heap.allocate(request), None);
    assert_eq!(heap.allocate(usize::MAX), None);
    assert_eq!(heap.allocate(usize::MAX - HEADER_SIZE), None);
    assert_eq!(heap.blob_count(), 0);

    assert!(heap.allocate(request - HEADER_SIZE).is_some());
    assert_eq!(heap.heap_unallocated_capacity(), 0);
    assert_eq!(heap.allocate(0), None);
    heap.verify().unwrap();
}

#[test]
fn deallocate_tail_frees_the_tail() {
    let mut heap = new_heap(65536, 16384, config());
    let ptr = heap.allocate(request_for(&heap, 10)).unwrap();
    let _guard = heap.allocate(0).unwrap();
    let start = unsafe { ptr.as_ptr().sub(HEADER_SIZE) };

    unsafe { heap.deallocate_tail(ptr, request_for(&heap, 4)) };

    let live = heap.find_block_for(ptr.as_ptr()).unwrap();
    assert_eq!(live.segments(), 4);
    assert!(!live.is_free());

    let tail_start = unsafe { start.add(4 * heap.segment_size()) };
    let tail = heap.find_block_for(tail_start).unwrap();
    assert!(tail.is_free());
    assert_eq!(tail.segments(), 6);
    assert_eq!(tail.start().as_ptr(), tail_start);
    assert_eq!(heap.find_start(tail_start), None);

    // The live block still resolves to itself
    let last_live = unsafe { tail_start.sub(1) };
    assert_eq!(heap.find_block_for(last_live), Some(live));
    assert_eq!(heap.find_start(last_live), Some(ptr));

    assert_eq!(heap.freelist_segments(), 6);
    assert_eq!(heap.blob_count(), 2);
    heap.verify().unwrap();
}

#[test]
fn deallocate_tail_keeps_short_tails() {
    let mut heap = new_heap(65536, 16384, config().with_min_block_segments(4));
    let ptr = heap.allocate(request_for(&heap, 6)).unwrap();

    unsafe { heap.deallocate_tail(ptr, request_for(&heap, 3)) };
    assert_eq!(heap.find_block_for(ptr.as_ptr()).unwrap().segments(), 6);
    assert_eq!(heap.freelist_length(), 0);

    // The used part is rounded up to `min_block_segments`
    let ptr = heap.allocate(request_for(&heap, 8)).unwrap();
    unsafe { heap.deallocate_tail(ptr, 0) };
    assert_eq!(heap.find_block_for(ptr.as_ptr()).unwrap().segments(), 4);
    assert_eq!(heap.freelist_segments(), 4);
    heap.verify().unwrap();
}

#[test]
fn best_fit() {
    let mut heap = new_heap(65536, 16384, config());
    let a1 = heap.allocate(request_for(&heap, 3)).unwrap();
    heap.allocate(0).unwrap();
    let a2 = heap.allocate(request_for(&heap, 2)).unwrap();
    heap.allocate(0).unwrap();
    let a3 = heap.allocate(request_for(&heap, 5)).unwrap();
    heap.allocate(0).unwrap();

    unsafe {
        heap.deallocate(a3);
        heap.deallocate(a1);
        heap.deallocate(a2);
    }
    assert_eq!(heap.freelist_length(), 3);
    heap.verify().unwrap();

    // An exact fit wins
    assert_eq!(heap.allocate(request_for(&heap, 2)), Some(a2));

    // Otherwise the smallest fitting block is split and its tail is used
    let p = heap.allocate(request_for(&heap, 4)).unwrap();
    let a3_start = a3.as_ptr() as usize - HEADER_SIZE;
    assert_eq!(p.as_ptr() as usize, a3_start + heap.segment_size() + HEADER_SIZE);
    let head = heap.find_block_for(a3.as_ptr()).unwrap();
    assert!(head.is_free());
    assert_eq!(head.segments(), 1);

    assert_eq!(heap.freelist_length(), 2);
    assert_eq!(heap.freelist_segments(), 4);
    heap.verify().unwrap();
}

#[test]
fn small_remainders_are_not_split_off() {
    let mut heap = new_heap(65536, 16384, config().with_min_block_segments(2));
    let a = heap.allocate(request_for(&heap, 5)).unwrap();
    heap.allocate(0).unwrap();
    unsafe { heap.deallocate(a) };

    // 5 - 4 < 2, so the whole block is handed out
    assert_eq!(heap.allocate(request_for(&heap, 4)), Some(a));
    assert_eq!(heap.find_block_for(a.as_ptr()).unwrap().segments(), 5);
    assert_eq!(heap.freelist_length(), 0);
    assert_eq!(heap.freelist_segments(), 0);
    heap.verify().unwrap();
}

#[test]
fn insertion_with_a_long_free_list() {
    let mut heap = new_heap(1 << 20, 1 << 20, config().with_freelist_limit(3));
    let ptrs: Vec<_> = (0..64)
        .map(|_| heap.allocate(request_for(&heap, 1)).unwrap())
        .collect();

    // Free every other block, going up and then coming back down so that
    // the cached insertion point is both usable and stale
    for p in ptrs.iter().step_by(2).take(16) {
        unsafe { heap.deallocate(*p) };
        heap.verify().unwrap();
    }
    for p in ptrs.iter().step_by(2).skip(16).rev() {
        unsafe { heap.deallocate(*p) };
        heap.verify().unwrap();
    }
    assert_eq!(heap.freelist_length(), 32);

    // Reallocate some free blocks and fill every gap
    for _ in 0..8 {
        heap.allocate(request_for(&heap, 1)).unwrap();
        heap.verify().unwrap();
    }
    for p in ptrs.iter().skip(1).step_by(2) {
        unsafe { heap.deallocate(*p) };
        heap.verify().unwrap();
    }

    let addresses: Vec<_> = heap.free_blocks().map(|b| b.start()).collect();
    let mut sorted = addresses.clone();
    sorted.sort();
    assert_eq!(addresses, sorted);
}

#[test]
fn joins_trigger_defragmentation() {
    let mut heap = new_heap(65536, 16384, config().with_fragmentation_limit(3));
    let ptrs: Vec<_> = (0..9)
        .map(|_| heap.allocate(request_for(&heap, 2)).unwrap())
        .collect();
    heap.allocate(0).unwrap();

    for (i, p) in ptrs.iter().enumerate() {
        unsafe { heap.deallocate(*p) };
        heap.verify().unwrap();
        assert!(heap.fragmentation_count() < 3, "after {} frees", i + 1);
        assert!(heap.extra_hops() <= heap.fragmentation_count());
    }
    assert_eq!(heap.freelist_length(), 1);

    // 9 frees, 8 joins, and the counter was reset after the 3rd and 6th
    assert_eq!(heap.fragmentation_count(), 2);
    let extra = heap.extra_hops();
    assert_eq!(extra, 2);
    assert_eq!(heap.defrag_segmap(false), extra);
    assert_eq!(heap.fragmentation_count(), 2);
    assert_eq!(heap.defrag_segmap(true), extra);
    assert_eq!(heap.extra_hops(), 0);
    assert_eq!(heap.fragmentation_count(), 0);
    heap.verify().unwrap();
}

#[test]
fn lookups_resolve_every_byte() {
    let mut heap = new_heap(65536, 65536, config().with_segment_size(32).with_zap_free_blocks(false));
    let sizes = [1, 300, 1, 254, 255, 256, 2, 600];
    let ptrs: Vec<_> = sizes
        .iter()
        .map(|&n| heap.allocate(request_for(&heap, n)).unwrap())
        .collect();
    unsafe {
        heap.deallocate(ptrs[3]);
        heap.deallocate(ptrs[4]);
        heap.deallocate(ptrs[1]);
    }
    heap.verify().unwrap();

    for block in heap.blocks() {
        for addr in span(&block).step_by(7) {
            assert_eq!(heap.find_block_for(addr as *const u8), Some(block));
        }
    }

    assert_eq!(heap.find_block_for(heap.high()), None);
    assert_eq!(heap.find_block_for(heap.low_boundary().wrapping_sub(1)), None);
    let uncarved = heap.low_boundary() as usize + heap.segment_size() * heap.next_segment();
    assert!(heap.contains(uncarved as *const u8));
    assert_eq!(heap.find_block_for(uncarved as *const u8), None);
}

#[test]
fn iteration() {
    let mut heap = new_heap(65536, 16384, config());
    assert_eq!(heap.first_block(), None);

    let ptrs: Vec<_> = (1..=6)
        .map(|n| heap.allocate(request_for(&heap, n)).unwrap())
        .collect();
    unsafe {
        heap.deallocate(ptrs[1]);
        heap.deallocate(ptrs[4]);
    }

    let blocks: Vec<_> = heap.blocks().collect();
    assert_eq!(blocks.len(), 6);
    assert_eq!(blocks.iter().map(|b| b.segments()).sum::<usize>(), heap.next_segment());

    let mut block = heap.first_block();
    for expected in &blocks {
        assert_eq!(block.as_ref(), Some(expected));
        block = heap.next_block(expected);
    }
    assert_eq!(block, None);

    let used: Vec<_> = heap.used_blocks().map(|b| b.allocated_space()).collect();
    assert_eq!(used, [ptrs[0], ptrs[2], ptrs[3], ptrs[5]]);

    let mut used = Vec::new();
    let mut block = heap.first_used();
    while let Some(b) = block {
        used.push(b.allocated_space());
        block = heap.next_used(&b);
    }
    assert_eq!(used, [ptrs[0], ptrs[2], ptrs[3], ptrs[5]]);
    let free: Vec<_> = heap.free_blocks().map(|b| b.segments()).collect();
    assert_eq!(free, [2, 5]);
}

#[test]
fn expand() {
    let mut heap = new_heap(16384, 4096, config());
    while heap.allocate(0).is_some() {}
    assert_eq!(heap.next_segment(), heap.committed_segments());
    assert_eq!(heap.expand_by(0), Ok(()));

    heap.expand_by(1).unwrap();
    assert_eq!(heap.capacity(), 8192);
    assert!(heap.allocate(0).is_some());
    heap.verify().unwrap();

    assert_eq!(heap.expand_by(8193), Err(ExpandError::ExceedsReservation));
    assert_eq!(heap.capacity(), 8192);
    assert_eq!(heap.expand_by(usize::MAX), Err(ExpandError::ExceedsReservation));

    heap.expand_by(8192).unwrap();
    assert_eq!(heap.capacity(), heap.max_capacity());
    assert_eq!(heap.committed_segments(), heap.reserved_segments());
    heap.verify().unwrap();
}

/// Delegates to the system allocator, but fails commits once a budget runs
/// out.
struct FlakySource {
    inner: TestSource,
    commits_left: Cell<usize>,
}

unsafe impl MemorySource for FlakySource {
    unsafe fn reserve(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.inner.reserve(size)
    }

    unsafe fn commit(&mut self, start: NonNull<u8>, len: usize) -> bool {
        match self.commits_left.get() {
            0 => false,
            n => {
                self.commits_left.set(n - 1);
                self.inner.commit(start, len)
            }
        }
    }

    unsafe fn release(&mut self, start: NonNull<u8>, size: usize) {
        self.inner.release(start, size)
    }

    fn page_size(&self) -> usize {
        self.inner.page_size()
    }
}

fn flaky(commits: usize) -> FlakySource {
    FlakySource {
        inner: Init::INIT,
        commits_left: Cell::new(commits),
    }
}

#[test]
fn commit_failures() {
    let _ = env_logger::builder().is_test(true).try_init();
    assert_eq!(
        CodeHeap::reserve(flaky(0), 65536, 4096, config()).map(drop),
        Err(ReserveError::CommitFailed)
    );
    // The segment map's commit fails
    assert_eq!(
        CodeHeap::reserve(flaky(1), 65536, 4096, config()).map(drop),
        Err(ReserveError::CommitFailed)
    );

    let mut heap = CodeHeap::reserve(flaky(2), 65536, 4096, config()).unwrap();
    let p = heap.allocate(100).unwrap();
    assert_eq!(heap.expand_by(4096), Err(ExpandError::CommitFailed));
    assert_eq!(heap.capacity(), 4096);
    assert_eq!(heap.committed_segments(), 64);
    heap.verify().unwrap();

    heap.source().commits_left.set(1);
    heap.expand_by(4096).unwrap();
    assert_eq!(heap.committed_segments(), 128);
    unsafe { heap.deallocate(p) };
    heap.verify().unwrap();
}

#[test]
fn expand_after_a_partial_commit_failure() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut heap = CodeHeap::reserve(flaky(2), 4 << 20, 256 << 10, config()).unwrap();
    let p = heap.allocate(100).unwrap();

    // The segment map grows, then the block storage fails to commit
    heap.source().commits_left.set(1);
    assert_eq!(heap.expand_by(512 << 10), Err(ExpandError::CommitFailed));
    assert_eq!(heap.capacity(), 256 << 10);
    assert_eq!(heap.committed_segments(), 4096);
    heap.verify().unwrap();

    // A smaller request fits in the segment map that is already committed
    heap.source().commits_left.set(10);
    heap.expand_by(4096).unwrap();
    assert_eq!(heap.capacity(), (256 << 10) + 4096);
    assert_eq!(heap.committed_segments(), 4160);
    heap.verify().unwrap();

    // A larger one goes past it again
    heap.expand_by(512 << 10).unwrap();
    assert_eq!(heap.capacity(), (768 << 10) + 4096);
    assert_eq!(heap.committed_segments(), 12352);
    unsafe { heap.deallocate(p) };
    heap.verify().unwrap();
}

#[test]
fn freed_blocks_are_zapped() {
    let mut heap = new_heap(65536, 16384, config());
    let p = heap.allocate(request_for(&heap, 3)).unwrap();
    heap.allocate(0).unwrap();
    unsafe {
        p.as_ptr().write_bytes(0x42, request_for(&heap, 3));
        heap.deallocate(p);
    }
    heap.verify().unwrap();
    let body = unsafe { std::slice::from_raw_parts(p.as_ptr(), request_for(&heap, 3)) };
    assert!(body.iter().all(|&x| x == ZAP_FREE));

    // A stray write is caught
    unsafe { *p.as_ptr().add(5) = 0 };
    assert!(heap.verify().is_err());
}

#[cfg(unix)]
#[test]
fn default_source() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut heap = CodeHeap::with_default_source(1 << 20, 1 << 16, config()).unwrap();
    let p = heap.allocate(5000).unwrap();
    unsafe {
        p.as_ptr().write_bytes(0x90, 5000);
        heap.deallocate(p);
    }
    heap.expand_by(1 << 16).unwrap();
    let q = heap.allocate(100_000).unwrap();
    unsafe { q.as_ptr().write_bytes(0x90, 100_000) };
    heap.verify().unwrap();
}

struct Live {
    ptr: NonNull<u8>,
    len: usize,
    tag: u8,
}

impl Live {
    fn fill(&self) {
        for i in 0..self.len {
            unsafe { *self.ptr.as_ptr().add(i) = (i as u8) ^ self.tag };
        }
    }

    fn check(&self) {
        for i in 0..self.len {
            let x = unsafe { *self.ptr.as_ptr().add(i) };
            assert_eq!(x, (i as u8) ^ self.tag, "{:p}+{} was overwritten", self.ptr, i);
        }
    }
}

#[quickcheck]
fn random(segment_shift: u8, min_block_segments: u8, bytecode: Vec<u8>) {
    random_inner(segment_shift, min_block_segments, bytecode);
}

fn random_inner(segment_shift: u8, min_block_segments: u8, bytecode: Vec<u8>) -> Option<()> {
    let segment_size = 32usize.max(HEADER_SIZE) << (segment_shift % 3);
    let min_block_segments = 1 + min_block_segments as usize % 3;
    let config = config()
        .with_segment_size(segment_size)
        .with_min_block_segments(min_block_segments)
        .with_fragmentation_limit(8)
        .with_freelist_limit(4);
    let mut heap = new_heap(65536, 4096, config);
    let mut sa = ShadowHeap::new();
    let base = heap.low_boundary() as usize;
    let shadow = |block: &Block| {
        let r = span(block);
        r.start - base..r.end - base
    };

    let mut allocs: Vec<Live> = Vec::new();
    let mut tag = 0u8;
    let mut it = bytecode.iter().cloned();
    loop {
        match it.next()? % 8 {
            0..=2 => {
                let len = u16::from_le_bytes([it.next()?, it.next()?]) as usize % 2048;
                log::trace!("alloc {}", len);
                match heap.allocate(len) {
                    Some(ptr) => {
                        let block = heap.find_block_for(ptr.as_ptr()).unwrap();
                        assert_eq!(block.allocated_space(), ptr);
                        assert!(block.allocated_size() >= len);
                        sa.allocate(shadow(&block));

                        tag = tag.wrapping_add(1);
                        let live = Live { ptr, len, tag };
                        live.fill();
                        allocs.push(live);
                    }
                    None => {
                        let needed = ((len + HEADER_SIZE + segment_size - 1) / segment_size)
                            .max(min_block_segments);
                        assert!(heap.free_blocks().all(|b| b.segments() < needed));
                        assert!(heap.committed_segments() - heap.next_segment() < needed);
                    }
                }
            }
            3..=4 => {
                if allocs.is_empty() {
                    continue;
                }
                let live = allocs.swap_remove(it.next()? as usize % allocs.len());
                log::trace!("dealloc {:p}", live.ptr);
                live.check();
                let block = heap.find_block_for(live.ptr.as_ptr()).unwrap();
                sa.deallocate(shadow(&block));
                unsafe { heap.deallocate(live.ptr) };
            }
            5 => {
                if allocs.is_empty() {
                    continue;
                }
                let i = it.next()? as usize % allocs.len();
                let new_len = (it.next()? as usize * 8) % (allocs[i].len + 1);
                let live = &mut allocs[i];
                log::trace!("dealloc_tail {:p} {} -> {}", live.ptr, live.len, new_len);
                live.check();

                let before = heap.find_block_for(live.ptr.as_ptr()).unwrap();
                unsafe { heap.deallocate_tail(live.ptr, new_len) };
                let after = heap.find_block_for(live.ptr.as_ptr()).unwrap();
                assert_eq!(after.start(), before.start());
                assert!(after.allocated_size() >= new_len);
                if after.segments() < before.segments() {
                    assert!(before.segments() - after.segments() >= min_block_segments);
                    let (whole, kept) = (shadow(&before), shadow(&after));
                    sa.deallocate(kept.end..whole.end);
                }
                live.len = new_len;
            }
            6 => {
                let bytes = it.next()? as usize * 64;
                let capacity = heap.capacity();
                log::trace!("expand_by {}", bytes);
                match heap.expand_by(bytes) {
                    Ok(()) => assert!(heap.capacity() >= capacity + bytes),
                    Err(ExpandError::ExceedsReservation) => {
                        assert_eq!(heap.capacity(), capacity);
                        assert!(capacity + bytes > heap.max_capacity());
                    }
                    Err(e) => panic!("{}", e),
                }
            }
            7 => {
                let repair = it.next()? % 2 == 0;
                let extra = heap.extra_hops();
                assert_eq!(heap.defrag_segmap(repair), extra);
                if repair {
                    assert_eq!(heap.extra_hops(), 0);
                }
            }
            _ => unreachable!(),
        }

        heap.verify().unwrap();

        assert_eq!(heap.blob_count(), allocs.len());
        assert_eq!(
            heap.allocated_capacity() + heap.allocated_in_freelists(),
            heap.next_segment() * segment_size
        );
        assert_eq!(
            heap.unallocated_capacity(),
            heap.max_capacity() - heap.allocated_capacity()
        );
        assert!(heap.max_allocated_capacity() >= heap.allocated_capacity());

        for live in &allocs {
            assert_eq!(heap.find_start(live.ptr.as_ptr()), Some(live.ptr));
            let header = unsafe { live.ptr.as_ptr().sub(1) };
            assert_eq!(heap.find_start(header), Some(live.ptr));
            if live.len > 0 {
                let last = unsafe { live.ptr.as_ptr().add(live.len - 1) };
                assert_eq!(heap.find_start(last), Some(live.ptr));
            }
        }

        for block in heap.blocks() {
            let expected = if block.is_free() {
                Region::Free
            } else {
                Region::Used
            };
            let r = shadow(&block);
            assert_eq!(sa.region_at(r.start), expected);
            assert_eq!(sa.region_at(r.end - 1), expected);
        }
        let carved = heap.next_segment() * segment_size;
        assert_eq!(sa.region_at(carved), Region::Uncarved);
    }
}
