//! This crate implements a code heap: a segment-based allocator for
//! variable-length blocks of generated machine code, in the style of the
//! code caches found in JIT compilers.
//!
//!  - **Any interior address resolves to its block in a bounded number of
//!    steps.** A byte-per-segment map encodes hop distances back to each
//!    block's start, so stack walkers and profilers can go from a return
//!    address to the enclosing code blob without a search.
//!
//!  - **Lookups need no lock.** [`LockedCodeHeap`] serializes mutations
//!    while letting other threads resolve addresses concurrently.
//!
//!  - **Address space is reserved up front and committed incrementally.**
//!    Blocks never move, and the heap grows in place with
//!    [`CodeHeap::expand_by`].
//!
//!  - **Free memory is kept compact.** Freed blocks are merged with their
//!    free neighbours eagerly, and an allocation takes the best-fitting free
//!    block before touching untouched memory.
//!
//! The memory itself comes from a [`MemorySource`]: [`MmapSource`] on Unix,
//! or any [`GlobalAlloc`](core::alloc::GlobalAlloc) through
//! [`GlobalAllocSource`].
//!
//! # Examples
//!
//! ```rust
//! use codeheap::{CodeHeap, HeapConfig};
//!
//! let config = HeapConfig::default().with_segment_size(128);
//! let mut heap = CodeHeap::with_default_source(1 << 20, 64 << 10, config).unwrap();
//!
//! let code = heap.allocate(1000).unwrap();
//! unsafe { code.as_ptr().write_bytes(0xc3, 1000) };
//!
//! // An address inside the block leads back to its start
//! let return_address = unsafe { code.as_ptr().add(640) };
//! assert_eq!(heap.find_start(return_address), Some(code));
//!
//! // Keep only what was actually emitted
//! unsafe { heap.deallocate_tail(code, 300) };
//! assert!(heap.allocated_capacity() < 1024);
//!
//! unsafe { heap.deallocate(code) };
//! assert_eq!(heap.find_start(return_address), None);
//! heap.verify().unwrap();
//! ```
#![no_std]
#![cfg_attr(feature = "doc_cfg", feature(doc_cfg))]

#[cfg(any(test, feature = "std"))]
extern crate std;

mod block;
mod config;
mod heap;
mod segmap;
mod segment;
mod source;
mod space;
mod utils;

#[cfg(feature = "std")]
#[cfg_attr(feature = "doc_cfg", doc(cfg(feature = "std")))]
mod sync;

pub use self::{
    block::{Block, HEADER_SIZE},
    config::{HeapConfig, Init},
    heap::{Blocks, CodeHeap, ExpandError, FreeBlocks, ReserveError, ZAP_FREE},
    source::{GlobalAllocSource, MemorySource},
};

#[cfg(unix)]
pub use self::source::MmapSource;

#[cfg(any(unix, feature = "std"))]
pub use self::source::DefaultSource;

#[cfg(feature = "std")]
pub use self::sync::{LockGuard, LockedCodeHeap};

#[cfg(test)]
mod tests;
