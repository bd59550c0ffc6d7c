//! A reserved address range with a committed prefix
use core::ptr::NonNull;

use crate::{heap::ReserveError, source::MemorySource, utils::is_aligned};

/// Tracks one reservation made through a [`MemorySource`]. The committed
/// part always starts at `low` and only grows.
#[derive(Debug)]
pub(crate) struct VirtualSpace {
    low: NonNull<u8>,
    reserved: usize,
    committed: usize,
}

impl VirtualSpace {
    /// Reserve `reserved` bytes and commit the first `committed` bytes.
    /// Both must be multiples of the source's page size.
    ///
    /// On a commit failure, the reservation is released again.
    pub fn reserve<S: MemorySource>(
        source: &mut S,
        reserved: usize,
        committed: usize,
    ) -> Result<Self, ReserveError> {
        debug_assert!(reserved > 0 && committed <= reserved);
        debug_assert!(is_aligned(reserved, source.page_size()));
        debug_assert!(is_aligned(committed, source.page_size()));

        // Safety: `reserved` is not zero
        let low = unsafe { source.reserve(reserved) }.ok_or(ReserveError::ReserveFailed)?;
        let mut this = Self {
            low,
            reserved,
            committed: 0,
        };

        if !this.expand_by(source, committed) {
            // Safety: `low` is the reservation we just made
            unsafe { source.release(low, reserved) };
            return Err(ReserveError::CommitFailed);
        }

        Ok(this)
    }

    /// Commit `bytes` more bytes. Returns `false` without changing anything
    /// if the reservation is too small or the source refuses.
    pub fn expand_by<S: MemorySource>(&mut self, source: &mut S, bytes: usize) -> bool {
        debug_assert!(is_aligned(bytes, source.page_size()));
        if bytes == 0 {
            return true;
        }
        if bytes > self.uncommitted() {
            return false;
        }

        // Safety: `high..high + bytes` is page-aligned and lies inside the
        //         reservation
        let high = unsafe { NonNull::new_unchecked(self.low.as_ptr().add(self.committed)) };
        if !unsafe { source.commit(high, bytes) } {
            return false;
        }
        self.committed += bytes;
        true
    }

    /// Give the reservation back to `source`.
    ///
    /// # Safety
    ///
    /// `source` must be the source the space was reserved from. Nothing in
    /// the range may be accessed afterwards.
    pub unsafe fn release<S: MemorySource>(&self, source: &mut S) {
        source.release(self.low, self.reserved);
    }

    #[inline]
    pub fn low(&self) -> NonNull<u8> {
        self.low
    }

    /// The end of the committed part.
    #[inline]
    pub fn high(&self) -> usize {
        self.low.as_ptr() as usize + self.committed
    }

    /// The end of the reservation.
    #[inline]
    pub fn high_boundary(&self) -> usize {
        self.low.as_ptr() as usize + self.reserved
    }

    #[inline]
    pub fn reserved_size(&self) -> usize {
        self.reserved
    }

    #[inline]
    pub fn committed_size(&self) -> usize {
        self.committed
    }

    #[inline]
    pub fn uncommitted(&self) -> usize {
        self.reserved - self.committed
    }
}
