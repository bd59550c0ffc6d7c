/// Round `x` up to a multiple of `align`, which must be a power of two.
/// Returns `None` on overflow.
#[inline]
pub fn checked_align_up(x: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    Some(x.checked_add(align - 1)? & !(align - 1))
}

/// Round `x` up to a multiple of `align`, which must be a power of two.
///
/// The caller must make sure this does not overflow.
#[inline]
pub fn align_up(x: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (x + (align - 1)) & !(align - 1)
}

/// Check whether `x` is a multiple of `align`, which must be a power of two.
#[inline]
pub fn is_aligned(x: usize, align: usize) -> bool {
    debug_assert!(align.is_power_of_two());
    x & (align - 1) == 0
}

/// `ceil(x / y)`
#[inline]
pub fn div_ceil(x: usize, y: usize) -> usize {
    // FIXME: Use `usize::div_ceil` (stabilized in Rust 1.73)
    (x + (y - 1)) / y
}
