//! Alignment helpers and memory size constants.

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

/// Small page size.
pub const PAGE_SIZE: usize = 4 * KB;
/// Large page size used for command buffers and heaps.
pub const PAGE_SIZE_64K: usize = 64 * KB;
/// Cache line size assumed by the heap layout.
pub const CACHE_LINE_SIZE: usize = 64;

/// Round `value` up to the next multiple of `alignment` (a power of two).
#[must_use]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// 64-bit variant of [`align_up`] for GPU virtual addresses.
#[must_use]
pub const fn align_up_u64(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[must_use]
pub const fn align_down(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

#[must_use]
pub const fn is_aligned(value: usize, alignment: usize) -> bool {
    value & (alignment - 1) == 0
}

/// Integer division rounding toward positive infinity.
#[must_use]
pub const fn div_ceil_u32(value: u32, divisor: u32) -> u32 {
    value.div_ceil(divisor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn align_up_examples() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_up_u64(0x1001, 0x1000), 0x2000);
        assert_eq!(align_down(4097, PAGE_SIZE), PAGE_SIZE);
    }

    proptest! {
        #[test]
        fn align_up_is_smallest_aligned_upper_bound(value in 0usize..1 << 40, shift in 0u32..16) {
            let alignment = 1usize << shift;
            let aligned = align_up(value, alignment);
            prop_assert!(aligned >= value);
            prop_assert!(is_aligned(aligned, alignment));
            prop_assert!(aligned - value < alignment);
        }
    }
}
