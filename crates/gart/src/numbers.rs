//! Page-count arithmetic shared by the allocator, the table and the manager.

use crate::arch::{PAGE_SHIFT, PAGE_SIZE};

/// Rounds `value` down to a multiple of `align`, which must be a power of two.
#[inline]
pub const fn round_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Returns the number of pages needed to hold `bytes` bytes.
#[inline]
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

/// Returns the number of pages touched by a buffer of `length` bytes that starts `offset`
/// bytes into its first page, or None if the end overflows.
#[inline]
pub const fn span_pages(offset: usize, length: usize) -> Option<usize> {
    match offset.checked_add(length) {
        Some(end) => Some(end.div_ceil(PAGE_SIZE)),
        None => None,
    }
}

/// Returns the smallest order such that `2^order` pages hold `bytes` bytes.
///
/// Zero bytes has order zero.
#[inline]
pub const fn order_for(bytes: usize) -> u32 {
    let pages = pages_for(bytes);
    if pages <= 1 {
        0
    } else {
        pages.next_power_of_two().trailing_zeros()
    }
}

/// Returns the number of bytes covered by `pages` pages.
#[inline]
pub const fn pages_to_bytes(pages: usize) -> u64 {
    (pages as u64) << PAGE_SHIFT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_for_partial_page() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
    }

    #[test]
    fn span_pages_counts_leading_offset() {
        // 100 bytes into the first page, 10000 bytes long: crosses into a third page.
        assert_eq!(span_pages(100, 10000), Some(3));
        assert_eq!(span_pages(0, PAGE_SIZE), Some(1));
        assert_eq!(span_pages(1, PAGE_SIZE), Some(2));
        assert_eq!(span_pages(1, usize::MAX), None);
    }

    #[test]
    fn order_rounds_to_power_of_two() {
        assert_eq!(order_for(1), 0);
        assert_eq!(order_for(PAGE_SIZE), 0);
        assert_eq!(order_for(PAGE_SIZE + 1), 1);
        assert_eq!(order_for(3 * PAGE_SIZE), 2);
        assert_eq!(order_for(4 * PAGE_SIZE), 2);
        assert_eq!(order_for(5 * PAGE_SIZE), 3);
    }

    #[test]
    fn rounding() {
        assert_eq!(round_down(0x1fff, 0x1000), 0x1000);
        assert_eq!(round_down(0x2000, 0x1000), 0x2000);
        assert_eq!(round_down(5 << 20, 2 << 20), 4 << 20);
    }

    #[test]
    fn bytes_from_pages() {
        assert_eq!(pages_to_bytes(3), 3 * PAGE_SIZE as u64);
    }
}
