//! Bitmap allocator for aperture pages.
//!
//! One bit per aperture page, set while some mapping owns the page. Allocation is next-fit: the
//! scan resumes where the previous allocation ended and wraps to the start of the aperture on a
//! miss, which spreads mappings over the whole window instead of hammering the low pages.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::ApertureError;

const BITS_PER_WORD: usize = u64::BITS as usize;

/// Bitmap storage plus the next-fit cursor, guarded together by one lock.
#[derive(Debug)]
struct BitmapState {
    words: Vec<u64>,
    page_count: usize,
    /// Index the next scan starts from. Advisory: it only changes scan order.
    next_free_hint: usize,
    used: usize,
}

impl BitmapState {
    fn is_set(&self, index: usize) -> bool {
        self.words[index / BITS_PER_WORD] & (1 << (index % BITS_PER_WORD)) != 0
    }

    fn set(&mut self, index: usize) {
        self.words[index / BITS_PER_WORD] |= 1 << (index % BITS_PER_WORD);
    }

    fn clear(&mut self, index: usize) {
        self.words[index / BITS_PER_WORD] &= !(1 << (index % BITS_PER_WORD));
    }

    /// Finds `size` clear bits in a row whose first bit lies in `[from, to)`.
    ///
    /// The run itself may extend past `to`, up to the end of the bitmap.
    fn find_clear_run(&self, from: usize, to: usize, size: usize) -> Option<usize> {
        let mut index = from;
        while index < to && index + size <= self.page_count {
            // Skip fully used words in one step.
            if index % BITS_PER_WORD == 0 && self.words[index / BITS_PER_WORD] == u64::MAX {
                index += BITS_PER_WORD;
                continue;
            }
            if self.is_set(index) {
                index += 1;
                continue;
            }

            let mut end = index + 1;
            while end < index + size && !self.is_set(end) {
                end += 1;
            }
            if end == index + size {
                return Some(index);
            }
            // `end` is set; no run can start before it.
            index = end + 1;
        }
        None
    }

    fn set_run(&mut self, start: usize, size: usize) {
        for index in start..start + size {
            if !self.is_set(index) {
                self.set(index);
                self.used += 1;
            }
        }
    }

    /// Clears a run and returns how many of its bits were actually set.
    fn clear_run(&mut self, start: usize, size: usize) -> usize {
        let mut cleared = 0;
        for index in start..start + size {
            if self.is_set(index) {
                self.clear(index);
                cleared += 1;
            }
        }
        self.used -= cleared;
        cleared
    }
}

/// Tracks which aperture pages are in use.
///
/// All mutation happens inside short critical sections of a single `spin::Mutex`; nothing in
/// here performs I/O or flushes, so hold times stay bounded by one bitmap scan.
#[derive(Debug)]
pub struct BitmapAllocator {
    state: spin::Mutex<BitmapState>,
    attempts: AtomicUsize,
}

impl BitmapAllocator {
    /// Creates an allocator for `page_count` pages, all free.
    ///
    /// Returns [`ApertureError::OutOfMemory`] if the bitmap storage cannot be allocated.
    pub fn try_new(page_count: usize) -> Result<Self, ApertureError> {
        let word_count = page_count.div_ceil(BITS_PER_WORD);
        let mut words = Vec::new();
        words
            .try_reserve_exact(word_count)
            .map_err(|_| ApertureError::OutOfMemory)?;
        words.resize(word_count, 0);

        Ok(Self {
            state: spin::Mutex::new(BitmapState {
                words,
                page_count,
                next_free_hint: 0,
                used: 0,
            }),
            attempts: AtomicUsize::new(0),
        })
    }

    /// Reserves `size` contiguous pages and returns the index of the first.
    ///
    /// Scans `[hint, page_count)` first, then wraps to `[0, hint)`. Returns None when no run of
    /// that size is free, or when `size` is zero.
    pub fn allocate(&self, size: usize) -> Option<usize> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if size == 0 {
            return None;
        }

        let mut state = self.state.lock();
        if size > state.page_count {
            return None;
        }

        let hint = state.next_free_hint;
        let start = state
            .find_clear_run(hint, state.page_count, size)
            .or_else(|| state.find_clear_run(0, hint, size))?;

        state.set_run(start, size);
        state.next_free_hint = start + size;
        if state.next_free_hint >= state.page_count {
            state.next_free_hint = 0;
        }
        Some(start)
    }

    /// Releases `size` pages starting at `start`.
    ///
    /// The next scan starts at `start`, so an alternating map/unmap workload keeps reusing the
    /// same pages.
    pub fn free(&self, start: usize, size: usize) {
        let mut state = self.state.lock();
        debug_assert!(start + size <= state.page_count, "free beyond aperture");

        let cleared = state.clear_run(start, size);
        if cleared != size {
            log::error!(
                "aperture pages {}..{} freed with {} pages already free",
                start,
                start + size,
                size - cleared
            );
        }
        state.next_free_hint = start;
    }

    /// Marks `size` pages starting at `start` as permanently in use, without moving the cursor.
    pub fn reserve(&self, start: usize, size: usize) {
        let mut state = self.state.lock();
        let end = (start + size).min(state.page_count);
        state.set_run(start, end.saturating_sub(start));
    }

    /// Returns whether the page at `index` is in use.
    pub fn is_allocated(&self, index: usize) -> bool {
        let state = self.state.lock();
        index < state.page_count && state.is_set(index)
    }

    /// Returns whether every page of the run is in use.
    pub fn is_run_allocated(&self, start: usize, size: usize) -> bool {
        let state = self.state.lock();
        start + size <= state.page_count && (start..start + size).all(|i| state.is_set(i))
    }

    /// Returns the number of pages tracked.
    pub fn page_count(&self) -> usize {
        self.state.lock().page_count
    }

    /// Returns the number of pages in use, reserved pages included.
    pub fn used_pages(&self) -> usize {
        self.state.lock().used
    }

    /// Returns the index the next scan starts from.
    pub fn next_free_hint(&self) -> usize {
        self.state.lock().next_free_hint
    }

    /// Returns how many times [`Self::allocate`] has been called.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Returns a copy of the raw bitmap words.
    pub fn snapshot(&self) -> Vec<u64> {
        self.state.lock().words.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(page_count: usize) -> BitmapAllocator {
        BitmapAllocator::try_new(page_count).unwrap()
    }

    #[test]
    fn allocates_from_start() {
        let bitmap = allocator(16);
        assert_eq!(bitmap.allocate(3), Some(0));
        assert_eq!(bitmap.allocate(2), Some(3));
        assert_eq!(bitmap.used_pages(), 5);
        assert_eq!(bitmap.next_free_hint(), 5);
    }

    #[test]
    fn zero_and_oversized_requests_fail() {
        let bitmap = allocator(8);
        assert_eq!(bitmap.allocate(0), None);
        assert_eq!(bitmap.allocate(9), None);
        assert_eq!(bitmap.used_pages(), 0);
    }

    #[test]
    fn exhaustion_returns_none() {
        let bitmap = allocator(4);
        assert_eq!(bitmap.allocate(4), Some(0));
        assert_eq!(bitmap.allocate(1), None);
    }

    #[test]
    fn hint_wraps_at_end() {
        let bitmap = allocator(8);
        assert_eq!(bitmap.allocate(8), Some(0));
        assert_eq!(bitmap.next_free_hint(), 0);
    }

    #[test]
    fn free_moves_hint_back() {
        let bitmap = allocator(16);
        let a = bitmap.allocate(4).unwrap();
        let _b = bitmap.allocate(4).unwrap();
        bitmap.free(a, 4);
        assert_eq!(bitmap.next_free_hint(), a);
        assert_eq!(bitmap.allocate(4), Some(a));
    }

    #[test]
    fn wraparound_finds_low_run() {
        let bitmap = allocator(8);
        let low = bitmap.allocate(3).unwrap();
        let mid = bitmap.allocate(3).unwrap();
        let high = bitmap.allocate(2).unwrap();
        assert_eq!((low, mid, high), (0, 3, 6));
        // The cursor passed the end and wrapped.
        assert_eq!(bitmap.next_free_hint(), 0);

        bitmap.free(low, 3);
        bitmap.free(high, 2);
        assert_eq!(bitmap.next_free_hint(), 6);
        // [6, 8) is too short, so only the wrapped scan can satisfy this.
        assert_eq!(bitmap.allocate(3), Some(0));
        assert_eq!(bitmap.next_free_hint(), 3);
    }

    #[test]
    fn wrapped_scan_after_hint_in_middle() {
        let bitmap = allocator(8);
        bitmap.reserve(0, 1);
        assert_eq!(bitmap.allocate(5), Some(1));
        assert_eq!(bitmap.allocate(2), Some(6));
        // Cursor wrapped to 0; free the low run and take the tail again.
        bitmap.free(1, 5);
        bitmap.free(6, 2);
        assert_eq!(bitmap.next_free_hint(), 6);
        // Three pages don't fit in [6, 8); the wrapped scan must find index 1.
        assert_eq!(bitmap.allocate(3), Some(1));
    }

    #[test]
    fn run_straddling_the_hint_is_found() {
        let bitmap = allocator(8);
        assert_eq!(bitmap.allocate(4), Some(0));
        assert_eq!(bitmap.allocate(4), Some(4));
        bitmap.free(2, 2);
        bitmap.free(4, 2);
        // Hint is 4 now, free pages are [2, 6).
        assert_eq!(bitmap.next_free_hint(), 4);
        assert_eq!(bitmap.allocate(4), Some(2));
    }

    #[test]
    fn reserve_is_never_handed_out() {
        let bitmap = allocator(8);
        bitmap.reserve(0, 2);
        assert_eq!(bitmap.used_pages(), 2);
        assert_eq!(bitmap.next_free_hint(), 0);
        assert_eq!(bitmap.allocate(6), Some(2));
        assert_eq!(bitmap.allocate(1), None);
    }

    #[test]
    fn alloc_free_round_trip_leaves_bitmap_unchanged() {
        let bitmap = allocator(130);
        bitmap.reserve(0, 3);
        let _held = bitmap.allocate(7).unwrap();
        let before = bitmap.snapshot();
        let used = bitmap.used_pages();

        for size in [1, 5, 64, 65, 2, 100] {
            let start = bitmap.allocate(size).unwrap();
            bitmap.free(start, size);
            assert_eq!(bitmap.snapshot(), before);
            assert_eq!(bitmap.used_pages(), used);
        }
    }

    #[test]
    fn live_allocations_never_overlap() {
        let bitmap = allocator(200);
        let sizes = [3usize, 17, 1, 64, 9, 2, 33, 5, 1, 8];
        let mut live: Vec<(usize, usize)> = Vec::new();

        // Interleave allocations and frees to exercise both scan phases.
        for (round, &size) in sizes.iter().cycle().take(60).enumerate() {
            if round % 3 == 2 && !live.is_empty() {
                let (start, len) = live.remove(round % live.len());
                bitmap.free(start, len);
            }
            if let Some(start) = bitmap.allocate(size) {
                for &(other, len) in &live {
                    assert!(
                        start + size <= other || other + len <= start,
                        "run {start}+{size} overlaps {other}+{len}"
                    );
                }
                live.push((start, size));
            }
        }

        let total: usize = live.iter().map(|&(_, len)| len).sum();
        assert_eq!(bitmap.used_pages(), total);
    }

    #[test]
    fn skips_full_words() {
        let bitmap = allocator(192);
        bitmap.reserve(0, 128);
        assert_eq!(bitmap.allocate(10), Some(128));
    }

    #[test]
    fn double_free_keeps_count_consistent() {
        let bitmap = allocator(8);
        let start = bitmap.allocate(2).unwrap();
        bitmap.free(start, 2);
        bitmap.free(start, 2);
        assert_eq!(bitmap.used_pages(), 0);
    }

    #[test]
    fn counts_attempts() {
        let bitmap = allocator(2);
        bitmap.allocate(1);
        bitmap.allocate(4);
        assert_eq!(bitmap.attempts(), 2);
    }

    #[test]
    fn run_queries() {
        let bitmap = allocator(8);
        bitmap.reserve(2, 3);
        assert!(bitmap.is_run_allocated(2, 3));
        assert!(!bitmap.is_run_allocated(1, 3));
        assert!(bitmap.is_allocated(4));
        assert!(!bitmap.is_allocated(5));
        assert!(!bitmap.is_allocated(100));
    }
}
