//! Bin indexing and the binmap summary.
//!
//! This module is pure index arithmetic; it owns no storage. `heap::Heap`
//! holds the actual sentinel arrays and fastbin heads and consults these
//! functions to pick which one a chunk belongs to.

use crate::ptr_utils::ALIGN;

use crate::chunk::MIN_CHUNK_SIZE;

/// Number of fastbin size classes, one per [`ALIGN`]-byte step from
/// [`MIN_CHUNK_SIZE`] up to the largest chunk size `max_fast` can ever select
/// (request2size of the 80-byte tunable ceiling).
pub const NFASTBINS: usize = 10;

/// Total regular bins: index 0 is unused (kept so bin indices and array
/// indices coincide), 1 is the unsorted bin, 2..=31 are small bins, 32..=95
/// are large bins.
pub const NBINS: usize = 96;

pub const UNSORTED_BIN: usize = 1;
pub const FIRST_SMALL_BIN: usize = 2;
pub const LAST_SMALL_BIN: usize = 31;
pub const FIRST_LARGE_BIN: usize = 32;
pub const LAST_LARGE_BIN: usize = NBINS - 1;

/// Largest chunk size a small bin ever holds.
pub const MAX_SMALL_SIZE: usize = LAST_SMALL_BIN * 8;

/// Size classes at or above this are large-bin territory.
#[inline]
pub const fn in_smallbin_range(size: usize) -> bool {
    size <= MAX_SMALL_SIZE
}

/// Fastbin index for a chunk of this size. `size` must already be a multiple
/// of [`ALIGN`] at least [`MIN_CHUNK_SIZE`].
#[inline]
pub const fn fastbin_index(size: usize) -> usize {
    size / ALIGN - MIN_CHUNK_SIZE / ALIGN
}

/// Smallest size a fastbin slot of this index can hold.
#[inline]
pub const fn fastbin_size(index: usize) -> usize {
    (index + MIN_CHUNK_SIZE / ALIGN) * ALIGN
}

/// Exact-size small bin index; bin `i` holds chunks of size `8*i`.
#[inline]
pub const fn smallbin_index(size: usize) -> usize {
    size >> 3
}

/// Size a small bin of this index holds.
#[inline]
pub const fn smallbin_size(index: usize) -> usize {
    index << 3
}

/// Large bin index: a logarithmic schedule keyed on the position of the
/// highest set bit of `size >> 8` (the "decade"), refined by the next two
/// bits into one of four sub-bins. Anything with `size >= 65536` collapses
/// into the catch-all bin at the top of the range.
#[inline]
pub const fn largebin_index(size: usize) -> usize {
    if size >= 65536 {
        return LAST_LARGE_BIN;
    }

    let v = size >> 8;
    if v == 0 {
        return FIRST_LARGE_BIN;
    }

    let msb = usize::BITS as usize - 1 - v.leading_zeros() as usize;

    let idx = if msb < 2 {
        FIRST_LARGE_BIN + msb
    } else {
        let sub = (v >> (msb - 2)) & 0b11;
        let decade = msb - 2;
        FIRST_LARGE_BIN + 2 + decade * 4 + sub
    };

    if idx > LAST_LARGE_BIN - 1 { LAST_LARGE_BIN - 1 } else { idx }
}

/// Bin index (small or large) a free chunk of this size belongs in.
#[inline]
pub const fn bin_index(size: usize) -> usize {
    if in_smallbin_range(size) { smallbin_index(size) } else { largebin_index(size) }
}

/// A bit-vector summary of which regular bins are possibly non-empty.
///
/// Bits are set eagerly whenever a chunk is linked into a bin, but cleared
/// lazily: a set bit only means "check me", not "definitely occupied". Scans
/// that find a bin empty after all are expected to clear the bit themselves.
///
/// Backed by three 32-bit words (covering [`NBINS`] bits) plus a permanently
/// zero fourth word so a forward scan can use it as a sentinel without a
/// bounds check.
#[derive(Debug, Default)]
pub struct BinMap {
    words: [u32; 4],
}

const BITS_PER_WORD: usize = u32::BITS as usize;

impl BinMap {
    pub const fn new() -> Self {
        Self { words: [0; 4] }
    }

    #[inline]
    fn word_bit(index: usize) -> (usize, u32) {
        (index / BITS_PER_WORD, 1u32 << (index % BITS_PER_WORD))
    }

    #[inline]
    pub fn mark(&mut self, index: usize) {
        let (word, bit) = Self::word_bit(index);
        self.words[word] |= bit;
    }

    #[inline]
    pub fn clear(&mut self, index: usize) {
        let (word, bit) = Self::word_bit(index);
        self.words[word] &= !bit;
    }

    #[inline]
    pub fn is_marked(&self, index: usize) -> bool {
        let (word, bit) = Self::word_bit(index);
        self.words[word] & bit != 0
    }

    /// Find the lowest marked bin index `>= from`, or `None` if there isn't
    /// one within `NBINS`. The trailing zero word guarantees the search
    /// terminates without a separate bounds check on the last real word.
    pub fn next_marked_from(&self, from: usize) -> Option<usize> {
        let mut word = from / BITS_PER_WORD;
        let mut mask = !0u32 << (from % BITS_PER_WORD);

        while word < self.words.len() {
            let bits = self.words[word] & mask;
            if bits != 0 {
                let index = word * BITS_PER_WORD + bits.trailing_zeros() as usize;
                return if index < NBINS { Some(index) } else { None };
            }
            word += 1;
            mask = !0u32;
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fastbin_index_round_trips() {
        for i in 0..NFASTBINS {
            let size = fastbin_size(i);
            assert_eq!(fastbin_index(size), i);
        }
    }

    #[test]
    fn smallbin_index_matches_exact_size() {
        assert_eq!(smallbin_index(32), 4);
        assert_eq!(smallbin_index(248), 31);
        assert!(in_smallbin_range(248));
        assert!(!in_smallbin_range(256));
    }

    #[test]
    fn largebin_index_is_monotonic() {
        let mut prev = 0;
        let mut prev_idx = FIRST_LARGE_BIN;
        for size in (256..65536).step_by(64) {
            let idx = largebin_index(size);
            assert!(idx >= prev_idx, "{size} -> {idx} regressed from {prev_idx} at {prev}");
            prev = size;
            prev_idx = idx;
        }
        assert_eq!(largebin_index(65536), LAST_LARGE_BIN);
        assert_eq!(largebin_index(usize::MAX), LAST_LARGE_BIN);
    }

    #[test]
    fn binmap_marks_and_scans() {
        let mut map = BinMap::new();
        assert_eq!(map.next_marked_from(0), None);

        map.mark(5);
        map.mark(70);
        assert!(map.is_marked(5));
        assert_eq!(map.next_marked_from(0), Some(5));
        assert_eq!(map.next_marked_from(6), Some(70));

        map.clear(5);
        assert!(!map.is_marked(5));
        assert_eq!(map.next_marked_from(0), Some(70));
    }
}
