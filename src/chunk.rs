//! Chunk layout and boundary-tag primitives.
//!
//! Every region the allocator hands out or holds free is a *chunk*: a
//! contiguous span of memory with a two-word header.
//!
//! ```text
//!      -8  |  prev_size  |  <- only meaningful if the previous chunk is free
//!       0  |  size | flags |  <- `chunk` points here
//!       8  |  fd (free only)  |  <- user pointer also points here
//!      16  |  bk (free only)  |
//!       .  |        ...        |
//!     s-8  |  size (free only, foot)  |  <- equals the word at `chunk + size`
//! ```
//!
//! The low two bits of the size word are stolen as flags since every chunk
//! size is a multiple of [`ALIGN`]. Nothing here owns any memory; every
//! function is a thin, `unsafe`, O(1) pointer operation and callers are
//! responsible for the addresses being valid chunks.

use crate::ptr_utils::{align_up_size, ALIGN, WORD_SIZE};

/// Set iff the physically preceding chunk is in use (or doesn't exist).
pub const PREV_INUSE: usize = 1 << 0;
/// Set iff this chunk was obtained directly from the page-mapping provider.
pub const IS_MMAPPED: usize = 1 << 1;

const SIZE_MASK: usize = !(PREV_INUSE | IS_MMAPPED);

/// Offset from a chunk's base to its user pointer.
pub const CHUNK_OVERHEAD: usize = ALIGN;

/// Smallest chunk capable of holding a size word, `fd`, and `bk`.
pub const MIN_CHUNK_SIZE: usize = 4 * WORD_SIZE;

/// Given a user request in bytes, compute the chunk size that will hold it,
/// including overhead, rounded up to [`ALIGN`].
///
/// Returns `None` if `req` is large enough that padding it would wrap around
/// zero (mirrors glibc's `REQUEST_OUT_OF_RANGE` check).
#[inline]
pub const fn request2size(req: usize) -> Option<usize> {
    if req > usize::MAX - 2 * MIN_CHUNK_SIZE {
        return None;
    }

    let padded = req + WORD_SIZE;
    let size = if padded <= MIN_CHUNK_SIZE { MIN_CHUNK_SIZE } else { align_up_size(padded, ALIGN) };

    Some(size)
}

/// Read the chunk's size, with flag bits masked off.
#[inline]
pub unsafe fn size(chunk: *mut u8) -> usize {
    chunk.add(WORD_SIZE).cast::<usize>().read() & SIZE_MASK
}

/// Read the chunk's raw size-and-flags word.
#[inline]
pub unsafe fn size_and_flags(chunk: *mut u8) -> usize {
    chunk.add(WORD_SIZE).cast::<usize>().read()
}

/// Overwrite the size word, preserving the current flag bits.
#[inline]
pub unsafe fn set_size_keep_flags(chunk: *mut u8, new_size: usize) {
    debug_assert!(new_size & !SIZE_MASK == 0);
    let flags = size_and_flags(chunk) & !SIZE_MASK;
    chunk.add(WORD_SIZE).cast::<usize>().write(new_size | flags);
}

/// Overwrite the size word and flags wholesale.
#[inline]
pub unsafe fn set_size_and_flags(chunk: *mut u8, new_size: usize, flags: usize) {
    debug_assert!(new_size & !SIZE_MASK == 0);
    chunk.add(WORD_SIZE).cast::<usize>().write(new_size | flags);
}

#[inline]
pub unsafe fn prev_inuse(chunk: *mut u8) -> bool {
    size_and_flags(chunk) & PREV_INUSE != 0
}

#[inline]
pub unsafe fn is_mmapped(chunk: *mut u8) -> bool {
    size_and_flags(chunk) & IS_MMAPPED != 0
}

#[inline]
pub unsafe fn set_prev_inuse(chunk: *mut u8) {
    let word = size_and_flags(chunk) | PREV_INUSE;
    chunk.add(WORD_SIZE).cast::<usize>().write(word);
}

#[inline]
pub unsafe fn clear_prev_inuse(chunk: *mut u8) {
    let word = size_and_flags(chunk) & !PREV_INUSE;
    chunk.add(WORD_SIZE).cast::<usize>().write(word);
}

/// Read the `prev_size` slot (only meaningful when the predecessor is free).
#[inline]
pub unsafe fn prev_size(chunk: *mut u8) -> usize {
    chunk.cast::<usize>().read()
}

#[inline]
pub unsafe fn set_prev_size(chunk: *mut u8, prev_size: usize) {
    chunk.cast::<usize>().write(prev_size);
}

/// Write the trailing size foot of a free chunk (the next chunk's `prev_size`).
#[inline]
pub unsafe fn set_foot(chunk: *mut u8, size: usize) {
    set_prev_size(chunk.add(size), size);
}

/// The physically next chunk, given this chunk's base and size.
#[inline]
pub unsafe fn next_chunk(chunk: *mut u8, size: usize) -> *mut u8 {
    chunk.add(size)
}

/// The physically previous chunk, valid only when `prev_inuse(chunk)` is false.
#[inline]
pub unsafe fn prev_chunk(chunk: *mut u8) -> *mut u8 {
    chunk.sub(prev_size(chunk))
}

/// User pointer handed to callers, given a chunk base.
#[inline]
pub unsafe fn chunk_to_mem(chunk: *mut u8) -> *mut u8 {
    chunk.add(CHUNK_OVERHEAD)
}

/// Chunk base, given a user pointer previously returned to a caller.
#[inline]
pub unsafe fn mem_to_chunk(mem: *mut u8) -> *mut u8 {
    mem.sub(CHUNK_OVERHEAD)
}

/// Usable payload size for a chunk of the given total `size`: the chunk size
/// minus the one-word header overhead that precedes the user pointer.
#[inline]
pub const fn usable_size_of(size: usize, mmapped: bool) -> usize {
    // the mmapped case reserves an extra word for the leading misalignment
    // stashed in `prev_size`, see `system::page_alloc`.
    if mmapped {
        size - 2 * WORD_SIZE
    } else {
        size - WORD_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request2size_respects_minimum() {
        assert_eq!(request2size(0), Some(MIN_CHUNK_SIZE));
        assert_eq!(request2size(1), Some(MIN_CHUNK_SIZE));
        assert_eq!(request2size(MIN_CHUNK_SIZE - WORD_SIZE), Some(MIN_CHUNK_SIZE));
    }

    #[test]
    fn request2size_rounds_up_to_align() {
        let nb = request2size(MIN_CHUNK_SIZE).unwrap();
        assert_eq!(nb % ALIGN, 0);
        assert!(nb >= MIN_CHUNK_SIZE + WORD_SIZE);
    }

    #[test]
    fn request2size_rejects_overflow() {
        assert!(request2size(usize::MAX).is_none());
        assert!(request2size(usize::MAX - 2 * MIN_CHUNK_SIZE + 1).is_none());
    }

    #[test]
    fn flags_round_trip() {
        let mut backing = [0u8; MIN_CHUNK_SIZE * 2];
        let chunk = backing.as_mut_ptr();
        unsafe {
            set_size_and_flags(chunk, MIN_CHUNK_SIZE, PREV_INUSE);
            assert_eq!(size(chunk), MIN_CHUNK_SIZE);
            assert!(prev_inuse(chunk));
            assert!(!is_mmapped(chunk));

            clear_prev_inuse(chunk);
            assert!(!prev_inuse(chunk));
            assert_eq!(size(chunk), MIN_CHUNK_SIZE);

            set_prev_inuse(chunk);
            assert!(prev_inuse(chunk));
        }
    }
}
