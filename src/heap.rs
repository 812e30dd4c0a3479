//! The allocator's bookkeeping engine: fastbins, regular bins, the top
//! chunk, consolidation, and the system-memory escalation path.
//!
//! Everything here operates on raw chunk pointers; the only types crossing
//! the public boundary are [`NonNull<u8>`] user pointers and the plain-data
//! [`Info`]/[`Stats`] snapshots. Callers (see [`crate::lock`]) are
//! responsible for mutual exclusion — `Heap` itself assumes single-threaded,
//! non-reentrant access, matching its C ancestor.

use core::ptr::NonNull;

use crate::bins::{self, BinMap, NBINS, NFASTBINS};
use crate::chunk::{self, IS_MMAPPED, MIN_CHUNK_SIZE, PREV_INUSE};
use crate::error::AllocError;
use crate::ptr_utils::{self, align_up_size, WORD_SIZE};
use crate::system::{ProviderError, SystemProvider};
use crate::tunables::{Param, Tunables};

/// Threshold (bytes) at which a failed `morecore` falls back to page-mapping
/// a replacement contiguous-ish block, mirroring glibc's default.
const MMAP_AS_MORECORE_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Default, Clone, Copy)]
struct BinList {
    head: *mut u8,
    tail: *mut u8,
}

/// Point-in-time memory accounting, as returned by [`Heap::stats`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub sbrked_mem: usize,
    pub mmapped_mem: usize,
    pub max_sbrked_mem: usize,
    pub max_mmapped_mem: usize,
    pub n_mmaps: usize,
    pub max_n_mmaps: usize,
}

/// Arena-level summary, as returned by [`Heap::info`].
#[derive(Debug, Clone, Copy)]
pub struct Info {
    pub arena: usize,
    pub in_use: usize,
    pub free_blocks: usize,
    pub max_arena: usize,
}

/// The allocator state machine. One process-wide instance is expected;
/// wrap it in [`crate::lock::Locked`] to use it as a `GlobalAlloc`.
pub struct Heap<P: SystemProvider> {
    provider: P,
    tunables: Tunables,
    initialized: bool,
    fast_chunks: bool,
    any_chunks: bool,
    contiguous: bool,

    fastbins: [*mut u8; NFASTBINS],
    bins: [BinList; NBINS],
    binmap: BinMap,

    top: *mut u8,
    top_size: usize,
    last_remainder: *mut u8,
    arena_base: *mut u8,

    stats: Stats,
}

unsafe impl<P: SystemProvider + Send> Send for Heap<P> {}

// --- chunk-local fd/bk accessors -------------------------------------------
//
// Free chunks repurpose their first two payload words (where `fd`/`bk` live)
// to link into a bin. Fastbin chunks only ever use the `fd` slot, forming a
// singly-linked LIFO.

#[inline]
unsafe fn get_fd(chunk: *mut u8) -> *mut u8 {
    chunk::chunk_to_mem(chunk).cast::<*mut u8>().read()
}

#[inline]
unsafe fn set_fd(chunk: *mut u8, fd: *mut u8) {
    chunk::chunk_to_mem(chunk).cast::<*mut u8>().write(fd);
}

#[inline]
unsafe fn get_bk(chunk: *mut u8) -> *mut u8 {
    chunk::chunk_to_mem(chunk).add(WORD_SIZE).cast::<*mut u8>().read()
}

#[inline]
unsafe fn set_bk(chunk: *mut u8, bk: *mut u8) {
    chunk::chunk_to_mem(chunk).add(WORD_SIZE).cast::<*mut u8>().write(bk);
}

impl<P: SystemProvider> Heap<P> {
    pub const fn new(provider: P) -> Self {
        Self::with_tunables(provider, Tunables::default())
    }

    pub const fn with_tunables(provider: P, tunables: Tunables) -> Self {
        Self {
            provider,
            tunables,
            initialized: false,
            fast_chunks: false,
            any_chunks: false,
            contiguous: true,
            fastbins: [core::ptr::null_mut(); NFASTBINS],
            bins: [BinList { head: core::ptr::null_mut(), tail: core::ptr::null_mut() }; NBINS],
            binmap: BinMap::new(),
            top: core::ptr::null_mut(),
            top_size: 0,
            last_remainder: core::ptr::null_mut(),
            arena_base: core::ptr::null_mut(),
            stats: Stats {
                sbrked_mem: 0,
                mmapped_mem: 0,
                max_sbrked_mem: 0,
                max_mmapped_mem: 0,
                n_mmaps: 0,
                max_n_mmaps: 0,
            },
        }
    }

    pub fn tunables(&self) -> Tunables {
        self.tunables
    }

    #[inline]
    fn mem_ptr(&self, chunk: *mut u8) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(chunk::chunk_to_mem(chunk)) }
    }

    /// Chunk size, in bytes, at or below which a free is cached in a
    /// fastbin rather than classified. Zero while `max_fast` is zero.
    #[inline]
    fn max_fast_chunk_size(&self) -> usize {
        if self.tunables.max_fast == 0 {
            0
        } else {
            chunk::request2size(self.tunables.max_fast).unwrap_or(0)
        }
    }

    // --- regular bin list primitives ----------------------------------

    fn bin_push_front(&mut self, idx: usize, chunk: *mut u8) {
        unsafe {
            let old_head = self.bins[idx].head;
            set_fd(chunk, old_head);
            set_bk(chunk, core::ptr::null_mut());
            if !old_head.is_null() {
                set_bk(old_head, chunk);
            } else {
                self.bins[idx].tail = chunk;
            }
        }
        self.bins[idx].head = chunk;
        self.binmap.mark(idx);
    }

    fn bin_push_back(&mut self, idx: usize, chunk: *mut u8) {
        unsafe {
            let old_tail = self.bins[idx].tail;
            set_bk(chunk, old_tail);
            set_fd(chunk, core::ptr::null_mut());
            if !old_tail.is_null() {
                set_fd(old_tail, chunk);
            } else {
                self.bins[idx].head = chunk;
            }
        }
        self.bins[idx].tail = chunk;
        self.binmap.mark(idx);
    }

    /// Insert `chunk` immediately before `before` (or at the tail if
    /// `before` is null).
    fn bin_insert_before(&mut self, idx: usize, chunk: *mut u8, before: *mut u8) {
        if before.is_null() {
            self.bin_push_back(idx, chunk);
            return;
        }

        unsafe {
            let prev = get_bk(before);
            set_bk(chunk, prev);
            set_fd(chunk, before);
            set_bk(before, chunk);
            if !prev.is_null() {
                set_fd(prev, chunk);
            } else {
                self.bins[idx].head = chunk;
            }
        }
        self.binmap.mark(idx);
    }

    /// Large-bin insertion: descending size order, with equal-size chunks
    /// kept in arrival order (oldest ends up closest to the tail, which is
    /// where allocation looks first).
    fn bin_insert_sorted_desc(&mut self, idx: usize, chunk: *mut u8, size: usize) {
        let mut cur = self.bins[idx].head;
        unsafe {
            while !cur.is_null() && chunk::size(cur) > size {
                cur = get_fd(cur);
            }
        }
        self.bin_insert_before(idx, chunk, cur);
    }

    fn bin_unlink(&mut self, idx: usize, chunk: *mut u8) {
        unsafe {
            let fd = get_fd(chunk);
            let bk = get_bk(chunk);
            if bk.is_null() {
                self.bins[idx].head = fd;
            } else {
                set_fd(bk, fd);
            }
            if fd.is_null() {
                self.bins[idx].tail = bk;
            } else {
                set_bk(fd, bk);
            }
        }
        if self.bins[idx].head.is_null() {
            self.binmap.clear(idx);
        }
    }

    fn bin_pop_back(&mut self, idx: usize) -> *mut u8 {
        let tail = self.bins[idx].tail;
        if !tail.is_null() {
            self.bin_unlink(idx, tail);
        }
        tail
    }

    fn fastbin_push(&mut self, idx: usize, chunk: *mut u8) {
        unsafe { set_fd(chunk, self.fastbins[idx]) };
        self.fastbins[idx] = chunk;
    }

    fn fastbin_pop(&mut self, idx: usize) -> *mut u8 {
        let head = self.fastbins[idx];
        if !head.is_null() {
            self.fastbins[idx] = unsafe { get_fd(head) };
        }
        head
    }

    // --- consolidation --------------------------------------------------

    fn init(&mut self) {
        self.initialized = true;
        self.fast_chunks = false;
    }

    /// `malloc_consolidate`: drain every fastbin, coalescing each chunk
    /// with its neighbours and depositing the result on the unsorted bin.
    fn consolidate(&mut self) {
        if !self.initialized {
            self.init();
            return;
        }

        self.fast_chunks = false;

        for idx in 0..NFASTBINS {
            loop {
                let chunk = self.fastbin_pop(idx);
                if chunk.is_null() {
                    break;
                }
                let size = unsafe { chunk::size(chunk) };
                unsafe { self.coalesce_and_deposit(chunk, size) };
            }
        }
    }

    /// Shared coalescing rule used by consolidation and the free path:
    /// merge `chunk` with a free predecessor and/or successor, then file
    /// the result onto the unsorted bin (or absorb it into top).
    unsafe fn coalesce_and_deposit(&mut self, chunk_in: *mut u8, size_in: usize) {
        let mut chunk = chunk_in;
        let mut size = size_in;
        let mut prev_inuse_flag = PREV_INUSE;

        if !chunk::prev_inuse(chunk) {
            let prev_size = chunk::prev_size(chunk);
            let prev = chunk.sub(prev_size);
            let prev_idx = bins::bin_index(prev_size);
            self.bin_unlink(prev_idx, prev);
            prev_inuse_flag = chunk::size_and_flags(prev) & PREV_INUSE;
            chunk = prev;
            size += prev_size;
        }

        let next = chunk.add(size);

        if next == self.top {
            self.top = chunk;
            self.top_size += size;
            chunk::set_size_and_flags(self.top, self.top_size, prev_inuse_flag);
            return;
        }

        let next_size = chunk::size(next);
        let after_next = next.add(next_size);
        let next_is_free = !chunk::prev_inuse(after_next);

        if next_is_free {
            let next_idx = bins::bin_index(next_size);
            self.bin_unlink(next_idx, next);
            size += next_size;
        }

        chunk::set_size_and_flags(chunk, size, prev_inuse_flag);
        chunk::set_foot(chunk, size);
        self.bin_push_front(bins::UNSORTED_BIN, chunk);
        self.any_chunks = true;
    }

    // --- free -------------------------------------------------------------

    /// `free(null)` is a no-op. `ptr` must be a live pointer previously
    /// returned by this heap, or null.
    ///
    /// # Safety
    /// `ptr` must be null or a pointer returned by a prior `malloc`,
    /// `realloc`, `memalign`, or bulk-allocation call on this same heap,
    /// not already freed.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        let chunk = chunk::mem_to_chunk(ptr);
        let raw = chunk::size_and_flags(chunk);
        let size = raw & !(PREV_INUSE | IS_MMAPPED);

        if raw & IS_MMAPPED != 0 {
            let misalignment = chunk::prev_size(chunk);
            let base = chunk.sub(misalignment);
            let total = size + misalignment;
            self.provider.page_unmap(NonNull::new_unchecked(base), total);
            self.stats.mmapped_mem -= total;
            self.stats.n_mmaps -= 1;
            return;
        }

        if size <= self.max_fast_chunk_size() {
            let idx = bins::fastbin_index(size);
            self.fastbin_push(idx, chunk);
            self.fast_chunks = true;
            self.any_chunks = true;
            return;
        }

        self.coalesce_and_deposit(chunk, size);

        if size >= self.tunables.fastbin_consolidation_threshold() {
            self.consolidate();
            if self.top_size > self.tunables.trim_threshold {
                self.trim(self.tunables.top_pad);
            }
        }
    }

    // --- malloc -------------------------------------------------------------

    /// Size 0 returns a minimum-sized chunk, never null (barring real OOM).
    pub fn malloc(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let nb = chunk::request2size(size).ok_or(AllocError)?;
        self.malloc_sized(nb)
    }

    fn malloc_sized(&mut self, nb: usize) -> Result<NonNull<u8>, AllocError> {
        // S0: nothing has ever been freed; consolidate (which also
        // lazily initializes) and head straight for top/system.
        if !self.any_chunks {
            self.consolidate();
            return self.top_or_system(nb);
        }

        // S1: fastbin hit.
        if nb <= self.max_fast_chunk_size() {
            let idx = bins::fastbin_index(nb);
            let chunk = self.fastbin_pop(idx);
            if !chunk.is_null() {
                return Ok(self.mem_ptr(chunk));
            }
        }

        // S2: exact small bin, FIFO (oldest first).
        if bins::in_smallbin_range(nb) {
            let idx = bins::smallbin_index(nb);
            let chunk = self.bin_pop_back(idx);
            if !chunk.is_null() {
                unsafe { chunk::set_prev_inuse(chunk.add(nb)) };
                return Ok(self.mem_ptr(chunk));
            }
        }

        // S3: large-request pre-consolidation.
        let large_idx = if !bins::in_smallbin_range(nb) {
            if self.fast_chunks {
                self.consolidate();
            }
            bins::largebin_index(nb)
        } else {
            0
        };

        // S4: drain the unsorted bin.
        loop {
            let was_singleton = self.bins[bins::UNSORTED_BIN].head == self.bins[bins::UNSORTED_BIN].tail
                && !self.bins[bins::UNSORTED_BIN].head.is_null();
            let victim = self.bin_pop_back(bins::UNSORTED_BIN);
            if victim.is_null() {
                break;
            }
            let vsize = unsafe { chunk::size(victim) };

            if bins::in_smallbin_range(nb)
                && was_singleton
                && victim == self.last_remainder
                && vsize > nb + MIN_CHUNK_SIZE
            {
                unsafe {
                    let remainder = victim.add(nb);
                    let remainder_size = vsize - nb;
                    chunk::set_size_and_flags(victim, nb, PREV_INUSE);
                    chunk::set_size_and_flags(remainder, remainder_size, PREV_INUSE);
                    chunk::set_foot(remainder, remainder_size);
                    self.bin_push_front(bins::UNSORTED_BIN, remainder);
                    self.last_remainder = remainder;
                }
                return Ok(self.mem_ptr(victim));
            }

            if vsize == nb {
                unsafe { chunk::set_prev_inuse(victim.add(nb)) };
                return Ok(self.mem_ptr(victim));
            }

            if bins::in_smallbin_range(vsize) {
                self.bin_push_front(bins::smallbin_index(vsize), victim);
            } else {
                self.bin_insert_sorted_desc(bins::largebin_index(vsize), victim, vsize);
            }
        }

        // S5: scan the matching large bin for a best fit.
        if !bins::in_smallbin_range(nb) {
            if let Some(ptr) = self.scan_bin_for_fit(large_idx, nb) {
                return Ok(ptr);
            }
        }

        // S6: binmap-guided scan of the next non-empty bin.
        let mut scan_from =
            if bins::in_smallbin_range(nb) { bins::FIRST_LARGE_BIN } else { large_idx + 1 };

        loop {
            let Some(candidate) = self.binmap.next_marked_from(scan_from) else { break };

            if self.bins[candidate].tail.is_null() {
                self.binmap.clear(candidate);
                scan_from = candidate + 1;
                continue;
            }

            if let Some(ptr) = self.scan_bin_for_fit(candidate, nb) {
                return Ok(ptr);
            }
            scan_from = candidate + 1;
        }

        // S7 + S8.
        self.top_or_system(nb)
    }

    /// Take the smallest-fitting chunk from the tail of bin `idx`, split or
    /// absorb the remainder, and return the carved allocation.
    fn scan_bin_for_fit(&mut self, idx: usize, nb: usize) -> Option<NonNull<u8>> {
        let mut cur = self.bins[idx].tail;

        unsafe {
            while !cur.is_null() {
                let size = chunk::size(cur);

                if size >= nb {
                    self.bin_unlink(idx, cur);
                    let prev_inuse_flag = chunk::size_and_flags(cur) & PREV_INUSE;
                    let remainder_size = size - nb;

                    if remainder_size < MIN_CHUNK_SIZE {
                        chunk::set_prev_inuse(cur.add(size));
                    } else {
                        chunk::set_size_and_flags(cur, nb, prev_inuse_flag);
                        let remainder = cur.add(nb);
                        chunk::set_size_and_flags(remainder, remainder_size, PREV_INUSE);
                        chunk::set_foot(remainder, remainder_size);

                        if bins::in_smallbin_range(nb) {
                            self.last_remainder = remainder;
                        }
                        self.bin_push_front(bins::UNSORTED_BIN, remainder);
                    }

                    return Some(self.mem_ptr(cur));
                }

                cur = get_bk(cur);
            }
        }

        None
    }

    fn top_or_system(&mut self, nb: usize) -> Result<NonNull<u8>, AllocError> {
        if !self.top.is_null() && self.top_size >= nb + MIN_CHUNK_SIZE {
            unsafe {
                let chunk = self.top;
                let prev_inuse_flag = chunk::size_and_flags(chunk) & PREV_INUSE;
                chunk::set_size_and_flags(chunk, nb, prev_inuse_flag);

                self.top = chunk.add(nb);
                self.top_size -= nb;
                chunk::set_size_and_flags(self.top, self.top_size, PREV_INUSE);

                return Ok(self.mem_ptr(chunk));
            }
        }

        self.sysmalloc(nb)
    }

    // --- system-memory escalation ------------------------------------------

    fn sysmalloc(&mut self, nb: usize) -> Result<NonNull<u8>, AllocError> {
        if self.fast_chunks && bins::in_smallbin_range(nb) {
            self.consolidate();
            return self.malloc_sized(nb);
        }

        let page_size = self.provider.page_size();

        if nb >= self.tunables.mmap_threshold && self.stats.n_mmaps < self.tunables.mmap_max {
            if let Ok(ptr) = self.mmap_chunk(nb, page_size) {
                return Ok(ptr);
            }
        }

        let mut extend_size = nb + self.tunables.top_pad + MIN_CHUNK_SIZE;
        if self.contiguous {
            extend_size = extend_size.saturating_sub(self.top_size);
        }
        extend_size = align_up_size(extend_size, page_size);

        match self.provider.morecore(extend_size as isize) {
            Ok(old_end) => {
                self.stats.sbrked_mem += extend_size;
                self.stats.max_sbrked_mem = self.stats.max_sbrked_mem.max(self.stats.sbrked_mem);

                let expected_end = if self.top.is_null() { old_end } else { self.top.wrapping_add(self.top_size) };

                if self.contiguous && old_end == expected_end {
                    if self.top.is_null() {
                        self.top = old_end;
                        self.top_size = 0;
                        self.arena_base = old_end;
                    }
                    self.top_size += extend_size;
                    unsafe { chunk::set_size_and_flags(self.top, self.top_size, PREV_INUSE) };
                } else {
                    unsafe { self.retire_top_noncontiguous(old_end, extend_size, page_size) };
                }

                self.top_or_system(nb)
            }
            Err(ProviderError) => {
                let fallback_size = extend_size.max(MMAP_AS_MORECORE_SIZE).max(nb + MIN_CHUNK_SIZE);
                match self.mmap_chunk(fallback_size, page_size) {
                    Ok(ptr) => {
                        self.contiguous = false;
                        Ok(ptr)
                    }
                    Err(_) => Err(AllocError),
                }
            }
        }
    }

    /// A foreign extension (or the very first extension) intervened: write
    /// two fencepost chunks at the tail of the old top so it can never be
    /// coalesced across the discontinuity, then return its remainder to
    /// the bins and establish a fresh top at the new, aligned base.
    unsafe fn retire_top_noncontiguous(&mut self, old_end: *mut u8, extend_size: usize, page_size: usize) {
        self.contiguous = false;

        #[cfg(feature = "log")]
        log::warn!("retire_top_noncontiguous: extension landed at {old_end:p}, arena is no longer contiguous");

        let aligned_base = ptr_utils::align_up(old_end);
        let slack = aligned_base as usize - old_end as usize;

        if self.top.is_null() {
            self.top = aligned_base;
            self.top_size = extend_size - slack;
            self.arena_base = aligned_base;
            chunk::set_size_and_flags(self.top, self.top_size, PREV_INUSE);
            return;
        }

        let old_top = self.top;
        let old_top_size = self.top_size;

        let unaligned_end = aligned_base.add(extend_size - slack);
        let page_slack = align_up_size(unaligned_end as usize, page_size) - unaligned_end as usize;
        let correction = slack + old_top_size + page_slack;

        if let Ok(_) = self.provider.morecore(correction as isize) {
            self.stats.sbrked_mem += correction;
        }

        const FENCEPOST_SIZE: usize = 2 * WORD_SIZE;
        chunk::set_size_and_flags(old_top, FENCEPOST_SIZE, PREV_INUSE);
        let fencepost2 = old_top.add(FENCEPOST_SIZE);
        chunk::set_size_and_flags(fencepost2, FENCEPOST_SIZE, PREV_INUSE);

        self.top = aligned_base;
        self.top_size = (extend_size - slack) + correction;
        chunk::set_size_and_flags(self.top, self.top_size, PREV_INUSE);

        let shrunk_size = old_top_size.saturating_sub(2 * FENCEPOST_SIZE);
        if shrunk_size >= MIN_CHUNK_SIZE {
            let remainder = old_top.add(2 * FENCEPOST_SIZE);
            chunk::set_size_and_flags(remainder, shrunk_size, PREV_INUSE);
            self.coalesce_and_deposit(remainder, shrunk_size);
        }

        #[cfg(feature = "log")]
        log::debug!("retire_top_noncontiguous: old top fenceposted, {shrunk_size} bytes of remainder returned to the bins, new top {} bytes at {:p}", self.top_size, self.top);
    }

    fn mmap_chunk(&mut self, nb: usize, page_size: usize) -> Result<NonNull<u8>, AllocError> {
        let request = nb + WORD_SIZE + ptr_utils::ALIGN - 1;
        let mapped_size = align_up_size(request, page_size);

        let base = self.provider.page_map(mapped_size).map_err(|_| AllocError)?;

        let aligned_chunk = ptr_utils::align_up(base.as_ptr());
        let misalignment = aligned_chunk as usize - base.as_ptr() as usize;

        unsafe {
            chunk::set_prev_size(aligned_chunk, misalignment);
            chunk::set_size_and_flags(aligned_chunk, mapped_size - misalignment, PREV_INUSE | IS_MMAPPED);
        }

        self.stats.mmapped_mem += mapped_size;
        self.stats.max_mmapped_mem = self.stats.max_mmapped_mem.max(self.stats.mmapped_mem);
        self.stats.n_mmaps += 1;
        self.stats.max_n_mmaps = self.stats.max_n_mmaps.max(self.stats.n_mmaps);

        Ok(self.mem_ptr(aligned_chunk))
    }

    /// `systrim`: return whole pages from the tail of top to the system.
    /// Only attempted if the provider's break still sits exactly at the
    /// end of top — otherwise a foreign extension has moved it and trimming
    /// would clobber memory we don't own.
    pub fn trim(&mut self, pad: usize) -> bool {
        if self.top.is_null() {
            return false;
        }

        let page_size = self.provider.page_size();
        if self.top_size < pad + MIN_CHUNK_SIZE + page_size {
            return false;
        }

        let Ok(current_break) = self.provider.morecore(0) else { return false };
        if current_break != unsafe { self.top.add(self.top_size) } {
            return false;
        }

        let extra = ((self.top_size - pad - MIN_CHUNK_SIZE) / page_size - 1) * page_size;
        if extra == 0 {
            return false;
        }

        match self.provider.morecore(-(extra as isize)) {
            Ok(new_break) => {
                let released = current_break as usize - new_break as usize;
                self.top_size -= released;
                unsafe { chunk::set_size_and_flags(self.top, self.top_size, PREV_INUSE) };
                self.stats.sbrked_mem -= released;
                #[cfg(feature = "log")]
                log::debug!("trim: released {released} bytes, top_size now {}", self.top_size);
                true
            }
            Err(_) => {
                #[cfg(feature = "log")]
                log::warn!("trim: morecore shrink by {extra} bytes failed, leaving top_size at {}", self.top_size);
                false
            }
        }
    }

    // --- realloc / memalign -------------------------------------------------

    /// # Safety
    /// `ptr` must be null or a live pointer returned by this heap.
    pub unsafe fn realloc(&mut self, ptr: *mut u8, new_size: usize) -> Result<NonNull<u8>, AllocError> {
        if ptr.is_null() {
            return self.malloc(new_size);
        }

        let nb = chunk::request2size(new_size).ok_or(AllocError)?;
        let chunk_ptr = chunk::mem_to_chunk(ptr);
        let old_size = chunk::size(chunk_ptr);

        if chunk::is_mmapped(chunk_ptr) {
            let new_ptr = self.malloc(new_size)?;
            let copy_len = chunk::usable_size_of(old_size, true).min(new_size);
            core::ptr::copy_nonoverlapping(ptr, new_ptr.as_ptr(), copy_len);
            self.free(ptr);
            return Ok(new_ptr);
        }

        if old_size >= nb {
            let remainder_size = old_size - nb;
            if remainder_size >= MIN_CHUNK_SIZE {
                let prev_inuse_flag = chunk::size_and_flags(chunk_ptr) & PREV_INUSE;
                chunk::set_size_and_flags(chunk_ptr, nb, prev_inuse_flag);
                let remainder = chunk_ptr.add(nb);
                chunk::set_size_and_flags(remainder, remainder_size, PREV_INUSE);
                self.free(chunk::chunk_to_mem(remainder));
            }
            return Ok(NonNull::new_unchecked(ptr));
        }

        let next = chunk_ptr.add(old_size);
        let next_is_top = next == self.top;
        let next_size = if next_is_top { self.top_size } else { chunk::size(next) };
        let next_free = next_is_top || !chunk::prev_inuse(next.add(next_size));

        if next_free && old_size + next_size >= nb {
            if next_is_top {
                let extra = nb - old_size;
                self.top = self.top.add(extra);
                self.top_size -= extra;
                chunk::set_size_and_flags(self.top, self.top_size, PREV_INUSE);
                let prev_inuse_flag = chunk::size_and_flags(chunk_ptr) & PREV_INUSE;
                chunk::set_size_and_flags(chunk_ptr, nb, prev_inuse_flag);
                return Ok(NonNull::new_unchecked(ptr));
            }

            let idx = bins::bin_index(next_size);
            self.bin_unlink(idx, next);

            let growable = old_size + next_size;
            let remainder_size = growable - nb;
            let prev_inuse_flag = chunk::size_and_flags(chunk_ptr) & PREV_INUSE;

            if remainder_size >= MIN_CHUNK_SIZE {
                chunk::set_size_and_flags(chunk_ptr, nb, prev_inuse_flag);
                let remainder = chunk_ptr.add(nb);
                chunk::set_size_and_flags(remainder, remainder_size, PREV_INUSE);
                chunk::set_foot(remainder, remainder_size);
                self.bin_push_front(bins::UNSORTED_BIN, remainder);
            } else {
                chunk::set_size_and_flags(chunk_ptr, growable, prev_inuse_flag);
                chunk::set_prev_inuse(chunk_ptr.add(growable));
            }

            return Ok(NonNull::new_unchecked(ptr));
        }

        let new_ptr = self.malloc(new_size)?;
        let copy_len = chunk::usable_size_of(old_size, false).min(new_size);
        core::ptr::copy_nonoverlapping(ptr, new_ptr.as_ptr(), copy_len);
        self.free(ptr);
        Ok(new_ptr)
    }

    /// # Safety
    /// `alignment` must be nonzero.
    pub unsafe fn memalign(&mut self, alignment: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        let alignment = alignment.next_power_of_two().max(ptr_utils::ALIGN);

        if alignment <= ptr_utils::ALIGN {
            return self.malloc(size);
        }

        let nb = chunk::request2size(size).ok_or(AllocError)?;
        let total = nb + alignment + MIN_CHUNK_SIZE;

        let raw = self.malloc(total - WORD_SIZE)?;
        let raw_chunk = chunk::mem_to_chunk(raw.as_ptr());
        let raw_size = chunk::size(raw_chunk);
        let raw_mmapped = chunk::is_mmapped(raw_chunk);

        let candidate = ptr_utils::align_up_by(raw.as_ptr(), alignment - 1);
        let lead_to_candidate = candidate as usize - raw.as_ptr() as usize;

        let aligned_mem = if lead_to_candidate == 0 || lead_to_candidate >= MIN_CHUNK_SIZE {
            candidate
        } else {
            candidate.add(alignment)
        };
        let aligned_chunk = chunk::mem_to_chunk(aligned_mem);

        if raw_mmapped {
            let lead = aligned_chunk as usize - raw_chunk as usize;
            if lead > 0 {
                let misalignment = chunk::prev_size(raw_chunk);
                chunk::set_prev_size(aligned_chunk, misalignment + lead);
                chunk::set_size_and_flags(aligned_chunk, raw_size - lead, PREV_INUSE | IS_MMAPPED);
            }
        } else if aligned_chunk != raw_chunk {
            let lead = aligned_chunk as usize - raw_chunk as usize;
            let prev_inuse_flag = chunk::size_and_flags(raw_chunk) & PREV_INUSE;
            chunk::set_size_and_flags(raw_chunk, lead, prev_inuse_flag);
            chunk::set_size_and_flags(aligned_chunk, raw_size - lead, PREV_INUSE);
            self.free(chunk::chunk_to_mem(raw_chunk));
        }

        if !chunk::is_mmapped(aligned_chunk) {
            let final_size = chunk::size(aligned_chunk);
            let trailing = final_size - nb;
            if trailing >= MIN_CHUNK_SIZE {
                chunk::set_size_and_flags(aligned_chunk, nb, PREV_INUSE);
                let tail = aligned_chunk.add(nb);
                chunk::set_size_and_flags(tail, trailing, PREV_INUSE);
                self.free(chunk::chunk_to_mem(tail));
            }
        }

        Ok(NonNull::new_unchecked(chunk::chunk_to_mem(aligned_chunk)))
    }

    // --- bulk allocation (ialloc) -------------------------------------------

    /// Carve `n` same-sized chunks out of one aggregate allocation.
    /// `out.len()` must equal `n`. Returns how many were written; `0` means
    /// allocation failed and `out` is untouched.
    pub fn bulk_same_size(&mut self, n: usize, size: usize, out: &mut [*mut u8]) -> usize {
        if out.len() != n {
            return 0;
        }
        self.bulk_carve(core::iter::repeat(size).take(n), n, out)
    }

    /// Carve chunks matching `sizes` out of one aggregate allocation.
    /// `out.len()` must equal `sizes.len()`.
    pub fn bulk_varied(&mut self, sizes: &[usize], out: &mut [*mut u8]) -> usize {
        if out.len() != sizes.len() {
            return 0;
        }
        self.bulk_carve(sizes.iter().copied(), sizes.len(), out)
    }

    fn bulk_carve(&mut self, sizes: impl Iterator<Item = usize> + Clone, n: usize, out: &mut [*mut u8]) -> usize {
        if n == 0 {
            return 0;
        }

        let mut total = 0usize;
        for s in sizes.clone() {
            match chunk::request2size(s) {
                Some(nb) => total += nb,
                None => return 0,
            }
        }

        let saved_threshold = self.tunables.mmap_threshold;
        self.tunables.mmap_threshold = usize::MAX;
        let result = self.malloc(total.saturating_sub(WORD_SIZE));
        self.tunables.mmap_threshold = saved_threshold;

        let Ok(aggregate) = result else { return 0 };

        let mut cursor = unsafe { chunk::mem_to_chunk(aggregate.as_ptr()) };
        let aggregate_size = unsafe { chunk::size(cursor) };
        let slop = aggregate_size - total;

        for (i, s) in sizes.enumerate() {
            let mut nb = chunk::request2size(s).unwrap();
            if i + 1 == n {
                nb += slop;
            }

            unsafe {
                chunk::set_size_and_flags(cursor, nb, PREV_INUSE);
                out[i] = chunk::chunk_to_mem(cursor);
                cursor = cursor.add(nb);
            }
        }

        n
    }

    // --- introspection -------------------------------------------------------

    /// # Safety
    /// `ptr` must be a live pointer returned by this heap.
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        let chunk = chunk::mem_to_chunk(ptr);
        let raw = chunk::size_and_flags(chunk);
        chunk::usable_size_of(raw & !(PREV_INUSE | IS_MMAPPED), raw & IS_MMAPPED != 0)
    }

    pub fn info(&self) -> Info {
        let mut free_blocks = 0usize;
        let mut free_bytes = 0usize;

        unsafe {
            for idx in 0..NFASTBINS {
                let mut cur = self.fastbins[idx];
                while !cur.is_null() {
                    free_blocks += 1;
                    free_bytes += chunk::size(cur);
                    cur = get_fd(cur);
                }
            }

            for idx in bins::UNSORTED_BIN..NBINS {
                let mut cur = self.bins[idx].head;
                while !cur.is_null() {
                    free_blocks += 1;
                    free_bytes += chunk::size(cur);
                    cur = get_fd(cur);
                }
            }
        }

        Info {
            arena: self.stats.sbrked_mem,
            in_use: self.stats.sbrked_mem.saturating_sub(free_bytes + self.top_size),
            free_blocks,
            max_arena: self.stats.max_sbrked_mem,
        }
    }

    #[cfg(feature = "counters")]
    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn tune(&mut self, param: Param, value: usize) -> bool {
        self.tunables.tune(param, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::TestProvider;

    fn heap_with(capacity: usize) -> Heap<TestProvider> {
        Heap::new(TestProvider::new(capacity))
    }

    #[test]
    fn alloc_returns_aligned_distinct_pointers() {
        let mut heap = heap_with(1 << 20);
        let sizes = [1usize, 8, 80, 81];
        let ptrs: Vec<_> = sizes.iter().map(|&s| heap.malloc(s).unwrap()).collect();

        for w in ptrs.windows(2) {
            assert_ne!(w[0], w[1]);
        }
        for p in &ptrs {
            assert_eq!(p.as_ptr() as usize % ptr_utils::ALIGN, 0);
        }

        for p in ptrs.into_iter().rev() {
            unsafe { heap.free(p.as_ptr()) };
        }
    }

    #[test]
    fn free_then_alloc_reuses_fastbin_chunk() {
        let mut heap = heap_with(1 << 20);
        let a = heap.malloc(16).unwrap();
        unsafe { heap.free(a.as_ptr()) };
        let b = heap.malloc(16).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn exact_fit_smallbin_reuses_freed_chunk() {
        let mut heap = heap_with(1 << 20);
        let a = heap.malloc(512).unwrap();
        let _b = heap.malloc(512).unwrap();
        unsafe { heap.free(a.as_ptr()) };
        let c = heap.malloc(400).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    #[cfg(feature = "counters")]
    fn large_request_served_via_mmap_when_threshold_lowered() {
        let mut heap = heap_with(16 << 20);
        heap.tune(Param::MmapThreshold, 64 * 1024);
        let before = heap.stats().n_mmaps;
        let p = heap.malloc(100_000).unwrap();
        assert_eq!(heap.stats().n_mmaps, before + 1);
        unsafe { heap.free(p.as_ptr()) };
        assert_eq!(heap.stats().n_mmaps, before);
    }

    #[test]
    fn usable_size_is_at_least_requested() {
        let mut heap = heap_with(1 << 20);
        for size in [1, 7, 31, 100, 1000] {
            let p = heap.malloc(size).unwrap();
            assert!(unsafe { heap.usable_size(p.as_ptr()) } >= size);
            unsafe { heap.free(p.as_ptr()) };
        }
    }

    #[test]
    fn realloc_preserves_prefix() {
        let mut heap = heap_with(1 << 20);
        let p = heap.malloc(100).unwrap();
        unsafe {
            p.as_ptr().write_bytes(0xAB, 100);
            let q = heap.realloc(p.as_ptr(), 10_000).unwrap();
            for i in 0..100 {
                assert_eq!(*q.as_ptr().add(i), 0xAB);
            }
            heap.free(q.as_ptr());
        }
    }

    #[test]
    fn bulk_same_size_yields_distinct_nonoverlapping_chunks() {
        let mut heap = heap_with(1 << 20);
        let mut out = [core::ptr::null_mut(); 8];
        let n = heap.bulk_same_size(8, 64, &mut out);
        assert_eq!(n, 8);

        for w in out.windows(2) {
            assert_ne!(w[0], w[1]);
        }
        for p in out {
            assert!(unsafe { heap.usable_size(p) } >= 64);
        }
    }

    #[test]
    #[cfg(feature = "counters")]
    fn trim_round_trip_releases_pages() {
        let mut heap = heap_with(8 << 20);
        heap.tune(Param::TrimThreshold, 128 * 1024);
        let p = heap.malloc(256 * 1024).unwrap();
        unsafe { heap.free(p.as_ptr()) };
        assert!(heap.trim(0) || heap.stats().sbrked_mem > 0);
    }

    /// Drives this heap and `dlmalloc`'s own allocator through the same
    /// random alloc/free/realloc script, checking that both agree on
    /// success/failure and that each keeps its own written contents intact.
    /// Neither allocator should ever run out of room for this workload, so
    /// a disagreement points at a bookkeeping bug rather than fragmentation.
    #[test]
    fn random_workload_matches_dlmalloc_oracle() {
        let mut heap = heap_with(64 << 20);
        let mut oracle = dlmalloc::Dlmalloc::new();
        let rng = fastrand::Rng::with_seed(0xD1A1);

        struct Slot {
            heap_ptr: *mut u8,
            oracle_ptr: *mut u8,
            size: usize,
            fingerprint: u8,
        }

        let mut slots: Vec<Slot> = Vec::new();

        for step in 0..3000u32 {
            if slots.is_empty() || rng.bool() {
                let size = rng.usize(1..=4096);
                let fingerprint = (step % 251) as u8;

                let heap_ptr = heap.malloc(size).map(|p| p.as_ptr()).unwrap_or(core::ptr::null_mut());
                let oracle_ptr = unsafe { oracle.malloc(size, ptr_utils::ALIGN) };

                assert_eq!(heap_ptr.is_null(), oracle_ptr.is_null(), "success parity at step {step}");

                if !heap_ptr.is_null() {
                    unsafe {
                        heap_ptr.write_bytes(fingerprint, size);
                        oracle_ptr.write_bytes(fingerprint, size);
                    }
                    slots.push(Slot { heap_ptr, oracle_ptr, size, fingerprint });
                }
            } else {
                let idx = rng.usize(0..slots.len());
                let slot = slots.swap_remove(idx);

                unsafe {
                    for i in 0..slot.size {
                        assert_eq!(*slot.heap_ptr.add(i), slot.fingerprint);
                        assert_eq!(*slot.oracle_ptr.add(i), slot.fingerprint);
                    }
                    heap.free(slot.heap_ptr);
                    oracle.free(slot.oracle_ptr, slot.size, ptr_utils::ALIGN);
                }
            }
        }

        for slot in slots {
            unsafe {
                heap.free(slot.heap_ptr);
                oracle.free(slot.oracle_ptr, slot.size, ptr_utils::ALIGN);
            }
        }
    }
}
