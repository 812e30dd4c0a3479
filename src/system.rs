//! The system-memory backend: everything the heap needs from the OS.
//!
//! [`SystemProvider`] is deliberately narrow, mirroring `morecore`/`mmap` as
//! seen from `sysmalloc`: a signed-delta contiguous extension call and a
//! page-mapping pair. Implementations decide their own reservation and
//! commit strategy; the heap only ever sees addresses and sizes.

use core::ptr::NonNull;

/// Sentinel `morecore`/`page_map` failed; the heap treats this the same way
/// as running out of address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderError;

/// A source of raw address-space extensions for the heap.
///
/// # Safety
/// Implementors must return memory that is readable and writable for its
/// full extent, not aliased by any other live allocation, and page-aligned
/// for [`page_map`](SystemProvider::page_map)/[`page_unmap`](SystemProvider::page_unmap).
pub unsafe trait SystemProvider {
    /// Extend or shrink the contiguous region.
    ///
    /// `delta > 0` grows it and returns the *old* end address. `delta == 0`
    /// returns the current end without changing anything. `delta < 0`
    /// returns memory to the system and returns the *new* end address.
    ///
    /// The region is not guaranteed to stay contiguous across calls; callers
    /// must compare the returned address against their last known end to
    /// detect a foreign extension.
    fn morecore(&mut self, delta: isize) -> Result<*mut u8, ProviderError>;

    /// Map a fresh, independent, zero-filled region of at least `size` bytes.
    fn page_map(&mut self, size: usize) -> Result<NonNull<u8>, ProviderError>;

    /// Unmap a region previously returned by [`page_map`](Self::page_map).
    ///
    /// # Safety
    /// `(addr, size)` must exactly match a prior successful `page_map` call
    /// that hasn't already been unmapped.
    unsafe fn page_unmap(&mut self, addr: NonNull<u8>, size: usize);

    /// The page granularity used by this provider.
    fn page_size(&self) -> usize;
}

#[cfg(all(feature = "std", target_family = "unix"))]
pub mod unix;
#[cfg(all(feature = "std", target_family = "unix"))]
pub use unix::UnixMmapProvider;

#[cfg(all(feature = "std", target_family = "windows"))]
pub mod windows;
#[cfg(all(feature = "std", target_family = "windows"))]
pub use windows::Win32Provider;

#[cfg(feature = "std")]
pub use test::TestProvider;
