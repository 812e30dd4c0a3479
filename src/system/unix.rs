//! `mmap`/`mprotect`-backed [`SystemProvider`] for unix targets.
//!
//! The contiguous region is a single large `PROT_NONE` reservation, grown by
//! `mprotect`ing further pages readable/writable and shrunk the same way in
//! reverse (`MADV_FREE` on Linux, `PROT_NONE` elsewhere) so the address never
//! moves — `morecore` stays contiguous for the lifetime of the provider.
//! Page-mapped chunks are independent `mmap` calls, released with `munmap`.

use core::ptr::NonNull;

use super::{ProviderError, SystemProvider};
use crate::ptr_utils::align_up_size;

/// Size of the address-space reservation backing the contiguous region.
/// Only touched pages are ever committed, so this just bounds how large the
/// arena can grow before `morecore` starts failing.
const RESERVATION_SIZE: usize = 1 << 30;

pub struct UnixMmapProvider {
    reservation_base: *mut u8,
    reservation_size: usize,
    /// Bytes from `reservation_base` currently readable/writable.
    break_offset: usize,
    page_size: usize,
}

unsafe impl Send for UnixMmapProvider {}

impl UnixMmapProvider {
    /// Reserve (but don't commit) the arena. Fails if the reservation
    /// mapping itself can't be made.
    pub fn new() -> Result<Self, ProviderError> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let page_size = if page_size == 0 { crate::ptr_utils::DEFAULT_PAGE_SIZE } else { page_size };

        let reservation_size = align_up_size(RESERVATION_SIZE, page_size);

        let addr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                reservation_size,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            #[cfg(feature = "log")]
            log::warn!("UnixMmapProvider::new: reservation of {reservation_size} bytes failed");
            return Err(ProviderError);
        }

        #[cfg(feature = "log")]
        log::trace!("UnixMmapProvider::new: reserved {reservation_size} bytes at {addr:p}");

        Ok(Self { reservation_base: addr.cast(), reservation_size, break_offset: 0, page_size })
    }
}

impl Drop for UnixMmapProvider {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.reservation_base.cast(), self.reservation_size);
        }
    }
}

unsafe impl SystemProvider for UnixMmapProvider {
    fn morecore(&mut self, delta: isize) -> Result<*mut u8, ProviderError> {
        let current_end = self.reservation_base.wrapping_add(self.break_offset);

        if delta == 0 {
            return Ok(current_end);
        }

        if delta > 0 {
            let grow = delta as usize;
            let new_offset = self.break_offset.checked_add(grow).ok_or(ProviderError)?;

            if new_offset > self.reservation_size {
                return Err(ProviderError);
            }

            let committed_end = align_up_size(new_offset, self.page_size);

            let result = unsafe {
                libc::mprotect(
                    self.reservation_base.cast(),
                    committed_end,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            };

            if result != 0 {
                #[cfg(feature = "log")]
                log::warn!("morecore: mprotect failed growing by {grow} bytes at offset {:#x}", self.break_offset);
                return Err(ProviderError);
            }

            #[cfg(feature = "log")]
            log::trace!("morecore: grew by {grow} bytes, break now at {new_offset:#x}, arena stays contiguous (reservation never moves)");

            self.break_offset = new_offset;
            Ok(current_end)
        } else {
            let shrink = (-delta) as usize;

            if shrink > self.break_offset {
                #[cfg(feature = "log")]
                log::warn!("morecore: shrink of {shrink} bytes exceeds current break offset {:#x}", self.break_offset);
                return Err(ProviderError);
            }

            let new_offset = self.break_offset - shrink;
            let old_committed_end = align_up_size(self.break_offset, self.page_size);
            let new_committed_end = align_up_size(new_offset, self.page_size);

            if new_committed_end < old_committed_end {
                let decommit_base = self.reservation_base.wrapping_add(new_committed_end);
                let decommit_size = old_committed_end - new_committed_end;

                #[cfg(target_os = "linux")]
                unsafe {
                    libc::madvise(decommit_base.cast(), decommit_size, libc::MADV_FREE);
                }
                #[cfg(not(target_os = "linux"))]
                unsafe {
                    libc::mprotect(decommit_base.cast(), decommit_size, libc::PROT_NONE);
                }
            }

            #[cfg(feature = "log")]
            log::trace!("morecore: shrank by {shrink} bytes, break now at {new_offset:#x}, arena stays contiguous (reservation never moves)");

            self.break_offset = new_offset;
            Ok(self.reservation_base.wrapping_add(new_offset))
        }
    }

    fn page_map(&mut self, size: usize) -> Result<NonNull<u8>, ProviderError> {
        let size = align_up_size(size, self.page_size);

        let addr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            #[cfg(feature = "log")]
            log::warn!("page_map: mmap of {size} bytes failed");
            return Err(ProviderError);
        }

        #[cfg(feature = "log")]
        log::trace!("page_map: {size} bytes at {addr:p}");

        Ok(unsafe { NonNull::new_unchecked(addr.cast()) })
    }

    unsafe fn page_unmap(&mut self, addr: NonNull<u8>, size: usize) {
        let size = align_up_size(size, self.page_size);

        #[cfg(feature = "log")]
        log::trace!("page_unmap: {size} bytes at {:p}", addr.as_ptr());

        unsafe {
            libc::munmap(addr.as_ptr().cast(), size);
        }
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}
