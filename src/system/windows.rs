//! `VirtualAlloc`-backed [`SystemProvider`] for Windows targets.
//!
//! Same shape as the unix provider: one `MEM_RESERVE`d region grown and
//! shrunk with `MEM_COMMIT`/`MEM_DECOMMIT`, plus independent reservations
//! for page-mapped chunks, released with `MEM_RELEASE`.

use core::ptr::NonNull;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};

use super::{ProviderError, SystemProvider};
use crate::ptr_utils::align_up_size;

const RESERVATION_SIZE: usize = 1 << 30;

/// Windows page size is always 4KiB in practice, smaller than the 64KiB
/// allocation granularity, but `VirtualAlloc`'s `MEM_COMMIT` rounds to the
/// page size regardless of the reservation's granularity.
const PAGE_SIZE: usize = 4096;

pub struct Win32Provider {
    reservation_base: *mut u8,
    reservation_size: usize,
    break_offset: usize,
}

unsafe impl Send for Win32Provider {}

impl Win32Provider {
    pub fn new() -> Result<Self, ProviderError> {
        let reservation_size = align_up_size(RESERVATION_SIZE, PAGE_SIZE);

        let addr = unsafe {
            VirtualAlloc(core::ptr::null_mut(), reservation_size, MEM_RESERVE, 0)
        };

        if addr.is_null() {
            #[cfg(feature = "log")]
            log::warn!("Win32Provider::new: reservation of {reservation_size} bytes failed");
            return Err(ProviderError);
        }

        #[cfg(feature = "log")]
        log::trace!("Win32Provider::new: reserved {reservation_size} bytes at {addr:p}");

        Ok(Self { reservation_base: addr.cast(), reservation_size, break_offset: 0 })
    }
}

impl Drop for Win32Provider {
    fn drop(&mut self) {
        unsafe {
            VirtualFree(self.reservation_base.cast(), 0, MEM_RELEASE);
        }
    }
}

unsafe impl SystemProvider for Win32Provider {
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

            let committed_end = align_up_size(new_offset, PAGE_SIZE);

            let result = unsafe {
                VirtualAlloc(self.reservation_base.cast(), committed_end, MEM_COMMIT, PAGE_READWRITE)
            };

            if result.is_null() {
                #[cfg(feature = "log")]
                log::warn!("morecore: VirtualAlloc(MEM_COMMIT) failed growing by {grow} bytes at offset {:#x}", self.break_offset);
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
            let old_committed_end = align_up_size(self.break_offset, PAGE_SIZE);
            let new_committed_end = align_up_size(new_offset, PAGE_SIZE);

            if new_committed_end < old_committed_end {
                let decommit_base = self.reservation_base.wrapping_add(new_committed_end);
                let decommit_size = old_committed_end - new_committed_end;

                unsafe {
                    VirtualFree(decommit_base.cast(), decommit_size, MEM_DECOMMIT);
                }
            }

            #[cfg(feature = "log")]
            log::trace!("morecore: shrank by {shrink} bytes, break now at {new_offset:#x}, arena stays contiguous (reservation never moves)");

            self.break_offset = new_offset;
            Ok(self.reservation_base.wrapping_add(new_offset))
        }
    }

    fn page_map(&mut self, size: usize) -> Result<NonNull<u8>, ProviderError> {
        let size = align_up_size(size, PAGE_SIZE);

        let addr = unsafe {
            VirtualAlloc(core::ptr::null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE)
        };

        if addr.is_null() {
            #[cfg(feature = "log")]
            log::warn!("page_map: VirtualAlloc of {size} bytes failed");
            return Err(ProviderError);
        }

        #[cfg(feature = "log")]
        log::trace!("page_map: {size} bytes at {addr:p}");

        Ok(unsafe { NonNull::new_unchecked(addr.cast()) })
    }

    unsafe fn page_unmap(&mut self, addr: NonNull<u8>, _size: usize) {
        #[cfg(feature = "log")]
        log::trace!("page_unmap: releasing region at {:p}", addr.as_ptr());

        unsafe {
            VirtualFree(addr.as_ptr().cast(), 0, MEM_RELEASE);
        }
    }

    fn page_size(&self) -> usize {
        PAGE_SIZE
    }
}
