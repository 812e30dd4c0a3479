//! Home of [`Locked`], a mutex-guarded [`Heap`] exposing `GlobalAlloc`.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{null_mut, NonNull};

#[cfg(feature = "allocator")]
use allocator_api2::alloc::{AllocError, Allocator};

use crate::heap::Heap;
use crate::ptr_utils::ALIGN;
use crate::system::SystemProvider;

/// A [`Heap`] behind a [`lock_api::Mutex`], usable as `#[global_allocator]`.
///
/// # Example
/// ```ignore
/// use dlmal::{Heap, Locked, system::UnixMmapProvider};
///
/// #[global_allocator]
/// static ALLOCATOR: Locked<spin::Mutex<()>, UnixMmapProvider> =
///     Locked::new(Heap::new(UnixMmapProvider::new().unwrap()));
/// ```
pub struct Locked<R: lock_api::RawMutex, P: SystemProvider> {
    mutex: lock_api::Mutex<R, Heap<P>>,
}

impl<R: lock_api::RawMutex, P: SystemProvider> Locked<R, P> {
    pub const fn new(heap: Heap<P>) -> Self {
        Self { mutex: lock_api::Mutex::new(heap) }
    }

    pub fn lock(&self) -> lock_api::MutexGuard<R, Heap<P>> {
        self.mutex.lock()
    }

    pub fn try_lock(&self) -> Option<lock_api::MutexGuard<R, Heap<P>>> {
        self.mutex.try_lock()
    }

    pub fn into_inner(self) -> Heap<P> {
        self.mutex.into_inner()
    }
}

impl<P: SystemProvider> Heap<P> {
    /// Wrap in a [`Locked`], picking the mutex implementation via `R`.
    pub const fn locked<R: lock_api::RawMutex>(self) -> Locked<R, P> {
        Locked::new(self)
    }
}

/// Rounds a `malloc`-style request up so it satisfies `align`, given every
/// chunk is already [`ALIGN`]-aligned. Only alignments above [`ALIGN`] cost
/// anything extra, and those go through `memalign` instead.
#[inline]
fn fits_natural_alignment(align: usize) -> bool {
    align <= ALIGN
}

unsafe impl<R: lock_api::RawMutex, P: SystemProvider> GlobalAlloc for Locked<R, P> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut heap = self.lock();
        let result = if fits_natural_alignment(layout.align()) {
            heap.malloc(layout.size())
        } else {
            heap.memalign(layout.align(), layout.size())
        };
        result.map_or(null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.lock().free(ptr);
    }

    unsafe fn realloc(&self, ptr: *mut u8, old_layout: Layout, new_size: usize) -> *mut u8 {
        if !fits_natural_alignment(old_layout.align()) {
            // over-aligned allocations always go through alloc+copy+free,
            // since `realloc` alone can't guarantee the new block keeps the
            // stricter alignment.
            let new_layout = Layout::from_size_align_unchecked(new_size, old_layout.align());
            let new_ptr = self.alloc(new_layout);
            if !new_ptr.is_null() {
                core::ptr::copy_nonoverlapping(ptr, new_ptr, old_layout.size().min(new_size));
                self.dealloc(ptr, old_layout);
            }
            return new_ptr;
        }

        let mut lock = self.lock();
        match lock.realloc(ptr, new_size) {
            Ok(nn) => nn.as_ptr(),
            Err(_) => null_mut(),
        }
    }
}

#[cfg(feature = "allocator")]
fn nonnull_slice(ptr: NonNull<u8>, len: usize) -> NonNull<[u8]> {
    unsafe { NonNull::new_unchecked(core::ptr::slice_from_raw_parts_mut(ptr.as_ptr(), len)) }
}

#[cfg(feature = "allocator")]
unsafe impl<R: lock_api::RawMutex, P: SystemProvider> Allocator for Locked<R, P> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            return Ok(nonnull_slice(NonNull::dangling(), 0));
        }

        let mut heap = self.lock();
        let result = if fits_natural_alignment(layout.align()) {
            heap.malloc(layout.size())
        } else {
            unsafe { heap.memalign(layout.align(), layout.size()) }
        };

        result.map(|nn| nonnull_slice(nn, layout.size())).map_err(|_| AllocError)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            self.lock().free(ptr.as_ptr());
        }
    }

    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() >= old_layout.size());

        if old_layout.size() == 0 {
            return self.allocate(new_layout);
        }

        self.realloc_via_layouts(ptr, old_layout, new_layout)
    }

    unsafe fn grow_zeroed(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        let grown = self.grow(ptr, old_layout, new_layout)?;
        grown.as_ptr().cast::<u8>().add(old_layout.size()).write_bytes(0, new_layout.size() - old_layout.size());
        Ok(grown)
    }

    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() <= old_layout.size());

        if new_layout.size() == 0 {
            if old_layout.size() > 0 {
                self.lock().free(ptr.as_ptr());
            }
            return Ok(nonnull_slice(NonNull::dangling(), 0));
        }

        self.realloc_via_layouts(ptr, old_layout, new_layout)
    }
}

#[cfg(feature = "allocator")]
impl<R: lock_api::RawMutex, P: SystemProvider> Locked<R, P> {
    /// Shared `grow`/`shrink` path for over-aligned requests: `memalign`,
    /// copy, free the old block.
    unsafe fn realloc_via_layouts(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        if !fits_natural_alignment(new_layout.align()) {
            let new_ptr = self.lock().memalign(new_layout.align(), new_layout.size()).map_err(|_| AllocError)?;
            let copy_len = old_layout.size().min(new_layout.size());
            new_ptr.as_ptr().copy_from_nonoverlapping(ptr.as_ptr(), copy_len);
            self.lock().free(ptr.as_ptr());
            return Ok(nonnull_slice(new_ptr, new_layout.size()));
        }

        let new_ptr = self.lock().realloc(ptr.as_ptr(), new_layout.size()).map_err(|_| AllocError)?;
        Ok(nonnull_slice(new_ptr, new_layout.size()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::AssumeUnlockable;
    use crate::system::TestProvider;

    fn locked(capacity: usize) -> Locked<AssumeUnlockable, TestProvider> {
        Locked::new(Heap::new(TestProvider::new(capacity)))
    }

    #[test]
    fn global_alloc_round_trip() {
        let locked = locked(1 << 20);
        unsafe {
            let layout = Layout::from_size_align(128, 8).unwrap();
            let ptr = locked.alloc(layout);
            assert!(!ptr.is_null());
            ptr.write_bytes(0x5a, layout.size());
            locked.dealloc(ptr, layout);
        }
    }

    #[test]
    fn global_alloc_honours_over_alignment() {
        let locked = locked(1 << 20);
        unsafe {
            let layout = Layout::from_size_align(256, 4096).unwrap();
            let ptr = locked.alloc(layout);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % 4096, 0);
            locked.dealloc(ptr, layout);
        }
    }

    #[test]
    fn global_realloc_preserves_contents() {
        let locked = locked(1 << 20);
        unsafe {
            let layout = Layout::from_size_align(64, 8).unwrap();
            let ptr = locked.alloc(layout);
            assert!(!ptr.is_null());
            ptr.write_bytes(0x11, 64);

            let grown = locked.realloc(ptr, layout, 512);
            assert!(!grown.is_null());
            for i in 0..64 {
                assert_eq!(*grown.add(i), 0x11);
            }
            locked.dealloc(grown, Layout::from_size_align(512, 8).unwrap());
        }
    }

    #[cfg(feature = "allocator")]
    #[test]
    fn allocator_api_grow_and_shrink() {
        let locked = locked(1 << 20);
        let layout = Layout::from_size_align(32, 8).unwrap();
        let slice = locked.allocate(layout).unwrap();
        let ptr = NonNull::new(slice.as_ptr() as *mut u8).unwrap();

        unsafe {
            ptr.as_ptr().write_bytes(0x7e, 32);
            let grown = locked.grow(ptr, layout, Layout::from_size_align(4096, 8).unwrap()).unwrap();
            let grown_ptr = NonNull::new(grown.as_ptr() as *mut u8).unwrap();
            assert_eq!(*grown_ptr.as_ptr(), 0x7e);

            let shrunk = locked
                .shrink(grown_ptr, Layout::from_size_align(4096, 8).unwrap(), Layout::from_size_align(16, 8).unwrap())
                .unwrap();
            let shrunk_ptr = NonNull::new(shrunk.as_ptr() as *mut u8).unwrap();
            locked.deallocate(shrunk_ptr, Layout::from_size_align(16, 8).unwrap());
        }
    }

    #[test]
    fn randomized_alloc_free_stress() {
        let locked = locked(4 << 20);
        let mut live: Vec<(*mut u8, Layout)> = Vec::new();
        let rng = fastrand::Rng::with_seed(0xC0FFEE);

        for _ in 0..4000 {
            if live.is_empty() || rng.bool() {
                let size = rng.usize(1..=4096);
                let align = 1usize << rng.u32(0..=6);
                let layout = Layout::from_size_align(size, align).unwrap();
                let ptr = unsafe { locked.alloc(layout) };
                if !ptr.is_null() {
                    assert_eq!(ptr as usize % align, 0);
                    live.push((ptr, layout));
                }
            } else {
                let idx = rng.usize(0..live.len());
                let (ptr, layout) = live.swap_remove(idx);
                unsafe { locked.dealloc(ptr, layout) };
            }
        }

        for (ptr, layout) in live {
            unsafe { locked.dealloc(ptr, layout) };
        }
    }
}
