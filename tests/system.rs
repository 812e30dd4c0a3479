//! Smoke test against the real unix `SystemProvider`, not the deterministic
//! `TestProvider` the unit tests use elsewhere. Exercises actual `mmap`/
//! `mprotect` so a broken reservation or page-rounding bug shows up here
//! even if the fixed-buffer tests never would.
#![cfg(unix)]

use dlmal::system::UnixMmapProvider;
use dlmal::Heap;

#[test]
fn small_allocations_round_trip() {
    let mut heap = Heap::new(UnixMmapProvider::new().unwrap());

    let sizes = [8usize, 24, 80, 81, 4096];
    let ptrs: std::vec::Vec<_> = sizes.iter().map(|&s| heap.malloc(s).unwrap()).collect();

    for (&size, &ptr) in sizes.iter().zip(&ptrs) {
        unsafe {
            ptr.as_ptr().write_bytes(0x5a, size);
            assert!(heap.usable_size(ptr.as_ptr()) >= size);
        }
    }

    for &ptr in ptrs.iter().rev() {
        unsafe { heap.free(ptr.as_ptr()) };
    }
}

#[test]
fn large_allocation_extends_past_initial_reservation() {
    let mut heap = Heap::new(UnixMmapProvider::new().unwrap());

    let big = heap.malloc(10_000_000).unwrap();
    unsafe {
        big.as_ptr().write_bytes(0x42, 10_000_000);
        assert_eq!(*big.as_ptr(), 0x42);
        heap.free(big.as_ptr());
    }
}

#[test]
#[cfg(feature = "counters")]
fn mmap_threshold_round_trip_on_real_pages() {
    let mut heap = Heap::new(UnixMmapProvider::new().unwrap());
    heap.tune(dlmal::Param::MmapThreshold, 64 * 1024);

    let before = heap.stats().n_mmaps;
    let ptr = heap.malloc(200_000).unwrap();
    assert_eq!(heap.stats().n_mmaps, before + 1);

    unsafe {
        ptr.as_ptr().write_bytes(0xAA, 200_000);
        heap.free(ptr.as_ptr());
    }
    assert_eq!(heap.stats().n_mmaps, before);
}

#[test]
#[cfg(feature = "counters")]
fn trim_releases_real_pages() {
    let mut heap = Heap::new(UnixMmapProvider::new().unwrap());
    heap.tune(dlmal::Param::TrimThreshold, 128 * 1024);

    let ptr = heap.malloc(512 * 1024).unwrap();
    unsafe { heap.free(ptr.as_ptr()) };

    assert!(heap.trim(0) || heap.stats().sbrked_mem == 0);
}
