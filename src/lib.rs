//! A segregated-fit heap allocator with fastbins, small/large bins and a
//! pluggable system-memory backend.
//!
//! The design follows the classic boundary-tag allocator: chunks carry their
//! size and the in-use state of their neighbours in their header ([`chunk`]),
//! and free chunks are filed into fastbins and size-sorted bins ([`bins`])
//! for fast reuse. [`heap::Heap`] is the bookkeeping engine; it doesn't know
//! or care how its backing memory is obtained, it only talks to whatever
//! [`system::SystemProvider`] it's given. [`Locked`] adds a mutex around a
//! `Heap` and implements `GlobalAlloc`, so it can be dropped in as
//! `#[global_allocator]` directly.
//!
//! ```ignore
//! use dlmal::{Heap, Locked, locking::AssumeUnlockable, system::UnixMmapProvider};
//!
//! #[global_allocator]
//! static ALLOCATOR: Locked<AssumeUnlockable, UnixMmapProvider> =
//!     Locked::new(Heap::new(UnixMmapProvider::new().unwrap()));
//! ```
#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![cfg_attr(feature = "nightly_api", feature(allocator_api))]

#[cfg(feature = "std")]
extern crate std;

mod bins;
mod chunk;
mod error;
mod heap;
mod ptr_utils;
mod tunables;

pub mod locking;
pub mod system;

mod lock;

pub use error::AllocError;
pub use heap::{Heap, Info};
#[cfg(feature = "counters")]
pub use heap::Stats;
pub use lock::Locked;
pub use tunables::{Param, Tunables};
