//! A drop-in general-purpose memory allocator.
//!
//! `tessera` serves `malloc`-style workloads with low latency and low
//! fragmentation, and is safe to use from any number of threads. Memory
//! is organized as large aligned **segments** divided into fixed-size
//! **slices**; spans of slices back **pages** that hold same-size
//! **blocks**. Each thread owns a **heap** of per-size-class page queues,
//! so the allocation fast path is a table lookup and a free-list pop with
//! no synchronization at all.
//!
//! # Quick Start
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOC: tessera::Tessera = tessera::Tessera;
//!
//! fn main() {
//!     let data = vec![0u8; 4096]; // served by tessera
//!     drop(data);
//! }
//! ```
//!
//! Or use the explicit API:
//!
//! ```ignore
//! let p = tessera::allocate(256);
//! assert!(!p.is_null());
//! unsafe { tessera::free(p) };
//! ```
//!
//! # Design highlights
//!
//! - **Sharded freeing**: same-thread frees touch only thread-local
//!   lists; cross-thread frees push onto a per-page atomic list, or
//!   escalate to a per-heap delayed list guarded by a 2-bit state
//!   machine packed into the same atomic word.
//! - **Abandonment**: when a thread exits with live blocks outstanding,
//!   its segments are published on a lock-free, ABA-safe tagged-pointer
//!   stack and later reclaimed by whichever thread needs memory next.
//! - **Hardened free lists**: `next` links are stored encoded under
//!   per-page random keys; double frees, forged links and overflows are
//!   detected and reported instead of corrupting the heap.
//! - **Lazy physical memory**: segments commit 64 KiB granules on
//!   demand and purge unused ranges back to the OS on a configurable
//!   delay.
//!
//! # Thread safety
//!
//! Allocation entry points operate on the calling thread's heap and are
//! wait-free against other threads. `free` may be called from any
//! thread on any block.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod abandoned;
mod alloc;
mod arena;
mod bitmap;
mod commit_mask;
mod context;
mod encode;
mod error;
mod heap;
mod options;
mod page;
mod queue;
mod rand;
mod segment;
mod size_class;
mod stats;
mod trace;

pub use alloc::{
    allocate, allocate_aligned, allocate_aligned_at, allocate_zeroed, allocate_zeroed_count,
    collect, free, reallocate, usable_size, HeapArea, HeapHandle, Tessera,
};
pub use arena::{reserve_huge_pages, reserve_os_memory, ArenaId};
pub use error::{set_error_handler, Error, ErrorHandler};
pub use options::{options, Options};
pub use size_class::{bin, bin_size};
pub use stats::{stats, stats_merge, stats_reset, StatsSnapshot};

#[doc(hidden)]
pub use error::reset_error_count;

pub(crate) const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Test and diagnostics helpers; not part of the stable API.
#[doc(hidden)]
pub mod test_util {
    /// Number of segments currently parked in the abandoned list.
    #[must_use]
    pub fn abandoned_segment_count() -> usize {
        crate::context::context().abandoned.len()
    }
}
