//! Arenas: pre-reserved regions carved into segment-sized blocks.
//!
//! An arena is one large OS reservation (optionally on large pages,
//! optionally NUMA-tagged) whose blocks are claimed and released through
//! a concurrent bitmap, so segment allocation can bypass the OS entirely.
//! Segment allocation prefers arenas and falls back to direct OS
//! reservations; arenas are never returned to the OS for the lifetime of
//! the process.

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::bitmap::{Bitmap, BitmapIndex, FIELD_BITS};
use crate::context::context;
use crate::segment::{SEGMENT_ALIGN, SEGMENT_SIZE};

/// Serializes arena creation: concurrent reservations would race for the
/// same huge pages and for directory slots.
static RESERVE_LOCK: Mutex<()> = Mutex::new(());

/// Identifier of a registered arena, usable as a heap affinity.
pub type ArenaId = usize;

const MAX_ARENAS: usize = 64;

/// Where a segment's memory came from, and how to give it back.
#[derive(Debug, Clone, Copy)]
pub(crate) enum MemId {
    /// Directly reserved from the OS.
    Os(sys_alloc::Allocation),
    /// Claimed from an arena.
    Arena {
        id: ArenaId,
        index: usize,
        blocks: usize,
    },
}

pub(crate) struct Arena {
    start: NonNull<u8>,
    block_count: usize,
    field_count: usize,
    /// Region is permanently committed (reserved committed or on large
    /// pages); blocks claimed from it never need commit calls.
    committed: bool,
    numa_node: usize,
    // The bitmap fields follow this struct in the same metadata block.
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    fn bitmap(&self) -> Bitmap<'_> {
        // SAFETY: `field_count` fields were laid out right after the
        // struct when the arena was created, and are never freed.
        let fields = unsafe {
            std::slice::from_raw_parts(
                std::ptr::from_ref(self).add(1).cast::<AtomicUsize>(),
                self.field_count,
            )
        };
        Bitmap::new(fields)
    }

    fn block_ptr(&self, index: usize) -> NonNull<u8> {
        debug_assert!(index < self.block_count);
        // SAFETY: inside the arena's reservation.
        unsafe { NonNull::new_unchecked(self.start.as_ptr().add(index * SEGMENT_SIZE)) }
    }
}

/// Registry of all arenas; slots are write-once.
pub(crate) struct ArenaDirectory {
    slots: [AtomicPtr<Arena>; MAX_ARENAS],
    count: AtomicUsize,
}

impl ArenaDirectory {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [const { AtomicPtr::new(std::ptr::null_mut()) }; MAX_ARENAS],
            count: AtomicUsize::new(0),
        }
    }

    fn get(&self, id: ArenaId) -> Option<&Arena> {
        if id >= self.count.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: a published slot is never unpublished.
        unsafe { self.slots[id].load(Ordering::Acquire).as_ref() }
    }

    fn register(&self, arena: NonNull<Arena>) -> io::Result<ArenaId> {
        let id = self.count.fetch_add(1, Ordering::AcqRel);
        if id >= MAX_ARENAS {
            self.count.store(MAX_ARENAS, Ordering::Release);
            return Err(io::Error::from(io::ErrorKind::StorageFull));
        }
        self.slots[id].store(arena.as_ptr(), Ordering::Release);
        Ok(id)
    }

    fn len(&self) -> usize {
        self.count.load(Ordering::Acquire).min(MAX_ARENAS)
    }
}

/// Claims segment memory, preferring arenas over the OS.
///
/// Returns the block pointer, its provenance, and whether it is already
/// committed. `affinity` restricts the search to one arena.
pub(crate) unsafe fn alloc_aligned(
    size: usize,
    align: usize,
    commit_eager: bool,
    affinity: Option<ArenaId>,
) -> Option<(NonNull<u8>, MemId, bool)> {
    // Arena blocks are segment-aligned; stricter alignments go to the OS.
    if align <= SEGMENT_ALIGN {
        let blocks = size.div_ceil(SEGMENT_SIZE);
        let dir = &context().arenas;

        let claim_from = |id: ArenaId| -> Option<(NonNull<u8>, MemId, bool)> {
            let arena = dir.get(id)?;
            let claim = arena.bitmap().try_find_claim_across(blocks)?;
            let ptr = arena.block_ptr(claim.absolute());
            let memid = MemId::Arena {
                id,
                index: claim.absolute(),
                blocks,
            };
            Some((ptr, memid, arena.committed))
        };

        if let Some(id) = affinity {
            // Affine heaps use exactly their arena and do not spill to
            // the OS implicitly.
            return claim_from(id);
        }

        // Two passes: NUMA-local arenas first.
        let here = sys_alloc::numa_node();
        for pass in 0..2 {
            for id in 0..dir.len() {
                let local = dir.get(id).is_some_and(|a| a.numa_node == here);
                if (pass == 0) != local {
                    continue;
                }
                if let Some(found) = claim_from(id) {
                    return Some(found);
                }
            }
        }
    }

    let alloc = unsafe { sys_alloc::reserve_aligned(size, align, commit_eager, false) }.ok()?;
    Some((alloc.ptr, MemId::Os(alloc), alloc.committed))
}

/// Releases segment memory back to its origin.
pub(crate) unsafe fn free(memid: MemId, ptr: NonNull<u8>, size: usize, _committed: usize) {
    match memid {
        MemId::Os(alloc) => {
            debug_assert_eq!(alloc.ptr, ptr);
            // SAFETY: unmodified allocation handed back exactly once.
            unsafe { sys_alloc::release(alloc) };
        }
        MemId::Arena { id, index, blocks } => {
            let Some(arena) = context().arenas.get(id) else {
                debug_assert!(false, "freed into unknown arena");
                return;
            };
            if !arena.committed {
                // Return physical pages; the address range stays claimed
                // by the arena reservation.
                // SAFETY: the whole block range belongs to this claim.
                let _ = unsafe { sys_alloc::decommit(ptr, size) };
            }
            let idx = BitmapIndex::new(index / FIELD_BITS, index % FIELD_BITS);
            let ok = arena.bitmap().unclaim(idx, blocks);
            debug_assert!(ok, "arena block double-released");
        }
    }
}

fn add_arena(
    region: sys_alloc::Allocation,
    numa_node: usize,
) -> io::Result<ArenaId> {
    let block_count = region.size / SEGMENT_SIZE;
    let field_count = block_count.div_ceil(FIELD_BITS);
    let meta_size = (std::mem::size_of::<Arena>()
        + field_count * std::mem::size_of::<AtomicUsize>())
    .next_multiple_of(sys_alloc::page_size());

    // The header and bitmap live in their own small committed block; a
    // fresh commit is zeroed, which is exactly the empty bitmap.
    let meta = unsafe {
        sys_alloc::reserve_aligned(meta_size, sys_alloc::page_size(), true, false)
    }?;
    let arena_ptr = meta.ptr.as_ptr().cast::<Arena>();
    // SAFETY: committed and exclusively owned.
    unsafe {
        arena_ptr.write(Arena {
            start: region.ptr,
            block_count,
            field_count,
            committed: region.committed,
            numa_node,
        });
    }
    // Mark trailing bits beyond block_count as permanently claimed.
    let arena = unsafe { &*arena_ptr };
    let tail = block_count % FIELD_BITS;
    if tail != 0 {
        let idx = BitmapIndex::new(block_count / FIELD_BITS, tail);
        arena.bitmap().claim(idx, FIELD_BITS - tail);
    }

    context()
        .arenas
        .register(unsafe { NonNull::new_unchecked(arena_ptr) })
}

/// Reserves `size` bytes (rounded up to whole segments) as a new arena.
///
/// With `commit` the region is committed up front and stays committed;
/// with `allow_large` the OS may back it with large pages.
///
/// # Errors
///
/// Propagates OS reservation failures; `StorageFull` when the arena
/// directory is exhausted.
pub fn reserve_os_memory(size: usize, commit: bool, allow_large: bool) -> io::Result<ArenaId> {
    let _guard = RESERVE_LOCK.lock();
    let size = size
        .next_multiple_of(SEGMENT_SIZE)
        .max(SEGMENT_SIZE);
    let region =
        unsafe { sys_alloc::reserve_aligned(size, SEGMENT_ALIGN, commit, allow_large) }?;
    add_arena(region, sys_alloc::numa_node())
}

/// Reserves `pages` large OS pages on `numa_node` as a new arena,
/// retrying until `timeout_ms` elapses (0 means a single attempt).
///
/// # Errors
///
/// `TimedOut` if the pages could not be obtained within the deadline.
pub fn reserve_huge_pages(
    pages: usize,
    numa_node: usize,
    timeout_ms: u64,
) -> io::Result<ArenaId> {
    let _guard = RESERVE_LOCK.lock();
    let page = sys_alloc::large_page_size();
    if page == 0 || pages == 0 {
        return Err(io::Error::from(io::ErrorKind::Unsupported));
    }
    let size = (pages * page).next_multiple_of(SEGMENT_SIZE);
    let deadline = sys_alloc::clock_now_ms() + timeout_ms;
    loop {
        match unsafe { sys_alloc::reserve_aligned(size, SEGMENT_ALIGN, true, true) } {
            Ok(region) if region.large => return add_arena(region, numa_node),
            Ok(region) => {
                // Got ordinary pages; not what was asked for.
                unsafe { sys_alloc::release(region) };
            }
            Err(_) => {}
        }
        if sys_alloc::clock_now_ms() >= deadline {
            return Err(io::Error::from(io::ErrorKind::TimedOut));
        }
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_claim_cycle() {
        let id = reserve_os_memory(2 * SEGMENT_SIZE, false, false).expect("reserve failed");
        let (ptr, memid, committed) =
            unsafe { alloc_aligned(SEGMENT_SIZE, SEGMENT_ALIGN, false, Some(id)) }
                .expect("arena should have room");
        assert!(!committed);
        assert_eq!(ptr.as_ptr() as usize % SEGMENT_ALIGN, 0);
        assert!(matches!(memid, MemId::Arena { id: got, .. } if got == id));
        unsafe { free(memid, ptr, SEGMENT_SIZE, 0) };
        // The block is claimable again.
        let again = unsafe { alloc_aligned(SEGMENT_SIZE, SEGMENT_ALIGN, false, Some(id)) };
        assert!(again.is_some());
        let (ptr2, memid2, _) = again.unwrap();
        unsafe { free(memid2, ptr2, SEGMENT_SIZE, 0) };
    }

    #[test]
    fn test_affine_allocation_does_not_spill() {
        let id = reserve_os_memory(SEGMENT_SIZE, false, false).expect("reserve failed");
        let one = unsafe { alloc_aligned(SEGMENT_SIZE, SEGMENT_ALIGN, false, Some(id)) };
        assert!(one.is_some());
        // Arena is now full; an affine request must fail rather than
        // fall back to the OS.
        let two = unsafe { alloc_aligned(SEGMENT_SIZE, SEGMENT_ALIGN, false, Some(id)) };
        assert!(two.is_none());
        let (ptr, memid, _) = one.unwrap();
        unsafe { free(memid, ptr, SEGMENT_SIZE, 0) };
    }
}
