//! Thread-owned heaps.
//!
//! Every thread lazily gets a backing heap plus the thread-local data
//! block holding its span queues and statistics; both live in memory
//! reserved straight from the OS layer so the allocator never recurses
//! into itself. Allocation entry points are single-writer: only the
//! owning thread may allocate from a heap. Frees can arrive from
//! anywhere and are funneled through the page or heap delayed lists.
//!
//! On thread exit the guard drops: remaining heaps are absorbed into the
//! backing heap, every page with live blocks is abandoned to the global
//! stack, and empty segments go back to the OS.

use std::cell::Cell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::arena::ArenaId;
use crate::encode::{decode, encode};
use crate::error::{self, Error};
use crate::page::{Block, Delayed, Page, EMPTY_PAGE};
use crate::queue::{self, PageQueue};
use crate::rand::Rng;
use crate::segment::{self, SegmentsTld, Segment, LARGE_OBJ_SIZE_MAX};
use crate::size_class::{bin, bin_size, wsize_of, BIN_COUNT, BIN_FULL, BIN_HUGE, SMALL_SIZE_MAX, SMALL_WSIZE_MAX};
use crate::stats::ThreadStats;
use crate::{stats, WORD_SIZE};

/// Per-block canary overhead.
#[cfg(feature = "padding")]
pub(crate) const PADDING_SIZE: usize = WORD_SIZE;
#[cfg(not(feature = "padding"))]
pub(crate) const PADDING_SIZE: usize = 0;

/// A thread-owned allocation context: one page queue per size bin plus
/// the small-size direct-dispatch table.
#[repr(C)]
pub struct Heap {
    pub(crate) tld: *mut Tld,
    pub(crate) thread_id: usize,
    /// Keys for encoding the heap delayed-free links.
    pub(crate) keys: [usize; 2],
    /// Non-zero while the heap is alive; zeroed on delete/destroy so a
    /// stale handle trips the debug assertions instead of corrupting.
    pub(crate) cookie: Cell<usize>,
    pub(crate) rng: Rng,
    pub(crate) arena_id: Option<ArenaId>,
    /// Cross-thread frees that escalated past their page.
    pub(crate) thread_delayed_free: AtomicPtr<Block>,
    /// O(1) dispatch for sizes up to [`SMALL_SIZE_MAX`].
    pub(crate) pages_free_direct: [Cell<*mut Page>; SMALL_WSIZE_MAX + 1],
    pub(crate) queues: [PageQueue; BIN_COUNT],
    pub(crate) page_count: Cell<usize>,
    pub(crate) page_retired_min: Cell<usize>,
    pub(crate) page_retired_max: Cell<usize>,
    /// Next heap created by the same thread.
    pub(crate) next: Cell<*mut Heap>,
}

// SAFETY: only `thread_delayed_free` is touched cross-thread (atomic);
// everything else is owned by `thread_id`.
unsafe impl Sync for Heap {}

/// Thread-local data shared by all heaps of one thread.
pub(crate) struct Tld {
    pub segments: SegmentsTld,
    pub stats: ThreadStats,
    /// The thread's default backing heap.
    pub backing: Cell<*mut Heap>,
    /// All heaps created by this thread.
    pub heaps: Cell<*mut Heap>,
}

/// The OS-backed block holding a thread's `Tld` and backing heap.
#[repr(C)]
struct ThreadData {
    tld: Tld,
    heap: Heap,
    meta: sys_alloc::Allocation,
}

impl Heap {
    pub(crate) fn tld(&self) -> &Tld {
        // SAFETY: set once at init; the Tld outlives every heap of the
        // thread.
        unsafe { &*self.tld }
    }

    fn new_value(tld: *mut Tld, arena_id: Option<ArenaId>) -> Self {
        let rng = Rng::from_entropy();
        Self {
            tld,
            thread_id: thread_id(),
            keys: rng.next_keys(),
            cookie: Cell::new(rng.next() | 1),
            rng,
            arena_id,
            thread_delayed_free: AtomicPtr::new(ptr::null_mut()),
            pages_free_direct: std::array::from_fn(|_| {
                Cell::new(ptr::from_ref(&EMPTY_PAGE).cast_mut())
            }),
            queues: std::array::from_fn(|i| PageQueue::new(queue_block_size(i))),
            page_count: Cell::new(0),
            page_retired_min: Cell::new(BIN_FULL),
            page_retired_max: Cell::new(0),
            next: Cell::new(ptr::null_mut()),
        }
    }
}

fn queue_block_size(bin_idx: usize) -> usize {
    if bin_idx == 0 {
        WORD_SIZE
    } else {
        bin_size(bin_idx.min(BIN_HUGE))
    }
}

// ----------------------------------------------------------------------
// Thread-local plumbing
// ----------------------------------------------------------------------

/// Cheap numeric identity of the current thread (address of a TLS slot).
#[inline]
pub(crate) fn thread_id() -> usize {
    thread_local! {
        static SLOT: u8 = const { 0 };
    }
    SLOT.try_with(|slot| ptr::from_ref(slot) as usize).unwrap_or(0)
}

struct ThreadGuard {
    data: Cell<*mut ThreadData>,
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        let data = self.data.get();
        if !data.is_null() {
            // SAFETY: set exactly once by `init_thread`.
            unsafe { thread_done(NonNull::new_unchecked(data)) };
        }
    }
}

thread_local! {
    static DEFAULT_HEAP: Cell<*mut Heap> = const { Cell::new(ptr::null_mut()) };
    static THREAD_GUARD: ThreadGuard = const {
        ThreadGuard { data: Cell::new(ptr::null_mut()) }
    };
}

/// The thread's current default heap, creating the thread state on first
/// use. Returns `None` only during thread teardown or on OS exhaustion.
#[inline]
pub(crate) fn try_default_heap() -> Option<NonNull<Heap>> {
    DEFAULT_HEAP
        .try_with(|cell| match NonNull::new(cell.get()) {
            Some(heap) => Some(heap),
            None => init_thread().inspect(|heap| cell.set(heap.as_ptr())),
        })
        .ok()
        .flatten()
}

#[cold]
fn init_thread() -> Option<NonNull<Heap>> {
    let size = std::mem::size_of::<ThreadData>().next_multiple_of(sys_alloc::page_size());
    let meta = unsafe {
        sys_alloc::reserve_aligned(size, sys_alloc::page_size(), true, false)
    }
    .ok()?;
    let data = meta.ptr.as_ptr().cast::<ThreadData>();
    let tld_ptr = unsafe { &raw mut (*data).tld };
    // SAFETY: committed, exclusively owned, properly aligned.
    unsafe {
        ptr::write(
            data,
            ThreadData {
                tld: Tld {
                    segments: SegmentsTld::new(),
                    stats: ThreadStats::new(),
                    backing: Cell::new(ptr::null_mut()),
                    heaps: Cell::new(ptr::null_mut()),
                },
                heap: Heap::new_value(tld_ptr, None),
                meta,
            },
        );
        let heap_ptr = &raw mut (*data).heap;
        (*data).tld.backing.set(heap_ptr);
        (*data).tld.heaps.set(heap_ptr);
        if THREAD_GUARD.try_with(|guard| guard.data.set(data)).is_err() {
            // TLS teardown already ran; do not leak the reservation.
            sys_alloc::release(meta);
            return None;
        }
        Some(NonNull::new_unchecked(heap_ptr))
    }
}

/// Replaces the calling thread's default heap, returning the previous
/// one. The heap must belong to this thread.
pub(crate) fn set_default_heap(heap: NonNull<Heap>) -> Option<NonNull<Heap>> {
    debug_assert_eq!(unsafe { heap.as_ref() }.thread_id, thread_id());
    DEFAULT_HEAP
        .try_with(|cell| {
            let old = cell.replace(heap.as_ptr());
            NonNull::new(old)
        })
        .ok()
        .flatten()
}

/// Applies `f` to this thread's statistics, if the thread is initialized.
pub(crate) fn with_thread_stats(f: impl FnOnce(&ThreadStats)) {
    if let Some(heap) = DEFAULT_HEAP.try_with(|c| NonNull::new(c.get())).ok().flatten() {
        f(&unsafe { heap.as_ref() }.tld().stats);
    }
}

unsafe fn thread_done(data: NonNull<ThreadData>) {
    let tld = unsafe { &(*data.as_ptr()).tld };
    let backing = tld.backing.get();

    // User heaps that were never deleted fold into the backing heap.
    let mut cursor = tld.heaps.get();
    while let Some(heap) = NonNull::new(cursor) {
        cursor = unsafe { heap.as_ref() }.next.get();
        if heap.as_ptr() != backing {
            unsafe { heap_delete(heap) };
        }
    }

    let backing = unsafe { NonNull::new_unchecked(backing) };
    unsafe { heap_collect_abandon(backing) };

    tld.stats.merge(stats::global());
    debug_assert_eq!(tld.segments.count.get(), 0);

    let _ = DEFAULT_HEAP.try_with(|cell| cell.set(ptr::null_mut()));
    let meta = unsafe { (*data.as_ptr()).meta };
    // SAFETY: nothing references the thread data anymore.
    unsafe { sys_alloc::release(meta) };
}

// ----------------------------------------------------------------------
// Allocation
// ----------------------------------------------------------------------

#[inline]
fn padded(size: usize) -> usize {
    size + PADDING_SIZE
}

/// Writes the canary after the usable bytes of a fresh block.
#[inline]
unsafe fn write_canary(page: NonNull<Page>, block: NonNull<Block>) {
    #[cfg(feature = "padding")]
    unsafe {
        let bsize = Page::actual_block_size(page);
        let slot = (block.as_ptr() as usize + bsize - PADDING_SIZE) as *mut usize;
        slot.write(block.as_ptr() as usize ^ page.as_ref().keys.get()[1]);
    }
    #[cfg(not(feature = "padding"))]
    {
        let _ = (page, block);
    }
}

/// Verifies the canary; reports (and tolerates) an overflow.
#[inline]
pub(crate) unsafe fn check_canary(page: NonNull<Page>, block: NonNull<Block>) {
    #[cfg(feature = "padding")]
    unsafe {
        let bsize = Page::actual_block_size(page);
        let slot = (block.as_ptr() as usize + bsize - PADDING_SIZE) as *const usize;
        if slot.read() != (block.as_ptr() as usize ^ page.as_ref().keys.get()[1]) {
            error::report(Error::Overflow {
                addr: block.as_ptr() as usize,
            });
        }
    }
    #[cfg(not(feature = "padding"))]
    {
        let _ = (page, block);
    }
}

#[inline]
unsafe fn finish_alloc(heap: &Heap, page: NonNull<Page>, block: NonNull<Block>) -> *mut u8 {
    unsafe { write_canary(page, block) };
    stats::global().block_allocated(unsafe { Page::actual_block_size(page) });
    let ts = &heap.tld().stats;
    ts.malloc_count.set(ts.malloc_count.get() + 1);
    block.as_ptr().cast()
}

/// Heap allocation fast path: direct-table lookup plus a free-list pop.
#[inline]
pub(crate) unsafe fn heap_malloc(heap: NonNull<Heap>, size: usize) -> *mut u8 {
    let h = unsafe { heap.as_ref() };
    debug_assert_eq!(h.thread_id, thread_id());
    debug_assert_ne!(h.cookie.get(), 0, "heap used after delete");
    let total = padded(size);
    if total <= SMALL_SIZE_MAX {
        let page = h.pages_free_direct[wsize_of(total)].get();
        let page = unsafe { NonNull::new_unchecked(page) };
        if let Some(block) = unsafe { Page::pop_free(page) } {
            return unsafe { finish_alloc(h, page, block) };
        }
    }
    unsafe { malloc_generic(heap, size) }
}

#[cold]
pub(crate) unsafe fn malloc_generic(heap: NonNull<Heap>, size: usize) -> *mut u8 {
    let h = unsafe { heap.as_ref() };

    // Deferred duties first: drain escalated frees so pages in the full
    // queue can come back.
    unsafe { heap_delayed_free_partial(h) };

    let total = padded(size);
    if total > LARGE_OBJ_SIZE_MAX {
        return unsafe { huge_malloc(heap, size, 0) };
    }

    let bin_idx = bin(total);
    let Some(page) = (unsafe { queue::find_free_page(h, bin_idx, true) }) else {
        error::report(Error::OutOfMemory { size });
        return ptr::null_mut();
    };
    debug_assert!(unsafe { page.as_ref() }.immediate_available());
    let block = unsafe { Page::pop_free(page) }.unwrap_or_else(|| unreachable!());
    unsafe { finish_alloc(h, page, block) }
}

/// Dedicated-segment allocation; `page_alignment` is 0 or a power of two
/// above [`crate::segment::ALIGNMENT_MAX`].
pub(crate) unsafe fn huge_malloc(
    heap: NonNull<Heap>,
    size: usize,
    page_alignment: usize,
) -> *mut u8 {
    let h = unsafe { heap.as_ref() };
    let total = padded(size);
    let Some(page) = (unsafe { segment::page_alloc(h, total, page_alignment, h.tld()) }) else {
        error::report(Error::OutOfMemory { size });
        return ptr::null_mut();
    };
    unsafe {
        h.queue_push_front(BIN_HUGE, page);
        let block = Page::pop_free(page).unwrap_or_else(|| unreachable!());
        finish_alloc(h, page, block)
    }
}

// ----------------------------------------------------------------------
// Freeing (same-thread path; the entry point lives in `alloc`)
// ----------------------------------------------------------------------

/// Frees a block owned by the current thread. Returns `false` when the
/// free was rejected as a double free.
pub(crate) unsafe fn free_local_block(page: NonNull<Page>, block: NonNull<Block>) -> bool {
    let this = unsafe { page.as_ref() };
    if unsafe { Page::is_double_free(page, block) } {
        return false;
    }
    unsafe { check_canary(page, block) };

    unsafe { this.block_set_next(block, this.local_free.get()) };
    this.local_free.set(block.as_ptr());
    this.used.set(this.used.get() - 1);

    let heap = this.heap_ptr();
    if let Some(heap) = unsafe { heap.as_ref() } {
        if this.all_free() {
            unsafe { queue::page_retire(heap, page) };
        } else if this.in_full() {
            unsafe { queue::page_unfull(heap, page) };
        }
    }
    true
}

// ----------------------------------------------------------------------
// Heap delayed-free list
// ----------------------------------------------------------------------

unsafe fn delayed_push(h: &Heap, block: NonNull<Block>) {
    let mut head = h.thread_delayed_free.load(Ordering::Relaxed);
    loop {
        let token = encode(head as usize, h.keys);
        // SAFETY: the block is free and owned by this list.
        unsafe { (*block.as_ptr().cast::<Cell<usize>>()).set(token) };
        match h.thread_delayed_free.compare_exchange_weak(
            head,
            block.as_ptr(),
            Ordering::Release,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(actual) => head = actual,
        }
    }
}

/// Resolves one entry of the heap delayed list into a same-thread free.
/// Fails (and leaves the block pending) only while another thread holds
/// the page's transient `DelayedFreeing` state.
unsafe fn free_delayed_block(block: NonNull<Block>) -> bool {
    let seg = unsafe { Segment::of_block(block.as_ptr() as usize) };
    debug_assert!(unsafe { seg.as_ref() }.is_local());
    let page = unsafe { Segment::page_of(seg, block.as_ptr() as usize) };

    // Re-arm delayed freeing before collecting, so a racing remote free
    // cannot strand a block on the page list while we tear the page down.
    if !unsafe { Page::try_set_delayed(page, Delayed::UseDelayedFree, false) } {
        return false;
    }
    unsafe {
        Page::collect_free(page, false);
        free_local_block(page, block);
    }
    true
}

pub(crate) unsafe fn heap_delayed_free_partial(h: &Heap) {
    unsafe { heap_delayed_free(h, false) };
}

pub(crate) unsafe fn heap_delayed_free_all(h: &Heap) {
    unsafe { heap_delayed_free(h, true) };
}

unsafe fn heap_delayed_free(h: &Heap, all: bool) {
    loop {
        let mut block = h.thread_delayed_free.swap(ptr::null_mut(), Ordering::AcqRel);
        if block.is_null() {
            return;
        }
        while let Some(current) = NonNull::new(block) {
            // Links are heap-keyed; they span pages.
            let token = unsafe { (*current.as_ptr().cast::<Cell<usize>>()).get() };
            block = decode(token, h.keys) as *mut Block;
            if !unsafe { free_delayed_block(current) } {
                unsafe { delayed_push(h, current) };
            }
        }
        if !all {
            return;
        }
    }
}

// ----------------------------------------------------------------------
// Collect
// ----------------------------------------------------------------------

/// Drains pending frees and returns every reclaimable page and segment.
/// With `force`, retire delays are skipped and scheduled purges execute
/// immediately.
pub(crate) unsafe fn heap_collect(heap: NonNull<Heap>, force: bool) {
    let h = unsafe { heap.as_ref() };
    debug_assert_eq!(h.thread_id, thread_id());

    unsafe { heap_delayed_free_all(h) };

    for bin_idx in 0..BIN_COUNT {
        let mut cursor = h.queues[bin_idx].first.get();
        while let Some(page) = NonNull::new(cursor) {
            cursor = unsafe { page.as_ref() }.next.get();
            unsafe { Page::collect_free(page, force) };
            if unsafe { page.as_ref() }.all_free() {
                unsafe { queue::page_free(h, page, bin_idx, force) };
            }
        }
    }
    unsafe { queue::collect_retired(h, force) };
    h.tld().segments.purge_expired(force);
}

/// Thread-exit collection: abandons every page that still holds live
/// blocks and frees the rest.
unsafe fn heap_collect_abandon(heap: NonNull<Heap>) {
    let h = unsafe { heap.as_ref() };

    // Stop escalation first so no new block lands on our delayed list
    // after it drains.
    for bin_idx in 0..BIN_COUNT {
        let mut cursor = h.queues[bin_idx].first.get();
        while let Some(page) = NonNull::new(cursor) {
            cursor = unsafe { page.as_ref() }.next.get();
            unsafe { Page::set_delayed(page, Delayed::NeverDelayedFree, false) };
        }
    }
    unsafe { heap_delayed_free_all(h) };

    for bin_idx in 0..BIN_COUNT {
        while let Some(page) = NonNull::new(h.queues[bin_idx].first.get()) {
            unsafe {
                Page::collect_free(page, true);
                if page.as_ref().all_free() {
                    queue::page_free(h, page, bin_idx, true);
                } else {
                    h.queue_remove(bin_idx, page);
                    page.as_ref().set_heap(ptr::null_mut());
                    segment::page_abandon(page, h.tld());
                }
            }
        }
    }
}

// ----------------------------------------------------------------------
// Heap lifecycle
// ----------------------------------------------------------------------

/// Creates a fresh heap for the current thread, optionally pinned to an
/// arena.
pub(crate) unsafe fn heap_new(arena_id: Option<ArenaId>) -> Option<NonNull<Heap>> {
    let default = try_default_heap()?;
    let raw = unsafe { heap_malloc(default, std::mem::size_of::<Heap>()) };
    let raw = NonNull::new(raw.cast::<Heap>())?;
    let tld = unsafe { default.as_ref() }.tld;
    // SAFETY: fresh block of sufficient size; Heap is 8-byte aligned and
    // block sizes are multiples of 16.
    unsafe {
        ptr::write(raw.as_ptr(), Heap::new_value(tld, arena_id));
        let tld = &*tld;
        raw.as_ref().next.set(tld.heaps.get());
        tld.heaps.set(raw.as_ptr());
    }
    Some(raw)
}

unsafe fn heap_unlink(heap: NonNull<Heap>) {
    let tld = unsafe { heap.as_ref() }.tld();
    let mut cursor = tld.heaps.get();
    let mut prev: *mut Heap = ptr::null_mut();
    while let Some(current) = NonNull::new(cursor) {
        if current == heap {
            let next = unsafe { current.as_ref() }.next.get();
            if let Some(prev) = unsafe { prev.as_ref() } {
                prev.next.set(next);
            } else {
                tld.heaps.set(next);
            }
            return;
        }
        prev = cursor;
        cursor = unsafe { current.as_ref() }.next.get();
    }
}

/// Deletes a heap, migrating all still-used pages into the thread's
/// backing heap. Live blocks stay valid.
pub(crate) unsafe fn heap_delete(heap: NonNull<Heap>) {
    let h = unsafe { heap.as_ref() };
    debug_assert_eq!(h.thread_id, thread_id());
    let tld = h.tld();
    let backing_ptr = tld.backing.get();
    if heap.as_ptr() == backing_ptr {
        return; // the backing heap lives until thread exit
    }
    let backing = unsafe { &*backing_ptr };

    // If this heap is the thread default, fall back to the backing heap.
    let _ = DEFAULT_HEAP.try_with(|cell| {
        if cell.get() == heap.as_ptr() {
            cell.set(backing_ptr);
        }
    });

    for bin_idx in 0..BIN_COUNT {
        unsafe { backing.queue_absorb(bin_idx, h) };
    }

    // Escalated frees belong to pages that are now the backing heap's.
    let mut block = h.thread_delayed_free.swap(ptr::null_mut(), Ordering::AcqRel);
    while let Some(current) = NonNull::new(block) {
        let token = unsafe { (*current.as_ptr().cast::<Cell<usize>>()).get() };
        block = decode(token, h.keys) as *mut Block;
        unsafe { delayed_push(backing, current) };
    }

    h.cookie.set(0);
    unsafe {
        heap_unlink(heap);
        crate::alloc::free(heap.as_ptr().cast());
    }
}

/// Destroys a heap, freeing every page outright. Any outstanding pointer
/// into this heap becomes dangling; only safe when the heap exclusively
/// served data that is no longer referenced.
pub(crate) unsafe fn heap_destroy(heap: NonNull<Heap>) {
    let h = unsafe { heap.as_ref() };
    debug_assert_eq!(h.thread_id, thread_id());
    let tld = h.tld();
    if heap.as_ptr() == tld.backing.get() {
        return;
    }

    let _ = DEFAULT_HEAP.try_with(|cell| {
        if cell.get() == heap.as_ptr() {
            cell.set(tld.backing.get());
        }
    });

    // Drop the delayed list: those blocks die with their pages.
    h.thread_delayed_free.store(ptr::null_mut(), Ordering::Release);

    for bin_idx in 0..BIN_COUNT {
        while let Some(page) = NonNull::new(h.queues[bin_idx].first.get()) {
            let page_ref = unsafe { page.as_ref() };
            // Pull in pending frees first: those were already accounted
            // by their `free` calls.
            unsafe { Page::collect_free(page, true) };
            // Settle the books for the blocks being killed.
            let live = page_ref.used.get() as usize;
            if live > 0 {
                let bsize = unsafe { Page::actual_block_size(page) };
                for _ in 0..live {
                    stats::global().block_freed(bsize);
                }
                page_ref.used.set(0);
            }
            unsafe {
                Page::set_delayed(page, Delayed::NeverDelayedFree, false);
                h.queue_remove(bin_idx, page);
                page_ref.set_heap(ptr::null_mut());
                segment::page_free(page, true, tld);
            }
        }
    }

    h.cookie.set(0);
    unsafe {
        heap_unlink(heap);
        crate::alloc::free(heap.as_ptr().cast());
    }
}
