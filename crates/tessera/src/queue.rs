//! Per-heap page queues.
//!
//! Each heap owns one doubly linked queue of pages per size bin, plus a
//! queue of full pages. Queues are single-owner (the heap's thread), so
//! linkage goes through plain cells. The small-size direct-dispatch table
//! is maintained here: whenever the first page of a small bin changes,
//! the affected table slots are repointed so the hot allocation path is a
//! single indexed load.

use std::cell::Cell;
use std::ptr::{self, NonNull};

use crate::heap::Heap;
use crate::page::{Delayed, Page, EMPTY_PAGE};
use crate::segment::{self, MEDIUM_OBJ_SIZE_MAX};
use crate::size_class::{bin, bin_size, BIN_FULL, BIN_HUGE, SMALL_SIZE_MAX, SMALL_WSIZE_MAX};
use crate::WORD_SIZE;

/// Pages at most this large take the retire-delay path instead of being
/// returned to the segment immediately.
const MAX_RETIRE_SIZE: usize = MEDIUM_OBJ_SIZE_MAX;
/// Collect sweeps an empty sole page survives before it is freed.
const RETIRE_CYCLES: u8 = 16;

/// A doubly linked list of pages sharing one size bin.
#[derive(Debug)]
pub struct PageQueue {
    pub first: Cell<*mut Page>,
    pub last: Cell<*mut Page>,
    pub block_size: usize,
}

impl PageQueue {
    #[must_use]
    pub(crate) const fn new(block_size: usize) -> Self {
        Self {
            first: Cell::new(ptr::null_mut()),
            last: Cell::new(ptr::null_mut()),
            block_size,
        }
    }

    #[inline]
    fn only_entry(&self, page: NonNull<Page>) -> bool {
        self.first.get() == page.as_ptr() && self.last.get() == page.as_ptr()
    }
}

impl Heap {
    #[inline]
    pub(crate) fn queue(&self, bin: usize) -> &PageQueue {
        &self.queues[bin]
    }

    /// The bin whose queue currently holds `page`.
    pub(crate) unsafe fn bin_of(&self, page: NonNull<Page>) -> usize {
        let page_ref = unsafe { page.as_ref() };
        if page_ref.in_full() {
            BIN_FULL
        } else if page_ref.is_huge() {
            BIN_HUGE
        } else {
            bin(page_ref.block_size())
        }
    }

    /// Repoints the direct-dispatch slots served by `bin` at its current
    /// first page (or the shared empty page).
    pub(crate) fn queue_first_update(&self, bin_idx: usize) {
        if bin_idx >= BIN_FULL || bin_size(bin_idx.max(1)) > SMALL_SIZE_MAX {
            return;
        }
        let first = self.queues[bin_idx].first.get();
        let target = if first.is_null() {
            ptr::from_ref(&EMPTY_PAGE).cast_mut()
        } else {
            first
        };
        for wsize in 0..=SMALL_WSIZE_MAX {
            if bin(wsize * WORD_SIZE) == bin_idx {
                self.pages_free_direct[wsize].set(target);
            }
        }
    }

    pub(crate) unsafe fn queue_push_front(&self, bin_idx: usize, page: NonNull<Page>) {
        let queue = self.queue(bin_idx);
        let page_ref = unsafe { page.as_ref() };
        debug_assert!(page_ref.prev.get().is_null() && page_ref.next.get().is_null());
        debug_assert!(
            bin_idx == BIN_FULL || bin_idx == BIN_HUGE || page_ref.block_size() == queue.block_size
        );

        page_ref.set_in_full(bin_idx == BIN_FULL);
        page_ref.next.set(queue.first.get());
        if let Some(old_first) = unsafe { queue.first.get().as_ref() } {
            old_first.prev.set(page.as_ptr());
        } else {
            queue.last.set(page.as_ptr());
        }
        queue.first.set(page.as_ptr());
        self.queue_first_update(bin_idx);
        self.page_count.set(self.page_count.get() + 1);
    }

    pub(crate) unsafe fn queue_remove(&self, bin_idx: usize, page: NonNull<Page>) {
        let queue = self.queue(bin_idx);
        let page_ref = unsafe { page.as_ref() };
        let was_first = queue.first.get() == page.as_ptr();

        let prev = page_ref.prev.get();
        let next = page_ref.next.get();
        if let Some(prev) = unsafe { prev.as_ref() } {
            prev.next.set(next);
        } else {
            queue.first.set(next);
        }
        if let Some(next) = unsafe { next.as_ref() } {
            next.prev.set(prev);
        } else {
            queue.last.set(prev);
        }
        page_ref.prev.set(ptr::null_mut());
        page_ref.next.set(ptr::null_mut());
        page_ref.set_in_full(false);

        if was_first {
            self.queue_first_update(bin_idx);
        }
        self.page_count.set(self.page_count.get() - 1);
    }

    /// Moves a page from one queue to the back of another.
    pub(crate) unsafe fn queue_enqueue_from(
        &self,
        to_bin: usize,
        from_bin: usize,
        page: NonNull<Page>,
    ) {
        let page_ref = unsafe { page.as_ref() };
        let from = self.queue(from_bin);
        let to = self.queue(to_bin);
        let was_first = from.first.get() == page.as_ptr();

        let prev = page_ref.prev.get();
        let next = page_ref.next.get();
        if let Some(prev) = unsafe { prev.as_ref() } {
            prev.next.set(next);
        } else {
            from.first.set(next);
        }
        if let Some(next) = unsafe { next.as_ref() } {
            next.prev.set(prev);
        } else {
            from.last.set(prev);
        }
        if was_first {
            self.queue_first_update(from_bin);
        }

        // Push to the back of the target so long-lived pages drift away
        // from the allocation front.
        page_ref.next.set(ptr::null_mut());
        page_ref.prev.set(to.last.get());
        if let Some(old_last) = unsafe { to.last.get().as_ref() } {
            old_last.next.set(page.as_ptr());
        } else {
            to.first.set(page.as_ptr());
            self.queue_first_update(to_bin);
        }
        to.last.set(page.as_ptr());
        page_ref.set_in_full(to_bin == BIN_FULL);
    }

    /// Appends every page of `from`'s queue `bin_idx` to ours, rebinding
    /// the pages' heap pointers. Used when a deleted heap is absorbed.
    pub(crate) unsafe fn queue_absorb(&self, bin_idx: usize, from: &Heap) {
        let src = from.queue(bin_idx);
        if src.first.get().is_null() {
            return;
        }
        let mut moved = 0;
        let mut cursor = src.first.get();
        while let Some(page) = NonNull::new(cursor) {
            let page_ref = unsafe { page.as_ref() };
            cursor = page_ref.next.get();
            unsafe {
                // Wait out any in-flight escalation: a remote freer
                // holding DelayedFreeing still reads the old heap
                // pointer, whose delayed list is migrated after this.
                Page::set_delayed(page, Delayed::NoDelayedFree, false);
            }
            page_ref.set_heap(ptr::from_ref(self).cast_mut());
            moved += 1;
        }

        let dst = self.queue(bin_idx);
        let src_first = src.first.get();
        let src_last = src.last.get();
        if let Some(old_last) = unsafe { dst.last.get().as_ref() } {
            old_last.next.set(src_first);
            unsafe { (*src_first).prev.set(dst.last.get()) };
        } else {
            dst.first.set(src_first);
            self.queue_first_update(bin_idx);
        }
        dst.last.set(src_last);
        self.page_count.set(self.page_count.get() + moved);
        from.page_count.set(from.page_count.get() - moved);
        src.first.set(ptr::null_mut());
        src.last.set(ptr::null_mut());
        from.queue_first_update(bin_idx);
    }
}

/// Moves a page with no free blocks to the full queue so the find loop
/// stops revisiting it.
pub(crate) unsafe fn page_to_full(heap: &Heap, page: NonNull<Page>, bin_idx: usize) {
    debug_assert!(!unsafe { page.as_ref() }.immediate_available());
    debug_assert!(!unsafe { page.as_ref() }.in_full());

    unsafe {
        heap.queue_enqueue_from(BIN_FULL, bin_idx, page);
        // Remote frees on a full page must surface on the heap delayed
        // list, otherwise the owner would never notice the page has room
        // again.
        Page::set_delayed(page, Delayed::UseDelayedFree, false);
        // A remote free may have slipped in just before the flag was set.
        Page::collect_free(page, false);
    }
}

/// Moves a page from the full queue back to its size bin.
pub(crate) unsafe fn page_unfull(heap: &Heap, page: NonNull<Page>) {
    debug_assert!(unsafe { page.as_ref() }.in_full());
    unsafe {
        Page::set_delayed(page, Delayed::NoDelayedFree, false);
        let bin_idx = bin(page.as_ref().block_size());
        heap.queue_enqueue_from(bin_idx, BIN_FULL, page);
    }
}

/// Detaches a page from its queue and returns it to the segment layer.
pub(crate) unsafe fn page_free(heap: &Heap, page: NonNull<Page>, bin_idx: usize, force: bool) {
    let page_ref = unsafe { page.as_ref() };
    debug_assert!(page_ref.all_free());
    page_ref.set_has_aligned(false);
    unsafe {
        // Sticky terminal state until the span is rematerialized.
        Page::set_delayed(page, Delayed::NeverDelayedFree, false);
        heap.queue_remove(bin_idx, page);
        page_ref.set_heap(ptr::null_mut());
        segment::page_free(page, force, heap.tld());
    }
}

/// Called when the last used block of a page is freed. The sole page of a
/// bin is kept for a few collect cycles to damp alloc/free oscillation.
pub(crate) unsafe fn page_retire(heap: &Heap, page: NonNull<Page>) {
    let page_ref = unsafe { page.as_ref() };
    debug_assert!(page_ref.all_free());

    page_ref.set_has_aligned(false);
    let bin_idx = unsafe { heap.bin_of(page) };
    if bin_idx < BIN_HUGE && page_ref.block_size() <= MAX_RETIRE_SIZE {
        let queue = heap.queue(bin_idx);
        if queue.only_entry(page) {
            page_ref.retire_expire.set(
                if page_ref.block_size() <= SMALL_SIZE_MAX {
                    RETIRE_CYCLES
                } else {
                    RETIRE_CYCLES / 4
                },
            );
            if bin_idx < heap.page_retired_min.get() {
                heap.page_retired_min.set(bin_idx);
            }
            if bin_idx > heap.page_retired_max.get() {
                heap.page_retired_max.set(bin_idx);
            }
            return;
        }
    }
    unsafe { page_free(heap, page, bin_idx, false) };
}

/// Periodic sweep over bins that hold a retire-pending page; frees those
/// whose countdown elapsed (all of them when `force`).
pub(crate) unsafe fn collect_retired(heap: &Heap, force: bool) {
    let mut min = BIN_FULL;
    let mut max = 0;
    let lo = heap.page_retired_min.get();
    let hi = heap.page_retired_max.get().min(BIN_HUGE - 1);
    for bin_idx in lo..=hi {
        let queue = heap.queue(bin_idx);
        let Some(page) = NonNull::new(queue.first.get()) else {
            continue;
        };
        let page_ref = unsafe { page.as_ref() };
        let expire = page_ref.retire_expire.get();
        if expire == 0 {
            continue;
        }
        if page_ref.all_free() && queue.only_entry(page) {
            if force || expire == 1 {
                unsafe { page_free(heap, page, bin_idx, force) };
                heap.tld().stats.retired_pages.set(
                    heap.tld().stats.retired_pages.get() + 1,
                );
                continue;
            }
            page_ref.retire_expire.set(expire - 1);
            if bin_idx < min {
                min = bin_idx;
            }
            if bin_idx > max {
                max = bin_idx;
            }
        } else {
            page_ref.retire_expire.set(0);
        }
    }
    heap.page_retired_min.set(min);
    heap.page_retired_max.set(max);
}

/// Finds a page with a free block in `bin`'s queue, collecting pending
/// frees and extending capacity along the way; asks the segment layer for
/// a fresh page when the queue is exhausted.
pub(crate) unsafe fn find_free_page(
    heap: &Heap,
    bin_idx: usize,
    first_try: bool,
) -> Option<NonNull<Page>> {
    debug_assert!(bin_idx < BIN_HUGE);
    let queue = heap.queue(bin_idx);
    let mut cursor = queue.first.get();
    while let Some(page) = NonNull::new(cursor) {
        let next = unsafe { page.as_ref() }.next.get();

        // 0. pick up frees left by us and by other threads
        unsafe { Page::collect_free(page, false) };

        // 1. done if the page has a block ready
        if unsafe { page.as_ref() }.immediate_available() {
            break;
        }

        // 2. otherwise thread more blocks if any are reserved
        if unsafe { page.as_ref() }.capacity.get() < unsafe { page.as_ref() }.reserved.get() {
            unsafe { Page::extend_free(page, heap) };
            break;
        }

        // 3. genuinely full; park it so we stop revisiting it
        unsafe { page_to_full(heap, page, bin_idx) };
        cursor = next;
    }

    if let Some(page) = NonNull::new(cursor) {
        unsafe { page.as_ref() }.retire_expire.set(0);
        return Some(page);
    }

    unsafe { collect_retired(heap, false) };
    let fresh = unsafe { fresh_page(heap, bin_idx) };
    if fresh.is_none() && first_try {
        // A reclaim may have landed a usable page in our queue instead of
        // handing one back directly; scan once more.
        unsafe { find_free_page(heap, bin_idx, false) }
    } else {
        fresh
    }
}

/// Materializes a fresh page for `bin` from the segment layer.
unsafe fn fresh_page(heap: &Heap, bin_idx: usize) -> Option<NonNull<Page>> {
    let block_size = bin_size(bin_idx);
    let page = unsafe { segment::page_alloc(heap, block_size, 0, heap.tld())? };
    unsafe {
        Page::init(page, heap, block_size);
        heap.queue_push_front(bin_idx, page);
    }
    let stats = &heap.tld().stats;
    stats.fresh_pages.set(stats.fresh_pages.get() + 1);
    Some(page)
}
