//! Segments and slice spans.
//!
//! A segment is a 32 MiB aligned region divided into 64 KiB slices. The
//! header holds the segment struct plus one metadata entry per slice; a
//! contiguous run of slices (a span) either backs a page or sits free on
//! a per-thread span queue binned by slice count. Freeing a span always
//! coalesces with free neighbors. Physical memory is committed per slice
//! through the segment's commit mask and released again through the purge
//! mask on a delay.
//!
//! Segment ownership: exactly one thread owns a segment (`thread_id`);
//! ownership 0 means the segment sits in the global abandoned list until
//! some thread reclaims it.

use std::cell::Cell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::arena::{self, MemId};
use crate::commit_mask::CommitMask;
use crate::context::context;
use crate::error::{self, Error};
use crate::heap::{thread_id, Heap, Tld};
use crate::page::{Delayed, Page, PageArea, HUGE_BLOCK_SIZE};
use crate::size_class::{bin, BIN_HUGE};
use crate::{stats, trace, WORD_SIZE};

pub const SLICE_SHIFT: usize = 16;
/// 64 KiB slice; also the commit granule.
pub const SLICE_SIZE: usize = 1 << SLICE_SHIFT;
pub const SEGMENT_SHIFT: usize = 25;
/// 32 MiB segment.
pub const SEGMENT_SIZE: usize = 1 << SEGMENT_SHIFT;
pub const SEGMENT_ALIGN: usize = SEGMENT_SIZE;
pub const SLICES_PER_SEGMENT: usize = SEGMENT_SIZE / SLICE_SIZE;

/// Slices per medium page.
pub const MEDIUM_PAGE_SLICES: usize = 8;

/// Largest block served from a one-slice page.
pub const SMALL_OBJ_SIZE_MAX: usize = SLICE_SIZE / 4;
/// Largest block served from a medium page.
pub const MEDIUM_OBJ_SIZE_MAX: usize = MEDIUM_PAGE_SLICES * SLICE_SIZE / 4;
/// Largest block served from a shared segment; beyond this every object
/// gets a dedicated segment.
pub const LARGE_OBJ_SIZE_MAX: usize = SEGMENT_SIZE / 8;

/// Largest alignment satisfied inside ordinary pages; beyond this the
/// dedicated-segment path handles alignment.
pub const ALIGNMENT_MAX: usize = SLICE_SIZE;
/// Hard upper bound on supported block alignment.
pub const BLOCK_ALIGNMENT_MAX: usize = SEGMENT_SIZE / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Shared segment carved into small/medium/large pages.
    Normal,
    /// Dedicated segment sized for a single huge object.
    Huge,
}

/// Span-queue bin for a slice count: exact up to 8, then pseudo-log.
pub(crate) const fn slice_bin(slices: usize) -> usize {
    if slices <= 8 {
        slices
    } else {
        let w = slices - 1;
        let b = (usize::BITS - 1 - w.leading_zeros()) as usize;
        ((b << 2) | ((w >> (b - 2)) & 3)) - 3
    }
}

pub(crate) const SPAN_QUEUE_COUNT: usize = slice_bin(SLICES_PER_SEGMENT) + 1;

/// Queue index for a span, clamping counts beyond a whole segment (huge
/// spans) into the top bin.
#[inline]
fn span_bin(slices: usize) -> usize {
    slice_bin(slices.min(SLICES_PER_SEGMENT))
}

/// Free spans of one bin, linked through the span-head page entries.
#[derive(Debug)]
pub(crate) struct SpanQueue {
    first: Cell<*mut Page>,
    last: Cell<*mut Page>,
}

impl SpanQueue {
    const fn new() -> Self {
        Self {
            first: Cell::new(ptr::null_mut()),
            last: Cell::new(ptr::null_mut()),
        }
    }

    unsafe fn push_front(&self, span: NonNull<Page>) {
        let span_ref = unsafe { span.as_ref() };
        span_ref.prev.set(ptr::null_mut());
        span_ref.next.set(self.first.get());
        if let Some(old) = unsafe { self.first.get().as_ref() } {
            old.prev.set(span.as_ptr());
        } else {
            self.last.set(span.as_ptr());
        }
        self.first.set(span.as_ptr());
    }

    unsafe fn remove(&self, span: NonNull<Page>) {
        let span_ref = unsafe { span.as_ref() };
        let prev = span_ref.prev.get();
        let next = span_ref.next.get();
        if let Some(prev) = unsafe { prev.as_ref() } {
            prev.next.set(next);
        } else {
            self.first.set(next);
        }
        if let Some(next) = unsafe { next.as_ref() } {
            next.prev.set(prev);
        } else {
            self.last.set(prev);
        }
        span_ref.prev.set(ptr::null_mut());
        span_ref.next.set(ptr::null_mut());
    }
}

/// Per-thread segment state.
#[derive(Debug)]
pub(crate) struct SegmentsTld {
    spans: [SpanQueue; SPAN_QUEUE_COUNT],
    /// All segments owned by this thread.
    first_segment: Cell<*mut Segment>,
    pub count: Cell<usize>,
    /// Total segments ever allocated by this thread (eager-commit delay).
    pub total_count: Cell<usize>,
    pub reclaim_count: Cell<usize>,
}

impl SegmentsTld {
    pub(crate) const fn new() -> Self {
        Self {
            spans: [const { SpanQueue::new() }; SPAN_QUEUE_COUNT],
            first_segment: Cell::new(ptr::null_mut()),
            count: Cell::new(0),
            total_count: Cell::new(0),
            reclaim_count: Cell::new(0),
        }
    }

    fn list_push(&self, seg: NonNull<Segment>) {
        let seg_ref = unsafe { seg.as_ref() };
        seg_ref.prev.set(ptr::null_mut());
        seg_ref.next.set(self.first_segment.get());
        if let Some(old) = unsafe { self.first_segment.get().as_ref() } {
            old.prev.set(seg.as_ptr());
        }
        self.first_segment.set(seg.as_ptr());
        self.count.set(self.count.get() + 1);
    }

    fn list_remove(&self, seg: NonNull<Segment>) {
        let seg_ref = unsafe { seg.as_ref() };
        let prev = seg_ref.prev.get();
        let next = seg_ref.next.get();
        if let Some(prev) = unsafe { prev.as_ref() } {
            prev.next.set(next);
        } else {
            self.first_segment.set(next);
        }
        if let Some(next) = unsafe { next.as_ref() } {
            next.prev.set(prev);
        }
        seg_ref.prev.set(ptr::null_mut());
        seg_ref.next.set(ptr::null_mut());
        self.count.set(self.count.get() - 1);
    }

    /// Runs expired purges on every owned segment.
    pub(crate) fn purge_expired(&self, force: bool) {
        let mut cursor = self.first_segment.get();
        while let Some(seg) = NonNull::new(cursor) {
            cursor = unsafe { seg.as_ref() }.next.get();
            unsafe { Segment::try_purge(seg, force) };
        }
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct Segment {
    /// `address ^ process cookie key`; validated on every pointer lookup.
    pub cookie: usize,
    memid: MemId,
    kind: SegmentKind,
    /// Total reserved bytes (> `SEGMENT_SIZE` only for huge segments).
    pub segment_size: usize,
    /// Slices covered by the payload-describing span(s), including info.
    segment_slices: usize,
    /// Entries in the metadata array (`segment_slices` capped).
    slice_entries: usize,
    /// Leading slices holding this header and the entry array.
    info_slices: usize,
    allow_decommit: bool,
    allow_purge: bool,

    /// Owning thread, or 0 when abandoned.
    pub thread_id: AtomicUsize,
    /// Pages in use.
    pub used: Cell<usize>,
    /// Pages whose owning thread has gone (`abandoned <= used`).
    pub abandoned: Cell<usize>,
    abandoned_visits: Cell<usize>,
    was_reclaimed: Cell<bool>,

    commit_mask: CommitMask,
    purge_mask: CommitMask,
    purge_expire: Cell<u64>,

    /// Link for the global abandoned stack.
    pub abandoned_next: AtomicPtr<Segment>,
    /// Links for the owning thread's segment list.
    prev: Cell<*mut Segment>,
    next: Cell<*mut Segment>,
}

// SAFETY: shared fields (`thread_id`, `abandoned_next`) are atomic; the
// rest is owned by one thread at a time, with handoff through the
// abandoned stack's acquire/release pairs.
unsafe impl Sync for Segment {}

#[inline]
const fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

fn segment_cookie(addr: usize) -> usize {
    addr ^ context().cookie_key()
}

impl Segment {
    /// The segment whose header region contains `addr`.
    #[inline]
    pub(crate) unsafe fn of_addr(addr: usize) -> NonNull<Segment> {
        // SAFETY: caller guarantees addr lies within a live segment.
        unsafe { NonNull::new_unchecked(align_down(addr, SEGMENT_ALIGN) as *mut Segment) }
    }

    /// The segment containing a block pointer. Aligns one byte back so a
    /// block sitting exactly at a segment-alignment boundary inside a
    /// huge segment still resolves to its own segment.
    #[inline]
    pub(crate) unsafe fn of_block(ptr_addr: usize) -> NonNull<Segment> {
        // SAFETY: as above.
        unsafe { Segment::of_addr(ptr_addr - 1) }
    }

    /// Cookie-validated lookup; `None` when the word does not match (a
    /// forged or foreign pointer).
    pub(crate) unsafe fn quiet_of_block(ptr_addr: usize) -> Option<NonNull<Segment>> {
        if ptr_addr < SEGMENT_SIZE || ptr_addr % WORD_SIZE != 0 {
            return None;
        }
        let seg = unsafe { Segment::of_block(ptr_addr) };
        if unsafe { seg.as_ref() }.cookie != segment_cookie(seg.as_ptr() as usize) {
            return None;
        }
        Some(seg)
    }

    /// Like [`Self::quiet_of_block`] but reports foreign pointers through
    /// the error hook.
    pub(crate) unsafe fn checked_of_block(ptr_addr: usize) -> Option<NonNull<Segment>> {
        let seg = unsafe { Segment::quiet_of_block(ptr_addr) };
        if seg.is_none() {
            error::report(Error::InvalidPointer { addr: ptr_addr });
        }
        seg
    }

    #[inline]
    fn base(&self) -> usize {
        ptr::from_ref(self) as usize
    }

    /// Upper bound for slice walks: huge segments may cover fewer (or
    /// more) slices than the entry array has room for.
    #[inline]
    fn walk_end(&self) -> usize {
        self.slice_entries.min(self.segment_slices)
    }

    #[inline]
    pub(crate) fn is_local(&self) -> bool {
        self.thread_id.load(Ordering::Relaxed) == thread_id()
    }

    #[inline]
    pub(crate) const fn is_huge(&self) -> bool {
        matches!(self.kind, SegmentKind::Huge)
    }

    /// Entry `idx` of the slice metadata array (right after the struct).
    #[inline]
    pub(crate) unsafe fn slice(seg: NonNull<Segment>, idx: usize) -> NonNull<Page> {
        debug_assert!(idx < unsafe { seg.as_ref() }.slice_entries);
        // SAFETY: the entry array is part of the committed header.
        unsafe { NonNull::new_unchecked(seg.as_ptr().add(1).cast::<Page>().add(idx)) }
    }

    /// Index of a metadata entry within its segment.
    #[inline]
    pub(crate) unsafe fn slice_index(seg: NonNull<Segment>, page: NonNull<Page>) -> usize {
        let first = unsafe { seg.as_ptr().add(1).cast::<Page>() };
        let idx = unsafe { page.as_ptr().offset_from(first) };
        debug_assert!(idx >= 0 && (idx as usize) < unsafe { seg.as_ref() }.slice_entries);
        idx as usize
    }

    /// Like [`Self::page_of`], but validates that the pointer resolves to
    /// a live page. Used on the public free/query paths where the input
    /// may be stale or forged.
    pub(crate) unsafe fn checked_page_of(
        seg: NonNull<Segment>,
        ptr_addr: usize,
    ) -> Option<NonNull<Page>> {
        let this = unsafe { seg.as_ref() };
        if ptr_addr >= this.base() + this.segment_size {
            return None;
        }
        if this.is_huge() {
            let page = unsafe { Segment::slice(seg, this.info_slices) };
            return (unsafe { page.as_ref() }.xblock_size.get() != 0).then_some(page);
        }
        let idx = (ptr_addr - this.base()) >> SLICE_SHIFT;
        if idx < this.info_slices || idx >= this.slice_entries {
            return None;
        }
        let entry = unsafe { Segment::slice(seg, idx) };
        let offset = unsafe { entry.as_ref() }.slice_offset.get() as usize;
        if offset > idx - this.info_slices {
            return None;
        }
        let head = unsafe { Segment::slice(seg, idx - offset) };
        let head_ref = unsafe { head.as_ref() };
        if head_ref.xblock_size.get() == 0 || offset >= head_ref.slice_count.get() as usize {
            return None; // free span or stale interior offset
        }
        Some(head)
    }

    /// Metadata entry for an interior payload pointer.
    #[inline]
    pub(crate) unsafe fn page_of(seg: NonNull<Segment>, ptr_addr: usize) -> NonNull<Page> {
        let this = unsafe { seg.as_ref() };
        if this.is_huge() {
            // One span, starting right after the info slices.
            return unsafe { Segment::slice(seg, this.info_slices) };
        }
        let diff = ptr_addr - this.base();
        let idx = diff >> SLICE_SHIFT;
        debug_assert!(idx >= this.info_slices && idx < this.slice_entries);
        let entry = unsafe { Segment::slice(seg, idx) };
        let offset = unsafe { entry.as_ref() }.slice_offset.get() as usize;
        // Interior entries carry the exact distance back to the span head.
        unsafe { Segment::slice(seg, idx - offset) }
    }

    /// Byte range of a page's block storage.
    #[inline]
    pub(crate) unsafe fn page_area(seg: NonNull<Segment>, page: NonNull<Page>) -> PageArea {
        let this = unsafe { seg.as_ref() };
        let idx = unsafe { Segment::slice_index(seg, page) };
        let start = this.base() + idx * SLICE_SIZE;
        let size = if this.is_huge() {
            this.segment_size - idx * SLICE_SIZE
        } else {
            unsafe { page.as_ref() }.slice_count.get() as usize * SLICE_SIZE
        };
        PageArea { start, size }
    }

    // ------------------------------------------------------------------
    // Commit and purge
    // ------------------------------------------------------------------

    /// Commits the granules backing `[idx, idx + count)` if needed.
    /// Always clears overlapping purge bits so no pending purge can take
    /// back freshly committed memory.
    unsafe fn ensure_committed(seg: NonNull<Segment>, idx: usize, count: usize) -> bool {
        let this = unsafe { seg.as_ref() };
        this.purge_mask.clear_range(idx, count);
        if this.commit_mask.all_set(idx, count) {
            return true;
        }
        let start = this.base() + idx * SLICE_SIZE;
        let len = count * SLICE_SIZE;
        // SAFETY: range lies inside this segment's reservation.
        let ok = unsafe {
            sys_alloc::commit(NonNull::new_unchecked(start as *mut u8), len).is_ok()
        };
        if !ok {
            return false;
        }
        let fresh = count - this.commit_mask.count_in_range(idx, count);
        stats::global().committed(fresh * SLICE_SIZE);
        this.commit_mask.set_range(idx, count);
        true
    }

    /// Schedules `[idx, idx + count)` for purge, or purges immediately
    /// when the configured delay is zero.
    unsafe fn schedule_purge(seg: NonNull<Segment>, idx: usize, count: usize) {
        let this = unsafe { seg.as_ref() };
        debug_assert!(idx >= this.info_slices);
        // The masks cover one segment's worth of granules; the tail of an
        // oversized huge span is released with the segment itself.
        let count = count.min(SLICES_PER_SEGMENT.saturating_sub(idx));
        if !this.allow_purge || count == 0 {
            return;
        }
        let delay = crate::options::options().purge_delay_ms();
        if delay < 0 {
            return;
        }
        if delay == 0 {
            unsafe { Segment::purge_range(seg, idx, count) };
        } else {
            this.purge_mask.set_range(idx, count);
            if this.purge_expire.get() == 0 {
                this.purge_expire
                    .set(sys_alloc::clock_now_ms() + delay as u64);
            }
        }
    }

    /// Executes pending purges once the expiry elapsed (or on `force`).
    pub(crate) unsafe fn try_purge(seg: NonNull<Segment>, force: bool) {
        let this = unsafe { seg.as_ref() };
        if this.purge_mask.is_empty() {
            return;
        }
        let expire = this.purge_expire.get();
        if !force && (expire == 0 || sys_alloc::clock_now_ms() < expire) {
            return;
        }
        this.purge_expire.set(0);
        let mut idx = 0;
        while let Some((start, len)) = this.purge_mask.next_run(idx) {
            unsafe { Segment::purge_range(seg, start, len) };
            idx = start + len;
        }
    }

    /// Decommits (or resets) one scheduled run and clears its bits.
    unsafe fn purge_range(seg: NonNull<Segment>, idx: usize, count: usize) {
        let this = unsafe { seg.as_ref() };
        this.purge_mask.clear_range(idx, count);
        if !this.commit_mask.any_set(idx, count) {
            return;
        }
        let start = this.base() + idx * SLICE_SIZE;
        let len = count * SLICE_SIZE;
        let ptr = unsafe { NonNull::new_unchecked(start as *mut u8) };
        let decommit = crate::options::options().purge_decommits();
        trace::segment_purge(this.base(), count, decommit);
        // SAFETY: the span is unused; no live data resides in the range.
        unsafe {
            if decommit {
                if sys_alloc::decommit(ptr, len).is_ok() {
                    let present = this.commit_mask.count_in_range(idx, count);
                    stats::global().decommitted(present * SLICE_SIZE);
                    this.commit_mask.clear_range(idx, count);
                }
            } else if sys_alloc::reset(ptr, len).is_ok() {
                stats::global().decommitted(0);
            }
        }
    }

    // ------------------------------------------------------------------
    // Span management
    // ------------------------------------------------------------------

    /// Marks `[idx, idx + count)` as one free span and queues it.
    unsafe fn span_free(seg: NonNull<Segment>, idx: usize, count: usize, tld: &Tld) {
        debug_assert!(count >= 1);
        let head = unsafe { Segment::slice(seg, idx) };
        let head_ref = unsafe { head.as_ref() };
        head_ref.slice_count.set(count as u32);
        head_ref.slice_offset.set(0);
        head_ref.xblock_size.set(0);
        // The last entry lets the next span's free find our head for
        // backward coalescing. Huge spans may extend past the entry
        // array; their trailing slices are never indexed.
        let last_idx = (idx + count - 1).min(unsafe { seg.as_ref() }.slice_entries - 1);
        if last_idx > idx {
            let last = unsafe { Segment::slice(seg, last_idx) };
            let last_ref = unsafe { last.as_ref() };
            last_ref.slice_count.set(0);
            last_ref.slice_offset.set((last_idx - idx) as u32);
            last_ref.xblock_size.set(0);
        }
        unsafe { tld.segments.spans[span_bin(count)].push_front(head) };
    }

    unsafe fn span_remove_from_queue(span: NonNull<Page>, tld: &Tld) {
        let count = unsafe { span.as_ref() }.slice_count.get() as usize;
        unsafe { tld.segments.spans[span_bin(count)].remove(span) };
    }

    /// Returns a page's span to the free pool, merging with free
    /// neighbors, scheduling the merged range for purge, and queueing the
    /// result.
    unsafe fn span_free_coalesce(seg: NonNull<Segment>, page: NonNull<Page>, tld: &Tld) {
        let this = unsafe { seg.as_ref() };
        let mut idx = unsafe { Segment::slice_index(seg, page) };
        let mut count = unsafe { page.as_ref() }.slice_count.get() as usize;
        debug_assert!(count >= 1);

        let purge_idx = idx;
        let purge_count = count;

        // Merge with the following span.
        let next_idx = idx + count;
        if next_idx < this.slice_entries {
            let next = unsafe { Segment::slice(seg, next_idx) };
            let next_ref = unsafe { next.as_ref() };
            if next_ref.xblock_size.get() == 0 && next_ref.slice_count.get() > 0 {
                count += next_ref.slice_count.get() as usize;
                unsafe { Segment::span_remove_from_queue(next, tld) };
            }
        }

        // Merge with the preceding span.
        if idx > this.info_slices {
            let before = unsafe { Segment::slice(seg, idx - 1) };
            let before_ref = unsafe { before.as_ref() };
            let head_idx = if before_ref.slice_count.get() == 0 {
                idx - 1 - before_ref.slice_offset.get() as usize
            } else {
                idx - 1
            };
            let head = unsafe { Segment::slice(seg, head_idx) };
            let head_ref = unsafe { head.as_ref() };
            if head_ref.xblock_size.get() == 0 {
                count += head_ref.slice_count.get() as usize;
                unsafe { Segment::span_remove_from_queue(head, tld) };
                idx = head_idx;
            }
        }

        unsafe {
            Segment::span_free(seg, idx, count, tld);
            // Only the span that was actually in use needs purging; merged
            // neighbors were already scheduled when they were freed.
            Segment::schedule_purge(seg, purge_idx, purge_count);
        }
    }

    /// Claims `[idx, idx + count)` as a page span: commits the payload and
    /// writes head and interior entries. The caller finishes with
    /// `Page::init`.
    unsafe fn span_allocate(
        seg: NonNull<Segment>,
        idx: usize,
        count: usize,
        tld: &Tld,
    ) -> Option<NonNull<Page>> {
        let this = unsafe { seg.as_ref() };
        // Huge payloads can exceed the entry array; their interior is
        // never indexed, so committing by byte range is what matters.
        let commit_slices = count.min(this.slice_entries - idx);
        if !unsafe { Segment::ensure_committed(seg, idx, commit_slices) } {
            return None;
        }
        if this.is_huge() && this.segment_slices > this.slice_entries && this.allow_decommit {
            // Tail beyond the mask's coverage (only possible for lazily
            // committed huge reservations).
            let start = this.base() + this.slice_entries * SLICE_SIZE;
            let len = (this.segment_slices - this.slice_entries) * SLICE_SIZE;
            // SAFETY: tail of this segment's own reservation.
            let ok = unsafe {
                sys_alloc::commit(NonNull::new_unchecked(start as *mut u8), len).is_ok()
            };
            if !ok {
                return None;
            }
            stats::global().committed(len);
        }

        let head = unsafe { Segment::slice(seg, idx) };
        let head_ref = unsafe { head.as_ref() };
        head_ref.slice_count.set(count as u32);
        head_ref.slice_offset.set(0);
        head_ref.xblock_size.set(1); // provisional; Page::init sets the real size
        for i in 1..commit_slices {
            let entry = unsafe { Segment::slice(seg, idx + i) };
            let entry_ref = unsafe { entry.as_ref() };
            entry_ref.slice_count.set(0);
            entry_ref.slice_offset.set(i as u32);
            entry_ref.xblock_size.set(1);
        }
        this.used.set(this.used.get() + 1);
        let _ = tld;
        Some(head)
    }

    /// Searches the thread's span queues for a best-fit free span,
    /// splitting off any excess.
    unsafe fn span_try_find(needed: usize, tld: &Tld) -> Option<NonNull<Page>> {
        for bin_idx in slice_bin(needed)..SPAN_QUEUE_COUNT {
            let queue = &tld.segments.spans[bin_idx];
            let mut cursor = queue.first.get();
            while let Some(span) = NonNull::new(cursor) {
                let span_ref = unsafe { span.as_ref() };
                cursor = span_ref.next.get();
                let have = span_ref.slice_count.get() as usize;
                if have < needed {
                    continue;
                }
                let seg = unsafe { Page::segment(span) };
                let idx = unsafe { Segment::slice_index(seg, span) };
                unsafe {
                    queue.remove(span);
                    if have > needed {
                        Segment::span_free(seg, idx + needed, have - needed, tld);
                    }
                    match Segment::span_allocate(seg, idx, needed, tld) {
                        Some(page) => return Some(page),
                        None => {
                            // Commit failed; requeue the span and give up.
                            Segment::span_free(seg, idx, needed, tld);
                            return None;
                        }
                    }
                }
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Segment lifecycle
    // ------------------------------------------------------------------

    /// Header bytes needed for `entries` metadata entries.
    fn info_size(entries: usize) -> usize {
        std::mem::size_of::<Segment>() + entries * std::mem::size_of::<Page>()
    }

    /// Reserves and initializes a fresh segment. `required` is non-zero
    /// only for huge segments and already includes alignment slack.
    unsafe fn alloc(
        required: usize,
        heap: &Heap,
        tld: &Tld,
    ) -> Option<NonNull<Segment>> {
        let kind = if required == 0 {
            SegmentKind::Normal
        } else {
            SegmentKind::Huge
        };
        let (segment_size, slice_entries) = if required == 0 {
            (SEGMENT_SIZE, SLICES_PER_SEGMENT)
        } else {
            let payload_start = Self::info_size(SLICES_PER_SEGMENT).next_multiple_of(SLICE_SIZE);
            let size = (payload_start + required).next_multiple_of(SLICE_SIZE);
            (size, SLICES_PER_SEGMENT)
        };
        let info_slices = Self::info_size(slice_entries).div_ceil(SLICE_SIZE);
        let segment_slices = segment_size / SLICE_SIZE;

        let options = crate::options::options();
        let eager_commit = kind == SegmentKind::Huge
            || sys_alloc::has_overcommit()
            || tld.segments.total_count.get() >= options.eager_commit_delay();

        // Prefer arena memory, fall back to a direct OS reservation.
        let (base, memid, committed) = unsafe {
            arena::alloc_aligned(segment_size, SEGMENT_ALIGN, eager_commit, heap.arena_id)
        }?;

        // The header must be writable before anything else.
        if !committed {
            // SAFETY: prefix of our own fresh reservation.
            let ok = unsafe {
                sys_alloc::commit(base, info_slices * SLICE_SIZE).is_ok()
            };
            if !ok {
                unsafe { arena::free(memid, base, segment_size, 0) };
                return None;
            }
        }

        let addr = base.as_ptr() as usize;
        let seg_ptr = base.as_ptr().cast::<Segment>();
        // SAFETY: committed, exclusively owned, properly aligned.
        unsafe {
            ptr::write(
                seg_ptr,
                Segment {
                    cookie: segment_cookie(addr),
                    memid,
                    kind,
                    segment_size,
                    segment_slices,
                    slice_entries,
                    info_slices,
                    allow_decommit: !committed,
                    allow_purge: !committed && options.purge_delay_ms() >= 0,
                    thread_id: AtomicUsize::new(thread_id()),
                    used: Cell::new(0),
                    abandoned: Cell::new(0),
                    abandoned_visits: Cell::new(0),
                    was_reclaimed: Cell::new(false),
                    commit_mask: CommitMask::new(),
                    purge_mask: CommitMask::new(),
                    purge_expire: Cell::new(0),
                    abandoned_next: AtomicPtr::new(ptr::null_mut()),
                    prev: Cell::new(ptr::null_mut()),
                    next: Cell::new(ptr::null_mut()),
                },
            );
            // Zero the entry array: commit() hands back zero pages on the
            // first touch, but arena memory may be recycled.
            ptr::write_bytes(
                seg_ptr.add(1).cast::<u8>(),
                0,
                slice_entries * std::mem::size_of::<Page>(),
            );
        }
        let seg = unsafe { NonNull::new_unchecked(seg_ptr) };
        let this = unsafe { seg.as_ref() };
        if committed {
            this.commit_mask.set_range(0, this.walk_end());
        } else {
            this.commit_mask.set_range(0, info_slices);
        }

        tld.segments.list_push(seg);
        tld.segments
            .total_count
            .set(tld.segments.total_count.get() + 1);
        stats::global().segment_created();
        if committed {
            stats::global().committed(segment_size);
        } else {
            stats::global().committed(info_slices * SLICE_SIZE);
        }
        trace::segment_alloc(addr, segment_size, kind == SegmentKind::Huge);

        if kind == SegmentKind::Normal {
            // Hand the whole payload to the span queues.
            unsafe {
                Segment::span_free(
                    seg,
                    info_slices,
                    SLICES_PER_SEGMENT - info_slices,
                    tld,
                )
            };
        }
        Some(seg)
    }

    /// Releases a segment to its arena or the OS.
    unsafe fn free(seg: NonNull<Segment>, tld: &Tld) {
        let this = unsafe { seg.as_ref() };
        debug_assert_eq!(this.used.get(), 0);

        // Unlink our free spans.
        let mut idx = this.info_slices;
        while idx < this.walk_end() {
            let head = unsafe { Segment::slice(seg, idx) };
            let head_ref = unsafe { head.as_ref() };
            let count = (head_ref.slice_count.get() as usize).max(1);
            if head_ref.xblock_size.get() == 0 && head_ref.slice_count.get() > 0 {
                unsafe { Segment::span_remove_from_queue(head, tld) };
            }
            idx += count;
        }

        tld.segments.list_remove(seg);
        stats::global().segment_released();
        let mut committed = this.commit_mask.count_set() * SLICE_SIZE;
        if this.segment_slices > this.slice_entries {
            committed += (this.segment_slices - this.slice_entries) * SLICE_SIZE;
        }
        stats::global().decommitted(committed);
        trace::segment_free(this.base(), this.segment_size);

        // A concurrent reclaimer may still be reading this header if the
        // segment just left the abandoned list; wait for those readers
        // before the memory disappears.
        context().abandoned.await_readers();

        // SAFETY: no pages remain; the reservation is entirely ours.
        unsafe {
            arena::free(
                this.memid,
                NonNull::new_unchecked(this.base() as *mut u8),
                this.segment_size,
                committed,
            );
        }
    }

    // ------------------------------------------------------------------
    // Abandonment and reclamation
    // ------------------------------------------------------------------

    /// Detaches a fully abandoned segment from this thread and publishes
    /// it on the global abandoned stack.
    unsafe fn abandon(seg: NonNull<Segment>, tld: &Tld) {
        let this = unsafe { seg.as_ref() };
        debug_assert!(this.used.get() > 0 && this.used.get() == this.abandoned.get());

        // Free spans leave our queues; a future reclaimer re-adds them.
        let mut idx = this.info_slices;
        while idx < this.walk_end() {
            let head = unsafe { Segment::slice(seg, idx) };
            let head_ref = unsafe { head.as_ref() };
            let count = (head_ref.slice_count.get() as usize).max(1);
            if head_ref.xblock_size.get() == 0 && head_ref.slice_count.get() > 0 {
                unsafe { Segment::span_remove_from_queue(head, tld) };
            }
            idx += count;
        }

        if crate::options::options().abandoned_page_purge() {
            unsafe { Segment::try_purge(seg, true) };
        }

        tld.segments.list_remove(seg);
        if this.was_reclaimed.get() {
            this.was_reclaimed.set(false);
            tld.segments
                .reclaim_count
                .set(tld.segments.reclaim_count.get() - 1);
        }
        this.abandoned_visits.set(0);
        stats::global().segment_abandoned();
        trace::segment_abandon(this.base(), this.used.get());

        this.thread_id.store(0, Ordering::Release);
        context().abandoned.push(seg);
    }

    /// Collects pending frees and reports whether this segment is worth
    /// reclaiming for `needed` slices of `block_size` blocks.
    unsafe fn check_free(
        seg: NonNull<Segment>,
        needed: usize,
        block_size: usize,
    ) -> (bool, bool) {
        let this = unsafe { seg.as_ref() };
        let mut has_space = false;
        let mut used_pages = 0;
        let mut empty_pages = 0;
        let mut idx = this.info_slices;
        while idx < this.walk_end() {
            let head = unsafe { Segment::slice(seg, idx) };
            let head_ref = unsafe { head.as_ref() };
            let count = (head_ref.slice_count.get() as usize).max(1);
            if head_ref.xblock_size.get() == 0 {
                if head_ref.slice_count.get() as usize >= needed {
                    has_space = true;
                }
            } else {
                used_pages += 1;
                unsafe { Page::collect_free(head, false) };
                if head_ref.all_free() {
                    empty_pages += 1;
                    has_space = true;
                } else if head_ref.block_size() == block_size && head_ref.any_available() {
                    has_space = true;
                }
            }
            idx += count;
        }
        debug_assert_eq!(used_pages, this.used.get());
        (has_space, used_pages == empty_pages)
    }

    /// Re-attaches an abandoned segment to `heap`'s thread. Returns the
    /// segment (or `None` if it turned out empty and was freed) and
    /// whether a page of `requested_block_size` with available blocks was
    /// put into the heap's queues.
    unsafe fn reclaim(
        seg: NonNull<Segment>,
        heap: &Heap,
        requested_block_size: usize,
        tld: &Tld,
    ) -> (Option<NonNull<Segment>>, bool) {
        let this = unsafe { seg.as_ref() };
        debug_assert_eq!(this.thread_id.load(Ordering::Relaxed), 0);
        this.thread_id.store(thread_id(), Ordering::Release);
        this.abandoned_visits.set(0);
        this.was_reclaimed.set(true);
        tld.segments.list_push(seg);
        tld.segments
            .reclaim_count
            .set(tld.segments.reclaim_count.get() + 1);
        stats::global().segment_reclaimed();

        let mut right_page = false;
        let mut reclaimed_pages = 0;
        // Pages found empty are folded into the span pool only after the
        // walk, once every free span is registered in our queues and
        // coalescing can see them all.
        let mut empties = [0u16; SLICES_PER_SEGMENT];
        let mut empty_count = 0;

        let mut idx = this.info_slices;
        while idx < this.walk_end() {
            let head = unsafe { Segment::slice(seg, idx) };
            let head_ref = unsafe { head.as_ref() };
            let count = (head_ref.slice_count.get() as usize).max(1);
            if head_ref.xblock_size.get() == 0 {
                unsafe { Segment::span_free(seg, idx, count, tld) };
            } else {
                debug_assert_eq!(head_ref.delayed(), Delayed::NeverDelayedFree);
                this.abandoned.set(this.abandoned.get() - 1);
                head_ref.set_heap(ptr::from_ref(heap).cast_mut());
                unsafe {
                    Page::set_delayed(head, Delayed::UseDelayedFree, true);
                    Page::collect_free(head, false);
                }
                if head_ref.all_free() {
                    empties[empty_count] = idx as u16;
                    empty_count += 1;
                } else {
                    let bin_idx = if head_ref.is_huge() {
                        BIN_HUGE
                    } else {
                        bin(head_ref.block_size())
                    };
                    unsafe { heap.queue_push_front(bin_idx, head) };
                    reclaimed_pages += 1;
                    if head_ref.block_size() == requested_block_size && head_ref.any_available() {
                        right_page = true;
                    }
                }
            }
            idx += count;
        }
        debug_assert_eq!(this.abandoned.get(), 0);

        for &idx in &empties[..empty_count] {
            let page = unsafe { Segment::slice(seg, idx as usize) };
            unsafe { Page::set_delayed(page, Delayed::NeverDelayedFree, false) };
            unsafe { page.as_ref() }.set_heap(ptr::null_mut());
            this.used.set(this.used.get() - 1);
            unsafe { Segment::span_free_coalesce(seg, page, tld) };
        }

        trace::segment_reclaim(this.base(), reclaimed_pages);
        if this.used.get() == 0 {
            unsafe { Segment::free(seg, tld) };
            (None, false)
        } else {
            (Some(seg), right_page)
        }
    }

    /// Tries to satisfy a span request by reclaiming abandoned segments.
    unsafe fn try_reclaim(
        heap: &Heap,
        needed: usize,
        block_size: usize,
        tld: &Tld,
    ) -> ReclaimResult {
        let stack = &context().abandoned;
        let mut tries = crate::options::options().max_reclaim_tries();
        while tries > 0 {
            let Some(seg) = stack.try_pop() else { break };
            tries -= 1;
            let this = unsafe { seg.as_ref() };
            this.abandoned_visits.set(this.abandoned_visits.get() + 1);
            let (has_space, all_free) = unsafe { Segment::check_free(seg, needed, block_size) };
            if all_free {
                // Freeing it may release memory other threads can use;
                // keep looking for a reusable one.
                unsafe { Segment::reclaim(seg, heap, 0, tld) };
            } else if has_space {
                let (segment, right_page) =
                    unsafe { Segment::reclaim(seg, heap, block_size, tld) };
                if right_page {
                    return ReclaimResult::IntoQueue;
                }
                if let Some(segment) = segment {
                    return ReclaimResult::Segment(segment);
                }
            } else if this.abandoned_visits.get() >= 3 {
                // Cap the list length: adopt it even though it has no
                // space for this request.
                unsafe { Segment::reclaim(seg, heap, 0, tld) };
            } else {
                stack.push_visited(seg);
            }
        }
        ReclaimResult::None
    }
}

enum ReclaimResult {
    None,
    /// A segment with free spans joined this thread.
    Segment(NonNull<Segment>),
    /// A ready page of the right size landed directly in the heap queues.
    IntoQueue,
}

/// Slice count for a page serving `block_size` blocks.
fn slices_needed(block_size: usize) -> usize {
    if block_size <= SMALL_OBJ_SIZE_MAX {
        1
    } else if block_size <= MEDIUM_OBJ_SIZE_MAX {
        MEDIUM_PAGE_SLICES
    } else {
        block_size.div_ceil(SLICE_SIZE)
    }
}

/// Allocates a page for `block_size` blocks, preferring the thread's free
/// spans, then abandoned-segment reclamation, then a fresh segment.
///
/// Huge requests (or alignment beyond [`ALIGNMENT_MAX`]) get a dedicated
/// segment sized to fit.
pub(crate) unsafe fn page_alloc(
    heap: &Heap,
    block_size: usize,
    page_alignment: usize,
    tld: &Tld,
) -> Option<NonNull<Page>> {
    tld.segments.purge_expired(false);

    if page_alignment > ALIGNMENT_MAX || block_size > LARGE_OBJ_SIZE_MAX {
        return unsafe { huge_page_alloc(heap, block_size, page_alignment, tld) };
    }

    let needed = slices_needed(block_size);
    if let Some(page) = unsafe { Segment::span_try_find(needed, tld) } {
        return Some(page);
    }

    match unsafe { Segment::try_reclaim(heap, needed, block_size, tld) } {
        ReclaimResult::IntoQueue => return None, // caller rescans its queues
        ReclaimResult::Segment(_) | ReclaimResult::None => {}
    }
    if let Some(page) = unsafe { Segment::span_try_find(needed, tld) } {
        return Some(page);
    }

    unsafe { Segment::alloc(0, heap, tld)? };
    unsafe { Segment::span_try_find(needed, tld) }
}

/// Dedicated-segment path for huge objects and extreme alignments.
unsafe fn huge_page_alloc(
    heap: &Heap,
    block_size: usize,
    page_alignment: usize,
    tld: &Tld,
) -> Option<NonNull<Page>> {
    if page_alignment > BLOCK_ALIGNMENT_MAX {
        error::report(Error::OutOfMemory { size: block_size });
        return None;
    }
    let slack = if page_alignment > ALIGNMENT_MAX {
        page_alignment
    } else {
        0
    };
    let required = block_size.checked_add(slack)?.max(SLICE_SIZE);
    let seg = unsafe { Segment::alloc(required, heap, tld)? };
    let this = unsafe { seg.as_ref() };
    let span_slices = this.segment_slices - this.info_slices;
    let Some(page) = (unsafe { Segment::span_allocate(seg, this.info_slices, span_slices, tld) })
    else {
        unsafe { Segment::free(seg, tld) };
        return None;
    };
    unsafe {
        Page::init(page, heap, HUGE_BLOCK_SIZE as usize);
    }
    Some(page)
}

/// Returns a page's span to the segment, freeing or abandoning the
/// segment when this was its last used page.
pub(crate) unsafe fn page_free(page: NonNull<Page>, force: bool, tld: &Tld) {
    let seg = unsafe { Page::segment(page) };
    let this = unsafe { seg.as_ref() };
    debug_assert!(this.is_local());

    this.used.set(this.used.get() - 1);
    unsafe { Segment::span_free_coalesce(seg, page, tld) };

    if this.used.get() == 0 {
        unsafe { Segment::free(seg, tld) };
    } else if this.used.get() == this.abandoned.get() {
        unsafe { Segment::abandon(seg, tld) };
    } else if !force {
        unsafe { Segment::try_purge(seg, false) };
    }
}

/// Records one abandoned page; pushes the whole segment onto the global
/// abandoned stack once every used page is abandoned.
pub(crate) unsafe fn page_abandon(page: NonNull<Page>, tld: &Tld) {
    let seg = unsafe { Page::segment(page) };
    let this = unsafe { seg.as_ref() };
    debug_assert_eq!(unsafe { page.as_ref() }.delayed(), Delayed::NeverDelayedFree);
    debug_assert!(unsafe { page.as_ref() }.heap_ptr().is_null());

    this.abandoned.set(this.abandoned.get() + 1);
    debug_assert!(this.abandoned.get() <= this.used.get());
    if this.abandoned.get() == this.used.get() {
        unsafe { Segment::abandon(seg, tld) };
    }
}

/// Resets the payload of a huge block freed from a foreign thread so the
/// OS can reclaim the physical pages without the owner running.
pub(crate) unsafe fn huge_page_reset(page: NonNull<Page>, block: NonNull<crate::page::Block>) {
    let seg = unsafe { Page::segment(page) };
    let area = unsafe { Segment::page_area(seg, page) };
    // Keep the leading word: the free-list link lives there once the
    // owner processes the free.
    let start = ((block.as_ptr() as usize).max(area.start) + WORD_SIZE)
        .next_multiple_of(sys_alloc::page_size());
    let end = area.start + area.size;
    if start >= end {
        return;
    }
    // SAFETY: the block is free; nothing reads the payload anymore.
    unsafe {
        let _ = sys_alloc::reset(NonNull::new_unchecked(start as *mut u8), end - start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry() {
        assert_eq!(SLICE_SIZE, 64 * 1024);
        assert_eq!(SEGMENT_SIZE, 32 * 1024 * 1024);
        assert_eq!(SLICES_PER_SEGMENT, 512);
        assert!(SMALL_OBJ_SIZE_MAX < MEDIUM_OBJ_SIZE_MAX);
        assert!(MEDIUM_OBJ_SIZE_MAX < LARGE_OBJ_SIZE_MAX);
        assert!(LARGE_OBJ_SIZE_MAX <= SEGMENT_SIZE / 8);
    }

    #[test]
    fn test_slice_bin_monotonic_and_bounded() {
        let mut prev = 0;
        for n in 1..=SLICES_PER_SEGMENT {
            let b = slice_bin(n);
            assert!(b >= prev);
            assert!(b < SPAN_QUEUE_COUNT);
            prev = b;
        }
        assert_eq!(slice_bin(1), 1);
        assert_eq!(slice_bin(8), 8);
    }

    #[test]
    fn test_slices_needed_thresholds() {
        assert_eq!(slices_needed(64), 1);
        assert_eq!(slices_needed(SMALL_OBJ_SIZE_MAX), 1);
        assert_eq!(slices_needed(SMALL_OBJ_SIZE_MAX + 1), MEDIUM_PAGE_SLICES);
        assert_eq!(slices_needed(MEDIUM_OBJ_SIZE_MAX), MEDIUM_PAGE_SLICES);
        let large = MEDIUM_OBJ_SIZE_MAX + 1;
        assert_eq!(slices_needed(large), large.div_ceil(SLICE_SIZE));
    }

    #[test]
    fn test_header_fits_one_slice_comfortably() {
        // The header (segment struct + 512 entries) must fit well inside
        // the slices reserved for it.
        let info = Segment::info_size(SLICES_PER_SEGMENT);
        assert!(info.div_ceil(SLICE_SIZE) <= 2);
    }
}
