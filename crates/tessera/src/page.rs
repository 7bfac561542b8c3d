//! Pages and blocks.
//!
//! A page is a run of slices holding same-size blocks. It keeps three free
//! lists: `free` feeds allocation directly, `local_free` collects frees by
//! the owning thread and is migrated lazily, and `thread_free` is an
//! atomic list for frees arriving from other threads. The low two bits of
//! the `thread_free` word carry the delayed-free flag, so flag and list
//! head always change together in one atomic operation.
//!
//! Invariant (after a collect): `used + |free| + |local_free| == capacity`,
//! where blocks still sitting in `thread_free` count as used.

use std::cell::Cell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use crossbeam::utils::Backoff;

use crate::encode::{decode, encode};
use crate::error::{self, Error};
use crate::heap::Heap;
use crate::segment::{self, Segment};

/// `xblock_size` value marking a huge page; the real block size is the
/// page area size.
pub const HUGE_BLOCK_SIZE: u32 = u32::MAX;

/// Grow the free list by at most this many bytes per extension.
const MAX_EXTEND_SIZE: usize = 4 * 1024;
const MIN_EXTEND: usize = 4;

/// Number of interleaved sublists used by secure free-list extension.
const SECURE_SLICES: usize = 64;

const FLAG_IN_FULL: u8 = 0x01;
const FLAG_HAS_ALIGNED: u8 = 0x02;

/// A free block: one encoded `next` token. Allocated blocks reuse this
/// memory for caller data.
#[repr(transparent)]
pub struct Block {
    next: Cell<usize>,
}

/// Delayed-free flag, packed into the low two bits of `thread_free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Delayed {
    /// Cross-thread frees must escalate to the owning heap's delayed list.
    UseDelayedFree = 0,
    /// Transient: a freeing thread is mid-escalation and holds the flag.
    DelayedFreeing = 1,
    /// Cross-thread frees push straight onto the page's own list.
    NoDelayedFree = 2,
    /// Sticky: set before destroy/abandon, cleared only by reclaim.
    NeverDelayedFree = 3,
}

impl Delayed {
    #[inline]
    const fn from_bits(bits: usize) -> Self {
        match bits & 0x3 {
            0 => Self::UseDelayedFree,
            1 => Self::DelayedFreeing,
            2 => Self::NoDelayedFree,
            _ => Self::NeverDelayedFree,
        }
    }
}

#[inline]
fn tf_block(tf: usize) -> *mut Block {
    (tf & !0x3) as *mut Block
}

#[inline]
const fn tf_delayed(tf: usize) -> Delayed {
    Delayed::from_bits(tf)
}

#[inline]
fn tf_make(block: *mut Block, delayed: Delayed) -> usize {
    debug_assert_eq!(block as usize & 0x3, 0);
    block as usize | delayed as usize
}

/// Byte window of a page's block area, used for decode bounds checks.
#[derive(Debug, Clone, Copy)]
pub struct PageArea {
    pub start: usize,
    pub size: usize,
}

impl PageArea {
    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.start + self.size
    }
}

/// Page metadata. Lives in the slices array inside the segment header;
/// the first entry of a slice span describes the whole span.
#[repr(C)]
#[derive(Debug)]
pub struct Page {
    // Span bookkeeping, owned by the segment layer. `slice_count` is
    // non-zero only on span heads; interior entries store the entry-count
    // distance back to their head in `slice_offset`.
    pub slice_count: Cell<u32>,
    pub slice_offset: Cell<u32>,

    pub flags: AtomicU8,
    pub retire_expire: Cell<u8>,
    /// Blocks whose free-list links have been threaded (<= reserved).
    pub capacity: Cell<u16>,
    /// Blocks that fit in the page area.
    pub reserved: Cell<u16>,

    pub free: Cell<*mut Block>,
    pub local_free: Cell<*mut Block>,
    /// Blocks in use, including blocks still on `thread_free`.
    pub used: Cell<u32>,
    /// Block size, or [`HUGE_BLOCK_SIZE`] for huge pages.
    pub xblock_size: Cell<u32>,
    /// Free-list encoding keys, drawn from the owning heap on init.
    pub keys: Cell<[usize; 2]>,

    /// Atomic list of cross-thread frees plus the 2-bit delayed flag.
    pub thread_free: AtomicUsize,
    /// Owning heap; null while abandoned.
    pub heap: AtomicPtr<Heap>,

    // Queue linkage: page queues when in use, span queues when free.
    pub prev: Cell<*mut Page>,
    pub next: Cell<*mut Page>,
}

// SAFETY: cross-thread access is confined to `thread_free`, `heap` and
// `flags` (all atomic); every other field is only touched by the owning
// thread, or during reclaim which is serialized by the abandoned stack.
unsafe impl Sync for Page {}

/// Shared all-empty page; direct-dispatch slots point here so the hot
/// path needs no null check.
pub static EMPTY_PAGE: Page = Page::empty();

impl Page {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            slice_count: Cell::new(0),
            slice_offset: Cell::new(0),
            flags: AtomicU8::new(0),
            retire_expire: Cell::new(0),
            capacity: Cell::new(0),
            reserved: Cell::new(0),
            free: Cell::new(ptr::null_mut()),
            local_free: Cell::new(ptr::null_mut()),
            used: Cell::new(0),
            xblock_size: Cell::new(0),
            keys: Cell::new([0, 0]),
            thread_free: AtomicUsize::new(Delayed::NoDelayedFree as usize),
            heap: AtomicPtr::new(ptr::null_mut()),
            prev: Cell::new(ptr::null_mut()),
            next: Cell::new(ptr::null_mut()),
        }
    }

    #[inline]
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.xblock_size.get() as usize
    }

    #[inline]
    #[must_use]
    pub fn is_huge(&self) -> bool {
        self.xblock_size.get() == HUGE_BLOCK_SIZE
    }

    #[inline]
    #[must_use]
    pub fn all_free(&self) -> bool {
        self.used.get() == 0
    }

    #[inline]
    #[must_use]
    pub fn immediate_available(&self) -> bool {
        !self.free.get().is_null()
    }

    /// Any allocatable block, counting pending cross-thread frees.
    #[inline]
    #[must_use]
    pub fn any_available(&self) -> bool {
        self.used.get() < u32::from(self.reserved.get())
            || !tf_block(self.thread_free.load(Ordering::Relaxed)).is_null()
    }

    #[inline]
    #[must_use]
    pub fn in_full(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & FLAG_IN_FULL != 0
    }

    pub fn set_in_full(&self, in_full: bool) {
        if in_full {
            self.flags.fetch_or(FLAG_IN_FULL, Ordering::Relaxed);
        } else {
            self.flags.fetch_and(!FLAG_IN_FULL, Ordering::Relaxed);
        }
    }

    #[inline]
    #[must_use]
    pub fn has_aligned(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & FLAG_HAS_ALIGNED != 0
    }

    pub fn set_has_aligned(&self, has: bool) {
        if has {
            self.flags.fetch_or(FLAG_HAS_ALIGNED, Ordering::Relaxed);
        } else {
            self.flags.fetch_and(!FLAG_HAS_ALIGNED, Ordering::Relaxed);
        }
    }

    #[inline]
    #[must_use]
    pub fn delayed(&self) -> Delayed {
        tf_delayed(self.thread_free.load(Ordering::Relaxed))
    }

    #[inline]
    #[must_use]
    pub fn heap_ptr(&self) -> *mut Heap {
        self.heap.load(Ordering::Relaxed)
    }

    pub fn set_heap(&self, heap: *mut Heap) {
        debug_assert!(self.delayed() != Delayed::DelayedFreeing);
        self.heap.store(heap, Ordering::Release);
    }

    /// The segment containing this page's metadata entry.
    #[inline]
    pub unsafe fn segment(page: NonNull<Page>) -> NonNull<Segment> {
        // Page entries live inside the segment header, which is aligned to
        // the segment size.
        // SAFETY: caller guarantees the page belongs to a live segment.
        unsafe { Segment::of_addr(page.as_ptr() as usize) }
    }

    /// Byte range backing this page's blocks.
    #[inline]
    pub unsafe fn area(page: NonNull<Page>) -> PageArea {
        // SAFETY: forwarded.
        unsafe { Segment::page_area(Page::segment(page), page) }
    }

    /// The real block size; huge pages report their whole area.
    #[inline]
    pub unsafe fn actual_block_size(page: NonNull<Page>) -> usize {
        let bsize = page.as_ref().xblock_size.get();
        if bsize == HUGE_BLOCK_SIZE {
            // SAFETY: forwarded.
            unsafe { Page::area(page) }.size
        } else {
            bsize as usize
        }
    }

    // ------------------------------------------------------------------
    // Encoded free-list links
    // ------------------------------------------------------------------

    /// Writes the encoded `next` link of a free block.
    #[inline]
    pub unsafe fn block_set_next(&self, block: NonNull<Block>, next: *mut Block) {
        let token = encode(next as usize, self.keys.get());
        // SAFETY: block points into this page's area and is free.
        unsafe { (*block.as_ptr()).next.set(token) };
    }

    /// Reads and validates the `next` link of a free block.
    ///
    /// In debug and hardened builds a decoded address outside the owning
    /// page is reported as corruption and the list is cut short.
    #[inline]
    pub unsafe fn block_next(
        page: NonNull<Page>,
        area: PageArea,
        block: NonNull<Block>,
    ) -> *mut Block {
        // SAFETY: block is a live free block of this page.
        let token = unsafe { (*block.as_ptr()).next.get() };
        let addr = decode(token, unsafe { page.as_ref() }.keys.get());
        if addr == 0 {
            return ptr::null_mut();
        }
        if cfg!(any(debug_assertions, feature = "paranoid")) && !area.contains(addr) {
            error::report(Error::Corruption {
                addr: block.as_ptr() as usize,
            });
            return ptr::null_mut();
        }
        addr as *mut Block
    }

    /// Pops the head of the primary free list. O(1).
    #[inline]
    pub unsafe fn pop_free(page: NonNull<Page>) -> Option<NonNull<Block>> {
        let this = unsafe { page.as_ref() };
        let head = NonNull::new(this.free.get())?;
        let area = unsafe { Page::area(page) };
        let next = unsafe { Page::block_next(page, area, head) };
        this.free.set(next);
        this.used.set(this.used.get() + 1);
        Some(head)
    }

    /// Heuristic double-free probe: if the first word of the block decodes
    /// to an in-page address, confirm by walking the page-local lists.
    pub unsafe fn is_double_free(page: NonNull<Page>, block: NonNull<Block>) -> bool {
        let this = unsafe { page.as_ref() };
        let area = unsafe { Page::area(page) };
        let token = unsafe { (*block.as_ptr()).next.get() };
        let decoded = decode(token, this.keys.get());
        if decoded != 0 && !area.contains(decoded) {
            return false;
        }
        let cap = this.capacity.get() as usize;
        for list in [this.free.get(), this.local_free.get()] {
            let mut cursor = list;
            let mut steps = 0;
            while let Some(cur) = NonNull::new(cursor) {
                if cur == block {
                    error::report(Error::DoubleFree {
                        addr: block.as_ptr() as usize,
                    });
                    return true;
                }
                if steps > cap {
                    break;
                }
                steps += 1;
                cursor = unsafe { Page::block_next(page, area, cur) };
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // Collecting free lists
    // ------------------------------------------------------------------

    /// Atomically takes the cross-thread free list and prepends it to
    /// `local_free`, updating `used`.
    unsafe fn thread_free_collect(page: NonNull<Page>) {
        let this = unsafe { page.as_ref() };
        let mut tf = this.thread_free.load(Ordering::Relaxed);
        let backoff = Backoff::new();
        let head = loop {
            let head = tf_block(tf);
            if head.is_null() {
                return;
            }
            let cleared = tf_make(ptr::null_mut(), tf_delayed(tf));
            match this.thread_free.compare_exchange_weak(
                tf,
                cleared,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break head,
                Err(actual) => {
                    tf = actual;
                    backoff.spin();
                }
            }
        };
        let Some(head) = NonNull::new(head) else {
            return;
        };

        // Find the tail, bounding the walk by the capacity: a longer chain
        // means a forged or cyclic list.
        let area = unsafe { Page::area(page) };
        let max_count = this.capacity.get() as usize;
        let mut count = 1;
        let mut tail = head;
        loop {
            let next = unsafe { Page::block_next(page, area, tail) };
            let Some(next) = NonNull::new(next) else { break };
            count += 1;
            if count > max_count {
                error::report(Error::Corruption {
                    addr: page.as_ptr() as usize,
                });
                return; // leak the chain rather than corrupt the page
            }
            tail = next;
        }

        // Prepend to the local free list.
        unsafe { this.block_set_next(tail, this.local_free.get()) };
        this.local_free.set(head.as_ptr());
        this.used.set(this.used.get() - count as u32);
    }

    /// Migrates `thread_free` and `local_free` into `free`.
    ///
    /// With `force`, `local_free` is appended even when `free` is
    /// non-empty (a linear walk, used on shutdown paths only).
    pub unsafe fn collect_free(page: NonNull<Page>, force: bool) {
        let this = unsafe { page.as_ref() };
        if force || !tf_block(this.thread_free.load(Ordering::Relaxed)).is_null() {
            unsafe { Page::thread_free_collect(page) };
        }

        let local = this.local_free.get();
        if !local.is_null() {
            if this.free.get().is_null() {
                this.free.set(local);
                this.local_free.set(ptr::null_mut());
            } else if force {
                let area = unsafe { Page::area(page) };
                let mut tail = unsafe { NonNull::new_unchecked(local) };
                loop {
                    let next = unsafe { Page::block_next(page, area, tail) };
                    match NonNull::new(next) {
                        Some(next) => tail = next,
                        None => break,
                    }
                }
                unsafe { this.block_set_next(tail, this.free.get()) };
                this.free.set(local);
                this.local_free.set(ptr::null_mut());
            }
        }
        debug_assert!(!force || this.local_free.get().is_null());
    }

    // ------------------------------------------------------------------
    // Delayed-free flag
    // ------------------------------------------------------------------

    /// Attempts to move the delayed-free flag to `delayed`.
    ///
    /// Returns `false` after a bounded number of yields if another thread
    /// holds the transient `DelayedFreeing` state; the caller leaves its
    /// operation pending and retries later.
    pub unsafe fn try_set_delayed(
        page: NonNull<Page>,
        delayed: Delayed,
        override_never: bool,
    ) -> bool {
        let this = unsafe { page.as_ref() };
        let mut yields = 0;
        // Must acquire: we may observe and act on the flag without a CAS.
        let mut tf = this.thread_free.load(Ordering::Acquire);
        loop {
            let old = tf_delayed(tf);
            if old == Delayed::DelayedFreeing {
                if yields >= 4 {
                    return false;
                }
                yields += 1;
                std::thread::yield_now();
                tf = this.thread_free.load(Ordering::Acquire);
                continue;
            }
            if old == delayed {
                return true;
            }
            if !override_never && old == Delayed::NeverDelayedFree {
                return true;
            }
            let new = tf_make(tf_block(tf), delayed);
            match this
                .thread_free
                .compare_exchange_weak(tf, new, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => tf = actual,
            }
        }
    }

    /// Like [`Self::try_set_delayed`] but loops until the flag is set.
    pub unsafe fn set_delayed(page: NonNull<Page>, delayed: Delayed, override_never: bool) {
        while !unsafe { Page::try_set_delayed(page, delayed, override_never) } {
            std::thread::yield_now();
        }
    }

    // ------------------------------------------------------------------
    // Cross-thread free
    // ------------------------------------------------------------------

    /// Frees a block from a thread that does not own the page.
    ///
    /// The usual case pushes onto the page's atomic `thread_free` list.
    /// The first free against a page in `UseDelayedFree` state escalates:
    /// it locks the flag (`DelayedFreeing`), pushes the block onto the
    /// owning heap's delayed list, and unlocks to `NoDelayedFree`.
    pub unsafe fn free_non_local(page: NonNull<Page>, block: NonNull<Block>) {
        let this = unsafe { page.as_ref() };

        if this.is_huge() {
            // Huge payloads are reset eagerly so the memory is reusable by
            // the OS before the owning thread ever runs again.
            unsafe { segment::huge_page_reset(page, block) };
        }

        let backoff = Backoff::new();
        let mut tf = this.thread_free.load(Ordering::Relaxed);
        let use_delayed = loop {
            let use_delayed = tf_delayed(tf) == Delayed::UseDelayedFree;
            let new = if use_delayed {
                // Lock out concurrent escalators.
                tf_make(tf_block(tf), Delayed::DelayedFreeing)
            } else {
                unsafe { this.block_set_next(block, tf_block(tf)) };
                tf_make(block.as_ptr(), tf_delayed(tf))
            };
            match this
                .thread_free
                .compare_exchange_weak(tf, new, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break use_delayed,
                Err(actual) => {
                    tf = actual;
                    backoff.spin();
                }
            }
        };

        if use_delayed {
            // The heap pointer is stable while DelayedFreeing is held: the
            // owner cannot abandon or delete the page in this window.
            let heap = this.heap.load(Ordering::Acquire);
            debug_assert!(!heap.is_null());
            if let Some(heap) = unsafe { heap.as_ref() } {
                let mut dfree = heap.thread_delayed_free.load(Ordering::Relaxed);
                loop {
                    // Delayed-list links span pages, so they are encoded
                    // with the heap keys, not the page keys.
                    let token = encode(dfree as usize, heap.keys);
                    unsafe { (*block.as_ptr()).next.set(token) };
                    match heap.thread_delayed_free.compare_exchange_weak(
                        dfree,
                        block.as_ptr(),
                        Ordering::Release,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(actual) => dfree = actual,
                    }
                }
            }

            // Unlock the flag.
            let mut tf = this.thread_free.load(Ordering::Relaxed);
            loop {
                debug_assert_eq!(tf_delayed(tf), Delayed::DelayedFreeing);
                let new = tf_make(tf_block(tf), Delayed::NoDelayedFree);
                match this.thread_free.compare_exchange_weak(
                    tf,
                    new,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => tf = actual,
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Initialization and extension
    // ------------------------------------------------------------------

    /// Initializes a freshly materialized page and threads its first run
    /// of blocks.
    pub unsafe fn init(page: NonNull<Page>, heap: &Heap, block_size: usize) {
        let this = unsafe { page.as_ref() };
        debug_assert!(block_size > 0);
        this.set_heap(ptr::from_ref(heap).cast_mut());
        this.keys.set(heap.rng.next_keys());

        let area = unsafe { Page::area(page) };
        let (xblock, reserved) = if block_size >= HUGE_BLOCK_SIZE as usize {
            (HUGE_BLOCK_SIZE, 1)
        } else {
            let reserved = (area.size / block_size).min(usize::from(u16::MAX)).max(1);
            (block_size as u32, reserved as u16)
        };
        this.xblock_size.set(xblock);
        this.reserved.set(reserved);
        this.capacity.set(0);
        this.used.set(0);
        this.retire_expire.set(0);
        this.free.set(ptr::null_mut());
        this.local_free.set(ptr::null_mut());
        this.flags.store(0, Ordering::Relaxed);
        this.thread_free.store(
            tf_make(ptr::null_mut(), Delayed::NoDelayedFree),
            Ordering::Release,
        );
        this.prev.set(ptr::null_mut());
        this.next.set(ptr::null_mut());

        unsafe { Page::extend_free(page, heap) };
        debug_assert!(this.immediate_available());
    }

    /// Grows `capacity` toward `reserved` by threading a new run of
    /// blocks onto the free list, bounded so a fresh page does not touch
    /// more memory than the allocation that triggered it needs.
    pub unsafe fn extend_free(page: NonNull<Page>, heap: &Heap) {
        let this = unsafe { page.as_ref() };
        let capacity = this.capacity.get() as usize;
        let reserved = this.reserved.get() as usize;
        if capacity >= reserved {
            return;
        }

        let area = unsafe { Page::area(page) };
        let bsize = if this.is_huge() {
            area.size
        } else {
            this.block_size()
        };

        let mut extend = reserved - capacity;
        let max_extend = (MAX_EXTEND_SIZE / bsize).max(MIN_EXTEND);
        if extend > max_extend {
            extend = max_extend;
        }

        if crate::options::options().secure_free_lists() && extend >= 2 * MIN_EXTEND {
            unsafe { Page::free_list_extend_secure(page, area, bsize, capacity, extend, heap) };
        } else {
            unsafe { Page::free_list_extend(page, area, bsize, capacity, extend) };
        }
        this.capacity.set((capacity + extend) as u16);
    }

    #[inline]
    unsafe fn block_at(area: PageArea, bsize: usize, index: usize) -> NonNull<Block> {
        debug_assert!((index + 1) * bsize <= area.size);
        unsafe { NonNull::new_unchecked((area.start + index * bsize) as *mut Block) }
    }

    /// Threads blocks `[start_idx, start_idx + extend)` sequentially.
    unsafe fn free_list_extend(
        page: NonNull<Page>,
        area: PageArea,
        bsize: usize,
        start_idx: usize,
        extend: usize,
    ) {
        let this = unsafe { page.as_ref() };
        for i in (0..extend).rev() {
            let block = unsafe { Page::block_at(area, bsize, start_idx + i) };
            unsafe { this.block_set_next(block, this.free.get()) };
            this.free.set(block.as_ptr());
        }
    }

    /// Threads the new run in a shuffled order: the range is partitioned
    /// into up to 64 sublists which are interleaved at random, defeating
    /// allocation-order heap sprays.
    unsafe fn free_list_extend_secure(
        page: NonNull<Page>,
        area: PageArea,
        bsize: usize,
        start_idx: usize,
        extend: usize,
        heap: &Heap,
    ) {
        let this = unsafe { page.as_ref() };
        let mut shift = SECURE_SLICES.trailing_zeros() as usize;
        while (extend >> shift) == 0 {
            shift -= 1;
        }
        let slice_count = 1usize << shift;
        let slice_extend = extend / slice_count;

        let mut heads = [ptr::null_mut::<Block>(); SECURE_SLICES];
        let mut counts = [0usize; SECURE_SLICES];
        for i in 0..slice_count {
            heads[i] = unsafe { Page::block_at(area, bsize, start_idx + i * slice_extend) }.as_ptr();
            counts[i] = slice_extend;
        }
        counts[slice_count - 1] += extend % slice_count;

        let mut current = heap.rng.next() % slice_count;
        counts[current] -= 1;
        let free_start = heads[current];
        for _ in 1..extend {
            let mut next = heap.rng.next() & (slice_count - 1);
            while counts[next] == 0 {
                next += 1;
                if next == slice_count {
                    next = 0;
                }
            }
            counts[next] -= 1;
            let block = unsafe { NonNull::new_unchecked(heads[current]) };
            heads[current] = (heads[current] as usize + bsize) as *mut Block;
            unsafe { this.block_set_next(block, heads[next]) };
            current = next;
        }
        // Terminate with the previous free list (usually empty).
        let last = unsafe { NonNull::new_unchecked(heads[current]) };
        unsafe { this.block_set_next(last, this.free.get()) };
        this.free.set(free_start);
    }

    /// Recovers the block start from an interior pointer of a page whose
    /// blocks may have been allocated with an alignment adjustment.
    #[inline]
    pub unsafe fn block_of_interior(page: NonNull<Page>, ptr_addr: usize) -> NonNull<Block> {
        let area = unsafe { Page::area(page) };
        let bsize = unsafe { Page::actual_block_size(page) };
        debug_assert!(area.contains(ptr_addr));
        let offset = ptr_addr - area.start;
        let start = area.start + (offset / bsize) * bsize;
        unsafe { NonNull::new_unchecked(start as *mut Block) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_free_packing() {
        let block = 0x7f00_0000_1000usize as *mut Block;
        let tf = tf_make(block, Delayed::NoDelayedFree);
        assert_eq!(tf_block(tf), block);
        assert_eq!(tf_delayed(tf), Delayed::NoDelayedFree);
        let tf = tf_make(ptr::null_mut(), Delayed::NeverDelayedFree);
        assert!(tf_block(tf).is_null());
        assert_eq!(tf_delayed(tf), Delayed::NeverDelayedFree);
    }

    #[test]
    fn test_empty_page_flags() {
        let p = Page::empty();
        assert!(!p.in_full());
        assert!(!p.has_aligned());
        assert_eq!(p.delayed(), Delayed::NoDelayedFree);
        assert!(p.all_free());
        assert!(!p.immediate_available());
        p.set_in_full(true);
        p.set_has_aligned(true);
        assert!(p.in_full() && p.has_aligned());
        p.set_in_full(false);
        assert!(!p.in_full() && p.has_aligned());
    }

    #[test]
    fn test_page_area_contains() {
        let area = PageArea {
            start: 0x1000,
            size: 0x100,
        };
        assert!(area.contains(0x1000));
        assert!(area.contains(0x10ff));
        assert!(!area.contains(0x1100));
        assert!(!area.contains(0xfff));
    }
}
