//! The global abandoned-segment stack.
//!
//! Segments whose owning thread exited with live blocks are published
//! here for any other thread to reclaim. The stack is lock-free; the
//! classic ABA hazard of a pop racing a pop/push cycle is defeated by
//! packing a monotonically increasing tag into the low bits of the head
//! word (segment addresses are 32 MiB aligned, leaving 25 tag bits).
//!
//! A second, plain push-only stack holds segments that were inspected
//! but not reclaimed; it is swapped back into the main stack in one batch
//! when the main stack runs dry, which keeps unreclaimable segments from
//! being re-examined on every pop.
//!
//! The reader counter protects poppers: a segment must never be
//! decommitted while some thread is still dereferencing a header it just
//! popped, so destruction waits for `await_readers`.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam::utils::{Backoff, CachePadded};

use crate::segment::{Segment, SEGMENT_SIZE};

const TAG_MASK: usize = SEGMENT_SIZE - 1;

#[inline]
fn pack(segment: *mut Segment, prev: usize) -> usize {
    debug_assert_eq!(segment as usize & TAG_MASK, 0);
    let tag = (prev.wrapping_add(1)) & TAG_MASK;
    segment as usize | tag
}

#[inline]
fn unpack(tagged: usize) -> *mut Segment {
    (tagged & !TAG_MASK) as *mut Segment
}

#[derive(Debug)]
pub(crate) struct AbandonedStack {
    top: CachePadded<AtomicUsize>,
    visited: AtomicPtr<Segment>,
    readers: AtomicUsize,
}

impl AbandonedStack {
    pub(crate) const fn new() -> Self {
        Self {
            top: CachePadded::new(AtomicUsize::new(0)),
            visited: AtomicPtr::new(ptr::null_mut()),
            readers: AtomicUsize::new(0),
        }
    }

    /// Publishes an abandoned segment. The segment's `thread_id` must
    /// already be 0.
    pub(crate) fn push(&self, segment: NonNull<Segment>) {
        let backoff = Backoff::new();
        let mut top = self.top.load(Ordering::Relaxed);
        loop {
            let head = unpack(top);
            unsafe { segment.as_ref() }
                .abandoned_next
                .store(head, Ordering::Relaxed);
            let new = pack(segment.as_ptr(), top);
            match self
                .top
                .compare_exchange_weak(top, new, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => {
                    top = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Parks an inspected-but-unwanted segment on the visited list.
    pub(crate) fn push_visited(&self, segment: NonNull<Segment>) {
        let mut head = self.visited.load(Ordering::Relaxed);
        loop {
            unsafe { segment.as_ref() }
                .abandoned_next
                .store(head, Ordering::Relaxed);
            match self.visited.compare_exchange_weak(
                head,
                segment.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Pops one abandoned segment, refilling from the visited list when
    /// the main stack is empty.
    pub(crate) fn try_pop(&self) -> Option<NonNull<Segment>> {
        // Cheap emptiness probe before taking a reader ticket.
        if unpack(self.top.load(Ordering::Relaxed)).is_null() && !self.revisit() {
            return None;
        }

        // While the reader count is held, no popped segment's memory can
        // be released under us (see `Segment::free`).
        self.readers.fetch_add(1, Ordering::Acquire);
        let backoff = Backoff::new();
        let mut top = self.top.load(Ordering::Acquire);
        let result = loop {
            let Some(head) = NonNull::new(unpack(top)) else {
                break None;
            };
            let next = unsafe { head.as_ref() }.abandoned_next.load(Ordering::Relaxed);
            let new = pack(next, top);
            match self
                .top
                .compare_exchange_weak(top, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    unsafe { head.as_ref() }
                        .abandoned_next
                        .store(ptr::null_mut(), Ordering::Relaxed);
                    break Some(head);
                }
                Err(actual) => {
                    top = actual;
                    backoff.spin();
                }
            }
        };
        self.readers.fetch_sub(1, Ordering::Release);
        result
    }

    /// Moves the entire visited list back onto the main stack. Returns
    /// `true` if anything was moved.
    fn revisit(&self) -> bool {
        let first = self.visited.swap(ptr::null_mut(), Ordering::Acquire);
        let Some(first_nn) = NonNull::new(first) else {
            return false;
        };
        // Find the tail of the batch.
        let mut tail = first_nn;
        loop {
            let next = unsafe { tail.as_ref() }.abandoned_next.load(Ordering::Relaxed);
            match NonNull::new(next) {
                Some(next) => tail = next,
                None => break,
            }
        }
        // Splice the batch in front of the current stack.
        let backoff = Backoff::new();
        let mut top = self.top.load(Ordering::Relaxed);
        loop {
            unsafe { tail.as_ref() }
                .abandoned_next
                .store(unpack(top), Ordering::Relaxed);
            let new = pack(first, top);
            match self
                .top
                .compare_exchange_weak(top, new, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => {
                    top = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Busy-waits until no pop is in flight. Called before abandoned
    /// memory is decommitted or released.
    pub(crate) fn await_readers(&self) {
        let backoff = Backoff::new();
        while self.readers.load(Ordering::Acquire) != 0 {
            backoff.snooze();
        }
    }

    /// Current number of stacked segments (both lists); O(n), for stats
    /// and tests.
    pub(crate) fn len(&self) -> usize {
        let mut n = 0;
        let mut cursor = unpack(self.top.load(Ordering::Acquire));
        while let Some(seg) = NonNull::new(cursor) {
            n += 1;
            cursor = unsafe { seg.as_ref() }.abandoned_next.load(Ordering::Relaxed);
        }
        let mut cursor = self.visited.load(Ordering::Acquire);
        while let Some(seg) = NonNull::new(cursor) {
            n += 1;
            cursor = unsafe { seg.as_ref() }.abandoned_next.load(Ordering::Relaxed);
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_tag_increments_and_wraps() {
        let seg = (SEGMENT_SIZE * 3) as *mut Segment;
        let t0 = pack(seg, 0);
        assert_eq!(unpack(t0), seg);
        assert_eq!(t0 & TAG_MASK, 1);
        let t1 = pack(seg, t0);
        assert_eq!(t1 & TAG_MASK, 2);
        let wrapped = pack(seg, TAG_MASK);
        assert_eq!(wrapped & TAG_MASK, 0);
        assert_eq!(unpack(wrapped), seg);
    }

    #[test]
    fn test_empty_stack_pops_none() {
        let stack = AbandonedStack::new();
        assert!(stack.try_pop().is_none());
        assert_eq!(stack.len(), 0);
        stack.await_readers(); // must not block when idle
    }
}
