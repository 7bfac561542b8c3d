//! Allocation statistics.
//!
//! Two tiers, following the usual split between hot and cold counters:
//! cross-thread-meaningful gauges (live bytes, live blocks, segment and
//! abandoned counts) are process-wide atomics updated in place, while
//! per-thread event counters accumulate in plain cells and are merged into
//! the process totals on thread exit or an explicit [`stats_merge`].

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

/// Process-wide statistics singleton.
#[derive(Debug)]
pub struct GlobalStats {
    live_bytes: CachePadded<AtomicIsize>,
    live_blocks: CachePadded<AtomicIsize>,
    peak_bytes: AtomicUsize,
    segments: AtomicUsize,
    abandoned_segments: AtomicUsize,
    reclaimed_segments: AtomicUsize,
    committed_bytes: AtomicIsize,
    purged_bytes: AtomicUsize,
    malloc_count: AtomicUsize,
    free_count: AtomicUsize,
    fresh_pages: AtomicUsize,
    retired_pages: AtomicUsize,
}

impl GlobalStats {
    pub(crate) const fn new() -> Self {
        Self {
            live_bytes: CachePadded::new(AtomicIsize::new(0)),
            live_blocks: CachePadded::new(AtomicIsize::new(0)),
            peak_bytes: AtomicUsize::new(0),
            segments: AtomicUsize::new(0),
            abandoned_segments: AtomicUsize::new(0),
            reclaimed_segments: AtomicUsize::new(0),
            committed_bytes: AtomicIsize::new(0),
            purged_bytes: AtomicUsize::new(0),
            malloc_count: AtomicUsize::new(0),
            free_count: AtomicUsize::new(0),
            fresh_pages: AtomicUsize::new(0),
            retired_pages: AtomicUsize::new(0),
        }
    }

    pub(crate) fn block_allocated(&self, size: usize) {
        let live = self.live_bytes.fetch_add(size as isize, Ordering::Relaxed) + size as isize;
        self.live_blocks.fetch_add(1, Ordering::Relaxed);
        // Racy max; good enough for a gauge.
        let live = live.max(0) as usize;
        if live > self.peak_bytes.load(Ordering::Relaxed) {
            self.peak_bytes.store(live, Ordering::Relaxed);
        }
    }

    pub(crate) fn block_freed(&self, size: usize) {
        self.live_bytes.fetch_sub(size as isize, Ordering::Relaxed);
        self.live_blocks.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn segment_created(&self) {
        self.segments.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn segment_released(&self) {
        self.segments.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn segment_abandoned(&self) {
        self.abandoned_segments.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn segment_reclaimed(&self) {
        self.abandoned_segments.fetch_sub(1, Ordering::Relaxed);
        self.reclaimed_segments.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn committed(&self, bytes: usize) {
        self.committed_bytes
            .fetch_add(bytes as isize, Ordering::Relaxed);
    }

    pub(crate) fn decommitted(&self, bytes: usize) {
        self.committed_bytes
            .fetch_sub(bytes as isize, Ordering::Relaxed);
        self.purged_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Per-thread event counters, merged on thread exit.
#[derive(Debug)]
pub(crate) struct ThreadStats {
    pub malloc_count: Cell<usize>,
    pub free_count: Cell<usize>,
    pub fresh_pages: Cell<usize>,
    pub retired_pages: Cell<usize>,
}

impl ThreadStats {
    pub const fn new() -> Self {
        Self {
            malloc_count: Cell::new(0),
            free_count: Cell::new(0),
            fresh_pages: Cell::new(0),
            retired_pages: Cell::new(0),
        }
    }

    /// Flushes this thread's counters into the process totals.
    pub fn merge(&self, global: &GlobalStats) {
        global
            .malloc_count
            .fetch_add(self.malloc_count.replace(0), Ordering::Relaxed);
        global
            .free_count
            .fetch_add(self.free_count.replace(0), Ordering::Relaxed);
        global
            .fresh_pages
            .fetch_add(self.fresh_pages.replace(0), Ordering::Relaxed);
        global
            .retired_pages
            .fetch_add(self.retired_pages.replace(0), Ordering::Relaxed);
    }
}

/// A point-in-time copy of the process statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Bytes currently handed out to callers (block sizes, not request
    /// sizes).
    pub live_bytes: isize,
    /// Blocks currently handed out.
    pub live_blocks: isize,
    /// High-water mark of `live_bytes`.
    pub peak_bytes: usize,
    /// Segments currently reserved from the OS or an arena.
    pub segments: usize,
    /// Segments currently sitting in the abandoned list.
    pub abandoned_segments: usize,
    /// Total segments ever reclaimed from the abandoned list.
    pub reclaimed_segments: usize,
    /// Bytes currently committed.
    pub committed_bytes: isize,
    /// Total bytes ever purged (decommitted or reset).
    pub purged_bytes: usize,
    /// Total allocation count (merged threads only).
    pub malloc_count: usize,
    /// Total free count (merged threads only).
    pub free_count: usize,
    /// Total pages carved from segments.
    pub fresh_pages: usize,
    /// Total pages retired back to segments.
    pub retired_pages: usize,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "live: {} bytes in {} blocks (peak {})",
            self.live_bytes, self.live_blocks, self.peak_bytes
        )?;
        writeln!(
            f,
            "segments: {} ({} abandoned, {} reclaimed)",
            self.segments, self.abandoned_segments, self.reclaimed_segments
        )?;
        writeln!(
            f,
            "committed: {} bytes, purged: {} bytes",
            self.committed_bytes, self.purged_bytes
        )?;
        write!(
            f,
            "ops: {} mallocs, {} frees, {} fresh pages, {} retired",
            self.malloc_count, self.free_count, self.fresh_pages, self.retired_pages
        )
    }
}

/// Returns a snapshot of the process-wide statistics.
#[must_use]
pub fn stats() -> StatsSnapshot {
    let g = global();
    StatsSnapshot {
        live_bytes: g.live_bytes.load(Ordering::Relaxed),
        live_blocks: g.live_blocks.load(Ordering::Relaxed),
        peak_bytes: g.peak_bytes.load(Ordering::Relaxed),
        segments: g.segments.load(Ordering::Relaxed),
        abandoned_segments: g.abandoned_segments.load(Ordering::Relaxed),
        reclaimed_segments: g.reclaimed_segments.load(Ordering::Relaxed),
        committed_bytes: g.committed_bytes.load(Ordering::Relaxed),
        purged_bytes: g.purged_bytes.load(Ordering::Relaxed),
        malloc_count: g.malloc_count.load(Ordering::Relaxed),
        free_count: g.free_count.load(Ordering::Relaxed),
        fresh_pages: g.fresh_pages.load(Ordering::Relaxed),
        retired_pages: g.retired_pages.load(Ordering::Relaxed),
    }
}

/// Resets every event counter and peak gauge. Live gauges (bytes, blocks,
/// segments) are left alone: they describe current state, not history.
pub fn stats_reset() {
    let g = global();
    g.peak_bytes
        .store(g.live_bytes.load(Ordering::Relaxed).max(0) as usize, Ordering::Relaxed);
    g.purged_bytes.store(0, Ordering::Relaxed);
    g.reclaimed_segments.store(0, Ordering::Relaxed);
    g.malloc_count.store(0, Ordering::Relaxed);
    g.free_count.store(0, Ordering::Relaxed);
    g.fresh_pages.store(0, Ordering::Relaxed);
    g.retired_pages.store(0, Ordering::Relaxed);
}

/// Merges the calling thread's counters into the process totals now
/// instead of waiting for thread exit.
pub fn stats_merge() {
    crate::heap::with_thread_stats(|ts| ts.merge(global()));
}

pub(crate) fn global() -> &'static GlobalStats {
    &crate::context::context().stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_accounting_balances() {
        let g = GlobalStats::new();
        g.block_allocated(64);
        g.block_allocated(32);
        g.block_freed(64);
        g.block_freed(32);
        assert_eq!(g.live_bytes.load(Ordering::Relaxed), 0);
        assert_eq!(g.live_blocks.load(Ordering::Relaxed), 0);
        assert!(g.peak_bytes.load(Ordering::Relaxed) >= 96);
    }

    #[test]
    fn test_thread_stats_merge_drains() {
        let g = GlobalStats::new();
        let t = ThreadStats::new();
        t.malloc_count.set(5);
        t.free_count.set(3);
        t.merge(&g);
        assert_eq!(g.malloc_count.load(Ordering::Relaxed), 5);
        assert_eq!(t.malloc_count.get(), 0);
        t.merge(&g);
        assert_eq!(g.malloc_count.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_snapshot_display() {
        let s = StatsSnapshot::default();
        let text = format!("{s}");
        assert!(text.contains("segments"));
        assert!(text.contains("mallocs"));
    }
}
