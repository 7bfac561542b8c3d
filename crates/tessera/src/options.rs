//! Runtime options.
//!
//! All options are plain atomics with defaults chosen for general-purpose
//! workloads. They are meant to be set once near startup (environment
//! parsing is deliberately not part of this crate); changing them later is
//! safe but only affects operations that have not yet sampled the value.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

/// Runtime configuration knobs, one instance per process.
#[derive(Debug)]
pub struct Options {
    /// Number of segments a thread allocates before committing eagerly.
    eager_commit_delay: AtomicUsize,
    /// Delay in milliseconds before a scheduled purge is executed.
    /// 0 purges immediately, negative disables purging.
    purge_delay_ms: AtomicI64,
    /// Whether purging decommits (true) or merely resets (false).
    purge_decommits: AtomicBool,
    /// Upper bound on abandoned segments inspected per reclaim attempt.
    max_reclaim_tries: AtomicUsize,
    /// Purge the unused parts of a segment when it is abandoned.
    abandoned_page_purge: AtomicBool,
    /// Thread new free-list runs in a shuffled order.
    secure_free_lists: AtomicBool,
}

impl Options {
    pub(crate) const fn new() -> Self {
        Self {
            eager_commit_delay: AtomicUsize::new(1),
            purge_delay_ms: AtomicI64::new(10),
            purge_decommits: AtomicBool::new(true),
            max_reclaim_tries: AtomicUsize::new(8),
            abandoned_page_purge: AtomicBool::new(true),
            secure_free_lists: AtomicBool::new(false),
        }
    }

    /// Segments a thread allocates before committing eagerly.
    #[must_use]
    pub fn eager_commit_delay(&self) -> usize {
        self.eager_commit_delay.load(Ordering::Relaxed)
    }

    /// Sets the eager-commit delay.
    pub fn set_eager_commit_delay(&self, segments: usize) {
        self.eager_commit_delay.store(segments, Ordering::Relaxed);
    }

    /// Purge delay in milliseconds (0 immediate, negative disabled).
    #[must_use]
    pub fn purge_delay_ms(&self) -> i64 {
        self.purge_delay_ms.load(Ordering::Relaxed)
    }

    /// Sets the purge delay.
    pub fn set_purge_delay_ms(&self, ms: i64) {
        self.purge_delay_ms.store(ms, Ordering::Relaxed);
    }

    /// Whether purging decommits instead of resetting.
    #[must_use]
    pub fn purge_decommits(&self) -> bool {
        self.purge_decommits.load(Ordering::Relaxed)
    }

    /// Chooses between decommit and reset for purges.
    pub fn set_purge_decommits(&self, decommit: bool) {
        self.purge_decommits.store(decommit, Ordering::Relaxed);
    }

    /// Abandoned segments inspected per reclaim attempt.
    #[must_use]
    pub fn max_reclaim_tries(&self) -> usize {
        self.max_reclaim_tries.load(Ordering::Relaxed)
    }

    /// Sets the reclaim inspection bound.
    pub fn set_max_reclaim_tries(&self, tries: usize) {
        self.max_reclaim_tries.store(tries, Ordering::Relaxed);
    }

    /// Whether unused ranges are purged when a segment is abandoned.
    #[must_use]
    pub fn abandoned_page_purge(&self) -> bool {
        self.abandoned_page_purge.load(Ordering::Relaxed)
    }

    /// Toggles purge-on-abandon.
    pub fn set_abandoned_page_purge(&self, purge: bool) {
        self.abandoned_page_purge.store(purge, Ordering::Relaxed);
    }

    /// Whether new free-list runs are threaded in shuffled order.
    #[must_use]
    pub fn secure_free_lists(&self) -> bool {
        self.secure_free_lists.load(Ordering::Relaxed)
    }

    /// Toggles shuffled free-list extension.
    pub fn set_secure_free_lists(&self, secure: bool) {
        self.secure_free_lists.store(secure, Ordering::Relaxed);
    }
}

/// Accessor for the process-wide options.
#[must_use]
pub fn options() -> &'static Options {
    &crate::context::context().options
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let o = Options::new();
        assert_eq!(o.purge_delay_ms(), 10);
        assert!(o.purge_decommits());
        assert_eq!(o.max_reclaim_tries(), 8);
        assert!(!o.secure_free_lists());
    }

    #[test]
    fn test_set_and_get() {
        let o = Options::new();
        o.set_purge_delay_ms(-1);
        assert_eq!(o.purge_delay_ms(), -1);
        o.set_secure_free_lists(true);
        assert!(o.secure_free_lists());
    }
}
