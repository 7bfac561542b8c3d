//! Process-wide context.
//!
//! All global mutable state lives in one explicitly-constructed singleton
//! rather than scattered statics: options, statistics, the abandoned
//! stack, the arena directory, and the process cookie key. Everything is
//! const-initialized; the only init-on-first-use member is the cookie
//! key, which needs runtime entropy.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::abandoned::AbandonedStack;
use crate::arena::ArenaDirectory;
use crate::options::Options;
use crate::rand;
use crate::stats::GlobalStats;

pub(crate) struct ProcessContext {
    pub options: Options,
    pub stats: GlobalStats,
    pub abandoned: AbandonedStack,
    pub arenas: ArenaDirectory,
    cookie: AtomicUsize,
}

impl ProcessContext {
    const fn new() -> Self {
        Self {
            options: Options::new(),
            stats: GlobalStats::new(),
            abandoned: AbandonedStack::new(),
            arenas: ArenaDirectory::new(),
            cookie: AtomicUsize::new(0),
        }
    }

    /// Process cookie key for segment cookies, drawn from entropy on
    /// first use.
    pub(crate) fn cookie_key(&self) -> usize {
        let key = self.cookie.load(Ordering::Relaxed);
        if key != 0 {
            return key;
        }
        let fresh = (rand::entropy_seed() as usize) | 1;
        match self
            .cookie
            .compare_exchange(0, fresh, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => fresh,
            Err(existing) => existing,
        }
    }
}

static CONTEXT: ProcessContext = ProcessContext::new();

pub(crate) fn context() -> &'static ProcessContext {
    &CONTEXT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_key_is_stable_and_nonzero() {
        let a = context().cookie_key();
        let b = context().cookie_key();
        assert_ne!(a, 0);
        assert_eq!(a, b);
    }
}
