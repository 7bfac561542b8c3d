//! Pseudo-random key generation.
//!
//! The allocator needs cheap, decent-quality randomness for per-heap and
//! per-page free-list keys and for shuffled free-list extension. None of
//! this is cryptographic: the keys raise the bar for heap-spray and
//! forged-pointer attacks and catch corruption, they do not defend against
//! an attacker that can already read allocator metadata.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

/// `splitmix64` output mixer. Full-period, passes practical statistical
/// tests, and is a single dependency-free expression.
#[inline]
#[must_use]
pub const fn mix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Per-heap random state.
///
/// Single-owner: lives inside a `Heap` and is only stepped by the owning
/// thread, hence `Cell` rather than an atomic.
#[derive(Debug)]
pub struct Rng {
    state: Cell<u64>,
}

impl Rng {
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self {
            // A zero state would make a plain xorshift degenerate; mix the
            // seed so even seed 0 starts somewhere useful.
            state: Cell::new(mix(seed) | 1),
        }
    }

    /// Creates a generator seeded from process entropy.
    #[must_use]
    pub fn from_entropy() -> Self {
        Self::new(entropy_seed())
    }

    /// Returns the next pseudo-random word.
    #[inline]
    pub fn next(&self) -> usize {
        // xorshift64*; the state never becomes zero.
        let mut x = self.state.get();
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state.set(x);
        (x.wrapping_mul(0x2545_f491_4f6c_dd1d) >> 16) as usize
    }

    /// Returns a non-zero key pair for free-list pointer encoding.
    #[inline]
    pub fn next_keys(&self) -> [usize; 2] {
        [self.next() | 1, self.next() | 1]
    }
}

/// Derives a fresh seed from address-space layout, the monotonic clock and
/// a process-wide counter, so heaps created back-to-back still diverge.
#[must_use]
pub fn entropy_seed() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let stack = std::ptr::from_ref(&n) as u64;
    let image = std::ptr::from_ref(&COUNTER) as u64;
    mix(stack ^ image.rotate_left(17) ^ sys_alloc::clock_now_ms() ^ mix(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mix_changes_input() {
        assert_ne!(mix(0), 0);
        assert_ne!(mix(1), mix(2));
    }

    #[test]
    fn test_rng_produces_distinct_words() {
        let rng = Rng::new(42);
        let a = rng.next();
        let b = rng.next();
        let c = rng.next();
        assert!(a != b || b != c);
    }

    #[test]
    fn test_keys_are_odd() {
        let rng = Rng::from_entropy();
        for _ in 0..64 {
            let [k0, k1] = rng.next_keys();
            assert_eq!(k0 & 1, 1);
            assert_eq!(k1 & 1, 1);
        }
    }

    #[test]
    fn test_entropy_seeds_differ() {
        assert_ne!(entropy_seed(), entropy_seed());
    }
}
