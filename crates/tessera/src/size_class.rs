//! Size-class binning.
//!
//! Request sizes map to a small dense set of bins. Sizes up to 8 words map
//! 1:1 on even word counts (which keeps every block 16-byte aligned);
//! larger sizes bin on the top three bits below the most significant bit,
//! bounding internal fragmentation at ~12.5%. Sizes beyond the large
//! threshold collapse into the single huge bin whose pages carry one
//! object each.

use crate::segment::LARGE_OBJ_SIZE_MAX;
use crate::WORD_SIZE;

/// Number of the last size-class bin (the huge bin).
pub const BIN_HUGE: usize = 73;
/// Pseudo-bin holding pages with no free blocks.
pub const BIN_FULL: usize = BIN_HUGE + 1;
/// Total number of page queues per heap.
pub const BIN_COUNT: usize = BIN_FULL + 1;

/// Largest size served by the direct-dispatch table.
pub const SMALL_SIZE_MAX: usize = 128 * WORD_SIZE;
/// `SMALL_SIZE_MAX` in words.
pub const SMALL_WSIZE_MAX: usize = 128;

const LARGE_WSIZE_MAX: usize = LARGE_OBJ_SIZE_MAX / WORD_SIZE;

/// Returns the bin index for a request of `size` bytes.
///
/// Pure and monotonic; `size <= bin_size(bin(size))` for every size up to
/// [`LARGE_OBJ_SIZE_MAX`].
#[inline]
#[must_use]
pub fn bin(size: usize) -> usize {
    let wsize = size.div_ceil(WORD_SIZE);
    if wsize <= 1 {
        2
    } else if wsize <= 8 {
        // Round up to an even word count so every small block is 16-byte
        // aligned.
        (wsize + 1) & !1
    } else if wsize > LARGE_WSIZE_MAX {
        BIN_HUGE
    } else {
        let w = wsize - 1;
        // Highest set bit, then the next two bits select the quarter.
        let b = (usize::BITS - 1 - w.leading_zeros()) as usize;
        ((b << 2) + ((w >> (b - 2)) & 3)) - 3
    }
}

/// Returns the block size (in bytes) served by `bin`.
///
/// Inverse of [`bin`] in the round-trip sense: `bin(bin_size(b)) == b` for
/// every bin below [`BIN_HUGE`].
#[inline]
#[must_use]
pub fn bin_size(bin: usize) -> usize {
    debug_assert!(bin >= 1 && bin <= BIN_HUGE);
    if bin <= 8 {
        bin * WORD_SIZE
    } else if bin == BIN_HUGE {
        LARGE_OBJ_SIZE_MAX + 1
    } else {
        let b = (bin + 3) >> 2;
        let frac = (bin + 3) & 3;
        ((1 << b) + ((frac + 1) << (b - 2))) * WORD_SIZE
    }
}

/// Word count for a byte size, as used by the direct-dispatch table.
#[inline]
#[must_use]
pub fn wsize_of(size: usize) -> usize {
    size.div_ceil(WORD_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_monotonic() {
        let mut prev = 0;
        for size in 1..=(LARGE_OBJ_SIZE_MAX + WORD_SIZE) {
            if size > 256 * 1024 && size % 4096 != 0 {
                continue; // sample the large range
            }
            let b = bin(size);
            assert!(b >= prev, "bin must not decrease: size {size}");
            assert!(b <= BIN_HUGE);
            prev = b;
        }
    }

    #[test]
    fn test_bin_size_covers_request() {
        for size in 1..=(64 * 1024) {
            let b = bin(size);
            if b < BIN_HUGE {
                assert!(
                    size <= bin_size(b),
                    "size {size} does not fit its bin {b} ({})",
                    bin_size(b)
                );
            }
        }
    }

    #[test]
    fn test_bin_round_trip() {
        for b in 2..BIN_HUGE {
            if b <= 8 && b % 2 == 1 {
                continue; // odd word-count bins are never produced
            }
            assert_eq!(bin(bin_size(b)), b, "round trip failed for bin {b}");
        }
    }

    #[test]
    fn test_small_blocks_are_16_byte_sized() {
        for size in 1..=SMALL_SIZE_MAX {
            let b = bin(size);
            assert_eq!(bin_size(b) % 16, 0, "size {size} bin {b}");
        }
    }

    #[test]
    fn test_fragmentation_bound() {
        // Above the 1:1 range the rounded size must stay within 12.5% + a
        // word of the request.
        for size in (65..=LARGE_OBJ_SIZE_MAX).step_by(4097) {
            let b = bin(size);
            if b < BIN_HUGE {
                let rounded = bin_size(b);
                assert!(rounded as f64 <= size as f64 * 1.125 + WORD_SIZE as f64);
            }
        }
    }

    #[test]
    fn test_huge_threshold() {
        assert_eq!(bin(LARGE_OBJ_SIZE_MAX + 1), BIN_HUGE);
        assert!(bin(LARGE_OBJ_SIZE_MAX) < BIN_HUGE);
    }
}
