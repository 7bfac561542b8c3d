//! Concurrent bitmap over claimable bit runs.
//!
//! An arena divides its reserved region into fixed-size blocks and tracks
//! ownership with one bit per block. Claiming a contiguous run must be
//! atomic: two threads racing for overlapping runs must never both
//! succeed. Runs that fit in one field are claimed with a single
//! compare-exchange; longer runs are claimed field by field with rollback
//! on conflict.
//!
//! The search strategy is a linear scan with an in-field bit-scan: fields
//! are read with a plain load, candidate runs are located with
//! trailing-ones/leading-zeros, and the claim itself is the only
//! synchronizing operation. A failed compare-exchange re-reads the field
//! and resumes the scan at the conflicting bit.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::Backoff;

/// Bits per bitmap field.
pub const FIELD_BITS: usize = usize::BITS as usize;

const FULL: usize = usize::MAX;

/// Position of a claimed run: packed field index and bit index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapIndex(usize);

impl BitmapIndex {
    #[inline]
    #[must_use]
    pub const fn new(field: usize, bit: usize) -> Self {
        Self(field * FIELD_BITS + bit)
    }

    /// Absolute bit position.
    #[inline]
    #[must_use]
    pub const fn absolute(self) -> usize {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn field(self) -> usize {
        self.0 / FIELD_BITS
    }

    #[inline]
    #[must_use]
    pub const fn bit(self) -> usize {
        self.0 % FIELD_BITS
    }
}

/// A borrowed view over an array of atomic bitmap fields.
///
/// The fields themselves live wherever the owner placed them (for arenas,
/// in the arena's metadata block); the bitmap is only a window with the
/// claim algorithms attached.
#[derive(Clone, Copy)]
pub struct Bitmap<'a> {
    fields: &'a [AtomicUsize],
}

impl<'a> Bitmap<'a> {
    #[must_use]
    pub const fn new(fields: &'a [AtomicUsize]) -> Self {
        Self { fields }
    }

    /// Total number of bits.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.fields.len() * FIELD_BITS
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Tries to claim `count` consecutive bits inside the field `field_idx`.
    fn try_claim_in_field(&self, field_idx: usize, count: usize) -> Option<BitmapIndex> {
        debug_assert!(count >= 1 && count <= FIELD_BITS);
        let field = &self.fields[field_idx];
        let mut map = field.load(Ordering::Relaxed);
        let backoff = Backoff::new();

        let mut bit_idx = (map.trailing_ones() as usize).min(FIELD_BITS);
        while bit_idx + count <= FIELD_BITS {
            let mask = if count == FIELD_BITS {
                FULL
            } else {
                ((1usize << count) - 1) << bit_idx
            };
            if map & mask == 0 {
                match field.compare_exchange_weak(
                    map,
                    map | mask,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(BitmapIndex::new(field_idx, bit_idx)),
                    Err(actual) => {
                        // Lost a race; rescan from the same position with
                        // the fresh value.
                        map = actual;
                        backoff.spin();
                        continue;
                    }
                }
            }
            // Skip past the blocking set bit, then past any set bits that
            // follow it.
            let blocked = map & mask;
            bit_idx = FIELD_BITS - blocked.leading_zeros() as usize;
            bit_idx += ((map >> bit_idx).trailing_ones() as usize).min(FIELD_BITS - bit_idx);
        }
        None
    }

    /// Claims `count` consecutive zero bits confined to a single field.
    ///
    /// Returns the position of the run, or `None` if no field currently
    /// holds such a run. At most one claimant can win any given bit.
    #[must_use]
    pub fn try_find_claim(&self, count: usize) -> Option<BitmapIndex> {
        if count == 0 || count > FIELD_BITS {
            return None;
        }
        (0..self.fields.len()).find_map(|i| {
            if self.fields[i].load(Ordering::Relaxed) == FULL {
                None
            } else {
                self.try_claim_in_field(i, count)
            }
        })
    }

    /// Like [`Self::try_find_claim`], but a successful claim is handed to
    /// `pred` before being accepted; when `pred` rejects it the run is
    /// released and the search continues in the following fields.
    #[must_use]
    pub fn try_find_claim_pred(
        &self,
        count: usize,
        mut pred: impl FnMut(BitmapIndex) -> bool,
    ) -> Option<BitmapIndex> {
        if count == 0 || count > FIELD_BITS {
            return None;
        }
        for i in 0..self.fields.len() {
            if self.fields[i].load(Ordering::Relaxed) == FULL {
                continue;
            }
            if let Some(idx) = self.try_claim_in_field(i, count) {
                if pred(idx) {
                    return Some(idx);
                }
                self.unclaim(idx, count);
            }
        }
        None
    }

    /// Claims `count` consecutive bits, allowing the run to span fields.
    ///
    /// Spanning runs must start at the upper free end of a field; the tail
    /// is claimed field by field and rolled back wholesale on conflict.
    #[must_use]
    pub fn try_find_claim_across(&self, count: usize) -> Option<BitmapIndex> {
        if count == 0 {
            return None;
        }
        if count <= FIELD_BITS {
            if let Some(idx) = self.try_find_claim(count) {
                return Some(idx);
            }
        }

        'fields: for i in 0..self.fields.len() {
            let map = self.fields[i].load(Ordering::Relaxed);
            let avail = map.leading_zeros() as usize;
            if avail == 0 || avail >= count {
                // avail >= count was already covered by the in-field pass.
                continue;
            }
            let needed_after = count - avail;
            let full_fields = needed_after / FIELD_BITS;
            let final_bits = needed_after % FIELD_BITS;
            let last = i + 1 + full_fields + usize::from(final_bits > 0);
            if last > self.fields.len() {
                continue;
            }

            let start_bit = FIELD_BITS - avail;
            let init_mask = if avail == FIELD_BITS {
                FULL
            } else {
                ((1usize << avail) - 1) << start_bit
            };
            if self.fields[i]
                .compare_exchange(map, map | init_mask, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            let start = BitmapIndex::new(i, start_bit);
            let mut claimed = avail;

            for j in (i + 1)..(i + 1 + full_fields) {
                if self.fields[j]
                    .compare_exchange(0, FULL, Ordering::Acquire, Ordering::Relaxed)
                    .is_err()
                {
                    self.unclaim(start, claimed);
                    continue 'fields;
                }
                claimed += FIELD_BITS;
            }

            if final_bits > 0 {
                let fin = &self.fields[i + 1 + full_fields];
                let fin_mask = (1usize << final_bits) - 1;
                let mut cur = fin.load(Ordering::Relaxed);
                loop {
                    if cur & fin_mask != 0 {
                        self.unclaim(start, claimed);
                        continue 'fields;
                    }
                    match fin.compare_exchange_weak(
                        cur,
                        cur | fin_mask,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(actual) => cur = actual,
                    }
                }
            }
            return Some(start);
        }
        None
    }

    /// Releases a previously claimed run. Returns `true` if every bit of
    /// the run was indeed claimed (a `false` indicates a double release).
    pub fn unclaim(&self, idx: BitmapIndex, count: usize) -> bool {
        self.for_each_field_mask(idx, count, |field, mask| {
            let prev = self.fields[field].fetch_and(!mask, Ordering::Release);
            prev & mask == mask
        })
    }

    /// Returns `true` if every bit of the run is currently claimed.
    #[must_use]
    pub fn is_claimed(&self, idx: BitmapIndex, count: usize) -> bool {
        self.for_each_field_mask(idx, count, |field, mask| {
            self.fields[field].load(Ordering::Relaxed) & mask == mask
        })
    }

    /// Claims an exact run unconditionally (test and arena-initialization
    /// helper). Returns `true` if no bit was previously claimed.
    pub fn claim(&self, idx: BitmapIndex, count: usize) -> bool {
        self.for_each_field_mask(idx, count, |field, mask| {
            let prev = self.fields[field].fetch_or(mask, Ordering::Acquire);
            prev & mask == 0
        })
    }

    /// Applies `f` to each (field, mask) pair covering the run, returning
    /// the conjunction of the results.
    fn for_each_field_mask(
        &self,
        idx: BitmapIndex,
        count: usize,
        mut f: impl FnMut(usize, usize) -> bool,
    ) -> bool {
        let mut field = idx.field();
        let mut bit = idx.bit();
        let mut remaining = count;
        let mut ok = true;
        while remaining > 0 {
            let here = remaining.min(FIELD_BITS - bit);
            let mask = if here == FIELD_BITS {
                FULL
            } else {
                ((1usize << here) - 1) << bit
            };
            ok &= f(field, mask);
            remaining -= here;
            field += 1;
            bit = 0;
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fields(n: usize) -> Vec<AtomicUsize> {
        (0..n).map(|_| AtomicUsize::new(0)).collect()
    }

    #[test]
    fn test_claim_single_bits() {
        let f = fields(1);
        let bm = Bitmap::new(&f);
        for i in 0..FIELD_BITS {
            let idx = bm.try_find_claim(1).expect("bit available");
            assert_eq!(idx.absolute(), i);
        }
        assert!(bm.try_find_claim(1).is_none());
    }

    #[test]
    fn test_claim_and_unclaim_run() {
        let f = fields(2);
        let bm = Bitmap::new(&f);
        let idx = bm.try_find_claim(10).unwrap();
        assert!(bm.is_claimed(idx, 10));
        assert!(bm.unclaim(idx, 10));
        assert!(!bm.is_claimed(idx, 10));
        // Double release is reported.
        assert!(!bm.unclaim(idx, 10));
    }

    #[test]
    fn test_claim_skips_occupied_runs() {
        let f = fields(1);
        let bm = Bitmap::new(&f);
        // Occupy bits 2..4 so an 8-run must start at 4.
        assert!(bm.claim(BitmapIndex::new(0, 2), 2));
        let idx = bm.try_find_claim(8).unwrap();
        assert_eq!(idx.bit(), 4);
    }

    #[test]
    fn test_claim_across_fields() {
        let f = fields(4);
        let bm = Bitmap::new(&f);
        let run = FIELD_BITS + FIELD_BITS / 2;
        let idx = bm.try_find_claim_across(run).unwrap();
        assert!(bm.is_claimed(idx, run));
        // An entire-field claim must still fit in the remaining space.
        let idx2 = bm.try_find_claim_across(FIELD_BITS).unwrap();
        assert!(bm.is_claimed(idx2, FIELD_BITS));
        bm.unclaim(idx, run);
        bm.unclaim(idx2, FIELD_BITS);
        for field in &f {
            assert_eq!(field.load(Ordering::Relaxed), 0);
        }
    }

    #[test]
    fn test_claim_across_respects_boundary() {
        let f = fields(2);
        let bm = Bitmap::new(&f);
        // Fill all of field 1; a spanning run can no longer fit.
        assert!(bm.claim(BitmapIndex::new(1, 0), FIELD_BITS));
        assert!(bm.try_find_claim_across(FIELD_BITS + 1).is_none());
    }

    #[test]
    fn test_claim_pred_rejection_moves_on() {
        let f = fields(3);
        let bm = Bitmap::new(&f);
        let idx = bm
            .try_find_claim_pred(4, |idx| idx.field() == 2)
            .expect("field 2 has room");
        assert_eq!(idx.field(), 2);
        // Rejected candidates were released again.
        assert_eq!(f[0].load(Ordering::Relaxed), 0);
        assert_eq!(f[1].load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_concurrent_claims_are_disjoint() {
        use std::sync::Arc;

        let f = Arc::new(fields(8));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let f = Arc::clone(&f);
            handles.push(std::thread::spawn(move || {
                let bm = Bitmap::new(&f);
                let mut claimed = Vec::new();
                for _ in 0..Bitmap::new(&f).len() {
                    match bm.try_find_claim(3) {
                        Some(idx) => claimed.push(idx),
                        None => break,
                    }
                }
                claimed
            }));
        }
        let mut seen = std::collections::HashSet::new();
        for h in handles {
            for idx in h.join().unwrap() {
                for bit in idx.absolute()..idx.absolute() + 3 {
                    assert!(seen.insert(bit), "bit {bit} claimed twice");
                }
            }
        }
    }
}
