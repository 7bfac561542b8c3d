//! Free-list pointer encoding.
//!
//! Free blocks store their `next` link as an encoded token rather than a
//! raw pointer. The transform is a keyed, reversible rotate/xor/add over a
//! machine word: with both per-page keys it round-trips exactly, while a
//! token forged or corrupted without the keys decodes to an address that
//! almost certainly falls outside the owning page and is rejected by the
//! bounds check before it is ever dereferenced.
//!
//! Null participates in the transform like any other value, so an empty
//! list is not distinguishable from a non-empty one by looking at the
//! stored token.

const WORD_BITS: u32 = usize::BITS;

/// Encodes a raw address (0 for the end of a list) under a key pair.
#[inline]
#[must_use]
pub const fn encode(addr: usize, keys: [usize; 2]) -> usize {
    (addr ^ keys[1])
        .rotate_left(keys[0] as u32 % WORD_BITS)
        .wrapping_add(keys[0])
}

/// Inverts [`encode`] under the same key pair.
#[inline]
#[must_use]
pub const fn decode(token: usize, keys: [usize; 2]) -> usize {
    token
        .wrapping_sub(keys[0])
        .rotate_right(keys[0] as u32 % WORD_BITS)
        ^ keys[1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rand::Rng;

    #[test]
    fn test_round_trip() {
        let rng = Rng::new(7);
        for _ in 0..1000 {
            let keys = rng.next_keys();
            let addr = rng.next();
            assert_eq!(decode(encode(addr, keys), keys), addr);
        }
    }

    #[test]
    fn test_null_round_trips() {
        let keys = [0x1234_5679, 0x9abc_def1];
        assert_eq!(decode(encode(0, keys), keys), 0);
    }

    #[test]
    fn test_encoding_is_keyed() {
        let addr = 0xdead_b000usize;
        let a = encode(addr, [3, 5]);
        let b = encode(addr, [3, 7]);
        let c = encode(addr, [9, 5]);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_tampered_token_decodes_elsewhere() {
        // Flipping any low bit of the token must not produce a nearby valid
        // address; the add/rotate diffuses it across the word.
        let keys = [0x0f0f_0f0f_0f0f_0f0f_u64 as usize | 1, 0x1337 | 1];
        let addr = 0x7f00_0000_1000usize;
        let token = encode(addr, keys);
        let forged = decode(token ^ 1, keys);
        assert!(forged.abs_diff(addr) > 0x1_0000);
    }
}
