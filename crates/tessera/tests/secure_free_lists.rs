//! Shuffled free-list extension.
//!
//! With the secure option on, fresh free-list runs are threaded in a
//! non-linear order; allocation correctness must be unaffected.

use tessera::{allocate, free, options};

#[test]
fn test_shuffled_extension_still_sound() {
    options().set_secure_free_lists(true);

    let ptrs: Vec<*mut u8> = (0..3000)
        .map(|i| {
            let p = allocate(64);
            assert!(!p.is_null());
            unsafe { p.cast::<u64>().write(i as u64) };
            p
        })
        .collect();

    // All distinct.
    let unique: std::collections::HashSet<usize> = ptrs.iter().map(|p| *p as usize).collect();
    assert_eq!(unique.len(), ptrs.len());

    // Consecutive allocations should not be strictly sequential in
    // memory once shuffling kicks in.
    let sequential = ptrs
        .windows(2)
        .filter(|w| {
            let a = w[0] as usize;
            let b = w[1] as usize;
            b > a && b - a <= 128
        })
        .count();
    assert!(
        sequential < ptrs.len() / 2,
        "free lists do not look shuffled at all ({sequential} sequential pairs)"
    );

    for (i, p) in ptrs.into_iter().enumerate() {
        unsafe {
            assert_eq!(p.cast::<u64>().read(), i as u64);
            free(p);
        }
    }

    options().set_secure_free_lists(false);
}
