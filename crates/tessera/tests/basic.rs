//! Basic single-thread allocation behavior.

use tessera::{
    allocate, allocate_zeroed, allocate_zeroed_count, bin, bin_size, free, reallocate,
    usable_size,
};

#[test]
fn test_allocate_and_free_roundtrip() {
    let p = allocate(64);
    assert!(!p.is_null());
    unsafe {
        p.write_bytes(0xab, 64);
        assert_eq!(p.read(), 0xab);
        free(p);
    }
}

#[test]
fn test_zero_size_is_a_unique_pointer() {
    let a = allocate(0);
    let b = allocate(0);
    assert!(!a.is_null() && !b.is_null());
    assert_ne!(a, b);
    unsafe {
        free(a);
        free(b);
    }
}

#[test]
fn test_free_null_is_noop() {
    unsafe { free(std::ptr::null_mut()) };
}

#[test]
fn test_usable_size_covers_request() {
    for size in [1, 8, 24, 100, 1024, 4096, 100_000] {
        let p = allocate(size);
        assert!(!p.is_null());
        let usable = unsafe { usable_size(p) };
        assert!(usable >= size, "usable {usable} < requested {size}");
        // The whole usable range must be writable.
        unsafe {
            p.write_bytes(0x5a, usable);
            free(p);
        }
    }
}

#[test]
fn test_sizes_across_all_bins() {
    let mut ptrs = Vec::new();
    let mut size = 1usize;
    while size <= 4 << 20 {
        let p = allocate(size);
        assert!(!p.is_null(), "allocation of {size} failed");
        unsafe { p.write_bytes((size % 251) as u8, size) };
        ptrs.push((p, size));
        size = size * 3 / 2 + 1;
    }
    for &(p, size) in &ptrs {
        unsafe {
            assert_eq!(p.read(), (size % 251) as u8, "content clobbered for {size}");
            assert_eq!(p.add(size - 1).read(), (size % 251) as u8);
            free(p);
        }
    }
}

#[test]
fn test_allocations_are_distinct_and_writable() {
    let ptrs: Vec<*mut u8> = (0..2000).map(|_| allocate(48)).collect();
    let unique: std::collections::HashSet<usize> = ptrs.iter().map(|p| *p as usize).collect();
    assert_eq!(unique.len(), ptrs.len(), "allocator handed out a duplicate");
    for (i, &p) in ptrs.iter().enumerate() {
        unsafe { (p.cast::<u64>()).write(i as u64) };
    }
    for (i, &p) in ptrs.iter().enumerate() {
        unsafe {
            assert_eq!((p.cast::<u64>()).read(), i as u64);
            free(p);
        }
    }
}

#[test]
fn test_alloc_free_reuse() {
    // A tight alloc/free loop must settle on a bounded set of addresses:
    // after the page's initial free-list run is consumed, freed blocks
    // are recycled instead of extending further.
    let first = allocate(128);
    unsafe { free(first) };
    let mut seen = std::collections::HashSet::new();
    for _ in 0..256 {
        let p = allocate(128);
        seen.insert(p as usize);
        unsafe { free(p) };
    }
    assert!(seen.len() <= 40, "free blocks are not being reused");
}

#[test]
fn test_zeroed_allocation() {
    let p = allocate_zeroed(4096);
    assert!(!p.is_null());
    unsafe {
        for i in 0..4096 {
            assert_eq!(p.add(i).read(), 0);
        }
        free(p);
    }
}

#[test]
fn test_zeroed_count_checks_overflow() {
    assert!(allocate_zeroed_count(usize::MAX, 16).is_null());
    let p = allocate_zeroed_count(16, 16);
    assert!(!p.is_null());
    unsafe { free(p) };
}

#[test]
fn test_realloc_grows_and_preserves() {
    let p = allocate(100);
    unsafe {
        p.write_bytes(0x77, 100);
        let q = reallocate(p, 5000);
        assert!(!q.is_null());
        for i in 0..100 {
            assert_eq!(q.add(i).read(), 0x77);
        }
        let r = reallocate(q, 60);
        assert!(!r.is_null());
        assert_eq!(r.read(), 0x77);
        free(r);
    }
}

#[test]
fn test_realloc_in_place_when_it_fits() {
    let p = allocate(1000);
    let usable = unsafe { usable_size(p) };
    let q = unsafe { reallocate(p, usable) };
    assert_eq!(p, q, "fitting realloc should reuse the block");
    unsafe { free(q) };
}

#[test]
fn test_realloc_of_null_allocates() {
    let p = unsafe { reallocate(std::ptr::null_mut(), 32) };
    assert!(!p.is_null());
    unsafe { free(p) };
}

#[test]
fn test_bin_size_is_public_contract() {
    for size in [1, 16, 100, 4096] {
        assert!(bin_size(bin(size)) >= size);
    }
}
