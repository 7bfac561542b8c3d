//! Explicit heap lifecycle: create, delete (absorb), destroy, default
//! switching, and introspection.

use tessera::{allocate, free, HeapHandle};

#[test]
fn test_delete_migrates_live_blocks_to_backing_heap() {
    let heap = HeapHandle::new().expect("heap creation failed");
    let mut ptrs = Vec::new();
    for i in 0..500u64 {
        let p = heap.allocate(64);
        assert!(!p.is_null());
        unsafe { p.cast::<u64>().write(i) };
        ptrs.push(p);
    }
    assert!(heap.contains(ptrs[0]));

    heap.delete();

    // The blocks survived the heap: they now belong to the backing heap
    // and free like any other block.
    for (i, p) in ptrs.into_iter().enumerate() {
        unsafe {
            assert_eq!(p.cast::<u64>().read(), i as u64);
            free(p);
        }
    }
}

#[test]
fn test_destroy_releases_everything_at_once() {
    let heap = HeapHandle::new().expect("heap creation failed");
    for _ in 0..200 {
        assert!(!heap.allocate(256).is_null());
    }
    // No frees: destroy drops the pages wholesale.
    unsafe { heap.destroy() };

    // The default heap is unaffected.
    let p = allocate(256);
    assert!(!p.is_null());
    unsafe { free(p) };
}

#[test]
fn test_set_default_redirects_allocation() {
    let heap = HeapHandle::new().expect("heap creation failed");
    let previous = heap.set_default().expect("no previous default");

    let p = allocate(128);
    assert!(!p.is_null());
    assert!(heap.contains(p), "allocation skipped the default heap");
    assert!(heap.check_owned(p));

    previous.set_default();
    let q = allocate(128);
    assert!(!heap.contains(q));

    unsafe {
        free(p);
        free(q);
    }
    heap.delete();
}

#[test]
fn test_contains_rejects_foreign_and_freed_pointers() {
    let heap = HeapHandle::new().expect("heap creation failed");
    let other = allocate(64);
    assert!(!heap.contains(other));
    assert!(!heap.contains(std::ptr::null()));
    let own = heap.allocate(64);
    assert!(heap.contains(own));
    unsafe {
        free(own);
        free(other);
    }
    heap.delete();
}

#[test]
fn test_visitor_sees_areas_and_live_blocks() {
    let heap = HeapHandle::new().expect("heap creation failed");
    let ptrs: Vec<*mut u8> = (0..100).map(|_| heap.allocate(200)).collect();

    let mut areas = 0;
    let mut blocks = 0;
    let ok = heap.visit_blocks(true, |area, block| {
        match block {
            None => {
                areas += 1;
                assert!(area.block_size >= 200);
                assert!(area.used <= area.reserved);
            }
            Some((ptr, usable)) => {
                blocks += 1;
                assert!(!ptr.is_null());
                assert!(usable >= 200);
            }
        }
        true
    });
    assert!(ok);
    assert!(areas >= 1);
    assert_eq!(blocks, 100, "visitor must see exactly the live blocks");

    // Early termination.
    let mut seen = 0;
    let ok = heap.visit_blocks(true, |_, block| {
        if block.is_some() {
            seen += 1;
            return seen < 10;
        }
        true
    });
    assert!(!ok);
    assert_eq!(seen, 10);

    for p in ptrs {
        unsafe { free(p) };
    }
    heap.delete();
}
