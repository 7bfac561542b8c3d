//! Collect semantics: empty pages return to the segment layer, pages
//! with any live block stay attached to their heap.

use tessera::{free, HeapHandle};

#[test]
fn test_collect_returns_empty_pages_and_keeps_live_ones() {
    let heap = HeapHandle::new().expect("heap creation failed");

    // 2000-byte blocks: a few dozen per page, so 1000 of them spread
    // over many pages.
    let ptrs: Vec<*mut u8> = (0..1000)
        .map(|i| {
            let p = heap.allocate(2000);
            assert!(!p.is_null());
            unsafe { p.cast::<u64>().write(i as u64) };
            p
        })
        .collect();

    let mut areas_before = 0;
    heap.visit_blocks(false, |_, _| {
        areas_before += 1;
        true
    });
    assert!(areas_before > 4, "expected multiple pages");

    // Free a contiguous prefix: the pages backing it become entirely
    // empty, while later pages keep live blocks.
    for &p in &ptrs[..500] {
        unsafe { free(p) };
    }
    heap.collect(false);
    heap.collect(false);

    let mut areas_after = 0;
    let mut live = 0;
    heap.visit_blocks(true, |_, block| {
        if block.is_none() {
            areas_after += 1;
        } else {
            live += 1;
        }
        true
    });
    assert!(
        areas_after < areas_before,
        "entirely-free pages must be returned to the segment layer \
         ({areas_before} -> {areas_after})"
    );
    assert_eq!(live, 500, "pages with live blocks must stay attached");

    // The survivors are untouched.
    for (i, &p) in ptrs.iter().enumerate().skip(500) {
        unsafe {
            assert_eq!(p.cast::<u64>().read(), i as u64);
            free(p);
        }
    }
    heap.delete();
}

#[test]
fn test_forced_collect_skips_retire_delay() {
    let heap = HeapHandle::new().expect("heap creation failed");
    let p = heap.allocate(128);
    unsafe { free(p) };
    // The sole page of the bin is retire-delayed; a forced collect frees
    // it immediately.
    heap.collect(true);
    let mut areas = 0;
    heap.visit_blocks(false, |_, _| {
        areas += 1;
        true
    });
    assert_eq!(areas, 0, "forced collect must drop the retired page");
    heap.delete();
}
