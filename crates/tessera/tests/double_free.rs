//! Double-free and foreign-pointer detection.
//!
//! Runs as a single test function: the error hook and its rate limiter
//! are process-wide.

#![cfg(not(feature = "paranoid"))]

use std::sync::atomic::{AtomicUsize, Ordering};

use tessera::{allocate, free, reset_error_count, set_error_handler, stats, Error};

static DOUBLE_FREES: AtomicUsize = AtomicUsize::new(0);
static INVALID_POINTERS: AtomicUsize = AtomicUsize::new(0);

fn handler(err: Error) {
    match err {
        Error::DoubleFree { .. } => {
            DOUBLE_FREES.fetch_add(1, Ordering::Relaxed);
        }
        Error::InvalidPointer { .. } => {
            INVALID_POINTERS.fetch_add(1, Ordering::Relaxed);
        }
        _ => {}
    }
}

#[test]
fn test_detection_reports_and_never_crashes() {
    reset_error_count();
    set_error_handler(Some(handler));

    // Same-thread double free: detected before the list is corrupted.
    let p = allocate(64);
    assert!(!p.is_null());
    let live_before = stats().live_blocks;
    unsafe {
        free(p);
        free(p);
    }
    assert_eq!(DOUBLE_FREES.load(Ordering::Relaxed), 1);
    // The second free must not have decremented accounting again.
    assert_eq!(stats().live_blocks, live_before - 1);

    // The heap still works afterwards.
    let q = allocate(64);
    assert!(!q.is_null());
    unsafe {
        q.write_bytes(0x11, 64);
        free(q);
    }

    // An unaligned pointer is rejected as a no-op.
    let r = allocate(64);
    unsafe {
        free(r.add(1));
    }
    assert!(INVALID_POINTERS.load(Ordering::Relaxed) >= 1);
    unsafe { free(r) };

    // Freeing twice with many live neighbors must not corrupt them.
    let ptrs: Vec<*mut u8> = (0..100).map(|_| allocate(64)).collect();
    for (i, &p) in ptrs.iter().enumerate() {
        unsafe { p.cast::<u64>().write(i as u64) };
    }
    unsafe {
        free(ptrs[50]);
        free(ptrs[50]);
    }
    assert_eq!(DOUBLE_FREES.load(Ordering::Relaxed), 2);
    for (i, &p) in ptrs.iter().enumerate() {
        if i != 50 {
            unsafe {
                assert_eq!(p.cast::<u64>().read(), i as u64);
                free(p);
            }
        }
    }

    set_error_handler(None);
}
