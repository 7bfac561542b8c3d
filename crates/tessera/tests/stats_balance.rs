//! Accounting: live gauges return to baseline after balanced workloads.
//!
//! Single test function; the counters are process-wide.

use std::thread;

use tessera::{allocate, free, stats, stats_merge, stats_reset};

#[test]
fn test_live_counters_balance_across_threads() {
    let before = stats();

    // Same-thread balance.
    let ptrs: Vec<*mut u8> = (0..300).map(|i| allocate(32 + i % 200)).collect();
    for p in ptrs {
        unsafe { free(p) };
    }

    // Multi-thread balance: each worker runs its own balanced workload
    // and merges its counters before exiting.
    let mut handles = Vec::new();
    for _ in 0..4 {
        handles.push(thread::spawn(|| {
            let local: Vec<*mut u8> = (0..500).map(|_| allocate(100)).collect();
            for p in local {
                unsafe { free(p) };
            }
            stats_merge();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let after = stats();
    assert_eq!(after.live_blocks, before.live_blocks);
    assert_eq!(after.live_bytes, before.live_bytes);
    assert!(after.malloc_count >= before.malloc_count + 2000);
    assert!(after.peak_bytes >= before.peak_bytes);

    stats_reset();
    let reset = stats();
    assert_eq!(reset.malloc_count, 0);
    assert_eq!(reset.free_count, 0);
    // Live gauges survive a reset.
    assert_eq!(reset.live_blocks, after.live_blocks);
}
