//! Cross-thread free protocol.
//!
//! Producer threads allocate and hand every pointer to consumer threads
//! that free them; nothing may be lost, duplicated or corrupted, and the
//! live-block accounting must return to its starting point.

use std::collections::HashSet;
use std::sync::mpsc;
use std::thread;

use tessera::{allocate, collect, free, stats};

#[test]
fn test_handoff_frees_every_block_exactly_once() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 2000;

    let live_before = stats().live_blocks;

    let mut producers = Vec::new();
    let mut consumers = Vec::new();

    for t in 0..PRODUCERS {
        let (tx, rx) = mpsc::channel::<usize>();
        let (freed_tx, freed_rx) = mpsc::channel::<()>();

        producers.push(thread::spawn(move || {
            for i in 0..PER_PRODUCER {
                let size = 16 + (i % 40) * 8;
                let p = allocate(size);
                assert!(!p.is_null());
                // Tag the block so the consumer can verify it arrived
                // intact and exactly once.
                unsafe { p.cast::<u64>().write(((t << 32) | i) as u64) };
                tx.send(p as usize).unwrap();
            }
            drop(tx);
            // Stay alive until every block is freed, so the frees are
            // genuine cross-thread frees landing on live pages; thread
            // exit then drains the pending lists.
            freed_rx.recv().unwrap();
        }));

        consumers.push(thread::spawn(move || {
            let mut seen = HashSet::new();
            while let Ok(addr) = rx.recv() {
                let p = addr as *mut u8;
                let tag = unsafe { p.cast::<u64>().read() };
                assert!(seen.insert(tag), "block delivered twice: {tag:#x}");
                unsafe { free(p) };
            }
            assert_eq!(seen.len(), PER_PRODUCER);
            freed_tx.send(()).unwrap();
        }));
    }

    for c in consumers {
        c.join().unwrap();
    }
    for p in producers {
        p.join().unwrap();
    }

    collect(true);
    assert_eq!(
        stats().live_blocks,
        live_before,
        "blocks were lost or double-counted"
    );
}

#[test]
fn test_full_page_escalation_path() {
    // Fill pages completely so remote frees hit pages parked in the full
    // queue and must escalate through the heap delayed-free list.
    let (tx, rx) = mpsc::channel::<usize>();
    let (freed_tx, freed_rx) = mpsc::channel::<()>();

    let producer = thread::spawn(move || {
        // 2048-byte padded blocks: a handful of blocks per page, so many
        // pages fill up and move to the full queue.
        let mut ptrs = Vec::new();
        for i in 0..4000 {
            let p = allocate(2000);
            assert!(!p.is_null());
            unsafe { p.cast::<u64>().write(i as u64) };
            ptrs.push(p as usize);
        }
        for addr in ptrs {
            tx.send(addr).unwrap();
        }
        drop(tx);
        // Keep allocating while the consumer frees remotely: the drain
        // of the delayed list runs inside this loop.
        for _ in 0..4000 {
            let p = allocate(2000);
            assert!(!p.is_null());
            unsafe { free(p) };
        }
        freed_rx.recv().unwrap();
    });

    let consumer = thread::spawn(move || {
        let mut count = 0u64;
        while let Ok(addr) = rx.recv() {
            let p = addr as *mut u8;
            unsafe {
                assert!(p.cast::<u64>().read() < 4000);
                free(p);
            }
            count += 1;
        }
        assert_eq!(count, 4000);
        freed_tx.send(()).unwrap();
    });

    consumer.join().unwrap();
    producer.join().unwrap();
}
