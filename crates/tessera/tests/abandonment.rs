//! Segment abandonment and reclamation.
//!
//! A thread that exits with live blocks leaves its segments on the
//! global abandoned list; a later thread allocating the same size class
//! adopts them without disturbing the live blocks.

use std::sync::mpsc;
use std::thread;

use tessera::test_util::abandoned_segment_count;
use tessera::{allocate, free};

const BLOCKS: usize = 200;
const SIZE: usize = 2048;

#[test]
fn test_exited_threads_segments_are_reclaimed_intact() {
    let (tx, rx) = mpsc::channel::<usize>();

    thread::spawn(move || {
        for i in 0..BLOCKS {
            let p = allocate(SIZE);
            assert!(!p.is_null());
            unsafe {
                for off in 0..SIZE {
                    p.add(off).write(((i + off) % 251) as u8);
                }
            }
            tx.send(p as usize).unwrap();
        }
    })
    .join()
    .unwrap();

    let ptrs: Vec<usize> = rx.iter().collect();
    assert_eq!(ptrs.len(), BLOCKS);
    assert!(
        abandoned_segment_count() > 0,
        "thread exit with live blocks must abandon its segment"
    );

    // This is the main thread's first allocation: its span queues are
    // empty, so the segment layer must reach for the abandoned list.
    let own = allocate(SIZE);
    assert!(!own.is_null());

    // Every block the dead thread left behind is still intact.
    for (i, &addr) in ptrs.iter().enumerate() {
        let p = addr as *const u8;
        unsafe {
            for off in [0usize, 1, SIZE / 2, SIZE - 1] {
                assert_eq!(
                    p.add(off).read(),
                    ((i + off) % 251) as u8,
                    "block {i} corrupted across abandonment"
                );
            }
        }
    }

    // And they free as ordinary local or cross-thread blocks.
    for &addr in &ptrs {
        unsafe { free(addr as *mut u8) };
    }
    unsafe { free(own) };

    tessera::collect(true);
    assert_eq!(
        abandoned_segment_count(),
        0,
        "reclaimed segments must leave the abandoned list"
    );
}
