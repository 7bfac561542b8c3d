//! Allocation throughput benchmarks.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use tessera::{allocate, free};

fn bench_alloc_free_pairs(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_free");
    for size in [16usize, 64, 256, 1024, 8192, 128 * 1024] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let p = allocate(black_box(size));
                unsafe { free(p) };
            });
        });
    }
    group.finish();
}

fn bench_batched(c: &mut Criterion) {
    const BATCH: usize = 1000;
    let mut group = c.benchmark_group("batched");
    group.throughput(Throughput::Elements(BATCH as u64));
    for size in [32usize, 512] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut ptrs = vec![std::ptr::null_mut(); BATCH];
            b.iter(|| {
                for slot in &mut ptrs {
                    *slot = allocate(black_box(size));
                }
                for slot in &mut ptrs {
                    unsafe { free(*slot) };
                }
            });
        });
    }
    group.finish();
}

fn bench_cross_thread_free(c: &mut Criterion) {
    use std::sync::mpsc;

    c.bench_function("cross_thread_free_1k", |b| {
        b.iter_custom(|iters| {
            let start = std::time::Instant::now();
            for _ in 0..iters {
                let (tx, rx) = mpsc::channel::<usize>();
                let consumer = std::thread::spawn(move || {
                    while let Ok(addr) = rx.recv() {
                        unsafe { free(addr as *mut u8) };
                    }
                });
                for _ in 0..1000 {
                    tx.send(allocate(64) as usize).unwrap();
                }
                drop(tx);
                consumer.join().unwrap();
            }
            start.elapsed()
        });
    });
}

criterion_group!(
    benches,
    bench_alloc_free_pairs,
    bench_batched,
    bench_cross_thread_free
);
criterion_main!(benches);
