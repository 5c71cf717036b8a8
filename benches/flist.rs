//! Free list benchmarks.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use sonance::sync::FreeList;
use std::sync::Arc;

fn bench_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("flist_push_pop");

    for capacity in [16, 128, 1024] {
        let list = FreeList::new(capacity);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(capacity), &list, |b, list| {
            b.iter(|| {
                list.push(std::hint::black_box(42u64)).ok();
                std::hint::black_box(list.pop());
            });
        });
    }

    group.finish();
}

fn bench_flist_concurrent(c: &mut Criterion) {
    let mut group = c.benchmark_group("flist_concurrent");

    let list = Arc::new(FreeList::new(256));

    group.throughput(Throughput::Elements(4 * 1000));
    group.bench_function("4_threads_1000_ops_each", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let list = Arc::clone(&list);
                    std::thread::spawn(move || {
                        for i in 0..1000u64 {
                            let _ = list.push(i);
                            std::hint::black_box(list.pop());
                        }
                    })
                })
                .collect();

            for h in handles {
                h.join().unwrap();
            }
        });
    });

    group.finish();
}

fn bench_vs_box_alloc(c: &mut Criterion) {
    let mut group = c.benchmark_group("flist_vs_alloc");
    let list: FreeList<Box<[u8; 128]>> = FreeList::new(8);
    list.push(Box::new([0; 128])).ok();

    group.bench_function("recycle", |b| {
        b.iter(|| {
            let shell = list.pop().unwrap_or_else(|| Box::new([0; 128]));
            let _ = list.push(std::hint::black_box(shell));
        });
    });

    group.bench_function("allocate", |b| {
        b.iter(|| std::hint::black_box(Box::new([0u8; 128])));
    });

    group.finish();
}

criterion_group!(benches, bench_push_pop, bench_flist_concurrent, bench_vs_box_alloc);
criterion_main!(benches);
