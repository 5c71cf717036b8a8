//! Message queue benchmarks.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use sonance::sync::{AsyncMsgQ, MsgObject};
use sonance::memory::{MemBlock, MemChunk};
use std::any::Any;
use std::sync::Arc;

struct Nop;

impl MsgObject for Nop {
    fn process_msg(
        &self,
        code: i32,
        _userdata: Option<&mut (dyn Any + Send)>,
        _chunk: Option<&MemChunk>,
    ) -> i32 {
        code
    }
}

fn bench_post_get_done(c: &mut Criterion) {
    let mut group = c.benchmark_group("asyncmsgq_post_get_done");

    let q = AsyncMsgQ::new(256).unwrap();
    let object: Arc<dyn MsgObject> = Arc::new(Nop);
    let chunk = MemChunk::whole(Arc::new(MemBlock::heap(4096).unwrap()));

    group.throughput(Throughput::Elements(1));
    group.bench_function("bare", |b| {
        b.iter(|| {
            q.post(None, 1, None, None);
            q.get(false).unwrap().done(0);
        });
    });

    group.bench_function("object_and_chunk", |b| {
        b.iter(|| {
            q.post(Some(&object), 1, None, Some(&chunk));
            q.get(false).unwrap().dispatch();
        });
    });

    group.finish();
}

fn bench_cross_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("asyncmsgq_cross_thread");

    for batch in [1_000, 10_000] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter(|| {
                let q = Arc::new(AsyncMsgQ::new(64).unwrap());
                let producer = {
                    let q = Arc::clone(&q);
                    std::thread::spawn(move || {
                        for code in 0..batch {
                            q.post(None, code, None, None);
                        }
                    })
                };
                for _ in 0..batch {
                    q.get(true).unwrap().done(0);
                }
                producer.join().unwrap();
            });
        });
    }

    group.finish();
}

fn bench_send_roundtrip(c: &mut Criterion) {
    let q = Arc::new(AsyncMsgQ::new(64).unwrap());
    let consumer = {
        let q = Arc::clone(&q);
        std::thread::spawn(move || {
            loop {
                let d = q.get(true).unwrap();
                let code = d.code();
                d.done(code);
                if code < 0 {
                    break;
                }
            }
        })
    };

    c.bench_function("asyncmsgq_send_roundtrip", |b| {
        b.iter(|| std::hint::black_box(q.send(None, 1, None, None)));
    });

    q.post(None, -1, None, None);
    consumer.join().unwrap();
}

criterion_group!(benches, bench_post_get_done, bench_cross_thread, bench_send_roundtrip);
criterion_main!(benches);
