use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use std::sync::Arc;
use std::thread;

use dds_lifecycle::{DomainRequest, EntityKind, Runtime};

fn runtime() -> Runtime {
    Runtime::builder().gc_worker(false).build().unwrap()
}

// Benchmark 1: Single-threaded pin/unpin of a live writer
fn bench_single_thread_pin(c: &mut Criterion) {
    let rt = runtime();
    let participant = rt.create_participant(DomainRequest::Id(0)).unwrap();
    let publisher = rt.create_entity(participant, EntityKind::Publisher).unwrap();
    let writer = rt.create_entity(publisher, EntityKind::Writer).unwrap();

    c.bench_function("single_thread_pin_unpin", |b| {
        b.iter(|| {
            let pinned = rt.pin(black_box(writer)).unwrap();
            black_box(pinned.kind());
        });
    });
}

// Benchmark 2: Many threads pinning the same handle
fn bench_contended_pin(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_pin");
    group.sample_size(10);

    for num_threads in [2, 4, 8].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(num_threads),
            num_threads,
            |b, &num_threads| {
                let rt = Arc::new(runtime());
                let participant = rt.create_participant(DomainRequest::Id(0)).unwrap();
                let topic = rt.create_entity(participant, EntityKind::Topic).unwrap();

                b.iter(|| {
                    let handles: Vec<_> = (0..num_threads)
                        .map(|_| {
                            let rt = Arc::clone(&rt);
                            thread::spawn(move || {
                                for _ in 0..1_000 {
                                    let pinned = rt.pin(topic).unwrap();
                                    black_box(pinned.handle());
                                }
                            })
                        })
                        .collect();

                    for handle in handles {
                        let _ = handle.join();
                    }
                });
            },
        );
    }

    group.finish();
}

// Benchmark 3: Create and delete a writer (register, tree insert, finalize)
fn bench_create_delete(c: &mut Criterion) {
    let rt = runtime();
    let participant = rt.create_participant(DomainRequest::Id(0)).unwrap();
    let publisher = rt.create_entity(participant, EntityKind::Publisher).unwrap();

    c.bench_function("create_delete_writer", |b| {
        b.iter(|| {
            let writer = rt.create_entity(publisher, EntityKind::Writer).unwrap();
            rt.delete(writer).unwrap();
            rt.gc().poll();
        });
    });
}

// Benchmark 4: Broadcast over a populated tree
fn bench_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast_write_batch");

    for num_writers in [16, 256].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(num_writers),
            num_writers,
            |b, &num_writers| {
                let rt = runtime();
                let participant = rt.create_participant(DomainRequest::Id(0)).unwrap();
                let publisher = rt.create_entity(participant, EntityKind::Publisher).unwrap();
                for _ in 0..num_writers {
                    rt.create_entity(publisher, EntityKind::Writer).unwrap();
                }

                let mut enable = false;
                b.iter(|| {
                    enable = !enable;
                    rt.set_write_batch(black_box(enable));
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_single_thread_pin,
    bench_contended_pin,
    bench_create_delete,
    bench_broadcast
);
criterion_main!(benches);
