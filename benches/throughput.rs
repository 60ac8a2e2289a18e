//! Throughput benchmarks for vidpipe schedulers and edges.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use std::thread;
use vidpipe::edge::BoundedEdge;
use vidpipe::prelude::*;
use vidpipe::stages::Collected;

fn counter(limit: u64) -> FnSource<u64, impl FnMut() -> Emit<u64> + Send + 'static> {
    let mut n = 0;
    FnSource::new(move || {
        n += 1;
        if n <= limit { Emit::Value(n) } else { Emit::Done }
    })
}

fn chain_sync(frames: u64, depth: usize) -> (SyncPipeline, Collected<u64>) {
    let (sink, seen) = Collector::<u64>::new();
    let mut p = SyncPipeline::with_config("bench", SyncConfig::quiet());
    let mut prev = p.add("source", counter(frames)).unwrap();
    let mut port = "value";
    for i in 0..depth {
        let id = p
            .add(format!("map{i}"), FnMap::new(|x: u64| Emit::Value(x + 1)))
            .unwrap();
        p.connect(prev, port, id, "input").unwrap();
        prev = id;
        port = "output";
    }
    let dst = p.add("sink", sink).unwrap();
    p.connect(prev, port, dst, "value").unwrap();
    p.initialize().unwrap();
    (p, seen)
}

fn chain_async(frames: u64, depth: usize, capacity: usize) -> (AsyncPipeline, Collected<u64>) {
    let (sink, seen) = Collector::<u64>::new();
    let mut p = AsyncPipeline::with_config(
        "bench",
        AsyncConfig::default()
            .with_edge_capacity(capacity)
            .with_detailed_report(false),
    );
    let mut prev = p.add("source", counter(frames)).unwrap();
    let mut port = "value";
    for i in 0..depth {
        let id = p
            .add(format!("map{i}"), FnMap::new(|x: u64| Emit::Value(x + 1)))
            .unwrap();
        p.connect(prev, port, id, "input").unwrap();
        prev = id;
        port = "output";
    }
    let dst = p.add("sink", sink).unwrap();
    p.connect(prev, port, dst, "value").unwrap();
    p.initialize().unwrap();
    (p, seen)
}

fn bench_edge_handoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("edge_handoff");
    let frames = 10_000u64;

    for capacity in [1usize, 16, 256].iter() {
        group.throughput(Throughput::Elements(frames));
        group.bench_with_input(
            BenchmarkId::from_parameter(capacity),
            capacity,
            |b, &capacity| {
                b.iter(|| {
                    let edge = Arc::new(BoundedEdge::<u64>::new(capacity));
                    thread::scope(|s| {
                        s.spawn(|| {
                            for i in 0..frames {
                                edge.publish(ExecutionStatus::Success, Some(i));
                            }
                            edge.publish(ExecutionStatus::Failure, None);
                        });
                        let mut count = 0u64;
                        while edge.consume().status == ExecutionStatus::Success {
                            count += 1;
                        }
                        black_box(count)
                    })
                });
            },
        );
    }

    group.finish();
}

fn bench_sync_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync_chain");
    let frames = 1_000u64;

    for depth in [1usize, 4, 16].iter() {
        group.throughput(Throughput::Elements(frames));
        group.bench_with_input(BenchmarkId::new("depth", depth), depth, |b, &depth| {
            b.iter(|| {
                let (mut p, seen) = chain_sync(frames, depth);
                black_box(p.run());
                black_box(seen.lock().map(|v| v.len()).unwrap_or_default())
            });
        });
    }

    group.finish();
}

fn bench_async_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("async_chain");
    group.sample_size(20);
    let frames = 1_000u64;

    for (depth, capacity) in [(1usize, 10usize), (4, 10), (4, 1)].iter() {
        group.throughput(Throughput::Elements(frames));
        group.bench_with_input(
            BenchmarkId::new("depth_capacity", format!("{}x{}", depth, capacity)),
            &(*depth, *capacity),
            |b, &(depth, capacity)| {
                b.iter(|| {
                    let (mut p, seen) = chain_async(frames, depth, capacity);
                    p.run().unwrap();
                    black_box(seen.lock().map(|v| v.len()).unwrap_or_default())
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_edge_handoff, bench_sync_chain, bench_async_chain);

criterion_main!(benches);
