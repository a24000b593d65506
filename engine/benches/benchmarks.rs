//! Performance benchmarks for workspot-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use workspot_engine::{
    BoundingBox, Coordinate, MutationPatch, MutationQueue, MutationRequest, PendingMutation,
    SpatialIndex,
};

fn grid(n: usize) -> Vec<(String, Coordinate)> {
    let side = (n as f64).sqrt().ceil() as usize;
    (0..n)
        .map(|i| {
            let lat = 45.0 + (i / side) as f64 * 0.001;
            let lon = 9.0 + (i % side) as f64 * 0.001;
            (format!("ws-{i}"), Coordinate { lat, lon })
        })
        .collect()
}

fn bench_spatial_index(c: &mut Criterion) {
    let mut group = c.benchmark_group("spatial_index");

    for size in [100usize, 1_000, 10_000] {
        let entries = grid(size);

        group.bench_with_input(BenchmarkId::new("bulk_load", size), &entries, |b, e| {
            b.iter(|| SpatialIndex::bulk_load(black_box(e.clone())))
        });

        let index = SpatialIndex::bulk_load(entries.clone());
        let center = Coordinate { lat: 45.02, lon: 9.02 };
        group.bench_with_input(BenchmarkId::new("nearby_1km", size), &index, |b, index| {
            b.iter(|| index.nearby(black_box(center), black_box(1_000.0)))
        });

        let bounds = BoundingBox::new(45.01, 9.01, 45.03, 9.03).unwrap();
        group.bench_with_input(BenchmarkId::new("within_bounds", size), &index, |b, index| {
            b.iter(|| index.within_bounds(black_box(&bounds)))
        });
    }

    group.bench_function("upsert_move", |b| {
        let mut index = SpatialIndex::bulk_load(grid(1_000));
        let mut flip = false;
        b.iter(|| {
            flip = !flip;
            let lat = if flip { 45.5 } else { 45.0 };
            index.upsert(black_box("ws-10"), Coordinate { lat, lon: 9.0 });
        })
    });

    group.finish();
}

fn bench_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("mutation_queue");

    group.bench_function("enqueue_dequeue_1000", |b| {
        b.iter(|| {
            let mut queue = MutationQueue::new();
            for i in 0..1_000u64 {
                queue.enqueue(PendingMutation::new(
                    format!("m-{i}"),
                    MutationRequest::update(format!("ws-{}", i % 50), MutationPatch::saved(true)),
                    i,
                    None,
                ));
            }
            while queue.dequeue().is_some() {}
        })
    });

    group.finish();
}

criterion_group!(benches, bench_spatial_index, bench_queue);
criterion_main!(benches);
