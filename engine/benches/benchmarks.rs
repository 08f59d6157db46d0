//! Performance benchmarks for tether-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tether_engine::{
    merge_deltas, DeltaBatch, EntityType, HlcTimestamp, HybridClock, Operation, Payload,
    SyncDelta,
};

fn update(id: u64, entity: u64, clock: &mut HybridClock) -> SyncDelta {
    SyncDelta::new(
        format!("d-{id}"),
        EntityType::Progress,
        format!("lesson-{entity}"),
        Operation::Update,
        Payload::new()
            .with("percent", id % 100)
            .with("note", "benchmark payload"),
        clock.now(1_000 + id),
    )
}

fn bench_clock(c: &mut Criterion) {
    let mut group = c.benchmark_group("clock");

    group.bench_function("now", |b| {
        let mut clock = HybridClock::new("device-1");
        let mut wall = 0u64;
        b.iter(|| {
            wall += 1;
            clock.now(black_box(wall / 3))
        })
    });

    group.bench_function("receive", |b| {
        let mut clock = HybridClock::new("device-1");
        let remote = HlcTimestamp::new(5_000, 3, "device-2");
        b.iter(|| clock.receive(black_box(&remote), black_box(4_000)))
    });

    group.bench_function("serialize_deserialize", |b| {
        let clock = HybridClock::with_state("device-1", 1_706_745_600_000, 12);
        b.iter(|| {
            let data = clock.serialize().unwrap_or_default();
            HybridClock::deserialize(black_box(&data), "device-1")
        })
    });

    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");

    group.bench_function("merge_update_update", |b| {
        let mut clock = HybridClock::new("device-1");
        let older = update(1, 1, &mut clock);
        let newer = update(2, 1, &mut clock);
        b.iter(|| merge_deltas(black_box(&older), black_box(&newer)))
    });

    for entities in [1u64, 10, 100] {
        group.bench_with_input(
            BenchmarkId::new("batch_push_1000", entities),
            &entities,
            |b, &entities| {
                b.iter(|| {
                    let mut clock = HybridClock::new("device-1");
                    let mut batch = DeltaBatch::new();
                    for i in 0..1000u64 {
                        batch.push("user-1", update(i, i % entities, &mut clock));
                    }
                    batch
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_clock, bench_merge);
criterion_main!(benches);
