//! Criterion micro-benchmarks for the coordination hot paths.
//!
//! - Range assignment over growing groups
//! - Key routing (murmur2 + modulo)
//! - Lease-state lookups through the owned view
//!
//! Run with: `cargo bench --bench assignment_bench`

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use dashmap::DashMap;
use partition_groups::FencingToken;
use partition_groups::group::assign_partitions;
use partition_groups::router::{murmur2, partition_for_key};

fn bench_assignment(c: &mut Criterion) {
    let mut group = c.benchmark_group("assign_partitions");

    for members in [2usize, 16, 128].iter() {
        let ids: Vec<String> = (0..*members).map(|i| format!("member-{:04}", i)).collect();
        let mut reversed = ids.clone();
        reversed.reverse();

        group.bench_with_input(BenchmarkId::new("sorted", members), &ids, |b, ids| {
            b.iter(|| assign_partitions(black_box(ids), 256));
        });
        group.bench_with_input(BenchmarkId::new("reversed", members), &reversed, |b, ids| {
            b.iter(|| assign_partitions(black_box(ids), 256));
        });
    }
    group.finish();

    c.bench_function("partitions_for_member", |b| {
        let ids: Vec<String> = (0..64).map(|i| format!("member-{:04}", i)).collect();
        let assignment = assign_partitions(&ids, 1024);
        b.iter(|| assignment.partitions_for(black_box("member-0031")));
    });
}

fn bench_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing");

    for size in [8usize, 64, 512].iter() {
        let key = "k".repeat(*size);
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("murmur2", size), &key, |b, key| {
            b.iter(|| murmur2(black_box(key.as_bytes())));
        });
    }
    group.finish();

    c.bench_function("partition_for_key", |b| {
        b.iter(|| partition_for_key(black_box("customer-000042"), black_box(12)));
    });
}

fn bench_owned_view(c: &mut Criterion) {
    let owned: DashMap<u32, FencingToken> = (0..64).map(|p| (p, FencingToken::new(p as u64))).collect();

    c.bench_function("owned_view_hit", |b| {
        b.iter(|| owned.get(&black_box(17)).map(|t| *t == FencingToken::new(17)));
    });
    c.bench_function("owned_view_miss", |b| {
        b.iter(|| owned.get(&black_box(99)).is_some());
    });
}

criterion_group!(benches, bench_assignment, bench_routing, bench_owned_view);
criterion_main!(benches);
