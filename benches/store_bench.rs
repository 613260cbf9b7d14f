use criterion::{criterion_group, criterion_main, Criterion};
use nowdb::sort::{mem_merge, EdgeCmp};
use nowdb::types::{Content, Edge, EDGE_SIZE, PAGE_SIZE};
use nowdb::{Store, StoreConfig};
use rand::prelude::*;
use tempfile::TempDir;

fn edge(rng: &mut ThreadRng) -> Edge {
    Edge {
        edge: rng.gen_range(1..1000),
        origin: rng.gen_range(1..100),
        destin: rng.gen_range(1..100),
        label: 1,
        timestamp: rng.gen_range(0..1_000_000),
        ..Edge::default()
    }
}

fn insert_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");

    group.bench_function("edges", |b| {
        b.iter_batched(
            || {
                let temp_dir = TempDir::new().unwrap();
                let store = Store::create(
                    &temp_dir.path().join("bench"),
                    &StoreConfig::new("bench", Content::Edge),
                )
                .unwrap();
                (temp_dir, store)
            },
            |(_dir, store)| {
                let mut rng = thread_rng();
                for _ in 0..1000 {
                    store.insert(&edge(&mut rng).to_bytes()).unwrap();
                }
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn sort_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("sort");

    group.bench_function("mem_merge_64p", |b| {
        b.iter_batched(
            || {
                let mut rng = thread_rng();
                let mut buf = vec![0u8; 64 * PAGE_SIZE];
                for rec in buf.chunks_mut(EDGE_SIZE) {
                    edge(&mut rng).write_to(rec);
                }
                buf
            },
            |mut buf| {
                mem_merge(&mut buf, PAGE_SIZE, EDGE_SIZE, &EdgeCmp::asc()).unwrap();
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, insert_bench, sort_bench);
criterion_main!(benches);
