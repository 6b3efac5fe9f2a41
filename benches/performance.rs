//! Performance benchmarks for state tracking and persistence.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use statesync::coalescer::group;
use statesync::{
    Change, ChangeListener, MemoryDocumentStore, PendingMutation, StateHandle, StateName,
    StateStore, StoreConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Discard;

impl ChangeListener for Discard {
    fn on_change(&self, change: Change) {
        black_box(change);
    }
}

fn nested_handle(width: usize) -> StateHandle {
    let rows: Vec<_> = (0..width).map(|i| json!({"id": i, "tags": ["a", "b"]})).collect();
    let document = json!({"rows": rows, "meta": {"owner": "bench"}})
        .as_object()
        .cloned()
        .unwrap();
    StateHandle::new(StateName::new("bench").unwrap(), document, Arc::new(Discard))
}

/// Benchmark tracked writes at increasing depth
fn bench_tracked_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("tracked_writes");

    let handle = nested_handle(100);
    group.bench_function("top_level", |b| {
        b.iter(|| handle.set("counter", black_box(1)));
    });

    let meta = handle.field("meta").unwrap();
    group.bench_function("nested_object", |b| {
        b.iter(|| meta.set("owner", black_box("someone")).unwrap());
    });

    for width in [10, 100, 1000] {
        let handle = nested_handle(width);
        let row = handle
            .field("rows")
            .unwrap()
            .element(width - 1)
            .unwrap();
        group.bench_with_input(BenchmarkId::new("last_array_element", width), &width, |b, _| {
            b.iter(|| row.set("id", black_box(0)).unwrap());
        });
    }

    group.finish();
}

/// Benchmark last-write-wins grouping of pending mutations
fn bench_grouping(c: &mut Criterion) {
    let mut bench_group = c.benchmark_group("grouping");

    for pending in [100, 1_000, 10_000] {
        let mutations: Vec<PendingMutation> = (0..pending)
            .map(|i| PendingMutation {
                state: StateName::new(format!("state_{}", i % 8)).unwrap(),
                property: format!("key_{}", i % 32),
                value: json!(i),
            })
            .collect();

        bench_group.bench_with_input(
            BenchmarkId::new("pending", pending),
            &mutations,
            |b, mutations| {
                b.iter(|| black_box(group(mutations.clone())));
            },
        );
    }

    bench_group.finish();
}

/// Benchmark a full flush to each backend
fn bench_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("flush");

    let docs = Arc::new(MemoryDocumentStore::new());
    let store = StateStore::open(StoreConfig {
        flush_interval: Duration::from_secs(3600),
        ..StoreConfig::remote(docs)
    })
    .unwrap();
    let state = store.init("remote", &json!({"n": 0, "list": []})).unwrap();
    let mut n = 0u64;
    group.bench_function("transactional", |b| {
        b.iter(|| {
            n += 1;
            state.set("n", n);
            store.flush().unwrap();
        });
    });

    let dir = TempDir::new().unwrap();
    let store = StateStore::open(StoreConfig {
        flush_interval: Duration::from_secs(3600),
        ..StoreConfig::file(dir.path())
    })
    .unwrap();
    let state = store.init("local", &json!({"n": 0, "list": []})).unwrap();
    let mut n = 0u64;
    group.bench_function("file", |b| {
        b.iter(|| {
            n += 1;
            state.set("n", n);
            store.flush().unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_tracked_writes, bench_grouping, bench_flush);
criterion_main!(benches);
