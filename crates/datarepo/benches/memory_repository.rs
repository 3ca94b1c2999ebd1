#![allow(clippy::expect_used)]

use std::time::Duration;

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use datarepo::{DataRepository, EntityIdentifier, MemoryRepository, SearchQuery};
use serde_json::{json, Value};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn rt() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime")
}

fn make_id(prefix: &str, idx: usize) -> EntityIdentifier {
    EntityIdentifier::structured(prefix, format!("{idx:08}"))
}

fn make_document(idx: usize) -> Value {
    json!({ "name": format!("entity-{idx}"), "index": idx, "tags": ["bench", "memory"] })
}

/// Creates a repository pre-populated with `count` entities under `prefix`.
fn populated_repository(rt: &Runtime, prefix: &str, count: usize) -> MemoryRepository {
    let repo = rt.block_on(async { MemoryRepository::new() });
    rt.block_on(async {
        for i in 0..count {
            repo.create(&make_id(prefix, i), make_document(i)).await.expect("populate failed");
        }
    });
    repo
}

// ---------------------------------------------------------------------------
// 1. crud_operations
// ---------------------------------------------------------------------------

fn crud_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("crud_operations");
    let rt = rt();

    {
        let repo = populated_repository(&rt, "read", 1);
        let id = make_id("read", 0);
        group.bench_function("read_existing", |b| {
            b.to_async(&rt).iter(|| {
                let repo = repo.clone();
                let id = id.clone();
                async move {
                    repo.read(&id).await.expect("read failed");
                }
            });
        });
    }

    {
        let repo = populated_repository(&rt, "read", 1);
        let id = make_id("read", 999);
        group.bench_function("read_missing", |b| {
            b.to_async(&rt).iter(|| {
                let repo = repo.clone();
                let id = id.clone();
                async move {
                    let _ = repo.read(&id).await;
                }
            });
        });
    }

    {
        let repo = rt.block_on(async { MemoryRepository::new() });
        let id = make_id("upsert", 0);
        group.bench_function("upsert_overwrite", |b| {
            b.to_async(&rt).iter(|| {
                let repo = repo.clone();
                let id = id.clone();
                async move {
                    repo.upsert(&id, make_document(0)).await.expect("upsert failed");
                }
            });
        });
    }

    {
        let repo = rt.block_on(async { MemoryRepository::new() });
        let id = make_id("cycle", 0);
        group.bench_function("create_delete_cycle", |b| {
            b.to_async(&rt).iter(|| {
                let repo = repo.clone();
                let id = id.clone();
                async move {
                    repo.create(&id, make_document(0)).await.expect("create failed");
                    repo.delete(&id).await.expect("delete failed");
                }
            });
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// 2. list_operations
// ---------------------------------------------------------------------------

fn list_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("list_operations");
    let rt = rt();

    for &count in &[10usize, 100, 1000] {
        let repo = populated_repository(&rt, "list", count);
        let pattern = EntityIdentifier::structured("list", "*");
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("prefix_star", count), &count, |b, _| {
            b.to_async(&rt).iter(|| {
                let repo = repo.clone();
                let pattern = pattern.clone();
                async move {
                    repo.list(&pattern).await.expect("list failed");
                }
            });
        });
    }

    {
        let repo = populated_repository(&rt, "list", 1000);
        let pattern = EntityIdentifier::structured("list", "0000000?");
        group.bench_function("single_wildcard_of_1000", |b| {
            b.to_async(&rt).iter(|| {
                let repo = repo.clone();
                let pattern = pattern.clone();
                async move {
                    repo.list(&pattern).await.expect("list failed");
                }
            });
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// 3. search_operations
// ---------------------------------------------------------------------------

fn search_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("search_operations");
    let rt = rt();

    for &count in &[100usize, 1000] {
        let repo = populated_repository(&rt, "search", count);
        let query = SearchQuery::builder().query("entity-4").limit(10).build();
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("substring", count), &count, |b, _| {
            b.to_async(&rt).iter(|| {
                let repo = repo.clone();
                let query = query.clone();
                async move {
                    repo.search(&query).await.expect("search failed");
                }
            });
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// 4. coordination_operations
// ---------------------------------------------------------------------------

fn coordination_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("coordination_operations");
    let rt = rt();

    {
        let repo = rt.block_on(async { MemoryRepository::new() });
        let id = make_id("counter", 0);
        group.bench_function("atomic_increment", |b| {
            b.to_async(&rt).iter(|| {
                let repo = repo.clone();
                let id = id.clone();
                async move {
                    repo.atomic_increment(&id).await.expect("increment failed");
                }
            });
        });
    }

    {
        let repo = rt.block_on(async { MemoryRepository::new() });
        let id = make_id("lock", 0);
        group.bench_function("lock_acquire_release", |b| {
            b.to_async(&rt).iter(|| {
                let repo = repo.clone();
                let id = id.clone();
                async move {
                    let acquired =
                        repo.acquire_lock(&id, Duration::from_secs(30)).await.expect("acquire");
                    assert!(acquired);
                    repo.release_lock(&id).await.expect("release");
                }
            });
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// 5. pubsub_operations
// ---------------------------------------------------------------------------

fn pubsub_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("pubsub_operations");
    let rt = rt();

    for &subscribers in &[1usize, 8, 64] {
        let repo = rt.block_on(async { MemoryRepository::new() });
        let token = CancellationToken::new();
        let subscriptions = rt.block_on(async {
            let mut subscriptions = Vec::with_capacity(subscribers);
            for _ in 0..subscribers {
                subscriptions
                    .push(repo.subscribe("bench", token.clone()).await.expect("subscribe failed"));
            }
            subscriptions
        });
        let payload = Bytes::from_static(b"payload");

        group.throughput(Throughput::Elements(subscribers as u64));
        group.bench_with_input(BenchmarkId::new("fan_out", subscribers), &subscribers, |b, _| {
            b.to_async(&rt).iter(|| {
                let repo = repo.clone();
                let payload = payload.clone();
                async move {
                    repo.publish("bench", payload).await.expect("publish failed");
                }
            });
        });

        token.cancel();
        drop(subscriptions);
    }

    group.finish();
}

criterion_group!(
    benches,
    crud_operations,
    list_operations,
    search_operations,
    coordination_operations,
    pubsub_operations,
);
criterion_main!(benches);
