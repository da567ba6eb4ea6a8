//! Async cache benchmarks
//!
//! Run with: `cargo bench --bench cache`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures::future::join_all;
use sitzung::cache::{AsyncCache, CacheMode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn counting_cache() -> AsyncCache<u64, String> {
    let fetches = Arc::new(AtomicU64::new(0));
    AsyncCache::new(move |key: u64| {
        let fetches = Arc::clone(&fetches);
        async move {
            fetches.fetch_add(1, Ordering::Relaxed);
            Ok(format!("value_{}", key))
        }
    })
}

fn bench_get_hit(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("cache_get_hit");

    for size in [100u64, 10_000] {
        let cache = counting_cache();
        rt.block_on(async {
            for key in 0..size {
                cache.get_or_wait(&key, CacheMode::ReadWrite).await.unwrap();
            }
        });

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("get_or_wait", size), &size, |b, &size| {
            let mut counter = 0u64;
            b.to_async(&rt).iter(|| {
                let key = counter % size;
                counter = counter.wrapping_add(1);
                let cache = cache.clone();
                async move {
                    black_box(cache.get_or_wait(&key, CacheMode::ReadWrite).await.unwrap());
                }
            });
        });
        group.bench_with_input(BenchmarkId::new("get_if_cached", size), &size, |b, &size| {
            let mut counter = 0u64;
            b.iter(|| {
                let key = counter % size;
                counter = counter.wrapping_add(1);
                black_box(cache.get_if_cached(black_box(&key)));
            });
        });
    }

    group.finish();
}

fn bench_concurrent_miss(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("cache_concurrent_miss");

    for callers in [8usize, 64] {
        group.throughput(Throughput::Elements(callers as u64));
        group.bench_with_input(BenchmarkId::from_parameter(callers), &callers, |b, &callers| {
            b.to_async(&rt).iter(|| async move {
                let cache = counting_cache();
                let waits = (0..callers).map(|_| cache.get_or_wait(&1, CacheMode::ReadWrite));
                black_box(join_all(waits).await);
            });
        });
    }

    group.finish();
}

fn bench_refresh(c: &mut Criterion) {
    let rt = runtime();
    let cache = counting_cache();
    rt.block_on(cache.get_or_wait(&0, CacheMode::ReadWrite)).unwrap();

    c.bench_function("cache_refresh", |b| {
        b.to_async(&rt).iter(|| {
            let cache = cache.clone();
            async move {
                black_box(cache.refresh(&0).await.unwrap());
            }
        });
    });
}

criterion_group!(benches, bench_get_hit, bench_concurrent_miss, bench_refresh);
criterion_main!(benches);
