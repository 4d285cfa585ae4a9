//! Performance benchmarks for the Redis backend
//!
//! This benchmark suite measures:
//! - Redis backend operations (set, get, delete)
//! - Pipelined batch operations (mget, mdelete)
//! - Lock scripts (EVALSHA acquire + release)
//! - Read-through via `Cache::get_set` against Redis
//!
//! Prerequisites:
//! - Redis running on localhost:6379 (override with `REDIS_HOST`/`REDIS_PORT`)
//! - Run with: cargo bench --bench redis_benchmark --features redis
//! - View results: open target/criterion/report/index.html

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lease_cache::backend::{KeyValueBackend, RedisBackend, RedisConfig};
use lease_cache::{Cache, Produced};
use std::hint::black_box;
use std::time::Duration;

// ============================================================================
// Redis Backend Setup
// ============================================================================

/// Create a Redis backend for benchmarking.
///
/// Connection settings come from the `REDIS_*` environment variables, see
/// [`RedisConfig::from_env`].
async fn setup_redis() -> RedisBackend {
    let backend = RedisBackend::new(RedisConfig::from_env())
        .await
        .expect("Failed to connect to Redis. Make sure Redis is running.");
    backend.load_scripts().await.expect("Failed to load lock scripts");
    backend
}

// ============================================================================
// Group 1: Redis Basic Operations
// ============================================================================

fn redis_basic_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("redis_backend");
    group.sample_size(50); // Fewer samples due to network latency

    let rt = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    let backend = rt.block_on(setup_redis());

    for size in [100, 1_000, 10_000, 100_000].iter() {
        group
            .throughput(Throughput::Bytes(*size as u64))
            .bench_with_input(BenchmarkId::new("set", size), size, |b, &size| {
                let value = vec![1u8; size];

                b.to_async(&rt).iter(|| async {
                    backend
                        .set(
                            black_box("redis_bench_key"),
                            black_box(value.clone()),
                            Some(Duration::from_secs(60)),
                        )
                        .await
                        .expect("Failed to set")
                });
            });

        group
            .throughput(Throughput::Bytes(*size as u64))
            .bench_with_input(BenchmarkId::new("get_hit", size), size, |b, &size| {
                rt.block_on(async {
                    backend
                        .set("redis_bench_hit", vec![1u8; size], Some(Duration::from_secs(60)))
                        .await
                        .expect("Failed to set");
                });

                b.to_async(&rt)
                    .iter(|| async { backend.get(black_box("redis_bench_hit")).await });
            });
    }

    group.bench_function("get_miss", |b| {
        b.to_async(&rt)
            .iter(|| async { backend.get(black_box("redis_bench_missing")).await });
    });

    group.bench_function("delete", |b| {
        b.to_async(&rt).iter(|| async {
            backend
                .set("redis_bench_delete", vec![1u8; 100], None)
                .await
                .expect("Failed to set");
            backend.delete(black_box("redis_bench_delete")).await
        });
    });

    group.finish();
}

// ============================================================================
// Group 2: Pipelined Batch Operations
// ============================================================================

fn redis_batch_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("redis_batch_ops");
    group.sample_size(30);

    let rt = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    let backend = rt.block_on(setup_redis());

    for batch_size in [10, 100].iter() {
        let keys: Vec<String> = (0..*batch_size)
            .map(|i| format!("redis_mget_key_{}", i))
            .collect();
        rt.block_on(async {
            let entries = keys.iter().map(|k| (k.clone(), vec![1u8; 100])).collect();
            backend
                .mset(entries, Some(Duration::from_secs(60)))
                .await
                .expect("Failed to mset");
        });

        group
            .throughput(Throughput::Elements(*batch_size as u64))
            .bench_with_input(BenchmarkId::new("mget", batch_size), &keys, |b, keys| {
                let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
                b.to_async(&rt).iter(|| async {
                    backend.mget(black_box(&key_refs)).await.expect("Failed to mget")
                });
            });

        group
            .throughput(Throughput::Elements(*batch_size as u64))
            .bench_with_input(BenchmarkId::new("mdelete", batch_size), &keys, |b, keys| {
                let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
                b.to_async(&rt).iter(|| async {
                    backend
                        .mdelete(black_box(&key_refs))
                        .await
                        .expect("Failed to mdelete")
                });
            });
    }

    group.finish();
}

// ============================================================================
// Group 3: Locks and Read-through
// ============================================================================

fn redis_facade_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("redis_facade");
    group.sample_size(30);

    let rt = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    let cache = Cache::new(rt.block_on(setup_redis())).with_prefix("bench");

    // Measures: EVALSHA acquire + watcher spawn + EVALSHA release
    group.bench_function("lock_acquire_release", |b| {
        b.to_async(&rt).iter(|| async {
            let mut lock = cache.lock(black_box("bench-lock"), Duration::from_secs(30));
            lock.acquire().await.expect("Failed to acquire");
            lock.release().await.expect("Failed to release")
        });
    });

    group.bench_function("get_set_hit", |b| {
        rt.block_on(async {
            cache
                .set("hot", vec![7u8; 1_000], Duration::from_secs(60))
                .await
                .expect("Failed to populate cache");
        });

        b.to_async(&rt).iter(|| async {
            cache
                .get_set(black_box("hot"), || async { Ok(Produced::no_data()) })
                .await
        });
    });

    group.finish();
}

// ============================================================================
// Benchmark Registration
// ============================================================================

criterion_group!(
    benches,
    redis_basic_benchmarks,
    redis_batch_benchmarks,
    redis_facade_benchmarks
);
criterion_main!(benches);
