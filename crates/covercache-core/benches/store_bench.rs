//! Hot-path benchmarks for covercache-core
//!
//! Measures:
//! - TTL store get/add under the single lock
//! - Lazy load of a populated cache file
//! - Replay of a cached single-flight outcome
//!
//! Run with:
//! ```bash
//! cargo bench --bench store_bench
//! ```

use covercache_core::{ExpirationMode, FetchError, SingleFlightResource, StoreConfig, TtlStore};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use std::io::Cursor;
use std::path::PathBuf;
use std::time::Duration;

fn temp_cache_path(name: &str) -> PathBuf {
    std::env::temp_dir()
        .join("covercache-bench")
        .join(format!("{}-{}.bin", name, std::process::id()))
}

/// Store operations without a runtime (no debounce timer)
fn bench_store_ops(c: &mut Criterion) {
    let mut group = c.benchmark_group("ttl_store");

    let store: TtlStore<String> = TtlStore::new(StoreConfig::with_path(temp_cache_path("ops")));
    for i in 0..10_000 {
        store.add(format!("key-{i}"), format!("value-{i}"), ExpirationMode::OneSession);
    }

    group.bench_function("get_hit", |b| {
        b.iter(|| black_box(store.get(black_box("key-5000"))))
    });

    group.bench_function("get_miss", |b| {
        b.iter(|| black_box(store.get(black_box("absent"))))
    });

    group.bench_function("add_replace", |b| {
        b.iter(|| store.add("key-42", "replacement".to_string(), ExpirationMode::OneSession))
    });

    group.finish();
}

/// First `get` on a fresh store pays for reading the file
fn bench_lazy_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("lazy_load");
    group.measurement_time(Duration::from_secs(5));

    for count in [100, 1_000, 10_000] {
        let path = temp_cache_path(&format!("load-{count}"));
        let seed: TtlStore<String> = TtlStore::new(StoreConfig::with_path(&path));
        for i in 0..count {
            seed.add(format!("key-{i}"), "x".repeat(64), ExpirationMode::NotExpired);
        }
        seed.flush().expect("seed flush");

        group.bench_with_input(BenchmarkId::from_parameter(count), &path, |b, path| {
            b.iter(|| {
                let store: TtlStore<String> = TtlStore::new(StoreConfig::with_path(path));
                black_box(store.get("key-0"))
            })
        });
    }

    group.finish();
}

/// Subscribers after the outcome is cached
fn bench_cached_outcome(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let resource = SingleFlightResource::new(|| async {
        Ok::<_, FetchError>(Cursor::new(vec![0u8; 256 * 1024]))
    });
    rt.block_on(resource.fetch()).expect("warm fetch");

    c.bench_function("single_flight_replay", |b| {
        b.to_async(&rt).iter(|| async { black_box(resource.fetch().await.unwrap().len()) });
    });
}

criterion_group!(benches, bench_store_ops, bench_lazy_load, bench_cached_outcome);
criterion_main!(benches);
