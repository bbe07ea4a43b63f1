//! Benchmark for driver lookup in the registry
//!
//! Target: cached `get_driver` lookups stay well under a microsecond

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::path::PathBuf;
use volume_lifecycle::drivers::{MemoryDriver, MemoryDriverConfig, MEMORY_DRIVER};
use volume_lifecycle::registry::DriverRegistry;

fn registry_with_roots(roots: usize, rt: &tokio::runtime::Runtime) -> std::sync::Arc<DriverRegistry> {
    let registry = DriverRegistry::new();
    registry
        .register(MEMORY_DRIVER, MemoryDriver::factory(MemoryDriverConfig::default()))
        .unwrap();
    rt.block_on(async {
        for i in 0..roots {
            let root = PathBuf::from(format!("/bench/root-{:04}", i));
            registry.get_driver(MEMORY_DRIVER, &root).await.unwrap();
        }
    });
    registry
}

fn bench_cached_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("driver_registry");
    group.throughput(Throughput::Elements(1));

    let rt = tokio::runtime::Runtime::new().unwrap();
    let registry = registry_with_roots(1000, &rt);

    group.bench_function("get_driver_cached", |b| {
        let mut counter = 0usize;
        b.iter(|| {
            counter += 1;
            let root = PathBuf::from(format!("/bench/root-{:04}", counter % 1000));
            rt.block_on(registry.get_driver(black_box(MEMORY_DRIVER), &root))
                .unwrap();
        });
    });

    group.bench_function("cached_probe", |b| {
        let root = PathBuf::from("/bench/root-0500");
        b.iter(|| registry.cached(black_box(&root)));
    });

    group.finish();
}

fn bench_concurrent_lookups(c: &mut Criterion) {
    let mut group = c.benchmark_group("driver_registry");
    group.throughput(Throughput::Elements(100));

    let rt = tokio::runtime::Runtime::new().unwrap();
    let registry = registry_with_roots(100, &rt);

    group.bench_function("concurrent_100_lookups", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut handles = Vec::new();
                for i in 0..100 {
                    let reg = registry.clone();
                    handles.push(tokio::spawn(async move {
                        let root = PathBuf::from(format!("/bench/root-{:04}", i));
                        let _ = reg.get_driver(MEMORY_DRIVER, &root).await;
                    }));
                }
                for handle in handles {
                    let _ = handle.await;
                }
            });
        });
    });

    group.finish();
}

criterion_group!(benches, bench_cached_lookup, bench_concurrent_lookups);
criterion_main!(benches);
