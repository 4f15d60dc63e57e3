//! Page cache microbenchmarks: add/acquire throughput, HOT -> DIRTY ->
//! CLEAN flush, and eviction under pressure.
//!
//! Run with: cargo bench --bench page_cache

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tsengine::cache::{CacheLimits, LookupMode, PageCache};
use tsengine::types::MetricId;

const SECTION: u64 = 0;

fn populated_cache(hot_pages: usize) -> (PageCache, Vec<MetricId>) {
    let cache = PageCache::new(8, CacheLimits::default());
    let mut metrics = Vec::with_capacity(hot_pages);
    for i in 0..hot_pages {
        let metric = MetricId::new_random();
        let (page, added) = cache.add_and_acquire(SECTION, metric, 1, 1);
        assert!(added, "fresh start_time cannot collide");
        page.append_samples(&(i as f64).to_le_bytes());
        cache.hot_set_end_time(&page, 2);
        cache.release(&page);
        metrics.push(metric);
    }
    (cache, metrics)
}

fn dirty_cache(dirty_pages: usize) -> PageCache {
    let (cache, metrics) = populated_cache(dirty_pages);
    for metric in metrics {
        let page = cache
            .get_and_acquire(SECTION, metric, 1, LookupMode::ClosestLe)
            .unwrap();
        let dup = cache.dup(&page).unwrap();
        cache.hot_to_dirty_and_release(dup);
        cache.release(&page);
    }
    cache
}

fn bench_add_and_acquire(c: &mut Criterion) {
    let mut group = c.benchmark_group("page_cache_add");
    group.sample_size(50);

    group.bench_function("add_and_acquire", |b| {
        b.iter_batched(
            || PageCache::new(8, CacheLimits::default()),
            |cache| {
                let metric = MetricId::new_random();
                let (page, _) = cache.add_and_acquire(SECTION, black_box(metric), 1, 1);
                cache.release(&page);
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn bench_get_and_acquire(c: &mut Criterion) {
    let mut group = c.benchmark_group("page_cache_get");
    group.sample_size(50);
    let (cache, metrics) = populated_cache(1_000);

    group.bench_function("get_and_acquire_hit", |b| {
        let mut i = 0usize;
        b.iter(|| {
            let metric = metrics[i % metrics.len()];
            i += 1;
            let page = cache
                .get_and_acquire(SECTION, black_box(metric), 1, LookupMode::ClosestLe)
                .unwrap();
            cache.release(&page);
        });
    });

    group.finish();
}

fn bench_flush_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("page_cache_flush");
    group.sample_size(20);

    group.bench_function("flush_pages_noop_writer", |b| {
        b.iter_batched(
            || dirty_cache(256),
            |cache| {
                let outcome = cache.flush_pages(64, |_batch| Ok(()));
                black_box(outcome.flushed);
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn bench_pressure_permille(c: &mut Criterion) {
    let mut group = c.benchmark_group("page_cache_pressure");
    let (cache, _metrics) = populated_cache(512);

    group.bench_function("pressure_permille", |b| {
        b.iter(|| black_box(cache.pressure_permille()));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_add_and_acquire,
    bench_get_and_acquire,
    bench_flush_cycle,
    bench_pressure_permille
);
criterion_main!(benches);
