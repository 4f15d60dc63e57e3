//! Concurrent query deduplication (S4): two queries against the same
//! metric's range both miss the cache and both resolve to the same
//! extent `(file_no, offset)`. Only one of them should actually perform
//! the disk read; the other must observe the single-flight guard and
//! insert nothing. Run on real OS threads (`spawn_blocking`) synchronized
//! by a barrier so the two calls into `begin_pending_read` genuinely
//! race, rather than relying on cooperative-scheduling ordering.

use std::sync::{Arc, Barrier};

use tempfile::tempdir;
use tsengine::cache::{CacheLimits, Page, PageCache, PageState};
use tsengine::datafile::migration::migrate_to_v2;
use tsengine::datafile::TierContext;
use tsengine::extent::write_extent_to_tier;
use tsengine::query::{PageDetailsCollection, QueryStats};
use tsengine::types::{CompressionAlgorithm, MetricId};

fn dirty_page(metric: MetricId, start: u64, payload: &[u8]) -> Arc<Page> {
    let page = Arc::new(Page::new_hot(1, metric, start, 1));
    page.append_samples(payload);
    page.hot_set_end_time(start + payload.len() as u64);
    page.transition_to(PageState::Dirty);
    page
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn only_one_caller_reads_a_contended_extent() {
    let dir = tempdir().unwrap();
    let ctx = TierContext::init(dir.path(), 1, 64 * 1024 * 1024, 3600).unwrap();
    let metric = MetricId::new_random();

    // Three pages for the same metric, batched into a single extent, so
    // both queries will resolve to the exact same (file_no, offset).
    let pages = vec![
        dirty_page(metric, 100, b"aaaa"),
        dirty_page(metric, 200, b"bbbb"),
        dirty_page(metric, 300, b"cccc"),
    ];
    write_extent_to_tier(&ctx, &pages, CompressionAlgorithm::Lz4).unwrap();

    let datafile = ctx.oldest().unwrap();
    migrate_to_v2(&ctx, &datafile).unwrap();

    let cache = Arc::new(PageCache::new(2, CacheLimits::default()));
    let stats = Arc::new(QueryStats::default());
    let barrier = Arc::new(Barrier::new(2));

    let mut handles = Vec::new();
    for _ in 0..2 {
        let ctx = ctx.clone();
        let cache = cache.clone();
        let stats = stats.clone();
        let barrier = barrier.clone();
        let metric = metric;
        handles.push(tokio::task::spawn_blocking(move || {
            let pdc = PageDetailsCollection::build(&ctx, &cache, 1, metric, 0, 1000);
            let epdls = pdc.route_to_epdls();
            assert_eq!(epdls.len(), 1, "all three pages share one extent");
            let epdl = epdls.into_iter().next().unwrap();

            barrier.wait();
            epdl.execute_sync(&cache, 1, CompressionAlgorithm::Lz4, &stats)
                .unwrap()
        }));
    }

    let mut inserted_counts = Vec::new();
    for handle in handles {
        inserted_counts.push(handle.await.unwrap());
    }

    inserted_counts.sort_unstable();
    assert_eq!(
        inserted_counts,
        vec![0, 3],
        "exactly one caller should perform the read and insert all 3 pages"
    );
    assert_eq!(
        stats.extent_read_errors.load(std::sync::atomic::Ordering::Relaxed),
        0
    );
}
