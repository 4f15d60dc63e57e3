//! Eviction under pressure (S5): a small `clean_size` but 20 MiB of CLEAN
//! pages resident drives the cache well past `SEVERE_PRESSURE`, so
//! `evict_pages` must ignore its caller-supplied limits and reclaim
//! everything unreferenced within a bounded number of calls. A held
//! reference must still block its own page without blocking the rest.

use std::sync::Arc;

use tempfile::tempdir;
use tsengine::cache::{CacheLimits, Page, PageCache};
use tsengine::datafile::TierContext;
use tsengine::types::MetricId;

const ONE_MIB: usize = 1024 * 1024;

#[test]
fn severe_pressure_reclaims_everything_unreferenced_within_bounded_iterations() {
    let dir = tempdir().unwrap();
    let ctx = TierContext::init(dir.path(), 1, 64 * 1024 * 1024, 3600).unwrap();
    let datafile = ctx.newest();

    let cache = PageCache::new(4, CacheLimits {
        clean_size: ONE_MIB,
        hot_max: ONE_MIB,
        dirty_max: ONE_MIB,
        max_dirty_per_call: 512,
    });

    // 20 MiB of CLEAN pages, each its own metric so none collide in the
    // shard index, well past any `wanted_bytes()` the 1 MiB `clean_size`
    // could justify.
    let mut held = None;
    for i in 0..20u64 {
        let metric = MetricId::new_random();
        let payload = vec![0u8; ONE_MIB];
        let page = Arc::new(Page::new_clean_from_disk(
            1,
            metric,
            i * 1000,
            i * 1000 + 1,
            0,
            payload,
            datafile.clone(),
        ));
        assert!(cache.insert_clean(page.clone()));
        if i == 0 {
            // Keep one page referenced so it must survive every pass
            // until explicitly released.
            assert!(page.try_acquire());
            held = Some(page);
        }
    }

    assert_eq!(cache.clean_len(), 20);
    assert!(
        cache.pressure_permille() >= tsengine::cache::SEVERE_PRESSURE,
        "20 MiB resident against a 1 MiB clean_size must register as severe pressure"
    );

    // First pass: the held page must be skipped, not silently dropped.
    let outcome = cache.evict_pages(1, 1, |_| true);
    assert!(outcome.skipped >= 1, "the referenced page must be reported as skipped");
    assert_eq!(cache.clean_len(), 1, "every unreferenced page reclaims in one severe-pressure pass");

    cache.release(held.as_ref().unwrap());

    let mut iterations = 0;
    while cache.clean_len() > 0 && iterations < 10 {
        cache.evict_pages(1, 1, |_| true);
        iterations += 1;
    }

    assert_eq!(cache.clean_len(), 0, "clean set must fully drain within a bounded number of passes");
    assert_eq!(cache.dirty_len(), 0);
    assert!(iterations <= 10);
}
