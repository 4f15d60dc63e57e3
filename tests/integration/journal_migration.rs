//! v1 -> v2 migration (S6): forces a rotation, letting the extent writer's
//! inline `migrate_to_v2_best_effort` compact the just-closed datafile's
//! v1 journal into a v2 index. Checks the v2 file's metric entries resolve
//! correctly for every metric (implying UUID-sorted order, since lookup is
//! a binary search over that table), that the recovered ranges match what
//! was written, and that the query planner resolves against v2 afterward.

use std::sync::Arc;

use tempfile::tempdir;
use tsengine::cache::{CacheLimits, Page, PageCache, PageState};
use tsengine::datafile::TierContext;
use tsengine::extent::write_extent_to_tier;
use tsengine::query::{PageDetailEntry, PageDetailsCollection};
use tsengine::types::{CompressionAlgorithm, MetricId};

fn dirty_page(metric: MetricId, start: u64, payload: &[u8]) -> Arc<Page> {
    let page = Arc::new(Page::new_hot(1, metric, start, 1));
    page.append_samples(payload);
    page.hot_set_end_time(start + payload.len() as u64);
    page.transition_to(PageState::Dirty);
    page
}

fn shrink_thresholds(ctx: &mut Arc<TierContext>) {
    let ctx_mut = Arc::get_mut(ctx).expect("tier context must not be shared yet");
    ctx_mut.target_datafiles = 4;
    ctx_mut.min_file_size = 4096;
    ctx_mut.max_file_size = 4096;
}

#[test]
fn rotation_migrates_the_closed_datafile_into_a_queryable_v2_index() {
    let dir = tempdir().unwrap();
    let mut ctx = TierContext::init(dir.path(), 1, 64 * 1024, 3600).unwrap();
    shrink_thresholds(&mut ctx);

    let metrics: Vec<MetricId> = (0..3).map(|_| MetricId::new_random()).collect();
    let payload = vec![5u8; 3000];

    // One extent holding all three metrics' pages; combined it already
    // pushes the datafile well past the shrunk 4 KiB target.
    let pages: Vec<_> = metrics
        .iter()
        .enumerate()
        .map(|(i, m)| dirty_page(*m, 1 + i as u64, &payload))
        .collect();
    write_extent_to_tier(&ctx, &pages, CompressionAlgorithm::None).unwrap();

    // A second, unrelated write observes the datafile over target and
    // rotates, which triggers the inline best-effort migration of the
    // now-closed first datafile.
    let filler = dirty_page(MetricId::new_random(), 9999, b"filler");
    write_extent_to_tier(&ctx, &[filler], CompressionAlgorithm::None).unwrap();

    assert_eq!(ctx.count(), 2, "the filler write should have rotated to a second datafile");
    let closed = ctx.oldest().unwrap();
    assert_eq!(closed.file_no, 1);
    assert!(closed.is_populated(), "migration should mark the closed datafile populated");

    let v2 = closed.v2().expect("migration should have attached a v2 index");
    assert_eq!(v2.metric_count_public(), 3);

    for (i, metric) in metrics.iter().enumerate() {
        let details = v2.lookup(*metric);
        assert_eq!(details.len(), 1, "each metric wrote exactly one page");
        assert_eq!(details[0].start_time_s, 1 + i as u32);
        assert_eq!(details[0].end_time_s, 1 + i as u32 + payload.len() as u32);
    }
    assert!(
        v2.lookup(MetricId::new_random()).is_empty(),
        "a uuid that was never written must resolve to nothing"
    );

    // Subsequent queries should resolve through v2 rather than treating
    // the metric as unknown.
    let cache = PageCache::new(2, CacheLimits::default());
    let pdc = PageDetailsCollection::build(&ctx, &cache, 1, metrics[0], 0, 10_000);
    assert_eq!(pdc.len(), 1);
    match pdc.lookup_next(0).unwrap() {
        PageDetailEntry::OnDisk { datafile, extent_offset, .. } => {
            assert_eq!(datafile.file_no, 1);
            assert_eq!(*extent_offset, v2.lookup(metrics[0])[0].datafile_offset);
        }
        PageDetailEntry::Cached(_) => panic!("page should resolve on-disk through v2, not the cache"),
    }
}
