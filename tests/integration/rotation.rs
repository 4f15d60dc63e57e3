//! Rotation under disk quota pressure (S2): shrinks a `TierContext`'s file
//! size thresholds directly so a handful of small extents is enough to
//! force several rotations, then drives the retention controller and
//! checks deletion order and the `first_time` recalculation pass.

use std::sync::Arc;

use tempfile::tempdir;
use tsengine::cache::{CacheLimits, Page, PageCache, PageState};
use tsengine::datafile::TierContext;
use tsengine::extent::write_extent_to_tier;
use tsengine::registry::MetricRegistry;
use tsengine::retention::RetentionController;
use tsengine::types::{CompressionAlgorithm, MetricId};

fn dirty_page(metric: MetricId, start: u64, payload: &[u8]) -> Arc<Page> {
    let page = Arc::new(Page::new_hot(1, metric, start, 1));
    page.append_samples(payload);
    page.hot_set_end_time(start + payload.len() as u64);
    page.transition_to(PageState::Dirty);
    page
}

/// Forces `target_file_size()` down to a fixed 4 KiB regardless of
/// `max_disk_space`, so a single uncompressed extent crosses it. Only
/// valid while `ctx`'s refcount is still 1, i.e. right after `init`.
fn shrink_thresholds(ctx: &mut Arc<TierContext>) {
    let ctx_mut = Arc::get_mut(ctx).expect("tier context must not be shared yet");
    ctx_mut.target_datafiles = 4;
    ctx_mut.min_file_size = 4096;
    ctx_mut.max_file_size = 4096;
}

#[tokio::test]
async fn oldest_datafile_is_deleted_once_quota_is_exceeded() {
    let dir = tempdir().unwrap();
    let mut ctx = TierContext::init(dir.path(), 1, 8 * 1024, 3600).unwrap();
    shrink_thresholds(&mut ctx);

    let cache = PageCache::new(2, CacheLimits::default());
    let registry = MetricRegistry::new(2);
    let controller = RetentionController::new();
    let metric = MetricId::new_random();

    // Uncompressed so the extent size is deterministic: 3000 bytes of
    // payload plus header/trailer rounds up to one 4 KiB block, just over
    // the shrunk target, so every write after the first forces a rotation.
    let payload = vec![7u8; 3000];
    for i in 0..6u64 {
        let page = dirty_page(metric, 1 + i * 100, &payload);
        write_extent_to_tier(&ctx, &[page], CompressionAlgorithm::None).unwrap();
    }

    assert!(
        ctx.count() >= 3,
        "expected several datafiles from repeated rotation, got {}",
        ctx.count()
    );

    let first_oldest = ctx.oldest().unwrap().file_no;
    let (exceeded, _) = controller.evaluate(&ctx);
    assert!(exceeded, "disk usage should exceed the shrunk quota with 3+ datafiles");

    let report = controller.rotate(&ctx, &cache, &registry).await.unwrap();
    assert_eq!(report.deleted_file_no, Some(first_oldest));
    assert!(ctx.oldest().unwrap().file_no > first_oldest);
}

#[tokio::test]
async fn first_time_advances_monotonically_across_rotations() {
    let dir = tempdir().unwrap();
    let mut ctx = TierContext::init(dir.path(), 1, 8 * 1024, 3600).unwrap();
    shrink_thresholds(&mut ctx);

    let cache = PageCache::new(2, CacheLimits::default());
    let registry = MetricRegistry::new(2);
    let controller = RetentionController::new();
    let metric = MetricId::new_random();

    let payload = vec![9u8; 3000];
    let mut start = 1u64;
    for _ in 0..8u64 {
        let page = dirty_page(metric, start, &payload);
        write_extent_to_tier(&ctx, &[page], CompressionAlgorithm::None).unwrap();
        start += 100;
    }

    let handle = registry.get_and_acquire(1, metric);
    handle.set_first_time(1);
    handle.set_latest_time(start);
    registry.release(&handle);

    let mut last_first_time = handle.first_time();
    let mut rotated_at_least_once = false;
    for _ in 0..4 {
        let (exceeded, _) = controller.evaluate(&ctx);
        if !exceeded {
            break;
        }
        let report = controller.rotate(&ctx, &cache, &registry).await.unwrap();
        if report.deleted_file_no.is_none() {
            break;
        }
        rotated_at_least_once = true;
        let new_first_time = handle.first_time();
        assert!(
            new_first_time >= last_first_time,
            "first_time must never move backwards across a rotation"
        );
        last_first_time = new_first_time;
    }
    assert!(rotated_at_least_once, "expected at least one rotation to run");
}
