//! Retention Controller (§4.7): tracks per-tier disk/time quota usage and
//! decides when to rotate (delete the oldest datafile). Grounded on the
//! vacuum report/options shape and structured-event-name tracing style of
//! `src/admin/vacuum.rs`, generalized from a one-shot compaction job to a
//! continuously-evaluated quota check, and supplemented (per
//! `original_source/`) with per-mille usage gauges mirroring the original
//! engine's retention telemetry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::cache::PageCache;
use crate::datafile::{AcquireReason, TierContext};
use crate::error::Result;
use crate::registry::MetricRegistry;
use crate::types::TimeUsec;

const DELETION_SPIN_ATTEMPTS: u32 = 10;
const DELETION_SPIN_SLEEP: std::time::Duration = std::time::Duration::from_secs(1);

/// Wall-clock "now" in the same microsecond unit callers use for sample
/// timestamps (§6), used only by the time-based retention axis — the only
/// place in this engine that interprets `TimeUsec` as real time rather
/// than an opaque, caller-supplied counter.
fn now_usec() -> TimeUsec {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Per-axis usage, expressed per-mille like the page cache's pressure
/// gauge, surfaced through `Engine::stats()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionGauges {
    pub disk_permille: u32,
    pub time_permille: u32,
}

/// Outcome of one deletion sweep.
#[derive(Debug, Default)]
pub struct RotationReport {
    pub deleted_file_no: Option<u32>,
    pub bytes_reclaimed: u64,
    pub still_over_quota: bool,
}

/// Single-inflight guard: only one rotation may run per tier at a time
/// (§4.7 "single inflight rotation guarded by `now_deleting_files`").
pub struct RetentionController {
    now_deleting: AtomicBool,
    disk_space_estimate: AtomicU64,
}

impl Default for RetentionController {
    fn default() -> Self {
        RetentionController {
            now_deleting: AtomicBool::new(false),
            disk_space_estimate: AtomicU64::new(0),
        }
    }
}

impl RetentionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// `exceeded_disk_quota = disk_space + target_file_size - newest_pos >
    /// max_disk_space`, OR'd with the time axis: `now - first_time >
    /// max_retention_time` (§4.7, Glossary "data within `max_disk_space`
    /// OR `max_retention_time`, whichever triggers first"). Returns the
    /// per-mille gauges regardless of whether quota is exceeded, so
    /// callers can publish them every tick.
    pub fn evaluate(&self, ctx: &TierContext) -> (bool, RetentionGauges) {
        let disk_space = ctx.disk_bytes();
        let max_disk_space = ctx.max_disk_space.load(Ordering::Relaxed);
        let newest_pos = ctx.newest().pos();
        let target = ctx.target_file_size();

        let projected = disk_space
            .saturating_add(target)
            .saturating_sub(newest_pos);
        let exceeded_disk = projected > max_disk_space && ctx.count() >= 3;

        let disk_permille = if max_disk_space == 0 {
            0
        } else {
            ((disk_space as u128 * 1000) / max_disk_space as u128) as u32
        };

        let max_retention_seconds = ctx.max_retention_seconds.load(Ordering::Relaxed);
        let (exceeded_time, time_permille) = match ctx.earliest_surviving_time() {
            Some(first_time) if max_retention_seconds > 0 => {
                let now_usec = now_usec();
                let age_seconds = now_usec.saturating_sub(first_time) / 1_000_000;
                let exceeded = age_seconds > max_retention_seconds && ctx.count() >= 3;
                let permille = ((age_seconds as u128 * 1000) / max_retention_seconds as u128)
                    .min(1000) as u32;
                (exceeded, permille)
            }
            _ => (false, 0),
        };

        (
            exceeded_disk || exceeded_time,
            RetentionGauges {
                disk_permille,
                time_permille,
            },
        )
    }

    /// Deletion sequence (§4.7): find the oldest datafile, spin-wait for
    /// exclusive deletion rights, recompute affected metrics' `first_time`,
    /// delete v2 then v1 then the `.ndf` file, and report whether another
    /// rotation is still needed.
    pub async fn rotate(
        &self,
        ctx: &Arc<TierContext>,
        cache: &PageCache,
        registry: &MetricRegistry,
    ) -> Result<RotationReport> {
        if self
            .now_deleting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(RotationReport::default());
        }
        let _guard = scopeguard(&self.now_deleting);

        let Some(oldest) = ctx.oldest() else {
            return Ok(RotationReport::default());
        };

        oldest.acquire(AcquireReason::Retention);
        let mut acquired_exclusively = false;
        for _ in 0..DELETION_SPIN_ATTEMPTS {
            oldest.release(AcquireReason::Retention);
            if !oldest.is_referenced() {
                acquired_exclusively = true;
                break;
            }
            oldest.acquire(AcquireReason::Retention);
            tokio::time::sleep(DELETION_SPIN_SLEEP).await;
        }

        if !acquired_exclusively {
            warn!(file_no = oldest.file_no, "retention: datafile still referenced, deferring rotation");
            return Ok(RotationReport {
                still_over_quota: true,
                ..Default::default()
            });
        }

        cache.evict_clean_pages_of_datafile(&oldest);

        let v2_path = ctx.v2_path(oldest.file_no);
        let v1_path = ctx.v1_path(oldest.file_no);
        let bytes_before = std::fs::metadata(oldest.path())
            .map(|m| m.len())
            .unwrap_or(0);

        if v2_path.exists() {
            std::fs::remove_file(&v2_path)?;
        }
        if v1_path.exists() {
            std::fs::remove_file(&v1_path)?;
        }
        std::fs::remove_file(oldest.path())?;
        ctx.drop_oldest();

        // First-time recalculation (§4.7): for every interned metric,
        // recompute `first_time` from the closest surviving page across the
        // remaining datafiles' v2 indices and the open cache. The registry
        // itself only ever widens envelopes on ingest, so this is the sole
        // path allowed to move `first_time` forward.
        recalculate_first_times(ctx, cache, registry);

        info!(
            file_no = oldest.file_no,
            bytes_reclaimed = bytes_before,
            "retention.rotate.completed"
        );

        let (still_over, _) = self.evaluate(ctx);
        Ok(RotationReport {
            deleted_file_no: Some(oldest.file_no),
            bytes_reclaimed: bytes_before,
            still_over_quota: still_over,
        })
    }
}

/// Recomputes `first_time` for every interned metric from the closest
/// surviving page across the tier's remaining v2 indices and the open
/// cache. Metrics with no surviving data are left untouched.
fn recalculate_first_times(ctx: &TierContext, cache: &PageCache, registry: &MetricRegistry) {
    let datafiles = ctx.datafiles_snapshot();
    for handle in registry.all_handles() {
        let mut closest: Option<TimeUsec> = None;
        for page in cache.overlapping(handle.section, handle.uuid, 0, TimeUsec::MAX) {
            closest = Some(closest.map_or(page.start_time, |m| m.min(page.start_time)));
        }
        for datafile in &datafiles {
            let Some(v2) = datafile.v2() else { continue };
            for detail in v2.lookup(handle.uuid) {
                let start = detail.start_time_s as u64;
                closest = Some(closest.map_or(start, |m| m.min(start)));
            }
        }
        if let Some(new_first) = closest {
            handle.recalculate_first_time(new_first);
        }
    }
}

struct ScopeGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

fn scopeguard(flag: &AtomicBool) -> ScopeGuard<'_> {
    ScopeGuard { flag }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheLimits;
    use tempfile::tempdir;

    #[tokio::test]
    async fn rotation_deletes_oldest_when_three_or_more_datafiles() {
        let dir = tempdir().unwrap();
        let ctx = TierContext::init(dir.path(), 1, 1, 3600).unwrap();
        ctx.create_new_datafile(2).unwrap();
        ctx.create_new_datafile(3).unwrap();

        let cache = PageCache::new(2, CacheLimits::default());
        let registry = MetricRegistry::new(2);
        let controller = RetentionController::new();

        let report = controller.rotate(&ctx, &cache, &registry).await.unwrap();
        assert_eq!(report.deleted_file_no, Some(1));
        assert_eq!(ctx.count(), 2);
    }

    #[test]
    fn time_quota_exceeded_even_with_slack_disk_space() {
        use crate::cache::{Page, PageState};
        use crate::datafile::migration::migrate_to_v2;
        use crate::extent::write_extent_to_tier;
        use crate::types::{CompressionAlgorithm, MetricId};

        let dir = tempdir().unwrap();
        // Generous disk quota: the disk axis alone would never trigger.
        let ctx = TierContext::init(dir.path(), 1, 1024 * 1024 * 1024, 1).unwrap();
        let metric = MetricId::new_random();

        let page = Arc::new(Page::new_hot(1, metric, 100, 1));
        page.append_samples(b"abcd");
        page.hot_set_end_time(104);
        page.transition_to(PageState::Dirty);
        write_extent_to_tier(&ctx, &[page], CompressionAlgorithm::Lz4).unwrap();
        let closed = ctx.oldest().unwrap();
        migrate_to_v2(&ctx, &closed).unwrap();

        ctx.create_new_datafile(2).unwrap();
        ctx.create_new_datafile(3).unwrap();

        let controller = RetentionController::new();
        let (exceeded, gauges) = controller.evaluate(&ctx);
        assert!(exceeded, "a 1-second retention window is long past for a synthetic start_time of 100");
        assert_eq!(gauges.time_permille, 1000);
    }

    #[test]
    fn time_quota_not_exceeded_without_a_migrated_v2_index() {
        let dir = tempdir().unwrap();
        let ctx = TierContext::init(dir.path(), 1, 1024 * 1024 * 1024, 1).unwrap();
        let controller = RetentionController::new();
        let (exceeded, gauges) = controller.evaluate(&ctx);
        assert!(!exceeded);
        assert_eq!(gauges.time_permille, 0);
    }
}
