//! v1 -> v2 migration (§4.3 "journal v2 lifecycle", `JOURNAL_FILE_INDEX`):
//! once a datafile stops accepting writes, its v1 write-ahead log is
//! replayed one last time and the observed extents/page descriptors are
//! compacted into a single mmap-able, per-metric-sorted v2 index. Grounded
//! on the v1 journal's own `replay` (same CRC-verified record walk used at
//! startup) feeding the v2 builder already used by `journal_v2`'s tests.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::Result;
use crate::types::MetricId;

use super::journal_v2::{ExtentTableEntry, JournalV2, JournalV2Builder, MetricEntryInput, PageListEntry};
use super::{Datafile, TierContext};

struct RawPage {
    start_s: u32,
    end_s: u32,
    extent_index: u16,
    page_length: u16,
    page_type: u8,
}

/// Runs the `JOURNAL_FILE_INDEX` opcode body for one closed datafile.
/// Returns the freshly mmap'd v2 reader, already attached to `datafile`.
pub fn migrate_to_v2(ctx: &TierContext, datafile: &Arc<Datafile>) -> Result<Arc<JournalV2>> {
    let mut extents: Vec<ExtentTableEntry> = Vec::new();
    let mut extent_index_by_offset: HashMap<u64, u16> = HashMap::new();
    let mut by_metric: HashMap<MetricId, Vec<RawPage>> = HashMap::new();

    ctx.with_journal_v1(datafile.file_no, |journal| {
        journal.replay(|txn| {
            let index = *extent_index_by_offset
                .entry(txn.extent_offset)
                .or_insert_with(|| {
                    let idx = extents.len() as u16;
                    extents.push(ExtentTableEntry {
                        datafile_offset: txn.extent_offset,
                        datafile_size: txn.extent_size,
                    });
                    idx
                });
            for d in &txn.descriptors {
                by_metric.entry(d.metric_id).or_default().push(RawPage {
                    start_s: d.start_time as u32,
                    end_s: d.end_time as u32,
                    extent_index: index,
                    page_length: d.page_length,
                    page_type: d.page_type,
                });
            }
            Ok(())
        })
    })?;

    let mut metrics = Vec::with_capacity(by_metric.len());
    for (uuid, mut pages) in by_metric {
        pages.sort_by_key(|p| p.start_s);
        let first_time_s = pages.iter().map(|p| p.start_s).min().unwrap_or(0);
        let last_time_s = pages.iter().map(|p| p.end_s).max().unwrap_or(0);
        // `start_s`/`end_s` are the engine's native time unit truncated to
        // u32 for the compact v2 format (the extent header keeps full u64
        // precision, so a sample's real timestamp is never affected by
        // this truncation). Use saturating deltas rather than plain
        // subtraction: a per-metric time span wide enough to wrap past
        // u32::MAX in the engine's unit would otherwise panic here.
        let page_entries = pages
            .iter()
            .map(|p| PageListEntry {
                delta_start_s: p.start_s.saturating_sub(first_time_s),
                delta_end_s: p.end_s.saturating_sub(first_time_s),
                extent_index: p.extent_index,
                page_length: p.page_length,
                update_every_s: 0,
                page_type: p.page_type,
            })
            .collect();
        metrics.push(MetricEntryInput {
            uuid,
            first_time_s,
            last_time_s,
            pages: page_entries,
        });
    }
    let metric_count = metrics.len();

    let path = ctx.v2_path(datafile.file_no);
    JournalV2Builder::new(extents, metrics).write_to(&path)?;
    let v2 = Arc::new(JournalV2::open(&path)?);
    datafile.attach_v2(v2.clone());
    datafile.mark_populated();

    info!(
        tier = ctx.tier,
        file_no = datafile.file_no,
        metrics = metric_count,
        "journal.migrate.completed"
    );
    Ok(v2)
}

/// Best-effort migration used right after rotation creates a new tail
/// datafile: logs and swallows errors rather than failing the write path
/// that triggered it (§7 "transient I/O ... logged rate-limited").
pub fn migrate_to_v2_best_effort(ctx: &TierContext, datafile: &Arc<Datafile>) {
    if datafile.is_populated() {
        return;
    }
    if let Err(err) = migrate_to_v2(ctx, datafile) {
        warn!(file_no = datafile.file_no, error = %err, "journal.migrate.failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Page, PageState};
    use crate::datafile::AcquireReason;
    use crate::extent::write_extent_to_tier;
    use crate::types::CompressionAlgorithm;
    use tempfile::tempdir;

    fn dirty_page(metric: MetricId, start: u64, payload: &[u8]) -> Arc<Page> {
        let page = Arc::new(Page::new_hot(1, metric, start, 1));
        page.append_samples(payload);
        page.hot_set_end_time(start + payload.len() as u64);
        page.transition_to(PageState::Dirty);
        page
    }

    #[test]
    fn migrates_closed_datafile_into_a_queryable_v2_index() {
        let dir = tempdir().unwrap();
        let ctx = TierContext::init(dir.path(), 1, 64 * 1024 * 1024, 3600).unwrap();
        let metric = MetricId::new_random();

        let pages = vec![dirty_page(metric, 100, b"abcdefgh")];
        write_extent_to_tier(&ctx, &pages, CompressionAlgorithm::Lz4).unwrap();

        let closed = ctx.oldest().unwrap();
        let v2 = migrate_to_v2(&ctx, &closed).unwrap();
        assert_eq!(v2.metric_count_public(), 1);

        let details = v2.lookup(metric);
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].start_time_s, 100);

        assert!(closed.is_populated());
        closed.acquire(AcquireReason::PageDetails);
        closed.release(AcquireReason::PageDetails);
    }
}
