//! Crash recovery (S3): commits several extents end-to-end, then simulates
//! a crash between an extent write returning and its journal write
//! returning by writing one more extent's bytes without a matching
//! journal record. After "restarting" (re-opening the `TierContext`),
//! replaying the journal must recover every committed extent and must
//! not recover the torn one.

use std::sync::Arc;

use tempfile::tempdir;
use tsengine::cache::{Page, PageState};
use tsengine::datafile::journal_v1::StoreDataTxn;
use tsengine::datafile::TierContext;
use tsengine::extent::{form_extent, write_extent_to_tier};
use tsengine::types::{CompressionAlgorithm, MetricId};

fn dirty_page(metric: MetricId, start: u64, payload: &[u8]) -> Arc<Page> {
    let page = Arc::new(Page::new_hot(1, metric, start, 1));
    page.append_samples(payload);
    page.hot_set_end_time(start + payload.len() as u64);
    page.transition_to(PageState::Dirty);
    page
}

#[test]
fn torn_write_is_dropped_but_prior_extents_survive_a_restart() {
    let dir = tempdir().unwrap();
    let metric = MetricId::new_random();

    {
        let ctx = TierContext::init(dir.path(), 1, 1024 * 1024 * 1024, 3600).unwrap();

        for i in 0..9u64 {
            let page = dirty_page(metric, 1 + i * 10, b"committed");
            write_extent_to_tier(&ctx, &[page], CompressionAlgorithm::Lz4).unwrap();
        }

        // Simulate a crash between the extent write returning and its
        // journal write returning: reserve space and write the extent's
        // bytes to the datafile, but never append or flush the matching
        // journal transaction.
        let torn_page = dirty_page(metric, 1 + 9 * 10, b"torn-write");
        let formed = form_extent(&[torn_page], CompressionAlgorithm::Lz4).unwrap();
        let datafile = ctx.newest();
        let offset = datafile.reserve(formed.bytes.len() as u64);
        datafile.write_at(offset, &formed.bytes).unwrap();
        datafile.finish_write();
        // process "exits" here: ctx and its journal handle are dropped
        // without the torn extent's transaction ever being appended.
    }

    let ctx = TierContext::init(dir.path(), 1, 1024 * 1024 * 1024, 3600).unwrap();
    let file_no = ctx.oldest().unwrap().file_no;

    let mut recovered: Vec<StoreDataTxn> = Vec::new();
    let applied = ctx
        .with_journal_v1(file_no, |journal| {
            journal.replay(|txn| {
                recovered.push(txn.clone());
                Ok(())
            })
        })
        .unwrap();

    assert_eq!(applied, 9, "only the 9 fully committed extents should replay");
    assert_eq!(recovered.len(), 9);
    for txn in &recovered {
        assert_ne!(
            txn.descriptors[0].start_time,
            1 + 9 * 10,
            "the torn write's extent must not appear in replay"
        );
    }
}
