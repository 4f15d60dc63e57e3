//! Query Planner (§4.5): builds a lazy chronological page sequence for a
//! `(metric, start, end)` range by consulting the page cache and each
//! datafile's v2 index, then groups on-disk reads into extent-level
//! batches (EPDL) so overlapping queries share a single read per extent.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cache::{LookupMode, Page, PageCache};
use crate::datafile::{AcquireReason, Datafile, TierContext};
use crate::error::Result;
use crate::extent::read_extent;
use crate::types::{MetricId, Section, TimeUsec};

/// One entry in the Page Details Collection: either already resident in
/// the cache, or needing a read from a specific datafile/offset.
#[derive(Clone)]
pub enum PageDetailEntry {
    Cached(Arc<Page>),
    OnDisk {
        datafile: Arc<Datafile>,
        extent_offset: u64,
        extent_size: u32,
        start_time: TimeUsec,
        end_time: TimeUsec,
        page_length: u16,
        update_every_s: u16,
    },
}

impl PageDetailEntry {
    pub fn start_time(&self) -> TimeUsec {
        match self {
            PageDetailEntry::Cached(p) => p.start_time,
            PageDetailEntry::OnDisk { start_time, .. } => *start_time,
        }
    }
}

/// Ordered map keyed by absolute `start_time`, merging disk-resident and
/// cache-resident pages for one metric's query range.
pub struct PageDetailsCollection {
    entries: BTreeMap<TimeUsec, PageDetailEntry>,
    unreadable: Vec<TimeUsec>,
}

impl PageDetailsCollection {
    /// Builds the PDC for `(section, metric, start, end)`: scans every
    /// datafile's v2 index under the tier's read lock, then merges in
    /// HOT/CLEAN cache pages not yet represented in any v2 index.
    pub fn build(
        ctx: &TierContext,
        cache: &PageCache,
        section: Section,
        metric: MetricId,
        start: TimeUsec,
        end: TimeUsec,
    ) -> Self {
        let mut entries = BTreeMap::new();

        for datafile in ctx.datafiles_snapshot() {
            datafile.acquire(AcquireReason::PageDetails);
            if let Some(v2) = datafile.v2() {
                for detail in v2.lookup(metric) {
                    let s = detail.start_time_s as u64;
                    let e = detail.end_time_s as u64;
                    if s <= end && e >= start {
                        entries.insert(
                            s,
                            PageDetailEntry::OnDisk {
                                datafile: datafile.clone(),
                                extent_offset: detail.datafile_offset,
                                extent_size: detail.datafile_size,
                                start_time: s,
                                end_time: e,
                                page_length: detail.page_length,
                                update_every_s: detail.update_every_s,
                            },
                        );
                    }
                }
            }
            datafile.release(AcquireReason::PageDetails);
        }

        for page in cache.overlapping(section, metric, start, end) {
            entries.insert(page.start_time, PageDetailEntry::Cached(page));
        }

        PageDetailsCollection {
            entries,
            unreadable: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Routes on-disk entries into Extent Page Detail Lists grouped by
    /// `(datafile file_no, extent_offset)` (§4.5 "PDC -> EPDL router").
    pub fn route_to_epdls(&self) -> Vec<ExtentPageDetailList> {
        let mut groups: BTreeMap<(u32, u64), ExtentPageDetailList> = BTreeMap::new();
        for entry in self.entries.values() {
            if let PageDetailEntry::OnDisk {
                datafile,
                extent_offset,
                extent_size,
                ..
            } = entry
            {
                let key = (datafile.file_no, *extent_offset);
                groups
                    .entry(key)
                    .or_insert_with(|| ExtentPageDetailList {
                        datafile: datafile.clone(),
                        extent_offset: *extent_offset,
                        extent_size: *extent_size,
                        entries: Vec::new(),
                    })
                    .entries
                    .push(entry.clone());
            }
        }
        groups.into_values().collect()
    }

    /// Advances the lazy iterator past `current_time`, returning the next
    /// page-detail whose range starts at or after it, skipping entries
    /// already marked unreadable by a failed extent read.
    pub fn lookup_next(&self, current_time: TimeUsec) -> Option<&PageDetailEntry> {
        self.entries
            .range(current_time..)
            .map(|(_, v)| v)
            .find(|entry| !self.unreadable.contains(&entry.start_time()))
    }

    pub fn mark_unreadable(&mut self, start_time: TimeUsec) {
        self.unreadable.push(start_time);
    }
}

/// One extent's worth of page-detail entries awaiting a single read.
pub struct ExtentPageDetailList {
    pub datafile: Arc<Datafile>,
    pub extent_offset: u64,
    pub extent_size: u32,
    pub entries: Vec<PageDetailEntry>,
}

/// Counters surfaced via [`crate::engine::Engine::stats`] (§7 error
/// semantics: "a failing read ... `extent_read_errors` increments, no
/// query is killed").
#[derive(Default)]
pub struct QueryStats {
    pub extent_read_errors: std::sync::atomic::AtomicU64,
}

impl ExtentPageDetailList {
    /// Executes the read synchronously: used both by the worker-pool path
    /// (invoked from an `EXTENT_READ` opcode) and by the sync replication
    /// path described in §4.5.
    pub fn execute_sync(
        &self,
        cache: &PageCache,
        section: Section,
        algorithm: crate::types::CompressionAlgorithm,
        stats: &QueryStats,
    ) -> Result<usize> {
        if let Some(signal) = self.datafile.begin_pending_read(self.extent_offset) {
            // Another in-flight read will populate the cache; block until
            // it completes so the caller's subsequent cache lookup is
            // guaranteed to see the winner's inserted pages (§4.5 dedup).
            signal.wait();
            return Ok(0);
        }

        let result = self
            .datafile
            .read_at(self.extent_offset, self.extent_size as usize)
            .and_then(|bytes| read_extent(&bytes, algorithm));

        self.datafile.complete_pending_read(self.extent_offset);

        let decoded = match result {
            Ok(d) => d,
            Err(_) => {
                stats
                    .extent_read_errors
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return Ok(0);
            }
        };

        let mut inserted = 0;
        for (descriptor, payload) in decoded {
            let page = Arc::new(crate::cache::Page::new_clean_from_disk(
                section,
                descriptor.metric_id,
                descriptor.start_time,
                descriptor.end_time,
                0,
                payload,
                self.datafile.clone(),
            ));
            if cache.insert_clean(page) {
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheLimits;

    #[test]
    fn pdc_merges_cache_only_when_no_disk_entries() {
        let cache = PageCache::new(2, CacheLimits::default());
        let metric = MetricId::new_random();
        let (page, _) = cache.add_and_acquire(1, metric, 100, 1);
        page.append_samples(b"abcd");
        page.hot_set_end_time(110);
        cache.release(&page);

        let dir = tempfile::tempdir().unwrap();
        let ctx = TierContext::init(dir.path(), 1, 64 * 1024 * 1024, 3600).unwrap();
        let pdc = PageDetailsCollection::build(&ctx, &cache, 1, metric, 0, 200);
        assert_eq!(pdc.len(), 1);
        assert!(pdc.route_to_epdls().is_empty());
    }
}
