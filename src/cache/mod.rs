//! Page Cache (PGC): the engine's sole in-memory page store.
//!
//! Pages are indexed by `(section, metric_id, start_time)` across `P`
//! shards, and independently tracked in three state lists (HOT/DIRTY/CLEAN)
//! so flush and eviction never need to walk the whole index. See
//! `SPEC_FULL.md` §4.1 for the algorithms this module implements.

pub mod page;
mod shard;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::types::{MetricId, Section, TimeUsec};

pub use page::{Page, PageOrigin, PageState};
pub use shard::LookupMode;
use shard::{shard_of, ShardIndex};

/// Per-mille pressure thresholds from §4.1.
pub const SEVERE_PRESSURE: u32 = 1000;
pub const AGGRESSIVE_EVICT: u32 = 995;
pub const HEALTHY: u32 = 990;
pub const EVICT_LOW_THRESHOLD: u32 = 970;

#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    pub clean_size: usize,
    pub hot_max: usize,
    pub dirty_max: usize,
    pub max_dirty_per_call: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        CacheLimits {
            clean_size: 64 * 1024 * 1024,
            hot_max: 16 * 1024 * 1024,
            dirty_max: 32 * 1024 * 1024,
            max_dirty_per_call: 512,
        }
    }
}

struct ShardSlot {
    index: Mutex<ShardIndex>,
}

/// A lookup key identifying a specific page for list bookkeeping.
#[derive(Clone)]
struct PageHandle {
    page: Arc<Page>,
}

/// One of the three state lists, each under its own lock so HOT appends
/// never contend with CLEAN eviction scans (§4.1, §5 lock discipline).
#[derive(Default)]
struct PageList {
    entries: Mutex<VecDeque<PageHandle>>,
    bytes: AtomicUsize,
}

impl PageList {
    fn push_back(&self, page: Arc<Page>) {
        self.bytes.fetch_add(page.payload_len(), Ordering::Relaxed);
        self.entries.lock().push_back(PageHandle { page });
    }

    fn remove(&self, page: &Arc<Page>) {
        let mut entries = self.entries.lock();
        if let Some(pos) = entries.iter().position(|h| Arc::ptr_eq(&h.page, page)) {
            entries.remove(pos);
            self.bytes
                .fetch_sub(page.payload_len(), Ordering::Relaxed);
        }
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// The page cache. One instance serves an entire engine; shards and state
/// lists are independent so producers, flushers and the evictor rarely
/// block each other.
pub struct PageCache {
    shards: Vec<ShardSlot>,
    shard_count: usize,
    hot: PageList,
    dirty: PageList,
    clean: PageList,
    limits: CacheLimits,
    evict_skip_warned: AtomicI64,
    flush_calls: AtomicUsize,
    evict_calls: AtomicUsize,
    pressure_permille: AtomicU32,
}

/// Result of [`PageCache::flush_pages`].
pub struct FlushOutcome {
    pub flushed: usize,
    pub skipped: usize,
}

/// Result of [`PageCache::evict_pages`].
pub struct EvictOutcome {
    pub evicted: usize,
    pub skipped: usize,
    pub made_progress: bool,
}

impl PageCache {
    pub fn new(shard_count: usize, limits: CacheLimits) -> Self {
        let shard_count = shard_count.max(1);
        let shards = (0..shard_count)
            .map(|_| ShardSlot {
                index: Mutex::new(ShardIndex::default()),
            })
            .collect();
        PageCache {
            shards,
            shard_count,
            hot: PageList::default(),
            dirty: PageList::default(),
            clean: PageList::default(),
            limits,
            evict_skip_warned: AtomicI64::new(0),
            flush_calls: AtomicUsize::new(0),
            evict_calls: AtomicUsize::new(0),
            pressure_permille: AtomicU32::new(0),
        }
    }

    fn shard_for(&self, metric_id: MetricId) -> &ShardSlot {
        &self.shards[shard_of(metric_id, self.shard_count)]
    }

    /// Inserts a brand-new HOT page and returns it pre-acquired (refcount 1).
    /// Fails-never (§4.1): on a `(section, metric_id, start_time)`
    /// collision, returns the already-present page instead of the caller's
    /// buffer, with `added = false`. If that entry is concurrently mid
    /// deletion, briefly backs off and retries rather than returning a dead
    /// page. Duplicate-start_time rejection is an ingest-layer concern
    /// (`Engine::store_init`), not part of this primitive's contract.
    pub fn add_and_acquire(
        &self,
        section: Section,
        metric_id: MetricId,
        start_time: TimeUsec,
        update_every: u32,
    ) -> (Arc<Page>, bool) {
        loop {
            let page = Arc::new(Page::new_hot(section, metric_id, start_time, update_every));
            if !page.try_acquire() {
                unreachable!("fresh page cannot be DELETING");
            }
            let shard = self.shard_for(metric_id);
            let mut idx = shard.index.lock();
            if idx.insert(page.clone()) {
                drop(idx);
                self.hot.push_back(page.clone());
                return (page, true);
            }
            let existing = idx
                .lookup(section, metric_id, start_time, LookupMode::Exact)
                .expect("insert reported a collision, so an entry must exist");
            drop(idx);
            if existing.try_acquire() {
                existing.touch();
                return (existing, false);
            }
            std::thread::sleep(std::time::Duration::from_micros(50));
        }
    }

    pub fn get_and_acquire(
        &self,
        section: Section,
        metric_id: MetricId,
        start_time: TimeUsec,
        mode: LookupMode,
    ) -> Option<Arc<Page>> {
        let shard = self.shard_for(metric_id);
        let page = {
            let idx = shard.index.lock();
            idx.lookup(section, metric_id, start_time, mode)?
        };
        if page.try_acquire() {
            page.touch();
            Some(page)
        } else {
            None
        }
    }

    pub fn overlapping(
        &self,
        section: Section,
        metric_id: MetricId,
        start: TimeUsec,
        end: TimeUsec,
    ) -> Vec<Arc<Page>> {
        let shard = self.shard_for(metric_id);
        let idx = shard.index.lock();
        idx.overlapping(section, metric_id, start, end)
    }

    /// Duplicates a reference on an already-acquired page.
    pub fn dup(&self, page: &Arc<Page>) -> Option<Arc<Page>> {
        if page.try_acquire() {
            Some(page.clone())
        } else {
            None
        }
    }

    pub fn release(&self, page: &Arc<Page>) {
        page.release();
    }

    pub fn hot_set_end_time(&self, page: &Arc<Page>, t: TimeUsec) {
        page.hot_set_end_time(t);
    }

    /// HOT -> DIRTY transition, then releases the caller's reference.
    pub fn hot_to_dirty_and_release(&self, page: Arc<Page>) {
        if page.try_transition(PageState::Hot, PageState::Dirty) {
            self.hot.remove(&page);
            self.dirty.push_back(page.clone());
        }
        page.release();
    }

    /// HOT page with no samples: short-circuits straight to CLEAN-empty
    /// per §3, skipping the extent writer entirely.
    pub fn hot_to_clean_empty_and_release(&self, page: Arc<Page>) {
        if page.payload_len() == 0 && page.try_transition(PageState::Hot, PageState::Clean) {
            self.hot.remove(&page);
            self.clean.push_back(page.clone());
        }
        page.release();
    }

    /// Flush algorithm (§4.1): groups DIRTY pages, processes up to
    /// `limits.max_dirty_per_call` per invocation, skips pages whose
    /// transition is already contended, and hands each batch to `save` for
    /// extent formation before moving it to CLEAN.
    pub fn flush_pages<F>(&self, max_flushes: usize, save: F) -> FlushOutcome
    where
        F: Fn(&[Arc<Page>]) -> crate::error::Result<()>,
    {
        self.flush_calls.fetch_add(1, Ordering::Relaxed);
        let batch_size = max_flushes.min(self.limits.max_dirty_per_call);
        let mut batch = Vec::with_capacity(batch_size);
        let mut skipped = 0usize;
        {
            let entries = self.dirty.entries.lock();
            for handle in entries.iter() {
                if batch.len() >= batch_size {
                    break;
                }
                if handle.page.try_acquire() {
                    batch.push(handle.page.clone());
                } else {
                    skipped += 1;
                }
            }
        }
        if batch.is_empty() {
            return FlushOutcome {
                flushed: 0,
                skipped,
            };
        }
        let flushed = match save(&batch) {
            Ok(()) => {
                for page in &batch {
                    if page.try_transition(PageState::Dirty, PageState::Clean) {
                        self.dirty.remove(page);
                        self.clean.push_back(page.clone());
                    }
                    page.release();
                }
                batch.len()
            }
            Err(err) => {
                // Disk errors in the save callback leave pages DIRTY for a
                // later retry (§4.1 failure semantics).
                warn!(error = %err, "flush_pages: save callback failed, pages remain DIRTY");
                for page in &batch {
                    page.release();
                }
                0
            }
        };
        FlushOutcome { flushed, skipped }
    }

    /// Eviction algorithm (§4.1): walks the CLEAN LRU head to tail, bids for
    /// deletion rights via CAS, and removes winning pages from both the
    /// list and the shard index. Under `severe_pressure` the caller's
    /// `max_skip`/`max_evict` limits are ignored.
    pub fn evict_pages<Filt>(
        &self,
        max_skip: usize,
        max_evict: usize,
        filter: Filt,
    ) -> EvictOutcome
    where
        Filt: Fn(&Page) -> bool,
    {
        self.evict_calls.fetch_add(1, Ordering::Relaxed);
        let severe = self.pressure_permille() >= SEVERE_PRESSURE;
        let (max_skip, max_evict) = if severe {
            (usize::MAX, usize::MAX)
        } else {
            (max_skip, max_evict)
        };

        let mut evicted = 0usize;
        let mut skipped = 0usize;
        let candidates: Vec<Arc<Page>> = {
            let entries = self.clean.entries.lock();
            entries.iter().map(|h| h.page.clone()).collect()
        };

        for page in candidates {
            if evicted >= max_evict || skipped >= max_skip {
                break;
            }
            if !filter(&page) {
                skipped += 1;
                continue;
            }
            if !page.try_mark_deleting() {
                skipped += 1;
                continue;
            }
            self.clean.remove(&page);
            let shard = self.shard_for(page.metric_id);
            shard
                .index
                .lock()
                .remove(page.section, page.metric_id, page.start_time);
            evicted += 1;
        }

        let made_progress = evicted > 0;
        if !made_progress && skipped > 0 {
            let warned = self.evict_skip_warned.fetch_add(1, Ordering::Relaxed);
            if warned % 100 == 0 {
                warn!(skipped, "evict_pages: full pass skipped everything");
            }
        }
        EvictOutcome {
            evicted,
            skipped,
            made_progress,
        }
    }

    /// Finds every CLEAN page whose origin is `df` and evicts it
    /// unconditionally, used right before a datafile is deleted so no
    /// cached page can outlive the bytes it points into (§9 cyclic
    /// reference note).
    pub fn evict_clean_pages_of_datafile(&self, df: &Arc<crate::datafile::Datafile>) -> usize {
        let candidates: Vec<Arc<Page>> = {
            let entries = self.clean.entries.lock();
            entries
                .iter()
                .map(|h| h.page.clone())
                .filter(|p| p.is_from_datafile(df))
                .collect()
        };
        let mut evicted = 0;
        for page in candidates {
            if page.try_mark_deleting() {
                self.clean.remove(&page);
                let shard = self.shard_for(page.metric_id);
                shard
                    .index
                    .lock()
                    .remove(page.section, page.metric_id, page.start_time);
                evicted += 1;
            }
        }
        evicted
    }

    /// Inserts pages recovered from a v2 index or an extent read directly
    /// as CLEAN, used by the query planner and by `JOURNAL_FILE_INDEX`
    /// migration to repopulate the open cache.
    pub fn insert_clean(&self, page: Arc<Page>) -> bool {
        let inserted = {
            let shard = self.shard_for(page.metric_id);
            let mut idx = shard.index.lock();
            idx.insert(page.clone())
        };
        if inserted {
            self.clean.push_back(page);
        }
        inserted
    }

    pub fn hot_len(&self) -> usize {
        self.hot.len()
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    pub fn clean_len(&self) -> usize {
        self.clean.len()
    }

    /// Autoscaling target from §4.1:
    /// `wanted = max(hot + dirty + clean_size, min(2*max(hot,hot_max), hot_max + max(hot_max/2, 2*dirty_max)))`.
    pub fn wanted_bytes(&self) -> usize {
        let hot = self.hot.bytes.load(Ordering::Relaxed);
        let dirty = self.dirty.bytes.load(Ordering::Relaxed);
        let dirty_max = self.limits.dirty_max;
        let hot_max = self.limits.hot_max;
        let a = 2 * hot.max(hot_max);
        let b = hot_max + (hot_max / 2).max(2 * dirty_max);
        (hot + dirty + self.limits.clean_size).max(a.min(b))
    }

    /// Recomputes and caches the current per-mille usage, returning it.
    /// `current` is total cache residency across all three states, not
    /// just CLEAN, matching the original's whole-cache `stats.size`.
    pub fn pressure_permille(&self) -> u32 {
        let wanted = self.wanted_bytes().max(1);
        let current = self.hot.bytes.load(Ordering::Relaxed)
            + self.dirty.bytes.load(Ordering::Relaxed)
            + self.clean.bytes.load(Ordering::Relaxed);
        let permille = ((current as u128 * 1000) / wanted as u128) as u32;
        self.pressure_permille.store(permille, Ordering::Relaxed);
        permille
    }

    /// Whether an inline flush should run before an append call returns:
    /// dirty bytes have exceeded the HOT capacity (§5 backpressure).
    pub fn is_flush_critical(&self) -> bool {
        self.dirty.bytes.load(Ordering::Relaxed) > self.limits.hot_max
    }

    pub fn should_run_aggressive_evict(&self) -> bool {
        self.pressure_permille() >= AGGRESSIVE_EVICT
    }

    pub fn is_healthy(&self) -> bool {
        self.pressure_permille() <= HEALTHY
    }

    pub fn total_pages(&self) -> usize {
        self.shards.iter().map(|s| s.index.lock().len()).sum()
    }

    /// Called by the retention controller's deletion sequence after a
    /// datafile's v2/v1 files are unlinked, so diagnostics reflect the
    /// reclaimed page count immediately.
    pub fn debug_stats(&self) -> CacheStats {
        CacheStats {
            hot: self.hot_len(),
            dirty: self.dirty_len(),
            clean: self.clean_len(),
            pressure_permille: self.pressure_permille(),
            flush_calls: self.flush_calls.load(Ordering::Relaxed),
            evict_calls: self.evict_calls.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub hot: usize,
    pub dirty: usize,
    pub clean: usize,
    pub pressure_permille: u32,
    pub flush_calls: usize,
    pub evict_calls: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> PageCache {
        PageCache::new(4, CacheLimits::default())
    }

    #[test]
    fn add_and_get_roundtrip() {
        let cache = cache();
        let metric = MetricId::new_random();
        let (page, added) = cache.add_and_acquire(1, metric, 1000, 1);
        assert!(added);
        page.append_samples(&[1, 2, 3, 4]);
        cache.release(&page);

        let found = cache
            .get_and_acquire(1, metric, 1000, LookupMode::Exact)
            .unwrap();
        assert_eq!(found.payload_len(), 4);
        cache.release(&found);
    }

    #[test]
    fn duplicate_start_time_returns_existing() {
        let cache = cache();
        let metric = MetricId::new_random();
        let (first, added) = cache.add_and_acquire(1, metric, 1000, 1);
        assert!(added);
        cache.release(&first);

        let (second, added) = cache.add_and_acquire(1, metric, 1000, 1);
        assert!(!added);
        assert!(Arc::ptr_eq(&first, &second));
        cache.release(&second);
    }

    #[test]
    fn hot_to_dirty_to_clean_cycle() {
        let cache = cache();
        let metric = MetricId::new_random();
        let (page, added) = cache.add_and_acquire(1, metric, 1000, 1);
        assert!(added);
        page.append_samples(&[0u8; 16]);
        let dup = cache.dup(&page).unwrap();
        cache.hot_to_dirty_and_release(dup);
        assert_eq!(page.state(), PageState::Dirty);
        cache.release(&page);

        let outcome = cache.flush_pages(16, |_batch| Ok(()));
        assert_eq!(outcome.flushed, 1);

        let found = cache
            .get_and_acquire(1, metric, 1000, LookupMode::Exact)
            .unwrap();
        assert_eq!(found.state(), PageState::Clean);
        cache.release(&found);
    }

    #[test]
    fn eviction_respects_refcount() {
        let cache = cache();
        let metric = MetricId::new_random();
        let (page, _) = cache.add_and_acquire(1, metric, 1000, 1);
        // Force straight to CLEAN for this test without going through the
        // extent writer.
        page.transition_to(PageState::Clean);
        cache.hot.remove(&page);
        cache.clean.push_back(page.clone());

        let outcome = cache.evict_pages(10, 10, |_| true);
        assert_eq!(outcome.evicted, 0, "held reference must block eviction");

        cache.release(&page);
        let outcome = cache.evict_pages(10, 10, |_| true);
        assert_eq!(outcome.evicted, 1);
    }
}
