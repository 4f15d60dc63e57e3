//! Metric Registry (MRG): interns `(uuid, section)` descriptors and tracks
//! each metric's time envelope. Sharded the same way as the page cache
//! (§4.2) so registry lookups never contend with page-cache lookups.

use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::types::{MetricId, Section, TimeUsec};

const DELETING: i64 = i64::MIN;

/// An interned metric descriptor. `first_time`/`last_time` only grow on
/// ingest; they shrink exclusively via [`MetricHandle::recalculate_first_time`]
/// during retention rotation.
pub struct MetricHandle {
    pub uuid: MetricId,
    pub section: Section,
    refcount: AtomicI64,
    first_time: AtomicU64,
    last_time: AtomicU64,
}

impl MetricHandle {
    fn new(uuid: MetricId, section: Section) -> Self {
        MetricHandle {
            uuid,
            section,
            refcount: AtomicI64::new(0),
            first_time: AtomicU64::new(u64::MAX),
            last_time: AtomicU64::new(0),
        }
    }

    pub fn first_time(&self) -> TimeUsec {
        self.first_time.load(Ordering::Acquire)
    }

    pub fn last_time(&self) -> TimeUsec {
        self.last_time.load(Ordering::Acquire)
    }

    /// Accumulates maxima on ingest: never moves `first_time` later or
    /// `last_time` earlier.
    pub fn set_first_time(&self, t: TimeUsec) {
        let mut cur = self.first_time.load(Ordering::Acquire);
        while t < cur {
            match self.first_time.compare_exchange_weak(
                cur,
                t,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
    }

    pub fn set_latest_time(&self, t: TimeUsec) {
        let mut cur = self.last_time.load(Ordering::Acquire);
        while t > cur {
            match self.last_time.compare_exchange_weak(
                cur,
                t,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Called by the retention controller after recomputing the oldest
    /// surviving page for this metric across the remaining v2 indices and
    /// the open cache: the only path allowed to move `first_time` forward.
    pub fn recalculate_first_time(&self, new_first: TimeUsec) {
        self.first_time.store(new_first, Ordering::Release);
    }

    pub fn try_acquire(&self) -> bool {
        let mut cur = self.refcount.load(Ordering::Acquire);
        loop {
            if cur == DELETING {
                return false;
            }
            match self.refcount.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    pub fn release(&self) -> i64 {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

#[derive(Default)]
struct RegistryShard {
    entries: Mutex<FxHashMap<(Section, MetricId), Arc<MetricHandle>>>,
}

/// Sharded intern table for metric descriptors.
pub struct MetricRegistry {
    shards: Vec<RegistryShard>,
    shard_count: usize,
}

impl MetricRegistry {
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        MetricRegistry {
            shards: (0..shard_count).map(|_| RegistryShard::default()).collect(),
            shard_count,
        }
    }

    fn shard_for(&self, metric_id: MetricId) -> &RegistryShard {
        use std::hash::{Hash, Hasher};
        let mut hasher = rustc_hash::FxHasher::default();
        metric_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shard_count]
    }

    /// Interns the descriptor if absent, then acquires a reference.
    pub fn get_and_acquire(&self, section: Section, uuid: MetricId) -> Arc<MetricHandle> {
        let shard = self.shard_for(uuid);
        let mut entries = shard.entries.lock();
        let handle = match entries.entry((section, uuid)) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(e) => {
                let handle = Arc::new(MetricHandle::new(uuid, section));
                e.insert(handle.clone());
                handle
            }
        };
        handle.try_acquire();
        handle
    }

    /// Looks up without interning or acquiring.
    pub fn get(&self, section: Section, uuid: MetricId) -> Option<Arc<MetricHandle>> {
        let shard = self.shard_for(uuid);
        shard.entries.lock().get(&(section, uuid)).cloned()
    }

    pub fn release(&self, handle: &Arc<MetricHandle>) {
        handle.release();
    }

    pub fn uuid(&self, handle: &Arc<MetricHandle>) -> MetricId {
        handle.uuid
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.entries.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshots every interned descriptor, used by the retention
    /// controller's `first_time` recalculation pass (§4.7), which must
    /// consider every metric that may have lost its oldest page.
    pub fn all_handles(&self) -> Vec<Arc<MetricHandle>> {
        self.shards
            .iter()
            .flat_map(|s| s.entries.lock().values().cloned().collect::<Vec<_>>())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let registry = MetricRegistry::new(4);
        let uuid = MetricId::new_random();
        let a = registry.get_and_acquire(1, uuid);
        let b = registry.get_and_acquire(1, uuid);
        assert!(Arc::ptr_eq(&a, &b));
        registry.release(&a);
        registry.release(&b);
    }

    #[test]
    fn envelope_tracks_extremes() {
        let registry = MetricRegistry::new(4);
        let uuid = MetricId::new_random();
        let handle = registry.get_and_acquire(1, uuid);
        handle.set_first_time(500);
        handle.set_first_time(200);
        handle.set_latest_time(900);
        handle.set_latest_time(400);
        assert_eq!(handle.first_time(), 200);
        assert_eq!(handle.last_time(), 900);
        registry.release(&handle);
    }
}
