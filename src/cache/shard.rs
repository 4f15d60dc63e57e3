use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::types::{MetricId, Section, TimeUsec};

use super::page::Page;

/// One shard of the page index: `section -> metric_id -> start_time -> page`.
///
/// Sharded by hash of `metric_id` so unrelated metrics never contend on the
/// same lock (§4.1). Empty intermediate maps are reclaimed eagerly so a
/// shard that has cooled off does not keep accumulating empty
/// `BTreeMap`/`FxHashMap` husks.
#[derive(Default)]
pub struct ShardIndex {
    sections: FxHashMap<Section, FxHashMap<MetricId, BTreeMap<TimeUsec, Arc<Page>>>>,
}

/// How [`ShardIndex::lookup`] resolves a `start_time` that has no exact
/// match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMode {
    Exact,
    ClosestLe,
    ClosestGe,
}

impl ShardIndex {
    pub fn insert(&mut self, page: Arc<Page>) -> bool {
        let metrics = self.sections.entry(page.section).or_default();
        let runs = metrics.entry(page.metric_id).or_default();
        if runs.contains_key(&page.start_time) {
            return false;
        }
        runs.insert(page.start_time, page);
        true
    }

    pub fn lookup(
        &self,
        section: Section,
        metric_id: MetricId,
        start_time: TimeUsec,
        mode: LookupMode,
    ) -> Option<Arc<Page>> {
        let runs = self.sections.get(&section)?.get(&metric_id)?;
        match mode {
            LookupMode::Exact => runs.get(&start_time).cloned(),
            LookupMode::ClosestLe => runs
                .range(..=start_time)
                .next_back()
                .map(|(_, p)| p.clone()),
            LookupMode::ClosestGe => runs.range(start_time..).next().map(|(_, p)| p.clone()),
        }
    }

    /// Every page for a metric whose run overlaps `[start, end]`, in
    /// ascending `start_time` order. Used by the query planner to merge
    /// HOT/CLEAN pages into the PDC alongside on-disk entries.
    pub fn overlapping(
        &self,
        section: Section,
        metric_id: MetricId,
        start: TimeUsec,
        end: TimeUsec,
    ) -> Vec<Arc<Page>> {
        let Some(runs) = self.sections.get(&section).and_then(|m| m.get(&metric_id)) else {
            return Vec::new();
        };
        runs.values()
            .filter(|p| p.start_time <= end && p.end_time() >= start)
            .cloned()
            .collect()
    }

    pub fn remove(&mut self, section: Section, metric_id: MetricId, start_time: TimeUsec) {
        let Some(metrics) = self.sections.get_mut(&section) else {
            return;
        };
        let Some(runs) = metrics.get_mut(&metric_id) else {
            return;
        };
        runs.remove(&start_time);
        if runs.is_empty() {
            metrics.remove(&metric_id);
        }
        if metrics.is_empty() {
            self.sections.remove(&section);
        }
    }

    pub fn len(&self) -> usize {
        self.sections
            .values()
            .flat_map(|m| m.values())
            .map(|r| r.len())
            .sum()
    }
}

/// Hashes `metric_id` into `[0, shard_count)`. The default shard count is the
/// logical CPU count (§4.1); callers needing a stable partitioning (tests)
/// may pass any positive count.
pub fn shard_of(metric_id: MetricId, shard_count: usize) -> usize {
    use std::hash::{Hash, Hasher};
    let mut hasher = rustc_hash::FxHasher::default();
    metric_id.hash(&mut hasher);
    (hasher.finish() as usize) % shard_count.max(1)
}
