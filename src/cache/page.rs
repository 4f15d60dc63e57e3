use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::{MetricId, Section, TimeUsec};

/// Sentinel refcount value that wins exclusive deletion rights over a page.
///
/// A page can only move into `DELETING` via a compare-and-swap from `0`;
/// any concurrent `try_acquire` that observes `DELETING` must back off
/// instead of reviving the page.
pub const DELETING: i64 = i64::MIN;

/// Page lifecycle state. Exactly one holds at any moment (§3 invariant 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Currently being extended by a collector.
    Hot,
    /// No longer advancing, waiting to be persisted to an extent.
    Dirty,
    /// Identical to its on-disk copy, evictable under LRU when unreferenced.
    Clean,
}

impl PageState {
    fn to_u8(self) -> u8 {
        match self {
            PageState::Hot => 0,
            PageState::Dirty => 1,
            PageState::Clean => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => PageState::Hot,
            1 => PageState::Dirty,
            _ => PageState::Clean,
        }
    }
}

/// Where a page's on-disk identity comes from, once it is CLEAN. Used by
/// [`crate::cache::PageCache::evict_clean_pages_of_datafile`] to find every
/// cached page that references a datafile about to be deleted, resolving
/// the page/extent/datafile cyclic-reference design note in §9.
#[derive(Clone)]
pub enum PageOrigin {
    /// Produced by a live collector, not yet tied to any datafile.
    Memory,
    /// Loaded from, or flushed to, a specific datafile.
    Datafile(Arc<crate::datafile::Datafile>),
}

/// A single cached run of samples for one metric.
///
/// Indexed uniquely by `(section, metric_id, start_time)` while live. The
/// payload buffer is guarded independently of the state/refcount atomics so
/// that readers holding a reference never contend with state transitions.
pub struct Page {
    pub section: Section,
    pub metric_id: MetricId,
    pub start_time: TimeUsec,
    end_time: AtomicU64,
    pub update_every: u32,
    state: AtomicU8,
    refcount: AtomicI64,
    access_count: AtomicU64,
    data: RwLock<Vec<u8>>,
    origin: RwLock<PageOrigin>,
}

impl Page {
    pub fn new_hot(
        section: Section,
        metric_id: MetricId,
        start_time: TimeUsec,
        update_every: u32,
    ) -> Self {
        Self {
            section,
            metric_id,
            start_time,
            end_time: AtomicU64::new(start_time),
            update_every,
            state: AtomicU8::new(PageState::Hot.to_u8()),
            refcount: AtomicI64::new(0),
            access_count: AtomicU64::new(0),
            data: RwLock::new(Vec::new()),
            origin: RwLock::new(PageOrigin::Memory),
        }
    }

    pub fn new_clean_from_disk(
        section: Section,
        metric_id: MetricId,
        start_time: TimeUsec,
        end_time: TimeUsec,
        update_every: u32,
        payload: Vec<u8>,
        datafile: Arc<crate::datafile::Datafile>,
    ) -> Self {
        Self {
            section,
            metric_id,
            start_time,
            end_time: AtomicU64::new(end_time),
            update_every,
            state: AtomicU8::new(PageState::Clean.to_u8()),
            refcount: AtomicI64::new(0),
            access_count: AtomicU64::new(0),
            data: RwLock::new(payload),
            origin: RwLock::new(PageOrigin::Datafile(datafile)),
        }
    }

    pub fn state(&self) -> PageState {
        PageState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn end_time(&self) -> TimeUsec {
        self.end_time.load(Ordering::Acquire)
    }

    /// Extends a HOT page's `end_time`. No-op if the page is not HOT: the
    /// spec requires this to fail silently rather than error, since a
    /// collector racing a concurrent flush should not be punished for it.
    pub fn hot_set_end_time(&self, t: TimeUsec) {
        if self.state() != PageState::Hot {
            return;
        }
        let mut cur = self.end_time.load(Ordering::Acquire);
        while t > cur {
            match self.end_time.compare_exchange_weak(
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

    pub fn append_samples(&self, bytes: &[u8]) {
        self.data.write().extend_from_slice(bytes);
    }

    pub fn payload(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    pub fn payload_len(&self) -> usize {
        self.data.read().len()
    }

    pub fn set_payload(&self, bytes: Vec<u8>) {
        *self.data.write() = bytes;
    }

    pub fn origin(&self) -> PageOrigin {
        self.origin.read().clone()
    }

    pub fn set_origin(&self, origin: PageOrigin) {
        *self.origin.write() = origin;
    }

    pub fn is_from_datafile(&self, df: &Arc<crate::datafile::Datafile>) -> bool {
        match &*self.origin.read() {
            PageOrigin::Datafile(other) => Arc::ptr_eq(other, df),
            PageOrigin::Memory => false,
        }
    }

    pub fn touch(&self) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    pub fn refcount(&self) -> i64 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Acquires a reference. Fails if the page is mid-deletion.
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

    /// Releases a reference previously obtained via [`Page::try_acquire`].
    /// Returns the refcount observed after the decrement.
    pub fn release(&self) -> i64 {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Bids for exclusive deletion rights: only succeeds from refcount 0.
    pub fn try_mark_deleting(&self) -> bool {
        self.refcount
            .compare_exchange(0, DELETING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn transition_to(&self, next: PageState) {
        self.state.store(next.to_u8(), Ordering::Release);
    }

    /// One-way transition helper enforcing the HOT -> DIRTY -> CLEAN cycle
    /// (§3). Returns false (and leaves the state untouched) for any
    /// transition not listed there.
    pub fn try_transition(&self, from: PageState, to: PageState) -> bool {
        let allowed = matches!(
            (from, to),
            (PageState::Hot, PageState::Dirty)
                | (PageState::Hot, PageState::Clean)
                | (PageState::Dirty, PageState::Clean)
        );
        if !allowed {
            return false;
        }
        self.state
            .compare_exchange(
                from.to_u8(),
                to.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}
