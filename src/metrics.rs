//! Telemetry (§6 ambient stack + §9 supplemental engine statistics).
//!
//! Grounded on `src/storage/metrics.rs`'s `StorageMetrics` trait +
//! `NoopMetrics`/`CounterMetrics` split, generalized from graph operations
//! to the engine's own opcode/cache/retention counters, and supplemented
//! with the global engine statistics the original implementation exposes
//! (extent reads, flush/evict cycles, rotations).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Tracks engine-wide operational counters. Implementations must be cheap
/// enough to call on every opcode dispatch.
pub trait EngineMetrics: Send + Sync {
    fn page_added(&self);
    fn page_evicted(&self);
    fn extent_written(&self);
    fn extent_read(&self);
    fn extent_read_error(&self);
    fn flush_cycle(&self, pages_flushed: usize);
    fn evict_cycle(&self, pages_evicted: usize);
    fn datafile_rotated(&self);
}

/// Zero-overhead default: discards every recorded event.
#[derive(Default)]
pub struct NoopMetrics;

impl EngineMetrics for NoopMetrics {
    fn page_added(&self) {}
    fn page_evicted(&self) {}
    fn extent_written(&self) {}
    fn extent_read(&self) {}
    fn extent_read_error(&self) {}
    fn flush_cycle(&self, _pages_flushed: usize) {}
    fn evict_cycle(&self, _pages_evicted: usize) {}
    fn datafile_rotated(&self) {}
}

/// Atomic-counter implementation, exposed verbatim via
/// [`crate::engine::Engine::stats`].
#[derive(Default)]
pub struct CounterMetrics {
    pub pages_added: AtomicU64,
    pub pages_evicted: AtomicU64,
    pub extents_written: AtomicU64,
    pub extents_read: AtomicU64,
    pub extent_read_errors: AtomicU64,
    pub flush_cycles: AtomicU64,
    pub pages_flushed_total: AtomicU64,
    pub evict_cycles: AtomicU64,
    pub pages_evicted_total: AtomicU64,
    pub datafile_rotations: AtomicU64,
}

impl EngineMetrics for CounterMetrics {
    fn page_added(&self) {
        self.pages_added.fetch_add(1, Ordering::Relaxed);
    }

    fn page_evicted(&self) {
        self.pages_evicted.fetch_add(1, Ordering::Relaxed);
    }

    fn extent_written(&self) {
        self.extents_written.fetch_add(1, Ordering::Relaxed);
    }

    fn extent_read(&self) {
        self.extents_read.fetch_add(1, Ordering::Relaxed);
    }

    fn extent_read_error(&self) {
        self.extent_read_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn flush_cycle(&self, pages_flushed: usize) {
        self.flush_cycles.fetch_add(1, Ordering::Relaxed);
        self.pages_flushed_total
            .fetch_add(pages_flushed as u64, Ordering::Relaxed);
    }

    fn evict_cycle(&self, pages_evicted: usize) {
        self.evict_cycles.fetch_add(1, Ordering::Relaxed);
        self.pages_evicted_total
            .fetch_add(pages_evicted as u64, Ordering::Relaxed);
    }

    fn datafile_rotated(&self) {
        self.datafile_rotations.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn default_metrics() -> Arc<dyn EngineMetrics> {
    Arc::new(NoopMetrics::default())
}

/// A point-in-time snapshot of [`CounterMetrics`], returned by
/// `Engine::stats()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub pages_added: u64,
    pub pages_evicted: u64,
    pub extents_written: u64,
    pub extents_read: u64,
    pub extent_read_errors: u64,
    pub flush_cycles: u64,
    pub pages_flushed_total: u64,
    pub evict_cycles: u64,
    pub pages_evicted_total: u64,
    pub datafile_rotations: u64,
}

impl CounterMetrics {
    pub fn snapshot(&self) -> EngineStats {
        EngineStats {
            pages_added: self.pages_added.load(Ordering::Relaxed),
            pages_evicted: self.pages_evicted.load(Ordering::Relaxed),
            extents_written: self.extents_written.load(Ordering::Relaxed),
            extents_read: self.extents_read.load(Ordering::Relaxed),
            extent_read_errors: self.extent_read_errors.load(Ordering::Relaxed),
            flush_cycles: self.flush_cycles.load(Ordering::Relaxed),
            pages_flushed_total: self.pages_flushed_total.load(Ordering::Relaxed),
            evict_cycles: self.evict_cycles.load(Ordering::Relaxed),
            pages_evicted_total: self.pages_evicted_total.load(Ordering::Relaxed),
            datafile_rotations: self.datafile_rotations.load(Ordering::Relaxed),
        }
    }
}
