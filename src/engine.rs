//! Top-level `Engine`: binds the page cache, metric registry, datafile
//! managers, extent writer, query planner, scheduler and retention
//! controller into the producer/consumer API described in §6.
//!
//! Samples are stored as 8-byte little-endian `f64` values appended to a
//! page's payload buffer; `NO_DATA` is represented as `None` rather than a
//! sentinel float, which is the more idiomatic Rust rendition of the same
//! contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::cache::{LookupMode, Page, PageCache};
use crate::config::EngineConfig;
use crate::datafile::TierContext;
use crate::error::{EngineError, Result};
use crate::extent::write_extent_to_tier;
use crate::metrics::{CounterMetrics, EngineStats};
use crate::query::PageDetailsCollection;
use crate::registry::MetricRegistry;
use crate::retention::RetentionController;
use crate::scheduler::Scheduler;
use crate::types::{MetricId, Section, Tier, TimeUsec};

const SAMPLE_WIDTH: usize = 8;
const DEFAULT_SECTION: Section = 0;

pub type StoreHandle = u64;
pub type LoadHandle = u64;

struct StoreState {
    tier: Tier,
    metric: MetricId,
    page: Arc<Page>,
}

struct LoadState {
    pdc: PageDetailsCollection,
    metric: MetricId,
    tier: Tier,
}

/// The engine's in-memory + on-disk state for one open instance. One
/// `Engine` normally lives for the process's lifetime once opened.
pub struct Engine {
    config: EngineConfig,
    cache: Arc<PageCache>,
    registry: Arc<MetricRegistry>,
    tiers: HashMap<Tier, Arc<TierContext>>,
    retention: HashMap<Tier, RetentionController>,
    scheduler: Arc<Scheduler>,
    metrics: Arc<CounterMetrics>,
    store_handles: Mutex<HashMap<StoreHandle, StoreState>>,
    load_handles: Mutex<HashMap<LoadHandle, LoadState>>,
    next_handle: AtomicU64,
}

impl Engine {
    /// Opens (or creates) the engine at `config.data_dir`, scanning every
    /// configured tier's datafiles (§4.3 init) and starting the event
    /// loop's worker pool sizing.
    pub fn open(config: EngineConfig) -> Result<Arc<Self>> {
        let mut tiers = HashMap::new();
        let mut retention = HashMap::new();
        for tier_cfg in &config.tiers {
            let dir = config.data_dir.join(format!("tier-{}", tier_cfg.tier));
            let ctx = TierContext::init(
                &dir,
                tier_cfg.tier,
                tier_cfg.retention_size_mb * 1024 * 1024,
                tier_cfg.retention_time_seconds,
            )?;
            tiers.insert(tier_cfg.tier, ctx);
            retention.insert(tier_cfg.tier, RetentionController::new());
        }

        let cache = Arc::new(PageCache::new(
            config.shard_count,
            crate::cache::CacheLimits {
                clean_size: (config.page_cache_size_mb * 1024 * 1024) as usize,
                hot_max: (config.extent_cache_size_mb * 1024 * 1024 / 4) as usize,
                dirty_max: (config.extent_cache_size_mb * 1024 * 1024 / 2) as usize,
                max_dirty_per_call: config.pages_per_extent as usize * 8,
            },
        ));
        let registry = Arc::new(MetricRegistry::new(config.shard_count));
        let scheduler = Scheduler::new(config.worker_pool_size);

        info!(tiers = tiers.len(), "engine opened");

        Ok(Arc::new(Engine {
            config,
            cache,
            registry,
            tiers,
            retention,
            scheduler,
            metrics: Arc::new(CounterMetrics::default()),
            store_handles: Mutex::new(HashMap::new()),
            load_handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }))
    }

    fn tier_ctx(&self, tier: Tier) -> Result<&Arc<TierContext>> {
        self.tiers.get(&tier).ok_or(EngineError::NotFound("tier"))
    }

    fn alloc_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// `store_init(metric_uuid, tier) -> handle` (§6). Interns the metric,
    /// opens a fresh HOT page at the current time, and returns a handle
    /// for subsequent `store_next` calls.
    pub fn store_init(&self, metric_uuid: MetricId, tier: Tier, update_every: u32) -> Result<StoreHandle> {
        self.tier_ctx(tier)?;
        let metric_handle = self.registry.get_and_acquire(DEFAULT_SECTION, metric_uuid);
        let start_time = metric_handle.last_time().wrapping_add(1).max(1);
        self.registry.release(&metric_handle);

        let (page, added) = self
            .cache
            .add_and_acquire(DEFAULT_SECTION, metric_uuid, start_time, update_every);
        if !added {
            self.cache.release(&page);
            return Err(EngineError::invalid("duplicate page start_time for this metric"));
        }
        self.metrics.page_added();

        let handle = self.alloc_handle();
        self.store_handles.lock().insert(
            handle,
            StoreState {
                tier,
                metric: metric_uuid,
                page,
            },
        );
        Ok(handle)
    }

    /// `store_next(handle, point_in_time_usec, value)` (§6). Rejects
    /// non-increasing timestamps per the per-metric append ordering
    /// invariant (§5).
    pub fn store_next(&self, handle: StoreHandle, point_in_time_usec: TimeUsec, value: f64) -> Result<()> {
        let handles = self.store_handles.lock();
        let state = handles
            .get(&handle)
            .ok_or(EngineError::NotFound("store handle"))?;
        if point_in_time_usec < state.page.end_time() {
            return Err(EngineError::invalid(
                "store_next: point_in_time_usec must not precede the page's current end_time",
            ));
        }
        state.page.append_samples(&value.to_le_bytes());
        self.cache.hot_set_end_time(&state.page, point_in_time_usec);

        let metric_handle = self.registry.get_and_acquire(DEFAULT_SECTION, state.metric);
        metric_handle.set_first_time(state.page.start_time);
        metric_handle.set_latest_time(point_in_time_usec);
        self.registry.release(&metric_handle);

        if self.cache.is_flush_critical() {
            drop(handles);
            self.flush_tier(state_tier_of(self, handle)?)?;
        }
        Ok(())
    }

    /// `store_flush(handle)` (§6). Ends the page's HOT lifetime: if it has
    /// samples, transitions HOT -> DIRTY and runs the extent writer
    /// inline; an empty page short-circuits to CLEAN-empty (§3).
    pub fn store_flush(&self, handle: StoreHandle) -> Result<()> {
        let page = {
            let handles = self.store_handles.lock();
            let state = handles
                .get(&handle)
                .ok_or(EngineError::NotFound("store handle"))?;
            state.page.clone()
        };
        let tier = {
            let handles = self.store_handles.lock();
            handles.get(&handle).map(|s| s.tier)
        }
        .ok_or(EngineError::NotFound("store handle"))?;

        if page.payload_len() == 0 {
            self.cache.hot_to_clean_empty_and_release(page);
            return Ok(());
        }
        let dup = self
            .cache
            .dup(&page)
            .ok_or(EngineError::PageDeleted)?;
        self.cache.hot_to_dirty_and_release(dup);
        self.cache.release(&page);
        self.flush_tier(tier)
    }

    /// `store_finalize(handle)` (§6): flushes if needed and drops the
    /// handle's bookkeeping.
    pub fn store_finalize(&self, handle: StoreHandle) -> Result<()> {
        self.store_flush(handle).ok();
        self.store_handles.lock().remove(&handle);
        Ok(())
    }

    fn flush_tier(&self, tier: Tier) -> Result<()> {
        let ctx = self.tier_ctx(tier)?.clone();
        let algorithm = ctx.default_compression;
        let metrics = self.metrics.clone();
        let outcome = self.cache.flush_pages(self.config.pages_per_extent as usize, |batch| {
            write_extent_to_tier(&ctx, batch, algorithm)
        });
        if outcome.flushed > 0 {
            metrics.flush_cycle(outcome.flushed);
            metrics.extent_written();
        }
        Ok(())
    }

    /// Runs one evict pass against the configured pressure thresholds
    /// (§4.1/§4.6 `EVICT_INIT`).
    pub fn evict_once(&self) -> Result<usize> {
        let outcome = self.cache.evict_pages(1024, 1024, |_| true);
        if outcome.evicted > 0 {
            self.metrics.evict_cycle(outcome.evicted);
        }
        Ok(outcome.evicted)
    }

    /// Runs the retention controller's quota check and, if exceeded,
    /// performs one rotation (§4.7 `DATABASE_ROTATE`).
    pub async fn maybe_rotate(&self, tier: Tier) -> Result<bool> {
        let ctx = self.tier_ctx(tier)?.clone();
        let controller = self
            .retention
            .get(&tier)
            .ok_or(EngineError::NotFound("tier"))?;
        let (exceeded, _gauges) = controller.evaluate(&ctx);
        if !exceeded {
            return Ok(false);
        }
        let report = controller.rotate(&ctx, &self.cache, &self.registry).await?;
        if report.deleted_file_no.is_some() {
            self.metrics.datafile_rotated();
        }
        Ok(report.deleted_file_no.is_some())
    }

    /// `load_init(metric_uuid, tier, start_usec, end_usec) -> handle` (§6).
    pub fn load_init(
        &self,
        metric_uuid: MetricId,
        tier: Tier,
        start_usec: TimeUsec,
        end_usec: TimeUsec,
    ) -> Result<LoadHandle> {
        let ctx = self.tier_ctx(tier)?;
        let pdc = PageDetailsCollection::build(ctx, &self.cache, DEFAULT_SECTION, metric_uuid, start_usec, end_usec);
        let handle = self.alloc_handle();
        self.load_handles.lock().insert(
            handle,
            LoadState {
                pdc,
                metric: metric_uuid,
                tier,
            },
        );
        Ok(handle)
    }

    /// `load_next(handle, point_in_time_usec) -> value | NO_DATA` (§6).
    /// Resolves on-disk page details through the extent reader on demand
    /// (synchronous path, §4.5) and decodes the sample nearest
    /// `point_in_time_usec` within the resolved page's payload.
    pub fn load_next(&self, handle: LoadHandle, point_in_time_usec: TimeUsec) -> Result<Option<f64>> {
        let mut load_handles = self.load_handles.lock();
        let state = load_handles
            .get_mut(&handle)
            .ok_or(EngineError::NotFound("load handle"))?;

        let Some(entry) = state.pdc.lookup_next(point_in_time_usec) else {
            return Ok(None);
        };

        match entry {
            crate::query::PageDetailEntry::Cached(page) => {
                Ok(decode_sample_at(page, point_in_time_usec))
            }
            crate::query::PageDetailEntry::OnDisk { .. } => {
                // Resolve via the query planner's EPDL path: group and
                // read, then retry against the now-cached page.
                let epdls = state.pdc.route_to_epdls();
                let stats = crate::query::QueryStats::default();
                for epdl in epdls {
                    let _ = epdl.execute_sync(&self.cache, DEFAULT_SECTION, crate::types::CompressionAlgorithm::Lz4, &stats);
                }
                let metric = state.metric;
                drop(load_handles);
                if let Some(page) = self.cache.get_and_acquire(
                    DEFAULT_SECTION,
                    metric,
                    point_in_time_usec,
                    LookupMode::ClosestLe,
                ) {
                    let value = decode_sample_at(&page, point_in_time_usec);
                    self.cache.release(&page);
                    Ok(value)
                } else {
                    Ok(None)
                }
            }
        }
    }

    pub fn load_finalize(&self, handle: LoadHandle) {
        self.load_handles.lock().remove(&handle);
    }

    pub fn stats(&self) -> EngineStats {
        self.metrics.snapshot()
    }

    pub fn cache_stats(&self) -> crate::cache::CacheStats {
        self.cache.debug_stats()
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }
}

fn decode_sample_at(page: &Page, point_in_time_usec: TimeUsec) -> Option<f64> {
    if point_in_time_usec < page.start_time || point_in_time_usec > page.end_time() {
        return None;
    }
    let payload = page.payload();
    let span = (page.end_time() - page.start_time).max(1);
    let sample_count = payload.len() / SAMPLE_WIDTH;
    if sample_count == 0 {
        return None;
    }
    let idx = (((point_in_time_usec - page.start_time) as u128 * sample_count as u128)
        / span as u128) as usize;
    let idx = idx.min(sample_count - 1);
    let bytes: [u8; 8] = payload[idx * SAMPLE_WIDTH..(idx + 1) * SAMPLE_WIDTH]
        .try_into()
        .ok()?;
    Some(f64::from_le_bytes(bytes))
}

fn state_tier_of(engine: &Engine, handle: StoreHandle) -> Result<Tier> {
    engine
        .store_handles
        .lock()
        .get(&handle)
        .map(|s| s.tier)
        .ok_or(EngineError::NotFound("store handle"))
}
