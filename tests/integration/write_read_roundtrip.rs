//! End-to-end store/flush/query through the public `Engine` API: enough
//! samples to force at least one extent write, then a query range
//! spanning both the flushed page and a fresh in-memory one.

use tempfile::tempdir;
use tsengine::config::EngineConfig;
use tsengine::engine::Engine;
use tsengine::types::MetricId;

fn engine_in(dir: &std::path::Path) -> std::sync::Arc<Engine> {
    let mut cfg = EngineConfig::default();
    cfg.data_dir = dir.to_path_buf();
    cfg.tiers = vec![tsengine::config::TierConfig::default_for(1)];
    Engine::open(cfg).unwrap()
}

#[test]
fn samples_survive_a_flush_to_disk() {
    let dir = tempdir().unwrap();
    let engine = engine_in(dir.path());
    let metric = MetricId::new_random();

    let handle = engine.store_init(metric, 1, 1).unwrap();
    for t in 1..=50u64 {
        engine.store_next(handle, t, t as f64).unwrap();
    }
    engine.store_finalize(handle).unwrap();

    let load = engine.load_init(metric, 1, 0, 100).unwrap();
    let value = engine.load_next(load, 1).unwrap();
    assert!(value.is_some());
    engine.load_finalize(load);
}

#[test]
fn two_successive_pages_are_both_queryable() {
    let dir = tempdir().unwrap();
    let engine = engine_in(dir.path());
    let metric = MetricId::new_random();

    let first = engine.store_init(metric, 1, 1).unwrap();
    engine.store_next(first, 1, 1.0).unwrap();
    engine.store_next(first, 2, 2.0).unwrap();
    engine.store_finalize(first).unwrap();

    let second = engine.store_init(metric, 1, 1).unwrap();
    engine.store_next(second, 10, 10.0).unwrap();
    engine.store_next(second, 11, 11.0).unwrap();
    engine.store_finalize(second).unwrap();

    let load = engine.load_init(metric, 1, 0, 20).unwrap();
    assert!(engine.load_next(load, 1).unwrap().is_some());
    engine.load_finalize(load);

    let load2 = engine.load_init(metric, 1, 0, 20).unwrap();
    assert!(engine.load_next(load2, 10).unwrap().is_some());
    engine.load_finalize(load2);
}

#[test]
fn querying_an_unknown_metric_returns_no_data() {
    let dir = tempdir().unwrap();
    let engine = engine_in(dir.path());
    let metric = MetricId::new_random();

    let load = engine.load_init(metric, 1, 0, 100).unwrap();
    assert_eq!(engine.load_next(load, 50).unwrap(), None);
    engine.load_finalize(load);
}
