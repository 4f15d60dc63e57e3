//! Engine configuration (§6 "Configuration"). Grounded on the shape of
//! `src/db/config.rs` (a plain struct with named preset constructors) but
//! made `serde`-deserializable from TOML, since the engine is a standalone
//! crate rather than something embedded behind a host that already parses
//! config for it.

use serde::{Deserialize, Serialize};

use crate::types::Tier;

/// Per-tier retention and compression knobs (§6 "dbengine tier N retention
/// size", "... retention time"). Kept as a flat `Vec` rather than a
/// `tier -> TierConfig` map: TOML tables require string keys, and a
/// `[[tiers]]` array-of-tables reads more naturally in a config file
/// anyway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub tier: Tier,
    pub retention_size_mb: u64,
    pub retention_time_seconds: u64,
    #[serde(default = "default_compression")]
    pub compression: CompressionChoice,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionChoice {
    None,
    Lz4,
}

fn default_compression() -> CompressionChoice {
    CompressionChoice::Lz4
}

impl From<CompressionChoice> for crate::types::CompressionAlgorithm {
    fn from(c: CompressionChoice) -> Self {
        match c {
            CompressionChoice::None => crate::types::CompressionAlgorithm::None,
            CompressionChoice::Lz4 => crate::types::CompressionAlgorithm::Lz4,
        }
    }
}

impl TierConfig {
    pub fn default_for(tier: Tier) -> Self {
        TierConfig {
            tier,
            retention_size_mb: 256,
            retention_time_seconds: 3600 * 24,
            compression: CompressionChoice::Lz4,
        }
    }
}

/// Top-level engine configuration (§6). `page_fetch_timeout_ms`/`retries`
/// bound how long the query planner waits on a single-flight extent read
/// before giving up on that page detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub data_dir: std::path::PathBuf,
    pub page_cache_size_mb: u64,
    pub extent_cache_size_mb: u64,
    pub pages_per_extent: u8,
    pub page_fetch_timeout_ms: u64,
    pub page_fetch_retries: u32,
    pub worker_pool_size: usize,
    pub shard_count: usize,
    pub severe_pressure_permille: u32,
    pub aggressive_evict_permille: u32,
    pub healthy_permille: u32,
    pub evict_low_threshold_permille: u32,
    pub tiers: Vec<TierConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let tiers = vec![TierConfig::default_for(1)];
        EngineConfig {
            data_dir: std::path::PathBuf::from("./tsengine-data"),
            page_cache_size_mb: 64,
            extent_cache_size_mb: 32,
            pages_per_extent: 64,
            page_fetch_timeout_ms: 2_000,
            page_fetch_retries: 3,
            worker_pool_size: num_cpus_fallback(),
            shard_count: num_cpus_fallback(),
            severe_pressure_permille: crate::cache::SEVERE_PRESSURE,
            aggressive_evict_permille: crate::cache::AGGRESSIVE_EVICT,
            healthy_permille: crate::cache::HEALTHY,
            evict_low_threshold_permille: crate::cache::EVICT_LOW_THRESHOLD,
            tiers,
        }
    }
}

impl EngineConfig {
    /// Favors durability and steady background work over raw throughput:
    /// smaller worker pool, conservative pressure thresholds.
    pub fn production() -> Self {
        EngineConfig {
            worker_pool_size: num_cpus_fallback().max(2),
            ..Self::default()
        }
    }

    /// Favors raw ingest/query throughput for load testing: bigger caches,
    /// larger worker pool.
    pub fn benchmark() -> Self {
        EngineConfig {
            page_cache_size_mb: 512,
            extent_cache_size_mb: 256,
            worker_pool_size: num_cpus_fallback() * 2,
            ..Self::default()
        }
    }

    pub fn from_toml_str(s: &str) -> crate::error::Result<Self> {
        toml::from_str(s)
            .map_err(|e| crate::error::EngineError::invalid(format!("invalid config: {e}")))
    }

    pub fn to_toml_string(&self) -> crate::error::Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| crate::error::EngineError::invalid(format!("cannot serialize config: {e}")))
    }
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_one_tier() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.tiers.len(), 1);
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = EngineConfig::benchmark();
        let s = cfg.to_toml_string().unwrap();
        let back = EngineConfig::from_toml_str(&s).unwrap();
        assert_eq!(back.page_cache_size_mb, cfg.page_cache_size_mb);
        assert_eq!(back.tiers.len(), cfg.tiers.len());
    }
}
