//! # tsengine - time-series storage engine core
//!
//! `tsengine` is the storage core of an observability agent: a multi-tier
//! page cache, a write-ahead journal, a data-file extent writer, a query
//! planner binding metric identifiers to cached or on-disk pages, and an
//! event-loop opcode scheduler ordering all of the above.
//!
//! ## Quick start
//!
//! ```no_run
//! use tsengine::config::EngineConfig;
//! use tsengine::engine::Engine;
//! use tsengine::types::MetricId;
//!
//! let engine = Engine::open(EngineConfig::default())?;
//! let metric = MetricId::new_random();
//!
//! let handle = engine.store_init(metric, 1, 1)?;
//! engine.store_next(handle, 1_000_000, 42.0)?;
//! engine.store_finalize(handle)?;
//!
//! let query = engine.load_init(metric, 1, 0, 2_000_000)?;
//! let _value = engine.load_next(query, 1_000_000)?;
//! engine.load_finalize(query);
//! # Ok::<(), tsengine::error::EngineError>(())
//! ```
//!
//! ## Architecture
//!
//! - **Page Cache** (`cache`): the sole in-memory store of sample runs,
//!   sharded by metric and tracked across HOT/DIRTY/CLEAN state lists.
//! - **Metric Registry** (`registry`): interns `(uuid, section)`
//!   descriptors and their time envelopes.
//! - **Datafile / Journal Manager** (`datafile`): append-only `.ndf`
//!   files, their v1 write-ahead logs, and the indexed v2 files produced
//!   once a datafile closes to writers.
//! - **Extent Writer** (`extent`): batches DIRTY pages into compressed,
//!   checksummed extents.
//! - **Query Planner** (`query`): builds the Page Details Collection and
//!   routes it into per-extent read batches.
//! - **Event Loop & Opcode Scheduler** (`scheduler`): the opcode table,
//!   priority queue and bounded worker pool coordinating all of the above.
//! - **Retention Controller** (`retention`): disk/time quota accounting
//!   and datafile rotation.
//! - **Engine** (`engine`): the producer/consumer API binding every
//!   component together.

pub mod cache;
pub mod config;
pub mod datafile;
pub mod engine;
pub mod error;
pub mod extent;
pub mod logging;
pub mod metrics;
pub mod query;
pub mod registry;
pub mod retention;
pub mod scheduler;
pub mod types;
