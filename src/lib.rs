//! Dispensa — a tag-aware result cache for relational query layers.
//!
//! Sits transparently in front of query execution: given a read, it decides
//! cacheability, derives a stable key and a set of invalidation tags, and
//! either serves the stored result or executes and stores. A mutation
//! invalidates every cached entry whose tags intersect the affected data,
//! without tracking individual query texts.
//!
//! The host's data-access layer calls in at exactly two points:
//!
//! ```ignore
//! let rows = orchestrator
//!     .run_cached_select(&descriptor, || engine.run_select(sql, params))
//!     .await?;
//!
//! let outcome = orchestrator
//!     .run_invalidating_mutation(&descriptor, || engine.run_statement(sql, params))
//!     .await?;
//! ```
//!
//! Cache failures degrade to direct execution — a query never fails because
//! the cache is unreachable. The read-repopulation race of cache-aside
//! designs is closed with per-tag generation stamps, see [`store::TagStore`].

pub mod config;
pub mod descriptor;
pub mod keys;
pub mod measure;
pub mod orchestrator;
pub mod policy;
pub mod store;
pub mod tags;

pub use config::CacheConfig;
pub use descriptor::{Operation, PkPredicate, QueryDescriptor, SqlParam};
pub use keys::{CacheKey, KeyDeriver};
pub use measure::{AccessKind, MeasurementSink, MetricsSink};
pub use orchestrator::{CacheOrchestrator, InvalidationStatus, WriteOutcome};
pub use policy::{CachePolicy, Decision, SkipReason};
pub use store::{
    CacheEntry, GenerationSnapshot, MemoryStore, SetOutcome, StoreError, TagStore,
};
pub use tags::{Tag, TagDeriver};
