//! Measurement sink for hit/miss observation.
//!
//! Optional collaborator: the orchestrator resolves one at construction and
//! tolerates its absence. The trait mirrors the start/end protocol of debug
//! collectors; [`MetricsSink`] is the production implementation, forwarding
//! counts to the `metrics` facade.

use std::collections::HashSet;

use metrics::counter;

use crate::descriptor::SqlParam;
use crate::keys::CacheKey;
use crate::tags::Tag;

const METRIC_HIT: &str = "dispensa_cache_hit_total";
const METRIC_MISS: &str = "dispensa_cache_miss_total";

/// How a lookup resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Hit,
    Miss,
}

/// Receives hit/miss events from the read path.
pub trait MeasurementSink: Send + Sync {
    /// Called before the store lookup begins.
    fn start_measuring(&self);

    /// Called once the lookup resolved, with the full query identity.
    fn end_measuring(
        &self,
        kind: AccessKind,
        key: &CacheKey,
        tags: &HashSet<Tag>,
        raw_text: &str,
        params: &[SqlParam],
    );
}

/// Sink that counts hits and misses via the `metrics` facade.
#[derive(Debug, Default)]
pub struct MetricsSink;

impl MetricsSink {
    pub fn new() -> Self {
        Self
    }
}

impl MeasurementSink for MetricsSink {
    fn start_measuring(&self) {}

    fn end_measuring(
        &self,
        kind: AccessKind,
        _key: &CacheKey,
        _tags: &HashSet<Tag>,
        _raw_text: &str,
        _params: &[SqlParam],
    ) {
        match kind {
            AccessKind::Hit => counter!(METRIC_HIT).increment(1),
            AccessKind::Miss => counter!(METRIC_MISS).increment(1),
        }
    }
}
