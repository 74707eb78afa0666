//! Cache configuration.
//!
//! Injected by the host; loading it from a file is the host's concern. The
//! struct is `Deserialize` so hosts can embed a `[cache]` section in their own
//! configuration format.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_NAMESPACE: &str = "dispensa";
const DEFAULT_CAPACITY: usize = 2048;
const DEFAULT_INVALIDATION_RETRY_LIMIT: u32 = 3;
const DEFAULT_INVALIDATION_RETRY_BACKOFF_MS: u64 = 50;

fn default_markers() -> Vec<String> {
    [
        "random()",
        "rand()",
        "now()",
        "current_timestamp",
        "current_date",
        "current_time",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Cache configuration, injected at construction.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Master switch; off means every read skips the store.
    pub enabled: bool,
    /// Key namespace, folded into every derived key.
    pub namespace: String,
    /// Tables whose queries are never cached.
    pub excluded_tables: HashSet<String>,
    /// Lowercase substrings marking non-deterministic statements.
    pub non_deterministic_markers: Vec<String>,
    /// Enable row-level tags. Correctness-sensitive, see `TagDeriver::new`.
    pub row_level_tags: bool,
    /// Maximum entries in the in-memory store before LRU eviction.
    pub capacity: usize,
    /// Write-path invalidation attempts before deferring to the sweep.
    pub invalidation_retry_limit: u32,
    /// Base backoff between invalidation attempts; doubles per attempt.
    pub invalidation_retry_backoff_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: DEFAULT_NAMESPACE.to_string(),
            excluded_tables: HashSet::new(),
            non_deterministic_markers: default_markers(),
            row_level_tags: false,
            capacity: DEFAULT_CAPACITY,
            invalidation_retry_limit: DEFAULT_INVALIDATION_RETRY_LIMIT,
            invalidation_retry_backoff_ms: DEFAULT_INVALIDATION_RETRY_BACKOFF_MS,
        }
    }
}

impl CacheConfig {
    /// Returns the capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.capacity).unwrap_or(NonZeroUsize::MIN)
    }

    /// Base backoff between invalidation attempts.
    pub fn invalidation_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.invalidation_retry_backoff_ms)
    }
}
