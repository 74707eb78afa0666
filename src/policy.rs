//! Cacheability policy.
//!
//! Decides, per descriptor, whether the read path may touch the store at all.
//! Pure function of configuration and descriptor; skipping is a decision, not
//! an error, and is never surfaced to the caller as a failure.

use std::collections::HashSet;
use std::fmt;

use crate::config::CacheConfig;
use crate::descriptor::QueryDescriptor;

/// Outcome of a cacheability decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Cacheable,
    Skip(SkipReason),
}

impl Decision {
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Decision::Cacheable)
    }
}

/// Why a descriptor was not cacheable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Caching is globally disabled.
    Disabled,
    /// The statement is not a read.
    NonReadOperation,
    /// A referenced table is in the exclusion set.
    ExcludedTable(String),
    /// The statement matched a non-determinism marker.
    NonDeterministic,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Disabled => f.write_str("caching disabled"),
            SkipReason::NonReadOperation => f.write_str("non-read operation"),
            SkipReason::ExcludedTable(table) => write!(f, "excluded table `{table}`"),
            SkipReason::NonDeterministic => f.write_str("non-deterministic query"),
        }
    }
}

/// Ordered cacheability rules; first match wins.
pub struct CachePolicy {
    enabled: bool,
    excluded_tables: HashSet<String>,
    /// Lowercased substrings marking non-deterministic constructs. Detection
    /// is best-effort, not exhaustive.
    markers: Vec<String>,
}

impl CachePolicy {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            excluded_tables: config.excluded_tables.clone(),
            markers: config
                .non_deterministic_markers
                .iter()
                .map(|m| m.to_lowercase())
                .collect(),
        }
    }

    pub fn decide(&self, descriptor: &QueryDescriptor) -> Decision {
        if !self.enabled {
            return Decision::Skip(SkipReason::Disabled);
        }

        if !descriptor.operation.is_read() {
            return Decision::Skip(SkipReason::NonReadOperation);
        }

        if let Some(table) = descriptor
            .tables
            .iter()
            .find(|table| self.excluded_tables.contains(*table))
        {
            return Decision::Skip(SkipReason::ExcludedTable(table.clone()));
        }

        let lowered = descriptor.raw_text.to_lowercase();
        if self.markers.iter().any(|marker| lowered.contains(marker)) {
            return Decision::Skip(SkipReason::NonDeterministic);
        }

        Decision::Cacheable
    }
}
