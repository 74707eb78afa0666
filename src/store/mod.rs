//! Tag-indexed cache storage.
//!
//! [`TagStore`] is the seam the orchestrator talks to; the backing store
//! handle a host injects is any implementation of it. [`MemoryStore`] is the
//! in-process implementation. A remote implementation (shared across
//! processes) plugs in behind the same trait.

pub(crate) mod lock;
mod memory;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use time::OffsetDateTime;

use crate::keys::CacheKey;
use crate::tags::Tag;

pub use memory::MemoryStore;

/// Storage failure. Callers on the read path must degrade to a miss; the
/// write path retries and then defers, see the orchestrator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache backend unavailable: {reason}")]
    Unavailable { reason: String },
}

impl StoreError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}

/// One stored result with its invalidation tags.
///
/// Owned by the store. Entries may disappear at any time (capacity eviction);
/// absence is a miss, never an error.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Bytes,
    pub tags: HashSet<Tag>,
    pub created_at: OffsetDateTime,
}

/// Per-tag generation stamps observed by a read before it executed.
///
/// `invalidate` bumps a tag's generation; a `set` carrying a snapshot where
/// any tag has since advanced is rejected. This closes the window where a
/// read computed from pre-write data races a write's invalidation and would
/// otherwise repopulate the cache with stale rows.
#[derive(Debug, Clone, Default)]
pub struct GenerationSnapshot {
    stamps: HashMap<Tag, u64>,
}

impl GenerationSnapshot {
    pub(crate) fn new(stamps: HashMap<Tag, u64>) -> Self {
        Self { stamps }
    }

    /// The generation observed for a tag; tags never invalidated are at 0.
    pub fn stamp(&self, tag: &Tag) -> u64 {
        self.stamps.get(tag).copied().unwrap_or(0)
    }
}

/// Result of a guarded `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Stored,
    /// A tag's generation advanced past the caller's snapshot; nothing was
    /// written.
    Stale,
}

/// Tag-indexed key-value store: get/set by key, invalidate by tag.
///
/// Implementations keep the entry map and the tag index mutually consistent
/// under every mutating operation: a concurrent reader never observes a key
/// present in the index but absent from the entry map, or vice versa, beyond
/// what it takes for the two updates to appear atomic.
#[async_trait]
pub trait TagStore: Send + Sync {
    /// Existence probe. A `true` result is only a hint; it may race with a
    /// concurrent invalidation. `get` is authoritative.
    async fn has(&self, key: &CacheKey) -> Result<bool, StoreError>;

    /// The stored value, or `None` on a miss. Never errors for absence.
    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>, StoreError>;

    /// Capture the current generation stamps for `tags`. The read path calls
    /// this before executing the query, and hands the snapshot to `set`.
    async fn snapshot(&self, tags: &HashSet<Tag>) -> Result<GenerationSnapshot, StoreError>;

    /// Store `value` under `key`, registered under every tag in `tags`.
    ///
    /// Rejected as [`SetOutcome::Stale`] when any tag's generation advanced
    /// past `observed`. Overwriting an entry that carried different tags
    /// removes the key from the stale tags' index sets first.
    async fn set(
        &self,
        key: CacheKey,
        tags: HashSet<Tag>,
        value: Bytes,
        observed: &GenerationSnapshot,
    ) -> Result<SetOutcome, StoreError>;

    /// Drain every given tag's index set, delete the referenced entries, and
    /// bump each tag's generation. Returns the number of entries deleted.
    /// Safe with an empty set and with tags that have no live entries;
    /// idempotent.
    async fn invalidate(&self, tags: &HashSet<Tag>) -> Result<usize, StoreError>;

    /// Drop every entry and the whole tag index.
    async fn flush(&self) -> Result<(), StoreError>;

    /// Number of live entries.
    async fn len(&self) -> Result<usize, StoreError>;
}
