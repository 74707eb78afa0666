//! In-process tag store.
//!
//! Entry map, tag index, and generation stamps live under one `RwLock`, so
//! every mutating operation is atomic with respect to the index invariant:
//! every key reachable from the index maps to a live entry, and every live
//! entry's tags are all present in the index. The lock is never held across
//! an await point.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use metrics::counter;
use time::OffsetDateTime;

use crate::config::CacheConfig;
use crate::keys::CacheKey;
use crate::tags::Tag;

use super::lock::{rw_read, rw_write};
use super::{CacheEntry, GenerationSnapshot, SetOutcome, StoreError, TagStore};

const SOURCE: &str = "store::memory";

const METRIC_EVICT: &str = "dispensa_cache_evict_total";
const METRIC_INVALIDATED: &str = "dispensa_cache_invalidated_total";

struct StoreState {
    /// LRU-bounded entry map; eviction unregisters the key from the index.
    entries: LruCache<CacheKey, CacheEntry>,
    /// Tag → keys carrying it.
    index: HashMap<Tag, HashSet<CacheKey>>,
    /// Tag → generation stamp, bumped on every invalidation of the tag.
    /// Stamps outlive their index sets: a stale `set` racing a completed
    /// invalidation must still see the advanced generation.
    generations: HashMap<Tag, u64>,
}

/// In-memory [`TagStore`] with LRU capacity and per-tag generations.
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            state: RwLock::new(StoreState {
                entries: LruCache::new(config.capacity_non_zero()),
                index: HashMap::new(),
                generations: HashMap::new(),
            }),
        }
    }

    /// Number of tags currently carrying at least one key.
    pub fn tag_count(&self) -> usize {
        rw_read(&self.state, SOURCE, "tag_count").index.len()
    }

    #[cfg(test)]
    fn index_is_consistent(&self) -> bool {
        let state = rw_read(&self.state, SOURCE, "index_is_consistent");

        for (tag, keys) in &state.index {
            for key in keys {
                match state.entries.peek(key) {
                    Some(entry) if entry.tags.contains(tag) => {}
                    _ => return false,
                }
            }
        }
        for (key, entry) in state.entries.iter() {
            for tag in &entry.tags {
                match state.index.get(tag) {
                    Some(keys) if keys.contains(key) => {}
                    _ => return false,
                }
            }
        }
        true
    }
}

/// Remove `key` from every given tag's index set, dropping emptied sets.
fn unlink(index: &mut HashMap<Tag, HashSet<CacheKey>>, key: &CacheKey, tags: &HashSet<Tag>) {
    for tag in tags {
        if let Some(keys) = index.get_mut(tag) {
            keys.remove(key);
            if keys.is_empty() {
                index.remove(tag);
            }
        }
    }
}

#[async_trait]
impl TagStore for MemoryStore {
    async fn has(&self, key: &CacheKey) -> Result<bool, StoreError> {
        Ok(rw_read(&self.state, SOURCE, "has").entries.peek(key).is_some())
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>, StoreError> {
        // Write access so the LRU recency order sees the hit.
        Ok(rw_write(&self.state, SOURCE, "get")
            .entries
            .get(key)
            .map(|entry| entry.value.clone()))
    }

    async fn snapshot(&self, tags: &HashSet<Tag>) -> Result<GenerationSnapshot, StoreError> {
        let state = rw_read(&self.state, SOURCE, "snapshot");
        let stamps = tags
            .iter()
            .map(|tag| (tag.clone(), state.generations.get(tag).copied().unwrap_or(0)))
            .collect();
        Ok(GenerationSnapshot::new(stamps))
    }

    async fn set(
        &self,
        key: CacheKey,
        tags: HashSet<Tag>,
        value: Bytes,
        observed: &GenerationSnapshot,
    ) -> Result<SetOutcome, StoreError> {
        let mut guard = rw_write(&self.state, SOURCE, "set");
        let state = &mut *guard;

        let advanced = tags.iter().any(|tag| {
            state.generations.get(tag).copied().unwrap_or(0) > observed.stamp(tag)
        });
        if advanced {
            return Ok(SetOutcome::Stale);
        }

        // Overwrite: drop the key from the tags the old entry carried so the
        // index holds no orphans.
        if let Some(previous) = state.entries.peek(&key) {
            let previous_tags = previous.tags.clone();
            unlink(&mut state.index, &key, &previous_tags);
        }

        let entry = CacheEntry {
            value,
            tags: tags.clone(),
            created_at: OffsetDateTime::now_utc(),
        };

        if let Some((displaced_key, displaced)) = state.entries.push(key, entry) {
            // `push` hands back the replaced entry for the same key, or the
            // LRU victim when capacity overflowed.
            if displaced_key != key {
                unlink(&mut state.index, &displaced_key, &displaced.tags);
                counter!(METRIC_EVICT).increment(1);
            }
        }

        for tag in tags {
            state.index.entry(tag).or_default().insert(key);
        }

        Ok(SetOutcome::Stored)
    }

    async fn invalidate(&self, tags: &HashSet<Tag>) -> Result<usize, StoreError> {
        if tags.is_empty() {
            return Ok(0);
        }

        let mut guard = rw_write(&self.state, SOURCE, "invalidate");
        let state = &mut *guard;
        let mut removed = 0usize;

        for tag in tags {
            *state.generations.entry(tag.clone()).or_insert(0) += 1;

            let Some(keys) = state.index.remove(tag) else {
                continue;
            };
            for key in keys {
                if let Some(entry) = state.entries.pop(&key) {
                    removed += 1;
                    // The entry may carry further tags; clean those sets too.
                    unlink(&mut state.index, &key, &entry.tags);
                }
            }
        }

        if removed > 0 {
            counter!(METRIC_INVALIDATED).increment(removed as u64);
        }
        Ok(removed)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let mut guard = rw_write(&self.state, SOURCE, "flush");
        guard.entries.clear();
        guard.index.clear();
        guard.generations.clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(rw_read(&self.state, SOURCE, "len").entries.len())
    }
}
