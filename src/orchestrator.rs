//! Cache-aside orchestration.
//!
//! The two interception points of the host's data-access layer: reads go
//! through [`CacheOrchestrator::run_cached_select`], mutations through
//! [`CacheOrchestrator::run_invalidating_mutation`]. The orchestrator owns
//! no execution: it is handed a closure per call and invokes it at most once.
//!
//! Cache failures on the read path degrade to direct execution; a read must
//! never fail because the cache is unreachable. Write-path invalidation
//! failures are retried, then deferred to a sweep and surfaced in the
//! returned [`WriteOutcome`].

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, instrument, warn};

use crate::config::CacheConfig;
use crate::descriptor::QueryDescriptor;
use crate::keys::KeyDeriver;
use crate::measure::{AccessKind, MeasurementSink};
use crate::policy::{CachePolicy, Decision};
use crate::store::lock::mutex_lock;
use crate::store::{SetOutcome, StoreError, TagStore};
use crate::tags::{Tag, TagDeriver};

const SOURCE: &str = "orchestrator";

/// How a mutation's invalidation went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationStatus {
    /// Invalidation reached the store; `entries` were removed.
    Applied { entries: usize },
    /// Every attempt failed; the tags are queued for
    /// [`CacheOrchestrator::run_pending_sweep`]. Callers that cannot
    /// tolerate staleness can fail their request on this.
    Deferred { tags: HashSet<Tag> },
}

impl InvalidationStatus {
    pub fn is_deferred(&self) -> bool {
        matches!(self, InvalidationStatus::Deferred { .. })
    }
}

/// A mutation's result together with its invalidation status.
#[derive(Debug)]
pub struct WriteOutcome<T> {
    pub value: T,
    pub invalidation: InvalidationStatus,
}

/// Tags whose invalidation was deferred after exhausted retries.
#[derive(Default)]
struct PendingInvalidations {
    tags: Mutex<HashSet<Tag>>,
}

impl PendingInvalidations {
    fn record(&self, tags: &HashSet<Tag>) {
        mutex_lock(&self.tags, SOURCE, "record").extend(tags.iter().cloned());
    }

    fn snapshot(&self) -> HashSet<Tag> {
        mutex_lock(&self.tags, SOURCE, "snapshot").clone()
    }

    fn forget(&self, tags: &HashSet<Tag>) {
        let mut pending = mutex_lock(&self.tags, SOURCE, "forget");
        for tag in tags {
            pending.remove(tag);
        }
    }
}

/// Read- and write-path coordinator.
///
/// Constructed once with its collaborators; the measurement sink is optional
/// and its absence is a valid state, not an error.
pub struct CacheOrchestrator {
    policy: CachePolicy,
    keys: KeyDeriver,
    tags: TagDeriver,
    store: Arc<dyn TagStore>,
    sink: Option<Arc<dyn MeasurementSink>>,
    retry_limit: u32,
    retry_backoff: Duration,
    pending: PendingInvalidations,
}

impl CacheOrchestrator {
    pub fn new(config: &CacheConfig, store: Arc<dyn TagStore>) -> Self {
        Self {
            policy: CachePolicy::new(config),
            keys: KeyDeriver::new(config.namespace.clone()),
            tags: TagDeriver::new(config.row_level_tags),
            store,
            sink: None,
            retry_limit: config.invalidation_retry_limit,
            retry_backoff: config.invalidation_retry_backoff(),
            pending: PendingInvalidations::default(),
        }
    }

    /// Attach a measurement sink.
    pub fn with_sink(mut self, sink: Arc<dyn MeasurementSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// The underlying store handle.
    pub fn store(&self) -> &Arc<dyn TagStore> {
        &self.store
    }

    /// Run a read through the cache.
    ///
    /// Non-cacheable descriptors execute directly with no store interaction.
    /// For cacheable ones the returned value is either a previously stored
    /// result for an identical `(raw_text, params)` or the output of a fresh
    /// `execute()` call, never a value computed by a different query. The
    /// executor's error propagates unchanged, and nothing is stored when it
    /// fails.
    #[instrument(skip_all, fields(tables = ?descriptor.tables))]
    pub async fn run_cached_select<T, E, F, Fut>(
        &self,
        descriptor: &QueryDescriptor,
        execute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Decision::Skip(reason) = self.policy.decide(descriptor) {
            debug!(outcome = "skip", reason = %reason, "query not cacheable");
            return execute().await;
        }

        let key = self.keys.key(descriptor);
        let tags = self.tags.tags(descriptor);

        if let Some(sink) = &self.sink {
            sink.start_measuring();
        }

        // Captured before execute() so an invalidation landing in between
        // advances past this snapshot and our set is rejected.
        let snapshot = match self.store.snapshot(&tags).await {
            Ok(snapshot) => Some(snapshot),
            Err(error) => {
                warn!(%error, "store unavailable, degrading to direct execution");
                None
            }
        };

        let cached = if snapshot.is_some() {
            match self.store.get(&key).await {
                Ok(found) => found,
                Err(error) => {
                    warn!(%error, "store lookup failed, treating as miss");
                    None
                }
            }
        } else {
            None
        };

        if let Some(bytes) = cached {
            match serde_json::from_slice(&bytes) {
                Ok(value) => {
                    debug!(key = %key, outcome = "hit", "serving cached result");
                    if let Some(sink) = &self.sink {
                        sink.end_measuring(
                            AccessKind::Hit,
                            &key,
                            &tags,
                            &descriptor.raw_text,
                            &descriptor.params,
                        );
                    }
                    return Ok(value);
                }
                Err(error) => {
                    warn!(key = %key, %error, "cached payload failed to decode, treating as miss");
                }
            }
        }

        debug!(key = %key, outcome = "miss", "executing query");
        if let Some(sink) = &self.sink {
            sink.end_measuring(
                AccessKind::Miss,
                &key,
                &tags,
                &descriptor.raw_text,
                &descriptor.params,
            );
        }

        let value = execute().await?;

        if let Some(snapshot) = snapshot {
            match serde_json::to_vec(&value) {
                Ok(encoded) => {
                    match self
                        .store
                        .set(key, tags, Bytes::from(encoded), &snapshot)
                        .await
                    {
                        Ok(SetOutcome::Stored) => debug!(key = %key, "result cached"),
                        Ok(SetOutcome::Stale) => {
                            debug!(key = %key, "set rejected, tag generation advanced during execution");
                        }
                        Err(error) => warn!(%error, "store unavailable, result not cached"),
                    }
                }
                Err(error) => warn!(%error, "result not serializable, not cached"),
            }
        }

        Ok(value)
    }

    /// Run a mutation, invalidating its tags first.
    ///
    /// Invalidation happens before the mutation executes so stale entries
    /// leave the cache promptly; the generation protocol covers the window a
    /// concurrent read could otherwise exploit. The mutation always runs,
    /// even when invalidation was deferred — cache unavailability must never
    /// make the underlying data unreachable.
    #[instrument(skip_all, fields(tables = ?descriptor.tables))]
    pub async fn run_invalidating_mutation<T, E, F, Fut>(
        &self,
        descriptor: &QueryDescriptor,
        execute: F,
    ) -> Result<WriteOutcome<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let tags = self.tags.tags(descriptor);
        let invalidation = self.invalidate_with_retry(&tags).await;
        let value = execute().await?;
        Ok(WriteOutcome {
            value,
            invalidation,
        })
    }

    async fn invalidate_with_retry(&self, tags: &HashSet<Tag>) -> InvalidationStatus {
        if tags.is_empty() {
            return InvalidationStatus::Applied { entries: 0 };
        }

        let attempts = self.retry_limit.max(1);
        for attempt in 1..=attempts {
            match self.store.invalidate(tags).await {
                Ok(entries) => {
                    info!(tag_count = tags.len(), entries, "tags invalidated");
                    return InvalidationStatus::Applied { entries };
                }
                Err(error) => {
                    warn!(attempt, %error, "invalidation attempt failed");
                    if attempt < attempts {
                        tokio::time::sleep(self.retry_backoff * 2u32.pow(attempt - 1)).await;
                    }
                }
            }
        }

        error!(
            tag_count = tags.len(),
            "invalidation exhausted retries, tags deferred to sweep"
        );
        self.pending.record(tags);
        InvalidationStatus::Deferred { tags: tags.clone() }
    }

    /// Retry every deferred invalidation once.
    ///
    /// Intended to run periodically from the host. Tags leave the pending
    /// set only when the store confirms the invalidation.
    pub async fn run_pending_sweep(&self) -> Result<usize, StoreError> {
        let tags = self.pending.snapshot();
        if tags.is_empty() {
            return Ok(0);
        }

        match self.store.invalidate(&tags).await {
            Ok(entries) => {
                self.pending.forget(&tags);
                info!(tag_count = tags.len(), entries, "deferred invalidation applied");
                Ok(entries)
            }
            Err(error) => {
                warn!(%error, "sweep failed, tags remain deferred");
                Err(error)
            }
        }
    }

    /// Tags currently awaiting re-invalidation.
    pub fn pending_tags(&self) -> HashSet<Tag> {
        self.pending.snapshot()
    }
}
