//! End-to-end cache-aside behavior through the orchestrator.
//!
//! Exercises the read and write paths together against the in-memory store:
//! hit/miss accounting, invalidation fan-out, row-level precision, the
//! read-repopulation race, and degradation when the backend misbehaves.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use dispensa::{
    CacheConfig, CacheKey, CacheOrchestrator, GenerationSnapshot, MemoryStore, Operation,
    PkPredicate, QueryDescriptor, SetOutcome, SqlParam, StoreError, Tag, TagStore,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Row {
    id: i64,
    name: String,
}

fn row(id: i64, name: &str) -> Row {
    Row {
        id,
        name: name.to_string(),
    }
}

fn pinned_select(pk: i64) -> QueryDescriptor {
    QueryDescriptor::select(
        vec!["users".to_string()],
        "select * from users where id = ?",
        vec![SqlParam::Int(pk)],
    )
    .with_pk_predicate(PkPredicate::new("users", "id", SqlParam::Int(pk)))
}

fn point_update(pk: i64) -> QueryDescriptor {
    QueryDescriptor::mutation(
        Operation::Update,
        "users",
        "update users set name = ? where id = ?",
        vec![SqlParam::Text("updated".to_string()), SqlParam::Int(pk)],
    )
    .with_pk_predicate(PkPredicate::new("users", "id", SqlParam::Int(pk)))
}

async fn cached_read(
    orchestrator: &CacheOrchestrator,
    descriptor: &QueryDescriptor,
    calls: &AtomicUsize,
    result: Vec<Row>,
) -> Vec<Row> {
    let outcome: Result<Vec<Row>, Infallible> = orchestrator
        .run_cached_select(descriptor, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(result)
        })
        .await;
    outcome.expect("read")
}

#[tokio::test]
async fn identical_reads_share_one_execution() {
    let config = CacheConfig::default();
    let orchestrator = CacheOrchestrator::new(&config, Arc::new(MemoryStore::new(&config)));
    let calls = AtomicUsize::new(0);

    let d = pinned_select(1);
    let first = cached_read(&orchestrator, &d, &calls, vec![row(1, "ada")]).await;
    let second = cached_read(&orchestrator, &d, &calls, vec![row(1, "stale clone")]).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first, second);
    assert_eq!(second, vec![row(1, "ada")]);
}

#[tokio::test]
async fn different_parameters_execute_separately() {
    let config = CacheConfig::default();
    let orchestrator = CacheOrchestrator::new(&config, Arc::new(MemoryStore::new(&config)));
    let calls = AtomicUsize::new(0);

    cached_read(&orchestrator, &pinned_select(1), &calls, vec![row(1, "ada")]).await;
    cached_read(&orchestrator, &pinned_select(2), &calls, vec![row(2, "grace")]).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn mutation_invalidates_cached_joins_on_either_table() {
    let config = CacheConfig::default();
    let orchestrator = CacheOrchestrator::new(&config, Arc::new(MemoryStore::new(&config)));
    let calls = AtomicUsize::new(0);

    let join = QueryDescriptor::select(
        vec!["users".to_string(), "orders".to_string()],
        "select u.name, o.total from users u join orders o on o.user_id = u.id",
        vec![],
    );
    cached_read(&orchestrator, &join, &calls, vec![row(1, "ada")]).await;
    cached_read(&orchestrator, &join, &calls, vec![row(1, "ada")]).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A write to the joined table must drop the cached join result.
    let mutation = QueryDescriptor::mutation(
        Operation::Insert,
        "orders",
        "insert into orders (user_id, total) values (?, ?)",
        vec![SqlParam::Int(1), SqlParam::Int(40)],
    );
    orchestrator
        .run_invalidating_mutation(&mutation, || async { Ok::<_, Infallible>(1u64) })
        .await
        .expect("mutation");

    cached_read(&orchestrator, &join, &calls, vec![row(1, "ada")]).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn row_level_mode_spares_reads_pinned_to_other_rows() {
    let config = CacheConfig {
        row_level_tags: true,
        ..Default::default()
    };
    let orchestrator = CacheOrchestrator::new(&config, Arc::new(MemoryStore::new(&config)));
    let calls = AtomicUsize::new(0);

    cached_read(&orchestrator, &pinned_select(5), &calls, vec![row(5, "ada")]).await;
    cached_read(&orchestrator, &pinned_select(7), &calls, vec![row(7, "grace")]).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    orchestrator
        .run_invalidating_mutation(&point_update(5), || async { Ok::<_, Infallible>(1u64) })
        .await
        .expect("mutation");

    // Row 7's entry survives the point write to row 5; row 5 re-executes.
    cached_read(&orchestrator, &pinned_select(7), &calls, vec![row(7, "grace")]).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    cached_read(&orchestrator, &pinned_select(5), &calls, vec![row(5, "updated")]).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn table_level_mode_sweeps_all_rows_of_the_table() {
    let config = CacheConfig::default();
    let orchestrator = CacheOrchestrator::new(&config, Arc::new(MemoryStore::new(&config)));
    let calls = AtomicUsize::new(0);

    cached_read(&orchestrator, &pinned_select(5), &calls, vec![row(5, "ada")]).await;
    cached_read(&orchestrator, &pinned_select(7), &calls, vec![row(7, "grace")]).await;

    orchestrator
        .run_invalidating_mutation(&point_update(5), || async { Ok::<_, Infallible>(1u64) })
        .await
        .expect("mutation");

    // Without row tags both entries carry only the table tag and both die.
    cached_read(&orchestrator, &pinned_select(7), &calls, vec![row(7, "grace")]).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn read_racing_a_write_cannot_repopulate_stale_rows() {
    let config = CacheConfig::default();
    let store = Arc::new(MemoryStore::new(&config));
    let orchestrator = Arc::new(CacheOrchestrator::new(&config, store.clone()));

    let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

    // The read captures its generation snapshot, misses, and then stalls
    // inside execute() with pre-write data.
    let reader = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            let result: Result<Vec<Row>, Infallible> = orchestrator
                .run_cached_select(&pinned_select(1), || async move {
                    started_tx.send(()).expect("signal");
                    release_rx.await.expect("release");
                    Ok(vec![row(1, "pre-write")])
                })
                .await;
            result.expect("read")
        })
    };

    started_rx.await.expect("reader started");

    // The write invalidates and commits while the read is still executing.
    orchestrator
        .run_invalidating_mutation(&point_update(1), || async { Ok::<_, Infallible>(1u64) })
        .await
        .expect("mutation");

    release_tx.send(()).expect("release reader");
    let stale = reader.await.expect("reader task");
    assert_eq!(stale, vec![row(1, "pre-write")]);

    // The stale set was rejected by the generation check: the next read
    // misses and re-executes against post-write data.
    let calls = AtomicUsize::new(0);
    let fresh = cached_read(
        &orchestrator,
        &pinned_select(1),
        &calls,
        vec![row(1, "post-write")],
    )
    .await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(fresh, vec![row(1, "post-write")]);
}

/// Delegates to an inner store, failing `invalidate` a set number of times.
struct FlakyStore {
    inner: MemoryStore,
    invalidate_failures: AtomicUsize,
}

impl FlakyStore {
    fn new(config: &CacheConfig, failures: usize) -> Self {
        Self {
            inner: MemoryStore::new(config),
            invalidate_failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl TagStore for FlakyStore {
    async fn has(&self, key: &CacheKey) -> Result<bool, StoreError> {
        self.inner.has(key).await
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>, StoreError> {
        self.inner.get(key).await
    }

    async fn snapshot(&self, tags: &HashSet<Tag>) -> Result<GenerationSnapshot, StoreError> {
        self.inner.snapshot(tags).await
    }

    async fn set(
        &self,
        key: CacheKey,
        tags: HashSet<Tag>,
        value: Bytes,
        observed: &GenerationSnapshot,
    ) -> Result<SetOutcome, StoreError> {
        self.inner.set(key, tags, value, observed).await
    }

    async fn invalidate(&self, tags: &HashSet<Tag>) -> Result<usize, StoreError> {
        let remaining = self.invalidate_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.invalidate_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::unavailable("simulated outage"));
        }
        self.inner.invalidate(tags).await
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.inner.flush().await
    }

    async fn len(&self) -> Result<usize, StoreError> {
        self.inner.len().await
    }
}

#[tokio::test]
async fn deferred_invalidation_is_surfaced_and_swept_after_recovery() {
    let config = CacheConfig {
        invalidation_retry_limit: 2,
        invalidation_retry_backoff_ms: 1,
        ..Default::default()
    };
    let store = Arc::new(FlakyStore::new(&config, 2));
    let orchestrator = CacheOrchestrator::new(&config, store.clone());
    let calls = AtomicUsize::new(0);

    cached_read(&orchestrator, &pinned_select(1), &calls, vec![row(1, "ada")]).await;

    let outcome = orchestrator
        .run_invalidating_mutation(&point_update(1), || async { Ok::<_, Infallible>(1u64) })
        .await
        .expect("mutation");
    assert!(outcome.invalidation.is_deferred());
    assert_eq!(
        orchestrator.pending_tags(),
        HashSet::from([Tag::table("users")])
    );
    // The stale entry is still present until the sweep runs.
    assert_eq!(store.len().await.expect("len"), 1);

    let removed = orchestrator.run_pending_sweep().await.expect("sweep");
    assert_eq!(removed, 1);
    assert!(orchestrator.pending_tags().is_empty());
    assert_eq!(store.len().await.expect("len"), 0);
}

/// Store whose backend never answers.
struct DownStore;

#[async_trait]
impl TagStore for DownStore {
    async fn has(&self, _key: &CacheKey) -> Result<bool, StoreError> {
        Err(StoreError::unavailable("backend down"))
    }

    async fn get(&self, _key: &CacheKey) -> Result<Option<Bytes>, StoreError> {
        Err(StoreError::unavailable("backend down"))
    }

    async fn snapshot(&self, _tags: &HashSet<Tag>) -> Result<GenerationSnapshot, StoreError> {
        Err(StoreError::unavailable("backend down"))
    }

    async fn set(
        &self,
        _key: CacheKey,
        _tags: HashSet<Tag>,
        _value: Bytes,
        _observed: &GenerationSnapshot,
    ) -> Result<SetOutcome, StoreError> {
        Err(StoreError::unavailable("backend down"))
    }

    async fn invalidate(&self, _tags: &HashSet<Tag>) -> Result<usize, StoreError> {
        Err(StoreError::unavailable("backend down"))
    }

    async fn flush(&self) -> Result<(), StoreError> {
        Err(StoreError::unavailable("backend down"))
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Err(StoreError::unavailable("backend down"))
    }
}

#[tokio::test]
async fn reads_behave_as_if_caching_were_disabled_while_the_store_is_down() {
    let config = CacheConfig::default();
    let orchestrator = CacheOrchestrator::new(&config, Arc::new(DownStore));
    let calls = AtomicUsize::new(0);

    let d = pinned_select(1);
    let first = cached_read(&orchestrator, &d, &calls, vec![row(1, "ada")]).await;
    let second = cached_read(&orchestrator, &d, &calls, vec![row(1, "ada")]).await;

    // Every read executes exactly once, results are intact.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(first, second);
}
