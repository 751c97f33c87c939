//! End-to-end sync cycles against in-memory and local collaborators.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};

use assetsync_cache::{
    keys, CacheSnapshot, CacheStore, KeyValue, MemoryCache, StoredRecord,
};
use assetsync_common::{
    AssetId, Category, Error, Result, SyncState, SyncStatePatch, SyncStatus,
};
use assetsync_manifest::IndexSummary;
use assetsync_source::{LocalSource, MemorySource, SourceOfTruth};
use assetsync_sync::{
    CancellationToken, CycleMode, SyncConfig, SyncEngine, WriteOptions,
};

fn manifest(id: &str, category: &str, version: &str) -> String {
    format!(
        "id: {id}\nversion: {version}\ncategory: {category}\nname: {id}\ndescription: The {id} asset\n"
    )
}

fn path(id: &str, category: Category) -> String {
    format!("{}/{}/manifest.yaml", category.directory(), id)
}

fn id(raw: &str) -> AssetId {
    AssetId::new(raw).unwrap()
}

fn config() -> SyncConfig {
    SyncConfig {
        max_retries: 0,
        ..Default::default()
    }
}

fn engine<C: CacheStore + 'static>(source: &MemorySource, cache: C) -> SyncEngine<MemorySource, C> {
    SyncEngine::new(source.clone(), cache, config())
}

/// Every key except the sync-state hash, which records the cycle time.
fn record_keys(cache: &MemoryCache) -> BTreeMap<String, KeyValue> {
    let mut dump = cache.dump();
    dump.remove(keys::SYNC_STATE);
    dump
}

fn detail_field(cache: &MemoryCache, id: &str, field: &str) -> Option<String> {
    match cache.dump().get(&keys::detail_key(id)) {
        Some(KeyValue::Hash(map)) => map.get(field).cloned(),
        _ => None,
    }
}

#[tokio::test]
async fn test_first_cycle_creates_record() {
    let source = MemorySource::new();
    let cache = MemoryCache::new();
    source.put(&path("a", Category::Tool), manifest("a", "tool", "1.0.0"));

    let report = engine(&source, cache.clone()).sync_full().await.unwrap();

    assert_eq!(report.created, vec![id("a")]);
    assert!(report.updated.is_empty() && report.deleted.is_empty());

    match cache.dump().get(keys::SUMMARY_INDEX) {
        Some(KeyValue::Hash(index)) => {
            let summary = IndexSummary::from_json(&index["a"]).unwrap();
            assert_eq!(summary.version, "1.0.0");
            assert_eq!(summary.category, Category::Tool);
        }
        other => panic!("summary index missing: {:?}", other),
    }
    assert_eq!(detail_field(&cache, "a", "version").as_deref(), Some("1.0.0"));

    let state = cache.sync_state().await.unwrap();
    assert_eq!(state.status, SyncStatus::Idle);
    assert_eq!(state.record_count, 1);
    assert_eq!(state.last_revision_token, source.latest_revision().await.unwrap());
    assert_eq!(cache.recent_changes(10).await.unwrap(), vec!["a".to_string()]);
}

#[tokio::test]
async fn test_unchanged_source_makes_zero_writes() {
    let source = MemorySource::new();
    let cache = MemoryCache::new();
    source.put(&path("a", Category::Tool), manifest("a", "tool", "1.0.0"));
    let engine = engine(&source, cache.clone());
    engine.sync_full().await.unwrap();

    let writes = cache.write_count();
    let before = cache.dump();
    let report = engine.sync_incremental().await.unwrap();

    assert!(report.skipped);
    assert_eq!(report.changed(), 0);
    assert_eq!(cache.write_count(), writes);
    assert_eq!(cache.dump(), before);
}

#[tokio::test]
async fn test_update_and_delete_in_one_cycle() {
    let source = MemorySource::new();
    let cache = MemoryCache::new();
    source.put(&path("a", Category::Tool), manifest("a", "tool", "1.0.0"));
    source.put(&path("b", Category::Prompt), manifest("b", "prompt", "1.0.0"));
    let engine = engine(&source, cache.clone());
    engine.sync_full().await.unwrap();
    let created_at = detail_field(&cache, "a", "createdAt");

    source.put(&path("a", Category::Tool), manifest("a", "tool", "1.1.0"));
    source.remove(&path("b", Category::Prompt));
    let report = engine.sync_incremental().await.unwrap();

    assert_eq!(report.updated, vec![id("a")]);
    assert_eq!(report.deleted, vec![id("b")]);
    assert!(report.created.is_empty());
    assert_eq!(detail_field(&cache, "a", "version").as_deref(), Some("1.1.0"));
    assert_eq!(detail_field(&cache, "a", "createdAt"), created_at);
}

#[tokio::test]
async fn test_second_full_cycle_is_idempotent() {
    let source = MemorySource::new();
    let cache = MemoryCache::new();
    source.put(&path("a", Category::Tool), manifest("a", "tool", "1.0.0"));
    source.put(&path("b", Category::Skill), manifest("b", "skill", "0.1.0"));
    source.put(&path("c", Category::Prompt), manifest("c", "prompt", "2.0.0"));
    let engine = engine(&source, cache.clone());

    engine.sync_full().await.unwrap();
    let before = record_keys(&cache);
    let report = engine.sync_full().await.unwrap();

    assert!(!report.skipped);
    assert_eq!(report.changed(), 0);
    assert_eq!(report.unchanged, 3);
    assert_eq!(record_keys(&cache), before);
}

#[tokio::test]
async fn test_cycle_converges_after_many_edits() {
    let source = MemorySource::new();
    let cache = MemoryCache::new();
    let engine = engine(&source, cache.clone());

    for (name, category) in [("a", "tool"), ("b", "tool"), ("c", "prompt"), ("d", "skill")] {
        let category_value: Category = category.parse().unwrap();
        source.put(&path(name, category_value), manifest(name, category, "1.0.0"));
    }
    engine.sync_full().await.unwrap();

    source.remove(&path("a", Category::Tool));
    source.put(&path("b", Category::Tool), manifest("b", "tool", "1.0.1"));
    source.remove(&path("c", Category::Prompt));
    source.put(&path("c", Category::Skill), manifest("c", "skill", "1.0.0"));
    source.put(&path("e", Category::Prompt), manifest("e", "prompt", "3.0.0"));
    engine.sync_full().await.unwrap();

    let snapshot: CacheSnapshot = cache.snapshot().await.unwrap();
    assert_eq!(snapshot.ids(), BTreeSet::from([id("b"), id("c"), id("d"), id("e")]));
    assert!(snapshot.consistency().is_consistent());

    let c = cache.get_record(&id("c")).await.unwrap().unwrap();
    assert_eq!(c.record.category, Category::Skill);
    assert_eq!(c.record.source_path.to_string(), "skills/c/manifest.yaml");
    assert_eq!(
        c.record.content_fingerprint,
        source.fingerprint("skills/c/manifest.yaml").unwrap()
    );
    assert!(cache.category_members(Category::Prompt).await.unwrap().contains("e"));
    assert!(!cache.category_members(Category::Prompt).await.unwrap().contains("c"));
    assert_eq!(cache.sync_state().await.unwrap().record_count, 4);
}

#[tokio::test]
async fn test_orphan_removal_leaves_others_untouched() {
    let source = MemorySource::new();
    let cache = MemoryCache::new();
    source.put(&path("keep", Category::Tool), manifest("keep", "tool", "1.0.0"));
    source.put(&path("gone", Category::Tool), manifest("gone", "tool", "1.0.0"));
    let engine = engine(&source, cache.clone());
    engine.sync_full().await.unwrap();
    let keep_before = cache.dump().get(&keys::detail_key("keep")).cloned();

    source.remove(&path("gone", Category::Tool));
    let report = engine.sync_full().await.unwrap();

    assert_eq!(report.deleted, vec![id("gone")]);
    let dump = cache.dump();
    assert!(!dump.contains_key(&keys::detail_key("gone")));
    assert!(cache.get_summary(&id("gone")).await.unwrap().is_none());
    assert_eq!(
        cache.category_members(Category::Tool).await.unwrap(),
        BTreeSet::from(["keep".to_string()])
    );
    assert_eq!(dump.get(&keys::detail_key("keep")).cloned(), keep_before);
}

#[tokio::test]
async fn test_stale_write_back_conflicts_and_leaves_cache() {
    let source = MemorySource::new();
    let cache = MemoryCache::new();
    let a_path = path("a", Category::Tool);
    let original = source.put(&a_path, manifest("a", "tool", "1.0.0"));
    let engine = engine(&source, cache.clone());
    engine.sync_full().await.unwrap();

    // Someone else commits first.
    source.put(&a_path, manifest("a", "tool", "1.0.1"));
    let before = cache.dump();

    let result = engine
        .writer()
        .write_back(
            &id("a"),
            &manifest("a", "tool", "2.0.0"),
            &original,
            &WriteOptions::default(),
        )
        .await;

    assert!(matches!(result, Err(Error::Conflict { .. })));
    assert_eq!(cache.dump(), before);
}

#[tokio::test]
async fn test_write_back_keeps_revision_token() {
    let source = MemorySource::new();
    let cache = MemoryCache::new();
    let fingerprint = source.put(&path("a", Category::Tool), manifest("a", "tool", "1.0.0"));
    let engine = engine(&source, cache.clone());
    engine.sync_full().await.unwrap();
    let token = cache.sync_state().await.unwrap().last_revision_token;

    engine
        .writer()
        .write_back(&id("a"), &manifest("a", "tool", "1.2.0"), &fingerprint, &WriteOptions::default())
        .await
        .unwrap();
    assert_eq!(cache.sync_state().await.unwrap().last_revision_token, token);

    // The next cycle sees the moved revision but finds nothing to do.
    let report = engine.sync_incremental().await.unwrap();
    assert!(!report.skipped);
    assert_eq!(report.changed(), 0);
}

#[tokio::test]
async fn test_malformed_record_is_reported_not_blocking() {
    let source = MemorySource::new();
    let cache = MemoryCache::new();
    for name in ["a", "b", "c"] {
        source.put(&path(name, Category::Tool), manifest(name, "tool", "1.0.0"));
    }
    source.put("tools/broken/manifest.yaml", "id: broken\ncategory: gadget\n");

    let report = engine(&source, cache.clone()).sync_full().await.unwrap();

    assert_eq!(report.created, vec![id("a"), id("b"), id("c")]);
    assert_eq!(report.invalid_count, 1);
    assert_eq!(report.invalid[0].path, "tools/broken/manifest.yaml");
    assert!(report.invalid[0].reasons.len() > 1);
    assert!(cache.get_record(&id("broken")).await.unwrap().is_none());
    assert_eq!(cache.sync_state().await.unwrap().status, SyncStatus::Idle);
}

#[tokio::test]
async fn test_unavailable_source_leaves_state_unchanged() {
    let source = MemorySource::new();
    let cache = MemoryCache::new();
    source.put(&path("a", Category::Tool), manifest("a", "tool", "1.0.0"));
    let engine = engine(&source, cache.clone());
    engine.sync_full().await.unwrap();
    let state = cache.sync_state().await.unwrap();
    let writes = cache.write_count();

    source.set_unavailable(true);
    let result = engine.sync_incremental().await;

    assert!(matches!(result, Err(Error::SourceUnavailable(_))));
    assert_eq!(cache.sync_state().await.unwrap(), state);
    assert_eq!(cache.write_count(), writes);
}

#[tokio::test]
async fn test_scan_failure_marks_cycle_failed() {
    let source = MemorySource::new();
    let cache = MemoryCache::new();
    source.put(&path("a", Category::Tool), manifest("a", "tool", "1.0.0"));
    source.put(&path("b", Category::Tool), manifest("b", "tool", "1.0.0"));
    source.set_fail_scan_after(Some(1));

    let result = engine(&source, cache.clone()).sync_full().await;

    assert!(matches!(result, Err(Error::SourceUnavailable(_))));
    let state = cache.sync_state().await.unwrap();
    assert_eq!(state.status, SyncStatus::Failed);
    assert!(state.last_revision_token.is_empty());
    assert!(cache.snapshot().await.unwrap().entries.is_empty());
}

/// Memory cache whose record writes start failing after a budget.
#[derive(Clone)]
struct FlakyCache {
    inner: MemoryCache,
    remaining: Arc<AtomicUsize>,
}

impl FlakyCache {
    fn new(inner: MemoryCache, budget: usize) -> Self {
        Self {
            inner,
            remaining: Arc::new(AtomicUsize::new(budget)),
        }
    }

    fn refill(&self, budget: usize) {
        self.remaining.store(budget, Ordering::SeqCst);
    }
}

#[async_trait]
impl CacheStore for FlakyCache {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn write_record(&self, record: &StoredRecord, summary: &IndexSummary) -> Result<()> {
        let left = self.remaining.load(Ordering::SeqCst);
        if left == 0 {
            return Err(Error::StoreUnavailable("connection refused".to_string()));
        }
        self.remaining.store(left - 1, Ordering::SeqCst);
        self.inner.write_record(record, summary).await
    }

    async fn delete_record(&self, id: &AssetId) -> Result<()> {
        self.inner.delete_record(id).await
    }

    async fn commit_sync_state(&self, patch: &SyncStatePatch) -> Result<()> {
        self.inner.commit_sync_state(patch).await
    }

    async fn sync_state(&self) -> Result<SyncState> {
        self.inner.sync_state().await
    }

    async fn get_record(&self, id: &AssetId) -> Result<Option<StoredRecord>> {
        self.inner.get_record(id).await
    }

    async fn get_summary(&self, id: &AssetId) -> Result<Option<IndexSummary>> {
        self.inner.get_summary(id).await
    }

    async fn summaries(&self, category: Option<Category>) -> Result<Vec<IndexSummary>> {
        self.inner.summaries(category).await
    }

    async fn category_members(&self, category: Category) -> Result<BTreeSet<String>> {
        self.inner.category_members(category).await
    }

    async fn snapshot(&self) -> Result<CacheSnapshot> {
        self.inner.snapshot().await
    }

    async fn recent_changes(&self, count: usize) -> Result<Vec<String>> {
        self.inner.recent_changes(count).await
    }

    async fn health_check(&self) -> Result<()> {
        self.inner.health_check().await
    }
}

#[tokio::test]
async fn test_store_failure_keeps_committed_writes_and_retries() {
    let source = MemorySource::new();
    let memory = MemoryCache::new();
    for name in ["a", "b", "c"] {
        source.put(&path(name, Category::Tool), manifest(name, "tool", "1.0.0"));
    }
    let flaky = FlakyCache::new(memory.clone(), 2);
    let engine = engine(&source, flaky.clone());

    let result = engine.sync_full().await;
    assert!(matches!(result, Err(Error::StoreUnavailable(_))));

    let state = memory.sync_state().await.unwrap();
    assert_eq!(state.status, SyncStatus::Failed);
    assert!(state.last_revision_token.is_empty());
    assert_eq!(memory.snapshot().await.unwrap().entries.len(), 2);
    assert!(memory.snapshot().await.unwrap().consistency().is_consistent());

    flaky.refill(usize::MAX);
    let report = engine.sync_incremental().await.unwrap();
    assert_eq!(report.created, vec![id("c")]);
    assert_eq!(report.unchanged, 2);
    assert_eq!(memory.sync_state().await.unwrap().status, SyncStatus::Idle);
}

#[tokio::test]
async fn test_cancelled_cycle_does_not_advance_token() {
    let source = MemorySource::new();
    let cache = MemoryCache::new();
    source.put(&path("a", Category::Tool), manifest("a", "tool", "1.0.0"));
    let engine = engine(&source, cache.clone());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = engine.run_cycle(CycleMode::Full, &cancel).await;

    assert!(matches!(result, Err(Error::Cancelled)));
    let state = cache.sync_state().await.unwrap();
    assert_eq!(state.status, SyncStatus::Failed);
    assert!(state.last_revision_token.is_empty());
    assert!(cache.get_record(&id("a")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_broken_category_index_is_repaired() {
    let source = MemorySource::new();
    let cache = MemoryCache::new();
    source.put(&path("a", Category::Tool), manifest("a", "tool", "1.0.0"));
    let engine = engine(&source, cache.clone());
    engine.sync_full().await.unwrap();

    cache.insert_raw(
        &keys::category_key(Category::Tool),
        KeyValue::Set(BTreeSet::new()),
    );
    cache.insert_raw(
        &keys::category_key(Category::Prompt),
        KeyValue::Set(BTreeSet::from(["a".to_string()])),
    );
    assert!(!cache.snapshot().await.unwrap().consistency().is_consistent());

    let report = engine.sync_full().await.unwrap();
    assert_eq!(report.updated, vec![id("a")]);
    assert!(cache.snapshot().await.unwrap().consistency().is_consistent());
    assert!(engine.health().await.is_healthy());
}

#[tokio::test]
async fn test_local_directory_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(LocalSource::new(dir.path()).unwrap());
    let cache = Arc::new(MemoryCache::new());
    let engine = SyncEngine::from_arc(source.clone(), cache.clone(), config());

    let created = engine
        .writer()
        .create(&manifest("fetch", "tool", "1.0.0"), &WriteOptions::default())
        .await
        .unwrap();
    assert!(dir.path().join("tools/fetch/manifest.yaml").exists());

    let report = engine.sync_full().await.unwrap();
    assert_eq!(report.unchanged, 1);
    assert_eq!(report.changed(), 0);

    engine
        .writer()
        .delete(&id("fetch"), &created.fingerprint, &WriteOptions::default())
        .await
        .unwrap();
    assert!(!dir.path().join("tools/fetch/manifest.yaml").exists());

    let report = engine.sync_full().await.unwrap();
    assert_eq!(report.changed(), 0);
    assert_eq!(cache.sync_state().await.unwrap().record_count, 0);
}

/// Holds every record write until released, so a cycle can be caught
/// mid-flight.
#[derive(Clone)]
struct GatedCache {
    inner: MemoryCache,
    entered: Arc<Notify>,
    release: Arc<Semaphore>,
}

impl GatedCache {
    fn new(inner: MemoryCache) -> Self {
        Self {
            inner,
            entered: Arc::new(Notify::new()),
            release: Arc::new(Semaphore::new(0)),
        }
    }
}

#[async_trait]
impl CacheStore for GatedCache {
    fn name(&self) -> &str {
        "gated"
    }

    async fn write_record(&self, record: &StoredRecord, summary: &IndexSummary) -> Result<()> {
        self.entered.notify_one();
        let _permit = self
            .release
            .acquire()
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;
        self.inner.write_record(record, summary).await
    }

    async fn delete_record(&self, id: &AssetId) -> Result<()> {
        self.inner.delete_record(id).await
    }

    async fn commit_sync_state(&self, patch: &SyncStatePatch) -> Result<()> {
        self.inner.commit_sync_state(patch).await
    }

    async fn sync_state(&self) -> Result<SyncState> {
        self.inner.sync_state().await
    }

    async fn get_record(&self, id: &AssetId) -> Result<Option<StoredRecord>> {
        self.inner.get_record(id).await
    }

    async fn get_summary(&self, id: &AssetId) -> Result<Option<IndexSummary>> {
        self.inner.get_summary(id).await
    }

    async fn summaries(&self, category: Option<Category>) -> Result<Vec<IndexSummary>> {
        self.inner.summaries(category).await
    }

    async fn category_members(&self, category: Category) -> Result<BTreeSet<String>> {
        self.inner.category_members(category).await
    }

    async fn snapshot(&self) -> Result<CacheSnapshot> {
        self.inner.snapshot().await
    }

    async fn recent_changes(&self, count: usize) -> Result<Vec<String>> {
        self.inner.recent_changes(count).await
    }

    async fn health_check(&self) -> Result<()> {
        self.inner.health_check().await
    }
}

#[tokio::test]
async fn test_engines_sharing_a_cache_never_overlap() {
    let source = MemorySource::new();
    let memory = MemoryCache::new();
    source.put(&path("a", Category::Tool), manifest("a", "tool", "1.0.0"));

    let gated = GatedCache::new(memory.clone());
    let first = engine(&source, gated.clone());
    let running = tokio::spawn(async move { first.sync_full().await });
    gated.entered.notified().await;

    // A second engine, as a separate process would have, sees the lease.
    let second = engine(&source, memory.clone());
    assert!(matches!(second.sync_full().await, Err(Error::SyncInProgress)));
    assert_eq!(memory.sync_state().await.unwrap().status, SyncStatus::Syncing);

    gated.release.add_permits(1);
    let report = running.await.unwrap().unwrap();
    assert_eq!(report.created, vec![id("a")]);
    assert_eq!(memory.sync_state().await.unwrap().status, SyncStatus::Idle);

    // Once released, the other engine runs normally.
    let report = second.sync_full().await.unwrap();
    assert_eq!(report.unchanged, 1);
}
