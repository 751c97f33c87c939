//! Sync orchestrator composing detection, scan, validation, diff and sweep.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use assetsync_cache::{CacheSnapshot, CacheStore, ConsistencyReport, StoredRecord};
use assetsync_common::{
    AssetId, Category, Error, Result, RevisionToken, SourcePath, SyncState, SyncStatePatch,
    SyncStatus,
};
use assetsync_manifest::{IndexSummary, ManifestValidator, RawRecord, Record};
use assetsync_source::SourceOfTruth;

use crate::detector::ChangeDetector;
use crate::orphan::OrphanSweeper;
use crate::reconcile::Reconciler;
use crate::report::{CycleMode, CycleReport, InvalidRecord};
use crate::retry::{RetryConfig, RetryExecutor};
use crate::scanner::RepositoryScanner;
use crate::scheduler::{SyncMode, SyncRequest, SyncScheduler, SyncSchedulerHandle};
use crate::writeback::WriteBackCoordinator;

/// Default lifetime of the cross-process cycle lease.
pub const DEFAULT_CYCLE_LEASE: Duration = Duration::from_secs(15 * 60);

/// Configuration for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Subtree of the source of truth holding the manifests.
    pub root: SourcePath,
    /// Maximum number of retries for read-side source calls.
    pub max_retries: u32,
    /// Initial delay between those retries.
    pub retry_delay: Duration,
    /// Sync mode.
    pub sync_mode: SyncMode,
    /// How long a persisted `syncing` status blocks other engines sharing
    /// the cache. Past it the holder is presumed crashed.
    pub cycle_lease: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root: SourcePath::root(),
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            sync_mode: SyncMode::Manual,
            cycle_lease: DEFAULT_CYCLE_LEASE,
        }
    }
}

impl SyncConfig {
    fn retry_executor(&self) -> RetryExecutor {
        RetryExecutor::new(RetryConfig::new(self.max_retries).with_initial_delay(self.retry_delay))
    }
}

/// Reachability of one collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn from_result(name: &str, result: Result<()>) -> Self {
        Self {
            name: name.to_string(),
            healthy: result.is_ok(),
            error: result.err().map(|e| e.to_string()),
        }
    }
}

/// Outcome of a health check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub source: ComponentHealth,
    pub cache: ComponentHealth,
    /// CategoryIndex check; absent when the cache is unreachable.
    pub consistency: Option<ConsistencyReport>,
    pub state: Option<SyncState>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.source.healthy
            && self.cache.healthy
            && self
                .consistency
                .as_ref()
                .map(|c| c.is_consistent())
                .unwrap_or(false)
    }
}

/// Main engine keeping the cache consistent with the source of truth.
///
/// At most one cycle runs at a time within a process; a second request
/// while one is running fails with `SyncInProgress`. Write-backs do not
/// take the cycle lock.
pub struct SyncEngine<S: SourceOfTruth + ?Sized, C: CacheStore + ?Sized> {
    source: Arc<S>,
    cache: Arc<C>,
    detector: ChangeDetector,
    scanner: RepositoryScanner,
    validator: ManifestValidator,
    reconciler: Reconciler,
    sweeper: OrphanSweeper,
    writer: WriteBackCoordinator<S, C>,
    /// Held for the duration of a cycle.
    cycle_lock: Mutex<()>,
    /// Parent of every cycle's cancellation token.
    cancel: CancellationToken,
    scheduler: Option<SyncScheduler>,
    config: SyncConfig,
}

impl<S: SourceOfTruth + 'static, C: CacheStore + 'static> SyncEngine<S, C> {
    /// Create a new sync engine.
    pub fn new(source: S, cache: C, config: SyncConfig) -> Self {
        Self::from_arc(Arc::new(source), Arc::new(cache), config)
    }
}

impl<S: SourceOfTruth + ?Sized + 'static, C: CacheStore + ?Sized + 'static> SyncEngine<S, C> {
    /// Create a new sync engine from Arc-wrapped collaborators.
    pub fn from_arc(source: Arc<S>, cache: Arc<C>, config: SyncConfig) -> Self {
        let retry = config.retry_executor();
        Self {
            writer: WriteBackCoordinator::new(source.clone(), cache.clone(), config.root.clone()),
            source,
            cache,
            detector: ChangeDetector::new(retry.clone()),
            scanner: RepositoryScanner::new(config.root.clone(), retry),
            validator: ManifestValidator::new(),
            reconciler: Reconciler::new(),
            sweeper: OrphanSweeper::new(),
            cycle_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
            scheduler: None,
            config,
        }
    }

    /// Initialize the scheduler and return a handle for running it.
    pub fn init_scheduler(&mut self) -> SyncSchedulerHandle {
        let (scheduler, handle) = SyncScheduler::new(self.config.sync_mode.clone());
        self.scheduler = Some(scheduler);
        handle
    }

    /// Get the scheduler for requesting syncs.
    pub fn scheduler(&self) -> Option<&SyncScheduler> {
        self.scheduler.as_ref()
    }

    /// Token that cancels the running cycle and every later one.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Write path back to the source of truth.
    pub fn writer(&self) -> &WriteBackCoordinator<S, C> {
        &self.writer
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Scan unconditionally and converge the cache.
    pub async fn sync_full(&self) -> Result<CycleReport> {
        self.run_cycle(CycleMode::Full, &self.cancel.child_token())
            .await
    }

    /// Converge the cache only if the source revision moved.
    pub async fn sync_incremental(&self) -> Result<CycleReport> {
        self.run_cycle(CycleMode::Incremental, &self.cancel.child_token())
            .await
    }

    /// Process a sync request from the scheduler.
    pub async fn process_request(&self, request: SyncRequest) -> Result<CycleReport> {
        match request {
            SyncRequest::Full => self.sync_full().await,
            SyncRequest::Incremental => self.sync_incremental().await,
            SyncRequest::Shutdown => Err(Error::InvalidInput(
                "Shutdown is handled by the scheduler".to_string(),
            )),
        }
    }

    /// Run one cycle.
    ///
    /// # Postconditions
    /// - On success the cache holds exactly the valid scanned records and
    ///   the sync state carries the scanned revision with status `idle`
    /// - On failure committed record writes stand, the revision token is
    ///   not advanced and status is `failed` if the cache is reachable
    ///
    /// # Errors
    /// - `SyncInProgress` if another cycle holds the engine, or another
    ///   engine sharing the cache holds an unexpired `syncing` lease
    /// - `SourceUnavailable` / `StoreUnavailable` on transport failure
    /// - `Cancelled` if `cancel` fired between record writes
    pub async fn run_cycle(&self, mode: CycleMode, cancel: &CancellationToken) -> Result<CycleReport> {
        let _guard = self
            .cycle_lock
            .try_lock()
            .map_err(|_| Error::SyncInProgress)?;

        let cycle_id = Uuid::new_v4();
        let span = info_span!("sync_cycle", cycle_id = %cycle_id, mode = %mode);
        self.execute_cycle(cycle_id, mode, cancel)
            .instrument(span)
            .await
    }

    async fn execute_cycle(
        &self,
        cycle_id: Uuid,
        mode: CycleMode,
        cancel: &CancellationToken,
    ) -> Result<CycleReport> {
        let start = Instant::now();
        info!("Starting sync cycle");

        let state = self.cache.sync_state().await.map_err(|e| {
            error!(error = %e, "Could not read sync state");
            e
        })?;

        let started_at = Utc::now().timestamp();
        let lease = i64::try_from(self.config.cycle_lease.as_secs()).unwrap_or(i64::MAX);
        if state.lease_held(started_at, lease) {
            warn!(
                sync_started_at = state.sync_started_at,
                "Another engine holds the sync lease; rejecting cycle"
            );
            return Err(Error::SyncInProgress);
        }
        if state.status == SyncStatus::Syncing {
            warn!(
                sync_started_at = state.sync_started_at,
                "Sync lease expired; treating the previous cycle as crashed"
            );
        }

        // Nothing is written before the detector has answered.
        let detection = self
            .detector
            .should_rescan(&*self.source, &state)
            .await
            .map_err(|e| {
                error!(error = %e, reason = e.reason(), "Revision check failed; state left unchanged");
                e
            })?;

        // A cycle that failed or crashed at this revision must be redone.
        if mode == CycleMode::Incremental && !detection.rescan && state.status == SyncStatus::Idle {
            info!(revision = %detection.token, "Source unchanged; skipping scan");
            let mut report = CycleReport::new(cycle_id, mode, detection.token);
            report.skipped = true;
            report.duration_ms = start.elapsed().as_millis() as u64;
            return Ok(report);
        }

        self.cache
            .commit_sync_state(&SyncStatePatch::started(started_at))
            .await?;

        match self
            .converge(cycle_id, mode, detection.token, cancel, start)
            .await
        {
            Ok(report) => Ok(report),
            Err(e) => {
                error!(error = %e, reason = e.reason(), "Sync cycle failed");
                if let Err(mark) = self
                    .cache
                    .commit_sync_state(&SyncStatePatch::status(SyncStatus::Failed))
                    .await
                {
                    warn!(error = %mark, "Could not mark sync state as failed");
                }
                Err(e)
            }
        }
    }

    async fn converge(
        &self,
        cycle_id: Uuid,
        mode: CycleMode,
        token: RevisionToken,
        cancel: &CancellationToken,
        start: Instant,
    ) -> Result<CycleReport> {
        let raw = self.scanner.scan(&*self.source, &token).await?;
        let (records, invalid, duplicates) = self.validate_all(raw);
        let snapshot = self.cache.snapshot().await?;

        let mut changes = self.reconciler.diff(&records, &snapshot);
        let protected = Self::protected_ids(&snapshot, &invalid);
        changes.retain(&protected);

        let mut report = CycleReport::new(cycle_id, mode, token.clone());
        for failure in invalid.into_iter().chain(duplicates) {
            warn!(path = %failure.path, reasons = ?failure.reasons, "Skipping invalid record");
            report.record_invalid(failure);
        }

        let now = Utc::now().timestamp();
        for record in &changes.to_create {
            self.apply(record, now, now, cancel).await?;
            debug!(id = %record.id, "Created");
            report.created.push(record.id.clone());
        }
        for record in &changes.to_update {
            let created_at = snapshot
                .entries
                .get(&record.id)
                .and_then(|entry| entry.created_at)
                .unwrap_or(now);
            self.apply(record, created_at, now, cancel).await?;
            debug!(id = %record.id, "Updated");
            report.updated.push(record.id.clone());
        }
        report.unchanged = changes.unchanged.len();

        let mut current: BTreeSet<AssetId> = records.iter().map(|r| r.id.clone()).collect();
        current.extend(protected);
        let sweep = self
            .sweeper
            .sweep(
                &*self.cache,
                &current,
                &snapshot.ids(),
                &snapshot.unresolved,
                cancel,
            )
            .await?;
        report.deleted = sweep.removed;
        report.inconsistencies = sweep.inconsistencies;

        self.cache
            .commit_sync_state(&SyncStatePatch::completed(
                Utc::now().timestamp(),
                token,
                current.len() as u64,
            ))
            .await?;

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            revision = %report.revision,
            created = report.created.len(),
            updated = report.updated.len(),
            deleted = report.deleted.len(),
            unchanged = report.unchanged,
            invalid = report.invalid_count,
            duration_ms = report.duration_ms,
            "Sync cycle completed"
        );
        Ok(report)
    }

    /// Write one record as a single atomic unit, unless cancelled first.
    async fn apply(
        &self,
        record: &Record,
        created_at: i64,
        now: i64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let summary = record.summary();
        self.cache
            .write_record(&StoredRecord::new(record.clone(), created_at, now), &summary)
            .await
    }

    /// Validate every raw record, isolating failures.
    ///
    /// Records are visited in path order so that, when two manifests share
    /// an id, the one with the smallest path wins. Returns the valid records,
    /// the validation failures and the duplicate-id losers.
    fn validate_all(
        &self,
        mut raw: Vec<RawRecord>,
    ) -> (Vec<Record>, Vec<InvalidRecord>, Vec<InvalidRecord>) {
        raw.sort_by_cached_key(|r| r.path.to_string());

        let mut records = Vec::with_capacity(raw.len());
        let mut invalid = Vec::new();
        let mut duplicates = Vec::new();
        let mut seen: HashMap<AssetId, SourcePath> = HashMap::new();

        for item in &raw {
            match self.validator.parse(item) {
                Ok(record) => {
                    if let Some(first) = seen.get(&record.id) {
                        duplicates.push(InvalidRecord {
                            path: item.path.to_string(),
                            reasons: vec![format!(
                                "[id] duplicate id '{}', already defined at {}",
                                record.id, first
                            )],
                        });
                        continue;
                    }
                    seen.insert(record.id.clone(), record.source_path.clone());
                    records.push(record);
                }
                Err(e) => invalid.push(e.into()),
            }
        }
        (records, invalid, duplicates)
    }

    /// Cached ids whose file still exists but no longer validates.
    ///
    /// Such records are kept as last synced rather than swept. Duplicate-id
    /// losers are valid manifests and protect nothing.
    fn protected_ids(snapshot: &CacheSnapshot, invalid: &[InvalidRecord]) -> BTreeSet<AssetId> {
        let paths: HashSet<&str> = invalid.iter().map(|i| i.path.as_str()).collect();
        snapshot
            .entries
            .values()
            .filter(|entry| {
                entry
                    .source_path
                    .as_deref()
                    .is_some_and(|path| paths.contains(path))
            })
            .map(|entry| entry.id.clone())
            .collect()
    }

    /// Check source and cache reachability and the category index.
    pub async fn health(&self) -> HealthReport {
        let source = ComponentHealth::from_result(self.source.name(), self.source.health_check().await);
        let cache = ComponentHealth::from_result(self.cache.name(), self.cache.health_check().await);

        let (consistency, state) = if cache.healthy {
            let consistency = match self.cache.snapshot().await {
                Ok(snapshot) => Some(snapshot.consistency()),
                Err(e) => {
                    warn!(error = %e, "Could not read cache snapshot");
                    None
                }
            };
            (consistency, self.cache.sync_state().await.ok())
        } else {
            (None, None)
        };

        HealthReport {
            source,
            cache,
            consistency,
            state,
        }
    }

    /// Summaries, optionally for one category, sorted by id.
    pub async fn list(&self, category: Option<Category>) -> Result<Vec<IndexSummary>> {
        self.cache.summaries(category).await
    }

    pub async fn get(&self, id: &AssetId) -> Result<Option<StoredRecord>> {
        self.cache.get_record(id).await
    }

    /// Most recently touched ids, newest first.
    pub async fn recent_changes(&self, count: usize) -> Result<Vec<String>> {
        self.cache.recent_changes(count).await
    }

    pub async fn status(&self) -> Result<SyncState> {
        self.cache.sync_state().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetsync_cache::MemoryCache;
    use assetsync_source::MemorySource;

    fn manifest(id: &str, category: &str, version: &str) -> String {
        format!(
            "id: {id}\nversion: {version}\ncategory: {category}\nname: {id}\ndescription: The {id} asset\n"
        )
    }

    fn engine(source: &MemorySource, cache: &MemoryCache) -> SyncEngine<MemorySource, MemoryCache> {
        let config = SyncConfig {
            max_retries: 0,
            ..Default::default()
        };
        SyncEngine::new(source.clone(), cache.clone(), config)
    }

    #[tokio::test]
    async fn test_concurrent_cycle_is_rejected() {
        let source = MemorySource::new();
        let cache = MemoryCache::new();
        let engine = engine(&source, &cache);

        let _held = engine.cycle_lock.lock().await;
        assert!(matches!(engine.sync_full().await, Err(Error::SyncInProgress)));
    }

    #[tokio::test]
    async fn test_duplicate_ids_keep_smallest_path() {
        let source = MemorySource::new();
        let cache = MemoryCache::new();
        source.put("b/dup/manifest.yaml", manifest("dup", "tool", "2.0.0"));
        source.put("a/dup/manifest.yaml", manifest("dup", "tool", "1.0.0"));

        let report = engine(&source, &cache).sync_full().await.unwrap();

        assert_eq!(report.created, vec![AssetId::new("dup").unwrap()]);
        assert_eq!(report.invalid.len(), 1);
        assert_eq!(report.invalid[0].path, "b/dup/manifest.yaml");
        assert!(report.invalid[0].reasons[0].contains("duplicate id"));

        let stored = cache.get_record(&AssetId::new("dup").unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.record.version, "1.0.0");
    }

    #[tokio::test]
    async fn test_record_turning_invalid_is_kept() {
        let source = MemorySource::new();
        let cache = MemoryCache::new();
        let engine = engine(&source, &cache);
        source.put("tools/a/manifest.yaml", manifest("a", "tool", "1.0.0"));
        engine.sync_full().await.unwrap();

        source.put("tools/a/manifest.yaml", "id: a\nversion: broken\n");
        let report = engine.sync_full().await.unwrap();

        assert!(report.deleted.is_empty());
        assert_eq!(report.invalid_count, 1);
        let stored = cache.get_record(&AssetId::new("a").unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.record.version, "1.0.0");
        assert_eq!(cache.sync_state().await.unwrap().record_count, 1);
    }

    #[tokio::test]
    async fn test_failed_status_forces_rescan() {
        let source = MemorySource::new();
        let cache = MemoryCache::new();
        let engine = engine(&source, &cache);
        source.put("tools/a/manifest.yaml", manifest("a", "tool", "1.0.0"));
        engine.sync_full().await.unwrap();

        cache
            .commit_sync_state(&SyncStatePatch::status(SyncStatus::Failed))
            .await
            .unwrap();
        let report = engine.sync_incremental().await.unwrap();
        assert!(!report.skipped);
        assert_eq!(cache.sync_state().await.unwrap().status, SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_lease_held_by_other_engine_rejects_cycle() {
        let source = MemorySource::new();
        let cache = MemoryCache::new();
        source.put("tools/a/manifest.yaml", manifest("a", "tool", "1.0.0"));

        // A second process sharing the cache has just entered `syncing`.
        cache
            .commit_sync_state(&SyncStatePatch::started(Utc::now().timestamp()))
            .await
            .unwrap();

        let other = engine(&source, &cache);
        assert!(matches!(other.sync_full().await, Err(Error::SyncInProgress)));
        assert!(matches!(other.sync_incremental().await, Err(Error::SyncInProgress)));

        // Rejection writes nothing.
        assert!(cache.get_record(&AssetId::new("a").unwrap()).await.unwrap().is_none());
        assert_eq!(cache.sync_state().await.unwrap().status, SyncStatus::Syncing);
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let source = MemorySource::new();
        let cache = MemoryCache::new();
        source.put("tools/a/manifest.yaml", manifest("a", "tool", "1.0.0"));

        let crashed_at = Utc::now().timestamp() - 2 * DEFAULT_CYCLE_LEASE.as_secs() as i64;
        cache
            .commit_sync_state(&SyncStatePatch::started(crashed_at))
            .await
            .unwrap();

        let report = engine(&source, &cache).sync_incremental().await.unwrap();
        assert_eq!(report.created, vec![AssetId::new("a").unwrap()]);

        let state = cache.sync_state().await.unwrap();
        assert_eq!(state.status, SyncStatus::Idle);
        assert!(state.sync_started_at > crashed_at);
    }

    #[tokio::test]
    async fn test_completion_time_not_before_record_writes() {
        let source = MemorySource::new();
        let cache = MemoryCache::new();
        source.put("tools/a/manifest.yaml", manifest("a", "tool", "1.0.0"));

        engine(&source, &cache).sync_full().await.unwrap();

        let stored = cache.get_record(&AssetId::new("a").unwrap()).await.unwrap().unwrap();
        let state = cache.sync_state().await.unwrap();
        assert!(state.last_sync_time >= stored.updated_at);
        assert!(state.last_sync_time >= state.sync_started_at);
    }

    #[tokio::test]
    async fn test_duplicate_id_at_cached_path_does_not_protect_old_record() {
        let source = MemorySource::new();
        let cache = MemoryCache::new();
        let engine = engine(&source, &cache);
        source.put("tools/old/manifest.yaml", manifest("old", "tool", "1.0.0"));
        engine.sync_full().await.unwrap();

        // The old record's file now defines `a`, which loses to tools/a.
        source.put("tools/a/manifest.yaml", manifest("a", "tool", "1.0.0"));
        source.put("tools/old/manifest.yaml", manifest("a", "tool", "2.0.0"));
        let report = engine.sync_full().await.unwrap();

        assert_eq!(report.created, vec![AssetId::new("a").unwrap()]);
        assert_eq!(report.deleted, vec![AssetId::new("old").unwrap()]);
        assert_eq!(report.invalid_count, 1);
        assert_eq!(report.invalid[0].path, "tools/old/manifest.yaml");
        assert!(cache.get_record(&AssetId::new("old").unwrap()).await.unwrap().is_none());
        assert_eq!(cache.sync_state().await.unwrap().record_count, 1);
    }

    #[tokio::test]
    async fn test_health_reports_each_side() {
        let source = MemorySource::new();
        let cache = MemoryCache::new();
        let engine = engine(&source, &cache);

        let report = engine.health().await;
        assert!(report.is_healthy());

        source.set_unavailable(true);
        let report = engine.health().await;
        assert!(!report.source.healthy);
        assert!(report.cache.healthy);
        assert!(!report.is_healthy());

        cache.set_unavailable(true);
        let report = engine.health().await;
        assert!(!report.cache.healthy);
        assert!(report.consistency.is_none());
    }

    #[tokio::test]
    async fn test_process_request_routes_modes() {
        let source = MemorySource::new();
        let cache = MemoryCache::new();
        let engine = engine(&source, &cache);
        source.put("prompts/p/manifest.yaml", manifest("p", "prompt", "1.0.0"));

        let first = engine.process_request(SyncRequest::Incremental).await.unwrap();
        assert_eq!(first.created.len(), 1);
        let second = engine.process_request(SyncRequest::Incremental).await.unwrap();
        assert!(second.skipped);
        let third = engine.process_request(SyncRequest::Full).await.unwrap();
        assert!(!third.skipped);
        assert_eq!(third.unchanged, 1);
        assert!(engine.process_request(SyncRequest::Shutdown).await.is_err());
    }
}
