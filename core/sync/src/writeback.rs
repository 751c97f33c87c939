//! Cache-side writes committed back to the source of truth.
//!
//! Every write is guarded by the fingerprint the caller last saw; the source
//! of truth performs the check and serializes concurrent writers. The cache
//! applies no locking of its own and is refreshed only after the source
//! accepted the write.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use assetsync_cache::{CacheStore, StoredRecord};
use assetsync_common::{
    AssetId, Error, Fingerprint, Result, SourcePath, SyncStatePatch, ValidationError,
};
use assetsync_manifest::{Manifest, ManifestValidator, Record, MANIFEST_FILENAMES};
use assetsync_source::SourceOfTruth;

/// Caller-supplied commit metadata.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub author: Option<String>,
    /// Replaces the default `"{Action} asset: {id}"` message.
    pub message: Option<String>,
    /// Increment the patch version before submitting.
    pub bump_version: bool,
}

impl WriteOptions {
    fn commit_message(&self, action: &str, id: &AssetId) -> String {
        let mut message = self
            .message
            .clone()
            .unwrap_or_else(|| format!("{} asset: {}", action, id));
        if let Some(author) = &self.author {
            message.push_str(&format!("\n\nAuthor: {}", author));
        }
        message
    }
}

/// Result of an accepted write.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct WriteBackOutcome {
    pub id: AssetId,
    pub path: SourcePath,
    /// Fingerprint of the content now stored at the source of truth.
    pub fingerprint: Fingerprint,
    pub version: String,
}

/// Executes create, update and delete against the source of truth.
pub struct WriteBackCoordinator<S: SourceOfTruth + ?Sized, C: CacheStore + ?Sized> {
    source: Arc<S>,
    cache: Arc<C>,
    root: SourcePath,
    validator: ManifestValidator,
}

impl<S: SourceOfTruth + ?Sized, C: CacheStore + ?Sized> WriteBackCoordinator<S, C> {
    /// `root` is the subtree new manifests are created under.
    pub fn new(source: Arc<S>, cache: Arc<C>, root: SourcePath) -> Self {
        Self {
            source,
            cache,
            root,
            validator: ManifestValidator::new(),
        }
    }

    fn validate(&self, path: &str, content: &str) -> Result<Manifest> {
        self.validator
            .validate_document(path, content)
            .map_err(Error::Validation)
    }

    async fn existing(&self, id: &AssetId) -> Result<StoredRecord> {
        self.cache
            .get_record(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Asset not found: {}", id)))
    }

    /// Store the accepted record in the cache and bump the sync time.
    ///
    /// The revision token is left alone: a single-record write is not a
    /// full rescan.
    async fn refresh_cache(&self, record: Record, created_at: i64, now: i64) -> Result<()> {
        let summary = record.summary();
        let stored = StoredRecord::new(record, created_at, now);
        let refreshed = async {
            self.cache.write_record(&stored, &summary).await?;
            self.cache
                .commit_sync_state(&SyncStatePatch::touched_at(now))
                .await
        }
        .await;
        if let Err(e) = &refreshed {
            warn!(
                id = %stored.record.id,
                error = %e,
                "Source accepted the write but the cache refresh failed; the next sync will reconcile"
            );
        }
        refreshed
    }

    /// Replace an existing record's manifest.
    ///
    /// # Preconditions
    /// - `id` is cached
    /// - `content` is a manifest whose `id` equals `id`
    ///
    /// # Errors
    /// - `NotFound` if `id` is not cached
    /// - `Validation` if `content` is malformed; nothing is sent
    /// - `Conflict` if the source's fingerprint is no longer `expected`;
    ///   the cache is untouched
    /// - `SourceUnavailable` on transport failure; never retried here
    pub async fn write_back(
        &self,
        id: &AssetId,
        content: &str,
        expected: &Fingerprint,
        options: &WriteOptions,
    ) -> Result<WriteBackOutcome> {
        let existing = self.existing(id).await?;
        let path = existing.record.source_path.clone();
        let label = path.to_string();

        let mut manifest = self.validate(&label, content)?;
        if manifest.id != id.as_str() {
            return Err(Error::Validation(ValidationError::new(
                &label,
                format!("[id] '{}' does not match the asset being written ('{}')", manifest.id, id),
            )));
        }

        let body = if options.bump_version {
            manifest.bump_patch_version()?;
            manifest.to_yaml()?
        } else {
            content.to_string()
        };

        let message = options.commit_message("Update", id);
        let fingerprint = self
            .source
            .write_file(&path, body.into_bytes(), Some(expected), &message)
            .await?;
        info!(id = %id, path = %path, fingerprint = %fingerprint, "Wrote asset back to source");

        let record = Record::from_manifest(manifest, path.clone(), fingerprint.clone())?;
        let version = record.version.clone();
        self.refresh_cache(record, existing.created_at, Utc::now().timestamp())
            .await?;

        Ok(WriteBackOutcome {
            id: id.clone(),
            path,
            fingerprint,
            version,
        })
    }

    /// Create a new record at `{root}/{category}s/{id}/manifest.yaml`.
    ///
    /// # Errors
    /// - `Validation` if `content` is malformed
    /// - `AlreadyExists` if the id is already cached
    /// - `Conflict` if a file already exists at the target path
    pub async fn create(&self, content: &str, options: &WriteOptions) -> Result<WriteBackOutcome> {
        let mut manifest = self.validate(MANIFEST_FILENAMES[0], content)?;
        let id = AssetId::new(manifest.id.as_str())?;

        if self.cache.get_record(&id).await?.is_some()
            || self.cache.get_summary(&id).await?.is_some()
        {
            return Err(Error::AlreadyExists(format!("Asset already exists: {}", id)));
        }

        let path = self
            .root
            .join(manifest.category.directory())?
            .join(id.as_str())?
            .join(MANIFEST_FILENAMES[0])?;

        let body = if options.bump_version {
            manifest.bump_patch_version()?;
            manifest.to_yaml()?
        } else {
            content.to_string()
        };

        let message = options.commit_message("Create", &id);
        let fingerprint = self
            .source
            .write_file(&path, body.into_bytes(), None, &message)
            .await?;
        info!(id = %id, path = %path, "Created asset at source");

        let record = Record::from_manifest(manifest, path.clone(), fingerprint.clone())?;
        let version = record.version.clone();
        let now = Utc::now().timestamp();
        self.refresh_cache(record, now, now).await?;

        Ok(WriteBackOutcome {
            id,
            path,
            fingerprint,
            version,
        })
    }

    /// Delete a record's file at the source, then its cache entry.
    ///
    /// # Errors
    /// - `NotFound` if the id is not cached or the file is already gone
    /// - `Conflict` if the source's fingerprint is no longer `expected`
    pub async fn delete(
        &self,
        id: &AssetId,
        expected: &Fingerprint,
        options: &WriteOptions,
    ) -> Result<SourcePath> {
        let existing = self.existing(id).await?;
        let path = existing.record.source_path;

        let message = options.commit_message("Delete", id);
        self.source.delete_file(&path, expected, &message).await?;
        info!(id = %id, path = %path, "Deleted asset at source");

        self.cache.delete_record(id).await?;
        self.cache
            .commit_sync_state(&SyncStatePatch::touched_at(Utc::now().timestamp()))
            .await?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetsync_cache::MemoryCache;
    use assetsync_common::Category;
    use assetsync_source::MemorySource;

    const PATH: &str = "tools/http_request/manifest.yaml";

    fn manifest(version: &str) -> String {
        format!(
            "id: http_request\nversion: {version}\ncategory: tool\nname: HTTP Request\ndescription: Perform HTTP calls\n"
        )
    }

    /// Source and cache both holding `http_request` at 1.0.0.
    async fn setup() -> (
        MemorySource,
        MemoryCache,
        WriteBackCoordinator<MemorySource, MemoryCache>,
        Fingerprint,
    ) {
        let source = MemorySource::new();
        let cache = MemoryCache::new();
        let fingerprint = source.put(PATH, manifest("1.0.0"));

        let manifest = ManifestValidator::new()
            .validate_document(PATH, &manifest("1.0.0"))
            .unwrap();
        let record =
            Record::from_manifest(manifest, SourcePath::parse(PATH).unwrap(), fingerprint.clone())
                .unwrap();
        let summary = record.summary();
        cache
            .write_record(&StoredRecord::new(record, 100, 100), &summary)
            .await
            .unwrap();

        let coordinator = WriteBackCoordinator::new(
            Arc::new(source.clone()),
            Arc::new(cache.clone()),
            SourcePath::root(),
        );
        (source, cache, coordinator, fingerprint)
    }

    fn http_request() -> AssetId {
        AssetId::new("http_request").unwrap()
    }

    #[tokio::test]
    async fn test_write_back_updates_source_and_cache() {
        let (source, cache, coordinator, fingerprint) = setup().await;
        let before = cache.sync_state().await.unwrap();

        let outcome = coordinator
            .write_back(
                &http_request(),
                &manifest("1.1.0"),
                &fingerprint,
                &WriteOptions {
                    author: Some("dana".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(Some(outcome.fingerprint.clone()), source.fingerprint(PATH));
        let stored = cache.get_record(&http_request()).await.unwrap().unwrap();
        assert_eq!(stored.record.version, "1.1.0");
        assert_eq!(stored.record.content_fingerprint, outcome.fingerprint);
        assert_eq!(stored.created_at, 100);

        let commits = source.commits();
        assert_eq!(
            commits.last().unwrap().message,
            "Update asset: http_request\n\nAuthor: dana"
        );

        let after = cache.sync_state().await.unwrap();
        assert_eq!(after.last_revision_token, before.last_revision_token);
        assert!(after.last_sync_time > 0);
    }

    #[tokio::test]
    async fn test_stale_fingerprint_conflicts_without_touching_cache() {
        let (source, cache, coordinator, stale) = setup().await;
        let current = source.put(PATH, manifest("1.0.1"));
        let before = cache.dump();

        let result = coordinator
            .write_back(&http_request(), &manifest("2.0.0"), &stale, &WriteOptions::default())
            .await;

        match result {
            Err(Error::Conflict { current: reported, .. }) => {
                assert_eq!(reported, current.to_string())
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(cache.dump(), before);
    }

    #[tokio::test]
    async fn test_invalid_content_is_rejected_before_sending() {
        let (source, _cache, coordinator, fingerprint) = setup().await;

        let result = coordinator
            .write_back(
                &http_request(),
                "id: http_request\nversion: one\n",
                &fingerprint,
                &WriteOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));

        let renamed = manifest("1.0.1").replace("id: http_request", "id: other");
        let result = coordinator
            .write_back(&http_request(), &renamed, &fingerprint, &WriteOptions::default())
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(source.commits().is_empty());
    }

    #[tokio::test]
    async fn test_bump_version_rewrites_content() {
        let (source, cache, coordinator, fingerprint) = setup().await;

        let outcome = coordinator
            .write_back(
                &http_request(),
                &manifest("1.0.0"),
                &fingerprint,
                &WriteOptions {
                    bump_version: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.version, "1.0.1");
        let written = String::from_utf8(source.get(PATH).unwrap()).unwrap();
        assert!(written.contains("1.0.1"));
        let summary = cache.get_summary(&http_request()).await.unwrap().unwrap();
        assert_eq!(summary.version, "1.0.1");
    }

    #[tokio::test]
    async fn test_create_places_manifest_by_category() {
        let source = MemorySource::new();
        let cache = MemoryCache::new();
        let coordinator = WriteBackCoordinator::new(
            Arc::new(source.clone()),
            Arc::new(cache.clone()),
            SourcePath::parse("assets").unwrap(),
        );
        let content = "id: summarize\nversion: 1.0.0\ncategory: prompt\nname: Summarize\ndescription: Summarize text\n";

        let outcome = coordinator
            .create(content, &WriteOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.path.to_string(), "assets/prompts/summarize/manifest.yaml");
        assert!(source.get("assets/prompts/summarize/manifest.yaml").is_some());
        assert_eq!(
            cache.category_members(Category::Prompt).await.unwrap().len(),
            1
        );
        assert_eq!(source.commits()[0].message, "Create asset: summarize");

        let again = coordinator.create(content, &WriteOptions::default()).await;
        assert!(matches!(again, Err(Error::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_create_conflicts_with_uncached_file() {
        let source = MemorySource::new();
        source.put(PATH, manifest("1.0.0"));
        let coordinator = WriteBackCoordinator::new(
            Arc::new(source.clone()),
            Arc::new(MemoryCache::new()),
            SourcePath::root(),
        );

        let result = coordinator
            .create(&manifest("1.0.0"), &WriteOptions::default())
            .await;
        assert!(matches!(result, Err(Error::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_delete_removes_file_and_cache_entry() {
        let (source, cache, coordinator, fingerprint) = setup().await;

        let stale = Fingerprint::new("stale");
        let result = coordinator
            .delete(&http_request(), &stale, &WriteOptions::default())
            .await;
        assert!(matches!(result, Err(Error::Conflict { .. })));
        assert!(cache.get_record(&http_request()).await.unwrap().is_some());

        coordinator
            .delete(&http_request(), &fingerprint, &WriteOptions::default())
            .await
            .unwrap();
        assert!(source.get(PATH).is_none());
        assert!(cache.get_record(&http_request()).await.unwrap().is_none());
        assert!(cache.category_members(Category::Tool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let (_source, _cache, coordinator, fingerprint) = setup().await;
        let result = coordinator
            .write_back(
                &AssetId::new("missing").unwrap(),
                &manifest("1.0.0"),
                &fingerprint,
                &WriteOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
