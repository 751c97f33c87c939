//! Full traversal of the source-of-truth namespace.

use futures::TryStreamExt;
use tracing::debug;

use assetsync_common::{Result, RevisionToken, SourcePath};
use assetsync_manifest::{is_manifest_file, RawRecord};
use assetsync_source::{SourceFile, SourceOfTruth};

use crate::retry::RetryExecutor;

/// Collects every manifest file below a root, pinned to one revision.
#[derive(Debug, Clone)]
pub struct RepositoryScanner {
    root: SourcePath,
    retry: RetryExecutor,
}

impl RepositoryScanner {
    pub fn new(root: SourcePath, retry: RetryExecutor) -> Self {
        Self { root, retry }
    }

    /// Subtree this scanner walks.
    pub fn root(&self) -> &SourcePath {
        &self.root
    }

    /// Scan the namespace as of `revision`.
    ///
    /// A failure anywhere in the traversal fails the whole scan; the stream
    /// is collected before anything is returned, and a retry restarts it
    /// from the beginning.
    ///
    /// # Errors
    /// - `SourceUnavailable` if the source cannot be read or moved away
    ///   from `revision`
    pub async fn scan<S: SourceOfTruth + ?Sized>(
        &self,
        source: &S,
        revision: &RevisionToken,
    ) -> Result<Vec<RawRecord>> {
        let root = &self.root;
        let files: Vec<SourceFile> = self
            .retry
            .execute(|| async move {
                source
                    .list_record_files(root, revision, is_manifest_file)
                    .await?
                    .try_collect()
                    .await
            })
            .await?;

        debug!(root = %root, count = files.len(), "Scanned record files");
        Ok(files
            .into_iter()
            .map(|file| RawRecord {
                path: file.path,
                content: file.content,
                fingerprint: file.fingerprint,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetsync_common::Error;
    use assetsync_source::MemorySource;

    use crate::retry::RetryConfig;

    fn scanner(root: &str) -> RepositoryScanner {
        let root = if root.is_empty() {
            SourcePath::root()
        } else {
            SourcePath::parse(root).unwrap()
        };
        RepositoryScanner::new(root, RetryExecutor::new(RetryConfig::none()))
    }

    #[tokio::test]
    async fn test_scan_selects_manifests_under_root() {
        let source = MemorySource::new();
        source.put("assets/tools/a/manifest.yaml", "a");
        source.put("assets/prompts/b/MANIFEST.yml", "b");
        source.put("assets/tools/a/README.md", "readme");
        source.put("other/c/manifest.yaml", "c");
        let revision = source.latest_revision().await.unwrap();

        let mut paths: Vec<String> = scanner("assets")
            .scan(&source, &revision)
            .await
            .unwrap()
            .into_iter()
            .map(|raw| raw.path.to_string())
            .collect();
        paths.sort();

        assert_eq!(
            paths,
            vec!["assets/prompts/b/MANIFEST.yml", "assets/tools/a/manifest.yaml"]
        );
    }

    #[tokio::test]
    async fn test_scan_carries_source_fingerprints() {
        let source = MemorySource::new();
        let fingerprint = source.put("tools/a/manifest.yaml", "a");
        let revision = source.latest_revision().await.unwrap();

        let records = scanner("").scan(&source, &revision).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fingerprint, fingerprint);
        assert_eq!(records[0].content, b"a".to_vec());
    }

    #[tokio::test]
    async fn test_partial_failure_fails_whole_scan() {
        let source = MemorySource::new();
        source.put("tools/a/manifest.yaml", "a");
        source.put("tools/b/manifest.yaml", "b");
        source.set_fail_scan_after(Some(1));
        let revision = source.latest_revision().await.unwrap();

        let result = scanner("").scan(&source, &revision).await;
        assert!(matches!(result, Err(Error::SourceUnavailable(_))));
    }
}
