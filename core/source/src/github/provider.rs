//! GitHub source of truth implementation.

use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use assetsync_common::{Error, Fingerprint, Result, RevisionToken, SourcePath};

use crate::provider::{FileMatcher, RecordFileStream, SourceFile, SourceOfTruth};

use super::client::{GitHubClient, WriteOutcome};

/// Default public API endpoint.
pub const DEFAULT_API_URL: &str = "https://api.github.com";
/// Number of blob downloads in flight during a scan.
const BLOB_CONCURRENCY: usize = 8;

fn default_branch() -> String {
    "main".to_string()
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

/// GitHub source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    /// Personal access or app token.
    pub token: String,
    /// Repository in `owner/name` form.
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

impl GitHubConfig {
    /// Split `repo` into owner and name.
    ///
    /// # Errors
    /// - `Config` unless `repo` contains exactly one '/' with non-empty
    ///   parts on both sides
    pub fn owner_and_name(&self) -> Result<(&str, &str)> {
        match self.repo.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok((owner, name))
            }
            _ => Err(Error::Config(format!(
                "GitHub repo must be in 'owner/name' format, got '{}'",
                self.repo
            ))),
        }
    }

    /// Check required fields before any I/O.
    pub fn validate(&self) -> Result<()> {
        if self.token.trim().is_empty() {
            return Err(Error::Config("GitHub token is required".to_string()));
        }
        if self.branch.trim().is_empty() {
            return Err(Error::Config("GitHub branch must not be empty".to_string()));
        }
        self.owner_and_name().map(|_| ())
    }
}

/// Source of truth backed by a GitHub repository branch.
///
/// The revision token is the branch head commit sha and each file's
/// fingerprint is its git blob sha. Scans read the tree of the given commit,
/// so they stay consistent with one revision even if the branch moves.
pub struct GitHubSource {
    config: GitHubConfig,
    client: Arc<GitHubClient>,
}

impl GitHubSource {
    /// Create a new GitHub source.
    ///
    /// # Errors
    /// - `Config` on missing token, malformed repo or bad API url
    pub fn new(config: GitHubConfig) -> Result<Self> {
        config.validate()?;
        let (owner, name) = config.owner_and_name()?;
        let client = GitHubClient::new(&config.api_url, owner, name, &config.token)?;

        Ok(Self {
            client: Arc::new(client),
            config,
        })
    }

    pub fn config(&self) -> &GitHubConfig {
        &self.config
    }

    /// Turn a rejected sha guard into a conflict carrying the current sha.
    async fn rejection(&self, path: &SourcePath, expected: Option<&Fingerprint>) -> Error {
        match self
            .client
            .get_content_sha(path.components(), &self.config.branch)
            .await
        {
            Ok(Some(current)) => Error::Conflict {
                path: path.to_string(),
                expected: expected.map(|f| f.to_string()).unwrap_or_default(),
                current,
            },
            Ok(None) => Error::NotFound(format!("File not found: {}", path)),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl SourceOfTruth for GitHubSource {
    fn name(&self) -> &str {
        "github"
    }

    async fn latest_revision(&self) -> Result<RevisionToken> {
        let branch = self.client.get_branch(&self.config.branch).await?;
        Ok(RevisionToken::new(branch.commit.sha))
    }

    async fn list_record_files(
        &self,
        root: &SourcePath,
        revision: &RevisionToken,
        matcher: FileMatcher,
    ) -> Result<RecordFileStream> {
        let tree = self.client.get_tree(revision.as_str()).await?;
        if tree.truncated {
            return Err(Error::SourceUnavailable(format!(
                "git tree {} is truncated; refusing a partial scan",
                tree.sha
            )));
        }

        let mut selected = Vec::new();
        for entry in tree.tree.into_iter().filter(|e| e.is_blob()) {
            let path = match SourcePath::parse(&entry.path) {
                Ok(path) => path,
                Err(e) => {
                    warn!(path = %entry.path, error = %e, "Skipping unaddressable tree entry");
                    continue;
                }
            };
            if path.starts_with(root) && path.name().map(matcher).unwrap_or(false) {
                selected.push((path, entry.sha));
            }
        }
        debug!(revision = %revision, files = selected.len(), "Resolved record files from tree");

        let client = self.client.clone();
        let files = stream::iter(selected)
            .map(move |(path, sha)| {
                let client = client.clone();
                async move {
                    let content = client.get_blob(&sha).await?;
                    Ok(SourceFile {
                        path,
                        content,
                        fingerprint: Fingerprint::new(sha),
                    })
                }
            })
            .buffered(BLOB_CONCURRENCY);

        Ok(Box::pin(files))
    }

    async fn write_file(
        &self,
        path: &SourcePath,
        content: Vec<u8>,
        expected: Option<&Fingerprint>,
        message: &str,
    ) -> Result<Fingerprint> {
        let outcome = self
            .client
            .put_contents(
                path.components(),
                &content,
                expected.map(|f| f.as_str()),
                &self.config.branch,
                message,
            )
            .await?;

        match outcome {
            WriteOutcome::Written(sha) => Ok(Fingerprint::new(sha)),
            WriteOutcome::Rejected => Err(self.rejection(path, expected).await),
        }
    }

    async fn delete_file(
        &self,
        path: &SourcePath,
        expected: &Fingerprint,
        message: &str,
    ) -> Result<()> {
        let outcome = self
            .client
            .delete_contents(
                path.components(),
                expected.as_str(),
                &self.config.branch,
                message,
            )
            .await?;

        match outcome {
            WriteOutcome::Written(_) => Ok(()),
            WriteOutcome::Rejected => Err(self.rejection(path, Some(expected)).await),
        }
    }

    async fn health_check(&self) -> Result<()> {
        self.client.get_repository().await?;
        self.client.get_branch(&self.config.branch).await?;
        Ok(())
    }
}

/// Create a GitHub source from configuration.
pub fn create_github_source(config: serde_json::Value) -> Result<Arc<dyn SourceOfTruth>> {
    let github_config: GitHubConfig = serde_json::from_value(config)
        .map_err(|e| Error::Config(format!("Invalid GitHub config: {}", e)))?;

    Ok(Arc::new(GitHubSource::new(github_config)?))
}
