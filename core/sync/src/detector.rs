//! Revision-token change detection.

use tracing::debug;

use assetsync_common::{Result, RevisionToken, SyncState};
use assetsync_source::SourceOfTruth;

use crate::retry::RetryExecutor;

/// Whether the source of truth moved since the last successful sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub rescan: bool,
    /// Current revision of the source of truth.
    pub token: RevisionToken,
}

/// Compares the current revision token with the last synced one.
#[derive(Debug, Clone, Default)]
pub struct ChangeDetector {
    retry: RetryExecutor,
}

impl ChangeDetector {
    pub fn new(retry: RetryExecutor) -> Self {
        Self { retry }
    }

    /// Fetch the current revision token, retrying transient failures.
    ///
    /// # Errors
    /// - `SourceUnavailable` once retries are exhausted
    pub async fn latest<S: SourceOfTruth + ?Sized>(&self, source: &S) -> Result<RevisionToken> {
        self.retry.execute(|| source.latest_revision()).await
    }

    /// Decide whether the namespace must be rescanned.
    ///
    /// # Postconditions
    /// - `rescan` is false iff `token == state.last_revision_token`
    pub async fn should_rescan<S: SourceOfTruth + ?Sized>(
        &self,
        source: &S,
        state: &SyncState,
    ) -> Result<Detection> {
        let token = self.latest(source).await?;
        let rescan = token != state.last_revision_token;
        debug!(
            previous = %state.last_revision_token,
            current = %token,
            rescan,
            "Checked source revision"
        );
        Ok(Detection { rescan, token })
    }
}
