//! Sync state model.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::RevisionToken;

/// Lifecycle status of the sync engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// No cycle running; the last cycle succeeded or none ran yet.
    #[default]
    Idle,
    /// A cycle is running.
    Syncing,
    /// The last cycle aborted.
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Failed => "failed",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "idle" => Ok(SyncStatus::Idle),
            "syncing" => Ok(SyncStatus::Syncing),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(crate::Error::Serialization(format!(
                "unknown sync status '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide sync bookkeeping persisted in the cache.
///
/// Initialized to `{0, "", 0, idle}` before the first cycle. Only the
/// orchestrator advances `last_revision_token`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Unix timestamp of the last successful sync or write-back.
    pub last_sync_time: i64,
    /// Revision of the source of truth the cache last fully converged to.
    pub last_revision_token: RevisionToken,
    /// Number of records at the last successful cycle.
    pub record_count: u64,
    /// Current lifecycle status.
    pub status: SyncStatus,
    /// Unix timestamp at which the running (or last) cycle took the lease.
    pub sync_started_at: i64,
}

impl SyncState {
    /// The initial state of a cache that has never been synced.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a `syncing` status is still held by a live cycle at `now`.
    ///
    /// Past `lease_secs` the holder is presumed crashed.
    pub fn lease_held(&self, now: i64, lease_secs: i64) -> bool {
        self.status == SyncStatus::Syncing && now - self.sync_started_at < lease_secs
    }

    /// Whether a full cycle has ever completed.
    pub fn has_synced(&self) -> bool {
        !self.last_revision_token.is_empty()
    }

    /// Return a copy with the patch applied.
    pub fn apply(&self, patch: &SyncStatePatch) -> Self {
        let mut next = self.clone();
        if let Some(time) = patch.last_sync_time {
            next.last_sync_time = time;
        }
        if let Some(token) = &patch.last_revision_token {
            next.last_revision_token = token.clone();
        }
        if let Some(count) = patch.record_count {
            next.record_count = count;
        }
        if let Some(status) = patch.status {
            next.status = status;
        }
        if let Some(time) = patch.sync_started_at {
            next.sync_started_at = time;
        }
        next
    }
}

/// A set of sync-state fields to overwrite together.
///
/// Every mutation of the persisted state goes through one patch, applied as
/// a single atomic write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatePatch {
    pub last_sync_time: Option<i64>,
    pub last_revision_token: Option<RevisionToken>,
    pub record_count: Option<u64>,
    pub status: Option<SyncStatus>,
    pub sync_started_at: Option<i64>,
}

impl SyncStatePatch {
    /// Only change the status.
    pub fn status(status: SyncStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Enter `syncing`, taking the cycle lease at `time`.
    pub fn started(time: i64) -> Self {
        Self {
            status: Some(SyncStatus::Syncing),
            sync_started_at: Some(time),
            ..Default::default()
        }
    }

    /// Only bump the sync time.
    pub fn touched_at(time: i64) -> Self {
        Self {
            last_sync_time: Some(time),
            ..Default::default()
        }
    }

    /// The four bookkeeping fields, written at successful cycle completion.
    pub fn completed(time: i64, token: RevisionToken, record_count: u64) -> Self {
        Self {
            last_sync_time: Some(time),
            last_revision_token: Some(token),
            record_count: Some(record_count),
            status: Some(SyncStatus::Idle),
            sync_started_at: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.last_sync_time.is_none()
            && self.last_revision_token.is_none()
            && self.record_count.is_none()
            && self.status.is_none()
            && self.sync_started_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = SyncState::new();
        assert_eq!(state.last_sync_time, 0);
        assert!(state.last_revision_token.is_empty());
        assert_eq!(state.record_count, 0);
        assert_eq!(state.status, SyncStatus::Idle);
        assert!(!state.has_synced());
    }

    #[test]
    fn test_apply_status_only() {
        let state = SyncState::new().apply(&SyncStatePatch::status(SyncStatus::Syncing));
        assert_eq!(state.status, SyncStatus::Syncing);
        assert!(state.last_revision_token.is_empty());
    }

    #[test]
    fn test_apply_completion() {
        let state = SyncState::new()
            .apply(&SyncStatePatch::status(SyncStatus::Syncing))
            .apply(&SyncStatePatch::completed(
                1_700_000_000,
                RevisionToken::new("abc123"),
                4,
            ));
        assert_eq!(state.status, SyncStatus::Idle);
        assert_eq!(state.last_sync_time, 1_700_000_000);
        assert_eq!(state.last_revision_token.as_str(), "abc123");
        assert_eq!(state.record_count, 4);
        assert!(state.has_synced());
    }

    #[test]
    fn test_touch_leaves_token() {
        let state = SyncState::new()
            .apply(&SyncStatePatch::completed(10, RevisionToken::new("r1"), 1))
            .apply(&SyncStatePatch::touched_at(20));
        assert_eq!(state.last_sync_time, 20);
        assert_eq!(state.last_revision_token.as_str(), "r1");
    }

    #[test]
    fn test_lease_expires() {
        let state = SyncState::new().apply(&SyncStatePatch::started(1_000));
        assert_eq!(state.status, SyncStatus::Syncing);
        assert_eq!(state.sync_started_at, 1_000);

        assert!(state.lease_held(1_500, 900));
        assert!(!state.lease_held(1_900, 900));

        // A syncing status written without a lease is treated as crashed.
        let legacy = SyncState::new().apply(&SyncStatePatch::status(SyncStatus::Syncing));
        assert!(!legacy.lease_held(1_700_000_000, 900));

        let idle = state.apply(&SyncStatePatch::completed(1_200, RevisionToken::new("r"), 0));
        assert!(!idle.lease_held(1_201, 900));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("failed".parse::<SyncStatus>().unwrap(), SyncStatus::Failed);
        assert!("paused".parse::<SyncStatus>().is_err());
    }
}
