//! Per-cycle sync report.

use serde::{Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

use assetsync_common::{AssetId, RevisionToken, ValidationError};

/// Maximum number of errors kept in the serialized report.
pub const MAX_REPORTED_ERRORS: usize = 10;

/// How a cycle decides whether to scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleMode {
    /// Always scan, even if the revision token did not move.
    Full,
    /// Scan only when the revision token moved.
    Incremental,
}

impl fmt::Display for CycleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleMode::Full => f.write_str("full"),
            CycleMode::Incremental => f.write_str("incremental"),
        }
    }
}

/// A record skipped because it failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidRecord {
    pub path: String,
    pub reasons: Vec<String>,
}

impl From<ValidationError> for InvalidRecord {
    fn from(err: ValidationError) -> Self {
        Self {
            path: err.path,
            reasons: err.reasons,
        }
    }
}

/// Outcome of one completed sync cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub mode: CycleMode,
    /// Revision the cycle converged to.
    pub revision: RevisionToken,
    /// True when the revision had not moved and nothing was scanned.
    pub skipped: bool,
    pub created: Vec<AssetId>,
    pub updated: Vec<AssetId>,
    pub deleted: Vec<AssetId>,
    pub unchanged: usize,
    #[serde(serialize_with = "first_errors")]
    pub invalid: Vec<InvalidRecord>,
    pub invalid_count: usize,
    #[serde(serialize_with = "first_errors")]
    pub inconsistencies: Vec<String>,
    pub duration_ms: u64,
}

fn first_errors<T: Serialize, S: Serializer>(items: &[T], serializer: S) -> Result<S::Ok, S::Error> {
    let kept = &items[..items.len().min(MAX_REPORTED_ERRORS)];
    kept.serialize(serializer)
}

impl CycleReport {
    pub fn new(cycle_id: Uuid, mode: CycleMode, revision: RevisionToken) -> Self {
        Self {
            cycle_id,
            mode,
            revision,
            skipped: false,
            created: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
            unchanged: 0,
            invalid: Vec::new(),
            invalid_count: 0,
            inconsistencies: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn record_invalid(&mut self, invalid: InvalidRecord) {
        self.invalid.push(invalid);
        self.invalid_count = self.invalid.len();
    }

    /// Number of records written or removed.
    pub fn changed(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    pub fn has_invalid(&self) -> bool {
        !self.invalid.is_empty()
    }
}
