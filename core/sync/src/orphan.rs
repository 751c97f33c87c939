//! Removal of cache entries whose record left the source of truth.

use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use assetsync_cache::CacheStore;
use assetsync_common::{AssetId, Error, Result};

/// What one sweep removed and what it could not resolve.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub removed: Vec<AssetId>,
    /// Cache entries that do not name a valid id.
    pub inconsistencies: Vec<String>,
}

/// Deletes `cached - current` from the cache.
///
/// Must only run after a complete scan; an incomplete view of the source
/// would delete live records.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrphanSweeper;

impl OrphanSweeper {
    pub fn new() -> Self {
        Self
    }

    /// Remove every cached id absent from `current`.
    ///
    /// `unresolved` lists cache entries that cannot be mapped to an id; they
    /// are reported, never deleted.
    ///
    /// # Errors
    /// - `Cancelled` if `cancel` fires between two deletes
    /// - `StoreUnavailable` if a delete fails; earlier deletes stand
    pub async fn sweep<C: CacheStore + ?Sized>(
        &self,
        cache: &C,
        current: &BTreeSet<AssetId>,
        cached: &BTreeSet<AssetId>,
        unresolved: &[String],
        cancel: &CancellationToken,
    ) -> Result<SweepOutcome> {
        let mut outcome = SweepOutcome::default();

        for raw in unresolved {
            let err = Error::OrphanInconsistency(format!(
                "cache entry '{}' does not resolve to a record id",
                raw
            ));
            warn!(entry = %raw, "{}", err);
            outcome.inconsistencies.push(err.to_string());
        }

        for id in cached.difference(current) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            cache.delete_record(id).await?;
            debug!(id = %id, "Removed orphan");
            outcome.removed.push(id.clone());
        }

        Ok(outcome)
    }
}
