//! Cache store trait definition.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::warn;

use assetsync_common::{AssetId, Category, Fingerprint, Result, SyncState, SyncStatePatch};
use assetsync_manifest::IndexSummary;

use crate::stored::StoredRecord;

/// What the cache currently holds for one id, as seen by the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntry {
    pub id: AssetId,
    /// Category recorded in the detail hash.
    pub category: Option<Category>,
    /// Version recorded in the detail hash.
    pub version: Option<String>,
    /// Fingerprint recorded in the detail hash; `None` if the detail is absent.
    pub fingerprint: Option<Fingerprint>,
    pub created_at: Option<i64>,
    /// Source path recorded in the detail hash.
    pub source_path: Option<String>,
    /// Entry in the summary index, if present and decodable.
    pub summary: Option<IndexSummary>,
    /// Category sets containing the id.
    pub member_of: Vec<Category>,
}

impl CachedEntry {
    /// Whether detail, summary and category membership agree with each other.
    pub fn is_indexed(&self) -> bool {
        match (self.category, &self.summary, &self.version) {
            (Some(category), Some(summary), Some(version)) => {
                summary.category == category
                    && summary.version == *version
                    && self.member_of == [category]
            }
            _ => false,
        }
    }
}

/// Per-id view of the whole cache.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheSnapshot {
    pub entries: BTreeMap<AssetId, CachedEntry>,
    /// Keys or members that do not form a valid id and so cannot be resolved.
    pub unresolved: Vec<String>,
}

/// Result of checking the CategoryIndex invariant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    /// Ids with a summary whose category set lacks them.
    pub missing_membership: Vec<String>,
    /// Ids in a category set without a matching summary.
    pub stray_membership: Vec<String>,
    /// Ids with a summary but no detail hash.
    pub missing_detail: Vec<String>,
    /// Ids with a detail hash but no summary.
    pub missing_summary: Vec<String>,
    /// Cache entries that are not valid ids.
    pub unresolved: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_membership.is_empty()
            && self.stray_membership.is_empty()
            && self.missing_detail.is_empty()
            && self.missing_summary.is_empty()
            && self.unresolved.is_empty()
    }
}

/// Leading fields of a detail hash read for every cached id.
#[derive(Debug, Clone, Default)]
pub(crate) struct DetailHead {
    pub category: Option<String>,
    pub version: Option<String>,
    pub fingerprint: Option<String>,
    pub created_at: Option<String>,
    pub source_path: Option<String>,
}

impl CacheSnapshot {
    /// Merge the raw index structures into per-id entries.
    pub(crate) fn assemble(
        summaries: HashMap<String, String>,
        members: Vec<(Category, BTreeSet<String>)>,
        details: HashMap<String, DetailHead>,
    ) -> Self {
        let mut ids: BTreeSet<String> = BTreeSet::new();
        ids.extend(summaries.keys().cloned());
        ids.extend(details.keys().cloned());
        for (_, set) in &members {
            ids.extend(set.iter().cloned());
        }

        let mut snapshot = CacheSnapshot::default();
        for raw in ids {
            let id = match AssetId::new(raw.as_str()) {
                Ok(id) => id,
                Err(_) => {
                    snapshot.unresolved.push(raw);
                    continue;
                }
            };

            let summary = summaries.get(&raw).and_then(|json| {
                IndexSummary::from_json(json)
                    .map_err(|e| warn!(id = %raw, error = %e, "Undecodable summary entry"))
                    .ok()
            });
            let member_of: Vec<Category> = members
                .iter()
                .filter(|(_, set)| set.contains(&raw))
                .map(|(category, _)| *category)
                .collect();
            let head = details.get(&raw).cloned().unwrap_or_default();

            let entry = CachedEntry {
                id: id.clone(),
                category: head.category.as_deref().and_then(|c| c.parse().ok()),
                version: head.version,
                fingerprint: head.fingerprint.map(Fingerprint::new),
                created_at: head.created_at.and_then(|t| t.parse().ok()),
                source_path: head.source_path,
                summary,
                member_of,
            };
            snapshot.entries.insert(id, entry);
        }
        snapshot
    }

    /// Ids of every entry.
    pub fn ids(&self) -> BTreeSet<AssetId> {
        self.entries.keys().cloned().collect()
    }

    /// Check the CategoryIndex invariant and cross-structure agreement.
    pub fn consistency(&self) -> ConsistencyReport {
        let mut report = ConsistencyReport {
            unresolved: self.unresolved.clone(),
            ..Default::default()
        };

        for entry in self.entries.values() {
            let id = entry.id.to_string();
            match &entry.summary {
                Some(summary) => {
                    if !entry.member_of.contains(&summary.category) {
                        report.missing_membership.push(id.clone());
                    }
                    if entry.member_of.iter().any(|c| *c != summary.category) {
                        report.stray_membership.push(id.clone());
                    }
                    if entry.fingerprint.is_none() {
                        report.missing_detail.push(id);
                    }
                }
                None => {
                    if !entry.member_of.is_empty() {
                        report.stray_membership.push(id.clone());
                    }
                    if entry.fingerprint.is_some() {
                        report.missing_summary.push(id);
                    }
                }
            }
        }
        report
    }
}

/// Key-value cache mirroring the source of truth.
///
/// Transport failures surface as `Error::StoreUnavailable`. Each mutating
/// call is a single all-or-nothing unit.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Get the store name (e.g., "redis", "memory").
    fn name(&self) -> &str;

    /// Atomically store a record with its summary.
    ///
    /// # Postconditions
    /// - Detail hash replaced, summary upserted, id a member of exactly the
    ///   record's category set, id appended to the change log
    async fn write_record(&self, record: &StoredRecord, summary: &IndexSummary) -> Result<()>;

    /// Atomically remove a record's detail, summary and category membership.
    ///
    /// Membership is removed from every category set, so the caller does not
    /// need to know the category the record was last stored under.
    async fn delete_record(&self, id: &AssetId) -> Result<()>;

    /// Atomically overwrite the fields present in `patch`.
    async fn commit_sync_state(&self, patch: &SyncStatePatch) -> Result<()>;

    async fn sync_state(&self) -> Result<SyncState>;

    /// Read one record's detail.
    ///
    /// # Errors
    /// - `Serialization` if the stored hash cannot be decoded
    async fn get_record(&self, id: &AssetId) -> Result<Option<StoredRecord>>;

    async fn get_summary(&self, id: &AssetId) -> Result<Option<IndexSummary>>;

    /// List summaries, optionally restricted to one category, sorted by id.
    async fn summaries(&self, category: Option<Category>) -> Result<Vec<IndexSummary>>;

    async fn category_members(&self, category: Category) -> Result<BTreeSet<String>>;

    /// Read everything the reconciler and sweeper need in one pass.
    async fn snapshot(&self) -> Result<CacheSnapshot>;

    /// Most recently touched ids, newest first.
    async fn recent_changes(&self, count: usize) -> Result<Vec<String>>;

    async fn health_check(&self) -> Result<()>;
}
