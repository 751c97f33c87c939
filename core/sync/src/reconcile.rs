//! Diff between the scanned records and the cache.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use assetsync_cache::{CacheSnapshot, CachedEntry};
use assetsync_common::AssetId;
use assetsync_manifest::Record;

/// Actions needed to converge the cache, partitioned by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub to_create: Vec<Record>,
    pub to_update: Vec<Record>,
    pub to_delete: Vec<AssetId>,
    pub unchanged: Vec<AssetId>,
}

impl ChangeSet {
    /// True when the cache already matches the records.
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }

    /// Drop ids from `to_delete` that must survive this cycle.
    ///
    /// Used for records whose file still exists but failed validation.
    pub fn retain(&mut self, keep: &BTreeSet<AssetId>) {
        let (kept, deleted): (Vec<_>, Vec<_>) =
            self.to_delete.drain(..).partition(|id| keep.contains(id));
        self.to_delete = deleted;
        self.unchanged.extend(kept);
        self.unchanged.sort();
    }
}

/// Computes the create/update/delete/unchanged partition.
///
/// Per id, first match wins:
/// 1. scanned, not cached: create
/// 2. fingerprints differ: update
/// 3. versions differ: update
/// 4. cache indices disagree with the detail: update
/// 5. otherwise: unchanged
///
/// Cached ids that were not scanned are deleted. Input order is irrelevant.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reconciler;

impl Reconciler {
    pub fn new() -> Self {
        Self
    }

    /// # Preconditions
    /// - ids in `current` are unique
    pub fn diff(&self, current: &[Record], cached: &CacheSnapshot) -> ChangeSet {
        let mut changes = ChangeSet::default();

        let mut by_id: BTreeMap<&AssetId, &Record> = BTreeMap::new();
        for record in current {
            by_id.insert(&record.id, record);
        }

        for (id, record) in &by_id {
            match cached.entries.get(*id) {
                None => changes.to_create.push((*record).clone()),
                Some(entry) if is_absent(entry) => changes.to_create.push((*record).clone()),
                Some(entry) => match Self::decide(record, entry) {
                    Some(reason) => {
                        debug!(id = %id, reason, "Record needs update");
                        changes.to_update.push((*record).clone());
                    }
                    None => changes.unchanged.push((*id).clone()),
                },
            }
        }

        for id in cached.entries.keys() {
            if !by_id.contains_key(id) {
                changes.to_delete.push(id.clone());
            }
        }

        changes
    }

    fn decide(record: &Record, entry: &CachedEntry) -> Option<&'static str> {
        if entry.fingerprint.as_ref() != Some(&record.content_fingerprint) {
            return Some("fingerprint changed");
        }
        if entry.version.as_deref() != Some(record.version.as_str()) {
            return Some("version changed");
        }
        if entry.category != Some(record.category) || !entry.is_indexed() {
            return Some("index repair");
        }
        None
    }
}

/// Neither a detail hash nor a summary exists; only stray set membership.
fn is_absent(entry: &CachedEntry) -> bool {
    entry.fingerprint.is_none() && entry.summary.is_none()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assetsync_common::{Category, Fingerprint, SourcePath};
    use assetsync_manifest::{Payload, Permissions};
    use proptest::prelude::*;

    pub(crate) fn record(id: &str, category: Category, version: &str, fp: &str) -> Record {
        Record {
            id: AssetId::new(id).unwrap(),
            category,
            name: format!("Asset {id}"),
            description: "Does a thing".to_string(),
            version: version.to_string(),
            author: None,
            payload: Payload {
                config_schema: Vec::new(),
                agent_specs: None,
                runtime: None,
                permissions: Permissions::default(),
            },
            source_path: SourcePath::parse(&format!("{}/{}/manifest.yaml", category.directory(), id))
                .unwrap(),
            content_fingerprint: Fingerprint::new(fp),
        }
    }

    /// The entry a converged cache holds for `record`.
    pub(crate) fn converged(record: &Record) -> CachedEntry {
        CachedEntry {
            id: record.id.clone(),
            category: Some(record.category),
            version: Some(record.version.clone()),
            fingerprint: Some(record.content_fingerprint.clone()),
            created_at: Some(1),
            source_path: Some(record.source_path.to_string()),
            summary: Some(record.summary()),
            member_of: vec![record.category],
        }
    }

    fn snapshot(entries: Vec<CachedEntry>) -> CacheSnapshot {
        CacheSnapshot {
            entries: entries.into_iter().map(|e| (e.id.clone(), e)).collect(),
            unresolved: Vec::new(),
        }
    }

    fn ids(records: &[Record]) -> Vec<String> {
        records.iter().map(|r| r.id.to_string()).collect()
    }

    #[test]
    fn test_empty_cache_creates_everything() {
        let a = record("a", Category::Tool, "1.0.0", "h1");
        let changes = Reconciler::new().diff(&[a], &CacheSnapshot::default());
        assert_eq!(ids(&changes.to_create), vec!["a"]);
        assert!(changes.to_update.is_empty());
        assert!(changes.to_delete.is_empty());
    }

    #[test]
    fn test_precedence_rules() {
        let a = record("a", Category::Tool, "1.0.0", "h1");
        let b = record("b", Category::Tool, "1.0.0", "h2");
        let c = record("c", Category::Prompt, "1.1.0", "h3");
        let d = record("d", Category::Skill, "1.0.0", "h4");
        let gone = record("gone", Category::Tool, "1.0.0", "h5");

        let mut stale_b = converged(&b);
        stale_b.fingerprint = Some(Fingerprint::new("old"));
        let mut stale_c = converged(&c);
        stale_c.version = Some("1.0.0".to_string());

        let cached = snapshot(vec![converged(&a), stale_b, stale_c, converged(&gone)]);
        let changes = Reconciler::new().diff(&[a, b, c, d], &cached);

        assert_eq!(ids(&changes.to_create), vec!["d"]);
        assert_eq!(ids(&changes.to_update), vec!["b", "c"]);
        assert_eq!(changes.to_delete, vec![AssetId::new("gone").unwrap()]);
        assert_eq!(changes.unchanged, vec![AssetId::new("a").unwrap()]);
    }

    #[test]
    fn test_category_move_and_broken_index_update() {
        let moved = record("moved", Category::Skill, "1.0.0", "h1");
        let mut old = converged(&moved);
        old.category = Some(Category::Tool);
        old.member_of = vec![Category::Tool];

        let unlisted = record("unlisted", Category::Prompt, "1.0.0", "h2");
        let mut missing_member = converged(&unlisted);
        missing_member.member_of.clear();

        let cached = snapshot(vec![old, missing_member]);
        let changes = Reconciler::new().diff(&[moved, unlisted], &cached);
        assert_eq!(ids(&changes.to_update), vec!["moved", "unlisted"]);
    }

    #[test]
    fn test_stray_membership_counts_as_absent() {
        let a = record("a", Category::Tool, "1.0.0", "h1");
        let stray = CachedEntry {
            id: a.id.clone(),
            category: None,
            version: None,
            fingerprint: None,
            created_at: None,
            source_path: None,
            summary: None,
            member_of: vec![Category::Tool],
        };
        let changes = Reconciler::new().diff(&[a], &snapshot(vec![stray]));
        assert_eq!(ids(&changes.to_create), vec!["a"]);
    }

    #[test]
    fn test_retain_keeps_protected_ids() {
        let cached = snapshot(vec![
            converged(&record("a", Category::Tool, "1.0.0", "h1")),
            converged(&record("b", Category::Tool, "1.0.0", "h2")),
        ]);
        let mut changes = Reconciler::new().diff(&[], &cached);
        changes.retain(&BTreeSet::from([AssetId::new("a").unwrap()]));

        assert_eq!(changes.to_delete, vec![AssetId::new("b").unwrap()]);
        assert_eq!(changes.unchanged, vec![AssetId::new("a").unwrap()]);
    }

    fn arb_record() -> impl Strategy<Value = Record> {
        (
            "[a-f]{1,2}",
            prop_oneof![Just(Category::Tool), Just(Category::Prompt), Just(Category::Skill)],
            prop_oneof![Just("1.0.0"), Just("1.0.1"), Just("2.0.0")],
            "h[0-3]",
        )
            .prop_map(|(id, category, version, fp)| record(&id, category, version, &fp))
    }

    fn unique(records: Vec<Record>) -> Vec<Record> {
        let mut by_id: BTreeMap<AssetId, Record> = BTreeMap::new();
        for r in records {
            by_id.entry(r.id.clone()).or_insert(r);
        }
        by_id.into_values().collect()
    }

    proptest! {
        #[test]
        fn prop_partition_and_idempotence(
            current in prop::collection::vec(arb_record(), 0..12).prop_map(unique),
            cached in prop::collection::vec(arb_record(), 0..12).prop_map(unique),
        ) {
            let snap = snapshot(cached.iter().map(converged).collect());
            let changes = Reconciler::new().diff(&current, &snap);

            let mut seen: Vec<AssetId> = Vec::new();
            seen.extend(changes.to_create.iter().map(|r| r.id.clone()));
            seen.extend(changes.to_update.iter().map(|r| r.id.clone()));
            seen.extend(changes.to_delete.iter().cloned());
            seen.extend(changes.unchanged.iter().cloned());
            let total = seen.len();
            let distinct: BTreeSet<AssetId> = seen.into_iter().collect();
            prop_assert_eq!(total, distinct.len());

            let mut expected: BTreeSet<AssetId> = current.iter().map(|r| r.id.clone()).collect();
            expected.extend(cached.iter().map(|r| r.id.clone()));
            prop_assert_eq!(distinct, expected);

            let converged_snap = snapshot(current.iter().map(converged).collect());
            prop_assert!(Reconciler::new().diff(&current, &converged_snap).is_empty());
        }
    }
}
