//! In-memory cache store for testing.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use assetsync_common::{AssetId, Category, Error, Result, SyncState, SyncStatePatch};
use assetsync_manifest::IndexSummary;

use crate::keys::{self, DEFAULT_CHANGE_LOG_CAPACITY};
use crate::store::{CacheSnapshot, CacheStore, DetailHead};
use crate::stored::{detail_fields, state_from_fields, state_patch_fields, StoredRecord};

/// One value of the emulated keyspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyValue {
    Hash(BTreeMap<String, String>),
    Set(BTreeSet<String>),
    List(VecDeque<String>),
}

/// In-memory cache store.
///
/// Emulates the Redis keyspace with the same key layout so tests can assert
/// on exact keys. A single lock guards the whole keyspace, which makes every
/// mutation atomic with respect to readers.
#[derive(Clone)]
pub struct MemoryCache {
    keyspace: Arc<RwLock<BTreeMap<String, KeyValue>>>,
    change_log_capacity: usize,
    unavailable: Arc<AtomicBool>,
    writes: Arc<AtomicU64>,
}

impl MemoryCache {
    /// Create a new empty cache.
    pub fn new() -> Self {
        Self::with_change_log_capacity(DEFAULT_CHANGE_LOG_CAPACITY)
    }

    pub fn with_change_log_capacity(capacity: usize) -> Self {
        Self {
            keyspace: Arc::new(RwLock::new(BTreeMap::new())),
            change_log_capacity: capacity.max(1),
            unavailable: Arc::new(AtomicBool::new(false)),
            writes: Arc::new(AtomicU64::new(0)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, KeyValue>> {
        self.keyspace.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, KeyValue>> {
        self.keyspace.write().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable(
                "memory cache is marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    /// Make every subsequent call fail with `StoreUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of mutating units applied so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Copy of the whole keyspace.
    pub fn dump(&self) -> BTreeMap<String, KeyValue> {
        self.read().clone()
    }

    /// Store a raw value, bypassing the record protocol.
    pub fn insert_raw(&self, key: &str, value: KeyValue) {
        self.write().insert(key.to_string(), value);
    }

    fn hash<'a>(space: &'a BTreeMap<String, KeyValue>, key: &str) -> Option<&'a BTreeMap<String, String>> {
        match space.get(key) {
            Some(KeyValue::Hash(map)) => Some(map),
            _ => None,
        }
    }

    fn hash_mut<'a>(space: &'a mut BTreeMap<String, KeyValue>, key: &str) -> &'a mut BTreeMap<String, String> {
        let value = space
            .entry(key.to_string())
            .or_insert_with(|| KeyValue::Hash(BTreeMap::new()));
        if !matches!(value, KeyValue::Hash(_)) {
            *value = KeyValue::Hash(BTreeMap::new());
        }
        match value {
            KeyValue::Hash(map) => map,
            _ => unreachable!("value was just replaced by a hash"),
        }
    }

    fn set_mut<'a>(space: &'a mut BTreeMap<String, KeyValue>, key: &str) -> &'a mut BTreeSet<String> {
        let value = space
            .entry(key.to_string())
            .or_insert_with(|| KeyValue::Set(BTreeSet::new()));
        if !matches!(value, KeyValue::Set(_)) {
            *value = KeyValue::Set(BTreeSet::new());
        }
        match value {
            KeyValue::Set(set) => set,
            _ => unreachable!("value was just replaced by a set"),
        }
    }

    fn remove_member(space: &mut BTreeMap<String, KeyValue>, key: &str, member: &str) {
        if let Some(KeyValue::Set(set)) = space.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                space.remove(key);
            }
        }
    }

    fn remove_field(space: &mut BTreeMap<String, KeyValue>, key: &str, field: &str) {
        if let Some(KeyValue::Hash(map)) = space.get_mut(key) {
            map.remove(field);
            if map.is_empty() {
                space.remove(key);
            }
        }
    }

    fn log_change(&self, space: &mut BTreeMap<String, KeyValue>, id: &str) {
        let value = space
            .entry(keys::CHANGE_LOG.to_string())
            .or_insert_with(|| KeyValue::List(VecDeque::new()));
        if !matches!(value, KeyValue::List(_)) {
            *value = KeyValue::List(VecDeque::new());
        }
        if let KeyValue::List(list) = value {
            list.push_back(id.to_string());
            while list.len() > self.change_log_capacity {
                list.pop_front();
            }
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    fn name(&self) -> &str {
        "memory"
    }

    async fn write_record(&self, record: &StoredRecord, summary: &IndexSummary) -> Result<()> {
        self.check_available()?;
        let fields = record.to_fields()?;
        let summary_json = summary.to_json()?;
        let id = record.record.id.as_str();

        let mut space = self.write();
        space.insert(
            keys::detail_key(id),
            KeyValue::Hash(fields.into_iter().collect()),
        );
        Self::hash_mut(&mut space, keys::SUMMARY_INDEX).insert(id.to_string(), summary_json);
        for category in Category::ALL {
            let key = keys::category_key(category);
            if category == record.record.category {
                Self::set_mut(&mut space, &key).insert(id.to_string());
            } else {
                Self::remove_member(&mut space, &key, id);
            }
        }
        self.log_change(&mut space, id);

        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_record(&self, id: &AssetId) -> Result<()> {
        self.check_available()?;
        let id = id.as_str();

        let mut space = self.write();
        space.remove(&keys::detail_key(id));
        Self::remove_field(&mut space, keys::SUMMARY_INDEX, id);
        for category in Category::ALL {
            Self::remove_member(&mut space, &keys::category_key(category), id);
        }
        self.log_change(&mut space, id);

        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commit_sync_state(&self, patch: &SyncStatePatch) -> Result<()> {
        self.check_available()?;
        if patch.is_empty() {
            return Ok(());
        }

        let mut space = self.write();
        let state = Self::hash_mut(&mut space, keys::SYNC_STATE);
        for (field, value) in state_patch_fields(patch) {
            state.insert(field.to_string(), value);
        }

        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn sync_state(&self) -> Result<SyncState> {
        self.check_available()?;
        let space = self.read();
        let fields: HashMap<String, String> = Self::hash(&space, keys::SYNC_STATE)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        state_from_fields(&fields)
    }

    async fn get_record(&self, id: &AssetId) -> Result<Option<StoredRecord>> {
        self.check_available()?;
        let space = self.read();
        match Self::hash(&space, &keys::detail_key(id.as_str())) {
            Some(map) => {
                let fields: HashMap<String, String> =
                    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                Ok(Some(StoredRecord::from_fields(&fields)?))
            }
            None => Ok(None),
        }
    }

    async fn get_summary(&self, id: &AssetId) -> Result<Option<IndexSummary>> {
        self.check_available()?;
        let space = self.read();
        Self::hash(&space, keys::SUMMARY_INDEX)
            .and_then(|index| index.get(id.as_str()))
            .map(|json| IndexSummary::from_json(json))
            .transpose()
    }

    async fn summaries(&self, category: Option<Category>) -> Result<Vec<IndexSummary>> {
        self.check_available()?;
        let space = self.read();
        let Some(index) = Self::hash(&space, keys::SUMMARY_INDEX) else {
            return Ok(Vec::new());
        };

        let members = category.map(|c| match space.get(&keys::category_key(c)) {
            Some(KeyValue::Set(set)) => set.clone(),
            _ => BTreeSet::new(),
        });

        let mut summaries = Vec::new();
        for (id, json) in index {
            if let Some(members) = &members {
                if !members.contains(id) {
                    continue;
                }
            }
            summaries.push(IndexSummary::from_json(json)?);
        }
        Ok(summaries)
    }

    async fn category_members(&self, category: Category) -> Result<BTreeSet<String>> {
        self.check_available()?;
        let space = self.read();
        match space.get(&keys::category_key(category)) {
            Some(KeyValue::Set(set)) => Ok(set.clone()),
            _ => Ok(BTreeSet::new()),
        }
    }

    async fn snapshot(&self) -> Result<CacheSnapshot> {
        self.check_available()?;
        let space = self.read();

        let summaries: HashMap<String, String> = Self::hash(&space, keys::SUMMARY_INDEX)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        let members = Category::ALL
            .iter()
            .map(|c| {
                let set = match space.get(&keys::category_key(*c)) {
                    Some(KeyValue::Set(set)) => set.clone(),
                    _ => BTreeSet::new(),
                };
                (*c, set)
            })
            .collect();

        let mut details = HashMap::new();
        for (key, value) in space.range(keys::DETAIL_PREFIX.to_string()..) {
            let Some(id) = keys::id_from_detail_key(key) else {
                break;
            };
            if let KeyValue::Hash(map) = value {
                details.insert(
                    id.to_string(),
                    DetailHead {
                        category: map.get(detail_fields::CATEGORY).cloned(),
                        version: map.get(detail_fields::VERSION).cloned(),
                        fingerprint: map.get(detail_fields::CONTENT_FINGERPRINT).cloned(),
                        created_at: map.get(detail_fields::CREATED_AT).cloned(),
                        source_path: map.get(detail_fields::SOURCE_PATH).cloned(),
                    },
                );
            }
        }

        Ok(CacheSnapshot::assemble(summaries, members, details))
    }

    async fn recent_changes(&self, count: usize) -> Result<Vec<String>> {
        self.check_available()?;
        let space = self.read();
        match space.get(keys::CHANGE_LOG) {
            Some(KeyValue::List(list)) => Ok(list.iter().rev().take(count).cloned().collect()),
            _ => Ok(Vec::new()),
        }
    }

    async fn health_check(&self) -> Result<()> {
        self.check_available()
    }
}
