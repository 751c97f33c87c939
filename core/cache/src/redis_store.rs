//! Redis cache store implementation.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use assetsync_common::{AssetId, Category, Error, Result, SyncState, SyncStatePatch};
use assetsync_manifest::IndexSummary;

use crate::keys::{self, DEFAULT_CHANGE_LOG_CAPACITY};
use crate::store::{CacheSnapshot, CacheStore, DetailHead};
use crate::stored::{detail_fields, state_from_fields, state_patch_fields, StoredRecord};

/// Keys requested per SCAN round trip.
const SCAN_BATCH: usize = 500;

fn default_change_log_capacity() -> usize {
    DEFAULT_CHANGE_LOG_CAPACITY
}

/// Redis cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisCacheConfig {
    /// Connection URL, e.g. `redis://:password@host:6379/0`.
    pub url: String,
    #[serde(default = "default_change_log_capacity")]
    pub change_log_capacity: usize,
}

impl RedisCacheConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            change_log_capacity: DEFAULT_CHANGE_LOG_CAPACITY,
        }
    }
}

/// Cache store backed by Redis.
///
/// Record writes and deletes run as MULTI/EXEC pipelines. The connection
/// manager reconnects transparently; a failed call surfaces as
/// `StoreUnavailable` and is not retried here.
pub struct RedisCache {
    connection: ConnectionManager,
    change_log_capacity: usize,
}

fn store_err(e: redis::RedisError) -> Error {
    Error::StoreUnavailable(format!("Redis: {}", e))
}

impl RedisCache {
    /// Connect to Redis.
    ///
    /// # Errors
    /// - `Config` if the URL is malformed
    /// - `StoreUnavailable` if the server cannot be reached
    pub async fn connect(config: RedisCacheConfig) -> Result<Self> {
        if config.change_log_capacity == 0 {
            return Err(Error::Config(
                "change_log_capacity must be at least 1".to_string(),
            ));
        }
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| Error::Config(format!("Invalid Redis url: {}", e)))?;
        let connection = client
            .get_connection_manager()
            .await
            .map_err(store_err)?;

        debug!("Connected to Redis");
        Ok(Self {
            connection,
            change_log_capacity: config.change_log_capacity,
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.connection.clone()
    }

    /// Append an id to the change log and trim it, inside `pipe`.
    fn log_change(&self, pipe: &mut redis::Pipeline, id: &str) {
        let keep = self.change_log_capacity as isize;
        pipe.rpush(keys::CHANGE_LOG, id)
            .ignore()
            .ltrim(keys::CHANGE_LOG, -keep, -1)
            .ignore();
    }

    async fn scan_detail_keys(&self) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut found = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(keys::DETAIL_PATTERN)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(store_err)?;
            found.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        found.sort();
        found.dedup();
        Ok(found)
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    fn name(&self) -> &str {
        "redis"
    }

    async fn write_record(&self, record: &StoredRecord, summary: &IndexSummary) -> Result<()> {
        let fields = record.to_fields()?;
        let summary_json = summary.to_json()?;
        let id = record.record.id.as_str();
        let detail_key = keys::detail_key(id);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(&detail_key)
            .ignore()
            .hset_multiple(&detail_key, fields.as_slice())
            .ignore()
            .hset(keys::SUMMARY_INDEX, id, summary_json)
            .ignore();
        for category in Category::ALL {
            let key = keys::category_key(category);
            if category == record.record.category {
                pipe.sadd(key, id).ignore();
            } else {
                pipe.srem(key, id).ignore();
            }
        }
        self.log_change(&mut pipe, id);

        let mut conn = self.conn();
        let _: () = pipe.query_async(&mut conn).await.map_err(store_err)?;
        Ok(())
    }

    async fn delete_record(&self, id: &AssetId) -> Result<()> {
        let id = id.as_str();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(keys::detail_key(id))
            .ignore()
            .hdel(keys::SUMMARY_INDEX, id)
            .ignore();
        for category in Category::ALL {
            pipe.srem(keys::category_key(category), id).ignore();
        }
        self.log_change(&mut pipe, id);

        let mut conn = self.conn();
        let _: () = pipe.query_async(&mut conn).await.map_err(store_err)?;
        Ok(())
    }

    async fn commit_sync_state(&self, patch: &SyncStatePatch) -> Result<()> {
        let fields = state_patch_fields(patch);
        if fields.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn();
        let _: () = conn
            .hset_multiple(keys::SYNC_STATE, fields.as_slice())
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn sync_state(&self) -> Result<SyncState> {
        let mut conn = self.conn();
        let fields: HashMap<String, String> =
            conn.hgetall(keys::SYNC_STATE).await.map_err(store_err)?;
        state_from_fields(&fields)
    }

    async fn get_record(&self, id: &AssetId) -> Result<Option<StoredRecord>> {
        let mut conn = self.conn();
        let fields: HashMap<String, String> = conn
            .hgetall(keys::detail_key(id.as_str()))
            .await
            .map_err(store_err)?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(StoredRecord::from_fields(&fields)?))
    }

    async fn get_summary(&self, id: &AssetId) -> Result<Option<IndexSummary>> {
        let mut conn = self.conn();
        let json: Option<String> = conn
            .hget(keys::SUMMARY_INDEX, id.as_str())
            .await
            .map_err(store_err)?;
        json.map(|j| IndexSummary::from_json(&j)).transpose()
    }

    async fn summaries(&self, category: Option<Category>) -> Result<Vec<IndexSummary>> {
        let mut conn = self.conn();

        let mut entries: Vec<(String, String)> = match category {
            None => {
                let all: HashMap<String, String> =
                    conn.hgetall(keys::SUMMARY_INDEX).await.map_err(store_err)?;
                all.into_iter().collect()
            }
            Some(category) => {
                let members: BTreeSet<String> = conn
                    .smembers(keys::category_key(category))
                    .await
                    .map_err(store_err)?;
                if members.is_empty() {
                    return Ok(Vec::new());
                }
                let ids: Vec<String> = members.into_iter().collect();
                let values: Vec<Option<String>> = redis::cmd("HMGET")
                    .arg(keys::SUMMARY_INDEX)
                    .arg(&ids)
                    .query_async(&mut conn)
                    .await
                    .map_err(store_err)?;
                ids.into_iter()
                    .zip(values)
                    .filter_map(|(id, json)| json.map(|j| (id, j)))
                    .collect()
            }
        };

        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
            .iter()
            .map(|(_, json)| IndexSummary::from_json(json))
            .collect()
    }

    async fn category_members(&self, category: Category) -> Result<BTreeSet<String>> {
        let mut conn = self.conn();
        conn.smembers(keys::category_key(category))
            .await
            .map_err(store_err)
    }

    async fn snapshot(&self) -> Result<CacheSnapshot> {
        let mut conn = self.conn();

        let summaries: HashMap<String, String> =
            conn.hgetall(keys::SUMMARY_INDEX).await.map_err(store_err)?;

        let mut members = Vec::with_capacity(Category::ALL.len());
        for category in Category::ALL {
            let set: BTreeSet<String> = conn
                .smembers(keys::category_key(category))
                .await
                .map_err(store_err)?;
            members.push((category, set));
        }

        let mut details = HashMap::new();
        for key in self.scan_detail_keys().await? {
            let Some(id) = keys::id_from_detail_key(&key) else {
                continue;
            };
            let (category, version, fingerprint, created_at, source_path): (
                Option<String>,
                Option<String>,
                Option<String>,
                Option<String>,
                Option<String>,
            ) = redis::cmd("HMGET")
                .arg(&key)
                .arg(detail_fields::CATEGORY)
                .arg(detail_fields::VERSION)
                .arg(detail_fields::CONTENT_FINGERPRINT)
                .arg(detail_fields::CREATED_AT)
                .arg(detail_fields::SOURCE_PATH)
                .query_async(&mut conn)
                .await
                .map_err(store_err)?;
            details.insert(
                id.to_string(),
                DetailHead {
                    category,
                    version,
                    fingerprint,
                    created_at,
                    source_path,
                },
            );
        }

        Ok(CacheSnapshot::assemble(summaries, members, details))
    }

    async fn recent_changes(&self, count: usize) -> Result<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let start = -(count as isize);
        let mut ids: Vec<String> = conn
            .lrange(keys::CHANGE_LOG, start, -1)
            .await
            .map_err(store_err)?;
        ids.reverse();
        Ok(ids)
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        if pong != "PONG" {
            return Err(Error::StoreUnavailable(format!(
                "unexpected PING reply '{}'",
                pong
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: RedisCacheConfig =
            serde_json::from_value(serde_json::json!({ "url": "redis://127.0.0.1:6379/0" }))
                .unwrap();
        assert_eq!(config.change_log_capacity, 1000);
    }

    #[tokio::test]
    async fn test_invalid_url_is_config_error() {
        let result = RedisCache::connect(RedisCacheConfig::new("not-a-url")).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_zero_capacity_rejected() {
        let mut config = RedisCacheConfig::new("redis://127.0.0.1:6379/0");
        config.change_log_capacity = 0;
        assert!(matches!(
            RedisCache::connect(config).await,
            Err(Error::Config(_))
        ));
    }
}
