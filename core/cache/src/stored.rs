//! Field codec for detail and sync-state hashes.

use std::collections::HashMap;

use assetsync_common::{
    AssetId, Category, Error, Fingerprint, Result, RevisionToken, SourcePath, SyncState,
    SyncStatePatch,
};
use assetsync_manifest::{Payload, Record};

use crate::keys::state_fields;

/// Field names of a record detail hash.
pub mod detail_fields {
    pub const ID: &str = "id";
    pub const NAME: &str = "name";
    pub const CATEGORY: &str = "category";
    pub const VERSION: &str = "version";
    pub const DESCRIPTION: &str = "description";
    pub const AUTHOR: &str = "author";
    pub const PAYLOAD: &str = "payload";
    pub const CONFIG_SCHEMA: &str = "configSchema";
    pub const AGENT_SPECS: &str = "agentSpecs";
    pub const RUNTIME: &str = "runtime";
    pub const PERMISSIONS: &str = "permissions";
    pub const SOURCE_PATH: &str = "sourcePath";
    pub const CONTENT_FINGERPRINT: &str = "contentFingerprint";
    pub const CREATED_AT: &str = "createdAt";
    pub const UPDATED_AT: &str = "updatedAt";
}

use detail_fields as f;

/// A record as persisted in its detail hash.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub record: Record,
    /// Unix timestamp of the first write; preserved across updates.
    pub created_at: i64,
    /// Unix timestamp of the latest write.
    pub updated_at: i64,
}

impl StoredRecord {
    pub fn new(record: Record, created_at: i64, updated_at: i64) -> Self {
        Self {
            record,
            created_at,
            updated_at,
        }
    }

    /// Flatten into hash fields.
    ///
    /// Optional sections are omitted rather than written empty.
    pub fn to_fields(&self) -> Result<Vec<(String, String)>> {
        let r = &self.record;
        let payload = &r.payload;

        let mut fields = vec![
            (f::ID.to_string(), r.id.to_string()),
            (f::NAME.to_string(), r.name.clone()),
            (f::CATEGORY.to_string(), r.category.to_string()),
            (f::VERSION.to_string(), r.version.clone()),
            (f::DESCRIPTION.to_string(), r.description.clone()),
        ];
        if let Some(author) = &r.author {
            fields.push((f::AUTHOR.to_string(), author.clone()));
        }
        fields.push((f::PAYLOAD.to_string(), payload.to_json()?));
        fields.push((
            f::CONFIG_SCHEMA.to_string(),
            serde_json::to_string(&payload.config_schema)?,
        ));
        if let Some(specs) = &payload.agent_specs {
            fields.push((f::AGENT_SPECS.to_string(), serde_json::to_string(specs)?));
        }
        if let Some(runtime) = &payload.runtime {
            fields.push((f::RUNTIME.to_string(), serde_json::to_string(runtime)?));
        }
        fields.push((
            f::PERMISSIONS.to_string(),
            serde_json::to_string(&payload.permissions)?,
        ));
        fields.push((f::SOURCE_PATH.to_string(), r.source_path.to_string()));
        fields.push((
            f::CONTENT_FINGERPRINT.to_string(),
            r.content_fingerprint.to_string(),
        ));
        fields.push((f::CREATED_AT.to_string(), self.created_at.to_string()));
        fields.push((f::UPDATED_AT.to_string(), self.updated_at.to_string()));

        Ok(fields)
    }

    /// Rebuild from a detail hash.
    ///
    /// The `payload` field is authoritative; the per-section fields are
    /// derived copies for readers that only need one section.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let get = |name: &str| required(fields, name);

        let record = Record {
            id: AssetId::new(get(f::ID)?.as_str())
                .map_err(|e| Error::Serialization(e.to_string()))?,
            category: get(f::CATEGORY)?
                .parse::<Category>()
                .map_err(|e| Error::Serialization(e.to_string()))?,
            name: get(f::NAME)?.clone(),
            description: get(f::DESCRIPTION)?.clone(),
            version: get(f::VERSION)?.clone(),
            author: fields.get(f::AUTHOR).cloned(),
            payload: Payload::from_json(get(f::PAYLOAD)?)?,
            source_path: SourcePath::parse(get(f::SOURCE_PATH)?)
                .map_err(|e| Error::Serialization(e.to_string()))?,
            content_fingerprint: Fingerprint::new(get(f::CONTENT_FINGERPRINT)?.as_str()),
        };

        Ok(Self {
            record,
            created_at: parse_i64(f::CREATED_AT, get(f::CREATED_AT)?)?,
            updated_at: parse_i64(f::UPDATED_AT, get(f::UPDATED_AT)?)?,
        })
    }
}

fn required<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a String> {
    fields
        .get(name)
        .ok_or_else(|| Error::Serialization(format!("detail hash is missing '{}'", name)))
}

fn parse_i64(name: &str, value: &str) -> Result<i64> {
    value
        .parse()
        .map_err(|_| Error::Serialization(format!("field '{}' is not an integer: '{}'", name, value)))
}

/// Hash fields written for a sync-state patch.
pub fn state_patch_fields(patch: &SyncStatePatch) -> Vec<(&'static str, String)> {
    let mut fields = Vec::new();
    if let Some(time) = patch.last_sync_time {
        fields.push((state_fields::LAST_SYNC_TIME, time.to_string()));
    }
    if let Some(token) = &patch.last_revision_token {
        fields.push((state_fields::LAST_REVISION_TOKEN, token.to_string()));
    }
    if let Some(count) = patch.record_count {
        fields.push((state_fields::RECORD_COUNT, count.to_string()));
    }
    if let Some(status) = patch.status {
        fields.push((state_fields::STATUS, status.to_string()));
    }
    if let Some(time) = patch.sync_started_at {
        fields.push((state_fields::SYNC_STARTED_AT, time.to_string()));
    }
    fields
}

/// Decode the sync-state hash. Missing fields take their initial values.
pub fn state_from_fields(fields: &HashMap<String, String>) -> Result<SyncState> {
    let mut state = SyncState::new();
    if let Some(time) = fields.get(state_fields::LAST_SYNC_TIME) {
        state.last_sync_time = parse_i64(state_fields::LAST_SYNC_TIME, time)?;
    }
    if let Some(token) = fields.get(state_fields::LAST_REVISION_TOKEN) {
        state.last_revision_token = RevisionToken::new(token.as_str());
    }
    if let Some(count) = fields.get(state_fields::RECORD_COUNT) {
        state.record_count = count.parse().map_err(|_| {
            Error::Serialization(format!("field 'recordCount' is not an integer: '{}'", count))
        })?;
    }
    if let Some(status) = fields.get(state_fields::STATUS) {
        state.status = status.parse()?;
    }
    if let Some(time) = fields.get(state_fields::SYNC_STARTED_AT) {
        state.sync_started_at = parse_i64(state_fields::SYNC_STARTED_AT, time)?;
    }
    Ok(state)
}
