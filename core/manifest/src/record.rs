//! Records as the engine sees them.

use serde::{Deserialize, Serialize};

use assetsync_common::{AssetId, Category, Fingerprint, Result, SourcePath};

use crate::manifest::{AgentSpecs, ConfigField, Manifest, Permissions, Runtime};

/// Maximum length, in characters, of a summary's description.
pub const SHORT_DESCRIPTION_LEN: usize = 100;

/// A record file exactly as read from the source of truth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub path: SourcePath,
    pub content: Vec<u8>,
    pub fingerprint: Fingerprint,
}

/// The validated, shape-checked configuration blob of a record.
///
/// The engine treats it as opaque; only the cache codec looks inside to
/// lay out the per-section fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub config_schema: Vec<ConfigField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_specs: Option<AgentSpecs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<Runtime>,
    pub permissions: Permissions,
}

impl Payload {
    /// Canonical compact JSON encoding.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// One synchronized asset.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: AssetId,
    pub category: Category,
    pub name: String,
    pub description: String,
    pub version: String,
    pub author: Option<String>,
    pub payload: Payload,
    pub source_path: SourcePath,
    pub content_fingerprint: Fingerprint,
}

impl Record {
    /// Combine a validated manifest with its source location.
    pub fn from_manifest(
        manifest: Manifest,
        source_path: SourcePath,
        content_fingerprint: Fingerprint,
    ) -> Result<Self> {
        Ok(Self {
            id: AssetId::new(manifest.id)?,
            category: manifest.category,
            name: manifest.name,
            description: manifest.description,
            version: manifest.version,
            author: manifest.author,
            payload: Payload {
                config_schema: manifest.config_schema,
                agent_specs: manifest.agent_specs,
                runtime: manifest.runtime,
                permissions: manifest.permissions,
            },
            source_path,
            content_fingerprint,
        })
    }

    /// Derive the listing projection.
    pub fn summary(&self) -> IndexSummary {
        IndexSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            category: self.category,
            version: self.version.clone(),
            short_description: truncate_chars(&self.description, SHORT_DESCRIPTION_LEN),
        }
    }
}

/// Lossy projection of a record, stored in the global summary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSummary {
    pub id: AssetId,
    pub name: String,
    pub category: Category,
    pub version: String,
    pub short_description: String,
}

impl IndexSummary {
    /// Compact JSON as stored in the summary index.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
