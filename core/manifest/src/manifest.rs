//! Typed manifest document.

use serde::{Deserialize, Serialize};

use assetsync_common::{Category, Error, Result};

/// Input widget type of one configuration field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Select,
    Secret,
    Boolean,
}

/// One choice of a `select` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectOption {
    pub label: String,
    pub value: serde_json::Value,
}

/// One entry of the configuration form schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigField {
    pub name: String,
    pub label: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<SelectOption>>,
}

/// Function-calling description exposed to agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpecs {
    pub function_name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeLanguage {
    Python,
}

/// How the asset's code is loaded at run time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runtime {
    pub language: RuntimeLanguage,
    pub entry: String,
    pub handler: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Sandbox permissions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub network_access: bool,
    #[serde(default)]
    pub filesystem_read: bool,
}

/// A complete, validated manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub id: String,
    pub version: String,
    pub category: Category,
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default)]
    pub config_schema: Vec<ConfigField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_specs: Option<AgentSpecs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<Runtime>,
    #[serde(default)]
    pub permissions: Permissions,
}

impl Manifest {
    /// Increment the patch component of the version.
    ///
    /// Pre-release and build metadata are dropped, so `1.2.3-beta` becomes
    /// `1.2.4`.
    pub fn bump_patch_version(&mut self) -> Result<()> {
        let mut version = semver::Version::parse(&self.version).map_err(|e| {
            Error::InvalidInput(format!("version '{}' is not semver: {}", self.version, e))
        })?;
        version.patch += 1;
        version.pre = semver::Prerelease::EMPTY;
        version.build = semver::BuildMetadata::EMPTY;
        self.version = version.to_string();
        Ok(())
    }

    /// Serialize back to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}
