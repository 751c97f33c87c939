//! Common types used throughout the asset sync engine.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

static ASSET_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("static pattern"));

/// Stable identifier of one asset, unique across the whole system.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AssetId(String);

impl AssetId {
    /// Create a new AssetId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty or contains characters other than
    ///   alphanumerics, underscore and hyphen
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if !ASSET_ID_PATTERN.is_match(&id) {
            return Err(crate::Error::InvalidInput(format!(
                "id '{}' contains invalid characters. Use only alphanumeric, underscore, and hyphen",
                id
            )));
        }
        Ok(Self(id))
    }

    /// Check a candidate id without constructing it.
    pub fn is_valid(id: &str) -> bool {
        ASSET_ID_PATTERN.is_match(id)
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AssetId {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<AssetId> for String {
    fn from(id: AssetId) -> Self {
        id.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed set of asset categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Tool,
    Prompt,
    Skill,
}

impl Category {
    /// Every category, in index order.
    pub const ALL: [Category; 3] = [Category::Tool, Category::Prompt, Category::Skill];

    /// Wire name used in manifests and cache keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Tool => "tool",
            Category::Prompt => "prompt",
            Category::Skill => "skill",
        }
    }

    /// Default directory for new manifests of this category.
    pub fn directory(&self) -> &'static str {
        match self {
            Category::Tool => "tools",
            Category::Prompt => "prompts",
            Category::Skill => "skills",
        }
    }
}

impl FromStr for Category {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "tool" => Ok(Category::Tool),
            "prompt" => Ok(Category::Prompt),
            "skill" => Ok(Category::Skill),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown category '{}', expected one of tool, prompt, skill",
                other
            ))),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content-derived identifier of one record's stored bytes.
///
/// Supplied by the source of truth; never computed by the engine for
/// change detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identifier of the source of truth's overall state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionToken(String);

impl RevisionToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The token of a cache that has never completed a sync.
    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RevisionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A location in the source-of-truth namespace.
///
/// Paths are relative to the repository root and use '/' as separator;
/// the empty path is the root itself.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourcePath {
    components: Vec<String>,
}

impl SourcePath {
    /// Create a root path.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Create a path from string components.
    ///
    /// # Errors
    /// - Returns error if any component is empty, contains a separator, or is
    ///   a relative segment (`.` or `..`)
    pub fn from_components(components: Vec<String>) -> crate::Result<Self> {
        for comp in &components {
            if comp.is_empty() {
                return Err(crate::Error::InvalidInput(
                    "Path component cannot be empty".to_string(),
                ));
            }
            if comp.contains('/') || comp.contains('\\') {
                return Err(crate::Error::InvalidInput(
                    "Path component cannot contain separators".to_string(),
                ));
            }
            if comp == "." || comp == ".." {
                return Err(crate::Error::InvalidInput(format!(
                    "Path component '{}' is not allowed",
                    comp
                )));
            }
        }
        Ok(Self { components })
    }

    /// Parse a path string. Leading and trailing separators are ignored.
    pub fn parse(path: &str) -> crate::Result<Self> {
        let path = path.trim_start_matches('/').trim_end_matches('/');
        if path.is_empty() {
            return Ok(Self::root());
        }

        let components: Vec<String> = path.split('/').map(String::from).collect();
        Self::from_components(components)
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Get the parent path, if any.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            let mut components = self.components.clone();
            components.pop();
            Some(Self { components })
        }
    }

    /// Get the file/directory name (last component).
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// Join this path with a child component.
    pub fn join(&self, child: &str) -> crate::Result<Self> {
        let mut components = self.components.clone();
        components.push(child.to_string());
        Self::from_components(components)
    }

    /// Whether `self` equals `prefix` or lies beneath it.
    pub fn starts_with(&self, prefix: &SourcePath) -> bool {
        self.components.starts_with(&prefix.components)
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Repository-relative string form, without a leading separator.
    pub fn as_repo_path(&self) -> String {
        self.components.join("/")
    }
}

impl TryFrom<String> for SourcePath {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<SourcePath> for String {
    fn from(path: SourcePath) -> Self {
        path.as_repo_path()
    }
}

impl fmt::Display for SourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_repo_path())
    }
}
