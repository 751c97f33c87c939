//! Settings file and environment loading.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use assetsync_cache::keys::DEFAULT_CHANGE_LOG_CAPACITY;
use assetsync_common::{Error, Result, SourcePath};
use assetsync_source::GitHubConfig;
use assetsync_sync::{SyncConfig, SyncMode, DEFAULT_CYCLE_LEASE};

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/0";
const DEFAULT_INTERVAL_SECONDS: u64 = 300;
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub source: SourceSettings,
    pub cache: CacheSettings,
    pub sync: SyncSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    /// `github`, `local` or `memory`.
    pub kind: String,
    pub token: Option<String>,
    pub repo: Option<String>,
    pub branch: Option<String>,
    /// Subtree scanned for manifests; empty for the whole namespace.
    pub base_path: String,
    pub api_url: Option<String>,
    /// Directory of the `local` kind.
    pub root: Option<PathBuf>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            kind: "github".to_string(),
            token: None,
            repo: None,
            branch: None,
            base_path: String::new(),
            api_url: None,
            root: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// `redis` or `memory`.
    pub kind: String,
    pub url: Option<String>,
    pub change_log_capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            kind: "redis".to_string(),
            url: None,
            change_log_capacity: DEFAULT_CHANGE_LOG_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub interval_seconds: Option<u64>,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Seconds a `syncing` status blocks other processes sharing the cache.
    pub lease_seconds: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_seconds: None,
            max_retries: 3,
            retry_delay_ms: 5000,
            lease_seconds: DEFAULT_CYCLE_LEASE.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: Option<String>,
    pub format: LogFormat,
}

impl Settings {
    /// Load `path` if it exists, then fill unset fields from the process
    /// environment.
    ///
    /// # Errors
    /// - `Config` if `required` is set and the file is missing, or the file
    ///   is not valid YAML for these settings
    pub fn load(path: &Path, required: bool) -> Result<Self> {
        let mut settings = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            serde_yaml::from_str(&text).map_err(|e| {
                Error::Config(format!("Invalid settings file {}: {}", path.display(), e))
            })?
        } else if required {
            return Err(Error::Config(format!(
                "Settings file not found: {}",
                path.display()
            )));
        } else {
            Settings::default()
        };
        settings.apply_env(|name| std::env::var(name).ok());
        Ok(settings)
    }

    /// Fill fields the file left unset from `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fill(&mut self.source.token, lookup("GITHUB_TOKEN"));
        fill(&mut self.source.repo, lookup("GITHUB_REPO"));
        fill(&mut self.source.branch, lookup("GITHUB_BRANCH"));
        fill(&mut self.logging.level, lookup("LOG_LEVEL"));

        if self.sync.interval_seconds.is_none() {
            self.sync.interval_seconds = lookup("SYNC_INTERVAL").and_then(|v| v.parse().ok());
        }

        if self.cache.url.is_none() {
            self.cache.url = lookup("REDIS_URL").or_else(|| {
                let host = lookup("REDIS_HOST")?;
                let port = lookup("REDIS_PORT").unwrap_or_else(|| "6379".to_string());
                let db = lookup("REDIS_DB").unwrap_or_else(|| "0".to_string());
                let password = lookup("REDIS_PASSWORD").filter(|p| !p.is_empty());
                Some(redis_url_from_parts(&host, &port, password.as_deref(), &db))
            });
        }
    }

    /// Check everything that can be checked before any I/O.
    pub fn validate(&self) -> Result<()> {
        match self.source.kind.as_str() {
            "github" => self.github_config()?.validate()?,
            "local" => {
                if self.source.root.is_none() {
                    return Err(Error::Config(
                        "source.root is required for the local source".to_string(),
                    ));
                }
            }
            "memory" => {}
            other => {
                return Err(Error::Config(format!("Unknown source kind '{}'", other)));
            }
        }

        match self.cache.kind.as_str() {
            "redis" | "memory" => {}
            other => return Err(Error::Config(format!("Unknown cache kind '{}'", other))),
        }
        if self.cache.change_log_capacity == 0 {
            return Err(Error::Config(
                "cache.change_log_capacity must be at least 1".to_string(),
            ));
        }
        if self.cache.kind == "redis" {
            Url::parse(&self.redis_url())
                .map_err(|e| Error::Config(format!("Invalid cache URL: {}", e)))?;
        }
        if self.sync.lease_seconds == 0 {
            return Err(Error::Config(
                "sync.lease_seconds must be greater than zero".to_string(),
            ));
        }
        if self.interval() == Duration::ZERO {
            return Err(Error::Config(
                "sync.interval_seconds must be greater than zero".to_string(),
            ));
        }
        self.root()?;
        Ok(())
    }

    fn github_config(&self) -> Result<GitHubConfig> {
        let token = self.source.token.clone().ok_or_else(|| {
            Error::Config("GitHub token is required (source.token or GITHUB_TOKEN)".to_string())
        })?;
        let repo = self.source.repo.clone().ok_or_else(|| {
            Error::Config("GitHub repo is required (source.repo or GITHUB_REPO)".to_string())
        })?;
        let mut config: GitHubConfig =
            serde_json::from_value(json!({ "token": token, "repo": repo }))?;
        if let Some(branch) = &self.source.branch {
            config.branch = branch.clone();
        }
        if let Some(api_url) = &self.source.api_url {
            config.api_url = api_url.clone();
        }
        Ok(config)
    }

    /// Configuration value handed to the source registry.
    pub fn source_config(&self) -> Result<Value> {
        match self.source.kind.as_str() {
            "github" => Ok(serde_json::to_value(self.github_config()?)?),
            "local" => Ok(json!({ "root": self.source.root })),
            _ => Ok(json!({})),
        }
    }

    pub fn root(&self) -> Result<SourcePath> {
        let base = self.source.base_path.trim_matches('/');
        if base.is_empty() {
            Ok(SourcePath::root())
        } else {
            SourcePath::parse(base)
                .map_err(|e| Error::Config(format!("Invalid source.base_path: {}", e)))
        }
    }

    pub fn redis_url(&self) -> String {
        self.cache
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_seconds.unwrap_or(DEFAULT_INTERVAL_SECONDS))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.sync.retry_delay_ms)
    }

    pub fn log_level(&self) -> &str {
        self.logging.level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }

    pub fn sync_config(&self) -> Result<SyncConfig> {
        Ok(SyncConfig {
            root: self.root()?,
            max_retries: self.sync.max_retries,
            retry_delay: self.retry_delay(),
            sync_mode: SyncMode::Periodic {
                interval: self.interval(),
            },
            cycle_lease: Duration::from_secs(self.sync.lease_seconds),
        })
    }
}

/// Assemble a connection URL, percent-encoding the password.
///
/// If the parts do not form a URL the unencoded form is returned and
/// rejected later by `validate`.
fn redis_url_from_parts(host: &str, port: &str, password: Option<&str>, db: &str) -> String {
    let plain = format!("redis://{}:{}/{}", host, port, db);
    let Ok(mut url) = Url::parse(&plain) else {
        return plain;
    };
    if let Some(password) = password {
        if url.set_password(Some(password)).is_err() {
            return plain;
        }
    }
    url.to_string()
}

fn fill(field: &mut Option<String>, value: Option<String>) {
    if field.is_none() {
        *field = value;
    }
}
