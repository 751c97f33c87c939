//! In-memory source of truth for testing.

use async_trait::async_trait;
use futures::stream;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use assetsync_common::{Error, Fingerprint, Result, RevisionToken, SourcePath};

use crate::fingerprint::{content_fingerprint, revision_of};
use crate::provider::{FileMatcher, RecordFileStream, SourceFile, SourceOfTruth};

#[derive(Debug, Clone)]
struct StoredFile {
    content: Vec<u8>,
    fingerprint: Fingerprint,
}

/// A commit applied through `write_file` or `delete_file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEntry {
    pub path: String,
    pub message: String,
}

#[derive(Default)]
struct Inner {
    files: BTreeMap<String, StoredFile>,
    commits: Vec<CommitEntry>,
    fail_scan_after: Option<usize>,
}

/// In-memory source of truth.
///
/// Useful for testing and development. Fingerprints and revision tokens
/// use the same Blake2b scheme as the local directory source. Failure
/// injection lets tests exercise transport errors deterministically.
#[derive(Clone, Default)]
pub struct MemorySource {
    inner: Arc<RwLock<Inner>>,
    unavailable: Arc<AtomicBool>,
}

impl MemorySource {
    /// Create a new empty namespace.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::SourceUnavailable(
                "memory source is marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    /// Make every subsequent call fail with `SourceUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make scans fail after yielding `count` files.
    pub fn set_fail_scan_after(&self, count: Option<usize>) {
        self.write().fail_scan_after = count;
    }

    /// Store a file directly, bypassing the optimistic-lock check.
    pub fn put(&self, path: &str, content: impl Into<Vec<u8>>) -> Fingerprint {
        let content = content.into();
        let fingerprint = content_fingerprint(&content);
        self.write().files.insert(
            path.trim_matches('/').to_string(),
            StoredFile {
                content,
                fingerprint: fingerprint.clone(),
            },
        );
        fingerprint
    }

    /// Remove a file directly.
    pub fn remove(&self, path: &str) -> bool {
        self.write().files.remove(path.trim_matches('/')).is_some()
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.read()
            .files
            .get(path.trim_matches('/'))
            .map(|f| f.content.clone())
    }

    pub fn fingerprint(&self, path: &str) -> Option<Fingerprint> {
        self.read()
            .files
            .get(path.trim_matches('/'))
            .map(|f| f.fingerprint.clone())
    }

    /// Commits made through the trait, oldest first.
    pub fn commits(&self) -> Vec<CommitEntry> {
        self.read().commits.clone()
    }

    fn current_revision(inner: &Inner) -> RevisionToken {
        revision_of(
            inner
                .files
                .iter()
                .map(|(path, file)| (path.as_str(), &file.fingerprint)),
        )
    }
}

#[async_trait]
impl SourceOfTruth for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn latest_revision(&self) -> Result<RevisionToken> {
        self.check_available()?;
        Ok(Self::current_revision(&self.read()))
    }

    async fn list_record_files(
        &self,
        root: &SourcePath,
        revision: &RevisionToken,
        matcher: FileMatcher,
    ) -> Result<RecordFileStream> {
        self.check_available()?;
        let inner = self.read();

        if Self::current_revision(&inner) != *revision {
            return Err(Error::SourceUnavailable(format!(
                "revision {} is no longer current",
                revision
            )));
        }

        let mut items: Vec<Result<SourceFile>> = Vec::new();
        for (key, file) in inner.files.iter() {
            let path = SourcePath::parse(key)?;
            if !path.starts_with(root) {
                continue;
            }
            if !path.name().map(matcher).unwrap_or(false) {
                continue;
            }
            items.push(Ok(SourceFile {
                path,
                content: file.content.clone(),
                fingerprint: file.fingerprint.clone(),
            }));
        }

        if let Some(limit) = inner.fail_scan_after {
            items.truncate(limit);
            items.push(Err(Error::SourceUnavailable(
                "injected failure during scan".to_string(),
            )));
        }

        Ok(Box::pin(stream::iter(items)))
    }

    async fn write_file(
        &self,
        path: &SourcePath,
        content: Vec<u8>,
        expected: Option<&Fingerprint>,
        message: &str,
    ) -> Result<Fingerprint> {
        self.check_available()?;
        let key = path.as_repo_path();
        let mut inner = self.write();

        match (inner.files.get(&key), expected) {
            (Some(existing), None) => {
                return Err(Error::Conflict {
                    path: key,
                    expected: String::new(),
                    current: existing.fingerprint.to_string(),
                });
            }
            (Some(existing), Some(expected)) if existing.fingerprint != *expected => {
                return Err(Error::Conflict {
                    path: key,
                    expected: expected.to_string(),
                    current: existing.fingerprint.to_string(),
                });
            }
            (None, Some(_)) => {
                return Err(Error::NotFound(format!("File not found: {}", key)));
            }
            _ => {}
        }

        let fingerprint = content_fingerprint(&content);
        inner.files.insert(
            key.clone(),
            StoredFile {
                content,
                fingerprint: fingerprint.clone(),
            },
        );
        inner.commits.push(CommitEntry {
            path: key,
            message: message.to_string(),
        });
        Ok(fingerprint)
    }

    async fn delete_file(
        &self,
        path: &SourcePath,
        expected: &Fingerprint,
        message: &str,
    ) -> Result<()> {
        self.check_available()?;
        let key = path.as_repo_path();
        let mut inner = self.write();

        let current = match inner.files.get(&key) {
            Some(file) => file.fingerprint.clone(),
            None => return Err(Error::NotFound(format!("File not found: {}", key))),
        };
        if current != *expected {
            return Err(Error::Conflict {
                path: key,
                expected: expected.to_string(),
                current: current.to_string(),
            });
        }

        inner.files.remove(&key);
        inner.commits.push(CommitEntry {
            path: key,
            message: message.to_string(),
        });
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        self.check_available()
    }
}
