//! Local directory source of truth.

use async_trait::async_trait;
use futures::stream;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use assetsync_common::{Error, Fingerprint, Result, RevisionToken, SourcePath};

use crate::fingerprint::{content_fingerprint, revision_of};
use crate::provider::{FileMatcher, RecordFileStream, SourceFile, SourceOfTruth};

/// Source of truth backed by a plain directory tree.
///
/// Hidden entries (names starting with '.') are ignored, so a git
/// checkout can be used directly. Writes are serialized by a process-local
/// lock; the fingerprint check and the write happen under the same lock.
pub struct LocalSource {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl LocalSource {
    /// Create a new local source rooted at `root`.
    ///
    /// # Errors
    /// - `InvalidInput` if `root` exists and is not a directory
    /// - Permission denied creating the directory
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if root.exists() && !root.is_dir() {
            return Err(Error::InvalidInput(format!(
                "Local source root is not a directory: {}",
                root.display()
            )));
        }
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn to_fs_path(&self, path: &SourcePath) -> PathBuf {
        let mut fs_path = self.root.clone();
        for component in path.components() {
            fs_path.push(component);
        }
        fs_path
    }

    /// Read every visible file under the root.
    async fn snapshot(&self) -> Result<Vec<SourceFile>> {
        let mut files = Vec::new();
        let mut pending = vec![(self.root.clone(), SourcePath::root())];

        while let Some((dir, prefix)) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await.map_err(unavailable)?;
            while let Some(entry) = entries.next_entry().await.map_err(unavailable)? {
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    debug!(path = %entry.path().display(), "Skipping non UTF-8 file name");
                    continue;
                };
                if name.starts_with('.') {
                    continue;
                }
                let Ok(path) = prefix.join(&name) else {
                    continue;
                };

                let file_type = entry.file_type().await.map_err(unavailable)?;
                if file_type.is_dir() {
                    pending.push((entry.path(), path));
                } else if file_type.is_file() {
                    let content = fs::read(entry.path()).await.map_err(unavailable)?;
                    let fingerprint = content_fingerprint(&content);
                    files.push(SourceFile {
                        path,
                        content,
                        fingerprint,
                    });
                }
            }
        }

        Ok(files)
    }

    fn revision(files: &[SourceFile]) -> RevisionToken {
        let keyed: Vec<(String, &Fingerprint)> = files
            .iter()
            .map(|f| (f.path.as_repo_path(), &f.fingerprint))
            .collect();
        revision_of(keyed.iter().map(|(p, f)| (p.as_str(), *f)))
    }

    async fn current_fingerprint(&self, path: &SourcePath) -> Result<Option<Fingerprint>> {
        let fs_path = self.to_fs_path(path);
        match fs::read(&fs_path).await {
            Ok(content) => Ok(Some(content_fingerprint(&content))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable(e)),
        }
    }
}

fn unavailable(e: std::io::Error) -> Error {
    Error::SourceUnavailable(format!("local source I/O failed: {}", e))
}

#[async_trait]
impl SourceOfTruth for LocalSource {
    fn name(&self) -> &str {
        "local"
    }

    async fn latest_revision(&self) -> Result<RevisionToken> {
        let files = self.snapshot().await?;
        Ok(Self::revision(&files))
    }

    async fn list_record_files(
        &self,
        root: &SourcePath,
        revision: &RevisionToken,
        matcher: FileMatcher,
    ) -> Result<RecordFileStream> {
        let files = self.snapshot().await?;
        if Self::revision(&files) != *revision {
            return Err(Error::SourceUnavailable(format!(
                "revision {} is no longer current",
                revision
            )));
        }

        let selected: Vec<Result<SourceFile>> = files
            .into_iter()
            .filter(|f| f.path.starts_with(root))
            .filter(|f| f.path.name().map(matcher).unwrap_or(false))
            .map(Ok)
            .collect();

        Ok(Box::pin(stream::iter(selected)))
    }

    async fn write_file(
        &self,
        path: &SourcePath,
        content: Vec<u8>,
        expected: Option<&Fingerprint>,
        _message: &str,
    ) -> Result<Fingerprint> {
        if path.is_root() {
            return Err(Error::InvalidInput("Cannot write to the root path".to_string()));
        }
        let _guard = self.write_lock.lock().await;

        match (self.current_fingerprint(path).await?, expected) {
            (Some(current), None) => {
                return Err(Error::Conflict {
                    path: path.to_string(),
                    expected: String::new(),
                    current: current.to_string(),
                });
            }
            (Some(current), Some(expected)) if current != *expected => {
                return Err(Error::Conflict {
                    path: path.to_string(),
                    expected: expected.to_string(),
                    current: current.to_string(),
                });
            }
            (None, Some(_)) => {
                return Err(Error::NotFound(format!("File not found: {}", path)));
            }
            _ => {}
        }

        let fs_path = self.to_fs_path(path);
        if let Some(parent) = fs_path.parent() {
            fs::create_dir_all(parent).await.map_err(unavailable)?;
        }
        fs::write(&fs_path, &content).await.map_err(unavailable)?;

        Ok(content_fingerprint(&content))
    }

    async fn delete_file(
        &self,
        path: &SourcePath,
        expected: &Fingerprint,
        _message: &str,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let current = self
            .current_fingerprint(path)
            .await?
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", path)))?;
        if current != *expected {
            return Err(Error::Conflict {
                path: path.to_string(),
                expected: expected.to_string(),
                current: current.to_string(),
            });
        }

        fs::remove_file(self.to_fs_path(path))
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        let meta = fs::metadata(&self.root).await.map_err(unavailable)?;
        if !meta.is_dir() {
            return Err(Error::SourceUnavailable(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        Ok(())
    }
}
