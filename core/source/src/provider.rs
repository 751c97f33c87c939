//! Source-of-truth trait definition.

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use assetsync_common::{Fingerprint, Result, RevisionToken, SourcePath};

/// One file as stored at the source of truth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Location relative to the namespace root.
    pub path: SourcePath,
    /// Raw file bytes.
    pub content: Vec<u8>,
    /// Content-derived identifier supplied by the source.
    pub fingerprint: Fingerprint,
}

/// Stream of files produced by a scan.
///
/// The stream is finite and not restartable. An `Err` item means the scan
/// failed as a whole.
pub type RecordFileStream = Pin<Box<dyn Stream<Item = Result<SourceFile>> + Send>>;

/// Predicate over a leaf file name selecting which files a scan yields.
pub type FileMatcher = fn(&str) -> bool;

/// Versioned, file-based store that owns record content.
///
/// All operations are async. Transport failures surface as
/// `Error::SourceUnavailable`; implementations do not retry on their own.
#[async_trait]
pub trait SourceOfTruth: Send + Sync {
    /// Get the source name (e.g., "github", "local", "memory").
    fn name(&self) -> &str;

    /// Fetch the opaque token identifying the current overall state.
    ///
    /// # Errors
    /// - `SourceUnavailable` if the source cannot be reached
    async fn latest_revision(&self) -> Result<RevisionToken>;

    /// List every file under `root` whose leaf name satisfies `matcher`.
    ///
    /// # Preconditions
    /// - `revision` was returned by `latest_revision`
    ///
    /// # Postconditions
    /// - Every yielded file belongs to the state identified by `revision`
    ///
    /// # Errors
    /// - `SourceUnavailable` if the source cannot be reached, or if the
    ///   source moved away from `revision` and cannot serve it any more
    async fn list_record_files(
        &self,
        root: &SourcePath,
        revision: &RevisionToken,
        matcher: FileMatcher,
    ) -> Result<RecordFileStream>;

    /// Write a file, guarded by its expected current fingerprint.
    ///
    /// `expected == None` creates the file and requires that it does not
    /// exist yet.
    ///
    /// # Postconditions
    /// - Returns the fingerprint of the newly stored content
    ///
    /// # Errors
    /// - `Conflict` if the current fingerprint differs from `expected`, or
    ///   the file exists when creating
    /// - `NotFound` if updating a file that does not exist
    /// - `SourceUnavailable` on transport failure
    async fn write_file(
        &self,
        path: &SourcePath,
        content: Vec<u8>,
        expected: Option<&Fingerprint>,
        message: &str,
    ) -> Result<Fingerprint>;

    /// Delete a file, guarded by its expected current fingerprint.
    ///
    /// # Errors
    /// - `NotFound` if the file does not exist
    /// - `Conflict` if the current fingerprint differs from `expected`
    /// - `SourceUnavailable` on transport failure
    async fn delete_file(
        &self,
        path: &SourcePath,
        expected: &Fingerprint,
        message: &str,
    ) -> Result<()>;

    /// Verify the source is reachable and the configured namespace exists.
    async fn health_check(&self) -> Result<()>;
}
