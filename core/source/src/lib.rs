//! Source-of-truth abstraction for the asset sync engine.
//!
//! The engine reads records from, and commits write-backs to, a versioned
//! file namespace. This crate defines the trait the engine needs from that
//! namespace and ships three implementations:
//! - GitHub (git trees + contents API)
//! - a local directory
//! - an in-memory namespace for tests
//!
//! Implementations are resolved by name through a [`SourceRegistry`].

pub mod fingerprint;
pub mod github;
pub mod local;
pub mod memory;
pub mod provider;
pub mod registry;

pub use fingerprint::{content_fingerprint, revision_of};
pub use github::{create_github_source, GitHubConfig, GitHubSource};
pub use local::LocalSource;
pub use memory::{CommitEntry, MemorySource};
pub use provider::{FileMatcher, RecordFileStream, SourceFile, SourceOfTruth};
pub use registry::{create_default_registry, SourceFactory, SourceRegistry};
