//! Common utilities and types shared across the asset sync modules.
//!
//! This module provides the identifiers, error taxonomy and sync-state model
//! used by every other crate in the workspace, so that the source, cache and
//! engine layers agree on a single vocabulary.

pub mod error;
pub mod state;
pub mod types;

pub use error::{Error, Result, ValidationError};
pub use state::{SyncState, SyncStatePatch, SyncStatus};
pub use types::{AssetId, Category, Fingerprint, RevisionToken, SourcePath};
