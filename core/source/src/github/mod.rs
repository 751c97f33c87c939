//! GitHub source of truth.
//!
//! Reads record files from the git tree of a branch head and commits
//! write-backs through the contents API, using blob shas as the optimistic
//! lock.

pub mod client;
pub mod provider;

pub use client::GitHubClient;
pub use provider::{create_github_source, GitHubConfig, GitHubSource, DEFAULT_API_URL};
