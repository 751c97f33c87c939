//! Common error types for the asset sync engine.

use std::fmt;
use thiserror::Error;

/// A record failed structural validation.
///
/// Carries the source path of the offending record and every failed check,
/// formatted as `[field.path] message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Location of the record in the source-of-truth namespace.
    pub path: String,
    /// One entry per failed check.
    pub reasons: Vec<String>,
}

impl ValidationError {
    /// Create a validation error with a single reason.
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reasons: vec![reason.into()],
        }
    }

    /// Create a validation error from a list of reasons.
    pub fn with_reasons(path: impl Into<String>, reasons: Vec<String>) -> Self {
        Self {
            path: path.into(),
            reasons,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.reasons.join("; "))
    }
}

impl std::error::Error for ValidationError {}

/// Top-level error type for asset sync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Record content failed validation.
    #[error("Validation failed: {0}")]
    Validation(ValidationError),

    /// Transport to the source of truth failed.
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// Transport to the cache store failed.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Optimistic-lock violation at the source of truth.
    #[error("Conflict at {path}: expected fingerprint {expected}, current is {current}")]
    Conflict {
        path: String,
        expected: String,
        current: String,
    },

    /// Cache references an id that could not be resolved.
    #[error("Orphan inconsistency: {0}")]
    OrphanInconsistency(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Another sync cycle holds the engine.
    #[error("A sync cycle is already in progress")]
    SyncInProgress,

    /// The cycle was cancelled between record writes.
    #[error("Sync cycle cancelled")]
    Cancelled,

    /// Configuration is missing or malformed.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Stable machine-readable reason code.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_failed",
            Error::SourceUnavailable(_) => "source_unavailable",
            Error::StoreUnavailable(_) => "store_unavailable",
            Error::Conflict { .. } => "conflict",
            Error::OrphanInconsistency(_) => "orphan_inconsistency",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::InvalidInput(_) => "invalid_input",
            Error::NotFound(_) => "not_found",
            Error::AlreadyExists(_) => "already_exists",
            Error::SyncInProgress => "sync_in_progress",
            Error::Cancelled => "cancelled",
            Error::Config(_) => "config_error",
        }
    }

    /// Whether a retry of the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::SourceUnavailable(_) | Error::StoreUnavailable(_))
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
