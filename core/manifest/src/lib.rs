//! Asset manifest model and validation.
//!
//! A manifest is the YAML document that defines one asset in the source of
//! truth. This crate turns raw manifest bytes into validated [`Record`]s and
//! derives the lightweight [`IndexSummary`] projection used for listings.

pub mod manifest;
pub mod record;
pub mod validator;

pub use manifest::{
    AgentSpecs, ConfigField, FieldType, Manifest, Permissions, Runtime, RuntimeLanguage,
    SelectOption,
};
pub use record::{IndexSummary, Payload, RawRecord, Record, SHORT_DESCRIPTION_LEN};
pub use validator::{is_manifest_file, ManifestValidator, MANIFEST_FILENAMES};
