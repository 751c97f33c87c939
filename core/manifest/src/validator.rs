//! Structural validation of manifest documents.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

use assetsync_common::{AssetId, ValidationError};

use crate::manifest::Manifest;
use crate::record::{RawRecord, Record};

/// File names recognised as record manifests (compared case-insensitively).
pub const MANIFEST_FILENAMES: [&str; 2] = ["manifest.yaml", "manifest.yml"];

static VERSION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d+\.\d+\.\d+(-[a-zA-Z0-9.]+)?$").expect("static pattern")
});
static IDENTIFIER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("static pattern"));

const CATEGORIES: [&str; 3] = ["tool", "prompt", "skill"];
const FIELD_TYPES: [&str; 5] = ["string", "number", "select", "secret", "boolean"];
const LANGUAGES: [&str; 1] = ["python"];

/// Whether a leaf name follows the manifest naming convention.
pub fn is_manifest_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    MANIFEST_FILENAMES.iter().any(|candidate| *candidate == lower)
}

/// Parses and type-checks manifest documents.
///
/// Stateless; every check failure is collected so a single report lists
/// everything wrong with a record.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestValidator;

impl ManifestValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a raw record and build the structured form.
    pub fn parse(&self, raw: &RawRecord) -> Result<Record, ValidationError> {
        let path = raw.path.to_string();
        let content = std::str::from_utf8(&raw.content)
            .map_err(|e| ValidationError::new(&path, format!("[root] not valid UTF-8: {}", e)))?;

        let manifest = self.validate_document(&path, content)?;
        Record::from_manifest(manifest, raw.path.clone(), raw.fingerprint.clone())
            .map_err(|e| ValidationError::new(&path, format!("[id] {}", e)))
    }

    /// Validate YAML text and return the typed manifest.
    ///
    /// `path` is only used to label the error.
    pub fn validate_document(&self, path: &str, content: &str) -> Result<Manifest, ValidationError> {
        let document: Value = serde_yaml::from_str(content)
            .map_err(|e| ValidationError::new(path, format!("[root] YAML parsing error: {}", e)))?;

        let errors = self.check(&document);
        if !errors.is_empty() {
            return Err(ValidationError::with_reasons(path, errors));
        }

        serde_json::from_value(document)
            .map_err(|e| ValidationError::new(path, format!("[root] {}", e)))
    }

    /// Run every structural check, returning the list of failures.
    pub fn check(&self, document: &Value) -> Vec<String> {
        let mut checker = Checker::default();

        let Some(root) = document.as_object() else {
            checker.fail("root", "YAML content must be a mapping");
            return checker.errors;
        };

        if let Some(id) = checker.required_str(root, "id", "id") {
            if !AssetId::is_valid(id) {
                checker.fail(
                    "id",
                    format!(
                        "'{}' contains invalid characters. Use only alphanumeric, underscore, and hyphen",
                        id
                    ),
                );
            }
        }
        if let Some(version) = checker.required_str(root, "version", "version") {
            if !VERSION_PATTERN.is_match(version) {
                checker.fail(
                    "version",
                    format!("'{}' is not valid semver (e.g., '1.0.0')", version),
                );
            }
        }
        if let Some(category) = checker.required_str(root, "category", "category") {
            checker.one_of("category", category, &CATEGORIES);
        }
        if let Some(name) = checker.required_str(root, "name", "name") {
            checker.non_empty("name", name);
        }
        if let Some(description) = checker.required_str(root, "description", "description") {
            checker.non_empty("description", description);
        }
        checker.optional_str(root, "author", "author");

        if let Some(schema) = root.get("config_schema") {
            self.check_config_schema(&mut checker, schema);
        }
        if let Some(specs) = root.get("agent_specs") {
            self.check_agent_specs(&mut checker, specs);
        }
        if let Some(runtime) = root.get("runtime") {
            self.check_runtime(&mut checker, runtime);
        }
        if let Some(permissions) = root.get("permissions") {
            self.check_permissions(&mut checker, permissions);
        }

        checker.errors
    }

    fn check_config_schema(&self, checker: &mut Checker, schema: &Value) {
        let Some(items) = schema.as_array() else {
            checker.fail("config_schema", "must be a list");
            return;
        };

        for (index, item) in items.iter().enumerate() {
            let at = format!("config_schema.{}", index);
            let Some(field) = item.as_object() else {
                checker.fail(&at, "must be a mapping");
                continue;
            };

            if let Some(name) = checker.required_str(field, "name", &format!("{}.name", at)) {
                if !IDENTIFIER_PATTERN.is_match(name) {
                    checker.fail(&format!("{}.name", at), format!("'{}' is not a valid variable name", name));
                }
            }
            if let Some(label) = checker.required_str(field, "label", &format!("{}.label", at)) {
                checker.non_empty(&format!("{}.label", at), label);
            }
            let field_type = checker.required_str(field, "type", &format!("{}.type", at));
            if let Some(field_type) = field_type {
                checker.one_of(&format!("{}.type", at), field_type, &FIELD_TYPES);
            }
            checker.optional_bool(field, "required", &format!("{}.required", at));
            checker.optional_str(field, "placeholder", &format!("{}.placeholder", at));

            let options_at = format!("{}.options", at);
            match field.get("options") {
                Some(Value::Array(options)) => {
                    if field_type == Some("select") && options.is_empty() {
                        checker.fail(&options_at, "must contain at least one option for type 'select'");
                    }
                    for (opt_index, option) in options.iter().enumerate() {
                        let opt_at = format!("{}.{}", options_at, opt_index);
                        match option.as_object() {
                            Some(opt) => {
                                checker.required_str(opt, "label", &format!("{}.label", opt_at));
                                if !opt.contains_key("value") {
                                    checker.fail(&format!("{}.value", opt_at), "is required");
                                }
                            }
                            None => checker.fail(&opt_at, "must be a mapping"),
                        }
                    }
                }
                Some(Value::Null) | None => {
                    if field_type == Some("select") {
                        checker.fail(&options_at, "is required when type is 'select'");
                    }
                }
                Some(_) => checker.fail(&options_at, "must be a list"),
            }
        }
    }

    fn check_agent_specs(&self, checker: &mut Checker, specs: &Value) {
        let Some(specs) = specs.as_object() else {
            checker.fail("agent_specs", "must be a mapping");
            return;
        };

        if let Some(name) = checker.required_str(specs, "function_name", "agent_specs.function_name") {
            if !IDENTIFIER_PATTERN.is_match(name) {
                checker.fail(
                    "agent_specs.function_name",
                    format!("'{}' is not a valid function name", name),
                );
            }
        }
        if let Some(description) =
            checker.required_str(specs, "description", "agent_specs.description")
        {
            checker.non_empty("agent_specs.description", description);
        }

        match specs.get("parameters") {
            Some(Value::Object(params)) => {
                match params.get("type") {
                    Some(Value::String(t)) if t == "object" => {}
                    Some(_) => checker.fail("agent_specs.parameters.type", "must be 'object'"),
                    None => checker.fail("agent_specs.parameters.type", "is required"),
                }
                if let Some(properties) = params.get("properties") {
                    if !properties.is_object() {
                        checker.fail("agent_specs.parameters.properties", "must be a mapping");
                    }
                }
                if let Some(required) = params.get("required") {
                    let all_strings = required
                        .as_array()
                        .map(|items| items.iter().all(Value::is_string))
                        .unwrap_or(false);
                    if !all_strings {
                        checker.fail("agent_specs.parameters.required", "must be a list of strings");
                    }
                }
            }
            Some(_) => checker.fail("agent_specs.parameters", "must be a mapping"),
            None => checker.fail("agent_specs.parameters", "is required"),
        }
    }

    fn check_runtime(&self, checker: &mut Checker, runtime: &Value) {
        let Some(runtime) = runtime.as_object() else {
            checker.fail("runtime", "must be a mapping");
            return;
        };

        if let Some(language) = checker.required_str(runtime, "language", "runtime.language") {
            checker.one_of("runtime.language", language, &LANGUAGES);
        }
        checker.required_str(runtime, "entry", "runtime.entry");
        checker.required_str(runtime, "handler", "runtime.handler");

        if let Some(deps) = runtime.get("dependencies") {
            let all_strings = deps
                .as_array()
                .map(|items| items.iter().all(Value::is_string))
                .unwrap_or(false);
            if !all_strings {
                checker.fail("runtime.dependencies", "must be a list of strings");
            }
        }
    }

    fn check_permissions(&self, checker: &mut Checker, permissions: &Value) {
        let Some(permissions) = permissions.as_object() else {
            checker.fail("permissions", "must be a mapping");
            return;
        };
        checker.optional_bool(permissions, "network_access", "permissions.network_access");
        checker.optional_bool(permissions, "filesystem_read", "permissions.filesystem_read");
    }
}

#[derive(Default)]
struct Checker {
    errors: Vec<String>,
}

impl Checker {
    fn fail(&mut self, at: &str, message: impl AsRef<str>) {
        self.errors.push(format!("[{}] {}", at, message.as_ref()));
    }

    fn required_str<'a>(&mut self, obj: &'a Map<String, Value>, key: &str, at: &str) -> Option<&'a str> {
        match obj.get(key) {
            Some(Value::String(s)) => Some(s.as_str()),
            Some(_) => {
                self.fail(at, "must be a string");
                None
            }
            None => {
                self.fail(at, "is required");
                None
            }
        }
    }

    fn optional_str(&mut self, obj: &Map<String, Value>, key: &str, at: &str) {
        if let Some(value) = obj.get(key) {
            if !value.is_string() && !value.is_null() {
                self.fail(at, "must be a string");
            }
        }
    }

    fn optional_bool(&mut self, obj: &Map<String, Value>, key: &str, at: &str) {
        if let Some(value) = obj.get(key) {
            if !value.is_boolean() {
                self.fail(at, "must be a boolean");
            }
        }
    }

    fn non_empty(&mut self, at: &str, value: &str) {
        if value.is_empty() {
            self.fail(at, "must not be empty");
        }
    }

    fn one_of(&mut self, at: &str, value: &str, allowed: &[&str]) {
        if !allowed.contains(&value) {
            self.fail(
                at,
                format!("'{}' is not one of: {}", value, allowed.join(", ")),
            );
        }
    }
}
