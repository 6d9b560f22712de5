//! # Boundary validators
//!
//! Fail-fast input validation consumed by the transport layer and the
//! index-catalog loader. Everything here rejects at the boundary with a
//! typed, parameter-carrying error; nothing deeper in the engine needs
//! to re-check these invariants.
//!
//! Three tiers of strictness for request-supplied strings:
//!
//! - [`validate_url_parameter`] — generic parameter hygiene: no control
//!   characters, no NUL, no path traversal in any spelling (raw,
//!   URL-encoded, double-URL-encoded, `....//`, `..;/`).
//! - [`validate_database_id`] — identifiers only: `[A-Za-z0-9_-]+`.
//! - [`validate_file_path`] — relative storage paths: no absolute
//!   prefixes, no `..` segments, dots inside file-name components are
//!   fine (`data/file.backup.parquet`).
//!
//! [`as_index_catalog`] validates the persisted index catalog document
//! shape before any index metadata is trusted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Validation failures raised at the engine boundary.
#[derive(Debug, Error)]
pub enum ValidateError {
    /// A request parameter failed hygiene checks.
    #[error("invalid URL parameter `{parameter}`: {reason} (value: {value:?})")]
    InvalidUrlParameter {
        /// Name of the offending parameter.
        parameter: String,
        /// The rejected value, verbatim.
        value: String,
        /// Human-readable rejection reason.
        reason: String,
    },

    /// The index catalog document failed shape validation.
    #[error("invalid index catalog at `{path}`: {reason}")]
    InvalidCatalog {
        /// JSON path of the offending node.
        path: String,
        /// What was wrong with it.
        reason: String,
    },
}

// ------------------------------------------------------------------------------------------------
// URL parameter hygiene
// ------------------------------------------------------------------------------------------------

/// Validates a URL-supplied parameter value.
///
/// Rejects empty/whitespace-only values, NUL and CR/LF bytes (raw or
/// percent-encoded), and every spelling of `..` path traversal,
/// including single- and double-URL-encoded forms.
pub fn validate_url_parameter(value: &str, parameter: &str) -> Result<(), ValidateError> {
    let reject = |reason: &str| {
        Err(ValidateError::InvalidUrlParameter {
            parameter: parameter.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        })
    };

    if value.trim().is_empty() {
        return reject("must not be empty");
    }
    if value.contains('\0') {
        return reject("must not contain NUL bytes");
    }
    if value.contains('\n') || value.contains('\r') {
        return reject("must not contain line breaks");
    }

    let lower = value.to_ascii_lowercase();
    if lower.contains("%00") {
        return reject("must not contain encoded NUL bytes");
    }
    if lower.contains("%0a") || lower.contains("%0d") {
        return reject("must not contain encoded line breaks");
    }
    // `..` covers `../`, `..\`, `....//`, and `..;/`.
    if value.contains("..") {
        return reject("must not contain path traversal sequences");
    }
    if lower.contains("%2e%2e") || lower.contains("%252e%252e") {
        return reject("must not contain encoded path traversal sequences");
    }

    Ok(())
}

/// Validates a database identifier: `[A-Za-z0-9_-]+`, nothing else.
pub fn validate_database_id(id: &str) -> Result<(), ValidateError> {
    validate_url_parameter(id, "databaseId")?;
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ValidateError::InvalidUrlParameter {
            parameter: "databaseId".to_string(),
            value: id.to_string(),
            reason: "must match [A-Za-z0-9_-]+".to_string(),
        });
    }
    Ok(())
}

/// Validates a relative storage file path.
///
/// Forbids absolute paths (leading `/` or `\`) and any `..` segment;
/// dots inside file-name components are allowed.
pub fn validate_file_path(path: &str) -> Result<(), ValidateError> {
    let reject = |reason: &str| {
        Err(ValidateError::InvalidUrlParameter {
            parameter: "path".to_string(),
            value: path.to_string(),
            reason: reason.to_string(),
        })
    };

    if path.trim().is_empty() {
        return reject("must not be empty");
    }
    if path.contains('\0') {
        return reject("must not contain NUL bytes");
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return reject("must be relative");
    }
    if path.split(['/', '\\']).any(|segment| segment == "..") {
        return reject("must not contain `..` segments");
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Index catalog
// ------------------------------------------------------------------------------------------------

/// One index definition inside the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexDefinition {
    /// Index name, unique per namespace.
    pub name: String,
    /// Index kind, e.g. `"fts"`, `"geo"`, `"bloom"`.
    #[serde(rename = "type")]
    pub index_type: String,
    /// Indexed field paths.
    pub fields: Vec<serde_json::Value>,
}

/// A catalog entry: the definition plus free-form metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexCatalogEntry {
    /// The index definition.
    pub definition: IndexDefinition,
    /// Build metadata (row counts, timestamps, …).
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// The validated catalog document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexCatalog {
    /// Catalog format version.
    pub version: f64,
    /// Indexes grouped by namespace.
    pub indexes: BTreeMap<String, Vec<IndexCatalogEntry>>,
}

/// Validates an untrusted JSON document as an index catalog.
///
/// The checks are structural and reported with the JSON path of the
/// first offending node: `version` must be a number, `indexes` must be
/// a plain record (an array is refused), each namespace entry must be
/// an array of `{definition, metadata}` objects, each `definition` must
/// carry a string `name`, a string `type`, and an array `fields`, and
/// `metadata` must be an object.
pub fn as_index_catalog(value: &serde_json::Value) -> Result<IndexCatalog, ValidateError> {
    use serde_json::Value;

    let invalid = |path: &str, reason: &str| ValidateError::InvalidCatalog {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    let Value::Object(root) = value else {
        return Err(invalid("$", "catalog must be an object"));
    };

    let version = match root.get("version") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(f64::NAN),
        Some(_) => return Err(invalid("$.version", "must be a number")),
        None => return Err(invalid("$.version", "is required")),
    };

    let indexes_value = root
        .get("indexes")
        .ok_or_else(|| invalid("$.indexes", "is required"))?;
    if indexes_value.is_array() {
        return Err(invalid("$.indexes", "must be a record, not an array"));
    }
    let Value::Object(namespaces) = indexes_value else {
        return Err(invalid("$.indexes", "must be a record"));
    };

    let mut indexes = BTreeMap::new();
    for (namespace, entries_value) in namespaces {
        let ns_path = format!("$.indexes.{namespace}");
        let Value::Array(raw_entries) = entries_value else {
            return Err(invalid(&ns_path, "must be an array of catalog entries"));
        };

        let mut entries = Vec::with_capacity(raw_entries.len());
        for (i, raw) in raw_entries.iter().enumerate() {
            let entry_path = format!("{ns_path}[{i}]");
            let Value::Object(entry) = raw else {
                return Err(invalid(&entry_path, "must be an object"));
            };

            let definition_value = entry
                .get("definition")
                .ok_or_else(|| invalid(&entry_path, "missing `definition`"))?;
            let Value::Object(definition) = definition_value else {
                return Err(invalid(
                    &format!("{entry_path}.definition"),
                    "must be an object",
                ));
            };

            let name = match definition.get("name") {
                Some(Value::String(s)) => s.clone(),
                _ => {
                    return Err(invalid(
                        &format!("{entry_path}.definition.name"),
                        "must be a string",
                    ));
                }
            };
            let index_type = match definition.get("type") {
                Some(Value::String(s)) => s.clone(),
                _ => {
                    return Err(invalid(
                        &format!("{entry_path}.definition.type"),
                        "must be a string",
                    ));
                }
            };
            let fields = match definition.get("fields") {
                Some(Value::Array(fields)) => fields.clone(),
                _ => {
                    return Err(invalid(
                        &format!("{entry_path}.definition.fields"),
                        "must be an array",
                    ));
                }
            };

            let metadata = match entry.get("metadata") {
                Some(Value::Object(map)) => map.clone(),
                Some(_) => {
                    return Err(invalid(
                        &format!("{entry_path}.metadata"),
                        "must be an object",
                    ));
                }
                None => return Err(invalid(&entry_path, "missing `metadata`")),
            };

            entries.push(IndexCatalogEntry {
                definition: IndexDefinition {
                    name,
                    index_type,
                    fields,
                },
                metadata,
            });
        }
        indexes.insert(namespace.clone(), entries);
    }

    Ok(IndexCatalog { version, indexes })
}

// ------------------------------------------------------------------------------------------------
// Tests
// ------------------------------------------------------------------------------------------------
