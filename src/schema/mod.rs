//! # Schema evolution
//!
//! Change detection and severity classification for collection schema
//! deltas, plus the human-readable migration advisory.
//!
//! A change set is scanned by [`detect_breaking_changes`], which tags
//! each dangerous delta with a severity and a concrete migration hint:
//!
//! | Delta | Severity |
//! |-------|----------|
//! | drop collection | critical |
//! | change field type | critical |
//! | remove field | high |
//! | optional → required | high |
//! | add required field | high |
//! | anything else | non-breaking |
//!
//! [`is_safe_to_apply`] is the gate the mutation boundary uses: a
//! change set with any breaking entry is rejected with
//! [`SchemaError::Incompatible`] unless the caller forces it.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Raised when a change set with breaking entries is applied without
/// force.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// The change set contains breaking entries.
    #[error("incompatible schema change set: {0} breaking change(s); see migration hints")]
    Incompatible(usize),
}

// ------------------------------------------------------------------------------------------------
// Change model
// ------------------------------------------------------------------------------------------------

/// One schema delta between the declared and the applied schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchemaChange {
    /// A whole collection disappears.
    DropCollection { collection: String },
    /// A field's declared type changes.
    ChangeType {
        collection: String,
        field: String,
        before: String,
        after: String,
    },
    /// A field disappears.
    RemoveField { collection: String, field: String },
    /// A field's required flag flips.
    ChangeRequired {
        collection: String,
        field: String,
        before: bool,
        after: bool,
    },
    /// A field appears.
    AddField {
        collection: String,
        field: String,
        #[serde(rename = "type")]
        field_type: String,
        required: bool,
    },
    /// A new collection appears.
    AddCollection { collection: String },
}

/// An ordered set of schema deltas.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaChanges {
    /// The deltas, in declaration order.
    pub changes: Vec<SchemaChange>,
}

/// Severity of a breaking change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Low => "low",
            Severity::High => "high",
            Severity::Critical => "critical",
        })
    }
}

/// A severity-tagged breaking delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakingChange {
    /// Delta kind, e.g. `"CHANGE_TYPE"`.
    #[serde(rename = "type")]
    pub change_type: String,
    /// Affected collection.
    pub collection: String,
    /// Affected field, when field-scoped.
    pub field: Option<String>,
    /// State before the delta.
    pub before: Option<Value>,
    /// State after the delta.
    pub after: Option<Value>,
    /// Severity classification.
    pub severity: Severity,
    /// What breaks, in one sentence.
    pub impact: String,
    /// How to migrate around it, when known.
    pub migration_hint: Option<String>,
}

// ------------------------------------------------------------------------------------------------
// Detection
// ------------------------------------------------------------------------------------------------

/// Scans a change set and returns the severity-tagged breaking entries.
///
/// Non-breaking deltas (optional field additions, new collections,
/// required → optional relaxations) produce no entry.
pub fn detect_breaking_changes(changes: &SchemaChanges) -> Vec<BreakingChange> {
    let mut breaking = Vec::new();

    for change in &changes.changes {
        match change {
            SchemaChange::DropCollection { collection } => breaking.push(BreakingChange {
                change_type: "DROP_COLLECTION".to_string(),
                collection: collection.clone(),
                field: None,
                before: None,
                after: None,
                severity: Severity::Critical,
                impact: format!("all documents in `{collection}` become unreachable"),
                migration_hint: Some(
                    "All data in collection lost; back up before applying".to_string(),
                ),
            }),
            SchemaChange::ChangeType {
                collection,
                field,
                before,
                after,
            } => breaking.push(BreakingChange {
                change_type: "CHANGE_TYPE".to_string(),
                collection: collection.clone(),
                field: Some(field.clone()),
                before: Some(json!(before)),
                after: Some(json!(after)),
                severity: Severity::Critical,
                impact: format!(
                    "existing `{collection}.{field}` values are `{before}` and will not parse as `{after}`"
                ),
                migration_hint: Some(format!(
                    "Write a migration script to convert values from {before} to {after}"
                )),
            }),
            SchemaChange::RemoveField { collection, field } => breaking.push(BreakingChange {
                change_type: "REMOVE_FIELD".to_string(),
                collection: collection.clone(),
                field: Some(field.clone()),
                before: None,
                after: None,
                severity: Severity::High,
                impact: format!("`{collection}.{field}` disappears from stored documents"),
                migration_hint: Some("Queries referencing this field will fail".to_string()),
            }),
            SchemaChange::ChangeRequired {
                collection,
                field,
                before: false,
                after: true,
            } => breaking.push(BreakingChange {
                change_type: "CHANGE_REQUIRED".to_string(),
                collection: collection.clone(),
                field: Some(field.clone()),
                before: Some(json!(false)),
                after: Some(json!(true)),
                severity: Severity::High,
                impact: format!(
                    "existing `{collection}` rows without `{field}` fail validation"
                ),
                migration_hint: Some(
                    "Use updateMany to backfill the field before making required".to_string(),
                ),
            }),
            SchemaChange::AddField {
                collection,
                field,
                required: true,
                ..
            } => breaking.push(BreakingChange {
                change_type: "ADD_FIELD".to_string(),
                collection: collection.clone(),
                field: Some(field.clone()),
                before: None,
                after: None,
                severity: Severity::High,
                impact: format!(
                    "existing `{collection}` rows lack the new required `{field}`"
                ),
                migration_hint: Some(
                    "Back-fill the new required field on existing rows".to_string(),
                ),
            }),
            // Relaxations, optional additions, and new collections are
            // non-breaking.
            SchemaChange::ChangeRequired { .. }
            | SchemaChange::AddField { .. }
            | SchemaChange::AddCollection { .. } => {}
        }
    }

    breaking
}

/// A change set is safe exactly when it has no breaking entries.
pub fn is_safe_to_apply(changes: &SchemaChanges) -> bool {
    detect_breaking_changes(changes).is_empty()
}

/// Gate used at the apply boundary.
pub fn ensure_safe(changes: &SchemaChanges) -> Result<(), SchemaError> {
    let breaking = detect_breaking_changes(changes);
    if breaking.is_empty() {
        Ok(())
    } else {
        Err(SchemaError::Incompatible(breaking.len()))
    }
}

// ------------------------------------------------------------------------------------------------
// Advisory rendering
// ------------------------------------------------------------------------------------------------

/// Composes the human-readable migration advisory for a change set.
///
/// Always notes the type-regeneration command, lists non-breaking
/// changes, and — when breaking entries exist — prints a `BREAKING
/// CHANGES` section with the recommended workflow and per-entry hints.
pub fn generate_migration_hints(changes: &SchemaChanges) -> String {
    let breaking = detect_breaking_changes(changes);
    let mut out = String::new();

    out.push_str("Schema change advisory\n");
    out.push_str("======================\n\n");
    out.push_str("After applying, regenerate client types: run `tesseradb types generate`.\n\n");

    let non_breaking: Vec<String> = changes
        .changes
        .iter()
        .filter_map(describe_non_breaking)
        .collect();
    if !non_breaking.is_empty() {
        out.push_str("Non-breaking changes:\n");
        for line in &non_breaking {
            out.push_str("  - ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
    }

    if !breaking.is_empty() {
        out.push_str("BREAKING CHANGES\n");
        out.push_str("----------------\n");
        out.push_str("Recommended workflow: back up affected collections, apply the\n");
        out.push_str("migrations below in order, then re-run schema validation.\n\n");
        for entry in &breaking {
            let scope = match &entry.field {
                Some(field) => format!("{}.{}", entry.collection, field),
                None => entry.collection.clone(),
            };
            out.push_str(&format!(
                "  [{}] {} on {}: {}\n",
                entry.severity, entry.change_type, scope, entry.impact
            ));
            if let Some(hint) = &entry.migration_hint {
                out.push_str(&format!("      → {hint}\n"));
            }
        }
    }

    out
}

fn describe_non_breaking(change: &SchemaChange) -> Option<String> {
    match change {
        SchemaChange::AddField {
            collection,
            field,
            field_type,
            required: false,
        } => Some(format!(
            "add optional field `{collection}.{field}` ({field_type})"
        )),
        SchemaChange::AddCollection { collection } => {
            Some(format!("add collection `{collection}`"))
        }
        SchemaChange::ChangeRequired {
            collection,
            field,
            before: true,
            after: false,
        } => Some(format!(
            "relax `{collection}.{field}` from required to optional"
        )),
        _ => None,
    }
}

// ------------------------------------------------------------------------------------------------
// Tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn change_type_age() -> SchemaChanges {
        SchemaChanges {
            changes: vec![SchemaChange::ChangeType {
                collection: "User".to_string(),
                field: "age".to_string(),
                before: "string".to_string(),
                after: "int".to_string(),
            }],
        }
    }

    // --------------------------------------------------------------------------------------------
    // Severity classification
    // --------------------------------------------------------------------------------------------

    #[test]
    fn change_type_is_critical() {
        let breaking = detect_breaking_changes(&change_type_age());
        assert_eq!(breaking.len(), 1);
        let entry = &breaking[0];
        assert_eq!(entry.change_type, "CHANGE_TYPE");
        assert_eq!(entry.severity, Severity::Critical);
        assert_eq!(entry.collection, "User");
        assert_eq!(entry.field.as_deref(), Some("age"));
        assert_eq!(entry.before, Some(serde_json::json!("string")));
        assert_eq!(entry.after, Some(serde_json::json!("int")));
        assert!(entry.migration_hint.as_ref().unwrap().contains("migration script"));
    }

    #[test]
    fn drop_collection_is_critical() {
        let changes = SchemaChanges {
            changes: vec![SchemaChange::DropCollection {
                collection: "Orders".to_string(),
            }],
        };
        let breaking = detect_breaking_changes(&changes);
        assert_eq!(breaking[0].severity, Severity::Critical);
        assert!(breaking[0].migration_hint.as_ref().unwrap().contains("back up"));
    }

    #[test]
    fn remove_field_is_high() {
        let changes = SchemaChanges {
            changes: vec![SchemaChange::RemoveField {
                collection: "User".to_string(),
                field: "nickname".to_string(),
            }],
        };
        let breaking = detect_breaking_changes(&changes);
        assert_eq!(breaking[0].severity, Severity::High);
    }

    #[test]
    fn making_required_is_high_but_relaxing_is_not() {
        let tighten = SchemaChanges {
            changes: vec![SchemaChange::ChangeRequired {
                collection: "User".to_string(),
                field: "email".to_string(),
                before: false,
                after: true,
            }],
        };
        assert_eq!(detect_breaking_changes(&tighten).len(), 1);
        assert_eq!(detect_breaking_changes(&tighten)[0].severity, Severity::High);

        let relax = SchemaChanges {
            changes: vec![SchemaChange::ChangeRequired {
                collection: "User".to_string(),
                field: "email".to_string(),
                before: true,
                after: false,
            }],
        };
        assert!(detect_breaking_changes(&relax).is_empty());
    }

    #[test]
    fn required_add_is_breaking_optional_is_not() {
        let required = SchemaChanges {
            changes: vec![SchemaChange::AddField {
                collection: "User".to_string(),
                field: "tenant".to_string(),
                field_type: "string".to_string(),
                required: true,
            }],
        };
        assert_eq!(detect_breaking_changes(&required).len(), 1);

        let optional = SchemaChanges {
            changes: vec![SchemaChange::AddField {
                collection: "User".to_string(),
                field: "nickname".to_string(),
                field_type: "string".to_string(),
                required: false,
            }],
        };
        assert!(detect_breaking_changes(&optional).is_empty());
    }

    // --------------------------------------------------------------------------------------------
    // Gate
    // --------------------------------------------------------------------------------------------

    #[test]
    fn safety_gate_matches_breaking_detection() {
        assert!(!is_safe_to_apply(&change_type_age()));
        assert!(matches!(
            ensure_safe(&change_type_age()),
            Err(SchemaError::Incompatible(1))
        ));

        let safe = SchemaChanges {
            changes: vec![SchemaChange::AddCollection {
                collection: "Logs".to_string(),
            }],
        };
        assert!(is_safe_to_apply(&safe));
        ensure_safe(&safe).unwrap();
    }

    #[test]
    fn empty_change_set_is_safe() {
        assert!(is_safe_to_apply(&SchemaChanges::default()));
    }

    // --------------------------------------------------------------------------------------------
    // Advisory
    // --------------------------------------------------------------------------------------------

    #[test]
    fn advisory_always_mentions_type_regeneration() {
        let text = generate_migration_hints(&SchemaChanges::default());
        assert!(text.contains("types generate"));
    }

    #[test]
    fn advisory_lists_non_breaking_changes() {
        let changes = SchemaChanges {
            changes: vec![
                SchemaChange::AddField {
                    collection: "User".to_string(),
                    field: "nickname".to_string(),
                    field_type: "string".to_string(),
                    required: false,
                },
                SchemaChange::AddCollection {
                    collection: "Logs".to_string(),
                },
            ],
        };
        let text = generate_migration_hints(&changes);
        assert!(text.contains("Non-breaking changes:"));
        assert!(text.contains("nickname"));
        assert!(text.contains("Logs"));
        assert!(!text.contains("BREAKING CHANGES"));
    }

    #[test]
    fn advisory_prints_breaking_section_with_hints() {
        let text = generate_migration_hints(&change_type_age());
        assert!(text.contains("BREAKING CHANGES"));
        assert!(text.contains("Recommended workflow"));
        assert!(text.contains("[critical] CHANGE_TYPE on User.age"));
        assert!(text.contains("Write a migration script to convert values from string to int"));
    }

    #[test]
    fn mixed_change_set_renders_both_sections() {
        let changes = SchemaChanges {
            changes: vec![
                SchemaChange::AddField {
                    collection: "User".to_string(),
                    field: "nickname".to_string(),
                    field_type: "string".to_string(),
                    required: false,
                },
                SchemaChange::RemoveField {
                    collection: "User".to_string(),
                    field: "age".to_string(),
                },
            ],
        };
        let text = generate_migration_hints(&changes);
        assert!(text.contains("Non-breaking changes:"));
        assert!(text.contains("BREAKING CHANGES"));
        assert!(text.contains("Queries referencing this field will fail"));
    }
}
