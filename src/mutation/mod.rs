//! # Mutation pipeline
//!
//! The deterministic per-document create/delete path: validate the
//! input shape, materialize schema defaults, stamp audit metadata, and
//! emit exactly one change event per mutation.
//!
//! ## Design Overview
//!
//! A mutation runs against a [`MutationContext`] carrying the target
//! namespace, the acting entity reference, and the logical timestamp.
//! [`execute_create`] is pure with respect to its inputs: the same
//! context, input, schema, and id generator always produce the same
//! entity and event, which keeps the write path replayable.
//!
//! Events snapshot their `before`/`after` payloads by value — no
//! structure is shared across the event boundary, so hooks can hold an
//! event arbitrarily long without observing later mutations.
//!
//! Namespace and shape validation fail fast here; everything after the
//! validation block is infallible by construction.

#[cfg(test)]
mod tests;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

/// Reserved document keys that never land in user attributes.
const RESERVED_KEYS: &[&str] = &[
    "$id",
    "$type",
    "name",
    "version",
    "createdAt",
    "updatedAt",
    "createdBy",
    "updatedBy",
];

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors raised by namespace parsing and mutation validation.
#[derive(Debug, Error)]
pub enum MutationError {
    /// Input failed shape validation; carries the offending field path.
    #[error("validation failed for `{field}`: {reason}")]
    ValidationFailed {
        /// Path of the offending field.
        field: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Namespace string violated the namespace grammar.
    #[error("invalid namespace {namespace:?}: {reason}")]
    InvalidNamespace {
        /// The rejected namespace, verbatim.
        namespace: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Namespace used a reserved prefix.
    #[error("namespace {0:?} uses a reserved prefix")]
    ReservedNamespace(String),
}

// ------------------------------------------------------------------------------------------------
// Namespace
// ------------------------------------------------------------------------------------------------

/// A validated, lowercase namespace: `[a-z][a-z0-9_-]*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace(String);

impl Namespace {
    /// Parses and normalizes a namespace string.
    ///
    /// Non-empty, no `/`, first character alphabetic, remainder
    /// `[A-Za-z0-9_-]`; `_` and `$` prefixes are reserved. The accepted
    /// value is lowercased.
    pub fn parse(raw: &str) -> Result<Self, MutationError> {
        let invalid = |reason: &str| MutationError::InvalidNamespace {
            namespace: raw.to_string(),
            reason: reason.to_string(),
        };

        if raw.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if raw.contains('/') {
            return Err(invalid("must not contain `/`"));
        }
        if raw.starts_with('_') || raw.starts_with('$') {
            return Err(MutationError::ReservedNamespace(raw.to_string()));
        }
        let mut chars = raw.chars();
        if !chars.next().is_some_and(|c| c.is_ascii_alphabetic()) {
            return Err(invalid("must start with a letter"));
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(invalid("must match [A-Za-z][A-Za-z0-9_-]*"));
        }

        Ok(Self(raw.to_ascii_lowercase()))
    }

    /// The normalized namespace string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ------------------------------------------------------------------------------------------------
// Entity
// ------------------------------------------------------------------------------------------------

/// A stored document with reserved attributes plus free-form user
/// attributes. Immutable-by-version: every update produces a new
/// version referencing the prior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Globally unique `<namespace>/<id>` identifier. The namespace
    /// prefix is immutable for the entity's lifetime.
    #[serde(rename = "$id")]
    pub id: String,

    /// Typename the entity was created as.
    #[serde(rename = "$type")]
    pub entity_type: String,

    /// Human-readable label. Always required.
    pub name: String,

    /// Monotonically incrementing version, starting at 1.
    pub version: u64,

    /// Creation instant (the mutation context's timestamp).
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,

    /// Last-update instant. Equals `created_at` on version 1.
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,

    /// Actor entity reference that created this entity.
    #[serde(rename = "createdBy")]
    pub created_by: String,

    /// Actor entity reference of the last update.
    #[serde(rename = "updatedBy")]
    pub updated_by: String,

    /// Free-form user attributes.
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Entity {
    /// Local id — the part of `$id` after the namespace prefix.
    pub fn local_id(&self) -> &str {
        self.id.split_once('/').map_or(self.id.as_str(), |(_, id)| id)
    }
}

// ------------------------------------------------------------------------------------------------
// Events
// ------------------------------------------------------------------------------------------------

/// Mutation kind of a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventOp {
    Create,
    Update,
    Delete,
}

/// Observable record of one mutation.
///
/// `before`/`after` are value snapshots — cloned defensively, never
/// shared with live engine state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Mutation kind.
    pub op: EventOp,
    /// `<namespace>:<id>` of the affected entity.
    pub target: String,
    /// State before the mutation (`None` for creates).
    pub before: Option<Entity>,
    /// State after the mutation (`None` for deletes).
    pub after: Option<Entity>,
    /// Acting entity reference.
    pub actor: String,
    /// Logical mutation instant.
    pub timestamp: DateTime<Utc>,
}

// ------------------------------------------------------------------------------------------------
// Schema defaults
// ------------------------------------------------------------------------------------------------

/// Declared field of a collection schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name.
    pub name: String,
    /// Declared type label (`"string"`, `"int"`, …).
    #[serde(rename = "type")]
    pub field_type: String,
    /// Whether the field must be present.
    #[serde(default)]
    pub required: bool,
    /// Default materialized when the field is absent on input.
    #[serde(default)]
    pub default: Option<Value>,
}

/// Schema of one collection (`$type`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    /// The `$type` this schema governs.
    pub type_name: String,
    /// Declared fields.
    pub fields: Vec<FieldSpec>,
}

// ------------------------------------------------------------------------------------------------
// Id generation
// ------------------------------------------------------------------------------------------------

/// Pluggable document id strategy.
pub trait IdGenerator: Send + Sync {
    /// Produces a new local id (the part after `<namespace>/`).
    fn generate(&self) -> String;
}

/// Default strategy: random 128-bit identifier, hex, no dashes.
#[derive(Debug, Default)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn generate(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

/// Fixed-id strategy for callers that bring their own identifiers.
#[derive(Debug)]
pub struct FixedIdGenerator(pub String);

impl IdGenerator for FixedIdGenerator {
    fn generate(&self) -> String {
        self.0.clone()
    }
}

// ------------------------------------------------------------------------------------------------
// Mutation context and outcome
// ------------------------------------------------------------------------------------------------

/// Everything a mutation needs from its caller.
#[derive(Debug, Clone)]
pub struct MutationContext {
    /// Target namespace (already validated).
    pub namespace: Namespace,
    /// Acting entity reference, e.g. `"users/admin"`.
    pub actor: String,
    /// Logical timestamp stamped onto the entity and event.
    pub timestamp: DateTime<Utc>,
    /// When set, the input-shape check is bypassed. Defaults and
    /// metadata are still applied.
    pub skip_validation: bool,
}

/// Result of a create mutation.
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    /// The materialized entity, version 1.
    pub entity: Entity,
    /// The entity's `$id`.
    pub entity_id: String,
    /// Exactly one `CREATE` event.
    pub events: Vec<ChangeEvent>,
}

/// Result of a delete mutation.
#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    /// Exactly one `DELETE` event carrying the tombstoned state.
    pub events: Vec<ChangeEvent>,
}

// ------------------------------------------------------------------------------------------------
// execute_create
// ------------------------------------------------------------------------------------------------

/// Creates a new entity from a validated document input.
///
/// Steps, in order:
///
/// 1. Shape validation — `$type` and `name` must be non-empty strings
///    (skipped under [`MutationContext::skip_validation`]).
/// 2. Schema defaults — declared defaults materialize for absent
///    fields; present input values are never overwritten.
/// 3. Identity — `$id = <namespace>/<id>` from the supplied generator.
/// 4. Metadata — `version = 1`, both instants set to `ctx.timestamp`,
///    both actor fields set to `ctx.actor`.
/// 5. Event — one `CREATE` with `before = None`, a snapshot `after`,
///    and `target = "<namespace>:<id>"`.
pub fn execute_create(
    ctx: &MutationContext,
    input: &Map<String, Value>,
    schema: Option<&CollectionSchema>,
    id_generator: &dyn IdGenerator,
) -> Result<CreateOutcome, MutationError> {
    if !ctx.skip_validation {
        require_non_empty_string(input, "$type")?;
        // `name` is enforced regardless of the id strategy in use.
        require_non_empty_string(input, "name")?;
    }

    let entity_type = string_field(input, "$type");
    let name = string_field(input, "name");

    // User attributes: everything that is not a reserved key.
    let mut attributes: Map<String, Value> = input
        .iter()
        .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    // Materialize declared defaults for absent fields only.
    if let Some(schema) = schema {
        for field in &schema.fields {
            if let Some(default) = &field.default
                && !attributes.contains_key(&field.name)
            {
                attributes.insert(field.name.clone(), default.clone());
            }
        }
    }

    let local_id = id_generator.generate();
    let entity_id = format!("{}/{}", ctx.namespace.as_str(), local_id);

    let entity = Entity {
        id: entity_id.clone(),
        entity_type,
        name,
        version: 1,
        created_at: ctx.timestamp,
        updated_at: ctx.timestamp,
        created_by: ctx.actor.clone(),
        updated_by: ctx.actor.clone(),
        attributes,
    };

    let event = ChangeEvent {
        op: EventOp::Create,
        target: format!("{}:{}", ctx.namespace.as_str(), local_id),
        before: None,
        after: Some(entity.clone()),
        actor: ctx.actor.clone(),
        timestamp: ctx.timestamp,
    };

    debug!(entity_id = %entity_id, entity_type = %entity.entity_type, "entity created");

    Ok(CreateOutcome {
        entity_id,
        entity,
        events: vec![event],
    })
}

/// Deletes an existing entity, emitting the tombstone event.
///
/// The entity payload itself is removed by the caller through the
/// storage backend; this pipeline stage only produces the event with a
/// defensive `before` snapshot.
pub fn execute_delete(ctx: &MutationContext, existing: &Entity) -> DeleteOutcome {
    let event = ChangeEvent {
        op: EventOp::Delete,
        target: format!("{}:{}", ctx.namespace.as_str(), existing.local_id()),
        before: Some(existing.clone()),
        after: None,
        actor: ctx.actor.clone(),
        timestamp: ctx.timestamp,
    };
    debug!(entity_id = %existing.id, "entity deleted");
    DeleteOutcome {
        events: vec![event],
    }
}

fn string_field(input: &Map<String, Value>, key: &str) -> String {
    input
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn require_non_empty_string(input: &Map<String, Value>, key: &str) -> Result<(), MutationError> {
    match input.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(()),
        Some(Value::String(_)) => Err(MutationError::ValidationFailed {
            field: key.to_string(),
            reason: "must not be empty".to_string(),
        }),
        Some(_) => Err(MutationError::ValidationFailed {
            field: key.to_string(),
            reason: "must be a string".to_string(),
        }),
        None => Err(MutationError::ValidationFailed {
            field: key.to_string(),
            reason: "is required".to_string(),
        }),
    }
}
