//! Mutation pipeline tests: namespace grammar, create validation,
//! defaults, metadata stamping, event emission, and deletes.

use chrono::{TimeZone, Utc};
use serde_json::{Map, Value, json};

use crate::mutation::*;

fn ctx() -> MutationContext {
    MutationContext {
        namespace: Namespace::parse("Users").unwrap(),
        actor: "users/admin".to_string(),
        timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        skip_validation: false,
    }
}

fn input(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn valid_input() -> Map<String, Value> {
    input(&[
        ("$type", json!("User")),
        ("name", json!("Ada Lovelace")),
        ("age", json!(36)),
    ])
}

// ------------------------------------------------------------------------------------------------
// Namespace grammar
// ------------------------------------------------------------------------------------------------

#[test]
fn namespace_accepts_and_lowercases() {
    assert_eq!(Namespace::parse("Users").unwrap().as_str(), "users");
    assert_eq!(Namespace::parse("my-DB_2").unwrap().as_str(), "my-db_2");
}

#[test]
fn namespace_rejects_empty() {
    assert!(matches!(
        Namespace::parse(""),
        Err(MutationError::InvalidNamespace { .. })
    ));
}

#[test]
fn namespace_rejects_slash() {
    assert!(Namespace::parse("a/b").is_err());
}

#[test]
fn namespace_rejects_reserved_prefixes() {
    assert!(matches!(
        Namespace::parse("_internal"),
        Err(MutationError::ReservedNamespace(_))
    ));
    assert!(matches!(
        Namespace::parse("$system"),
        Err(MutationError::ReservedNamespace(_))
    ));
}

#[test]
fn namespace_rejects_bad_first_char_and_symbols() {
    assert!(Namespace::parse("1users").is_err());
    assert!(Namespace::parse("-users").is_err());
    assert!(Namespace::parse("us ers").is_err());
    assert!(Namespace::parse("us.ers").is_err());
}

// ------------------------------------------------------------------------------------------------
// Create validation
// ------------------------------------------------------------------------------------------------

#[test]
fn create_requires_type() {
    for bad in [
        input(&[("name", json!("x"))]),
        input(&[("$type", json!("")), ("name", json!("x"))]),
        input(&[("$type", json!(42)), ("name", json!("x"))]),
    ] {
        let err = execute_create(&ctx(), &bad, None, &RandomIdGenerator).unwrap_err();
        assert!(
            matches!(err, MutationError::ValidationFailed { ref field, .. } if field == "$type"),
            "unexpected error: {err:?}"
        );
    }
}

#[test]
fn create_requires_name() {
    for bad in [
        input(&[("$type", json!("User"))]),
        input(&[("$type", json!("User")), ("name", json!(""))]),
        input(&[("$type", json!("User")), ("name", json!(null))]),
    ] {
        let err = execute_create(&ctx(), &bad, None, &RandomIdGenerator).unwrap_err();
        assert!(
            matches!(err, MutationError::ValidationFailed { ref field, .. } if field == "name"),
            "unexpected error: {err:?}"
        );
    }
}

#[test]
fn skip_validation_bypasses_shape_checks() {
    let mut ctx = ctx();
    ctx.skip_validation = true;
    let outcome = execute_create(
        &ctx,
        &input(&[("payload", json!("raw"))]),
        None,
        &RandomIdGenerator,
    )
    .unwrap();
    // Metadata is still applied.
    assert_eq!(outcome.entity.version, 1);
    assert_eq!(outcome.entity.created_at, ctx.timestamp);
    assert_eq!(outcome.events.len(), 1);
}

// ------------------------------------------------------------------------------------------------
// Metadata stamping
// ------------------------------------------------------------------------------------------------

#[test]
fn create_stamps_version_timestamps_and_actors() {
    let ctx = ctx();
    let outcome = execute_create(&ctx, &valid_input(), None, &RandomIdGenerator).unwrap();
    let entity = &outcome.entity;

    assert_eq!(entity.version, 1);
    assert_eq!(entity.created_at, ctx.timestamp);
    assert_eq!(entity.updated_at, ctx.timestamp);
    assert_eq!(entity.created_by, "users/admin");
    assert_eq!(entity.updated_by, "users/admin");
    assert_eq!(entity.entity_type, "User");
    assert_eq!(entity.name, "Ada Lovelace");
    assert_eq!(entity.attributes["age"], json!(36));
}

#[test]
fn create_generates_namespaced_id() {
    let outcome = execute_create(&ctx(), &valid_input(), None, &RandomIdGenerator).unwrap();
    assert!(outcome.entity_id.starts_with("users/"));
    assert_eq!(outcome.entity_id, outcome.entity.id);
    let local = outcome.entity_id.strip_prefix("users/").unwrap();
    assert!(!local.is_empty());
}

#[test]
fn caller_supplied_id_generator_is_used() {
    let outcome = execute_create(
        &ctx(),
        &valid_input(),
        None,
        &FixedIdGenerator("ada".to_string()),
    )
    .unwrap();
    assert_eq!(outcome.entity_id, "users/ada");
}

#[test]
fn random_ids_are_unique() {
    let a = RandomIdGenerator.generate();
    let b = RandomIdGenerator.generate();
    assert_ne!(a, b);
}

// ------------------------------------------------------------------------------------------------
// Schema defaults
// ------------------------------------------------------------------------------------------------

fn user_schema() -> CollectionSchema {
    CollectionSchema {
        type_name: "User".to_string(),
        fields: vec![
            FieldSpec {
                name: "role".to_string(),
                field_type: "string".to_string(),
                required: false,
                default: Some(json!("member")),
            },
            FieldSpec {
                name: "age".to_string(),
                field_type: "int".to_string(),
                required: false,
                default: Some(json!(0)),
            },
            FieldSpec {
                name: "bio".to_string(),
                field_type: "string".to_string(),
                required: false,
                default: None,
            },
        ],
    }
}

#[test]
fn defaults_materialize_for_absent_fields_only() {
    let outcome =
        execute_create(&ctx(), &valid_input(), Some(&user_schema()), &RandomIdGenerator).unwrap();
    // Absent → default materialized.
    assert_eq!(outcome.entity.attributes["role"], json!("member"));
    // Present on input → never overwritten.
    assert_eq!(outcome.entity.attributes["age"], json!(36));
    // No default declared → stays absent.
    assert!(!outcome.entity.attributes.contains_key("bio"));
}

#[test]
fn defaults_apply_under_skip_validation() {
    let mut ctx = ctx();
    ctx.skip_validation = true;
    let outcome = execute_create(
        &ctx,
        &input(&[("$type", json!("User"))]),
        Some(&user_schema()),
        &RandomIdGenerator,
    )
    .unwrap();
    assert_eq!(outcome.entity.attributes["role"], json!("member"));
}

// ------------------------------------------------------------------------------------------------
// Events
// ------------------------------------------------------------------------------------------------

#[test]
fn create_emits_exactly_one_event() {
    let ctx = ctx();
    let outcome = execute_create(&ctx, &valid_input(), None, &RandomIdGenerator).unwrap();
    assert_eq!(outcome.events.len(), 1);

    let event = &outcome.events[0];
    assert_eq!(event.op, EventOp::Create);
    assert!(event.before.is_none());
    assert_eq!(event.after.as_ref().unwrap(), &outcome.entity);
    assert_eq!(event.actor, "users/admin");
    assert_eq!(event.timestamp, ctx.timestamp);

    let local = outcome.entity.local_id();
    assert_eq!(event.target, format!("users:{local}"));
}

#[test]
fn event_snapshot_is_independent_of_entity() {
    let outcome = execute_create(&ctx(), &valid_input(), None, &RandomIdGenerator).unwrap();
    let mut entity = outcome.entity;
    entity.name = "mutated after the fact".to_string();
    // The event kept its own snapshot.
    assert_eq!(outcome.events[0].after.as_ref().unwrap().name, "Ada Lovelace");
}

#[test]
fn reserved_keys_never_reach_attributes() {
    let mut raw = valid_input();
    raw.insert("version".to_string(), json!(99));
    raw.insert("createdBy".to_string(), json!("spoofed"));
    let outcome = execute_create(&ctx(), &raw, None, &RandomIdGenerator).unwrap();
    assert_eq!(outcome.entity.version, 1);
    assert_eq!(outcome.entity.created_by, "users/admin");
    assert!(!outcome.entity.attributes.contains_key("version"));
    assert!(!outcome.entity.attributes.contains_key("createdBy"));
}

// ------------------------------------------------------------------------------------------------
// Delete
// ------------------------------------------------------------------------------------------------

#[test]
fn delete_emits_tombstone_event() {
    let ctx = ctx();
    let created = execute_create(&ctx, &valid_input(), None, &RandomIdGenerator).unwrap();
    let outcome = execute_delete(&ctx, &created.entity);

    assert_eq!(outcome.events.len(), 1);
    let event = &outcome.events[0];
    assert_eq!(event.op, EventOp::Delete);
    assert_eq!(event.before.as_ref().unwrap(), &created.entity);
    assert!(event.after.is_none());
    assert_eq!(
        event.target,
        format!("users:{}", created.entity.local_id())
    );
}

// ------------------------------------------------------------------------------------------------
// Document serialization
// ------------------------------------------------------------------------------------------------

#[test]
fn entity_serializes_with_reserved_keys() {
    let outcome = execute_create(
        &ctx(),
        &valid_input(),
        None,
        &FixedIdGenerator("ada".to_string()),
    )
    .unwrap();
    let doc = serde_json::to_value(&outcome.entity).unwrap();
    assert_eq!(doc["$id"], json!("users/ada"));
    assert_eq!(doc["$type"], json!("User"));
    assert_eq!(doc["name"], json!("Ada Lovelace"));
    assert_eq!(doc["version"], json!(1));
    assert_eq!(doc["age"], json!(36));
    assert!(doc["createdAt"].is_string());

    let back: Entity = serde_json::from_value(doc).unwrap();
    assert_eq!(back, outcome.entity);
}
