//! Facade tests: open/validate, the create → persist → index → event
//! path, deletes, snapshots, the compaction lane, and the default
//! handle cell.

use std::sync::{Arc, Mutex};

use serde_json::{Map, Value, json};

use crate::db::*;
use crate::geo::GeoSearchOptions;
use crate::mutation::{CollectionSchema, EventOp, FieldSpec, FixedIdGenerator};

fn open_memory() -> Database {
    Database::open(DbConfig::default()).unwrap()
}

fn doc(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn place(name: &str, lat: f64, lng: f64) -> Map<String, Value> {
    doc(&[
        ("$type", json!("Place")),
        ("name", json!(name)),
        ("lat", json!(lat)),
        ("lng", json!(lng)),
    ])
}

// ------------------------------------------------------------------------------------------------
// Open and configuration
// ------------------------------------------------------------------------------------------------

#[test]
fn open_validates_config() {
    let bad = DbConfig {
        geo_bucket_precision: Some(0),
        ..DbConfig::default()
    };
    assert!(matches!(Database::open(bad), Err(DbError::Config(_))));

    let bad = DbConfig {
        fts: crate::fts::FtsConfig {
            min_token_len: 0,
            ..Default::default()
        },
        ..DbConfig::default()
    };
    assert!(matches!(Database::open(bad), Err(DbError::Config(_))));
}

#[test]
fn open_with_directory_storage() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = Database::open(DbConfig {
        storage: StorageConfig::Directory(dir.path().to_path_buf()),
        ..DbConfig::default()
    })
    .unwrap();
    let ns = db.namespace("users").unwrap();
    ns.create("users/admin", doc(&[("$type", json!("User")), ("name", json!("Ada"))]))
        .unwrap();
    assert!(dir.path().join("users/entities").is_dir());
}

#[test]
fn namespace_name_is_normalized() {
    let db = open_memory();
    let ns = db.namespace("Users").unwrap();
    assert_eq!(ns.name(), "users");
    assert!(db.namespace("_internal").is_err());
}

// ------------------------------------------------------------------------------------------------
// Create path
// ------------------------------------------------------------------------------------------------

#[test]
fn create_persists_and_indexes() {
    let db = open_memory();
    let ns = db.namespace("docs").unwrap();
    let outcome = ns
        .create(
            "users/admin",
            doc(&[
                ("$type", json!("Article")),
                ("name", json!("Columnar storage engines")),
                ("body", json!("segments and bloom filters")),
            ]),
        )
        .unwrap();

    // Payload landed in storage.
    let fetched = ns.get(outcome.entity.local_id()).unwrap().unwrap();
    assert_eq!(fetched, outcome.entity);

    // Text became searchable (name and string attributes).
    assert_eq!(ns.search("columnar").len(), 1);
    assert_eq!(ns.search("bloom").len(), 1);
}

#[test]
fn create_validation_failures_leave_no_trace() {
    let db = open_memory();
    let ns = db.namespace("docs").unwrap();
    let seen = Arc::new(Mutex::new(0usize));
    let seen_hook = Arc::clone(&seen);
    db.on_event(Box::new(move |_| *seen_hook.lock().unwrap() += 1));

    let err = ns
        .create("users/admin", doc(&[("name", json!("no type"))]))
        .unwrap_err();
    assert!(matches!(err, DbError::Mutation(_)));
    assert!(ns.search("no").is_empty());
    assert_eq!(*seen.lock().unwrap(), 0);
}

#[test]
fn schema_defaults_apply_through_facade() {
    let db = open_memory();
    let ns = db.namespace("users").unwrap();
    ns.declare_schema(CollectionSchema {
        type_name: "User".to_string(),
        fields: vec![FieldSpec {
            name: "role".to_string(),
            field_type: "string".to_string(),
            required: false,
            default: Some(json!("member")),
        }],
    });

    let outcome = ns
        .create("users/admin", doc(&[("$type", json!("User")), ("name", json!("Ada"))]))
        .unwrap();
    assert_eq!(outcome.entity.attributes["role"], json!("member"));
}

#[test]
fn events_reach_hooks_in_order() {
    let db = open_memory();
    let ns = db.namespace("docs").unwrap();
    let log: Arc<Mutex<Vec<(EventOp, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let log_hook = Arc::clone(&log);
    db.on_event(Box::new(move |event| {
        log_hook.lock().unwrap().push((event.op, event.target.clone()));
    }));

    let a = ns
        .create_with(
            "users/admin",
            doc(&[("$type", json!("Doc")), ("name", json!("first"))]),
            &FixedIdGenerator("a".to_string()),
            false,
        )
        .unwrap();
    ns.create_with(
        "users/admin",
        doc(&[("$type", json!("Doc")), ("name", json!("second"))]),
        &FixedIdGenerator("b".to_string()),
        false,
    )
    .unwrap();
    ns.delete("users/admin", a.entity.local_id()).unwrap();

    let log = log.lock().unwrap();
    assert_eq!(
        *log,
        vec![
            (EventOp::Create, "docs:a".to_string()),
            (EventOp::Create, "docs:b".to_string()),
            (EventOp::Delete, "docs:a".to_string()),
        ]
    );
}

// ------------------------------------------------------------------------------------------------
// Delete path
// ------------------------------------------------------------------------------------------------

#[test]
fn delete_removes_payload_and_index_entries() {
    let db = open_memory();
    let ns = db.namespace("places").unwrap();
    let outcome = ns
        .create_with(
            "users/admin",
            place("Ferry Building", 37.7955, -122.3937),
            &FixedIdGenerator("ferry".to_string()),
            false,
        )
        .unwrap();
    assert_eq!(outcome.entity_id, "places/ferry");

    assert!(ns.delete("users/admin", "ferry").unwrap());
    assert!(ns.get("ferry").unwrap().is_none());
    assert!(ns.search("ferry").is_empty());
    let geo = ns.geo_search(37.7955, -122.3937, &GeoSearchOptions::default());
    assert!(geo.doc_ids.is_empty());
    // Second delete is a no-op.
    assert!(!ns.delete("users/admin", "ferry").unwrap());
}

// ------------------------------------------------------------------------------------------------
// Geo through the facade
// ------------------------------------------------------------------------------------------------

#[test]
fn lat_lng_attributes_feed_geo_index() {
    let db = open_memory();
    let ns = db.namespace("places").unwrap();
    for (id, name, lat, lng) in [
        ("sfd", "SF Downtown", 37.7749, -122.4194),
        ("sfm", "SF Mission", 37.7599, -122.4148),
        ("oak", "Oakland", 37.8044, -122.2712),
        ("la", "Los Angeles", 34.0522, -118.2437),
    ] {
        ns.create_with(
            "users/admin",
            place(name, lat, lng),
            &FixedIdGenerator(id.to_string()),
            false,
        )
        .unwrap();
    }

    let result = ns.geo_search(
        37.7749,
        -122.4194,
        &GeoSearchOptions {
            max_distance: Some(5_000.0),
            ..Default::default()
        },
    );
    assert_eq!(result.doc_ids, vec!["places/sfd", "places/sfm"]);
    assert_eq!(result.distances[0], 0.0);
}

// ------------------------------------------------------------------------------------------------
// Index persistence through the facade
// ------------------------------------------------------------------------------------------------

#[test]
fn persist_and_reload_indexes() {
    let db = open_memory();
    let ns = db.namespace("places").unwrap();
    ns.create_with(
        "users/admin",
        place("Ferry Building", 37.7955, -122.3937),
        &FixedIdGenerator("ferry".to_string()),
        false,
    )
    .unwrap();
    ns.persist_indexes().unwrap();

    // Wipe in-memory state by reloading from snapshots.
    ns.reload_indexes().unwrap();
    assert_eq!(ns.search("ferry").len(), 1);
    assert_eq!(ns.geo_snapshot().len(), 1);
}

// ------------------------------------------------------------------------------------------------
// Compaction lane through the facade
// ------------------------------------------------------------------------------------------------

#[test]
fn creates_register_writer_activity() {
    let db = open_memory();
    let ns = db.namespace("docs").unwrap();
    ns.create("users/admin", doc(&[("$type", json!("Doc")), ("name", json!("x"))]))
        .unwrap();

    let now_ms = chrono::Utc::now().timestamp_millis();
    let metrics = ns.compaction_metrics(now_ms);
    assert_eq!(metrics.windows_pending, 1);
    assert_eq!(metrics.files_pending, 1);
    assert!(metrics.bytes_pending > 0);
    assert_eq!(metrics.known_writers, 1);
}

#[test]
fn dispatch_flows_through_poll() {
    let db = Database::open(DbConfig {
        scheduler: crate::compaction::SchedulerConfig {
            window_duration_ms: 1,
            max_wait_ms: 0,
            ..Default::default()
        },
        ..DbConfig::default()
    })
    .unwrap();
    let ns = db.namespace("docs").unwrap();
    ns.create("users/admin", doc(&[("$type", json!("Doc")), ("name", json!("x"))]))
        .unwrap();

    // With a 1 ms window and no wait bound, a future tick dispatches.
    let now_ms = chrono::Utc::now().timestamp_millis() + 10;
    ns.compaction_tick(now_ms);
    let dispatch = ns.poll_dispatch().expect("window dispatched");
    assert_eq!(dispatch.namespace, "docs");
    assert_eq!(dispatch.files, 1);

    ns.mark_window_processing(dispatch.window_start_ms).unwrap();
    ns.mark_window_complete(dispatch.window_start_ms).unwrap();
    assert_eq!(db.health(), crate::compaction::Health::Healthy);
}

// ------------------------------------------------------------------------------------------------
// Default handle cell
// ------------------------------------------------------------------------------------------------

/// The default cell is process-global; serialize the tests that touch it.
static DEFAULT_CELL_TEST_LOCK: Mutex<()> = Mutex::new(());

#[test]
fn default_db_guard_scopes_and_restores() {
    let _serial = DEFAULT_CELL_TEST_LOCK.lock().unwrap();
    let db = open_memory();
    {
        let _guard = DefaultDbGuard::install(db.clone());
        let current = default_db().expect("default installed");
        let ns = current.namespace("scoped").unwrap();
        ns.create("users/admin", doc(&[("$type", json!("Doc")), ("name", json!("x"))]))
            .unwrap();
    }
    // Outside the guard the previous default (none) is restored.
    assert!(default_db().is_none());
    drop(db);
}

#[test]
fn nested_default_guards_restore_in_order() {
    let _serial = DEFAULT_CELL_TEST_LOCK.lock().unwrap();
    let outer = open_memory();
    let inner = open_memory();
    let _outer_guard = DefaultDbGuard::install(outer);
    {
        let _inner_guard = DefaultDbGuard::install(inner);
        assert!(default_db().is_some());
    }
    // Outer default survives the inner guard.
    assert!(default_db().is_some());
}
