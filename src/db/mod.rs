//! # Database facade
//!
//! The concrete embedded handle: [`Database::open`] validates its
//! configuration, wires a storage backend, and hands out per-namespace
//! access. No lazy proxy — the handle is a real value, cheap to clone
//! (`Arc`-shared), and safe to use from multiple threads.
//!
//! ## Per-namespace state
//!
//! Each namespace owns its declared collection schemas, a full-text
//! index, a geo index, and a compaction scheduler, all behind one
//! mutex: the write path is serialized per namespace, the way the
//! concurrency model prescribes. Reads that need index access clone a
//! snapshot out of the lock.
//!
//! ## Write path
//!
//! [`NamespaceHandle::create`] runs the mutation pipeline, persists the
//! entity payload at `<ns>/entities/<id>.json` through the backend,
//! feeds the secondary indexes (name and string attributes into the
//! full-text index; numeric `lat`/`lng` attributes into the geo index),
//! records the append with the compaction scheduler, and finally emits
//! the events to registered hooks — in mutation order within the
//! namespace.
//!
//! ## Default handle
//!
//! The process-wide default database is confined to a single static
//! cell. [`set_default`] installs a handle, [`default_db`] reads it,
//! and tests scope overrides with [`DefaultDbGuard`] instead of
//! re-binding a global.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use chrono::Utc;
use crossbeam::channel::Receiver;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::bloom::BloomError;
use crate::compaction::{
    CompactionError, CompactionMetrics, CompactionScheduler, DashboardConfig, Health,
    SchedulerConfig, WindowDispatch, aggregate_health,
};
use crate::fts::{FtsConfig, FtsError, FtsIndex, SearchHit};
use crate::geo::{GeoError, GeoIndex, GeoSearchOptions, GeoSearchResult};
use crate::keycodec::KeyCodecError;
use crate::mutation::{
    ChangeEvent, CollectionSchema, CreateOutcome, Entity, IdGenerator, MutationContext,
    MutationError, Namespace, RandomIdGenerator, execute_create, execute_delete,
};
use crate::schema::SchemaError;
use crate::storage::{FsBackend, MemoryBackend, StorageBackend, StorageError};
use crate::validate::ValidateError;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Umbrella error for facade operations: every subsystem failure
/// converts into it unmodified.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Mutation(#[from] MutationError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Fts(#[from] FtsError),

    #[error(transparent)]
    Geo(#[from] GeoError),

    #[error(transparent)]
    Bloom(#[from] BloomError),

    #[error(transparent)]
    KeyCodec(#[from] KeyCodecError),

    #[error(transparent)]
    Validate(#[from] ValidateError),

    #[error(transparent)]
    Compaction(#[from] CompactionError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Backend selection for [`Database::open`].
#[derive(Debug, Clone, Default)]
pub enum StorageConfig {
    /// Filesystem-rooted backend at the given directory.
    Directory(PathBuf),
    /// Volatile in-memory backend (tests, scratch hosts).
    #[default]
    Memory,
}

/// Database configuration. Validated by [`Database::open`].
#[derive(Debug, Clone, Default)]
pub struct DbConfig {
    /// Where entity payloads and index snapshots live.
    pub storage: StorageConfig,
    /// Full-text tokenizer and scorer options.
    pub fts: FtsConfig,
    /// Geohash bucket precision for geo indexes (1..=12).
    pub geo_bucket_precision: Option<usize>,
    /// Compaction scheduler timing.
    pub scheduler: SchedulerConfig,
    /// Health thresholds for the compaction dashboard.
    pub dashboard: DashboardConfig,
}

impl DbConfig {
    fn validated(self) -> Result<Self, DbError> {
        if self.fts.min_token_len == 0 {
            return Err(DbError::Config("fts.min_token_len must be at least 1".into()));
        }
        if self.fts.phrase_boost < 0.0 {
            return Err(DbError::Config("fts.phrase_boost must be non-negative".into()));
        }
        if let Some(precision) = self.geo_bucket_precision
            && !(1..=12).contains(&precision)
        {
            return Err(DbError::Config(format!(
                "geo_bucket_precision {precision} outside 1..=12"
            )));
        }
        if self.scheduler.window_duration_ms <= 0 {
            return Err(DbError::Config(
                "scheduler.window_duration_ms must be positive".into(),
            ));
        }
        Ok(self)
    }

    fn bucket_precision(&self) -> usize {
        self.geo_bucket_precision.unwrap_or(6)
    }
}

// ------------------------------------------------------------------------------------------------
// Inner state
// ------------------------------------------------------------------------------------------------

/// Event hook signature. Hooks observe value snapshots.
pub type EventHook = Box<dyn Fn(&ChangeEvent) + Send + Sync>;

struct NamespaceState {
    namespace: Namespace,
    schemas: HashMap<String, CollectionSchema>,
    fts: FtsIndex,
    geo: GeoIndex,
    scheduler: CompactionScheduler,
    dispatch_rx: Receiver<WindowDispatch>,
}

struct DbInner {
    backend: Arc<dyn StorageBackend>,
    config: DbConfig,
    /// Write path: one mutex per namespace serializes its mutations.
    namespaces: RwLock<HashMap<String, Arc<Mutex<NamespaceState>>>>,
    hooks: RwLock<Vec<EventHook>>,
}

/// The embedded database handle. Clones share state.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl Database {
    /// Opens a database with the given configuration.
    pub fn open(config: DbConfig) -> Result<Self, DbError> {
        let config = config.validated()?;
        let backend: Arc<dyn StorageBackend> = match &config.storage {
            StorageConfig::Directory(root) => Arc::new(FsBackend::open(root)?),
            StorageConfig::Memory => Arc::new(MemoryBackend::new()),
        };
        info!(storage = ?config.storage, "database opened");
        Ok(Self {
            inner: Arc::new(DbInner {
                backend,
                config,
                namespaces: RwLock::new(HashMap::new()),
                hooks: RwLock::new(Vec::new()),
            }),
        })
    }

    /// Opens a database over a caller-supplied backend.
    pub fn with_backend(backend: Arc<dyn StorageBackend>, config: DbConfig) -> Result<Self, DbError> {
        let config = config.validated()?;
        Ok(Self {
            inner: Arc::new(DbInner {
                backend,
                config,
                namespaces: RwLock::new(HashMap::new()),
                hooks: RwLock::new(Vec::new()),
            }),
        })
    }

    /// The backend this database persists through.
    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        Arc::clone(&self.inner.backend)
    }

    /// Registers an event hook. Hooks run synchronously, in mutation
    /// order within a namespace.
    pub fn on_event(&self, hook: EventHook) {
        self.write_lock(&self.inner.hooks).push(hook);
    }

    /// Returns (creating on first use) a handle to a namespace.
    pub fn namespace(&self, name: &str) -> Result<NamespaceHandle, DbError> {
        let namespace = Namespace::parse(name)?;
        {
            let namespaces = self.read_lock(&self.inner.namespaces);
            if let Some(state) = namespaces.get(namespace.as_str()) {
                return Ok(NamespaceHandle {
                    db: self.clone(),
                    state: Arc::clone(state),
                });
            }
        }

        let mut namespaces = self.write_lock(&self.inner.namespaces);
        let state = namespaces
            .entry(namespace.as_str().to_string())
            .or_insert_with(|| {
                let (scheduler, dispatch_rx) =
                    CompactionScheduler::new(namespace.as_str(), self.inner.config.scheduler);
                debug!(namespace = %namespace, "namespace state created");
                Arc::new(Mutex::new(NamespaceState {
                    namespace: namespace.clone(),
                    schemas: HashMap::new(),
                    fts: FtsIndex::new(self.inner.config.fts),
                    geo: GeoIndex::new(self.inner.config.bucket_precision()),
                    scheduler,
                    dispatch_rx,
                }))
            });
        Ok(NamespaceHandle {
            db: self.clone(),
            state: Arc::clone(state),
        })
    }

    /// Aggregated compaction health: the worst verdict across all
    /// namespaces.
    pub fn health(&self) -> Health {
        let now_ms = Utc::now().timestamp_millis();
        let namespaces = self.read_lock(&self.inner.namespaces);
        let verdicts: Vec<Health> = namespaces
            .values()
            .map(|state| {
                self.lock_ns(state)
                    .scheduler
                    .health(now_ms, &self.inner.config.dashboard)
            })
            .collect();
        aggregate_health(verdicts)
    }

    fn emit(&self, events: &[ChangeEvent]) {
        let hooks = self.read_lock(&self.inner.hooks);
        for event in events {
            for hook in hooks.iter() {
                hook(event);
            }
        }
    }

    // Poisoned locks only happen when a hook or index panicked; the
    // engine state itself is consistent between operations, so recover
    // the guard instead of wedging every caller.
    fn read_lock<'a, T>(&self, lock: &'a RwLock<T>) -> std::sync::RwLockReadGuard<'a, T> {
        lock.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_lock<'a, T>(&self, lock: &'a RwLock<T>) -> std::sync::RwLockWriteGuard<'a, T> {
        lock.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_ns<'a>(
        &self,
        state: &'a Arc<Mutex<NamespaceState>>,
    ) -> std::sync::MutexGuard<'a, NamespaceState> {
        state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ------------------------------------------------------------------------------------------------
// NamespaceHandle
// ------------------------------------------------------------------------------------------------

/// Access to one namespace's documents and indexes.
#[derive(Clone)]
pub struct NamespaceHandle {
    db: Database,
    state: Arc<Mutex<NamespaceState>>,
}

impl NamespaceHandle {
    /// The namespace this handle targets.
    pub fn name(&self) -> String {
        self.db.lock_ns(&self.state).namespace.as_str().to_string()
    }

    /// Declares (or replaces) the schema for a `$type`.
    pub fn declare_schema(&self, schema: CollectionSchema) {
        let mut state = self.db.lock_ns(&self.state);
        state.schemas.insert(schema.type_name.clone(), schema);
    }

    /// Creates an entity with the default random id generator.
    pub fn create(&self, actor: &str, input: Map<String, Value>) -> Result<CreateOutcome, DbError> {
        self.create_with(actor, input, &RandomIdGenerator, false)
    }

    /// Creates an entity with full control over id strategy and
    /// validation bypass.
    pub fn create_with(
        &self,
        actor: &str,
        input: Map<String, Value>,
        id_generator: &dyn IdGenerator,
        skip_validation: bool,
    ) -> Result<CreateOutcome, DbError> {
        let timestamp = Utc::now();
        let mut state = self.db.lock_ns(&self.state);

        let ctx = MutationContext {
            namespace: state.namespace.clone(),
            actor: actor.to_string(),
            timestamp,
            skip_validation,
        };
        let schema = input
            .get("$type")
            .and_then(Value::as_str)
            .and_then(|t| state.schemas.get(t))
            .cloned();
        let outcome = execute_create(&ctx, &input, schema.as_ref(), id_generator)?;
        let entity = &outcome.entity;

        // Persist the entity payload first; indexes follow only on
        // success so a storage failure leaves no dangling index entry.
        let payload = serde_json::to_vec(entity)?;
        let path = entity_path(state.namespace.as_str(), entity.local_id());
        self.db.inner.backend.write(&path, &payload)?;

        Self::index_entity(&mut state, entity);
        state.scheduler.record_append(
            actor,
            timestamp.timestamp_millis(),
            payload.len() as u64,
        );

        drop(state);
        self.db.emit(&outcome.events);
        Ok(outcome)
    }

    /// Fetches an entity by its local id. Absent entities are `None`,
    /// not an error.
    pub fn get(&self, local_id: &str) -> Result<Option<Entity>, DbError> {
        let path = {
            let state = self.db.lock_ns(&self.state);
            entity_path(state.namespace.as_str(), local_id)
        };
        match self.db.inner.backend.read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes an entity, removing its payload and index entries and
    /// emitting the tombstone event. Returns `false` when absent.
    pub fn delete(&self, actor: &str, local_id: &str) -> Result<bool, DbError> {
        let Some(entity) = self.get(local_id)? else {
            return Ok(false);
        };
        let timestamp = Utc::now();
        let mut state = self.db.lock_ns(&self.state);

        let ctx = MutationContext {
            namespace: state.namespace.clone(),
            actor: actor.to_string(),
            timestamp,
            skip_validation: false,
        };
        let outcome = execute_delete(&ctx, &entity);

        let doc_id = entity.id.clone();
        let path = entity_path(state.namespace.as_str(), local_id);
        self.db.inner.backend.delete(&path)?;
        state.fts.remove_document(&doc_id);
        state.geo.remove(&doc_id);

        drop(state);
        self.db.emit(&outcome.events);
        Ok(true)
    }

    /// Free-text search over this namespace's documents.
    pub fn search(&self, query: &str) -> Vec<SearchHit> {
        self.db.lock_ns(&self.state).fts.search(query)
    }

    /// Phrase search over this namespace's documents.
    pub fn search_phrase(&self, phrase: &str) -> Vec<SearchHit> {
        self.db.lock_ns(&self.state).fts.search_phrase(phrase)
    }

    /// Geo radius search over documents carrying `lat`/`lng`.
    pub fn geo_search(&self, lat: f64, lng: f64, options: &GeoSearchOptions) -> GeoSearchResult {
        self.db.lock_ns(&self.state).geo.search(lat, lng, options)
    }

    /// Snapshot of the full-text index (reads don't hold the lock).
    pub fn fts_snapshot(&self) -> FtsIndex {
        self.db.lock_ns(&self.state).fts.clone()
    }

    /// Snapshot of the geo index.
    pub fn geo_snapshot(&self) -> GeoIndex {
        self.db.lock_ns(&self.state).geo.clone()
    }

    /// Persists both secondary indexes through the storage backend.
    pub fn persist_indexes(&self) -> Result<(), DbError> {
        let (fts, geo, ns) = {
            let state = self.db.lock_ns(&self.state);
            (
                state.fts.clone(),
                state.geo.clone(),
                state.namespace.as_str().to_string(),
            )
        };
        fts.persist(self.db.inner.backend.as_ref(), &fts_index_path(&ns))?;
        geo.persist(self.db.inner.backend.as_ref(), &geo_index_path(&ns))?;
        Ok(())
    }

    /// Reloads both secondary indexes from their persisted snapshots.
    pub fn reload_indexes(&self) -> Result<(), DbError> {
        let ns = self.name();
        let fts = FtsIndex::load(self.db.inner.backend.as_ref(), &fts_index_path(&ns))?;
        let geo = GeoIndex::load(self.db.inner.backend.as_ref(), &geo_index_path(&ns))?;
        let mut state = self.db.lock_ns(&self.state);
        state.fts = fts;
        state.geo = geo;
        Ok(())
    }

    /// Drives the compaction scheduler for this namespace.
    pub fn compaction_tick(&self, now_ms: i64) {
        self.db.lock_ns(&self.state).scheduler.tick(now_ms);
    }

    /// Next pending window dispatch, if the scheduler produced one.
    pub fn poll_dispatch(&self) -> Option<WindowDispatch> {
        self.db.lock_ns(&self.state).dispatch_rx.try_recv().ok()
    }

    /// Compaction metrics snapshot for this namespace.
    pub fn compaction_metrics(&self, now_ms: i64) -> CompactionMetrics {
        self.db.lock_ns(&self.state).scheduler.metrics(now_ms)
    }

    /// Marks a dispatched window as being processed.
    pub fn mark_window_processing(&self, window_start_ms: i64) -> Result<(), DbError> {
        Ok(self
            .db
            .lock_ns(&self.state)
            .scheduler
            .mark_processing(window_start_ms)?)
    }

    /// Marks a window's merge as complete.
    pub fn mark_window_complete(&self, window_start_ms: i64) -> Result<(), DbError> {
        Ok(self
            .db
            .lock_ns(&self.state)
            .scheduler
            .mark_complete(window_start_ms)?)
    }

    /// Feeds an entity into the namespace's secondary indexes.
    fn index_entity(state: &mut NamespaceState, entity: &Entity) {
        // Full text: the name plus every top-level string attribute,
        // each under its own field path.
        let mut fields: Vec<(&str, &str)> = vec![("name", entity.name.as_str())];
        for (key, value) in &entity.attributes {
            if let Value::String(text) = value {
                fields.push((key.as_str(), text.as_str()));
            }
        }
        state.fts.insert_document(&entity.id, &fields);

        // Geo: documents carrying numeric `lat` and `lng`.
        if let (Some(lat), Some(lng)) = (
            entity.attributes.get("lat").and_then(Value::as_f64),
            entity.attributes.get("lng").and_then(Value::as_f64),
        ) {
            state.geo.insert(&entity.id, lat, lng, 0, 0);
        }
    }
}

fn entity_path(namespace: &str, local_id: &str) -> String {
    format!("{namespace}/entities/{local_id}.json")
}

fn fts_index_path(namespace: &str) -> String {
    format!("{namespace}/indexes/fts.snapshot")
}

fn geo_index_path(namespace: &str) -> String {
    format!("{namespace}/indexes/geo.snapshot")
}

// ------------------------------------------------------------------------------------------------
// Default database cell
// ------------------------------------------------------------------------------------------------

fn default_cell() -> &'static RwLock<Option<Database>> {
    static CELL: OnceLock<RwLock<Option<Database>>> = OnceLock::new();
    CELL.get_or_init(|| RwLock::new(None))
}

/// Installs the process-wide default database handle.
pub fn set_default(db: Database) {
    *default_cell().write().unwrap_or_else(|e| e.into_inner()) = Some(db);
}

/// The process-wide default database, if one was installed.
pub fn default_db() -> Option<Database> {
    default_cell()
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
}

/// Scoped override of the default database. On drop, the previous
/// default is restored — tests use this instead of re-binding a global.
pub struct DefaultDbGuard {
    previous: Option<Database>,
}

impl DefaultDbGuard {
    /// Installs `db` as the default for the guard's lifetime.
    pub fn install(db: Database) -> Self {
        let mut cell = default_cell().write().unwrap_or_else(|e| e.into_inner());
        let previous = cell.replace(db);
        Self { previous }
    }
}

impl Drop for DefaultDbGuard {
    fn drop(&mut self) {
        *default_cell().write().unwrap_or_else(|e| e.into_inner()) = self.previous.take();
    }
}
