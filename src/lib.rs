//! # TesseraDB
//!
//! An embeddable, document-oriented storage engine that persists
//! records as immutable columnar file segments and answers rich
//! secondary queries: full-text search, geospatial proximity, and
//! bloom-accelerated point lookups.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        Database                            │
//! │  ┌───────────────┐   ┌──────────────────────────────────┐  │
//! │  │   Mutation     │──►│  Storage backend (fs / memory)   │  │
//! │  │   pipeline     │   └──────────────────────────────────┘  │
//! │  │ validate →     │   ┌─────────┐ ┌─────────┐ ┌─────────┐  │
//! │  │ defaults →     │──►│  FTS    │ │  Geo    │ │  Bloom  │  │
//! │  │ event          │   │  index  │ │  index  │ │ filters │  │
//! │  └──────┬────────┘   └─────────┘ └─────────┘ └─────────┘  │
//! │         │ append activity                                  │
//! │  ┌──────▼──────────────────────────────────────────────┐   │
//! │  │  Compaction control plane (windows, health)         │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`keycodec`] | Order-preserving binary encoding for heterogeneous keys |
//! | [`bloom`] | xxHash64, Parquet split-block bloom filters, header framing |
//! | [`fts`] | Tokenization, positional postings, BM25 + phrase scoring |
//! | [`geo`] | Geohash codec, spherical distance math, bucketed point index |
//! | [`mutation`] | Validated document creation and change events |
//! | [`schema`] | Schema-change detection and severity classification |
//! | [`compaction`] | Window scheduling, writer tracking, health |
//! | [`storage`] | Abstract read/write/list backend contract |
//! | [`validate`] | Boundary validators for parameters, paths, catalogs |
//! | [`db`] | The concrete `Database` handle tying it all together |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use tesseradb::{Database, DbConfig};
//!
//! let db = Database::open(DbConfig::default()).unwrap();
//! let places = db.namespace("places").unwrap();
//!
//! let input = [
//!     ("$type".to_string(), json!("Cafe")),
//!     ("name".to_string(), json!("Ritual Roasters")),
//!     ("lat".to_string(), json!(37.7599)),
//!     ("lng".to_string(), json!(-122.4148)),
//! ]
//! .into_iter()
//! .collect();
//! places.create("users/admin", input).unwrap();
//!
//! // Full-text and geo queries over the same documents.
//! let hits = places.search("ritual");
//! let nearby = places.geo_search(
//!     37.7749,
//!     -122.4194,
//!     &tesseradb::geo::GeoSearchOptions {
//!         max_distance: Some(5_000.0),
//!         ..Default::default()
//!     },
//! );
//! assert_eq!(hits.len(), nearby.doc_ids.len());
//! ```

pub mod bloom;
pub mod cancel;
pub mod compaction;
pub mod db;
pub mod fts;
pub mod geo;
pub mod keycodec;
pub mod mutation;
pub mod schema;
pub mod storage;
pub mod validate;

pub use cancel::CancelToken;
pub use db::{Database, DbConfig, DbError, DefaultDbGuard, StorageConfig, default_db, set_default};
