//! # Geospatial index
//!
//! A geohash-bucketed point index with radius and bounding-box
//! primitives over the spherical Earth model.
//!
//! ## Design Overview
//!
//! Every indexed document contributes one point. Entries live in a
//! `doc_id → entry` map and are bucketed by their geohash prefix at a
//! configured precision (default 6, cells of roughly 1.2 km × 0.6 km).
//! A radius search computes the covering set of bucket cells with
//! [`geohashes_in_radius`], scans only those buckets, pre-filters with
//! the cheap [`approximate_distance`], and ranks the survivors by exact
//! [`haversine_distance`].
//!
//! The index supports in-place updates until its segment is sealed:
//! [`GeoIndex::insert`] is idempotent per document (re-insertion
//! overwrites) and [`GeoIndex::remove`] reports whether an entry
//! existed. Lookups never fail on absent ids.
//!
//! ## Persistence
//!
//! [`GeoIndex::persist`] writes a versioned JSON snapshot with a CRC32
//! trailer through the storage backend; [`GeoIndex::load`] verifies the
//! checksum and rebuilds the buckets. A reload restores the full entry
//! set.

mod distance;
mod geohash;


use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::storage::{StorageBackend, StorageError};

pub use distance::{
    BoundingBox, EARTH_RADIUS_METERS, approximate_distance, bearing, bounding_box, destination,
    haversine_distance,
};
pub use geohash::{
    DecodedCell, Direction, cell_dimensions, decode_geohash, encode_geohash, get_neighbor,
    get_neighbors,
};

/// Snapshot format version written by [`GeoIndex::persist`].
const SNAPSHOT_VERSION: u32 = 1;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by geohash parsing and index persistence.
#[derive(Debug, Error)]
pub enum GeoError {
    /// A character outside the geohash base-32 alphabet.
    #[error("invalid geohash character {0:?}")]
    InvalidGeohash(char),

    /// Decode of an empty geohash string.
    #[error("empty geohash")]
    EmptyGeohash,

    /// Storage failure while persisting or loading a snapshot.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Snapshot bytes failed checksum or shape validation.
    #[error("corrupt geo index snapshot: {0}")]
    CorruptSnapshot(String),

    /// A bulk build was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,
}

// ------------------------------------------------------------------------------------------------
// Covering
// ------------------------------------------------------------------------------------------------

/// Returns a set of geohash cells at `precision` that fully covers the
/// disk of `radius_meters` around the center.
///
/// The center's own cell is always included, and the covering grows
/// monotonically with the radius (it samples the enclosing bounding box
/// at cell granularity, padded by one cell on each side).
pub fn geohashes_in_radius(
    lat: f64,
    lng: f64,
    radius_meters: f64,
    precision: usize,
) -> BTreeSet<String> {
    let mut cells = BTreeSet::new();
    cells.insert(encode_geohash(lat, lng, precision));

    let bbox = bounding_box(lat, lng, radius_meters.max(0.0));
    let (cell_lat, cell_lng) = cell_dimensions(precision);

    let lat_steps = ((bbox.max_lat - bbox.min_lat) / cell_lat).ceil() as usize + 2;
    let lng_steps = ((bbox.max_lng - bbox.min_lng) / cell_lng).ceil() as usize + 2;

    for i in 0..=lat_steps {
        let sample_lat = (bbox.min_lat + i as f64 * cell_lat - cell_lat / 2.0).clamp(-90.0, 90.0);
        if sample_lat > bbox.max_lat + cell_lat {
            break;
        }
        for j in 0..=lng_steps {
            let sample_lng =
                (bbox.min_lng + j as f64 * cell_lng - cell_lng / 2.0).clamp(-180.0, 180.0);
            if sample_lng > bbox.max_lng + cell_lng {
                break;
            }
            cells.insert(encode_geohash(sample_lat, sample_lng, precision));
        }
    }
    cells
}

// ------------------------------------------------------------------------------------------------
// GeoIndex
// ------------------------------------------------------------------------------------------------

/// One indexed point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoEntry {
    /// Owning document id.
    pub doc_id: String,
    /// Latitude, degrees.
    pub lat: f64,
    /// Longitude, degrees.
    pub lng: f64,
    /// Geohash at the index's bucket precision.
    pub geohash: String,
    /// Row group of the document inside its segment.
    pub row_group: u32,
    /// Row offset within the row group.
    pub row_offset: u32,
}

/// Options for [`GeoIndex::search`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GeoSearchOptions {
    /// Inclusive lower distance bound, meters.
    pub min_distance: Option<f64>,
    /// Inclusive upper distance bound, meters.
    pub max_distance: Option<f64>,
    /// Maximum number of results.
    pub limit: Option<usize>,
}

/// Result of a radius search, parallel arrays sorted by ascending
/// distance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoSearchResult {
    /// Matching document ids.
    pub doc_ids: Vec<String>,
    /// Exact haversine distance for each match, meters.
    pub distances: Vec<f64>,
    /// Row group for each match.
    pub row_groups: Vec<u32>,
    /// Candidate entries examined (bucket pre-filter reach).
    pub entries_scanned: usize,
}

/// Snapshot document persisted through the storage backend.
#[derive(Serialize, Deserialize)]
struct GeoSnapshot {
    version: u32,
    bucket_precision: usize,
    entries: Vec<GeoEntry>,
}

/// Geohash-bucketed point index.
#[derive(Debug, Clone)]
pub struct GeoIndex {
    bucket_precision: usize,
    entries: HashMap<String, GeoEntry>,
    buckets: BTreeMap<String, BTreeSet<String>>,
}

impl Default for GeoIndex {
    fn default() -> Self {
        Self::new(6)
    }
}

impl GeoIndex {
    /// Creates an empty index bucketing at `bucket_precision` geohash
    /// characters.
    pub fn new(bucket_precision: usize) -> Self {
        Self {
            bucket_precision,
            entries: HashMap::new(),
            buckets: BTreeMap::new(),
        }
    }

    /// Bucket precision this index was built with.
    pub fn bucket_precision(&self) -> usize {
        self.bucket_precision
    }

    /// Number of indexed documents.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts or overwrites the point for `doc_id`.
    ///
    /// Idempotent per document: re-insertion replaces the previous
    /// entry, including its bucket assignment.
    pub fn insert(&mut self, doc_id: &str, lat: f64, lng: f64, row_group: u32, row_offset: u32) {
        self.remove(doc_id);
        let geohash = encode_geohash(lat, lng, self.bucket_precision);
        self.buckets
            .entry(geohash.clone())
            .or_default()
            .insert(doc_id.to_string());
        self.entries.insert(
            doc_id.to_string(),
            GeoEntry {
                doc_id: doc_id.to_string(),
                lat,
                lng,
                geohash,
                row_group,
                row_offset,
            },
        );
    }

    /// Bulk insert with cooperative cancellation. On cancel the index
    /// keeps every fully inserted point and nothing of the rest.
    pub fn insert_many<'a>(
        &mut self,
        points: impl IntoIterator<Item = (&'a str, f64, f64, u32, u32)>,
        cancel: &CancelToken,
    ) -> Result<usize, GeoError> {
        let mut inserted = 0usize;
        for (doc_id, lat, lng, row_group, row_offset) in points {
            if cancel.is_cancelled() {
                return Err(GeoError::Cancelled);
            }
            self.insert(doc_id, lat, lng, row_group, row_offset);
            inserted += 1;
        }
        Ok(inserted)
    }

    /// Removes the entry for `doc_id`. Returns `true` iff it existed.
    pub fn remove(&mut self, doc_id: &str) -> bool {
        let Some(entry) = self.entries.remove(doc_id) else {
            return false;
        };
        if let Some(bucket) = self.buckets.get_mut(&entry.geohash) {
            bucket.remove(doc_id);
            if bucket.is_empty() {
                self.buckets.remove(&entry.geohash);
            }
        }
        true
    }

    /// Returns the indexed entry for `doc_id`, if any.
    pub fn get(&self, doc_id: &str) -> Option<&GeoEntry> {
        self.entries.get(doc_id)
    }

    /// Radius search around a center point.
    ///
    /// Results are sorted by ascending exact distance, filtered to
    /// `[min_distance, max_distance]`, and truncated to `limit`. With a
    /// `max_distance` the scan is confined to the covering buckets;
    /// without one every entry is a candidate.
    pub fn search(&self, lat: f64, lng: f64, options: &GeoSearchOptions) -> GeoSearchResult {
        let min = options.min_distance.unwrap_or(0.0);

        // Bucket pre-filtering only pays off while the covering stays
        // small; a continent-sized radius scans the flat entry map.
        let bucketed = options.max_distance.is_some_and(|max| {
            let bbox = bounding_box(lat, lng, max);
            let (cell_lat, cell_lng) = cell_dimensions(self.bucket_precision);
            let cells = ((bbox.max_lat - bbox.min_lat) / cell_lat)
                * ((bbox.max_lng - bbox.min_lng) / cell_lng);
            cells <= 10_000.0
        });

        let candidates: Vec<&GeoEntry> = match options.max_distance.filter(|_| bucketed) {
            Some(max) => {
                let covering = geohashes_in_radius(lat, lng, max, self.bucket_precision);
                let mut out = Vec::new();
                for cell in covering {
                    if let Some(bucket) = self.buckets.get(&cell) {
                        for doc_id in bucket {
                            if let Some(entry) = self.entries.get(doc_id) {
                                out.push(entry);
                            }
                        }
                    }
                }
                out
            }
            None => self.entries.values().collect(),
        };

        let mut scanned = 0usize;
        let mut hits: Vec<(&GeoEntry, f64)> = Vec::new();
        for entry in candidates {
            scanned += 1;
            if let Some(max) = options.max_distance {
                // Equirectangular pre-filter with a 10% safety margin;
                // survivors pay for the exact haversine.
                if approximate_distance(lat, lng, entry.lat, entry.lng) > max * 1.1 + 1.0 {
                    continue;
                }
            }
            let exact = haversine_distance(lat, lng, entry.lat, entry.lng);
            if exact < min {
                continue;
            }
            if let Some(max) = options.max_distance
                && exact > max
            {
                continue;
            }
            hits.push((entry, exact));
        }

        hits.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.doc_id.cmp(&b.0.doc_id))
        });
        if let Some(limit) = options.limit {
            hits.truncate(limit);
        }

        let mut result = GeoSearchResult {
            entries_scanned: scanned,
            ..Default::default()
        };
        for (entry, dist) in hits {
            result.doc_ids.push(entry.doc_id.clone());
            result.distances.push(dist);
            result.row_groups.push(entry.row_group);
        }
        result
    }

    // --------------------------------------------------------------------------------------------
    // Persistence
    // --------------------------------------------------------------------------------------------

    /// Writes a snapshot of the full entry set through the backend.
    ///
    /// Layout: JSON snapshot document followed by a 4-byte little-endian
    /// CRC32 of the JSON bytes.
    pub fn persist(&self, backend: &dyn StorageBackend, path: &str) -> Result<(), GeoError> {
        let snapshot = GeoSnapshot {
            version: SNAPSHOT_VERSION,
            bucket_precision: self.bucket_precision,
            entries: {
                let mut entries: Vec<GeoEntry> = self.entries.values().cloned().collect();
                entries.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
                entries
            },
        };
        let mut payload = serde_json::to_vec(&snapshot)
            .map_err(|e| GeoError::CorruptSnapshot(e.to_string()))?;
        let crc = crc32fast::hash(&payload);
        payload.extend_from_slice(&crc.to_le_bytes());
        backend.write(path, &payload)?;
        debug!(path, entries = self.entries.len(), "geo index persisted");
        Ok(())
    }

    /// Loads a snapshot previously written by [`GeoIndex::persist`].
    pub fn load(backend: &dyn StorageBackend, path: &str) -> Result<Self, GeoError> {
        let bytes = backend.read(path)?;
        if bytes.len() < 4 {
            return Err(GeoError::CorruptSnapshot("snapshot too small".into()));
        }
        let (payload, trailer) = bytes.split_at(bytes.len() - 4);
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        if crc32fast::hash(payload) != stored {
            return Err(GeoError::CorruptSnapshot("checksum mismatch".into()));
        }
        let snapshot: GeoSnapshot = serde_json::from_slice(payload)
            .map_err(|e| GeoError::CorruptSnapshot(e.to_string()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(GeoError::CorruptSnapshot(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let mut index = Self::new(snapshot.bucket_precision);
        for entry in snapshot.entries {
            index
                .buckets
                .entry(entry.geohash.clone())
                .or_default()
                .insert(entry.doc_id.clone());
            index.entries.insert(entry.doc_id.clone(), entry);
        }
        Ok(index)
    }
}
