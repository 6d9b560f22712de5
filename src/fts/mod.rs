//! # Full-text index
//!
//! Tokenization, positional posting lists, and a BM25-style scorer with
//! occurrence-weighted phrase boosting.
//!
//! ## Design Overview
//!
//! Text is lowercased, split on non-alphanumeric boundaries, filtered by
//! a minimum token length (default 2), and run through a pluggable
//! [`LanguagePipeline`]. For every `(token, field)` pair the index keeps
//! a `doc_id → positions[]` map, where positions are offsets in the
//! field's post-pipeline token sequence (strictly ascending).
//!
//! Scoring combines two signals:
//!
//! - **Bag of words** — the sum over query tokens of `tf · idf` with
//!   BM25 length normalization (`k1 = 1.2`, `b = 0.75` by default).
//! - **Phrase boost** — a phrase occurrence at position `i` is any `i`
//!   where token `k` of the phrase appears at `i + k` for every `k`,
//!   counted per field and summed. The boost is **multiplicative in the
//!   occurrence count**: `score × (1 + α · count)`, so among documents
//!   containing a phrase, more occurrences always score strictly
//!   higher. With the default `α = 0.5`, a document with four phrase
//!   occurrences out-boosts a single-occurrence document by 2×.
//!
//! [`FtsIndex::search`] understands embedded `"quoted phrases"`;
//! [`FtsIndex::search_phrase`] restricts results to phrase-bearing
//! documents. Both return hits sorted by descending score with ties
//! broken by ascending document id.
//!
//! When `index_positions` is off only membership is kept and phrase
//! queries degrade to conjunctive membership (a flat single-occurrence
//! boost).
//!
//! ## Persistence
//!
//! [`FtsIndex::persist`] writes a versioned JSON snapshot with a CRC32
//! trailer through the storage backend. Custom pipelines cannot be
//! snapshotted; reload reconstructs the pipeline from the persisted
//! [`Language`] selector.

mod language;


use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::storage::{StorageBackend, StorageError};

pub use language::{EnglishPipeline, Language, LanguagePipeline, NoopPipeline};

/// Snapshot format version written by [`FtsIndex::persist`].
const SNAPSHOT_VERSION: u32 = 1;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by index persistence. Lookups never fail — absent
/// terms and documents simply produce empty results.
#[derive(Debug, Error)]
pub enum FtsError {
    /// Storage failure while persisting or loading a snapshot.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Snapshot bytes failed checksum or shape validation.
    #[error("corrupt full-text index snapshot: {0}")]
    CorruptSnapshot(String),

    /// A bulk build was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Tokenizer and scorer configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FtsConfig {
    /// Minimum token length; shorter tokens are discarded.
    pub min_token_len: usize,
    /// Keep positional postings (required for phrase counting).
    pub index_positions: bool,
    /// Phrase boost coefficient α in `1 + α · phrase_count`.
    pub phrase_boost: f64,
    /// BM25 term-frequency saturation.
    pub k1: f64,
    /// BM25 length-normalization strength.
    pub b: f64,
    /// Built-in language pipeline selector.
    pub language: Language,
}

impl Default for FtsConfig {
    fn default() -> Self {
        Self {
            min_token_len: 2,
            index_positions: true,
            phrase_boost: 0.5,
            k1: 1.2,
            b: 0.75,
            language: Language::None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Tokenization
// ------------------------------------------------------------------------------------------------

/// Tokenizes `text`: lowercase, split on non-alphanumeric boundaries,
/// drop tokens shorter than the minimum, run the pipeline. The returned
/// sequence order defines token positions.
pub fn tokenize(text: &str, config: &FtsConfig, pipeline: &dyn LanguagePipeline) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|raw| raw.chars().count() >= config.min_token_len)
        .filter_map(|raw| pipeline.process(raw))
        .collect()
}

// ------------------------------------------------------------------------------------------------
// FtsIndex
// ------------------------------------------------------------------------------------------------

/// One search result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Matching document id.
    pub doc_id: String,
    /// Relevance score (bag-of-words × phrase boost).
    pub score: f64,
}

/// Postings for one token: `field → doc → positions`.
type TokenPostings = HashMap<String, BTreeMap<String, Vec<u32>>>;

/// Snapshot document persisted through the storage backend.
#[derive(Serialize, Deserialize)]
struct FtsSnapshot {
    version: u32,
    config: FtsConfig,
    postings: BTreeMap<String, BTreeMap<String, BTreeMap<String, Vec<u32>>>>,
    doc_lengths: BTreeMap<String, u64>,
}

/// In-memory positional full-text index.
///
/// Owned exclusively by its holder; readers wanting an isolated view
/// clone the index (copy-on-write at the host's discretion).
#[derive(Clone)]
pub struct FtsIndex {
    config: FtsConfig,
    pipeline: &'static dyn LanguagePipeline,
    custom_pipeline: Option<std::sync::Arc<dyn LanguagePipeline>>,
    postings: HashMap<String, TokenPostings>,
    doc_lengths: HashMap<String, u64>,
}

impl Default for FtsIndex {
    fn default() -> Self {
        Self::new(FtsConfig::default())
    }
}

impl FtsIndex {
    /// Creates an empty index using the configured built-in pipeline.
    pub fn new(config: FtsConfig) -> Self {
        Self {
            config,
            pipeline: config.language.pipeline(),
            custom_pipeline: None,
            postings: HashMap::new(),
            doc_lengths: HashMap::new(),
        }
    }

    /// Creates an empty index with a caller-supplied pipeline. Such an
    /// index still persists, but reload falls back to the configured
    /// built-in pipeline.
    pub fn with_pipeline(
        config: FtsConfig,
        pipeline: std::sync::Arc<dyn LanguagePipeline>,
    ) -> Self {
        Self {
            config,
            pipeline: config.language.pipeline(),
            custom_pipeline: Some(pipeline),
            postings: HashMap::new(),
            doc_lengths: HashMap::new(),
        }
    }

    fn pipeline(&self) -> &dyn LanguagePipeline {
        match &self.custom_pipeline {
            Some(custom) => custom.as_ref(),
            None => self.pipeline,
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &FtsConfig {
        &self.config
    }

    /// Number of indexed documents.
    pub fn doc_count(&self) -> usize {
        self.doc_lengths.len()
    }

    /// Whether no documents are indexed.
    pub fn is_empty(&self) -> bool {
        self.doc_lengths.is_empty()
    }

    // --------------------------------------------------------------------------------------------
    // Mutation
    // --------------------------------------------------------------------------------------------

    /// Indexes (or re-indexes) a document from `(field_path, text)`
    /// pairs. Re-insertion fully replaces the previous postings.
    pub fn insert_document(&mut self, doc_id: &str, fields: &[(&str, &str)]) {
        self.remove_document(doc_id);

        let mut total_tokens = 0u64;
        for (field_path, text) in fields {
            let tokens = tokenize(text, &self.config, self.pipeline());
            total_tokens += tokens.len() as u64;
            for (position, token) in tokens.into_iter().enumerate() {
                let by_doc = self
                    .postings
                    .entry(token)
                    .or_default()
                    .entry(field_path.to_string())
                    .or_default()
                    .entry(doc_id.to_string())
                    .or_default();
                if self.config.index_positions {
                    by_doc.push(position as u32);
                } else if by_doc.is_empty() {
                    // Membership only: one sentinel entry per (token, field, doc).
                    by_doc.push(0);
                }
            }
        }
        self.doc_lengths.insert(doc_id.to_string(), total_tokens);
    }

    /// Bulk indexing with cooperative cancellation. Fully indexed
    /// documents stay; nothing of the aborted document is kept.
    pub fn insert_documents<'a>(
        &mut self,
        docs: impl IntoIterator<Item = (&'a str, Vec<(&'a str, &'a str)>)>,
        cancel: &CancelToken,
    ) -> Result<usize, FtsError> {
        let mut indexed = 0usize;
        for (doc_id, fields) in docs {
            if cancel.is_cancelled() {
                return Err(FtsError::Cancelled);
            }
            self.insert_document(doc_id, &fields);
            indexed += 1;
        }
        Ok(indexed)
    }

    /// Removes all postings for `doc_id`. Returns `true` iff the
    /// document was indexed.
    pub fn remove_document(&mut self, doc_id: &str) -> bool {
        if self.doc_lengths.remove(doc_id).is_none() {
            return false;
        }
        self.postings.retain(|_, fields| {
            fields.retain(|_, docs| {
                docs.remove(doc_id);
                !docs.is_empty()
            });
            !fields.is_empty()
        });
        true
    }

    // --------------------------------------------------------------------------------------------
    // Query
    // --------------------------------------------------------------------------------------------

    /// Free-text search with embedded `"quoted phrase"` support.
    ///
    /// All terms (loose and phrase) contribute to the bag-of-words
    /// score; every phrase then multiplies the score by
    /// `1 + α · phrase_count`.
    pub fn search(&self, query: &str) -> Vec<SearchHit> {
        let (loose, phrases) = parse_query(query);
        let mut all_tokens: Vec<String> = tokenize(&loose, &self.config, self.pipeline());
        let phrase_tokens: Vec<Vec<String>> = phrases
            .iter()
            .map(|p| tokenize(p, &self.config, self.pipeline()))
            .filter(|t| !t.is_empty())
            .collect();
        for phrase in &phrase_tokens {
            all_tokens.extend(phrase.iter().cloned());
        }
        if all_tokens.is_empty() {
            return Vec::new();
        }

        let mut hits = Vec::new();
        for doc_id in self.candidates(&all_tokens) {
            let mut score = self.bag_of_words_score(&all_tokens, &doc_id);
            if score <= 0.0 {
                continue;
            }
            for phrase in &phrase_tokens {
                let count = self.phrase_count(&doc_id, phrase);
                score *= 1.0 + self.config.phrase_boost * count as f64;
            }
            hits.push(SearchHit { doc_id, score });
        }
        sort_hits(&mut hits);
        hits
    }

    /// Phrase search: only documents containing the full phrase match.
    ///
    /// Scores are the phrase tokens' bag-of-words score multiplied by
    /// `1 + α · phrase_count`, so occurrence count dominates among
    /// otherwise similar documents.
    pub fn search_phrase(&self, phrase: &str) -> Vec<SearchHit> {
        let tokens = tokenize(phrase, &self.config, self.pipeline());
        if tokens.is_empty() {
            return Vec::new();
        }

        let mut hits = Vec::new();
        for doc_id in self.candidates(&tokens) {
            let count = self.phrase_count(&doc_id, &tokens);
            if count == 0 {
                continue;
            }
            let base = self.bag_of_words_score(&tokens, &doc_id);
            hits.push(SearchHit {
                doc_id,
                score: base * (1.0 + self.config.phrase_boost * count as f64),
            });
        }
        sort_hits(&mut hits);
        hits
    }

    /// Counts phrase occurrences in a document: starting positions `i`
    /// (per field, summed) where token `k` appears at `i + k` for every
    /// `k`. Single-token phrases count plain occurrences.
    pub fn phrase_count(&self, doc_id: &str, tokens: &[String]) -> usize {
        if tokens.is_empty() {
            return 0;
        }
        if !self.config.index_positions {
            // Membership degradation: every token present in some field
            // counts as one conjunctive occurrence.
            let all_present = tokens.iter().all(|t| {
                self.postings
                    .get(t)
                    .is_some_and(|fields| fields.values().any(|docs| docs.contains_key(doc_id)))
            });
            return usize::from(all_present);
        }

        let Some(first_fields) = self.postings.get(&tokens[0]) else {
            return 0;
        };

        let mut count = 0usize;
        for (field, docs) in first_fields {
            let Some(starts) = docs.get(doc_id) else {
                continue;
            };
            // Positions for every remaining token in the same field.
            let rest: Option<Vec<&Vec<u32>>> = tokens[1..]
                .iter()
                .map(|t| {
                    self.postings
                        .get(t)
                        .and_then(|fields| fields.get(field))
                        .and_then(|docs| docs.get(doc_id))
                })
                .collect();
            let Some(rest) = rest else {
                continue;
            };
            for &start in starts {
                let matches = rest
                    .iter()
                    .enumerate()
                    .all(|(k, list)| list.binary_search(&(start + k as u32 + 1)).is_ok());
                if matches {
                    count += 1;
                }
            }
        }
        count
    }

    // --------------------------------------------------------------------------------------------
    // Scoring internals
    // --------------------------------------------------------------------------------------------

    /// Documents containing at least one of the tokens.
    fn candidates(&self, tokens: &[String]) -> Vec<String> {
        let mut out: HashSet<&str> = HashSet::new();
        for token in tokens {
            if let Some(fields) = self.postings.get(token) {
                for docs in fields.values() {
                    out.extend(docs.keys().map(String::as_str));
                }
            }
        }
        let mut out: Vec<String> = out.into_iter().map(str::to_string).collect();
        out.sort();
        out
    }

    /// Total occurrences of `token` in `doc_id` across fields.
    fn term_frequency(&self, token: &str, doc_id: &str) -> u64 {
        self.postings
            .get(token)
            .map(|fields| {
                fields
                    .values()
                    .filter_map(|docs| docs.get(doc_id))
                    .map(|positions| positions.len() as u64)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Number of documents containing `token` in any field.
    fn document_frequency(&self, token: &str) -> usize {
        let Some(fields) = self.postings.get(token) else {
            return 0;
        };
        let mut docs: HashSet<&str> = HashSet::new();
        for by_doc in fields.values() {
            docs.extend(by_doc.keys().map(String::as_str));
        }
        docs.len()
    }

    fn average_doc_length(&self) -> f64 {
        if self.doc_lengths.is_empty() {
            return 0.0;
        }
        self.doc_lengths.values().sum::<u64>() as f64 / self.doc_lengths.len() as f64
    }

    /// BM25 bag-of-words score of `tokens` against one document.
    fn bag_of_words_score(&self, tokens: &[String], doc_id: &str) -> f64 {
        let n = self.doc_count() as f64;
        let avg_len = self.average_doc_length().max(1.0);
        let doc_len = self.doc_lengths.get(doc_id).copied().unwrap_or(0) as f64;

        let mut score = 0.0;
        for token in tokens {
            let tf = self.term_frequency(token, doc_id) as f64;
            if tf == 0.0 {
                continue;
            }
            let df = self.document_frequency(token) as f64;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
            let norm = tf * (self.config.k1 + 1.0)
                / (tf + self.config.k1 * (1.0 - self.config.b + self.config.b * doc_len / avg_len));
            score += idf * norm;
        }
        score
    }

    // --------------------------------------------------------------------------------------------
    // Persistence
    // --------------------------------------------------------------------------------------------

    /// Writes a snapshot of the full index through the backend.
    ///
    /// Layout: JSON snapshot document followed by a 4-byte little-endian
    /// CRC32 of the JSON bytes.
    pub fn persist(&self, backend: &dyn StorageBackend, path: &str) -> Result<(), FtsError> {
        let snapshot = FtsSnapshot {
            version: SNAPSHOT_VERSION,
            config: self.config,
            postings: self
                .postings
                .iter()
                .map(|(token, fields)| {
                    (
                        token.clone(),
                        fields
                            .iter()
                            .map(|(field, docs)| (field.clone(), docs.clone()))
                            .collect(),
                    )
                })
                .collect(),
            doc_lengths: self
                .doc_lengths
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        };
        let mut payload = serde_json::to_vec(&snapshot)
            .map_err(|e| FtsError::CorruptSnapshot(e.to_string()))?;
        let crc = crc32fast::hash(&payload);
        payload.extend_from_slice(&crc.to_le_bytes());
        backend.write(path, &payload)?;
        debug!(path, docs = self.doc_count(), "full-text index persisted");
        Ok(())
    }

    /// Loads a snapshot previously written by [`FtsIndex::persist`].
    pub fn load(backend: &dyn StorageBackend, path: &str) -> Result<Self, FtsError> {
        let bytes = backend.read(path)?;
        if bytes.len() < 4 {
            return Err(FtsError::CorruptSnapshot("snapshot too small".into()));
        }
        let (payload, trailer) = bytes.split_at(bytes.len() - 4);
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        if crc32fast::hash(payload) != stored {
            return Err(FtsError::CorruptSnapshot("checksum mismatch".into()));
        }
        let snapshot: FtsSnapshot = serde_json::from_slice(payload)
            .map_err(|e| FtsError::CorruptSnapshot(e.to_string()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(FtsError::CorruptSnapshot(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let mut index = Self::new(snapshot.config);
        index.postings = snapshot
            .postings
            .into_iter()
            .map(|(token, fields)| (token, fields.into_iter().collect()))
            .collect();
        index.doc_lengths = snapshot.doc_lengths.into_iter().collect();
        Ok(index)
    }
}

/// Splits a query into loose text and quoted phrases.
fn parse_query(query: &str) -> (String, Vec<String>) {
    let mut loose = String::new();
    let mut phrases = Vec::new();
    for (i, segment) in query.split('"').enumerate() {
        if i % 2 == 0 {
            loose.push(' ');
            loose.push_str(segment);
        } else {
            phrases.push(segment.to_string());
        }
    }
    (loose, phrases)
}

/// Descending score, ties by ascending doc id.
fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.doc_id.cmp(&b.doc_id))
    });
}
