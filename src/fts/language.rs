//! Language pipelines: capability-plugged stop-word filtering and
//! stemming applied to every token after the base tokenizer.
//!
//! The core ships a no-op pipeline (the default) and a light English
//! pipeline. Hosts with heavier needs implement [`LanguagePipeline`]
//! and hand it to the index.

use serde::{Deserialize, Serialize};

/// Per-token processing hook. Runs after lowercasing, splitting, and
/// minimum-length filtering.
pub trait LanguagePipeline: Send + Sync {
    /// Returns the normalized token, or `None` to drop it entirely
    /// (e.g. a stop word).
    fn process(&self, token: &str) -> Option<String>;
}

/// Built-in pipeline selector, persisted with index snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// No stop words, no stemming.
    #[default]
    None,
    /// English stop words plus plural suffix stripping.
    English,
}

impl Language {
    /// The pipeline implementation for this selector.
    pub fn pipeline(self) -> &'static dyn LanguagePipeline {
        match self {
            Language::None => &NoopPipeline,
            Language::English => &EnglishPipeline,
        }
    }
}

/// Pass-through pipeline: every token is kept verbatim.
pub struct NoopPipeline;

impl LanguagePipeline for NoopPipeline {
    fn process(&self, token: &str) -> Option<String> {
        Some(token.to_string())
    }
}

/// Light English pipeline: drops common function words and strips
/// plural suffixes so "systems" and "system" collapse to one term.
pub struct EnglishPipeline;

/// Sorted for binary search.
const ENGLISH_STOP_WORDS: &[&str] = &[
    "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "had", "has", "have", "he",
    "her", "his", "if", "in", "into", "is", "it", "its", "not", "of", "on", "or", "she", "that",
    "the", "their", "then", "there", "they", "this", "to", "was", "were", "will", "with",
];

impl LanguagePipeline for EnglishPipeline {
    fn process(&self, token: &str) -> Option<String> {
        if ENGLISH_STOP_WORDS.binary_search(&token).is_ok() {
            return None;
        }
        Some(strip_plural(token))
    }
}

/// Plural stripping in the spirit of Porter step 1a, nothing more.
fn strip_plural(token: &str) -> String {
    if let Some(stem) = token.strip_suffix("ies")
        && !stem.is_empty()
    {
        return format!("{stem}y");
    }
    if let Some(stem) = token.strip_suffix("es")
        && (stem.ends_with('x')
            || stem.ends_with('z')
            || stem.ends_with("ch")
            || stem.ends_with("sh")
            || stem.ends_with("ss"))
    {
        return stem.to_string();
    }
    if token.ends_with("ss") || token.ends_with("us") {
        return token.to_string();
    }
    if let Some(stem) = token.strip_suffix('s')
        && stem.len() >= 3
    {
        return stem.to_string();
    }
    token.to_string()
}
