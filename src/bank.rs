//! Relevance bank construction from operator seeds and a site-vocabulary corpus.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde_json::Value;
use tracing::{info, warn};

use crate::normalizer::normalize;

/// Industrial automation / electrical maintenance stems used when no seeds are configured.
pub const DEFAULT_SEEDS: &[&str] = &[
    "automat",
    "automatis",
    "plc",
    "api",
    "scada",
    "hmi",
    "siemens",
    "schneider",
    "abb",
    "omron",
    "maintenance",
    "electr",
    "électr",
    "electromecan",
    "électromécan",
    "instrument",
    "metrologie",
    "mécan",
    "mecan",
    "industrial",
    "industrie",
    "energi",
    "énergie",
    "technicien",
    "ingénieur",
    "ingenieur",
];

/// Where a bank term came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermOrigin {
    /// Operator-supplied seed stem.
    Seed,
    /// Corpus term containing at least one seed.
    Corpus,
}

/// One matching term, keeping its display spelling alongside the normal form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankTerm {
    display: String,
    normalized: String,
    origin: TermOrigin,
}

impl BankTerm {
    /// Original spelling, used in outbound messages.
    pub fn display(&self) -> &str {
        &self.display
    }

    /// Normal form used for substring tests.
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// Whether the term is a seed or a corpus expansion.
    pub fn origin(&self) -> TermOrigin {
        self.origin
    }
}

/// Immutable vocabulary for one run, iterated in insertion order.
#[derive(Debug, Clone, Default)]
pub struct RelevanceBank {
    terms: Vec<BankTerm>,
}

impl RelevanceBank {
    /// Expands `seeds` with every corpus term that contains a normalized seed.
    ///
    /// Seeds come first, followed by corpus matches in corpus order. Entries are de-duplicated on
    /// their normal form; the first spelling wins.
    pub fn build<S, C>(seeds: &[S], corpus: &[C]) -> Self
    where
        S: AsRef<str>,
        C: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut terms = Vec::new();
        let mut stems = Vec::new();

        for seed in seeds {
            let display = seed.as_ref().trim();
            let normalized = normalize(display);
            if normalized.is_empty() {
                continue;
            }
            stems.push(normalized.clone());
            if seen.insert(normalized.clone()) {
                terms.push(BankTerm {
                    display: display.to_string(),
                    normalized,
                    origin: TermOrigin::Seed,
                });
            }
        }

        for entry in corpus {
            let display = entry.as_ref().trim();
            let normalized = normalize(display);
            if normalized.is_empty() || !stems.iter().any(|stem| normalized.contains(stem.as_str())) {
                continue;
            }
            if seen.insert(normalized.clone()) {
                terms.push(BankTerm {
                    display: display.to_string(),
                    normalized,
                    origin: TermOrigin::Corpus,
                });
            }
        }

        Self { terms }
    }

    /// All terms in stable iteration order.
    pub fn terms(&self) -> &[BankTerm] {
        &self.terms
    }

    /// Number of distinct terms.
    pub fn len(&self) -> usize {
        self.terms.len()
    }

    /// True when no seed survived normalization.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Normalization-insensitive membership test.
    pub fn contains(&self, term: &str) -> bool {
        let needle = normalize(term);
        self.terms.iter().any(|t| t.normalized == needle)
    }

    /// First `limit` display spellings, for reports.
    pub fn sample(&self, limit: usize) -> Vec<String> {
        self.terms
            .iter()
            .take(limit)
            .map(|term| term.display.clone())
            .collect()
    }
}

/// Splits a comma separated seed list, dropping blanks.
pub fn parse_seed_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Extracts corpus strings from a decoded JSON document.
///
/// Accepts a top-level array, or an object holding a `data` or `keywords` array. Numbers are
/// stringified; other shapes yield an empty corpus.
pub fn corpus_from_json(value: &Value) -> Vec<String> {
    let items = match value {
        Value::Array(items) => Some(items),
        Value::Object(map) => map
            .get("data")
            .and_then(Value::as_array)
            .or_else(|| map.get("keywords").and_then(Value::as_array)),
        _ => None,
    };
    items
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.trim().to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Reads the corpus file, degrading to an empty corpus when it is missing or corrupt.
pub fn load_corpus(path: &Path) -> Vec<String> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "keyword corpus unreadable; using empty corpus");
            return Vec::new();
        }
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(value) => {
            let corpus = corpus_from_json(&value);
            info!(path = %path.display(), terms = corpus.len(), "loaded keyword corpus");
            corpus
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "keyword corpus is not valid JSON; using empty corpus");
            Vec::new()
        }
    }
}
