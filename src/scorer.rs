//! Keyword relevance scoring and candidate ranking.

use crate::bank::{RelevanceBank, TermOrigin};
use crate::extractors::{Posting, Trust};
use crate::normalizer::normalize;

/// Number of hit terms reported per match.
pub const DEFAULT_HIT_CAP: usize = 10;
/// Corpus-derived terms shorter than this (in normalized chars) never match.
pub const MIN_CORPUS_TERM_CHARS: usize = 3;
/// Score assigned to postings from trusted sources; above any keyword-derived score.
pub const TRUSTED_SCORE: u32 = u32::MAX;
/// Hit tag reported for trusted postings in place of keyword hits.
pub const TRUSTED_TAG: &str = "trusted-source";

/// Keyword hits for one haystack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hits {
    /// First matched terms (display spelling), capped.
    pub terms: Vec<String>,
    /// Total number of matching bank terms.
    pub count: u32,
}

/// A scored posting awaiting ranking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    /// The matched posting.
    pub posting: Posting,
    /// Ordered hit terms, capped for message size.
    pub hit_terms: Vec<String>,
    /// Hit count, or [`TRUSTED_SCORE`] for trusted sources.
    pub score: u32,
}

/// Scores haystacks against an immutable bank.
#[derive(Debug, Clone)]
pub struct Scorer<'a> {
    bank: &'a RelevanceBank,
    hit_cap: usize,
}

impl<'a> Scorer<'a> {
    /// Creates a scorer with the default hit cap.
    pub fn new(bank: &'a RelevanceBank) -> Self {
        Self {
            bank,
            hit_cap: DEFAULT_HIT_CAP,
        }
    }

    /// Overrides how many hit terms are reported.
    pub fn with_hit_cap(mut self, hit_cap: usize) -> Self {
        self.hit_cap = hit_cap;
        self
    }

    /// Counts every bank term contained in `haystack`, reporting the first `hit_cap` of them.
    pub fn hits(&self, haystack: &str) -> Hits {
        let haystack = normalize(haystack);
        let mut hits = Hits::default();
        if haystack.is_empty() {
            return hits;
        }
        for term in self.bank.terms() {
            let needle = term.normalized();
            if term.origin() == TermOrigin::Corpus && needle.chars().count() < MIN_CORPUS_TERM_CHARS
            {
                continue;
            }
            if haystack.contains(needle) {
                hits.count += 1;
                if hits.terms.len() < self.hit_cap {
                    hits.terms.push(term.display().to_string());
                }
            }
        }
        hits
    }

    /// Scores a posting, returning `None` when it is not relevant.
    pub fn score(&self, posting: Posting, trust: Trust) -> Option<MatchResult> {
        if trust == Trust::Trusted {
            return Some(MatchResult {
                posting,
                hit_terms: vec![TRUSTED_TAG.to_string()],
                score: TRUSTED_SCORE,
            });
        }
        let hits = self.hits(&posting.haystack());
        (hits.count > 0).then(|| MatchResult {
            posting,
            hit_terms: hits.terms,
            score: hits.count,
        })
    }
}

/// Sorts by score descending, keeping discovery order among ties, and keeps the top `budget`.
pub fn rank(mut matches: Vec<MatchResult>, budget: usize) -> Vec<MatchResult> {
    matches.sort_by(|a, b| b.score.cmp(&a.score));
    matches.truncate(budget);
    matches
}
