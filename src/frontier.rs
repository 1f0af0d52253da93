//! Within-run posting set keyed by canonical URL.

use std::collections::HashSet;

use crate::extractors::{Posting, Trust};

/// Errors that can emerge while adding a posting to the frontier.
#[derive(Debug)]
pub enum FrontierError {
    /// The URL was already collected this run; the first occurrence is kept.
    Duplicate(Posting),
    /// The posting has no URL and cannot be keyed; the caller gets it back.
    MissingUrl(Posting),
}

/// A collected posting together with its source's scoring treatment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collected {
    /// The posting itself.
    pub posting: Posting,
    /// Trust of the source that produced it first.
    pub trust: Trust,
}

/// URL-keyed posting set preserving discovery order. First occurrence wins.
#[derive(Debug, Default)]
pub struct PostingFrontier {
    seen: HashSet<String>,
    collected: Vec<Collected>,
}

impl PostingFrontier {
    /// Constructs a new, empty frontier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a posting, returning it on rejection.
    pub fn push(&mut self, mut posting: Posting, trust: Trust) -> Result<(), FrontierError> {
        let trimmed = posting.id.trim();
        if trimmed.is_empty() {
            return Err(FrontierError::MissingUrl(posting));
        }
        if trimmed.len() != posting.id.len() {
            posting.id = trimmed.to_string();
        }
        if !self.seen.insert(posting.id.clone()) {
            return Err(FrontierError::Duplicate(posting));
        }
        self.collected.push(Collected { posting, trust });
        Ok(())
    }

    /// Distinct postings collected so far.
    pub fn len(&self) -> usize {
        self.collected.len()
    }

    /// True when nothing was collected.
    pub fn is_empty(&self) -> bool {
        self.collected.is_empty()
    }

    /// Consumes the frontier, yielding postings in discovery order.
    pub fn into_collected(self) -> Vec<Collected> {
        self.collected
    }
}
