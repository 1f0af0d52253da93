//! Per-source extraction contract and its variants.
//!
//! An extractor is a plan of visits plus a way to turn one visited page into postings. The
//! runtime pulls visits one at a time through the [`SessionManager`](crate::driver::SessionManager),
//! so a source is only fetched as far as the run gets, and every visit re-fetches.

use async_trait::async_trait;
use scraper::{ElementRef, Selector};
use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::controls::Cli;
use crate::driver::{Browser, DriverError, Outcome};
use crate::error::ConfigError;
use crate::normalizer::collapse_whitespace;

pub mod catalog;
pub mod detail;
pub mod feed;
pub mod list;

pub use catalog::{CatalogEntry, EmployerCatalog, TrustedCatalogExtractor};
pub use detail::{DetailExtractor, DetailProfile};
pub use feed::{FeedPostExtractor, FeedProfile};
pub use list::{build_page_url, ListExtractor, ListProfile};

/// One discovered posting. `id` is the canonical URL and the dedupe key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Posting {
    /// Canonical URL.
    pub id: String,
    /// Posting title.
    pub title: String,
    /// Hiring organization.
    pub organization: Option<String>,
    /// Location text as displayed by the source.
    pub location: Option<String>,
    /// Relative or absolute publication time, as displayed.
    pub posted: Option<String>,
    /// Experience requirement, as displayed.
    pub experience: Option<String>,
    /// Tag of the source that produced it.
    pub source: String,
    /// Detail text snippet, when fetched.
    pub detail: Option<String>,
}

impl Posting {
    /// Creates a posting with only the mandatory fields.
    pub fn new(id: impl Into<String>, title: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            organization: None,
            location: None,
            posted: None,
            experience: None,
            source: source.into(),
            detail: None,
        }
    }

    /// Sets the organization.
    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    /// Sets the location.
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Text matched against the relevance bank.
    pub fn haystack(&self) -> String {
        [
            Some(self.title.as_str()),
            self.organization.as_deref(),
            self.location.as_deref(),
            self.detail.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ")
    }
}

/// Whether a source's postings are keyword-scored or relevant by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trust {
    /// Keep only postings with at least one bank hit.
    Scored,
    /// Keep every posting with a fixed top score.
    Trusted,
}

/// Extraction failures for one visit.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The visited page does not exist (any more).
    #[error("nothing at {url}")]
    NotFound {
        /// Visited URL.
        url: String,
    },
    /// The session failed to load the page.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl ExtractError {
    /// Self-healing classification of this failure.
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::NotFound { .. } => Outcome::NotApplicable,
            Self::Driver(err) if err.is_not_found() => Outcome::NotApplicable,
            Self::Driver(_) => Outcome::TransientError,
        }
    }
}

/// Classifies a visit result for the [`SessionManager`](crate::driver::SessionManager).
pub fn classify(result: &Result<Vec<Posting>, ExtractError>) -> Outcome {
    match result {
        Ok(postings) if postings.is_empty() => Outcome::NotApplicable,
        Ok(_) => Outcome::Success,
        Err(err) => err.outcome(),
    }
}

/// A source of postings.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Short tag stamped on every posting.
    fn tag(&self) -> &str;

    /// Scoring treatment of this source.
    fn trust(&self) -> Trust {
        Trust::Scored
    }

    /// Sources that only work with a signed-in session.
    fn requires_auth(&self) -> bool {
        false
    }

    /// Pages to visit, in order.
    fn visits(&self) -> Vec<Url>;

    /// Loads `visit` with the current session and parses its postings.
    async fn extract(&self, browser: &dyn Browser, visit: &Url)
        -> Result<Vec<Posting>, ExtractError>;
}

/// Builds the configured sources in priority order: catalog, listings, feeds, detail pages.
pub fn sources_from_cli(cli: &Cli) -> Result<Vec<Box<dyn Extractor>>, ConfigError> {
    let mut sources: Vec<Box<dyn Extractor>> = Vec::new();

    if let Some(path) = &cli.catalog_file {
        let mut catalog = EmployerCatalog::load(path)?;
        catalog.retain_markers(&cli.catalog_marker_list());
        sources.push(Box::new(TrustedCatalogExtractor::new(
            "catalog",
            catalog,
            &ListProfile::default(),
        )?));
    }
    for (idx, raw) in cli.list_urls.iter().enumerate() {
        sources.push(Box::new(ListExtractor::new(
            format!("list-{}", idx + 1),
            parse_url(raw)?,
            cli.pages,
            &ListProfile::default(),
        )?));
    }
    if !cli.feed_urls.is_empty() {
        let urls = cli
            .feed_urls
            .iter()
            .map(|raw| parse_url(raw))
            .collect::<Result<Vec<_>, _>>()?;
        sources.push(Box::new(FeedPostExtractor::new(
            "feed",
            urls,
            &FeedProfile::default(),
        )?));
    }
    if !cli.detail_urls.is_empty() {
        let urls = cli
            .detail_urls
            .iter()
            .map(|raw| parse_url(raw))
            .collect::<Result<Vec<_>, _>>()?;
        sources.push(Box::new(DetailExtractor::new(
            "detail",
            urls,
            &DetailProfile::default(),
        )?));
    }
    Ok(sources)
}

pub(crate) fn parse_url(raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw.trim()).map_err(|source| ConfigError::Url {
        value: raw.to_string(),
        source,
    })
}

pub(crate) fn compile(selector: &str) -> Result<Selector, ConfigError> {
    Selector::parse(selector).map_err(|err| ConfigError::Selector {
        selector: selector.to_string(),
        message: err.to_string(),
    })
}

/// Visible text of an element with whitespace collapsed.
pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<Vec<_>>().join(" "))
}

/// Text of the first match of `selector` inside `scope`, if non-empty.
pub(crate) fn first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope
        .select(selector)
        .map(element_text)
        .find(|text| !text.is_empty())
}

/// Like [`first_text`], but an `svg` match stands for the label next to an icon: the text of
/// its closest enclosing `div` is returned instead.
pub(crate) fn labelled_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    let found = scope.select(selector).next()?;
    let target = if found.value().name() == "svg" {
        found
            .ancestors()
            .filter_map(ElementRef::wrap)
            .find(|el| el.value().name() == "div")?
    } else {
        found
    };
    let text = element_text(target);
    (!text.is_empty()).then_some(text)
}
