//! Single posting pages, used both as a source and to enrich candidates before dispatch.

use async_trait::async_trait;
use scraper::{Html, Selector};
use url::Url;

use super::{compile, element_text, first_text, ExtractError, Extractor, Posting};
use crate::driver::{Browser, Page};
use crate::error::ConfigError;
use crate::normalizer::truncate_chars;

/// Longest snippet attached to a posting, in characters.
pub const SNIPPET_CHARS: usize = 500;
/// Headings the snippet preferably starts at, in priority order (lowercase).
const SNIPPET_MARKERS: &[&str] = &["responsabil", "compét"];

/// Selector strings for a posting page.
#[derive(Debug, Clone)]
pub struct DetailProfile {
    /// Posting title.
    pub title: String,
    /// Hiring organization.
    pub organization: String,
    /// Main content container; falls back to `body`.
    pub content: String,
}

impl Default for DetailProfile {
    fn default() -> Self {
        Self {
            title: "h1".into(),
            organization: r#"[data-testid="job-company"], .company-name"#.into(),
            content: "main".into(),
        }
    }
}

#[derive(Debug, Clone)]
struct DetailSelectors {
    title: Selector,
    organization: Selector,
    content: Selector,
    body: Selector,
}

/// What a posting page yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DetailView {
    pub(crate) title: Option<String>,
    pub(crate) organization: Option<String>,
    pub(crate) snippet: String,
}

fn parse_detail_page(page: &Page, selectors: &DetailSelectors) -> DetailView {
    let document = Html::parse_document(&page.html);
    let root = document.root_element();
    let text = root
        .select(&selectors.content)
        .next()
        .or_else(|| root.select(&selectors.body).next())
        .map(element_text)
        .unwrap_or_default();
    DetailView {
        title: first_text(root, &selectors.title),
        organization: first_text(root, &selectors.organization),
        snippet: snippet(&text),
    }
}

/// Up to [`SNIPPET_CHARS`] characters, starting at the first marker heading when present.
pub(crate) fn snippet(text: &str) -> String {
    let start = SNIPPET_MARKERS
        .iter()
        .find_map(|marker| find_ignore_case(text, marker))
        .unwrap_or(0);
    truncate_chars(&text[start..], SNIPPET_CHARS).trim().to_string()
}

fn find_ignore_case(text: &str, marker: &str) -> Option<usize> {
    text.char_indices()
        .map(|(idx, _)| idx)
        .find(|&idx| starts_with_ignore_case(&text[idx..], marker))
}

fn starts_with_ignore_case(text: &str, marker: &str) -> bool {
    let mut chars = text.chars().flat_map(char::to_lowercase);
    marker.chars().all(|expected| chars.next() == Some(expected))
}

/// Source made of explicit posting URLs, one posting per page.
pub struct DetailExtractor {
    tag: String,
    urls: Vec<Url>,
    selectors: DetailSelectors,
}

impl DetailExtractor {
    /// Creates a detail source over `urls`.
    pub fn new(
        tag: impl Into<String>,
        urls: Vec<Url>,
        profile: &DetailProfile,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            tag: tag.into(),
            urls,
            selectors: DetailSelectors {
                title: compile(&profile.title)?,
                organization: compile(&profile.organization)?,
                content: compile(&profile.content)?,
                body: compile("body")?,
            },
        })
    }

    /// A detail reader with the default profile and no URLs of its own, for enrichment.
    pub fn enricher() -> Result<Self, ConfigError> {
        Self::new("detail", Vec::new(), &DetailProfile::default())
    }

    /// Loads the posting's own page and attaches its snippet.
    ///
    /// Listing data wins over page data; the page only fills gaps.
    pub async fn enrich(
        &self,
        browser: &dyn Browser,
        posting: &mut Posting,
    ) -> Result<(), ExtractError> {
        let url = Url::parse(&posting.id).map_err(|_| ExtractError::NotFound {
            url: posting.id.clone(),
        })?;
        let page = browser.open(&url).await?;
        let view = parse_detail_page(&page, &self.selectors);
        if posting.title.is_empty() {
            posting.title = view.title.unwrap_or_default();
        }
        if posting.organization.is_none() {
            posting.organization = view.organization;
        }
        if !view.snippet.is_empty() {
            posting.detail = Some(view.snippet);
        }
        Ok(())
    }
}

#[async_trait]
impl Extractor for DetailExtractor {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn visits(&self) -> Vec<Url> {
        self.urls.clone()
    }

    async fn extract(
        &self,
        browser: &dyn Browser,
        visit: &Url,
    ) -> Result<Vec<Posting>, ExtractError> {
        let page = browser.open(visit).await?;
        let view = parse_detail_page(&page, &self.selectors);
        let Some(title) = view.title else {
            return Err(ExtractError::NotFound {
                url: visit.to_string(),
            });
        };
        let mut id = visit.clone();
        id.set_fragment(None);
        Ok(vec![Posting {
            id: id.to_string(),
            title,
            organization: view.organization,
            location: None,
            posted: None,
            experience: None,
            source: self.tag.clone(),
            detail: (!view.snippet.is_empty()).then_some(view.snippet),
        }])
    }
}
