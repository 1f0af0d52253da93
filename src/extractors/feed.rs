//! Social feed search results: free-text posts, only readable with a signed-in session.

use async_trait::async_trait;
use scraper::{Html, Selector};
use url::Url;

use super::{compile, element_text, first_text, ExtractError, Extractor, Posting};
use crate::driver::{Browser, Page};
use crate::error::ConfigError;
use crate::normalizer::{canonical_url, truncate_chars};

const TITLE_CHARS: usize = 120;
const BODY_CHARS: usize = 500;

/// Selector strings for a feed page.
#[derive(Debug, Clone)]
pub struct FeedProfile {
    /// One element per post.
    pub post: String,
    /// Post text.
    pub body: String,
    /// Post author.
    pub author: String,
    /// Permalink to the post.
    pub link: String,
}

impl Default for FeedProfile {
    fn default() -> Self {
        Self {
            post: "article, div.feed-shared-update-v2".into(),
            body: ".update-components-text, .feed-shared-text, p".into(),
            author: ".update-components-actor__name, .feed-shared-actor__name, header".into(),
            link: "a[href*='/posts/'], a[href*='/feed/update/']".into(),
        }
    }
}

#[derive(Debug, Clone)]
struct FeedSelectors {
    post: Selector,
    body: Selector,
    author: Selector,
    link: Selector,
}

fn parse_feed_page(page: &Page, selectors: &FeedSelectors, tag: &str) -> Vec<Posting> {
    let document = Html::parse_document(&page.html);
    let mut postings = Vec::new();
    for post in document.select(&selectors.post) {
        let link = post
            .select(&selectors.link)
            .filter_map(|a| a.value().attr("href"))
            .find_map(|href| canonical_url(&page.url, href))
            .or_else(|| {
                let urn = post.value().attr("data-urn")?;
                canonical_url(&page.url, &format!("/feed/update/{urn}/"))
            });
        let Some(url) = link else {
            continue;
        };
        let text = first_text(post, &selectors.body).unwrap_or_else(|| element_text(post));
        if text.is_empty() {
            continue;
        }
        let mut posting = Posting::new(url.to_string(), headline(&text), tag);
        posting.organization = first_text(post, &selectors.author);
        posting.detail = Some(truncate_chars(&text, BODY_CHARS).to_string());
        postings.push(posting);
    }
    postings
}

/// First sentence or line of a post, capped at [`TITLE_CHARS`].
fn headline(text: &str) -> String {
    let end = text
        .char_indices()
        .find(|&(_, c)| matches!(c, '\n' | '.' | '!' | '?'))
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    let line = text[..end].trim();
    let line = if line.is_empty() { text.trim() } else { line };
    truncate_chars(line, TITLE_CHARS).trim_end().to_string()
}

/// Feed source over one or more search result URLs.
pub struct FeedPostExtractor {
    tag: String,
    urls: Vec<Url>,
    selectors: FeedSelectors,
}

impl FeedPostExtractor {
    /// Creates a feed source over `urls`.
    pub fn new(
        tag: impl Into<String>,
        urls: Vec<Url>,
        profile: &FeedProfile,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            tag: tag.into(),
            urls,
            selectors: FeedSelectors {
                post: compile(&profile.post)?,
                body: compile(&profile.body)?,
                author: compile(&profile.author)?,
                link: compile(&profile.link)?,
            },
        })
    }
}

#[async_trait]
impl Extractor for FeedPostExtractor {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn requires_auth(&self) -> bool {
        true
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
        Ok(parse_feed_page(&page, &self.selectors, &self.tag))
    }
}
