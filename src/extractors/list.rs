//! Paginated listing pages: one item element per posting.

use async_trait::async_trait;
use scraper::{Html, Selector};
use url::Url;

use super::{compile, first_text, labelled_text, ExtractError, Extractor, Posting};
use crate::driver::{Browser, Page};
use crate::error::ConfigError;
use crate::normalizer::canonical_url;

/// Selector strings for a listing page. Icon selectors (`svg`) read the label beside the icon.
#[derive(Debug, Clone)]
pub struct ListProfile {
    /// One element per posting.
    pub item: String,
    /// Title inside an item.
    pub title: String,
    /// Organization inside an item.
    pub organization: String,
    /// Location inside an item.
    pub location: String,
    /// Publication time inside an item.
    pub posted: String,
    /// Experience requirement inside an item.
    pub experience: String,
    /// Link to the posting inside an item.
    pub link: String,
}

impl Default for ListProfile {
    fn default() -> Self {
        Self {
            item: r#"li[data-testid="jobs-item"]"#.into(),
            title: "h2".into(),
            organization: r#"[data-testid="jobs-item-company"]"#.into(),
            location: r#"svg[data-testid="RoomRoundedIcon"]"#.into(),
            posted: r#"svg[data-testid="AccessTimeRoundedIcon"]"#.into(),
            experience: r#"svg[data-testid="StarsRoundedIcon"]"#.into(),
            link: "a[href]".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ListSelectors {
    item: Selector,
    title: Selector,
    organization: Selector,
    location: Selector,
    posted: Selector,
    experience: Selector,
    link: Selector,
}

impl ListSelectors {
    pub(crate) fn compile(profile: &ListProfile) -> Result<Self, ConfigError> {
        Ok(Self {
            item: compile(&profile.item)?,
            title: compile(&profile.title)?,
            organization: compile(&profile.organization)?,
            location: compile(&profile.location)?,
            posted: compile(&profile.posted)?,
            experience: compile(&profile.experience)?,
            link: compile(&profile.link)?,
        })
    }
}

/// Parses every item of a listing page. Items without a usable link are skipped.
pub(crate) fn parse_list_page(page: &Page, selectors: &ListSelectors, tag: &str) -> Vec<Posting> {
    let document = Html::parse_document(&page.html);
    let mut postings = Vec::new();
    for item in document.select(&selectors.item) {
        let Some(url) = item
            .select(&selectors.link)
            .filter_map(|a| a.value().attr("href"))
            .find_map(|href| canonical_url(&page.url, href))
        else {
            continue;
        };
        postings.push(Posting {
            id: url.to_string(),
            title: first_text(item, &selectors.title).unwrap_or_default(),
            organization: first_text(item, &selectors.organization),
            location: labelled_text(item, &selectors.location),
            posted: labelled_text(item, &selectors.posted),
            experience: labelled_text(item, &selectors.experience),
            source: tag.to_string(),
            detail: None,
        });
    }
    postings
}

/// URL of listing page `page_number`; page 1 carries no `page` parameter.
pub fn build_page_url(base: &Url, page_number: u32) -> Url {
    let mut url = base.clone();
    let kept: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(key, _)| key != "page")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    url.set_query(None);
    if !kept.is_empty() || page_number > 1 {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in &kept {
            pairs.append_pair(key, value);
        }
        if page_number > 1 {
            pairs.append_pair("page", &page_number.to_string());
        }
    }
    url
}

/// Listing source visited page by page.
pub struct ListExtractor {
    tag: String,
    base: Url,
    pages: u32,
    selectors: ListSelectors,
}

impl ListExtractor {
    /// Creates a listing source covering pages `1..=pages`.
    pub fn new(
        tag: impl Into<String>,
        base: Url,
        pages: u32,
        profile: &ListProfile,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            tag: tag.into(),
            base,
            pages: pages.max(1),
            selectors: ListSelectors::compile(profile)?,
        })
    }
}

#[async_trait]
impl Extractor for ListExtractor {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn visits(&self) -> Vec<Url> {
        (1..=self.pages)
            .map(|page| build_page_url(&self.base, page))
            .collect()
    }

    async fn extract(
        &self,
        browser: &dyn Browser,
        visit: &Url,
    ) -> Result<Vec<Posting>, ExtractError> {
        let page = browser.open(visit).await?;
        Ok(parse_list_page(&page, &self.selectors, &self.tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const LISTING: &str = r#"
        <ul>
          <li data-testid="jobs-item">
            <a href="/offres-d-emploi/automaticien-42#top">
              <h2>Automaticien PLC</h2>
            </a>
            <span data-testid="jobs-item-company">Cevital</span>
            <div><svg data-testid="RoomRoundedIcon"></svg> Béjaïa </div>
            <div><svg data-testid="AccessTimeRoundedIcon"></svg> il y a 2 jours</div>
          </li>
          <li data-testid="jobs-item"><h2>Sans lien</h2></li>
          <li data-testid="jobs-item">
            <a href="https://jobs.test/offres-d-emploi/comptable-7"><h2>Comptable</h2></a>
          </li>
        </ul>"#;

    fn page(html: &str) -> Page {
        Page {
            url: Url::parse("https://jobs.test/offres-d-emploi?page=2").unwrap(),
            status: 200,
            html: html.to_string(),
        }
    }

    #[test]
    fn parses_items_and_skips_linkless_ones() {
        let selectors = ListSelectors::compile(&ListProfile::default()).unwrap();
        let postings = parse_list_page(&page(LISTING), &selectors, "list-1");
        assert_eq!(postings.len(), 2);
        let first = &postings[0];
        assert_eq!(first.id, "https://jobs.test/offres-d-emploi/automaticien-42");
        assert_eq!(first.title, "Automaticien PLC");
        assert_eq!(first.organization.as_deref(), Some("Cevital"));
        assert_eq!(first.location.as_deref(), Some("Béjaïa"));
        assert_eq!(first.posted.as_deref(), Some("il y a 2 jours"));
        assert_eq!(first.experience, None);
        assert_eq!(first.source, "list-1");
        assert_eq!(postings[1].organization, None);
    }

    #[test]
    fn empty_listing_yields_nothing() {
        let selectors = ListSelectors::compile(&ListProfile::default()).unwrap();
        assert!(parse_list_page(&page("<p>Aucune offre</p>"), &selectors, "l").is_empty());
    }

    #[test]
    fn page_urls() {
        let base = Url::parse("https://jobs.test/offres?sector=it&page=9").unwrap();
        assert_eq!(
            build_page_url(&base, 1).as_str(),
            "https://jobs.test/offres?sector=it"
        );
        assert_eq!(
            build_page_url(&base, 3).as_str(),
            "https://jobs.test/offres?sector=it&page=3"
        );
        let bare = Url::parse("https://jobs.test/offres").unwrap();
        assert_eq!(build_page_url(&bare, 1).as_str(), "https://jobs.test/offres");
    }

    #[test]
    fn visits_cover_every_page() {
        let extractor = ListExtractor::new(
            "list",
            Url::parse("https://jobs.test/offres").unwrap(),
            3,
            &ListProfile::default(),
        )
        .unwrap();
        let visits: Vec<String> = extractor.visits().iter().map(Url::to_string).collect();
        assert_eq!(
            visits,
            vec![
                "https://jobs.test/offres",
                "https://jobs.test/offres?page=2",
                "https://jobs.test/offres?page=3",
            ]
        );
    }
}
