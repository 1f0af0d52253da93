//! Curated employer catalog. Every posting an entry's page lists is relevant by construction.

use std::fs;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use super::list::{parse_list_page, ListProfile, ListSelectors};
use super::{ExtractError, Extractor, Posting, Trust};
use crate::driver::Browser;
use crate::error::ConfigError;
use crate::normalizer::normalize;

/// One employer of the catalog file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CatalogEntry {
    /// Employer name.
    #[serde(alias = "company_name")]
    pub name: String,
    /// Page listing the employer's open postings.
    #[serde(default)]
    pub url: Option<String>,
    /// Registered location.
    #[serde(default)]
    pub location: Option<String>,
}

/// Employers whose postings skip keyword scoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmployerCatalog {
    entries: Vec<CatalogEntry>,
}

impl EmployerCatalog {
    /// Reads a JSON array of entries, or an object with the array under `data`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let fail = |message: String| ConfigError::Catalog {
            path: path.to_path_buf(),
            message,
        };
        let raw = fs::read_to_string(path).map_err(|err| fail(err.to_string()))?;
        let value: serde_json::Value =
            serde_json::from_str(&raw).map_err(|err| fail(err.to_string()))?;
        let list = match value {
            serde_json::Value::Object(mut map) => map
                .remove("data")
                .ok_or_else(|| fail("object without a `data` array".into()))?,
            other => other,
        };
        let entries: Vec<CatalogEntry> =
            serde_json::from_value(list).map_err(|err| fail(err.to_string()))?;
        debug!(path = %path.display(), entries = entries.len(), "catalog loaded");
        Ok(Self { entries })
    }

    /// Wraps already decoded entries.
    pub fn from_entries(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    /// Keeps entries whose name or location contains one of `markers`, accent and case
    /// insensitively. No markers keeps everything.
    pub fn retain_markers(&mut self, markers: &[String]) {
        let markers: Vec<String> = markers
            .iter()
            .map(|marker| normalize(marker))
            .filter(|marker| !marker.is_empty())
            .collect();
        if markers.is_empty() {
            return;
        }
        self.entries.retain(|entry| {
            let name = normalize(&entry.name);
            let location = entry.location.as_deref().map(normalize).unwrap_or_default();
            markers
                .iter()
                .any(|marker| name.contains(marker.as_str()) || location.contains(marker.as_str()))
        });
    }

    /// Entries in file order.
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the catalog has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Trusted source walking each catalog entry's listing page.
pub struct TrustedCatalogExtractor {
    tag: String,
    pages: Vec<(Url, String)>,
    selectors: ListSelectors,
}

impl TrustedCatalogExtractor {
    /// Creates the source. Entries without a parseable URL are left out.
    pub fn new(
        tag: impl Into<String>,
        catalog: EmployerCatalog,
        profile: &ListProfile,
    ) -> Result<Self, ConfigError> {
        let mut pages = Vec::with_capacity(catalog.len());
        for entry in catalog.entries {
            let Some(raw) = entry.url.as_deref() else {
                continue;
            };
            match Url::parse(raw.trim()) {
                Ok(url) => pages.push((url, entry.name)),
                Err(err) => warn!(employer = %entry.name, url = raw, error = %err, "skipping catalog entry"),
            }
        }
        Ok(Self {
            tag: tag.into(),
            pages,
            selectors: ListSelectors::compile(profile)?,
        })
    }

    fn employer_for(&self, visit: &Url) -> Option<&str> {
        self.pages
            .iter()
            .find(|(url, _)| url == visit)
            .map(|(_, name)| name.as_str())
    }
}

#[async_trait]
impl Extractor for TrustedCatalogExtractor {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn trust(&self) -> Trust {
        Trust::Trusted
    }

    fn visits(&self) -> Vec<Url> {
        self.pages.iter().map(|(url, _)| url.clone()).collect()
    }

    async fn extract(
        &self,
        browser: &dyn Browser,
        visit: &Url,
    ) -> Result<Vec<Posting>, ExtractError> {
        let page = browser.open(visit).await?;
        let mut postings = parse_list_page(&page, &self.selectors, &self.tag);
        if let Some(employer) = self.employer_for(visit) {
            for posting in &mut postings {
                if posting.organization.is_none() {
                    posting.organization = Some(employer.to_string());
                }
            }
        }
        Ok(postings)
    }
}
