//! Keyword corpus harvesting.
//!
//! Walks every fixed-length prefix over [`CHARSET`], asks the site's suggestion endpoint for
//! completions, and keeps the strings that pass [`is_good_keyword`]. The output file doubles as
//! the scan state: it is rewritten every few prefixes, and a resumed scan continues from the
//! recorded index. The file is the corpus the relevance bank reads.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::bank::corpus_from_json;
use crate::controls::PacingWindow;
use crate::driver::{Outcome, Page, SessionError, SessionManager};
use crate::error::ConfigError;
use crate::extractors::compile;
use crate::normalizer::{collapse_whitespace, is_good_keyword};

/// Characters each prefix position ranges over.
pub const CHARSET: &str = "abcdefghijklmnopqrstuvwxyz0123456789àâäçéèêëîïôöùûüÿœ";

/// Suggestion items when the endpoint answers with HTML instead of JSON.
pub const DEFAULT_OPTION_SELECTOR: &str = r#"ul[role="listbox"] li[role="option"]"#;

/// Every string of exactly `len` characters over [`CHARSET`], in a stable order.
pub fn prefixes(len: usize) -> Vec<String> {
    let mut out = vec![String::new()];
    for _ in 0..len {
        out = out
            .iter()
            .flat_map(|prefix| CHARSET.chars().map(move |ch| format!("{prefix}{ch}")))
            .collect();
    }
    out
}

/// Raw suggestion strings in a response: every string leaf of a JSON body, or the option
/// elements of an HTML one.
pub fn suggestions_in(page: &Page, option: &Selector) -> Vec<String> {
    match serde_json::from_str::<Value>(page.html.trim()) {
        Ok(value) => {
            let mut out = Vec::new();
            collect_strings(&value, &mut out);
            out
        }
        Err(_) => Html::parse_document(&page.html)
            .select(option)
            .map(|el| collapse_whitespace(&el.text().collect::<String>()))
            .filter(|text| !text.is_empty())
            .collect(),
    }
}

fn collect_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if !s.contains("http") && !s.contains(['<', '{', '}']) {
                out.push(s.to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_strings(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_strings(item, out)),
        _ => {}
    }
}

/// Suggestion endpoint: `base` with the prefix in query parameter `param`.
#[derive(Debug, Clone)]
pub struct SuggestEndpoint {
    base: Url,
    param: String,
}

impl SuggestEndpoint {
    /// Endpoint at `base`; any existing `param` value is replaced per prefix.
    pub fn new(base: Url, param: impl Into<String>) -> Self {
        Self {
            base,
            param: param.into(),
        }
    }

    /// URL asking for completions of `prefix`.
    pub fn url_for(&self, prefix: &str) -> Url {
        let mut url = self.base.clone();
        let kept: Vec<(String, String)> = self
            .base
            .query_pairs()
            .filter(|(key, _)| key != self.param.as_str())
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        url.set_query(None);
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &kept {
                pairs.append_pair(key, value);
            }
            pairs.append_pair(&self.param, prefix);
        }
        url
    }
}

/// Where a scan stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanProgress {
    /// Index of the next prefix to visit.
    pub index: usize,
    /// Last prefix visited.
    #[serde(default)]
    pub last_prefix: Option<String>,
    /// Prefix length the index refers to.
    pub prefix_len: usize,
}

/// On-disk corpus: `{scrapedAt, count, data, progress}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorpusFile {
    /// Time of the last write.
    pub scraped_at: DateTime<Utc>,
    /// Number of keywords.
    pub count: usize,
    /// Keywords, sorted case-insensitively.
    pub data: Vec<String>,
    /// Scan position at the last write.
    pub progress: ScanProgress,
}

/// Counters of one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    /// Prefixes visited by this scan.
    pub processed: usize,
    /// Keywords that were new to the corpus.
    pub added: usize,
    /// Corpus size at the end.
    pub total: usize,
    /// Visits that ended in a transient error.
    pub failed: usize,
    /// Index a resumed scan starts from.
    pub next_index: usize,
    /// Session restarts performed along the way.
    pub restarts: u32,
}

/// Scan failures. Progress made before the failure is saved first.
#[derive(Debug, Error)]
pub enum CorpusError {
    /// No browser session could be obtained.
    #[error("driver session unavailable: {0}")]
    Session(#[from] SessionError),
    /// The output file could not be written.
    #[error("corpus io error on {path}: {source}")]
    Io {
        /// Output file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The corpus could not be serialized.
    #[error("corpus serialization failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Prefix scan over a suggestion endpoint.
pub struct CorpusScan {
    endpoint: SuggestEndpoint,
    output: PathBuf,
    prefix_len: usize,
    max_prefixes: usize,
    save_every: usize,
    pacing: PacingWindow,
    resume: bool,
    option: Selector,
}

impl CorpusScan {
    /// Scan writing to `output`: two-character prefixes, at most 2500 per scan, saved every 25.
    pub fn new(endpoint: SuggestEndpoint, output: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        Ok(Self {
            endpoint,
            output: output.into(),
            prefix_len: 2,
            max_prefixes: 2500,
            save_every: 25,
            pacing: PacingWindow::new(
                std::time::Duration::from_millis(180),
                std::time::Duration::from_millis(420),
            )?,
            resume: false,
            option: compile(DEFAULT_OPTION_SELECTOR)?,
        })
    }

    /// Length of every prefix (at least 1).
    pub fn with_prefix_len(mut self, len: usize) -> Self {
        self.prefix_len = len.max(1);
        self
    }

    /// Prefixes visited by one scan.
    pub fn with_max_prefixes(mut self, max: usize) -> Self {
        self.max_prefixes = max;
        self
    }

    /// Rewrites the output every `every` prefixes (at least 1).
    pub fn with_save_every(mut self, every: usize) -> Self {
        self.save_every = every.max(1);
        self
    }

    /// Pause after each prefix.
    pub fn with_pacing(mut self, pacing: PacingWindow) -> Self {
        self.pacing = pacing;
        self
    }

    /// Continue from the index recorded in the output file.
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Selector for HTML suggestion items.
    pub fn with_option_selector(mut self, selector: &str) -> Result<Self, ConfigError> {
        self.option = compile(selector)?;
        Ok(self)
    }

    /// Runs the scan on a fresh session and closes it afterwards.
    pub async fn run(&self, manager: &mut SessionManager) -> Result<ScanReport, CorpusError> {
        let result = self.scan(manager).await;
        manager.shutdown().await;
        let mut report = result?;
        report.restarts = manager.restarts();
        Ok(report)
    }

    async fn scan(&self, manager: &mut SessionManager) -> Result<ScanReport, CorpusError> {
        let prefixes = prefixes(self.prefix_len);
        let (mut keywords, progress) = read_existing(&self.output);
        let start = match progress {
            Some(progress) if self.resume && progress.prefix_len == self.prefix_len => {
                progress.index.min(prefixes.len())
            }
            _ => 0,
        };
        info!(
            prefixes = prefixes.len(),
            start,
            known = keywords.len(),
            output = %self.output.display(),
            "corpus scan started"
        );

        manager.start().await?;
        let mut report = ScanReport {
            next_index: start,
            ..ScanReport::default()
        };
        let mut last_prefix = None;
        for (index, prefix) in prefixes
            .iter()
            .enumerate()
            .skip(start)
            .take(self.max_prefixes)
        {
            let url = self.endpoint.url_for(prefix);
            let (outcome, found) = match manager.browser()?.open(&url).await {
                Ok(page) => {
                    let found = suggestions_in(&page, &self.option);
                    let outcome = if found.is_empty() {
                        Outcome::NotApplicable
                    } else {
                        Outcome::Success
                    };
                    (outcome, found)
                }
                Err(err) if err.is_not_found() => (Outcome::NotApplicable, Vec::new()),
                Err(err) => {
                    warn!(prefix = %prefix, error = %err, "suggestion request failed");
                    report.failed += 1;
                    (Outcome::TransientError, Vec::new())
                }
            };
            let added = merge(&mut keywords, found);
            report.processed += 1;
            report.added += added;
            report.next_index = index + 1;
            last_prefix = Some(prefix.clone());
            if added > 0 {
                debug!(prefix = %prefix, added, total = keywords.len(), "new keywords");
            }

            if let Err(err) = manager.record(outcome).await {
                self.save(&keywords, report.next_index, last_prefix)?;
                return Err(err.into());
            }
            if report.processed % self.save_every == 0 {
                self.save(&keywords, report.next_index, last_prefix.clone())?;
                info!(
                    processed = report.processed,
                    total = keywords.len(),
                    prefix = %prefix,
                    "corpus progress saved"
                );
            }
            self.pacing.pause().await;
        }

        self.save(&keywords, report.next_index, last_prefix)?;
        report.total = keywords.len();
        info!(
            processed = report.processed,
            added = report.added,
            total = report.total,
            "corpus scan finished"
        );
        Ok(report)
    }

    fn save(
        &self,
        keywords: &BTreeMap<String, String>,
        index: usize,
        last_prefix: Option<String>,
    ) -> Result<(), CorpusError> {
        let file = CorpusFile {
            scraped_at: Utc::now(),
            count: keywords.len(),
            data: keywords.values().cloned().collect(),
            progress: ScanProgress {
                index,
                last_prefix,
                prefix_len: self.prefix_len,
            },
        };
        let io = |source: std::io::Error| CorpusError::Io {
            path: self.output.clone(),
            source,
        };
        if let Some(parent) = self.output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io)?;
        }
        let tmp = self.output.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&file)?).map_err(io)?;
        fs::rename(&tmp, &self.output).map_err(io)
    }
}

/// Keyed by lowercase spelling; the first spelling seen wins.
fn merge(keywords: &mut BTreeMap<String, String>, found: Vec<String>) -> usize {
    let mut added = 0;
    for raw in found {
        if !is_good_keyword(&raw) {
            continue;
        }
        let keyword = collapse_whitespace(&raw);
        if let Entry::Vacant(slot) = keywords.entry(keyword.to_lowercase()) {
            slot.insert(keyword);
            added += 1;
        }
    }
    added
}

fn read_existing(path: &Path) -> (BTreeMap<String, String>, Option<ScanProgress>) {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return (BTreeMap::new(), None),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "existing corpus unreadable, starting fresh");
            return (BTreeMap::new(), None);
        }
    };
    let Ok(value) = serde_json::from_str::<Value>(&raw) else {
        warn!(path = %path.display(), "existing corpus is not JSON, starting fresh");
        return (BTreeMap::new(), None);
    };
    let mut keywords = BTreeMap::new();
    merge(&mut keywords, corpus_from_json(&value));
    let progress = value
        .get("progress")
        .cloned()
        .and_then(|progress| serde_json::from_value(progress).ok());
    (keywords, progress)
}
