//! Run orchestration: one harvest pass from bank construction to ledger flush.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::bank::{load_corpus, RelevanceBank, TermOrigin};
use crate::controls::{Cli, DeliveryPolicy, HarvestControls};
use crate::dispatch::{render_message, Dispatcher, LogNotifier, Notifier, TelegramNotifier};
use crate::driver::{AuthProbe, HttpLauncher, Launcher, Outcome, SessionManager};
use crate::error::{ConfigError, HarvestError};
use crate::extractors::{classify, parse_url, sources_from_cli, DetailExtractor, Extractor};
use crate::frontier::{Collected, FrontierError, PostingFrontier};
use crate::ledger::{JsonFileStore, Ledger, LedgerStore, MemoryStore};
use crate::scorer::{rank, MatchResult, Scorer};

/// Number of bank terms included in a bank report.
pub const BANK_SAMPLE: usize = 40;

/// Single-flight guard shared by every trigger.
#[derive(Debug, Clone, Default)]
pub struct RunLock {
    busy: Arc<AtomicBool>,
}

impl RunLock {
    /// Unlocked lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock, or returns `None` when a run is in flight. Released when the guard drops.
    pub fn try_acquire(&self) -> Option<RunGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard {
                busy: Arc::clone(&self.busy),
            })
    }

    /// Whether a run currently holds the lock.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Holds the [`RunLock`] until dropped.
#[derive(Debug)]
pub struct RunGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunReason {
    /// Command-line invocation.
    Cli,
    /// HTTP trigger.
    Manual,
    /// Schedule tick.
    Scheduled,
}

/// Counters of one completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// Distinct postings collected across sources.
    pub scanned: usize,
    /// Unseen postings that passed scoring.
    pub matched: usize,
    /// Messages acknowledged by the messaging API.
    pub sent: usize,
    /// Messages that failed to deliver.
    pub failed_deliveries: usize,
    /// Postings suppressed by the ledger.
    pub already_seen: usize,
    /// Repeated URLs dropped within the run.
    pub duplicates: usize,
    /// Postings dropped for lacking a URL.
    pub missing_url: usize,
    /// Visits that ended in a transient error.
    pub transient_errors: usize,
    /// Auth-only sources skipped for lack of a signed-in session.
    pub skipped_sources: usize,
    /// Session restarts performed by the self-healing policy.
    pub restarts: u32,
    /// Whether the first session signed in.
    pub authenticated: bool,
    /// Number of terms in the relevance bank.
    pub bank_size: usize,
    /// The ledger could not be read and started empty.
    pub ledger_degraded: bool,
    /// The ledger write at the end of the run failed.
    pub ledger_flush_failed: bool,
    /// Wall-clock duration.
    pub elapsed_ms: u64,
}

/// Bank-only report: size and a sample, no session involved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BankReport {
    /// Total terms.
    pub size: usize,
    /// Seed terms.
    pub seeds: usize,
    /// Corpus terms.
    pub corpus_terms: usize,
    /// First terms of the bank.
    pub sample: Vec<String>,
}

/// Outcome of a trigger as reported to operators.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    /// Whether the run completed.
    pub ok: bool,
    /// When the report was produced.
    pub at: DateTime<Utc>,
    /// What started the run.
    pub reason: RunReason,
    /// FATAL error text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Counters of a completed run.
    #[serde(flatten)]
    pub summary: Option<RunSummary>,
}

impl RunReport {
    /// Builds the report for a finished trigger.
    pub fn new(reason: RunReason, result: &Result<RunSummary, HarvestError>) -> Self {
        let (ok, error, summary) = match result {
            Ok(summary) => (true, None, Some(summary.clone())),
            Err(err) => (false, Some(err.to_string()), None),
        };
        Self {
            ok,
            at: Utc::now(),
            reason,
            error,
            summary,
        }
    }
}

/// The orchestrator: owns configuration and collaborators, runs one pass at a time.
pub struct Harvester {
    controls: HarvestControls,
    seeds: Vec<String>,
    corpus_file: Option<PathBuf>,
    sources: Vec<Box<dyn Extractor>>,
    launcher: Arc<dyn Launcher>,
    ledger_store: Arc<dyn LedgerStore>,
    notifier: Arc<dyn Notifier>,
    enricher: Option<DetailExtractor>,
    lock: RunLock,
}

impl Harvester {
    /// Creates a harvester without sources, seeds, or corpus.
    pub fn new(
        controls: HarvestControls,
        launcher: Arc<dyn Launcher>,
        ledger_store: Arc<dyn LedgerStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            controls,
            seeds: Vec::new(),
            corpus_file: None,
            sources: Vec::new(),
            launcher,
            ledger_store,
            notifier,
            enricher: None,
            lock: RunLock::new(),
        }
    }

    /// Wires every collaborator from the command line.
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let controls = cli.build_controls()?;

        let mut launcher = HttpLauncher::new(cli.identity_profile()?);
        if let Some(path) = &cli.cookie_file {
            launcher = launcher.with_cookie_file(path.clone());
        }
        if let Some(raw) = &cli.auth_probe_url {
            launcher = launcher.with_auth_probe(AuthProbe::new(parse_url(raw)?, &cli.auth_marker)?);
        }

        let ledger_store: Arc<dyn LedgerStore> = match &cli.state_dir {
            Some(dir) => Arc::new(JsonFileStore::in_dir(dir)),
            None => {
                warn!("no state dir configured; sent ledger lives in memory only");
                Arc::new(MemoryStore::new())
            }
        };

        let notifier: Arc<dyn Notifier> = match (&cli.telegram_token, &cli.telegram_chat_id) {
            (Some(token), Some(chat)) if !token.trim().is_empty() && !chat.trim().is_empty() => {
                Arc::new(
                    TelegramNotifier::new(
                        &cli.telegram_api_base,
                        token,
                        chat.trim(),
                        Duration::from_secs(cli.message_timeout_secs.max(1)),
                    )
                    .map_err(|err| ConfigError::Messaging(err.to_string()))?,
                )
            }
            _ => {
                warn!("messaging credentials missing; notifications are only logged");
                Arc::new(LogNotifier)
            }
        };

        let enrich = controls.enrich_details();
        let mut harvester = Self::new(controls, Arc::new(launcher), ledger_store, notifier)
            .with_seeds(cli.seed_terms())
            .with_corpus_file(cli.keywords_file.clone())
            .with_sources(sources_from_cli(cli)?);
        if enrich {
            harvester = harvester.with_enricher(DetailExtractor::enricher()?);
        }
        Ok(harvester)
    }

    /// Seed stems of the relevance bank.
    pub fn with_seeds(mut self, seeds: Vec<String>) -> Self {
        self.seeds = seeds;
        self
    }

    /// Corpus file read at the start of each run.
    pub fn with_corpus_file(mut self, path: PathBuf) -> Self {
        self.corpus_file = Some(path);
        self
    }

    /// Sources in priority order.
    pub fn with_sources(mut self, sources: Vec<Box<dyn Extractor>>) -> Self {
        self.sources = sources;
        self
    }

    /// Fetches each candidate's own page before it is sent.
    pub fn with_enricher(mut self, enricher: DetailExtractor) -> Self {
        self.enricher = Some(enricher);
        self
    }

    /// The lock shared by every trigger of this harvester.
    pub fn lock(&self) -> &RunLock {
        &self.lock
    }

    /// Builds the relevance bank from the seeds and the corpus file.
    pub fn build_bank(&self) -> RelevanceBank {
        let corpus = self
            .corpus_file
            .as_deref()
            .map(load_corpus)
            .unwrap_or_default();
        RelevanceBank::build(&self.seeds, &corpus)
    }

    /// Builds the bank and reports on it without touching any source.
    pub fn bank_report(&self) -> BankReport {
        let bank = self.build_bank();
        let seeds = bank
            .terms()
            .iter()
            .filter(|term| term.origin() == TermOrigin::Seed)
            .count();
        BankReport {
            size: bank.len(),
            seeds,
            corpus_terms: bank.len() - seeds,
            sample: bank.sample(BANK_SAMPLE),
        }
    }

    /// Runs one full pass. Rejects with [`HarvestError::Busy`] while another pass is in flight.
    pub async fn run_once(&self, reason: RunReason) -> Result<RunSummary, HarvestError> {
        let _guard = self.lock.try_acquire().ok_or(HarvestError::Busy)?;
        let started = Instant::now();
        let bank = self.build_bank();
        info!(?reason, bank = bank.len(), sources = self.sources.len(), "run started");

        let mut summary = RunSummary {
            bank_size: bank.len(),
            ..RunSummary::default()
        };
        let mut manager =
            SessionManager::new(Arc::clone(&self.launcher), self.controls.restart_policy());
        let result = self.harvest(&bank, &mut manager, &mut summary).await;
        manager.shutdown().await;
        summary.restarts = manager.restarts();
        summary.elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                info!(
                    scanned = summary.scanned,
                    matched = summary.matched,
                    sent = summary.sent,
                    failed = summary.failed_deliveries,
                    restarts = summary.restarts,
                    elapsed_ms = summary.elapsed_ms,
                    "run finished"
                );
                Ok(summary)
            }
            Err(err) => {
                error!(error = %err, "run aborted");
                Err(err)
            }
        }
    }

    async fn harvest(
        &self,
        bank: &RelevanceBank,
        manager: &mut SessionManager,
        summary: &mut RunSummary,
    ) -> Result<(), HarvestError> {
        summary.authenticated = manager.start().await?;
        let mut ledger = Ledger::load(Arc::clone(&self.ledger_store), self.controls.retention());
        summary.ledger_degraded = ledger.degraded();

        let collected = self.collect(manager, summary).await?;
        let scorer = Scorer::new(bank);
        let mut candidates = Vec::new();
        for Collected { posting, trust } in collected {
            if ledger.seen(&posting.id) {
                summary.already_seen += 1;
                continue;
            }
            if let Some(found) = scorer.score(posting, trust) {
                candidates.push(found);
            }
        }
        summary.matched = candidates.len();
        let picked = rank(candidates, self.controls.send_budget());
        info!(
            matched = summary.matched,
            already_seen = summary.already_seen,
            picked = picked.len(),
            "candidates ranked"
        );

        let delivered = self.deliver(picked, manager, &mut ledger, summary).await;
        if let Err(err) = ledger.flush() {
            warn!(error = %err, "ledger flush failed; this run's deliveries may repeat");
            summary.ledger_flush_failed = true;
        }
        delivered
    }

    async fn collect(
        &self,
        manager: &mut SessionManager,
        summary: &mut RunSummary,
    ) -> Result<Vec<Collected>, HarvestError> {
        let pacing = self.controls.pacing();
        let mut frontier = PostingFrontier::new();
        for source in &self.sources {
            if source.requires_auth() && !manager.is_authenticated() {
                warn!(source = source.tag(), "skipping source that needs a signed-in session");
                summary.skipped_sources += 1;
                continue;
            }
            for visit in source.visits() {
                let result = source.extract(manager.browser()?, &visit).await;
                let outcome = classify(&result);
                match result {
                    Ok(postings) => {
                        debug!(source = source.tag(), %visit, found = postings.len(), "visit done");
                        for posting in postings {
                            match frontier.push(posting, source.trust()) {
                                Ok(()) => {}
                                Err(FrontierError::Duplicate(_)) => summary.duplicates += 1,
                                Err(FrontierError::MissingUrl(posting)) => {
                                    debug!(title = %posting.title, "dropping posting without url");
                                    summary.missing_url += 1;
                                }
                            }
                        }
                    }
                    Err(err) => {
                        if outcome == Outcome::TransientError {
                            summary.transient_errors += 1;
                            warn!(source = source.tag(), %visit, error = %err, "visit failed");
                        } else {
                            debug!(source = source.tag(), %visit, error = %err, "nothing at visit");
                        }
                    }
                }
                manager.record(outcome).await?;
                pacing.pause().await;
            }
        }
        summary.scanned = frontier.len();
        Ok(frontier.into_collected())
    }

    async fn deliver(
        &self,
        picked: Vec<MatchResult>,
        manager: &mut SessionManager,
        ledger: &mut Ledger,
        summary: &mut RunSummary,
    ) -> Result<(), HarvestError> {
        let pacing = self.controls.pacing();
        let policy = self.controls.delivery_policy();
        let mut dispatcher =
            Dispatcher::new(Arc::clone(&self.notifier), self.controls.message_interval());
        for mut found in picked {
            if let Some(enricher) = &self.enricher {
                let outcome = match enricher.enrich(manager.browser()?, &mut found.posting).await {
                    Ok(()) => Outcome::Success,
                    Err(err) => {
                        debug!(url = %found.posting.id, error = %err, "detail enrichment failed");
                        err.outcome()
                    }
                };
                manager.record(outcome).await?;
            }

            let text = render_message(&found);
            match dispatcher.dispatch(&text).await {
                Ok(()) => {
                    summary.sent += 1;
                    ledger.mark(found.posting.id.as_str(), found.posting.title.as_str());
                    debug!(url = %found.posting.id, score = found.score, "notification sent");
                }
                Err(err) => {
                    summary.failed_deliveries += 1;
                    warn!(url = %found.posting.id, error = %err, "delivery failed");
                    if policy == DeliveryPolicy::AtMostOnce {
                        ledger.mark(found.posting.id.as_str(), found.posting.title.as_str());
                    }
                }
            }
            pacing.pause().await;
        }
        Ok(())
    }
}
