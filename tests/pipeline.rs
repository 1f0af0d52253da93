use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jobharvest::dispatch::DeliveryError;
use jobharvest::driver::{Browser, DriverError, Launcher, Page, RestartPolicy};
use jobharvest::error::{HarvestError, LedgerError};
use jobharvest::extractors::{
    CatalogEntry, DetailExtractor, DetailProfile, EmployerCatalog, Extractor, FeedPostExtractor,
    FeedProfile, ListExtractor, ListProfile, TrustedCatalogExtractor,
};
use jobharvest::ledger::{JsonFileStore, LedgerFile, LedgerStore, MemoryStore};
use jobharvest::{
    DeliveryPolicy, HarvestControls, Harvester, Notifier, PacingWindow, RunReason, RunSummary,
};
use pretty_assertions::assert_eq;
use url::Url;

#[derive(Clone)]
enum Reply {
    Html(String),
    Status(u16),
}

#[derive(Default)]
struct Site {
    pages: HashMap<String, Reply>,
}

impl Site {
    fn page(mut self, url: &str, html: &str) -> Self {
        self.pages.insert(url.to_string(), Reply::Html(html.to_string()));
        self
    }

    fn status(mut self, url: &str, status: u16) -> Self {
        self.pages.insert(url.to_string(), Reply::Status(status));
        self
    }
}

struct FakeBrowser {
    site: Arc<Site>,
    visits: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn open(&self, url: &Url) -> Result<Page, DriverError> {
        self.visits.lock().unwrap().push(url.to_string());
        match self.site.pages.get(url.as_str()) {
            Some(Reply::Html(html)) => Ok(Page {
                url: url.clone(),
                status: 200,
                html: html.clone(),
            }),
            Some(Reply::Status(status)) => Err(DriverError::Status {
                url: url.to_string(),
                status: *status,
            }),
            None => Err(DriverError::Status {
                url: url.to_string(),
                status: 404,
            }),
        }
    }

    async fn close(&self) -> Result<(), DriverError> {
        Ok(())
    }
}

struct FakeLauncher {
    site: Arc<Site>,
    visits: Arc<Mutex<Vec<String>>>,
    launches: AtomicUsize,
    fail_launch: bool,
    max_launches: Option<usize>,
    signed_in: bool,
}

impl FakeLauncher {
    fn new(site: Site) -> Self {
        Self {
            site: Arc::new(site),
            visits: Arc::new(Mutex::new(Vec::new())),
            launches: AtomicUsize::new(0),
            fail_launch: false,
            max_launches: None,
            signed_in: false,
        }
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self) -> Result<Box<dyn Browser>, DriverError> {
        let count = self.launches.fetch_add(1, Ordering::SeqCst);
        if self.fail_launch {
            return Err(DriverError::Launch("chrome not found".into()));
        }
        if self.max_launches.is_some_and(|max| count >= max) {
            return Err(DriverError::Launch("relaunch refused".into()));
        }
        Ok(Box::new(FakeBrowser {
            site: Arc::clone(&self.site),
            visits: Arc::clone(&self.visits),
        }))
    }

    async fn authenticate(&self, _browser: &dyn Browser) -> bool {
        self.signed_in
    }
}

#[derive(Default)]
struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingNotifier {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, text: &str) -> Result<(), DeliveryError> {
        self.messages.lock().unwrap().push(text.to_string());
        if self.fail {
            return Err(DeliveryError::Status {
                status: 502,
                body: "bad gateway".into(),
            });
        }
        Ok(())
    }
}

fn controls(budget: usize) -> HarvestControls {
    HarvestControls::new(
        PacingWindow::none(),
        Duration::ZERO,
        budget,
        RestartPolicy {
            failure_threshold: 3,
            cooldown: Duration::ZERO,
        },
    )
    .expect("valid controls")
}

fn listing(items: &[(&str, &str)]) -> String {
    let mut html = String::from("<ul>");
    for (href, title) in items {
        html.push_str(&format!(
            r#"<li data-testid="jobs-item"><a href="{href}"><h2>{title}</h2></a></li>"#
        ));
    }
    html.push_str("</ul>");
    html
}

fn list_source(tag: &str, url: &str) -> Box<dyn Extractor> {
    Box::new(
        ListExtractor::new(tag, Url::parse(url).unwrap(), 1, &ListProfile::default())
            .expect("list source"),
    )
}

fn detail_source(tag: &str, url: &str) -> Box<dyn Extractor> {
    Box::new(
        DetailExtractor::new(tag, vec![Url::parse(url).unwrap()], &DetailProfile::default())
            .expect("detail source"),
    )
}

fn harvester(
    launcher: Arc<FakeLauncher>,
    store: Arc<dyn LedgerStore>,
    notifier: Arc<RecordingNotifier>,
    controls: HarvestControls,
    sources: Vec<Box<dyn Extractor>>,
) -> Harvester {
    Harvester::new(controls, launcher, store, notifier)
        .with_seeds(vec!["plc".into(), "automat".into(), "scada".into()])
        .with_sources(sources)
}

#[tokio::test(flavor = "current_thread")]
async fn ledger_history_suppresses_known_postings() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(
        dir.path().join("sent.json"),
        r#"{"sent":{"https://x/1":{"at":"2999-01-01T00:00:00Z","title":"A"}}}"#,
    )
    .expect("seed ledger");
    let site = Site::default().page(
        "https://jobs.test/offres",
        &listing(&[("https://x/1", "Automaticien PLC"), ("https://x/2", "Technicien SCADA")]),
    );
    let notifier = Arc::new(RecordingNotifier::default());
    let run = harvester(
        Arc::new(FakeLauncher::new(site)),
        Arc::new(JsonFileStore::in_dir(dir.path())),
        notifier.clone(),
        controls(10),
        vec![list_source("list", "https://jobs.test/offres")],
    );

    let summary = run.run_once(RunReason::Cli).await.expect("run");
    assert_eq!(summary.scanned, 2);
    assert_eq!(summary.already_seen, 1);
    assert_eq!(summary.matched, 1);
    assert_eq!(summary.sent, 1);
    let messages = notifier.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("https://x/2"));

    let raw = fs::read_to_string(dir.path().join("sent.json")).expect("ledger written");
    let value: serde_json::Value = serde_json::from_str(&raw).expect("json ledger");
    assert_eq!(value["sent"]["https://x/1"]["title"], "A");
    assert_eq!(value["sent"]["https://x/2"]["title"], "Technicien SCADA");
}

#[tokio::test(flavor = "current_thread")]
async fn each_key_is_sent_at_most_once_across_runs_and_sources() {
    let site = Site::default()
        .page(
            "https://a.test/jobs",
            &listing(&[("https://x/7", "Automaticien"), ("https://x/8", "Comptable")]),
        )
        .page("https://b.test/jobs", &listing(&[("https://x/7", "Automaticien (copie)")]));
    let notifier = Arc::new(RecordingNotifier::default());
    let store = Arc::new(MemoryStore::new());
    let run = harvester(
        Arc::new(FakeLauncher::new(site)),
        store.clone(),
        notifier.clone(),
        controls(10),
        vec![
            list_source("a", "https://a.test/jobs"),
            list_source("b", "https://b.test/jobs"),
        ],
    );

    let first = run.run_once(RunReason::Cli).await.expect("first run");
    assert_eq!(first.scanned, 2);
    assert_eq!(first.duplicates, 1);
    assert_eq!(first.matched, 1);
    assert_eq!(first.sent, 1);
    assert!(notifier.messages()[0].contains("<b>Automaticien</b>"));

    let second = run.run_once(RunReason::Cli).await.expect("second run");
    assert_eq!(second.sent, 0);
    assert_eq!(second.already_seen, 1);
    assert_eq!(notifier.messages().len(), 1);
    assert!(store.snapshot().sent.contains_key("https://x/7"));
    assert!(!store.snapshot().sent.contains_key("https://x/8"));
}

#[tokio::test(flavor = "current_thread")]
async fn three_transient_failures_restart_the_session_before_the_next_source() {
    let site = Site::default()
        .status("https://a.test/1", 503)
        .status("https://b.test/1", 503)
        .status("https://c.test/1", 503)
        .page(
            "https://d.test/1",
            "<html><body><h1>Automaticien PLC</h1><main>Responsabilités : armoires</main></body></html>",
        );
    let launcher = Arc::new(FakeLauncher::new(site));
    let notifier = Arc::new(RecordingNotifier::default());
    let run = harvester(
        launcher.clone(),
        Arc::new(MemoryStore::new()),
        notifier.clone(),
        controls(10),
        vec![
            detail_source("a", "https://a.test/1"),
            detail_source("b", "https://b.test/1"),
            detail_source("c", "https://c.test/1"),
            detail_source("d", "https://d.test/1"),
        ],
    );

    let summary = run.run_once(RunReason::Cli).await.expect("run survives");
    assert_eq!(summary.transient_errors, 3);
    assert_eq!(summary.restarts, 1);
    assert_eq!(summary.sent, 1);
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    assert!(notifier.messages()[0].contains("📝 Responsabilités : armoires"));
}

#[tokio::test(flavor = "current_thread")]
async fn not_found_pages_do_not_count_toward_a_restart() {
    let site = Site::default()
        .status("https://a.test/1", 503)
        .status("https://b.test/1", 503)
        .status("https://c.test/1", 404)
        .status("https://d.test/1", 503);
    let launcher = Arc::new(FakeLauncher::new(site));
    let run = harvester(
        launcher.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(RecordingNotifier::default()),
        controls(10),
        vec![
            detail_source("a", "https://a.test/1"),
            detail_source("b", "https://b.test/1"),
            detail_source("c", "https://c.test/1"),
            detail_source("d", "https://d.test/1"),
        ],
    );
    let summary = run.run_once(RunReason::Cli).await.expect("run");
    assert_eq!(summary.restarts, 0);
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn launch_failure_is_fatal_and_releases_the_lock() {
    let mut launcher = FakeLauncher::new(Site::default());
    launcher.fail_launch = true;
    let notifier = Arc::new(RecordingNotifier::default());
    let run = harvester(
        Arc::new(launcher),
        Arc::new(MemoryStore::new()),
        notifier.clone(),
        controls(10),
        vec![list_source("list", "https://jobs.test/offres")],
    );

    let err = run.run_once(RunReason::Cli).await.expect_err("fatal");
    assert!(matches!(err, HarvestError::Session(_)));
    assert!(err.to_string().contains("chrome not found"));
    assert!(notifier.messages().is_empty());
    assert!(!run.lock().is_busy());
}

#[tokio::test(flavor = "current_thread")]
async fn busy_lock_rejects_a_second_run() {
    let run = harvester(
        Arc::new(FakeLauncher::new(Site::default())),
        Arc::new(MemoryStore::new()),
        Arc::new(RecordingNotifier::default()),
        controls(10),
        Vec::new(),
    );
    let _held = run.lock().try_acquire().expect("lock");
    assert!(matches!(
        run.run_once(RunReason::Manual).await,
        Err(HarvestError::Busy)
    ));
}

#[tokio::test(flavor = "current_thread")]
async fn trusted_catalog_ranks_first_and_budget_caps_sends() {
    let site = Site::default()
        .page(
            "https://jobs.test/c/slb",
            &listing(&[("https://x/slb-1", "Comptable")]),
        )
        .page(
            "https://jobs.test/offres",
            &listing(&[
                ("https://x/10", "Automaticien PLC SCADA"),
                ("https://x/11", "Technicien PLC"),
                ("https://x/12", "Chauffeur"),
            ]),
        );
    let catalog = EmployerCatalog::from_entries(vec![CatalogEntry {
        name: "Schlumberger".into(),
        url: Some("https://jobs.test/c/slb".into()),
        location: None,
    }]);
    let notifier = Arc::new(RecordingNotifier::default());
    let run = harvester(
        Arc::new(FakeLauncher::new(site)),
        Arc::new(MemoryStore::new()),
        notifier.clone(),
        controls(2),
        vec![
            Box::new(
                TrustedCatalogExtractor::new("catalog", catalog, &ListProfile::default())
                    .expect("catalog"),
            ),
            list_source("list", "https://jobs.test/offres"),
        ],
    );

    let summary = run.run_once(RunReason::Cli).await.expect("run");
    assert_eq!(summary.scanned, 4);
    assert_eq!(summary.matched, 3);
    assert_eq!(summary.sent, 2);
    let messages = notifier.messages();
    assert!(messages[0].contains("🏢 Schlumberger"));
    assert!(messages[0].contains("trusted-source"));
    assert!(messages[1].contains("https://x/10"));
}

async fn run_with_failing_notifier(policy: DeliveryPolicy) -> (RunSummary, Arc<MemoryStore>) {
    let site = Site::default().page(
        "https://jobs.test/offres",
        &listing(&[("https://x/1", "Automaticien")]),
    );
    let store = Arc::new(MemoryStore::new());
    let run = harvester(
        Arc::new(FakeLauncher::new(site)),
        store.clone(),
        Arc::new(RecordingNotifier::failing()),
        controls(10).with_delivery_policy(policy),
        vec![list_source("list", "https://jobs.test/offres")],
    );
    let summary = run.run_once(RunReason::Cli).await.expect("delivery failures are not fatal");
    (summary, store)
}

#[tokio::test(flavor = "current_thread")]
async fn failed_delivery_is_marked_handled_by_default() {
    let (summary, store) = run_with_failing_notifier(DeliveryPolicy::AtMostOnce).await;
    assert_eq!(summary.sent, 0);
    assert_eq!(summary.failed_deliveries, 1);
    assert!(store.snapshot().sent.contains_key("https://x/1"));
}

#[tokio::test(flavor = "current_thread")]
async fn retry_policy_leaves_failed_deliveries_unmarked() {
    let (summary, store) = run_with_failing_notifier(DeliveryPolicy::RetryFailed).await;
    assert_eq!(summary.failed_deliveries, 1);
    assert!(store.snapshot().sent.is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn auth_only_sources_are_skipped_without_a_session() {
    let feed_url = "https://social.test/search?keywords=plc";
    let site = Site::default().page(
        feed_url,
        r#"<article><p>Automaticien recherché</p><a href="/posts/1">x</a></article>"#,
    );
    let feed = || -> Box<dyn Extractor> {
        Box::new(
            FeedPostExtractor::new(
                "feed",
                vec![Url::parse(feed_url).unwrap()],
                &FeedProfile::default(),
            )
            .expect("feed"),
        )
    };

    let anonymous = Arc::new(FakeLauncher::new(Site::default()));
    let run = harvester(
        anonymous.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(RecordingNotifier::default()),
        controls(10),
        vec![feed()],
    );
    let summary = run.run_once(RunReason::Cli).await.expect("run");
    assert_eq!(summary.skipped_sources, 1);
    assert!(!summary.authenticated);
    assert!(anonymous.visits.lock().unwrap().is_empty());

    let mut signed = FakeLauncher::new(site);
    signed.signed_in = true;
    let notifier = Arc::new(RecordingNotifier::default());
    let run = harvester(
        Arc::new(signed),
        Arc::new(MemoryStore::new()),
        notifier.clone(),
        controls(10),
        vec![feed()],
    );
    let summary = run.run_once(RunReason::Cli).await.expect("run");
    assert_eq!(summary.skipped_sources, 0);
    assert_eq!(summary.sent, 1);
    assert!(notifier.messages()[0].contains("https://social.test/posts/1"));
}

#[tokio::test(flavor = "current_thread")]
async fn enrichment_attaches_a_snippet_before_sending() {
    let site = Site::default()
        .page(
            "https://jobs.test/offres",
            &listing(&[("https://jobs.test/o/5", "Automaticien")]),
        )
        .page(
            "https://jobs.test/o/5",
            "<html><body><h1>Automaticien</h1><main>Intro. Compétences : TIA Portal</main></body></html>",
        );
    let notifier = Arc::new(RecordingNotifier::default());
    let run = harvester(
        Arc::new(FakeLauncher::new(site)),
        Arc::new(MemoryStore::new()),
        notifier.clone(),
        controls(10),
        vec![list_source("list", "https://jobs.test/offres")],
    )
    .with_enricher(DetailExtractor::enricher().expect("enricher"));
    let summary = run.run_once(RunReason::Cli).await.expect("run");
    assert_eq!(summary.sent, 1);
    assert!(notifier.messages()[0].contains("📝 Compétences : TIA Portal"));
}

#[tokio::test(flavor = "current_thread")]
async fn relaunch_failure_during_delivery_still_flushes_the_marks_made() {
    let site = Site::default()
        .page(
            "https://jobs.test/offres",
            &listing(&[
                ("https://jobs.test/o/1", "Automaticien PLC"),
                ("https://jobs.test/o/2", "Technicien PLC"),
                ("https://jobs.test/o/3", "Ingénieur PLC"),
            ]),
        )
        .status("https://jobs.test/o/1", 503)
        .status("https://jobs.test/o/2", 503)
        .status("https://jobs.test/o/3", 503);
    let mut launcher = FakeLauncher::new(site);
    launcher.max_launches = Some(1);
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let run = harvester(
        Arc::new(launcher),
        store.clone(),
        notifier.clone(),
        controls(10),
        vec![list_source("list", "https://jobs.test/offres")],
    )
    .with_enricher(DetailExtractor::enricher().expect("enricher"));

    let err = run.run_once(RunReason::Cli).await.expect_err("relaunch is fatal");
    assert!(err.to_string().contains("relaunch refused"));
    // The third enrichment failure trips the restart before the third send.
    assert_eq!(notifier.messages().len(), 2);
    assert_eq!(store.snapshot().sent.len(), 2);
    assert!(!run.lock().is_busy());
}

struct ReadOnlyStore;

impl LedgerStore for ReadOnlyStore {
    fn load(&self) -> Result<LedgerFile, LedgerError> {
        Ok(LedgerFile::default())
    }

    fn save(&self, _file: &LedgerFile) -> Result<(), LedgerError> {
        Err(LedgerError::Io {
            path: "/read-only/sent.json".into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
        })
    }
}

#[tokio::test(flavor = "current_thread")]
async fn failed_flush_is_reported_but_the_run_succeeds() {
    let site = Site::default().page(
        "https://jobs.test/offres",
        &listing(&[("https://x/1", "Automaticien PLC")]),
    );
    let notifier = Arc::new(RecordingNotifier::default());
    let run = harvester(
        Arc::new(FakeLauncher::new(site)),
        Arc::new(ReadOnlyStore),
        notifier.clone(),
        controls(10),
        vec![list_source("list", "https://jobs.test/offres")],
    );

    let summary = run.run_once(RunReason::Cli).await.expect("flush failure is not fatal");
    assert!(summary.ledger_flush_failed);
    assert!(!summary.ledger_degraded);
    assert_eq!(summary.sent, 1);
    assert_eq!(notifier.messages().len(), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn undated_ledger_entries_still_suppress_their_postings() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(
        dir.path().join("sent.json"),
        r#"{"sent":{"https://x/1":{"at":"...","title":"A"}}}"#,
    )
    .expect("seed ledger");
    let site = Site::default().page(
        "https://jobs.test/offres",
        &listing(&[("https://x/1", "Automaticien PLC")]),
    );
    let notifier = Arc::new(RecordingNotifier::default());
    let run = harvester(
        Arc::new(FakeLauncher::new(site)),
        Arc::new(JsonFileStore::in_dir(dir.path())),
        notifier.clone(),
        controls(10).with_retention(Some(Duration::from_secs(86_400))),
        vec![list_source("list", "https://jobs.test/offres")],
    );

    let summary = run.run_once(RunReason::Cli).await.expect("run");
    assert!(!summary.ledger_degraded);
    assert_eq!(summary.already_seen, 1);
    assert!(notifier.messages().is_empty());
}
