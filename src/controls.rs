//! Harvest pacing, budget, and session knobs shared by the CLI and the server.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use rand::Rng;
use tokio::time::sleep;

use crate::bank::{parse_seed_list, DEFAULT_SEEDS};
use crate::driver::{IdentityProfile, RestartPolicy, Viewport, DEFAULT_USER_AGENT};
use crate::error::ConfigError;

/// Randomized pause inserted after every unit of work (page visit, outbound message).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacingWindow {
    min: Duration,
    max: Duration,
}

impl PacingWindow {
    /// Builds a window, rejecting `min > max`.
    pub fn new(min: Duration, max: Duration) -> Result<Self, ConfigError> {
        if min > max {
            return Err(ConfigError::InvertedPacing {
                min_ms: min.as_millis() as u64,
                max_ms: max.as_millis() as u64,
            });
        }
        Ok(Self { min, max })
    }

    /// A window that never sleeps.
    pub fn none() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    /// Lower bound.
    pub fn min(&self) -> Duration {
        self.min
    }

    /// Upper bound.
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Draws a delay uniformly from `[min, max]`.
    pub fn sample(&self) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Sleeps for a sampled delay.
    pub async fn pause(&self) {
        let delay = self.sample();
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }
}

impl Default for PacingWindow {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(4000),
            max: Duration::from_millis(8000),
        }
    }
}

/// What happens to the ledger when a delivery fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Mark the posting handled anyway; a flaky API never causes duplicate floods.
    AtMostOnce,
    /// Leave failed postings unmarked so the next run retries them.
    RetryFailed,
}

/// Tunable knobs that bound one harvest run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HarvestControls {
    pacing: PacingWindow,
    message_interval: Duration,
    send_budget: usize,
    restart_policy: RestartPolicy,
    retention: Option<Duration>,
    enrich_details: bool,
    delivery_policy: DeliveryPolicy,
}

impl HarvestControls {
    /// Constructs a new set of controls.
    pub fn new(
        pacing: PacingWindow,
        message_interval: Duration,
        send_budget: usize,
        restart_policy: RestartPolicy,
    ) -> Result<Self, ConfigError> {
        if restart_policy.failure_threshold == 0 {
            return Err(ConfigError::ZeroFailureThreshold);
        }
        Ok(Self {
            pacing,
            message_interval,
            send_budget,
            restart_policy,
            retention: None,
            enrich_details: false,
            delivery_policy: DeliveryPolicy::AtMostOnce,
        })
    }

    /// Expires ledger entries older than `retention`.
    pub fn with_retention(mut self, retention: Option<Duration>) -> Self {
        self.retention = retention;
        self
    }

    /// Fetches detail snippets for candidates before dispatch.
    pub fn with_detail_enrichment(mut self, enabled: bool) -> Self {
        self.enrich_details = enabled;
        self
    }

    /// Chooses how failed deliveries are recorded.
    pub fn with_delivery_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.delivery_policy = policy;
        self
    }

    /// Pause between units of work.
    pub fn pacing(&self) -> PacingWindow {
        self.pacing
    }

    /// Minimum gap between two outbound messages.
    pub fn message_interval(&self) -> Duration {
        self.message_interval
    }

    /// Maximum notifications per run.
    pub fn send_budget(&self) -> usize {
        self.send_budget
    }

    /// Self-healing thresholds.
    pub fn restart_policy(&self) -> RestartPolicy {
        self.restart_policy
    }

    /// Ledger retention window, if any.
    pub fn retention(&self) -> Option<Duration> {
        self.retention
    }

    /// Whether candidates get detail snippets.
    pub fn enrich_details(&self) -> bool {
        self.enrich_details
    }

    /// Ledger treatment of failed deliveries.
    pub fn delivery_policy(&self) -> DeliveryPolicy {
        self.delivery_policy
    }
}

impl Default for HarvestControls {
    fn default() -> Self {
        Self {
            pacing: PacingWindow::default(),
            message_interval: Duration::from_millis(700),
            send_budget: 30,
            restart_policy: RestartPolicy::default(),
            retention: Some(Duration::from_secs(90 * 24 * 3600)),
            enrich_details: false,
            delivery_policy: DeliveryPolicy::AtMostOnce,
        }
    }
}

/// Command-line interface shared by the harvest binaries.
#[derive(Parser, Debug, Clone)]
#[command(name = "jobharvest", about = "Harvest, filter, and notify new job postings")]
pub struct Cli {
    /// Paginated listing URLs, comma separated
    #[arg(long = "list-url", env = "JOBHARVEST_LIST_URLS", value_delimiter = ',')]
    pub list_urls: Vec<String>,

    /// Listing pages visited per list URL
    #[arg(long, env = "JOBHARVEST_PAGES", default_value_t = 5)]
    pub pages: u32,

    /// Feed pages whose posts are harvested, comma separated
    #[arg(long = "feed-url", env = "JOBHARVEST_FEED_URLS", value_delimiter = ',')]
    pub feed_urls: Vec<String>,

    /// Individual posting pages, comma separated
    #[arg(long = "detail-url", env = "JOBHARVEST_DETAIL_URLS", value_delimiter = ',')]
    pub detail_urls: Vec<String>,

    /// JSON list of curated employers whose postings are always relevant
    #[arg(long, env = "JOBHARVEST_CATALOG_FILE")]
    pub catalog_file: Option<PathBuf>,

    /// Keep only catalog employers whose name or location contains one of these markers
    #[arg(long, env = "JOBHARVEST_CATALOG_MARKERS", default_value = "")]
    pub catalog_markers: String,

    /// Seed stems, comma separated (defaults to the automation stem list)
    #[arg(long, env = "JOBHARVEST_SEEDS")]
    pub seeds: Option<String>,

    /// Keyword corpus JSON (array, or object with `data`/`keywords`)
    #[arg(long, env = "JOBHARVEST_KEYWORDS_FILE", default_value = "keywords.cleaned.json")]
    pub keywords_file: PathBuf,

    /// Maximum notifications per run
    #[arg(long, env = "JOBHARVEST_SEND_BUDGET", default_value_t = 30)]
    pub send_budget: usize,

    /// Directory holding the sent ledger (in-memory ledger when omitted)
    #[arg(long, env = "JOBHARVEST_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Days after which a ledger entry no longer suppresses a posting (0 keeps forever)
    #[arg(long, env = "JOBHARVEST_RETENTION_DAYS", default_value_t = 90)]
    pub retention_days: u64,

    /// Lower bound of the randomized pause after each page or message
    #[arg(long, env = "JOBHARVEST_DELAY_MIN_MS", default_value_t = 4000)]
    pub delay_min_ms: u64,

    /// Upper bound of the randomized pause after each page or message
    #[arg(long, env = "JOBHARVEST_DELAY_MAX_MS", default_value_t = 8000)]
    pub delay_max_ms: u64,

    /// Minimum gap between two outbound messages
    #[arg(long, env = "JOBHARVEST_MESSAGE_INTERVAL_MS", default_value_t = 700)]
    pub message_interval_ms: u64,

    /// Consecutive transient failures before the session is restarted
    #[arg(long, env = "JOBHARVEST_FAILURE_THRESHOLD", default_value_t = 3)]
    pub failure_threshold: u32,

    /// Pause between session teardown and relaunch
    #[arg(long, env = "JOBHARVEST_RESTART_COOLDOWN_MS", default_value_t = 5000)]
    pub restart_cooldown_ms: u64,

    /// Seconds before a navigation times out
    #[arg(long, env = "JOBHARVEST_NAV_TIMEOUT_SECS", default_value_t = 60)]
    pub nav_timeout_secs: u64,

    /// User agent presented by every session
    #[arg(long, env = "JOBHARVEST_USER_AGENT", default_value = DEFAULT_USER_AGENT)]
    pub user_agent: String,

    /// Viewport advertised by every session
    #[arg(long, env = "JOBHARVEST_VIEWPORT", default_value = "1366x768")]
    pub viewport: String,

    /// Exported cookies (JSON array) loaded into each session
    #[arg(long, env = "JOBHARVEST_COOKIE_FILE")]
    pub cookie_file: Option<PathBuf>,

    /// Page loaded to check that the session is signed in
    #[arg(long, env = "JOBHARVEST_AUTH_PROBE_URL")]
    pub auth_probe_url: Option<String>,

    /// Selector present only on signed-in pages
    #[arg(long, env = "JOBHARVEST_AUTH_MARKER", default_value = ".global-nav__me-photo")]
    pub auth_marker: String,

    /// Messaging bot token (messages are only logged when absent)
    #[arg(long, env = "TELEGRAM_BOT_TOKEN")]
    pub telegram_token: Option<String>,

    /// Messaging chat target, e.g. `@channel` or `-100...`
    #[arg(long, env = "TELEGRAM_CHAT_ID")]
    pub telegram_chat_id: Option<String>,

    /// Messaging API base URL
    #[arg(
        long,
        env = "TELEGRAM_API_BASE",
        default_value = "https://api.telegram.org"
    )]
    pub telegram_api_base: String,

    /// Seconds before a messaging request times out
    #[arg(long, env = "JOBHARVEST_MESSAGE_TIMEOUT_SECS", default_value_t = 20)]
    pub message_timeout_secs: u64,

    /// Fetch each candidate's detail page for a snippet before sending
    #[arg(long, env = "JOBHARVEST_ENRICH_DETAILS", default_value_t = false)]
    pub enrich_details: bool,

    /// Leave failed deliveries out of the ledger so the next run retries them
    #[arg(long, env = "JOBHARVEST_RETRY_FAILED_DELIVERIES", default_value_t = false)]
    pub retry_failed_deliveries: bool,
}

impl Cli {
    /// Converts the parsed CLI into validated `HarvestControls`.
    pub fn build_controls(&self) -> Result<HarvestControls, ConfigError> {
        let pacing = PacingWindow::new(
            Duration::from_millis(self.delay_min_ms),
            Duration::from_millis(self.delay_max_ms),
        )?;
        let controls = HarvestControls::new(
            pacing,
            Duration::from_millis(self.message_interval_ms),
            self.send_budget,
            self.restart_policy(),
        )?
        .with_retention(self.retention())
        .with_detail_enrichment(self.enrich_details)
        .with_delivery_policy(if self.retry_failed_deliveries {
            DeliveryPolicy::RetryFailed
        } else {
            DeliveryPolicy::AtMostOnce
        });
        Ok(controls)
    }

    /// Session identity derived from the CLI.
    pub fn identity_profile(&self) -> Result<IdentityProfile, ConfigError> {
        Ok(IdentityProfile {
            user_agent: self.user_agent.clone(),
            viewport: self.viewport.parse::<Viewport>()?,
            navigation_timeout: Duration::from_secs(self.nav_timeout_secs.max(1)),
            ..IdentityProfile::default()
        })
    }

    /// Self-healing thresholds.
    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_millis(self.restart_cooldown_ms),
        }
    }

    /// Seed stems, falling back to [`DEFAULT_SEEDS`].
    pub fn seed_terms(&self) -> Vec<String> {
        match self.seeds.as_deref().map(parse_seed_list) {
            Some(seeds) if !seeds.is_empty() => seeds,
            _ => DEFAULT_SEEDS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Catalog curation markers.
    pub fn catalog_marker_list(&self) -> Vec<String> {
        parse_seed_list(&self.catalog_markers)
    }

    fn retention(&self) -> Option<Duration> {
        // Zero, or a window too large to represent, keeps entries forever.
        self.retention_days
            .checked_mul(24 * 3600)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}
