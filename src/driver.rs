//! Browser-session seams, the HTTP-backed session, and the self-healing session manager.
//!
//! Extractors only ever see `&dyn Browser` for the duration of one call. The [`SessionManager`]
//! owns the live session and may replace it between calls, so nothing else may hold on to it.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE};
use reqwest::Client;
use scraper::{Html, Selector};
use serde::Deserialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::ConfigError;

/// Default desktop identity presented to sources.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Errors raised by a single session operation.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The session could not be created.
    #[error("launch failed: {0}")]
    Launch(String),
    /// The request never produced a response (timeout, connect, TLS, ...).
    #[error("navigation to {url} failed: {source}")]
    Navigation {
        /// Target URL.
        url: String,
        /// Transport error.
        #[source]
        source: reqwest::Error,
    },
    /// The server answered with a non-success status.
    #[error("navigation to {url} returned HTTP {status}")]
    Status {
        /// Target URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },
    /// The response body could not be read.
    #[error("failed to read body of {url}: {source}")]
    Body {
        /// Target URL.
        url: String,
        /// Transport error.
        #[source]
        source: reqwest::Error,
    },
    /// The session was already torn down.
    #[error("session is closed")]
    Closed,
}

impl DriverError {
    /// True for "the page does not exist" answers, which are expected rather than transient.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status, .. } if *status == 404 || *status == 410)
    }
}

/// A loaded document.
#[derive(Debug, Clone)]
pub struct Page {
    /// Final URL after redirects.
    pub url: Url,
    /// HTTP status code.
    pub status: u16,
    /// Raw markup.
    pub html: String,
}

/// A live automation session. One identity, one cookie jar.
#[async_trait]
pub trait Browser: Send + Sync {
    /// Navigates to `url` and returns the loaded document.
    async fn open(&self, url: &Url) -> Result<Page, DriverError>;

    /// Releases the session. Further `open` calls fail with [`DriverError::Closed`].
    async fn close(&self) -> Result<(), DriverError>;
}

/// Creates and signs in sessions.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Acquires a fresh session with the configured identity profile.
    async fn launch(&self) -> Result<Box<dyn Browser>, DriverError>;

    /// Attempts to sign the session in; `false` means only public sources can be used.
    async fn authenticate(&self, browser: &dyn Browser) -> bool;
}

/// Browser viewport advertised through client hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    /// Width in CSS pixels.
    pub width: u32,
    /// Height in CSS pixels.
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1366,
            height: 768,
        }
    }
}

impl FromStr for Viewport {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::Viewport(value.to_string());
        let (w, h) = value.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width: u32 = w.trim().parse().map_err(|_| invalid())?;
        let height: u32 = h.trim().parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

impl fmt::Display for Viewport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Fixed identity every session presents.
#[derive(Debug, Clone)]
pub struct IdentityProfile {
    /// `User-Agent` header.
    pub user_agent: String,
    /// `Accept-Language` header.
    pub accept_language: String,
    /// Advertised viewport.
    pub viewport: Viewport,
    /// Per-navigation timeout.
    pub navigation_timeout: Duration,
}

impl Default for IdentityProfile {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            accept_language: "fr-FR,fr;q=0.9,en;q=0.8".to_string(),
            viewport: Viewport::default(),
            navigation_timeout: Duration::from_secs(60),
        }
    }
}

/// Signed-in check: load `url`, then look for `marker`.
#[derive(Debug, Clone)]
pub struct AuthProbe {
    url: Url,
    marker: Selector,
}

impl AuthProbe {
    /// Compiles the marker selector.
    pub fn new(url: Url, marker: &str) -> Result<Self, ConfigError> {
        let marker = Selector::parse(marker).map_err(|err| ConfigError::Selector {
            selector: marker.to_string(),
            message: err.to_string(),
        })?;
        Ok(Self { url, marker })
    }

    fn is_signed_in(&self, page: &Page) -> bool {
        if page.url.path().contains("login") {
            return false;
        }
        let document = Html::parse_document(&page.html);
        document.select(&self.marker).next().is_some()
    }
}

#[derive(Debug, Deserialize)]
struct CookieRecord {
    name: String,
    value: String,
    domain: String,
    #[serde(default)]
    path: Option<String>,
}

/// Launches reqwest-backed sessions with a persistent cookie jar per session.
pub struct HttpLauncher {
    profile: IdentityProfile,
    cookie_file: Option<PathBuf>,
    probe: Option<AuthProbe>,
}

impl HttpLauncher {
    /// Creates a launcher for the given identity.
    pub fn new(profile: IdentityProfile) -> Self {
        Self {
            profile,
            cookie_file: None,
            probe: None,
        }
    }

    /// Seeds every new session with cookies exported to `path` (JSON array).
    pub fn with_cookie_file(mut self, path: PathBuf) -> Self {
        self.cookie_file = Some(path);
        self
    }

    /// Enables the signed-in check.
    pub fn with_auth_probe(mut self, probe: AuthProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    fn load_cookies(&self, jar: &Jar) {
        let Some(path) = &self.cookie_file else {
            return;
        };
        let records: Vec<CookieRecord> = match fs::read_to_string(path)
            .map_err(|err| err.to_string())
            .and_then(|raw| serde_json::from_str(&raw).map_err(|err| err.to_string()))
        {
            Ok(records) => records,
            Err(message) => {
                warn!(path = %path.display(), error = %message, "cookie file unusable; launching without cookies");
                return;
            }
        };
        let mut loaded = 0usize;
        for record in records {
            let host = record.domain.trim_start_matches('.');
            let Ok(origin) = Url::parse(&format!("https://{host}/")) else {
                continue;
            };
            let path = record.path.as_deref().unwrap_or("/");
            jar.add_cookie_str(
                &format!(
                    "{}={}; Domain={}; Path={}",
                    record.name, record.value, record.domain, path
                ),
                &origin,
            );
            loaded += 1;
        }
        debug!(cookies = loaded, "seeded session cookie jar");
    }
}

#[async_trait]
impl Launcher for HttpLauncher {
    async fn launch(&self) -> Result<Box<dyn Browser>, DriverError> {
        let jar = Arc::new(Jar::default());
        self.load_cookies(&jar);

        let mut headers = HeaderMap::new();
        let language = HeaderValue::from_str(&self.profile.accept_language)
            .map_err(|err| DriverError::Launch(format!("invalid accept-language: {err}")))?;
        headers.insert(ACCEPT_LANGUAGE, language);
        headers.insert(
            "sec-ch-viewport-width",
            HeaderValue::from(self.profile.viewport.width),
        );
        headers.insert(
            "viewport-width",
            HeaderValue::from(self.profile.viewport.width),
        );

        let client = Client::builder()
            .user_agent(self.profile.user_agent.clone())
            .default_headers(headers)
            .cookie_provider(jar)
            .timeout(self.profile.navigation_timeout)
            .build()
            .map_err(|err| DriverError::Launch(err.to_string()))?;
        info!(viewport = %self.profile.viewport, "launched session");
        Ok(Box::new(HttpBrowser {
            client,
            closed: AtomicBool::new(false),
        }))
    }

    async fn authenticate(&self, browser: &dyn Browser) -> bool {
        let Some(probe) = &self.probe else {
            debug!("no auth probe configured; session stays anonymous");
            return false;
        };
        match browser.open(&probe.url).await {
            Ok(page) => probe.is_signed_in(&page),
            Err(err) => {
                warn!(error = %err, "auth probe failed");
                false
            }
        }
    }
}

struct HttpBrowser {
    client: Client,
    closed: AtomicBool,
}

#[async_trait]
impl Browser for HttpBrowser {
    async fn open(&self, url: &Url) -> Result<Page, DriverError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::Closed);
        }
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| DriverError::Navigation {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(DriverError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let final_url = response.url().clone();
        let html = response.text().await.map_err(|source| DriverError::Body {
            url: url.to_string(),
            source,
        })?;
        Ok(Page {
            url: final_url,
            status: status.as_u16(),
            html,
        })
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Classified result of one unit of extraction work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Work produced data.
    Success,
    /// Expected empty result, such as "not found".
    NotApplicable,
    /// Navigation or extraction failed in a way a fresh session may fix.
    TransientError,
}

/// Lifecycle of the managed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing launched yet.
    Uninitialized,
    /// Acquiring a session.
    Launching,
    /// Signing the session in.
    Authenticating,
    /// Usable.
    Ready,
    /// Usable, with at least one consecutive transient failure recorded.
    Failing,
    /// Tearing down and relaunching.
    Restarting,
    /// No session could be obtained.
    Aborted,
    /// Shut down at the end of a run.
    Closed,
}

/// When and how a wedged session is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Consecutive transient failures that trigger a restart.
    pub failure_threshold: u32,
    /// Pause between teardown and relaunch.
    pub cooldown: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(5),
        }
    }
}

/// Failures to obtain a session. Always fatal to the run.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The initial launch failed.
    #[error("launch failed: {0}")]
    Launch(#[source] DriverError),
    /// The self-healing relaunch failed.
    #[error("relaunch after {failures} consecutive failures failed: {source}")]
    Relaunch {
        /// Failure streak that triggered the restart.
        failures: u32,
        /// Launch error.
        #[source]
        source: DriverError,
    },
    /// `browser()` was called before `start()` or after `shutdown()`.
    #[error("no live session")]
    NotStarted,
}

/// Owns the live session and the consecutive-failure counter.
pub struct SessionManager {
    launcher: Arc<dyn Launcher>,
    policy: RestartPolicy,
    browser: Option<Box<dyn Browser>>,
    state: SessionState,
    authenticated: bool,
    consecutive_failures: u32,
    restarts: u32,
}

impl SessionManager {
    /// Creates an idle manager.
    pub fn new(launcher: Arc<dyn Launcher>, policy: RestartPolicy) -> Self {
        Self {
            launcher,
            policy,
            browser: None,
            state: SessionState::Uninitialized,
            authenticated: false,
            consecutive_failures: 0,
            restarts: 0,
        }
    }

    /// Launches and authenticates the first session, returning the authentication result.
    pub async fn start(&mut self) -> Result<bool, SessionError> {
        self.state = SessionState::Launching;
        match self.launcher.launch().await {
            Ok(browser) => self.browser = Some(browser),
            Err(err) => {
                self.state = SessionState::Aborted;
                error!(error = %err, "could not launch session");
                return Err(SessionError::Launch(err));
            }
        }
        Ok(self.authenticate().await)
    }

    async fn authenticate(&mut self) -> bool {
        self.state = SessionState::Authenticating;
        let authenticated = match self.browser.as_deref() {
            Some(browser) => self.launcher.authenticate(browser).await,
            None => false,
        };
        self.authenticated = authenticated;
        self.state = SessionState::Ready;
        if authenticated {
            info!("session authenticated");
        } else {
            warn!("session not authenticated; auth-only sources will be skipped");
        }
        authenticated
    }

    /// The current session. Borrow it for one call only.
    pub fn browser(&self) -> Result<&dyn Browser, SessionError> {
        self.browser.as_deref().ok_or(SessionError::NotStarted)
    }

    /// Feeds one classified outcome into the self-healing policy.
    ///
    /// Returns `true` when the outcome triggered a restart.
    pub async fn record(&mut self, outcome: Outcome) -> Result<bool, SessionError> {
        match outcome {
            Outcome::Success | Outcome::NotApplicable => {
                self.consecutive_failures = 0;
                if self.state == SessionState::Failing {
                    self.state = SessionState::Ready;
                }
                Ok(false)
            }
            Outcome::TransientError => {
                self.consecutive_failures += 1;
                self.state = SessionState::Failing;
                warn!(
                    failures = self.consecutive_failures,
                    threshold = self.policy.failure_threshold,
                    "transient extraction failure"
                );
                if self.consecutive_failures >= self.policy.failure_threshold {
                    self.restart().await?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn restart(&mut self) -> Result<(), SessionError> {
        let failures = self.consecutive_failures;
        warn!(failures, "session looks wedged; restarting");
        self.state = SessionState::Restarting;
        self.teardown().await;
        sleep(self.policy.cooldown).await;

        match self.launcher.launch().await {
            Ok(browser) => self.browser = Some(browser),
            Err(source) => {
                self.state = SessionState::Aborted;
                error!(error = %source, "relaunch failed");
                return Err(SessionError::Relaunch { failures, source });
            }
        }
        self.authenticate().await;
        self.consecutive_failures = 0;
        self.restarts += 1;
        info!(restarts = self.restarts, "session restarted");
        Ok(())
    }

    async fn teardown(&mut self) {
        if let Some(browser) = self.browser.take() {
            if let Err(err) = browser.close().await {
                debug!(error = %err, "ignoring session close failure");
            }
        }
    }

    /// Best-effort close; safe to call in any state.
    pub async fn shutdown(&mut self) {
        self.teardown().await;
        if self.state != SessionState::Aborted {
            self.state = SessionState::Closed;
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the current session is signed in.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Current failure streak.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Restarts performed so far.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }
}
