//! HTTP control plane: health, manual trigger, and bank inspection, plus the keep-alive pinger.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::HarvestError;
use crate::runtime::{BankReport, Harvester, RunReason, RunReport};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    harvester: Arc<Harvester>,
    run_token: Option<Arc<str>>,
    last_run: Arc<Mutex<Option<RunReport>>>,
}

impl AppState {
    /// Wraps a harvester. Without a token every protected route answers 401.
    pub fn new(harvester: Arc<Harvester>, run_token: Option<String>) -> Self {
        Self {
            harvester,
            run_token: run_token
                .filter(|token| !token.trim().is_empty())
                .map(Arc::from),
            last_run: Arc::new(Mutex::new(None)),
        }
    }

    /// Runs one pass and remembers its report. `None` when another run holds the lock.
    pub async fn trigger(&self, reason: RunReason) -> Option<RunReport> {
        let result = self.harvester.run_once(reason).await;
        if matches!(result, Err(HarvestError::Busy)) {
            return None;
        }
        let report = RunReport::new(reason, &result);
        *self.last_run.lock().await = Some(report.clone());
        Some(report)
    }

    /// Report of the most recent completed trigger.
    pub async fn last_run(&self) -> Option<RunReport> {
        self.last_run.lock().await.clone()
    }

    fn authorized(&self, supplied: Option<&str>) -> bool {
        match (&self.run_token, supplied) {
            (Some(expected), Some(supplied)) => {
                bool::from(expected.as_bytes().ct_eq(supplied.as_bytes()))
            }
            _ => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    ok: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_run: Option<RunReport>,
}

#[derive(Debug, Serialize)]
struct BankBody {
    ok: bool,
    #[serde(flatten)]
    report: BankReport,
}

type ApiError = (StatusCode, Json<ErrorBody>);

/// Builds the router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/health", get(health))
        .route("/run", get(run_handler))
        .route("/bank", get(bank_handler))
        .with_state(state)
}

async fn banner() -> &'static str {
    "jobharvest: GET /run?token=... to harvest, /bank?token=... to inspect the relevance bank"
}

async fn health() -> &'static str {
    "ok"
}

async fn run_handler(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<RunReport>, ApiError> {
    if !state.authorized(query.token.as_deref()) {
        return Err(unauthorized());
    }
    if state.harvester.lock().is_busy() {
        return Err(busy(&state).await);
    }
    info!("manual run requested");
    let Some(report) = state.trigger(RunReason::Manual).await else {
        return Err(busy(&state).await);
    };
    if report.ok {
        Ok(Json(report))
    } else {
        let error = report.error.clone().unwrap_or_default();
        Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                ok: false,
                error,
                last_run: None,
            }),
        ))
    }
}

async fn bank_handler(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<BankBody>, ApiError> {
    if !state.authorized(query.token.as_deref()) {
        return Err(unauthorized());
    }
    let harvester = Arc::clone(&state.harvester);
    let report = tokio::task::spawn_blocking(move || harvester.bank_report())
        .await
        .map_err(|err| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    ok: false,
                    error: err.to_string(),
                    last_run: None,
                }),
            )
        })?;
    Ok(Json(BankBody { ok: true, report }))
}

fn unauthorized() -> ApiError {
    warn!("rejected request with a missing or wrong token");
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorBody {
            ok: false,
            error: "unauthorized".into(),
            last_run: None,
        }),
    )
}

async fn busy(state: &AppState) -> ApiError {
    (
        StatusCode::CONFLICT,
        Json(ErrorBody {
            ok: false,
            error: "busy".into(),
            last_run: state.last_run().await,
        }),
    )
}

/// Per-request timeout of the keep-alive ping.
pub const SELF_PING_TIMEOUT: Duration = Duration::from_secs(8);

/// GETs `url` after `first` and then every `every`, so hosts that idle quiet services keep this
/// one awake while it runs. Failures are logged and never stop the loop.
pub fn spawn_self_ping(
    url: Url,
    first: Duration,
    every: Duration,
) -> Result<JoinHandle<()>, reqwest::Error> {
    let client = reqwest::Client::builder()
        .timeout(SELF_PING_TIMEOUT)
        .user_agent("jobharvest-self-ping")
        .build()?;
    let every = every.max(Duration::from_millis(1));
    Ok(tokio::spawn(async move {
        let mut ticks = interval_at(Instant::now() + first, every);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            match client.get(url.clone()).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(%url, status = resp.status().as_u16(), "self-ping ok");
                }
                Ok(resp) => warn!(%url, status = resp.status().as_u16(), "self-ping rejected"),
                Err(err) => warn!(%url, error = %err, "self-ping failed"),
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::{HarvestControls, PacingWindow};
    use crate::dispatch::LogNotifier;
    use crate::driver::{Browser, DriverError, Launcher, Page, RestartPolicy};
    use crate::ledger::MemoryStore;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    struct BlankBrowser;

    #[async_trait]
    impl Browser for BlankBrowser {
        async fn open(&self, url: &Url) -> Result<Page, DriverError> {
            Ok(Page {
                url: url.clone(),
                status: 200,
                html: String::new(),
            })
        }

        async fn close(&self) -> Result<(), DriverError> {
            Ok(())
        }
    }

    struct BlankLauncher {
        fail: bool,
    }

    #[async_trait]
    impl Launcher for BlankLauncher {
        async fn launch(&self) -> Result<Box<dyn Browser>, DriverError> {
            if self.fail {
                return Err(DriverError::Launch("no browser".into()));
            }
            Ok(Box::new(BlankBrowser))
        }

        async fn authenticate(&self, _browser: &dyn Browser) -> bool {
            false
        }
    }

    fn state(fail_launch: bool) -> AppState {
        let controls = HarvestControls::new(
            PacingWindow::none(),
            Duration::ZERO,
            5,
            RestartPolicy {
                failure_threshold: 3,
                cooldown: Duration::ZERO,
            },
        )
        .expect("valid controls");
        let harvester = Harvester::new(
            controls,
            Arc::new(BlankLauncher { fail: fail_launch }),
            Arc::new(MemoryStore::new()),
            Arc::new(LogNotifier),
        )
        .with_seeds(vec!["plc".into(), "scada".into()]);
        AppState::new(Arc::new(harvester), Some("secret".into()))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::get(uri).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn health_is_plain_ok() {
        let response = router(state(false))
            .oneshot(Request::get("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn run_requires_the_token() {
        let (status, body) = get_json(router(state(false)), "/run?token=wrong").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");

        let (status, _) = get_json(router(state(false)), "/run").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn self_ping_hits_the_url_repeatedly() {
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let app = Router::new().route(
            "/health",
            get(move || {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { "ok" }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let url = Url::parse(&format!("http://{addr}/health")).unwrap();
        let pinger =
            spawn_self_ping(url, Duration::ZERO, Duration::from_millis(20)).expect("client");
        tokio::time::sleep(Duration::from_millis(150)).await;
        pinger.abort();
        assert!(hits.load(std::sync::atomic::Ordering::SeqCst) >= 2);
    }

    #[test]
    fn token_must_match_exactly() {
        let state = state(false);
        assert!(state.authorized(Some("secret")));
        for candidate in ["", "secre", "secret ", "Secret", "secretsecret"] {
            assert!(!state.authorized(Some(candidate)), "{candidate:?}");
        }
        assert!(!state.authorized(None));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn run_reports_counters() {
        let state = state(false);
        let (status, body) = get_json(router(state.clone()), "/run?token=secret").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["reason"], "manual");
        assert_eq!(body["scanned"], 0);
        assert_eq!(body["sent"], 0);
        assert!(state.last_run().await.is_some());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn concurrent_run_is_rejected_with_last_report() {
        let state = state(false);
        state.trigger(RunReason::Scheduled).await.expect("first run");
        let _held = state.harvester.lock().try_acquire().expect("lock");
        let (status, body) = get_json(router(state.clone()), "/run?token=secret").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "busy");
        assert_eq!(body["lastRun"]["reason"], "scheduled");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn launch_failure_is_a_server_error() {
        let (status, body) = get_json(router(state(true)), "/run?token=secret").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["ok"], false);
        assert!(body["error"].as_str().unwrap_or_default().contains("no browser"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn bank_lists_terms() {
        let (status, body) = get_json(router(state(false)), "/bank?token=secret").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["size"], 2);
        assert_eq!(body["sample"][0], "plc");
    }
}
