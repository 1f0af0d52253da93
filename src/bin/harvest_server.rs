use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono_tz::Tz;
use clap::Parser;
use jobharvest::runtime::{Harvester, RunReason};
use jobharvest::server::{router, spawn_self_ping, AppState};
use jobharvest::Cli;
use url::Url;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "jobharvest-server",
    about = "HTTP control plane with an optional daily harvest schedule"
)]
struct ServerCli {
    #[command(flatten)]
    harvest: Cli,

    /// Address to bind the HTTP server to (host:port).
    #[arg(long, env = "JOBHARVEST_BIND", default_value = "0.0.0.0:10000")]
    bind: String,

    /// Token required by `/run` and `/bank`; both answer 401 when unset.
    #[arg(long, env = "RUN_TOKEN")]
    run_token: Option<String>,

    /// Register the cron schedule below.
    #[arg(long, env = "AUTO_RUN", default_value_t = true, action = clap::ArgAction::Set)]
    auto_run: bool,

    /// Cron expression, evaluated in `--timezone`. Five-field expressions get a leading seconds field.
    #[arg(long, env = "CRON_SCHEDULE", default_value = "0 20 * * *")]
    cron_schedule: String,

    /// IANA time zone of the cron schedule.
    #[arg(long, env = "TZ", default_value = "Africa/Algiers")]
    timezone: Tz,

    /// URL fetched periodically to keep the host from idling the service (disabled when unset).
    #[arg(long, env = "SELF_PING_URL")]
    self_ping_url: Option<Url>,

    /// Minutes between two self-pings.
    #[arg(long, env = "SELF_PING_INTERVAL_MIN", default_value_t = 12)]
    self_ping_interval_min: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    jobharvest::init_tracing();
    let cli = ServerCli::parse();
    let harvester = Harvester::from_cli(&cli.harvest).context("invalid configuration")?;
    if cli.run_token.is_none() {
        warn!("RUN_TOKEN is not set; /run and /bank will refuse every request");
    }
    let state = AppState::new(Arc::new(harvester), cli.run_token.clone());

    let _scheduler = if cli.auto_run {
        Some(start_schedule(&cli.cron_schedule, cli.timezone, state.clone()).await?)
    } else {
        None
    };

    let _pinger = match &cli.self_ping_url {
        Some(url) => {
            let every = Duration::from_secs(cli.self_ping_interval_min.max(1) * 60);
            info!(%url, every_min = cli.self_ping_interval_min.max(1), "self-ping enabled");
            Some(
                spawn_self_ping(url.clone(), Duration::from_secs(10), every)
                    .context("failed to build self-ping client")?,
            )
        }
        None => None,
    };

    let app = router(state);
    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cli.bind))?;
    info!(
        %addr,
        auto_run = cli.auto_run,
        cron = %cli.cron_schedule,
        tz = %cli.timezone,
        "jobharvest listening"
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .await
        .context("server shutdown")?;
    Ok(())
}

async fn start_schedule(expression: &str, timezone: Tz, state: AppState) -> Result<JobScheduler> {
    let expression = with_seconds_field(expression);
    let scheduler = JobScheduler::new().await?;
    let job = Job::new_async_tz(expression.as_str(), timezone, move |_uuid, _lock| {
        let state = state.clone();
        Box::pin(async move {
            info!("scheduled run triggered");
            match state.trigger(RunReason::Scheduled).await {
                None => warn!("scheduled run skipped; a run is already in progress"),
                Some(report) if report.ok => info!("scheduled run done"),
                Some(report) => error!(
                    error = report.error.as_deref().unwrap_or_default(),
                    "scheduled run failed"
                ),
            }
        })
    })
    .with_context(|| format!("invalid cron expression {expression}"))?;
    scheduler.add(job).await?;
    scheduler.start().await?;
    info!(cron = %expression, tz = %timezone, "schedule registered");
    Ok(scheduler)
}

fn with_seconds_field(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}
