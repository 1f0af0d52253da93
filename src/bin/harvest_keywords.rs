use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use jobharvest::corpus::{CorpusScan, SuggestEndpoint};
use jobharvest::driver::{HttpLauncher, IdentityProfile, RestartPolicy, DEFAULT_USER_AGENT};
use jobharvest::{PacingWindow, SessionManager};
use url::Url;

#[derive(Parser, Debug)]
#[command(
    name = "jobharvest-keywords",
    about = "Build the keyword corpus by scanning a site's search suggestions prefix by prefix"
)]
struct KeywordsCli {
    /// Suggestion endpoint; the prefix is sent in `--query-param`.
    #[arg(long, env = "JOBHARVEST_SUGGEST_URL")]
    suggest_url: Url,

    /// Query parameter carrying the prefix.
    #[arg(long, default_value = "q")]
    query_param: String,

    /// Corpus file, rewritten as the scan progresses.
    #[arg(long, default_value = "keywords.json")]
    out: PathBuf,

    /// Length of every prefix.
    #[arg(long, default_value_t = 2)]
    prefix_len: usize,

    /// Prefixes visited by this invocation.
    #[arg(long, default_value_t = 2500)]
    max_prefixes: usize,

    /// Rewrite the corpus file every N prefixes.
    #[arg(long, default_value_t = 25)]
    save_every: usize,

    /// Continue from the position recorded in the corpus file.
    #[arg(long, default_value_t = false)]
    resume: bool,

    /// Lower bound of the pause after each prefix.
    #[arg(long, default_value_t = 180)]
    delay_min_ms: u64,

    /// Upper bound of the pause after each prefix.
    #[arg(long, default_value_t = 420)]
    delay_max_ms: u64,

    /// Selector for suggestion items when the endpoint answers with HTML.
    #[arg(long)]
    option_selector: Option<String>,

    /// User-Agent presented by the session.
    #[arg(long, env = "JOBHARVEST_USER_AGENT", default_value = DEFAULT_USER_AGENT)]
    user_agent: String,

    /// JSON cookie export loaded into the session.
    #[arg(long, env = "JOBHARVEST_COOKIE_FILE")]
    cookie_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    jobharvest::init_tracing();
    let cli = KeywordsCli::parse();

    let pacing = PacingWindow::new(
        Duration::from_millis(cli.delay_min_ms),
        Duration::from_millis(cli.delay_max_ms),
    )?;
    let mut scan = CorpusScan::new(
        SuggestEndpoint::new(cli.suggest_url.clone(), cli.query_param.as_str()),
        &cli.out,
    )?
    .with_prefix_len(cli.prefix_len)
    .with_max_prefixes(cli.max_prefixes)
    .with_save_every(cli.save_every)
    .with_pacing(pacing)
    .with_resume(cli.resume);
    if let Some(selector) = &cli.option_selector {
        scan = scan.with_option_selector(selector)?;
    }

    let mut launcher = HttpLauncher::new(IdentityProfile {
        user_agent: cli.user_agent.clone(),
        ..IdentityProfile::default()
    });
    if let Some(path) = &cli.cookie_file {
        launcher = launcher.with_cookie_file(path.clone());
    }
    let mut manager = SessionManager::new(Arc::new(launcher), RestartPolicy::default());

    let report = scan
        .run(&mut manager)
        .await
        .context("keyword scan failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
