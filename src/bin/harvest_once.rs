use anyhow::{Context, Result};
use clap::Parser;
use jobharvest::runtime::{Harvester, RunReason, RunReport};
use jobharvest::Cli;

#[derive(Parser, Debug)]
#[command(
    name = "jobharvest-once",
    about = "Run one harvest pass and print its report as JSON"
)]
struct OnceCli {
    #[command(flatten)]
    harvest: Cli,

    /// Only build the relevance bank and report on it; no session is launched.
    #[arg(long, env = "JOBHARVEST_BANK_ONLY", default_value_t = false)]
    bank_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    jobharvest::init_tracing();
    let cli = OnceCli::parse();
    let harvester = Harvester::from_cli(&cli.harvest).context("invalid configuration")?;

    if cli.bank_only {
        let report = harvester.bank_report();
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let result = harvester.run_once(RunReason::Cli).await;
    let report = RunReport::new(RunReason::Cli, &result);
    println!("{}", serde_json::to_string_pretty(&report)?);
    result.context("harvest run failed")?;
    Ok(())
}
