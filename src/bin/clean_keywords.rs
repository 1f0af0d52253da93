use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use jobharvest::bank::corpus_from_json;
use jobharvest::normalizer::clean_keywords;
use serde_json::{json, Value};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "jobharvest-clean-keywords",
    about = "Drop junk entries (ids, hashes, blobs, numbers) from a scraped keyword corpus"
)]
struct CleanCli {
    /// Raw corpus: a JSON array, or an object with the array under `data`.
    #[arg(long = "in", default_value = "keywords.json")]
    input: PathBuf,

    /// Cleaned corpus destination.
    #[arg(long = "out", default_value = "keywords.cleaned.json")]
    output: PathBuf,
}

fn main() -> Result<()> {
    jobharvest::init_tracing();
    let cli = CleanCli::parse();
    let raw = fs::read_to_string(&cli.input)
        .with_context(|| format!("failed to read {:?}", cli.input))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("{:?} is not valid JSON", cli.input))?;

    let original = corpus_from_json(&value);
    let cleaned = clean_keywords(&original);
    let removed = original.len().saturating_sub(cleaned.len());

    let output = match value {
        Value::Object(mut map) => {
            map.insert("originalCount".into(), json!(original.len()));
            map.insert("cleanedCount".into(), json!(cleaned.len()));
            map.insert("removed".into(), json!(removed));
            map.insert("data".into(), json!(cleaned));
            map.remove("keywords");
            Value::Object(map)
        }
        _ => json!(cleaned),
    };

    if let Some(parent) = cli.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("failed to create {:?}", parent))?;
    }
    fs::write(&cli.output, serde_json::to_string_pretty(&output)?)
        .with_context(|| format!("failed to write {:?}", cli.output))?;
    info!(
        original = original.len(),
        cleaned = cleaned.len(),
        removed,
        output = %cli.output.display(),
        "corpus cleaned"
    );
    Ok(())
}
