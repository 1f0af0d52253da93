#![warn(missing_docs)]
//! Core library entry points for the jobharvest posting harvester.

pub mod bank;
pub mod controls;
pub mod corpus;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod extractors;
pub mod frontier;
pub mod ledger;
pub mod normalizer;
pub mod runtime;
pub mod scorer;
pub mod server;

pub use bank::{RelevanceBank, DEFAULT_SEEDS};
pub use controls::{Cli, DeliveryPolicy, HarvestControls, PacingWindow};
pub use dispatch::{Dispatcher, Notifier, TelegramNotifier};
pub use driver::{Browser, Launcher, Outcome, RestartPolicy, SessionManager};
pub use error::{ConfigError, HarvestError, LedgerError};
pub use extractors::{Extractor, Posting, Trust};
pub use frontier::{FrontierError, PostingFrontier};
pub use ledger::{JsonFileStore, Ledger, LedgerStore, MemoryStore};
pub use runtime::{Harvester, RunLock, RunReason, RunReport, RunSummary};
pub use scorer::{MatchResult, Scorer};

use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides the default `info` level.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
