//! Error taxonomy shared by the harvesting pipeline.
//!
//! Only [`HarvestError`] escapes a run. Everything else is absorbed at the component boundary
//! and surfaced through logs and the run summary.

use std::path::PathBuf;
use thiserror::Error;

use crate::driver::SessionError;

/// Invalid operator configuration detected before a run starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The pacing window has `min > max`.
    #[error("pacing window is inverted: min {min_ms}ms > max {max_ms}ms")]
    InvertedPacing {
        /// Lower bound in milliseconds.
        min_ms: u64,
        /// Upper bound in milliseconds.
        max_ms: u64,
    },
    /// A zero failure threshold would restart the session on every call.
    #[error("failure threshold must be at least 1")]
    ZeroFailureThreshold,
    /// A CSS selector in a source profile did not parse.
    #[error("invalid selector `{selector}`: {message}")]
    Selector {
        /// The offending selector text.
        selector: String,
        /// Parser diagnostic.
        message: String,
    },
    /// A configured URL did not parse.
    #[error("invalid url `{value}`: {source}")]
    Url {
        /// Raw value supplied by the operator.
        value: String,
        /// Underlying parse failure.
        #[source]
        source: url::ParseError,
    },
    /// A viewport string was not `WIDTHxHEIGHT`.
    #[error("invalid viewport `{0}`, expected WIDTHxHEIGHT")]
    Viewport(String),
    /// The trusted catalog file could not be read or decoded.
    #[error("failed to load catalog {path}: {message}")]
    Catalog {
        /// Catalog path.
        path: PathBuf,
        /// Read or decode diagnostic.
        message: String,
    },
    /// The messaging client could not be set up.
    #[error("invalid messaging setup: {0}")]
    Messaging(String),
}

/// Ledger persistence failures. Loading never returns these; flushing may.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Filesystem failure while writing the ledger.
    #[error("ledger io error on {path}: {source}")]
    Io {
        /// File being written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The stored ledger is not valid JSON of the expected shape.
    #[error("ledger {path} is corrupt: {source}")]
    Decode {
        /// File being read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// The in-memory ledger could not be serialized.
    #[error("ledger serialization failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures that abort a whole run.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// No browser session could be obtained, at launch or during a restart.
    #[error("driver session unavailable: {0}")]
    Session(#[from] SessionError),
    /// Another run currently holds the run lock.
    #[error("a run is already in progress")]
    Busy,
}
