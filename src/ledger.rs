//! Dedup ledger: posting keys that were already delivered.
//!
//! The whole ledger is read once when a run starts, mutated in memory, and written back by a
//! single [`Ledger::flush`] at the end of the run. A missing or corrupt store degrades to an
//! empty ledger. Retention is applied lazily: expired entries read as unseen and are dropped at
//! flush time. Entries are decoded one by one: a key whose record is malformed still counts as
//! delivered, it just never expires.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::LedgerError;

/// File name of the ledger inside the state directory.
pub const LEDGER_FILE: &str = "sent.json";

/// Delivery record for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    /// When the key was marked. `None` when the stored timestamp was missing or unreadable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
    /// Posting title at delivery time.
    pub title: String,
}

impl LedgerEntry {
    /// Record marked at `at`.
    pub fn new(at: DateTime<Utc>, title: impl Into<String>) -> Self {
        Self {
            at: Some(at),
            title: title.into(),
        }
    }

    fn from_value(value: &Value) -> Self {
        let at = value
            .get("at")
            .and_then(|at| match at {
                Value::String(raw) => DateTime::parse_from_rfc3339(raw.trim())
                    .ok()
                    .map(|at| at.with_timezone(&Utc)),
                Value::Number(ms) => ms.as_i64().and_then(DateTime::from_timestamp_millis),
                _ => None,
            })
            .or_else(|| value.as_i64().and_then(DateTime::from_timestamp_millis));
        let title = value
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self { at, title }
    }
}

impl<'de> Deserialize<'de> for LedgerEntry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Value::deserialize(deserializer).map(|value| Self::from_value(&value))
    }
}

/// Persisted form: `{"sent": {key: {at, title}}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerFile {
    /// Delivered keys.
    #[serde(default)]
    pub sent: BTreeMap<String, LedgerEntry>,
}

/// Durable backend for the ledger.
pub trait LedgerStore: Send + Sync {
    /// Reads the persisted ledger. A store that does not exist yet yields an empty ledger.
    fn load(&self) -> Result<LedgerFile, LedgerError>;
    /// Replaces the persisted ledger in one step.
    fn save(&self, file: &LedgerFile) -> Result<(), LedgerError>;
}

/// JSON file backend written with temp file + rename.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Store at an explicit path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<state_dir>/sent.json`.
    pub fn in_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(LEDGER_FILE))
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> LedgerError {
        LedgerError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl LedgerStore for JsonFileStore {
    fn load(&self) -> Result<LedgerFile, LedgerError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(LedgerFile::default()),
            Err(err) => return Err(self.io_error(err)),
        };
        serde_json::from_str(&raw).map_err(|source| LedgerError::Decode {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, file: &LedgerFile) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| self.io_error(err))?;
        }
        let encoded = serde_json::to_vec_pretty(file)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, encoded).map_err(|err| self.io_error(err))?;
        fs::rename(&tmp, &self.path).map_err(|err| self.io_error(err))
    }
}

/// Process-local backend, used when no state directory is configured.
#[derive(Debug, Default)]
pub struct MemoryStore {
    file: Mutex<LedgerFile>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-filled with `file`.
    pub fn with_file(file: LedgerFile) -> Self {
        Self {
            file: Mutex::new(file),
        }
    }

    /// Copy of the last saved state.
    pub fn snapshot(&self) -> LedgerFile {
        match self.file.lock() {
            Ok(file) => file.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl LedgerStore for MemoryStore {
    fn load(&self) -> Result<LedgerFile, LedgerError> {
        Ok(self.snapshot())
    }

    fn save(&self, file: &LedgerFile) -> Result<(), LedgerError> {
        let mut guard = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = file.clone();
        Ok(())
    }
}

/// In-memory view of the ledger for the duration of one run.
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    file: LedgerFile,
    retention: Option<chrono::Duration>,
    degraded: bool,
}

impl Ledger {
    /// Reads the store, falling back to an empty ledger when it cannot be read.
    pub fn load(store: Arc<dyn LedgerStore>, retention: Option<Duration>) -> Self {
        let (file, degraded) = match store.load() {
            Ok(file) => (file, false),
            Err(err) => {
                warn!(error = %err, "ledger unreadable, starting empty");
                (LedgerFile::default(), true)
            }
        };
        debug!(entries = file.sent.len(), "ledger loaded");
        Self {
            store,
            file,
            retention: retention.and_then(|ttl| chrono::Duration::from_std(ttl).ok()),
            degraded,
        }
    }

    /// True when the stored state could not be read at load time.
    pub fn degraded(&self) -> bool {
        self.degraded
    }

    /// Number of entries held, expired ones included until the next flush.
    pub fn len(&self) -> usize {
        self.file.sent.len()
    }

    /// True when no entry is held.
    pub fn is_empty(&self) -> bool {
        self.file.sent.is_empty()
    }

    /// Whether `key` was delivered within the retention window.
    pub fn seen(&self, key: &str) -> bool {
        self.seen_at(key, Utc::now())
    }

    fn seen_at(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.file
            .sent
            .get(key)
            .is_some_and(|entry| !self.is_expired(entry, now))
    }

    fn is_expired(&self, entry: &LedgerEntry, now: DateTime<Utc>) -> bool {
        match (self.retention, entry.at) {
            (Some(ttl), Some(at)) => now - at > ttl,
            _ => false,
        }
    }

    /// Records `key` as delivered now.
    pub fn mark(&mut self, key: impl Into<String>, title: impl Into<String>) {
        self.file
            .sent
            .insert(key.into(), LedgerEntry::new(Utc::now(), title));
    }

    /// Drops expired entries and writes the ledger back. Called once, at the end of a run.
    pub fn flush(&mut self) -> Result<usize, LedgerError> {
        let now = Utc::now();
        let before = self.file.sent.len();
        if let Some(ttl) = self.retention {
            self.file
                .sent
                .retain(|_, entry| entry.at.map_or(true, |at| now - at <= ttl));
        }
        let pruned = before - self.file.sent.len();
        self.store.save(&self.file)?;
        info!(entries = self.file.sent.len(), pruned, "ledger flushed");
        Ok(pruned)
    }
}
