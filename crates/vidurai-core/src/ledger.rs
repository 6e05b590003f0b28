//! Ledger - Append-only audit of every forgetting decision
//!
//! One JSON object per line, appended with an explicit flush and fsync per
//! record. Existing bytes are never rewritten; rotation renames the file
//! and starts a fresh one. Readers parse line by line and treat a
//! truncated tail line as absent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Hard cap on query results
pub const MAX_QUERY_RESULTS: usize = 1000;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("ledger lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, LedgerError>;

// ============================================================================
// EVENT TYPES
// ============================================================================

/// The forgetting-decision taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEventType {
    Consolidation,
    Aggregation,
    Decay,
    Unlearn,
    Archive,
    Migration,
}

impl LedgerEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEventType::Consolidation => "consolidation",
            LedgerEventType::Aggregation => "aggregation",
            LedgerEventType::Decay => "decay",
            LedgerEventType::Unlearn => "unlearn",
            LedgerEventType::Archive => "archive",
            LedgerEventType::Migration => "migration",
        }
    }
}

/// One audit record. Everything needed to answer "what happened to my
/// memories and why" without the hot store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: LedgerEventType,
    /// Specific action within the type (e.g. "passive_decay",
    /// "write_failed", "archive_verify_failed")
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    pub memories_before: i64,
    pub memories_after: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub memories_removed: Vec<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consolidated_into: Vec<i64>,
    #[serde(default)]
    pub entities_preserved: u32,
    #[serde(default)]
    pub root_causes_preserved: u32,
    #[serde(default)]
    pub resolutions_preserved: u32,
    pub reason: String,
    /// Which policy made the decision ("rule_based", "rl_based", "user")
    pub policy: String,
    pub reversible: bool,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl LedgerEvent {
    /// A minimal record with the required fields; callers fill in the rest
    pub fn new(event_type: LedgerEventType, action: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            action: action.into(),
            project_path: None,
            memories_before: 0,
            memories_after: 0,
            memories_removed: Vec::new(),
            consolidated_into: Vec::new(),
            entities_preserved: 0,
            root_causes_preserved: 0,
            resolutions_preserved: 0,
            reason: String::new(),
            policy: "rule_based".to_string(),
            reversible: false,
            details: serde_json::Value::Null,
        }
    }
}

// ============================================================================
// QUERY & STATS
// ============================================================================

/// Filter for ledger queries; all fields are conjunctive
#[derive(Debug, Clone, Default)]
pub struct LedgerFilter {
    pub project_path: Option<String>,
    pub event_type: Option<LedgerEventType>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Clamped to MAX_QUERY_RESULTS
    pub limit: Option<usize>,
}

impl LedgerFilter {
    fn matches(&self, event: &LedgerEvent) -> bool {
        if let Some(p) = &self.project_path {
            if event.project_path.as_deref() != Some(p.as_str()) {
                return false;
            }
        }
        if let Some(t) = self.event_type {
            if event.event_type != t {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.timestamp > until {
                return false;
            }
        }
        true
    }
}

/// Aggregate view over the whole ledger file
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStats {
    pub total_events: u64,
    pub consolidations: u64,
    pub aggregations: u64,
    pub decays: u64,
    pub unlearns: u64,
    pub archives: u64,
    pub migrations: u64,
    pub memories_removed: u64,
    pub memories_preserved: u64,
    /// Mean after/before ratio across consolidation entries
    pub mean_compression_ratio: f64,
    pub first_event: Option<DateTime<Utc>>,
    pub last_event: Option<DateTime<Utc>>,
}

// ============================================================================
// LEDGER
// ============================================================================

/// The append-only audit file. Exactly one Ledger value owns the handle;
/// the writer task appends through it after each mutation commit.
pub struct Ledger {
    path: PathBuf,
    file: Mutex<File>,
}

impl Ledger {
    /// Open (or create) the ledger at `path` in append mode
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record: serialize, write, flush, fsync. The record is
    /// durable when this returns Ok.
    pub fn append(&self, event: &LedgerEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        let mut file = self.file.lock().map_err(|_| LedgerError::Poisoned)?;
        writeln!(file, "{line}")?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    /// Rotate by renaming the current file to a timestamped sibling and
    /// starting a fresh one. Never edits existing bytes.
    pub fn rotate(&self) -> Result<PathBuf> {
        let mut file = self.file.lock().map_err(|_| LedgerError::Poisoned)?;
        file.sync_data()?;

        let stamp = Utc::now().format("%Y%m%dT%H%M%S");
        let rotated = self.path.with_file_name(format!(
            "{}-{stamp}.jsonl",
            self.path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "ledger".to_string())
        ));
        std::fs::rename(&self.path, &rotated)?;

        *file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        tracing::info!(rotated = %rotated.display(), "ledger rotated");
        Ok(rotated)
    }

    /// Query matching records, oldest first, capped
    pub fn query(&self, filter: &LedgerFilter) -> Result<Vec<LedgerEvent>> {
        let cap = filter.limit.unwrap_or(MAX_QUERY_RESULTS).min(MAX_QUERY_RESULTS);
        let mut out = Vec::new();
        for event in self.read_all()? {
            if filter.matches(&event) {
                out.push(event);
                if out.len() >= cap {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Aggregate statistics over the current file
    pub fn stats(&self) -> Result<LedgerStats> {
        let mut stats = LedgerStats::default();
        let mut ratio_sum = 0.0;
        let mut ratio_count = 0u64;

        for event in self.read_all()? {
            stats.total_events += 1;
            match event.event_type {
                LedgerEventType::Consolidation => {
                    stats.consolidations += 1;
                    if event.memories_before > 0 {
                        ratio_sum += event.memories_after as f64 / event.memories_before as f64;
                        ratio_count += 1;
                    }
                }
                LedgerEventType::Aggregation => stats.aggregations += 1,
                LedgerEventType::Decay => stats.decays += 1,
                LedgerEventType::Unlearn => stats.unlearns += 1,
                LedgerEventType::Archive => stats.archives += 1,
                LedgerEventType::Migration => stats.migrations += 1,
            }
            stats.memories_removed += event.memories_removed.len() as u64;
            stats.memories_preserved += event.consolidated_into.len() as u64;
            if stats.first_event.is_none() {
                stats.first_event = Some(event.timestamp);
            }
            stats.last_event = Some(event.timestamp);
        }

        if ratio_count > 0 {
            stats.mean_compression_ratio = ratio_sum / ratio_count as f64;
        }
        Ok(stats)
    }

    /// Read every parseable record. A truncated tail (torn final write)
    /// is ignored; a malformed line elsewhere is skipped with a warning
    /// rather than failing the whole read.
    pub fn read_all(&self) -> Result<Vec<LedgerEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut line_no = 0usize;
        let mut lines = reader.lines().peekable();

        while let Some(line) = lines.next() {
            let line = line?;
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LedgerEvent>(&line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    if lines.peek().is_none() {
                        // Truncated tail from an interrupted append
                        tracing::debug!(line = line_no, "ignoring truncated ledger tail");
                    } else {
                        tracing::warn!(line = line_no, error = %e, "skipping malformed ledger line");
                    }
                }
            }
        }
        Ok(events)
    }
}

// ============================================================================
// TESTS
// ============================================================================
