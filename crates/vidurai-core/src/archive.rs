//! Archiver - Atomic hot-to-cold migration
//!
//! Moves PENDING_DECAY memories past the grace interval into the
//! partitioned Parquet archive. The protocol is write-verify-delete:
//! rows are written to a temp file in the target partition, read back
//! and checksummed, and only then deleted from the hot store (through
//! the writer, in one transaction, with the ledger recording both
//! halves). A failed verification aborts without deleting anything and
//! retries next tick with exponential backoff.
//!
//! The cold schema mirrors the hot row schema plus `archived_at`; every
//! new hot column extends cold.

use arrow::array::{Array, ArrayRef, BooleanArray, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Datelike, Duration, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::fingerprint;
use crate::ledger::{Ledger, LedgerEvent, LedgerEventType};
use crate::memory::Memory;
use crate::store::{Store, StoreError};

/// PENDING_DECAY rows younger than this are left alone (aggregation
/// rollback may still reclaim them)
pub const ARCHIVE_GRACE_HOURS: i64 = 1;
/// Rows per archive tick
const ARCHIVE_BATCH: usize = 512;
/// Backoff cap between failed attempts
const MAX_BACKOFF_MINUTES: i64 = 60;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("archive io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    /// The cold write did not match what was selected from hot
    #[error("archive verification failed: {0}")]
    VerifyFailed(String),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

// ============================================================================
// REPORTS & STATS
// ============================================================================

/// What one archive tick did
#[derive(Debug, Clone, Default)]
pub struct ArchiveReport {
    pub archived: usize,
    pub partitions_written: usize,
    pub verify_failed: bool,
    pub backing_off: bool,
}

/// Aggregate view over cold storage, a hygiene-policy signal
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ColdStats {
    pub total_rows: u64,
    pub rows_by_month: BTreeMap<String, u64>,
    pub rows_by_project: BTreeMap<i64, u64>,
    pub rows_by_event_type: BTreeMap<String, u64>,
}

// ============================================================================
// ARCHIVER
// ============================================================================

pub struct Archiver {
    store: Arc<Store>,
    ledger: Arc<Ledger>,
    root: PathBuf,
    consecutive_failures: u32,
    backoff_until: Option<DateTime<Utc>>,
    /// Fault injector for the verification step (exercised by the
    /// failure-path tests; never set in normal operation)
    fail_next_verify: AtomicBool,
}

impl Archiver {
    pub fn new(store: Arc<Store>, ledger: Arc<Ledger>, root: PathBuf) -> Self {
        Self {
            store,
            ledger,
            root,
            consecutive_failures: 0,
            backoff_until: None,
            fail_next_verify: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Force the next verification to fail once
    pub fn inject_verify_failure(&self) {
        self.fail_next_verify.store(true, Ordering::SeqCst);
    }

    /// One archive tick at simulated time `now`
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<ArchiveReport> {
        let mut report = ArchiveReport::default();

        if let Some(until) = self.backoff_until {
            if now < until {
                report.backing_off = true;
                return Ok(report);
            }
        }

        self.sweep_temp_files();

        let cutoff = now - Duration::hours(ARCHIVE_GRACE_HOURS);
        let batch = self.store.archive_candidates(cutoff, ARCHIVE_BATCH)?;
        if batch.is_empty() {
            self.consecutive_failures = 0;
            self.backoff_until = None;
            return Ok(report);
        }

        for (partition, rows) in partition_by_month(&batch) {
            match self.archive_partition(&partition, &rows, now).await {
                Ok(count) => {
                    report.archived += count;
                    report.partitions_written += 1;
                }
                Err(ArchiveError::VerifyFailed(detail)) => {
                    report.verify_failed = true;
                    self.consecutive_failures += 1;
                    let minutes = (1i64 << self.consecutive_failures.min(6))
                        .min(MAX_BACKOFF_MINUTES);
                    self.backoff_until = Some(now + Duration::minutes(minutes));

                    let mut record =
                        LedgerEvent::new(LedgerEventType::Archive, "archive_verify_failed");
                    record.memories_before = rows.len() as i64;
                    record.memories_after = rows.len() as i64;
                    record.reason = detail.clone();
                    record.policy = "archiver".into();
                    if let Err(e) = self.ledger.append(&record) {
                        tracing::error!(error = %e, "failed to record archive failure");
                    }
                    tracing::warn!(
                        partition = %partition,
                        backoff_minutes = minutes,
                        "archive verification failed; batch stays pending_decay"
                    );
                    return Ok(report);
                }
                Err(e) => return Err(e),
            }
        }

        self.consecutive_failures = 0;
        self.backoff_until = None;
        Ok(report)
    }

    /// Write-verify-delete for one partition's rows
    async fn archive_partition(
        &self,
        partition: &str,
        rows: &[&Memory],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let dir = self.root.join(partition);
        std::fs::create_dir_all(&dir)?;

        let file_name = format!("batch-{}.parquet", uuid::Uuid::new_v4());
        let tmp_path = dir.join(format!("{file_name}.tmp"));
        let final_path = dir.join(&file_name);

        // 1. WRITE to a temp file in the target partition
        let expected_checksum = write_parquet(&tmp_path, rows, now)?;

        // 2. VERIFY: file exists, row count matches, checksum matches
        let verify = self.verify(&tmp_path, rows.len(), expected_checksum);
        if let Err(e) = verify {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e);
        }
        std::fs::rename(&tmp_path, &final_path)?;

        // Cold half is durable; record it before touching hot
        let ids: Vec<i64> = rows.iter().map(|m| m.id).collect();
        let mut cold_record = LedgerEvent::new(LedgerEventType::Archive, "cold_written");
        cold_record.memories_before = ids.len() as i64;
        cold_record.memories_after = ids.len() as i64;
        cold_record.policy = "archiver".into();
        cold_record.details = serde_json::json!({
            "file": final_path.to_string_lossy(),
            "rows": ids.len(),
            "checksum": format!("{expected_checksum:016x}"),
        });
        if let Err(e) = self.ledger.append(&cold_record) {
            tracing::error!(error = %e, "failed to record cold write");
        }

        // 3. DELETE the batch from hot; the writer rejects anything that
        // is no longer pending_decay
        let mut hot_record = LedgerEvent::new(LedgerEventType::Archive, "hot_pruned");
        hot_record.reason = format!("archived to {partition}");
        hot_record.policy = "archiver".into();
        hot_record.details = serde_json::json!({ "file": final_path.to_string_lossy() });
        let deleted = self.store.writer().delete_archived(ids, hot_record).await?;

        tracing::info!(partition = %partition, rows = deleted, "archive batch committed");
        Ok(deleted)
    }

    fn verify(&self, path: &Path, expected_rows: usize, expected_checksum: u64) -> Result<()> {
        if self.fail_next_verify.swap(false, Ordering::SeqCst) {
            return Err(ArchiveError::VerifyFailed(
                "injected verification fault".into(),
            ));
        }
        if !path.exists() {
            return Err(ArchiveError::VerifyFailed(format!(
                "cold file missing: {}",
                path.display()
            )));
        }

        let (actual_rows, actual_checksum) = read_checksum(path)?;
        if actual_rows != expected_rows {
            return Err(ArchiveError::VerifyFailed(format!(
                "row count mismatch: wrote {expected_rows}, read {actual_rows}"
            )));
        }
        if actual_checksum != expected_checksum {
            return Err(ArchiveError::VerifyFailed(format!(
                "checksum mismatch: {expected_checksum:016x} != {actual_checksum:016x}"
            )));
        }
        Ok(())
    }

    /// Orphaned temp files from an interrupted run are safe to delete;
    /// their batches are still PENDING_DECAY in hot.
    fn sweep_temp_files(&self) {
        let Ok(partitions) = glob_partitions(&self.root) else {
            return;
        };
        for dir in partitions {
            let Ok(entries) = std::fs::read_dir(&dir) else { continue };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|e| e == "tmp") {
                    tracing::debug!(path = %path.display(), "removing orphaned archive temp file");
                    let _ = std::fs::remove_file(path);
                }
            }
        }
    }

    /// Analytic counts over the cold store
    pub fn cold_stats(&self) -> Result<ColdStats> {
        cold_stats_at(&self.root)
    }

    /// Read every cold row in one partition file (cold-to-hot recall)
    pub fn read_partition_file(&self, path: &Path) -> Result<Vec<ColdRow>> {
        read_rows(path)
    }
}

/// Analytic counts over a cold store root; callable without an Archiver
/// (the stats surface reads cold storage directly)
pub fn cold_stats_at(root: &Path) -> Result<ColdStats> {
    let mut stats = ColdStats::default();
    for dir in glob_partitions(root)? {
        let month_key = month_key_of(&dir);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "parquet") {
                count_file(&path, &month_key, &mut stats)?;
            }
        }
    }
    Ok(stats)
}

/// One row as stored cold; mirrors the hot schema plus `archived_at`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColdRow {
    pub id: i64,
    pub project_id: i64,
    pub verbatim: String,
    pub gist: String,
    pub tags: String,
    pub event_type: String,
    pub file_path: Option<String>,
    pub line_number: Option<i64>,
    pub language: Option<String>,
    pub salience: String,
    pub status: String,
    pub outcome: i64,
    pub fingerprint: String,
    pub repeat_count: i64,
    pub access_count: i64,
    pub last_accessed: String,
    pub pinned: bool,
    pub created_at: String,
    pub expires_at: Option<String>,
    pub decay_reason: Option<String>,
    pub archived_at: String,
}

// ============================================================================
// PARQUET PLUMBING
// ============================================================================

/// The cold schema. Kept in lockstep with the hot `memories` table;
/// timestamps are RFC 3339 text exactly as the hot store holds them.
pub fn cold_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("project_id", DataType::Int64, false),
        Field::new("verbatim", DataType::Utf8, false),
        Field::new("gist", DataType::Utf8, false),
        Field::new("tags", DataType::Utf8, false),
        Field::new("event_type", DataType::Utf8, false),
        Field::new("file_path", DataType::Utf8, true),
        Field::new("line_number", DataType::Int64, true),
        Field::new("language", DataType::Utf8, true),
        Field::new("salience", DataType::Utf8, false),
        Field::new("status", DataType::Utf8, false),
        Field::new("outcome", DataType::Int64, false),
        Field::new("fingerprint", DataType::Utf8, false),
        Field::new("repeat_count", DataType::Int64, false),
        Field::new("access_count", DataType::Int64, false),
        Field::new("last_accessed", DataType::Utf8, false),
        Field::new("pinned", DataType::Boolean, false),
        Field::new("created_at", DataType::Utf8, false),
        Field::new("expires_at", DataType::Utf8, true),
        Field::new("decay_reason", DataType::Utf8, true),
        Field::new("archived_at", DataType::Utf8, false),
    ]))
}

/// Sequential FNV over the rows' identity-bearing fields; recomputed on
/// read-back for verification
fn row_checksum(ids: &[i64], fingerprints: &[&str], verbatims: &[&str]) -> u64 {
    let mut buf = Vec::new();
    for i in 0..ids.len() {
        buf.extend_from_slice(&ids[i].to_le_bytes());
        buf.extend_from_slice(fingerprints[i].as_bytes());
        buf.extend_from_slice(verbatims[i].as_bytes());
        buf.push(0x1f);
    }
    fingerprint::fnv1a(&buf)
}

fn write_parquet(path: &Path, rows: &[&Memory], archived_at: DateTime<Utc>) -> Result<u64> {
    let schema = cold_schema();
    let archived = archived_at.to_rfc3339();

    let ids: Vec<i64> = rows.iter().map(|m| m.id).collect();
    let fingerprints: Vec<&str> = rows.iter().map(|m| m.fingerprint.as_str()).collect();
    let verbatims: Vec<&str> = rows.iter().map(|m| m.verbatim.as_str()).collect();
    let checksum = row_checksum(&ids, &fingerprints, &verbatims);

    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(ids.clone())),
        Arc::new(Int64Array::from(
            rows.iter().map(|m| m.project_id).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(verbatims.clone())),
        Arc::new(StringArray::from(
            rows.iter().map(|m| m.gist.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter()
                .map(|m| serde_json::to_string(&m.tags).unwrap_or_else(|_| "[]".into()))
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|m| m.event_type.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|m| m.file_path.clone()).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(
            rows.iter()
                .map(|m| m.line_number.map(|l| l as i64))
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|m| m.language.clone()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|m| m.salience.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(vec!["archived"; rows.len()])),
        Arc::new(Int64Array::from(
            rows.iter().map(|m| m.outcome as i64).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(fingerprints.clone())),
        Arc::new(Int64Array::from(
            rows.iter().map(|m| m.repeat_count).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(
            rows.iter().map(|m| m.access_count).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter()
                .map(|m| m.last_accessed.to_rfc3339())
                .collect::<Vec<_>>(),
        )),
        Arc::new(BooleanArray::from(
            rows.iter().map(|m| m.pinned).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter()
                .map(|m| m.created_at.to_rfc3339())
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter()
                .map(|m| m.expires_at.map(|t| t.to_rfc3339()))
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|m| m.decay_reason.clone()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(vec![archived.as_str(); rows.len()])),
    ];

    let batch = RecordBatch::try_new(schema.clone(), columns)?;
    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(checksum)
}

fn read_rows(path: &Path) -> Result<Vec<ColdRow>> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    fn opt_string(array: &StringArray, i: usize) -> Option<String> {
        if array.is_null(i) {
            None
        } else {
            Some(array.value(i).to_string())
        }
    }

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch?;
        let ids = column_as::<Int64Array>(&batch, "id");
        let project_ids = column_as::<Int64Array>(&batch, "project_id");
        let verbatims = column_as::<StringArray>(&batch, "verbatim");
        let gists = column_as::<StringArray>(&batch, "gist");
        let tags = column_as::<StringArray>(&batch, "tags");
        let event_types = column_as::<StringArray>(&batch, "event_type");
        let file_paths = column_as::<StringArray>(&batch, "file_path");
        let line_numbers = column_as::<Int64Array>(&batch, "line_number");
        let languages = column_as::<StringArray>(&batch, "language");
        let saliences = column_as::<StringArray>(&batch, "salience");
        let statuses = column_as::<StringArray>(&batch, "status");
        let outcomes = column_as::<Int64Array>(&batch, "outcome");
        let fingerprints = column_as::<StringArray>(&batch, "fingerprint");
        let repeat_counts = column_as::<Int64Array>(&batch, "repeat_count");
        let access_counts = column_as::<Int64Array>(&batch, "access_count");
        let last_accesseds = column_as::<StringArray>(&batch, "last_accessed");
        let pinneds = column_as::<BooleanArray>(&batch, "pinned");
        let created_ats = column_as::<StringArray>(&batch, "created_at");
        let expires_ats = column_as::<StringArray>(&batch, "expires_at");
        let decay_reasons = column_as::<StringArray>(&batch, "decay_reason");
        let archived_ats = column_as::<StringArray>(&batch, "archived_at");

        for i in 0..batch.num_rows() {
            rows.push(ColdRow {
                id: ids.value(i),
                project_id: project_ids.value(i),
                verbatim: verbatims.value(i).to_string(),
                gist: gists.value(i).to_string(),
                tags: tags.value(i).to_string(),
                event_type: event_types.value(i).to_string(),
                file_path: opt_string(file_paths, i),
                line_number: if line_numbers.is_null(i) {
                    None
                } else {
                    Some(line_numbers.value(i))
                },
                language: opt_string(languages, i),
                salience: saliences.value(i).to_string(),
                status: statuses.value(i).to_string(),
                outcome: outcomes.value(i),
                fingerprint: fingerprints.value(i).to_string(),
                repeat_count: repeat_counts.value(i),
                access_count: access_counts.value(i),
                last_accessed: last_accesseds.value(i).to_string(),
                pinned: pinneds.value(i),
                created_at: created_ats.value(i).to_string(),
                expires_at: opt_string(expires_ats, i),
                decay_reason: opt_string(decay_reasons, i),
                archived_at: archived_ats.value(i).to_string(),
            });
        }
    }
    Ok(rows)
}

fn read_checksum(path: &Path) -> Result<(usize, u64)> {
    let rows = read_rows(path)?;
    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    let fingerprints: Vec<&str> = rows.iter().map(|r| r.fingerprint.as_str()).collect();
    let verbatims: Vec<&str> = rows.iter().map(|r| r.verbatim.as_str()).collect();
    Ok((rows.len(), row_checksum(&ids, &fingerprints, &verbatims)))
}

fn column_as<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> &'a T {
    batch
        .column_by_name(name)
        .unwrap_or_else(|| panic!("cold schema column {name} missing"))
        .as_any()
        .downcast_ref::<T>()
        .unwrap_or_else(|| panic!("cold schema column {name} has unexpected type"))
}

fn count_file(path: &Path, month_key: &str, stats: &mut ColdStats) -> Result<()> {
    for row in read_rows(path)? {
        stats.total_rows += 1;
        *stats.rows_by_month.entry(month_key.to_string()).or_default() += 1;
        *stats.rows_by_project.entry(row.project_id).or_default() += 1;
        *stats
            .rows_by_event_type
            .entry(row.event_type.clone())
            .or_default() += 1;
    }
    Ok(())
}

/// Partition key from a memory's creation month
fn partition_by_month<'a>(batch: &'a [Memory]) -> BTreeMap<String, Vec<&'a Memory>> {
    let mut partitions: BTreeMap<String, Vec<&Memory>> = BTreeMap::new();
    for memory in batch {
        let key = format!(
            "year={:04}/month={:02}",
            memory.created_at.year(),
            memory.created_at.month()
        );
        partitions.entry(key).or_default().push(memory);
    }
    partitions
}

fn glob_partitions(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    if !root.exists() {
        return Ok(dirs);
    }
    for year in std::fs::read_dir(root)? {
        let year = year?.path();
        if !year.is_dir() {
            continue;
        }
        for month in std::fs::read_dir(&year)? {
            let month = month?.path();
            if month.is_dir() {
                dirs.push(month);
            }
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn month_key_of(dir: &Path) -> String {
    let month = dir
        .file_name()
        .map(|m| m.to_string_lossy().replace("month=", ""))
        .unwrap_or_default();
    let year = dir
        .parent()
        .and_then(|p| p.file_name())
        .map(|y| y.to_string_lossy().replace("year=", ""))
        .unwrap_or_default();
    format!("{year}-{month}")
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::memory::{MemoryDraft, MemoryStatus, Salience};
    use tempfile::TempDir;
    use uuid::Uuid;

    async fn seed_pending(store: &Arc<Store>, count: usize) -> Vec<i64> {
        let mut ids = Vec::new();
        for i in 0..count {
            let verbatim = format!("stale event {i}");
            let draft = MemoryDraft {
                event_id: Uuid::new_v4(),
                project_path: "/p".into(),
                verbatim: verbatim.clone(),
                gist: verbatim.clone(),
                tags: vec![],
                event_type: "diagnostic".into(),
                file_path: Some("src/old.rs".into()),
                line_number: None,
                language: None,
                salience: Salience::Low,
                fingerprint: crate::fingerprint::fingerprint(
                    &verbatim,
                    "diagnostic",
                    Some("src/old.rs"),
                    None,
                ),
                timestamp: Utc::now(),
                redactions: 0,
            };
            ids.push(store.writer().ingest(draft).await.unwrap().memory_id.unwrap());
        }
        store
            .writer()
            .set_status(
                ids.clone(),
                MemoryStatus::PendingDecay,
                "passive_decay",
                LedgerEvent::new(LedgerEventType::Decay, "passive_decay"),
            )
            .await
            .unwrap();
        ids
    }

    fn open() -> (TempDir, Arc<Store>, Arc<Ledger>, Archiver) {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(Ledger::open(dir.path().join("ledger.jsonl")).unwrap());
        let store = Arc::new(
            Store::open(
                &dir.path().join("vidurai.db"),
                &Config::default(),
                Arc::clone(&ledger),
            )
            .unwrap(),
        );
        let archiver = Archiver::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            dir.path().join("archive"),
        );
        (dir, store, ledger, archiver)
    }

    #[tokio::test]
    async fn test_archive_moves_rows_to_cold() {
        let (_dir, store, _ledger, mut archiver) = open();
        let ids = seed_pending(&store, 10).await;

        let later = Utc::now() + Duration::hours(2);
        let report = archiver.tick(later).await.unwrap();
        assert_eq!(report.archived, 10);
        assert!(!report.verify_failed);

        // Hot rows are gone
        for id in &ids {
            assert!(store.get_memory(*id).unwrap().is_none());
        }

        // Cold rows hold the same payloads
        let stats = archiver.cold_stats().unwrap();
        assert_eq!(stats.total_rows, 10);
        assert_eq!(stats.rows_by_event_type.get("diagnostic"), Some(&10));
        store.shutdown();
    }

    #[tokio::test]
    async fn test_failed_verify_deletes_nothing_and_retries() {
        let (_dir, store, ledger, mut archiver) = open();
        let ids = seed_pending(&store, 100).await;

        archiver.inject_verify_failure();
        let later = Utc::now() + Duration::hours(2);
        let report = archiver.tick(later).await.unwrap();
        assert!(report.verify_failed);
        assert_eq!(report.archived, 0);

        // No hot rows deleted; batch stays pending_decay
        assert_eq!(
            store.count_with_status(MemoryStatus::PendingDecay).unwrap(),
            100
        );
        let failures = ledger
            .read_all()
            .unwrap()
            .into_iter()
            .filter(|e| e.action == "archive_verify_failed")
            .count();
        assert_eq!(failures, 1);

        // Second tick, past the backoff, succeeds and removes exactly
        // those rows
        let retry_at = later + Duration::hours(1);
        let report = archiver.tick(retry_at).await.unwrap();
        assert_eq!(report.archived, 100);
        for id in &ids {
            assert!(store.get_memory(*id).unwrap().is_none());
        }
        assert_eq!(archiver.cold_stats().unwrap().total_rows, 100);
        store.shutdown();
    }

    #[tokio::test]
    async fn test_backoff_skips_early_retry() {
        let (_dir, store, _ledger, mut archiver) = open();
        seed_pending(&store, 5).await;

        archiver.inject_verify_failure();
        let later = Utc::now() + Duration::hours(2);
        archiver.tick(later).await.unwrap();

        // Immediately after the failure we are inside the backoff window
        let report = archiver.tick(later + Duration::seconds(30)).await.unwrap();
        assert!(report.backing_off);
        assert_eq!(report.archived, 0);
        store.shutdown();
    }

    #[tokio::test]
    async fn test_cold_rows_match_hot_payloads() {
        let (_dir, store, _ledger, mut archiver) = open();
        seed_pending(&store, 3).await;
        let hot_before: Vec<Memory> = store
            .archive_candidates(Utc::now() + Duration::hours(2), 100)
            .unwrap();

        archiver.tick(Utc::now() + Duration::hours(2)).await.unwrap();

        let partitions = glob_partitions(archiver.root()).unwrap();
        assert_eq!(partitions.len(), 1);
        let file = std::fs::read_dir(&partitions[0])
            .unwrap()
            .flatten()
            .map(|e| e.path())
            .find(|p| p.extension().is_some_and(|e| e == "parquet"))
            .unwrap();

        let cold = archiver.read_partition_file(&file).unwrap();
        assert_eq!(cold.len(), hot_before.len());
        for row in &cold {
            let original = hot_before.iter().find(|m| m.id == row.id).unwrap();
            assert_eq!(row.verbatim, original.verbatim);
            assert_eq!(row.fingerprint, original.fingerprint);
            assert_eq!(row.status, "archived");
            assert!(!row.archived_at.is_empty());
        }
        store.shutdown();
    }

    #[tokio::test]
    async fn test_grace_period_holds_young_rows() {
        let (_dir, store, _ledger, mut archiver) = open();
        seed_pending(&store, 5).await;

        // Rows transitioned seconds ago; inside the grace window
        let report = archiver.tick(Utc::now()).await.unwrap();
        assert_eq!(report.archived, 0);
        assert_eq!(
            store.count_with_status(MemoryStatus::PendingDecay).unwrap(),
            5
        );
        store.shutdown();
    }
}
