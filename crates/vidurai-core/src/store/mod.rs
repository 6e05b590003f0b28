//! Durable Store - The single-writer hot store
//!
//! One SQLite database in WAL mode. Exactly one writer task owns the
//! write connection; every mutation is a typed command on a bounded
//! queue with a completion handle. Readers use a small pool of
//! read-only connections and never mutate.

pub mod migrations;
pub mod writer;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::ledger::Ledger;
use crate::memory::{Memory, MemoryStatus, PinEntry, Project, Salience};

pub use writer::{
    ConsolidatePlan, IngestOutcome, PinTarget, SummaryDraft, WriteCommand, WriterHandle,
};

/// Read connections in the pool
const READ_POOL_SIZE: usize = 4;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Store error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The hot DB cannot be opened; the engine refuses to start
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Row not found
    #[error("not found: {0}")]
    NotFound(String),
    /// A writer command failed; the caller decides whether to retry
    #[error("write failed: {0}")]
    WriteFailed(String),
    /// The writer has shut down
    #[error("writer queue closed")]
    QueueClosed,
    /// The bounded intake queue is full; sensors should back off
    #[error("intake queue full")]
    Backpressure,
    /// Precondition on the referenced rows no longer holds
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The consolidation plan was made against an outdated generation
    #[error("stale generation: planned {planned}, current {current}")]
    StaleGeneration { planned: u64, current: u64 },
    /// A reader lock was poisoned
    #[error("lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ============================================================================
// STATS
// ============================================================================

/// Aggregate view over the hot store
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total_memories: i64,
    pub total_projects: i64,
    pub pinned: i64,
    pub by_salience: BTreeMap<String, i64>,
    pub by_status: BTreeMap<String, i64>,
}

// ============================================================================
// CONNECTIONS
// ============================================================================

/// Apply PRAGMAs to the write connection
fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -64000;
         PRAGMA temp_store = MEMORY;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
}

/// Read-only connections skip the journal-mode change (a write op) but
/// keep the read-side tuning
fn configure_reader(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA cache_size = -16000;
         PRAGMA temp_store = MEMORY;
         PRAGMA busy_timeout = 5000;
         PRAGMA query_only = ON;",
    )
}

/// Shared column list so every query maps rows the same way
pub(crate) const MEMORY_COLUMNS: &str = "id, project_id, verbatim, gist, tags, event_type, \
     file_path, line_number, language, salience, status, outcome, fingerprint, repeat_count, \
     access_count, last_accessed, pinned, created_at, expires_at, decay_reason";

/// Map one row (selected with MEMORY_COLUMNS) to a Memory
pub(crate) fn memory_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Memory> {
    let tags_json: String = row.get(4)?;
    let salience_str: String = row.get(9)?;
    let status_str: String = row.get(10)?;

    let salience = Salience::parse_name(&salience_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            9,
            rusqlite::types::Type::Text,
            format!("unknown salience '{salience_str}'").into(),
        )
    })?;
    let status = MemoryStatus::parse_name(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            10,
            rusqlite::types::Type::Text,
            format!("unknown status '{status_str}'").into(),
        )
    })?;

    Ok(Memory {
        id: row.get(0)?,
        project_id: row.get(1)?,
        verbatim: row.get(2)?,
        gist: row.get(3)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        event_type: row.get(5)?,
        file_path: row.get(6)?,
        line_number: row.get::<_, Option<i64>>(7)?.map(|l| l as u32),
        language: row.get(8)?,
        salience,
        status,
        outcome: row.get::<_, i64>(11)? as i8,
        fingerprint: row.get(12)?,
        repeat_count: row.get(13)?,
        access_count: row.get(14)?,
        last_accessed: row.get(15)?,
        pinned: row.get::<_, i64>(16)? != 0,
        created_at: row.get(17)?,
        expires_at: row.get(18)?,
        decay_reason: row.get(19)?,
    })
}

/// Escape a user query for FTS5 MATCH: each term quoted, implicit AND
pub(crate) fn sanitize_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|t| format!("\"{}\"", t.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// READ POOL
// ============================================================================

/// A fixed pool of read-only connections. WAL lets these run concurrently
/// with the writer; a reader may block briefly waiting for a pool slot.
pub struct ReadPool {
    conns: Vec<Mutex<Connection>>,
    next: AtomicUsize,
}

impl ReadPool {
    fn open(path: &Path, size: usize) -> Result<Self> {
        let mut conns = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            configure_reader(&conn)?;
            conns.push(Mutex::new(conn));
        }
        Ok(Self {
            conns,
            next: AtomicUsize::new(0),
        })
    }

    /// Run a closure against one pooled connection
    pub fn with<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        let conn = self.conns[idx].lock().map_err(|_| StoreError::Poisoned)?;
        f(&conn)
    }
}

// ============================================================================
// STORE
// ============================================================================

/// The durable store facade: a writer handle plus the read pool.
///
/// All methods take `&self`; `Store` is `Send + Sync` and is shared as
/// `Arc<Store>` across the engine's tasks.
pub struct Store {
    path: PathBuf,
    writer: WriterHandle,
    readers: ReadPool,
    generation: Arc<AtomicU64>,
}

impl Store {
    /// Open the hot store: run migrations, start the writer task, open
    /// the read pool. Failure here is `StoreUnavailable` - fatal.
    pub fn open(db_path: &Path, config: &Config, ledger: Arc<Ledger>) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let write_conn = Connection::open(db_path)
            .map_err(|e| StoreError::Unavailable(format!("cannot open {}: {e}", db_path.display())))?;

        #[cfg(unix)]
        if db_path.exists() {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(db_path, perms);
        }

        configure_connection(&write_conn)?;
        migrations::apply_migrations(&write_conn)?;

        let generation = Arc::new(AtomicU64::new(0));
        let writer = writer::spawn(write_conn, config.clone(), ledger, Arc::clone(&generation));
        let readers = ReadPool::open(db_path, READ_POOL_SIZE)?;

        Ok(Self {
            path: db_path.to_path_buf(),
            writer,
            readers,
            generation,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logical generation: bumped by the writer after every committed
    /// batch. Consolidation plans carry the generation they were made
    /// against so stale plans get re-validated.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// The writer command handle
    pub fn writer(&self) -> &WriterHandle {
        &self.writer
    }

    /// Drain the writer queue and stop the writer thread. Pending
    /// commands are committed before exit.
    pub fn shutdown(&self) {
        self.writer.shutdown();
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub fn get_memory(&self, id: i64) -> Result<Option<Memory>> {
        self.readers.with(|conn| {
            conn.query_row(
                &format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1"),
                params![id],
                memory_from_row,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    pub fn get_memories(&self, ids: &[i64]) -> Result<Vec<Memory>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        self.readers.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MEMORY_COLUMNS} FROM memories WHERE id IN ({placeholders}) ORDER BY id"
            ))?;
            let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), memory_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn find_project(&self, path: &str) -> Result<Option<Project>> {
        self.readers.with(|conn| {
            conn.query_row(
                "SELECT id, path, name, created_at, last_active FROM projects WHERE path = ?1",
                params![path],
                project_from_row,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// Longest-prefix project match for an absolute file path
    pub fn resolve_project(&self, file_path: &str) -> Result<Option<Project>> {
        self.readers.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, path, name, created_at, last_active FROM projects
                 ORDER BY LENGTH(path) DESC",
            )?;
            let projects = stmt
                .query_map([], project_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(projects.into_iter().find(|p| {
                file_path == p.path || file_path.starts_with(&format!("{}/", p.path))
            }))
        })
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        self.readers.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, path, name, created_at, last_active FROM projects ORDER BY id",
            )?;
            let rows = stmt.query_map([], project_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Most recently touched ACTIVE memories, optionally per project
    pub fn recent_active(&self, project_id: Option<i64>, limit: usize) -> Result<Vec<Memory>> {
        self.readers.with(|conn| {
            let sql = format!(
                "SELECT {MEMORY_COLUMNS} FROM memories
                 WHERE status = 'active' AND (?1 IS NULL OR project_id = ?1)
                 ORDER BY last_accessed DESC, id ASC LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![project_id, limit as i64], memory_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// FTS match over (gist, verbatim, tags). Returns memories with their
    /// bm25 rank (lower is better).
    pub fn search_text(
        &self,
        project_id: Option<i64>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(Memory, f64)>> {
        let match_expr = sanitize_fts_query(query);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }
        self.readers.with(|conn| {
            let sql = format!(
                "SELECT {}, bm25(memories_fts) AS rank
                 FROM memories_fts
                 JOIN memories m ON m.id = memories_fts.rowid
                 WHERE memories_fts MATCH ?1
                   AND m.status = 'active'
                   AND (?2 IS NULL OR m.project_id = ?2)
                 ORDER BY rank ASC, m.id ASC
                 LIMIT ?3",
                MEMORY_COLUMNS
                    .split(", ")
                    .map(|c| format!("m.{c}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![match_expr, project_id, limit as i64], |row| {
                let memory = memory_from_row(row)?;
                let rank: f64 = row.get(20)?;
                Ok((memory, rank))
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// ACTIVE, unpinned, non-CRITICAL rows - the passive decay scan set
    pub fn decay_candidates(&self, limit: usize) -> Result<Vec<Memory>> {
        self.readers.with(|conn| {
            let sql = format!(
                "SELECT {MEMORY_COLUMNS} FROM memories
                 WHERE status = 'active' AND pinned = 0 AND salience != 'CRITICAL'
                 ORDER BY last_accessed ASC LIMIT ?1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![limit as i64], memory_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Consolidation candidates: low-utility bands untouched past the
    /// horizon, never pinned
    pub fn hygiene_candidates(
        &self,
        min_salience: Salience,
        horizon: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        let bands: Vec<&str> = [Salience::Noise, Salience::Low, Salience::Medium]
            .iter()
            .filter(|s| **s >= min_salience)
            .map(|s| s.as_str())
            .collect();
        let band_list = bands
            .iter()
            .map(|b| format!("'{b}'"))
            .collect::<Vec<_>>()
            .join(", ");

        self.readers.with(|conn| {
            let sql = format!(
                "SELECT {MEMORY_COLUMNS} FROM memories
                 WHERE status = 'active' AND pinned = 0
                   AND salience IN ({band_list})
                   AND last_accessed < ?1
                 ORDER BY last_accessed ASC LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![horizon, limit as i64], memory_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// PENDING_DECAY rows whose transition is older than the grace cutoff
    pub fn archive_candidates(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Memory>> {
        self.readers.with(|conn| {
            let sql = format!(
                "SELECT {MEMORY_COLUMNS} FROM memories
                 WHERE status = 'pending_decay' AND status_changed_at <= ?1
                 ORDER BY id ASC LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![cutoff, limit as i64], memory_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// All pins, memory pins and path pins alike
    pub fn pins(&self) -> Result<Vec<PinEntry>> {
        self.readers.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT memory_id, file_path, pinned_at, reason, pinned_by FROM pins ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(PinEntry {
                    memory_id: row.get(0)?,
                    file_path: row.get(1)?,
                    pinned_at: row.get(2)?,
                    reason: row.get(3)?,
                    pinned_by: row.get(4)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Just the path pins (the classifier's pinned-ancestor rule)
    pub fn pinned_paths(&self) -> Result<Vec<String>> {
        self.readers.with(|conn| {
            let mut stmt =
                conn.prepare("SELECT file_path FROM pins WHERE file_path IS NOT NULL")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Pinned ACTIVE memories, oldest pin first
    pub fn pinned_memories(&self, project_id: Option<i64>) -> Result<Vec<Memory>> {
        self.readers.with(|conn| {
            let sql = format!(
                "SELECT {MEMORY_COLUMNS} FROM memories
                 WHERE pinned = 1 AND status = 'active'
                   AND (?1 IS NULL OR project_id = ?1)
                 ORDER BY id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![project_id], memory_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.readers.with(|conn| {
            let mut stats = StoreStats {
                total_memories: conn.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))?,
                total_projects: conn.query_row("SELECT COUNT(*) FROM projects", [], |r| r.get(0))?,
                pinned: conn.query_row(
                    "SELECT COUNT(*) FROM memories WHERE pinned = 1",
                    [],
                    |r| r.get(0),
                )?,
                ..Default::default()
            };

            let mut stmt =
                conn.prepare("SELECT salience, COUNT(*) FROM memories GROUP BY salience")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get(1)?)))?;
            for row in rows {
                let (salience, count) = row?;
                stats.by_salience.insert(salience, count);
            }

            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM memories GROUP BY status")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get(1)?)))?;
            for row in rows {
                let (status, count) = row?;
                stats.by_status.insert(status, count);
            }

            Ok(stats)
        })
    }

    /// ACTIVE count, the writer-side number the policy state observes
    pub fn active_count(&self) -> Result<i64> {
        self.count_with_status(MemoryStatus::Active)
    }

    pub fn count_with_status(&self, status: MemoryStatus) -> Result<i64> {
        self.readers.with(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE status = ?1",
                params![status.as_str()],
                |r| r.get(0),
            )?)
        })
    }

    /// Rows created since the cutoff - the policy's write-rate signal
    pub fn count_created_since(&self, cutoff: DateTime<Utc>) -> Result<i64> {
        self.readers.with(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE created_at >= ?1",
                params![cutoff],
                |r| r.get(0),
            )?)
        })
    }

    /// Ids of rows that have left ACTIVE (startup ledger reconciliation)
    pub fn non_active_ids(&self) -> Result<Vec<i64>> {
        self.readers.with(|conn| {
            let mut stmt =
                conn.prepare("SELECT id FROM memories WHERE status != 'active' ORDER BY id")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// ACTIVE rows in the NOISE/LOW bands
    pub fn low_band_count(&self) -> Result<i64> {
        self.readers.with(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM memories
                 WHERE status = 'active' AND salience IN ('NOISE', 'LOW')",
                [],
                |r| r.get(0),
            )?)
        })
    }
}

fn project_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        path: row.get(1)?,
        name: row.get(2)?,
        created_at: row.get(3)?,
        last_active: row.get(4)?,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint;
    use crate::ledger::{LedgerEvent, LedgerEventType, LedgerFilter};
    use crate::memory::MemoryDraft;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn open_store() -> (TempDir, Arc<Store>, Arc<Ledger>) {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(Ledger::open(dir.path().join("ledger.jsonl")).unwrap());
        let store = Store::open(
            &dir.path().join("vidurai.db"),
            &Config::default(),
            Arc::clone(&ledger),
        )
        .unwrap();
        (dir, Arc::new(store), ledger)
    }

    fn draft(verbatim: &str, salience: Salience) -> MemoryDraft {
        MemoryDraft {
            event_id: Uuid::new_v4(),
            project_path: "/home/dev/proj".into(),
            verbatim: verbatim.into(),
            gist: format!("gist of {verbatim}"),
            tags: vec!["test".into()],
            event_type: "diagnostic".into(),
            file_path: Some("src/auth.ts".into()),
            line_number: Some(42),
            language: Some("typescript".into()),
            salience,
            fingerprint: fingerprint::fingerprint(verbatim, "diagnostic", Some("src/auth.ts"), None),
            timestamp: Utc::now(),
            redactions: 0,
        }
    }

    #[tokio::test]
    async fn test_ingest_inserts_row() {
        let (_dir, store, _ledger) = open_store();
        let outcome = store.writer().ingest(draft("boom", Salience::High)).await.unwrap();
        assert!(!outcome.aggregated);
        assert!(!outcome.replayed);

        let memory = store.get_memory(outcome.memory_id.unwrap()).unwrap().unwrap();
        assert_eq!(memory.verbatim, "boom");
        assert_eq!(memory.salience, Salience::High);
        assert_eq!(memory.status, MemoryStatus::Active);
        assert_eq!(memory.repeat_count, 1);
        assert!(memory.expires_at.is_some());
        store.shutdown();
    }

    #[tokio::test]
    async fn test_error_burst_aggregates_to_one_row() {
        let (_dir, store, ledger) = open_store();
        let verbatim = "error: TS2304: Cannot find name 'Claude' (src/auth.ts:42)";

        let mut last_id = None;
        for _ in 0..50 {
            let outcome = store.writer().ingest(draft(verbatim, Salience::High)).await.unwrap();
            last_id = outcome.memory_id;
        }

        let memory = store.get_memory(last_id.unwrap()).unwrap().unwrap();
        assert_eq!(memory.repeat_count, 50);
        // Demotions at 4, 8, 16, 32: HIGH -> MEDIUM -> LOW -> NOISE
        assert!(memory.salience <= Salience::Low);

        // Exactly one ACTIVE row for the fingerprint
        assert_eq!(store.active_count().unwrap(), 1);

        let aggregations = ledger
            .query(&LedgerFilter {
                event_type: Some(LedgerEventType::Aggregation),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(aggregations.len(), 49);
        assert!(aggregations.iter().all(|e| e.reversible));
        store.shutdown();
    }

    #[tokio::test]
    async fn test_replay_same_event_id_is_noop() {
        let (_dir, store, _ledger) = open_store();
        let d = draft("one-off", Salience::Low);
        let first = store.writer().ingest(d.clone()).await.unwrap();
        let second = store.writer().ingest(d).await.unwrap();

        assert!(second.replayed);
        assert_eq!(second.memory_id, first.memory_id);
        let memory = store.get_memory(first.memory_id.unwrap()).unwrap().unwrap();
        assert_eq!(memory.repeat_count, 1);
        store.shutdown();
    }

    #[tokio::test]
    async fn test_pinned_rows_resist_status_transitions() {
        let (_dir, store, _ledger) = open_store();
        let id = store
            .writer()
            .ingest(draft("keep me", Salience::Medium))
            .await
            .unwrap()
            .memory_id
            .unwrap();
        store.writer().pin(PinTarget::Memory(id), "load-bearing", "user").await.unwrap();

        let affected = store
            .writer()
            .set_status(
                vec![id],
                MemoryStatus::PendingDecay,
                "passive_decay",
                LedgerEvent::new(LedgerEventType::Decay, "passive_decay"),
            )
            .await
            .unwrap();
        assert!(affected.is_empty());

        let memory = store.get_memory(id).unwrap().unwrap();
        assert_eq!(memory.status, MemoryStatus::Active);
        assert!(memory.pinned);
        assert!(memory.expires_at.is_none());
        store.shutdown();
    }

    #[tokio::test]
    async fn test_decay_and_rollback() {
        let (_dir, store, _ledger) = open_store();
        let id = store
            .writer()
            .ingest(draft("fading", Salience::Low))
            .await
            .unwrap()
            .memory_id
            .unwrap();

        let affected = store
            .writer()
            .set_status(
                vec![id],
                MemoryStatus::PendingDecay,
                "passive_decay",
                LedgerEvent::new(LedgerEventType::Decay, "passive_decay"),
            )
            .await
            .unwrap();
        assert_eq!(affected, vec![id]);
        let memory = store.get_memory(id).unwrap().unwrap();
        assert_eq!(memory.status, MemoryStatus::PendingDecay);
        assert_eq!(memory.decay_reason.as_deref(), Some("passive_decay"));

        // Aggregation rollback path: PENDING_DECAY -> ACTIVE
        let affected = store
            .writer()
            .set_status(
                vec![id],
                MemoryStatus::Active,
                "",
                LedgerEvent::new(LedgerEventType::Aggregation, "rollback"),
            )
            .await
            .unwrap();
        assert_eq!(affected, vec![id]);
        let memory = store.get_memory(id).unwrap().unwrap();
        assert_eq!(memory.status, MemoryStatus::Active);
        assert!(memory.decay_reason.is_none());
        store.shutdown();
    }

    #[tokio::test]
    async fn test_recurring_fingerprint_revives_pending_row() {
        let (_dir, store, ledger) = open_store();
        let first = draft("it is back", Salience::Medium);
        let id = store.writer().ingest(first.clone()).await.unwrap().memory_id.unwrap();
        store
            .writer()
            .set_status(
                vec![id],
                MemoryStatus::PendingDecay,
                "passive_decay",
                LedgerEvent::new(LedgerEventType::Decay, "passive_decay"),
            )
            .await
            .unwrap();

        // Same fingerprint, new event id
        let outcome = store
            .writer()
            .ingest(draft("it is back", Salience::Medium))
            .await
            .unwrap();
        assert!(outcome.aggregated);
        assert_eq!(outcome.memory_id, Some(id));

        let memory = store.get_memory(id).unwrap().unwrap();
        assert_eq!(memory.status, MemoryStatus::Active);
        assert!(memory.decay_reason.is_none());
        assert_eq!(memory.repeat_count, 2);

        let rollbacks = ledger
            .read_all()
            .unwrap()
            .into_iter()
            .filter(|e| e.action == "rollback")
            .count();
        assert_eq!(rollbacks, 1);
        store.shutdown();
    }

    #[tokio::test]
    async fn test_delete_archived_rejects_active_rows() {
        let (_dir, store, _ledger) = open_store();
        let id = store
            .writer()
            .ingest(draft("still live", Salience::Low))
            .await
            .unwrap()
            .memory_id
            .unwrap();

        let err = store
            .writer()
            .delete_archived(vec![id], LedgerEvent::new(LedgerEventType::Archive, "prune"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidState(_)));
        assert!(store.get_memory(id).unwrap().is_some());
        store.shutdown();
    }

    #[tokio::test]
    async fn test_consolidate_replaces_group() {
        let (_dir, store, ledger) = open_store();
        let mut ids = Vec::new();
        for i in 0..4 {
            let d = draft(&format!("noise {i}"), Salience::Low);
            ids.push(store.writer().ingest(d).await.unwrap().memory_id.unwrap());
        }
        let project = store.find_project("/home/dev/proj").unwrap().unwrap();

        let summary_id = store
            .writer()
            .consolidate(writer::ConsolidatePlan {
                group_ids: ids.clone(),
                summary: SummaryDraft {
                    project_id: project.id,
                    verbatim: "4 low-signal diagnostics in src/auth.ts".into(),
                    gist: "Recurring low-signal diagnostics in src/auth.ts".into(),
                    tags: vec!["consolidated".into()],
                    salience: Salience::Low,
                    file_path: Some("src/auth.ts".into()),
                    fingerprint: 0xfeed,
                },
                planned_generation: store.generation(),
                ledger: LedgerEvent::new(LedgerEventType::Consolidation, "hygiene_merge"),
            })
            .await
            .unwrap();

        for id in &ids {
            assert!(store.get_memory(*id).unwrap().is_none());
        }
        let summary = store.get_memory(summary_id).unwrap().unwrap();
        assert_eq!(summary.status, MemoryStatus::Active);
        assert_eq!(summary.repeat_count, 4);

        let entries = ledger
            .query(&LedgerFilter {
                event_type: Some(LedgerEventType::Consolidation),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].memories_removed, ids);
        assert_eq!(entries[0].consolidated_into, vec![summary_id]);
        store.shutdown();
    }

    #[tokio::test]
    async fn test_fts_search_finds_by_gist() {
        let (_dir, store, _ledger) = open_store();
        store.writer().ingest(draft("database timeout on login", Salience::High)).await.unwrap();
        store.writer().ingest(draft("css padding tweak", Salience::Low)).await.unwrap();

        let hits = store.search_text(None, "timeout", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].0.verbatim.contains("timeout"));
        store.shutdown();
    }

    #[tokio::test]
    async fn test_path_pin_materializes_on_ingest() {
        let (_dir, store, _ledger) = open_store();
        store
            .writer()
            .pin(PinTarget::Path("src/auth.ts".into()), "auth is critical", "user")
            .await
            .unwrap();

        let id = store
            .writer()
            .ingest(draft("edit under pin", Salience::Low))
            .await
            .unwrap()
            .memory_id
            .unwrap();
        let memory = store.get_memory(id).unwrap().unwrap();
        assert!(memory.pinned);
        assert!(memory.expires_at.is_none());
        store.shutdown();
    }

    #[tokio::test]
    async fn test_stats_counts() {
        let (_dir, store, _ledger) = open_store();
        store.writer().ingest(draft("a", Salience::High)).await.unwrap();
        store.writer().ingest(draft("b", Salience::Low)).await.unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_memories, 2);
        assert_eq!(stats.total_projects, 1);
        assert_eq!(stats.by_status.get("active"), Some(&2));
        store.shutdown();
    }
}
