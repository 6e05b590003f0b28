//! Writer Task - Exclusive owner of the write connection
//!
//! All mutations are typed commands on a bounded queue; each carries a
//! oneshot completion handle. The writer dequeues, joins a micro-batch
//! when more commands are ready within the batch window, executes each
//! command in its own savepoint inside one transaction, commits, appends
//! the corresponding ledger records, then signals completions. A failed
//! command rolls back its savepoint and fails its completion without
//! taking the batch down.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::fingerprint;
use crate::ledger::{Ledger, LedgerEvent, LedgerEventType};
use crate::memory::{MemoryDraft, MemoryStatus, Salience};

use super::{Result, StoreError};

/// Poll granularity while waiting out the micro-batch window
const BATCH_POLL: Duration = Duration::from_micros(200);

// ============================================================================
// COMMANDS
// ============================================================================

/// What a pin/unpin command refers to
#[derive(Debug, Clone)]
pub enum PinTarget {
    Memory(i64),
    Path(String),
}

/// The replacement memory a consolidation inserts
#[derive(Debug, Clone)]
pub struct SummaryDraft {
    pub project_id: i64,
    pub verbatim: String,
    pub gist: String,
    pub tags: Vec<String>,
    pub salience: Salience,
    pub file_path: Option<String>,
    pub fingerprint: u64,
}

/// Result of an ingest command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    /// The row the event landed in. None only when a replayed event's
    /// original row has since been forgotten.
    pub memory_id: Option<i64>,
    /// True when the event merged into an existing row
    pub aggregated: bool,
    /// True when the event id had already been ingested (sensor replay)
    pub replayed: bool,
}

/// A consolidation plan made by the retention engine. The writer
/// re-validates the group against current state; a plan whose rows moved
/// underneath it fails with `StaleGeneration` and is re-planned.
#[derive(Debug)]
pub struct ConsolidatePlan {
    pub group_ids: Vec<i64>,
    pub summary: SummaryDraft,
    pub planned_generation: u64,
    pub ledger: LedgerEvent,
}

/// Uniform command output; the handle methods unwrap the right variant
#[derive(Debug)]
pub enum CommandOutput {
    Ingested(IngestOutcome),
    Affected(Vec<i64>),
    SummaryId(i64),
    Deleted(usize),
    Unit,
}

type Reply = oneshot::Sender<Result<CommandOutput>>;

/// Typed mutation commands
pub enum WriteCommand {
    Ingest {
        draft: MemoryDraft,
        reply: Reply,
    },
    RecordAccess {
        ids: Vec<i64>,
        at: DateTime<Utc>,
        reply: Reply,
    },
    SetStatus {
        ids: Vec<i64>,
        status: MemoryStatus,
        decay_reason: String,
        ledger: LedgerEvent,
        reply: Reply,
    },
    SetOutcome {
        id: i64,
        outcome: i8,
        reply: Reply,
    },
    Pin {
        target: PinTarget,
        reason: String,
        pinned_by: String,
        reply: Reply,
    },
    Unpin {
        target: PinTarget,
        reply: Reply,
    },
    Consolidate {
        plan: Box<ConsolidatePlan>,
        reply: Reply,
    },
    /// Only the archiver sends this, and only after cold verification
    DeleteArchived {
        ids: Vec<i64>,
        ledger: LedgerEvent,
        reply: Reply,
    },
    UpdateConfig {
        config: Box<Config>,
        reply: Reply,
    },
}

impl WriteCommand {
    /// Ledger type for a write_failed record, where the command domain
    /// is forgetting-related
    fn failure_ledger_type(&self) -> Option<LedgerEventType> {
        match self {
            WriteCommand::Ingest { .. } => Some(LedgerEventType::Aggregation),
            WriteCommand::SetStatus { .. } => Some(LedgerEventType::Decay),
            WriteCommand::Consolidate { .. } => Some(LedgerEventType::Consolidation),
            WriteCommand::DeleteArchived { .. } => Some(LedgerEventType::Archive),
            _ => None,
        }
    }
}

// ============================================================================
// HANDLE
// ============================================================================

/// Cloneable-free handle: the Store owns it; shutdown drops the sender
/// so the writer thread drains and exits.
pub struct WriterHandle {
    tx: Mutex<Option<mpsc::Sender<WriteCommand>>>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl WriterHandle {
    fn sender(&self) -> Result<mpsc::Sender<WriteCommand>> {
        self.tx
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .as_ref()
            .cloned()
            .ok_or(StoreError::QueueClosed)
    }

    async fn submit(&self, make: impl FnOnce(Reply) -> WriteCommand) -> Result<CommandOutput> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let sender = self.sender()?;
        sender
            .send(make(reply_tx))
            .await
            .map_err(|_| StoreError::QueueClosed)?;
        reply_rx.await.map_err(|_| StoreError::QueueClosed)?
    }

    /// Non-blocking submit for the sensor path: a full queue surfaces as
    /// back-pressure instead of waiting.
    fn try_submit(&self, cmd: WriteCommand) -> Result<()> {
        let sender = self.sender()?;
        sender.try_send(cmd).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => StoreError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => StoreError::QueueClosed,
        })
    }

    pub async fn ingest(&self, draft: MemoryDraft) -> Result<IngestOutcome> {
        match self.submit(|reply| WriteCommand::Ingest { draft, reply }).await? {
            CommandOutput::Ingested(outcome) => Ok(outcome),
            _ => Err(StoreError::WriteFailed("unexpected writer reply".into())),
        }
    }

    /// Sensor-path ingest with back-pressure: Err means queue full,
    /// completion is not awaited.
    pub fn try_ingest(&self, draft: MemoryDraft) -> Result<oneshot::Receiver<Result<CommandOutput>>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.try_submit(WriteCommand::Ingest {
            draft,
            reply: reply_tx,
        })?;
        Ok(reply_rx)
    }

    pub async fn record_access(&self, ids: Vec<i64>, at: DateTime<Utc>) -> Result<()> {
        self.submit(|reply| WriteCommand::RecordAccess { ids, at, reply })
            .await
            .map(|_| ())
    }

    /// Transition rows to a new status. Returns the ids actually
    /// affected (pinned and already-transitioned rows are skipped).
    pub async fn set_status(
        &self,
        ids: Vec<i64>,
        status: MemoryStatus,
        decay_reason: impl Into<String>,
        ledger: LedgerEvent,
    ) -> Result<Vec<i64>> {
        let decay_reason = decay_reason.into();
        match self
            .submit(|reply| WriteCommand::SetStatus {
                ids,
                status,
                decay_reason,
                ledger,
                reply,
            })
            .await?
        {
            CommandOutput::Affected(ids) => Ok(ids),
            _ => Err(StoreError::WriteFailed("unexpected writer reply".into())),
        }
    }

    pub async fn set_outcome(&self, id: i64, outcome: i8) -> Result<()> {
        self.submit(|reply| WriteCommand::SetOutcome { id, outcome, reply })
            .await
            .map(|_| ())
    }

    pub async fn pin(
        &self,
        target: PinTarget,
        reason: impl Into<String>,
        pinned_by: impl Into<String>,
    ) -> Result<()> {
        let reason = reason.into();
        let pinned_by = pinned_by.into();
        self.submit(|reply| WriteCommand::Pin {
            target,
            reason,
            pinned_by,
            reply,
        })
        .await
        .map(|_| ())
    }

    pub async fn unpin(&self, target: PinTarget) -> Result<()> {
        self.submit(|reply| WriteCommand::Unpin { target, reply })
            .await
            .map(|_| ())
    }

    /// Execute a consolidation plan; returns the summary memory id
    pub async fn consolidate(&self, plan: ConsolidatePlan) -> Result<i64> {
        match self
            .submit(|reply| WriteCommand::Consolidate {
                plan: Box::new(plan),
                reply,
            })
            .await?
        {
            CommandOutput::SummaryId(id) => Ok(id),
            _ => Err(StoreError::WriteFailed("unexpected writer reply".into())),
        }
    }

    /// Remove verified-archived rows from hot. Rejects rows that are not
    /// PENDING_DECAY.
    pub async fn delete_archived(&self, ids: Vec<i64>, ledger: LedgerEvent) -> Result<usize> {
        match self
            .submit(|reply| WriteCommand::DeleteArchived { ids, ledger, reply })
            .await?
        {
            CommandOutput::Deleted(n) => Ok(n),
            _ => Err(StoreError::WriteFailed("unexpected writer reply".into())),
        }
    }

    /// Swap the writer's config copy (applied at tick boundaries)
    pub async fn update_config(&self, config: Config) -> Result<()> {
        self.submit(|reply| WriteCommand::UpdateConfig {
            config: Box::new(config),
            reply,
        })
        .await
        .map(|_| ())
    }

    /// Close the queue and wait for the writer to drain and stop
    pub fn shutdown(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        if let Ok(mut thread) = self.thread.lock() {
            if let Some(handle) = thread.take() {
                if handle.join().is_err() {
                    tracing::error!("writer thread panicked during shutdown");
                }
            }
        }
    }
}

// ============================================================================
// WRITER THREAD
// ============================================================================

/// Start the writer thread. The thread exits when the sender side closes
/// and the queue is drained.
pub(crate) fn spawn(
    conn: Connection,
    config: Config,
    ledger: Arc<Ledger>,
    generation: Arc<AtomicU64>,
) -> WriterHandle {
    let (tx, rx) = mpsc::channel(config.ingress.bounded_queue_capacity);
    let thread = std::thread::Builder::new()
        .name("vidurai-writer".to_string())
        .spawn(move || run(conn, rx, config, ledger, generation))
        .expect("spawning the writer thread cannot fail on any supported platform");

    WriterHandle {
        tx: Mutex::new(Some(tx)),
        thread: Mutex::new(Some(thread)),
    }
}

fn run(
    mut conn: Connection,
    mut rx: mpsc::Receiver<WriteCommand>,
    mut config: Config,
    ledger: Arc<Ledger>,
    generation: Arc<AtomicU64>,
) {
    tracing::info!("writer task started");
    loop {
        let Some(first) = rx.blocking_recv() else { break };

        let mut batch = vec![first];
        let window = Duration::from_millis(config.writer.micro_batch_window_ms);
        let deadline = Instant::now() + window;
        while batch.len() < config.writer.micro_batch_size {
            match rx.try_recv() {
                Ok(cmd) => batch.push(cmd),
                Err(mpsc::error::TryRecvError::Empty) => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    std::thread::sleep(BATCH_POLL);
                }
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            }
        }

        execute_batch(&mut conn, batch, &mut config, &ledger, &generation);
    }
    tracing::info!("writer drained and stopped");
}

fn execute_batch(
    conn: &mut Connection,
    batch: Vec<WriteCommand>,
    config: &mut Config,
    ledger: &Ledger,
    generation: &AtomicU64,
) {
    // (completion sender, result, ledger records to append on success)
    let mut done: Vec<(Reply, Result<CommandOutput>, Vec<LedgerEvent>)> = Vec::new();
    let mut failures: Vec<LedgerEvent> = Vec::new();

    let mut tx = match conn.transaction() {
        Ok(tx) => tx,
        Err(e) => {
            tracing::error!(error = %e, "cannot open write transaction");
            let msg = e.to_string();
            for cmd in batch {
                complete(cmd, Err(StoreError::WriteFailed(msg.clone())));
            }
            return;
        }
    };

    let current_generation = generation.load(Ordering::Acquire);
    for cmd in batch {
        let failure_type = cmd.failure_ledger_type();
        let sp = match tx.savepoint() {
            Ok(sp) => sp,
            Err(e) => {
                complete(cmd, Err(StoreError::WriteFailed(e.to_string())));
                continue;
            }
        };

        let (reply, result, records) = exec_one(&sp, cmd, config, current_generation);
        match &result {
            Ok(_) => {
                if let Err(e) = sp.commit() {
                    let _ = reply.send(Err(StoreError::WriteFailed(e.to_string())));
                    continue;
                }
                done.push((reply, result, records));
            }
            Err(e) => {
                // Savepoint rolls back on drop
                tracing::warn!(error = %e, "write command failed");
                if let Some(event_type) = failure_type {
                    let mut record = LedgerEvent::new(event_type, "write_failed");
                    record.reason = e.to_string();
                    failures.push(record);
                }
                drop(sp);
                done.push((reply, result, Vec::new()));
            }
        }
    }

    match tx.commit() {
        Ok(()) => {
            generation.fetch_add(1, Ordering::Release);
            // Ledger entries become durable only after the mutation commit
            for (reply, result, records) in done {
                for record in records {
                    if let Err(e) = ledger.append(&record) {
                        tracing::error!(error = %e, "ledger append failed after commit");
                    }
                }
                let _ = reply.send(result);
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "batch commit failed");
            let msg = e.to_string();
            for (reply, _, _) in done {
                let _ = reply.send(Err(StoreError::WriteFailed(msg.clone())));
            }
        }
    }

    for record in failures {
        if let Err(e) = ledger.append(&record) {
            tracing::error!(error = %e, "ledger append failed for write_failed record");
        }
    }
}

fn complete(cmd: WriteCommand, result: Result<CommandOutput>) {
    let reply = match cmd {
        WriteCommand::Ingest { reply, .. }
        | WriteCommand::RecordAccess { reply, .. }
        | WriteCommand::SetStatus { reply, .. }
        | WriteCommand::SetOutcome { reply, .. }
        | WriteCommand::Pin { reply, .. }
        | WriteCommand::Unpin { reply, .. }
        | WriteCommand::Consolidate { reply, .. }
        | WriteCommand::DeleteArchived { reply, .. }
        | WriteCommand::UpdateConfig { reply, .. } => reply,
    };
    let _ = reply.send(result);
}

/// Execute one command against the savepoint. Returns the completion
/// sender, the result, and the ledger records to append after commit.
fn exec_one(
    conn: &Connection,
    cmd: WriteCommand,
    config: &mut Config,
    current_generation: u64,
) -> (Reply, Result<CommandOutput>, Vec<LedgerEvent>) {
    match cmd {
        WriteCommand::Ingest { draft, reply } => {
            let mut records = Vec::new();
            let result = ingest(conn, &draft, config, &mut records).map(CommandOutput::Ingested);
            (reply, result, records)
        }
        WriteCommand::RecordAccess { ids, at, reply } => {
            let result = record_access(conn, &ids, at).map(|_| CommandOutput::Unit);
            (reply, result, Vec::new())
        }
        WriteCommand::SetStatus {
            ids,
            status,
            decay_reason,
            mut ledger,
            reply,
        } => match set_status(conn, &ids, status, &decay_reason) {
            Ok(affected) => {
                let mut records = Vec::new();
                if !affected.is_empty() {
                    ledger.memories_removed = affected.clone();
                    ledger.memories_before = ids.len() as i64;
                    ledger.memories_after = (ids.len() - affected.len()) as i64;
                    records.push(ledger);
                }
                (reply, Ok(CommandOutput::Affected(affected)), records)
            }
            Err(e) => (reply, Err(e), Vec::new()),
        },
        WriteCommand::SetOutcome { id, outcome, reply } => {
            let result = set_outcome(conn, id, outcome).map(|_| CommandOutput::Unit);
            (reply, result, Vec::new())
        }
        WriteCommand::Pin {
            target,
            reason,
            pinned_by,
            reply,
        } => {
            let result = pin(conn, &target, &reason, &pinned_by).map(|_| CommandOutput::Unit);
            (reply, result, Vec::new())
        }
        WriteCommand::Unpin { target, reply } => {
            let result = unpin(conn, &target, config).map(|_| CommandOutput::Unit);
            (reply, result, Vec::new())
        }
        WriteCommand::Consolidate { plan, reply } => {
            let mut records = Vec::new();
            let result = consolidate(conn, *plan, config, current_generation, &mut records)
                .map(CommandOutput::SummaryId);
            (reply, result, records)
        }
        WriteCommand::DeleteArchived { ids, ledger, reply } => {
            let mut records = Vec::new();
            let result =
                delete_archived(conn, &ids, ledger, &mut records).map(CommandOutput::Deleted);
            (reply, result, records)
        }
        WriteCommand::UpdateConfig { config: new, reply } => {
            *config = *new;
            (reply, Ok(CommandOutput::Unit), Vec::new())
        }
    }
}

// ============================================================================
// COMMAND IMPLEMENTATIONS
// ============================================================================

fn ingest(
    conn: &Connection,
    draft: &MemoryDraft,
    config: &Config,
    records: &mut Vec<LedgerEvent>,
) -> Result<IngestOutcome> {
    let now = Utc::now();

    // Replay guard: sensors re-send buffered events after reconnect
    let replayed: Option<Option<i64>> = conn
        .query_row(
            "SELECT memory_id FROM ingested_events WHERE event_id = ?1",
            params![draft.event_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(memory_id) = replayed {
        return Ok(IngestOutcome {
            memory_id,
            aggregated: false,
            replayed: true,
        });
    }

    let project_id = upsert_project(conn, &draft.project_path, now)?;
    let fp_hex = fingerprint::to_hex(draft.fingerprint);

    if config.aggregation.enabled {
        let existing: Option<(i64, i64, String, String, bool)> = conn
            .query_row(
                "SELECT id, repeat_count, salience, tags, pinned FROM memories
                 WHERE project_id = ?1 AND fingerprint = ?2 AND status = 'active'",
                params![project_id, fp_hex],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get::<_, i64>(4)? != 0,
                    ))
                },
            )
            .optional()?;

        if let Some((id, repeat_count, salience_str, tags_json, pinned)) = existing {
            return aggregate_into(
                conn, draft, config, records, id, repeat_count, &salience_str, &tags_json, pinned,
                now,
            );
        }

        // A recurring fingerprint revives a row that was waiting to be
        // archived: aggregation rollback, PENDING_DECAY back to ACTIVE.
        let pending: Option<(i64, i64, String, String, bool)> = conn
            .query_row(
                "SELECT id, repeat_count, salience, tags, pinned FROM memories
                 WHERE project_id = ?1 AND fingerprint = ?2 AND status = 'pending_decay'",
                params![project_id, fp_hex],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get::<_, i64>(4)? != 0,
                    ))
                },
            )
            .optional()?;
        if let Some((id, repeat_count, salience_str, tags_json, pinned)) = pending {
            conn.execute(
                "UPDATE memories
                 SET status = 'active', decay_reason = NULL, status_changed_at = ?2
                 WHERE id = ?1",
                params![id, now],
            )?;
            let mut rollback = LedgerEvent::new(LedgerEventType::Aggregation, "rollback");
            rollback.project_path = Some(draft.project_path.clone());
            rollback.memories_before = 1;
            rollback.memories_after = 1;
            rollback.consolidated_into = vec![id];
            rollback.reason = "fingerprint recurred while pending decay".to_string();
            rollback.policy = "aggregator".to_string();
            rollback.reversible = true;
            records.push(rollback);

            return aggregate_into(
                conn, draft, config, records, id, repeat_count, &salience_str, &tags_json, pinned,
                now,
            );
        }
    }

    // Fresh row. A path pin covering this file pins the new memory
    // immediately (the pin registry's placeholder-materialization rule).
    let pinned = match &draft.file_path {
        Some(path) => path_pin_covers(conn, path)?,
        None => false,
    };
    let expires_at = expiry_for(draft.salience, pinned, now, config);
    let tags_json = serde_json::to_string(&draft.tags).unwrap_or_else(|_| "[]".to_string());

    conn.execute(
        "INSERT INTO memories (
            project_id, verbatim, gist, tags, event_type, file_path, line_number, language,
            salience, status, status_changed_at, decay_reason, fingerprint, repeat_count,
            access_count, last_accessed, pinned, created_at, expires_at, outcome
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8,
            ?9, 'active', ?10, NULL, ?11, 1,
            0, ?12, ?13, ?14, ?15, 0
        )",
        params![
            project_id,
            draft.verbatim,
            draft.gist,
            tags_json,
            draft.event_type,
            draft.file_path,
            draft.line_number,
            draft.language,
            draft.salience.as_str(),
            now,
            fp_hex,
            draft.timestamp,
            pinned as i64,
            draft.timestamp,
            expires_at,
        ],
    )?;
    let id = conn.last_insert_rowid();

    conn.execute(
        "INSERT INTO ingested_events (event_id, memory_id, ingested_at) VALUES (?1, ?2, ?3)",
        params![draft.event_id.to_string(), id, now],
    )?;

    Ok(IngestOutcome {
        memory_id: Some(id),
        aggregated: false,
        replayed: false,
    })
}

#[allow(clippy::too_many_arguments)]
fn aggregate_into(
    conn: &Connection,
    draft: &MemoryDraft,
    config: &Config,
    records: &mut Vec<LedgerEvent>,
    id: i64,
    repeat_count: i64,
    salience_str: &str,
    tags_json: &str,
    pinned: bool,
    now: DateTime<Utc>,
) -> Result<IngestOutcome> {
    let new_count = repeat_count + 1;
    let mut salience = Salience::parse_name(salience_str).unwrap_or(draft.salience);

    // Salience floor drops one step at every doubling of the repeat
    // count beyond 2 (4, 8, 16, ...), clamped at NOISE. CRITICAL and
    // pinned rows never demote - repetition demotes, never promotes.
    let demote = !pinned
        && salience != Salience::Critical
        && new_count >= 4
        && (new_count as u64).is_power_of_two();
    if demote {
        salience = salience.demoted();
    }

    let mut tags: BTreeSet<String> = serde_json::from_str::<Vec<String>>(tags_json)
        .unwrap_or_default()
        .into_iter()
        .collect();
    tags.extend(draft.tags.iter().cloned());
    let merged_tags = serde_json::to_string(&tags.iter().collect::<Vec<_>>())
        .unwrap_or_else(|_| "[]".to_string());

    let expires_at = expiry_for(salience, pinned, now, config);

    conn.execute(
        "UPDATE memories
         SET repeat_count = ?2, last_accessed = ?3, salience = ?4, tags = ?5, expires_at = ?6
         WHERE id = ?1",
        params![id, new_count, now, salience.as_str(), merged_tags, expires_at],
    )?;

    conn.execute(
        "INSERT INTO ingested_events (event_id, memory_id, ingested_at) VALUES (?1, ?2, ?3)",
        params![draft.event_id.to_string(), id, now],
    )?;

    let mut record = LedgerEvent::new(LedgerEventType::Aggregation, "repeat_merge");
    record.project_path = Some(draft.project_path.clone());
    record.memories_before = 1;
    record.memories_after = 1;
    record.consolidated_into = vec![id];
    record.reason = format!("repeat_count {new_count} for fingerprint {}", fingerprint::to_hex(draft.fingerprint));
    record.policy = "aggregator".to_string();
    record.reversible = true;
    if demote {
        record.details = serde_json::json!({ "demotedTo": salience.as_str() });
    }
    records.push(record);

    Ok(IngestOutcome {
        memory_id: Some(id),
        aggregated: true,
        replayed: false,
    })
}

fn upsert_project(conn: &Connection, path: &str, now: DateTime<Utc>) -> Result<i64> {
    let name = std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string());
    conn.execute(
        "INSERT INTO projects (path, name, created_at, last_active)
         VALUES (?1, ?2, ?3, ?3)
         ON CONFLICT(path) DO UPDATE SET last_active = excluded.last_active",
        params![path, name, now],
    )?;
    let id = conn.query_row(
        "SELECT id FROM projects WHERE path = ?1",
        params![path],
        |row| row.get(0),
    )?;
    Ok(id)
}

fn path_pin_covers(conn: &Connection, file_path: &str) -> Result<bool> {
    let mut stmt = conn.prepare("SELECT file_path FROM pins WHERE file_path IS NOT NULL")?;
    let pins = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(pins.iter().any(|p| {
        file_path == p || file_path.starts_with(&format!("{}/", p.trim_end_matches('/')))
    }))
}

/// expires_at is null iff CRITICAL or pinned
fn expiry_for(
    salience: Salience,
    pinned: bool,
    from: DateTime<Utc>,
    config: &Config,
) -> Option<DateTime<Utc>> {
    if pinned {
        return None;
    }
    config
        .decay_thresholds
        .for_salience(salience)
        .map(|d| from + d)
}

fn record_access(conn: &Connection, ids: &[i64], at: DateTime<Utc>) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    // ?1 is the timestamp; ids follow
    let placeholders = (0..ids.len())
        .map(|i| format!("?{}", i + 2))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE memories SET access_count = access_count + 1, last_accessed = ?1
         WHERE id IN ({placeholders})"
    );
    let mut values: Vec<&dyn rusqlite::ToSql> = vec![&at];
    values.extend(ids.iter().map(|id| id as &dyn rusqlite::ToSql));
    conn.execute(&sql, &values[..])?;
    Ok(())
}

fn set_status(
    conn: &Connection,
    ids: &[i64],
    status: MemoryStatus,
    decay_reason: &str,
) -> Result<Vec<i64>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    if status == MemoryStatus::Archived {
        // Archival goes through DeleteArchived after cold verification
        return Err(StoreError::InvalidState(
            "archived status is set by the archiver's delete path only".into(),
        ));
    }

    let now = Utc::now();
    let placeholders = vec!["?"; ids.len()].join(", ");

    // Which rows are eligible depends on direction: leaving ACTIVE skips
    // pinned rows; returning to ACTIVE (aggregation rollback) applies to
    // PENDING_DECAY rows only.
    let select = if status == MemoryStatus::Active {
        format!(
            "SELECT id FROM memories WHERE id IN ({placeholders}) AND status = 'pending_decay'"
        )
    } else {
        format!(
            "SELECT id FROM memories WHERE id IN ({placeholders}) AND status = 'active' AND pinned = 0"
        )
    };
    let mut stmt = conn.prepare(&select)?;
    let eligible = stmt
        .query_map(rusqlite::params_from_iter(ids.iter()), |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    drop(stmt);

    if eligible.is_empty() {
        return Ok(eligible);
    }

    let reason = decay_reason.to_string();
    let mut values: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(eligible.len() + 2);
    let sql = if status == MemoryStatus::Active {
        values.push(&now);
        let id_placeholders = (0..eligible.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "UPDATE memories SET status = 'active', decay_reason = NULL, status_changed_at = ?1
             WHERE id IN ({id_placeholders})"
        )
    } else {
        values.push(&reason);
        values.push(&now);
        let id_placeholders = (0..eligible.len())
            .map(|i| format!("?{}", i + 3))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "UPDATE memories SET status = '{}', decay_reason = ?1, status_changed_at = ?2
             WHERE id IN ({id_placeholders})",
            status.as_str()
        )
    };
    values.extend(eligible.iter().map(|id| id as &dyn rusqlite::ToSql));
    conn.execute(&sql, &values[..])?;

    Ok(eligible)
}

fn set_outcome(conn: &Connection, id: i64, outcome: i8) -> Result<()> {
    let changed = conn.execute(
        "UPDATE memories SET outcome = ?2 WHERE id = ?1",
        params![id, outcome as i64],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound(format!("memory {id}")));
    }
    Ok(())
}

fn pin(conn: &Connection, target: &PinTarget, reason: &str, pinned_by: &str) -> Result<()> {
    let now = Utc::now();
    match target {
        PinTarget::Memory(id) => {
            let status: Option<String> = conn
                .query_row(
                    "SELECT status FROM memories WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            match status.as_deref() {
                None => return Err(StoreError::NotFound(format!("memory {id}"))),
                Some("active") => {}
                Some(other) => {
                    return Err(StoreError::InvalidState(format!(
                        "cannot pin memory {id} in status {other}"
                    )))
                }
            }
            conn.execute(
                "UPDATE memories SET pinned = 1, expires_at = NULL WHERE id = ?1",
                params![id],
            )?;
            conn.execute(
                "INSERT INTO pins (memory_id, pinned_at, reason, pinned_by)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(memory_id) WHERE memory_id IS NOT NULL DO UPDATE SET
                     pinned_at = excluded.pinned_at,
                     reason = excluded.reason,
                     pinned_by = excluded.pinned_by",
                params![id, now, reason, pinned_by],
            )?;
        }
        PinTarget::Path(path) => {
            conn.execute(
                "INSERT INTO pins (file_path, pinned_at, reason, pinned_by)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(file_path) WHERE file_path IS NOT NULL DO UPDATE SET
                     pinned_at = excluded.pinned_at,
                     reason = excluded.reason,
                     pinned_by = excluded.pinned_by",
                params![path, now, reason, pinned_by],
            )?;
            // Existing ACTIVE memories under the path are pinned now;
            // future ones are pinned at ingest.
            conn.execute(
                "UPDATE memories SET pinned = 1, expires_at = NULL
                 WHERE status = 'active' AND (file_path = ?1 OR file_path LIKE ?1 || '/%')",
                params![path.trim_end_matches('/')],
            )?;
        }
    }
    Ok(())
}

fn unpin(conn: &Connection, target: &PinTarget, config: &Config) -> Result<()> {
    let now = Utc::now();
    match target {
        PinTarget::Memory(id) => {
            conn.execute("DELETE FROM pins WHERE memory_id = ?1", params![id])?;
            restore_expiry(conn, &[*id], now, config)?;
        }
        PinTarget::Path(path) => {
            let removed = conn.execute("DELETE FROM pins WHERE file_path = ?1", params![path])?;
            if removed == 0 {
                return Err(StoreError::NotFound(format!("path pin {path}")));
            }
            let mut stmt = conn.prepare(
                "SELECT id FROM memories
                 WHERE pinned = 1 AND (file_path = ?1 OR file_path LIKE ?1 || '/%')",
            )?;
            let ids = stmt
                .query_map(params![path.trim_end_matches('/')], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            drop(stmt);
            restore_expiry(conn, &ids, now, config)?;
        }
    }
    Ok(())
}

/// Clear the pinned flag and give each row a fresh expiry lease from its
/// salience; the next policy decision takes it from there.
fn restore_expiry(
    conn: &Connection,
    ids: &[i64],
    now: DateTime<Utc>,
    config: &Config,
) -> Result<()> {
    for id in ids {
        let salience_str: Option<String> = conn
            .query_row(
                "SELECT salience FROM memories WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(salience_str) = salience_str else {
            continue;
        };
        let salience = Salience::parse_name(&salience_str).unwrap_or_default();
        let expires_at = expiry_for(salience, false, now, config);
        conn.execute(
            "UPDATE memories SET pinned = 0, expires_at = ?2 WHERE id = ?1",
            params![id, expires_at],
        )?;
    }
    Ok(())
}

fn consolidate(
    conn: &Connection,
    plan: ConsolidatePlan,
    config: &Config,
    current_generation: u64,
    records: &mut Vec<LedgerEvent>,
) -> Result<i64> {
    let ConsolidatePlan {
        group_ids,
        summary,
        planned_generation,
        mut ledger,
    } = plan;

    if group_ids.is_empty() {
        return Err(StoreError::InvalidState("empty consolidation group".into()));
    }

    // Re-validate the group: every member must still be an ACTIVE,
    // unpinned, sub-HIGH row. A generation mismatch with an invalid
    // member means the plan raced another mutation - the caller re-plans.
    let placeholders = vec!["?"; group_ids.len()].join(", ");
    let valid: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM memories
             WHERE id IN ({placeholders}) AND status = 'active' AND pinned = 0
               AND salience NOT IN ('HIGH', 'CRITICAL')"
        ),
        rusqlite::params_from_iter(group_ids.iter()),
        |row| row.get(0),
    )?;
    if valid as usize != group_ids.len() {
        return Err(StoreError::StaleGeneration {
            planned: planned_generation,
            current: current_generation,
        });
    }

    let now = Utc::now();
    let tags_json = serde_json::to_string(&summary.tags).unwrap_or_else(|_| "[]".to_string());
    let expires_at = expiry_for(summary.salience, false, now, config);

    conn.execute(
        "INSERT INTO memories (
            project_id, verbatim, gist, tags, event_type, file_path, line_number, language,
            salience, status, status_changed_at, decay_reason, fingerprint, repeat_count,
            access_count, last_accessed, pinned, created_at, expires_at, outcome
        ) VALUES (
            ?1, ?2, ?3, ?4, 'consolidation', ?5, NULL, NULL,
            ?6, 'active', ?7, NULL, ?8, ?9,
            0, ?7, 0, ?7, ?10, 0
        )",
        params![
            summary.project_id,
            summary.verbatim,
            summary.gist,
            tags_json,
            summary.file_path,
            summary.salience.as_str(),
            now,
            fingerprint::to_hex(summary.fingerprint),
            group_ids.len() as i64,
            expires_at,
        ],
    )?;
    let summary_id = conn.last_insert_rowid();

    conn.execute(
        &format!("DELETE FROM memories WHERE id IN ({placeholders})"),
        rusqlite::params_from_iter(group_ids.iter()),
    )?;

    ledger.memories_before = group_ids.len() as i64;
    ledger.memories_after = 1;
    ledger.memories_removed = group_ids;
    ledger.consolidated_into = vec![summary_id];
    records.push(ledger);

    Ok(summary_id)
}

fn delete_archived(
    conn: &Connection,
    ids: &[i64],
    mut ledger: LedgerEvent,
    records: &mut Vec<LedgerEvent>,
) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let pending: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM memories WHERE id IN ({placeholders}) AND status = 'pending_decay'"
        ),
        rusqlite::params_from_iter(ids.iter()),
        |row| row.get(0),
    )?;
    if pending as usize != ids.len() {
        // Unarchived (or re-activated) rows must never be deleted
        return Err(StoreError::InvalidState(
            "archive delete batch contains rows that are not pending_decay".into(),
        ));
    }

    let now = Utc::now();
    // Both halves of the archive transition, in one transaction: the
    // rows become ARCHIVED, then leave the hot store.
    let id_placeholders = (0..ids.len())
        .map(|i| format!("?{}", i + 2))
        .collect::<Vec<_>>()
        .join(", ");
    let mut values: Vec<&dyn rusqlite::ToSql> = vec![&now];
    values.extend(ids.iter().map(|id| id as &dyn rusqlite::ToSql));
    conn.execute(
        &format!(
            "UPDATE memories SET status = 'archived', status_changed_at = ?1 WHERE id IN ({id_placeholders})"
        ),
        &values[..],
    )?;
    let deleted = conn.execute(
        &format!("DELETE FROM memories WHERE id IN ({placeholders})"),
        rusqlite::params_from_iter(ids.iter()),
    )?;

    ledger.memories_before = ids.len() as i64;
    ledger.memories_after = 0;
    ledger.memories_removed = ids.to_vec();
    records.push(ledger);

    Ok(deleted)
}
