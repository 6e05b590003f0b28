//! Engine - Top-level ownership and wiring
//!
//! One Engine value owns the store, the ledger, the pin registry view
//! and the background tasks, and passes them to every component as
//! explicit dependencies. Consumers (the daemon, tests) talk to the
//! Engine; nothing reaches around it to the store.

use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use crate::archive::{self, Archiver, ColdStats};
use crate::classifier::{Classifier, ClassifyContext};
use crate::config::{Config, ConfigError};
use crate::event::{Event, IngressError, MemoryOpKind, Payload};
use crate::fingerprint;
use crate::gatekeeper::{Gatekeeper, GatekeeperError};
use crate::ledger::{Ledger, LedgerError, LedgerEvent, LedgerEventType, LedgerStats};
use crate::memory::{Memory, MemoryDraft, PinEntry};
use crate::oracle::{ContextRequest, ContextResponse, Oracle};
use crate::pins::PinRegistry;
use crate::retention::{RetentionEngine, RetentionError, UnlearnMode};
use crate::retrieval::{FocusState, RecallHit, RecallQuery, Retriever};
use crate::scheduler::{PendingConfig, Scheduler};
use crate::store::{IngestOutcome, PinTarget, Store, StoreError};

/// Project path recorded for events that carry no project root
const UNSCOPED_PROJECT: &str = "(unscoped)";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Fatal: the hot store cannot be opened
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Gatekeeper(#[from] GatekeeperError),
    #[error(transparent)]
    Retention(#[from] RetentionError),
    #[error(transparent)]
    Archive(#[from] archive::ArchiveError),
    /// Ingress validation failed; counted and dropped
    #[error(transparent)]
    BadEvent(#[from] IngressError),
    #[error("engine io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

// ============================================================================
// STATS
// ============================================================================

/// The `stats` request payload: store, ledger, cold archive and the
/// engine's own counters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub store: crate::store::StoreStats,
    pub ledger: LedgerStats,
    pub cold: ColdStats,
    pub bad_events_total: u64,
    pub redactions_total: u64,
    pub busy_rejections_total: u64,
}

#[derive(Default)]
struct Counters {
    bad_events: AtomicU64,
    redactions: AtomicU64,
    busy_rejections: AtomicU64,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct Engine {
    data_dir: PathBuf,
    config: Config,
    store: Arc<Store>,
    ledger: Arc<Ledger>,
    gatekeeper: Gatekeeper,
    classifier: Classifier,
    retriever: Arc<Retriever>,
    oracle: Oracle,
    pin_registry: PinRegistry,
    retention: Arc<tokio::sync::Mutex<RetentionEngine>>,
    pending_config: PendingConfig,
    shutdown_tx: watch::Sender<bool>,
    scheduler_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    counters: Counters,
    receive_seq: AtomicU64,
    /// Last reported focus per session
    focus: Mutex<HashMap<String, FocusState>>,
}

impl Engine {
    /// Open the engine at `data_dir` (or the platform default) and start
    /// the background tasks. `StoreUnavailable` here is fatal; the
    /// daemon refuses the sensor handshake.
    pub fn open(data_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => {
                let dirs = directories::ProjectDirs::from("dev", "vidurai", "vidurai")
                    .ok_or_else(|| {
                        EngineError::Store(StoreError::Unavailable(
                            "could not determine platform data directory".into(),
                        ))
                    })?;
                dirs.data_dir().to_path_buf()
            }
        };
        std::fs::create_dir_all(&data_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            let _ = std::fs::set_permissions(&data_dir, perms);
        }

        let config = Config::load(&data_dir.join("config.json"))?;
        let ledger = Arc::new(Ledger::open(data_dir.join("ledger.jsonl"))?);
        let store = Arc::new(Store::open(
            &data_dir.join("vidurai.db"),
            &config,
            Arc::clone(&ledger),
        )?);

        let gatekeeper = Gatekeeper::new(&config.gatekeeper.extra_patterns)?;
        if config.classifier.use_llm_gist {
            // No LLM backend ships with the core; the seam is
            // `Classifier::with_llm` for embedders that bring one.
            tracing::warn!("classifier.use_llm_gist set but no backend wired; using rule gists");
        }
        let classifier = Classifier::new();

        let retriever = Arc::new(Retriever::new(Arc::clone(&store)));
        let oracle = Oracle::new(Arc::clone(&store), Arc::clone(&retriever));
        let pin_registry = PinRegistry::new(Arc::clone(&store));

        let retention = Arc::new(tokio::sync::Mutex::new(RetentionEngine::from_config(
            Arc::clone(&store),
            Arc::clone(&ledger),
            config.clone(),
            data_dir.join("policy.json"),
        )?));
        let archiver = Archiver::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            data_dir.join("archive"),
        );

        let pending_config: PendingConfig = Arc::new(Mutex::new(None));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = Scheduler::new(
            Arc::clone(&retention),
            archiver,
            Arc::clone(&store),
            config.clone(),
            Arc::clone(&pending_config),
            shutdown_rx,
        );
        let scheduler_handle = scheduler.spawn();

        let engine = Self {
            data_dir,
            config,
            store,
            ledger,
            gatekeeper,
            classifier,
            retriever,
            oracle,
            pin_registry,
            retention,
            pending_config,
            shutdown_tx,
            scheduler_handle: Mutex::new(Some(scheduler_handle)),
            counters: Counters::default(),
            receive_seq: AtomicU64::new(0),
            focus: Mutex::new(HashMap::new()),
        };
        engine.reconcile_ledger()?;
        Ok(engine)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Crash recovery: every non-ACTIVE row must be referenced by a
    /// ledger record. Rows a crash left unaccounted for get a migration
    /// entry so the audit trail reconciles.
    fn reconcile_ledger(&self) -> Result<()> {
        let non_active = self.store.non_active_ids()?;
        if non_active.is_empty() {
            return Ok(());
        }
        let mut referenced = std::collections::HashSet::new();
        for event in self.ledger.read_all()? {
            referenced.extend(event.memories_removed.iter().copied());
            referenced.extend(event.consolidated_into.iter().copied());
        }
        let orphans: Vec<i64> = non_active
            .into_iter()
            .filter(|id| !referenced.contains(id))
            .collect();
        if orphans.is_empty() {
            return Ok(());
        }

        let mut record = LedgerEvent::new(LedgerEventType::Migration, "recovered_status");
        record.memories_before = orphans.len() as i64;
        record.memories_after = orphans.len() as i64;
        record.memories_removed = orphans.clone();
        record.reason = "startup reconciliation: transitions missing from ledger".into();
        record.policy = "engine".into();
        self.ledger.append(&record)?;
        tracing::warn!(count = orphans.len(), "reconciled unaudited status transitions");
        Ok(())
    }

    // ========================================================================
    // INGEST
    // ========================================================================

    /// Ingest one sensor event, waiting for the writer's completion.
    pub async fn ingest_event(&self, event: Event) -> Result<IngestOutcome> {
        let draft = self.prepare(&event)?;
        self.apply_side_effects(&event).await?;
        let outcome = self.store.writer().ingest(draft).await?;
        Ok(outcome)
    }

    /// Sensor-path ingest: a full intake queue returns `Busy` so the
    /// sensor retries with backoff instead of silently dropping.
    pub fn ingest_event_nowait(&self, event: Event) -> Result<()> {
        let draft = self.prepare(&event)?;
        match self.store.writer().try_ingest(draft) {
            Ok(_completion) => Ok(()),
            Err(StoreError::Backpressure) => {
                self.counters.busy_rejections.fetch_add(1, Ordering::Relaxed);
                Err(EngineError::BadEvent(IngressError::Busy))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Validate, redact, classify. Every accepted event becomes a draft;
    /// focus events additionally update the per-session focus state.
    fn prepare(&self, event: &Event) -> Result<MemoryDraft> {
        if let Err(e) = event.validate() {
            self.counters.bad_events.fetch_add(1, Ordering::Relaxed);
            return Err(e.into());
        }
        let seq = self.receive_seq.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(seq, kind = event.kind(), "event accepted");

        // Track focus before classification so the very event that moves
        // focus is classified under the new focus
        if let Payload::Focus { file_path, line, .. } = &event.payload {
            if let Some(session) = &event.session_id {
                if let Ok(mut focus) = self.focus.lock() {
                    focus.insert(
                        session.clone(),
                        FocusState {
                            file_path: file_path.clone(),
                            line: *line,
                        },
                    );
                }
            }
        }

        let (sanitized, redactions) = self.gatekeeper.sanitize(&event.payload.verbatim());
        if redactions > 0 {
            self.counters
                .redactions
                .fetch_add(redactions as u64, Ordering::Relaxed);
        }

        let ctx = ClassifyContext {
            focus_file: self.current_focus(event.session_id.as_deref()).map(|f| f.file_path),
            pinned_paths: self.pin_registry.pinned_paths()?,
        };
        let classification = self.classifier.classify(event, &sanitized, &ctx);
        // Rule gists are templated from raw payload fields; they pass
        // the gatekeeper too so no stored text ever carries a match
        let (gist, gist_redactions) = self.gatekeeper.sanitize(&classification.gist);
        if gist_redactions > 0 {
            self.counters
                .redactions
                .fetch_add(gist_redactions as u64, Ordering::Relaxed);
        }

        let project_path = event
            .project_root
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| UNSCOPED_PROJECT.to_string());
        let project_root = event.project_root.clone();

        Ok(MemoryDraft {
            event_id: event.event_id,
            fingerprint: fingerprint::fingerprint(
                &sanitized,
                event.kind(),
                event.payload.file_path(),
                project_root.as_deref(),
            ),
            project_path,
            verbatim: sanitized,
            gist,
            tags: classification.tags,
            event_type: event.kind().to_string(),
            file_path: event.payload.file_path().map(String::from),
            line_number: event.payload.line(),
            language: match &event.payload {
                Payload::FileEdit { language, .. } => language.clone(),
                _ => None,
            },
            salience: classification.salience,
            timestamp: event.timestamp,
            redactions,
        })
    }

    /// Memory-op events also act on the store (pin/unpin/outcome)
    async fn apply_side_effects(&self, event: &Event) -> Result<()> {
        let Payload::MemoryOp {
            op,
            target,
            reason,
            outcome,
        } = &event.payload
        else {
            return Ok(());
        };

        let target = target.as_deref();
        match op {
            MemoryOpKind::Pin => {
                if let Some(target) = target {
                    self.pin(
                        parse_pin_target(target),
                        reason.as_deref().unwrap_or("pinned via event stream"),
                        "sensor",
                    )
                    .await?;
                }
            }
            MemoryOpKind::Unpin => {
                if let Some(target) = target {
                    self.unpin(parse_pin_target(target)).await?;
                }
            }
            MemoryOpKind::Outcome => {
                if let (Some(target), Some(outcome)) = (target, outcome) {
                    if let Ok(id) = target.parse::<i64>() {
                        self.store.writer().set_outcome(id, *outcome).await?;
                    }
                }
            }
            MemoryOpKind::Annotate => {}
        }
        Ok(())
    }

    // ========================================================================
    // CONSUMER OPERATIONS
    // ========================================================================

    /// The canonical Oracle call (`get_context`)
    pub fn get_context(&self, mut request: ContextRequest) -> Result<ContextResponse> {
        if request.max_tokens == 0 {
            request.max_tokens = self.config.oracle.default_max_tokens;
        }
        Ok(self.oracle.assemble(&request)?)
    }

    /// Ranked recall; returned memories have their access recorded
    pub async fn recall(&self, query: RecallQuery) -> Result<Vec<RecallHit>> {
        let hits = self.retriever.recall(&query)?;
        let ids: Vec<i64> = hits.iter().map(|h| h.memory.id).collect();
        if !ids.is_empty() {
            self.store.writer().record_access(ids, Utc::now()).await?;
        }
        Ok(hits)
    }

    pub fn stats(&self) -> Result<EngineStats> {
        Ok(EngineStats {
            store: self.store.stats()?,
            ledger: self.ledger.stats()?,
            cold: archive::cold_stats_at(&self.data_dir.join("archive"))?,
            bad_events_total: self.counters.bad_events.load(Ordering::Relaxed),
            redactions_total: self.counters.redactions.load(Ordering::Relaxed),
            busy_rejections_total: self.counters.busy_rejections.load(Ordering::Relaxed),
        })
    }

    pub fn pins(&self) -> Result<Vec<PinEntry>> {
        Ok(self.pin_registry.list()?)
    }

    pub fn pinned_memories(&self) -> Result<Vec<Memory>> {
        Ok(self.pin_registry.pinned_memories()?)
    }

    pub async fn pin(&self, target: PinTarget, reason: &str, pinned_by: &str) -> Result<()> {
        Ok(self.pin_registry.pin(target, reason, pinned_by).await?)
    }

    pub async fn unpin(&self, target: PinTarget) -> Result<()> {
        Ok(self.pin_registry.unpin(target).await?)
    }

    /// Phase one of unlearning: what would be forgotten
    pub async fn unlearn_candidates(&self, query: &str, limit: usize) -> Result<Vec<Memory>> {
        Ok(self
            .retention
            .lock()
            .await
            .unlearn_candidates(query, limit)?)
    }

    /// Phase two: user confirmed
    pub async fn unlearn(
        &self,
        ids: Vec<i64>,
        mode: UnlearnMode,
        query: &str,
    ) -> Result<Vec<i64>> {
        Ok(self
            .retention
            .lock()
            .await
            .unlearn_apply(ids, mode, query)
            .await?)
    }

    /// Rotate the audit ledger: rename the current file and start a new
    /// one. Existing bytes are never edited.
    pub fn rotate_ledger(&self) -> Result<std::path::PathBuf> {
        Ok(self.ledger.rotate()?)
    }

    /// Stage a config bundle; applied at the next tick boundary
    pub fn set_config(&self, value: serde_json::Value) -> Result<()> {
        let config = Config::from_value(value)?;
        if let Ok(mut pending) = self.pending_config.lock() {
            *pending = Some(config);
        }
        Ok(())
    }

    /// Map an absolute path to its project and project-relative path
    pub fn resolve_path(&self, path: &str) -> Result<Option<(crate::memory::Project, String)>> {
        let Some(project) = self.store.resolve_project(path)? else {
            return Ok(None);
        };
        let relative = path
            .strip_prefix(&project.path)
            .map(|r| r.trim_start_matches('/').to_string())
            .unwrap_or_else(|| path.to_string());
        Ok(Some((project, relative)))
    }

    pub fn current_focus(&self, session_id: Option<&str>) -> Option<FocusState> {
        let focus = self.focus.lock().ok()?;
        match session_id {
            Some(session) => focus.get(session).cloned(),
            // Without a session, any most-recent focus is better than none
            None => focus.values().next().cloned(),
        }
    }

    // ========================================================================
    // SHUTDOWN
    // ========================================================================

    /// Clean shutdown: stop the scheduler, drain the writer, flush the
    /// ledger (each append is already fsync-gated).
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self
            .scheduler_handle
            .lock()
            .ok()
            .and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if handle.await.is_err() {
                tracing::error!("scheduler task panicked during shutdown");
            }
        }
        let store = Arc::clone(&self.store);
        // The writer drains its queue synchronously; keep it off the
        // async runtime threads
        let _ = tokio::task::spawn_blocking(move || store.shutdown()).await;
        tracing::info!("engine shut down cleanly");
    }
}

/// Numeric targets are memory pins, anything else is a path pin
fn parse_pin_target(target: &str) -> PinTarget {
    match target.parse::<i64>() {
        Ok(id) => PinTarget::Memory(id),
        Err(_) => PinTarget::Path(target.to_string()),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ChangeType, Channel, Severity, Source};
    use crate::memory::Salience;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn event(payload: Payload) -> Event {
        Event {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: Source::Editor,
            channel: Channel::Human,
            subtype: None,
            project_root: Some(PathBuf::from("/home/dev/proj")),
            project_id: None,
            session_id: Some("s1".into()),
            request_id: None,
            payload,
        }
    }

    async fn open_engine() -> (TempDir, Engine) {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(Some(dir.path().to_path_buf())).unwrap();
        (dir, engine)
    }

    #[tokio::test]
    async fn test_end_to_end_ingest() {
        let (_dir, engine) = open_engine().await;
        let outcome = engine
            .ingest_event(event(Payload::Diagnostic {
                severity: Severity::Error,
                message: "TS2304: Cannot find name 'Claude'".into(),
                file_path: "src/auth.ts".into(),
                line: Some(42),
                code: Some("TS2304".into()),
            }))
            .await
            .unwrap();

        let memory = engine
            .store()
            .get_memory(outcome.memory_id.unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(memory.salience, Salience::High);
        assert_eq!(memory.event_type, "diagnostic");
        assert_eq!(memory.file_path.as_deref(), Some("src/auth.ts"));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_secrets_never_reach_the_store() {
        let (_dir, engine) = open_engine().await;
        let outcome = engine
            .ingest_event(event(Payload::FileEdit {
                file_path: "src/config.ts".into(),
                change: ChangeType::Saved,
                language: None,
                preview: Some("const key = \"sk-proj-ABCDEFGHIJKLMNOPQRSTUVWX\"".into()),
            }))
            .await
            .unwrap();

        let memory = engine
            .store()
            .get_memory(outcome.memory_id.unwrap())
            .unwrap()
            .unwrap();
        assert!(memory.verbatim.contains("<REDACTED_API_KEY>"));
        assert!(!memory.verbatim.contains("sk-proj"));
        assert_eq!(engine.stats().unwrap().redactions_total, 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_bad_event_counted_and_dropped() {
        let (_dir, engine) = open_engine().await;
        let result = engine
            .ingest_event(event(Payload::Terminal {
                command: String::new(),
                exit_code: 0,
                cwd: None,
                duration_ms: None,
            }))
            .await;
        assert!(matches!(result, Err(EngineError::BadEvent(_))));
        assert_eq!(engine.stats().unwrap().bad_events_total, 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_focus_event_updates_focus_state() {
        let (_dir, engine) = open_engine().await;
        engine
            .ingest_event(event(Payload::Focus {
                file_path: "src/main.rs".into(),
                line: Some(10),
                selection: None,
            }))
            .await
            .unwrap();

        let focus = engine.current_focus(Some("s1")).unwrap();
        assert_eq!(focus.file_path, "src/main.rs");
        assert_eq!(focus.line, Some(10));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_pin_via_memory_op_event() {
        let (_dir, engine) = open_engine().await;
        let id = engine
            .ingest_event(event(Payload::Diagnostic {
                severity: Severity::Warning,
                message: "flaky test".into(),
                file_path: "tests/flaky.rs".into(),
                line: None,
                code: None,
            }))
            .await
            .unwrap()
            .memory_id
            .unwrap();

        engine
            .ingest_event(event(Payload::MemoryOp {
                op: MemoryOpKind::Pin,
                target: Some(id.to_string()),
                reason: Some("watch this".into()),
                outcome: None,
            }))
            .await
            .unwrap();

        let memory = engine.store().get_memory(id).unwrap().unwrap();
        assert!(memory.pinned);
        assert_eq!(engine.pins().unwrap().len(), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_recall_records_access() {
        let (_dir, engine) = open_engine().await;
        let id = engine
            .ingest_event(event(Payload::Terminal {
                command: "cargo test".into(),
                exit_code: 1,
                cwd: None,
                duration_ms: None,
            }))
            .await
            .unwrap()
            .memory_id
            .unwrap();

        let hits = engine
            .recall(RecallQuery {
                limit: 5,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let memory = engine.store().get_memory(id).unwrap().unwrap();
        assert_eq!(memory.access_count, 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_resolve_path() {
        let (_dir, engine) = open_engine().await;
        engine
            .ingest_event(event(Payload::Focus {
                file_path: "src/a.rs".into(),
                line: None,
                selection: None,
            }))
            .await
            .unwrap();

        let (project, relative) = engine
            .resolve_path("/home/dev/proj/src/a.rs")
            .unwrap()
            .unwrap();
        assert_eq!(project.path, "/home/dev/proj");
        assert_eq!(relative, "src/a.rs");

        assert!(engine.resolve_path("/somewhere/else.rs").unwrap().is_none());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_set_config_rejects_unknown_keys() {
        let (_dir, engine) = open_engine().await;
        let err = engine
            .set_config(serde_json::json!({"no_such_section": {}}))
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));

        engine
            .set_config(serde_json::json!({"oracle": {"default_max_tokens": 2000}}))
            .unwrap();
        engine.shutdown().await;
    }
}
