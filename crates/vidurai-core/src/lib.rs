//! # Vidurai Core
//!
//! Local-first context memory engine for AI-assisted development. Ingests
//! a high-frequency event stream from editor and browser sensors,
//! classifies each event by importance, stores it durably, and serves
//! compressed, audience-shaped context windows under a strict token
//! budget.
//!
//! The memory lifecycle:
//!
//! - **Gatekeeper**: pattern-based redaction before anything persists
//! - **Classifier**: salience cascade + templated gists (errors are HIGH,
//!   never CRITICAL; CRITICAL is reserved for explicit user intent)
//! - **Aggregator**: near-duplicate bursts collapse into one row by
//!   fingerprint, demoting on repetition
//! - **Durable store**: single-writer SQLite (WAL) with a bounded command
//!   queue, plus a partitioned Parquet cold archive
//! - **Smart Forgetting**: passive decay, user unlearning, and hygiene
//!   consolidation driven by a pluggable policy (rules or tabular
//!   Q-learning)
//! - **Ledger**: append-only JSONL audit of every forgetting decision
//! - **Oracle**: the one pure, audience-shaped context assembler every
//!   consumer surface calls
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use vidurai_core::{Engine, ContextRequest, Audience};
//!
//! let engine = Engine::open(None)?;
//!
//! // Sensors push normalized events
//! engine.ingest_event(event).await?;
//!
//! // Consumers get token-budgeted context
//! let context = engine.get_context(ContextRequest {
//!     audience: Audience::Ai,
//!     max_tokens: 4000,
//!     ..Default::default()
//! })?;
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod archive;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod event;
pub mod fingerprint;
pub mod gatekeeper;
pub mod ledger;
pub mod memory;
pub mod oracle;
pub mod pins;
pub mod retention;
pub mod retrieval;
pub mod scheduler;
pub mod store;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Event model
pub use event::{ChangeType, Channel, Event, IngressError, MemoryOpKind, Payload, Severity, Source};

// Memory model
pub use memory::{Memory, MemoryDraft, MemoryStatus, PinEntry, Project, Salience};

// Engine (the single owner)
pub use engine::{Engine, EngineError, EngineStats};

// Configuration
pub use config::{Config, ConfigError, PolicyKind, RewardProfile};

// Store layer
pub use store::{
    IngestOutcome, PinTarget, Store, StoreError, StoreStats, SummaryDraft, WriterHandle,
};

// Ledger
pub use ledger::{Ledger, LedgerError, LedgerEvent, LedgerEventType, LedgerFilter, LedgerStats};

// Gatekeeper
pub use gatekeeper::{Gatekeeper, GatekeeperError};

// Classifier
pub use classifier::{Classification, Classifier, ClassifyContext, GistBackend};

// Pin registry
pub use pins::PinRegistry;

// Retention ("Smart Forgetting")
pub use retention::{
    HygieneReport, PolicyAction, PolicyError, PolicyState, QLearningPolicy, RetentionEngine,
    RetentionError, RetentionPolicy, RulePolicy, UnlearnMode,
};

// Recall
pub use retrieval::{FocusState, RecallHit, RecallQuery, Retriever};

// Oracle
pub use oracle::{Audience, ContextRequest, ContextResponse, Oracle};

// Cold archive
pub use archive::{ArchiveError, ArchiveReport, Archiver, ColdRow, ColdStats};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Sensor protocol version spoken by the daemon (§ handshake)
pub const PROTOCOL_VERSION: u32 = 1;

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        Audience, Config, ContextRequest, ContextResponse, Engine, EngineError, Event,
        FocusState, IngestOutcome, Memory, MemoryStatus, Payload, PinTarget, RecallQuery,
        Salience, UnlearnMode,
    };
}
