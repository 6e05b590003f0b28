//! Database Migrations
//!
//! Schema migration definitions for the hot store.

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema: projects, memories, pins, replay guard, FTS5",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "RL feedback: outcome column + hygiene scan index",
        up: MIGRATION_V2_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: Initial schema
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_active TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS memories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    verbatim TEXT NOT NULL,
    gist TEXT NOT NULL DEFAULT '',
    tags TEXT NOT NULL DEFAULT '[]',
    event_type TEXT NOT NULL,
    file_path TEXT,
    line_number INTEGER,
    language TEXT,

    -- Salience total order: CRITICAL > HIGH > MEDIUM > LOW > NOISE
    salience TEXT NOT NULL DEFAULT 'MEDIUM',

    -- Lifecycle: active -> pending_decay -> (archived | back to active),
    -- or active -> unlearned / silenced via user request
    status TEXT NOT NULL DEFAULT 'active',
    status_changed_at TEXT NOT NULL,
    decay_reason TEXT,

    fingerprint TEXT NOT NULL,
    repeat_count INTEGER NOT NULL DEFAULT 1,
    access_count INTEGER NOT NULL DEFAULT 0,
    last_accessed TEXT NOT NULL,
    pinned INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    expires_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_memories_project_salience_created
    ON memories(project_id, salience, created_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_memories_active_fingerprint
    ON memories(project_id, fingerprint) WHERE status = 'active';
CREATE INDEX IF NOT EXISTS idx_memories_file_path ON memories(file_path);
CREATE INDEX IF NOT EXISTS idx_memories_status ON memories(status);

-- User-authoritative retention overrides. Either a concrete memory or a
-- file path that pins the next memory materialized for it.
CREATE TABLE IF NOT EXISTS pins (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    memory_id INTEGER REFERENCES memories(id) ON DELETE CASCADE,
    file_path TEXT,
    pinned_at TEXT NOT NULL,
    reason TEXT NOT NULL DEFAULT '',
    pinned_by TEXT NOT NULL DEFAULT 'user',
    CHECK (memory_id IS NOT NULL OR file_path IS NOT NULL)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_pins_memory ON pins(memory_id)
    WHERE memory_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_pins_path ON pins(file_path)
    WHERE file_path IS NOT NULL;

-- Replay guard: sensors buffer and replay on reconnect, so ingest must be
-- idempotent per event id.
CREATE TABLE IF NOT EXISTS ingested_events (
    event_id TEXT PRIMARY KEY,
    memory_id INTEGER,
    ingested_at TEXT NOT NULL
);

-- FTS5 virtual table for text recall
CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    gist,
    verbatim,
    tags,
    content='memories',
    content_rowid='id',
    tokenize='porter ascii'
);

-- Triggers to keep FTS in sync
CREATE TRIGGER IF NOT EXISTS memories_ai AFTER INSERT ON memories BEGIN
    INSERT INTO memories_fts(rowid, gist, verbatim, tags)
    VALUES (NEW.id, NEW.gist, NEW.verbatim, NEW.tags);
END;

CREATE TRIGGER IF NOT EXISTS memories_ad AFTER DELETE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, gist, verbatim, tags)
    VALUES ('delete', OLD.id, OLD.gist, OLD.verbatim, OLD.tags);
END;

CREATE TRIGGER IF NOT EXISTS memories_au AFTER UPDATE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, gist, verbatim, tags)
    VALUES ('delete', OLD.id, OLD.gist, OLD.verbatim, OLD.tags);
    INSERT INTO memories_fts(rowid, gist, verbatim, tags)
    VALUES (NEW.id, NEW.gist, NEW.verbatim, NEW.tags);
END;

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// V2: RL feedback signal + an index for the hygiene scan pattern
/// (status + last_accessed range)
const MIGRATION_V2_UP: &str = r#"
ALTER TABLE memories ADD COLUMN outcome INTEGER NOT NULL DEFAULT 0;

CREATE INDEX IF NOT EXISTS idx_memories_status_accessed
    ON memories(status, last_accessed);

UPDATE schema_version SET version = 2, applied_at = datetime('now');
"#;

/// Get current schema version from database
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Apply pending migrations
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                "Applying migration v{}: {}",
                migration.version,
                migration.description
            );

            // execute_batch handles multi-statement SQL including triggers
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}
