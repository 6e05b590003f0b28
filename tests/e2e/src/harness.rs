//! Test Harness
//!
//! Isolated engine instances on temp directories, plus event builders
//! for the common sensor payloads. Each harness gets its own data dir
//! and is torn down when dropped.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

use vidurai_core::event::{ChangeType, Channel, MemoryOpKind, Payload, Severity, Source};
use vidurai_core::{Engine, Event};

/// An isolated engine on a temp data directory
pub struct TestEngine {
    pub engine: Arc<Engine>,
    /// Kept alive so the data dir survives until the test ends
    _dir: TempDir,
}

impl TestEngine {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let engine =
            Arc::new(Engine::open(Some(dir.path().join("data"))).expect("engine must open"));
        Self { engine, _dir: dir }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.engine.data_dir().to_path_buf()
    }

    pub async fn shutdown(self) {
        self.engine.shutdown().await;
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Default project root used by the builders
pub const PROJECT_ROOT: &str = "/home/dev/proj";

fn base(payload: Payload, at: DateTime<Utc>) -> Event {
    Event {
        event_id: Uuid::new_v4(),
        timestamp: at,
        source: Source::Editor,
        channel: Channel::Human,
        subtype: None,
        project_root: Some(PathBuf::from(PROJECT_ROOT)),
        project_id: None,
        session_id: Some("e2e".to_string()),
        request_id: None,
        payload,
    }
}

pub fn diagnostic(file: &str, message: &str, line: u32) -> Event {
    diagnostic_at(file, message, line, Utc::now())
}

pub fn diagnostic_at(file: &str, message: &str, line: u32, at: DateTime<Utc>) -> Event {
    base(
        Payload::Diagnostic {
            severity: Severity::Error,
            message: message.to_string(),
            file_path: file.to_string(),
            line: Some(line),
            code: None,
        },
        at,
    )
}

pub fn terminal(command: &str, exit_code: i32) -> Event {
    base(
        Payload::Terminal {
            command: command.to_string(),
            exit_code,
            cwd: None,
            duration_ms: None,
        },
        Utc::now(),
    )
}

pub fn file_edit(file: &str, preview: Option<&str>) -> Event {
    base(
        Payload::FileEdit {
            file_path: file.to_string(),
            change: ChangeType::Saved,
            language: None,
            preview: preview.map(String::from),
        },
        Utc::now(),
    )
}

pub fn focus(file: &str, line: Option<u32>) -> Event {
    base(
        Payload::Focus {
            file_path: file.to_string(),
            line,
            selection: None,
        },
        Utc::now(),
    )
}

pub fn hint(text: &str) -> Event {
    base(
        Payload::Hint {
            text: text.to_string(),
        },
        Utc::now(),
    )
}

pub fn pin_op(target: &str, reason: &str) -> Event {
    base(
        Payload::MemoryOp {
            op: MemoryOpKind::Pin,
            target: Some(target.to_string()),
            reason: Some(reason.to_string()),
            outcome: None,
        },
        Utc::now(),
    )
}
