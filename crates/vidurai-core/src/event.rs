//! Event Model - The ingress contract
//!
//! Every sensor (editor, browser, proxy, CLI, daemon) normalizes its
//! observations into this one event shape before the core sees them.
//! The payload is a closed, kind-tagged enum: ingress does an exhaustive
//! match and unknown kinds are rejected, never guessed at.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Ingress validation error
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    /// The frame was not a valid event (missing fields, unknown kind,
    /// payload shape mismatch). Counted and dropped; never fatal.
    #[error("bad event: {0}")]
    BadEvent(String),
    /// The intake queue is full; the sensor should back off and retry.
    #[error("intake queue full")]
    Busy,
}

// ============================================================================
// TAXONOMY ENUMS
// ============================================================================

/// Where an event was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Editor,
    Browser,
    Proxy,
    Cli,
    Daemon,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Editor => "editor",
            Source::Browser => "browser",
            Source::Proxy => "proxy",
            Source::Cli => "cli",
            Source::Daemon => "daemon",
        }
    }
}

/// Who caused the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    #[default]
    Human,
    Ai,
    System,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Human => "human",
            Channel::Ai => "ai",
            Channel::System => "system",
        }
    }
}

/// Diagnostic severity vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
    Hint,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
            Severity::Hint => "hint",
        }
    }
}

/// What happened to a file in a `file_edit` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Created,
    Modified,
    Saved,
    Deleted,
    Renamed,
    Opened,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Created => "created",
            ChangeType::Modified => "modified",
            ChangeType::Saved => "saved",
            ChangeType::Deleted => "deleted",
            ChangeType::Renamed => "renamed",
            ChangeType::Opened => "opened",
        }
    }
}

/// Memory operations a user can request through the event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryOpKind {
    Pin,
    Unpin,
    Annotate,
    /// RL feedback: the referenced memory correlated with success (+1)
    /// or was obsoleted (-1).
    Outcome,
}

// ============================================================================
// PAYLOADS
// ============================================================================

/// Kind-specific payload. The `kind` tag is the closed taxonomy; serde
/// rejects unknown tags at parse time, which is exactly the ingress
/// contract for `BadEvent`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    FileEdit {
        file_path: String,
        change: ChangeType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
        /// A short excerpt of the changed region, if the sensor captured one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preview: Option<String>,
    },
    Terminal {
        command: String,
        exit_code: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    Diagnostic {
        severity: Severity,
        message: String,
        file_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    AiMessage {
        role: String,
        text: String,
    },
    ErrorReport {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
    Focus {
        file_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selection: Option<String>,
    },
    MemoryOp {
        op: MemoryOpKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outcome: Option<i8>,
    },
    Hint {
        text: String,
    },
    System {
        text: String,
    },
}

impl Payload {
    /// Stable kind name (mirrors the serde tag)
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::FileEdit { .. } => "file_edit",
            Payload::Terminal { .. } => "terminal",
            Payload::Diagnostic { .. } => "diagnostic",
            Payload::AiMessage { .. } => "ai_message",
            Payload::ErrorReport { .. } => "error_report",
            Payload::Focus { .. } => "focus",
            Payload::MemoryOp { .. } => "memory_op",
            Payload::Hint { .. } => "hint",
            Payload::System { .. } => "system",
        }
    }

    /// The file path this payload concerns, if any
    pub fn file_path(&self) -> Option<&str> {
        match self {
            Payload::FileEdit { file_path, .. }
            | Payload::Diagnostic { file_path, .. }
            | Payload::Focus { file_path, .. } => Some(file_path),
            _ => None,
        }
    }

    /// The line number this payload concerns, if any
    pub fn line(&self) -> Option<u32> {
        match self {
            Payload::Diagnostic { line, .. } | Payload::Focus { line, .. } => *line,
            _ => None,
        }
    }

    /// The free-text body that must pass through the gatekeeper
    pub fn verbatim(&self) -> String {
        match self {
            Payload::FileEdit {
                file_path,
                change,
                preview,
                ..
            } => match preview {
                Some(p) => format!("{} {}: {}", change.as_str(), file_path, p),
                None => format!("{} {}", change.as_str(), file_path),
            },
            Payload::Terminal {
                command, exit_code, ..
            } => format!("$ {} (exit {})", command, exit_code),
            Payload::Diagnostic {
                severity,
                message,
                file_path,
                line,
                ..
            } => match line {
                Some(l) => format!("{}: {} ({}:{})", severity.as_str(), message, file_path, l),
                None => format!("{}: {} ({})", severity.as_str(), message, file_path),
            },
            Payload::AiMessage { role, text } => format!("[{}] {}", role, text),
            Payload::ErrorReport { message, stack } => match stack {
                Some(s) => format!("{}\n{}", message, s),
                None => message.clone(),
            },
            Payload::Focus { file_path, line, .. } => match line {
                Some(l) => format!("focus {}:{}", file_path, l),
                None => format!("focus {}", file_path),
            },
            Payload::MemoryOp { op, target, reason, .. } => format!(
                "memory_op {:?} target={} reason={}",
                op,
                target.as_deref().unwrap_or("-"),
                reason.as_deref().unwrap_or("-")
            ),
            Payload::Hint { text } | Payload::System { text } => text.clone(),
        }
    }
}

// ============================================================================
// EVENT
// ============================================================================

/// One normalized event from a sensor.
///
/// Immutable once accepted. Uses `deny_unknown_fields` so sensors cannot
/// smuggle fields past validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Event {
    /// Producer-assigned id; the store is idempotent per id across replays
    pub event_id: Uuid,
    /// UTC, millisecond precision
    pub timestamp: DateTime<Utc>,
    pub source: Source,
    #[serde(default)]
    pub channel: Channel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Kind-tagged payload; the `kind` tag lives inside this object
    pub payload: Payload,
}

impl Event {
    /// Parse and validate one NDJSON record.
    ///
    /// Serde enforces the closed payload taxonomy; the semantic checks
    /// here catch shapes serde cannot express.
    pub fn from_json(raw: &str) -> Result<Self, IngressError> {
        let event: Event =
            serde_json::from_str(raw).map_err(|e| IngressError::BadEvent(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    /// Semantic validation beyond the serde schema
    pub fn validate(&self) -> Result<(), IngressError> {
        if self.timestamp > Utc::now() + chrono::Duration::minutes(5) {
            return Err(IngressError::BadEvent(format!(
                "timestamp too far in the future: {}",
                self.timestamp
            )));
        }
        match &self.payload {
            Payload::FileEdit { file_path, .. }
            | Payload::Diagnostic { file_path, .. }
            | Payload::Focus { file_path, .. } => {
                if file_path.is_empty() {
                    return Err(IngressError::BadEvent("empty file_path".into()));
                }
            }
            Payload::Terminal { command, .. } => {
                if command.is_empty() {
                    return Err(IngressError::BadEvent("empty command".into()));
                }
            }
            Payload::MemoryOp { op, outcome, .. } => {
                if let Some(o) = outcome {
                    if !(-1..=1).contains(o) {
                        return Err(IngressError::BadEvent(format!("outcome out of range: {}", o)));
                    }
                }
                if *op == MemoryOpKind::Outcome && outcome.is_none() {
                    return Err(IngressError::BadEvent("outcome op without outcome value".into()));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Kind name of the payload
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn base_event(payload: Payload) -> Event {
        Event {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: Source::Editor,
            channel: Channel::Human,
            subtype: None,
            project_root: Some(PathBuf::from("/home/dev/proj")),
            project_id: None,
            session_id: Some("s1".to_string()),
            request_id: None,
            payload,
        }
    }

    #[test]
    fn test_payload_kind_names() {
        let p = Payload::Terminal {
            command: "cargo test".into(),
            exit_code: 0,
            cwd: None,
            duration_ms: None,
        };
        assert_eq!(p.kind(), "terminal");

        let p = Payload::Diagnostic {
            severity: Severity::Error,
            message: "boom".into(),
            file_path: "src/a.rs".into(),
            line: Some(3),
            code: None,
        };
        assert_eq!(p.kind(), "diagnostic");
        assert_eq!(p.file_path(), Some("src/a.rs"));
        assert_eq!(p.line(), Some(3));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let raw = r#"{
            "eventId": "6a0f3a2e-7f21-4d86-9d3a-0a8f2f9f1b11",
            "timestamp": "2026-01-05T10:00:00Z",
            "source": "editor",
            "payload": {"kind": "telepathy", "thought": "hello"}
        }"#;
        let err = Event::from_json(raw).unwrap_err();
        assert!(matches!(err, IngressError::BadEvent(_)));
    }

    #[test]
    fn test_round_trip() {
        let event = base_event(Payload::FileEdit {
            file_path: "src/auth.ts".into(),
            change: ChangeType::Saved,
            language: Some("typescript".into()),
            preview: None,
        });
        let json = serde_json::to_string(&event).unwrap();
        let back = Event::from_json(&json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.kind(), "file_edit");
    }

    #[test]
    fn test_semantic_validation() {
        let event = base_event(Payload::Terminal {
            command: String::new(),
            exit_code: 1,
            cwd: None,
            duration_ms: None,
        });
        assert!(event.validate().is_err());

        let event = base_event(Payload::MemoryOp {
            op: MemoryOpKind::Outcome,
            target: Some("42".into()),
            reason: None,
            outcome: Some(2),
        });
        assert!(event.validate().is_err());

        let event = base_event(Payload::MemoryOp {
            op: MemoryOpKind::Outcome,
            target: Some("42".into()),
            reason: None,
            outcome: Some(1),
        });
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_unknown_top_level_field_rejected() {
        let raw = r#"{
            "eventId": "6a0f3a2e-7f21-4d86-9d3a-0a8f2f9f1b11",
            "timestamp": "2026-01-05T10:00:00Z",
            "source": "editor",
            "payload": {"kind": "hint", "text": "remember this"},
            "maliciousField": "attack"
        }"#;
        assert!(Event::from_json(raw).is_err());
    }

    #[test]
    fn test_verbatim_rendering() {
        let p = Payload::Terminal {
            command: "npm test".into(),
            exit_code: 1,
            cwd: None,
            duration_ms: None,
        };
        assert_eq!(p.verbatim(), "$ npm test (exit 1)");
    }
}
