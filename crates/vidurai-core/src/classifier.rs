//! Classifier - Salience assignment and gist synthesis
//!
//! Maps a redacted event to a (salience, gist, tags) triple. Salience is a
//! rule cascade evaluated in order, first match wins. Deliberate
//! calibration: compiler errors are HIGH, not CRITICAL - flooding the
//! store with CRITICAL diagnostics drowns the signal the level exists
//! for. Repetition demotes (the aggregator's job), never promotes.
//! CRITICAL is reserved for explicit user intent (annotations, pins).
//!
//! The classifier never fails: the optional LLM gist path runs under a
//! hard deadline and falls back to the rule-based template.

use std::sync::Arc;
use std::time::Duration;

use crate::event::{ChangeType, Event, MemoryOpKind, Payload, Severity};
use crate::memory::Salience;

/// Hard deadline for the optional LLM gist path
pub const LLM_GIST_DEADLINE: Duration = Duration::from_millis(750);

/// Gist length cap, in words
const MAX_GIST_WORDS: usize = 15;

// ============================================================================
// GIST BACKEND SEAM
// ============================================================================

/// Optional LLM-backed gist generator. Implementations must respect the
/// deadline and return None on timeout or unavailability; the classifier
/// then uses the rule-based gist.
pub trait GistBackend: Send + Sync {
    fn gist(&self, verbatim: &str, deadline: Duration) -> Option<String>;
}

// ============================================================================
// CLASSIFICATION
// ============================================================================

/// Result of classifying one event
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub salience: Salience,
    pub gist: String,
    pub tags: Vec<String>,
}

/// Ambient state the cascade consults: the currently focused file and the
/// pin registry's path pins (for the pinned-ancestor rule).
#[derive(Debug, Clone, Default)]
pub struct ClassifyContext {
    pub focus_file: Option<String>,
    pub pinned_paths: Vec<String>,
}

impl ClassifyContext {
    fn is_focused(&self, file_path: &str) -> bool {
        self.focus_file.as_deref() == Some(file_path)
    }

    fn has_pinned_ancestor(&self, file_path: &str) -> bool {
        self.pinned_paths
            .iter()
            .any(|p| file_path == p || file_path.starts_with(&format!("{}/", p.trim_end_matches('/'))))
    }
}

// ============================================================================
// CLASSIFIER
// ============================================================================

pub struct Classifier {
    llm: Option<Arc<dyn GistBackend>>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    /// Rule-based gist only
    pub fn new() -> Self {
        Self { llm: None }
    }

    /// With an LLM gist backend (still falls back to rules on timeout)
    pub fn with_llm(llm: Arc<dyn GistBackend>) -> Self {
        Self { llm: Some(llm) }
    }

    /// Classify a redacted event. `sanitized` is the gatekeeper's output
    /// for the payload verbatim; raw payload text must not be used here.
    pub fn classify(&self, event: &Event, sanitized: &str, ctx: &ClassifyContext) -> Classification {
        let salience = self.salience_for(event, sanitized, ctx);
        let gist = self.gist_for(event, sanitized);
        let tags = self.tags_for(event);
        Classification { salience, gist, tags }
    }

    /// The rule cascade. Arm order is the contract: first match wins.
    fn salience_for(&self, event: &Event, sanitized: &str, ctx: &ClassifyContext) -> Salience {
        match &event.payload {
            // Explicit user intent wins outright
            Payload::Hint { .. } => Salience::Critical,
            Payload::MemoryOp {
                op: MemoryOpKind::Pin,
                ..
            } => Salience::Critical,
            Payload::MemoryOp { .. } => Salience::Low,

            // Rule 1: unresolved error token, or an error diagnostic on
            // the focused file. Error diagnostics carry the token in
            // their rendered verbatim, so in practice both halves fire.
            Payload::Diagnostic {
                severity: Severity::Error,
                file_path,
                ..
            } if ctx.is_focused(file_path) || contains_error_token(sanitized) => Salience::High,
            Payload::ErrorReport { .. } => Salience::High,
            Payload::AiMessage { text, .. } if contains_error_token(text) => Salience::High,

            // Rule 2: command with non-zero exit code
            Payload::Terminal { exit_code, .. } if *exit_code != 0 => Salience::High,

            // Rule 3: warnings, and saves under a pinned ancestor
            Payload::Diagnostic {
                severity: Severity::Warning,
                ..
            } => Salience::Medium,
            Payload::FileEdit {
                file_path,
                change: ChangeType::Saved,
                ..
            } if ctx.has_pinned_ancestor(file_path) => Salience::Medium,

            // Rule 4: routine signals - successful commands, file
            // traffic, focus changes, info diagnostics
            Payload::Terminal { .. }
            | Payload::FileEdit { .. }
            | Payload::Focus { .. }
            | Payload::Diagnostic { .. }
            | Payload::AiMessage { .. }
            | Payload::System { .. } => Salience::Low,
        }
    }

    fn gist_for(&self, event: &Event, sanitized: &str) -> String {
        if let Some(llm) = &self.llm {
            if let Some(gist) = llm.gist(sanitized, LLM_GIST_DEADLINE) {
                return truncate_words(&gist, MAX_GIST_WORDS);
            }
            tracing::debug!(kind = event.kind(), "llm gist unavailable, using rule gist");
        }
        rule_gist(event)
    }

    fn tags_for(&self, event: &Event) -> Vec<String> {
        let mut tags = vec![event.kind().to_string()];

        match &event.payload {
            Payload::FileEdit {
                language, change, ..
            } => {
                tags.push(change.as_str().to_string());
                if let Some(lang) = language {
                    tags.push(lang.clone());
                }
            }
            Payload::Terminal { exit_code, .. } => {
                tags.push(if *exit_code == 0 { "ok" } else { "failed" }.to_string());
            }
            Payload::Diagnostic { severity, code, .. } => {
                tags.push(severity.as_str().to_string());
                if let Some(code) = code {
                    tags.push(code.clone());
                }
            }
            Payload::MemoryOp { op, .. } => tags.push(format!("{:?}", op).to_lowercase()),
            _ => {}
        }

        if let Some(path) = event.payload.file_path() {
            if let Some(stem) = std::path::Path::new(path).file_stem() {
                tags.push(stem.to_string_lossy().to_string());
            }
        }

        tags.sort();
        tags.dedup();
        tags
    }
}

// ============================================================================
// RULE GISTS
// ============================================================================

/// Deterministic gist templated by payload kind
fn rule_gist(event: &Event) -> String {
    let gist = match &event.payload {
        Payload::FileEdit {
            file_path, change, ..
        } => format!("{} {}", change_verb(*change), file_path),
        Payload::Terminal {
            command, exit_code, ..
        } => {
            if *exit_code == 0 {
                format!("Command succeeded: {}", command)
            } else {
                format!("Command failed (exit {}): {}", exit_code, command)
            }
        }
        Payload::Diagnostic {
            severity,
            message,
            file_path,
            line,
            ..
        } => match line {
            Some(l) => format!("{} in {}:{}: {}", severity.as_str(), file_path, l, message),
            None => format!("{} in {}: {}", severity.as_str(), file_path, message),
        },
        Payload::AiMessage { role, text } => format!("{} said: {}", role, text),
        Payload::ErrorReport { message, .. } => format!("Error reported: {}", message),
        Payload::Focus { file_path, line, .. } => match line {
            Some(l) => format!("Focused {}:{}", file_path, l),
            None => format!("Focused {}", file_path),
        },
        Payload::MemoryOp { op, target, .. } => format!(
            "Memory {} for {}",
            format!("{:?}", op).to_lowercase(),
            target.as_deref().unwrap_or("store")
        ),
        Payload::Hint { text } => format!("Note: {}", text),
        Payload::System { text } => format!("System: {}", text),
    };
    truncate_words(&gist, MAX_GIST_WORDS)
}

fn change_verb(change: ChangeType) -> &'static str {
    match change {
        ChangeType::Created => "Created",
        ChangeType::Modified => "Modified",
        ChangeType::Saved => "Saved",
        ChangeType::Deleted => "Deleted",
        ChangeType::Renamed => "Renamed",
        ChangeType::Opened => "Opened",
    }
}

fn contains_error_token(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("error")
        || lower.contains("panic")
        || lower.contains("exception")
        || lower.contains("traceback")
}

fn truncate_words(text: &str, max_words: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= max_words {
        words.join(" ")
    } else {
        format!("{}…", words[..max_words].join(" "))
    }
}

// ============================================================================
// TESTS
// ============================================================================
