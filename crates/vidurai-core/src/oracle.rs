//! Oracle - Audience-shaped, token-budgeted context assembly
//!
//! The one place context windows are assembled; every consumer surface
//! calls this, none reimplements packing. The oracle is pure: it reads a
//! snapshot through the retriever and the pin registry and never mutates
//! the store. A soft deadline returns the best partial context rather
//! than blocking a consumer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::memory::{Memory, Salience};
use crate::retrieval::{FocusState, RecallQuery, Retriever};
use crate::store::{Result, Store};

/// Soft deadline for one assembly call
pub const ASSEMBLY_DEADLINE: Duration = Duration::from_millis(500);

/// Conservative character-to-token estimate
const CHARS_PER_TOKEN: usize = 4;

/// Tokens reserved for the truncation marker and envelope
const RESERVED_TOKENS: u32 = 24;

// ============================================================================
// REQUEST / RESPONSE
// ============================================================================

/// Who the context is for; shapes filtering and rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    #[default]
    Developer,
    Ai,
    Manager,
    Product,
    Stakeholder,
}

impl Audience {
    pub fn as_str(&self) -> &'static str {
        match self {
            Audience::Developer => "developer",
            Audience::Ai => "ai",
            Audience::Manager => "manager",
            Audience::Product => "product",
            Audience::Stakeholder => "stakeholder",
        }
    }

    /// Non-technical audiences drop diagnostic noise entirely
    fn keeps(&self, memory: &Memory) -> bool {
        match self {
            // The AI consumer wants everything, noise included
            Audience::Ai => true,
            Audience::Developer => memory.salience > Salience::Noise,
            Audience::Manager | Audience::Product | Audience::Stakeholder => {
                memory.salience >= Salience::Medium
                    || (memory.pinned && memory.salience > Salience::Noise)
            }
        }
    }
}

/// One context request (`get_context` on the wire)
#[derive(Debug, Clone, Default)]
pub struct ContextRequest {
    pub audience: Audience,
    pub max_tokens: u32,
    pub query: Option<String>,
    pub focus: Option<FocusState>,
    pub project_path: Option<String>,
}

/// The assembled context
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextResponse {
    pub rendered: String,
    /// Memory ids included, in render order
    pub included: Vec<i64>,
    pub truncated: bool,
    pub token_estimate: u32,
    pub audience: Audience,
}

// ============================================================================
// ORACLE
// ============================================================================

pub struct Oracle {
    store: Arc<Store>,
    retriever: Arc<Retriever>,
}

impl Oracle {
    pub fn new(store: Arc<Store>, retriever: Arc<Retriever>) -> Self {
        Self { store, retriever }
    }

    /// Assemble a context window under the token budget
    pub fn assemble(&self, request: &ContextRequest) -> Result<ContextResponse> {
        let started = Instant::now();
        let max_tokens = request.max_tokens.max(RESERVED_TOKENS + 8);
        let project_id = match &request.project_path {
            Some(path) => self.store.find_project(path)?.map(|p| p.id),
            None => None,
        };

        // Over-retrieve: 4x the item count the budget could possibly hold
        let target_items = (max_tokens as usize / 40).clamp(4, 128);
        let hits = self.retriever.recall(&RecallQuery {
            project_id,
            text: request.query.clone(),
            focus: request.focus.clone(),
            limit: target_items * 4,
        })?;

        // Pinned items come from the registry, not the ranked set, so a
        // pin is honored even when it would never rank
        let pinned = self.store.pinned_memories(project_id)?;
        let pinned_ids: std::collections::HashSet<i64> = pinned.iter().map(|m| m.id).collect();

        // Priority order: pinned > CRITICAL > focus-bonded > HIGH >
        // recent aggregated errors > everything else by rank
        let mut ordered: Vec<Memory> = pinned.clone();
        let ranked: Vec<Memory> = hits
            .into_iter()
            .map(|h| h.memory)
            .filter(|m| !pinned_ids.contains(&m.id))
            .filter(|m| request.audience.keeps(m))
            .collect();

        let focus_file = request.focus.as_ref().map(|f| f.file_path.as_str());
        let push_matching = |ordered: &mut Vec<Memory>, pred: &dyn Fn(&Memory) -> bool| {
            for memory in &ranked {
                if ordered.iter().all(|m| m.id != memory.id) && pred(memory) {
                    ordered.push(memory.clone());
                }
            }
        };
        push_matching(&mut ordered, &|m| m.salience == Salience::Critical);
        push_matching(&mut ordered, &|m| {
            focus_file.is_some() && m.file_path.as_deref() == focus_file
        });
        push_matching(&mut ordered, &|m| m.salience == Salience::High);
        push_matching(&mut ordered, &|m| {
            m.repeat_count > 1 && matches!(m.event_type.as_str(), "diagnostic" | "error_report")
        });
        push_matching(&mut ordered, &|_| true);

        // Greedy pack under the budget, pinned first, stop on overflow
        let budget = max_tokens - RESERVED_TOKENS;
        let mut included = Vec::new();
        let mut lines = Vec::new();
        let mut spent: u32 = 0;
        let mut truncated = false;

        for memory in &ordered {
            if started.elapsed() > ASSEMBLY_DEADLINE {
                tracing::warn!("context assembly deadline reached, returning partial");
                truncated = true;
                break;
            }
            let line = render_item(request.audience, memory);
            let cost = (line.len() / CHARS_PER_TOKEN) as u32 + 1;
            if spent + cost > budget {
                truncated = true;
                break;
            }
            spent += cost;
            included.push(memory.id);
            lines.push(line);
        }
        if included.len() < ordered.len() {
            truncated = true;
        }

        let omitted = ordered.len() - included.len();
        let rendered = render_envelope(request.audience, &lines, truncated, omitted);
        let token_estimate = (rendered.len() / CHARS_PER_TOKEN) as u32;

        Ok(ContextResponse {
            rendered,
            included,
            truncated,
            token_estimate,
            audience: request.audience,
        })
    }
}

// ============================================================================
// RENDERING
// ============================================================================

fn render_item(audience: Audience, memory: &Memory) -> String {
    let location = match (&memory.file_path, memory.line_number) {
        (Some(f), Some(l)) => format!(" ({f}:{l})"),
        (Some(f), None) => format!(" ({f})"),
        _ => String::new(),
    };
    let repeat = if memory.repeat_count > 1 {
        format!(" ×{}", memory.repeat_count)
    } else {
        String::new()
    };

    match audience {
        Audience::Ai => format!(
            "  <memory id=\"{}\" salience=\"{}\"{}{}>{}</memory>",
            memory.id,
            memory.salience.as_str(),
            memory
                .file_path
                .as_ref()
                .map(|f| format!(" file=\"{f}\""))
                .unwrap_or_default(),
            if memory.repeat_count > 1 {
                format!(" repeat=\"{}\"", memory.repeat_count)
            } else {
                String::new()
            },
            xml_escape(&memory.verbatim),
        ),
        Audience::Developer | Audience::Manager => format!(
            "- [{}] {}{}{}",
            memory.salience.as_str(),
            memory.gist,
            location,
            repeat
        ),
        Audience::Product | Audience::Stakeholder => {
            format!("{}{}.", memory.gist.trim_end_matches('.'), repeat)
        }
    }
}

fn render_envelope(audience: Audience, lines: &[String], truncated: bool, omitted: usize) -> String {
    match audience {
        Audience::Ai => {
            let mut out = String::from("<context>\n");
            for line in lines {
                out.push_str(line);
                out.push('\n');
            }
            if truncated {
                out.push_str(&format!("  <truncated omitted=\"{omitted}\"/>\n"));
            }
            out.push_str("</context>");
            out
        }
        Audience::Developer | Audience::Manager => {
            let mut out = String::from("## Working context\n\n");
            out.push_str(&lines.join("\n"));
            if truncated {
                out.push_str(&format!("\n\n_…truncated ({omitted} more withheld)_"));
            }
            out
        }
        Audience::Product | Audience::Stakeholder => {
            let mut out = String::from("Recent activity summary: ");
            out.push_str(&lines.join(" "));
            if truncated {
                out.push_str(" (truncated)");
            }
            out
        }
    }
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

// ============================================================================
// TESTS
// ============================================================================
