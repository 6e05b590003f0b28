//! Memory Model - The fundamental stored unit
//!
//! A Memory is created from an Event after redaction and classification.
//! The durable store owns every mutation; everything else reads snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// SALIENCE
// ============================================================================

/// Categorical importance. Total order: NOISE < LOW < MEDIUM < HIGH < CRITICAL.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Salience {
    Noise,
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl Salience {
    pub fn as_str(&self) -> &'static str {
        match self {
            Salience::Critical => "CRITICAL",
            Salience::High => "HIGH",
            Salience::Medium => "MEDIUM",
            Salience::Low => "LOW",
            Salience::Noise => "NOISE",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CRITICAL" => Some(Salience::Critical),
            "HIGH" => Some(Salience::High),
            "MEDIUM" => Some(Salience::Medium),
            "LOW" => Some(Salience::Low),
            "NOISE" => Some(Salience::Noise),
            _ => None,
        }
    }

    /// Ranking weight used by the retriever (CRITICAL=5 .. NOISE=1)
    pub fn weight(&self) -> f64 {
        match self {
            Salience::Critical => 5.0,
            Salience::High => 4.0,
            Salience::Medium => 3.0,
            Salience::Low => 2.0,
            Salience::Noise => 1.0,
        }
    }

    /// One step down the scale, clamped at NOISE. CRITICAL never demotes.
    pub fn demoted(&self) -> Self {
        match self {
            Salience::Critical => Salience::Critical,
            Salience::High => Salience::Medium,
            Salience::Medium => Salience::Low,
            Salience::Low => Salience::Noise,
            Salience::Noise => Salience::Noise,
        }
    }
}

impl std::fmt::Display for Salience {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// STATUS
// ============================================================================

/// Lifecycle state. ACTIVE is the only state the retriever serves from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryStatus {
    #[default]
    Active,
    PendingDecay,
    Archived,
    Unlearned,
    Silenced,
}

impl MemoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryStatus::Active => "active",
            MemoryStatus::PendingDecay => "pending_decay",
            MemoryStatus::Archived => "archived",
            MemoryStatus::Unlearned => "unlearned",
            MemoryStatus::Silenced => "silenced",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Some(MemoryStatus::Active),
            "pending_decay" => Some(MemoryStatus::PendingDecay),
            "archived" => Some(MemoryStatus::Archived),
            "unlearned" => Some(MemoryStatus::Unlearned),
            "silenced" => Some(MemoryStatus::Silenced),
            _ => None,
        }
    }

    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MemoryStatus::Archived | MemoryStatus::Unlearned | MemoryStatus::Silenced
        )
    }
}

impl std::fmt::Display for MemoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// MEMORY
// ============================================================================

/// One stored memory row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    /// Store-assigned monotonic id
    pub id: i64,
    pub project_id: i64,
    /// Original text, post-redaction
    pub verbatim: String,
    /// Short semantic summary, intended to survive verbatim decay
    pub gist: String,
    pub tags: Vec<String>,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub salience: Salience,
    pub status: MemoryStatus,
    /// RL feedback: -1 obsoleted, 0 neutral, +1 correlated with success
    pub outcome: i8,
    /// Hex-encoded 64-bit fingerprint
    pub fingerprint: String,
    /// How many near-duplicate events merged into this row (>= 1)
    pub repeat_count: i64,
    pub access_count: i64,
    pub last_accessed: DateTime<Utc>,
    pub pinned: bool,
    pub created_at: DateTime<Utc>,
    /// Null iff CRITICAL or pinned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Why status left ACTIVE, if it ever did
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decay_reason: Option<String>,
}

impl Memory {
    /// Effective age for passive decay: time since the later of creation
    /// and last access.
    pub fn effective_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        let anchor = self.created_at.max(self.last_accessed);
        (now - anchor).max(chrono::Duration::zero())
    }
}

// ============================================================================
// DRAFT (classifier output, writer input)
// ============================================================================

/// A memory about to be written: the classified, redacted form of one
/// accepted event. The writer either inserts it or aggregates it into an
/// existing ACTIVE row with the same (project, fingerprint).
#[derive(Debug, Clone)]
pub struct MemoryDraft {
    pub event_id: uuid::Uuid,
    /// Project root path; the writer upserts the projects row
    pub project_path: String,
    pub verbatim: String,
    pub gist: String,
    pub tags: Vec<String>,
    pub event_type: String,
    pub file_path: Option<String>,
    pub line_number: Option<u32>,
    pub language: Option<String>,
    pub salience: Salience,
    pub fingerprint: u64,
    pub timestamp: DateTime<Utc>,
    /// Number of redactions the gatekeeper applied
    pub redactions: usize,
}

// ============================================================================
// PROJECT
// ============================================================================

/// A tracked project (keyed by root path)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: i64,
    pub path: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

// ============================================================================
// PIN ENTRY
// ============================================================================

/// A user-authoritative retention override. Either a memory id or a file
/// path (which pins the next memory materialized for that path).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    pub pinned_at: DateTime<Utc>,
    pub reason: String,
    pub pinned_by: String,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_salience_total_order() {
        assert!(Salience::Critical > Salience::High);
        assert!(Salience::High > Salience::Medium);
        assert!(Salience::Medium > Salience::Low);
        assert!(Salience::Low > Salience::Noise);
    }

    #[test]
    fn test_salience_roundtrip() {
        for s in [
            Salience::Critical,
            Salience::High,
            Salience::Medium,
            Salience::Low,
            Salience::Noise,
        ] {
            assert_eq!(Salience::parse_name(s.as_str()), Some(s));
        }
        assert_eq!(Salience::parse_name("bogus"), None);
    }

    #[test]
    fn test_demotion_clamps() {
        assert_eq!(Salience::High.demoted(), Salience::Medium);
        assert_eq!(Salience::Noise.demoted(), Salience::Noise);
        // Demotion never touches CRITICAL
        assert_eq!(Salience::Critical.demoted(), Salience::Critical);
    }

    #[test]
    fn test_status_roundtrip() {
        for s in [
            MemoryStatus::Active,
            MemoryStatus::PendingDecay,
            MemoryStatus::Archived,
            MemoryStatus::Unlearned,
            MemoryStatus::Silenced,
        ] {
            assert_eq!(MemoryStatus::parse_name(s.as_str()), Some(s));
        }
        assert!(MemoryStatus::Archived.is_terminal());
        assert!(!MemoryStatus::PendingDecay.is_terminal());
    }

    #[test]
    fn test_effective_age_uses_latest_anchor() {
        let now = Utc::now();
        let mem = Memory {
            id: 1,
            project_id: 1,
            verbatim: "x".into(),
            gist: "x".into(),
            tags: vec![],
            event_type: "terminal".into(),
            file_path: None,
            line_number: None,
            language: None,
            salience: Salience::Low,
            status: MemoryStatus::Active,
            outcome: 0,
            fingerprint: "0".into(),
            repeat_count: 1,
            access_count: 0,
            last_accessed: now - chrono::Duration::days(2),
            pinned: false,
            created_at: now - chrono::Duration::days(10),
            expires_at: None,
            decay_reason: None,
        };
        assert_eq!(mem.effective_age(now), chrono::Duration::days(2));
    }
}
