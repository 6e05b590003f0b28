//! Retention Policy Abstraction
//!
//! Retention decisions (when to sweep, consolidate, or archive) come
//! from a policy. The rule-based policy is explicit thresholds; the
//! learning policy lives in `qlearning`. A policy that fails degrades
//! to the rule-based fallback for the rest of the tick.

use serde::{Deserialize, Serialize};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("policy state error: {0}")]
    State(String),
    #[error("policy io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("policy serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ============================================================================
// STATE & ACTION
// ============================================================================

/// What the policy gets to see: a small summary of store size, salience
/// mix, recent activity and backlog pressure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyState {
    pub active_memories: i64,
    pub pending_decay: i64,
    /// Fraction of ACTIVE memories in the NOISE/LOW bands
    pub low_band_share: f64,
    /// Rows created in the last hour
    pub writes_last_hour: i64,
    pub minutes_since_hygiene: i64,
}

impl PolicyState {
    /// Discretized key for tabular learning: size bucket, low-band
    /// bucket, write-rate bucket, time-since-hygiene bucket.
    pub fn bucket_key(&self) -> String {
        let size = match self.active_memories {
            0..=99 => 0,
            100..=999 => 1,
            1_000..=9_999 => 2,
            _ => 3,
        };
        let low = (self.low_band_share * 4.0).min(3.0) as u32;
        let writes = match self.writes_last_hour {
            0..=9 => 0,
            10..=99 => 1,
            _ => 2,
        };
        let idle = match self.minutes_since_hygiene {
            0..=14 => 0,
            15..=59 => 1,
            _ => 2,
        };
        format!("s{size}-l{low}-w{writes}-h{idle}")
    }
}

/// What a tick may do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    NoOp,
    PassiveSweep,
    ConsolidateLight,
    ConsolidateAggressive,
    ArchivePending,
}

impl PolicyAction {
    pub const ALL: [PolicyAction; 5] = [
        PolicyAction::NoOp,
        PolicyAction::PassiveSweep,
        PolicyAction::ConsolidateLight,
        PolicyAction::ConsolidateAggressive,
        PolicyAction::ArchivePending,
    ];

    pub fn index(&self) -> usize {
        match self {
            PolicyAction::NoOp => 0,
            PolicyAction::PassiveSweep => 1,
            PolicyAction::ConsolidateLight => 2,
            PolicyAction::ConsolidateAggressive => 3,
            PolicyAction::ArchivePending => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyAction::NoOp => "no_op",
            PolicyAction::PassiveSweep => "passive_sweep",
            PolicyAction::ConsolidateLight => "consolidate_light",
            PolicyAction::ConsolidateAggressive => "consolidate_aggressive",
            PolicyAction::ArchivePending => "archive_pending",
        }
    }
}

// ============================================================================
// POLICY TRAIT
// ============================================================================

/// One retention decision-maker. `learn` and `punish` are optional;
/// rule-based policies ignore them.
pub trait RetentionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick the action for this tick
    fn observe(&mut self, state: &PolicyState) -> Result<PolicyAction, PolicyError>;

    /// Feedback after the action's outcome is known (dream cycle)
    fn learn(
        &mut self,
        _state: &PolicyState,
        _action: PolicyAction,
        _reward: f64,
        _next_state: &PolicyState,
    ) {
    }

    /// Down-weight the state/action pair that produced memories the user
    /// unlearned
    fn punish(&mut self, _state_key: &str, _action: PolicyAction) {}

    /// Persist learning state, if any
    fn persist(&self) -> Result<(), PolicyError> {
        Ok(())
    }
}

// ============================================================================
// RULE-BASED POLICY
// ============================================================================

/// Explicit thresholds on store size and backlog
#[derive(Debug, Clone)]
pub struct RulePolicy {
    /// Archive once this many rows are waiting
    pub archive_backlog: i64,
    /// Aggressive consolidation above this ACTIVE count
    pub hard_cap: i64,
    /// Light consolidation above this ACTIVE count or low-band share
    pub soft_cap: i64,
    pub low_band_trigger: f64,
}

impl Default for RulePolicy {
    fn default() -> Self {
        Self {
            archive_backlog: 256,
            hard_cap: 50_000,
            soft_cap: 10_000,
            low_band_trigger: 0.5,
        }
    }
}

impl RetentionPolicy for RulePolicy {
    fn name(&self) -> &'static str {
        "rule_based"
    }

    fn observe(&mut self, state: &PolicyState) -> Result<PolicyAction, PolicyError> {
        if state.pending_decay >= self.archive_backlog {
            return Ok(PolicyAction::ArchivePending);
        }
        if state.active_memories >= self.hard_cap {
            return Ok(PolicyAction::ConsolidateAggressive);
        }
        if state.active_memories >= self.soft_cap || state.low_band_share >= self.low_band_trigger
        {
            return Ok(PolicyAction::ConsolidateLight);
        }
        if state.minutes_since_hygiene >= 15 || state.writes_last_hour > 0 {
            return Ok(PolicyAction::PassiveSweep);
        }
        Ok(PolicyAction::NoOp)
    }
}

// ============================================================================
// TESTS
// ============================================================================
