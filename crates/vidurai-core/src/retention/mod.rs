//! Retention Engine - Smart Forgetting
//!
//! Three coordinated mechanisms: passive decay (per-salience expiry with
//! durability adjustments), active unlearning (user-initiated, audited as
//! irreversible), and the hygiene cycle (consolidating groups of old
//! low-utility memories into summary memories). Which mechanism a tick
//! runs is decided by a pluggable policy; a failing policy degrades to
//! the rule-based fallback for the remainder of the tick.

pub mod policy;
pub mod qlearning;

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{Config, PolicyKind};
use crate::fingerprint;
use crate::ledger::{Ledger, LedgerEvent, LedgerEventType};
use crate::memory::{Memory, MemoryStatus, Salience};
use crate::store::{ConsolidatePlan, Store, StoreError, SummaryDraft};

pub use policy::{PolicyAction, PolicyError, PolicyState, RetentionPolicy, RulePolicy};
pub use qlearning::QLearningPolicy;

/// Max rows examined per passive sweep
const SWEEP_BATCH: usize = 2048;
/// Consolidation batch sizes for light vs aggressive hygiene
const CONSOLIDATE_LIGHT_BATCH: usize = 64;
const CONSOLIDATE_AGGRESSIVE_BATCH: usize = 256;
/// Effective age multipliers: thin traces (no gist) and never-accessed
/// memories decay faster
const EMPTY_GIST_AGE_FACTOR: f64 = 1.7;
const NEVER_ACCESSED_AGE_FACTOR: f64 = 1.3;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RetentionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

pub type Result<T> = std::result::Result<T, RetentionError>;

// ============================================================================
// REPORTS
// ============================================================================

/// What one hygiene tick did
#[derive(Debug, Clone, Default)]
pub struct HygieneReport {
    pub action: Option<PolicyAction>,
    pub swept: usize,
    pub groups_consolidated: usize,
    pub memories_removed: usize,
    pub summaries_created: usize,
    /// The tick asked the archiver to run
    pub archive_requested: bool,
    /// The policy failed and the rule fallback decided instead
    pub policy_degraded: bool,
}

/// How an unlearn request should suppress matches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlearnMode {
    /// Irreversible removal from recall
    Forget,
    /// Fast path: silenced, still in the store
    Silence,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct RetentionEngine {
    store: Arc<Store>,
    ledger: Arc<Ledger>,
    config: Config,
    policy: Box<dyn RetentionPolicy>,
    fallback: RulePolicy,
    last_hygiene: Option<DateTime<Utc>>,
    /// (state, action) of the last decision, for the dream cycle
    last_decision: Option<(PolicyState, PolicyAction)>,
    /// Ledger counters snapshot at the last dream tick
    last_dream_removed: u64,
}

impl RetentionEngine {
    pub fn new(
        store: Arc<Store>,
        ledger: Arc<Ledger>,
        config: Config,
        policy: Box<dyn RetentionPolicy>,
    ) -> Self {
        Self {
            store,
            ledger,
            config,
            policy,
            fallback: RulePolicy::default(),
            last_hygiene: None,
            last_decision: None,
            last_dream_removed: 0,
        }
    }

    /// Build the engine with the configured policy kind
    pub fn from_config(
        store: Arc<Store>,
        ledger: Arc<Ledger>,
        config: Config,
        policy_state_path: std::path::PathBuf,
    ) -> Result<Self> {
        let policy: Box<dyn RetentionPolicy> = match config.retention.policy {
            PolicyKind::RuleBased => Box::new(RulePolicy::default()),
            PolicyKind::RlBased => Box::new(QLearningPolicy::load(
                policy_state_path,
                config.retention.reward_profile,
            )?),
        };
        Ok(Self::new(store, ledger, config, policy))
    }

    /// Swap config at a tick boundary
    pub fn set_config(&mut self, config: Config) {
        self.config = config;
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    // ========================================================================
    // (a) PASSIVE DECAY
    // ========================================================================

    /// One decay sweep at simulated time `now`. Pinned and CRITICAL rows
    /// never appear in the candidate set.
    pub async fn passive_sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let candidates = self.store.decay_candidates(SWEEP_BATCH)?;
        let mut expired: Vec<i64> = Vec::new();

        for memory in &candidates {
            let Some(threshold) = self.config.decay_thresholds.for_salience(memory.salience)
            else {
                continue;
            };
            if effective_age(memory, now) >= threshold {
                expired.push(memory.id);
            }
        }

        if expired.is_empty() {
            return Ok(0);
        }

        let mut record = LedgerEvent::new(LedgerEventType::Decay, "passive_decay");
        record.reason = "effective age exceeded salience threshold".into();
        record.policy = self.policy.name().into();
        record.reversible = true;
        let affected = self
            .store
            .writer()
            .set_status(expired, MemoryStatus::PendingDecay, "passive_decay", record)
            .await?;

        tracing::info!(count = affected.len(), "passive decay sweep");
        Ok(affected.len())
    }

    // ========================================================================
    // (b) ACTIVE UNLEARNING
    // ========================================================================

    /// Phase one: find what a query would unlearn. The caller confirms
    /// before anything transitions.
    pub fn unlearn_candidates(&self, query: &str, limit: usize) -> Result<Vec<Memory>> {
        let hits = self.store.search_text(None, query, limit)?;
        Ok(hits.into_iter().map(|(m, _)| m).collect())
    }

    /// Phase two: suppress the confirmed ids. Forget is recorded as
    /// irreversible; Silence can be undone by a later policy change.
    pub async fn unlearn_apply(
        &mut self,
        ids: Vec<i64>,
        mode: UnlearnMode,
        query: &str,
    ) -> Result<Vec<i64>> {
        let (status, action, reversible) = match mode {
            UnlearnMode::Forget => (MemoryStatus::Unlearned, "user_unlearn", false),
            UnlearnMode::Silence => (MemoryStatus::Silenced, "user_silence", true),
        };

        let mut record = LedgerEvent::new(LedgerEventType::Unlearn, action);
        record.reason = format!("user query: {query}");
        record.policy = "user".into();
        record.reversible = reversible;
        let affected = self
            .store
            .writer()
            .set_status(ids, status, action, record)
            .await?;

        // Down-weight whatever retention pattern kept these around
        if let Some((state, action)) = &self.last_decision {
            self.policy.punish(&state.bucket_key(), *action);
        }

        tracing::info!(count = affected.len(), mode = ?mode, "unlearn applied");
        Ok(affected)
    }

    // ========================================================================
    // (c) HYGIENE CYCLE
    // ========================================================================

    /// One hygiene tick: observe, act, report. Policy failure degrades
    /// to the rule fallback for this tick.
    pub async fn hygiene_tick(&mut self, now: DateTime<Utc>) -> Result<HygieneReport> {
        let state = self.policy_state(now)?;

        let (action, degraded) = match self.policy.observe(&state) {
            Ok(action) => (action, false),
            Err(e) => {
                tracing::warn!(error = %e, "retention policy failed, using rule fallback");
                (
                    self.fallback
                        .observe(&state)
                        .unwrap_or(PolicyAction::PassiveSweep),
                    true,
                )
            }
        };
        self.last_decision = Some((state, action));

        let mut report = HygieneReport {
            action: Some(action),
            policy_degraded: degraded,
            ..Default::default()
        };

        match action {
            PolicyAction::NoOp => {}
            PolicyAction::PassiveSweep => {
                report.swept = self.passive_sweep(now).await?;
            }
            PolicyAction::ConsolidateLight => {
                self.consolidate(now, CONSOLIDATE_LIGHT_BATCH, &mut report).await?;
            }
            PolicyAction::ConsolidateAggressive => {
                report.swept = self.passive_sweep(now).await?;
                self.consolidate(now, CONSOLIDATE_AGGRESSIVE_BATCH, &mut report).await?;
            }
            PolicyAction::ArchivePending => {
                report.archive_requested = true;
            }
        }

        self.last_hygiene = Some(now);
        Ok(report)
    }

    /// Group old low-utility memories by topical proximity and replace
    /// each group with one summary memory. CRITICAL and pinned memories
    /// are untouchable; the pin set is snapshotted at cycle start.
    async fn consolidate(
        &mut self,
        now: DateTime<Utc>,
        batch: usize,
        report: &mut HygieneReport,
    ) -> Result<()> {
        // Denylist for the whole cycle
        let pin_denylist: std::collections::HashSet<i64> = self
            .store
            .pins()?
            .iter()
            .filter_map(|p| p.memory_id)
            .collect();

        let horizon = now - Duration::days(self.config.consolidation.max_age_days as i64);
        let candidates: Vec<Memory> = self
            .store
            .hygiene_candidates(self.config.consolidation.min_salience, horizon, batch)?
            .into_iter()
            .filter(|m| !m.pinned && !pin_denylist.contains(&m.id))
            .filter(|m| !self.config.consolidation.preserve_critical || m.salience < Salience::High)
            .collect();

        // A group of n collapses to 1 row; honoring the target ratio
        // means only groups of at least ceil(1/ratio) members qualify.
        let min_group = (1.0 / self.config.consolidation.target_ratio.max(0.01)).ceil() as usize;

        for (topic, group) in group_by_topic(&candidates) {
            if group.len() < min_group {
                continue;
            }
            let generation = self.store.generation();
            let plan = self.plan_group(&topic, &group, generation);
            match self.store.writer().consolidate(plan).await {
                Ok(_summary_id) => {
                    report.groups_consolidated += 1;
                    report.memories_removed += group.len();
                    report.summaries_created += 1;
                }
                Err(StoreError::StaleGeneration { .. }) => {
                    // The group raced another mutation; next tick re-plans
                    tracing::debug!(topic = %topic, "consolidation plan went stale, skipping");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    fn plan_group(&self, topic: &str, group: &[&Memory], generation: u64) -> ConsolidatePlan {
        let group_ids: Vec<i64> = group.iter().map(|m| m.id).collect();

        // Median salience for the summary
        let mut saliences: Vec<Salience> = group.iter().map(|m| m.salience).collect();
        saliences.sort();
        let salience = saliences[saliences.len() / 2];

        let mut tags: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
        for memory in group {
            tags.extend(memory.tags.iter().cloned());
        }

        let gists: Vec<&str> = group.iter().map(|m| m.gist.as_str()).collect();
        let gist = format!("{} older events about {topic}", group.len());
        let verbatim = format!("{gist}: {}", gists.join("; "));

        // Preservation counters for the audit record
        let root_causes = group
            .iter()
            .filter(|m| matches!(m.event_type.as_str(), "diagnostic" | "error_report"))
            .count() as u32;
        let resolutions = group.iter().filter(|m| m.outcome > 0).count() as u32;

        let mut ledger = LedgerEvent::new(LedgerEventType::Consolidation, "hygiene_merge");
        ledger.reason = format!("topical group '{topic}' past retention horizon");
        ledger.policy = self.policy.name().into();
        ledger.reversible = true;
        ledger.entities_preserved = tags.len() as u32;
        ledger.root_causes_preserved = root_causes;
        ledger.resolutions_preserved = resolutions;

        let file_path = group[0].file_path.clone();
        ConsolidatePlan {
            summary: SummaryDraft {
                project_id: group[0].project_id,
                fingerprint: fingerprint::fingerprint(&verbatim, "consolidation", file_path.as_deref(), None),
                verbatim,
                gist,
                tags: tags.into_iter().collect(),
                salience,
                file_path,
            },
            group_ids,
            planned_generation: generation,
            ledger,
        }
    }

    // ========================================================================
    // DREAM CYCLE (policy learning)
    // ========================================================================

    /// Offline learning step: derive the reward for the last decision
    /// from ledger-observed outcomes and feed it back to the policy.
    pub async fn dream_tick(&mut self, now: DateTime<Utc>) -> Result<()> {
        let Some((prev_state, action)) = self.last_decision.clone() else {
            return Ok(());
        };

        let stats = self.ledger.stats().map_err(|e| {
            RetentionError::Policy(PolicyError::State(format!("ledger stats: {e}")))
        })?;
        let next_state = self.policy_state(now)?;

        // Token savings proxy: how much the store shrank since the last
        // dream, normalized against current size
        let removed_delta = stats.memories_removed.saturating_sub(self.last_dream_removed);
        let denominator = (next_state.active_memories.max(1)) as f64;
        let savings = (removed_delta as f64 / denominator).min(1.0);

        // Quality proxy: mean positive outcome among recently recalled
        // ACTIVE memories - retained gists that keep earning accesses
        let recent = self.store.recent_active(None, 256)?;
        let quality = if recent.is_empty() {
            0.0
        } else {
            let useful = recent
                .iter()
                .filter(|m| m.outcome > 0 || m.access_count > 0)
                .count();
            useful as f64 / recent.len() as f64
        };

        // Penalty when forgetting reached frequently-accessed memories
        let frequent_deletes = if removed_delta > 0 && quality < 0.2 { 0.5 } else { 0.0 };

        let reward = match self.policy.name() {
            "rl_based" => {
                let (w_savings, w_quality) = self.config.retention.reward_profile.weights();
                w_savings * savings + w_quality * quality - frequent_deletes
            }
            _ => savings + quality - frequent_deletes,
        };

        self.policy.learn(&prev_state, action, reward, &next_state);
        self.policy.persist().map_err(RetentionError::Policy)?;
        self.last_dream_removed = stats.memories_removed;

        tracing::info!(
            reward,
            savings,
            quality,
            action = action.as_str(),
            "dream cycle learning step"
        );
        Ok(())
    }

    fn policy_state(&self, now: DateTime<Utc>) -> Result<PolicyState> {
        let active = self.store.active_count()?;
        let pending = self.store.count_with_status(MemoryStatus::PendingDecay)?;
        let low = self.store.low_band_count()?;
        let writes = self.store.count_created_since(now - Duration::hours(1))?;
        let minutes_since_hygiene = self
            .last_hygiene
            .map(|t| (now - t).num_minutes())
            .unwrap_or(i64::MAX / 2);

        Ok(PolicyState {
            active_memories: active,
            pending_decay: pending,
            low_band_share: if active > 0 { low as f64 / active as f64 } else { 0.0 },
            writes_last_hour: writes,
            minutes_since_hygiene,
        })
    }
}

/// Effective age with durability adjustments: missing gist x1.7, never
/// accessed x1.3.
fn effective_age(memory: &Memory, now: DateTime<Utc>) -> Duration {
    let base = memory.effective_age(now);
    let mut factor = 1.0_f64;
    if memory.gist.trim().is_empty() && !memory.verbatim.is_empty() {
        factor *= EMPTY_GIST_AGE_FACTOR;
    }
    if memory.access_count == 0 {
        factor *= NEVER_ACCESSED_AGE_FACTOR;
    }
    let seconds = (base.num_seconds() as f64 * factor) as i64;
    Duration::seconds(seconds)
}

/// Topical proximity grouping: same directory (or same file for
/// path-less memories, the leading tag).
fn group_by_topic(candidates: &[Memory]) -> BTreeMap<String, Vec<&Memory>> {
    let mut groups: BTreeMap<String, Vec<&Memory>> = BTreeMap::new();
    for memory in candidates {
        let topic = match &memory.file_path {
            Some(path) => std::path::Path::new(path)
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_else(|| path.clone()),
            None => memory
                .tags
                .first()
                .cloned()
                .unwrap_or_else(|| memory.event_type.clone()),
        };
        groups.entry(topic).or_default().push(memory);
    }
    groups
}

// ============================================================================
// TESTS
// ============================================================================
