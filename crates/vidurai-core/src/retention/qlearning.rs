//! Tabular Q-Learning Retention Policy
//!
//! A small Q(s, a) table over the discretized policy state, ε-greedy
//! exploration decaying from 0.3 to 0.05. The persisted form is plain
//! data (state key -> action values, plus scalar counters) serialized to
//! a human-readable JSON file: no closures, nothing structural.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::RewardProfile;

use super::policy::{PolicyAction, PolicyError, PolicyState, RetentionPolicy};

/// Learning rate
const ALPHA: f64 = 0.2;
/// Discount factor
const GAMMA: f64 = 0.9;
/// Exploration schedule: eps = max(FLOOR, INITIAL * DECAY^steps)
const EPSILON_INITIAL: f64 = 0.3;
const EPSILON_FLOOR: f64 = 0.05;
const EPSILON_DECAY: f64 = 0.995;
/// Q-value penalty applied when the user unlearns memories this policy
/// chose to retain-and-consolidate
const UNLEARN_PENALTY: f64 = 0.5;

// ============================================================================
// PERSISTED FORM
// ============================================================================

/// The on-disk shape. Versioned so a future representation change can
/// migrate instead of guessing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct QTableFile {
    version: u32,
    steps: u64,
    profile: RewardProfile,
    /// state bucket key -> Q value per action (indexed as PolicyAction::ALL)
    q: BTreeMap<String, [f64; 5]>,
}

// ============================================================================
// POLICY
// ============================================================================

pub struct QLearningPolicy {
    q: BTreeMap<String, [f64; 5]>,
    steps: u64,
    profile: RewardProfile,
    path: PathBuf,
}

impl QLearningPolicy {
    /// Load persisted state from `path`, or start fresh
    pub fn load(path: PathBuf, profile: RewardProfile) -> Result<Self, PolicyError> {
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let file: QTableFile = serde_json::from_str(&raw)?;
            if file.version != 1 {
                return Err(PolicyError::State(format!(
                    "unsupported policy state version {}",
                    file.version
                )));
            }
            tracing::info!(states = file.q.len(), steps = file.steps, "loaded q-table");
            return Ok(Self {
                q: file.q,
                steps: file.steps,
                // The configured profile wins over the persisted one
                profile,
                path,
            });
        }
        Ok(Self {
            q: BTreeMap::new(),
            steps: 0,
            profile,
            path,
        })
    }

    pub fn epsilon(&self) -> f64 {
        (EPSILON_INITIAL * EPSILON_DECAY.powf(self.steps as f64)).max(EPSILON_FLOOR)
    }

    /// Reward from the savings/quality proxies under the configured
    /// profile, minus the frequent-access deletion penalty.
    pub fn reward(&self, token_savings: f64, quality: f64, frequent_deletes: f64) -> f64 {
        let (w_savings, w_quality) = self.profile.weights();
        w_savings * token_savings + w_quality * quality - frequent_deletes
    }

    fn values(&self, key: &str) -> [f64; 5] {
        self.q.get(key).copied().unwrap_or([0.0; 5])
    }

    fn best_action(values: &[f64; 5]) -> PolicyAction {
        let mut best = PolicyAction::NoOp;
        let mut best_value = f64::MIN;
        for action in PolicyAction::ALL {
            let v = values[action.index()];
            if v > best_value {
                best_value = v;
                best = action;
            }
        }
        best
    }
}

impl RetentionPolicy for QLearningPolicy {
    fn name(&self) -> &'static str {
        "rl_based"
    }

    fn observe(&mut self, state: &PolicyState) -> Result<PolicyAction, PolicyError> {
        let key = state.bucket_key();
        let values = self.values(&key);

        let mut rng = rand::thread_rng();
        let action = if rng.gen::<f64>() < self.epsilon() {
            PolicyAction::ALL[rng.gen_range(0..PolicyAction::ALL.len())]
        } else {
            Self::best_action(&values)
        };

        self.steps += 1;
        tracing::debug!(
            state = %key,
            action = action.as_str(),
            epsilon = self.epsilon(),
            "rl policy decision"
        );
        Ok(action)
    }

    fn learn(
        &mut self,
        state: &PolicyState,
        action: PolicyAction,
        reward: f64,
        next_state: &PolicyState,
    ) {
        let key = state.bucket_key();
        let next_values = self.values(&next_state.bucket_key());
        let next_best = next_values[Self::best_action(&next_values).index()];

        let entry = self.q.entry(key).or_insert([0.0; 5]);
        let idx = action.index();
        entry[idx] += ALPHA * (reward + GAMMA * next_best - entry[idx]);
    }

    fn punish(&mut self, state_key: &str, action: PolicyAction) {
        let entry = self.q.entry(state_key.to_string()).or_insert([0.0; 5]);
        entry[action.index()] -= UNLEARN_PENALTY;
    }

    fn persist(&self) -> Result<(), PolicyError> {
        let file = QTableFile {
            version: 1,
            steps: self.steps,
            profile: self.profile,
            q: self.q.clone(),
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write-then-rename so a crash never leaves a torn state file
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&file)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state(active: i64) -> PolicyState {
        PolicyState {
            active_memories: active,
            pending_decay: 0,
            low_band_share: 0.1,
            writes_last_hour: 5,
            minutes_since_hygiene: 30,
        }
    }

    #[test]
    fn test_epsilon_decays_to_floor() {
        let dir = TempDir::new().unwrap();
        let mut policy =
            QLearningPolicy::load(dir.path().join("policy.json"), RewardProfile::Balanced)
                .unwrap();
        assert!((policy.epsilon() - EPSILON_INITIAL).abs() < 1e-9);

        policy.steps = 10_000;
        assert!((policy.epsilon() - EPSILON_FLOOR).abs() < 1e-9);
    }

    #[test]
    fn test_learning_moves_q_toward_reward() {
        let dir = TempDir::new().unwrap();
        let mut policy =
            QLearningPolicy::load(dir.path().join("policy.json"), RewardProfile::Balanced)
                .unwrap();
        let s = state(500);

        for _ in 0..50 {
            policy.learn(&s, PolicyAction::ConsolidateLight, 1.0, &s);
        }
        let values = policy.values(&s.bucket_key());
        assert!(values[PolicyAction::ConsolidateLight.index()] > 0.5);
        assert_eq!(values[PolicyAction::NoOp.index()], 0.0);
    }

    #[test]
    fn test_punish_downweights_action() {
        let dir = TempDir::new().unwrap();
        let mut policy =
            QLearningPolicy::load(dir.path().join("policy.json"), RewardProfile::Balanced)
                .unwrap();
        let key = state(500).bucket_key();

        policy.punish(&key, PolicyAction::ConsolidateAggressive);
        let values = policy.values(&key);
        assert!(values[PolicyAction::ConsolidateAggressive.index()] < 0.0);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("policy.json");
        let s = state(500);

        {
            let mut policy =
                QLearningPolicy::load(path.clone(), RewardProfile::CostFocused).unwrap();
            policy.learn(&s, PolicyAction::PassiveSweep, 2.0, &s);
            policy.steps = 42;
            policy.persist().unwrap();
        }

        let restored = QLearningPolicy::load(path.clone(), RewardProfile::CostFocused).unwrap();
        assert_eq!(restored.steps, 42);
        let values = restored.values(&s.bucket_key());
        assert!(values[PolicyAction::PassiveSweep.index()] > 0.0);

        // The file is plain data: readable JSON with a version marker
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"version\": 1"));
        assert!(raw.contains("\"q\""));
    }

    #[test]
    fn test_reward_profiles_change_weighting() {
        let dir = TempDir::new().unwrap();
        let cost =
            QLearningPolicy::load(dir.path().join("a.json"), RewardProfile::CostFocused).unwrap();
        let quality =
            QLearningPolicy::load(dir.path().join("b.json"), RewardProfile::QualityFocused)
                .unwrap();

        // Same proxies, very different rewards
        assert!(cost.reward(1.0, 0.1, 0.0) > quality.reward(1.0, 0.1, 0.0));
        assert!(quality.reward(0.1, 1.0, 0.0) > cost.reward(0.1, 1.0, 0.0));
    }
}
