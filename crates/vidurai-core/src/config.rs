//! Configuration
//!
//! One bundle with an exhaustive recognized key set; unrecognized keys are
//! rejected at load. No key mutates behavior mid-run: the engine re-reads
//! applied config at tick boundaries (see the scheduler), and `set_config`
//! requests stage a replacement bundle for the next boundary.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::memory::Salience;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTIONS
// ============================================================================

/// Per-salience passive-decay thresholds, in days. `critical` has no
/// threshold: CRITICAL never expires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct DecayThresholds {
    pub high_days: u32,
    pub medium_days: u32,
    pub low_days: u32,
    pub noise_days: u32,
}

impl Default for DecayThresholds {
    fn default() -> Self {
        Self {
            high_days: 180,
            medium_days: 90,
            low_days: 7,
            noise_days: 1,
        }
    }
}

impl DecayThresholds {
    /// Threshold for a salience level; None means never decays
    pub fn for_salience(&self, salience: Salience) -> Option<chrono::Duration> {
        match salience {
            Salience::Critical => None,
            Salience::High => Some(chrono::Duration::days(self.high_days as i64)),
            Salience::Medium => Some(chrono::Duration::days(self.medium_days as i64)),
            Salience::Low => Some(chrono::Duration::days(self.low_days as i64)),
            Salience::Noise => Some(chrono::Duration::days(self.noise_days as i64)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct AggregationConfig {
    pub enabled: bool,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Which retention policy drives hygiene decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    RuleBased,
    RlBased,
}

/// Reward weighting for the learning policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RewardProfile {
    #[default]
    Balanced,
    CostFocused,
    QualityFocused,
}

impl RewardProfile {
    /// (token-savings weight, quality weight)
    pub fn weights(&self) -> (f64, f64) {
        match self {
            RewardProfile::Balanced => (1.0, 1.0),
            RewardProfile::CostFocused => (3.0, 0.5),
            RewardProfile::QualityFocused => (0.3, 5.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct RetentionConfig {
    pub policy: PolicyKind,
    pub reward_profile: RewardProfile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct ConsolidationConfig {
    /// Outputs are at most this fraction of inputs (token proxy)
    pub target_ratio: f64,
    /// Lowest salience band eligible for consolidation grouping
    pub min_salience: Salience,
    /// Only memories untouched for this long are candidates
    pub max_age_days: u32,
    pub preserve_critical: bool,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            target_ratio: 0.4,
            min_salience: Salience::Low,
            max_age_days: 30,
            preserve_critical: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct GatekeeperConfig {
    pub extra_patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct OracleConfig {
    pub default_max_tokens: u32,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            default_max_tokens: 4000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct SchedulerConfig {
    pub hygiene_interval_s: u64,
    pub archive_interval_s: u64,
    pub dream_interval_s: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            hygiene_interval_s: 300,
            archive_interval_s: 86_400,
            dream_interval_s: 3_600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct IngressConfig {
    pub bounded_queue_capacity: usize,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            bounded_queue_capacity: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct WriterConfig {
    pub micro_batch_size: usize,
    pub micro_batch_window_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            micro_batch_size: 64,
            micro_batch_window_ms: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct ClassifierConfig {
    pub use_llm_gist: bool,
}

// ============================================================================
// BUNDLE
// ============================================================================

/// The full configuration bundle. Every section has defaults; a missing
/// file means pure defaults, an unknown key anywhere is an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct Config {
    pub decay_thresholds: DecayThresholds,
    pub aggregation: AggregationConfig,
    pub retention: RetentionConfig,
    pub consolidation: ConsolidationConfig,
    pub gatekeeper: GatekeeperConfig,
    pub oracle: OracleConfig,
    pub scheduler: SchedulerConfig,
    pub ingress: IngressConfig,
    pub writer: WriterConfig,
    pub classifier: ClassifierConfig,
}

impl Config {
    /// Load from a JSON file; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from a JSON value (the `set_config` request body)
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.consolidation.target_ratio) {
            return Err(ConfigError::Invalid(format!(
                "consolidation.target_ratio must be within 0..1, got {}",
                self.consolidation.target_ratio
            )));
        }
        if matches!(
            self.consolidation.min_salience,
            Salience::High | Salience::Critical
        ) {
            return Err(ConfigError::Invalid(
                "consolidation.min_salience must be NOISE, LOW or MEDIUM".into(),
            ));
        }
        if self.ingress.bounded_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "ingress.bounded_queue_capacity must be positive".into(),
            ));
        }
        if self.writer.micro_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "writer.micro_batch_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
