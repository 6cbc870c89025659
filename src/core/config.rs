//! Engine configuration.
//!
//! Every section has a `Default` and deserializes with `#[serde(default)]`, so
//! a JSON config file only needs to name what it changes. Numeric knobs can
//! additionally be overridden from the parameter provider (see
//! [`EngineConfig::apply_parameter_overrides`]).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{GoalError, Result};
use super::gap::Severity;
use super::params::ParameterProvider;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub simulation: SimulationConfig,
    pub cache: CacheConfig,
    pub probability: ProbabilityConfig,
    pub gap: GapConfig,
    pub remediation: RemediationConfig,
    pub scenario: ScenarioConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimulationConfig {
    pub default_trials: u32,
    pub max_trials: u32,
    pub seed: u64,
    pub parallel_batch_size: usize,
    /// Trial counts at or above this run on the rayon pool when the caller
    /// did not choose explicitly.
    pub parallel_threshold: u32,
    /// Years of yearly checkpoints recorded beyond (or up to) the horizon.
    pub projection_years: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            default_trials: 1_000,
            max_trials: 100_000,
            seed: 42,
            parallel_batch_size: 256,
            parallel_threshold: 2_000,
            projection_years: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: u64,
    pub flush_interval_secs: u64,
    pub flight_timeout_ms: u64,
    pub persist_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 3_600,
            max_entries: 512,
            flush_interval_secs: 300,
            flight_timeout_ms: 30_000,
            persist_path: None,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs.max(1))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn flight_timeout(&self) -> Duration {
        Duration::from_millis(self.flight_timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProbabilityConfig {
    pub shortfall_pct: f64,
    pub upside_pct: f64,
    pub var_confidence: f64,
    pub partial_success_fraction: f64,
    pub timepoint_years: Vec<u32>,
    pub target_probabilities: Vec<f64>,
    pub max_years: u32,
    pub probability_tolerance: f64,
}

impl Default for ProbabilityConfig {
    fn default() -> Self {
        Self {
            shortfall_pct: 0.20,
            upside_pct: 0.20,
            var_confidence: 0.95,
            partial_success_fraction: 0.80,
            timepoint_years: vec![1, 3, 5, 10, 15, 20],
            target_probabilities: vec![0.50, 0.75, 0.90],
            max_years: 30,
            probability_tolerance: 0.01,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GapConfig {
    /// Fraction of disposable income considered available for goals.
    pub savings_rate: f64,
    /// Severity thresholds in percent of target.
    pub critical_pct: f64,
    pub significant_pct: f64,
    pub moderate_pct: f64,
    pub short_horizon_months: u32,
    pub long_horizon_months: u32,
    /// Relative excess of required over affordable monthly capacity that
    /// counts as a resource conflict.
    pub conflict_threshold: f64,
    pub conflict_window_months: u32,
    pub max_projection_months: u32,
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            savings_rate: 0.5,
            critical_pct: 50.0,
            significant_pct: 25.0,
            moderate_pct: 10.0,
            short_horizon_months: 24,
            long_horizon_months: 120,
            conflict_threshold: 0.10,
            conflict_window_months: 12,
            max_projection_months: 1_200,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RemediationConfig {
    pub contribution: ContributionConfig,
    pub timeframe: TimeframeConfig,
    pub target: TargetConfig,
    pub allocation: AllocationConfig,
    pub priority: PriorityConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContributionConfig {
    pub factor: f64,
    pub min_increase: f64,
    /// Largest increase as a fraction of gross monthly income.
    pub max_income_fraction: f64,
    pub feasibility_threshold: f64,
}

impl Default for ContributionConfig {
    fn default() -> Self {
        Self {
            factor: 1.0,
            min_increase: 500.0,
            max_income_fraction: 0.30,
            feasibility_threshold: 0.30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimeframeConfig {
    pub factor: f64,
    pub min_extension_months: u32,
    pub max_extension_months: u32,
    pub feasibility_threshold: f64,
}

impl Default for TimeframeConfig {
    fn default() -> Self {
        Self {
            factor: 1.0,
            min_extension_months: 6,
            max_extension_months: 60,
            feasibility_threshold: 0.30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TargetConfig {
    pub factor: f64,
    /// Reduction bounds as fractions of the target amount.
    pub min_reduction: f64,
    pub max_reduction: f64,
    pub feasibility_threshold: f64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            factor: 1.0,
            min_reduction: 0.05,
            max_reduction: 0.30,
            feasibility_threshold: 0.30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AllocationConfig {
    /// Shift per unit of gap fraction.
    pub factor: f64,
    pub min_shift: f64,
    pub max_shift: f64,
    /// Horizons shorter than this get de-risking options instead.
    pub short_horizon_months: u32,
    pub feasibility_threshold: f64,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            factor: 0.5,
            min_shift: 0.05,
            max_shift: 0.30,
            short_horizon_months: 36,
            feasibility_threshold: 0.30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PriorityConfig {
    pub factor: f64,
    /// Largest share of affordable capacity that may be redirected.
    pub max_reallocation_fraction: f64,
    pub deferral_months: u32,
    pub feasibility_threshold: f64,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            factor: 1.0,
            max_reallocation_fraction: 0.5,
            deferral_months: 24,
            feasibility_threshold: 0.30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScenarioConfig {
    pub financial_weight: f64,
    pub timeline_weight: f64,
    pub effort_weight: f64,
    pub minor_success: f64,
    pub moderate_success: f64,
    pub significant_success: f64,
    pub critical_success: f64,
    pub goal_override_effort: f64,
    pub profile_override_effort: f64,
    pub timeline_shift_effort: f64,
    pub allocation_override_effort: f64,
    /// Average extension at which the timeline score reaches zero.
    pub timeline_penalty_months: f64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            financial_weight: 0.5,
            timeline_weight: 0.3,
            effort_weight: 0.2,
            minor_success: 0.90,
            moderate_success: 0.70,
            significant_success: 0.45,
            critical_success: 0.20,
            goal_override_effort: 0.15,
            profile_override_effort: 0.30,
            timeline_shift_effort: 0.10,
            allocation_override_effort: 0.10,
            timeline_penalty_months: 60.0,
        }
    }
}

impl ScenarioConfig {
    pub fn success_factor(&self, severity: Severity) -> f64 {
        match severity {
            Severity::Minor => self.minor_success,
            Severity::Moderate => self.moderate_success,
            Severity::Significant => self.significant_success,
            Severity::Critical => self.critical_success,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| GoalError::Storage(format!("invalid config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            GoalError::Storage(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        let gap = &self.gap;
        if !(gap.critical_pct >= gap.significant_pct && gap.significant_pct >= gap.moderate_pct) {
            return Err(GoalError::validation(
                "severity thresholds must satisfy critical >= significant >= moderate",
            ));
        }
        if !(0.0..=1.0).contains(&gap.savings_rate) {
            return Err(GoalError::validation("gap.savingsRate must be within [0, 1]"));
        }
        let s = &self.scenario;
        let weights = [s.financial_weight, s.timeline_weight, s.effort_weight];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) || weights.iter().sum::<f64>() <= 0.0
        {
            return Err(GoalError::validation(
                "scenario weights must be non-negative and not all zero",
            ));
        }
        if !(0.0..1.0).contains(&self.probability.var_confidence) {
            return Err(GoalError::validation("probability.varConfidence must be within [0, 1)"));
        }
        if self.simulation.default_trials == 0 || self.simulation.max_trials == 0 {
            return Err(GoalError::validation("simulation trial counts must be > 0"));
        }
        Ok(())
    }

    /// Replaces numeric knobs with provider values where present.
    pub fn apply_parameter_overrides(&mut self, provider: &dyn ParameterProvider) {
        let gap = &mut self.gap;
        gap.savings_rate = provider.get_or("gap.savings_rate", gap.savings_rate);
        gap.critical_pct = provider.get_or("gap.severity.critical_pct", gap.critical_pct);
        gap.significant_pct = provider.get_or("gap.severity.significant_pct", gap.significant_pct);
        gap.moderate_pct = provider.get_or("gap.severity.moderate_pct", gap.moderate_pct);
        gap.conflict_threshold = provider.get_or("gap.conflict_threshold", gap.conflict_threshold);

        let r = &mut self.remediation;
        r.contribution.factor =
            provider.get_or("remediation.contribution.factor", r.contribution.factor);
        r.contribution.min_increase =
            provider.get_or("remediation.contribution.min_increase", r.contribution.min_increase);
        r.contribution.max_income_fraction = provider.get_or(
            "remediation.contribution.max_income_fraction",
            r.contribution.max_income_fraction,
        );
        r.timeframe.factor = provider.get_or("remediation.timeframe.factor", r.timeframe.factor);
        r.target.factor = provider.get_or("remediation.target.factor", r.target.factor);
        r.target.max_reduction =
            provider.get_or("remediation.target.max_reduction", r.target.max_reduction);
        r.allocation.factor = provider.get_or("remediation.allocation.factor", r.allocation.factor);
        r.allocation.max_shift =
            provider.get_or("remediation.allocation.max_shift", r.allocation.max_shift);
        r.priority.factor = provider.get_or("remediation.priority.factor", r.priority.factor);

        let s = &mut self.scenario;
        s.financial_weight = provider.get_or("scenario.weights.financial", s.financial_weight);
        s.timeline_weight = provider.get_or("scenario.weights.timeline", s.timeline_weight);
        s.effort_weight = provider.get_or("scenario.weights.effort", s.effort_weight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::StaticParameters;

    #[test]
    fn partial_json_keeps_defaults_for_everything_else() {
        let json = r#"{"gap": {"savingsRate": 0.6}, "cache": {"ttlSecs": 10}}"#;
        let config = EngineConfig::from_json_str(json).expect("valid config");
        assert_eq!(config.gap.savings_rate, 0.6);
        assert_eq!(config.gap.critical_pct, 50.0);
        assert_eq!(config.cache.ttl_secs, 10);
        assert_eq!(config.scenario, ScenarioConfig::default());
    }

    #[test]
    fn misordered_severity_thresholds_are_rejected() {
        let err = EngineConfig::from_json_str(r#"{"gap": {"criticalPct": 5}}"#)
            .expect_err("critical below moderate");
        assert!(err.is_validation());
    }

    #[test]
    fn provider_overrides_replace_knobs() {
        let mut params = StaticParameters::empty();
        params.set("gap.severity.critical_pct", 60.0);
        params.set("scenario.weights.effort", 0.4);
        let mut config = EngineConfig::default();
        config.apply_parameter_overrides(&params);
        assert_eq!(config.gap.critical_pct, 60.0);
        assert_eq!(config.scenario.effort_weight, 0.4);
        assert_eq!(config.gap.significant_pct, 25.0);
    }
}
