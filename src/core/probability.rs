use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::config::ProbabilityConfig;
use super::engine::SimulationResult;
use super::error::{GoalError, Result};
use super::types::Goal;

/// Percentiles reported in every [`DistributionMetrics`].
pub const REPORTED_PERCENTILES: [u32; 5] = [10, 25, 50, 75, 90];

/// Outcome distribution over the raw trial values, sorted once.
#[derive(Debug, Clone, PartialEq)]
pub struct GoalOutcomeDistribution {
    sorted: Vec<f64>,
}

impl GoalOutcomeDistribution {
    pub fn from_trials(values: &[f64]) -> Result<Self> {
        if values.is_empty() {
            return Err(GoalError::computation("outcome distribution has no trials"));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(GoalError::computation(
                "outcome distribution contains non-finite values",
            ));
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        Ok(Self { sorted })
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    /// Fraction of trials that reach `target`.
    pub fn success_probability(&self, target: f64) -> f64 {
        let below = self.sorted.partition_point(|v| *v < target);
        ((self.sorted.len() - below) as f64 / self.sorted.len() as f64).clamp(0.0, 1.0)
    }

    pub fn shortfall_risk(&self, target: f64, pct: f64) -> f64 {
        1.0 - self.success_probability(target * (1.0 - pct))
    }

    pub fn upside_probability(&self, target: f64, pct: f64) -> f64 {
        self.success_probability(target * (1.0 + pct))
    }

    /// `p` in percent, linear interpolation between closest ranks.
    pub fn percentile(&self, p: f64) -> f64 {
        let n = self.sorted.len();
        if n == 1 {
            return self.sorted[0];
        }
        let rank = (p.clamp(0.0, 100.0) / 100.0) * (n as f64 - 1.0);
        let lower = rank.floor() as usize;
        let upper = rank.ceil() as usize;
        if lower == upper {
            self.sorted[lower]
        } else {
            let w = rank - lower as f64;
            self.sorted[lower] * (1.0 - w) + self.sorted[upper] * w
        }
    }

    pub fn median(&self) -> f64 {
        self.percentile(50.0)
    }

    pub fn value_at_risk(&self, confidence: f64) -> f64 {
        self.percentile((1.0 - confidence) * 100.0)
    }

    /// Mean of the trials strictly below VaR; VaR itself when none are.
    pub fn conditional_value_at_risk(&self, confidence: f64) -> f64 {
        let var = self.value_at_risk(confidence);
        let tail = &self.sorted[..self.sorted.partition_point(|v| *v < var)];
        if tail.is_empty() {
            return var;
        }
        tail.iter().sum::<f64>() / tail.len() as f64
    }

    pub fn mean(&self) -> f64 {
        self.sorted.iter().sum::<f64>() / self.sorted.len() as f64
    }

    pub fn std_dev(&self) -> f64 {
        let mean = self.mean();
        let variance = self
            .sorted
            .iter()
            .map(|v| (v - mean).powi(2))
            .sum::<f64>()
            / self.sorted.len() as f64;
        variance.sqrt()
    }

    pub fn min(&self) -> f64 {
        self.sorted[0]
    }

    pub fn max(&self) -> f64 {
        self.sorted[self.sorted.len() - 1]
    }

    /// Average amount missing among the trials that fall short of `target`.
    pub fn expected_shortfall(&self, target: f64) -> f64 {
        let below = &self.sorted[..self.sorted.partition_point(|v| *v < target)];
        if below.is_empty() {
            return 0.0;
        }
        below.iter().map(|v| target - v).sum::<f64>() / below.len() as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessMetrics {
    pub success_probability: f64,
    pub partial_success_probability: f64,
    pub shortfall_risk: f64,
    pub upside_probability: f64,
    pub expected_shortfall: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionMetrics {
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    /// Keyed `p10`, `p25`, ...
    pub percentiles: BTreeMap<String, f64>,
    pub var_confidence: f64,
    pub value_at_risk: f64,
    pub conditional_value_at_risk: f64,
    pub value_at_risk_99: f64,
    pub conditional_value_at_risk_99: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimepointProbability {
    pub year: u32,
    pub probability: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbabilityHorizon {
    pub target_probability: f64,
    /// `None` when the probability is not reached within the simulated years.
    pub years: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeBasedMetrics {
    pub horizon_months: u32,
    pub probability_at_timepoints: Vec<TimepointProbability>,
    pub years_to_probability: Vec<ProbabilityHorizon>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbabilityResult {
    pub goal_id: String,
    pub target_amount: f64,
    pub trials: usize,
    pub success_metrics: SuccessMetrics,
    pub distribution: DistributionMetrics,
    pub time_based: TimeBasedMetrics,
}

impl ProbabilityResult {
    pub fn success_probability(&self) -> f64 {
        self.success_metrics.success_probability
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProbabilityAnalyzer {
    config: ProbabilityConfig,
}

impl ProbabilityAnalyzer {
    pub fn new(config: ProbabilityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProbabilityConfig {
        &self.config
    }

    pub fn analyze(&self, result: &SimulationResult, goal: &Goal) -> Result<ProbabilityResult> {
        let dist = GoalOutcomeDistribution::from_trials(result.values())?;
        let target = goal.target_amount;
        let cfg = &self.config;

        let success_metrics = SuccessMetrics {
            success_probability: dist.success_probability(target),
            partial_success_probability: dist
                .success_probability(target * cfg.partial_success_fraction),
            shortfall_risk: dist.shortfall_risk(target, cfg.shortfall_pct),
            upside_probability: dist.upside_probability(target, cfg.upside_pct),
            expected_shortfall: dist.expected_shortfall(target),
        };

        let percentiles = REPORTED_PERCENTILES
            .iter()
            .map(|p| (format!("p{p}"), dist.percentile(*p as f64)))
            .collect();
        let distribution = DistributionMetrics {
            mean: dist.mean(),
            median: dist.median(),
            std_dev: dist.std_dev(),
            min: dist.min(),
            max: dist.max(),
            percentiles,
            var_confidence: cfg.var_confidence,
            value_at_risk: dist.value_at_risk(cfg.var_confidence),
            conditional_value_at_risk: dist.conditional_value_at_risk(cfg.var_confidence),
            value_at_risk_99: dist.value_at_risk(0.99),
            conditional_value_at_risk_99: dist.conditional_value_at_risk(0.99),
        };

        let years_to_probability = cfg
            .target_probabilities
            .iter()
            .map(|&p| ProbabilityHorizon {
                target_probability: p,
                years: self.time_to_goal_probability(result, target, p, cfg.max_years),
            })
            .collect();
        let time_based = TimeBasedMetrics {
            horizon_months: result.horizon_months,
            probability_at_timepoints: self.probability_at_timepoints(
                result,
                target,
                &cfg.timepoint_years,
            ),
            years_to_probability,
        };

        Ok(ProbabilityResult {
            goal_id: goal.id.clone(),
            target_amount: target,
            trials: dist.len(),
            success_metrics,
            distribution,
            time_based,
        })
    }

    /// Success probability of reaching `target` after `year` whole years.
    pub fn projected_probability(&self, result: &SimulationResult, target: f64, year: u32) -> f64 {
        result
            .checkpoint(year)
            .and_then(|values| GoalOutcomeDistribution::from_trials(values).ok())
            .map(|dist| dist.success_probability(target))
            .unwrap_or(0.0)
    }

    pub fn probability_at_timepoints(
        &self,
        result: &SimulationResult,
        target: f64,
        years: &[u32],
    ) -> Vec<TimepointProbability> {
        years
            .iter()
            .map(|&year| TimepointProbability {
                year,
                probability: self.projected_probability(result, target, year),
            })
            .collect()
    }

    /// Smallest whole year whose projected probability is within tolerance of
    /// `target_probability`. Without an exact match the closer of the two
    /// bracketing years wins; `None` if even `max_years` falls short.
    pub fn time_to_goal_probability(
        &self,
        result: &SimulationResult,
        target: f64,
        target_probability: f64,
        max_years: u32,
    ) -> Option<u32> {
        let tol = self.config.probability_tolerance;
        let p = |year: u32| self.projected_probability(result, target, year);
        let reaches = |prob: f64| prob >= target_probability - tol;

        if reaches(p(0)) {
            return Some(0);
        }
        if !reaches(p(max_years)) {
            return None;
        }

        let (mut lo, mut hi) = (0u32, max_years);
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if reaches(p(mid)) {
                hi = mid;
            } else {
                lo = mid;
            }
        }

        let p_hi = p(hi);
        if (p_hi - target_probability).abs() <= tol {
            return Some(hi);
        }
        let p_lo = p(lo);
        if target_probability - p_lo < p_hi - target_probability {
            Some(lo)
        } else {
            Some(hi)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Allocation, GoalCategory, Importance};
    use proptest::prelude::{prop_assert, proptest};
    use proptest::collection::vec;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    fn goal(target: f64) -> Goal {
        Goal {
            id: "g".to_string(),
            category: GoalCategory::Education,
            title: String::new(),
            target_amount: target,
            current_amount: 0.0,
            target_date: None,
            importance: Importance::Medium,
            monthly_contribution: 0.0,
            asset_allocation: Allocation::new(),
        }
    }

    /// Ten trials per year; `fractions[y]` of them reach 200, the rest 0.
    fn staged_result(fractions: &[f64]) -> SimulationResult {
        let yearly_values: Vec<Vec<f64>> = fractions
            .iter()
            .map(|f| {
                let hits = (f * 10.0).round() as usize;
                (0..10).map(|i| if i < hits { 200.0 } else { 0.0 }).collect()
            })
            .collect();
        SimulationResult {
            horizon_months: 12 * (fractions.len() as u32 - 1),
            values: yearly_values[fractions.len() - 1].clone(),
            yearly_values,
        }
    }

    #[test]
    fn percentile_interpolates_between_points() {
        let dist = GoalOutcomeDistribution::from_trials(&[4.0, 1.0, 3.0, 2.0]).expect("dist");
        assert_approx(dist.percentile(25.0), 1.75);
        assert_approx(dist.median(), 2.5);
        assert_approx(dist.percentile(100.0), 4.0);
    }

    #[test]
    fn success_counts_trials_at_or_above_target() {
        let dist =
            GoalOutcomeDistribution::from_trials(&[50.0, 100.0, 150.0, 200.0]).expect("dist");
        assert_approx(dist.success_probability(100.0), 0.75);
        assert_approx(dist.success_probability(0.0), 1.0);
        assert_approx(dist.success_probability(1_000.0), 0.0);
        assert_approx(dist.shortfall_risk(200.0, 0.25), 0.5);
        assert_approx(dist.upside_probability(100.0, 0.5), 0.5);
        assert_approx(dist.expected_shortfall(150.0), 75.0);
    }

    #[test]
    fn cvar_averages_the_tail_below_var() {
        let values: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        let dist = GoalOutcomeDistribution::from_trials(&values).expect("dist");
        let var = dist.value_at_risk(0.95);
        assert_approx(var, 5.95);
        assert_approx(dist.conditional_value_at_risk(0.95), 3.0);

        let single = GoalOutcomeDistribution::from_trials(&[7.0]).expect("dist");
        assert_approx(single.conditional_value_at_risk(0.95), 7.0);
    }

    #[test]
    fn empty_or_non_finite_trials_are_computation_errors() {
        assert!(matches!(
            GoalOutcomeDistribution::from_trials(&[]),
            Err(GoalError::Computation(_))
        ));
        assert!(matches!(
            GoalOutcomeDistribution::from_trials(&[1.0, f64::NAN]),
            Err(GoalError::Computation(_))
        ));
    }

    #[test]
    fn analyze_reports_all_metric_groups() {
        let result = staged_result(&[0.0, 0.3, 0.6, 0.9]);
        let analyzer = ProbabilityAnalyzer::default();
        let report = analyzer.analyze(&result, &goal(100.0)).expect("analysis");
        assert_approx(report.success_probability(), 0.9);
        assert_eq!(report.trials, 10);
        assert_eq!(report.distribution.percentiles.len(), 5);
        assert!(report.distribution.value_at_risk_99 <= report.distribution.value_at_risk);
        let at = &report.time_based.probability_at_timepoints;
        assert_eq!(at[0], TimepointProbability { year: 1, probability: 0.3 });
        // years past the simulated range clamp to the last checkpoint
        assert_approx(at.last().expect("timepoint").probability, 0.9);
    }

    #[test]
    fn time_to_goal_finds_exact_and_closest_years() {
        let result = staged_result(&[0.0, 0.2, 0.5, 0.8, 1.0]);
        let analyzer = ProbabilityAnalyzer::default();
        assert_eq!(analyzer.time_to_goal_probability(&result, 100.0, 0.8, 4), Some(3));
        assert_eq!(analyzer.time_to_goal_probability(&result, 100.0, 0.5, 4), Some(2));
        // 0.6 sits between 0.5 (year 2) and 0.8 (year 3); year 2 is closer
        assert_eq!(analyzer.time_to_goal_probability(&result, 100.0, 0.6, 4), Some(2));
        // 0.7 is closer to year 3
        assert_eq!(analyzer.time_to_goal_probability(&result, 100.0, 0.7, 4), Some(3));
        assert_eq!(analyzer.time_to_goal_probability(&result, 100.0, 0.0, 4), Some(0));
    }

    #[test]
    fn time_to_goal_is_none_when_never_reached() {
        let result = staged_result(&[0.0, 0.2, 0.4]);
        let analyzer = ProbabilityAnalyzer::default();
        assert_eq!(analyzer.time_to_goal_probability(&result, 100.0, 0.9, 2), None);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(64))]

        #[test]
        fn prop_success_probability_is_monotone_in_target(
            values in vec(0.0f64..1_000_000.0, 1..200),
            t1 in 0.0f64..1_000_000.0,
            delta in 0.0f64..500_000.0,
        ) {
            let dist = GoalOutcomeDistribution::from_trials(&values).expect("dist");
            let p1 = dist.success_probability(t1);
            let p2 = dist.success_probability(t1 + delta);
            prop_assert!(p1 >= p2);
            prop_assert!((0.0..=1.0).contains(&p1));
        }

        #[test]
        fn prop_var_is_more_extreme_at_higher_confidence(
            values in vec(-1_000.0f64..1_000_000.0, 1..200),
        ) {
            let dist = GoalOutcomeDistribution::from_trials(&values).expect("dist");
            prop_assert!(dist.value_at_risk(0.99) <= dist.value_at_risk(0.95));
            prop_assert!(dist.conditional_value_at_risk(0.95) <= dist.value_at_risk(0.95));
        }
    }
}
