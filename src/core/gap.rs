use std::collections::BTreeMap;
use std::fmt;

use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::config::GapConfig;
use super::error::Result;
use super::market::MarketAssumptions;
use super::remediation::RemediationOption;
use super::types::{FinancialProfile, Goal, GoalCategory, Importance, resolve_profile_defaults};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Minor,
    Moderate,
    Significant,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Minor,
        Severity::Moderate,
        Severity::Significant,
        Severity::Critical,
    ];

    fn level(self) -> i32 {
        match self {
            Severity::Minor => 0,
            Severity::Moderate => 1,
            Severity::Significant => 2,
            Severity::Critical => 3,
        }
    }

    fn from_level(level: i32) -> Self {
        match level {
            i32::MIN..=0 => Severity::Minor,
            1 => Severity::Moderate,
            2 => Severity::Significant,
            _ => Severity::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Minor => "minor",
            Severity::Moderate => "moderate",
            Severity::Significant => "significant",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a funding gap.
///
/// The percentage picks the base level; short horizons and high importance
/// each add a level, very long horizons and low importance each remove one.
/// A zero gap is always minor.
pub fn classify_severity(
    gap_percentage: f64,
    timeframe_months: u32,
    importance: Importance,
    config: &GapConfig,
) -> Severity {
    if gap_percentage.is_nan() || gap_percentage <= 0.0 {
        return Severity::Minor;
    }
    let base = if gap_percentage >= config.critical_pct {
        Severity::Critical
    } else if gap_percentage >= config.significant_pct {
        Severity::Significant
    } else if gap_percentage >= config.moderate_pct {
        Severity::Moderate
    } else {
        Severity::Minor
    };

    let mut shift = 0;
    if timeframe_months <= config.short_horizon_months {
        shift += 1;
    } else if timeframe_months >= config.long_horizon_months {
        shift -= 1;
    }
    match importance {
        Importance::High => shift += 1,
        Importance::Low => shift -= 1,
        Importance::Medium => {}
    }
    Severity::from_level(base.level() + shift)
}

/// Monthly rate equivalent to an annual return.
pub fn monthly_rate(annual_return: f64) -> f64 {
    (1.0 + annual_return).max(0.0).powf(1.0 / 12.0) - 1.0
}

/// Deterministic future value of `current` plus `monthly` contributions
/// after `months` at the monthly rate `rate`.
pub fn future_value(current: f64, monthly: f64, rate: f64, months: u32) -> f64 {
    let n = months as f64;
    if rate.abs() < 1e-12 {
        return current + monthly * n;
    }
    let growth = (1.0 + rate).powf(n);
    current * growth + monthly * (growth - 1.0) / rate
}

/// Contribution that reaches `target` after `months`; the whole remaining
/// amount when no months remain.
pub fn required_monthly_contribution(current: f64, target: f64, rate: f64, months: u32) -> f64 {
    if months == 0 {
        return (target - current).max(0.0);
    }
    let n = months as f64;
    let (growth, annuity) = if rate.abs() < 1e-12 {
        (1.0, n)
    } else {
        let growth = (1.0 + rate).powf(n);
        (growth, (growth - 1.0) / rate)
    };
    let needed = target - current * growth;
    if needed <= 0.0 {
        return 0.0;
    }
    needed / annuity
}

/// Months until the deterministic projection reaches `target`, or `None`
/// when it does not within `max_months`.
pub fn months_to_target(
    current: f64,
    monthly: f64,
    target: f64,
    rate: f64,
    max_months: u32,
) -> Option<u32> {
    if current >= target {
        return Some(0);
    }
    if monthly <= 0.0 && (rate <= 0.0 || current <= 0.0) {
        return None;
    }
    let mut value = current;
    for month in 1..=max_months {
        value = value * (1.0 + rate) + monthly;
        if value >= target {
            return Some(month);
        }
    }
    None
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GapResult {
    pub goal_id: String,
    pub goal_title: String,
    pub category: GoalCategory,
    pub importance: Importance,
    pub target_amount: f64,
    pub current_amount: f64,
    pub monthly_contribution: f64,
    pub target_date: Option<NaiveDate>,
    pub expected_return: f64,
    pub projected_amount: f64,
    pub gap_amount: f64,
    pub gap_percentage: f64,
    pub available_months: u32,
    pub required_months: Option<u32>,
    /// `required - available`; negative when ahead of schedule.
    pub timeframe_gap_months: Option<i64>,
    pub required_monthly: f64,
    pub affordable_monthly: f64,
    pub capacity_gap: f64,
    pub severity: Severity,
    #[serde(default)]
    pub remediation_options: Vec<RemediationOption>,
}

impl GapResult {
    pub fn has_gap(&self) -> bool {
        self.gap_amount > 0.0
    }

    pub fn gap_fraction(&self) -> f64 {
        self.gap_percentage / 100.0
    }
}

/// Per-goal slot of an aggregate analysis: a result, or the error that goal
/// produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalGapEntry {
    pub goal_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<GapResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GapConflict {
    Capacity {
        required_monthly: f64,
        affordable_monthly: f64,
        excess_fraction: f64,
    },
    Timeline {
        goal_ids: Vec<String>,
        window_start: NaiveDate,
        window_end: NaiveDate,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallAssessment {
    OnTrack,
    NeedsAttention,
    AtRisk,
    Critical,
}

impl OverallAssessment {
    pub fn as_str(self) -> &'static str {
        match self {
            OverallAssessment::OnTrack => "on_track",
            OverallAssessment::NeedsAttention => "needs_attention",
            OverallAssessment::AtRisk => "at_risk",
            OverallAssessment::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverallGapResult {
    pub goal_gaps: Vec<GoalGapEntry>,
    pub analyzed_goals: usize,
    pub failed_goals: usize,
    pub total_target: f64,
    pub total_current: f64,
    pub total_gap: f64,
    pub total_required_monthly: f64,
    pub affordable_monthly: f64,
    pub severity_counts: BTreeMap<Severity, usize>,
    pub conflicts: Vec<GapConflict>,
    pub assessment: OverallAssessment,
    pub summary: String,
}

impl OverallGapResult {
    pub fn results(&self) -> impl Iterator<Item = &GapResult> {
        self.goal_gaps.iter().filter_map(|entry| entry.result.as_ref())
    }

    pub fn has_capacity_conflict(&self) -> bool {
        self.conflicts
            .iter()
            .any(|c| matches!(c, GapConflict::Capacity { .. }))
    }

    pub fn has_timeline_conflict(&self) -> bool {
        self.conflicts
            .iter()
            .any(|c| matches!(c, GapConflict::Timeline { .. }))
    }
}

#[derive(Debug, Clone)]
pub struct GapAnalyzer {
    config: GapConfig,
    assumptions: MarketAssumptions,
    as_of: NaiveDate,
}

impl GapAnalyzer {
    pub fn new(config: GapConfig, assumptions: MarketAssumptions, as_of: NaiveDate) -> Self {
        Self {
            config,
            assumptions,
            as_of,
        }
    }

    pub fn config(&self) -> &GapConfig {
        &self.config
    }

    pub fn as_of(&self) -> NaiveDate {
        self.as_of
    }

    pub fn affordable_monthly(&self, profile: &FinancialProfile) -> f64 {
        profile.disposable_monthly() * self.config.savings_rate
    }

    /// Expected annual return of the allocation the goal would simulate with.
    pub fn expected_return(&self, goal: &Goal, profile: &FinancialProfile) -> Result<f64> {
        let risk = resolve_profile_defaults(profile).risk_tolerance;
        let allocation = goal.effective_allocation(risk)?;
        Ok(self.assumptions.expected_return(&allocation))
    }

    pub fn analyze_goal_gap(&self, goal: &Goal, profile: &FinancialProfile) -> Result<GapResult> {
        goal.validate()?;
        profile.validate()?;

        let expected_return = self.expected_return(goal, profile)?;
        let rate = monthly_rate(expected_return);
        let available_months = goal.horizon_months(self.as_of);

        let projected_amount = future_value(
            goal.current_amount,
            goal.monthly_contribution,
            rate,
            available_months,
        );
        let gap_amount = (goal.target_amount - projected_amount).max(0.0);
        let gap_percentage = if goal.target_amount > 0.0 {
            gap_amount / goal.target_amount * 100.0
        } else {
            0.0
        };

        let required_months = months_to_target(
            goal.current_amount,
            goal.monthly_contribution,
            goal.target_amount,
            rate,
            self.config.max_projection_months,
        );
        let timeframe_gap_months =
            required_months.map(|required| required as i64 - available_months as i64);

        let required_monthly = required_monthly_contribution(
            goal.current_amount,
            goal.target_amount,
            rate,
            available_months,
        );
        let affordable_monthly = self.affordable_monthly(profile);
        let capacity_gap = (required_monthly - affordable_monthly).max(0.0);

        let severity = classify_severity(
            gap_percentage,
            available_months,
            goal.importance,
            &self.config,
        );
        debug!(
            goal_id = %goal.id,
            gap_amount,
            gap_percentage,
            %severity,
            "goal gap analyzed"
        );

        Ok(GapResult {
            goal_id: goal.id.clone(),
            goal_title: goal.title.clone(),
            category: goal.category,
            importance: goal.importance,
            target_amount: goal.target_amount,
            current_amount: goal.current_amount,
            monthly_contribution: goal.monthly_contribution,
            target_date: goal.target_date,
            expected_return,
            projected_amount,
            gap_amount,
            gap_percentage,
            available_months,
            required_months,
            timeframe_gap_months,
            required_monthly,
            affordable_monthly,
            capacity_gap,
            severity,
            remediation_options: Vec::new(),
        })
    }

    /// Aggregate analysis. A goal that fails validation is reported with its
    /// error while the remaining goals are still analyzed.
    pub fn analyze_overall_gap(
        &self,
        goals: &[Goal],
        profile: &FinancialProfile,
    ) -> Result<OverallGapResult> {
        profile.validate()?;

        let goal_gaps: Vec<GoalGapEntry> = goals
            .iter()
            .map(|goal| match self.analyze_goal_gap(goal, profile) {
                Ok(result) => GoalGapEntry {
                    goal_id: goal.id.clone(),
                    result: Some(result),
                    error: None,
                },
                Err(e) => {
                    warn!(goal_id = %goal.id, error = %e, "goal excluded from overall gap");
                    GoalGapEntry {
                        goal_id: goal.id.clone(),
                        result: None,
                        error: Some(e.to_string()),
                    }
                }
            })
            .collect();

        let results: Vec<&GapResult> = goal_gaps.iter().filter_map(|e| e.result.as_ref()).collect();
        let analyzed_goals = results.len();
        let failed_goals = goal_gaps.len() - analyzed_goals;

        let total_target: f64 = results.iter().map(|r| r.target_amount).sum();
        let total_current: f64 = results.iter().map(|r| r.current_amount).sum();
        let total_gap: f64 = results.iter().map(|r| r.gap_amount).sum();
        let total_required_monthly: f64 = results.iter().map(|r| r.required_monthly).sum();
        let affordable_monthly = self.affordable_monthly(profile);

        let mut severity_counts: BTreeMap<Severity, usize> =
            Severity::ALL.iter().map(|s| (*s, 0)).collect();
        for r in &results {
            *severity_counts.entry(r.severity).or_default() += 1;
        }

        let mut conflicts = Vec::new();
        if let Some(conflict) = self.capacity_conflict(total_required_monthly, affordable_monthly) {
            conflicts.push(conflict);
        }
        conflicts.extend(self.timeline_conflicts(&results));

        let assessment = assess(&results, &conflicts, failed_goals);
        let with_gaps = results.iter().filter(|r| r.has_gap()).count();
        let summary = format!(
            "{analyzed_goals} goal(s) analyzed, {with_gaps} with funding gaps \
             totalling {total_gap:.0}; {} conflict(s); overall {}",
            conflicts.len(),
            assessment.as_str()
        );

        Ok(OverallGapResult {
            goal_gaps,
            analyzed_goals,
            failed_goals,
            total_target,
            total_current,
            total_gap,
            total_required_monthly,
            affordable_monthly,
            severity_counts,
            conflicts,
            assessment,
            summary,
        })
    }

    fn capacity_conflict(&self, required: f64, affordable: f64) -> Option<GapConflict> {
        if required <= affordable * (1.0 + self.config.conflict_threshold) {
            return None;
        }
        let excess_fraction = if affordable > 0.0 {
            required / affordable - 1.0
        } else {
            f64::MAX
        };
        Some(GapConflict::Capacity {
            required_monthly: required,
            affordable_monthly: affordable,
            excess_fraction,
        })
    }

    /// Groups of two or more high-importance goals with gaps whose target
    /// dates fall inside one conflict window.
    fn timeline_conflicts(&self, results: &[&GapResult]) -> Vec<GapConflict> {
        let mut dated: Vec<(NaiveDate, &str)> = results
            .iter()
            .filter(|r| r.importance == Importance::High && r.has_gap())
            .map(|r| (r.target_date.unwrap_or(self.as_of), r.goal_id.as_str()))
            .collect();
        dated.sort();

        let window = Months::new(self.config.conflict_window_months);
        let mut conflicts = Vec::new();
        let mut start = 0;
        while start < dated.len() {
            let window_start = dated[start].0;
            let window_end = window_start
                .checked_add_months(window)
                .unwrap_or(NaiveDate::MAX);
            let end = dated[start..]
                .iter()
                .position(|(date, _)| *date >= window_end)
                .map_or(dated.len(), |offset| start + offset);
            if end - start >= 2 {
                conflicts.push(GapConflict::Timeline {
                    goal_ids: dated[start..end].iter().map(|(_, id)| id.to_string()).collect(),
                    window_start,
                    window_end,
                });
                start = end;
            } else {
                start += 1;
            }
        }
        conflicts
    }
}

fn assess(
    results: &[&GapResult],
    conflicts: &[GapConflict],
    failed_goals: usize,
) -> OverallAssessment {
    let critical_high = results
        .iter()
        .any(|r| r.severity == Severity::Critical && r.importance == Importance::High);
    let severe_capacity = conflicts.iter().any(|c| {
        matches!(c, GapConflict::Capacity { excess_fraction, .. } if *excess_fraction >= 1.0)
    });
    if critical_high || severe_capacity {
        return OverallAssessment::Critical;
    }
    let serious = results
        .iter()
        .any(|r| matches!(r.severity, Severity::Critical | Severity::Significant));
    let capacity = conflicts
        .iter()
        .any(|c| matches!(c, GapConflict::Capacity { .. }));
    if serious || capacity {
        return OverallAssessment::AtRisk;
    }
    if results.iter().any(|r| r.severity == Severity::Moderate)
        || !conflicts.is_empty()
        || failed_goals > 0
    {
        return OverallAssessment::NeedsAttention;
    }
    OverallAssessment::OnTrack
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Allocation, AssetClass};
    use proptest::prelude::{prop_assert_eq, proptest};

    fn assert_approx_tol(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    fn as_of() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 1).expect("valid date")
    }

    fn analyzer() -> GapAnalyzer {
        GapAnalyzer::new(GapConfig::default(), MarketAssumptions::default(), as_of())
    }

    fn emergency_goal() -> Goal {
        Goal {
            id: "emergency".to_string(),
            category: GoalCategory::EmergencyFund,
            title: "Emergency fund".to_string(),
            target_amount: 300_000.0,
            current_amount: 100_000.0,
            target_date: None,
            importance: Importance::High,
            monthly_contribution: 0.0,
            asset_allocation: Allocation::new(),
        }
    }

    fn dated_goal(id: &str, date: (i32, u32, u32), importance: Importance) -> Goal {
        Goal {
            id: id.to_string(),
            category: GoalCategory::Custom,
            title: id.to_string(),
            target_amount: 1_000_000.0,
            current_amount: 0.0,
            target_date: NaiveDate::from_ymd_opt(date.0, date.1, date.2),
            importance,
            monthly_contribution: 1_000.0,
            asset_allocation: Allocation::from_pairs([(AssetClass::Cash, 1.0)]),
        }
    }

    #[test]
    fn underfunded_emergency_fund_has_large_gap() {
        let profile = FinancialProfile::new(80_000.0, 50_000.0);
        let gap = analyzer()
            .analyze_goal_gap(&emergency_goal(), &profile)
            .expect("analysis");
        assert_approx_tol(gap.gap_amount, 200_000.0, 1e-6);
        assert_approx_tol(gap.gap_percentage, 66.666_666, 1e-3);
        assert!(matches!(gap.severity, Severity::Significant | Severity::Critical));
        assert_eq!(gap.available_months, 0);
        // reachable by growth alone, roughly twelve years out
        assert!(gap.required_months.is_some_and(|m| m > 120));
        assert_approx_tol(gap.affordable_monthly, 1_250.0, 1e-9);
        assert_approx_tol(gap.required_monthly, 200_000.0, 1e-6);
        assert_approx_tol(gap.capacity_gap, 198_750.0, 1e-6);
    }

    #[test]
    fn severity_thresholds_and_adjustments() {
        let cfg = GapConfig::default();
        let mid = 60;
        assert_eq!(classify_severity(0.0, 6, Importance::High, &cfg), Severity::Minor);
        assert_eq!(classify_severity(5.0, mid, Importance::Medium, &cfg), Severity::Minor);
        assert_eq!(classify_severity(10.0, mid, Importance::Medium, &cfg), Severity::Moderate);
        assert_eq!(classify_severity(25.0, mid, Importance::Medium, &cfg), Severity::Significant);
        assert_eq!(classify_severity(50.0, mid, Importance::Medium, &cfg), Severity::Critical);
        // short horizon and high importance both escalate
        assert_eq!(classify_severity(10.0, 12, Importance::High, &cfg), Severity::Critical);
        // long horizon and low importance both de-escalate
        assert_eq!(classify_severity(50.0, 240, Importance::Low, &cfg), Severity::Moderate);
        // they cancel out
        assert_eq!(classify_severity(30.0, 12, Importance::Low, &cfg), Severity::Significant);
        assert_eq!(classify_severity(5.0, 240, Importance::Low, &cfg), Severity::Minor);
    }

    #[test]
    fn projection_and_required_values_agree() {
        let rate = monthly_rate(0.12);
        let fv = future_value(10_000.0, 500.0, rate, 60);
        let required = required_monthly_contribution(10_000.0, fv, rate, 60);
        assert_approx_tol(required, 500.0, 1e-6);
        assert_approx_tol(future_value(100.0, 10.0, 0.0, 12), 220.0, 1e-12);
        assert_eq!(months_to_target(0.0, 100.0, 1_200.0, 0.0, 1_200), Some(12));
        assert_eq!(months_to_target(50.0, 0.0, 100.0, 0.0, 1_200), None);
        assert_eq!(months_to_target(150.0, 0.0, 100.0, 0.0, 1_200), Some(0));
    }

    #[test]
    fn dated_goal_reports_timeframe_gap() {
        let mut goal = dated_goal("car", (2027, 1, 1), Importance::Medium);
        goal.target_amount = 36_000.0;
        let assumptions = MarketAssumptions::default()
            .with_overrides(&[crate::core::market::SimulationOverride::ExpectedReturn {
                asset: AssetClass::Cash,
                value: 0.0,
            }])
            .expect("valid");
        let analyzer = GapAnalyzer::new(GapConfig::default(), assumptions, as_of());
        let gap = analyzer
            .analyze_goal_gap(&goal, &FinancialProfile::new(120_000.0, 60_000.0))
            .expect("analysis");
        assert_eq!(gap.available_months, 24);
        assert_approx_tol(gap.projected_amount, 24_000.0, 1e-9);
        assert_approx_tol(gap.gap_amount, 12_000.0, 1e-9);
        assert_eq!(gap.required_months, Some(36));
        assert_eq!(gap.timeframe_gap_months, Some(12));
        assert_approx_tol(gap.required_monthly, 1_500.0, 1e-9);
        assert_approx_tol(gap.capacity_gap, 0.0, 1e-9);
    }

    #[test]
    fn overall_gap_isolates_failures_and_flags_conflicts() {
        let mut broken = dated_goal("broken", (2026, 1, 1), Importance::Low);
        broken.target_amount = -5.0;
        let goals = vec![
            dated_goal("house", (2026, 3, 1), Importance::High),
            dated_goal("school", (2026, 9, 1), Importance::High),
            broken,
            dated_goal("trip", (2030, 1, 1), Importance::Low),
        ];
        let profile = FinancialProfile::new(60_000.0, 36_000.0);
        let overall = analyzer()
            .analyze_overall_gap(&goals, &profile)
            .expect("aggregate");
        assert_eq!(overall.analyzed_goals, 3);
        assert_eq!(overall.failed_goals, 1);
        let failed = &overall.goal_gaps[2];
        assert!(failed.result.is_none());
        assert!(failed.error.as_deref().is_some_and(|e| e.contains("target_amount")));
        assert!(overall.has_capacity_conflict());
        assert!(overall.has_timeline_conflict());
        let timeline = overall
            .conflicts
            .iter()
            .find_map(|c| match c {
                GapConflict::Timeline { goal_ids, .. } => Some(goal_ids.clone()),
                _ => None,
            })
            .expect("timeline conflict");
        assert_eq!(timeline, vec!["house".to_string(), "school".to_string()]);
        assert_eq!(overall.assessment, OverallAssessment::Critical);
        assert_eq!(overall.severity_counts.values().sum::<usize>(), 3);
    }

    #[test]
    fn fully_funded_goals_are_on_track() {
        let mut goal = dated_goal("done", (2030, 1, 1), Importance::Medium);
        goal.current_amount = 2_000_000.0;
        let overall = analyzer()
            .analyze_overall_gap(&[goal], &FinancialProfile::new(100_000.0, 40_000.0))
            .expect("aggregate");
        assert_eq!(overall.assessment, OverallAssessment::OnTrack);
        assert!(overall.conflicts.is_empty());
        assert_eq!(overall.total_gap, 0.0);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(128))]

        #[test]
        fn prop_severity_is_a_pure_function(
            pct in 0.0f64..100.0,
            months in 0u32..400,
            importance_idx in 0usize..3,
        ) {
            let importance =
                [Importance::High, Importance::Medium, Importance::Low][importance_idx];
            let cfg = GapConfig::default();
            let first = classify_severity(pct, months, importance, &cfg);
            let second = classify_severity(pct, months, importance, &cfg.clone());
            prop_assert_eq!(first, second);
        }
    }
}
