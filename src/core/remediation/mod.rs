//! Remediation strategies.
//!
//! Each strategy turns a [`GapResult`] into a handful of concrete options
//! (conservative, optimal, aggressive), scores their feasibility and keeps
//! the ones above its threshold. [`RemediationEngine`] runs all of them.

mod allocation;
mod contribution;
mod priority;
mod target;
mod timeframe;

use std::collections::BTreeMap;

use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::config::RemediationConfig;
use super::gap::{GapResult, future_value, monthly_rate};
use super::market::MarketAssumptions;
use super::types::{Allocation, FinancialProfile, Goal, Importance};

pub use allocation::{AllocationAdjustment, shift_allocation};
pub use contribution::ContributionAdjustment;
pub use priority::PriorityAdjustment;
pub use target::TargetAdjustment;
pub use timeframe::TimeframeAdjustment;

/// Starting point of every feasibility score before the strategy's factors.
pub const BASE_FEASIBILITY: f64 = 0.5;
pub const MIN_FEASIBILITY: f64 = 0.1;
pub const MAX_FEASIBILITY: f64 = 1.0;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Contribution,
    Timeframe,
    Target,
    Allocation,
    Priority,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::Contribution => "contribution",
            StrategyKind::Timeframe => "timeframe",
            StrategyKind::Target => "target",
            StrategyKind::Allocation => "allocation",
            StrategyKind::Priority => "priority",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Conservative,
    Optimal,
    Aggressive,
}

impl Variant {
    pub const ALL: [Variant; 3] = [Variant::Conservative, Variant::Optimal, Variant::Aggressive];

    pub fn multiplier(self) -> f64 {
        match self {
            Variant::Conservative => 0.5,
            Variant::Optimal => 1.0,
            Variant::Aggressive => 1.5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Variant::Conservative => "conservative",
            Variant::Optimal => "optimal",
            Variant::Aggressive => "aggressive",
        }
    }
}

/// What an option changes, in the goal's own terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Adjustment {
    Contribution {
        current_monthly: f64,
        new_monthly: f64,
    },
    Timeframe {
        current_date: Option<NaiveDate>,
        new_date: NaiveDate,
        extension_months: u32,
    },
    Target {
        current_target: f64,
        new_target: f64,
        reduction_fraction: f64,
    },
    Allocation {
        current: Allocation,
        proposed: Allocation,
        shift: f64,
    },
    Priority {
        new_importance: Importance,
        redirected_monthly: f64,
        donor_goal_ids: Vec<String>,
        deferral_months: Option<u32>,
    },
}

impl Adjustment {
    /// Copy of `goal` with the adjustment applied.
    pub fn apply_to(&self, goal: &Goal) -> Goal {
        let mut adjusted = goal.clone();
        match self {
            Adjustment::Contribution { new_monthly, .. } => {
                adjusted.monthly_contribution = *new_monthly;
            }
            Adjustment::Timeframe { new_date, .. } => adjusted.target_date = Some(*new_date),
            Adjustment::Target { new_target, .. } => adjusted.target_amount = *new_target,
            Adjustment::Allocation { proposed, .. } => {
                adjusted.asset_allocation = proposed.rescaled();
            }
            Adjustment::Priority {
                new_importance,
                redirected_monthly,
                deferral_months,
                ..
            } => {
                adjusted.importance = *new_importance;
                adjusted.monthly_contribution += redirected_monthly;
                if let (Some(months), Some(date)) = (deferral_months, goal.target_date) {
                    adjusted.target_date =
                        date.checked_add_months(Months::new(*months)).or(Some(date));
                }
            }
        }
        adjusted
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemediationOption {
    pub strategy: StrategyKind,
    pub variant: Variant,
    pub goal_id: String,
    pub description: String,
    pub adjustment: Adjustment,
    pub impact_metrics: BTreeMap<String, f64>,
    pub implementation_steps: Vec<String>,
    /// 0 until evaluated, then within [0.1, 1.0].
    pub feasibility_score: f64,
}

impl RemediationOption {
    pub fn new(
        strategy: StrategyKind,
        variant: Variant,
        goal_id: impl Into<String>,
        description: impl Into<String>,
        adjustment: Adjustment,
    ) -> Self {
        Self {
            strategy,
            variant,
            goal_id: goal_id.into(),
            description: description.into(),
            adjustment,
            impact_metrics: BTreeMap::new(),
            implementation_steps: Vec::new(),
            feasibility_score: 0.0,
        }
    }

    pub fn with_metric(mut self, key: &str, value: f64) -> Self {
        self.impact_metrics.insert(key.to_string(), value);
        self
    }

    pub fn with_steps<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.implementation_steps = steps.into_iter().map(Into::into).collect();
        self
    }

    pub fn metric(&self, key: &str) -> Option<f64> {
        self.impact_metrics.get(key).copied()
    }
}

/// Everything a strategy may look at besides the gap itself.
#[derive(Debug, Clone, Copy)]
pub struct StrategyContext<'a> {
    pub goal: &'a Goal,
    pub profile: &'a FinancialProfile,
    /// The user's other goals, used for capacity redirection.
    pub other_goals: &'a [Goal],
    pub assumptions: &'a MarketAssumptions,
    pub as_of: NaiveDate,
}

impl StrategyContext<'_> {
    pub fn monthly_income(&self) -> f64 {
        self.profile.annual_income / 12.0
    }

    /// Deterministic projection at the gap's expected return.
    pub fn project(&self, gap: &GapResult, monthly: f64, months: u32) -> f64 {
        future_value(
            gap.current_amount,
            monthly,
            monthly_rate(gap.expected_return),
            months,
        )
    }
}

pub trait RemediationStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn feasibility_threshold(&self) -> f64;

    /// Unscored options; empty when the goal has no gap.
    fn generate_options(
        &self,
        gap: &GapResult,
        ctx: &StrategyContext<'_>,
    ) -> Vec<RemediationOption>;

    /// Raw score before clamping.
    fn score_feasibility(
        &self,
        option: &RemediationOption,
        gap: &GapResult,
        ctx: &StrategyContext<'_>,
    ) -> f64;

    /// Scores, drops options under the threshold and sorts the rest by
    /// descending feasibility. Equal scores keep generation order.
    fn evaluate_options(
        &self,
        options: Vec<RemediationOption>,
        gap: &GapResult,
        ctx: &StrategyContext<'_>,
    ) -> Vec<RemediationOption> {
        let threshold = self.feasibility_threshold();
        let mut evaluated: Vec<RemediationOption> = options
            .into_iter()
            .map(|mut option| {
                option.feasibility_score =
                    clamp_feasibility(self.score_feasibility(&option, gap, ctx));
                option
            })
            .filter(|option| option.feasibility_score >= threshold)
            .collect();
        evaluated.sort_by(|a, b| b.feasibility_score.total_cmp(&a.feasibility_score));
        evaluated
    }

    fn recommend_best_option(
        &self,
        gap: &GapResult,
        ctx: &StrategyContext<'_>,
    ) -> Option<RemediationOption> {
        let options = self.generate_options(gap, ctx);
        self.evaluate_options(options, gap, ctx).into_iter().next()
    }
}

pub fn clamp_feasibility(score: f64) -> f64 {
    if score.is_nan() {
        return MIN_FEASIBILITY;
    }
    score.clamp(MIN_FEASIBILITY, MAX_FEASIBILITY)
}

/// Magnitudes for the three variants, each clamped to `[min, max]`. The
/// optimal magnitude is always present. When clamping pushes a neighbour onto
/// it, that neighbour is rebuilt from the clamped optimum and dropped only if
/// the bounds leave no room, so a degenerate range yields a single option.
pub fn variant_magnitudes(optimal: f64, min: f64, max: f64) -> Vec<(Variant, f64)> {
    if !optimal.is_finite() || optimal <= 0.0 {
        return Vec::new();
    }
    let hi = max.max(min);
    let clamp = |v: f64| v.clamp(min, hi);
    let distinct = |a: f64, b: f64| (a - b).abs() > 1e-9;

    let centre = clamp(optimal);
    let mut conservative = clamp(optimal * Variant::Conservative.multiplier());
    if !distinct(conservative, centre) {
        conservative = clamp(centre * Variant::Conservative.multiplier());
    }
    let mut aggressive = clamp(optimal * Variant::Aggressive.multiplier());
    if !distinct(aggressive, centre) {
        aggressive = clamp(centre * Variant::Aggressive.multiplier());
    }

    let mut out = Vec::with_capacity(3);
    if distinct(conservative, centre) {
        out.push((Variant::Conservative, conservative));
    }
    out.push((Variant::Optimal, centre));
    if distinct(aggressive, centre) {
        out.push((Variant::Aggressive, aggressive));
    }
    out
}

/// Multiplier for `value` against three ascending thresholds: smaller is
/// safer.
pub(crate) fn band_factor(value: f64, bands: [f64; 3]) -> f64 {
    if value <= bands[0] {
        1.4
    } else if value <= bands[1] {
        1.15
    } else if value <= bands[2] {
        0.85
    } else {
        0.55
    }
}

pub(crate) fn importance_factor(importance: Importance, high: f64, low: f64) -> f64 {
    match importance {
        Importance::High => high,
        Importance::Medium => 1.0,
        Importance::Low => low,
    }
}

pub(crate) fn money(value: f64) -> String {
    format!("{value:.0}")
}

/// Runs every strategy and merges their evaluated options.
pub struct RemediationEngine {
    strategies: Vec<Box<dyn RemediationStrategy>>,
}

impl RemediationEngine {
    pub fn new(strategies: Vec<Box<dyn RemediationStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn from_config(config: &RemediationConfig) -> Self {
        Self::new(vec![
            Box::new(ContributionAdjustment::new(config.contribution.clone())),
            Box::new(TimeframeAdjustment::new(config.timeframe.clone())),
            Box::new(TargetAdjustment::new(config.target.clone())),
            Box::new(AllocationAdjustment::new(config.allocation.clone())),
            Box::new(PriorityAdjustment::new(config.priority.clone())),
        ])
    }

    pub fn strategies(&self) -> impl Iterator<Item = &dyn RemediationStrategy> {
        self.strategies.iter().map(|s| s.as_ref())
    }

    pub fn strategy(&self, kind: StrategyKind) -> Option<&dyn RemediationStrategy> {
        self.strategies().find(|s| s.kind() == kind)
    }

    /// Unscored options from every strategy, in strategy order.
    pub fn generate_options(
        &self,
        gap: &GapResult,
        ctx: &StrategyContext<'_>,
    ) -> Vec<RemediationOption> {
        self.strategies
            .iter()
            .flat_map(|s| s.generate_options(gap, ctx))
            .collect()
    }

    /// Evaluated options of all strategies, most feasible first.
    pub fn evaluate(&self, gap: &GapResult, ctx: &StrategyContext<'_>) -> Vec<RemediationOption> {
        let mut merged: Vec<RemediationOption> = self
            .strategies
            .iter()
            .flat_map(|s| s.evaluate_options(s.generate_options(gap, ctx), gap, ctx))
            .collect();
        merged.sort_by(|a, b| b.feasibility_score.total_cmp(&a.feasibility_score));
        debug!(goal_id = %gap.goal_id, options = merged.len(), "remediation options evaluated");
        merged
    }

    pub fn recommend(
        &self,
        gap: &GapResult,
        ctx: &StrategyContext<'_>,
    ) -> Option<RemediationOption> {
        self.evaluate(gap, ctx).into_iter().next()
    }
}
