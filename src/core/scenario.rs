//! Scenario bundles: named sets of goal and profile adjustments evaluated
//! and ranked as a unit.

use std::collections::{BTreeSet, HashSet};
use std::mem;

use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::config::ScenarioConfig;
use super::error::{GoalError, Result};
use super::gap::GapAnalyzer;
use super::remediation::shift_allocation;
use super::types::{
    Allocation, FinancialProfile, Goal, Importance, RiskTolerance, resolve_profile_defaults,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GoalOverride {
    pub goal_id: String,
    pub target_amount: Option<f64>,
    pub current_amount: Option<f64>,
    pub monthly_contribution: Option<f64>,
    pub target_date: Option<NaiveDate>,
    pub importance: Option<Importance>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProfileOverride {
    pub annual_income: Option<f64>,
    pub annual_expenses: Option<f64>,
    pub risk_tolerance: Option<RiskTolerance>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineShift {
    pub goal_id: String,
    /// Calendar months; negative moves the date earlier.
    pub months: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationOverride {
    pub goal_id: String,
    pub allocation: Allocation,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScenarioAdjustments {
    pub goal_overrides: Vec<GoalOverride>,
    pub profile_override: Option<ProfileOverride>,
    pub timeline_shifts: Vec<TimelineShift>,
    pub allocation_overrides: Vec<AllocationOverride>,
}

impl ScenarioAdjustments {
    pub fn is_empty(&self) -> bool {
        self.goal_overrides.is_empty()
            && self.profile_override.is_none()
            && self.timeline_shifts.is_empty()
            && self.allocation_overrides.is_empty()
    }
}

/// Record of one adjustment applied while building a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AppliedAdjustment {
    GoalOverride {
        goal_id: String,
        fields: Vec<String>,
    },
    ProfileOverride {
        fields: Vec<String>,
    },
    TimelineShift {
        goal_id: String,
        months: i32,
        from: Option<NaiveDate>,
        to: NaiveDate,
    },
    AllocationOverride {
        goal_id: String,
        allocation: Allocation,
    },
}

impl AppliedAdjustment {
    fn effort(&self, config: &ScenarioConfig) -> f64 {
        match self {
            AppliedAdjustment::GoalOverride { .. } => config.goal_override_effort,
            AppliedAdjustment::ProfileOverride { .. } => config.profile_override_effort,
            AppliedAdjustment::TimelineShift { .. } => config.timeline_shift_effort,
            AppliedAdjustment::AllocationOverride { .. } => config.allocation_override_effort,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub name: String,
    pub description: String,
    pub goals: Vec<Goal>,
    pub profile: FinancialProfile,
    pub applied: Vec<AppliedAdjustment>,
}

impl Scenario {
    /// Months of delay summed over goals, counting only later dates.
    fn total_extension_months(&self) -> f64 {
        self.applied
            .iter()
            .filter_map(|a| match a {
                AppliedAdjustment::TimelineShift { months, .. } if *months > 0 => {
                    Some(*months as f64)
                }
                _ => None,
            })
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioResult {
    pub name: String,
    pub success_probability: f64,
    pub effort_required: f64,
    pub financial_impact: f64,
    pub timeline_impact: f64,
    pub composite_score: f64,
    pub total_gap: f64,
    pub failed_goals: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioComparison {
    pub results: Vec<ScenarioResult>,
    pub optimal_scenario: String,
    /// Scenario names by descending composite score.
    pub ranking: Vec<String>,
}

impl ScenarioComparison {
    pub fn optimal(&self) -> Option<&ScenarioResult> {
        self.results.iter().find(|r| r.name == self.optimal_scenario)
    }
}

pub const BASELINE: &str = "baseline";
pub const CONSERVATIVE: &str = "conservative";
pub const AGGRESSIVE: &str = "aggressive";
pub const BALANCED: &str = "balanced";
pub const PRIORITIZED: &str = "prioritized";

#[derive(Debug, Clone)]
pub struct ScenarioEngine {
    config: ScenarioConfig,
    gap: GapAnalyzer,
}

impl ScenarioEngine {
    pub fn new(config: ScenarioConfig, gap: GapAnalyzer) -> Self {
        Self { config, gap }
    }

    /// Builds a scenario from copies of `goals` and `profile`. Adjustments
    /// apply in order: goal overrides, profile override, timeline shifts,
    /// allocation overrides.
    pub fn create_scenario(
        &self,
        name: &str,
        description: &str,
        goals: &[Goal],
        profile: &FinancialProfile,
        adjustments: &ScenarioAdjustments,
    ) -> Result<Scenario> {
        if name.trim().is_empty() {
            return Err(GoalError::validation("scenario name must not be empty"));
        }
        let mut goals = goals.to_vec();
        let mut profile = profile.clone();
        let mut applied = Vec::new();

        for o in &adjustments.goal_overrides {
            let goal = find_goal(&mut goals, &o.goal_id)?;
            let mut fields = Vec::new();
            if let Some(v) = o.target_amount {
                goal.target_amount = v;
                fields.push("target_amount".to_string());
            }
            if let Some(v) = o.current_amount {
                goal.current_amount = v;
                fields.push("current_amount".to_string());
            }
            if let Some(v) = o.monthly_contribution {
                goal.monthly_contribution = v;
                fields.push("monthly_contribution".to_string());
            }
            if let Some(v) = o.target_date {
                goal.target_date = Some(v);
                fields.push("target_date".to_string());
            }
            if let Some(v) = o.importance {
                goal.importance = v;
                fields.push("importance".to_string());
            }
            goal.validate()?;
            if !fields.is_empty() {
                applied.push(AppliedAdjustment::GoalOverride {
                    goal_id: o.goal_id.clone(),
                    fields,
                });
            }
        }

        if let Some(o) = &adjustments.profile_override {
            let mut fields = Vec::new();
            if let Some(v) = o.annual_income {
                profile.annual_income = v;
                fields.push("annual_income".to_string());
            }
            if let Some(v) = o.annual_expenses {
                profile.annual_expenses = v;
                fields.push("annual_expenses".to_string());
            }
            if let Some(v) = o.risk_tolerance {
                profile.risk_tolerance = Some(v);
                fields.push("risk_tolerance".to_string());
            }
            profile.validate()?;
            if !fields.is_empty() {
                applied.push(AppliedAdjustment::ProfileOverride { fields });
            }
        }

        let as_of = self.gap.as_of();
        for shift in &adjustments.timeline_shifts {
            let goal = find_goal(&mut goals, &shift.goal_id)?;
            let from = goal.target_date;
            let to = shift_date(from.unwrap_or(as_of), shift.months).ok_or_else(|| {
                GoalError::validation(format!(
                    "goal {}: shifting by {} months leaves the calendar range",
                    shift.goal_id, shift.months
                ))
            })?;
            goal.target_date = Some(to);
            applied.push(AppliedAdjustment::TimelineShift {
                goal_id: shift.goal_id.clone(),
                months: shift.months,
                from,
                to,
            });
        }

        for o in &adjustments.allocation_overrides {
            let goal = find_goal(&mut goals, &o.goal_id)?;
            let allocation = o.allocation.normalized().map_err(|e| match e {
                GoalError::Validation(msg) => {
                    GoalError::Validation(format!("goal {}: {msg}", o.goal_id))
                }
                other => other,
            })?;
            goal.asset_allocation = allocation.clone();
            applied.push(AppliedAdjustment::AllocationOverride {
                goal_id: o.goal_id.clone(),
                allocation,
            });
        }

        debug!(scenario = name, adjustments = applied.len(), "scenario created");
        Ok(Scenario {
            name: name.to_string(),
            description: description.to_string(),
            goals,
            profile,
            applied,
        })
    }

    /// Baseline, conservative, aggressive, balanced and prioritized bundles
    /// over the same goals.
    pub fn standard_scenarios(
        &self,
        goals: &[Goal],
        profile: &FinancialProfile,
    ) -> Result<Vec<Scenario>> {
        profile.validate()?;
        let gaps: Vec<(&Goal, f64)> = goals
            .iter()
            .filter_map(|goal| match self.gap.analyze_goal_gap(goal, profile) {
                Ok(gap) => Some((goal, gap.required_monthly)),
                Err(e) => {
                    warn!(
                        goal_id = %goal.id,
                        error = %e,
                        "goal left unadjusted in standard scenarios"
                    );
                    None
                }
            })
            .collect();
        let risk = resolve_profile_defaults(profile).risk_tolerance;

        let conservative = ScenarioAdjustments {
            goal_overrides: gaps
                .iter()
                .map(|(g, _)| GoalOverride {
                    goal_id: g.id.clone(),
                    target_amount: Some(g.target_amount * 0.9),
                    ..GoalOverride::default()
                })
                .collect(),
            timeline_shifts: gaps
                .iter()
                .map(|(g, _)| TimelineShift {
                    goal_id: g.id.clone(),
                    months: 12,
                })
                .collect(),
            ..ScenarioAdjustments::default()
        };

        let aggressive = ScenarioAdjustments {
            goal_overrides: gaps
                .iter()
                .filter(|(g, required)| *required > g.monthly_contribution)
                .map(|(g, required)| GoalOverride {
                    goal_id: g.id.clone(),
                    monthly_contribution: Some(*required),
                    ..GoalOverride::default()
                })
                .collect(),
            allocation_overrides: gaps
                .iter()
                .filter_map(|(g, _)| {
                    let current = g.effective_allocation(risk).ok()?;
                    let headroom = risk.max_growth_weight() - current.growth_weight();
                    if headroom <= 0.0 {
                        return None;
                    }
                    Some(AllocationOverride {
                        goal_id: g.id.clone(),
                        allocation: shift_allocation(&current, headroom.min(0.10), true),
                    })
                })
                .collect(),
            ..ScenarioAdjustments::default()
        };

        let balanced = ScenarioAdjustments {
            goal_overrides: gaps
                .iter()
                .filter(|(g, required)| *required > g.monthly_contribution)
                .map(|(g, required)| GoalOverride {
                    goal_id: g.id.clone(),
                    monthly_contribution: Some(
                        g.monthly_contribution + (required - g.monthly_contribution) * 0.5,
                    ),
                    ..GoalOverride::default()
                })
                .collect(),
            timeline_shifts: gaps
                .iter()
                .map(|(g, _)| TimelineShift {
                    goal_id: g.id.clone(),
                    months: 6,
                })
                .collect(),
            ..ScenarioAdjustments::default()
        };

        let mut prioritized = ScenarioAdjustments::default();
        for (g, required) in &gaps {
            match g.importance {
                Importance::High if *required > g.monthly_contribution => {
                    prioritized.goal_overrides.push(GoalOverride {
                        goal_id: g.id.clone(),
                        monthly_contribution: Some(*required),
                        ..GoalOverride::default()
                    });
                }
                Importance::Low => {
                    prioritized.goal_overrides.push(GoalOverride {
                        goal_id: g.id.clone(),
                        monthly_contribution: Some(g.monthly_contribution * 0.5),
                        ..GoalOverride::default()
                    });
                    prioritized.timeline_shifts.push(TimelineShift {
                        goal_id: g.id.clone(),
                        months: 24,
                    });
                }
                _ => {}
            }
        }

        let bundles = [
            (BASELINE, "Current plan without changes", ScenarioAdjustments::default()),
            (
                CONSERVATIVE,
                "Targets trimmed by 10% and every goal pushed out a year",
                conservative,
            ),
            (
                AGGRESSIVE,
                "Contributions raised to close gaps on time, portfolios tilted to growth",
                aggressive,
            ),
            (
                BALANCED,
                "Half of each contribution shortfall covered, goals pushed out six months",
                balanced,
            ),
            (
                PRIORITIZED,
                "High-importance goals fully funded, low-importance goals deferred",
                prioritized,
            ),
        ];
        bundles
            .iter()
            .map(|(name, description, adjustments)| {
                self.create_scenario(name, description, goals, profile, adjustments)
            })
            .collect()
    }

    pub fn evaluate_scenario(&self, scenario: &Scenario) -> Result<ScenarioResult> {
        let overall = self.gap.analyze_overall_gap(&scenario.goals, &scenario.profile)?;
        let cfg = &self.config;

        let (weighted, weights) = overall.results().fold((0.0, 0.0), |(sum, total), r| {
            let w = r.importance.weight();
            (sum + w * cfg.success_factor(r.severity), total + w)
        });
        let success_probability = if weights > 0.0 { weighted / weights } else { 0.0 };

        // each kind of adjustment costs its weight once
        let mut kinds = HashSet::new();
        let effort_required = scenario
            .applied
            .iter()
            .filter(|a| kinds.insert(mem::discriminant(*a)))
            .map(|a| a.effort(cfg))
            .sum::<f64>()
            .min(1.0);

        let funded_share = if overall.total_target > 0.0 {
            (1.0 - overall.total_gap / overall.total_target).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let financial_impact = 100.0 * (success_probability + funded_share) / 2.0;

        let goal_count = scenario.goals.len().max(1) as f64;
        let mean_extension = scenario.total_extension_months() / goal_count;
        let timeline_impact = if cfg.timeline_penalty_months > 0.0 {
            (100.0 * (1.0 - mean_extension / cfg.timeline_penalty_months)).clamp(0.0, 100.0)
        } else {
            100.0
        };

        let composite_score = cfg.financial_weight * financial_impact / 100.0
            + cfg.timeline_weight * timeline_impact / 100.0
            + cfg.effort_weight * (1.0 - effort_required);

        Ok(ScenarioResult {
            name: scenario.name.clone(),
            success_probability,
            effort_required,
            financial_impact,
            timeline_impact,
            composite_score,
            total_gap: overall.total_gap,
            failed_goals: overall.failed_goals,
        })
    }

    /// Evaluates and ranks `scenarios`. The optimal scenario has the highest
    /// composite score; ties go to the earlier scenario.
    pub fn compare_scenarios(&self, scenarios: &[Scenario]) -> Result<ScenarioComparison> {
        if scenarios.is_empty() {
            return Err(GoalError::validation("no scenarios to compare"));
        }
        let mut seen = BTreeSet::new();
        if let Some(dup) = scenarios.iter().find(|s| !seen.insert(s.name.as_str())) {
            return Err(GoalError::validation(format!(
                "duplicate scenario name '{}'",
                dup.name
            )));
        }

        let results = scenarios
            .iter()
            .map(|s| self.evaluate_scenario(s))
            .collect::<Result<Vec<_>>>()?;

        let mut best = &results[0];
        for r in &results[1..] {
            if r.composite_score > best.composite_score {
                best = r;
            }
        }
        let optimal_scenario = best.name.clone();

        let mut order: Vec<&ScenarioResult> = results.iter().collect();
        order.sort_by(|a, b| b.composite_score.total_cmp(&a.composite_score));
        let ranking = order.into_iter().map(|r| r.name.clone()).collect();

        debug!(optimal = %optimal_scenario, scenarios = results.len(), "scenarios compared");
        Ok(ScenarioComparison {
            results,
            optimal_scenario,
            ranking,
        })
    }
}

fn find_goal<'a>(goals: &'a mut [Goal], id: &str) -> Result<&'a mut Goal> {
    goals
        .iter_mut()
        .find(|g| g.id == id)
        .ok_or_else(|| GoalError::validation(format!("unknown goal id '{id}'")))
}

/// Calendar month shift; day-of-month clamps to the end of shorter months.
pub fn shift_date(date: NaiveDate, months: i32) -> Option<NaiveDate> {
    let magnitude = Months::new(months.unsigned_abs());
    if months >= 0 {
        date.checked_add_months(magnitude)
    } else {
        date.checked_sub_months(magnitude)
    }
}
