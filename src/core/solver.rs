use serde::{Deserialize, Serialize};
use tracing::debug;

use super::engine::{SimulationSettings, simulate};
use super::error::{GoalError, Result};
use super::market::MarketAssumptions;
use super::probability::GoalOutcomeDistribution;
use super::types::{FinancialProfile, Goal};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContributionSolveConfig {
    pub target_success_threshold: f64,
    pub search_min: f64,
    /// Upper monthly contribution bound; `None` derives one from the goal.
    pub search_max: Option<f64>,
    pub tolerance: f64,
    pub max_iterations: u32,
    pub simulations_per_iteration: u32,
    pub final_simulations: u32,
}

impl Default for ContributionSolveConfig {
    fn default() -> Self {
        Self {
            target_success_threshold: 0.75,
            search_min: 0.0,
            search_max: None,
            tolerance: 1.0,
            max_iterations: 40,
            simulations_per_iteration: 500,
            final_simulations: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolveIteration {
    pub iteration: u32,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub candidate_value: f64,
    pub success_rate: f64,
    pub success_ci_half_width: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributionSolveResult {
    pub goal_id: String,
    pub target_success_threshold: f64,
    pub search_min: f64,
    pub search_max: f64,
    pub solved_monthly_contribution: Option<f64>,
    pub achieved_success_rate: Option<f64>,
    pub achieved_success_ci_half_width: Option<f64>,
    pub iterations: Vec<SolveIteration>,
    pub converged: bool,
    pub feasible: bool,
    pub message: String,
}

/// Bisection for the smallest monthly contribution whose simulated success
/// rate meets the threshold. Every candidate reuses the same seed, so the
/// success rate is monotone in the contribution.
pub fn solve_required_contribution(
    goal: &Goal,
    profile: &FinancialProfile,
    assumptions: &MarketAssumptions,
    settings: &SimulationSettings,
    config: ContributionSolveConfig,
) -> Result<ContributionSolveResult> {
    goal.validate()?;
    profile.validate()?;
    let search_max = config
        .search_max
        .unwrap_or_else(|| default_search_max(goal, settings));
    validate_config(&config, search_max)?;

    let evaluate = |candidate: f64, trials: u32| -> Result<CandidateEval> {
        let mut candidate_goal = goal.clone();
        candidate_goal.monthly_contribution = candidate.max(0.0);
        let run = simulate(
            &candidate_goal,
            profile,
            assumptions,
            &SimulationSettings {
                trials: trials.max(1),
                ..settings.clone()
            },
        )?;
        let success_rate = GoalOutcomeDistribution::from_trials(run.values())?
            .success_probability(goal.target_amount);
        Ok(CandidateEval {
            success_rate,
            success_ci_half_width: binomial_ci_half_width(success_rate, trials),
        })
    };

    let per_iteration = config.simulations_per_iteration;
    let low_eval = evaluate(config.search_min, per_iteration)?;
    let high_eval = evaluate(search_max, per_iteration)?;
    let threshold = config.target_success_threshold;

    let mut iterations = Vec::with_capacity(config.max_iterations as usize);
    let mut solved_value = None;
    let mut converged = false;
    let feasible;
    let message;

    if low_eval.success_rate + 1e-12 >= threshold {
        solved_value = Some(config.search_min);
        converged = true;
        feasible = true;
        message = "Already meets target at lower contribution bound.".to_string();
    } else if high_eval.success_rate + 1e-12 < threshold {
        feasible = false;
        message = "No feasible contribution found within the search bounds.".to_string();
    } else {
        let mut lo = config.search_min;
        let mut hi = search_max;
        let mut it = 0;
        while it < config.max_iterations {
            it += 1;
            let mid = (lo + hi) * 0.5;
            let eval = evaluate(mid, per_iteration)?;
            iterations.push(SolveIteration {
                iteration: it,
                lower_bound: lo,
                upper_bound: hi,
                candidate_value: mid,
                success_rate: eval.success_rate,
                success_ci_half_width: eval.success_ci_half_width,
            });

            if eval.success_rate + 1e-12 >= threshold {
                hi = mid;
            } else {
                lo = mid;
            }

            if (hi - lo).abs() <= config.tolerance {
                converged = true;
                break;
            }
        }
        solved_value = Some(hi);
        feasible = true;
        message = if converged {
            "Solved required contribution.".to_string()
        } else {
            "Reached max iterations before tolerance was met; returning best estimate.".to_string()
        };
    }

    let mut achieved_success_rate = None;
    let mut achieved_success_ci_half_width = None;
    if let Some(value) = solved_value {
        let final_eval = evaluate(value, config.final_simulations)?;
        achieved_success_rate = Some(final_eval.success_rate);
        achieved_success_ci_half_width = Some(final_eval.success_ci_half_width);
    }
    debug!(
        goal_id = %goal.id,
        solved = ?solved_value,
        iterations = iterations.len(),
        "required contribution solved"
    );

    Ok(ContributionSolveResult {
        goal_id: goal.id.clone(),
        target_success_threshold: threshold,
        search_min: config.search_min,
        search_max,
        solved_monthly_contribution: solved_value,
        achieved_success_rate,
        achieved_success_ci_half_width,
        iterations,
        converged,
        feasible,
        message,
    })
}

/// Twice the straight-line amount needed per remaining month; the whole
/// remaining amount when the goal is due now.
fn default_search_max(goal: &Goal, settings: &SimulationSettings) -> f64 {
    let months = goal.horizon_months(settings.as_of).max(1) as f64;
    (goal.remaining_amount() / months * 2.0).max(1.0)
}

#[derive(Debug, Clone, Copy)]
struct CandidateEval {
    success_rate: f64,
    success_ci_half_width: f64,
}

fn binomial_ci_half_width(p: f64, n: u32) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let p = p.clamp(0.0, 1.0);
    1.96 * (p * (1.0 - p) / n as f64).sqrt()
}

fn validate_config(config: &ContributionSolveConfig, search_max: f64) -> Result<()> {
    let fail = |msg: &str| Err(GoalError::validation(msg));
    if !(0.0..=1.0).contains(&config.target_success_threshold) {
        return fail("target_success_threshold must be between 0 and 1");
    }
    if !config.search_min.is_finite() || !search_max.is_finite() || config.search_min < 0.0 {
        return fail("search bounds must be finite and non-negative");
    }
    if search_max <= config.search_min {
        return fail("search_max must be greater than search_min");
    }
    if !config.tolerance.is_finite() || config.tolerance <= 0.0 {
        return fail("tolerance must be > 0");
    }
    if config.max_iterations == 0 {
        return fail("max_iterations must be > 0");
    }
    if config.simulations_per_iteration == 0 || config.final_simulations == 0 {
        return fail("simulation counts must be > 0");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::ExecutionMode;
    use crate::core::market::SimulationOverride;
    use crate::core::types::{Allocation, AssetClass, GoalCategory, Importance};
    use chrono::NaiveDate;

    fn assert_close(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    fn flat_assumptions() -> MarketAssumptions {
        MarketAssumptions::default()
            .with_overrides(&[
                SimulationOverride::ExpectedReturn {
                    asset: AssetClass::Cash,
                    value: 0.0,
                },
                SimulationOverride::Volatility {
                    asset: AssetClass::Cash,
                    value: 0.0,
                },
            ])
            .expect("valid overrides")
    }

    fn deterministic_goal() -> Goal {
        Goal {
            id: "car".to_string(),
            category: GoalCategory::Custom,
            title: "Car".to_string(),
            target_amount: 2_400.0,
            current_amount: 0.0,
            target_date: NaiveDate::from_ymd_opt(2027, 1, 1),
            importance: Importance::Medium,
            monthly_contribution: 0.0,
            asset_allocation: Allocation::from_pairs([(AssetClass::Cash, 1.0)]),
        }
    }

    fn settings() -> SimulationSettings {
        SimulationSettings {
            trials: 1,
            seed: 11,
            as_of: NaiveDate::from_ymd_opt(2025, 1, 1).expect("date"),
            projection_years: 2,
            mode: ExecutionMode::Sequential,
        }
    }

    fn config() -> ContributionSolveConfig {
        ContributionSolveConfig {
            target_success_threshold: 0.9,
            search_min: 0.0,
            search_max: Some(1_000.0),
            tolerance: 0.01,
            max_iterations: 40,
            simulations_per_iteration: 1,
            final_simulations: 1,
        }
    }

    #[test]
    fn required_contribution_solver_finds_deterministic_solution() {
        let result = solve_required_contribution(
            &deterministic_goal(),
            &FinancialProfile::new(60_000.0, 30_000.0),
            &flat_assumptions(),
            &settings(),
            config(),
        )
        .expect("solve should run");
        assert!(result.feasible);
        assert!(result.converged);
        let solved = result.solved_monthly_contribution.expect("solution");
        assert_close(solved, 100.0, 0.02);
        assert_eq!(result.achieved_success_rate, Some(1.0));
    }

    #[test]
    fn reports_infeasible_when_bounds_too_low() {
        let mut cfg = config();
        cfg.search_max = Some(50.0);
        let result = solve_required_contribution(
            &deterministic_goal(),
            &FinancialProfile::new(60_000.0, 30_000.0),
            &flat_assumptions(),
            &settings(),
            cfg,
        )
        .expect("solve should run");
        assert!(!result.feasible);
        assert!(result.solved_monthly_contribution.is_none());
    }

    #[test]
    fn already_funded_goal_needs_nothing() {
        let mut goal = deterministic_goal();
        goal.current_amount = 5_000.0;
        let result = solve_required_contribution(
            &goal,
            &FinancialProfile::new(60_000.0, 30_000.0),
            &flat_assumptions(),
            &settings(),
            config(),
        )
        .expect("solve should run");
        assert_eq!(result.solved_monthly_contribution, Some(0.0));
        assert!(result.iterations.is_empty());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut cfg = config();
        cfg.target_success_threshold = 1.5;
        let err = solve_required_contribution(
            &deterministic_goal(),
            &FinancialProfile::new(60_000.0, 30_000.0),
            &flat_assumptions(),
            &settings(),
            cfg,
        )
        .expect_err("threshold out of range");
        assert!(err.is_validation());
    }
}
