use std::sync::atomic::{AtomicBool, Ordering};

use chrono::NaiveDate;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::{GoalError, Result};
use super::market::{MarketAssumptions, correlation_factor};
use super::types::{FinancialProfile, Goal, resolve_profile_defaults};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExecutionMode {
    Sequential,
    Parallel { batch_size: usize },
}

#[derive(Debug, Clone)]
pub struct SimulationSettings {
    pub trials: u32,
    pub seed: u64,
    pub as_of: NaiveDate,
    pub projection_years: u32,
    pub mode: ExecutionMode,
}

/// Trial outcomes of one simulation run. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub horizon_months: u32,
    /// Value at the goal's horizon, indexed by trial.
    pub values: Vec<f64>,
    /// `yearly_values[y][trial]`: value after `y` whole years.
    pub yearly_values: Vec<Vec<f64>>,
}

impl SimulationResult {
    pub fn trials(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Last year with a recorded checkpoint.
    pub fn checkpoint_years(&self) -> u32 {
        self.yearly_values.len().saturating_sub(1) as u32
    }

    /// Values after `year` years; years past the simulated range clamp to
    /// the last checkpoint.
    pub fn checkpoint(&self, year: u32) -> Option<&[f64]> {
        if self.yearly_values.is_empty() {
            return None;
        }
        let idx = (year as usize).min(self.yearly_values.len() - 1);
        Some(&self.yearly_values[idx])
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }
}

/// Validated, precomputed inputs shared by every trial of a run.
#[derive(Debug, Clone)]
struct TrialPlan {
    weights: Vec<f64>,
    monthly_drift: Vec<f64>,
    monthly_vol: Vec<f64>,
    factor: Vec<Vec<f64>>,
    initial: f64,
    monthly_contribution: f64,
    contribution_growth: f64,
    tax_drag: f64,
    inflation: f64,
    horizon_months: u32,
    total_months: u32,
}

impl TrialPlan {
    fn new(
        goal: &Goal,
        profile: &FinancialProfile,
        assumptions: &MarketAssumptions,
        settings: &SimulationSettings,
    ) -> Result<Self> {
        goal.validate()?;
        profile.validate()?;
        let resolved = resolve_profile_defaults(profile);
        let allocation = goal.effective_allocation(resolved.risk_tolerance)?;

        let assets = allocation.asset_classes();
        let weights: Vec<f64> = assets.iter().map(|a| allocation.weight(*a)).collect();
        let mut monthly_drift = Vec::with_capacity(assets.len());
        let mut monthly_vol = Vec::with_capacity(assets.len());
        for asset in &assets {
            let model = assumptions.model(*asset);
            if model.expected_return <= -1.0 {
                return Err(GoalError::validation(format!(
                    "expected return for {} must be > -100%",
                    asset.as_str()
                )));
            }
            let sigma = model.volatility.max(0.0);
            // lognormal calibrated so the mean annual gross return is 1 + mu
            monthly_drift.push(((1.0 + model.expected_return).ln() - 0.5 * sigma * sigma) / 12.0);
            monthly_vol.push(sigma / 12f64.sqrt());
        }
        let factor = correlation_factor(&assumptions.correlation_matrix(&assets));

        let horizon_months = goal.horizon_months(settings.as_of);
        let total_months = horizon_months.max(settings.projection_years.saturating_mul(12));

        Ok(Self {
            weights,
            monthly_drift,
            monthly_vol,
            factor,
            initial: goal.current_amount,
            monthly_contribution: goal.monthly_contribution,
            contribution_growth: assumptions.contribution_growth,
            tax_drag: assumptions.tax_drag.clamp(0.0, 1.0),
            inflation: assumptions.inflation,
            horizon_months,
            total_months,
        })
    }

    fn checkpoint_count(&self) -> usize {
        (self.total_months / 12) as usize + 1
    }

    fn deflate(&self, value: f64, month: u32) -> f64 {
        if self.inflation == 0.0 {
            return value;
        }
        value / (1.0 + self.inflation).powf(month as f64 / 12.0)
    }
}

#[derive(Debug)]
struct TrialOutcome {
    terminal: f64,
    yearly: Vec<f64>,
}

/// Runs `settings.trials` trajectories for `goal`.
///
/// Every trial draws from its own RNG stream seeded by the trial index, so
/// the returned arrays are identical for sequential and parallel execution
/// and for any batch size.
pub fn simulate(
    goal: &Goal,
    profile: &FinancialProfile,
    assumptions: &MarketAssumptions,
    settings: &SimulationSettings,
) -> Result<SimulationResult> {
    simulate_cancellable(goal, profile, assumptions, settings, None)
}

/// As [`simulate`], checking `cancel` between batches. A cancelled run
/// returns an error and never a partial array.
pub fn simulate_cancellable(
    goal: &Goal,
    profile: &FinancialProfile,
    assumptions: &MarketAssumptions,
    settings: &SimulationSettings,
    cancel: Option<&AtomicBool>,
) -> Result<SimulationResult> {
    if settings.trials == 0 {
        return Err(GoalError::validation("trial count must be > 0"));
    }
    let plan = TrialPlan::new(goal, profile, assumptions, settings)?;
    debug!(
        goal_id = %goal.id,
        trials = settings.trials,
        horizon_months = plan.horizon_months,
        total_months = plan.total_months,
        mode = ?settings.mode,
        "running simulation"
    );

    let is_cancelled = || cancel.is_some_and(|flag| flag.load(Ordering::Relaxed));
    let cancelled = || GoalError::computation("simulation cancelled before completion");

    let trial_ids: Vec<u32> = (0..settings.trials).collect();
    let outcomes: Vec<TrialOutcome> = match settings.mode {
        ExecutionMode::Sequential => {
            let mut outcomes = Vec::with_capacity(trial_ids.len());
            for chunk in trial_ids.chunks(1_024) {
                if is_cancelled() {
                    return Err(cancelled());
                }
                outcomes.extend(
                    chunk
                        .iter()
                        .map(|&id| run_trial(&plan, derive_seed(settings.seed, id))),
                );
            }
            outcomes
        }
        ExecutionMode::Parallel { batch_size } => {
            let batches: Vec<Vec<TrialOutcome>> = trial_ids
                .par_chunks(batch_size.max(1))
                .map(|chunk| {
                    if is_cancelled() {
                        return Err(cancelled());
                    }
                    Ok(chunk
                        .iter()
                        .map(|&id| run_trial(&plan, derive_seed(settings.seed, id)))
                        .collect())
                })
                .collect::<Result<_>>()?;
            batches.into_iter().flatten().collect()
        }
    };
    if is_cancelled() {
        return Err(cancelled());
    }

    assemble_result(&plan, outcomes)
}

fn assemble_result(plan: &TrialPlan, outcomes: Vec<TrialOutcome>) -> Result<SimulationResult> {
    if outcomes.is_empty() {
        return Err(GoalError::computation("simulation produced no trials"));
    }
    let checkpoints = plan.checkpoint_count();
    let mut values = Vec::with_capacity(outcomes.len());
    let mut yearly_values = vec![Vec::with_capacity(outcomes.len()); checkpoints];
    for (trial, outcome) in outcomes.into_iter().enumerate() {
        if !outcome.terminal.is_finite() {
            return Err(GoalError::computation(format!(
                "trial {trial} produced a non-finite value"
            )));
        }
        values.push(outcome.terminal);
        for (year, value) in outcome.yearly.into_iter().enumerate() {
            yearly_values[year].push(value);
        }
    }
    Ok(SimulationResult {
        horizon_months: plan.horizon_months,
        values,
        yearly_values,
    })
}

fn run_trial(plan: &TrialPlan, seed: u64) -> TrialOutcome {
    let mut rng = StdRng::seed_from_u64(seed);
    let k = plan.weights.len();
    let mut shocks = vec![0.0; k];

    let mut value = plan.initial;
    let mut contribution = plan.monthly_contribution;
    let mut terminal = if plan.horizon_months == 0 { value } else { f64::NAN };
    let mut yearly = vec![0.0; plan.checkpoint_count()];
    yearly[0] = value;

    for month in 1..=plan.total_months {
        for z in shocks.iter_mut() {
            *z = StandardNormal.sample(&mut rng);
        }
        let mut portfolio_return = 0.0;
        for i in 0..k {
            let correlated: f64 = (0..=i).map(|j| plan.factor[i][j] * shocks[j]).sum();
            let asset_return =
                (plan.monthly_drift[i] + plan.monthly_vol[i] * correlated).exp() - 1.0;
            portfolio_return += plan.weights[i] * asset_return;
        }
        if portfolio_return > 0.0 {
            portfolio_return *= 1.0 - plan.tax_drag;
        }

        value = (value * (1.0 + portfolio_return)).max(0.0) + contribution;

        if month == plan.horizon_months {
            terminal = plan.deflate(value, month);
        }
        if month % 12 == 0 {
            yearly[(month / 12) as usize] = plan.deflate(value, month);
            contribution *= 1.0 + plan.contribution_growth;
        }
    }

    TrialOutcome { terminal, yearly }
}

fn derive_seed(base_seed: u64, trial: u32) -> u64 {
    splitmix64(base_seed ^ ((trial as u64) << 20 | trial as u64))
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::market::SimulationOverride;
    use crate::core::types::{Allocation, AssetClass, GoalCategory, Importance};
    use proptest::prelude::{prop_assert, prop_assert_eq, proptest};
    use std::collections::BTreeMap;

    fn assert_approx_tol(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    fn as_of() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 1).expect("valid date")
    }

    fn sample_goal() -> Goal {
        Goal {
            id: "home".to_string(),
            category: GoalCategory::Home,
            title: "Home down payment".to_string(),
            target_amount: 2_000_000.0,
            current_amount: 500_000.0,
            target_date: NaiveDate::from_ymd_opt(2030, 1, 1),
            importance: Importance::High,
            monthly_contribution: 20_000.0,
            asset_allocation: Allocation::from_pairs([
                (AssetClass::Equity, 0.5),
                (AssetClass::Debt, 0.3),
                (AssetClass::Gold, 0.1),
                (AssetClass::Cash, 0.1),
            ]),
        }
    }

    fn sample_profile() -> FinancialProfile {
        FinancialProfile {
            id: "p1".to_string(),
            annual_income: 1_800_000.0,
            annual_expenses: 1_000_000.0,
            age: Some(32),
            risk_tolerance: None,
            country: None,
            assets: BTreeMap::new(),
            answers: Vec::new(),
        }
    }

    fn settings(trials: u32, mode: ExecutionMode) -> SimulationSettings {
        SimulationSettings {
            trials,
            seed: 7,
            as_of: as_of(),
            projection_years: 10,
            mode,
        }
    }

    fn zero_vol_assumptions(expected_return: f64) -> MarketAssumptions {
        let overrides: Vec<SimulationOverride> = AssetClass::ALL
            .iter()
            .flat_map(|&asset| {
                [
                    SimulationOverride::ExpectedReturn {
                        asset,
                        value: expected_return,
                    },
                    SimulationOverride::Volatility { asset, value: 0.0 },
                ]
            })
            .collect();
        MarketAssumptions::default()
            .with_overrides(&overrides)
            .expect("valid overrides")
    }

    #[test]
    fn parallel_and_sequential_runs_are_bit_identical() {
        let goal = sample_goal();
        let profile = sample_profile();
        let assumptions = MarketAssumptions::default();
        let seq = simulate(
            &goal,
            &profile,
            &assumptions,
            &settings(300, ExecutionMode::Sequential),
        )
        .expect("sequential run");
        for batch_size in [1, 7, 64, 1_000] {
            let par = simulate(
                &goal,
                &profile,
                &assumptions,
                &settings(300, ExecutionMode::Parallel { batch_size }),
            )
            .expect("parallel run");
            assert_eq!(seq, par, "batch size {batch_size} changed the output");
        }
    }

    #[test]
    fn zero_volatility_compounds_deterministically() {
        let mut goal = sample_goal();
        goal.current_amount = 1_000.0;
        goal.monthly_contribution = 0.0;
        goal.target_date = NaiveDate::from_ymd_opt(2026, 1, 1);
        let result = simulate(
            &goal,
            &sample_profile(),
            &zero_vol_assumptions(0.10),
            &settings(5, ExecutionMode::Sequential),
        )
        .expect("run");
        assert_eq!(result.horizon_months, 12);
        for v in result.values() {
            assert_approx_tol(*v, 1_100.0, 1e-6);
        }
        let year_two = result.checkpoint(2).expect("checkpoint");
        assert_approx_tol(year_two[0], 1_210.0, 1e-6);
    }

    #[test]
    fn contributions_accumulate_without_growth() {
        let mut goal = sample_goal();
        goal.current_amount = 0.0;
        goal.monthly_contribution = 100.0;
        goal.target_date = NaiveDate::from_ymd_opt(2027, 1, 1);
        let result = simulate(
            &goal,
            &sample_profile(),
            &zero_vol_assumptions(0.0),
            &settings(3, ExecutionMode::Sequential),
        )
        .expect("run");
        assert_approx_tol(result.values()[0], 2_400.0, 1e-9);
        assert_approx_tol(result.checkpoint(1).expect("year one")[0], 1_200.0, 1e-9);
    }

    #[test]
    fn contribution_growth_and_inflation_are_applied() {
        let mut goal = sample_goal();
        goal.current_amount = 0.0;
        goal.monthly_contribution = 100.0;
        goal.target_date = NaiveDate::from_ymd_opt(2027, 1, 1);
        let assumptions = zero_vol_assumptions(0.0)
            .with_overrides(&[SimulationOverride::ContributionGrowth { rate: 0.5 }])
            .expect("valid");
        let result = simulate(
            &goal,
            &sample_profile(),
            &assumptions,
            &settings(1, ExecutionMode::Sequential),
        )
        .expect("run");
        // 12 x 100 in year one, 12 x 150 in year two
        assert_approx_tol(result.values()[0], 3_000.0, 1e-9);

        let inflated = assumptions
            .with_overrides(&[SimulationOverride::Inflation { rate: 0.25 }])
            .expect("valid");
        let result = simulate(
            &goal,
            &sample_profile(),
            &inflated,
            &settings(1, ExecutionMode::Sequential),
        )
        .expect("run");
        assert_approx_tol(result.values()[0], 3_000.0 / 1.5625, 1e-9);
    }

    #[test]
    fn goal_without_date_reports_current_amount() {
        let mut goal = sample_goal();
        goal.target_date = None;
        let result = simulate(
            &goal,
            &sample_profile(),
            &MarketAssumptions::default(),
            &settings(10, ExecutionMode::Sequential),
        )
        .expect("run");
        assert_eq!(result.horizon_months, 0);
        assert!(result.values().iter().all(|v| *v == goal.current_amount));
        assert_eq!(result.checkpoint_years(), 10);
    }

    #[test]
    fn rejects_unnormalizable_allocation_and_zero_trials() {
        let mut goal = sample_goal();
        goal.asset_allocation =
            Allocation::from_pairs([(AssetClass::Equity, 0.7), (AssetClass::Debt, 0.7)]);
        let err = simulate(
            &goal,
            &sample_profile(),
            &MarketAssumptions::default(),
            &settings(10, ExecutionMode::Sequential),
        )
        .expect_err("must reject");
        assert!(err.is_validation());

        let err = simulate(
            &sample_goal(),
            &sample_profile(),
            &MarketAssumptions::default(),
            &settings(0, ExecutionMode::Sequential),
        )
        .expect_err("must reject zero trials");
        assert!(err.is_validation());
    }

    #[test]
    fn cancelled_runs_never_return_partial_arrays() {
        let flag = AtomicBool::new(true);
        let err = simulate_cancellable(
            &sample_goal(),
            &sample_profile(),
            &MarketAssumptions::default(),
            &settings(500, ExecutionMode::Parallel { batch_size: 16 }),
            Some(&flag),
        )
        .expect_err("cancelled");
        assert!(matches!(err, GoalError::Computation(_)));
    }

    #[test]
    fn empty_allocation_uses_risk_default() {
        let mut goal = sample_goal();
        goal.asset_allocation = Allocation::new();
        let result = simulate(
            &goal,
            &sample_profile(),
            &MarketAssumptions::default(),
            &settings(20, ExecutionMode::Sequential),
        )
        .expect("default allocation applies");
        assert_eq!(result.trials(), 20);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(16))]

        #[test]
        fn prop_outputs_are_finite_non_negative_and_partition_invariant(
            seed in 0u64..10_000,
            trials in 1u32..40,
            batch_size in 1usize..17,
            current in 0u32..1_000_000,
            contribution in 0u32..50_000,
            horizon_years in 0i32..12,
        ) {
            let mut goal = sample_goal();
            goal.current_amount = current as f64;
            goal.monthly_contribution = contribution as f64;
            goal.target_date = NaiveDate::from_ymd_opt(2025 + horizon_years, 1, 1);
            let mut s = settings(trials, ExecutionMode::Sequential);
            s.seed = seed;
            s.projection_years = 3;
            let assumptions = MarketAssumptions::default();
            let seq = simulate(&goal, &sample_profile(), &assumptions, &s).expect("seq");
            s.mode = ExecutionMode::Parallel { batch_size };
            let par = simulate(&goal, &sample_profile(), &assumptions, &s).expect("par");
            prop_assert_eq!(&seq, &par);
            prop_assert!(seq.values().iter().all(|v| v.is_finite() && *v >= 0.0));
            prop_assert_eq!(seq.trials(), trials as usize);
        }
    }
}
