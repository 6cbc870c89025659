//! The goal engine context.
//!
//! [`GoalEngine`] is built once per process and owns the parameter provider,
//! the simulation cache, the configuration and the valuation date. Every
//! public analysis goes through it; nothing in the core reaches for a global.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::cache::{CacheSettings, CacheStats, FingerprintInput, JsonFileStore, SimulationCache};
use super::config::EngineConfig;
use super::engine::{ExecutionMode, SimulationResult, SimulationSettings, simulate};
use super::error::{GoalError, Result};
use super::gap::{GapAnalyzer, GapResult, OverallGapResult};
use super::market::{MarketAssumptions, SimulationOverride, apply_profile_overrides};
use super::params::ParameterProvider;
use super::probability::{ProbabilityAnalyzer, ProbabilityResult};
use super::remediation::{RemediationEngine, RemediationOption, StrategyContext, StrategyKind};
use super::scenario::{Scenario, ScenarioAdjustments, ScenarioComparison, ScenarioEngine};
use super::solver::{ContributionSolveConfig, ContributionSolveResult, solve_required_contribution};
use super::types::{FinancialProfile, Goal};

/// Per-call knobs of a probability analysis. Unset fields fall back to the
/// engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProbabilityOptions {
    pub simulations: Option<u32>,
    pub use_parallel: Option<bool>,
    pub cache_results: bool,
    pub overrides: Vec<SimulationOverride>,
}

impl Default for ProbabilityOptions {
    fn default() -> Self {
        Self {
            simulations: None,
            use_parallel: None,
            cache_results: true,
            overrides: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalProbabilityEntry {
    pub goal_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ProbabilityResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemediationPlan {
    /// Gap analysis with every feasible option attached, most feasible first.
    pub gap: GapResult,
    pub recommended: Option<RemediationOption>,
}

pub struct GoalEngine {
    provider: Arc<dyn ParameterProvider>,
    cache: Option<SimulationCache>,
    config: EngineConfig,
    as_of: NaiveDate,
    probability: ProbabilityAnalyzer,
    remediation: RemediationEngine,
}

impl GoalEngine {
    /// Validates `config`, applies provider overrides to its knobs and sets
    /// up the cache (with a JSON snapshot store when a path is configured).
    pub fn new(
        provider: Arc<dyn ParameterProvider>,
        mut config: EngineConfig,
        as_of: NaiveDate,
    ) -> Result<Self> {
        config.apply_parameter_overrides(provider.as_ref());
        config.validate()?;

        let cache = config.cache.enabled.then(|| {
            let cache = SimulationCache::new(CacheSettings::from(&config.cache));
            match &config.cache.persist_path {
                Some(path) => cache.with_store(Arc::new(JsonFileStore::new(path.clone()))),
                None => cache,
            }
        });
        info!(
            %as_of,
            cache_enabled = cache.is_some(),
            default_trials = config.simulation.default_trials,
            "goal engine ready"
        );

        Ok(Self {
            provider,
            cache,
            probability: ProbabilityAnalyzer::new(config.probability.clone()),
            remediation: RemediationEngine::from_config(&config.remediation),
            config,
            as_of,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn as_of(&self) -> NaiveDate {
        self.as_of
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(SimulationCache::stats)
    }

    /// Restores persisted simulation results. Returns the number restored.
    pub fn warm_cache(&self) -> Result<usize> {
        match &self.cache {
            Some(cache) => cache.warm_from_store(),
            None => Ok(0),
        }
    }

    /// Writes the cache to its store. Returns the number of entries written.
    pub fn flush_cache(&self) -> Result<usize> {
        match &self.cache {
            Some(cache) => cache.flush_now(),
            None => Ok(0),
        }
    }

    /// Provider values merged with the per-call overrides.
    pub fn market_assumptions(
        &self,
        overrides: &[SimulationOverride],
    ) -> Result<MarketAssumptions> {
        MarketAssumptions::from_provider(self.provider.as_ref()).with_overrides(overrides)
    }

    fn gap_analyzer(&self) -> Result<GapAnalyzer> {
        Ok(GapAnalyzer::new(
            self.config.gap.clone(),
            self.market_assumptions(&[])?,
            self.as_of,
        ))
    }

    fn scenario_engine(&self) -> Result<ScenarioEngine> {
        Ok(ScenarioEngine::new(
            self.config.scenario.clone(),
            self.gap_analyzer()?,
        ))
    }

    fn simulation_settings(&self, trials: u32, use_parallel: Option<bool>) -> SimulationSettings {
        let sim = &self.config.simulation;
        let parallel = use_parallel.unwrap_or(trials >= sim.parallel_threshold);
        SimulationSettings {
            trials,
            seed: sim.seed,
            as_of: self.as_of,
            projection_years: sim.projection_years,
            mode: if parallel {
                ExecutionMode::Parallel {
                    batch_size: sim.parallel_batch_size,
                }
            } else {
                ExecutionMode::Sequential
            },
        }
    }

    fn trial_count(&self, requested: Option<u32>) -> Result<u32> {
        let sim = &self.config.simulation;
        let trials = requested.unwrap_or(sim.default_trials);
        if trials == 0 {
            return Err(GoalError::validation("simulations must be > 0"));
        }
        if trials > sim.max_trials {
            return Err(GoalError::validation(format!(
                "simulations must be <= {}",
                sim.max_trials
            )));
        }
        Ok(trials)
    }

    /// Simulates `goal` and analyzes the outcome distribution.
    ///
    /// With `cache_results` the trial array is served from (or stored in) the
    /// simulation cache. A cache that cannot serve the request degrades to an
    /// uncached run.
    pub fn analyze_goal_probability(
        &self,
        goal: &Goal,
        profile: &FinancialProfile,
        options: &ProbabilityOptions,
    ) -> Result<ProbabilityResult> {
        goal.validate()?;
        profile.validate()?;
        let trials = self.trial_count(options.simulations)?;
        let profile = apply_profile_overrides(profile, &options.overrides);
        let assumptions = self.market_assumptions(&options.overrides)?;
        let settings = self.simulation_settings(trials, options.use_parallel);

        let run = || simulate(goal, &profile, &assumptions, &settings);
        let result = match (&self.cache, options.cache_results) {
            (Some(cache), true) => {
                self.cached_run(cache, goal, &profile, &assumptions, &settings, run)?
            }
            _ => Arc::new(run()?),
        };
        self.probability.analyze(&result, goal)
    }

    fn cached_run<F>(
        &self,
        cache: &SimulationCache,
        goal: &Goal,
        profile: &FinancialProfile,
        assumptions: &MarketAssumptions,
        settings: &SimulationSettings,
        run: F,
    ) -> Result<Arc<SimulationResult>>
    where
        F: Fn() -> Result<SimulationResult>,
    {
        let fingerprint = FingerprintInput::new(
            goal,
            profile,
            settings.trials,
            settings.seed,
            settings.as_of,
            settings.projection_years,
            assumptions,
        )
        .fingerprint();
        let fingerprint = match fingerprint {
            Ok(fp) => fp,
            Err(e) => {
                warn!(
                    goal_id = %goal.id,
                    error = %e,
                    "cannot fingerprint simulation, running uncached"
                );
                return run().map(Arc::new);
            }
        };

        match cache.get_or_compute(&fingerprint, &run) {
            Err(GoalError::Concurrency(msg)) => {
                warn!(
                    goal_id = %goal.id,
                    %fingerprint,
                    error = %msg,
                    "simulation cache unavailable, running uncached"
                );
                run().map(Arc::new)
            }
            other => other,
        }
    }

    /// Batch form of [`Self::analyze_goal_probability`]. A goal that fails is
    /// reported with its error; the others are still analyzed.
    pub fn analyze_goals_probability(
        &self,
        goals: &[Goal],
        profile: &FinancialProfile,
        options: &ProbabilityOptions,
    ) -> Vec<GoalProbabilityEntry> {
        goals
            .iter()
            .map(|goal| match self.analyze_goal_probability(goal, profile, options) {
                Ok(result) => GoalProbabilityEntry {
                    goal_id: goal.id.clone(),
                    result: Some(result),
                    error: None,
                },
                Err(e) => {
                    warn!(goal_id = %goal.id, error = %e, "probability analysis failed");
                    GoalProbabilityEntry {
                        goal_id: goal.id.clone(),
                        result: None,
                        error: Some(e.to_string()),
                    }
                }
            })
            .collect()
    }

    pub fn analyze_goal_gap(&self, goal: &Goal, profile: &FinancialProfile) -> Result<GapResult> {
        self.gap_analyzer()?.analyze_goal_gap(goal, profile)
    }

    pub fn analyze_overall_gap(
        &self,
        goals: &[Goal],
        profile: &FinancialProfile,
    ) -> Result<OverallGapResult> {
        self.gap_analyzer()?.analyze_overall_gap(goals, profile)
    }

    /// Evaluated options for `goal`, from one strategy or from all of them.
    /// `other_goals` are the user's remaining goals, used for reprioritizing.
    pub fn generate_options(
        &self,
        goal: &Goal,
        profile: &FinancialProfile,
        other_goals: &[Goal],
        strategy: Option<StrategyKind>,
    ) -> Result<Vec<RemediationOption>> {
        let assumptions = self.market_assumptions(&[])?;
        let gap = GapAnalyzer::new(self.config.gap.clone(), assumptions.clone(), self.as_of)
            .analyze_goal_gap(goal, profile)?;
        let ctx = StrategyContext {
            goal,
            profile,
            other_goals,
            assumptions: &assumptions,
            as_of: self.as_of,
        };
        match strategy {
            None => Ok(self.remediation.evaluate(&gap, &ctx)),
            Some(kind) => {
                let s = self.remediation.strategy(kind).ok_or_else(|| {
                    GoalError::NotFound(format!("remediation strategy '{}'", kind.as_str()))
                })?;
                Ok(s.evaluate_options(s.generate_options(&gap, &ctx), &gap, &ctx))
            }
        }
    }

    /// Gap analysis with remediation options attached and the most feasible
    /// one singled out.
    pub fn remediate_goal(
        &self,
        goal: &Goal,
        profile: &FinancialProfile,
        other_goals: &[Goal],
    ) -> Result<RemediationPlan> {
        let assumptions = self.market_assumptions(&[])?;
        let mut gap = GapAnalyzer::new(self.config.gap.clone(), assumptions.clone(), self.as_of)
            .analyze_goal_gap(goal, profile)?;
        let ctx = StrategyContext {
            goal,
            profile,
            other_goals,
            assumptions: &assumptions,
            as_of: self.as_of,
        };
        gap.remediation_options = self.remediation.evaluate(&gap, &ctx);
        let recommended = gap.remediation_options.first().cloned();
        debug!(
            goal_id = %goal.id,
            severity = %gap.severity,
            options = gap.remediation_options.len(),
            "goal remediated"
        );
        Ok(RemediationPlan { gap, recommended })
    }

    pub fn create_scenario(
        &self,
        name: &str,
        description: &str,
        goals: &[Goal],
        profile: &FinancialProfile,
        adjustments: &ScenarioAdjustments,
    ) -> Result<Scenario> {
        self.scenario_engine()?
            .create_scenario(name, description, goals, profile, adjustments)
    }

    pub fn compare_scenarios(&self, scenarios: &[Scenario]) -> Result<ScenarioComparison> {
        self.scenario_engine()?.compare_scenarios(scenarios)
    }

    /// Builds the standard bundles for `goals` and ranks them.
    pub fn compare_standard_scenarios(
        &self,
        goals: &[Goal],
        profile: &FinancialProfile,
    ) -> Result<ScenarioComparison> {
        let engine = self.scenario_engine()?;
        let scenarios = engine.standard_scenarios(goals, profile)?;
        engine.compare_scenarios(&scenarios)
    }

    /// Smallest monthly contribution reaching the configured success
    /// threshold. Never cached: each candidate is a distinct simulation.
    pub fn solve_required_contribution(
        &self,
        goal: &Goal,
        profile: &FinancialProfile,
        solve: ContributionSolveConfig,
        overrides: &[SimulationOverride],
    ) -> Result<ContributionSolveResult> {
        let profile = apply_profile_overrides(profile, overrides);
        let assumptions = self.market_assumptions(overrides)?;
        let trials = solve.simulations_per_iteration.max(solve.final_simulations);
        self.trial_count(Some(trials))?;
        let settings = self.simulation_settings(solve.simulations_per_iteration, None);
        solve_required_contribution(goal, &profile, &assumptions, &settings, solve)
    }
}
