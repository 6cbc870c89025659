mod cache;
mod config;
mod engine;
mod error;
mod gap;
mod market;
mod params;
mod planner;
mod probability;
mod remediation;
mod scenario;
mod solver;
mod types;

pub use cache::{
    CacheSettings, CacheStats, CacheStore, Fingerprint, FingerprintInput, JsonFileStore,
    PersistedEntry, SimulationCache,
};
pub use config::{
    AllocationConfig, CacheConfig, ContributionConfig, EngineConfig, GapConfig, PriorityConfig,
    ProbabilityConfig, RemediationConfig, ScenarioConfig, SimulationConfig, TargetConfig,
    TimeframeConfig,
};
pub use engine::{
    ExecutionMode, SimulationResult, SimulationSettings, simulate, simulate_cancellable,
};
pub use error::{GoalError, Result};
pub use gap::{
    GapAnalyzer, GapConflict, GapResult, GoalGapEntry, OverallAssessment, OverallGapResult,
    Severity, classify_severity,
};
pub use market::{AssetClassModel, MODEL_VERSION, MarketAssumptions, SimulationOverride};
pub use params::{ParameterProvider, StaticParameters};
pub use planner::{GoalEngine, GoalProbabilityEntry, ProbabilityOptions, RemediationPlan};
pub use probability::{
    DistributionMetrics, GoalOutcomeDistribution, ProbabilityAnalyzer, ProbabilityResult,
    SuccessMetrics, TimeBasedMetrics,
};
pub use remediation::{
    Adjustment, RemediationEngine, RemediationOption, RemediationStrategy, StrategyContext,
    StrategyKind, Variant,
};
pub use scenario::{
    AllocationOverride, GoalOverride, ProfileOverride, Scenario, ScenarioAdjustments,
    ScenarioComparison, ScenarioEngine, ScenarioResult, TimelineShift,
};
pub use solver::{ContributionSolveConfig, ContributionSolveResult, SolveIteration};
pub use types::{
    Allocation, AssetClass, FinancialProfile, Goal, GoalCategory, Importance, RiskTolerance,
    resolve_profile_defaults,
};
