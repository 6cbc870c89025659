use axum::{
    Router,
    extract::{Json, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::core::{
    CacheStats, ContributionSolveConfig, ContributionSolveResult, EngineConfig, FinancialProfile,
    GapResult, Goal, GoalEngine, GoalError, GoalProbabilityEntry, OverallGapResult,
    ProbabilityOptions, ProbabilityResult, RemediationPlan, ScenarioAdjustments,
    ScenarioComparison, SimulationOverride, StaticParameters, StrategyKind,
};

#[derive(Debug, Parser)]
#[command(name = "goalpath", about = "Goal probability, gap and scenario analysis")]
pub struct Cli {
    /// Engine configuration JSON; unset sections keep their defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Parameter JSON merged over the built-in asset-class table.
    #[arg(long, global = true)]
    parameters: Option<PathBuf>,

    /// Valuation date (YYYY-MM-DD); defaults to today.
    #[arg(long, global = true)]
    as_of: Option<NaiveDate>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the JSON HTTP API.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Analyze a profile and its goals from a JSON file and print the report.
    Analyze {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        pretty: bool,
    },
}

pub async fn run(cli: Cli) -> Result<(), String> {
    let engine = Arc::new(build_engine(&cli).map_err(|e| e.to_string())?);
    match cli.command {
        Command::Serve { port } => {
            match engine.warm_cache() {
                Ok(0) => {}
                Ok(restored) => info!(restored, "simulation cache warmed"),
                Err(e) => warn!(error = %e, "could not warm simulation cache"),
            }
            run_http_server(Arc::clone(&engine), port)
                .await
                .map_err(|e| format!("server error: {e}"))?;
            if let Err(e) = engine.flush_cache() {
                warn!(error = %e, "final cache flush failed");
            }
            Ok(())
        }
        Command::Analyze { input, pretty } => {
            let raw = fs::read_to_string(&input)
                .map_err(|e| format!("cannot read {}: {e}", input.display()))?;
            let request: AnalyzeRequest =
                serde_json::from_str(&raw).map_err(|e| format!("invalid input JSON: {e}"))?;
            let report = tokio::task::spawn_blocking(move || analyze_portfolio(&engine, &request))
                .await
                .map_err(|e| format!("analysis task failed: {e}"))?
                .map_err(|e| e.to_string())?;
            let out = if pretty {
                serde_json::to_string_pretty(&report)
            } else {
                serde_json::to_string(&report)
            }
            .map_err(|e| format!("cannot encode report: {e}"))?;
            println!("{out}");
            Ok(())
        }
    }
}

fn build_engine(cli: &Cli) -> crate::core::Result<GoalEngine> {
    let config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    let mut params = StaticParameters::with_defaults();
    if let Some(path) = &cli.parameters {
        params = params.merged_with(StaticParameters::from_json_file(path)?);
    }
    let as_of = cli.as_of.unwrap_or_else(|| Local::now().date_naive());
    GoalEngine::new(Arc::new(params), config, as_of)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeRequest {
    profile: FinancialProfile,
    goals: Vec<Goal>,
    #[serde(default)]
    options: ProbabilityOptions,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeReport {
    as_of: NaiveDate,
    probabilities: Vec<GoalProbabilityEntry>,
    gaps: OverallGapResult,
    remediation: Vec<GoalRemediationEntry>,
    scenarios: Option<ScenarioComparison>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GoalRemediationEntry {
    goal_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    plan: Option<RemediationPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Full report for one profile: probabilities, gaps, remediation for every
/// goal with a gap, and the standard scenario comparison.
fn analyze_portfolio(
    engine: &GoalEngine,
    request: &AnalyzeRequest,
) -> crate::core::Result<AnalyzeReport> {
    let probabilities =
        engine.analyze_goals_probability(&request.goals, &request.profile, &request.options);
    let gaps = engine.analyze_overall_gap(&request.goals, &request.profile)?;

    let remediation = gaps
        .results()
        .filter(|gap| gap.has_gap())
        .filter_map(|gap| request.goals.iter().find(|g| g.id == gap.goal_id))
        .map(|goal| {
            let others: Vec<Goal> = request
                .goals
                .iter()
                .filter(|g| g.id != goal.id)
                .cloned()
                .collect();
            match engine.remediate_goal(goal, &request.profile, &others) {
                Ok(plan) => GoalRemediationEntry {
                    goal_id: goal.id.clone(),
                    plan: Some(plan),
                    error: None,
                },
                Err(e) => GoalRemediationEntry {
                    goal_id: goal.id.clone(),
                    plan: None,
                    error: Some(e.to_string()),
                },
            }
        })
        .collect();

    let scenarios = if request.goals.is_empty() {
        None
    } else {
        match engine.compare_standard_scenarios(&request.goals, &request.profile) {
            Ok(comparison) => Some(comparison),
            Err(e) => {
                warn!(error = %e, "scenario comparison skipped");
                None
            }
        }
    };

    Ok(AnalyzeReport {
        as_of: engine.as_of(),
        probabilities,
        gaps,
        remediation,
        scenarios,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProbabilityPayload {
    goal: Goal,
    profile: FinancialProfile,
    #[serde(default)]
    options: ProbabilityOptions,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchProbabilityPayload {
    goals: Vec<Goal>,
    profile: FinancialProfile,
    #[serde(default)]
    options: ProbabilityOptions,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GapPayload {
    goal: Goal,
    profile: FinancialProfile,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GapsPayload {
    goals: Vec<Goal>,
    profile: FinancialProfile,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemediationPayload {
    goal: Goal,
    profile: FinancialProfile,
    #[serde(default)]
    other_goals: Vec<Goal>,
    #[serde(default)]
    strategy: Option<StrategyKind>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScenarioDraft {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    adjustments: ScenarioAdjustments,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScenariosPayload {
    goals: Vec<Goal>,
    profile: FinancialProfile,
    /// Custom bundles; the standard ones are compared when empty.
    #[serde(default)]
    scenarios: Vec<ScenarioDraft>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequiredContributionPayload {
    goal: Goal,
    profile: FinancialProfile,
    #[serde(default)]
    solve: ContributionSolveConfig,
    #[serde(default)]
    overrides: Vec<SimulationOverride>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    as_of: NaiveDate,
    cache: Option<CacheStats>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

type EngineState = State<Arc<GoalEngine>>;

pub fn router(engine: Arc<GoalEngine>) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/probability", post(probability_handler))
        .route("/api/probability/batch", post(batch_probability_handler))
        .route("/api/gap", post(gap_handler))
        .route("/api/gaps", post(gaps_handler))
        .route("/api/remediation", post(remediation_handler))
        .route("/api/scenarios", post(scenarios_handler))
        .route("/api/required-contribution", post(required_contribution_handler))
        .fallback(not_found_handler)
        .with_state(engine)
}

pub async fn run_http_server(engine: Arc<GoalEngine>, port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router(engine);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "goalpath HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn health_handler(State(engine): EngineState) -> Response {
    json_response(
        StatusCode::OK,
        HealthResponse {
            status: "ok",
            as_of: engine.as_of(),
            cache: engine.cache_stats(),
        },
    )
}

async fn probability_handler(
    State(engine): EngineState,
    Json(payload): Json<ProbabilityPayload>,
) -> Response {
    run_blocking(move || -> crate::core::Result<ProbabilityResult> {
        engine.analyze_goal_probability(&payload.goal, &payload.profile, &payload.options)
    })
    .await
}

async fn batch_probability_handler(
    State(engine): EngineState,
    Json(payload): Json<BatchProbabilityPayload>,
) -> Response {
    run_blocking(move || {
        payload.profile.validate()?;
        Ok(engine.analyze_goals_probability(&payload.goals, &payload.profile, &payload.options))
    })
    .await
}

async fn gap_handler(State(engine): EngineState, Json(payload): Json<GapPayload>) -> Response {
    run_blocking(move || -> crate::core::Result<GapResult> {
        engine.analyze_goal_gap(&payload.goal, &payload.profile)
    })
    .await
}

async fn gaps_handler(State(engine): EngineState, Json(payload): Json<GapsPayload>) -> Response {
    run_blocking(move || engine.analyze_overall_gap(&payload.goals, &payload.profile)).await
}

async fn remediation_handler(
    State(engine): EngineState,
    Json(payload): Json<RemediationPayload>,
) -> Response {
    run_blocking(move || -> crate::core::Result<RemediationPlan> {
        let RemediationPayload {
            goal,
            profile,
            other_goals,
            strategy,
        } = payload;
        match strategy {
            None => engine.remediate_goal(&goal, &profile, &other_goals),
            Some(kind) => {
                let mut gap = engine.analyze_goal_gap(&goal, &profile)?;
                gap.remediation_options =
                    engine.generate_options(&goal, &profile, &other_goals, Some(kind))?;
                let recommended = gap.remediation_options.first().cloned();
                Ok(RemediationPlan { gap, recommended })
            }
        }
    })
    .await
}

async fn scenarios_handler(
    State(engine): EngineState,
    Json(payload): Json<ScenariosPayload>,
) -> Response {
    run_blocking(move || -> crate::core::Result<ScenarioComparison> {
        if payload.scenarios.is_empty() {
            return engine.compare_standard_scenarios(&payload.goals, &payload.profile);
        }
        let scenarios = payload
            .scenarios
            .iter()
            .map(|draft| {
                engine.create_scenario(
                    &draft.name,
                    &draft.description,
                    &payload.goals,
                    &payload.profile,
                    &draft.adjustments,
                )
            })
            .collect::<crate::core::Result<Vec<_>>>()?;
        engine.compare_scenarios(&scenarios)
    })
    .await
}

async fn required_contribution_handler(
    State(engine): EngineState,
    Json(payload): Json<RequiredContributionPayload>,
) -> Response {
    run_blocking(move || -> crate::core::Result<ContributionSolveResult> {
        engine.solve_required_contribution(
            &payload.goal,
            &payload.profile,
            payload.solve,
            &payload.overrides,
        )
    })
    .await
}

/// Runs CPU-bound engine work off the async runtime.
async fn run_blocking<T, F>(work: F) -> Response
where
    F: FnOnce() -> crate::core::Result<T> + Send + 'static,
    T: Serialize + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(Ok(body)) => json_response(StatusCode::OK, body),
        Ok(Err(e)) => goal_error_response(&e),
        Err(e) => {
            error!(error = %e, "engine task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "analysis task failed")
        }
    }
}

fn status_for(err: &GoalError) -> StatusCode {
    match err {
        GoalError::Validation(_) => StatusCode::BAD_REQUEST,
        GoalError::NotFound(_) => StatusCode::NOT_FOUND,
        GoalError::Concurrency(_) => StatusCode::SERVICE_UNAVAILABLE,
        GoalError::Computation(_) | GoalError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn goal_error_response(err: &GoalError) -> Response {
    let status = status_for(err);
    if status.is_server_error() {
        error!(error = %err, "request failed");
    }
    error_response(status, &err.to_string())
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, header::HeaderValue::from_static("no-store"));
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde_json::{Value, json};

    fn engine() -> Arc<GoalEngine> {
        Arc::new(
            GoalEngine::new(
                Arc::new(StaticParameters::with_defaults()),
                EngineConfig::default(),
                NaiveDate::from_ymd_opt(2025, 1, 1).expect("valid date"),
            )
            .expect("engine"),
        )
    }

    fn goal_json(id: &str, monthly: f64) -> Value {
        json!({
            "id": id,
            "category": "education",
            "title": "College",
            "targetAmount": 1500000,
            "currentAmount": 300000,
            "targetDate": "2033-06-01",
            "importance": "high",
            "monthlyContribution": monthly,
            "assetAllocation": {"equity": 0.6, "debt": 0.3, "gold": 0.1}
        })
    }

    fn profile_json() -> Value {
        json!({"annualIncome": 1800000, "annualExpenses": 1000000, "riskTolerance": "moderate"})
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    fn payload<T: serde::de::DeserializeOwned>(value: Value) -> Json<T> {
        Json(serde_json::from_value(value).expect("valid payload"))
    }

    #[test]
    fn errors_map_to_http_statuses() {
        assert_eq!(
            status_for(&GoalError::validation("bad")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&GoalError::NotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&GoalError::Concurrency("timeout".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&GoalError::computation("nan")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "goalpath",
            "analyze",
            "--input",
            "plan.json",
            "--as-of",
            "2025-03-01",
            "--parameters",
            "params.json",
        ])
        .expect("valid args");
        assert_eq!(cli.as_of, NaiveDate::from_ymd_opt(2025, 3, 1));
        assert_eq!(cli.parameters, Some(PathBuf::from("params.json")));
        assert!(matches!(cli.command, Command::Analyze { pretty: false, .. }));

        let cli = Cli::try_parse_from(["goalpath", "serve"]).expect("defaults");
        assert!(matches!(cli.command, Command::Serve { port: 8080 }));
    }

    #[tokio::test]
    async fn probability_endpoint_returns_metrics() {
        let response = probability_handler(
            State(engine()),
            payload(json!({
                "goal": goal_json("edu", 8000.0),
                "profile": profile_json(),
                "options": {"simulations": 300}
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).map(|v| v.as_bytes()),
            Some(&b"no-store"[..])
        );
        let body = body_json(response).await;
        assert_eq!(body["goalId"], "edu");
        assert_eq!(body["trials"], 300);
        let p = body["successMetrics"]["successProbability"]
            .as_f64()
            .expect("probability");
        assert!((0.0..=1.0).contains(&p));
        assert!(body["distribution"]["percentiles"]["p50"].is_number());
    }

    #[tokio::test]
    async fn invalid_goal_is_a_bad_request() {
        let mut goal = goal_json("edu", 8000.0);
        goal["targetAmount"] = json!(0);
        let response = gap_handler(
            State(engine()),
            payload(json!({"goal": goal, "profile": profile_json()})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(
            body["error"]
                .as_str()
                .is_some_and(|e| e.starts_with("validation error"))
        );
    }

    #[tokio::test]
    async fn gaps_endpoint_keeps_sibling_results() {
        let mut broken = goal_json("broken", 100.0);
        broken["currentAmount"] = json!(-5);
        let response = gaps_handler(
            State(engine()),
            payload(json!({
                "goals": [goal_json("edu", 2000.0), broken],
                "profile": profile_json()
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["analyzedGoals"], 1);
        assert_eq!(body["failedGoals"], 1);
    }

    #[tokio::test]
    async fn remediation_endpoint_filters_by_strategy() {
        let response = remediation_handler(
            State(engine()),
            payload(json!({
                "goal": goal_json("edu", 500.0),
                "profile": profile_json(),
                "strategy": "target"
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let options = body["gap"]["remediationOptions"]
            .as_array()
            .expect("options");
        assert!(!options.is_empty());
        assert!(options.iter().all(|o| o["strategy"] == "target"));
        assert_eq!(body["recommended"], options[0]);
    }

    #[tokio::test]
    async fn scenarios_endpoint_rejects_unknown_goal_ids() {
        let response = scenarios_handler(
            State(engine()),
            payload(json!({
                "goals": [goal_json("edu", 2000.0)],
                "profile": profile_json(),
                "scenarios": [{
                    "name": "later",
                    "adjustments": {"timelineShifts": [{"goalId": "nope", "months": 12}]}
                }]
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn scenarios_endpoint_defaults_to_standard_bundles() {
        let response = scenarios_handler(
            State(engine()),
            payload(json!({
                "goals": [goal_json("edu", 2000.0)],
                "profile": profile_json()
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["ranking"].as_array().map(Vec::len), Some(5));
        assert!(body["optimalScenario"].is_string());
    }

    #[tokio::test]
    async fn health_reports_valuation_date() {
        let body = body_json(health_handler(State(engine())).await).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["asOf"], "2025-01-01");
    }

    #[test]
    fn analyze_report_covers_every_goal() {
        let request: AnalyzeRequest = serde_json::from_value(json!({
            "profile": profile_json(),
            "goals": [goal_json("edu", 500.0), goal_json("home", 20000.0)],
            "options": {"simulations": 200}
        }))
        .expect("valid request");
        let report = analyze_portfolio(&engine(), &request).expect("report");
        assert_eq!(report.probabilities.len(), 2);
        assert_eq!(report.gaps.analyzed_goals, 2);
        assert!(report.remediation.iter().any(|r| r.goal_id == "edu"));
        assert!(report.scenarios.is_some());
    }
}
