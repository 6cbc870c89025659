//! Read-only parameter lookup.
//!
//! Every tunable constant the engine reads (asset returns, volatilities,
//! correlations, strategy thresholds) goes through a [`ParameterProvider`].
//! Paths are dot-separated, e.g. `asset_returns.equity.expected_return`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde_json::Value;
use tracing::warn;

use super::error::{GoalError, Result};
use super::types::AssetClass;

pub trait ParameterProvider: Send + Sync {
    /// Raw lookup; `None` when the path is unknown.
    fn lookup(&self, path: &str) -> Option<f64>;

    fn get_parameters_by_prefix(&self, prefix: &str) -> BTreeMap<String, f64>;

    /// Lookup with a documented default. Missing or non-finite values fall
    /// back to `default` and are logged.
    fn get(&self, path: &str, default: f64) -> f64 {
        match self.lookup(path) {
            Some(value) if value.is_finite() => value,
            Some(value) => {
                warn!(path, value, default, "non-finite parameter value, using default");
                default
            }
            None => {
                warn!(path, default, "parameter not found, using default");
                default
            }
        }
    }

    /// Lookup for optional tuning knobs: silent fallback.
    fn get_or(&self, path: &str, default: f64) -> f64 {
        self.lookup(path)
            .filter(|value| value.is_finite())
            .unwrap_or(default)
    }

    fn require(&self, path: &str) -> Result<f64> {
        self.lookup(path)
            .filter(|value| value.is_finite())
            .ok_or_else(|| GoalError::NotFound(path.to_string()))
    }
}

/// Default capital market table: (asset, expected annual return, annual volatility).
pub const DEFAULT_ASSET_MODELS: [(AssetClass, f64, f64); 5] = [
    (AssetClass::Equity, 0.12, 0.18),
    (AssetClass::Debt, 0.07, 0.05),
    (AssetClass::Gold, 0.08, 0.15),
    (AssetClass::RealEstate, 0.09, 0.12),
    (AssetClass::Cash, 0.03, 0.01),
];

pub const DEFAULT_CORRELATIONS: [(AssetClass, AssetClass, f64); 10] = [
    (AssetClass::Equity, AssetClass::Debt, 0.10),
    (AssetClass::Equity, AssetClass::Gold, -0.05),
    (AssetClass::Equity, AssetClass::RealEstate, 0.50),
    (AssetClass::Equity, AssetClass::Cash, 0.0),
    (AssetClass::Debt, AssetClass::Gold, 0.15),
    (AssetClass::Debt, AssetClass::RealEstate, 0.20),
    (AssetClass::Debt, AssetClass::Cash, 0.30),
    (AssetClass::Gold, AssetClass::RealEstate, 0.10),
    (AssetClass::Gold, AssetClass::Cash, 0.0),
    (AssetClass::RealEstate, AssetClass::Cash, 0.0),
];

pub fn expected_return_path(asset: AssetClass) -> String {
    format!("asset_returns.{}.expected_return", asset.as_str())
}

pub fn volatility_path(asset: AssetClass) -> String {
    format!("asset_returns.{}.volatility", asset.as_str())
}

pub fn correlation_path(first: AssetClass, second: AssetClass) -> String {
    format!("asset_correlation.{}.{}", first.as_str(), second.as_str())
}

pub const INFLATION_PATH: &str = "simulation.inflation";
pub const TAX_DRAG_PATH: &str = "simulation.tax_drag";
pub const CONTRIBUTION_GROWTH_PATH: &str = "simulation.contribution_growth";

/// In-memory provider backed by a flat path→value map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaticParameters {
    values: BTreeMap<String, f64>,
}

impl StaticParameters {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Provider seeded with the static asset-class table.
    pub fn with_defaults() -> Self {
        let mut params = Self::empty();
        for (asset, expected_return, volatility) in DEFAULT_ASSET_MODELS {
            params.set(expected_return_path(asset), expected_return);
            params.set(volatility_path(asset), volatility);
        }
        for (first, second, rho) in DEFAULT_CORRELATIONS {
            params.set(correlation_path(first, second), rho);
        }
        params.set(INFLATION_PATH, 0.0);
        params.set(TAX_DRAG_PATH, 0.0);
        params.set(CONTRIBUTION_GROWTH_PATH, 0.0);
        params
    }

    pub fn set(&mut self, path: impl Into<String>, value: f64) {
        self.values.insert(path.into(), value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Later values win.
    pub fn merged_with(mut self, other: StaticParameters) -> Self {
        self.values.extend(other.values);
        self
    }

    /// Parses a JSON document; nested objects become dotted paths, numeric
    /// leaves become values, anything else is ignored with a warning.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let root: Value = serde_json::from_str(json)
            .map_err(|e| GoalError::Storage(format!("invalid parameter JSON: {e}")))?;
        let mut params = Self::empty();
        flatten_into(&root, String::new(), &mut params.values);
        Ok(params)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            GoalError::Storage(format!("cannot read parameters {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }
}

fn flatten_into(value: &Value, prefix: String, out: &mut BTreeMap<String, f64>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(child, path, out);
            }
        }
        Value::Number(n) => match n.as_f64() {
            Some(v) => {
                out.insert(prefix, v);
            }
            None => warn!(path = %prefix, "numeric parameter out of range, skipped"),
        },
        _ => warn!(path = %prefix, "non-numeric parameter skipped"),
    }
}

impl ParameterProvider for StaticParameters {
    fn lookup(&self, path: &str) -> Option<f64> {
        self.values.get(path).copied()
    }

    fn get_parameters_by_prefix(&self, prefix: &str) -> BTreeMap<String, f64> {
        self.values
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), *value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_asset_class() {
        let params = StaticParameters::with_defaults();
        for asset in AssetClass::ALL {
            assert!(params.require(&expected_return_path(asset)).is_ok());
            assert!(params.require(&volatility_path(asset)).is_ok());
        }
        assert_eq!(
            params.lookup("asset_returns.equity.expected_return"),
            Some(0.12)
        );
    }

    #[test]
    fn get_falls_back_to_default_and_require_reports_not_found() {
        let params = StaticParameters::empty();
        assert_eq!(params.get("gap.savings_rate", 0.5), 0.5);
        assert_eq!(params.get_or("gap.savings_rate", 0.4), 0.4);
        let err = params.require("gap.savings_rate").expect_err("missing");
        assert_eq!(err, GoalError::NotFound("gap.savings_rate".into()));
    }

    #[test]
    fn prefix_query_returns_only_matching_paths() {
        let params = StaticParameters::with_defaults();
        let equity = params.get_parameters_by_prefix("asset_returns.equity.");
        assert_eq!(equity.len(), 2);
        assert!(equity.keys().all(|k| k.starts_with("asset_returns.equity.")));
        assert!(params.get_parameters_by_prefix("nope").is_empty());
    }

    #[test]
    fn json_documents_flatten_to_dotted_paths() {
        let json = r#"{
            "asset_returns": {"equity": {"expected_return": 0.1, "label": "eq"}},
            "simulation": {"inflation": 0.04}
        }"#;
        let params = StaticParameters::from_json_str(json).expect("valid json");
        assert_eq!(params.lookup("asset_returns.equity.expected_return"), Some(0.1));
        assert_eq!(params.lookup("simulation.inflation"), Some(0.04));
        assert_eq!(params.lookup("asset_returns.equity.label"), None);

        let merged = StaticParameters::with_defaults().merged_with(params);
        assert_eq!(merged.lookup("asset_returns.equity.expected_return"), Some(0.1));
        assert_eq!(merged.lookup("asset_returns.debt.expected_return"), Some(0.07));
    }

    #[test]
    fn malformed_json_is_a_storage_error() {
        let err = StaticParameters::from_json_str("{not json").expect_err("invalid");
        assert!(matches!(err, GoalError::Storage(_)));
    }
}
