use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::{GoalError, Result};
use super::params::{
    CONTRIBUTION_GROWTH_PATH, DEFAULT_ASSET_MODELS, DEFAULT_CORRELATIONS, INFLATION_PATH,
    ParameterProvider, TAX_DRAG_PATH, correlation_path, expected_return_path, volatility_path,
};
use super::types::{Allocation, AssetClass, FinancialProfile};

/// Bumped whenever the trial-generation model changes, so cached arrays
/// from an older model are never served.
pub const MODEL_VERSION: &str = "goalpath-mc-2";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetClassModel {
    pub expected_return: f64,
    pub volatility: f64,
}

/// Per-call adjustments merged into the market assumptions (or the profile)
/// once, before simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SimulationOverride {
    ExpectedReturn {
        asset: AssetClass,
        value: f64,
    },
    Volatility {
        asset: AssetClass,
        value: f64,
    },
    Correlation {
        first: AssetClass,
        second: AssetClass,
        value: f64,
    },
    Inflation {
        rate: f64,
    },
    TaxDrag {
        rate: f64,
    },
    ContributionGrowth {
        rate: f64,
    },
    Income {
        annual: f64,
    },
    Expenses {
        annual: f64,
    },
}

impl SimulationOverride {
    pub fn validate(&self) -> Result<()> {
        let ok = match *self {
            SimulationOverride::ExpectedReturn { value, .. } => value.is_finite() && value > -1.0,
            SimulationOverride::Volatility { value, .. } => value.is_finite() && value >= 0.0,
            SimulationOverride::Correlation {
                first,
                second,
                value,
            } => value.is_finite() && (-1.0..=1.0).contains(&value) && first != second,
            SimulationOverride::Inflation { rate }
            | SimulationOverride::ContributionGrowth { rate } => rate.is_finite() && rate > -1.0,
            SimulationOverride::TaxDrag { rate } => rate.is_finite() && (0.0..=1.0).contains(&rate),
            SimulationOverride::Income { annual } | SimulationOverride::Expenses { annual } => {
                annual.is_finite() && annual >= 0.0
            }
        };
        if ok {
            Ok(())
        } else {
            Err(GoalError::validation(format!("invalid override: {self:?}")))
        }
    }
}

/// Copy of the profile with income/expense overrides applied.
pub fn apply_profile_overrides(
    profile: &FinancialProfile,
    overrides: &[SimulationOverride],
) -> FinancialProfile {
    let mut adjusted = profile.clone();
    for o in overrides {
        match *o {
            SimulationOverride::Income { annual } => adjusted.annual_income = annual,
            SimulationOverride::Expenses { annual } => adjusted.annual_expenses = annual,
            _ => {}
        }
    }
    adjusted
}

/// Fully resolved capital market inputs for one simulation call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketAssumptions {
    pub assets: BTreeMap<AssetClass, AssetClassModel>,
    /// Keyed by `"first:second"` with the pair in declaration order.
    pub correlations: BTreeMap<String, f64>,
    pub inflation: f64,
    pub tax_drag: f64,
    pub contribution_growth: f64,
}

fn pair_key(first: AssetClass, second: AssetClass) -> String {
    let (a, b) = if first <= second {
        (first, second)
    } else {
        (second, first)
    };
    format!("{}:{}", a.as_str(), b.as_str())
}

impl Default for MarketAssumptions {
    fn default() -> Self {
        let assets = DEFAULT_ASSET_MODELS
            .iter()
            .map(|&(asset, expected_return, volatility)| {
                (
                    asset,
                    AssetClassModel {
                        expected_return,
                        volatility,
                    },
                )
            })
            .collect();
        let correlations = DEFAULT_CORRELATIONS
            .iter()
            .map(|&(a, b, rho)| (pair_key(a, b), rho))
            .collect();
        Self {
            assets,
            correlations,
            inflation: 0.0,
            tax_drag: 0.0,
            contribution_growth: 0.0,
        }
    }
}

impl MarketAssumptions {
    /// Reads the asset table from the provider, falling back to the static
    /// defaults (with a logged warning) for anything missing.
    pub fn from_provider(provider: &dyn ParameterProvider) -> Self {
        let defaults = Self::default();
        let mut assets = BTreeMap::new();
        for asset in AssetClass::ALL {
            let fallback = defaults.model(asset);
            assets.insert(
                asset,
                AssetClassModel {
                    expected_return: provider
                        .get(&expected_return_path(asset), fallback.expected_return),
                    volatility: provider.get(&volatility_path(asset), fallback.volatility).max(0.0),
                },
            );
        }

        let mut correlations = BTreeMap::new();
        for (i, &a) in AssetClass::ALL.iter().enumerate() {
            for &b in &AssetClass::ALL[i + 1..] {
                let fallback = defaults.correlation(a, b);
                let rho = provider
                    .lookup(&correlation_path(a, b))
                    .or_else(|| provider.lookup(&correlation_path(b, a)))
                    .filter(|v| v.is_finite())
                    .unwrap_or_else(|| {
                        warn!(
                            first = a.as_str(),
                            second = b.as_str(),
                            fallback,
                            "correlation not found, using default"
                        );
                        fallback
                    });
                correlations.insert(pair_key(a, b), rho.clamp(-1.0, 1.0));
            }
        }

        Self {
            assets,
            correlations,
            inflation: provider.get(INFLATION_PATH, 0.0),
            tax_drag: provider.get(TAX_DRAG_PATH, 0.0).clamp(0.0, 1.0),
            contribution_growth: provider.get(CONTRIBUTION_GROWTH_PATH, 0.0),
        }
    }

    pub fn with_overrides(mut self, overrides: &[SimulationOverride]) -> Result<Self> {
        for o in overrides {
            o.validate()?;
            match *o {
                SimulationOverride::ExpectedReturn { asset, value } => {
                    self.assets.entry(asset).or_insert(AssetClassModel {
                        expected_return: 0.0,
                        volatility: 0.0,
                    }).expected_return = value;
                }
                SimulationOverride::Volatility { asset, value } => {
                    self.assets.entry(asset).or_insert(AssetClassModel {
                        expected_return: 0.0,
                        volatility: 0.0,
                    }).volatility = value;
                }
                SimulationOverride::Correlation {
                    first,
                    second,
                    value,
                } => {
                    self.correlations.insert(pair_key(first, second), value);
                }
                SimulationOverride::Inflation { rate } => self.inflation = rate,
                SimulationOverride::TaxDrag { rate } => self.tax_drag = rate,
                SimulationOverride::ContributionGrowth { rate } => self.contribution_growth = rate,
                SimulationOverride::Income { .. } | SimulationOverride::Expenses { .. } => {}
            }
        }
        Ok(self)
    }

    pub fn model(&self, asset: AssetClass) -> AssetClassModel {
        self.assets.get(&asset).copied().unwrap_or(AssetClassModel {
            expected_return: 0.0,
            volatility: 0.0,
        })
    }

    pub fn correlation(&self, first: AssetClass, second: AssetClass) -> f64 {
        if first == second {
            return 1.0;
        }
        self.correlations
            .get(&pair_key(first, second))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn correlation_matrix(&self, assets: &[AssetClass]) -> Vec<Vec<f64>> {
        assets
            .iter()
            .map(|&a| assets.iter().map(|&b| self.correlation(a, b)).collect())
            .collect()
    }

    /// Weighted arithmetic mean of the asset returns.
    pub fn expected_return(&self, allocation: &Allocation) -> f64 {
        allocation
            .iter()
            .map(|(asset, weight)| weight * self.model(asset).expected_return)
            .sum()
    }

    pub fn portfolio_volatility(&self, allocation: &Allocation) -> f64 {
        let weights: Vec<(AssetClass, f64)> = allocation.iter().collect();
        let mut variance = 0.0;
        for &(a, wa) in &weights {
            for &(b, wb) in &weights {
                variance += wa
                    * wb
                    * self.model(a).volatility
                    * self.model(b).volatility
                    * self.correlation(a, b);
            }
        }
        variance.max(0.0).sqrt()
    }
}

/// Lower-triangular `L` with `L·Lᵀ = matrix`, or `None` when the matrix is
/// not positive definite.
pub fn cholesky(matrix: &[Vec<f64>]) -> Option<Vec<Vec<f64>>> {
    let n = matrix.len();
    let mut lower = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..=i {
            let sum: f64 = (0..j).map(|k| lower[i][k] * lower[j][k]).sum();
            if i == j {
                let diag = matrix[i][i] - sum;
                if diag <= 1e-12 || !diag.is_finite() {
                    return None;
                }
                lower[i][j] = diag.sqrt();
            } else {
                lower[i][j] = (matrix[i][j] - sum) / lower[j][j];
            }
        }
    }
    Some(lower)
}

/// Cholesky factor of a correlation matrix, shrinking the off-diagonal
/// terms toward zero until it factorizes.
pub fn correlation_factor(matrix: &[Vec<f64>]) -> Vec<Vec<f64>> {
    if let Some(lower) = cholesky(matrix) {
        return lower;
    }
    let n = matrix.len();
    let mut shrink = 1.0;
    for _ in 0..60 {
        shrink *= 0.9;
        let shrunk: Vec<Vec<f64>> = (0..n)
            .map(|i| {
                (0..n)
                    .map(|j| if i == j { 1.0 } else { matrix[i][j] * shrink })
                    .collect()
            })
            .collect();
        if let Some(lower) = cholesky(&shrunk) {
            warn!(shrink, "correlation matrix not positive definite, shrunk toward identity");
            return lower;
        }
    }
    warn!("correlation matrix unusable, assuming independent assets");
    (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect()
}
