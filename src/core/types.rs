use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use super::error::{GoalError, Result};

/// Maximum distance of an allocation's weight sum from 1.0 that is still
/// accepted (and then normalized away).
pub const ALLOCATION_TOLERANCE: f64 = 0.01;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalCategory {
    Retirement,
    Education,
    Home,
    EmergencyFund,
    Discretionary,
    Wedding,
    Healthcare,
    LegacyPlanning,
    CharitableGiving,
    DebtRepayment,
    Custom,
}

impl GoalCategory {
    pub const ALL: [GoalCategory; 11] = [
        GoalCategory::Retirement,
        GoalCategory::Education,
        GoalCategory::Home,
        GoalCategory::EmergencyFund,
        GoalCategory::Discretionary,
        GoalCategory::Wedding,
        GoalCategory::Healthcare,
        GoalCategory::LegacyPlanning,
        GoalCategory::CharitableGiving,
        GoalCategory::DebtRepayment,
        GoalCategory::Custom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GoalCategory::Retirement => "retirement",
            GoalCategory::Education => "education",
            GoalCategory::Home => "home",
            GoalCategory::EmergencyFund => "emergency_fund",
            GoalCategory::Discretionary => "discretionary",
            GoalCategory::Wedding => "wedding",
            GoalCategory::Healthcare => "healthcare",
            GoalCategory::LegacyPlanning => "legacy_planning",
            GoalCategory::CharitableGiving => "charitable_giving",
            GoalCategory::DebtRepayment => "debt_repayment",
            GoalCategory::Custom => "custom",
        }
    }

    /// Goals whose purpose is protection rather than growth.
    pub fn is_security_goal(self) -> bool {
        matches!(
            self,
            GoalCategory::EmergencyFund | GoalCategory::Healthcare | GoalCategory::DebtRepayment
        )
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    High,
    Medium,
    Low,
}

impl Importance {
    pub fn weight(self) -> f64 {
        match self {
            Importance::High => 3.0,
            Importance::Medium => 2.0,
            Importance::Low => 1.0,
        }
    }

    pub fn raised(self) -> Self {
        match self {
            Importance::Low => Importance::Medium,
            Importance::Medium | Importance::High => Importance::High,
        }
    }

    pub fn lowered(self) -> Self {
        match self {
            Importance::High => Importance::Medium,
            Importance::Medium | Importance::Low => Importance::Low,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTolerance {
    Conservative,
    Moderate,
    Aggressive,
}

impl RiskTolerance {
    /// Upper bound on the combined weight of growth assets.
    pub fn max_growth_weight(self) -> f64 {
        match self {
            RiskTolerance::Conservative => 0.40,
            RiskTolerance::Moderate => 0.70,
            RiskTolerance::Aggressive => 0.90,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Equity,
    Debt,
    Gold,
    RealEstate,
    Cash,
}

impl AssetClass {
    pub const ALL: [AssetClass; 5] = [
        AssetClass::Equity,
        AssetClass::Debt,
        AssetClass::Gold,
        AssetClass::RealEstate,
        AssetClass::Cash,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AssetClass::Equity => "equity",
            AssetClass::Debt => "debt",
            AssetClass::Gold => "gold",
            AssetClass::RealEstate => "real_estate",
            AssetClass::Cash => "cash",
        }
    }

    pub fn is_growth(self) -> bool {
        matches!(self, AssetClass::Equity | AssetClass::RealEstate)
    }
}

/// Asset class weights. Serialized as a plain `{ "equity": 0.6, ... }` map.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Allocation(BTreeMap<AssetClass, f64>);

impl Allocation {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (AssetClass, f64)>,
    {
        Self(pairs.into_iter().collect())
    }

    pub fn default_for(risk: RiskTolerance) -> Self {
        match risk {
            RiskTolerance::Conservative => Self::from_pairs([
                (AssetClass::Equity, 0.30),
                (AssetClass::Debt, 0.50),
                (AssetClass::Gold, 0.10),
                (AssetClass::Cash, 0.10),
            ]),
            RiskTolerance::Moderate => Self::from_pairs([
                (AssetClass::Equity, 0.55),
                (AssetClass::Debt, 0.30),
                (AssetClass::Gold, 0.10),
                (AssetClass::Cash, 0.05),
            ]),
            RiskTolerance::Aggressive => Self::from_pairs([
                (AssetClass::Equity, 0.75),
                (AssetClass::Debt, 0.15),
                (AssetClass::Gold, 0.05),
                (AssetClass::Cash, 0.05),
            ]),
        }
    }

    pub fn weight(&self, asset: AssetClass) -> f64 {
        self.0.get(&asset).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, asset: AssetClass, weight: f64) {
        self.0.insert(asset, weight);
    }

    pub fn iter(&self) -> impl Iterator<Item = (AssetClass, f64)> + '_ {
        self.0.iter().map(|(asset, weight)| (*asset, *weight))
    }

    pub fn asset_classes(&self) -> Vec<AssetClass> {
        self.0.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total(&self) -> f64 {
        self.0.values().sum()
    }

    pub fn growth_weight(&self) -> f64 {
        self.iter()
            .filter(|(asset, _)| asset.is_growth())
            .map(|(_, weight)| weight)
            .sum()
    }

    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(GoalError::validation("asset allocation is empty"));
        }
        for (asset, weight) in self.iter() {
            if !weight.is_finite() || weight < 0.0 {
                return Err(GoalError::validation(format!(
                    "allocation weight for {} must be a finite non-negative number",
                    asset.as_str()
                )));
            }
        }
        let total = self.total();
        if (total - 1.0).abs() > ALLOCATION_TOLERANCE {
            return Err(GoalError::validation(format!(
                "allocation weights sum to {total:.4}, expected 1.0"
            )));
        }
        Ok(())
    }

    /// Validates the weights and rescales them to sum to exactly 1.0.
    /// Zero-weight classes are dropped.
    pub fn normalized(&self) -> Result<Self> {
        self.validate()?;
        Ok(self.rescaled())
    }

    /// Rescales to unit sum after an adjustment, without the tolerance check.
    /// Negative or non-finite weights are treated as zero; an allocation with
    /// nothing left collapses to all cash.
    pub fn rescaled(&self) -> Self {
        let cleaned: BTreeMap<AssetClass, f64> = self
            .0
            .iter()
            .filter(|(_, weight)| weight.is_finite() && **weight > 0.0)
            .map(|(asset, weight)| (*asset, *weight))
            .collect();
        let total: f64 = cleaned.values().sum();
        if total <= 0.0 {
            return Self::from_pairs([(AssetClass::Cash, 1.0)]);
        }
        Self(
            cleaned
                .into_iter()
                .map(|(asset, weight)| (asset, weight / total))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileAnswer {
    pub question_id: String,
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinancialProfile {
    #[serde(default)]
    pub id: String,
    pub annual_income: f64,
    pub annual_expenses: f64,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub risk_tolerance: Option<RiskTolerance>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub assets: BTreeMap<String, f64>,
    #[serde(default)]
    pub answers: Vec<ProfileAnswer>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedProfile {
    pub age: u32,
    pub risk_tolerance: RiskTolerance,
    pub country: String,
}

pub const DEFAULT_PROFILE_AGE: u32 = 35;
pub const DEFAULT_COUNTRY: &str = "IN";

/// The single place where optional profile fields get their defaults.
pub fn resolve_profile_defaults(profile: &FinancialProfile) -> ResolvedProfile {
    ResolvedProfile {
        age: profile.age.unwrap_or(DEFAULT_PROFILE_AGE),
        risk_tolerance: profile.risk_tolerance.unwrap_or(RiskTolerance::Moderate),
        country: profile
            .country
            .clone()
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_COUNTRY.to_string()),
    }
}

impl FinancialProfile {
    pub fn new(annual_income: f64, annual_expenses: f64) -> Self {
        Self {
            id: String::new(),
            annual_income,
            annual_expenses,
            age: None,
            risk_tolerance: None,
            country: None,
            assets: BTreeMap::new(),
            answers: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.annual_income.is_finite() || self.annual_income < 0.0 {
            return Err(GoalError::validation(
                "annual_income must be a finite non-negative number",
            ));
        }
        if !self.annual_expenses.is_finite() || self.annual_expenses < 0.0 {
            return Err(GoalError::validation(
                "annual_expenses must be a finite non-negative number",
            ));
        }
        if let Some((name, _)) = self.assets.iter().find(|(_, v)| !v.is_finite()) {
            return Err(GoalError::validation(format!(
                "asset holding '{name}' is not a finite number"
            )));
        }
        Ok(())
    }

    pub fn disposable_monthly(&self) -> f64 {
        ((self.annual_income - self.annual_expenses) / 12.0).max(0.0)
    }

    pub fn total_assets(&self) -> f64 {
        self.assets.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    pub id: String,
    pub category: GoalCategory,
    #[serde(default)]
    pub title: String,
    pub target_amount: f64,
    #[serde(default)]
    pub current_amount: f64,
    #[serde(default)]
    pub target_date: Option<NaiveDate>,
    #[serde(default = "default_importance")]
    pub importance: Importance,
    #[serde(default)]
    pub monthly_contribution: f64,
    #[serde(default)]
    pub asset_allocation: Allocation,
}

fn default_importance() -> Importance {
    Importance::Medium
}

impl Goal {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(GoalError::validation("goal id must not be empty"));
        }
        if !self.target_amount.is_finite() || self.target_amount <= 0.0 {
            return Err(GoalError::validation(format!(
                "goal {}: target_amount must be > 0",
                self.id
            )));
        }
        if !self.current_amount.is_finite() || self.current_amount < 0.0 {
            return Err(GoalError::validation(format!(
                "goal {}: current_amount must be >= 0",
                self.id
            )));
        }
        if !self.monthly_contribution.is_finite() || self.monthly_contribution < 0.0 {
            return Err(GoalError::validation(format!(
                "goal {}: monthly_contribution must be >= 0",
                self.id
            )));
        }
        Ok(())
    }

    /// Whole months left until the target date, 0 when absent or past.
    pub fn horizon_months(&self, as_of: NaiveDate) -> u32 {
        self.target_date
            .map(|date| months_between(as_of, date))
            .unwrap_or(0)
    }

    /// Allocation the simulation runs with: the goal's own weights
    /// normalized, or the risk-tolerance default when none were given.
    pub fn effective_allocation(&self, risk: RiskTolerance) -> Result<Allocation> {
        if self.asset_allocation.is_empty() {
            return Ok(Allocation::default_for(risk));
        }
        self.asset_allocation.normalized().map_err(|e| match e {
            GoalError::Validation(msg) => GoalError::Validation(format!("goal {}: {msg}", self.id)),
            other => other,
        })
    }

    pub fn remaining_amount(&self) -> f64 {
        (self.target_amount - self.current_amount).max(0.0)
    }
}

/// Whole calendar months from `from` to `to`; 0 if `to` is not after `from`.
pub fn months_between(from: NaiveDate, to: NaiveDate) -> u32 {
    if to <= from {
        return 0;
    }
    let mut months = (to.year() - from.year()) * 12 + to.month() as i32 - from.month() as i32;
    if to.day() < from.day() {
        months -= 1;
    }
    months.max(0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn allocation_normalization_rescales_within_tolerance() {
        let alloc = Allocation::from_pairs([(AssetClass::Equity, 0.605), (AssetClass::Debt, 0.4)]);
        let normalized = alloc.normalized().expect("within tolerance");
        assert!((normalized.total() - 1.0).abs() < 1e-12);
        assert!(normalized.weight(AssetClass::Equity) > 0.6);
    }

    #[test]
    fn allocation_normalization_rejects_far_off_sums() {
        let alloc = Allocation::from_pairs([(AssetClass::Equity, 0.9), (AssetClass::Debt, 0.4)]);
        let err = alloc.normalized().expect_err("must reject");
        assert!(err.is_validation());

        let negative =
            Allocation::from_pairs([(AssetClass::Equity, 1.2), (AssetClass::Debt, -0.2)]);
        assert!(negative.normalized().is_err());
        assert!(Allocation::new().normalized().is_err());
    }

    #[test]
    fn rescaled_drops_empty_classes_and_falls_back_to_cash() {
        let alloc = Allocation::from_pairs([(AssetClass::Equity, 0.0), (AssetClass::Debt, 0.0)]);
        let rescaled = alloc.rescaled();
        assert_eq!(rescaled.asset_classes(), vec![AssetClass::Cash]);

        let alloc = Allocation::from_pairs([(AssetClass::Equity, 3.0), (AssetClass::Gold, 1.0)]);
        let rescaled = alloc.rescaled();
        assert!((rescaled.weight(AssetClass::Equity) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn default_allocations_sum_to_one_and_respect_growth_caps() {
        for risk in [
            RiskTolerance::Conservative,
            RiskTolerance::Moderate,
            RiskTolerance::Aggressive,
        ] {
            let alloc = Allocation::default_for(risk);
            assert!((alloc.total() - 1.0).abs() < 1e-9);
            assert!(alloc.growth_weight() <= risk.max_growth_weight() + 1e-9);
        }
    }

    #[test]
    fn months_between_counts_whole_calendar_months() {
        assert_eq!(months_between(date(2024, 1, 15), date(2025, 1, 15)), 12);
        assert_eq!(months_between(date(2024, 1, 15), date(2025, 1, 14)), 11);
        assert_eq!(months_between(date(2024, 1, 31), date(2024, 2, 29)), 0);
        assert_eq!(months_between(date(2024, 5, 1), date(2024, 4, 1)), 0);
    }

    #[test]
    fn profile_defaults_are_resolved_in_one_place() {
        let profile = FinancialProfile::new(80_000.0, 50_000.0);
        let resolved = resolve_profile_defaults(&profile);
        assert_eq!(resolved.age, DEFAULT_PROFILE_AGE);
        assert_eq!(resolved.risk_tolerance, RiskTolerance::Moderate);
        assert_eq!(resolved.country, DEFAULT_COUNTRY);
        assert!((profile.disposable_monthly() - 2_500.0).abs() < 1e-9);
    }

    #[test]
    fn goal_json_uses_snake_case_enums_and_camel_case_fields() {
        let json = r#"{
            "id": "g1",
            "category": "emergency_fund",
            "targetAmount": 300000,
            "currentAmount": 100000,
            "importance": "high",
            "assetAllocation": {"cash": 0.7, "debt": 0.3}
        }"#;
        let goal: Goal = serde_json::from_str(json).expect("valid goal json");
        assert_eq!(goal.category, GoalCategory::EmergencyFund);
        assert_eq!(goal.importance, Importance::High);
        assert_eq!(goal.target_date, None);
        assert!((goal.asset_allocation.weight(AssetClass::Cash) - 0.7).abs() < 1e-12);
        assert!(goal.validate().is_ok());
    }
}
