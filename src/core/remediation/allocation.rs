use super::{
    Adjustment, BASE_FEASIBILITY, RemediationOption, RemediationStrategy, StrategyContext,
    StrategyKind, band_factor, variant_magnitudes,
};
use crate::core::config::AllocationConfig;
use crate::core::gap::{GapResult, future_value, monthly_rate};
use crate::core::types::{Allocation, AssetClass, resolve_profile_defaults};

/// Moves up to `shift` of weight between growth and defensive assets,
/// taking from the donors pro rata. Growth receipts go to equity, defensive
/// receipts to debt. The result is always normalized.
pub fn shift_allocation(allocation: &Allocation, shift: f64, toward_growth: bool) -> Allocation {
    let base = allocation.rescaled();
    let donors: Vec<(AssetClass, f64)> = base
        .iter()
        .filter(|(asset, weight)| asset.is_growth() != toward_growth && *weight > 0.0)
        .collect();
    let donor_total: f64 = donors.iter().map(|(_, w)| w).sum();
    let moved = shift.max(0.0).min(donor_total);
    if moved <= 0.0 {
        return base;
    }

    let mut shifted = base.clone();
    for (asset, weight) in donors {
        shifted.set(asset, weight - moved * weight / donor_total);
    }
    let receiver = if toward_growth {
        AssetClass::Equity
    } else {
        AssetClass::Debt
    };
    shifted.set(receiver, shifted.weight(receiver) + moved);
    shifted.rescaled()
}

/// Rebalance toward growth assets on long horizons (within the profile's
/// risk tolerance) or toward debt on short ones.
#[derive(Debug, Clone, Default)]
pub struct AllocationAdjustment {
    config: AllocationConfig,
}

impl AllocationAdjustment {
    pub fn new(config: AllocationConfig) -> Self {
        Self { config }
    }
}

impl RemediationStrategy for AllocationAdjustment {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Allocation
    }

    fn feasibility_threshold(&self) -> f64 {
        self.config.feasibility_threshold
    }

    fn generate_options(
        &self,
        gap: &GapResult,
        ctx: &StrategyContext<'_>,
    ) -> Vec<RemediationOption> {
        if !gap.has_gap() {
            return Vec::new();
        }
        let risk = resolve_profile_defaults(ctx.profile).risk_tolerance;
        let Ok(current) = ctx.goal.effective_allocation(risk) else {
            return Vec::new();
        };
        let toward_growth = gap.available_months >= self.config.short_horizon_months;
        let max_shift = if toward_growth {
            let headroom = risk.max_growth_weight() - current.growth_weight();
            self.config.max_shift.min(headroom)
        } else {
            self.config.max_shift.min(current.growth_weight())
        };
        if max_shift < self.config.min_shift {
            return Vec::new();
        }

        let optimal = gap.gap_fraction() * self.config.factor;
        let current_return = ctx.assumptions.expected_return(&current);
        let current_vol = ctx.assumptions.portfolio_volatility(&current);

        variant_magnitudes(optimal, self.config.min_shift, max_shift)
            .into_iter()
            .map(|(variant, shift)| {
                let proposed = shift_allocation(&current, shift, toward_growth);
                let new_return = ctx.assumptions.expected_return(&proposed);
                let new_vol = ctx.assumptions.portfolio_volatility(&proposed);
                let projected = future_value(
                    gap.current_amount,
                    gap.monthly_contribution,
                    monthly_rate(new_return),
                    gap.available_months,
                );
                let remaining_gap = (gap.target_amount - projected).max(0.0);
                let (description, first_step) = if toward_growth {
                    (
                        format!("Move {:.0}% of the portfolio into equity", shift * 100.0),
                        "Redirect new contributions to equity funds first",
                    )
                } else {
                    (
                        format!(
                            "Move {:.0}% of the portfolio from growth assets into debt",
                            shift * 100.0
                        ),
                        "Switch growth holdings to short-duration debt funds",
                    )
                };
                RemediationOption::new(
                    StrategyKind::Allocation,
                    variant,
                    &gap.goal_id,
                    description,
                    Adjustment::Allocation {
                        current: current.clone(),
                        proposed: proposed.clone(),
                        shift,
                    },
                )
                .with_metric("shift", shift)
                .with_metric("expected_return", new_return)
                .with_metric("expected_return_change", new_return - current_return)
                .with_metric("volatility", new_vol)
                .with_metric("volatility_change", new_vol - current_vol)
                .with_metric("growth_weight", proposed.growth_weight())
                .with_metric("projected_amount", projected)
                .with_metric("remaining_gap", remaining_gap)
                .with_steps([
                    first_step.to_string(),
                    "Rebalance existing holdings over the next quarter".to_string(),
                    "Review the allocation again every year".to_string(),
                ])
            })
            .collect()
    }

    fn score_feasibility(
        &self,
        option: &RemediationOption,
        gap: &GapResult,
        ctx: &StrategyContext<'_>,
    ) -> f64 {
        let shift = option.metric("shift").unwrap_or(1.0);
        let size = band_factor(shift, [0.10, 0.20, 0.30]);
        let risk = resolve_profile_defaults(ctx.profile).risk_tolerance;
        let growth = option.metric("growth_weight").unwrap_or(1.0);
        let fits_risk = if growth <= risk.max_growth_weight() + 1e-9 {
            1.2
        } else {
            0.6
        };
        let horizon = if gap.available_months >= 120 {
            1.2
        } else if gap.available_months >= self.config.short_horizon_months {
            1.0
        } else {
            0.8
        };
        BASE_FEASIBILITY * size * fits_risk * horizon
    }
}
