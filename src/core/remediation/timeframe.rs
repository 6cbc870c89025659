use chrono::Months;

use super::{
    Adjustment, BASE_FEASIBILITY, RemediationOption, RemediationStrategy, StrategyContext,
    StrategyKind, band_factor, importance_factor, money, variant_magnitudes,
};
use crate::core::config::TimeframeConfig;
use crate::core::gap::{GapResult, monthly_rate, required_monthly_contribution};

/// Push the target date out so the current contribution has time to close
/// the gap.
#[derive(Debug, Clone, Default)]
pub struct TimeframeAdjustment {
    config: TimeframeConfig,
}

impl TimeframeAdjustment {
    pub fn new(config: TimeframeConfig) -> Self {
        Self { config }
    }
}

impl RemediationStrategy for TimeframeAdjustment {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Timeframe
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
        let min = self.config.min_extension_months as f64;
        let max = self.config.max_extension_months as f64;
        let optimal = match gap.timeframe_gap_months {
            Some(months) if months > 0 => months as f64 * self.config.factor,
            Some(_) => min,
            None => max,
        };
        let base_date = gap.target_date.unwrap_or(ctx.as_of);
        let rate = monthly_rate(gap.expected_return);

        variant_magnitudes(optimal, min, max)
            .into_iter()
            .filter_map(|(variant, extension)| {
                let extension_months = extension.ceil() as u32;
                let new_date = base_date.checked_add_months(Months::new(extension_months))?;
                let new_horizon = gap.available_months + extension_months;
                let projected = ctx.project(gap, gap.monthly_contribution, new_horizon);
                let remaining_gap = (gap.target_amount - projected).max(0.0);
                let required_monthly = required_monthly_contribution(
                    gap.current_amount,
                    gap.target_amount,
                    rate,
                    new_horizon,
                );
                let option = RemediationOption::new(
                    StrategyKind::Timeframe,
                    variant,
                    &gap.goal_id,
                    format!("Extend the target date by {extension_months} months to {new_date}"),
                    Adjustment::Timeframe {
                        current_date: gap.target_date,
                        new_date,
                        extension_months,
                    },
                )
                .with_metric("extension_months", extension_months as f64)
                .with_metric("new_horizon_months", new_horizon as f64)
                .with_metric("projected_amount", projected)
                .with_metric("remaining_gap", remaining_gap)
                .with_metric("gap_reduction", gap.gap_amount - remaining_gap)
                .with_metric("required_monthly", required_monthly)
                .with_steps([
                    format!("Move the target date of '{}' to {new_date}", gap.goal_title),
                    format!(
                        "Keep contributing {} per month over the longer horizon",
                        money(gap.monthly_contribution)
                    ),
                    "Check that dependent plans can absorb the delay".to_string(),
                ]);
                Some(option)
            })
            .collect()
    }

    fn score_feasibility(
        &self,
        option: &RemediationOption,
        gap: &GapResult,
        _ctx: &StrategyContext<'_>,
    ) -> f64 {
        let extension = option.metric("extension_months").unwrap_or(f64::MAX);
        let length = band_factor(extension, [12.0, 24.0, 36.0]);
        let importance = importance_factor(gap.importance, 0.7, 1.3);
        let category = if gap.category.is_security_goal() { 0.6 } else { 1.0 };
        let closes = if option.metric("remaining_gap").unwrap_or(f64::MAX) <= 0.0 {
            1.2
        } else {
            0.9
        };
        BASE_FEASIBILITY * length * importance * category * closes
    }
}
