use super::{
    Adjustment, BASE_FEASIBILITY, RemediationOption, RemediationStrategy, StrategyContext,
    StrategyKind, band_factor, importance_factor, money, variant_magnitudes,
};
use crate::core::config::TargetConfig;
use crate::core::gap::GapResult;

/// Lower the target amount by a fraction of itself.
#[derive(Debug, Clone, Default)]
pub struct TargetAdjustment {
    config: TargetConfig,
}

impl TargetAdjustment {
    pub fn new(config: TargetConfig) -> Self {
        Self { config }
    }
}

impl RemediationStrategy for TargetAdjustment {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Target
    }

    fn feasibility_threshold(&self) -> f64 {
        self.config.feasibility_threshold
    }

    fn generate_options(
        &self,
        gap: &GapResult,
        _ctx: &StrategyContext<'_>,
    ) -> Vec<RemediationOption> {
        if !gap.has_gap() {
            return Vec::new();
        }
        let optimal = gap.gap_fraction() * self.config.factor;
        variant_magnitudes(optimal, self.config.min_reduction, self.config.max_reduction)
            .into_iter()
            .map(|(variant, reduction)| {
                let new_target = gap.target_amount * (1.0 - reduction);
                let new_gap = (new_target - gap.projected_amount).max(0.0);
                let new_gap_percentage = if new_target > 0.0 {
                    new_gap / new_target * 100.0
                } else {
                    0.0
                };
                RemediationOption::new(
                    StrategyKind::Target,
                    variant,
                    &gap.goal_id,
                    format!(
                        "Reduce the target by {:.0}% to {}",
                        reduction * 100.0,
                        money(new_target)
                    ),
                    Adjustment::Target {
                        current_target: gap.target_amount,
                        new_target,
                        reduction_fraction: reduction,
                    },
                )
                .with_metric("reduction_fraction", reduction)
                .with_metric("reduction_amount", gap.target_amount - new_target)
                .with_metric("new_target", new_target)
                .with_metric("remaining_gap", new_gap)
                .with_metric("new_gap_percentage", new_gap_percentage)
                .with_metric("gap_reduction", gap.gap_amount - new_gap)
                .with_steps([
                    format!(
                        "Revisit what '{}' must cover and set the target to {}",
                        gap.goal_title,
                        money(new_target)
                    ),
                    "List the items dropped or postponed by the lower target".to_string(),
                    "Confirm the revised amount with everyone sharing the goal".to_string(),
                ])
            })
            .collect()
    }

    fn score_feasibility(
        &self,
        option: &RemediationOption,
        gap: &GapResult,
        _ctx: &StrategyContext<'_>,
    ) -> f64 {
        let reduction = option.metric("reduction_fraction").unwrap_or(1.0);
        let size = band_factor(reduction, [0.10, 0.20, 0.30]);
        let importance = importance_factor(gap.importance, 0.7, 1.3);
        let category = if gap.category.is_security_goal() { 0.6 } else { 1.0 };
        BASE_FEASIBILITY * size * importance * category
    }
}
