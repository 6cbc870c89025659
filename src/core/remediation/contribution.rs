use super::{
    Adjustment, BASE_FEASIBILITY, RemediationOption, RemediationStrategy, StrategyContext,
    StrategyKind, band_factor, money, variant_magnitudes,
};
use crate::core::config::ContributionConfig;
use crate::core::gap::GapResult;

/// Raise the monthly contribution toward the amount that closes the gap by
/// the target date.
#[derive(Debug, Clone, Default)]
pub struct ContributionAdjustment {
    config: ContributionConfig,
}

impl ContributionAdjustment {
    pub fn new(config: ContributionConfig) -> Self {
        Self { config }
    }

    fn bounds(&self, ctx: &StrategyContext<'_>) -> (f64, f64) {
        let max = ctx.monthly_income() * self.config.max_income_fraction;
        (self.config.min_increase, max.max(self.config.min_increase))
    }
}

impl RemediationStrategy for ContributionAdjustment {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Contribution
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
        let optimal =
            (gap.required_monthly - gap.monthly_contribution).max(0.0) * self.config.factor;
        let (min, max) = self.bounds(ctx);
        let income = ctx.monthly_income();

        variant_magnitudes(optimal, min, max)
            .into_iter()
            .map(|(variant, increase)| {
                let new_monthly = gap.monthly_contribution + increase;
                let projected = ctx.project(gap, new_monthly, gap.available_months);
                let remaining_gap = (gap.target_amount - projected).max(0.0);
                let income_share = if income > 0.0 { increase / income } else { 1.0 };
                RemediationOption::new(
                    StrategyKind::Contribution,
                    variant,
                    &gap.goal_id,
                    format!(
                        "Increase the monthly contribution by {} to {}",
                        money(increase),
                        money(new_monthly)
                    ),
                    Adjustment::Contribution {
                        current_monthly: gap.monthly_contribution,
                        new_monthly,
                    },
                )
                .with_metric("monthly_increase", increase)
                .with_metric("new_monthly_contribution", new_monthly)
                .with_metric("projected_amount", projected)
                .with_metric("gap_reduction", gap.gap_amount - remaining_gap)
                .with_metric("remaining_gap", remaining_gap)
                .with_metric("income_share", income_share)
                .with_steps([
                    format!(
                        "Raise the monthly transfer for '{}' from {} to {}",
                        gap.goal_title,
                        money(gap.monthly_contribution),
                        money(new_monthly)
                    ),
                    "Schedule the transfer for the day after salary credit".to_string(),
                    format!("Trim discretionary spending by {} per month", money(increase)),
                    "Review progress after six months".to_string(),
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
        let increase = option.metric("monthly_increase").unwrap_or(0.0);
        let income_share = option.metric("income_share").unwrap_or(1.0);
        let headroom = gap.affordable_monthly.max(1.0);
        let capacity = band_factor(increase / headroom, [0.5, 1.0, 1.5]);
        let share = band_factor(
            income_share,
            [
                self.config.max_income_fraction / 3.0,
                self.config.max_income_fraction * 2.0 / 3.0,
                self.config.max_income_fraction,
            ],
        );
        BASE_FEASIBILITY * capacity * share
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::core::market::MarketAssumptions;
    use crate::core::remediation::Variant;

    #[test]
    fn options_scale_with_the_required_increase() {
        let goal = goal();
        let profile = profile();
        let assumptions = MarketAssumptions::default();
        let gap = gap_for(&goal, &profile);
        let strategy = ContributionAdjustment::default();
        let options = strategy.generate_options(&gap, &ctx(&goal, &profile, &[], &assumptions));

        assert_eq!(options.len(), 3);
        let optimal = options
            .iter()
            .find(|o| o.variant == Variant::Optimal)
            .expect("optimal variant");
        let expected = gap.required_monthly - gap.monthly_contribution;
        assert!((optimal.metric("monthly_increase").expect("metric") - expected).abs() < 1e-6);
        // the optimal increase closes the gap by the target date
        assert!(optimal.metric("remaining_gap").expect("metric") < 1.0);
        let increases: Vec<f64> = options
            .iter()
            .map(|o| o.metric("monthly_increase").expect("metric"))
            .collect();
        assert!(increases.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn increases_respect_income_cap() {
        let goal = goal();
        let profile = profile();
        let assumptions = MarketAssumptions::default();
        let mut gap = gap_for(&goal, &profile);
        gap.required_monthly = 10_000_000.0;
        let strategy = ContributionAdjustment::default();
        let options = strategy.generate_options(&gap, &ctx(&goal, &profile, &[], &assumptions));
        let cap = profile.annual_income / 12.0 * 0.30;
        assert!(options.len() >= 2);
        let optimal = options
            .iter()
            .find(|o| o.variant == Variant::Optimal)
            .expect("optimal variant");
        assert!((optimal.metric("monthly_increase").expect("metric") - cap).abs() < 1e-9);
        let conservative = options
            .iter()
            .find(|o| o.variant == Variant::Conservative)
            .expect("conservative variant");
        assert!(conservative.metric("monthly_increase").expect("metric") < cap);
        assert!(options
            .iter()
            .all(|o| o.metric("monthly_increase").expect("metric") <= cap + 1e-9));
    }

    #[test]
    fn smaller_increases_score_higher() {
        let goal = goal();
        let profile = profile();
        let assumptions = MarketAssumptions::default();
        let gap = gap_for(&goal, &profile);
        let c = ctx(&goal, &profile, &[], &assumptions);
        let strategy = ContributionAdjustment::default();
        let evaluated = strategy.evaluate_options(strategy.generate_options(&gap, &c), &gap, &c);
        assert!(!evaluated.is_empty());
        assert_eq!(evaluated[0].variant, Variant::Conservative);
    }
}
