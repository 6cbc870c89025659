use super::{
    Adjustment, BASE_FEASIBILITY, RemediationOption, RemediationStrategy, StrategyContext,
    StrategyKind, Variant, band_factor, importance_factor, money, variant_magnitudes,
};
use crate::core::config::PriorityConfig;
use crate::core::gap::GapResult;
use crate::core::types::{Goal, Importance};

/// Reprioritize: redirect part of the contributions of less important goals
/// to this one, or defer this goal when it is not a top priority.
#[derive(Debug, Clone, Default)]
pub struct PriorityAdjustment {
    config: PriorityConfig,
}

impl PriorityAdjustment {
    pub fn new(config: PriorityConfig) -> Self {
        Self { config }
    }

    fn donors<'a>(&self, gap: &GapResult, others: &'a [Goal], above: Importance) -> Vec<&'a Goal> {
        // Importance orders High < Medium < Low
        others
            .iter()
            .filter(|g| g.id != gap.goal_id && g.importance > above && g.monthly_contribution > 0.0)
            .collect()
    }

    fn redirect_options(
        &self,
        gap: &GapResult,
        ctx: &StrategyContext<'_>,
    ) -> Vec<RemediationOption> {
        let new_importance = gap.importance.raised();
        let donors = self.donors(gap, ctx.other_goals, new_importance);
        let donor_total: f64 = donors.iter().map(|g| g.monthly_contribution).sum();
        let pool = donor_total * self.config.max_reallocation_fraction;
        if pool <= 0.0 {
            return Vec::new();
        }
        let donor_ids: Vec<String> = donors.iter().map(|g| g.id.clone()).collect();
        let optimal =
            (gap.required_monthly - gap.monthly_contribution).max(0.0) * self.config.factor;

        variant_magnitudes(optimal, 0.0, pool)
            .into_iter()
            .map(|(variant, redirected)| {
                let new_monthly = gap.monthly_contribution + redirected;
                let projected = ctx.project(gap, new_monthly, gap.available_months);
                let remaining_gap = (gap.target_amount - projected).max(0.0);
                RemediationOption::new(
                    StrategyKind::Priority,
                    variant,
                    &gap.goal_id,
                    format!(
                        "Redirect {} per month from {} lower-priority goal(s)",
                        money(redirected),
                        donor_ids.len()
                    ),
                    Adjustment::Priority {
                        new_importance,
                        redirected_monthly: redirected,
                        donor_goal_ids: donor_ids.clone(),
                        deferral_months: None,
                    },
                )
                .with_metric("redirected_monthly", redirected)
                .with_metric("donor_share", redirected / donor_total)
                .with_metric("donor_count", donor_ids.len() as f64)
                .with_metric("projected_amount", projected)
                .with_metric("remaining_gap", remaining_gap)
                .with_metric("gap_reduction", gap.gap_amount - remaining_gap)
                .with_steps([
                    format!("Mark '{}' as a {:?} priority goal", gap.goal_title, new_importance),
                    format!(
                        "Reduce contributions to {} by {} per month in total",
                        donor_ids.join(", "),
                        money(redirected)
                    ),
                    format!("Add the freed {} to this goal's monthly transfer", money(redirected)),
                ])
            })
            .collect()
    }

    fn deferral_option(&self, gap: &GapResult) -> Option<RemediationOption> {
        if gap.importance == Importance::High {
            return None;
        }
        let months = self.config.deferral_months;
        Some(
            RemediationOption::new(
                StrategyKind::Priority,
                Variant::Conservative,
                &gap.goal_id,
                format!("Lower the priority of this goal and defer it by {months} months"),
                Adjustment::Priority {
                    new_importance: gap.importance.lowered(),
                    redirected_monthly: 0.0,
                    donor_goal_ids: Vec::new(),
                    deferral_months: Some(months),
                },
            )
            .with_metric("deferral_months", months as f64)
            .with_metric("redirected_monthly", 0.0)
            .with_steps([
                format!("Pause new commitments to '{}'", gap.goal_title),
                format!("Move its target date out by {months} months"),
                "Put the freed capacity toward higher-priority goals".to_string(),
            ]),
        )
    }
}

impl RemediationStrategy for PriorityAdjustment {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Priority
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
        let mut options = self.redirect_options(gap, ctx);
        options.extend(self.deferral_option(gap));
        options
    }

    fn score_feasibility(
        &self,
        option: &RemediationOption,
        gap: &GapResult,
        _ctx: &StrategyContext<'_>,
    ) -> f64 {
        match &option.adjustment {
            Adjustment::Priority {
                deferral_months: Some(_),
                ..
            } => {
                let importance = importance_factor(gap.importance, 0.4, 1.4);
                let category = if gap.category.is_security_goal() { 0.5 } else { 1.0 };
                BASE_FEASIBILITY * importance * category
            }
            _ => {
                let share = option.metric("donor_share").unwrap_or(1.0);
                let size = band_factor(share, [0.15, 0.30, 0.50]);
                let importance = importance_factor(gap.importance, 1.3, 0.8);
                let spread = if option.metric("donor_count").unwrap_or(0.0) >= 2.0 {
                    1.1
                } else {
                    1.0
                };
                BASE_FEASIBILITY * size * importance * spread
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::core::market::MarketAssumptions;

    fn other(id: &str, importance: Importance, monthly: f64) -> Goal {
        let mut g = goal();
        g.id = id.to_string();
        g.importance = importance;
        g.monthly_contribution = monthly;
        g
    }

    #[test]
    fn redirects_only_from_less_important_goals() {
        let goal = goal();
        let profile = profile();
        let assumptions = MarketAssumptions::default();
        let others = vec![
            other("trip", Importance::Low, 4_000.0),
            other("car", Importance::Medium, 6_000.0),
            other("retire", Importance::High, 20_000.0),
        ];
        let gap = gap_for(&goal, &profile);
        let strategy = PriorityAdjustment::default();
        let options = strategy.generate_options(&gap, &ctx(&goal, &profile, &others, &assumptions));

        let redirects: Vec<&RemediationOption> = options
            .iter()
            .filter(|o| o.metric("redirected_monthly").unwrap_or(0.0) > 0.0)
            .collect();
        assert!(!redirects.is_empty());
        for option in &redirects {
            let Adjustment::Priority {
                new_importance,
                redirected_monthly,
                donor_goal_ids,
                ..
            } = &option.adjustment
            else {
                panic!("unexpected adjustment");
            };
            assert_eq!(*new_importance, Importance::High);
            assert_eq!(donor_goal_ids, &vec!["trip".to_string(), "car".to_string()]);
            // half of 10_000 at most
            assert!(*redirected_monthly <= 5_000.0 + 1e-9);
        }
        assert!(options.iter().any(|o| o.metric("deferral_months").is_some()));
    }

    #[test]
    fn high_importance_goals_are_never_deferred() {
        let mut goal = goal();
        goal.importance = Importance::High;
        let profile = profile();
        let assumptions = MarketAssumptions::default();
        let gap = gap_for(&goal, &profile);
        let strategy = PriorityAdjustment::default();
        let options = strategy.generate_options(&gap, &ctx(&goal, &profile, &[], &assumptions));
        assert!(options.is_empty());
    }

    #[test]
    fn low_importance_deferral_scores_well() {
        let mut goal = goal();
        goal.importance = Importance::Low;
        let profile = profile();
        let assumptions = MarketAssumptions::default();
        let gap = gap_for(&goal, &profile);
        let c = ctx(&goal, &profile, &[], &assumptions);
        let strategy = PriorityAdjustment::default();
        let best = strategy.recommend_best_option(&gap, &c).expect("deferral");
        assert_eq!(best.metric("deferral_months"), Some(24.0));
        assert!((best.feasibility_score - 0.7).abs() < 1e-9);
    }
}
