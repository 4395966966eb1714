use std::collections::HashMap;

use crate::core::cost;
use crate::core::job::{JobConstraints, JobRequirements};
use crate::core::optimizer::strategy::Strategy;
use crate::core::provider::{DatasetLocation, EgressTable, GpuInstance};

/// Interruption proxy applied to spot capacity with no cache-reported
/// rate: 10%/hour.
const DEFAULT_SPOT_INTERRUPTION_RATE: f64 = 0.1;
const RELIABILITY_PENALTY_WEIGHT: f64 = 0.2;

/// A strategy reduced to one comparable score. Lower wins; infeasible
/// strategies carry `f64::INFINITY` and name the blocking constraint.
#[derive(Debug, Clone)]
pub struct ScoredStrategy {
    pub strategy: Strategy,
    pub total_cost: f64,
    pub data_transfer_cost: f64,
    pub reliability: f64,
    pub score: f64,
    pub blocking_constraint: Option<String>,
}

/// Tunables shared by every scoring pass.
pub struct ScoringContext<'a> {
    pub egress: &'a EgressTable,
    /// Dataset size assumption for egress estimation, in GB.
    pub assumed_dataset_gb: f64,
    /// (provider, region, instance_type) → interruption_rate, built from
    /// the candidate set.
    pub interruption_rates: HashMap<(String, String, String), f64>,
}

impl<'a> ScoringContext<'a> {
    pub fn new(
        egress: &'a EgressTable,
        assumed_dataset_gb: f64,
        candidates: &[GpuInstance],
    ) -> Self {
        let interruption_rates = candidates
            .iter()
            .filter_map(|i| i.interruption_rate.map(|rate| (i.sort_key(), rate)))
            .collect();
        Self {
            egress,
            assumed_dataset_gb,
            interruption_rates,
        }
    }
}

/// Score and sort strategies ascending. Ties go to the lower raw cost,
/// then to the lexicographically smaller allocation key, which keeps
/// replays deterministic.
pub fn score_strategies(
    strategies: Vec<Strategy>,
    requirements: &JobRequirements,
    constraints: &JobConstraints,
    ctx: &ScoringContext<'_>,
) -> Vec<ScoredStrategy> {
    let mut scored: Vec<ScoredStrategy> = strategies
        .into_iter()
        .map(|s| score_one(s, requirements, constraints, ctx))
        .collect();
    scored.sort_by(|a, b| {
        a.score
            .total_cmp(&b.score)
            .then_with(|| a.total_cost.total_cmp(&b.total_cost))
            .then_with(|| plan_key(&a.strategy).cmp(&plan_key(&b.strategy)))
    });
    scored
}

fn plan_key(strategy: &Strategy) -> Vec<(String, String, String)> {
    strategy.allocations.iter().map(|a| a.sort_key()).collect()
}

fn score_one(
    strategy: Strategy,
    requirements: &JobRequirements,
    constraints: &JobConstraints,
    ctx: &ScoringContext<'_>,
) -> ScoredStrategy {
    if strategy.is_empty() {
        return ScoredStrategy {
            strategy,
            total_cost: 0.0,
            data_transfer_cost: 0.0,
            reliability: 0.0,
            score: f64::INFINITY,
            blocking_constraint: Some("no allocation covers the requested GPUs".to_string()),
        };
    }

    let total_cost = cost::cost(&strategy.allocations, requirements.estimated_hours);

    let data_transfer_cost = match DatasetLocation::parse(&requirements.dataset_uri) {
        Some(location) => strategy
            .allocations
            .iter()
            .map(|alloc| {
                cost::data_transfer_cost(
                    ctx.egress,
                    ctx.assumed_dataset_gb,
                    location.provider,
                    location.region.as_deref().unwrap_or(""),
                    alloc.provider,
                    &alloc.region,
                )
            })
            .sum(),
        None => 0.0,
    };

    // Weighted expected interruptions per hour across the plan. Spot
    // capacity uses the cache-reported rate where present, the proxy
    // constant otherwise; on-demand contributes none.
    let total_count: u32 = strategy.allocations.iter().map(|a| a.count).sum();
    let weighted_rate: f64 = strategy
        .allocations
        .iter()
        .filter(|a| a.spot)
        .map(|a| {
            let rate = ctx
                .interruption_rates
                .get(&a.sort_key())
                .copied()
                .unwrap_or(DEFAULT_SPOT_INTERRUPTION_RATE);
            rate * a.count as f64
        })
        .sum();
    let reliability = if total_count == 0 {
        0.0
    } else {
        (1.0 - weighted_rate / total_count as f64).clamp(0.0, 1.0)
    };

    let cost_weight = 1.0 - constraints.performance_weight;
    let normalized_cost = (total_cost + data_transfer_cost) / constraints.max_budget;
    let mut score = cost_weight * normalized_cost + (1.0 - reliability) * RELIABILITY_PENALTY_WEIGHT;

    let mut blocking_constraint = None;
    if total_cost + data_transfer_cost > constraints.max_budget {
        score = f64::INFINITY;
        blocking_constraint = Some(format!(
            "cost {:.2} exceeds budget {:.2}",
            total_cost + data_transfer_cost,
            constraints.max_budget
        ));
    } else if reliability < constraints.min_reliability {
        score = f64::INFINITY;
        blocking_constraint = Some(format!(
            "reliability {:.2} below floor {:.2}",
            reliability, constraints.min_reliability
        ));
    }

    ScoredStrategy {
        strategy,
        total_cost,
        data_transfer_cost,
        reliability,
        score,
        blocking_constraint,
    }
}
