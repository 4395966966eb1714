//! Allocation optimizer: candidate filtering, strategy generation, and
//! scoring over the priced candidate set.

pub mod filter;
pub mod score;
pub mod strategy;

pub use score::{ScoredStrategy, ScoringContext};
pub use strategy::Strategy;

use crate::core::job::Job;
use crate::core::perf::PerformanceStore;
use crate::core::pricing::PricingCache;
use crate::core::provider::{Allocation, EgressTable, GpuInstance};
use crate::error::{Error, Result};

/// Ties the pipeline together: enumerate fresh candidates, filter,
/// generate strategies per execution mode, score, take the head.
pub struct Optimizer {
    cache: PricingCache,
    perf: PerformanceStore,
    egress: EgressTable,
    assumed_dataset_gb: f64,
}

impl Optimizer {
    pub fn new(cache: PricingCache, egress: EgressTable, assumed_dataset_gb: f64) -> Self {
        Self {
            cache,
            perf: PerformanceStore::new(),
            egress,
            assumed_dataset_gb,
        }
    }

    /// Select the best feasible plan for `job`, or fail with
    /// `infeasible_job` naming the blocking constraint.
    pub fn optimize(&self, job: &Job) -> Result<Vec<Allocation>> {
        let candidates = self.cache.fresh_instances()?;
        self.optimize_with_candidates(job, candidates)
    }

    /// Pure core of [`Self::optimize`]: same inputs, same plan, always.
    pub fn optimize_with_candidates(
        &self,
        job: &Job,
        candidates: Vec<GpuInstance>,
    ) -> Result<Vec<Allocation>> {
        let requirements = &job.requirements;
        let constraints = &job.constraints;

        let filtered = filter::filter_candidates(candidates, requirements, constraints);
        if filtered.is_empty() {
            return Err(Error::infeasible(
                "no instance type satisfies the resource and topology requirements",
            ));
        }

        let strategies = strategy::generate_strategies(
            &filtered,
            requirements,
            constraints,
            job.selected_backend,
        );
        let ctx = ScoringContext::new(&self.egress, self.assumed_dataset_gb, &filtered);
        let scored = score::score_strategies(strategies, requirements, constraints, &ctx);

        match scored.into_iter().next() {
            Some(best) if best.score.is_finite() => {
                let cost_per_step = self.estimated_cost_per_step(job, &filtered, &best);
                tracing::debug!(
                    job_id = %job.id,
                    total_cost = best.total_cost,
                    reliability = best.reliability,
                    score = best.score,
                    cost_per_step,
                    "optimizer selected plan"
                );
                Ok(best.strategy.allocations)
            }
            Some(best) => Err(Error::infeasible(
                best.blocking_constraint
                    .unwrap_or_else(|| "no feasible strategy".to_string()),
            )),
            None => Err(Error::infeasible("no strategy generated")),
        }
    }

    /// $/step for the chosen plan against the benchmark table, using the
    /// GPU type of the plan's first instance.
    fn estimated_cost_per_step(
        &self,
        job: &Job,
        candidates: &[GpuInstance],
        best: &ScoredStrategy,
    ) -> f64 {
        let Some(first) = best.strategy.allocations.first() else {
            return 0.0;
        };
        let gpu_type = candidates
            .iter()
            .find(|c| c.sort_key() == first.sort_key())
            .map(|c| c.gpu_type.as_str())
            .unwrap_or("A100");
        let metrics = self
            .perf
            .metrics(job.requirements.framework, gpu_type, "resnet50");
        crate::core::cost::cost_per_step(&best.strategy.allocations, &metrics)
    }
}
