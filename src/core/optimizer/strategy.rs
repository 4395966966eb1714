use std::collections::BTreeMap;

use crate::core::job::{DataLocality, ExecutionMode, JobConstraints, JobRequirements};
use crate::core::provider::{
    max_cluster_nodes, Allocation, Backend, DatasetLocation, GpuInstance, Provider,
};

/// A candidate plan. Empty allocations mean the strategy could not cover
/// the demand; the scorer disqualifies it.
#[derive(Debug, Clone, PartialEq)]
pub struct Strategy {
    pub allocations: Vec<Allocation>,
}

impl Strategy {
    pub fn empty() -> Self {
        Self {
            allocations: vec![],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    pub fn total_cost(&self, hours: f64) -> f64 {
        crate::core::cost::cost(&self.allocations, hours)
    }
}

/// Produce the closed set of candidate strategies for the job's
/// execution mode.
pub fn generate_strategies(
    candidates: &[GpuInstance],
    requirements: &JobRequirements,
    constraints: &JobConstraints,
    backend: Backend,
) -> Vec<Strategy> {
    match requirements.execution_mode {
        ExecutionMode::SingleCluster => {
            let mut strategies = vec![
                cheapest_single_region(candidates, requirements, constraints, backend),
                reliable_single_region(candidates, requirements, constraints, backend),
            ];
            if constraints.data_locality != DataLocality::Ignore {
                strategies.push(data_locality(candidates, requirements, constraints, backend));
            }
            strategies
        }
        ExecutionMode::MultiTask => vec![
            greedy(candidates, requirements, constraints, backend),
            geo_distributed(candidates, requirements, constraints, backend),
            hybrid_onprem_first(candidates, requirements, constraints, backend),
        ],
    }
}

/// The shared greedy allocator: walk candidates from cheapest per GPU,
/// take as many instances as the remaining demand needs, stop when
/// covered. Ties are broken by (provider, region, instance_type) so
/// replays are bit-identical.
pub fn greedy(
    candidates: &[GpuInstance],
    requirements: &JobRequirements,
    constraints: &JobConstraints,
    backend: Backend,
) -> Strategy {
    let mut sorted: Vec<&GpuInstance> = candidates.iter().collect();
    sorted.sort_by(|a, b| {
        a.price_per_gpu(constraints.allow_spot)
            .total_cmp(&b.price_per_gpu(constraints.allow_spot))
            .then_with(|| a.sort_key().cmp(&b.sort_key()))
    });

    let mut allocations = Vec::new();
    let mut remaining = requirements.gpus as i64;

    for instance in sorted {
        if remaining <= 0 {
            break;
        }
        if requirements.max_gpus_per_node > 0
            && instance.gpus_per_instance > requirements.max_gpus_per_node
        {
            continue;
        }
        let needed = (remaining as u32).div_ceil(instance.gpus_per_instance);
        if requirements.requires_multi_node && needed > max_cluster_nodes(instance.provider) {
            continue;
        }
        let (price, spot) = instance.effective_price(constraints.allow_spot);
        allocations.push(Allocation {
            provider: instance.provider,
            region: instance.region.clone(),
            backend,
            instance_type: instance.instance_type.clone(),
            count: needed,
            spot,
            price_per_hour: price,
            estimated_hours: requirements.estimated_hours,
            estimated_cost: price * needed as f64 * requirements.estimated_hours,
        });
        remaining -= (needed * instance.gpus_per_instance) as i64;
    }

    if remaining > 0 {
        return Strategy::empty();
    }
    Strategy { allocations }
}

/// Group candidates by (provider, region). BTreeMap keeps the iteration
/// order deterministic.
fn group_by_region(candidates: &[GpuInstance]) -> BTreeMap<(String, String), Vec<GpuInstance>> {
    let mut groups: BTreeMap<(String, String), Vec<GpuInstance>> = BTreeMap::new();
    for instance in candidates {
        groups
            .entry((instance.provider.to_string(), instance.region.clone()))
            .or_default()
            .push(instance.clone());
    }
    groups
}

/// Run the greedy allocator inside each (provider, region) group and keep
/// the cheapest complete plan. All allocations of the winner live in one
/// network domain by construction.
fn cheapest_per_region(
    candidates: &[GpuInstance],
    requirements: &JobRequirements,
    constraints: &JobConstraints,
    backend: Backend,
) -> Strategy {
    let mut best = Strategy::empty();
    let mut best_cost = f64::INFINITY;
    for (_, group) in group_by_region(candidates) {
        let plan = greedy(&group, requirements, constraints, backend);
        if plan.is_empty() {
            continue;
        }
        let plan_cost = plan.total_cost(requirements.estimated_hours);
        if plan_cost < best_cost {
            best_cost = plan_cost;
            best = plan;
        }
    }
    best
}

fn cheapest_single_region(
    candidates: &[GpuInstance],
    requirements: &JobRequirements,
    constraints: &JobConstraints,
    backend: Backend,
) -> Strategy {
    cheapest_per_region(candidates, requirements, constraints, backend)
}

/// Restrict to on-prem capacity or instances with high availability (a
/// proxy for on-demand), falling back to everything when that leaves no
/// candidates.
fn reliable_single_region(
    candidates: &[GpuInstance],
    requirements: &JobRequirements,
    constraints: &JobConstraints,
    backend: Backend,
) -> Strategy {
    let reliable: Vec<GpuInstance> = candidates
        .iter()
        .filter(|i| i.provider == Provider::Onprem || i.spot_availability.unwrap_or(1.0) >= 0.95)
        .cloned()
        .collect();
    let pool: &[GpuInstance] = if reliable.is_empty() {
        candidates
    } else {
        &reliable
    };
    cheapest_per_region(pool, requirements, constraints, backend)
}

/// Prefer compute where the dataset lives: exact (provider, region)
/// match first, then same provider, then anywhere.
fn data_locality(
    candidates: &[GpuInstance],
    requirements: &JobRequirements,
    constraints: &JobConstraints,
    backend: Backend,
) -> Strategy {
    let Some(location) = DatasetLocation::parse(&requirements.dataset_uri) else {
        return cheapest_per_region(candidates, requirements, constraints, backend);
    };

    let exact: Vec<GpuInstance> = candidates
        .iter()
        .filter(|i| {
            i.provider == location.provider
                && location.region.as_deref().map_or(true, |r| i.region == r)
        })
        .cloned()
        .collect();
    if !exact.is_empty() {
        let plan = cheapest_per_region(&exact, requirements, constraints, backend);
        if !plan.is_empty() {
            return plan;
        }
    }

    let same_provider: Vec<GpuInstance> = candidates
        .iter()
        .filter(|i| i.provider == location.provider)
        .cloned()
        .collect();
    if !same_provider.is_empty() {
        let plan = cheapest_per_region(&same_provider, requirements, constraints, backend);
        if !plan.is_empty() {
            return plan;
        }
    }

    cheapest_per_region(candidates, requirements, constraints, backend)
}

/// Spread tasks round-robin across every region that has capacity, one
/// allocation per region on its cheapest instance. The last region
/// absorbs the remainder. Regions are visited in lexicographic order so
/// the plan is deterministic.
fn geo_distributed(
    candidates: &[GpuInstance],
    requirements: &JobRequirements,
    constraints: &JobConstraints,
    backend: Backend,
) -> Strategy {
    let gpus_per_task = 1u32;
    let total_tasks = (requirements.gpus / gpus_per_task).max(1);

    let groups = group_by_region(candidates);
    if groups.is_empty() {
        return Strategy::empty();
    }
    // With fewer tasks than regions, use only the first `total_tasks`.
    let regions: Vec<_> = groups.into_iter().take(total_tasks as usize).collect();
    let region_count = regions.len() as u32;
    let base = (total_tasks / region_count).max(1);

    let mut allocations = Vec::new();
    for (index, (_, group)) in regions.iter().enumerate() {
        let tasks_here = if index as u32 == region_count - 1 {
            total_tasks - base * (region_count - 1)
        } else {
            base
        };

        let Some(cheapest) = group.iter().min_by(|a, b| {
            a.price_per_gpu(constraints.allow_spot)
                .total_cmp(&b.price_per_gpu(constraints.allow_spot))
                .then_with(|| a.sort_key().cmp(&b.sort_key()))
        }) else {
            continue;
        };

        let needed = (tasks_here * gpus_per_task).div_ceil(cheapest.gpus_per_instance);
        let (price, spot) = cheapest.effective_price(constraints.allow_spot);
        allocations.push(Allocation {
            provider: cheapest.provider,
            region: cheapest.region.clone(),
            backend,
            instance_type: cheapest.instance_type.clone(),
            count: needed,
            spot,
            price_per_hour: price,
            estimated_hours: requirements.estimated_hours,
            estimated_cost: price * needed as f64 * requirements.estimated_hours,
        });
    }
    Strategy { allocations }
}

/// Fill from on-prem capacity first; burst to the clouds only when the
/// on-prem fleet cannot cover the demand.
fn hybrid_onprem_first(
    candidates: &[GpuInstance],
    requirements: &JobRequirements,
    constraints: &JobConstraints,
    backend: Backend,
) -> Strategy {
    let (onprem, cloud): (Vec<GpuInstance>, Vec<GpuInstance>) = candidates
        .iter()
        .cloned()
        .partition(|i| i.provider == Provider::Onprem);

    if !onprem.is_empty() {
        let plan = greedy(&onprem, requirements, constraints, backend);
        if !plan.is_empty() {
            return plan;
        }
    }
    greedy(&cloud, requirements, constraints, backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::provider::{test_instance, InterconnectTier};

    fn requirements(gpus: u32, mode: ExecutionMode) -> JobRequirements {
        JobRequirements {
            gpus,
            execution_mode: mode,
            ..JobRequirements::default_training()
        }
    }

    fn spot_constraints() -> JobConstraints {
        JobConstraints {
            allow_spot: true,
            ..JobConstraints::defaults()
        }
    }

    #[test]
    fn test_greedy_covers_demand() {
        let req = requirements(8, ExecutionMode::SingleCluster);
        let candidates = vec![test_instance(Provider::Aws, "us-east-1", "p4d.24xlarge")];
        let plan = greedy(&candidates, &req, &spot_constraints(), Backend::Vm);
        assert_eq!(plan.allocations.len(), 1);
        assert_eq!(plan.allocations[0].count, 1);
        assert!(plan.allocations[0].spot);
        assert_eq!(plan.allocations[0].price_per_hour, 9.83);
        // completeness: counts × gpus_per_instance ≥ demand
        assert!(plan.allocations[0].count * 8 >= 8);
    }

    #[test]
    fn test_greedy_empty_when_demand_unmet() {
        let mut req = requirements(64, ExecutionMode::SingleCluster);
        req.requires_multi_node = true;
        req.max_gpus_per_node = 1;
        // only an 8-GPU instance available, too big per node
        let candidates = vec![test_instance(Provider::Aws, "us-east-1", "p4d.24xlarge")];
        let plan = greedy(&candidates, &req, &spot_constraints(), Backend::Vm);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_greedy_deterministic_tie_break() {
        let req = requirements(8, ExecutionMode::SingleCluster);
        // identical prices in two regions; lexicographically smaller wins
        let east = test_instance(Provider::Aws, "us-east-1", "p4d.24xlarge");
        let west = test_instance(Provider::Aws, "us-west-2", "p4d.24xlarge");
        let forward = greedy(
            &[east.clone(), west.clone()],
            &req,
            &spot_constraints(),
            Backend::Vm,
        );
        let reversed = greedy(&[west, east], &req, &spot_constraints(), Backend::Vm);
        assert_eq!(forward, reversed);
        assert_eq!(forward.allocations[0].region, "us-east-1");
    }

    #[test]
    fn test_cheapest_single_region_stays_in_one_domain() {
        let req = requirements(16, ExecutionMode::SingleCluster);
        let mut cheap_east = test_instance(Provider::Aws, "us-east-1", "p4d.24xlarge");
        cheap_east.spot_price = Some(8.0);
        let west = test_instance(Provider::Aws, "us-west-2", "p4d.24xlarge");

        let plan = cheapest_single_region(
            &[cheap_east, west],
            &req,
            &spot_constraints(),
            Backend::Vm,
        );
        assert!(!plan.is_empty());
        let first = &plan.allocations[0];
        assert!(plan
            .allocations
            .iter()
            .all(|a| a.provider == first.provider && a.region == first.region));
        assert_eq!(first.region, "us-east-1");
    }

    #[test]
    fn test_reliable_filters_low_availability() {
        let req = requirements(8, ExecutionMode::SingleCluster);
        let mut flaky = test_instance(Provider::Aws, "us-east-1", "p4d.24xlarge");
        flaky.spot_availability = Some(0.6);
        flaky.spot_price = Some(1.0);
        let mut solid = test_instance(Provider::Aws, "us-west-2", "p4d.24xlarge");
        solid.spot_availability = Some(0.99);

        let plan = reliable_single_region(
            &[flaky.clone(), solid],
            &req,
            &spot_constraints(),
            Backend::Vm,
        );
        assert_eq!(plan.allocations[0].region, "us-west-2");

        // fallback when nothing qualifies
        let plan = reliable_single_region(&[flaky], &req, &spot_constraints(), Backend::Vm);
        assert!(!plan.is_empty());
    }

    #[test]
    fn test_data_locality_prefers_dataset_region() {
        let mut req = requirements(8, ExecutionMode::SingleCluster);
        req.dataset_uri = "gs://datasets/corpus".into();
        let mut aws = test_instance(Provider::Aws, "us-east-1", "p4d.24xlarge");
        aws.spot_price = Some(1.0); // cheaper, but off-provider
        let gcp = test_instance(Provider::Gcp, "us-central1", "a2-highgpu-8g");

        let plan = data_locality(&[aws, gcp], &req, &spot_constraints(), Backend::Vm);
        assert_eq!(plan.allocations[0].provider, Provider::Gcp);
        assert_eq!(plan.allocations[0].region, "us-central1");
    }

    #[test]
    fn test_data_locality_falls_back_off_provider() {
        let mut req = requirements(8, ExecutionMode::SingleCluster);
        req.dataset_uri = "gs://datasets/corpus".into();
        let aws = test_instance(Provider::Aws, "us-east-1", "p4d.24xlarge");

        let plan = data_locality(&[aws], &req, &spot_constraints(), Backend::Vm);
        assert_eq!(plan.allocations[0].provider, Provider::Aws);
    }

    #[test]
    fn test_geo_distribution_covers_all_regions() {
        let req = requirements(9, ExecutionMode::MultiTask);
        let mut a = test_instance(Provider::Aws, "us-east-1", "g5.xlarge");
        a.gpus_per_instance = 1;
        let mut b = test_instance(Provider::Gcp, "us-central1", "a2-highgpu-1g");
        b.gpus_per_instance = 1;
        let mut c = test_instance(Provider::Azure, "eastus", "nc24ads");
        c.gpus_per_instance = 1;

        let plan = geo_distributed(&[a, b, c], &req, &spot_constraints(), Backend::Vm);
        assert_eq!(plan.allocations.len(), 3);
        // 9 tasks over 3 regions: 3 + 3 + remainder 3
        let total: u32 = plan.allocations.iter().map(|a| a.count).sum();
        assert_eq!(total, 9);
    }

    #[test]
    fn test_geo_distribution_fewer_tasks_than_regions() {
        let req = requirements(2, ExecutionMode::MultiTask);
        let mut a = test_instance(Provider::Aws, "us-east-1", "g5.xlarge");
        a.gpus_per_instance = 1;
        let mut b = test_instance(Provider::Gcp, "us-central1", "a2-highgpu-1g");
        b.gpus_per_instance = 1;
        let mut c = test_instance(Provider::Azure, "eastus", "nc24ads");
        c.gpus_per_instance = 1;

        let plan = geo_distributed(&[a, b, c], &req, &spot_constraints(), Backend::Vm);
        let total: u32 = plan.allocations.iter().map(|a| a.count).sum();
        assert_eq!(total, 2);
        assert_eq!(plan.allocations.len(), 2);
    }

    #[test]
    fn test_hybrid_prefers_onprem() {
        let req = requirements(8, ExecutionMode::MultiTask);
        let mut onprem = test_instance(Provider::Onprem, "dc-west", "dgx-a100");
        onprem.spot_price = None;
        onprem.on_demand_price = 50.0; // pricier, still preferred
        let cloud = test_instance(Provider::Aws, "us-east-1", "p4d.24xlarge");

        let plan = hybrid_onprem_first(&[onprem, cloud.clone()], &req, &spot_constraints(), Backend::Vm);
        assert_eq!(plan.allocations[0].provider, Provider::Onprem);

        // bursts to cloud when on-prem cannot cover
        let plan = hybrid_onprem_first(&[cloud], &req, &spot_constraints(), Backend::Vm);
        assert_eq!(plan.allocations[0].provider, Provider::Aws);
    }

    #[test]
    fn test_single_cluster_generates_locality_strategy_conditionally() {
        let mut req = requirements(8, ExecutionMode::SingleCluster);
        req.dataset_uri = "s3://bucket/data".into();
        let candidates = vec![test_instance(Provider::Aws, "us-east-1", "p4d.24xlarge")];

        let with = generate_strategies(&candidates, &req, &spot_constraints(), Backend::Vm);
        assert_eq!(with.len(), 3);

        let mut ignore = spot_constraints();
        ignore.data_locality = DataLocality::Ignore;
        let without = generate_strategies(&candidates, &req, &ignore, Backend::Vm);
        assert_eq!(without.len(), 2);
    }

    #[test]
    fn test_interconnect_untouched_by_greedy() {
        // greedy itself does not filter interconnect tiers; that belongs
        // to the candidate filter
        let mut req = requirements(8, ExecutionMode::SingleCluster);
        req.requires_multi_node = false;
        let mut standard = test_instance(Provider::Aws, "us-east-1", "p3.16xlarge");
        standard.interconnect = InterconnectTier::Standard;
        let plan = greedy(&[standard], &req, &spot_constraints(), Backend::Vm);
        assert!(!plan.is_empty());
    }
}
