use crate::core::perf::PerformanceMetrics;
use crate::core::provider::{Allocation, EgressTable, Provider};

/// Restart overhead charged per expected spot interruption.
const RESTART_OVERHEAD_HOURS: f64 = 10.0 / 60.0;

/// Total cost of a plan over `hours`. Prices come off the allocations
/// themselves, captured at decision time, so reprocessing a job always
/// reproduces the original number.
pub fn cost(allocations: &[Allocation], hours: f64) -> f64 {
    allocations
        .iter()
        .map(|a| a.price_per_hour * a.count as f64 * hours)
        .sum()
}

/// Cost adjusted for spot interruptions, plus the resulting reliability.
/// Expected interruptions I = hours × rate; each one costs ten minutes
/// of the allocation; reliability = max(0, 1 − I/hours).
pub fn cost_with_reliability(
    allocations: &[Allocation],
    hours: f64,
    interruption_rate: f64,
) -> (f64, f64) {
    let base = cost(allocations, hours);
    if hours <= 0.0 {
        return (base, 1.0);
    }
    let expected_interruptions = hours * interruption_rate;
    let overhead_hours = expected_interruptions * RESTART_OVERHEAD_HOURS;
    let effective = base * (1.0 + overhead_hours / hours);
    let reliability = (1.0 - expected_interruptions / hours).max(0.0);
    (effective, reliability)
}

/// Dollars per training step; zero when throughput is unknown.
pub fn cost_per_step(allocations: &[Allocation], perf: &PerformanceMetrics) -> f64 {
    if perf.steps_per_hour <= 0.0 {
        return 0.0;
    }
    let hourly: f64 = allocations
        .iter()
        .map(|a| a.price_per_hour * a.count as f64)
        .sum();
    hourly / perf.steps_per_hour
}

/// Egress cost of moving `gb` between locations. Free inside one
/// provider+region; otherwise billed at the source provider's rate.
pub fn data_transfer_cost(
    egress: &EgressTable,
    gb: f64,
    src_provider: Provider,
    src_region: &str,
    dst_provider: Provider,
    dst_region: &str,
) -> f64 {
    if src_provider == dst_provider && src_region == dst_region {
        return 0.0;
    }
    egress.rate_per_gb(src_provider) * gb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::provider::Backend;

    fn alloc(price: f64, count: u32, spot: bool) -> Allocation {
        Allocation {
            provider: Provider::Aws,
            region: "us-east-1".into(),
            backend: Backend::Vm,
            instance_type: "p4d.24xlarge".into(),
            count,
            spot,
            price_per_hour: price,
            estimated_hours: 1.0,
            estimated_cost: price * count as f64,
        }
    }

    #[test]
    fn test_cost_sums_over_lines() {
        let plan = vec![alloc(9.83, 2, true), alloc(3.06, 1, false)];
        assert!((cost(&plan, 2.0) - (9.83 * 2.0 * 2.0 + 3.06 * 2.0)).abs() < 1e-9);
        assert_eq!(cost(&[], 5.0), 0.0);
    }

    #[test]
    fn test_reliability_decreases_with_rate() {
        let plan = vec![alloc(10.0, 1, true)];
        let (effective, reliability) = cost_with_reliability(&plan, 10.0, 0.1);
        // one expected interruption per 10h at 10%/h
        assert!((reliability - 0.9).abs() < 1e-9);
        assert!(effective > cost(&plan, 10.0));

        let (_, reliability) = cost_with_reliability(&plan, 10.0, 0.0);
        assert_eq!(reliability, 1.0);

        // rate so high the run never finishes cleanly
        let (_, reliability) = cost_with_reliability(&plan, 10.0, 2.0);
        assert_eq!(reliability, 0.0);
    }

    #[test]
    fn test_cost_per_step() {
        let plan = vec![alloc(12.0, 2, false)];
        let perf = PerformanceMetrics {
            steps_per_hour: 1200.0,
            ..PerformanceMetrics::default()
        };
        assert!((cost_per_step(&plan, &perf) - 0.02).abs() < 1e-9);

        let unknown = PerformanceMetrics::default();
        assert_eq!(cost_per_step(&plan, &unknown), 0.0);
    }

    #[test]
    fn test_data_transfer_free_in_place() {
        let egress = EgressTable::default();
        assert_eq!(
            data_transfer_cost(&egress, 100.0, Provider::Aws, "us-east-1", Provider::Aws, "us-east-1"),
            0.0
        );
        // cross-region same provider still pays egress
        let cross = data_transfer_cost(
            &egress,
            100.0,
            Provider::Aws,
            "us-east-1",
            Provider::Aws,
            "us-west-2",
        );
        assert!((cross - 9.0).abs() < 1e-9);
        // cross-provider billed at the source's rate
        let out = data_transfer_cost(
            &egress,
            100.0,
            Provider::Gcp,
            "us-central1",
            Provider::Aws,
            "us-east-1",
        );
        assert!((out - 12.0).abs() < 1e-9);
    }
}
