use crate::core::job::{DataLocality, ExecutionMode, JobConstraints, JobRequirements};
use crate::core::provider::{max_cluster_nodes, DatasetLocation, GpuInstance, InterconnectTier};

/// Drop candidates that cannot host the job at all. Rules are applied in
/// order:
/// 1. per-GPU memory must cover the requirement
/// 2. instances must actually carry GPUs
/// 3. instances larger than max_gpus_per_node are excluded
/// 4. multi-node single-cluster jobs keep only high-tier interconnect
///    instances whose node count fits one network domain
///
/// When data locality is `required`, candidates are further restricted to
/// the dataset's provider; a soft `prefer` policy is handled by the
/// strategy generator instead.
pub fn filter_candidates(
    instances: Vec<GpuInstance>,
    requirements: &JobRequirements,
    constraints: &JobConstraints,
) -> Vec<GpuInstance> {
    let required_provider = if constraints.data_locality == DataLocality::Required {
        DatasetLocation::parse(&requirements.dataset_uri).map(|loc| loc.provider)
    } else {
        None
    };

    instances
        .into_iter()
        .filter(|i| i.memory_per_gpu_gb >= requirements.gpu_memory_gb)
        .filter(|i| i.gpus_per_instance > 0)
        .filter(|i| {
            requirements.max_gpus_per_node == 0
                || i.gpus_per_instance <= requirements.max_gpus_per_node
        })
        .filter(|i| {
            if requirements.execution_mode != ExecutionMode::SingleCluster
                || !requirements.requires_multi_node
            {
                return true;
            }
            let nodes_needed = requirements.gpus.div_ceil(i.gpus_per_instance);
            i.interconnect == InterconnectTier::High
                && nodes_needed <= max_cluster_nodes(i.provider)
        })
        .filter(|i| required_provider.map_or(true, |p| i.provider == p))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::JobRequirements;
    use crate::core::provider::{test_instance, Provider};

    fn requirements(gpus: u32) -> JobRequirements {
        JobRequirements {
            gpus,
            ..JobRequirements::default_training()
        }
    }

    #[test]
    fn test_memory_floor() {
        let mut small = test_instance(Provider::Aws, "us-east-1", "g4dn.xlarge");
        small.memory_per_gpu_gb = 16;
        let big = test_instance(Provider::Aws, "us-east-1", "p4d.24xlarge");

        let mut req = requirements(1);
        req.gpu_memory_gb = 32;
        let kept = filter_candidates(vec![small, big], &req, &JobConstraints::defaults());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].instance_type, "p4d.24xlarge");
    }

    #[test]
    fn test_max_gpus_per_node_bound() {
        let mut req = requirements(8);
        req.max_gpus_per_node = 4;
        let eight_gpu = test_instance(Provider::Aws, "us-east-1", "p4d.24xlarge");
        let mut four_gpu = test_instance(Provider::Aws, "us-east-1", "p3.8xlarge");
        four_gpu.gpus_per_instance = 4;

        let kept = filter_candidates(vec![eight_gpu, four_gpu], &req, &JobConstraints::defaults());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].gpus_per_instance, 4);
    }

    #[test]
    fn test_multi_node_requires_high_interconnect() {
        let mut req = requirements(16);
        req.requires_multi_node = true;

        let mut standard = test_instance(Provider::Aws, "us-east-1", "p3.16xlarge");
        standard.interconnect = InterconnectTier::Standard;
        let high = test_instance(Provider::Aws, "us-east-1", "p4d.24xlarge");

        let kept = filter_candidates(vec![standard, high], &req, &JobConstraints::defaults());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].instance_type, "p4d.24xlarge");
    }

    #[test]
    fn test_multi_node_respects_domain_size() {
        // 256 GPUs on 8-GPU instances needs 32 nodes: over AWS's 16-node
        // domain limit, inside GCP's 32.
        let mut req = requirements(256);
        req.requires_multi_node = true;

        let aws = test_instance(Provider::Aws, "us-east-1", "p4d.24xlarge");
        let gcp = test_instance(Provider::Gcp, "us-central1", "a2-highgpu-8g");
        let kept = filter_candidates(vec![aws, gcp], &req, &JobConstraints::defaults());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].provider, Provider::Gcp);
    }

    #[test]
    fn test_required_locality_restricts_provider() {
        let mut req = requirements(8);
        req.dataset_uri = "gs://datasets/x".into();
        let mut constraints = JobConstraints::defaults();
        constraints.data_locality = DataLocality::Required;

        let aws = test_instance(Provider::Aws, "us-east-1", "p4d.24xlarge");
        let gcp = test_instance(Provider::Gcp, "us-central1", "a2-highgpu-8g");
        let kept = filter_candidates(vec![aws, gcp], &req, &constraints);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].provider, Provider::Gcp);
    }
}
