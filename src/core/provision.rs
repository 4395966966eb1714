use crate::core::job::Job;
use crate::core::launch::DistributedPlan;
use crate::core::provider::{Allocation, Backend, Cluster, Node};
use crate::error::{Error, Result};

/// Materializes allocations into a cluster of reachable nodes. Real
/// implementations drive the cloud instance APIs; the control plane only
/// sees this contract.
pub trait Provisioner: Send + Sync {
    fn provision(&self, job: &Job, allocations: &[Allocation]) -> Result<Cluster>;
    fn terminate(&self, cluster: &Cluster) -> Result<()>;
}

/// Runs a job on a provisioned cluster and blocks until it finishes.
/// Real implementations ship the rendered launch script to the nodes.
pub trait JobExecutor: Send + Sync {
    fn run(&self, job: &Job, cluster: &Cluster, plan: &DistributedPlan) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobHealth {
    Healthy,
    Unhealthy(String),
}

/// Node/process health probe used by the monitor.
pub trait HealthProbe: Send + Sync {
    fn check(&self, job: &Job) -> Result<JobHealth>;
}

/// Dataset replication engine for the pre-stage / on-demand-cache
/// policies. No engine ships with the core; submitting a spec that
/// requires one without registering it is a validation error.
pub trait ReplicationEngine: Send + Sync {
    fn replicate(&self, job: &Job) -> Result<()>;
}

/// Always-healthy probe for deployments without node telemetry.
pub struct NoopHealthProbe;

impl HealthProbe for NoopHealthProbe {
    fn check(&self, _job: &Job) -> Result<JobHealth> {
        Ok(JobHealth::Healthy)
    }
}

/// In-process provisioner that fabricates ready clusters from the
/// allocation list. Single-cluster topology is enforced before any node
/// is built. Used by tests and local development; production wires a
/// real adapter.
pub struct StubProvisioner;

impl Provisioner for StubProvisioner {
    fn provision(&self, job: &Job, allocations: &[Allocation]) -> Result<Cluster> {
        let first = allocations
            .first()
            .ok_or_else(|| Error::provisioning("no allocations to provision"))?;
        if allocations
            .iter()
            .any(|a| a.provider != first.provider || a.region != first.region)
        {
            return Err(Error::topology(
                "allocations span providers/regions; one cluster cannot host them",
            ));
        }

        let cluster_id = format!("cluster-{}", job.id);
        let vpc = format!("vpc-{}", first.region);
        let mut nodes = Vec::new();
        for alloc in allocations {
            for _ in 0..alloc.count {
                let index = nodes.len();
                nodes.push(Node {
                    id: format!("node-{}-{index}", job.id),
                    instance_id: format!("i-{}", uuid::Uuid::new_v4().simple()),
                    provider: alloc.provider,
                    region: alloc.region.clone(),
                    vpc: vpc.clone(),
                    private_ip: format!("10.0.1.{}", index + 10),
                    gpus: 8,
                    gpu_type: "A100".to_string(),
                    gpu_memory_gb: 40,
                });
            }
        }
        Ok(Cluster {
            id: cluster_id,
            provider: first.provider,
            region: first.region.clone(),
            vpc,
            backend: Backend::Vm,
            nodes,
        })
    }

    fn terminate(&self, cluster: &Cluster) -> Result<()> {
        tracing::debug!(cluster_id = %cluster.id, "stub terminate");
        Ok(())
    }
}

/// Executor that reports immediate success without touching any node.
pub struct NoopExecutor;

impl JobExecutor for NoopExecutor {
    fn run(&self, _job: &Job, _cluster: &Cluster, _plan: &DistributedPlan) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::provider::Provider;

    fn alloc(provider: Provider, region: &str, count: u32) -> Allocation {
        Allocation {
            provider,
            region: region.into(),
            backend: Backend::Vm,
            instance_type: "p4d.24xlarge".into(),
            count,
            spot: false,
            price_per_hour: 32.77,
            estimated_hours: 1.0,
            estimated_cost: 32.77 * count as f64,
        }
    }

    #[test]
    fn test_stub_provisioner_builds_topology() {
        let job = Job::builder().name("p").owner("alice").build();
        let cluster = StubProvisioner
            .provision(&job, &[alloc(Provider::Aws, "us-east-1", 2)])
            .unwrap();
        assert_eq!(cluster.nodes.len(), 2);
        assert!(crate::core::launch::validate_cluster_topology(&cluster).is_ok());
    }

    #[test]
    fn test_stub_provisioner_rejects_cross_region() {
        let job = Job::builder().name("p").owner("alice").build();
        let err = StubProvisioner
            .provision(
                &job,
                &[
                    alloc(Provider::Aws, "us-east-1", 1),
                    alloc(Provider::Aws, "us-west-2", 1),
                ],
            )
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Topology);
    }
}
