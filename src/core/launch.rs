use std::collections::HashMap;

use serde::Serialize;

use crate::core::job::{Framework, Job};
use crate::core::provider::Cluster;
use crate::error::{Error, Result};

const MASTER_PORT: u16 = 29500;

/// Rendezvous and per-worker environment for a distributed run. The
/// plan is data; turning it into a launch script is a collaborator's
/// job ([`LaunchRenderer`]), the core never concatenates scripts.
#[derive(Debug, Clone, Serialize)]
pub struct DistributedPlan {
    pub framework: Framework,
    pub master_addr: String,
    pub master_port: u16,
    pub world_size: usize,
    pub nodes: Vec<NodePlan>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodePlan {
    pub rank: usize,
    pub address: String,
    pub gpus: u32,
    pub env: HashMap<String, String>,
}

/// Renders a built plan into whatever the execution substrate runs.
/// One implementation per framework, registered by the embedder.
pub trait LaunchRenderer: Send + Sync {
    fn render(&self, plan: &DistributedPlan, job: &Job) -> Result<String>;
}

/// All nodes of a synchronous-training cluster must share one network
/// domain: provider, region, and VPC.
pub fn validate_cluster_topology(cluster: &Cluster) -> Result<()> {
    let first = cluster
        .nodes
        .first()
        .ok_or_else(|| Error::topology("cluster has no nodes"))?;
    for (index, node) in cluster.nodes.iter().enumerate() {
        if node.provider != first.provider {
            return Err(Error::topology(format!(
                "node {index} is on {}, expected {}",
                node.provider, first.provider
            )));
        }
        if node.region != first.region {
            return Err(Error::topology(format!(
                "node {index} is in {}, expected {}",
                node.region, first.region
            )));
        }
        if node.vpc != first.vpc {
            return Err(Error::topology(format!(
                "node {index} is in vpc {}, expected {}",
                node.vpc, first.vpc
            )));
        }
    }
    Ok(())
}

/// Build the distributed launch plan for `job` on `cluster`. Dispatches
/// on the framework variant; node 0 is always the rendezvous master.
pub fn build_plan(cluster: &Cluster, job: &Job) -> Result<DistributedPlan> {
    validate_cluster_topology(cluster)?;

    let framework = job.requirements.framework;
    let world_size = cluster.nodes.len();
    let master_addr = cluster.nodes[0].private_ip.clone();
    let total_gpus: u32 = cluster.nodes.iter().map(|n| n.gpus).sum();

    let nodes = cluster
        .nodes
        .iter()
        .enumerate()
        .map(|(rank, node)| NodePlan {
            rank,
            address: node.private_ip.clone(),
            gpus: node.gpus,
            env: node_env(framework, &master_addr, rank, world_size, node.gpus, total_gpus),
        })
        .collect();

    Ok(DistributedPlan {
        framework,
        master_addr,
        master_port: MASTER_PORT,
        world_size,
        nodes,
    })
}

fn node_env(
    framework: Framework,
    master_addr: &str,
    rank: usize,
    world_size: usize,
    node_gpus: u32,
    total_gpus: u32,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    let devices = (0..node_gpus)
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",");
    env.insert("CUDA_VISIBLE_DEVICES".to_string(), devices);

    match framework {
        Framework::PyTorchDdp => {
            env.insert("MASTER_ADDR".to_string(), master_addr.to_string());
            env.insert("MASTER_PORT".to_string(), MASTER_PORT.to_string());
            env.insert("WORLD_SIZE".to_string(), world_size.to_string());
            env.insert("RANK".to_string(), rank.to_string());
            env.insert("NCCL_SOCKET_IFNAME".to_string(), "eth0".to_string());
        }
        Framework::Horovod | Framework::HorovodElastic => {
            env.insert("HOROVOD_CONTROLLER".to_string(), "gloo".to_string());
            env.insert("HOROVOD_RANK".to_string(), rank.to_string());
            env.insert("HOROVOD_SIZE".to_string(), total_gpus.to_string());
            if framework == Framework::HorovodElastic {
                env.insert("HOROVOD_ELASTIC_MIN_NP".to_string(), node_gpus.to_string());
                env.insert("HOROVOD_ELASTIC_MAX_NP".to_string(), total_gpus.to_string());
            }
        }
        Framework::TfMultiWorker => {
            env.insert("TF_CONFIG".to_string(), String::new());
        }
    }
    env
}

/// TF_CONFIG carries the full worker roster; it depends on every node's
/// address, so it is filled in after the roster is known.
pub fn tf_config_json(plan: &DistributedPlan, rank: usize) -> Result<String> {
    let workers: Vec<String> = plan
        .nodes
        .iter()
        .map(|n| format!("{}:{}", n.address, plan.master_port))
        .collect();
    let config = serde_json::json!({
        "cluster": { "worker": workers },
        "task": { "type": "worker", "index": rank },
    });
    Ok(config.to_string())
}

/// Finalize a plan: frameworks whose env depends on the whole roster get
/// their placeholders resolved here.
pub fn finalize_plan(mut plan: DistributedPlan) -> Result<DistributedPlan> {
    if plan.framework == Framework::TfMultiWorker {
        let configs: Vec<String> = plan
            .nodes
            .iter()
            .map(|n| tf_config_json(&plan, n.rank))
            .collect::<Result<_>>()?;
        for (node, config) in plan.nodes.iter_mut().zip(configs) {
            node.env.insert("TF_CONFIG".to_string(), config);
        }
    }
    Ok(plan)
}
