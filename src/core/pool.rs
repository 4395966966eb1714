use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::provider::{Backend, Cluster, Provider};
use crate::error::{Error, Result};

/// Pool accounting for one reusable cluster.
#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub cluster: Cluster,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub total_gpus: u32,
    pub available_gpus: u32,
    pub active_jobs: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PoolStats {
    pub clusters: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub total_gpus: u32,
    pub available_gpus: u32,
    pub active_jobs: u32,
}

/// Placeholder sizing used by scale-up until the provisioner reports
/// real instance counts.
const GPUS_PER_PLACEHOLDER_CLUSTER: u32 = 8;

/// Shared compute fabric reused across jobs. All accounting happens
/// under one mutex; actual provisioning/termination of the underlying
/// instances is the external provisioner's business.
pub struct ClusterPool {
    entries: Mutex<HashMap<String, PoolEntry>>,
    min_size: usize,
    max_size: usize,
}

impl ClusterPool {
    pub fn new(min_size: usize, max_size: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            min_size,
            max_size,
        }
    }

    /// Adopt a provisioned cluster into the pool.
    pub fn insert(&self, cluster: Cluster) {
        let now = Utc::now();
        let total = cluster.total_gpus();
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            cluster.id.clone(),
            PoolEntry {
                cluster,
                created_at: now,
                last_used_at: now,
                total_gpus: total,
                available_gpus: total,
                active_jobs: 0,
            },
        );
    }

    pub fn get(&self, cluster_id: &str) -> Option<PoolEntry> {
        self.entries.lock().unwrap().get(cluster_id).cloned()
    }

    /// Best cluster able to host `gpus`: maximizes available-capacity
    /// ratio × recency, where recency decays as 1/(1 + idle hours).
    pub fn get_best(&self, gpus: u32) -> Option<Cluster> {
        let entries = self.entries.lock().unwrap();
        let now = Utc::now();
        let mut best: Option<(&PoolEntry, f64)> = None;
        for entry in entries.values() {
            // Placeholders from scale-up have no nodes yet; they are
            // capacity on order, not capacity to hand out.
            if entry.cluster.nodes.is_empty() {
                continue;
            }
            if entry.available_gpus < gpus || entry.total_gpus == 0 {
                continue;
            }
            let utilization_available = entry.available_gpus as f64 / entry.total_gpus as f64;
            let idle_hours = (now - entry.last_used_at).num_seconds().max(0) as f64 / 3600.0;
            let recency = 1.0 / (1.0 + idle_hours);
            let score = utilization_available * recency;
            let better = match best {
                Some((_, best_score)) => score > best_score,
                None => true,
            };
            if better {
                best = Some((entry, score));
            }
        }
        best.map(|(entry, _)| entry.cluster.clone())
    }

    /// Atomically take `gpus` from a cluster, bumping its job count and
    /// recency.
    pub fn reserve(&self, cluster_id: &str, gpus: u32) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(cluster_id)
            .ok_or_else(|| Error::capacity(format!("cluster {cluster_id} not in pool")))?;
        if entry.available_gpus < gpus {
            return Err(Error::capacity(format!(
                "cluster {cluster_id}: need {gpus} GPUs, {} available",
                entry.available_gpus
            )));
        }
        entry.available_gpus -= gpus;
        entry.active_jobs += 1;
        entry.last_used_at = Utc::now();
        Ok(())
    }

    /// Inverse of [`Self::reserve`]; job count floors at zero and
    /// capacity is capped at the cluster's size.
    pub fn release(&self, cluster_id: &str, gpus: u32) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(cluster_id)
            .ok_or_else(|| Error::capacity(format!("cluster {cluster_id} not in pool")))?;
        entry.available_gpus = (entry.available_gpus + gpus).min(entry.total_gpus);
        entry.active_jobs = entry.active_jobs.saturating_sub(1);
        Ok(())
    }

    /// Grow the pool for `demand` queued jobs: add max(1, demand/8)
    /// placeholder entries, bounded by max_size. Returns the ids of the
    /// new entries so the caller can hand them to the provisioner.
    pub fn scale_up(&self, demand: usize) -> Result<Vec<String>> {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.max_size {
            return Err(Error::capacity(format!(
                "pool at max size {}",
                self.max_size
            )));
        }
        let want = (demand / 8).max(1);
        let room = self.max_size - entries.len();
        let adding = want.min(room);

        let mut ids = Vec::with_capacity(adding);
        let now = Utc::now();
        for _ in 0..adding {
            let id = format!("pool-{}", uuid::Uuid::new_v4());
            entries.insert(
                id.clone(),
                PoolEntry {
                    cluster: Cluster {
                        id: id.clone(),
                        provider: Provider::Onprem,
                        region: String::new(),
                        vpc: String::new(),
                        backend: Backend::Vm,
                        nodes: vec![],
                    },
                    created_at: now,
                    last_used_at: now,
                    total_gpus: GPUS_PER_PLACEHOLDER_CLUSTER,
                    available_gpus: GPUS_PER_PLACEHOLDER_CLUSTER,
                    active_jobs: 0,
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    /// Drop clusters with no active jobs that have been idle past
    /// `idle`, never going below min_size. Returns the removed clusters
    /// so the caller can request termination.
    pub fn scale_down(&self, idle: Duration) -> Vec<Cluster> {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() <= self.min_size {
            return vec![];
        }
        let now = Utc::now();
        let mut idle_ids: Vec<String> = entries
            .values()
            .filter(|e| {
                e.active_jobs == 0
                    && (now - e.last_used_at).num_seconds() >= idle.as_secs() as i64
            })
            .map(|e| e.cluster.id.clone())
            .collect();
        idle_ids.sort();

        let removable = entries.len() - self.min_size;
        idle_ids.truncate(removable);

        idle_ids
            .into_iter()
            .filter_map(|id| entries.remove(&id).map(|e| e.cluster))
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        let entries = self.entries.lock().unwrap();
        PoolStats {
            clusters: entries.len(),
            min_size: self.min_size,
            max_size: self.max_size,
            total_gpus: entries.values().map(|e| e.total_gpus).sum(),
            available_gpus: entries.values().map(|e| e.available_gpus).sum(),
            active_jobs: entries.values().map(|e| e.active_jobs).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::provider::Node;

    fn cluster(id: &str, gpus_per_node: u32, nodes: usize) -> Cluster {
        Cluster {
            id: id.to_string(),
            provider: Provider::Aws,
            region: "us-east-1".into(),
            vpc: "vpc-1".into(),
            backend: Backend::Vm,
            nodes: (0..nodes)
                .map(|i| Node {
                    id: format!("{id}-node-{i}"),
                    instance_id: format!("i-{id}{i}"),
                    provider: Provider::Aws,
                    region: "us-east-1".into(),
                    vpc: "vpc-1".into(),
                    private_ip: format!("10.0.1.{}", i + 10),
                    gpus: gpus_per_node,
                    gpu_type: "A100".into(),
                    gpu_memory_gb: 40,
                })
                .collect(),
        }
    }

    #[test]
    fn test_reserve_and_release_accounting() {
        let pool = ClusterPool::new(0, 8);
        pool.insert(cluster("c1", 8, 1));

        pool.reserve("c1", 4).unwrap();
        let entry = pool.get("c1").unwrap();
        assert_eq!(entry.available_gpus, 4);
        assert_eq!(entry.active_jobs, 1);

        // over-reservation fails and leaves state untouched
        let err = pool.reserve("c1", 6).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Capacity);
        assert_eq!(pool.get("c1").unwrap().available_gpus, 4);

        pool.release("c1", 4).unwrap();
        let entry = pool.get("c1").unwrap();
        assert_eq!(entry.available_gpus, 8);
        assert_eq!(entry.active_jobs, 0);

        // release never exceeds capacity nor goes below zero jobs
        pool.release("c1", 4).unwrap();
        let entry = pool.get("c1").unwrap();
        assert_eq!(entry.available_gpus, 8);
        assert_eq!(entry.active_jobs, 0);
    }

    #[test]
    fn test_get_best_prefers_free_capacity() {
        let pool = ClusterPool::new(0, 8);
        pool.insert(cluster("busy", 8, 2));
        pool.insert(cluster("free", 8, 2));
        pool.reserve("busy", 12).unwrap();

        let best = pool.get_best(4).unwrap();
        assert_eq!(best.id, "free");

        // nothing fits 32 GPUs
        assert!(pool.get_best(32).is_none());
    }

    #[test]
    fn test_scale_up_bounded_by_max() {
        let pool = ClusterPool::new(0, 3);
        let added = pool.scale_up(40).unwrap();
        // 40/8 = 5 wanted, capped at max_size 3
        assert_eq!(added.len(), 3);
        assert_eq!(pool.stats().clusters, 3);

        let err = pool.scale_up(1).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Capacity);
    }

    #[test]
    fn test_scale_up_minimum_one() {
        let pool = ClusterPool::new(0, 8);
        let added = pool.scale_up(1).unwrap();
        assert_eq!(added.len(), 1);
    }

    #[test]
    fn test_scale_down_respects_min_and_activity() {
        let pool = ClusterPool::new(1, 8);
        pool.insert(cluster("idle-1", 8, 1));
        pool.insert(cluster("idle-2", 8, 1));
        pool.insert(cluster("active", 8, 1));
        pool.reserve("active", 2).unwrap();

        let removed = pool.scale_down(Duration::from_secs(0));
        let removed_ids: Vec<&str> = removed.iter().map(|c| c.id.as_str()).collect();
        // the active cluster survives, and min_size keeps one more
        assert_eq!(removed.len(), 2);
        assert!(!removed_ids.contains(&"active"));
        assert_eq!(pool.stats().clusters, 1);
    }

    #[test]
    fn test_scale_down_keeps_recently_used() {
        let pool = ClusterPool::new(0, 8);
        pool.insert(cluster("fresh", 8, 1));
        let removed = pool.scale_down(Duration::from_secs(3600));
        assert!(removed.is_empty());
    }

    #[test]
    fn test_stats_aggregate() {
        let pool = ClusterPool::new(0, 8);
        pool.insert(cluster("a", 8, 1));
        pool.insert(cluster("b", 8, 2));
        pool.reserve("b", 8).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.clusters, 2);
        assert_eq!(stats.total_gpus, 24);
        assert_eq!(stats.available_gpus, 16);
        assert_eq!(stats.active_jobs, 1);
    }
}
