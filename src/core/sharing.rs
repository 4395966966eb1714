use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::core::job::Job;
use crate::core::provider::Node;
use crate::error::{Error, Result};

/// One job's slice of a physical GPU.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobGpuAllocation {
    pub job_id: String,
    /// 1.0 for full-GPU and MIG-slot allocations.
    pub fraction: f64,
    pub memory_gb: u32,
    pub mig_instance: Option<String>,
}

/// Ledger row for one physical GPU.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuAllocation {
    pub gpu_id: String,
    pub node_id: String,
    pub gpu_type: String,
    pub total_memory_gb: u32,
    pub used_memory_gb: u32,
    pub mig_enabled: bool,
    pub mig_profile: Option<String>,
    pub time_slicing: bool,
    pub allocations: Vec<JobGpuAllocation>,
}

impl GpuAllocation {
    fn used_fraction(&self) -> f64 {
        self.allocations.iter().map(|a| a.fraction).sum()
    }
}

/// Per-GPU sharing manager: MIG partitions, time-sliced fractions, and
/// exclusive full-GPU reservations, with capacity invariants enforced at
/// every mutation. Per GPU: Σ fractions ≤ 1.0, Σ memory ≤ total, and MIG
/// never mixes with non-MIG.
pub struct GpuSharingManager {
    allocations: Mutex<HashMap<String, GpuAllocation>>,
}

impl GpuSharingManager {
    pub fn new() -> Self {
        Self {
            allocations: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate GPU capacity for `job` on `node`, dispatching on the
    /// job's sharing requirements. The first GPU on the node with room
    /// hosts the job.
    pub fn allocate(&self, job: &Job, node: &Node) -> Result<GpuAllocation> {
        if job.requirements.use_mig {
            self.allocate_mig(job, node)
        } else if job.requirements.gpu_fraction < 1.0 {
            self.allocate_fractional(job, node)
        } else {
            self.allocate_full(job, node)
        }
    }

    fn allocate_mig(&self, job: &Job, node: &Node) -> Result<GpuAllocation> {
        let profile = job
            .requirements
            .mig_profile
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::validation("MIG allocation requires a mig_profile"))?;
        if !mig_capable(&node.gpu_type) {
            return Err(Error::capacity(format!(
                "GPU type {} does not support MIG",
                node.gpu_type
            )));
        }
        if !mig_profiles(&node.gpu_type).iter().any(|p| *p == profile) {
            return Err(Error::validation(format!(
                "profile {profile} not offered by {}",
                node.gpu_type
            )));
        }
        let profile_memory = mig_profile_memory_gb(profile)?;

        let mut ledger = self.allocations.lock().unwrap();
        for index in 0..node.gpus.max(1) {
            let gpu_id = gpu_id(node, index);
            let entry = ledger.entry(gpu_id.clone()).or_insert_with(|| GpuAllocation {
                gpu_id: gpu_id.clone(),
                node_id: node.id.clone(),
                gpu_type: node.gpu_type.clone(),
                total_memory_gb: node.gpu_memory_gb,
                used_memory_gb: 0,
                mig_enabled: true,
                mig_profile: Some(profile.to_string()),
                time_slicing: false,
                allocations: vec![],
            });
            // MIG and non-MIG never share a GPU, and one GPU carries one
            // profile at a time.
            if !entry.mig_enabled || entry.mig_profile.as_deref() != Some(profile) {
                continue;
            }
            if entry.used_memory_gb + profile_memory > entry.total_memory_gb {
                continue;
            }
            let slot = entry.allocations.len();
            entry.allocations.push(JobGpuAllocation {
                job_id: job.id.clone(),
                fraction: 1.0,
                memory_gb: profile_memory,
                mig_instance: Some(format!("MIG-{gpu_id}/{slot}")),
            });
            entry.used_memory_gb += profile_memory;
            tracing::debug!(job_id = %job.id, %gpu_id, profile, "allocated MIG slot");
            return Ok(entry.clone());
        }
        Err(Error::capacity(format!(
            "no MIG capacity for {profile} on node {}",
            node.id
        )))
    }

    fn allocate_fractional(&self, job: &Job, node: &Node) -> Result<GpuAllocation> {
        let fraction = job.requirements.gpu_fraction;
        let memory = job.requirements.gpu_memory_gb;

        let mut ledger = self.allocations.lock().unwrap();
        for index in 0..node.gpus.max(1) {
            let gpu_id = gpu_id(node, index);
            let entry = ledger.entry(gpu_id.clone()).or_insert_with(|| GpuAllocation {
                gpu_id: gpu_id.clone(),
                node_id: node.id.clone(),
                gpu_type: node.gpu_type.clone(),
                total_memory_gb: node.gpu_memory_gb,
                used_memory_gb: 0,
                mig_enabled: false,
                mig_profile: None,
                time_slicing: true,
                allocations: vec![],
            });
            if entry.mig_enabled || !entry.time_slicing {
                continue;
            }
            if entry.used_fraction() + fraction > 1.0 + f64::EPSILON {
                continue;
            }
            if entry.used_memory_gb + memory > entry.total_memory_gb {
                continue;
            }
            entry.allocations.push(JobGpuAllocation {
                job_id: job.id.clone(),
                fraction,
                memory_gb: memory,
                mig_instance: None,
            });
            entry.used_memory_gb += memory;
            tracing::debug!(job_id = %job.id, %gpu_id, fraction, "allocated GPU fraction");
            return Ok(entry.clone());
        }
        Err(Error::capacity(format!(
            "no GPU on node {} can host fraction {fraction} with {memory}GB",
            node.id
        )))
    }

    fn allocate_full(&self, job: &Job, node: &Node) -> Result<GpuAllocation> {
        let mut ledger = self.allocations.lock().unwrap();
        for index in 0..node.gpus.max(1) {
            let gpu_id = gpu_id(node, index);
            if ledger.contains_key(&gpu_id) {
                continue;
            }
            let entry = GpuAllocation {
                gpu_id: gpu_id.clone(),
                node_id: node.id.clone(),
                gpu_type: node.gpu_type.clone(),
                total_memory_gb: node.gpu_memory_gb,
                used_memory_gb: node.gpu_memory_gb,
                mig_enabled: false,
                mig_profile: None,
                time_slicing: false,
                allocations: vec![JobGpuAllocation {
                    job_id: job.id.clone(),
                    fraction: 1.0,
                    memory_gb: node.gpu_memory_gb,
                    mig_instance: None,
                }],
            };
            ledger.insert(gpu_id.clone(), entry.clone());
            tracing::debug!(job_id = %job.id, %gpu_id, "allocated full GPU");
            return Ok(entry);
        }
        Err(Error::capacity(format!(
            "no free GPU on node {} for exclusive use",
            node.id
        )))
    }

    /// Drop every slice held by `job_id`. GPUs whose last slice leaves
    /// are removed from the ledger entirely.
    pub fn release(&self, job_id: &str) -> Result<()> {
        let mut ledger = self.allocations.lock().unwrap();
        let mut touched = false;
        let mut empty: Vec<String> = vec![];
        for entry in ledger.values_mut() {
            let freed: u32 = entry
                .allocations
                .iter()
                .filter(|a| a.job_id == job_id)
                .map(|a| a.memory_gb)
                .sum();
            if freed == 0 && !entry.allocations.iter().any(|a| a.job_id == job_id) {
                continue;
            }
            entry.allocations.retain(|a| a.job_id != job_id);
            entry.used_memory_gb = entry.used_memory_gb.saturating_sub(freed);
            touched = true;
            if entry.allocations.is_empty() {
                empty.push(entry.gpu_id.clone());
            }
        }
        for gpu_id in empty {
            ledger.remove(&gpu_id);
        }
        if touched {
            Ok(())
        } else {
            Err(Error::capacity(format!(
                "no GPU allocation found for job {job_id}"
            )))
        }
    }

    /// Σ fractions on one GPU.
    pub fn utilization(&self, gpu_id: &str) -> Result<f64> {
        let ledger = self.allocations.lock().unwrap();
        ledger
            .get(gpu_id)
            .map(|e| e.used_fraction())
            .ok_or_else(|| Error::capacity(format!("GPU {gpu_id} not in ledger")))
    }

    pub fn snapshot(&self) -> Vec<GpuAllocation> {
        let ledger = self.allocations.lock().unwrap();
        let mut rows: Vec<GpuAllocation> = ledger.values().cloned().collect();
        rows.sort_by(|a, b| a.gpu_id.cmp(&b.gpu_id));
        rows
    }
}

impl Default for GpuSharingManager {
    fn default() -> Self {
        Self::new()
    }
}

fn gpu_id(node: &Node, index: u32) -> String {
    format!("gpu-{}-{index}", node.id)
}

/// MIG-capable GPU whitelist.
pub fn mig_capable(gpu_type: &str) -> bool {
    matches!(gpu_type, "A100" | "A30")
}

/// Profiles offered per GPU type.
pub fn mig_profiles(gpu_type: &str) -> Vec<&'static str> {
    match gpu_type {
        "A100" => vec!["1g.10gb", "2g.20gb", "3g.40gb", "7g.80gb"],
        "A30" => vec!["1g.6gb", "2g.12gb", "4g.24gb"],
        _ => vec![],
    }
}

/// Memory carried by a MIG profile, parsed from its "<n>g.<mem>gb" name.
fn mig_profile_memory_gb(profile: &str) -> Result<u32> {
    let (_, memory) = profile
        .split_once('.')
        .ok_or_else(|| Error::validation(format!("malformed MIG profile {profile}")))?;
    memory
        .strip_suffix("gb")
        .and_then(|m| m.parse::<u32>().ok())
        .ok_or_else(|| Error::validation(format!("malformed MIG profile {profile}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::JobRequirements;
    use crate::core::provider::Provider;

    fn node(gpus: u32, gpu_type: &str, memory: u32) -> Node {
        Node {
            id: "node-1".into(),
            instance_id: "i-123".into(),
            provider: Provider::Onprem,
            region: "dc-west".into(),
            vpc: "fabric-1".into(),
            private_ip: "10.0.1.10".into(),
            gpus,
            gpu_type: gpu_type.into(),
            gpu_memory_gb: memory,
        }
    }

    fn sharing_job(fraction: f64, memory: u32) -> Job {
        Job::builder()
            .name("shared")
            .owner("alice")
            .requirements(JobRequirements {
                gpu_fraction: fraction,
                gpu_memory_gb: memory,
                ..JobRequirements::default_training()
            })
            .build()
    }

    fn mig_job(profile: &str) -> Job {
        Job::builder()
            .name("mig")
            .owner("alice")
            .requirements(JobRequirements {
                use_mig: true,
                mig_profile: Some(profile.to_string()),
                ..JobRequirements::default_training()
            })
            .build()
    }

    #[test]
    fn test_fractional_ledger_rejects_oversubscription() {
        let manager = GpuSharingManager::new();
        let t4 = node(1, "T4", 16);

        let job_a = sharing_job(0.5, 8);
        let entry = manager.allocate(&job_a, &t4).unwrap();
        assert_eq!(entry.allocations.len(), 1);

        // 0.5 + 0.6 > 1.0: capacity error
        let job_b = sharing_job(0.6, 8);
        let err = manager.allocate(&job_b, &t4).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Capacity);

        // 0.5 + 0.5 fits
        let job_c = sharing_job(0.5, 8);
        let entry = manager.allocate(&job_c, &t4).unwrap();
        assert_eq!(entry.allocations.len(), 2);
        assert!((manager.utilization(&entry.gpu_id).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_fractional_memory_bound() {
        let manager = GpuSharingManager::new();
        let t4 = node(1, "T4", 16);

        manager.allocate(&sharing_job(0.25, 12), &t4).unwrap();
        // fraction fits, memory does not
        let err = manager.allocate(&sharing_job(0.25, 8), &t4).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Capacity);
    }

    #[test]
    fn test_full_gpu_requires_empty_device() {
        let manager = GpuSharingManager::new();
        let t4 = node(1, "T4", 16);

        manager.allocate(&sharing_job(0.5, 8), &t4).unwrap();
        let err = manager.allocate(&sharing_job(1.0, 16), &t4).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Capacity);

        // a second physical GPU can take the exclusive job
        let two_gpu = node(2, "T4", 16);
        let entry = manager.allocate(&sharing_job(1.0, 16), &two_gpu).unwrap();
        assert_eq!(entry.allocations[0].fraction, 1.0);
    }

    #[test]
    fn test_mig_allocation_and_capacity() {
        let manager = GpuSharingManager::new();
        let a100 = node(1, "A100", 80);

        let entry = manager.allocate(&mig_job("1g.10gb"), &a100).unwrap();
        assert!(entry.mig_enabled);
        assert_eq!(entry.allocations[0].memory_gb, 10);
        assert!(entry.allocations[0].mig_instance.is_some());

        // seven more 10GB slots fit on an 80GB device
        for _ in 0..7 {
            manager.allocate(&mig_job("1g.10gb"), &a100).unwrap();
        }
        let err = manager.allocate(&mig_job("1g.10gb"), &a100).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Capacity);
    }

    #[test]
    fn test_mig_rejects_incapable_gpu_and_bad_profile() {
        let manager = GpuSharingManager::new();
        let t4 = node(1, "T4", 16);
        let err = manager.allocate(&mig_job("1g.10gb"), &t4).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Capacity);

        let a100 = node(1, "A100", 80);
        let err = manager.allocate(&mig_job("9g.90gb"), &a100).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }

    #[test]
    fn test_mig_and_fractional_never_mix() {
        let manager = GpuSharingManager::new();
        let a100 = node(1, "A100", 80);

        manager.allocate(&mig_job("1g.10gb"), &a100).unwrap();
        let err = manager.allocate(&sharing_job(0.5, 10), &a100).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Capacity);
    }

    #[test]
    fn test_release_frees_and_cleans_up() {
        let manager = GpuSharingManager::new();
        let t4 = node(1, "T4", 16);

        let job_a = sharing_job(0.5, 8);
        let job_b = sharing_job(0.5, 8);
        let entry = manager.allocate(&job_a, &t4).unwrap();
        manager.allocate(&job_b, &t4).unwrap();

        manager.release(&job_a.id).unwrap();
        assert!((manager.utilization(&entry.gpu_id).unwrap() - 0.5).abs() < 1e-9);

        // last slice leaving deletes the ledger row
        manager.release(&job_b.id).unwrap();
        assert!(manager.utilization(&entry.gpu_id).is_err());

        let err = manager.release("no-such-job").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Capacity);
    }

    #[test]
    fn test_ledger_invariants_hold() {
        let manager = GpuSharingManager::new();
        let t4 = node(2, "T4", 16);
        for _ in 0..5 {
            // allocate until capacity errors; invariants must hold after
            let _ = manager.allocate(&sharing_job(0.4, 6), &t4);
        }
        for entry in manager.snapshot() {
            assert!(entry.used_fraction() <= 1.0 + 1e-9);
            assert!(entry.used_memory_gb <= entry.total_memory_gb);
        }
    }

    #[test]
    fn test_mig_profile_tables() {
        assert!(mig_capable("A100"));
        assert!(!mig_capable("V100"));
        assert_eq!(
            mig_profiles("A100"),
            vec!["1g.10gb", "2g.20gb", "3g.40gb", "7g.80gb"]
        );
        assert!(mig_profiles("T4").is_empty());
        assert_eq!(mig_profile_memory_gb("3g.40gb").unwrap(), 40);
        assert!(mig_profile_memory_gb("weird").is_err());
    }
}
