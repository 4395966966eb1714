use chrono::DateTime;
use serde::Deserialize;

use crate::core::job::{
    DataLocality, ExecutionMode, Framework, Job, JobConstraints, JobRequirements, JobType,
    ReplicationPolicy,
};
use crate::core::provider::Backend;
use crate::error::{Error, Result};

/// The YAML job specification as submitted. The raw document is stored
/// verbatim on the job; these structs only exist to derive indexable
/// fields.
#[derive(Debug, Deserialize)]
struct JobSpec {
    job: JobSpecJob,
}

#[derive(Debug, Deserialize)]
struct JobSpecJob {
    #[serde(rename = "type")]
    job_type: JobType,
    framework: Framework,
    entrypoint: String,
    resources: JobSpecResources,
    #[serde(default)]
    data: JobSpecData,
    constraints: JobSpecConstraints,
    #[serde(default)]
    execution: JobSpecExecution,
}

#[derive(Debug, Deserialize)]
struct JobSpecResources {
    gpus: u32,
    gpu_fraction: Option<f64>,
    use_mig: Option<bool>,
    mig_profile: Option<String>,
    #[serde(default)]
    max_gpus_per_node: u32,
    #[serde(default)]
    requires_multi_node: bool,
    #[serde(default)]
    gpu_memory: String,
    #[serde(default)]
    cpu_memory: String,
    #[serde(default)]
    storage: String,
    estimated_hours: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct JobSpecData {
    #[serde(default)]
    dataset: String,
    locality: Option<DataLocality>,
    replication_policy: Option<ReplicationPolicy>,
}

#[derive(Debug, Deserialize)]
struct JobSpecConstraints {
    budget: f64,
    deadline: Option<String>,
    #[serde(default)]
    preferred_regions: Vec<String>,
    #[serde(default)]
    allow_spot: bool,
    min_reliability: Option<f64>,
    #[serde(default)]
    performance_weight: f64,
}

#[derive(Debug, Default, Deserialize)]
struct JobSpecExecution {
    mode: Option<ExecutionMode>,
    backend: Option<Backend>,
}

/// Parse a submitted YAML document into a pending [`Job`], keeping the
/// raw text for replay. All failures are `validation` errors.
pub fn parse_job_spec(name: &str, owner: &str, spec_yaml: &str) -> Result<Job> {
    let spec: JobSpec = serde_yaml::from_str(spec_yaml)
        .map_err(|e| Error::validation(format!("invalid job spec: {e}")))?;
    let job = spec.job;

    if job.resources.gpus == 0 {
        return Err(Error::validation("resources.gpus must be > 0"));
    }
    if job.constraints.budget <= 0.0 {
        return Err(Error::validation("constraints.budget must be > 0"));
    }

    let gpu_fraction = job.resources.gpu_fraction.unwrap_or(1.0);
    if !(gpu_fraction > 0.0 && gpu_fraction <= 1.0) {
        return Err(Error::validation(format!(
            "gpu_fraction must be in (0, 1], got {gpu_fraction}"
        )));
    }

    let use_mig = job.resources.use_mig.unwrap_or(false);
    if use_mig && job.resources.mig_profile.as_deref().unwrap_or("").is_empty() {
        return Err(Error::validation("use_mig requires a mig_profile"));
    }

    let min_reliability = job.constraints.min_reliability.unwrap_or(0.9);
    if !(0.0..=1.0).contains(&min_reliability) {
        return Err(Error::validation("min_reliability must be in [0, 1]"));
    }
    if !(0.0..=1.0).contains(&job.constraints.performance_weight) {
        return Err(Error::validation("performance_weight must be in [0, 1]"));
    }

    let deadline = match &job.constraints.deadline {
        Some(raw) if !raw.is_empty() => Some(
            DateTime::parse_from_rfc3339(raw)
                .map_err(|e| Error::validation(format!("invalid deadline: {e}")))?
                .to_utc(),
        ),
        _ => None,
    };

    let execution_mode = job
        .execution
        .mode
        .unwrap_or_else(|| detect_execution_mode(job.job_type));

    let requirements = JobRequirements {
        gpus: job.resources.gpus,
        gpu_fraction,
        use_mig,
        mig_profile: job.resources.mig_profile.filter(|p| !p.is_empty()),
        max_gpus_per_node: job.resources.max_gpus_per_node,
        requires_multi_node: job.resources.requires_multi_node,
        gpu_memory_gb: parse_memory_gb(&job.resources.gpu_memory)?,
        cpu_memory_gb: parse_memory_gb(&job.resources.cpu_memory)?,
        storage_gb: parse_memory_gb(&job.resources.storage)?,
        estimated_hours: job.resources.estimated_hours.unwrap_or(1.0),
        framework: job.framework,
        execution_mode,
        dataset_uri: job.data.dataset.clone(),
    };

    let constraints = JobConstraints {
        max_budget: job.constraints.budget,
        deadline,
        preferred_regions: job.constraints.preferred_regions,
        allow_spot: job.constraints.allow_spot,
        min_reliability,
        performance_weight: job.constraints.performance_weight,
        data_locality: job.data.locality.unwrap_or(DataLocality::Prefer),
        replication_policy: job
            .data
            .replication_policy
            .unwrap_or(ReplicationPolicy::None),
    };

    Ok(Job::builder()
        .name(name)
        .owner(owner)
        .job_type(job.job_type)
        .entrypoint_uri(job.entrypoint)
        .requirements(requirements)
        .constraints(constraints)
        .backend(job.execution.backend.unwrap_or_default())
        .spec_yaml(spec_yaml)
        .build())
}

/// Memory strings are "<int>GB". Empty means unspecified (0).
fn parse_memory_gb(raw: &str) -> Result<u32> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(0);
    }
    let digits = raw
        .strip_suffix("GB")
        .or_else(|| raw.strip_suffix("gb"))
        .ok_or_else(|| Error::validation(format!("memory must look like '80GB', got {raw:?}")))?;
    digits
        .trim()
        .parse::<u32>()
        .map_err(|_| Error::validation(format!("invalid memory value {raw:?}")))
}

/// Jobs that are embarrassingly parallel default to multi-task; training
/// defaults to a single cluster, the safe choice for synchronous
/// frameworks.
fn detect_execution_mode(job_type: JobType) -> ExecutionMode {
    match job_type {
        JobType::Hpo | JobType::Inference | JobType::Eval => ExecutionMode::MultiTask,
        JobType::Training => ExecutionMode::SingleCluster,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_SPEC: &str = r#"
job:
  type: training
  framework: pytorch_ddp
  entrypoint: s3://code/train.py
  resources:
    gpus: 16
    max_gpus_per_node: 8
    requires_multi_node: true
    gpu_memory: 40GB
    cpu_memory: 512GB
    estimated_hours: 4.5
  data:
    dataset: gs://datasets/imagenet
    locality: required
    replication_policy: none
  constraints:
    budget: 500.0
    deadline: 2026-09-01T00:00:00Z
    allow_spot: true
    min_reliability: 0.8
    performance_weight: 0.3
  execution:
    mode: single_cluster
    backend: k8s
"#;

    #[test]
    fn test_parse_full_spec() {
        let job = parse_job_spec("imagenet-run", "alice", FULL_SPEC).unwrap();
        assert_eq!(job.name, "imagenet-run");
        assert_eq!(job.owner, "alice");
        assert_eq!(job.job_type, JobType::Training);
        assert_eq!(job.requirements.framework, Framework::PyTorchDdp);
        assert_eq!(job.requirements.gpus, 16);
        assert_eq!(job.requirements.max_gpus_per_node, 8);
        assert!(job.requirements.requires_multi_node);
        assert_eq!(job.requirements.gpu_memory_gb, 40);
        assert_eq!(job.requirements.cpu_memory_gb, 512);
        assert!((job.requirements.estimated_hours - 4.5).abs() < 1e-9);
        assert_eq!(job.requirements.execution_mode, ExecutionMode::SingleCluster);
        assert_eq!(job.constraints.data_locality, DataLocality::Required);
        assert!(job.constraints.allow_spot);
        assert_eq!(job.constraints.deadline.unwrap().to_rfc3339(), "2026-09-01T00:00:00+00:00");
        assert_eq!(job.selected_backend, Backend::K8s);
        // the raw document is preserved verbatim
        assert_eq!(job.spec_yaml, FULL_SPEC);
    }

    #[test]
    fn test_execution_mode_auto_detect() {
        let spec = r#"
job:
  type: hpo
  framework: pytorch_ddp
  entrypoint: s3://code/sweep.py
  resources:
    gpus: 4
  constraints:
    budget: 50
"#;
        let job = parse_job_spec("sweep", "bob", spec).unwrap();
        assert_eq!(job.requirements.execution_mode, ExecutionMode::MultiTask);
        // defaults applied
        assert_eq!(job.constraints.min_reliability, 0.9);
        assert_eq!(job.constraints.data_locality, DataLocality::Prefer);
        assert_eq!(job.constraints.replication_policy, ReplicationPolicy::None);
    }

    #[test]
    fn test_mig_requires_profile() {
        let spec = r#"
job:
  type: inference
  framework: pytorch_ddp
  entrypoint: s3://code/serve.py
  resources:
    gpus: 1
    use_mig: true
  constraints:
    budget: 10
"#;
        let err = parse_job_spec("serve", "bob", spec).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }

    #[test]
    fn test_gpu_fraction_bounds() {
        for bad in ["0.0", "1.5", "-0.25"] {
            let spec = format!(
                r#"
job:
  type: inference
  framework: pytorch_ddp
  entrypoint: s3://code/serve.py
  resources:
    gpus: 1
    gpu_fraction: {bad}
  constraints:
    budget: 10
"#
            );
            assert!(parse_job_spec("serve", "bob", &spec).is_err(), "fraction {bad}");
        }
    }

    #[test]
    fn test_bad_memory_string() {
        let spec = r#"
job:
  type: training
  framework: horovod
  entrypoint: s3://code/train.py
  resources:
    gpus: 1
    gpu_memory: lots
  constraints:
    budget: 10
"#;
        assert!(parse_job_spec("x", "bob", spec).is_err());
    }

    #[test]
    fn test_bad_deadline() {
        let spec = r#"
job:
  type: training
  framework: horovod
  entrypoint: s3://code/train.py
  resources:
    gpus: 1
  constraints:
    budget: 10
    deadline: tomorrow
"#;
        assert!(parse_job_spec("x", "bob", spec).is_err());
    }
}
