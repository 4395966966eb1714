use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::core::provider::{Backend, Provider};

/// Job lifecycle states.
///
/// pending → scheduled → provisioning → running ↔ checkpointing
///                                        │
///                                        └──> completed
/// any non-terminal ──> failed | cancelled
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Scheduled,
    Provisioning,
    Running,
    Checkpointing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Legal transitions. No state may be skipped and nothing reverses
    /// except the running↔checkpointing pair; every non-terminal state
    /// may fail or be cancelled.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        if !self.is_terminal() && matches!(next, Failed | Cancelled) {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Scheduled)
                | (Scheduled, Provisioning)
                | (Provisioning, Running)
                | (Running, Checkpointing)
                | (Checkpointing, Running)
                | (Running, Completed)
                | (Checkpointing, Completed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Training,
    Hpo,
    Inference,
    Eval,
}

/// Distributed training framework. A tagged variant rather than a free
/// string: the launch planner and executor dispatch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum Framework {
    #[strum(to_string = "pytorch_ddp")]
    #[serde(rename = "pytorch_ddp")]
    PyTorchDdp,
    #[strum(to_string = "horovod")]
    #[serde(rename = "horovod")]
    Horovod,
    #[strum(to_string = "horovod_elastic")]
    #[serde(rename = "horovod_elastic")]
    HorovodElastic,
    #[strum(to_string = "tensorflow_multiworker")]
    #[serde(rename = "tensorflow_multiworker")]
    TfMultiWorker,
}

impl Framework {
    /// Synchronous frameworks need every worker inside one low-latency
    /// network domain.
    pub fn is_synchronous(self) -> bool {
        matches!(
            self,
            Framework::PyTorchDdp | Framework::Horovod | Framework::TfMultiWorker
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    SingleCluster,
    MultiTask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DataLocality {
    Prefer,
    Required,
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum ReplicationPolicy {
    #[strum(to_string = "none")]
    #[serde(rename = "none")]
    None,
    #[strum(to_string = "pre-stage")]
    #[serde(rename = "pre-stage")]
    PreStage,
    #[strum(to_string = "on-demand-cache")]
    #[serde(rename = "on-demand-cache")]
    OnDemandCache,
}

/// Resource requirements derived from the job spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequirements {
    pub gpus: u32,
    /// Share of a single GPU in (0, 1]; below 1.0 the job lands on a
    /// time-sliced GPU through the sharing ledger.
    pub gpu_fraction: f64,
    pub use_mig: bool,
    pub mig_profile: Option<String>,
    /// 0 means unbounded.
    pub max_gpus_per_node: u32,
    pub requires_multi_node: bool,
    pub gpu_memory_gb: u32,
    pub cpu_memory_gb: u32,
    pub storage_gb: u32,
    pub estimated_hours: f64,
    pub framework: Framework,
    pub execution_mode: ExecutionMode,
    pub dataset_uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConstraints {
    pub max_budget: f64,
    pub deadline: Option<DateTime<Utc>>,
    pub preferred_regions: Vec<String>,
    pub allow_spot: bool,
    pub min_reliability: f64,
    /// 0.0 = cost only, 1.0 = throughput only.
    pub performance_weight: f64,
    pub data_locality: DataLocality,
    pub replication_policy: ReplicationPolicy,
}

/// The workload unit. The raw spec document is immutable once created;
/// derived fields change only through a status transition or their
/// single owning writer (scheduler for selection, cost tracker for cost).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub team: Option<String>,
    pub project: Option<String>,
    pub job_type: JobType,
    pub entrypoint_uri: String,
    pub requirements: JobRequirements,
    pub constraints: JobConstraints,
    pub status: JobStatus,

    pub selected_provider: Option<Provider>,
    pub selected_region: Option<String>,
    pub selected_backend: Backend,
    pub cluster_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,

    pub cost_running_usd: f64,
    pub cost_estimated_usd: Option<f64>,

    /// Original spec document, preserved verbatim for replay.
    pub spec_yaml: String,
}

/// Append-only lifecycle record. The events of a job, ordered by id,
/// replay exactly its status history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: i64,
    pub job_id: String,
    pub at: DateTime<Utc>,
    pub from_status: Option<JobStatus>,
    pub to_status: JobStatus,
    pub reason: String,
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Checkpoint,
    Log,
    Output,
    Metrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobArtifact {
    pub id: i64,
    pub job_id: String,
    pub kind: ArtifactKind,
    pub uri: String,
    pub created_at: DateTime<Utc>,
    pub meta: serde_json::Value,
}

#[derive(Default)]
pub struct JobBuilder {
    name: Option<String>,
    owner: Option<String>,
    team: Option<String>,
    project: Option<String>,
    job_type: Option<JobType>,
    entrypoint_uri: Option<String>,
    requirements: Option<JobRequirements>,
    constraints: Option<JobConstraints>,
    backend: Option<Backend>,
    spec_yaml: Option<String>,
}

impl JobBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn team(mut self, team: impl Into<Option<String>>) -> Self {
        self.team = team.into();
        self
    }

    pub fn project(mut self, project: impl Into<Option<String>>) -> Self {
        self.project = project.into();
        self
    }

    pub fn job_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    pub fn entrypoint_uri(mut self, uri: impl Into<String>) -> Self {
        self.entrypoint_uri = Some(uri.into());
        self
    }

    pub fn requirements(mut self, requirements: JobRequirements) -> Self {
        self.requirements = Some(requirements);
        self
    }

    pub fn constraints(mut self, constraints: JobConstraints) -> Self {
        self.constraints = Some(constraints);
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn spec_yaml(mut self, yaml: impl Into<String>) -> Self {
        self.spec_yaml = Some(yaml.into());
        self
    }

    pub fn build(self) -> Job {
        let now = Utc::now();
        Job {
            id: uuid::Uuid::new_v4().to_string(),
            name: self.name.unwrap_or_default(),
            owner: self.owner.unwrap_or_else(|| "unknown".into()),
            team: self.team,
            project: self.project,
            job_type: self.job_type.unwrap_or(JobType::Training),
            entrypoint_uri: self.entrypoint_uri.unwrap_or_default(),
            requirements: self.requirements.unwrap_or_else(JobRequirements::default_training),
            constraints: self.constraints.unwrap_or_else(JobConstraints::defaults),
            status: JobStatus::Pending,
            selected_provider: None,
            selected_region: None,
            selected_backend: self.backend.unwrap_or_default(),
            cluster_id: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            last_heartbeat: None,
            updated_at: now,
            cost_running_usd: 0.0,
            cost_estimated_usd: None,
            spec_yaml: self.spec_yaml.unwrap_or_default(),
        }
    }
}

impl Job {
    pub fn builder() -> JobBuilder {
        JobBuilder::new()
    }
}

impl JobRequirements {
    pub fn default_training() -> Self {
        Self {
            gpus: 1,
            gpu_fraction: 1.0,
            use_mig: false,
            mig_profile: None,
            max_gpus_per_node: 0,
            requires_multi_node: false,
            gpu_memory_gb: 0,
            cpu_memory_gb: 0,
            storage_gb: 0,
            estimated_hours: 1.0,
            framework: Framework::PyTorchDdp,
            execution_mode: ExecutionMode::SingleCluster,
            dataset_uri: String::new(),
        }
    }

    /// Whether this job shares a physical GPU with others.
    pub fn wants_gpu_sharing(&self) -> bool {
        self.use_mig || self.gpu_fraction < 1.0
    }
}

impl JobConstraints {
    pub fn defaults() -> Self {
        Self {
            max_budget: 100.0,
            deadline: None,
            preferred_regions: vec![],
            allow_spot: false,
            min_reliability: 0.9,
            performance_weight: 0.0,
            data_locality: DataLocality::Prefer,
            replication_policy: ReplicationPolicy::None,
        }
    }
}
