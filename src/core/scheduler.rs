use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};

use crate::core::cost_tracker::CostTracker;
use crate::core::db::{Database, Transition};
use crate::core::job::{Job, JobStatus, ReplicationPolicy};
use crate::core::launch;
use crate::core::optimizer::Optimizer;
use crate::core::pool::ClusterPool;
use crate::core::provider::{Allocation, Cluster};
use crate::core::provision::{JobExecutor, Provisioner, ReplicationEngine};
use crate::core::queue::JobQueue;
use crate::core::sharing::GpuSharingManager;
use crate::error::{Error, ErrorKind, Result};

/// Drives jobs from the queue through optimize → schedule → provision →
/// execute. Every status change is an atomic transition in the store;
/// the driver loop itself never waits on provisioning, which runs in a
/// spawned task per job.
///
/// Cheap to clone: every field is a shared handle, so spawned
/// provisioning tasks carry their own copy.
#[derive(Clone)]
pub struct Scheduler {
    db: Database,
    queue: Arc<JobQueue>,
    optimizer: Arc<Optimizer>,
    pool: Arc<ClusterPool>,
    sharing: Arc<GpuSharingManager>,
    tracker: Arc<CostTracker>,
    provisioner: Arc<dyn Provisioner>,
    executor: Arc<dyn JobExecutor>,
    replication: Option<Arc<dyn ReplicationEngine>>,
    notify: Arc<Notify>,
    batch: usize,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        queue: Arc<JobQueue>,
        optimizer: Arc<Optimizer>,
        pool: Arc<ClusterPool>,
        sharing: Arc<GpuSharingManager>,
        tracker: Arc<CostTracker>,
        provisioner: Arc<dyn Provisioner>,
        executor: Arc<dyn JobExecutor>,
        replication: Option<Arc<dyn ReplicationEngine>>,
        batch: usize,
    ) -> Self {
        Self {
            db,
            queue,
            optimizer,
            pool,
            sharing,
            tracker,
            provisioner,
            executor,
            replication,
            notify: Arc::new(Notify::new()),
            batch,
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Admit a parsed job: validate, persist (status=pending,
    /// event=created), enqueue, and wake the driver loop.
    pub fn submit(&self, job: Job) -> Result<Job> {
        if job.constraints.replication_policy != ReplicationPolicy::None
            && self.replication.is_none()
        {
            return Err(Error::validation(format!(
                "replication policy {} requires a replication engine and none is registered",
                job.constraints.replication_policy
            )));
        }
        self.db.insert_job(&job)?;
        self.queue.enqueue_job(&job);
        self.notify.notify_one();
        tracing::info!(job_id = %job.id, name = %job.name, "job submitted");
        Ok(job)
    }

    /// Cancel a job from whatever non-terminal state it is in, releasing
    /// any held resources.
    pub fn cancel(&self, job_id: &str) -> Result<Job> {
        loop {
            let job = self
                .db
                .get_job(job_id)?
                .ok_or_else(|| Error::validation(format!("job {job_id} not found")))?;
            if job.status.is_terminal() {
                return Err(Error::new(
                    ErrorKind::Cancelled,
                    format!("job {job_id} already {}", job.status),
                ));
            }
            match self.db.transition_job(
                job_id,
                job.status,
                JobStatus::Cancelled,
                "user_cancelled",
                &serde_json::json!({}),
            )? {
                Transition::Applied => {
                    self.release_resources(&job);
                    tracing::info!(job_id, "job cancelled");
                    return self
                        .db
                        .get_job(job_id)?
                        .ok_or_else(|| Error::persistence(format!("job {job_id} vanished")));
                }
                Transition::Lost(_) => continue,
            }
        }
    }

    /// Rehydrate scheduler state after a restart: pending jobs re-enter
    /// the queue; scheduled jobs resume their provisioning path with
    /// their persisted allocations.
    pub fn recover(&self) -> Result<()> {
        let pending = self.db.list_jobs(Some(JobStatus::Pending))?;
        self.queue.rebuild(&pending);
        tracing::info!(count = pending.len(), "rebuilt queue from pending jobs");

        for job in self.db.list_jobs(Some(JobStatus::Scheduled))? {
            tracing::info!(job_id = %job.id, "resuming provisioning for scheduled job");
            self.spawn_provisioning(job.id.clone());
        }
        Ok(())
    }

    /// Drain up to one batch from the queue. Returns how many jobs were
    /// admitted to provisioning this pass.
    pub fn process_pending(&self) -> usize {
        let mut processed = 0;
        for _ in 0..self.batch {
            let Some(entry) = self.queue.pop() else {
                break;
            };
            // Re-read: the entry may be stale (cancelled, or already
            // admitted by a competing worker). Losing this race costs a
            // skip, never a double admission.
            let job = match self.db.get_job(&entry.job_id) {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(job_id = %entry.job_id, error = %e, "job re-read failed");
                    continue;
                }
            };
            if job.status != JobStatus::Pending {
                continue;
            }
            match self.schedule_job(&job) {
                Ok(true) => processed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "scheduling failed");
                    self.fail_job(&job.id, JobStatus::Pending, "scheduler_error", &e);
                }
            }
        }
        processed
    }

    /// Optimize and persist the decision. Returns whether the job moved
    /// to scheduled.
    fn schedule_job(&self, job: &Job) -> Result<bool> {
        let allocations = match self.optimizer.optimize(job) {
            Ok(allocations) => allocations,
            Err(e) if e.kind == ErrorKind::InfeasibleJob => {
                tracing::info!(job_id = %job.id, constraint = %e.message, "no feasible plan");
                self.db.transition_job(
                    &job.id,
                    JobStatus::Pending,
                    JobStatus::Failed,
                    "optimizer_no_plan",
                    &serde_json::json!({ "kind": e.kind.to_string(), "detail": e.message }),
                )?;
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let estimated_cost =
            crate::core::cost::cost(&allocations, job.requirements.estimated_hours);
        match self.db.transition_scheduled(
            &job.id,
            &allocations,
            estimated_cost,
            "optimizer_selected_allocation",
        )? {
            Transition::Applied => {
                tracing::info!(
                    job_id = %job.id,
                    lines = allocations.len(),
                    estimated_cost,
                    "job scheduled"
                );
                self.spawn_provisioning(job.id.clone());
                Ok(true)
            }
            Transition::Lost(observed) => {
                tracing::debug!(job_id = %job.id, %observed, "lost scheduling race");
                Ok(false)
            }
        }
    }

    /// The async boundary: provisioning and execution block, so they get
    /// their own task off the driver loop.
    fn spawn_provisioning(&self, job_id: String) {
        let scheduler = self.clone();
        tokio::task::spawn_blocking(move || scheduler.provision_and_execute(&job_id));
    }

    /// scheduled → provisioning → running → completed, with every error
    /// mapped onto a failed transition carrying the kind.
    pub fn provision_and_execute(&self, job_id: &str) {
        let job = match self.db.get_job(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!(job_id, "job vanished before provisioning");
                return;
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "job read failed before provisioning");
                return;
            }
        };
        let allocations = match self.db.allocations_for_job(job_id) {
            Ok(allocations) if !allocations.is_empty() => allocations,
            Ok(_) => {
                self.fail_job(
                    job_id,
                    JobStatus::Scheduled,
                    "provisioning_failed",
                    &Error::provisioning("no persisted allocations"),
                );
                return;
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "allocation read failed");
                return;
            }
        };

        match self.db.transition_job(
            job_id,
            JobStatus::Scheduled,
            JobStatus::Provisioning,
            "provisioning_requested",
            &serde_json::json!({}),
        ) {
            Ok(Transition::Applied) => {}
            Ok(Transition::Lost(observed)) => {
                tracing::debug!(job_id, %observed, "provisioning superseded");
                return;
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "provisioning transition failed");
                return;
            }
        }

        if let Some(engine) = &self.replication {
            if job.constraints.replication_policy != ReplicationPolicy::None {
                if let Err(e) = engine.replicate(&job) {
                    self.fail_job(job_id, JobStatus::Provisioning, "provisioning_failed", &e);
                    return;
                }
            }
        }

        let cluster = match self.acquire_cluster(&job, &allocations) {
            Ok(cluster) => cluster,
            Err(e) => {
                self.fail_job(job_id, JobStatus::Provisioning, e.kind.to_string().as_str(), &e);
                return;
            }
        };
        if let Err(e) = self.db.update_job_cluster(job_id, &cluster.id) {
            tracing::warn!(job_id, error = %e, "cluster id not recorded");
        }

        // Shared-GPU jobs additionally claim their slice of a device.
        if job.requirements.wants_gpu_sharing() {
            let Some(node) = cluster.nodes.first() else {
                self.release_cluster(&job, &cluster);
                self.fail_job(
                    job_id,
                    JobStatus::Provisioning,
                    "topology",
                    &Error::topology("cluster has no nodes to share"),
                );
                return;
            };
            if let Err(e) = self.sharing.allocate(&job, node) {
                self.release_cluster(&job, &cluster);
                self.fail_job(job_id, JobStatus::Provisioning, "capacity", &e);
                return;
            }
        }

        let plan = match launch::build_plan(&cluster, &job).and_then(launch::finalize_plan) {
            Ok(plan) => plan,
            Err(e) => {
                self.release_resources_on(&job, &cluster);
                self.fail_job(job_id, JobStatus::Provisioning, "topology", &e);
                return;
            }
        };

        match self.db.transition_job(
            job_id,
            JobStatus::Provisioning,
            JobStatus::Running,
            "provisioning_complete",
            &serde_json::json!({ "cluster_id": cluster.id, "nodes": cluster.nodes.len() }),
        ) {
            Ok(Transition::Applied) => {}
            Ok(Transition::Lost(observed)) => {
                tracing::debug!(job_id, %observed, "running transition superseded");
                self.release_resources_on(&job, &cluster);
                return;
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "running transition failed");
                self.release_resources_on(&job, &cluster);
                return;
            }
        }
        self.tracker.track(job_id, allocations.clone());

        let outcome = self.executor.run(&job, &cluster, &plan);

        self.release_resources_on(&job, &cluster);
        self.tracker.untrack(job_id);

        match outcome {
            Ok(()) => {
                if let Err(e) = self.db.transition_job(
                    job_id,
                    JobStatus::Running,
                    JobStatus::Completed,
                    "execution_complete",
                    &serde_json::json!({}),
                ) {
                    tracing::error!(job_id, error = %e, "completion transition failed");
                }
                tracing::info!(job_id, "job completed");
            }
            Err(e) => {
                self.fail_from_current(job_id, "execution_failed", &e);
            }
        }
    }

    /// Reuse a pooled cluster when one has the capacity, otherwise
    /// provision a fresh one and adopt it into the pool.
    fn acquire_cluster(&self, job: &Job, allocations: &[Allocation]) -> Result<Cluster> {
        let gpus = job.requirements.gpus;
        if let Some(cluster) = self.pool.get_best(gpus) {
            self.pool.reserve(&cluster.id, gpus)?;
            tracing::info!(job_id = %job.id, cluster_id = %cluster.id, "reusing pooled cluster");
            return Ok(cluster);
        }
        let cluster = self.provisioner.provision(job, allocations)?;
        self.pool.insert(cluster.clone());
        self.pool.reserve(&cluster.id, gpus.min(cluster.total_gpus()))?;
        tracing::info!(job_id = %job.id, cluster_id = %cluster.id, "provisioned new cluster");
        Ok(cluster)
    }

    fn release_cluster(&self, job: &Job, cluster: &Cluster) {
        let gpus = job.requirements.gpus.min(cluster.total_gpus());
        if let Err(e) = self.pool.release(&cluster.id, gpus) {
            tracing::debug!(job_id = %job.id, error = %e, "pool release skipped");
        }
    }

    fn release_resources_on(&self, job: &Job, cluster: &Cluster) {
        self.release_cluster(job, cluster);
        if job.requirements.wants_gpu_sharing() {
            if let Err(e) = self.sharing.release(&job.id) {
                tracing::debug!(job_id = %job.id, error = %e, "sharing release skipped");
            }
        }
    }

    fn release_resources(&self, job: &Job) {
        if let Some(cluster_id) = &job.cluster_id {
            if let Some(entry) = self.pool.get(cluster_id) {
                self.release_cluster(job, &entry.cluster);
            }
        }
        if job.requirements.wants_gpu_sharing() {
            let _ = self.sharing.release(&job.id);
        }
        self.tracker.untrack(&job.id);
    }

    /// Transition from a known status to failed, recording the error
    /// kind in the event.
    fn fail_job(&self, job_id: &str, from: JobStatus, reason: &str, error: &Error) {
        let meta = serde_json::json!({
            "kind": error.kind.to_string(),
            "detail": error.message,
        });
        match self.db.transition_job(job_id, from, JobStatus::Failed, reason, &meta) {
            Ok(Transition::Applied) => {
                tracing::warn!(job_id, reason, error = %error, "job failed");
            }
            Ok(Transition::Lost(observed)) => {
                tracing::warn!(job_id, %observed, "failure transition lost");
            }
            Err(e) => tracing::error!(job_id, error = %e, "failure transition errored"),
        }
    }

    /// Fail from whatever non-terminal status the job currently holds
    /// (running or checkpointing when the executor reports an error).
    fn fail_from_current(&self, job_id: &str, reason: &str, error: &Error) {
        for _ in 0..4 {
            let Ok(Some(job)) = self.db.get_job(job_id) else {
                return;
            };
            if job.status.is_terminal() {
                return;
            }
            match self
                .db
                .transition_job(
                    job_id,
                    job.status,
                    JobStatus::Failed,
                    reason,
                    &serde_json::json!({
                        "kind": error.kind.to_string(),
                        "detail": error.message,
                    }),
                ) {
                Ok(Transition::Applied) => {
                    tracing::warn!(job_id, reason, error = %error, "job failed");
                    return;
                }
                Ok(Transition::Lost(_)) => continue,
                Err(e) => {
                    tracing::error!(job_id, error = %e, "failure transition errored");
                    return;
                }
            }
        }
    }

    pub fn notify_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }
}

/// Driver loop: tick every `interval` or wake on submission, drain one
/// batch per pass.
pub async fn run_scheduler(
    scheduler: Arc<Scheduler>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let notify = scheduler.notify_handle();
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = notify.notified() => {
                tracing::debug!("scheduler woken by submission");
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("scheduler stopping");
                    break;
                }
            }
        }
        let processed = scheduler.process_pending();
        if processed > 0 {
            tracing::debug!(processed, "scheduler pass complete");
        }
    }
}
