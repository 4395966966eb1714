use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::core::cost_tracker::CostTracker;
use crate::core::db::Database;
use crate::core::job::{Job, JobStatus};
use crate::core::provision::{HealthProbe, JobHealth};

/// Snapshot derived for each running job every tick. Collaborators
/// subscribe to drive alerts or cancellation policy.
#[derive(Debug, Clone, Serialize)]
pub struct JobMetrics {
    pub job_id: String,
    pub status: JobStatus,
    pub running_cost: f64,
    pub estimated_cost: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_secs: i64,
    pub healthy: bool,
}

/// Health, progress, and budget checks over running jobs. Stuck jobs
/// (provisioning or running past their deadline knobs) are reported,
/// never auto-killed.
pub struct Monitor {
    db: Database,
    tracker: Arc<CostTracker>,
    probe: Arc<dyn HealthProbe>,
    metrics_tx: broadcast::Sender<JobMetrics>,
    provisioning_deadline: Duration,
}

impl Monitor {
    pub fn new(
        db: Database,
        tracker: Arc<CostTracker>,
        probe: Arc<dyn HealthProbe>,
        provisioning_deadline: Duration,
    ) -> Self {
        let (metrics_tx, _) = broadcast::channel(256);
        Self {
            db,
            tracker,
            probe,
            metrics_tx,
            provisioning_deadline,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobMetrics> {
        self.metrics_tx.subscribe()
    }

    /// One monitoring pass: probe running jobs, publish metrics, report
    /// jobs stuck in provisioning.
    pub fn check_all(&self, now: DateTime<Utc>) {
        let running = match self.db.list_jobs(Some(JobStatus::Running)) {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(error = %e, "monitor failed to list running jobs");
                return;
            }
        };
        for job in &running {
            let metrics = self.derive_metrics(job, now);
            // A send only fails with no subscribers, which is fine.
            let _ = self.metrics_tx.send(metrics);
            if let Err(e) = self.db.update_heartbeat(&job.id) {
                tracing::warn!(job_id = %job.id, error = %e, "heartbeat update failed");
            }
            // Overruns are reported, not killed; cancellation policy
            // belongs to subscribers.
            if let Some(started) = job.started_at {
                let elapsed_hours = (now - started).num_seconds().max(0) as f64 / 3600.0;
                let estimate = job.requirements.estimated_hours;
                if estimate > 0.0 && elapsed_hours > estimate * 2.0 {
                    tracing::warn!(
                        job_id = %job.id,
                        elapsed_hours,
                        estimated_hours = estimate,
                        "job running far past its estimate"
                    );
                }
            }
        }

        match self.db.list_jobs(Some(JobStatus::Provisioning)) {
            Ok(provisioning) => {
                for job in provisioning {
                    let age = now - job.updated_at;
                    if age.num_seconds() >= self.provisioning_deadline.as_secs() as i64 {
                        tracing::warn!(
                            job_id = %job.id,
                            stuck_secs = age.num_seconds(),
                            "job stuck in provisioning past deadline"
                        );
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "monitor failed to list provisioning jobs"),
        }
    }

    /// On-demand metrics for one job, the same shape the periodic pass
    /// publishes.
    pub fn metrics_for(&self, job_id: &str) -> crate::error::Result<JobMetrics> {
        let job = self
            .db
            .get_job(job_id)?
            .ok_or_else(|| crate::error::Error::validation(format!("job {job_id} not found")))?;
        Ok(self.derive_metrics(&job, Utc::now()))
    }

    fn derive_metrics(&self, job: &Job, now: DateTime<Utc>) -> JobMetrics {
        let healthy = match self.probe.check(job) {
            Ok(JobHealth::Healthy) => true,
            Ok(JobHealth::Unhealthy(reason)) => {
                tracing::warn!(job_id = %job.id, reason, "health probe reported unhealthy");
                false
            }
            Err(e) => {
                tracing::debug!(job_id = %job.id, error = %e, "health probe unavailable");
                true
            }
        };
        let elapsed_secs = job
            .started_at
            .map(|started| (now - started).num_seconds().max(0))
            .unwrap_or(0);
        JobMetrics {
            job_id: job.id.clone(),
            status: job.status,
            running_cost: self.tracker.running_cost(&job.id),
            estimated_cost: job.cost_estimated_usd,
            started_at: job.started_at,
            elapsed_secs,
            healthy,
        }
    }
}

/// Periodic monitoring worker (30 s default tick).
pub async fn run_monitor(
    monitor: Arc<Monitor>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                monitor.check_all(Utc::now());
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("monitor stopping");
                    break;
                }
            }
        }
    }
}
