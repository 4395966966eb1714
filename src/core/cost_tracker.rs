use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::core::db::Database;
use crate::core::job::JobStatus;
use crate::core::provider::Allocation;

/// Accrual state for one tracked job.
#[derive(Debug, Clone)]
pub struct JobCost {
    pub started_at: DateTime<Utc>,
    pub running_cost: f64,
    pub last_update: DateTime<Utc>,
    pub allocations: Vec<Allocation>,
    warned_budget: bool,
    exceeded_budget: bool,
}

/// Real-time per-job cost accrual. Each tick charges the elapsed wall
/// time against the captured allocation prices and persists the total.
/// Budget thresholds raise advisory events; cancellation policy lives in
/// a monitoring collaborator, never here.
pub struct CostTracker {
    db: Database,
    tracked: Mutex<HashMap<String, JobCost>>,
    budget_warn_ratio: f64,
}

impl CostTracker {
    pub fn new(db: Database, budget_warn_ratio: f64) -> Self {
        Self {
            db,
            tracked: Mutex::new(HashMap::new()),
            budget_warn_ratio,
        }
    }

    /// Begin accruing for a job; idempotent per job id.
    pub fn track(&self, job_id: &str, allocations: Vec<Allocation>) {
        let now = Utc::now();
        self.tracked
            .lock()
            .unwrap()
            .entry(job_id.to_string())
            .or_insert(JobCost {
                started_at: now,
                running_cost: 0.0,
                last_update: now,
                allocations,
                warned_budget: false,
                exceeded_budget: false,
            });
    }

    pub fn untrack(&self, job_id: &str) {
        self.tracked.lock().unwrap().remove(job_id);
    }

    pub fn running_cost(&self, job_id: &str) -> f64 {
        self.tracked
            .lock()
            .unwrap()
            .get(job_id)
            .map(|c| c.running_cost)
            .unwrap_or(0.0)
    }

    /// One accrual pass over every tracked job, charging up to `now`.
    pub fn update_all(&self, now: DateTime<Utc>) {
        let job_ids: Vec<String> = self.tracked.lock().unwrap().keys().cloned().collect();
        for job_id in job_ids {
            if let Err(e) = self.update_one(&job_id, now) {
                tracing::warn!(job_id, error = %e, "cost update failed");
            }
        }
    }

    fn update_one(&self, job_id: &str, now: DateTime<Utc>) -> crate::error::Result<()> {
        // Only running jobs accrue; everything else just keeps its total.
        let Some(job) = self.db.get_job(job_id)? else {
            tracing::warn!(job_id, "tracked job vanished from the store, dropping");
            self.untrack(job_id);
            return Ok(());
        };
        if job.status != JobStatus::Running {
            return Ok(());
        }

        let (running_cost, ratio_fired) = {
            let mut tracked = self.tracked.lock().unwrap();
            let Some(cost) = tracked.get_mut(job_id) else {
                return Ok(());
            };
            let delta_hours = (now - cost.last_update).num_milliseconds().max(0) as f64
                / 3_600_000.0;
            let delta_cost: f64 = cost
                .allocations
                .iter()
                .map(|a| a.price_per_hour * a.count as f64 * delta_hours)
                .sum();
            cost.running_cost += delta_cost;
            cost.last_update = now;

            let budget = job.constraints.max_budget;
            let ratio = if budget > 0.0 {
                cost.running_cost / budget
            } else {
                0.0
            };
            let mut fired = None;
            if ratio >= 1.0 && !cost.exceeded_budget {
                cost.exceeded_budget = true;
                cost.warned_budget = true;
                fired = Some(("budget_exceeded", ratio));
            } else if ratio >= self.budget_warn_ratio && !cost.warned_budget {
                cost.warned_budget = true;
                fired = Some(("budget_warning", ratio));
            }
            (cost.running_cost, fired)
        };

        self.db.update_job_cost(job_id, running_cost)?;

        if let Some((reason, ratio)) = ratio_fired {
            tracing::warn!(job_id, reason, ratio, running_cost, "budget threshold crossed");
            self.db.append_advisory_event(
                job_id,
                job.status,
                reason,
                &serde_json::json!({
                    "running_cost_usd": running_cost,
                    "budget_usd": job.constraints.max_budget,
                    "ratio": ratio,
                }),
            )?;
        }
        Ok(())
    }

    /// Test/diagnostic hook: rewind a job's last update so the next pass
    /// charges a known interval.
    #[cfg(test)]
    pub(crate) fn rewind_last_update(&self, job_id: &str, by: Duration) {
        let mut tracked = self.tracked.lock().unwrap();
        if let Some(cost) = tracked.get_mut(job_id) {
            cost.last_update -= chrono::Duration::from_std(by).unwrap();
        }
    }
}

/// Periodic accrual worker (1 min default tick).
pub async fn run_tracker(
    tracker: std::sync::Arc<CostTracker>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                tracker.update_all(Utc::now());
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("cost tracker stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::Transition;
    use crate::core::job::Job;
    use crate::core::provider::{Backend, Provider};

    fn running_job(db: &Database, budget: f64) -> Job {
        let mut job = Job::builder().name("run").owner("alice").build();
        job.constraints.max_budget = budget;
        db.insert_job(&job).unwrap();
        for (from, to) in [
            (JobStatus::Pending, JobStatus::Scheduled),
            (JobStatus::Scheduled, JobStatus::Provisioning),
            (JobStatus::Provisioning, JobStatus::Running),
        ] {
            assert_eq!(
                db.transition_job(&job.id, from, to, "step", &serde_json::json!({}))
                    .unwrap(),
                Transition::Applied
            );
        }
        job
    }

    fn allocation(price: f64) -> Allocation {
        Allocation {
            provider: Provider::Aws,
            region: "us-east-1".into(),
            backend: Backend::Vm,
            instance_type: "p3.2xlarge".into(),
            count: 1,
            spot: false,
            price_per_hour: price,
            estimated_hours: 1.0,
            estimated_cost: price,
        }
    }

    #[test]
    fn test_accrual_after_six_minutes() {
        let db = Database::open_in_memory().unwrap();
        let job = running_job(&db, 100.0);
        let tracker = CostTracker::new(db.clone(), 0.9);
        tracker.track(&job.id, vec![allocation(10.0)]);

        // pretend six minutes elapsed since the last update
        tracker.rewind_last_update(&job.id, Duration::from_secs(360));
        tracker.update_all(Utc::now());

        let accrued = tracker.running_cost(&job.id);
        assert!((accrued - 1.0).abs() < 0.01, "got {accrued}");

        // persisted back to the job row
        let stored = db.get_job(&job.id).unwrap().unwrap();
        assert!((stored.cost_running_usd - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_budget_warning_fires_once() {
        let db = Database::open_in_memory().unwrap();
        let job = running_job(&db, 1.0);
        let tracker = CostTracker::new(db.clone(), 0.9);
        tracker.track(&job.id, vec![allocation(10.0)]);

        // 0.95 budget used after ~5.7 minutes at $10/h
        tracker.rewind_last_update(&job.id, Duration::from_secs(342));
        tracker.update_all(Utc::now());
        tracker.update_all(Utc::now());

        let events = db.events_for_job(&job.id).unwrap();
        let warnings: Vec<_> = events
            .iter()
            .filter(|e| e.reason == "budget_warning")
            .collect();
        assert_eq!(warnings.len(), 1);
        // advisory events carry from == to
        assert_eq!(warnings[0].from_status, Some(JobStatus::Running));
        assert_eq!(warnings[0].to_status, JobStatus::Running);
    }

    #[test]
    fn test_budget_exceeded_event() {
        let db = Database::open_in_memory().unwrap();
        let job = running_job(&db, 0.5);
        let tracker = CostTracker::new(db.clone(), 0.9);
        tracker.track(&job.id, vec![allocation(10.0)]);

        tracker.rewind_last_update(&job.id, Duration::from_secs(3600));
        tracker.update_all(Utc::now());

        let events = db.events_for_job(&job.id).unwrap();
        assert!(events.iter().any(|e| e.reason == "budget_exceeded"));
        // the tracker never cancels: still running
        let stored = db.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
    }

    #[test]
    fn test_non_running_jobs_do_not_accrue() {
        let db = Database::open_in_memory().unwrap();
        let mut job = Job::builder().name("idle").owner("alice").build();
        job.constraints.max_budget = 100.0;
        db.insert_job(&job).unwrap();

        let tracker = CostTracker::new(db.clone(), 0.9);
        tracker.track(&job.id, vec![allocation(10.0)]);
        tracker.rewind_last_update(&job.id, Duration::from_secs(3600));
        tracker.update_all(Utc::now());

        assert_eq!(tracker.running_cost(&job.id), 0.0);
    }

    #[test]
    fn test_untrack_stops_accrual() {
        let db = Database::open_in_memory().unwrap();
        let job = running_job(&db, 100.0);
        let tracker = CostTracker::new(db.clone(), 0.9);
        tracker.track(&job.id, vec![allocation(10.0)]);
        tracker.untrack(&job.id);
        tracker.update_all(Utc::now());
        assert_eq!(tracker.running_cost(&job.id), 0.0);
    }
}
