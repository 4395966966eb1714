use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::core::pool::ClusterPool;
use crate::core::queue::JobQueue;

/// Couples pool size to queue pressure: when the backlog exceeds the
/// threshold, grow by the overflow; idle clusters are always eligible
/// for removal. Errors are logged and the loop continues; scaling never
/// blocks admission.
pub struct Autoscaler {
    pool: Arc<ClusterPool>,
    queue: Arc<JobQueue>,
    scale_up_threshold: usize,
    idle_timeout: Duration,
}

impl Autoscaler {
    pub fn new(
        pool: Arc<ClusterPool>,
        queue: Arc<JobQueue>,
        scale_up_threshold: usize,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            queue,
            scale_up_threshold,
            idle_timeout,
        }
    }

    /// One scaling decision.
    pub fn check_and_scale(&self) {
        let depth = self.queue.len();
        if depth > self.scale_up_threshold {
            let demand = depth - self.scale_up_threshold;
            match self.pool.scale_up(demand) {
                Ok(added) if !added.is_empty() => {
                    tracing::info!(depth, demand, added = added.len(), "scaled pool up");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(depth, error = %e, "scale-up failed"),
            }
        }

        let removed = self.pool.scale_down(self.idle_timeout);
        if !removed.is_empty() {
            tracing::info!(removed = removed.len(), "scaled pool down");
        }
    }
}

/// Periodic autoscaling worker (30 s default tick).
pub async fn run_autoscaler(
    autoscaler: Arc<Autoscaler>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                autoscaler.check_and_scale();
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("autoscaler stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::queue::QueuedJob;
    use chrono::Utc;

    fn pending(id: &str) -> QueuedJob {
        QueuedJob {
            job_id: id.to_string(),
            deadline: None,
            max_budget: 10.0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_scales_up_on_queue_pressure() {
        let pool = Arc::new(ClusterPool::new(0, 8));
        let queue = Arc::new(JobQueue::new());
        for i in 0..5 {
            queue.enqueue(pending(&format!("job-{i}")));
        }

        let autoscaler = Autoscaler::new(
            Arc::clone(&pool),
            Arc::clone(&queue),
            2,
            Duration::from_secs(3600),
        );
        autoscaler.check_and_scale();

        // depth 5, threshold 2 => demand 3 => one placeholder cluster
        assert_eq!(pool.stats().clusters, 1);
    }

    #[test]
    fn test_idle_scale_down_runs_unconditionally() {
        let pool = Arc::new(ClusterPool::new(0, 8));
        pool.scale_up(1).unwrap();
        assert_eq!(pool.stats().clusters, 1);

        let queue = Arc::new(JobQueue::new());
        let autoscaler = Autoscaler::new(
            Arc::clone(&pool),
            queue,
            2,
            Duration::from_secs(0),
        );
        autoscaler.check_and_scale();
        assert_eq!(pool.stats().clusters, 0);
    }

    #[test]
    fn test_quiet_queue_does_not_scale_up() {
        let pool = Arc::new(ClusterPool::new(0, 8));
        let queue = Arc::new(JobQueue::new());
        queue.enqueue(pending("only"));

        let autoscaler = Autoscaler::new(
            Arc::clone(&pool),
            queue,
            2,
            Duration::from_secs(3600),
        );
        autoscaler.check_and_scale();
        assert_eq!(pool.stats().clusters, 0);
    }
}
