use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::core::job::Job;

/// Heap entry. Only the ordering fields are kept; the scheduler
/// re-reads the job row before acting, so a stale entry costs one skip.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub job_id: String,
    pub deadline: Option<DateTime<Utc>>,
    pub max_budget: f64,
    pub created_at: DateTime<Utc>,
}

impl QueuedJob {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            deadline: job.constraints.deadline,
            max_budget: job.constraints.max_budget,
            created_at: job.created_at,
        }
    }
}

impl Eq for QueuedJob {}

impl Ord for QueuedJob {
    /// Higher priority = smaller in this ordering. Deadlined jobs outrank
    /// undeadlined ones, earlier deadlines first; otherwise the smaller
    /// budget wins; created_at then job_id settle ties.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.deadline, other.deadline) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
        .then_with(|| self.max_budget.total_cmp(&other.max_budget))
        .then_with(|| self.created_at.cmp(&other.created_at))
        .then_with(|| self.job_id.cmp(&other.job_id))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Deadline-then-budget ordered queue of pending jobs. Eventually
/// consistent with the durable store: rebuilt from status=pending rows
/// on startup, and poppers tolerate entries whose job has moved on.
pub struct JobQueue {
    heap: Mutex<BinaryHeap<std::cmp::Reverse<QueuedJob>>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
        }
    }

    pub fn enqueue(&self, entry: QueuedJob) {
        self.heap.lock().unwrap().push(std::cmp::Reverse(entry));
    }

    pub fn enqueue_job(&self, job: &Job) {
        self.enqueue(QueuedJob::from_job(job));
    }

    pub fn pop(&self) -> Option<QueuedJob> {
        self.heap.lock().unwrap().pop().map(|r| r.0)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuild from pending jobs, e.g. after a restart.
    pub fn rebuild(&self, jobs: &[Job]) {
        let mut heap = self.heap.lock().unwrap();
        heap.clear();
        for job in jobs {
            heap.push(std::cmp::Reverse(QueuedJob::from_job(job)));
        }
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(
        id: &str,
        deadline: Option<DateTime<Utc>>,
        budget: f64,
        created_secs: i64,
    ) -> QueuedJob {
        QueuedJob {
            job_id: id.to_string(),
            deadline,
            max_budget: budget,
            created_at: Utc.timestamp_opt(created_secs, 0).unwrap(),
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_deadline_outranks_budget() {
        let queue = JobQueue::new();
        queue.enqueue(entry("cheap", None, 1.0, 0));
        queue.enqueue(entry("urgent", Some(at(10_000)), 1_000.0, 1));

        assert_eq!(queue.pop().unwrap().job_id, "urgent");
        assert_eq!(queue.pop().unwrap().job_id, "cheap");
    }

    #[test]
    fn test_earlier_deadline_first() {
        let queue = JobQueue::new();
        queue.enqueue(entry("later", Some(at(20_000)), 1.0, 0));
        queue.enqueue(entry("sooner", Some(at(10_000)), 500.0, 1));

        assert_eq!(queue.pop().unwrap().job_id, "sooner");
    }

    #[test]
    fn test_lower_budget_first_without_deadlines() {
        let queue = JobQueue::new();
        queue.enqueue(entry("big", None, 500.0, 0));
        queue.enqueue(entry("small", None, 5.0, 1));

        assert_eq!(queue.pop().unwrap().job_id, "small");
    }

    #[test]
    fn test_created_at_breaks_ties() {
        let queue = JobQueue::new();
        queue.enqueue(entry("second", None, 10.0, 200));
        queue.enqueue(entry("first", None, 10.0, 100));

        assert_eq!(queue.pop().unwrap().job_id, "first");
    }

    #[test]
    fn test_pop_sequence_is_monotone_in_key() {
        let queue = JobQueue::new();
        queue.enqueue(entry("a", Some(at(30_000)), 10.0, 0));
        queue.enqueue(entry("b", None, 2.0, 1));
        queue.enqueue(entry("c", Some(at(10_000)), 99.0, 2));
        queue.enqueue(entry("d", None, 50.0, 3));
        queue.enqueue(entry("e", Some(at(20_000)), 1.0, 4));

        let mut popped = Vec::new();
        while let Some(item) = queue.pop() {
            popped.push(item);
        }
        let ids: Vec<&str> = popped.iter().map(|q| q.job_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "e", "a", "b", "d"]);
        // queue fairness: the sequence is non-decreasing in the key
        for pair in popped.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn test_rebuild_replaces_contents() {
        let queue = JobQueue::new();
        queue.enqueue(entry("stale", None, 1.0, 0));

        let job = Job::builder().name("fresh").owner("alice").build();
        queue.rebuild(&[job.clone()]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().unwrap().job_id, job.id);
    }
}
