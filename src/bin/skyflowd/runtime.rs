use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use skyflow::config::Config;
use skyflow::core::autoscaler::{self, Autoscaler};
use skyflow::core::cost_tracker::{self, CostTracker};
use skyflow::core::db::Database;
use skyflow::core::monitor::{self, Monitor};
use skyflow::core::optimizer::Optimizer;
use skyflow::core::pool::ClusterPool;
use skyflow::core::pricing::{self, PricingCache, ProviderAdapter};
use skyflow::core::provision::{NoopExecutor, NoopHealthProbe, StubProvisioner};
use skyflow::core::queue::JobQueue;
use skyflow::core::scheduler::{self, Scheduler};
use skyflow::core::sharing::GpuSharingManager;
use skyflow::core::provider::EgressTable;

/// Everything the HTTP surface needs a handle on, plus the spawned
/// worker tasks and their shutdown signal.
pub struct Runtime {
    pub config: Config,
    pub db: Database,
    pub scheduler: Arc<Scheduler>,
    pub pool: Arc<ClusterPool>,
    pub sharing: Arc<GpuSharingManager>,
    pub monitor: Arc<Monitor>,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl Runtime {
    /// Wire the components, rehydrate persisted state, and spawn the
    /// periodic workers.
    ///
    /// Provider adapters, provisioners, and executors are pluggable; the
    /// stock daemon wires the in-process stubs so a fresh checkout runs
    /// end to end. Production embeds real adapters here.
    pub fn start(config: Config) -> anyhow::Result<Self> {
        let db = Database::open(config.database.resolved_path())
            .map_err(|e| anyhow::anyhow!("database open failed: {e}"))?;
        db.health_check()
            .map_err(|e| anyhow::anyhow!("database health check failed: {e}"))?;

        let (cache, refresh_rx) = PricingCache::new(
            db.clone(),
            Duration::from_secs(config.pricing.freshness_secs),
        );
        let egress = EgressTable {
            fallback_per_gb: config.cost.egress_fallback_per_gb,
        };
        let optimizer = Arc::new(Optimizer::new(
            cache,
            egress,
            config.cost.assumed_dataset_gb,
        ));

        let queue = Arc::new(JobQueue::new());
        let pool = Arc::new(ClusterPool::new(config.pool.min_size, config.pool.max_size));
        let sharing = Arc::new(GpuSharingManager::new());
        let tracker = Arc::new(CostTracker::new(db.clone(), config.cost.budget_warn_ratio));
        let monitor = Arc::new(Monitor::new(
            db.clone(),
            Arc::clone(&tracker),
            Arc::new(NoopHealthProbe),
            Duration::from_secs(config.monitor.provisioning_deadline_secs),
        ));

        let scheduler = Arc::new(Scheduler::new(
            db.clone(),
            Arc::clone(&queue),
            optimizer,
            Arc::clone(&pool),
            Arc::clone(&sharing),
            Arc::clone(&tracker),
            Arc::new(StubProvisioner),
            Arc::new(NoopExecutor),
            None,
            config.scheduler.batch,
        ));
        scheduler
            .recover()
            .map_err(|e| anyhow::anyhow!("state recovery failed: {e}"))?;

        let adapters: Vec<Arc<dyn ProviderAdapter>> = Vec::new();
        if adapters.is_empty() {
            tracing::warn!(
                "no pricing adapters registered; submit pricing rows or embed adapters \
                 for placements to become feasible"
            );
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = vec![
            tokio::spawn(pricing::run_refresher(
                db.clone(),
                adapters,
                Duration::from_secs(config.pricing.refresh_secs),
                refresh_rx,
                shutdown_rx.clone(),
            )),
            tokio::spawn(scheduler::run_scheduler(
                Arc::clone(&scheduler),
                Duration::from_secs(config.scheduler.tick_secs),
                shutdown_rx.clone(),
            )),
            tokio::spawn(autoscaler::run_autoscaler(
                Arc::new(Autoscaler::new(
                    Arc::clone(&pool),
                    Arc::clone(&queue),
                    config.autoscaler.scale_up_threshold,
                    Duration::from_secs(config.pool.idle_timeout_secs),
                )),
                Duration::from_secs(config.autoscaler.tick_secs),
                shutdown_rx.clone(),
            )),
            tokio::spawn(cost_tracker::run_tracker(
                Arc::clone(&tracker),
                Duration::from_secs(config.cost.tick_secs),
                shutdown_rx.clone(),
            )),
            tokio::spawn(monitor::run_monitor(
                Arc::clone(&monitor),
                Duration::from_secs(config.monitor.tick_secs),
                shutdown_rx,
            )),
        ];

        tracing::info!("runtime started with {} workers", workers.len());
        Ok(Self {
            config,
            db,
            scheduler,
            pool,
            sharing,
            monitor,
            shutdown_tx,
            workers,
        })
    }

    /// Signal every worker and wait for the current iterations to end.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers {
            let _ = worker.await;
        }
        tracing::info!("runtime stopped");
    }
}
